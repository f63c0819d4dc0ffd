//! Export resolution with forwarder detection.
//!
//! Exports are resolved by name with a linear walk of the export name table;
//! the module list is expected to stay small, so there is no hashing or
//! binary search, and the structures are re-walked on every lookup.
//!
//! A resolved export RVA that lands *inside* the export directory's own span
//! is not code: it is a forwarder string of the form
//! `TARGETDLL.TargetSymbol`, telling the resolver to chase the symbol in
//! another module.

use crate::{
    memory::AddressSpace,
    pe::{ImageHeaders, DIRECTORY_EXPORT},
    Result,
};

/// Upper bound on export name counts we are willing to walk; anything
/// larger is a corrupt directory, not a real DLL.
const MAX_EXPORT_NAMES: u32 = 0x10000;

/// Result of an export lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Export {
    /// A real function at this absolute address.
    Code(u64),
    /// A forwarder string `TargetDll.TargetSymbol`; resolve against the
    /// target module instead.
    Forwarder(String),
}

/// Looks up `symbol` in the export directory of the image mapped at `base`.
///
/// Returns `Ok(None)` when the image has no export directory or does not
/// export the name.
///
/// # Errors
///
/// Returns [`Error::Malformed`](crate::Error::Malformed) for corrupt
/// directories (ordinal out of range, absurd name counts) and propagates
/// read failures from partially mapped directories.
pub fn lookup(space: &AddressSpace, base: u64, symbol: &str) -> Result<Option<Export>> {
    let headers = ImageHeaders::read(space, base)?;
    let dir = headers.directory(DIRECTORY_EXPORT);
    if !dir.is_present() {
        return Ok(None);
    }

    let dir_start = base + u64::from(dir.virtual_address);
    let number_of_functions = space.read_u32(dir_start + 20)?;
    let number_of_names = space.read_u32(dir_start + 24)?;
    let functions = base + u64::from(space.read_u32(dir_start + 28)?);
    let names = base + u64::from(space.read_u32(dir_start + 32)?);
    let ordinals = base + u64::from(space.read_u32(dir_start + 36)?);

    if number_of_names > MAX_EXPORT_NAMES {
        return Err(malformed_error!(
            "export directory claims {} names",
            number_of_names
        ));
    }

    for i in 0..u64::from(number_of_names) {
        let name_rva = space.read_u32(names + 4 * i)?;
        let name = space.read_c_string(base + u64::from(name_rva))?;
        if !name.eq_ignore_ascii_case(symbol) {
            continue;
        }
        let ordinal = u32::from(space.read_u16(ordinals + 2 * i)?);
        if ordinal >= number_of_functions {
            return Err(malformed_error!(
                "export ordinal {} out of range ({} functions)",
                ordinal,
                number_of_functions
            ));
        }
        let func_rva = space.read_u32(functions + 4 * u64::from(ordinal))?;
        if func_rva == 0 {
            return Ok(None);
        }
        // An address inside the export directory itself is a forwarder string
        if func_rva >= dir.virtual_address && func_rva < dir.virtual_address + dir.size {
            let forwarder = space.read_c_string(base + u64::from(func_rva))?;
            return Ok(Some(Export::Forwarder(forwarder)));
        }
        return Ok(Some(Export::Code(base + u64::from(func_rva))));
    }
    Ok(None)
}

/// Reads the module's short name from its export directory (e.g.
/// `"kernel32.dll"`), or `None` when the image exports nothing.
///
/// # Errors
///
/// Propagates read failures from a partially mapped directory.
pub fn module_short_name(space: &AddressSpace, base: u64) -> Result<Option<String>> {
    let headers = ImageHeaders::read(space, base)?;
    let dir = headers.directory(DIRECTORY_EXPORT);
    if !dir.is_present() {
        return Ok(None);
    }
    let name_rva = space.read_u32(base + u64::from(dir.virtual_address) + 12)?;
    if name_rva == 0 {
        return Ok(None);
    }
    Ok(Some(space.read_c_string(base + u64::from(name_rva))?))
}
