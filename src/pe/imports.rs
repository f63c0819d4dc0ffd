//! Import descriptor table access for mapped images.
//!
//! The import directory is an array of 20-byte descriptors, one per imported
//! DLL, terminated by an all-zero entry. Each descriptor points at two
//! parallel thunk arrays: the lookup table (`OriginalFirstThunk`), which
//! names the imports, and the IAT (`FirstThunk`), which the resolver patches
//! with resolved addresses.

use crate::{
    memory::AddressSpace,
    pe::{ImageHeaders, DIRECTORY_IMPORT},
    Result,
};

/// Size of one `IMAGE_IMPORT_DESCRIPTOR`.
const DESCRIPTOR_SIZE: u32 = 20;

/// `TimeDateStamp` value marking new-style bound imports.
const BOUND_NEW_STYLE: u32 = u32::MAX;

/// One import descriptor of a mapped image.
#[derive(Clone, Copy, Debug)]
pub struct ImportDescriptor {
    /// RVA of the import lookup table (names/ordinals).
    pub original_first_thunk: u32,
    /// Bind timestamp: 0 unbound, -1 new-style bind, else old-style bind.
    pub time_date_stamp: u32,
    /// RVA of the imported DLL's name string.
    pub name: u32,
    /// RVA of the import address table the loader patches.
    pub first_thunk: u32,
}

impl ImportDescriptor {
    /// Returns `true` if the descriptor carries a bind timestamp.
    ///
    /// Bound imports are detected but not honored; the resolver overwrites
    /// the IAT regardless, so a stale bind is harmless.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.time_date_stamp != 0
    }

    /// Returns `true` for the new-style (`IMAGE_BOUND_IMPORT_DESCRIPTOR`) bind marker.
    #[must_use]
    pub fn is_bound_new_style(&self) -> bool {
        self.time_date_stamp == BOUND_NEW_STYLE
    }
}

/// Reads the import descriptor table of the image mapped at `base`.
///
/// Returns an empty vector when the image has no import directory. The
/// walk stops at the first descriptor with a zero lookup-table RVA and is
/// bounds-checked against the directory size, so an oversized or unreadable
/// directory fails before any import is processed.
///
/// # Errors
///
/// Returns [`Error::Malformed`](crate::Error::Malformed) when the
/// descriptor table overruns its directory, or a read error when the
/// directory is only partially mapped.
pub fn import_descriptors(space: &AddressSpace, base: u64) -> Result<Vec<ImportDescriptor>> {
    let headers = ImageHeaders::read(space, base)?;
    let dir = headers.directory(DIRECTORY_IMPORT);
    if !dir.is_present() {
        return Ok(Vec::new());
    }
    if dir.size < DESCRIPTOR_SIZE {
        return Err(malformed_error!(
            "import directory smaller than one descriptor ({} bytes)",
            dir.size
        ));
    }

    let table = base + u64::from(dir.virtual_address);
    let mut descriptors = Vec::new();
    let mut offset = 0u32;
    loop {
        // The terminator must still fit inside the directory
        if offset + DESCRIPTOR_SIZE > dir.size {
            return Err(malformed_error!(
                "import descriptor table overruns directory at offset {}",
                offset
            ));
        }
        let entry = table + u64::from(offset);
        let original_first_thunk = space.read_u32(entry)?;
        if original_first_thunk == 0 {
            break;
        }
        descriptors.push(ImportDescriptor {
            original_first_thunk,
            time_date_stamp: space.read_u32(entry + 4)?,
            name: space.read_u32(entry + 12)?,
            first_thunk: space.read_u32(entry + 16)?,
        });
        offset += DESCRIPTOR_SIZE;
    }
    Ok(descriptors)
}

/// The ordinal-flag bit for a thunk of the given width.
#[must_use]
pub const fn ordinal_flag(is_64: bool) -> u64 {
    if is_64 {
        1 << 63
    } else {
        1 << 31
    }
}

/// Size in bytes of one thunk entry for the given width.
#[must_use]
pub const fn thunk_size(is_64: bool) -> u64 {
    if is_64 {
        8
    } else {
        4
    }
}
