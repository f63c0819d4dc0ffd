//! Image mapping: file bytes to a live, relocated mapping.
//!
//! The mapper parses the on-disk PE with `goblin`, lays the image out at
//! section alignment (headers, then each section, BSS zero-filled), picks a
//! base, applies base relocations when the preferred base is taken, and maps
//! the result as a single image region. Because relocation happens on the
//! buffer before mapping, any failure simply drops the buffer, and a partial
//! image is never live in the address space.

use std::path::Path;

use crate::{
    loader::{paths, reloc, Arch},
    memory::{AddressSpace, MemoryProtection, MemoryRegion, SectionInfo},
    pe::{FILE_DLL, FILE_RELOCS_STRIPPED},
    Error, Result,
};

/// Largest `SizeOfImage` the mapper will honor; anything beyond this is a
/// corrupt header, not a real DLL.
const MAX_IMAGE_SIZE: usize = 0x1000_0000;

/// Result of a successful mapping.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MappedImage {
    /// Address the image went live at.
    pub base: u64,
    /// Span of the mapping (`SizeOfImage`).
    pub size: u64,
}

/// Maps the PE file at `path` into the address space, relocating if the
/// preferred base is occupied.
///
/// `register_with_host` selects the post-bootstrap backend: the mapping is
/// reported to the host's tracked-area list. Bootstrap-window maps skip the
/// report so client libraries can execute without being treated as runtime
/// code.
///
/// # Errors
///
/// - [`Error::Io`] when the file cannot be read
/// - [`Error::Goblin`] when it does not parse as a PE
/// - [`Error::Unsupported`] for non-DLL images or an architecture mismatch
/// - [`Error::NotRelocatable`] for a displaced image without relocations
/// - [`Error::RelocationFailed`] when the fixup walk fails
pub(crate) fn map_and_relocate(
    space: &AddressSpace,
    host: &mut dyn crate::host::LoaderHost,
    path: &Path,
    arch: Arch,
    register_with_host: bool,
) -> Result<MappedImage> {
    let bytes = host.read_file(path).map_err(|e| {
        log::debug!("failed to open {}: {e}", path.display());
        Error::Io(e)
    })?;

    let pe = goblin::pe::PE::parse(&bytes)?;

    if pe.is_64 != arch.is_64() {
        return Err(Error::Unsupported("image architecture mismatch"));
    }
    let characteristics = pe.header.coff_header.characteristics;
    if characteristics & FILE_DLL == 0 {
        return Err(Error::Unsupported("image is not a DLL"));
    }

    let optional = pe
        .header
        .optional_header
        .ok_or_else(|| malformed_error!("{} has no optional header", path.display()))?;
    let size_of_image = optional.windows_fields.size_of_image as usize;
    let size_of_headers = optional.windows_fields.size_of_headers as usize;
    if size_of_image == 0 || size_of_image > MAX_IMAGE_SIZE {
        return Err(malformed_error!(
            "{} claims an image size of {:#x}",
            path.display(),
            size_of_image
        ));
    }

    // Lay the image out at section alignment
    let mut image = vec![0u8; size_of_image];
    if size_of_headers <= bytes.len() && size_of_headers <= image.len() {
        image[..size_of_headers].copy_from_slice(&bytes[..size_of_headers]);
    }

    let mut sections = Vec::with_capacity(pe.sections.len());
    for section in &pe.sections {
        let name = String::from_utf8_lossy(&section.name)
            .trim_end_matches('\0')
            .to_string();
        let raw_offset = section.pointer_to_raw_data as usize;
        let copy_size = section.size_of_raw_data.min(section.virtual_size) as usize;
        let dest = section.virtual_address as usize;
        if raw_offset + copy_size <= bytes.len() && dest + copy_size <= image.len() {
            image[dest..dest + copy_size]
                .copy_from_slice(&bytes[raw_offset..raw_offset + copy_size]);
        }
        sections.push(SectionInfo {
            name,
            virtual_address: section.virtual_address,
            virtual_size: section.virtual_size.max(section.size_of_raw_data),
            protection: MemoryProtection::from_section_characteristics(section.characteristics),
        });
    }

    let preferred = pe.image_base as u64;
    let base = space.find_free_base(size_of_image, preferred);
    let delta = base as i64 - preferred as i64;
    if delta != 0 {
        log::debug!(
            "relocating {} from {preferred:#x} to {base:#x}",
            path.display()
        );
        let reloc_dir = optional.data_directories.get_base_relocation_table();
        let relocatable = characteristics & FILE_RELOCS_STRIPPED == 0
            && reloc_dir.is_some_and(|d| d.size > 0);
        let Some(dir) = reloc_dir.filter(|_| relocatable) else {
            log::debug!("{} is not relocatable", path.display());
            return Err(Error::NotRelocatable);
        };
        reloc::apply(&mut image, dir.virtual_address, dir.size, delta, pe.is_64)?;
    }

    let label = paths::short_name(path);
    let region = MemoryRegion::image(base, image, sections, label);
    space.map_at(base, region)?;
    if register_with_host {
        host.area_added(base, size_of_image as u64);
    }

    Ok(MappedImage {
        base,
        size: size_of_image as u64,
    })
}
