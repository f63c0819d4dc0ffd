//! DOS/NT header walk of a mapped PE image.

use crate::{
    memory::AddressSpace,
    pe::{DIRECTORY_COUNT, FILE_DLL},
    Result,
};

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const OPTIONAL_MAGIC_PE32: u16 = 0x010B;
const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x020B;

/// One data directory entry of the optional header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDirectory {
    /// RVA of the directory, zero when absent.
    pub virtual_address: u32,
    /// Size of the directory in bytes.
    pub size: u32,
}

impl DataDirectory {
    /// Returns `true` if the directory is present (nonzero RVA and size).
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// The header fields of a mapped image that the loader cares about.
///
/// Read fresh from the mapped bytes on each use; the loader keeps no
/// per-module header cache, matching its walk-the-structures-every-time
/// approach to exports.
#[derive(Clone, Debug)]
pub struct ImageHeaders {
    /// `true` for PE32+ (64-bit) images.
    pub is_64: bool,
    /// COFF machine value (`0x14C` i386, `0x8664` amd64).
    pub machine: u16,
    /// COFF file characteristics.
    pub characteristics: u16,
    /// Preferred load address from the optional header.
    pub preferred_base: u64,
    /// `SizeOfImage` from the optional header.
    pub size_of_image: u32,
    /// Entry-point RVA, zero when the image has none.
    pub entry_rva: u32,
    /// The data directories (missing trailing entries read as zero).
    pub directories: [DataDirectory; DIRECTORY_COUNT],
}

impl ImageHeaders {
    /// Walks the DOS and NT headers of the image mapped at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`](crate::Error::Malformed) when a magic
    /// value is wrong, or a read failure when the headers run off the
    /// mapping (partial map).
    pub fn read(space: &AddressSpace, base: u64) -> Result<Self> {
        if space.read_u16(base)? != DOS_MAGIC {
            return Err(malformed_error!("bad DOS magic at {:#x}", base));
        }
        let e_lfanew = u64::from(space.read_u32(base + 0x3C)?);
        let nt = base + e_lfanew;
        if space.read_u32(nt)? != NT_SIGNATURE {
            return Err(malformed_error!("bad NT signature at {:#x}", nt));
        }

        let machine = space.read_u16(nt + 4)?;
        let characteristics = space.read_u16(nt + 22)?;

        let optional = nt + 24;
        let magic = space.read_u16(optional)?;
        let is_64 = match magic {
            OPTIONAL_MAGIC_PE32 => false,
            OPTIONAL_MAGIC_PE32_PLUS => true,
            other => {
                return Err(malformed_error!("bad optional header magic {:#x}", other));
            }
        };

        let entry_rva = space.read_u32(optional + 16)?;
        let preferred_base = if is_64 {
            space.read_u64(optional + 24)?
        } else {
            u64::from(space.read_u32(optional + 28)?)
        };
        let size_of_image = space.read_u32(optional + 56)?;

        let (count_offset, dirs_offset) = if is_64 { (108, 112) } else { (92, 96) };
        let dir_count = space.read_u32(optional + count_offset)? as usize;

        let mut directories = [DataDirectory::default(); DIRECTORY_COUNT];
        for (i, dir) in directories
            .iter_mut()
            .enumerate()
            .take(dir_count.min(DIRECTORY_COUNT))
        {
            let entry = optional + dirs_offset + 8 * i as u64;
            dir.virtual_address = space.read_u32(entry)?;
            dir.size = space.read_u32(entry + 4)?;
        }

        Ok(Self {
            is_64,
            machine,
            characteristics,
            preferred_base,
            size_of_image,
            entry_rva,
            directories,
        })
    }

    /// Returns the data directory at `index`.
    #[must_use]
    pub fn directory(&self, index: usize) -> DataDirectory {
        self.directories.get(index).copied().unwrap_or_default()
    }

    /// Entry point as an absolute address, or `None` when the image has no
    /// entry (a zero RVA would otherwise alias the base itself).
    #[must_use]
    pub fn entry_point(&self, base: u64) -> Option<u64> {
        if self.entry_rva == 0 {
            None
        } else {
            Some(base + u64::from(self.entry_rva))
        }
    }

    /// Returns `true` if the image is a DLL.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.characteristics & FILE_DLL != 0
    }
}
