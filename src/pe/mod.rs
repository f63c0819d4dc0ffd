//! PE directory reading over mapped images.
//!
//! Once an image is live in the address space, everything the loader needs
//! (entry point, import descriptors, exports, forwarder strings, the
//! module's own short name) is read back out of the mapped bytes with
//! bounds-checked
//! little-endian walks. Nothing here trusts the image: every offset is probed
//! through [`AddressSpace`](crate::memory::AddressSpace) reads, so a partial
//! map or a hostile directory surfaces as [`Error`](crate::Error) instead of
//! a fault.
//!
//! The on-disk file layout is a different animal and is handled by `goblin`
//! at map time; this module only ever sees RVA-layout images.

mod headers;

pub mod exports;
pub mod imports;

pub use headers::{DataDirectory, ImageHeaders};

/// Index of the export directory entry.
pub const DIRECTORY_EXPORT: usize = 0;
/// Index of the import directory entry.
pub const DIRECTORY_IMPORT: usize = 1;
/// Index of the base-relocation directory entry.
pub const DIRECTORY_BASERELOC: usize = 5;
/// Index of the TLS directory entry.
pub const DIRECTORY_TLS: usize = 9;
/// Index of the delay-load import directory entry.
pub const DIRECTORY_DELAY_IMPORT: usize = 13;

/// Number of data directory slots tracked.
pub const DIRECTORY_COUNT: usize = 16;

/// `IMAGE_FILE_DLL` characteristic flag.
pub const FILE_DLL: u16 = 0x2000;
/// `IMAGE_FILE_RELOCS_STRIPPED` characteristic flag.
pub const FILE_RELOCS_STRIPPED: u16 = 0x0001;
