//! Memory region types for the loader's address-space model.
//!
//! A [`MemoryRegion`] is one contiguous mapping: a PE image laid out at its
//! load address with section-aware protection, a raw data region (redirection
//! stubs, scratch mappings), or the private heap arena. Regions are plain
//! byte buffers; copy-on-write paging would buy nothing here because the
//! loader owns every mapping it creates.

use bitflags::bitflags;

bitflags! {
    /// Memory protection flags for address-space regions.
    ///
    /// Modeled after the Windows `PAGE_*` protection constants; for PE image
    /// regions they are derived from section characteristics.
    ///
    /// # Common Combinations
    ///
    /// - [`READ_WRITE`](Self::READ_WRITE) - Data sections (`.data`, `.bss`)
    /// - [`READ_EXECUTE`](Self::READ_EXECUTE) - Code sections (`.text`)
    /// - [`READ`](Self::READ) - Read-only sections (`.rdata`, where IATs live)
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryProtection: u32 {
        /// Region is readable.
        const READ = 0x01;
        /// Region is writable.
        const WRITE = 0x02;
        /// Region is executable.
        const EXECUTE = 0x04;
        /// Read and write access (common for data sections).
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute access (common for code sections).
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

impl MemoryProtection {
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READONLY: u32 = 0x02;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_WRITECOPY: u32 = 0x08;
    const PAGE_EXECUTE: u32 = 0x10;
    const PAGE_EXECUTE_READ: u32 = 0x20;
    const PAGE_EXECUTE_READWRITE: u32 = 0x40;
    const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;

    /// Converts a Windows `PAGE_*` protection constant to `MemoryProtection` flags.
    #[must_use]
    pub fn from_windows(page_protect: u32) -> Self {
        match page_protect & 0xFF {
            Self::PAGE_NOACCESS => Self::empty(),
            Self::PAGE_READONLY => Self::READ,
            Self::PAGE_EXECUTE => Self::EXECUTE,
            Self::PAGE_EXECUTE_READ => Self::READ_EXECUTE,
            Self::PAGE_EXECUTE_READWRITE | Self::PAGE_EXECUTE_WRITECOPY => {
                Self::READ_WRITE_EXECUTE
            }
            Self::PAGE_READWRITE | Self::PAGE_WRITECOPY => Self::READ_WRITE,
            _ => Self::READ_WRITE,
        }
    }

    /// Converts these flags to the closest Windows `PAGE_*` constant.
    #[must_use]
    pub fn to_windows(self) -> u32 {
        let rwx = self & Self::READ_WRITE_EXECUTE;
        if rwx == Self::READ_WRITE_EXECUTE {
            Self::PAGE_EXECUTE_READWRITE
        } else if rwx == Self::READ_EXECUTE {
            Self::PAGE_EXECUTE_READ
        } else if rwx == Self::EXECUTE {
            Self::PAGE_EXECUTE
        } else if rwx.contains(Self::WRITE) {
            Self::PAGE_READWRITE
        } else if rwx == Self::READ {
            Self::PAGE_READONLY
        } else {
            Self::PAGE_NOACCESS
        }
    }

    /// Derives protection flags from PE section characteristics.
    #[must_use]
    pub fn from_section_characteristics(characteristics: u32) -> Self {
        let mut protection = Self::empty();
        if characteristics & 0x4000_0000 != 0 {
            // IMAGE_SCN_MEM_READ
            protection |= Self::READ;
        }
        if characteristics & 0x8000_0000 != 0 {
            // IMAGE_SCN_MEM_WRITE
            protection |= Self::WRITE;
        }
        if characteristics & 0x2000_0000 != 0 {
            // IMAGE_SCN_MEM_EXECUTE
            protection |= Self::EXECUTE;
        }
        protection
    }
}

/// Protection-relevant metadata for one section of a mapped PE image.
#[derive(Clone, Debug)]
pub struct SectionInfo {
    /// Section name (e.g. `.text`).
    pub name: String,
    /// RVA where the section starts.
    pub virtual_address: u32,
    /// In-memory span of the section.
    pub virtual_size: u32,
    /// Protection derived from the section characteristics.
    pub protection: MemoryProtection,
}

/// What a [`MemoryRegion`] is backing.
#[derive(Clone, Debug)]
pub enum RegionKind {
    /// A mapped PE image; protection varies per section.
    Image {
        /// Sections of the image, for protection lookup.
        sections: Vec<SectionInfo>,
    },
    /// Raw data with a single protection (redirection stubs, scratch maps).
    Data,
    /// The loader's private heap arena.
    HeapArena,
}

/// One contiguous mapping in the loader's address space.
#[derive(Clone, Debug)]
pub struct MemoryRegion {
    base: u64,
    data: Vec<u8>,
    label: String,
    protection: MemoryProtection,
    kind: RegionKind,
}

impl MemoryRegion {
    /// Creates a PE image region from an already laid-out image buffer.
    ///
    /// # Arguments
    ///
    /// * `base` - Load address of the image
    /// * `data` - Section-aligned image bytes (headers + sections)
    /// * `sections` - Section metadata for per-section protection
    /// * `label` - Short name of the image, for diagnostics
    #[must_use]
    pub fn image(
        base: u64,
        data: Vec<u8>,
        sections: Vec<SectionInfo>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            base,
            data,
            label: label.into(),
            // Header pages and section gaps are read-only
            protection: MemoryProtection::READ,
            kind: RegionKind::Image { sections },
        }
    }

    /// Creates a raw data region with a uniform protection.
    #[must_use]
    pub fn data(
        base: u64,
        data: Vec<u8>,
        label: impl Into<String>,
        protection: MemoryProtection,
    ) -> Self {
        Self {
            base,
            data,
            label: label.into(),
            protection,
            kind: RegionKind::Data,
        }
    }

    /// Creates a zero-filled heap arena region (read-write).
    #[must_use]
    pub fn heap_arena(base: u64, size: usize, label: impl Into<String>) -> Self {
        Self {
            base,
            data: vec![0u8; size],
            label: label.into(),
            protection: MemoryProtection::READ_WRITE,
            kind: RegionKind::HeapArena,
        }
    }

    /// Base address of the region.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// One past the last address of the region.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    /// Label the region was created with.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the region kind.
    #[must_use]
    pub fn kind(&self) -> &RegionKind {
        &self.kind
    }

    /// Returns `true` if the region is a mapped PE image.
    #[must_use]
    pub fn is_image(&self) -> bool {
        matches!(self.kind, RegionKind::Image { .. })
    }

    /// Returns `true` if `addr` lies inside the region.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Returns `true` if the whole range `[addr, addr + len)` lies inside the region.
    #[must_use]
    pub fn contains_range(&self, addr: u64, len: usize) -> bool {
        addr >= self.base && addr.checked_add(len as u64).is_some_and(|e| e <= self.end())
    }

    /// Reads `len` bytes at `addr`, or `None` if the range leaves the region.
    #[must_use]
    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        if !self.contains_range(addr, len) {
            return None;
        }
        let offset = (addr - self.base) as usize;
        Some(self.data[offset..offset + len].to_vec())
    }

    /// Writes `bytes` at `addr`. Returns `false` if the range leaves the region.
    ///
    /// Protection is not checked here; the [`AddressSpace`](super::AddressSpace)
    /// enforces it, since only the space knows about protection overrides.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> bool {
        if !self.contains_range(addr, bytes.len()) {
            return false;
        }
        let offset = (addr - self.base) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        true
    }

    /// Default protection at `addr`.
    ///
    /// For PE images this consults the section table; addresses outside any
    /// section (headers, alignment gaps) are read-only. Other regions have a
    /// uniform protection.
    #[must_use]
    pub fn protection_at(&self, addr: u64) -> MemoryProtection {
        match &self.kind {
            RegionKind::Image { sections } => {
                let rva = (addr - self.base) as u32;
                sections
                    .iter()
                    .find(|s| {
                        rva >= s.virtual_address
                            && rva < s.virtual_address.saturating_add(s.virtual_size)
                    })
                    .map_or(MemoryProtection::READ, |s| s.protection)
            }
            RegionKind::Data | RegionKind::HeapArena => self.protection,
        }
    }
}
