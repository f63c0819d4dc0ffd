//! Unified address space the loader maps images into.
//!
//! [`AddressSpace`] holds every region the loader knows about and mediates
//! all guest-memory access: probed reads for the PE directory walkers,
//! protection-checked writes for the import resolver, and the page-granular
//! protection overrides behind the IAT protection dance.
//!
//! # Example
//!
//! ```rust
//! use privload::memory::{AddressSpace, MemoryProtection, MemoryRegion};
//!
//! let space = AddressSpace::new();
//! let region = MemoryRegion::data(
//!     0x1000,
//!     vec![0xDE, 0xAD, 0xBE, 0xEF],
//!     "test_data",
//!     MemoryProtection::READ_WRITE,
//! );
//! space.map_at(0x1000, region).unwrap();
//! assert_eq!(space.read(0x1000, 4).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};

use crate::{
    memory::{page_start, MemoryProtection, MemoryRegion, PAGE_SIZE},
    Error, Result,
};

/// Longest C string the probed string reader will follow before declaring
/// the directory malformed.
const MAX_CSTRING: usize = 4096;

/// Address where automatic base selection starts when a preferred base is
/// taken or absent.
const AUTO_BASE_START: u64 = 0x1000_0000;

/// The process address space as the loader sees it.
///
/// Regions are kept behind interior mutability so that lookups
/// (`is_mapped`, `get_protection`, membership queries) work through shared
/// references while the loader mutates the space during load and unload.
///
/// # Thread Safety
///
/// Individual operations are internally synchronized; compound sequences
/// (map, then resolve, then protect) are serialized by the loader itself,
/// which owns the space exclusively.
#[derive(Debug)]
pub struct AddressSpace {
    /// Mapped regions, disjoint by construction.
    regions: RwLock<Vec<MemoryRegion>>,

    /// Next candidate address for automatic base selection.
    next_address: AtomicU64,

    /// Page-aligned protection overrides laid over region defaults.
    ///
    /// This is what `VirtualProtect`-style protection changes write to; the
    /// import resolver uses it to open IAT pages and restore them.
    protection_overrides: RwLock<HashMap<u64, MemoryProtection>>,
}

impl AddressSpace {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(Vec::new()),
            next_address: AtomicU64::new(AUTO_BASE_START),
            protection_overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Maps a region at a specific address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the region overlaps any existing
    /// mapping (ranges must be identical or disjoint, never partial).
    pub fn map_at(&self, address: u64, region: MemoryRegion) -> Result<()> {
        debug_assert_eq!(address, region.base());
        let mut regions = self.regions.write().map_err(|_| Error::LockError)?;
        for existing in regions.iter() {
            if existing.base() < region.end() && region.base() < existing.end() {
                return Err(Error::InvalidAddress {
                    address,
                    reason: format!("overlaps existing mapping {}", existing.label()),
                });
            }
        }
        regions.push(region);
        Ok(())
    }

    /// Picks a base address for a mapping of `size` bytes.
    ///
    /// The preferred base wins when it is free (and nonzero); otherwise the
    /// space bump-allocates a page-aligned base above the highwater mark,
    /// skipping occupied ranges.
    #[must_use]
    pub fn find_free_base(&self, size: usize, preferred: u64) -> u64 {
        if preferred != 0 && self.range_free(preferred, size) {
            return preferred;
        }
        let aligned = (size as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        loop {
            let candidate = self.next_address.fetch_add(aligned, Ordering::SeqCst);
            if self.range_free(candidate, size) {
                return candidate;
            }
        }
    }

    fn range_free(&self, base: u64, size: usize) -> bool {
        let Ok(regions) = self.regions.read() else {
            return false;
        };
        let end = match base.checked_add(size as u64) {
            Some(end) => end,
            None => return false,
        };
        !regions.iter().any(|r| r.base() < end && base < r.end())
    }

    /// Unmaps the region based at `base`, dropping its protection overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no region starts at `base`.
    pub fn unmap(&self, base: u64) -> Result<()> {
        let mut regions = self.regions.write().map_err(|_| Error::LockError)?;
        let Some(pos) = regions.iter().position(|r| r.base() == base) else {
            return Err(Error::InvalidAddress {
                address: base,
                reason: "no region at this address".to_string(),
            });
        };
        let end = regions[pos].end();
        regions.remove(pos);
        drop(regions);
        if let Ok(mut overrides) = self.protection_overrides.write() {
            overrides.retain(|&page, _| page < base || page >= end);
        }
        Ok(())
    }

    /// Reads `len` bytes from a mapped range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not fully mapped by
    /// a single region. Partial maps surface here instead of faulting.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let regions = self.regions.read().map_err(|_| Error::LockError)?;
        for region in regions.iter() {
            if region.contains(address) {
                return region.read(address, len).ok_or(Error::OutOfBounds);
            }
        }
        Err(Error::InvalidAddress {
            address,
            reason: "address not mapped".to_string(),
        })
    }

    /// Writes bytes to a mapped range, honoring the effective protection of
    /// every page the write touches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is unmapped or any
    /// touched page lacks [`MemoryProtection::WRITE`].
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut page = page_start(address);
        let last = page_start(address + bytes.len() as u64 - 1);
        while page <= last {
            let protection = self.get_protection(page).ok_or(Error::InvalidAddress {
                address: page,
                reason: "address not mapped".to_string(),
            })?;
            if !protection.contains(MemoryProtection::WRITE) {
                return Err(Error::InvalidAddress {
                    address,
                    reason: "write to non-writable page".to_string(),
                });
            }
            page += PAGE_SIZE;
        }

        let mut regions = self.regions.write().map_err(|_| Error::LockError)?;
        for region in regions.iter_mut() {
            if region.contains(address) {
                if region.write(address, bytes) {
                    return Ok(());
                }
                return Err(Error::OutOfBounds);
            }
        }
        Err(Error::InvalidAddress {
            address,
            reason: "address not mapped".to_string(),
        })
    }

    /// Reads a little-endian `u16`.
    ///
    /// # Errors
    /// Propagates [`read`](Self::read) failures.
    pub fn read_u16(&self, address: u64) -> Result<u16> {
        let bytes = self.read(address, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    /// Propagates [`read`](Self::read) failures.
    pub fn read_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.read(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    /// Propagates [`read`](Self::read) failures.
    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let bytes = self.read(address, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a pointer-sized value: 8 bytes on x64 images, 4 on x86.
    ///
    /// # Errors
    /// Propagates [`read`](Self::read) failures.
    pub fn read_ptr(&self, address: u64, is_64: bool) -> Result<u64> {
        if is_64 {
            self.read_u64(address)
        } else {
            Ok(u64::from(self.read_u32(address)?))
        }
    }

    /// Writes a pointer-sized value: 8 bytes on x64 images, 4 on x86.
    ///
    /// # Errors
    /// Propagates [`write`](Self::write) failures.
    pub fn write_ptr(&self, address: u64, value: u64, is_64: bool) -> Result<()> {
        if is_64 {
            self.write(address, &value.to_le_bytes())
        } else {
            self.write(address, &(value as u32).to_le_bytes())
        }
    }

    /// Reads a NUL-terminated ASCII string, probing one byte at a time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if no terminator appears within a sane
    /// bound, or a read failure if the string runs off the mapping.
    pub fn read_c_string(&self, address: u64) -> Result<String> {
        let mut out = Vec::new();
        for i in 0..MAX_CSTRING as u64 {
            let byte = self.read(address + i, 1)?[0];
            if byte == 0 {
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.push(byte);
        }
        Err(malformed_error!(
            "unterminated string at {:#x}",
            address
        ))
    }

    /// Returns `true` if `address` lies in any mapped region.
    #[must_use]
    pub fn is_mapped(&self, address: u64) -> bool {
        let Ok(regions) = self.regions.read() else {
            return false;
        };
        regions.iter().any(|r| r.contains(address))
    }

    /// Returns the `(base, size)` of the region containing `address`.
    #[must_use]
    pub fn region_span(&self, address: u64) -> Option<(u64, usize)> {
        let regions = self.regions.read().ok()?;
        regions
            .iter()
            .find(|r| r.contains(address))
            .map(|r| (r.base(), r.size()))
    }

    /// Effective protection at `address`: the page override if present,
    /// otherwise the region default.
    #[must_use]
    pub fn get_protection(&self, address: u64) -> Option<MemoryProtection> {
        let page = page_start(address);
        if let Ok(overrides) = self.protection_overrides.read() {
            if let Some(&protection) = overrides.get(&page) {
                return Some(protection);
            }
        }
        let regions = self.regions.read().ok()?;
        regions
            .iter()
            .find(|r| r.contains(address))
            .map(|r| r.protection_at(address))
    }

    /// Changes protection over `[address, address + size)` at page
    /// granularity and returns the previous protection of the first page.
    ///
    /// Returns `None` when the address is not mapped. This is the primitive
    /// behind the resolver's protect-write-restore dance on IAT pages.
    pub fn set_protection(
        &self,
        address: u64,
        size: usize,
        new_protection: MemoryProtection,
    ) -> Option<MemoryProtection> {
        let old = self.get_protection(address)?;
        let start = page_start(address);
        let end = page_start(address.saturating_add(size.max(1) as u64 - 1)) + PAGE_SIZE;
        if let Ok(mut overrides) = self.protection_overrides.write() {
            let mut page = start;
            while page < end {
                overrides.insert(page, new_protection);
                page += PAGE_SIZE;
            }
        }
        Some(old)
    }

    /// `(base, size, label)` of every mapped region, for diagnostics.
    #[must_use]
    pub fn mapped_regions(&self) -> Vec<(u64, usize, String)> {
        match self.regions.read() {
            Ok(regions) => regions
                .iter()
                .map(|r| (r.base(), r.size(), r.label().to_string()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
