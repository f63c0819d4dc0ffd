//! Private heap and the Rtl heap/string substitutes.
//!
//! Blocks for privately-loaded libraries come from a dedicated arena region
//! instead of the shared process heap. Every block carries an 8-byte size
//! prefix just below the returned pointer, and the ours-vs-theirs decision
//! in free/size/realloc is purely an address-range test against the arena:
//! no metadata lookup ever touches a pointer the loader does not own.

use std::collections::BTreeMap;

use crate::{
    host::LoaderHost,
    loader::Loader,
    memory::AddressSpace,
    Result,
};

/// `HEAP_ZERO_MEMORY` allocation flag.
const HEAP_ZERO_MEMORY: u32 = 0x8;

/// Size of the block header holding the requested size.
const HEADER_SIZE: u64 = 8;

/// Which counted-string descriptor a free call is operating on.
///
/// `Ansi` and `Oem` descriptors share the narrow layout; `Unicode` buffers
/// hold UTF-16. The substitute only cares about the buffer pointer and the
/// descriptor span, which are identical across the three.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringKind {
    /// `UNICODE_STRING`
    Unicode,
    /// `ANSI_STRING`
    Ansi,
    /// `OEM_STRING`
    Oem,
}

/// First-fit arena allocator backing the substitute heap routines.
///
/// Allocation metadata (free list, live set) lives on the loader side; the
/// size headers live in guest memory where the substitute `RtlSizeHeap`
/// reads them back.
#[derive(Debug)]
pub(crate) struct PrivateHeap {
    base: u64,
    size: u64,
    /// Free ranges (address -> length), coalesced on free.
    free: BTreeMap<u64, u64>,
    /// Live blocks (user pointer -> gross length including header).
    live: BTreeMap<u64, u64>,
}

impl PrivateHeap {
    pub(crate) fn new(base: u64, size: u64) -> Self {
        let mut free = BTreeMap::new();
        free.insert(base, size);
        Self {
            base,
            size,
            free,
            live: BTreeMap::new(),
        }
    }

    /// The ownership predicate: is `p` inside the arena?
    pub(crate) fn owns(&self, p: u64) -> bool {
        p >= self.base && p < self.base + self.size
    }

    /// Allocates `size` bytes, writing the size header into guest memory.
    /// Returns the user pointer (just past the header) or 0 on exhaustion.
    pub(crate) fn alloc(&mut self, space: &AddressSpace, size: u64, zero: bool) -> u64 {
        if size >= self.size {
            log::warn!("private heap request of {size} bytes exceeds the arena");
            return 0;
        }
        let gross = (size + 7) / 8 * 8 + HEADER_SIZE;
        let slot = self
            .free
            .iter()
            .find(|(_, &len)| len >= gross)
            .map(|(&addr, &len)| (addr, len));
        let Some((addr, len)) = slot else {
            log::warn!("private heap exhausted allocating {size} bytes");
            return 0;
        };
        self.free.remove(&addr);
        if len > gross {
            self.free.insert(addr + gross, len - gross);
        }

        let user = addr + HEADER_SIZE;
        if write_block(space, addr, size, user, zero).is_err() {
            // Arena region vanished under us; treat as exhaustion
            self.free.insert(addr, len);
            return 0;
        }
        self.live.insert(user, gross);
        user
    }

    /// Frees the block at `user`. Unknown pointers are rejected without
    /// touching any heap state.
    pub(crate) fn free(&mut self, user: u64) -> bool {
        let Some(gross) = self.live.remove(&user) else {
            log::warn!("free of unknown private-heap pointer {user:#x}");
            return false;
        };
        let mut addr = user - HEADER_SIZE;
        let mut len = gross;
        // Coalesce with the right neighbor, then the left
        if let Some(&next_len) = self.free.get(&(addr + len)) {
            self.free.remove(&(addr + len));
            len += next_len;
        }
        if let Some((&prev_addr, &prev_len)) = self.free.range(..addr).next_back() {
            if prev_addr + prev_len == addr {
                self.free.remove(&prev_addr);
                addr = prev_addr;
                len += prev_len;
            }
        }
        self.free.insert(addr, len);
        true
    }

    /// Requested size of a live block, from its guest-memory header.
    pub(crate) fn block_size(&self, space: &AddressSpace, user: u64) -> u64 {
        if !self.live.contains_key(&user) {
            return 0;
        }
        space.read_u64(user - HEADER_SIZE).unwrap_or(0)
    }
}

fn write_block(space: &AddressSpace, addr: u64, size: u64, user: u64, zero: bool) -> Result<()> {
    space.write(addr, &size.to_le_bytes())?;
    if zero && size > 0 {
        space.write(user, &vec![0u8; size as usize])?;
    }
    Ok(())
}

impl Loader {
    /// Substitute `RtlAllocateHeap`.
    ///
    /// Allocations against the default process heap come from the private
    /// arena with `HEAP_ZERO_MEMORY` honored; any other heap forwards to the
    /// native routine untouched.
    pub fn redirect_heap_alloc(
        &mut self,
        host: &mut dyn LoaderHost,
        heap: u64,
        flags: u32,
        size: u64,
    ) -> u64 {
        if self.is_process_heap(heap) && self.heap_ready() {
            let zero = flags & HEAP_ZERO_MEMORY != 0;
            let p = self.with_heap(|arena, space| arena.alloc(space, size, zero));
            log::debug!("private heap alloc {p:#x} ({size})");
            p
        } else {
            host.native_heap_alloc(heap, flags, size)
        }
    }

    /// Substitute `RtlReAllocateHeap`.
    ///
    /// Taken over only when the block is ours (or null); mixed call chains
    /// where the app allocated and a private library reallocates go native.
    /// Copies `min(old, new)` bytes into the replacement block.
    pub fn redirect_heap_realloc(
        &mut self,
        host: &mut dyn LoaderHost,
        heap: u64,
        flags: u32,
        block: u64,
        size: u64,
    ) -> u64 {
        if self.is_process_heap(heap) && (block == 0 || self.is_loader_address(block)) {
            let new_block = self.redirect_heap_alloc(host, heap, flags, size);
            if block != 0 {
                if new_block != 0 {
                    let old = self.with_heap(|arena, space| arena.block_size(space, block));
                    let copy = old.min(size);
                    if copy > 0 {
                        if let Ok(bytes) = self.space().read(block, copy as usize) {
                            let _ = self.space().write(new_block, &bytes);
                        }
                    }
                }
                self.redirect_heap_free(host, heap, flags, block);
            }
            new_block
        } else {
            host.native_heap_realloc(heap, flags, block, size)
        }
    }

    /// Substitute `RtlFreeHeap`.
    ///
    /// Ours-vs-theirs is decided purely by the arena address-range
    /// predicate; pointers we never handed out forward to the native free.
    pub fn redirect_heap_free(
        &mut self,
        host: &mut dyn LoaderHost,
        heap: u64,
        flags: u32,
        block: u64,
    ) -> bool {
        if self.is_process_heap(heap) && self.is_loader_address(block) {
            log::debug!("private heap free {block:#x}");
            self.with_heap(|arena, _| arena.free(block))
        } else {
            host.native_heap_free(heap, flags, block)
        }
    }

    /// Substitute `RtlSizeHeap`: reads the prefixed size of owned blocks.
    pub fn redirect_heap_size(
        &mut self,
        host: &mut dyn LoaderHost,
        heap: u64,
        flags: u32,
        block: u64,
    ) -> u64 {
        if self.is_process_heap(heap) && self.is_loader_address(block) {
            self.with_heap(|arena, space| arena.block_size(space, block))
        } else {
            host.native_heap_size(heap, flags, block)
        }
    }

    /// Substitute `RtlFree{Unicode,Ansi,Oem}String`.
    ///
    /// The descriptor is read from guest memory; owned buffers are freed
    /// through the substitute and the descriptor zeroed, so a later double
    /// free sees a null buffer. Foreign buffers forward to the native
    /// routine untouched.
    pub fn redirect_free_string(
        &mut self,
        host: &mut dyn LoaderHost,
        kind: StringKind,
        descriptor: u64,
    ) {
        let is_64 = self.arch().is_64();
        let (buffer_offset, descriptor_size) = if is_64 { (8, 16) } else { (4, 8) };
        let Ok(buffer) = self.space().read_ptr(descriptor + buffer_offset, is_64) else {
            log::warn!("unreadable string descriptor {descriptor:#x}");
            return;
        };
        if self.is_loader_address(buffer) {
            let process_heap = self.process_heap();
            self.redirect_heap_free(host, process_heap, 0, buffer);
            let _ = self.space().write(descriptor, &vec![0u8; descriptor_size]);
        } else {
            host.native_free_string(kind, descriptor);
        }
    }
}
