//! Collaborator contract between the loader and its embedding runtime.
//!
//! The loader is deliberately ignorant of everything that belongs to the
//! instrumentation runtime around it: how files are opened, where the system
//! root lives, how guest code is executed, and where the *native* versions
//! of redirected routines are. [`LoaderHost`] fixes those contracts in one
//! trait.
//!
//! Callbacks that run guest code ([`invoke_entry`](LoaderHost::invoke_entry),
//! [`invoke_fls_callback`](LoaderHost::invoke_fls_callback)) receive the
//! loader back by `&mut` reference: entry points routinely call redirected
//! routines (`GetProcAddress`, `FlsAlloc`, heap allocation), and the host
//! dispatches those straight back into the loader it was handed. That nested
//! call chain is the crate's rendition of re-entering a recursive loader
//! lock; see the crate-level documentation.
//!
//! Methods with inert default bodies are notifications or forwarding targets
//! a minimal host can ignore; `file_exists` and `read_file` are the only
//! contracts every host must provide.

use std::{
    io,
    path::{Path, PathBuf},
};

use crate::{
    loader::{EntryReason, Loader},
    redirect::StringKind,
};

/// An already-mapped host module the registry should reference.
///
/// At init the loader records the modules the host loader has inevitably
/// mapped before it (`ntdll.dll`, the runtime's own image, and `user32.dll`
/// when present) as externally loaded: name resolution sees them, but they
/// are never entered, relocated, or unmapped.
#[derive(Clone, Debug)]
pub struct PreloadedImage {
    /// Short name (e.g. `"ntdll.dll"`).
    pub name: String,
    /// Base the host loader mapped the image at.
    pub base: u64,
    /// Allocation size of the mapping.
    pub size: u64,
}

/// The services the loader needs from its embedding runtime.
pub trait LoaderHost {
    /// Returns `true` if `path` names an existing file.
    fn file_exists(&self, path: &Path) -> bool;

    /// Reads the entire file at `path`.
    ///
    /// Handle semantics (read + execute access, sharing that tolerates
    /// rename and concurrent reads) live behind this call; the loader only
    /// ever sees the bytes.
    ///
    /// # Errors
    /// Any [`io::Error`] surfaces to the caller as a load failure.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// System root directory (`%SystemRoot%`), read from the registry on a
    /// real system. `None` disables the system search-path steps.
    fn system_root(&self) -> Option<PathBuf> {
        None
    }

    /// The process's default heap handle (`PEB.ProcessHeap`).
    ///
    /// The substitute heap routines split on this value: allocations against
    /// the default heap are taken over, other heaps are left alone.
    fn process_heap(&self) -> u64 {
        0
    }

    /// Modules the host loader mapped before this loader initialized.
    fn preloaded_images(&self) -> Vec<PreloadedImage> {
        Vec::new()
    }

    /// Runs a module entry point (`DllMain`) at `entry` with the given
    /// reason, returning its success value.
    ///
    /// The entry code may re-enter the loader through redirected routines;
    /// dispatch those against the `loader` passed here.
    fn invoke_entry(
        &mut self,
        loader: &mut Loader,
        entry: u64,
        base: u64,
        reason: EntryReason,
    ) -> bool {
        let _ = (loader, entry, base, reason);
        true
    }

    /// Runs a private library's FLS callback natively on behalf of the
    /// trampoline.
    fn invoke_fls_callback(&mut self, loader: &mut Loader, callback: u64, argument: u64) {
        let _ = (loader, callback, argument);
    }

    /// Native `RtlAllocateHeap`, for non-default heaps. Zero means failure.
    fn native_heap_alloc(&mut self, heap: u64, flags: u32, size: u64) -> u64 {
        let _ = (heap, flags, size);
        0
    }

    /// Native `RtlReAllocateHeap`, for blocks the loader does not own.
    fn native_heap_realloc(&mut self, heap: u64, flags: u32, block: u64, size: u64) -> u64 {
        let _ = (heap, flags, block, size);
        0
    }

    /// Native `RtlFreeHeap`, for blocks the loader does not own.
    fn native_heap_free(&mut self, heap: u64, flags: u32, block: u64) -> bool {
        let _ = (heap, flags, block);
        false
    }

    /// Native `RtlSizeHeap`, for blocks the loader does not own.
    fn native_heap_size(&self, heap: u64, flags: u32, block: u64) -> u64 {
        let _ = (heap, flags, block);
        0
    }

    /// Native `RtlFree{Unicode,Ansi,Oem}String`, for buffers the loader does
    /// not own.
    fn native_free_string(&mut self, kind: StringKind, descriptor: u64) {
        let _ = (kind, descriptor);
    }

    /// Native `FlsAlloc`. Private libraries keep real slot indices; only the
    /// callback dispatch is taken over.
    fn native_fls_alloc(&mut self, callback: u64) -> u32 {
        let _ = callback;
        u32::MAX // FLS_OUT_OF_INDEXES
    }

    /// Native `GetModuleHandleA`, for names outside the private registry.
    fn native_get_module_handle(&self, name: &str) -> u64 {
        let _ = name;
        0
    }

    /// Native `GetProcAddress`, for bases outside the private registry.
    fn native_get_proc_address(&self, base: u64, name: &str) -> u64 {
        let _ = (base, name);
        0
    }

    /// A post-bootstrap mapping went live; add it to the runtime's tracked
    /// code areas.
    fn area_added(&mut self, base: u64, size: u64) {
        let _ = (base, size);
    }

    /// A mapping was torn down. May be called for ranges that were never
    /// added; removing what is not there is fine.
    fn area_removed(&mut self, base: u64, size: u64) {
        let _ = (base, size);
    }

    /// Mark a single address (an FLS callback entry point) as code the
    /// runtime must treat as its own.
    fn mark_tracked_code(&mut self, addr: u64) {
        let _ = addr;
    }
}
