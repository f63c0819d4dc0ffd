//! The private loader: lifecycle driver and module bookkeeping.
//!
//! # Overview
//!
//! [`Loader`] owns everything the private loading machinery needs: the
//! modeled [`AddressSpace`], the dependency-ordered module registry with its
//! address-range index, the search paths, the pre-init bootstrap tables, the
//! private heap arena, the redirection stubs, and the FLS callback list.
//!
//! The lifecycle:
//!
//! 1. **Bootstrap window**: [`load`](Loader::load) calls before
//!    [`init`](Loader::init) map client libraries with the raw backend,
//!    record their directories as search paths, and park provisional records
//!    in a fixed-capacity table. No imports are resolved yet.
//! 2. **Init**: the system root is captured, the redirection stubs and heap
//!    arena go live, the host's already-mapped modules (ntdll, the runtime
//!    image, user32) are referenced as externally loaded, and every
//!    bootstrap record is migrated into the registry and finalized: area
//!    index, import resolution, `ProcessAttach` entry.
//! 3. **Steady state**: loads and unloads keep the registry in
//!    reverse-dependency order; thread attach/detach walk it forward.
//! 4. **Shutdown**: the head of the list is unloaded until nothing is
//!    left, which releases dependents before dependencies by construction.
//!
//! # Reentrancy
//!
//! Import resolution can invoke a library's entry point, which may call
//! `GetProcAddress`, `GetModuleHandleA`, or `FlsAlloc`, all of which come
//! straight back into the loader. Every public operation takes `&mut self`
//! and host callbacks receive the same `&mut Loader` back, so reentry is a
//! nested call under the single outstanding borrow (the shape a recursive
//! lock would otherwise serialize), and a depth guard bounds dependency
//! chains. An embedding runtime that wants cross-thread access wraps the
//! loader in its own mutex.

pub(crate) mod bootstrap;
pub(crate) mod mapper;
pub(crate) mod paths;
pub mod registry;
pub(crate) mod reloc;
mod resolver;

use std::path::Path;

use crate::{
    host::LoaderHost,
    memory::{AddressSpace, MemoryProtection, MemoryRegion},
    pe::{exports, ImageHeaders},
    redirect::{fls::FlsCallbacks, heap::PrivateHeap, SHIM_REGION_SIZE},
    Error, Result,
};

use bootstrap::{BootstrapModule, BootstrapTable};
use paths::SearchPaths;
use registry::{ModuleRegistry, PrivateModule};

/// Sanity bound on dependency-chain recursion depth.
const LOADER_RECURSE_MAX: usize = 10;

/// Size of the private heap arena backing the substitute allocator.
const HEAP_ARENA_SIZE: usize = 256 * 1024;

/// Pointer width the loader (and every image it maps) runs at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    /// 32-bit (PE32 images, 4-byte thunks and pointers).
    X86,
    /// 64-bit (PE32+ images, 8-byte thunks and pointers).
    X64,
}

impl Arch {
    /// Returns `true` for [`Arch::X64`].
    #[must_use]
    pub fn is_64(self) -> bool {
        matches!(self, Arch::X64)
    }

    /// Pointer size in bytes.
    #[must_use]
    pub fn pointer_size(self) -> u64 {
        if self.is_64() {
            8
        } else {
            4
        }
    }
}

/// Reason code passed to a module's entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryReason {
    /// `DLL_PROCESS_ATTACH`
    ProcessAttach,
    /// `DLL_PROCESS_DETACH`
    ProcessDetach,
    /// `DLL_THREAD_ATTACH`
    ThreadAttach,
    /// `DLL_THREAD_DETACH`
    ThreadDetach,
}

impl EntryReason {
    /// The Windows `DLL_*` reason value.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            EntryReason::ProcessDetach => 0,
            EntryReason::ProcessAttach => 1,
            EntryReason::ThreadAttach => 2,
            EntryReason::ThreadDetach => 3,
        }
    }
}

/// The private dynamic-library loader.
///
/// See the [module documentation](self) for the lifecycle and reentrancy
/// model. All operations are synchronous: they complete or fail before
/// returning, and a failed load unwinds the half-built module through the
/// same path a real unload takes.
#[derive(Debug)]
pub struct Loader {
    arch: Arch,
    space: AddressSpace,
    registry: ModuleRegistry,
    paths: SearchPaths,
    bootstrap: BootstrapTable,
    heap: Option<PrivateHeap>,
    fls: FlsCallbacks,
    shim_base: u64,
    /// `false` during the bootstrap window, `true` from `init` on.
    allocator_live: bool,
    /// High-water recursion mark for the current top-level load.
    recurse_count: usize,
    /// `PEB.ProcessHeap`, captured from the host at init.
    process_heap: u64,
}

impl Loader {
    /// Creates an uninitialized loader for the given architecture.
    ///
    /// Client libraries may be loaded immediately (the bootstrap window);
    /// everything else waits for [`init`](Self::init).
    #[must_use]
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            space: AddressSpace::new(),
            registry: ModuleRegistry::new(),
            paths: SearchPaths::new(),
            bootstrap: BootstrapTable::new(),
            heap: None,
            fls: FlsCallbacks::new(),
            shim_base: 0,
            allocator_live: false,
            recurse_count: 0,
            process_heap: 0,
        }
    }

    /// Initializes the loader.
    ///
    /// Captures the system root and process heap, maps the redirection stub
    /// region and the private heap arena, references the host's preloaded
    /// modules as externally loaded, and migrates + finalizes every module
    /// from the bootstrap window.
    ///
    /// # Errors
    ///
    /// Fails when a bootstrap module's finalization fails (that module has
    /// already been unwound) or when the loader's own regions cannot be
    /// mapped.
    pub fn init(&mut self, host: &mut dyn LoaderHost) -> Result<()> {
        debug_assert!(!self.allocator_live, "loader initialized twice");
        if self.allocator_live {
            return Ok(());
        }

        let system_root = host.system_root();
        if system_root.is_none() {
            log::warn!("no system root available; system search paths disabled");
        }
        self.paths.set_system_root(system_root);
        self.process_heap = host.process_heap();
        self.allocator_live = true;

        let stub_base = self.space.find_free_base(SHIM_REGION_SIZE, 0);
        self.space.map_at(
            stub_base,
            MemoryRegion::data(
                stub_base,
                vec![0u8; SHIM_REGION_SIZE],
                "privload.stubs",
                MemoryProtection::READ_EXECUTE,
            ),
        )?;
        self.shim_base = stub_base;

        let arena_base = self.space.find_free_base(HEAP_ARENA_SIZE, 0);
        self.space.map_at(
            arena_base,
            MemoryRegion::heap_arena(arena_base, HEAP_ARENA_SIZE, "privload.heap"),
        )?;
        self.heap = Some(PrivateHeap::new(arena_base, HEAP_ARENA_SIZE as u64));

        for image in host.preloaded_images() {
            log::debug!(
                "referencing externally loaded {} @ {:#x}",
                image.name,
                image.base
            );
            self.registry.insert_after(
                None,
                PrivateModule {
                    base: image.base,
                    size: image.size,
                    name: image.name,
                    ref_count: 1,
                    externally_loaded: true,
                },
            );
        }

        // Client libraries mapped before init: move into the registry and
        // run the full finalize they were waiting for. A failing client is
        // unwound and reported without blocking the remaining migrations.
        if !self.bootstrap.is_empty() {
            log::debug!("migrating {} bootstrap modules", self.bootstrap.len());
        }
        let mut first_error = None;
        for module in self.bootstrap.drain() {
            log::debug!("processing imports for {}", module.name);
            let name = module.name.clone();
            self.registry.insert_after(
                None,
                PrivateModule {
                    base: module.base,
                    size: module.size,
                    name: module.name,
                    ref_count: 1,
                    externally_loaded: false,
                },
            );
            if let Err(e) = self.finalize(host, module.base) {
                log::warn!("failed to finalize client library {name}: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unloads every module and clears the FLS callback list.
    ///
    /// The registry is drained from the head, so dependents always go before
    /// the modules they import.
    pub fn shutdown(&mut self, host: &mut dyn LoaderHost) {
        while let Some(base) = self.registry.head_base() {
            self.unload_module(host, base);
        }
        log::debug!("releasing {} FLS callback entries", self.fls.len());
        self.fls.clear();
    }

    /// Loads a private library.
    ///
    /// A plain file name is located through the search paths; a path with
    /// directory components is used as-is. If a module with the same short
    /// name is already registered its reference count is bumped and its base
    /// returned.
    ///
    /// Before [`init`](Self::init) this maps the image and parks it in the
    /// bootstrap table (its directory joins the search paths); from init on
    /// it performs the full load: map, insert after nothing (head), resolve
    /// imports (recursively loading dependencies), and invoke the entry
    /// point with `ProcessAttach`.
    ///
    /// # Errors
    ///
    /// Every failure mode of mapping and finalization; any half-built module
    /// is unwound before the error returns.
    pub fn load(&mut self, host: &mut dyn LoaderHost, filename: &Path) -> Result<u64> {
        let short = paths::short_name(filename);
        if let Some(module) = self.registry.lookup_by_name_mut(&short) {
            module.ref_count += 1;
            return Ok(module.base);
        }

        self.recurse_count = 0;
        if filename.parent().is_some_and(|p| !p.as_os_str().is_empty()) {
            self.privload_load(host, filename, None)
        } else {
            self.locate_and_load(host, &short, None)
        }
    }

    /// Unloads a private library by base address.
    ///
    /// Decrements the reference count; at zero the module is unlinked, its
    /// entry invoked with `ProcessDetach`, its imports released recursively,
    /// and the mapping torn down. Returns `true` only when the module was
    /// fully released.
    pub fn unload(&mut self, host: &mut dyn LoaderHost, base: u64) -> bool {
        if !self.allocator_live {
            log::warn!("unload before init ignored");
            return false;
        }
        self.unload_module(host, base)
    }

    /// Invokes every non-external module's entry with `ThreadAttach`.
    ///
    /// Walks the list forward so independent libraries are signaled last,
    /// after the modules that depend on them.
    pub fn thread_attach(&mut self, host: &mut dyn LoaderHost) {
        self.thread_event(host, EntryReason::ThreadAttach);
    }

    /// Invokes every non-external module's entry with `ThreadDetach`.
    ///
    /// Same forward order as attach; see the crate documentation for the
    /// ordering discussion.
    pub fn thread_detach(&mut self, host: &mut dyn LoaderHost) {
        self.thread_event(host, EntryReason::ThreadDetach);
    }

    /// Range-membership query: does `addr` belong to a private module?
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.registry.contains(addr)
    }

    /// The modeled address space (shared with the execution engine).
    #[must_use]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// The loader's pointer width.
    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Registered modules in forward (reverse-dependency) order.
    pub fn modules(&self) -> impl Iterator<Item = &PrivateModule> {
        self.registry.iter()
    }

    /// The default process heap value captured at init.
    #[must_use]
    pub fn process_heap(&self) -> u64 {
        self.process_heap
    }

    /// The ownership predicate over the private allocator: `true` iff `p`
    /// was (or could have been) handed out by the substitute heap.
    #[must_use]
    pub fn is_loader_address(&self, p: u64) -> bool {
        self.heap.as_ref().is_some_and(|h| h.owns(p))
    }

    // ---- crate-internal plumbing ------------------------------------------

    pub(crate) fn shim_base(&self) -> u64 {
        self.shim_base
    }

    pub(crate) fn fls(&self) -> &FlsCallbacks {
        &self.fls
    }

    pub(crate) fn fls_mut(&mut self) -> &mut FlsCallbacks {
        &mut self.fls
    }

    pub(crate) fn is_process_heap(&self, heap: u64) -> bool {
        self.allocator_live && heap == self.process_heap
    }

    pub(crate) fn heap_ready(&self) -> bool {
        self.heap.is_some()
    }

    pub(crate) fn with_heap<R: Default>(
        &mut self,
        f: impl FnOnce(&mut PrivateHeap, &AddressSpace) -> R,
    ) -> R {
        match self.heap.as_mut() {
            Some(heap) => f(heap, &self.space),
            None => R::default(),
        }
    }

    // ---- load/unload internals --------------------------------------------

    /// Maps and registers one library; dependencies insert after their
    /// importer to keep the reverse-dependency order.
    fn privload_load(
        &mut self,
        host: &mut dyn LoaderHost,
        path: &Path,
        dependent: Option<u64>,
    ) -> Result<u64> {
        self.recurse_count += 1;
        debug_assert!(
            self.recurse_count < LOADER_RECURSE_MAX,
            "dependency chain too deep"
        );
        if self.recurse_count >= LOADER_RECURSE_MAX {
            return Err(Error::RecursionLimit(LOADER_RECURSE_MAX));
        }

        log::debug!("loading {}", path.display());
        let mapped =
            mapper::map_and_relocate(&self.space, host, path, self.arch, self.allocator_live)?;

        // Keep the client library's directory for resolving its transitive
        // dependencies later; only bootstrap-window loads contribute.
        if !self.allocator_live {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                if let Err(e) = self.paths.push_client_dir(dir.to_path_buf()) {
                    self.teardown_mapping(host, mapped.base, mapped.size);
                    return Err(e);
                }
            }
        }

        let name = exports::module_short_name(&self.space, mapped.base)
            .ok()
            .flatten()
            .unwrap_or_else(|| paths::short_name(path));

        if self.allocator_live {
            self.registry.insert_after(
                dependent,
                PrivateModule {
                    base: mapped.base,
                    size: mapped.size,
                    name,
                    ref_count: 1,
                    externally_loaded: false,
                },
            );
            self.finalize(host, mapped.base)?;
        } else if let Err(e) = self.bootstrap.push(BootstrapModule {
            base: mapped.base,
            size: mapped.size,
            name,
        }) {
            self.teardown_mapping(host, mapped.base, mapped.size);
            return Err(e);
        }
        Ok(mapped.base)
    }

    /// The post-mapping phase: area index, import resolution, attach entry.
    /// Any failure unwinds through [`unload_module`](Self::unload_module).
    fn finalize(&mut self, host: &mut dyn LoaderHost, base: u64) -> Result<()> {
        let Some(module) = self.registry.lookup_by_base(base) else {
            return Err(Error::InvalidAddress {
                address: base,
                reason: "finalize of unregistered module".to_string(),
            });
        };
        let name = module.name.clone();
        let size = module.size;
        debug_assert!(!module.externally_loaded);

        self.registry.add_area(base, size);

        if let Err(e) = self.process_imports(host, base) {
            log::warn!("failed to process imports of {name}: {e}");
            self.unload_module(host, base);
            return Err(e);
        }
        if !self.call_entry(host, base, EntryReason::ProcessAttach) {
            log::warn!("entry routine of {name} failed");
            self.unload_module(host, base);
            return Err(Error::EntryPointFailure(name));
        }
        log::debug!("loaded {name} @ {base:#x}");
        Ok(())
    }

    /// Invokes the module entry point; images without one succeed trivially.
    fn call_entry(&mut self, host: &mut dyn LoaderHost, base: u64, reason: EntryReason) -> bool {
        let entry = match ImageHeaders::read(&self.space, base) {
            Ok(headers) => headers.entry_point(base),
            Err(e) => {
                log::warn!("unreadable headers at {base:#x} for entry call: {e}");
                return true;
            }
        };
        let Some(entry) = entry else {
            return true;
        };
        log::debug!("calling entry {entry:#x} of {base:#x} for {reason:?}");
        host.invoke_entry(self, entry, base, reason)
    }

    /// Drops one reference; at zero, unlinks and tears the module down.
    fn unload_module(&mut self, host: &mut dyn LoaderHost, base: u64) -> bool {
        let Some(module) = self.registry.lookup_by_base_mut(base) else {
            return false;
        };
        debug_assert!(module.ref_count > 0);
        module.ref_count = module.ref_count.saturating_sub(1);
        log::debug!("{} refcount => {}", module.name, module.ref_count);
        if module.ref_count > 0 {
            return false;
        }

        let Some(module) = self.registry.remove(base) else {
            return false;
        };
        log::debug!("unloading {} @ {base:#x}", module.name);
        if !module.externally_loaded {
            self.call_entry(host, base, EntryReason::ProcessDetach);
            // May unload further modules, but this record is already gone
            self.unload_imports(host, base);
            self.registry.remove_area(base);
            host.area_removed(base, module.size);
            if let Err(e) = self.space.unmap(base) {
                log::warn!("unmap of {base:#x} failed: {e}");
            }
        }
        true
    }

    /// Releases the reference this module holds on each of its imports, by
    /// walking the same descriptor table the resolver walked.
    fn unload_imports(&mut self, host: &mut dyn LoaderHost, base: u64) -> bool {
        let descriptors = match crate::pe::imports::import_descriptors(&self.space, base) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                log::debug!("error reading imports during unload of {base:#x}: {e}");
                return false;
            }
        };
        for descriptor in descriptors {
            let Ok(import_name) = self.space.read_c_string(base + u64::from(descriptor.name))
            else {
                return false;
            };
            // A failed load may not have brought every import in
            if let Some(import) = self.registry.lookup_by_name(&import_name) {
                let import_base = import.base;
                self.unload_module(host, import_base);
            } else {
                log::debug!("{import_name} not present while releasing imports");
            }
        }
        true
    }

    fn teardown_mapping(&mut self, host: &mut dyn LoaderHost, base: u64, size: u64) {
        if let Err(e) = self.space.unmap(base) {
            log::warn!("teardown unmap of {base:#x} failed: {e}");
        }
        host.area_removed(base, size);
    }

    fn thread_event(&mut self, host: &mut dyn LoaderHost, reason: EntryReason) {
        let targets: Vec<u64> = self
            .registry
            .iter()
            .filter(|m| !m.externally_loaded)
            .map(|m| m.base)
            .collect();
        for base in targets {
            self.call_entry(host, base, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PreloadedImage;

    struct BareHost {
        process_heap: u64,
    }

    impl LoaderHost for BareHost {
        fn file_exists(&self, _path: &Path) -> bool {
            false
        }

        fn read_file(&self, _path: &Path) -> std::io::Result<Vec<u8>> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))
        }

        fn process_heap(&self) -> u64 {
            self.process_heap
        }

        fn preloaded_images(&self) -> Vec<PreloadedImage> {
            vec![PreloadedImage {
                name: "ntdll.dll".to_string(),
                base: 0x7FF8_0000,
                size: 0x10_0000,
            }]
        }
    }

    #[test]
    fn init_maps_stubs_and_arena_and_references_preloaded() {
        let mut host = BareHost { process_heap: 0x660000 };
        let mut loader = Loader::new(Arch::X64);
        loader.init(&mut host).unwrap();

        assert_ne!(loader.shim_base(), 0);
        assert!(loader.heap_ready());
        assert!(loader.is_process_heap(0x660000));
        assert!(!loader.is_process_heap(0x1234));

        let names: Vec<_> = loader.modules().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["ntdll.dll"]);
        assert!(loader.modules().all(|m| m.externally_loaded));
        // Externally loaded modules never join the area index
        assert!(!loader.contains(0x7FF8_0000));
    }

    #[test]
    fn shim_addresses_round_trip() {
        let mut host = BareHost { process_heap: 0 };
        let mut loader = Loader::new(Arch::X64);
        loader.init(&mut host).unwrap();

        for shim in crate::redirect::Shim::ALL {
            let addr = loader.shim_address(shim);
            assert_eq!(loader.shim_at(addr), Some(shim));
        }
        assert_eq!(loader.shim_at(loader.shim_base() + 1), None);
        assert_eq!(loader.shim_at(0), None);
    }

    #[test]
    fn load_of_missing_file_fails_cleanly() {
        let mut host = BareHost { process_heap: 0 };
        let mut loader = Loader::new(Arch::X64);
        loader.init(&mut host).unwrap();
        let before = loader.modules().count();
        assert!(loader.load(&mut host, Path::new("missing.dll")).is_err());
        assert_eq!(loader.modules().count(), before);
    }

    #[test]
    fn unload_of_unknown_base_is_false() {
        let mut host = BareHost { process_heap: 0 };
        let mut loader = Loader::new(Arch::X64);
        loader.init(&mut host).unwrap();
        assert!(!loader.unload(&mut host, 0xDEAD_0000));
    }

    #[test]
    fn shutdown_empties_registry() {
        let mut host = BareHost { process_heap: 0 };
        let mut loader = Loader::new(Arch::X64);
        loader.init(&mut host).unwrap();
        loader.shutdown(&mut host);
        assert_eq!(loader.modules().count(), 0);
    }

    #[test]
    fn entry_reason_codes_match_windows() {
        assert_eq!(EntryReason::ProcessDetach.code(), 0);
        assert_eq!(EntryReason::ProcessAttach.code(), 1);
        assert_eq!(EntryReason::ThreadAttach.code(), 2);
        assert_eq!(EntryReason::ThreadDetach.code(), 3);
    }
}
