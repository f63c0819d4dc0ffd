//! Shared helpers for the loader integration tests: a synthetic PE builder
//! and a scripted `LoaderHost`.
//!
//! The builder emits PE32+ DLLs whose file alignment equals the section
//! alignment, so the on-disk layout and the mapped layout coincide. That
//! lets the same bytes serve as a loadable file on disk *and* as a directly
//! mappable image for the fake externally-loaded modules (ntdll).
//!
//! Fixed layout: headers in page 0, `.text` at RVA 0x1000, `.rdata` at
//! 0x2000 (export directory at 0x2000, import descriptors at 0x2400, ILT at
//! 0x2500, IAT at 0x2600 by default, name strings at 0x2700, all
//! read-only, so IAT writes exercise the protection dance), `.reloc` at
//! 0x3000. `SizeOfImage` is 0x4000.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
};

use privload::{
    memory::{MemoryProtection, MemoryRegion, SectionInfo},
    EntryReason, Loader, LoaderHost, PreloadedImage, StringKind,
};

/// Span of every built image.
pub const IMAGE_SIZE: usize = 0x4000;

const ORDINAL_FLAG64: u64 = 1 << 63;

/// One export of a built image.
#[derive(Clone)]
pub enum ExportDef {
    /// Export `name` as code at the given RVA (keep it inside `.text`).
    Code(&'static str, u32),
    /// Export `name` as a forwarder to `Target.symbol`.
    Forwarder(&'static str, &'static str),
}

/// One import-table entry of a built image.
#[derive(Clone)]
pub enum ImportDef {
    /// Import `name` from the descriptor's DLL.
    Name(&'static str),
    /// Import by ordinal (a declared non-goal; loads must fail).
    Ordinal(u16),
}

/// Builder for synthetic PE32+ DLL images.
pub struct PeBuilder {
    name: String,
    image_base: u64,
    entry_rva: u32,
    exports: Vec<ExportDef>,
    imports: Vec<(String, Vec<ImportDef>)>,
    iat_rva: u32,
    with_relocs: bool,
    with_tls: bool,
    with_delay: bool,
    as_executable: bool,
    bound_stamp: u32,
}

impl PeBuilder {
    /// Starts a builder for a DLL whose export directory names it `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image_base: 0x1_8000_0000,
            entry_rva: 0,
            exports: Vec::new(),
            imports: Vec::new(),
            iat_rva: 0x2600,
            with_relocs: false,
            with_tls: false,
            with_delay: false,
            as_executable: false,
            bound_stamp: 0,
        }
    }

    /// Preferred load address (defaults to 0x1_8000_0000).
    pub fn base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    /// Entry-point RVA; zero means no entry.
    pub fn entry(mut self, rva: u32) -> Self {
        self.entry_rva = rva;
        self
    }

    /// Adds a code export at `rva`.
    pub fn export(mut self, name: &'static str, rva: u32) -> Self {
        self.exports.push(ExportDef::Code(name, rva));
        self
    }

    /// Adds a forwarder export (`target` is `"MODULE.symbol"`).
    pub fn forward(mut self, name: &'static str, target: &'static str) -> Self {
        self.exports.push(ExportDef::Forwarder(name, target));
        self
    }

    /// Adds an import descriptor for `dll` with named entries.
    pub fn import(mut self, dll: &str, names: &[&'static str]) -> Self {
        self.imports.push((
            dll.to_string(),
            names.iter().map(|n| ImportDef::Name(*n)).collect::<Vec<_>>(),
        ));
        self
    }

    /// Adds an import descriptor with arbitrary entries.
    pub fn import_entries(mut self, dll: &str, entries: Vec<ImportDef>) -> Self {
        self.imports.push((dll.to_string(), entries));
        self
    }

    /// Moves the IAT to a custom RVA (e.g. straddling a page boundary).
    pub fn iat_at(mut self, rva: u32) -> Self {
        self.iat_rva = rva;
        self
    }

    /// Emits a relocation directory with one DIR64 fixup at `.text:0x20`
    /// whose slot holds the absolute address `image_base + 0x1040`.
    pub fn relocs(mut self) -> Self {
        self.with_relocs = true;
        self
    }

    /// Emits a (valid-looking) TLS directory.
    pub fn tls(mut self) -> Self {
        self.with_tls = true;
        self
    }

    /// Emits a delay-load import directory (terminator-only).
    pub fn delay_imports(mut self) -> Self {
        self.with_delay = true;
        self
    }

    /// Clears `IMAGE_FILE_DLL`, making the image an executable.
    pub fn executable(mut self) -> Self {
        self.as_executable = true;
        self
    }

    /// Sets the import descriptors' bind timestamp.
    pub fn bound(mut self, stamp: u32) -> Self {
        self.bound_stamp = stamp;
        self
    }

    /// Emits the image bytes (file layout == mapped layout).
    pub fn build(self) -> Vec<u8> {
        let mut i = vec![0u8; IMAGE_SIZE];

        // DOS header
        i[0..2].copy_from_slice(b"MZ");
        put32(&mut i, 0x3C, 0x80);

        // NT signature + COFF header
        i[0x80..0x84].copy_from_slice(b"PE\0\0");
        put16(&mut i, 0x84, 0x8664); // Machine: amd64
        put16(&mut i, 0x86, 3); // NumberOfSections
        put16(&mut i, 0x94, 0xF0); // SizeOfOptionalHeader
        let mut characteristics: u16 = 0x0022; // EXECUTABLE | LARGE_ADDRESS_AWARE
        if !self.as_executable {
            characteristics |= 0x2000; // IMAGE_FILE_DLL
        }
        put16(&mut i, 0x96, characteristics);

        // Optional header (PE32+) at 0x98
        let o = 0x98;
        put16(&mut i, o, 0x020B); // Magic
        put32(&mut i, o + 4, 0x1000); // SizeOfCode
        put32(&mut i, o + 16, self.entry_rva); // AddressOfEntryPoint
        put32(&mut i, o + 20, 0x1000); // BaseOfCode
        put64(&mut i, o + 24, self.image_base); // ImageBase
        put32(&mut i, o + 32, 0x1000); // SectionAlignment
        put32(&mut i, o + 36, 0x1000); // FileAlignment
        put16(&mut i, o + 40, 6); // MajorOperatingSystemVersion
        put16(&mut i, o + 48, 6); // MajorSubsystemVersion
        put32(&mut i, o + 56, IMAGE_SIZE as u32); // SizeOfImage
        put32(&mut i, o + 60, 0x400); // SizeOfHeaders
        put16(&mut i, o + 68, 3); // Subsystem: console
        put64(&mut i, o + 72, 0x10_0000); // SizeOfStackReserve
        put64(&mut i, o + 80, 0x1000); // SizeOfStackCommit
        put64(&mut i, o + 88, 0x10_0000); // SizeOfHeapReserve
        put64(&mut i, o + 96, 0x1000); // SizeOfHeapCommit
        put32(&mut i, o + 108, 16); // NumberOfRvaAndSizes

        let dirs = o + 112;
        // Export directory: always present so the registry sees our name
        put32(&mut i, dirs, 0x2000);
        put32(&mut i, dirs + 4, 0x400);
        if !self.imports.is_empty() {
            put32(&mut i, dirs + 8, 0x2400);
            put32(&mut i, dirs + 12, 0x100);
        }
        if self.with_relocs {
            put32(&mut i, dirs + 5 * 8, 0x3000);
            put32(&mut i, dirs + 5 * 8 + 4, 12);
        }
        if self.with_tls {
            put32(&mut i, dirs + 9 * 8, 0x3100);
            put32(&mut i, dirs + 9 * 8 + 4, 0x28);
        }
        if self.with_delay {
            put32(&mut i, dirs + 13 * 8, 0x3200);
            put32(&mut i, dirs + 13 * 8 + 4, 0x20);
        }

        // Section table at 0x188
        write_section(&mut i, 0x188, b".text\0\0\0", 0x1000, 0x6000_0020);
        write_section(&mut i, 0x1B0, b".rdata\0\0", 0x2000, 0x4000_0040);
        write_section(&mut i, 0x1D8, b".reloc\0\0", 0x3000, 0x4200_0040);

        self.write_exports(&mut i);
        self.write_imports(&mut i);

        if self.with_relocs {
            // The fixup target: an absolute pointer into our own image
            put64(&mut i, 0x1020, self.image_base + 0x1040);
            put32(&mut i, 0x3000, 0x1000); // page RVA
            put32(&mut i, 0x3004, 12); // block size
            put16(&mut i, 0x3008, (10 << 12) | 0x20); // DIR64 @ .text:0x20
            put16(&mut i, 0x300A, 0); // ABSOLUTE padding
        }
        if self.with_tls {
            // Plausible VAs so eager parsers do not trip over null pointers
            put64(&mut i, 0x3100, self.image_base + 0x3180);
            put64(&mut i, 0x3108, self.image_base + 0x3188);
            put64(&mut i, 0x3110, self.image_base + 0x3190);
            put64(&mut i, 0x3118, self.image_base + 0x3198);
        }

        i
    }

    fn write_exports(&self, i: &mut [u8]) {
        let d = 0x2000;
        let count = self.exports.len() as u32;
        let mut strings = 0x20D0usize;

        put32(i, d + 12, strings as u32); // Name
        let name_bytes = self.name.as_bytes();
        i[strings..strings + name_bytes.len()].copy_from_slice(name_bytes);
        strings += name_bytes.len() + 1;

        put32(i, d + 16, 1); // Base
        put32(i, d + 20, count); // NumberOfFunctions
        put32(i, d + 24, count); // NumberOfNames
        put32(i, d + 28, 0x2030); // AddressOfFunctions
        put32(i, d + 32, 0x2070); // AddressOfNames
        put32(i, d + 36, 0x20B0); // AddressOfNameOrdinals

        for (index, export) in self.exports.iter().enumerate() {
            assert!(index < 16, "too many exports for the fixed layout");
            let (name, function_rva) = match export {
                ExportDef::Code(name, rva) => (*name, *rva),
                ExportDef::Forwarder(name, target) => {
                    // The forwarder string lives inside the export directory
                    let rva = strings as u32;
                    i[strings..strings + target.len()].copy_from_slice(target.as_bytes());
                    strings += target.len() + 1;
                    (*name, rva)
                }
            };
            put32(i, 0x2030 + index * 4, function_rva);
            put32(i, 0x2070 + index * 4, strings as u32);
            i[strings..strings + name.len()].copy_from_slice(name.as_bytes());
            strings += name.len() + 1;
            put16(i, 0x20B0 + index * 2, index as u16);
        }
        assert!(strings < 0x2400, "export strings overflow the directory");
    }

    fn write_imports(&self, i: &mut [u8]) {
        if self.imports.is_empty() {
            return;
        }
        assert!(self.imports.len() <= 4, "too many descriptors for the layout");
        let mut strings = 0x2700usize;

        for (index, (dll, entries)) in self.imports.iter().enumerate() {
            assert!(entries.len() < 8, "too many entries per descriptor");
            let descriptor = 0x2400 + index * 20;
            let ilt = 0x2500 + index * 0x40;
            let iat = self.iat_rva as usize + index * 0x40;

            put32(i, descriptor, ilt as u32); // OriginalFirstThunk
            put32(i, descriptor + 4, self.bound_stamp); // TimeDateStamp
            let dll_name = strings;
            i[strings..strings + dll.len()].copy_from_slice(dll.as_bytes());
            strings += dll.len() + 1;
            put32(i, descriptor + 12, dll_name as u32); // Name
            put32(i, descriptor + 16, iat as u32); // FirstThunk

            for (slot, entry) in entries.iter().enumerate() {
                let thunk = match entry {
                    ImportDef::Name(name) => {
                        let hint_name = strings;
                        // u16 hint, then the symbol
                        strings += 2;
                        i[strings..strings + name.len()].copy_from_slice(name.as_bytes());
                        strings += name.len() + 1;
                        hint_name as u64
                    }
                    ImportDef::Ordinal(ordinal) => ORDINAL_FLAG64 | u64::from(*ordinal),
                };
                put64(i, ilt + slot * 8, thunk);
                put64(i, iat + slot * 8, thunk);
            }
        }
        assert!(strings < 0x3000, "import strings overflow .rdata");
    }
}

fn put16(image: &mut [u8], offset: usize, value: u16) {
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put64(image: &mut [u8], offset: usize, value: u64) {
    image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_section(image: &mut [u8], offset: usize, name: &[u8; 8], rva: u32, characteristics: u32) {
    image[offset..offset + 8].copy_from_slice(name);
    put32(image, offset + 8, 0x1000); // VirtualSize
    put32(image, offset + 12, rva);
    put32(image, offset + 16, 0x1000); // SizeOfRawData
    put32(image, offset + 20, rva); // PointerToRawData == RVA
    put32(image, offset + 36, characteristics);
}

/// Maps a built image directly into the space as an externally-loaded module
/// would appear (sections and protections matching the builder layout).
pub fn image_region(base: u64, bytes: &[u8], label: &str) -> MemoryRegion {
    let section = |name: &str, rva: u32, protection| SectionInfo {
        name: name.to_string(),
        virtual_address: rva,
        virtual_size: 0x1000,
        protection,
    };
    MemoryRegion::image(
        base,
        bytes.to_vec(),
        vec![
            section(".text", 0x1000, MemoryProtection::READ_EXECUTE),
            section(".rdata", 0x2000, MemoryProtection::READ),
            section(".reloc", 0x3000, MemoryProtection::READ),
        ],
        label,
    )
}

/// Scripted host: a real filesystem rooted in a temp directory, recording
/// fakes for everything else.
pub struct TestHost {
    /// Directory answering as `%SystemRoot%` (contains `system32/`).
    pub system_root: Option<PathBuf>,
    /// The value reported as `PEB.ProcessHeap`.
    pub process_heap: u64,
    /// Every entry invocation, in order.
    pub entry_calls: Vec<(u64, EntryReason)>,
    /// Module short names whose `ProcessAttach` should report failure.
    pub failing_entries: HashSet<String>,
    /// Optional hook run inside `invoke_entry` (reentrancy tests).
    pub entry_hook: Option<fn(&mut TestHost, &mut Loader, u64, EntryReason)>,
    /// Modules the host loader "already mapped".
    pub preloaded: Vec<PreloadedImage>,
    /// Native-heap bookkeeping: block -> (heap, size).
    pub native_allocs: HashMap<u64, (u64, u64)>,
    next_native_block: u64,
    /// Arguments of every native free.
    pub native_frees: Vec<(u64, u64)>,
    /// Natively freed string descriptors.
    pub native_freed_strings: Vec<(StringKind, u64)>,
    /// Callbacks passed to the native `FlsAlloc`, in order.
    pub fls_allocs: Vec<u64>,
    /// `(callback, argument)` pairs the trampoline ran natively.
    pub fls_invocations: Vec<(u64, u64)>,
    /// Addresses marked as tracked code.
    pub tracked_code: Vec<u64>,
    /// Ranges reported via `area_added`.
    pub areas_added: Vec<(u64, u64)>,
    /// Ranges reported via `area_removed`.
    pub areas_removed: Vec<(u64, u64)>,
    /// Scripted native `GetModuleHandleA` answers.
    pub native_modules: HashMap<String, u64>,
    /// Scripted native `GetProcAddress` answers.
    pub native_procs: HashMap<(u64, String), u64>,
}

impl TestHost {
    /// A host with no filesystem and a default process heap.
    pub fn new() -> Self {
        Self {
            system_root: None,
            process_heap: 0x0066_0000,
            entry_calls: Vec::new(),
            failing_entries: HashSet::new(),
            entry_hook: None,
            preloaded: Vec::new(),
            native_allocs: HashMap::new(),
            next_native_block: 0xEE00_0000,
            native_frees: Vec::new(),
            native_freed_strings: Vec::new(),
            fls_allocs: Vec::new(),
            fls_invocations: Vec::new(),
            tracked_code: Vec::new(),
            areas_added: Vec::new(),
            areas_removed: Vec::new(),
            native_modules: HashMap::new(),
            native_procs: HashMap::new(),
        }
    }

    /// Entry reasons recorded for `base`, in order.
    pub fn entry_reasons(&self, base: u64) -> Vec<EntryReason> {
        self.entry_calls
            .iter()
            .filter(|(b, _)| *b == base)
            .map(|(_, r)| *r)
            .collect()
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderHost for TestHost {
    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn system_root(&self) -> Option<PathBuf> {
        self.system_root.clone()
    }

    fn process_heap(&self) -> u64 {
        self.process_heap
    }

    fn preloaded_images(&self) -> Vec<PreloadedImage> {
        self.preloaded.clone()
    }

    fn invoke_entry(
        &mut self,
        loader: &mut Loader,
        _entry: u64,
        base: u64,
        reason: EntryReason,
    ) -> bool {
        self.entry_calls.push((base, reason));
        if let Some(hook) = self.entry_hook {
            hook(self, loader, base, reason);
        }
        let name = loader
            .modules()
            .find(|m| m.base == base)
            .map(|m| m.name.clone())
            .unwrap_or_default();
        !(reason == EntryReason::ProcessAttach && self.failing_entries.contains(&name))
    }

    fn invoke_fls_callback(&mut self, _loader: &mut Loader, callback: u64, argument: u64) {
        self.fls_invocations.push((callback, argument));
    }

    fn native_heap_alloc(&mut self, heap: u64, _flags: u32, size: u64) -> u64 {
        let block = self.next_native_block;
        self.next_native_block += (size + 0xF) & !0xF;
        self.native_allocs.insert(block, (heap, size));
        block
    }

    fn native_heap_realloc(&mut self, heap: u64, flags: u32, block: u64, size: u64) -> u64 {
        self.native_frees.push((heap, block));
        self.native_allocs.remove(&block);
        self.native_heap_alloc(heap, flags, size)
    }

    fn native_heap_free(&mut self, heap: u64, _flags: u32, block: u64) -> bool {
        self.native_frees.push((heap, block));
        block == 0 || self.native_allocs.remove(&block).is_some()
    }

    fn native_heap_size(&self, _heap: u64, _flags: u32, block: u64) -> u64 {
        self.native_allocs.get(&block).map_or(0, |(_, size)| *size)
    }

    fn native_free_string(&mut self, kind: StringKind, descriptor: u64) {
        self.native_freed_strings.push((kind, descriptor));
    }

    fn native_fls_alloc(&mut self, callback: u64) -> u32 {
        self.fls_allocs.push(callback);
        self.fls_allocs.len() as u32 - 1
    }

    fn native_get_module_handle(&self, name: &str) -> u64 {
        self.native_modules.get(&name.to_ascii_lowercase()).copied().unwrap_or(0)
    }

    fn native_get_proc_address(&self, base: u64, name: &str) -> u64 {
        self.native_procs
            .get(&(base, name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn area_added(&mut self, base: u64, size: u64) {
        self.areas_added.push((base, size));
    }

    fn area_removed(&mut self, base: u64, size: u64) {
        self.areas_removed.push((base, size));
    }

    fn mark_tracked_code(&mut self, addr: u64) {
        self.tracked_code.push(addr);
    }
}

/// The stock fake ntdll: exports every redirected Rtl/Ldr routine as plain
/// code so resolution succeeds before the redirection consult, plus a
/// handful of ordinary exports.
pub fn ntdll_image(base: u64) -> Vec<u8> {
    PeBuilder::new("ntdll.dll")
        .base(base)
        .export("LdrSetDllManifestProber", 0x1000)
        .export("RtlSetThreadPoolStartFunc", 0x1008)
        .export("RtlSetUnhandledExceptionFilter", 0x1010)
        .export("RtlAllocateHeap", 0x1018)
        .export("RtlReAllocateHeap", 0x1020)
        .export("RtlFreeHeap", 0x1028)
        .export("RtlSizeHeap", 0x1030)
        .export("RtlFreeUnicodeString", 0x1038)
        .export("RtlFreeAnsiString", 0x1040)
        .export("RtlFreeOemString", 0x1048)
        .export("RtlGetVersion", 0x1050)
        .export("NtClose", 0x1058)
        .build()
}

/// The stock fake kernel32 file: imports nothing, exports the redirected
/// trio as code plus `Sleep` and a forwarder into ntdll.
pub fn kernel32_image() -> Vec<u8> {
    PeBuilder::new("kernel32.dll")
        .base(0x1_8020_0000)
        .export("FlsAlloc", 0x1100)
        .export("GetModuleHandleA", 0x1108)
        .export("GetProcAddress", 0x1110)
        .export("Sleep", 0x1118)
        .forward("HeapAlloc", "NTDLL.RtlAllocateHeap")
        .forward("HeapFree", "NTDLL.RtlFreeHeap")
        .build()
}

/// A ready-made environment: temp dir with `system32/{ntdll,kernel32}.dll`
/// on disk, a loader whose space already holds the fake ntdll mapping, and
/// a host configured with the matching system root and preloaded images.
pub struct TestEnv {
    /// Keeps the temp tree alive for the test's duration.
    pub dir: tempfile::TempDir,
    /// The loader under test.
    pub loader: Loader,
    /// The scripted host.
    pub host: TestHost,
    /// Where the fake ntdll is "already mapped".
    pub ntdll_base: u64,
}

/// Base the fake ntdll is mapped at.
pub const NTDLL_BASE: u64 = 0x7FF8_0000_0000;

impl TestEnv {
    /// Builds the environment; `init` is left to the test.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let system32 = dir.path().join("system32");
        std::fs::create_dir_all(&system32).unwrap();
        std::fs::write(system32.join("ntdll.dll"), ntdll_image(NTDLL_BASE)).unwrap();
        std::fs::write(system32.join("kernel32.dll"), kernel32_image()).unwrap();

        let loader = Loader::new(privload::Arch::X64);
        loader
            .space()
            .map_at(
                NTDLL_BASE,
                image_region(NTDLL_BASE, &ntdll_image(NTDLL_BASE), "ntdll.dll"),
            )
            .unwrap();

        let mut host = TestHost::new();
        host.system_root = Some(dir.path().to_path_buf());
        host.preloaded = vec![PreloadedImage {
            name: "ntdll.dll".to_string(),
            base: NTDLL_BASE,
            size: IMAGE_SIZE as u64,
        }];

        Self {
            dir,
            loader,
            host,
            ntdll_base: NTDLL_BASE,
        }
    }

    /// Writes `bytes` as `{system32}/{name}`.
    pub fn add_system_dll(&self, name: &str, bytes: &[u8]) {
        std::fs::write(self.dir.path().join("system32").join(name), bytes).unwrap();
    }

    /// Writes `bytes` as `{root}/clients/{name}` and returns the full path.
    pub fn add_client_dll(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let clients = self.dir.path().join("clients");
        std::fs::create_dir_all(&clients).unwrap();
        let path = clients.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
