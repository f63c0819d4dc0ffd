//! Import resolution: descriptor walk, forwarder chains, redirection, and
//! the IAT protection dance.
//!
//! For each import descriptor the resolver brings the named module in
//! (bumping its reference count when it is already present), walks the
//! lookup table and the IAT in lockstep, resolves every named import
//! (chasing forwarder chains through as many modules as they point at), and
//! writes the winning address into the IAT. The redirection table is
//! consulted against the *final* module and symbol of a chain, so a
//! forwarder into ntdll is redirected exactly like a direct ntdll import.

use crate::{
    host::LoaderHost,
    loader::{paths, Loader},
    memory::{page_start, MemoryProtection, PAGE_SIZE},
    pe::{
        exports::{self, Export},
        imports, ImageHeaders, DIRECTORY_DELAY_IMPORT, DIRECTORY_TLS,
    },
    redirect, Error, Result,
};

/// Bound on forwarder-chain length; anything longer is a cycle or an attack.
const FORWARD_CHAIN_MAX: usize = 8;

impl Loader {
    /// Resolves and writes every import of the module at `base`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsupported`] for ordinal imports, TLS directories, and
    ///   delay-load directories, the declared non-goals that fail loudly
    /// - [`Error::DependencyNotFound`] when a dependency cannot be brought in
    /// - [`Error::SymbolNotFound`] when an import is missing from its module
    /// - Read failures from unreadable (partially mapped) tables; if no
    ///   entry has been written yet the module is untouched, otherwise the
    ///   caller unwinds it
    pub(super) fn process_imports(&mut self, host: &mut dyn LoaderHost, base: u64) -> Result<()> {
        let headers = ImageHeaders::read(&self.space, base)?;
        if headers.directory(DIRECTORY_TLS).is_present() {
            return Err(Error::Unsupported("TLS directory"));
        }
        if headers.directory(DIRECTORY_DELAY_IMPORT).is_present() {
            return Err(Error::Unsupported("delay-load imports"));
        }
        let is_64 = headers.is_64;

        let descriptors = imports::import_descriptors(&self.space, base)?;
        if descriptors.is_empty() {
            log::debug!("{base:#x} has no imports");
            return Ok(());
        }

        for descriptor in descriptors {
            let import_name = self
                .space
                .read_c_string(base + u64::from(descriptor.name))?;
            if descriptor.is_bound_new_style() {
                log::debug!("{import_name} descriptor has new-style bound imports; ignoring");
            } else if descriptor.is_bound() {
                log::debug!("{import_name} descriptor has old-style bound imports; ignoring");
            }

            let import_base = match self.registry.lookup_by_name_mut(&import_name) {
                Some(module) => {
                    module.ref_count += 1;
                    module.base
                }
                None => self.locate_and_load(host, &import_name, Some(base))?,
            };
            log::debug!("{base:#x} imports from {import_name}");

            // Walk the lookup table first; nothing is written until every
            // name of this descriptor has resolved.
            let mut named_slots = Vec::new();
            let mut lookup = base + u64::from(descriptor.original_first_thunk);
            let mut slot = base + u64::from(descriptor.first_thunk);
            loop {
                let entry = self.space.read_ptr(lookup, is_64)?;
                if entry == 0 {
                    break;
                }
                if entry & imports::ordinal_flag(is_64) != 0 {
                    return Err(Error::Unsupported("import by ordinal"));
                }
                // RVA of IMAGE_IMPORT_BY_NAME; the name follows a u16 hint
                let name_rva = entry & !imports::ordinal_flag(is_64);
                let symbol = self.space.read_c_string(base + name_rva + 2)?;
                named_slots.push((slot, symbol));
                lookup += imports::thunk_size(is_64);
                slot += imports::thunk_size(is_64);
            }

            let mut resolved = Vec::with_capacity(named_slots.len());
            for (slot, symbol) in named_slots {
                let destination = self.resolve_import(host, base, import_base, &symbol)?;
                log::debug!("\timport {symbol} => {destination:#x}");
                resolved.push((slot, destination));
            }

            self.write_iat_slots(&resolved, is_64)?;
        }
        Ok(())
    }

    /// Resolves one named import against `import_base`, chasing forwarders
    /// and consulting the redirection table on the final module.
    fn resolve_import(
        &mut self,
        host: &mut dyn LoaderHost,
        importer_base: u64,
        import_base: u64,
        symbol: &str,
    ) -> Result<u64> {
        let mut module_base = import_base;
        let mut symbol = symbol.to_string();

        for _ in 0..FORWARD_CHAIN_MAX {
            let module_name = self
                .registry
                .lookup_by_base(module_base)
                .map(|m| m.name.clone())
                .unwrap_or_default();
            match exports::lookup(&self.space, module_base, &symbol)? {
                Some(Export::Code(address)) => {
                    if let Some(shim) = redirect::lookup(&module_name, &symbol) {
                        log::debug!("\tredirecting {module_name}!{symbol}");
                        return Ok(self.shim_address(shim));
                    }
                    return Ok(address);
                }
                Some(Export::Forwarder(forwarder)) => {
                    let (target_module, target_symbol) = parse_forwarder(&forwarder)?;
                    log::debug!("\tforwarder {forwarder} => {target_module} {target_symbol}");
                    module_base = match self.registry.lookup_by_name(&target_module) {
                        // Already an import somewhere; no extra reference for
                        // each forwarder hop
                        Some(module) => module.base,
                        None => self.locate_and_load(host, &target_module, Some(importer_base))?,
                    };
                    symbol = target_symbol;
                }
                None => {
                    log::debug!("\timport {symbol} not found in {module_name}");
                    return Err(Error::SymbolNotFound {
                        module: module_name,
                        symbol,
                    });
                }
            }
        }
        Err(Error::RecursionLimit(FORWARD_CHAIN_MAX))
    }

    /// Locates `name` on the search paths and loads the first candidate that
    /// loads successfully.
    pub(super) fn locate_and_load(
        &mut self,
        host: &mut dyn LoaderHost,
        name: &str,
        dependent: Option<u64>,
    ) -> Result<u64> {
        let candidates = self.paths.candidates(host, name);
        for candidate in candidates {
            match self.privload_load(host, &candidate, dependent) {
                Ok(base) => return Ok(base),
                Err(e) => {
                    log::debug!("candidate {} failed: {e}", candidate.display());
                }
            }
        }
        log::debug!("unable to locate {name}");
        Err(Error::DependencyNotFound(name.to_string()))
    }

    /// Writes resolved addresses into the IAT, switching each touched page
    /// to read-write and restoring its previous protection afterwards. The
    /// dance repeats whenever consecutive slots cross a page boundary.
    fn write_iat_slots(&self, slots: &[(u64, u64)], is_64: bool) -> Result<()> {
        let Some(&(first, _)) = slots.first() else {
            return Ok(());
        };
        let mut page = page_start(first);
        let mut original = self.open_iat_page(page)?;
        for &(slot, value) in slots {
            if page_start(slot) != page {
                self.restore_iat_page(page, original);
                page = page_start(slot);
                original = self.open_iat_page(page)?;
            }
            if let Err(e) = self.space.write_ptr(slot, value, is_64) {
                self.restore_iat_page(page, original);
                return Err(e);
            }
        }
        self.restore_iat_page(page, original);
        Ok(())
    }

    fn open_iat_page(&self, page: u64) -> Result<MemoryProtection> {
        self.space
            .set_protection(page, PAGE_SIZE as usize, MemoryProtection::READ_WRITE)
            .ok_or(Error::InvalidAddress {
                address: page,
                reason: "IAT page not mapped".to_string(),
            })
    }

    fn restore_iat_page(&self, page: u64, protection: MemoryProtection) {
        let _ = self
            .space
            .set_protection(page, PAGE_SIZE as usize, protection);
    }

    /// Substitute `GetModuleHandleA`: names in the private registry answer
    /// with the private base; everything else forwards.
    #[must_use]
    pub fn redirect_get_module_handle(&self, host: &dyn LoaderHost, name: &str) -> u64 {
        if let Some(module) = self.registry.lookup_by_name(name) {
            log::debug!("GetModuleHandleA {name} => {:#x}", module.base);
            return module.base;
        }
        host.native_get_module_handle(name)
    }

    /// Substitute `GetProcAddress`.
    ///
    /// For a private module the redirection table is consulted first, then
    /// the exports. Forwarded exports come back null here; only the import
    /// resolver chases chains. Unknown bases forward to the native routine.
    #[must_use]
    pub fn redirect_get_proc_address(&self, host: &dyn LoaderHost, base: u64, name: &str) -> u64 {
        let Some(module) = self.registry.lookup_by_base(base) else {
            return host.native_get_proc_address(base, name);
        };
        if let Some(shim) = redirect::lookup(&module.name, name) {
            return self.shim_address(shim);
        }
        match exports::lookup(&self.space, base, name) {
            Ok(Some(Export::Code(address))) => {
                log::debug!("GetProcAddress {name} => {address:#x}");
                address
            }
            Ok(Some(Export::Forwarder(_))) | Ok(None) => 0,
            Err(e) => {
                log::debug!("GetProcAddress {name} failed: {e}");
                0
            }
        }
    }
}

/// Splits `TargetDll.TargetSymbol` and appends `.dll` to the module portion.
///
/// # Errors
///
/// [`Error::Malformed`] for strings without both halves;
/// [`Error::Unsupported`] for `#ordinal` targets (ordinal linkage is a
/// non-goal everywhere, forwarders included).
fn parse_forwarder(forwarder: &str) -> Result<(String, String)> {
    let Some((module, symbol)) = forwarder.split_once('.') else {
        return Err(malformed_error!("forwarder string {} has no dot", forwarder));
    };
    if module.is_empty() || symbol.is_empty() {
        return Err(malformed_error!("forwarder string {} is incomplete", forwarder));
    }
    if symbol.starts_with('#') {
        return Err(Error::Unsupported("forwarder by ordinal"));
    }
    if module.len() + ".dll".len() > paths::MAX_FORWARDER_MODULE {
        return Err(Error::Unsupported("forwarder module name too long"));
    }
    Ok((format!("{module}.dll"), symbol.to_string()))
}
