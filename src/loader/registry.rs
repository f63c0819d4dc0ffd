//! Registry of privately-loaded modules.
//!
//! A small, dependency-ordered list plus an address-range index. The list is
//! kept in **reverse-dependency order**: a module is inserted immediately
//! after the module that imports it, so walking from the head and unloading
//! as you go always releases dependents before their dependencies. Lookups
//! are linear; a handful of private modules is the expected population, so
//! nothing here is worth indexing beyond the range map.

use std::collections::BTreeMap;

/// One privately-loaded (or externally-referenced) module.
#[derive(Clone, Debug)]
pub struct PrivateModule {
    /// Load address of the mapped image.
    pub base: u64,
    /// Span of the mapping in bytes.
    pub size: u64,
    /// Short file name (e.g. `"kernel32.dll"`), compared case-insensitively.
    ///
    /// Copied out of the image's export directory at insert time (file name
    /// when the image exports nothing).
    pub name: String,
    /// Importing-edge count plus explicit external holds.
    pub ref_count: u32,
    /// `true` for modules mapped by the host loader and merely referenced
    /// here; these are never entered, relocated, or unmapped.
    pub externally_loaded: bool,
}

/// Dependency-ordered module list with an address-range index.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    /// Reverse-dependency order: dependents precede their dependencies.
    modules: Vec<PrivateModule>,
    /// Range index over non-externally-loaded modules: base -> end.
    areas: BTreeMap<u64, u64>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a module record.
    ///
    /// With `after == None` the module is pushed at the head. Otherwise it is
    /// placed immediately after the module based at `after`, its importer,
    /// preserving the forward-can-unload ordering. An unknown `after` falls
    /// back to a head insert.
    pub fn insert_after(&mut self, after: Option<u64>, module: PrivateModule) {
        let position = after
            .and_then(|base| self.modules.iter().position(|m| m.base == base))
            .map_or(0, |i| i + 1);
        self.modules.insert(position, module);
    }

    /// Case-insensitive lookup by short name.
    #[must_use]
    pub fn lookup_by_name(&self, name: &str) -> Option<&PrivateModule> {
        self.modules.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive mutable lookup by short name.
    pub fn lookup_by_name_mut(&mut self, name: &str) -> Option<&mut PrivateModule> {
        self.modules
            .iter_mut()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// Exact-base lookup.
    #[must_use]
    pub fn lookup_by_base(&self, base: u64) -> Option<&PrivateModule> {
        self.modules.iter().find(|m| m.base == base)
    }

    /// Exact-base mutable lookup.
    pub fn lookup_by_base_mut(&mut self, base: u64) -> Option<&mut PrivateModule> {
        self.modules.iter_mut().find(|m| m.base == base)
    }

    /// Unlinks and returns the module based at `base`.
    ///
    /// The area index is *not* touched; unload removes the range separately,
    /// mirroring the separate lifetimes of list membership and mapping.
    pub fn remove(&mut self, base: u64) -> Option<PrivateModule> {
        let position = self.modules.iter().position(|m| m.base == base)?;
        Some(self.modules.remove(position))
    }

    /// Base of the list head (the most dependent module), if any.
    #[must_use]
    pub fn head_base(&self) -> Option<u64> {
        self.modules.first().map(|m| m.base)
    }

    /// Iterates modules in forward (reverse-dependency) order.
    pub fn iter(&self) -> impl Iterator<Item = &PrivateModule> {
        self.modules.iter()
    }

    /// Number of modules in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` when no modules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Adds a module's range to the area index.
    ///
    /// Ranges must be identical or disjoint; the address space already
    /// rejects overlapping mappings, so a violation here is a logic error.
    pub fn add_area(&mut self, base: u64, size: u64) {
        let end = base + size;
        debug_assert!(
            self.areas
                .iter()
                .all(|(&b, &e)| e <= base || b >= end || (b == base && e == end)),
            "partial overlap in area index"
        );
        self.areas.insert(base, end);
    }

    /// Removes a module's range from the area index.
    pub fn remove_area(&mut self, base: u64) {
        self.areas.remove(&base);
    }

    /// Range-containment query: does `addr` fall inside any indexed module?
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.areas
            .range(..=addr)
            .next_back()
            .is_some_and(|(_, &end)| addr < end)
    }
}
