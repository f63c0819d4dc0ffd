//! Import redirection for transparency-critical system routines.
//!
//! Privately-loaded libraries share one ntdll with the host process, so any
//! routine that touches shared mutable state (the default process heap,
//! per-thread callback registration, loader queries) must not resolve to
//! the real export. The redirection table substitutes loader-provided
//! stand-ins for a **closed, statically declared** set of
//! `(donor module, symbol)` pairs; everything else resolves normally.
//!
//! Each substituted routine owns a unique address inside a small stub region
//! mapped at init. The import resolver writes that address into IATs, and
//! the execution engine recognizes it via [`Loader::shim_at`] and dispatches
//! to the matching `redirect_*` method instead of running guest code.
//!
//! # Key Components
//!
//! - [`Shim`] - The closed set of substituted routines
//! - [`lookup`] - `(donor, symbol)` to substitute mapping
//! - [`PrivateHeap`](heap::PrivateHeap) - Arena behind the heap substitutes
//! - [`MachineContext`](fls::MachineContext) - Register view for the FLS
//!   callback trampoline

pub(crate) mod fls;
pub(crate) mod heap;

pub use fls::MachineContext;
pub use heap::StringKind;

use crate::{loader::Loader, memory::PAGE_SIZE};

/// Spacing between stub addresses; one slot per substituted routine.
const SHIM_STRIDE: u64 = 16;

/// Size of the stub region (a single page fits the whole table).
pub(crate) const SHIM_REGION_SIZE: usize = PAGE_SIZE as usize;

/// The closed set of routines the loader substitutes.
///
/// The discriminant order fixes each shim's stub address, so the set is
/// append-only by convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shim {
    /// ntdll `LdrSetDllManifestProber`: succeed, ignore arguments.
    LdrSetDllManifestProber,
    /// ntdll `RtlSetThreadPoolStartFunc`: succeed, ignore arguments.
    RtlSetThreadPoolStartFunc,
    /// ntdll `RtlSetUnhandledExceptionFilter`: succeed, ignore arguments.
    RtlSetUnhandledExceptionFilter,
    /// ntdll `RtlAllocateHeap`: private heap for the default process heap.
    RtlAllocateHeap,
    /// ntdll `RtlReAllocateHeap`: private-heap split on block ownership.
    RtlReAllocateHeap,
    /// ntdll `RtlFreeHeap`: private-heap split on block ownership.
    RtlFreeHeap,
    /// ntdll `RtlSizeHeap`: private-heap split on block ownership.
    RtlSizeHeap,
    /// ntdll `RtlFreeUnicodeString`: free owned buffers privately.
    RtlFreeUnicodeString,
    /// ntdll `RtlFreeAnsiString`: free owned buffers privately.
    RtlFreeAnsiString,
    /// ntdll `RtlFreeOemString`: free owned buffers privately.
    RtlFreeOemString,
    /// kernel32 `FlsAlloc`: record private-library callbacks, then forward.
    FlsAlloc,
    /// kernel32 `GetModuleHandleA`: answer from the private registry first.
    GetModuleHandleA,
    /// kernel32 `GetProcAddress`: answer from the private registry first.
    GetProcAddress,
}

impl Shim {
    /// Every shim, in stub-address order.
    pub const ALL: [Shim; 13] = [
        Shim::LdrSetDllManifestProber,
        Shim::RtlSetThreadPoolStartFunc,
        Shim::RtlSetUnhandledExceptionFilter,
        Shim::RtlAllocateHeap,
        Shim::RtlReAllocateHeap,
        Shim::RtlFreeHeap,
        Shim::RtlSizeHeap,
        Shim::RtlFreeUnicodeString,
        Shim::RtlFreeAnsiString,
        Shim::RtlFreeOemString,
        Shim::FlsAlloc,
        Shim::GetModuleHandleA,
        Shim::GetProcAddress,
    ];

    /// Returns `true` for the set-and-forget stubs that just report success.
    ///
    /// kernel32 hands these routines its own callbacks during init; the
    /// private copy must not overwrite what the app's kernel32 installed.
    #[must_use]
    pub fn is_ignore_stub(self) -> bool {
        matches!(
            self,
            Shim::LdrSetDllManifestProber
                | Shim::RtlSetThreadPoolStartFunc
                | Shim::RtlSetUnhandledExceptionFilter
        )
    }

    fn index(self) -> u64 {
        Self::ALL.iter().position(|&s| s == self).unwrap_or(0) as u64
    }
}

/// ntdll redirections.
///
/// The heap routines are only taken over for `PEB.ProcessHeap`; heaps a
/// private library creates for itself are left alone. The string frees are
/// redirected so loader-owned buffers never reach the app's heap, even when
/// the matching allocation came in through `RtlAllocateHeap` directly.
static NTDLL_REDIRECTS: &[(&str, Shim)] = &[
    ("LdrSetDllManifestProber", Shim::LdrSetDllManifestProber),
    ("RtlSetThreadPoolStartFunc", Shim::RtlSetThreadPoolStartFunc),
    (
        "RtlSetUnhandledExceptionFilter",
        Shim::RtlSetUnhandledExceptionFilter,
    ),
    ("RtlAllocateHeap", Shim::RtlAllocateHeap),
    ("RtlReAllocateHeap", Shim::RtlReAllocateHeap),
    ("RtlFreeHeap", Shim::RtlFreeHeap),
    ("RtlSizeHeap", Shim::RtlSizeHeap),
    ("RtlFreeUnicodeString", Shim::RtlFreeUnicodeString),
    ("RtlFreeAnsiString", Shim::RtlFreeAnsiString),
    ("RtlFreeOemString", Shim::RtlFreeOemString),
];

/// kernel32 redirections: FLS callback interception plus the loader queries
/// msvcrt's init path uses to find `FlsAlloc` dynamically.
static KERNEL32_REDIRECTS: &[(&str, Shim)] = &[
    ("FlsAlloc", Shim::FlsAlloc),
    ("GetModuleHandleA", Shim::GetModuleHandleA),
    ("GetProcAddress", Shim::GetProcAddress),
];

/// Looks up a substitute for `symbol` as resolved against the module named
/// `donor` (short name, case-insensitive on both sides).
///
/// The donor is the *final* module of a forwarder chain, so e.g.
/// `kernel32!HeapAlloc` forwarded into ntdll still hits the ntdll table.
#[must_use]
pub fn lookup(donor: &str, symbol: &str) -> Option<Shim> {
    let table: &[(&str, Shim)] = if donor.eq_ignore_ascii_case("ntdll.dll") {
        NTDLL_REDIRECTS
    } else if donor.eq_ignore_ascii_case("kernel32.dll") {
        KERNEL32_REDIRECTS
    } else {
        return None;
    };
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(symbol))
        .map(|&(_, shim)| shim)
}

impl Loader {
    /// Stub address of a substituted routine.
    ///
    /// Valid after [`init`](Loader::init); this is the value IAT slots and
    /// the substitute `GetProcAddress` hand out.
    #[must_use]
    pub fn shim_address(&self, shim: Shim) -> u64 {
        debug_assert!(self.shim_base() != 0, "redirection stubs not mapped yet");
        self.shim_base() + shim.index() * SHIM_STRIDE
    }

    /// Recovers the shim owning `pc`, if `pc` is a stub address.
    ///
    /// The execution engine consults this before running code at `pc` and
    /// dispatches to the matching `redirect_*` method on a hit.
    #[must_use]
    pub fn shim_at(&self, pc: u64) -> Option<Shim> {
        let base = self.shim_base();
        if base == 0 || pc < base {
            return None;
        }
        let offset = pc - base;
        if offset % SHIM_STRIDE != 0 {
            return None;
        }
        Shim::ALL.get((offset / SHIM_STRIDE) as usize).copied()
    }
}
