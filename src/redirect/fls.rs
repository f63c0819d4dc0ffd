//! FLS callback interception and the native-dispatch trampoline.
//!
//! A private library registering a fiber-local-storage callback hands the
//! host a pointer into private code. When the process later drives that
//! callback (thread exit, `FlsFree`), control would land in private-library
//! code the runtime believes is application code. The `FlsAlloc` substitute
//! records such callbacks; the trampoline recognizes them at dispatch time,
//! runs the callback natively, and steers execution back to the caller.
//!
//! Entries are never removed: the callback invocation does not say whether
//! it was thread exit or an explicit free, so the list only grows. That
//! leaks one entry per registered callback over the process lifetime.

use crate::{host::LoaderHost, loader::Loader};

/// Minimal machine-context view the trampoline needs from the execution
/// engine: where the stack is, what the argument register holds, and where
/// execution should continue.
#[derive(Clone, Copy, Debug)]
pub struct MachineContext {
    /// Stack pointer at the would-be call into the callback.
    pub stack_pointer: u64,
    /// First-argument register (`rcx` on x64); unused for x86 dispatch.
    pub arg_register: u64,
    /// Where the engine resumes after the trampoline handles the call.
    pub next_pc: u64,
}

/// Registered FLS callbacks originating from private libraries.
///
/// The list head outlives every entry; entries are append-only.
#[derive(Debug, Default)]
pub(crate) struct FlsCallbacks {
    callbacks: Vec<u64>,
}

impl FlsCallbacks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, callback: u64) {
        self.callbacks.push(callback);
    }

    pub(crate) fn is_registered(&self, pc: u64) -> bool {
        self.callbacks.contains(&pc)
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub(crate) fn clear(&mut self) {
        self.callbacks.clear();
    }
}

impl Loader {
    /// Substitute `FlsAlloc`.
    ///
    /// When the callback lies inside a private library, it is recorded for
    /// trampoline dispatch and reported as tracked code; the slot allocation
    /// itself always goes to the native routine; private libraries hold
    /// real slot indices.
    pub fn redirect_fls_alloc(&mut self, host: &mut dyn LoaderHost, callback: u64) -> u32 {
        if callback != 0 && self.contains(callback) {
            self.fls_mut().register(callback);
            host.mark_tracked_code(callback);
            log::debug!("recorded private FLS callback {callback:#x}");
        }
        host.native_fls_alloc(callback)
    }

    /// The FLS callback trampoline, consulted by the execution engine before
    /// running code at `pc`.
    ///
    /// On a match the callback runs natively with its single argument (the
    /// argument register on x64, the stack slot above the return address on
    /// x86), the stack is adjusted for the callee-pops convention, and
    /// `ctx.next_pc` is pointed at the saved return address. Returns `false`
    /// ("not handled", engine proceeds normally) for unknown `pc` values
    /// or when the stack cannot be read safely.
    pub fn handle_private_cb(
        &mut self,
        host: &mut dyn LoaderHost,
        ctx: &mut MachineContext,
        pc: u64,
    ) -> bool {
        if !self.fls().is_registered(pc) {
            return false;
        }
        let is_64 = self.arch().is_64();
        let ptr_size = if is_64 { 8u64 } else { 4 };

        let Ok(return_address) = self.space().read_ptr(ctx.stack_pointer, is_64) else {
            log::warn!("FLS trampoline: unreadable stack at {:#x}", ctx.stack_pointer);
            return false;
        };
        let argument = if is_64 {
            ctx.arg_register
        } else {
            match self.space().read_ptr(ctx.stack_pointer + ptr_size, is_64) {
                Ok(arg) => arg,
                Err(_) => {
                    log::warn!("FLS trampoline: unreadable argument slot");
                    return false;
                }
            }
        };

        log::debug!("FLS trampoline: running {pc:#x}, resuming at {return_address:#x}");
        host.invoke_fls_callback(self, pc, argument);

        // stdcall: the callee pops its return address, and on x86 the
        // argument slot too
        ctx.stack_pointer += ptr_size + if is_64 { 0 } else { ptr_size };
        ctx.next_pc = return_address;
        true
    }
}
