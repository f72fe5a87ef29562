//! Stack-Fault Guard.
//!
//! With the branch-and-link optimization on, every guest `bl` recurses on
//! the host stack, so a guest that calls deeper than it returns would
//! overflow it. The guard read-protects a window near the bottom of the CPU
//! thread's stack; touching it raises a fault that [`StackGuard::handle_fault`]
//! turns into a permanent switch back to plain dispatching.
//!
//! The fault path runs in signal context. It only flips atomics, asks core
//! timing to end the slice, and restores page access; the block cache flush
//! it owes is done later by the CPU thread.
//!
//! ```text
//! Disabled --enable()--> Armed --fault--> Tripped --cleanup--> Disabled
//!                          |
//!                          +--shutdown--> Disabled
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::jit::code_buffer::page_size;
use crate::core::jit::fault;
use crate::system::devices::TimingHandle;

/// Stack that must remain below the guard for the rest of the emulator.
pub const MIN_UNSAFE_STACK_SIZE: usize = 192 * 1024;
/// Stack reserved below the guard for the fault handler and cleanup.
pub const SAFE_STACK_SIZE: usize = 256 * 1024;
pub const GUARD_SIZE: usize = 64 * 1024;
pub const GUARD_OFFSET: usize = SAFE_STACK_SIZE - GUARD_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardState {
    Disabled,
    Armed,
    /// Fault handled; the cache flush is still owed.
    Tripped,
}

/// State shared with the fault handler. Atomics only.
pub(crate) struct GuardShared {
    enabled: AtomicBool,
    cleanup_owed: AtomicBool,
    owner: AtomicUsize,
    guard_addr: AtomicUsize,
    guard_len: AtomicUsize,
    faults: AtomicU64,
    timing: TimingHandle,
}

#[inline]
fn current_thread_id() -> usize {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Returns `(base, size)` of the calling thread's stack.
#[cfg(target_os = "linux")]
fn current_thread_stack() -> Option<(usize, usize)> {
    // SAFETY: the attribute object is initialized by pthread_getattr_np and
    // destroyed before returning; out-pointers reference locals.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        Some((addr as usize, size))
    }
}

#[cfg(not(target_os = "linux"))]
fn current_thread_stack() -> Option<(usize, usize)> {
    None
}

fn set_protection(addr: usize, len: usize, prot: libc::c_int) -> bool {
    // SAFETY: the range is page aligned and lies within the calling thread's
    // stack mapping; only the protection bits change.
    unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) == 0 }
}

impl GuardShared {
    fn unprotect(&self) {
        let addr = self.guard_addr.swap(0, Ordering::AcqRel);
        let len = self.guard_len.swap(0, Ordering::AcqRel);
        if addr != 0 {
            set_protection(addr, len, libc::PROT_READ | libc::PROT_WRITE);
        }
    }

    /// Signal-context entry point.
    pub(crate) fn handle_fault(&self, addr: usize) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        if self.owner.load(Ordering::Acquire) != current_thread_id() {
            return false;
        }
        let guard = self.guard_addr.load(Ordering::Acquire);
        let len = self.guard_len.load(Ordering::Acquire);
        if guard == 0 || addr < guard || addr - guard >= len {
            return false;
        }
        self.unprotect();
        self.enabled.store(false, Ordering::Release);
        self.timing.force_exception_check(0);
        self.cleanup_owed.store(true, Ordering::Release);
        self.faults.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Per-engine guard over the CPU thread's stack.
pub struct StackGuard {
    shared: Arc<GuardShared>,
    registered: bool,
}

impl StackGuard {
    pub fn new(timing: TimingHandle) -> Self {
        Self {
            shared: Arc::new(GuardShared {
                enabled: AtomicBool::new(false),
                cleanup_owed: AtomicBool::new(false),
                owner: AtomicUsize::new(0),
                guard_addr: AtomicUsize::new(0),
                guard_len: AtomicUsize::new(0),
                faults: AtomicU64::new(0),
                timing,
            }),
            registered: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<GuardShared> {
        &self.shared
    }

    pub fn state(&self) -> GuardState {
        if self.shared.cleanup_owed.load(Ordering::Acquire) {
            GuardState::Tripped
        } else if self.is_enabled() {
            GuardState::Armed
        } else {
            GuardState::Disabled
        }
    }

    /// Whether the branch-and-link optimization may be used.
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn cleanup_owed(&self) -> bool {
        self.shared.cleanup_owed.load(Ordering::Acquire)
    }

    pub fn fault_count(&self) -> u64 {
        self.shared.faults.load(Ordering::Relaxed)
    }

    /// Protected window, if one is installed.
    pub fn guard_range(&self) -> Option<(usize, usize)> {
        let addr = self.shared.guard_addr.load(Ordering::Acquire);
        (addr != 0).then(|| (addr, self.shared.guard_len.load(Ordering::Acquire)))
    }

    /// Decides whether the optimization can be used at all and clears any
    /// pending cleanup.
    pub fn init_blr_optimization(&mut self, block_linking: bool, fastmem: bool, debugging: bool) {
        let enabled = block_linking && fastmem && !debugging;
        self.shared.enabled.store(enabled, Ordering::Release);
        self.shared.cleanup_owed.store(false, Ordering::Release);
    }

    /// Installs the guard on the calling thread's stack. Leaves the
    /// optimization off if the stack cannot host it.
    pub fn protect_stack(&mut self) {
        if !self.is_enabled() {
            return;
        }
        match self.try_protect() {
            Ok(()) => {}
            Err(reason) => {
                warn!(reason, "branch-and-link optimization disabled");
                self.shared.enabled.store(false, Ordering::Release);
            }
        }
    }

    fn try_protect(&mut self) -> Result<(), &'static str> {
        let (base, size) = current_thread_stack().ok_or("failed to get stack base")?;
        let marker = 0u8;
        let sp = std::hint::black_box(&marker) as *const u8 as usize;
        if sp < base || sp >= base + size {
            return Err("failed to get correct stack base");
        }

        let guard = align_up(base + GUARD_OFFSET, page_size());
        if guard >= sp || sp - guard < GUARD_SIZE + MIN_UNSAFE_STACK_SIZE {
            return Err("stack is too small");
        }

        fault::install_handler().map_err(|_| "failed to install fault handler")?;
        fault::ensure_alt_stack();
        if !self.registered {
            self.registered = fault::register(&self.shared);
            if !self.registered {
                return Err("too many stack guards");
            }
        }

        if !set_protection(guard, GUARD_SIZE, libc::PROT_NONE) {
            return Err("failed to protect stack guard");
        }
        self.shared.owner.store(current_thread_id(), Ordering::Release);
        self.shared.guard_len.store(GUARD_SIZE, Ordering::Release);
        self.shared.guard_addr.store(guard, Ordering::Release);
        debug!(
            guard = format_args!("{:#x}", guard),
            stack_base = format_args!("{:#x}", base),
            stack_size = size,
            "stack guard armed"
        );
        Ok(())
    }

    /// Restores access to the guard window.
    pub fn unprotect_stack(&mut self) {
        self.shared.unprotect();
    }

    /// [`Self::init_blr_optimization`] followed by [`Self::protect_stack`].
    pub fn enable(&mut self, block_linking: bool, fastmem: bool, debugging: bool) -> GuardState {
        self.init_blr_optimization(block_linking, fastmem, debugging);
        self.protect_stack();
        self.state()
    }

    /// Turns the optimization off and removes the guard.
    pub fn disable(&mut self) {
        self.shared.enabled.store(false, Ordering::Release);
        self.unprotect_stack();
    }

    /// Offers a fault at `addr` to the guard. Returns `true` if it was the
    /// guard's fault and has been handled.
    pub fn handle_fault(&self, addr: usize) -> bool {
        self.shared.handle_fault(addr)
    }

    /// Claims the owed cleanup. Returns `true` exactly once per fault.
    pub fn take_cleanup(&self) -> bool {
        self.shared.cleanup_owed.swap(false, Ordering::AcqRel)
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        self.shared.unprotect();
        if self.registered {
            fault::unregister(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_sits_above_the_safe_area() {
        assert_eq!(GUARD_OFFSET + GUARD_SIZE, SAFE_STACK_SIZE);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
    }

    #[test]
    fn requirements_gate_the_optimization() {
        let mut guard = StackGuard::new(TimingHandle::new());
        guard.init_blr_optimization(true, false, false);
        assert_eq!(guard.state(), GuardState::Disabled);
        guard.init_blr_optimization(true, true, true);
        assert_eq!(guard.state(), GuardState::Disabled);
        guard.init_blr_optimization(true, true, false);
        assert_eq!(guard.state(), GuardState::Armed);
    }
}
