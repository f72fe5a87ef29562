//! Process-wide fault handler.
//!
//! SIGSEGV and SIGBUS are routed here once per process. Each registered
//! stack guard gets to claim the fault first; anything unclaimed is passed to
//! whatever handler was installed before ours, or to the default action.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::core::jit::stack_guard::GuardShared;

const MAX_GUARDS: usize = 64;
const ALT_STACK_SIZE: usize = 64 * 1024;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicPtr<GuardShared> = AtomicPtr::new(ptr::null_mut());
static GUARDS: [AtomicPtr<GuardShared>; MAX_GUARDS] = [EMPTY_SLOT; MAX_GUARDS];

/// Handlers currently reading each slot. A slot's guard is only released
/// once its count drops to zero.
#[allow(clippy::declare_interior_mutable_const)]
const NO_READERS: AtomicUsize = AtomicUsize::new(0);
static READERS: [AtomicUsize; MAX_GUARDS] = [NO_READERS; MAX_GUARDS];

struct PreviousHandlers {
    segv: libc::sigaction,
    bus: libc::sigaction,
}

static PREVIOUS: OnceLock<Result<PreviousHandlers, i32>> = OnceLock::new();

/// Installs the handler for SIGSEGV and SIGBUS. Idempotent.
pub fn install_handler() -> io::Result<()> {
    let result = PREVIOUS.get_or_init(|| {
        // SAFETY: the sigaction structs are zero-initialized plain data and the
        // handler has the SA_SIGINFO signature.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_signal as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);

            let mut segv: libc::sigaction = std::mem::zeroed();
            let mut bus: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGSEGV, &action, &mut segv) != 0 {
                return Err(io::Error::last_os_error().raw_os_error().unwrap_or(0));
            }
            if libc::sigaction(libc::SIGBUS, &action, &mut bus) != 0 {
                libc::sigaction(libc::SIGSEGV, &segv, ptr::null_mut());
                return Err(io::Error::last_os_error().raw_os_error().unwrap_or(0));
            }
            Ok(PreviousHandlers { segv, bus })
        }
    });
    match result {
        Ok(_) => Ok(()),
        Err(code) => Err(io::Error::from_raw_os_error(*code)),
    }
}

/// Gives the calling thread an alternate signal stack if it has none, so the
/// handler can run while the thread's own stack is inside the guard.
pub fn ensure_alt_stack() {
    // SAFETY: querying and installing a sigaltstack for the calling thread;
    // the new stack is a fresh mapping that is never unmapped.
    unsafe {
        let mut current: libc::stack_t = std::mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut current) != 0 {
            return;
        }
        if current.ss_flags & libc::SS_DISABLE == 0 {
            return;
        }
        let mem = libc::mmap(
            ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );
        if mem == libc::MAP_FAILED {
            return;
        }
        let stack = libc::stack_t {
            ss_sp: mem,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        libc::sigaltstack(&stack, ptr::null_mut());
    }
}

/// Makes `shared` visible to the handler. Returns `false` if every slot is taken.
pub(crate) fn register(shared: &Arc<GuardShared>) -> bool {
    let raw = Arc::into_raw(shared.clone()) as *mut GuardShared;
    for slot in GUARDS.iter() {
        if slot
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
    }
    // SAFETY: `raw` came from Arc::into_raw above and was never published.
    unsafe { drop(Arc::from_raw(raw)) };
    false
}

pub(crate) fn unregister(shared: &Arc<GuardShared>) {
    let raw = Arc::as_ptr(shared) as *mut GuardShared;
    for (slot, readers) in GUARDS.iter().zip(READERS.iter()) {
        if slot
            .compare_exchange(raw, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // A handler on another thread may still hold the pointer it loaded.
            while readers.load(Ordering::SeqCst) != 0 {
                std::hint::spin_loop();
            }
            // SAFETY: the slot held the reference taken in `register`, and no
            // handler can reach it any more.
            unsafe { drop(Arc::from_raw(raw)) };
            return;
        }
    }
}

extern "C" fn handle_signal(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    if !info.is_null() {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        let addr = unsafe { (*info).si_addr() } as usize;
        for (slot, readers) in GUARDS.iter().zip(READERS.iter()) {
            readers.fetch_add(1, Ordering::SeqCst);
            let guard = slot.load(Ordering::SeqCst);
            // SAFETY: `unregister` waits for the reader count before freeing.
            let claimed = !guard.is_null() && unsafe { (*guard).handle_fault(addr) };
            readers.fetch_sub(1, Ordering::SeqCst);
            if claimed {
                return;
            }
        }
    }
    chain(sig, info, ctx);
}

fn chain(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let previous = match PREVIOUS.get() {
        Some(Ok(p)) => {
            if sig == libc::SIGBUS {
                p.bus
            } else {
                p.segv
            }
        }
        _ => return restore_default(sig),
    };
    let handler = previous.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        return restore_default(sig);
    }
    // SAFETY: `handler` was installed by someone else with the signature its
    // flags declare.
    unsafe {
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(handler);
            f(sig, info, ctx);
        } else {
            let f: extern "C" fn(libc::c_int) = std::mem::transmute(handler);
            f(sig);
        }
    }
}

/// Resets the default action; the faulting instruction re-executes and the
/// process dies with the original signal.
fn restore_default(sig: libc::c_int) {
    // SAFETY: resetting a signal disposition is async-signal-safe.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jit::stack_guard::StackGuard;
    use crate::system::devices::TimingHandle;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unregister_waits_for_running_handler() {
        let guard = StackGuard::new(TimingHandle::new());
        let shared = Arc::clone(guard.shared());
        assert!(register(&shared));
        let raw = Arc::as_ptr(&shared) as *mut GuardShared;
        let idx = GUARDS
            .iter()
            .position(|slot| slot.load(Ordering::SeqCst) == raw)
            .unwrap();

        // Stand in for a handler that has loaded the slot.
        READERS[idx].fetch_add(1, Ordering::SeqCst);
        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let shared = Arc::clone(&shared);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                unregister(&shared);
                done.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        READERS[idx].fetch_sub(1, Ordering::SeqCst);
        worker.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        // The slot's reference is gone; only the guard and this test hold one.
        assert_eq!(Arc::strong_count(&shared), 2);
    }
}
