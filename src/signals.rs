//! signal-safe transaction barrier
//!
//! the bracket backend spans a begin/end ioctl window during which a
//! default-action SIGINT/SIGTERM would leave a half-applied transaction
//! visible. signal disposition is process-scoped, so this state is too:
//! handlers are installed once (first mount wins) and record the signal;
//! delivery is deferred until no bracket transaction is running, at which
//! point the process exits in an orderly fashion.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::warn;

static INSTALLED: AtomicBool = AtomicBool::new(false);
// read from the signal handler; only atomics are safe there
static TRANS_RUNNING: AtomicU32 = AtomicU32::new(0);
static SIG_PENDING: AtomicI32 = AtomicI32::new(0);

static BARRIER_LOCK: Mutex<()> = Mutex::new(());
static BARRIER_COND: Condvar = Condvar::new();

extern "C" fn handle_signal(signal: c_int) {
    SIG_PENDING.store(signal, Ordering::SeqCst);
    if TRANS_RUNNING.load(Ordering::SeqCst) == 0 {
        unsafe { libc::_exit(0) };
    }
    // a transaction is in flight; leave() will exit once it finishes
}

/// install the deferral handlers for SIGINT and SIGTERM
///
/// idempotent; only the first call installs. both signals are blocked in
/// the handler's own mask so the two cannot interleave.
pub fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    let action = SigAction::new(SigHandler::Handler(handle_signal), SaFlags::empty(), mask);
    unsafe {
        sigaction(Signal::SIGINT, &action).expect("sigaction(SIGINT)");
        sigaction(Signal::SIGTERM, &action).expect("sigaction(SIGTERM)");
    }
}

/// enter a bracket transaction window
///
/// once a fatal signal is pending, no new window opens: callers park here
/// until the in-flight windows drain and the process exits.
pub fn enter() {
    let mut guard = BARRIER_LOCK.lock().unwrap();
    while TRANS_RUNNING.load(Ordering::SeqCst) > 0 && SIG_PENDING.load(Ordering::SeqCst) != 0 {
        guard = BARRIER_COND.wait(guard).unwrap();
    }
    TRANS_RUNNING.fetch_add(1, Ordering::SeqCst);
}

/// leave a bracket transaction window, honoring any deferred signal
pub fn leave() {
    let _guard = BARRIER_LOCK.lock().unwrap();
    let prev = TRANS_RUNNING.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev > 0, "barrier leave without enter");
    if prev == 1 {
        let signal = SIG_PENDING.load(Ordering::SeqCst);
        if signal != 0 {
            warn!(signal, "honoring deferred signal, stopping");
            unsafe { libc::_exit(0) };
        }
        BARRIER_COND.notify_all();
    }
}

/// number of bracket windows currently open
pub fn running() -> u32 {
    TRANS_RUNNING.load(Ordering::SeqCst)
}

/// the signal currently deferred, if any
pub fn pending() -> Option<i32> {
    match SIG_PENDING.load(Ordering::SeqCst) {
        0 => None,
        s => Some(s),
    }
}
