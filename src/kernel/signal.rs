//! Async-signal-safe shutdown handling for the CLI process.
//!
//! The handler only stores atomics. The supervisor watchdog polls
//! `shutdown_requested` and tears the sandbox down from normal context.
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install SIGINT and SIGTERM handlers. Call before any thread is spawned.
pub fn install_shutdown_handlers() -> Result<(), String> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only touches atomics.
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
    }
    log::debug!("Shutdown handlers installed (SIGINT, SIGTERM)");
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Signal that requested shutdown, if any
pub fn received_signal() -> Option<i32> {
    match SIGNAL_RECEIVED.load(Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}
