//! Signal wiring for the broker process.
//!
//! `SIGTERM`/`SIGINT` request shutdown and `SIGCHLD` reports a worker exit.
//! Handlers only touch the [`Control`] flags and its wake channel.

use super::control::Control;
use crate::error::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::{Arc, OnceLock};

/// Control block the handlers write to. Set once, before handlers go live.
static SIGNAL_CONTROL: OnceLock<Arc<Control>> = OnceLock::new();

extern "C" fn on_shutdown_signal(_: nix::libc::c_int) {
    if let Some(control) = SIGNAL_CONTROL.get() {
        control.request_shutdown();
    }
}

extern "C" fn on_child_exit(_: nix::libc::c_int) {
    if let Some(control) = SIGNAL_CONTROL.get() {
        control.notify_worker_exit();
    }
}

/// Route process signals to `control`.
///
/// Only the first call in a process binds a control block; later calls
/// reinstall the handlers against the one already bound.
pub fn install(control: Arc<Control>) -> Result<()> {
    let _ = SIGNAL_CONTROL.set(control);

    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let child = SigAction::new(
        SigHandler::Handler(on_child_exit),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );

    // Safety: the handlers only perform atomic stores and a write(2) on a
    // non-blocking pipe, both async-signal-safe.
    unsafe {
        signal::sigaction(Signal::SIGTERM, &shutdown)?;
        signal::sigaction(Signal::SIGINT, &shutdown)?;
        signal::sigaction(Signal::SIGCHLD, &child)?;
        // Hand-off failures surface as EPIPE, never as a signal.
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}
