/// Async-signal-safe shutdown handling
///
/// The handler only stores into atomics. A watcher thread turns the flag into
/// a cancellation of the in-flight request, which tears its sandbox down
/// through the normal supervisor path.
use crate::core::cancel::CancellationToken;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

extern "C" fn handle_signal(signal: libc::c_int) {
    SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install handlers for SIGINT, SIGTERM and SIGHUP
pub fn install_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: the handler only performs atomic stores
        unsafe { signal::sigaction(sig, &action) }?;
    }

    log::debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Signal number that requested shutdown, 0 if none
pub fn received_signal() -> i32 {
    SIGNAL_RECEIVED.load(Ordering::SeqCst)
}

/// Cancel `token` once shutdown is requested. The thread exits when the
/// token is cancelled by anyone.
pub fn cancel_on_shutdown(token: CancellationToken) -> JoinHandle<()> {
    thread::spawn(move || {
        while !token.is_cancelled() {
            if shutdown_requested() {
                log::warn!(
                    "Received signal {}, cancelling the in-flight request",
                    received_signal()
                );
                token.cancel();
                break;
            }
            thread::sleep(WATCH_INTERVAL);
        }
    })
}
