//! SIGINT handling
//!
//! The handler only raises a flag. Blocking channel reads poll it between
//! slices and fail with [`TbotError::Interrupted`].

use crate::error::{Result, TbotError};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT into the interrupt flag instead of killing the process
pub fn install_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores into an atomic, which is async-signal-safe.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .map_err(|e| TbotError::internal(format!("failed to install SIGINT handler: {e}")))?;
    Ok(())
}

/// Whether SIGINT arrived since the flag was last cleared
pub fn is_set() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Fail with [`TbotError::Interrupted`] if the flag is set
pub fn check() -> Result<()> {
    if is_set() {
        Err(TbotError::Interrupted)
    } else {
        Ok(())
    }
}

/// Raise the flag by hand, e.g. from a test
pub fn raise() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Clear the flag, returning whether it was set
pub fn clear() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}
