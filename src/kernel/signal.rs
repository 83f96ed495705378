//! Signal plumbing for the daemon
//!
//! Termination signals only flip atomics; the accept loop observes them.
//! Handlers are installed without `SA_RESTART` so a blocked `accept` returns
//! `EINTR` and the loop gets a chance to exit.

use crate::config::types::{DaemonError, Result};
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Installed shutdown handlers (SIGINT, SIGTERM, SIGHUP).
pub struct ShutdownSignals;

impl ShutdownSignals {
    /// Must be called from the main thread before worker threads exist.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(Self::handle),
            SaFlags::empty(),
            SigSet::empty(),
        );

        for sig in SHUTDOWN_SIGNALS {
            // SAFETY: the handler only stores to atomics.
            unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
                DaemonError::Config(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    extern "C" fn handle(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that triggered shutdown, if any.
    pub fn received(&self) -> Option<Signal> {
        match SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }
}

/// Main loop helper: false once a shutdown signal arrived.
pub fn should_continue() -> bool {
    !SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Blocks the shutdown signals on the current thread until dropped.
///
/// Worker threads hold one for their whole life so that signals land on the
/// thread sitting in `accept`.
pub struct SignalBlockGuard {
    mask: SigSet,
}

impl SignalBlockGuard {
    pub fn block() -> Result<Self> {
        let mut mask = SigSet::empty();
        for sig in SHUTDOWN_SIGNALS {
            mask.add(sig);
        }
        signal::pthread_sigmask(signal::SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
        Ok(Self { mask })
    }
}

impl Drop for SignalBlockGuard {
    fn drop(&mut self) {
        let _ = signal::pthread_sigmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&self.mask), None);
    }
}

/// Unblock every signal on the calling thread.
///
/// A cloned child inherits the mask of the thread that cloned it and keeps it
/// across `exec`, so a sandbox launched from a worker would otherwise start
/// with the shutdown signals blocked. Allocation-free.
pub fn clear_signal_mask() -> nix::Result<()> {
    signal::pthread_sigmask(signal::SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
}

/// Ask a sandbox to exit. Does not wait and does not escalate.
pub fn send_terminate(pid: Pid) -> Result<()> {
    signal::kill(pid, Signal::SIGTERM).map_err(DaemonError::from)
}

/// True while `pid` exists (zombies included).
pub fn process_exists(pid: Pid) -> bool {
    signal::kill(pid, None::<Signal>).is_ok()
}
