//! Signal interception and forwarding.
//!
//! The supervisor subscribes to every signal the process can catch and
//! relays each one to its child. The handler body is restricted to a
//! single write(2) into a pipe; a plain thread drains the pipe and
//! issues the kill(2) calls, in kernel delivery order.

use crate::config::types::{LauncherError, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe2, Pid};
use std::os::fd::IntoRawFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

/// Write end of the forwarding pipe. Set once, before any handler is
/// installed, and never torn down: forwarding lasts for the life of the
/// process.
static FORWARD_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn enqueue_signal(signo: libc::c_int) {
    let fd = FORWARD_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // write(2) is async-signal-safe; nothing else is allowed here
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

/// A subscription to all catchable signals, waiting for a target pid.
pub struct SignalForwarder {
    read_fd: RawFd,
}

impl SignalForwarder {
    /// Routes every catchable signal into the pipe. SIGCHLD keeps its
    /// default disposition so child reaping stays with the wait loop,
    /// and SIGKILL/SIGSTOP cannot be subscribed to.
    ///
    /// Must be installed before the child is started: a signal arriving
    /// between its first breath and our subscription would kill the
    /// supervisor instead of being relayed.
    pub fn install() -> Result<Self> {
        let (read_half, write_half) = pipe2(OFlag::O_CLOEXEC).map_err(|e| {
            LauncherError::Process(format!("could not create signal pipe: {e}"))
        })?;
        FORWARD_FD.store(write_half.into_raw_fd(), Ordering::Relaxed);
        let read_fd = read_half.into_raw_fd();

        let action = SigAction::new(
            SigHandler::Handler(enqueue_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in Signal::iterator() {
            if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP | Signal::SIGCHLD) {
                continue;
            }
            // Individual failures are not worth dying over; the signal
            // simply keeps its previous disposition.
            let _ = unsafe { sigaction(signal, &action) };
        }
        Ok(SignalForwarder { read_fd })
    }

    /// Relays queued signals to `target` until the process exits.
    pub fn forward_to(self, target: Pid) {
        thread::spawn(move || {
            let mut byte = 0u8;
            loop {
                let n = unsafe {
                    libc::read(self.read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1)
                };
                if n == 1 {
                    if let Ok(signal) = Signal::try_from(byte as i32) {
                        let _ = kill(target, signal);
                    }
                } else if n < 0 && Errno::last() == Errno::EINTR {
                    continue;
                } else {
                    break;
                }
            }
        });
    }
}
