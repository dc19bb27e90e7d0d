//! Supervision of a spawned stage: signal forwarding, child reaping and
//! bounded teardown of whatever the command leaves behind.

use crate::config::types::{LauncherError, Result};
use crate::kernel::signal::SignalForwarder;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::thread;
use std::time::Duration;

/// How one spawned stage is looked after.
pub struct Policy {
    /// Reap every descendant, not just the direct child.
    pub wait_all: bool,
    /// Catch signals and relay them instead of dying.
    pub propagate: bool,
    /// SIGTERM the whole namespace once the direct child exits.
    pub term_on_exit: bool,
    /// Delay before the SIGKILL sweep; zero disables it.
    pub timeout: Duration,
    /// Where relayed signals go; `None` selects the direct child.
    pub forward_pid: Option<Pid>,
}

/// Starts the child produced by `spawn` and supervises it according to
/// `policy`. Returns the exit status to propagate to our own caller.
pub fn supervise<F>(policy: &Policy, spawn: F) -> Result<i32>
where
    F: FnOnce() -> Result<Pid>,
{
    // Handlers must be in place before the child can raise anything.
    let forwarder = if policy.propagate {
        Some(SignalForwarder::install()?)
    } else {
        None
    };
    let child = spawn()?;
    if let Some(forwarder) = forwarder {
        forwarder.forward_to(policy.forward_pid.unwrap_or(child));
    }
    if policy.wait_all {
        wait_children(child, policy.term_on_exit, policy.timeout)
    } else {
        wait_direct(child)
    }
}

/// Folds a wait status into the exit code we report, following the shell
/// convention for signal deaths so the caller always sees a non-zero
/// status when the command did not exit on its own.
pub fn encode_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

fn wait_direct(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(code) = encode_status(status) {
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(LauncherError::Process(format!("waitpid({child}): {e}")))
            }
        }
    }
}

/// The reaping loop of PID 1.
///
/// Every orphaned descendant in the namespace reparents to this process,
/// so waiting for "any child" repeatedly drains the whole tree. The
/// direct child's status is remembered as the final result; everything
/// else is reaped and forgotten. ECHILD from the kernel is the loop's
/// termination condition: no children means nothing left to wait for.
fn wait_children(child: Pid, term_on_exit: bool, timeout: Duration) -> Result<i32> {
    let any = Pid::from_raw(-1);
    let mut result: Option<i32> = None;
    'outer: loop {
        let status = match waitpid(any, None) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => return Err(LauncherError::Process(format!("wait: {e}"))),
        };
        note_reaped(status, child, term_on_exit, timeout, &mut result);
        // Drain whatever is already reapable before blocking again.
        loop {
            match waitpid(any, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => note_reaped(status, child, term_on_exit, timeout, &mut result),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break 'outer,
                Err(e) => return Err(LauncherError::Process(format!("wait: {e}"))),
            }
        }
    }
    // No children left but the one we spawned was never collected: that
    // should not be possible, and the caller deserves to know.
    result.ok_or_else(|| {
        LauncherError::Process("no children left, but the command was never collected".to_string())
    })
}

fn note_reaped(
    status: WaitStatus,
    child: Pid,
    term_on_exit: bool,
    timeout: Duration,
    result: &mut Option<i32>,
) {
    if status.pid() != Some(child) {
        return;
    }
    let Some(code) = encode_status(status) else {
        return;
    };
    *result = Some(code);
    log::debug!("command finished with status {code}");

    // The command should have cleaned up after itself. If it left
    // daemons behind, ask nicely first; the timer below will not.
    if term_on_exit {
        let _ = kill(Pid::from_raw(-1), Signal::SIGTERM);
    }
    if !timeout.is_zero() {
        // One-shot sweep of last resort. The thread dies with the
        // process, so a tree that drains before the deadline cancels it
        // naturally.
        thread::spawn(move || {
            thread::sleep(timeout);
            let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_pass_through() {
        let pid = Pid::from_raw(42);
        assert_eq!(encode_status(WaitStatus::Exited(pid, 0)), Some(0));
        assert_eq!(encode_status(WaitStatus::Exited(pid, 7)), Some(7));
    }

    #[test]
    fn signal_deaths_use_the_shell_convention() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            encode_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(128 + 15)
        );
        assert_eq!(
            encode_status(WaitStatus::Signaled(pid, Signal::SIGKILL, true)),
            Some(128 + 9)
        );
    }

    #[test]
    fn stops_are_not_final() {
        let pid = Pid::from_raw(42);
        assert_eq!(encode_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)), None);
        assert_eq!(encode_status(WaitStatus::Continued(pid)), None);
    }
}
