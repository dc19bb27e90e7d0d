//! The three incarnations of the launcher.
//!
//! Namespace-entering clones are only legal from a single-threaded
//! process, and each namespace set needs setup work done from inside it,
//! so every transition is a clone followed immediately by an exec of
//! this same binary. The stage a process is in rides in argv[0]; all
//! remaining state rides in the re-serialized flags.
//!
//! | stage | argv[0] | runs as |
//! |---|---|---|
//! | entry | anything else | the caller |
//! | system setup | `initialize-system` | root of the new user ns, PID 1 of the new pid ns |
//! | privilege drop | `initialize-privileges` | the target identity |

use crate::config::types::{Config, LauncherError, Result};
use crate::core::supervisor::{supervise, Policy};
use crate::exec;
use crate::kernel::credentials;
use crate::kernel::mount;
use crate::kernel::namespace::{spawn_stage, IdMap, StageSpawn};
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::{getgid, getuid, sethostname};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

pub const STAGE_SYSTEM: &str = "initialize-system";
pub const STAGE_PRIVILEGES: &str = "initialize-privileges";

/// Builds the argument vector for the next incarnation: the stage tag,
/// the normalized flags, and the user's command after `--`.
fn stage_argv(stage: &str, cfg: &Config, command: &[String]) -> Vec<String> {
    let mut argv = vec![stage.to_string()];
    argv.extend(cfg.to_args());
    argv.push("--".to_string());
    argv.extend(command.iter().cloned());
    argv
}

/// First incarnation: runs as the caller, in the caller's namespaces.
///
/// Clones the system-setup stage into the full namespace set with the
/// caller mapped to root, then lingers as the outermost supervisor. It
/// only waits for its direct child (the real tree supervision happens
/// one level down, where PID 1 lives) and leaves the SIGTERM sweep to
/// that child for the same reason.
pub fn enter_system(cfg: Config, command: Vec<String>) -> Result<i32> {
    let policy = Policy {
        wait_all: false,
        propagate: cfg.propagate,
        term_on_exit: false,
        timeout: cfg.timeout,
        forward_pid: None,
    };
    supervise(&policy, || {
        spawn_stage(&StageSpawn {
            // The mount table is still the caller's, so the magic link
            // is the most reliable name for ourselves.
            binary: PathBuf::from("/proc/self/exe"),
            argv: stage_argv(STAGE_SYSTEM, &cfg, &command),
            namespaces: CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWUSER,
            uid_map: IdMap {
                inside: 0,
                outside: getuid().as_raw(),
            },
            gid_map: IdMap {
                inside: 0,
                outside: getgid().as_raw(),
            },
            death_signal: None,
        })
    })
}

/// Second incarnation: root of the user namespace, PID 1 of the pid
/// namespace. Sets the hostname, reshapes the mount table, then hands
/// off to the privilege drop.
pub fn initialize_system(cfg: Config, command: Vec<String>) -> Result<i32> {
    if let Some(hostname) = &cfg.hostname {
        match sethostname(hostname) {
            Ok(()) => std::env::set_var("HOSTNAME", hostname),
            Err(e) => cfg.tolerate(LauncherError::Namespace(format!(
                "could not set hostname {hostname:?}: {e}"
            )))?,
        }
    }

    mount::apply_all(&cfg)?;

    enter_privileges(cfg, command)
}

/// Clones the final incarnation into one more user namespace, this time
/// mapping our root to the target identity, and becomes the supervisor
/// of the command's whole process tree.
fn enter_privileges(cfg: Config, command: Vec<String>) -> Result<i32> {
    let Some(binary) = cfg.faketree.clone() else {
        return Err(LauncherError::Exec(
            "the launcher's own path is unknown; pass --faketree".to_string(),
        ));
    };

    // With propagation on, a SIGTERM to this process is relayed rather
    // than fatal, so the only way the child can lose us unexpectedly is
    // SIGKILL; pass the same on. Without propagation, dying on SIGTERM
    // is normal and the child gets a chance to clean up.
    let death_signal = if cfg.propagate {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };

    let policy = Policy {
        wait_all: cfg.wait,
        propagate: cfg.propagate,
        term_on_exit: cfg.term_on_wait,
        timeout: cfg.timeout,
        forward_pid: None,
    };
    supervise(&policy, || {
        spawn_stage(&StageSpawn {
            binary,
            argv: stage_argv(STAGE_PRIVILEGES, &cfg, &command),
            namespaces: CloneFlags::CLONE_NEWUSER,
            uid_map: IdMap {
                inside: cfg.uid,
                outside: getuid().as_raw(),
            },
            gid_map: IdMap {
                inside: cfg.gid,
                outside: getgid().as_raw(),
            },
            death_signal: Some(death_signal),
        })
    })
}

/// Third incarnation: confirms the target identity, changes directory,
/// and becomes the user's command.
pub fn initialize_privileges(cfg: Config, command: Vec<String>) -> Result<i32> {
    credentials::drop_identity(&cfg)?;

    if let Some(dir) = &cfg.chdir {
        // Creation is best-effort; the chdir itself is not, since the
        // command's meaning depends on where it starts.
        let created = std::fs::DirBuilder::new()
            .recursive(true)
            .mode(cfg.perms)
            .create(dir);
        if let Err(chdir_err) = std::env::set_current_dir(dir) {
            let mut message = format!(
                "could not chdir to {} - as specified with --chdir - {chdir_err}",
                dir.display()
            );
            if let Err(mkdir_err) = created {
                message.push_str(&format!("; creating it failed as well: {mkdir_err}"));
            }
            return Err(LauncherError::Exec(message));
        }
        std::env::set_var("PWD", dir);
    }

    exec::exec_command(&command)
}
