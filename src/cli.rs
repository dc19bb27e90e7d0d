//! Command line surface and stage dispatch.

use crate::config::types::{
    parse_duration, parse_mode, Config, Result, SETUP_EXIT_CODE,
};
use crate::core::stages::{self, STAGE_PRIVILEGES, STAGE_SYSTEM};
use crate::kernel::credentials;
use crate::kernel::mount::MountSpec;
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};
use std::time::Duration;

const LONG_HELP: &str = "\
faketree spawns a command with its own independent view of the file
system, but with the same uid and privileges as the user who started it.

Examples:

    faketree --mount /var/log:/tmp/log --chdir /tmp/log -- /bin/sh
        A shell whose /tmp/log is the system's /var/log, running as the
        invoking user.

    faketree --mount /opt/data/build:/opt/build --chdir /opt/build \\
        -- sh -c 'make && make install'

Mount syntax:

    --mount source:destination[:option[,...][,type=...][,data=...]]

  Without options this is the equivalent of 'mount --rbind --make-private'.
  If any option is given, all of them must be: a read-only recursive bind
  is 'recursive,bind,ro'. Leave the source empty for filesystems that
  have none, e.g. '--mount :/scratch:type=tmpfs,data=size=1m'. 'data=' must
  come last; everything after it, commas included, goes to the filesystem
  layer verbatim. Recognized options:

      dirsync, mandlock, noatime, nodev, nodiratime, noexec, nosuid, ro,
      recursive, relatime, silent, strictatime, sync, remount, bind,
      shared, private, slave, unbindable, move

  faketree needs a /proc that matches the new pid namespace and mounts it
  automatically, ignoring any '--mount ...:/proc:...' request. Pass --proc
  to take over that responsibility yourself, at your own risk.

Signals:

  With --propagate (the default), faketree catches every signal it can
  and relays it to the command, returning the command's status once it
  terminates. Note that a job control system signaling faketree's whole
  process group reaches the command both directly and through the relay.
  With --propagate=false, faketree itself dies on a fatal signal and the
  command is torn down through its parent-death signal.

Process termination:

  With --wait=false, faketree returns as soon as the command does; the
  kernel SIGKILLs whatever is left in the pid namespace.

  With --wait (the default), faketree waits for every descendant, direct
  or indirect. --wait-term sends SIGTERM to the survivors as soon as the
  command itself exits, and --wait-timeout bounds how long they get
  before SIGKILL. The timer starts when the command exits, not when it
  starts: it limits the stragglers, not the command.
";

#[derive(Parser, Debug)]
#[command(
    name = "faketree",
    version,
    about = "Run a command in its own mount, pid, uts, ipc and user namespaces, keeping the caller's identity",
    after_long_help = LONG_HELP
)]
struct Cli {
    /// Make the command believe it is root (forces uid=0 and gid=0).
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_value_t = false, default_missing_value = "true")]
    root: bool,

    /// Fail outright when any setup step fails, instead of logging and
    /// continuing.
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_value_t = false, default_missing_value = "true")]
    fail: bool,

    /// Take over /proc: no automatic mount, and mounts targeting /proc
    /// are honored instead of dropped.
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_value_t = false, default_missing_value = "true")]
    proc: bool,

    /// Wait for all direct and indirect children before returning.
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_value_t = true, default_missing_value = "true")]
    wait: bool,

    /// Send SIGTERM to every leftover child once the command has exited.
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_value_t = true, default_missing_value = "true")]
    wait_term: bool,

    /// Catch signals and forward them to the command.
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_value_t = true, default_missing_value = "true")]
    propagate: bool,

    /// How long leftover children get after the command exits before
    /// SIGKILL; 0 disables.
    #[arg(long, value_parser = parse_duration, default_value = "5m", value_name = "DURATION")]
    wait_timeout: Duration,

    /// Make the command believe it runs on this host name.
    #[arg(long)]
    hostname: Option<String>,

    /// Change to this directory after the identity drop (created if
    /// missing).
    #[arg(long, value_name = "DIR")]
    chdir: Option<PathBuf>,

    /// Path of this binary, for re-execution after the filesystem has
    /// been reshaped and its original path may no longer resolve.
    #[arg(long, value_name = "PATH")]
    faketree: Option<PathBuf>,

    /// Permissions for created directories and files; 0755, 0o755 and
    /// 493 all mean the same thing.
    #[arg(long, value_parser = parse_mode, default_value = "0o755", value_name = "MODE")]
    perms: u32,

    /// Uid (or user name) the command runs as.
    #[arg(long, value_name = "UID")]
    uid: Option<String>,

    /// Gid (or group name) the command runs as.
    #[arg(long, value_name = "GID")]
    gid: Option<String>,

    /// Mount to set up, as source:destination[:options]; repeatable,
    /// applied in order.
    #[arg(long = "mount", value_name = "SPEC")]
    mount: Vec<String>,

    /// The command to run; a login shell with --norc --noprofile when
    /// omitted.
    #[arg(last = true)]
    command: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Result<(Config, Vec<String>)> {
        let mut cfg = Config {
            root: self.root,
            fail: self.fail,
            proc: self.proc,
            wait: self.wait,
            term_on_wait: self.wait_term,
            propagate: self.propagate,
            timeout: self.wait_timeout,
            perms: self.perms,
            hostname: self.hostname.filter(|h| !h.is_empty()),
            chdir: self.chdir.filter(|d| !d.as_os_str().is_empty()),
            ..Config::default()
        };
        if let Some(faketree) = self.faketree {
            cfg.faketree = Some(faketree);
        }
        if cfg.root {
            cfg.uid = 0;
            cfg.gid = 0;
        } else {
            if let Some(uid) = &self.uid {
                cfg.uid = credentials::resolve_user(uid)?;
            }
            if let Some(gid) = &self.gid {
                cfg.gid = credentials::resolve_group(gid)?;
            }
        }
        cfg.mounts = self
            .mount
            .iter()
            .map(|spec| MountSpec::parse(spec))
            .collect::<Result<Vec<_>>>()?;
        Ok((cfg, self.command))
    }
}

/// Process entry point, shared by all three incarnations.
///
/// The stage tag rides in argv[0], and reading it has to be the very
/// first act of the process: the namespace-entering clones down the road
/// require a single-threaded process, so nothing else may be started
/// before the incarnation is known.
pub fn run() -> anyhow::Result<i32> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut argv = std::env::args();
    let arg0 = argv.next().unwrap_or_default();
    let stage = Path::new(&arg0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(arg0);

    let (cfg, command) = parse_args(argv)?;
    let code = match stage.as_str() {
        STAGE_SYSTEM => stages::initialize_system(cfg, command)?,
        STAGE_PRIVILEGES => stages::initialize_privileges(cfg, command)?,
        _ => stages::enter_system(cfg, command)?,
    };
    Ok(code)
}

fn parse_args(rest: impl Iterator<Item = String>) -> anyhow::Result<(Config, Vec<String>)> {
    let argv = std::iter::once("faketree".to_string()).chain(rest);
    match Cli::try_parse_from(argv) {
        Ok(cli) => Ok(cli.into_config()?),
        Err(err) => {
            // clap renders help and usage errors itself. Either way this
            // is a launcher-side exit, distinct from any command status.
            let _ = err.print();
            std::process::exit(SETUP_EXIT_CODE);
        }
    }
}
