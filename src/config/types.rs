//! Configuration model shared by all three launcher incarnations.
//!
//! A `Config` is built once per process from argv and is immutable
//! afterwards. `Config::to_args` is the exact inverse of parsing, modulo
//! normalization: uids and gids are re-emitted numerically so the next
//! incarnation never depends on name lookups working inside the
//! namespace it runs in.

use crate::kernel::mount::MountSpec;
use nix::unistd::{getgid, getuid};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit code for failures of the launcher itself, as opposed to the
/// status of the supervised command.
pub const SETUP_EXIT_CODE: i32 = 125;

/// Mode bits for directories and files created on behalf of the user.
pub const DEFAULT_PERMS: u32 = 0o755;

/// Grace period between the command exiting and SIGKILL being sent to
/// whatever it left behind.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    Parse(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("privilege error: {0}")]
    Privilege(String),

    #[error("exec error: {0}")]
    Exec(String),

    #[error("process error: {0}")]
    Process(String),
}

pub type Result<T> = std::result::Result<T, LauncherError>;

/// Everything the launcher can be asked to do, in normalized form.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Identity the command runs as inside the innermost user namespace.
    pub uid: u32,
    pub gid: u32,
    /// Forces uid = gid = 0 regardless of `uid`/`gid`.
    pub root: bool,
    /// Turns tolerated setup errors into fatal ones.
    pub fail: bool,
    pub hostname: Option<String>,
    /// Directory to change to after the identity drop; created if missing.
    pub chdir: Option<PathBuf>,
    /// Path this binary is re-executed from once the mount table has been
    /// reshaped and its original path may no longer resolve.
    pub faketree: Option<PathBuf>,
    /// Mode bits used when creating mount targets and chdir directories.
    pub perms: u32,
    /// When set, /proc is the user's responsibility: no automatic mount,
    /// no dropping of user mounts targeting /proc.
    pub proc: bool,
    /// Wait for every descendant, not just the direct child.
    pub wait: bool,
    /// SIGTERM the whole namespace once the direct child exits.
    pub term_on_wait: bool,
    /// Forward caught signals to the direct child instead of dying.
    pub propagate: bool,
    /// Delay before the SIGKILL sweep of leftover processes; zero disables.
    pub timeout: Duration,
    pub mounts: Vec<MountSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            root: false,
            fail: false,
            hostname: None,
            chdir: None,
            faketree: default_self_path(),
            perms: DEFAULT_PERMS,
            proc: false,
            wait: true,
            term_on_wait: true,
            propagate: true,
            timeout: DEFAULT_TIMEOUT,
            mounts: Vec::new(),
        }
    }
}

impl Config {
    /// Applies the failure policy to a setup error: fatal under `--fail`,
    /// logged and tolerated otherwise.
    pub fn tolerate(&self, err: LauncherError) -> Result<()> {
        if self.fail {
            return Err(err);
        }
        log::warn!("{err} (continuing)");
        Ok(())
    }

    /// Re-serializes the configuration as command line flags.
    ///
    /// Always prefer this over echoing the original argv when spawning
    /// the next incarnation: values here are normalized (numeric ids,
    /// resolved paths), so they stay meaningful even where the original
    /// spellings would not resolve any more.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--uid".to_string(),
            self.uid.to_string(),
            "--gid".to_string(),
            self.gid.to_string(),
        ];
        if self.root {
            args.push("--root".to_string());
        }
        if self.fail {
            args.push("--fail".to_string());
        }
        if let Some(hostname) = &self.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }
        if let Some(chdir) = &self.chdir {
            args.push("--chdir".to_string());
            args.push(chdir.display().to_string());
        }
        if let Some(faketree) = &self.faketree {
            args.push("--faketree".to_string());
            args.push(faketree.display().to_string());
        }
        if self.perms != DEFAULT_PERMS {
            args.push("--perms".to_string());
            args.push(self.perms.to_string());
        }
        if self.proc {
            args.push("--proc".to_string());
        }
        if !self.wait {
            args.push("--wait=false".to_string());
        }
        if !self.propagate {
            args.push("--propagate=false".to_string());
        }
        if !self.term_on_wait {
            args.push("--wait-term=false".to_string());
        }
        if self.timeout != DEFAULT_TIMEOUT {
            args.push("--wait-timeout".to_string());
            args.push(format_duration(self.timeout));
        }
        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_string());
        }
        args
    }
}

/// Resolved path of the running binary.
///
/// Canonicalization can fail depending on how /proc is mounted; in that
/// case there is no default and `--faketree` must be given explicitly.
fn default_self_path() -> Option<PathBuf> {
    std::env::current_exe().ok().and_then(|p| p.canonicalize().ok())
}

/// Parses a duration like `300ms`, `1s`, `5m`, `1m30s` or `2h`.
/// A bare `0` disables the timer.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(LauncherError::Parse("empty duration".to_string()));
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(LauncherError::Parse(format!(
                "invalid duration {input:?}: expected a number at {rest:?}"
            )));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| LauncherError::Parse(format!("invalid duration {input:?}")))?;
        rest = &rest[digits..];
        let (unit_len, amount) = if rest.starts_with("ms") {
            (2, Duration::from_millis(value))
        } else if rest.starts_with("us") {
            (2, Duration::from_micros(value))
        } else if rest.starts_with('s') {
            (1, Duration::from_secs(value))
        } else if rest.starts_with('m') {
            (1, Duration::from_secs(value * 60))
        } else if rest.starts_with('h') {
            (1, Duration::from_secs(value * 3600))
        } else {
            return Err(LauncherError::Parse(format!(
                "invalid duration {input:?}: unknown unit at {rest:?}"
            )));
        };
        total += amount;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Inverse of [`parse_duration`], emitting the coarsest exact unit.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0".to_string();
    }
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else if d.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}us", d.as_micros())
    }
}

/// Parses mode bits with the usual prefixes: `0755` and `0o755` are
/// octal, `0x1ed` hexadecimal, `493` plain decimal.
pub fn parse_mode(input: &str) -> Result<u32> {
    let s = input.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        u32::from_str_radix(oct, 8)
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u32::from_str_radix(bin, 2)
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|_| LauncherError::Parse(format!("invalid mode {input:?}")))
}
