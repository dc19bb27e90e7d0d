//! Identity resolution and the final uid/gid switch.

use crate::config::types::{Config, LauncherError, Result};
use nix::unistd::{setgid, setuid, Gid, Group, Uid, User};

/// Resolves a numeric id or a user name to a uid.
pub fn resolve_user(name: &str) -> Result<u32> {
    if let Ok(id) = name.parse::<i64>() {
        if (0..=u32::MAX as i64).contains(&id) {
            return Ok(id as u32);
        }
        return Err(LauncherError::Parse(format!(
            "invalid uid: {id} - must be >= 0"
        )));
    }
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => Err(LauncherError::Parse(format!("unknown user: {name}"))),
        Err(e) => Err(LauncherError::Parse(format!(
            "could not look up user {name}: {e}"
        ))),
    }
}

/// Resolves a numeric id or a group name to a gid.
pub fn resolve_group(name: &str) -> Result<u32> {
    if let Ok(id) = name.parse::<i64>() {
        if (0..=u32::MAX as i64).contains(&id) {
            return Ok(id as u32);
        }
        return Err(LauncherError::Parse(format!(
            "invalid gid: {id} - must be >= 0"
        )));
    }
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(LauncherError::Parse(format!("unknown group: {name}"))),
        Err(e) => Err(LauncherError::Parse(format!(
            "could not look up group {name}: {e}"
        ))),
    }
}

/// Switches to the configured identity inside the innermost user
/// namespace. The process holds full capabilities over that namespace,
/// so each call is a confirmation of the single mapped id rather than a
/// privilege transition; failures follow the configured failure policy.
pub fn drop_identity(cfg: &Config) -> Result<()> {
    if let Err(e) = setuid(Uid::from_raw(cfg.uid)) {
        cfg.tolerate(LauncherError::Privilege(format!(
            "could not change to uid {}: {e}",
            cfg.uid
        )))?;
    }
    if let Err(e) = setgid(Gid::from_raw(cfg.gid)) {
        cfg.tolerate(LauncherError::Privilege(format!(
            "could not change to gid {}: {e}",
            cfg.gid
        )))?;
    }
    Ok(())
}
