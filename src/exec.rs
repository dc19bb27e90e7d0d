//! The hand-off to the user's command.

use crate::config::types::{LauncherError, Result};
use std::ffi::CString;

/// The caller's login shell, or /bin/sh when the environment does not
/// say.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Replaces this process with the user's command, or with a quiet login
/// shell when none was given. `FAKETREE=true` is exported so nested
/// invocations can tell where they are.
///
/// Only ever returns an error; on success the process is gone.
pub fn exec_command(command: &[String]) -> Result<i32> {
    let argv: Vec<String> = if command.is_empty() {
        vec![
            default_shell(),
            "--norc".to_string(),
            "--noprofile".to_string(),
        ]
    } else {
        command.to_vec()
    };

    std::env::set_var("FAKETREE", "true");

    let cargv = argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| LauncherError::Exec("command contains a NUL byte".to_string()))?;

    log::debug!("exec {argv:?}");
    match nix::unistd::execvp(&cargv[0], &cargv) {
        Err(e) => Err(LauncherError::Exec(format!(
            "could not run the {} command: {e}",
            argv[0]
        ))),
        Ok(never) => match never {},
    }
}
