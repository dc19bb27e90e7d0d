//! Namespace entry: clone(2) into a new namespace set and re-execute the
//! launcher binary under a stage name.
//!
//! The child blocks on a pipe until the parent has written its
//! `uid_map`/`gid_map`, then execs. The ordering matters twice over: the
//! maps can only be written from outside the new user namespace, and the
//! next stage must already see its mapped identity when it starts
//! running. Everything the child does between clone and exec is plain
//! syscalls, and the process is single-threaded at that point, which is
//! the only state the kernel tolerates namespace-entering clones in.

use crate::config::types::{LauncherError, Result, SETUP_EXIT_CODE};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::{clone, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{pipe2, Pid};
use std::ffi::{CStr, CString};
use std::fs;
use std::os::fd::IntoRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

const STACK_SIZE: usize = 2 * 1024 * 1024;

/// A single-entry uid or gid mapping for a new user namespace.
#[derive(Clone, Copy, Debug)]
pub struct IdMap {
    /// Id as seen inside the namespace.
    pub inside: u32,
    /// Id it maps to in the parent namespace.
    pub outside: u32,
}

/// Everything needed to start the next launcher incarnation.
pub struct StageSpawn {
    /// Binary to execute.
    pub binary: PathBuf,
    /// Full argument vector; element 0 carries the stage name.
    pub argv: Vec<String>,
    pub namespaces: CloneFlags,
    pub uid_map: IdMap,
    pub gid_map: IdMap,
    /// Signal delivered to the child when this process dies.
    pub death_signal: Option<Signal>,
}

/// Clones into `spawn.namespaces`, writes the id maps, releases the
/// child into its exec. Returns the child's pid in this namespace.
pub fn spawn_stage(spawn: &StageSpawn) -> Result<Pid> {
    let binary = CString::new(spawn.binary.as_os_str().as_bytes())
        .map_err(|_| LauncherError::Exec("binary path contains a NUL byte".to_string()))?;
    let argv = spawn
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| LauncherError::Exec("argument contains a NUL byte".to_string()))?;

    let (sync_read, sync_write) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| LauncherError::Namespace(format!("could not create sync pipe: {e}")))?;
    let read_fd = sync_read.into_raw_fd();
    let write_fd = sync_write.into_raw_fd();

    let death_signal = spawn.death_signal;
    let mut stack = vec![0u8; STACK_SIZE];
    let callback: Box<dyn FnMut() -> isize> =
        Box::new(move || stage_child(&binary, &argv, death_signal, read_fd, write_fd));

    let child = match unsafe { clone(callback, &mut stack, spawn.namespaces, Some(libc::SIGCHLD)) }
    {
        Ok(pid) => pid,
        Err(e) => {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(LauncherError::Namespace(format!(
                "could not clone into new namespaces: {e}"
            )));
        }
    };

    unsafe { libc::close(read_fd) };
    if let Err(err) = write_id_maps(child, &spawn.uid_map, &spawn.gid_map) {
        // The child is still parked on the pipe read; it would come up
        // with an unmapped identity, so take it down while it is still
        // guaranteed not to have reached its exec.
        let _ = kill(child, Signal::SIGKILL);
        unsafe { libc::close(write_fd) };
        let _ = waitpid(child, None);
        return Err(err);
    }
    // Closing the write end is what releases the child into its exec,
    // so it only happens once the maps are confirmed written.
    unsafe { libc::close(write_fd) };
    log::debug!("spawned {:?} as pid {child}", spawn.argv.first());
    Ok(child)
}

/// Body of the cloned child. Runs inside the new namespaces with the
/// parent's memory copied, before any mapping is in place.
fn stage_child(
    binary: &CStr,
    argv: &[CString],
    death_signal: Option<Signal>,
    read_fd: RawFd,
    write_fd: RawFd,
) -> isize {
    unsafe { libc::close(write_fd) };
    if let Some(signal) = death_signal {
        if let Err(e) = prctl::set_pdeathsig(signal) {
            eprintln!("faketree: could not arm the parent-death signal: {e}");
        }
    }
    // Block until the parent closes its end, i.e. until our id maps have
    // been written (or given up on, in which case we are about to die).
    let mut byte = 0u8;
    loop {
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n >= 0 || Errno::last() != Errno::EINTR {
            break;
        }
    }
    unsafe { libc::close(read_fd) };
    match nix::unistd::execv(binary, argv) {
        Err(e) => {
            eprintln!("faketree: could not re-execute {binary:?}: {e}");
            SETUP_EXIT_CODE as isize
        }
        Ok(never) => match never {},
    }
}

/// Writes the child's uid and gid maps from the parent side.
///
/// `setgroups` must be denied before an unprivileged process may write a
/// gid map.
fn write_id_maps(child: Pid, uid_map: &IdMap, gid_map: &IdMap) -> Result<()> {
    write_proc_file(
        child,
        "uid_map",
        &format!("{} {} 1\n", uid_map.inside, uid_map.outside),
    )?;
    write_proc_file(child, "setgroups", "deny\n")?;
    write_proc_file(
        child,
        "gid_map",
        &format!("{} {} 1\n", gid_map.inside, gid_map.outside),
    )?;
    Ok(())
}

fn write_proc_file(child: Pid, name: &str, contents: &str) -> Result<()> {
    let path = format!("/proc/{child}/{name}");
    fs::write(&path, contents)
        .map_err(|e| LauncherError::Namespace(format!("could not write {path}: {e}")))
}
