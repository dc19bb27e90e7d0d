//! End-to-end tests driving the built launcher binary.
//!
//! Unprivileged user namespaces are not allowed everywhere (hardened
//! kernels, seccomp'd CI runners), so every test that actually enters
//! namespaces probes for support first and skips with a note instead of
//! failing.

use std::fs;
use std::process::{Command, Output};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_faketree");

fn run(args: &[&str]) -> Output {
    Command::new(BIN)
        .args(args)
        .output()
        .expect("the launcher binary should spawn")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn namespaces_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let probe = run(&["--", "/bin/true"]);
        if !probe.status.success() {
            eprintln!(
                "unprivileged user namespaces unavailable here, skipping: {}",
                stderr_of(&probe).trim()
            );
        }
        probe.status.success()
    })
}

#[test]
fn help_is_a_launcher_exit() {
    let output = run(&["--help"]);
    assert_eq!(output.status.code(), Some(125));
    assert!(stdout_of(&output).contains("faketree"));
}

#[test]
fn bad_mount_spec_is_a_launcher_exit() {
    let output = run(&["--mount", "just-a-path", "--", "/bin/true"]);
    assert_eq!(output.status.code(), Some(125));
}

#[test]
fn unknown_flag_is_a_launcher_exit() {
    let output = run(&["--bogus"]);
    assert_eq!(output.status.code(), Some(125));
}

#[test]
fn exit_codes_propagate() {
    if !namespaces_available() {
        return;
    }
    let output = run(&["--", "sh", "-c", "exit 41"]);
    assert_eq!(output.status.code(), Some(41));
}

#[test]
fn signal_deaths_use_the_shell_convention() {
    if !namespaces_available() {
        return;
    }
    let output = run(&["--", "sh", "-c", "kill -TERM $$"]);
    assert_eq!(output.status.code(), Some(128 + 15));
}

#[test]
fn hostname_applies_inside_only() {
    if !namespaces_available() {
        return;
    }
    let before = fs::read_to_string("/proc/sys/kernel/hostname").unwrap();
    let output = run(&[
        "--uid",
        "0",
        "--hostname",
        "box",
        "--",
        "cat",
        "/proc/sys/kernel/hostname",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(stdout_of(&output).trim(), "box");
    let after = fs::read_to_string("/proc/sys/kernel/hostname").unwrap();
    assert_eq!(before, after, "the caller's hostname must not change");

    // the environment follows suit, not just the uts namespace
    let output = run(&["--hostname", "box", "--", "sh", "-c", "echo $HOSTNAME"]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(
        stdout_of(&output).trim(),
        "box",
        "HOSTNAME must be exported into the command's environment"
    );
}

#[test]
fn readonly_bind_mount_serves_and_refuses() {
    if !namespaces_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("marker"), "HI\n").unwrap();
    let dst = dir.path().join("dst");
    let spec = format!("{}:{}:recursive,bind,ro", src.display(), dst.display());

    let output = run(&[
        "--mount",
        &spec,
        "--",
        "cat",
        &format!("{}/marker", dst.display()),
    ]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(stdout_of(&output), "HI\n");

    let output = run(&[
        "--mount",
        &spec,
        "--",
        "sh",
        "-c",
        &format!("echo x > {}/marker", dst.display()),
    ]);
    assert!(
        !output.status.success(),
        "writing through a read-only bind must fail"
    );
}

#[test]
fn tmpfs_mount_honors_its_size() {
    if !namespaces_available() {
        return;
    }
    if !["/bin/df", "/usr/bin/df"].iter().any(|p| fs::metadata(p).is_ok()) {
        eprintln!("df not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("t");
    let spec = format!(":{}:type=tmpfs,data=size=1m", dst.display());
    let output = run(&["--mount", &spec, "--", "df", "-P", &dst.display().to_string()]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    let stdout = stdout_of(&output);
    let fields: Vec<&str> = stdout
        .lines()
        .last()
        .expect("df should print a data line")
        .split_whitespace()
        .collect();
    let kilobytes: u64 = fields[1].parse().expect("df size column should be numeric");
    assert!(kilobytes <= 1024, "tmpfs reports {kilobytes}K for size=1m");
}

#[test]
fn without_wait_the_namespace_tears_down_promptly() {
    if !namespaces_available() {
        return;
    }
    let start = Instant::now();
    let output = run(&["--wait=false", "--", "sh", "-c", "sleep 10 & exit 0"]);
    let elapsed = start.elapsed();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr_of(&output));
    assert!(
        elapsed < Duration::from_secs(5),
        "returned only after {elapsed:?}"
    );
}

#[test]
fn stubborn_children_are_swept_after_the_timeout() {
    if !namespaces_available() {
        return;
    }
    let start = Instant::now();
    let output = run(&[
        "--wait",
        "--wait-term",
        "--wait-timeout",
        "1s",
        "--",
        "sh",
        "-c",
        "trap '' TERM; sleep 60 & exit 0",
    ]);
    let elapsed = start.elapsed();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr_of(&output));
    assert!(
        elapsed >= Duration::from_millis(900),
        "the TERM-immune child should have held things up for the timeout, not {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(10),
        "the SIGKILL sweep should have fired, still waiting after {elapsed:?}"
    );
}

#[test]
fn uid_accepts_user_names() {
    if !namespaces_available() {
        return;
    }
    let Ok(expected) = faketree::kernel::credentials::resolve_user("nobody") else {
        eprintln!("no 'nobody' user here, skipping");
        return;
    };
    let output = run(&["--uid", "nobody", "--", "id", "-u"]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(stdout_of(&output).trim(), expected.to_string());
    assert_eq!(stderr_of(&output), "");
}

#[test]
fn proc_mounts_are_dropped_unless_asked_for() {
    if !namespaces_available() {
        return;
    }
    let output = run(&["--mount", ":/proc:type=proc", "--", "/bin/true"]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert!(
        stderr_of(&output).contains("skipping mount"),
        "stderr: {}",
        stderr_of(&output)
    );
}

#[test]
fn proc_can_be_taken_over_explicitly() {
    if !namespaces_available() {
        return;
    }
    let output = run(&[
        "--proc",
        "--mount",
        ":/proc:type=proc,relatime,nodev,noexec,nosuid",
        "--",
        "/bin/true",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert!(
        !stderr_of(&output).contains("skipping mount"),
        "the explicit /proc mount must be honored: {}",
        stderr_of(&output)
    );
}

#[test]
fn the_marker_variable_is_exported() {
    if !namespaces_available() {
        return;
    }
    let output = run(&["--", "sh", "-c", "echo $FAKETREE"]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(stdout_of(&output).trim(), "true");
}

#[test]
fn chdir_creates_and_enters_the_directory() {
    if !namespaces_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let inside = dir.path().join("fresh/workdir");
    let output = run(&[
        "--chdir",
        &inside.display().to_string(),
        "--",
        "sh",
        "-c",
        "pwd && printf '%s\\n' \"$PWD\"",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    let stdout = stdout_of(&output);
    let mut lines = stdout.lines();
    assert_eq!(lines.next(), Some(inside.display().to_string().as_str()));
    assert_eq!(lines.next(), Some(inside.display().to_string().as_str()));
}
