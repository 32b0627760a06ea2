//! Integration tests for the nsmnt and nscage CLIs.
//!
//! Spec parsing and exit-code mapping are tested unconditionally; tests
//! that need working unprivileged user namespaces probe the kernel first
//! and skip when it refuses.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;
use tempfile::TempDir;

fn nsmnt() -> Command {
    Command::cargo_bin("nsmnt").expect("nsmnt binary not found")
}

fn nscage() -> Command {
    Command::cargo_bin("nscage").expect("nscage binary not found")
}

/// Whether this kernel/environment lets us build a user+mount namespace.
fn userns_available() -> bool {
    nsmnt()
        .arg("--")
        .arg("/bin/true")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// --- Parse errors and exit codes (no privileges needed) ---

#[test]
fn incomplete_mount_spec_exits_33() {
    nsmnt()
        .arg("-m")
        .arg("bind")
        .arg("--")
        .arg("/bin/true")
        .assert()
        .code(33)
        .stderr(predicate::str::contains("Incomplete mount spec"));
}

#[test]
fn bad_mkdir_argument_exits_33() {
    nsmnt()
        .arg("-m")
        .arg("tmpfs,tmp,/t,mkdir=sometimes")
        .arg("--")
        .arg("/bin/true")
        .assert()
        .code(33)
        .stderr(predicate::str::contains("Unknown mkdir= argument"));
}

#[test]
fn overlay_without_lowerdir_exits_33() {
    // The inconsistency surfaces when the overlay is resolved, still
    // before any namespace is created.
    nsmnt()
        .arg("-o")
        .arg("/opt/app,upperdir=/u,workdir=/w")
        .arg("--")
        .arg("/bin/true")
        .assert()
        .code(33)
        .stderr(predicate::str::contains("Missing lowerdir"));
}

#[test]
fn missing_command_exits_22() {
    nsmnt()
        .arg("-m")
        .arg("bind,/usr,/tmp/x")
        .assert()
        .code(22)
        .stderr(predicate::str::contains("Missing child commandline"));
}

#[test]
fn help_exits_zero() {
    nsmnt().arg("--help").assert().code(0);
    nscage().arg("--help").assert().code(0);
}

#[test]
fn unknown_flag_exits_one() {
    nsmnt()
        .arg("--definitely-not-a-flag")
        .arg("--")
        .arg("/bin/true")
        .assert()
        .code(1);
}

// --- nscage sanity checks (exit 5) ---

#[test]
fn create_and_join_conflict_exits_5() {
    nscage()
        .arg("-c")
        .arg("/tmp/a")
        .arg("-j")
        .arg("/tmp/b")
        .assert()
        .code(5)
        .stderr(predicate::str::contains("-c and -j"));
}

#[test]
fn join_with_setup_options_exits_5() {
    nscage()
        .arg("-j")
        .arg("/tmp/a")
        .arg("-M")
        .assert()
        .code(5);
}

#[test]
fn daemon_without_reference_exits_5() {
    nscage().arg("-D").assert().code(5);
}

#[test]
fn fakeroot_with_join_exits_5() {
    nscage().arg("-r").arg("-j").arg("/tmp/a").assert().code(5);
}

#[test]
fn joining_missing_reference_fails_with_enoent() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("no-such-ref");
    nscage()
        .arg("-j")
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No such file"));
}

#[test]
fn joining_stale_reference_prunes_it() {
    let tmp = TempDir::new().unwrap();
    let link = tmp.path().join("stale-ref");
    std::os::unix::fs::symlink("/proc/99999999/ns", &link).unwrap();
    nscage().arg("-j").arg(&link).assert().failure();
    assert!(
        std::fs::symlink_metadata(&link).is_err(),
        "stale reference should have been unlinked"
    );
}

// --- Namespace-dependent behavior (skipped when the kernel refuses) ---

#[test]
fn plain_command_runs_in_fresh_namespace() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    nsmnt()
        .arg("--")
        .arg("/bin/echo")
        .arg("inside")
        .assert()
        .success()
        .stdout(predicate::str::contains("inside"));
}

#[test]
fn command_exit_code_is_propagated() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    nsmnt()
        .arg("--")
        .arg("/bin/sh")
        .arg("-c")
        .arg("exit 3")
        .assert()
        .code(3);
}

#[test]
fn uid_is_mapped_to_caller() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    let uid = nix::unistd::getuid().as_raw().to_string();
    nsmnt()
        .arg("--")
        .arg("/bin/id")
        .arg("-u")
        .assert()
        .success()
        .stdout(predicate::str::contains(uid));
}

#[test]
fn id_maps_are_installed_before_the_child_runs() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    let uid = nix::unistd::getuid().as_raw();
    nsmnt()
        .arg("--")
        .arg("/bin/cat")
        .arg("/proc/self/uid_map")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{uid}")));
    nsmnt()
        .arg("--")
        .arg("/bin/cat")
        .arg("/proc/self/setgroups")
        .assert()
        .success()
        .stdout(predicate::str::contains("deny"));
}

#[test]
fn bind_round_trip_exposes_source_content() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let mut f = std::fs::File::create(src.path().join("probe")).unwrap();
    writeln!(f, "hello from the source").unwrap();

    nsmnt()
        .arg("-m")
        .arg(format!(
            "rbind,{},{}",
            src.path().display(),
            dst.path().display()
        ))
        .arg("--")
        .arg("/bin/cat")
        .arg(dst.path().join("probe"))
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from the source"));
}

#[test]
fn read_only_bind_rejects_writes() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    std::fs::write(src.path().join("probe"), b"x").unwrap();

    nsmnt()
        .arg("-m")
        .arg(format!(
            "rbind,{},{}",
            src.path().display(),
            dst.path().display()
        ))
        .arg("-m")
        .arg(format!(",none,{},bind,remount,ro", dst.path().display()))
        .arg("--")
        .arg("/bin/sh")
        .arg("-c")
        .arg(format!("echo nope > {}/probe", dst.path().display()))
        .assert()
        .failure();
}

#[test]
fn mkdir_option_creates_missing_mountpoint() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    let src = TempDir::new().unwrap();
    let parent = TempDir::new().unwrap();
    std::fs::write(src.path().join("probe"), b"made it").unwrap();
    let target = parent.path().join("a/b");

    nsmnt()
        .arg("-m")
        .arg(format!(
            "rbind,{},{},mkdir=maybe",
            src.path().display(),
            target.display()
        ))
        .arg("--")
        .arg("/bin/cat")
        .arg(target.join("probe"))
        .assert()
        .success()
        .stdout(predicate::str::contains("made it"));
}

#[test]
fn missing_mountpoint_exits_41() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    let src = TempDir::new().unwrap();
    let parent = TempDir::new().unwrap();
    let target = parent.path().join("does/not/exist");

    let output = nsmnt()
        .arg("-m")
        .arg(format!(
            "rbind,{},{}",
            src.path().display(),
            target.display()
        ))
        .arg("--")
        .arg("/bin/true")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(41));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Mountpoint doesn't exist"));
}

#[test]
fn overlay_tmp_shadow_makes_target_writable() {
    if !userns_available() {
        eprintln!("skipping: unprivileged user namespaces unavailable");
        return;
    }
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("lower-file"), b"from below").unwrap();

    // Unprivileged overlayfs needs a recent kernel; probe with the real
    // spec and skip if the kernel refuses the mount.
    let output = nsmnt()
        .arg("-o")
        .arg(format!("{},shadow,tmp", dir.path().display()))
        .arg("--")
        .arg("/bin/sh")
        .arg("-c")
        .arg(format!(
            "cat {0}/lower-file && echo scribble > {0}/upper-file && cat {0}/upper-file",
            dir.path().display()
        ))
        .output()
        .unwrap();
    if !output.status.success() {
        eprintln!("skipping: overlayfs in a user namespace unavailable");
        return;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("from below"));
    assert!(stdout.contains("scribble"));
    // Writes were diverted into the temp upper layer, not the host dir.
    assert!(!dir.path().join("upper-file").exists());
}
