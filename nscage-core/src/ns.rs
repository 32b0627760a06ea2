//! Joinable namespace references and the paths into existing namespaces.
//!
//! A reference is a symlink whose target is `/proc/<pid>/ns`; the kernel
//! namespace objects behind it live exactly as long as their member
//! processes, so a reference can go stale and must then be pruned.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sched::{setns, CloneFlags};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::warn;

use crate::chain::{Chain, ChainResult};
use crate::fd::Fd;
use crate::fs;

/// A filesystem pointer at a process's namespace set.
///
/// Weak: the symlink does not keep the namespaces alive.
#[derive(Debug, Clone)]
pub struct NamespaceRef {
    path: PathBuf,
}

impl NamespaceRef {
    /// Wrap an existing reference path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        NamespaceRef { path: path.into() }
    }

    /// Publish a reference to `pid`'s namespaces at `path`.
    ///
    /// Only create this after the owner finished its setup; consumers
    /// join whatever state they find.
    pub fn create(path: impl Into<PathBuf>, pid: Pid) -> nix::Result<Self> {
        let path = path.into();
        fs::symlink(Path::new(&format!("/proc/{pid}/ns")), &path)?;
        Ok(NamespaceRef { path })
    }

    /// The reference's own path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the link exists at all (stale or not).
    pub fn link_exists(&self) -> bool {
        nix::sys::stat::lstat(&self.path).is_ok()
    }

    /// A reference is stale when the link is present but its target is
    /// gone, i.e. the owning process has exited.
    pub fn is_stale(&self) -> bool {
        self.link_exists() && nix::sys::stat::stat(&self.path).is_err()
    }

    /// Remove the reference if it is stale. Returns whether it was
    /// pruned.
    pub fn prune_stale(&self) -> bool {
        if self.is_stale() {
            warn!(path = %self.path.display(), "cleaning up stale namespace reference");
            let _ = fs::unlink(&self.path);
            true
        } else {
            false
        }
    }

    /// Open the reference as a directory fd for `setns` use.
    pub fn open_dir(&self) -> Result<Fd, Errno> {
        let fd = nix::fcntl::open(
            &self.path,
            nix::fcntl::OFlag::O_DIRECTORY | nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_CLOEXEC,
            nix::sys::stat::Mode::empty(),
        )?;
        Ok(unsafe { Fd::from_raw(fd) })
    }

    /// Delete the reference.
    pub fn remove(&self) {
        let _ = fs::unlink(&self.path);
    }
}

/// `setns` on the namespace file `name` inside the reference directory.
pub fn setns_at(dir: &Fd, name: &str, nstype: CloneFlags) -> Result<(), Errno> {
    let cname = CString::new(name).map_err(|_| Errno::EINVAL)?;
    let raw = unsafe {
        libc::openat(
            dir.raw(),
            cname.as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if raw < 0 {
        return Err(Errno::last());
    }
    let fd = unsafe { Fd::from_raw(raw) };
    match fd.as_fd() {
        Some(borrowed) => setns(borrowed, nstype),
        None => Err(Errno::EBADF),
    }
}

/// The parent half of joining: enter the target's user and pid
/// namespaces, so subsequent clones land in them.
pub fn join_parent(dir: &Fd) -> ChainResult {
    Chain::new()
        .then("setns_p_user", || setns_at(dir, "user", CloneFlags::CLONE_NEWUSER))
        .then("setns_p_pid", || setns_at(dir, "pid", CloneFlags::CLONE_NEWPID))
        .finish()
}

/// The child half of joining: enter the mount namespace. The user
/// namespace is already inherited from the parent's `setns`.
pub fn join_child(dir: &Fd) -> ChainResult {
    Chain::new()
        .then("setns_c_mnt", || setns_at(dir, "mnt", CloneFlags::CLONE_NEWNS))
        .finish()
}

fn drain_zombies() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!(error = %e, "waitpid while reaping");
                break;
            }
        }
    }
}

/// Run as PID 1 of a pid namespace: reap zombies until this process is
/// the namespace's last inhabitant.
///
/// Blocks `SIGCHLD`, watches it through a signalfd with a periodic
/// 60-second timeout, and after every drain counts the numeric entries
/// of `/proc`; one entry left means success.
pub fn pid1() -> i32 {
    match pid1_inner() {
        Ok(code) => code,
        Err(errno) => {
            eprintln!("namespace keepalive failed: {errno}");
            -(errno as i32)
        }
    }
}

fn pid1_inner() -> Result<i32, Errno> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block()?;

    let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?;

    loop {
        let mut readfds = FdSet::new();
        readfds.insert(sfd.as_fd());
        let mut tv = TimeVal::new(60, 0);
        match select(
            sfd.as_fd().as_raw_fd() + 1,
            Some(&mut readfds),
            None,
            None,
            Some(&mut tv),
        ) {
            Ok(0) => {}
            Ok(_) => {
                match sfd.read_signal() {
                    Ok(Some(si)) => {
                        if si.ssi_signo != Signal::SIGCHLD as u32 {
                            warn!(signo = si.ssi_signo, "unexpected signal on signalfd");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
                drain_zombies();
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }

        if fs::count_numeric_entries(Path::new("/proc"))? <= 1 {
            return Ok(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reference_to_live_process_is_not_stale() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("ns");
        let ns = NamespaceRef::create(&link, nix::unistd::getpid()).unwrap();
        assert!(ns.link_exists());
        assert!(!ns.is_stale());
        assert!(!ns.prune_stale());
        assert!(ns.open_dir().is_ok());
        ns.remove();
        assert!(!ns.link_exists());
    }

    #[test]
    fn stale_reference_is_pruned() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("ns");
        // A pid that cannot exist: beyond any reasonable pid_max.
        fs::symlink(Path::new("/proc/99999999/ns"), &link).unwrap();
        let ns = NamespaceRef::new(&link);
        assert!(ns.is_stale());
        assert!(ns.prune_stale());
        assert!(!ns.link_exists());
        // Pruning again is a no-op.
        assert!(!ns.prune_stale());
    }

    #[test]
    fn missing_reference_is_not_stale() {
        let ns = NamespaceRef::new("/nonexistent/path/ns");
        assert!(!ns.link_exists());
        assert!(!ns.is_stale());
    }

    #[test]
    fn own_namespace_dir_yields_setns_files() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("ns");
        let ns = NamespaceRef::create(&link, nix::unistd::getpid()).unwrap();
        let dir = ns.open_dir().unwrap();
        // Entering our own active namespaces is rejected, but the files
        // must resolve: the error comes from setns, not from openat.
        match setns_at(&dir, "mnt", CloneFlags::CLONE_NEWNS) {
            Ok(()) => {}
            Err(e) => assert_ne!(e, Errno::ENOENT),
        }
        ns.remove();
    }
}
