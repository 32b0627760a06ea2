//! Child process spawning.
//!
//! Two entry points: a popen-style fork/exec with a bidirectional pipe,
//! and `clone(2)` with a freshly mapped stack and `CLONE_VM`, so parent
//! and child share the address space during setup. The shared-VM variants
//! carry a boxed closure whose owner stays on the parent side; the box
//! and the stack are released exactly once, after the child has been
//! reaped.

use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::warn;

use crate::errors::{ProtocolError, ResourceError};
use crate::fd::Fd;
use crate::idmap::{self, IdMap};
use crate::pipe::Pipe;
use crate::sync::{SemBacking, Semapair};

/// Default child stack size for the clone entry points.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Handle to a cloned child process.
///
/// Owns the child's stack mapping and boxed arguments through a cleanup
/// closure that runs exactly once when the child has been reaped.
/// Dropping an unwaited `ChildRef` is a programmer error and is
/// diagnosed, not silently ignored.
pub struct ChildRef {
    pid: Pid,
    cleanup: Option<Box<dyn FnOnce()>>,
    done: bool,
    status: i32,
}

impl ChildRef {
    fn new(pid: Pid, cleanup: Option<Box<dyn FnOnce()>>) -> Self {
        ChildRef {
            pid,
            cleanup,
            done: false,
            status: -1,
        }
    }

    /// The child's pid.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the child has already been reaped.
    pub fn waited(&self) -> bool {
        self.done
    }

    /// The exit code recorded by a completed wait/poll.
    pub fn status(&self) -> i32 {
        self.status
    }

    fn record(&mut self, status: WaitStatus) {
        self.status = match status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
            _ => 1,
        };
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
        self.done = true;
    }

    /// Block until the child exits; returns its exit code.
    pub fn wait(&mut self) -> nix::Result<i32> {
        if !self.done {
            let status = waitpid(self.pid, None)?;
            self.record(status);
        }
        Ok(self.status)
    }

    /// Non-blocking variant: `None` while the child is still running.
    pub fn poll(&mut self) -> nix::Result<Option<i32>> {
        if !self.done {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
                WaitStatus::StillAlive => return Ok(None),
                status => self.record(status),
            }
        }
        Ok(Some(self.status))
    }

    /// Send a signal to the child.
    pub fn kill(&self, signal: nix::sys::signal::Signal) -> nix::Result<()> {
        nix::sys::signal::kill(self.pid, signal)
    }
}

impl Drop for ChildRef {
    fn drop(&mut self) {
        if self.cleanup.is_some() {
            warn!(pid = self.pid.as_raw(), "child handle dropped without waiting");
        }
    }
}

struct Payload {
    func: Box<dyn FnMut() -> i32 + Send>,
    // When set, the child parks here until the parent finishes id-map
    // setup.
    gate: Option<Semapair>,
}

// The trampoline runs on a synthetic stack inside the parent's address
// space. It must not return into parent frames; libc's clone wrapper
// _exits with the returned code.
extern "C" fn trampoline(arg: *mut libc::c_void) -> libc::c_int {
    let payload = unsafe { &mut *arg.cast::<Payload>() };
    if let Some(gate) = &payload.gate {
        gate.rendezvous();
    }
    (payload.func)()
}

fn do_clone(
    payload: Box<Payload>,
    stack_size: usize,
    flags: CloneFlags,
) -> Result<ChildRef, ResourceError> {
    let size = stack_size.max(16 * 1024);
    let len = NonZeroUsize::new(size).ok_or(ResourceError::StackAlloc {
        size,
        errno: Errno::EINVAL,
    })?;
    let stack: NonNull<libc::c_void> = unsafe {
        mmap_anonymous(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_STACK,
        )
    }
    .map_err(|errno| ResourceError::StackAlloc { size, errno })?;

    let arg = Box::into_raw(payload);
    let top = unsafe { stack.as_ptr().cast::<u8>().add(size) };
    // SIGCHLD is required for ChildRef reaping to work.
    let pid = unsafe {
        libc::clone(
            trampoline,
            top.cast(),
            libc::SIGCHLD | flags.bits(),
            arg.cast(),
        )
    };

    if pid < 0 {
        let errno = Errno::last();
        unsafe {
            drop(Box::from_raw(arg));
            let _ = munmap(stack, size);
        }
        return Err(ResourceError::Clone(errno));
    }

    let cleanup = Box::new(move || unsafe {
        drop(Box::from_raw(arg));
        let _ = munmap(stack, size);
    });
    Ok(ChildRef::new(Pid::from_raw(pid), Some(cleanup)))
}

/// Spawn a child sharing this process's virtual memory.
///
/// `func` runs once in the child and must end the process: its return
/// value becomes the child's exit code.
pub fn vclone<F>(func: F, stack_size: usize, flags: CloneFlags) -> Result<ChildRef, ResourceError>
where
    F: FnMut() -> i32 + Send + 'static,
{
    do_clone(
        Box::new(Payload {
            func: Box::new(func),
            gate: None,
        }),
        stack_size,
        CloneFlags::CLONE_VM | flags,
    )
}

/// Like [`vclone`], with a private semaphore pair for synchronisation.
///
/// The child endpoint is handed to `func`; the parent endpoint is
/// returned alongside the handle.
pub fn svclone<F>(
    func: F,
    stack_size: usize,
    flags: CloneFlags,
) -> Result<(ChildRef, Semapair), ResourceError>
where
    F: FnMut(&Semapair) -> i32 + Send + 'static,
{
    let (parent_end, child_end) = Semapair::pair(SemBacking::Private)?;
    let mut func = func;
    let mut slot = Some(child_end);
    let child = vclone(
        move || {
            let end = match &slot {
                Some(end) => end,
                None => return libc::EINVAL,
            };
            let code = func(end);
            slot = None;
            code
        },
        stack_size,
        flags,
    )?;
    Ok((child, parent_end))
}

/// Spawn a child in a fresh user namespace with the given id maps.
///
/// Protocol: the child parks on a shared semaphore pair immediately; the
/// parent writes `uid_map`, `setgroups=deny`, `gid_map` in that order,
/// then releases it. A failed map write is returned next to the handle —
/// the child exists either way and must be reaped by the caller.
pub fn uvclone<F>(
    uidmap: &IdMap,
    gidmap: &IdMap,
    func: F,
    stack_size: usize,
    flags: CloneFlags,
) -> Result<(ChildRef, Option<ProtocolError>), ResourceError>
where
    F: FnMut() -> i32 + Send + 'static,
{
    let (parent_gate, child_gate) = Semapair::pair(SemBacking::Shared)?;
    let child = do_clone(
        Box::new(Payload {
            func: Box::new(func),
            gate: Some(child_gate),
        }),
        stack_size,
        CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_VM | flags,
    )?;

    // Child has posted and is waiting for its ids to exist.
    parent_gate.wait();

    let pid = child.pid();
    let io_errno = |e: std::io::Error| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EPERM));
    let map_result = uidmap
        .write(&idmap::map_path(pid, "uid"))
        .map_err(|e| ProtocolError {
            stage: "uid_map",
            pid,
            errno: io_errno(e),
        })
        .and_then(|()| {
            idmap::deny_setgroups(pid).map_err(|e| ProtocolError {
                stage: "setgroups",
                pid,
                errno: io_errno(e),
            })
        })
        .and_then(|()| {
            gidmap.write(&idmap::map_path(pid, "gid")).map_err(|e| ProtocolError {
                stage: "gid_map",
                pid,
                errno: io_errno(e),
            })
        });

    parent_gate.post();

    Ok((child, map_result.err()))
}

/// [`uvclone`] with one-entry maps: `uid`/`gid` inside, the caller's real
/// ids outside.
pub fn uvclone_single<F>(
    uid: u32,
    gid: u32,
    func: F,
    stack_size: usize,
    flags: CloneFlags,
) -> Result<(ChildRef, Option<ProtocolError>), ResourceError>
where
    F: FnMut() -> i32 + Send + 'static,
{
    let uidmap = IdMap::single(uid, unistd::getuid().as_raw());
    let gidmap = IdMap::single(gid, unistd::getgid().as_raw());
    uvclone(&uidmap, &gidmap, func, stack_size, flags)
}

fn to_cstrings(argv: &[String]) -> Result<Vec<CString>, Errno> {
    argv.iter()
        .map(|a| CString::new(a.as_str()).map_err(|_| Errno::EINVAL))
        .collect()
}

/// Spawn `argv` with its stdin and stdout connected to a pipe.
///
/// The child performs only closes/dups and exec before the parent
/// resumes; lookup uses `PATH`.
pub fn popen(argv: &[String]) -> Result<(Pid, Pipe), ResourceError> {
    let cargs = to_cstrings(argv).map_err(ResourceError::Pipe)?;

    // to-child carries the child's stdin, from-child its stdout.
    let (their_stdin_r, their_stdin_w) =
        unistd::pipe().map_err(ResourceError::Pipe)?;
    let (their_stdout_r, their_stdout_w) =
        unistd::pipe().map_err(ResourceError::Pipe)?;

    match unsafe { unistd::fork() }.map_err(ResourceError::Clone)? {
        ForkResult::Child => {
            let stdin_ok = unsafe { libc::dup2(their_stdin_r.as_raw_fd(), 0) } == 0;
            let stdout_ok = unsafe { libc::dup2(their_stdout_w.as_raw_fd(), 1) } == 1;
            if !stdin_ok || !stdout_ok {
                unsafe { libc::_exit(127) };
            }
            drop(their_stdin_r);
            drop(their_stdin_w);
            drop(their_stdout_r);
            drop(their_stdout_w);
            let _ = unistd::execvp(&cargs[0], &cargs);
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => {
            drop(their_stdin_r);
            drop(their_stdout_w);
            let pipe = Pipe::new(Fd::from(their_stdout_r), Fd::from(their_stdin_w));
            Ok((child, pipe))
        }
    }
}

/// Fork, exec `argv`, and return the handle without waiting.
pub fn spawn(argv: &[String]) -> Result<ChildRef, ResourceError> {
    let cargs = to_cstrings(argv).map_err(ResourceError::Clone)?;
    match unsafe { unistd::fork() }.map_err(ResourceError::Clone)? {
        ForkResult::Child => {
            let _ = unistd::execvp(&cargs[0], &cargs);
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => Ok(ChildRef::new(child, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svclone_child_rendezvous_and_exit_code() {
        let (mut child, gate) = svclone(
            |gate| {
                gate.wait();
                42
            },
            DEFAULT_STACK_SIZE,
            CloneFlags::empty(),
        )
        .unwrap();
        gate.post();
        assert_eq!(child.wait().unwrap(), 42);
        assert!(child.waited());
    }

    #[test]
    fn poll_reports_running_then_exited() {
        let mut child = vclone(
            || {
                std::thread::sleep(std::time::Duration::from_millis(100));
                7
            },
            DEFAULT_STACK_SIZE,
            CloneFlags::empty(),
        )
        .unwrap();
        // May or may not still be running at first poll; eventually 7.
        loop {
            match child.poll().unwrap() {
                None => std::thread::sleep(std::time::Duration::from_millis(10)),
                Some(code) => {
                    assert_eq!(code, 7);
                    break;
                }
            }
        }
    }

    #[test]
    fn popen_round_trips_through_cat() {
        let (pid, mut pipe) = popen(&["cat".to_string()]).unwrap();
        pipe.write(b"through the pipe").unwrap();
        pipe.close_write();
        let mut buf = [0u8; 64];
        let n = pipe.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"through the pipe");
        waitpid(pid, None).unwrap();
    }

    #[test]
    fn spawn_runs_program_to_completion() {
        let mut child = spawn(&["true".to_string()]).unwrap();
        assert_eq!(child.wait().unwrap(), 0);
    }
}
