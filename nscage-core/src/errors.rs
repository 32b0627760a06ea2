//! Error types for the things that can go wrong while constructing a
//! namespace: spec parsing, recipe execution, resource allocation, the
//! parent/child id-map protocol, and the final exec.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::chain::ChainError;

/// Errors produced while parsing mount/overlay spec strings.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The spec did not contain the mandatory leading fields.
    #[error("Incomplete mount spec (need at least type,device,mountpoint): {spec}")]
    IncompleteMountSpec {
        /// The offending spec string.
        spec: String,
    },

    /// An overlay spec with no mountpoint.
    #[error("Incomplete overlay spec: {spec}")]
    IncompleteOverlaySpec {
        /// The offending spec string.
        spec: String,
    },

    /// `mkdir=` was given an argument other than never/maybe/require.
    #[error("Unknown mkdir= argument: {arg}")]
    UnknownMkdirArg {
        /// The unrecognised argument.
        arg: String,
    },

    /// Overlays need a lower layer, either explicit or via `shadow`.
    #[error("Missing lowerdir option")]
    MissingLowerdir,

    /// upperdir/workdir come as a pair.
    #[error("Must specify upperdir and workdir both or neither")]
    UpperWorkMismatch,

    /// The `tmp` overlay option could not allocate its backing directory.
    #[error("Could not create temporary directory for 'tmp' overlay option: {msg}")]
    TempDirFailed {
        /// Stringified I/O error.
        msg: String,
    },
}

/// A recipe step failed. Carries the static label of the failing step so
/// the driver can print `label: strerror(errno)`.
#[derive(Error, Debug)]
pub enum SetupError {
    /// A syscall inside a step returned an error.
    #[error("{label}: {errno}")]
    Syscall {
        /// Which step failed.
        label: &'static str,
        /// The errno it failed with.
        errno: Errno,
    },

    /// A mount target was absent and the step's mkdir policy forbade
    /// creating it.
    #[error("Mountpoint doesn't exist: {}", path.display())]
    MissingMountpoint {
        /// The absent target.
        path: PathBuf,
    },

    /// A mount target existed although the policy required creating it.
    #[error("Mountpoint exists but was required to be created: {}", path.display())]
    MountpointExists {
        /// The pre-existing target.
        path: PathBuf,
    },

    /// A filesystem copy step failed.
    #[error("copy {} -> {}", from.display(), to.display())]
    Copy {
        /// Copy source.
        from: PathBuf,
        /// Copy destination.
        to: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl SetupError {
    /// The step label to lead the user-visible message with.
    pub fn label(&self) -> &'static str {
        match self {
            SetupError::Syscall { label, .. } => label,
            SetupError::MissingMountpoint { .. } | SetupError::MountpointExists { .. } => {
                "mountpoint"
            }
            SetupError::Copy { .. } => "copy",
        }
    }

    /// Process exit code for this failure: 41 for mountpoint policy
    /// violations, the negated errno for syscall failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            SetupError::Syscall { errno, .. } => -(*errno as i32),
            SetupError::MissingMountpoint { .. } | SetupError::MountpointExists { .. } => 41,
            SetupError::Copy { source, .. } => -source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<ChainError> for SetupError {
    fn from(e: ChainError) -> Self {
        SetupError::Syscall {
            label: e.label,
            errno: Errno::from_raw(e.code),
        }
    }
}

/// Allocation of process-level resources failed. These are fatal.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// Could not map a child stack.
    #[error("failed to map child stack ({size} bytes)")]
    StackAlloc {
        /// Requested stack size.
        size: usize,
        /// The mmap errno.
        #[source]
        errno: Errno,
    },

    /// Could not map or initialise semaphore backing storage.
    #[error("failed to allocate semaphore pair")]
    SemAlloc(#[source] Errno),

    /// pipe2 failed.
    #[error("failed to allocate pipe")]
    Pipe(#[source] Errno),

    /// clone(2) itself failed.
    #[error("clone failed")]
    Clone(#[source] Errno),
}

/// The parent could not complete the id-map half of the rendezvous.
/// The child still exists and is parked; the caller must reap it.
#[derive(Error, Debug)]
#[error("{stage} failed for pid {pid}")]
pub struct ProtocolError {
    /// Which write failed: "uid_map", "setgroups", or "gid_map".
    pub stage: &'static str,
    /// The child the write was aimed at.
    pub pid: nix::unistd::Pid,
    /// The underlying error.
    #[source]
    pub errno: Errno,
}

/// Launching the target program inside the namespace failed.
#[derive(Error, Debug)]
pub enum ChildError {
    /// exec* returned.
    #[error("exec {argv0}")]
    ExecFailed {
        /// The program that failed to exec.
        argv0: String,
        /// The exec errno.
        #[source]
        errno: Errno,
    },

    /// The requested working directory could not be entered.
    #[error("Could not preserve working directory: {}", path.display())]
    CwdFailed {
        /// The directory that could not be entered.
        path: PathBuf,
        /// The chdir errno.
        #[source]
        errno: Errno,
    },
}
