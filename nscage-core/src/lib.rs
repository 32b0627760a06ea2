//! nscage-core - Namespace Construction Engine
//!
//! Reusable primitives for building lightweight, unprivileged containers
//! out of the user, mount, and pid namespaces:
//!
//! - enter a new user namespace as a single chosen uid/gid
//!   ([`idmap::unshare_single`], [`child::uvclone_single`]),
//! - construct a mount-namespace view from a declarative [`recipe`] of
//!   mounts, overlays, and copies,
//! - spawn children on freshly mapped stacks sharing virtual memory with
//!   the parent for synchronised setup ([`child`], [`sync`]),
//! - optionally expose the constructed namespace set as a joinable
//!   reference ([`ns::NamespaceRef`], [`launch::join`]).
//!
//! The ordering discipline throughout is the short-circuit [`chain`]:
//! ordered fallible steps that abort on the first failure and carry a
//! static label identifying the step that failed.

pub mod chain;
pub mod child;
pub mod errors;
pub mod fd;
pub mod fs;
pub mod gui;
pub mod idmap;
pub mod launch;
pub mod mount;
pub mod ns;
pub mod pipe;
pub mod recipe;
pub mod spec;
pub mod sync;

pub use chain::{Chain, ChainError, ChainResult};
pub use child::{popen, uvclone, uvclone_single, vclone, ChildRef, DEFAULT_STACK_SIZE};
pub use errors::{ChildError, ParseError, ProtocolError, ResourceError, SetupError};
pub use fd::Fd;
pub use idmap::{IdMap, IdMapEntry};
pub use launch::{join, launch, GuiMounts, Launch};
pub use ns::NamespaceRef;
pub use pipe::Pipe;
pub use recipe::{
    BindStep, CopyStep, ExecSpec, MkdirPolicy, MountMode, MountStep, OverlayStep, PivotStep,
    Recipe, Step,
};
pub use sync::{SemBacking, Semapair};
