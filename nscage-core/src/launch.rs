//! Top-level drivers: spawn the namespace-building child and supervise
//! it, or attach to a namespace set someone else keeps alive.
//!
//! The launch protocol, in order: resolve the recipe in the parent,
//! clone the child into fresh user+mount (and optionally pid)
//! namespaces, write its id maps, wait for the child to report that the
//! view is built, publish the namespace reference if asked to, then wait
//! and clean up.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::child::{self, DEFAULT_STACK_SIZE};
use crate::gui;
use crate::ns::{self, NamespaceRef};
use crate::recipe::{exec_app_code, ExecSpec, MountMode, Recipe};
use crate::sync::{SemBacking, Semapair};

static FORWARD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: libc::c_int) {
    let pid = FORWARD_PID.load(Ordering::Relaxed);
    if pid > 0 {
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

/// Ignore SIGINT (assumed to be delivered session-wide) and forward
/// SIGTERM to the recorded child.
fn install_forwarding(pid: Pid) {
    FORWARD_PID.store(pid.as_raw(), Ordering::Relaxed);
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::SigIgn);
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(forward_signal));
    }
}

/// GUI support-mount parameters; paths relative to the new root.
#[derive(Debug, Clone)]
pub struct GuiMounts {
    /// The root being populated.
    pub root: PathBuf,
    /// Home subtree, relative.
    pub home_rel: PathBuf,
    /// Runtime dir (`run/user/<uid>`), relative.
    pub rundir_rel: PathBuf,
}

/// Everything needed to construct and occupy a namespace set.
pub struct Launch {
    /// Steps applied after the base layout.
    pub recipe: Recipe,
    /// What to run once the view is built.
    pub exec: ExecSpec,
    /// Base root layout.
    pub mode: MountMode,
    /// Bind GUI support paths before the recipe runs.
    pub gui: Option<GuiMounts>,
    /// Also unshare the pid namespace.
    pub pid_ns: bool,
    /// Do not exec; idle as the namespace keepalive (PID 1 reaper).
    pub idle: bool,
    /// Publish a joinable reference here once setup completed.
    pub ns_ref: Option<PathBuf>,
    /// Called in the parent with the child pid once setup completed
    /// successfully; used to hand the pid to whoever is waiting to join.
    pub on_ready: Option<Box<dyn FnOnce(Pid)>>,
    /// Child stack size.
    pub stack_size: usize,
}

impl Launch {
    /// A launch with defaults: recipe only, no pid namespace, exec mode.
    pub fn new(recipe: Recipe, exec: ExecSpec) -> Self {
        Launch {
            recipe,
            exec,
            mode: MountMode::RecipeOnly,
            gui: None,
            pid_ns: false,
            idle: false,
            ns_ref: None,
            on_ready: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Build the namespace set and run the target, returning its exit code.
pub fn launch(mut launch: Launch) -> Result<i32> {
    launch
        .recipe
        .resolve()
        .context("resolving overlay steps")?;
    // The child moves the recipe; remember what to delete afterwards.
    let cleanup_paths: Vec<PathBuf> = launch.recipe.cleanup_paths().to_vec();

    let mut flags = CloneFlags::CLONE_NEWNS;
    if launch.pid_ns {
        flags |= CloneFlags::CLONE_NEWPID;
    }

    // Private backing suffices: the child shares this address space.
    let (ready, ready_child) = Semapair::pair(SemBacking::Private)?;
    let status = Arc::new(AtomicI32::new(i32::MIN));
    let child_status = Arc::clone(&status);

    let uid = launch.exec.target_uid;
    let gid = launch.exec.target_gid;
    let recipe = launch.recipe;
    let mode = launch.mode;
    let gui_mounts = launch.gui;
    let idle = launch.idle;
    let mut exec = launch.exec;

    let child_fn = move || -> i32 {
        let code = (|| {
            if let Err(e) = mode.apply() {
                eprintln!("{e}");
                return e.exit_code();
            }
            if let Some(g) = &gui_mounts {
                match gui::mount_gui(&g.root, &g.home_rel, &g.rundir_rel) {
                    Ok(pulse) => {
                        exec.env_overrides
                            .entry("PULSE_SERVER".to_string())
                            .or_insert(pulse);
                    }
                    Err(e) => {
                        eprintln!("{}: {}", e.label, Errno::from_raw(e.code));
                        return -e.code;
                    }
                }
            }
            if let Err(e) = recipe.execute() {
                eprintln!("{e}");
                return e.exit_code();
            }
            0
        })();

        child_status.store(code, Ordering::SeqCst);
        ready_child.post();
        if code != 0 {
            return code;
        }
        if idle {
            ns::pid1()
        } else {
            exec_app_code(&exec)
        }
    };

    let (mut child, map_result) =
        child::uvclone_single(uid, gid, child_fn, launch.stack_size, flags)?;
    install_forwarding(child.pid());

    if let Some(protocol_err) = map_result {
        // The child woke with no valid id mapping; nothing good can
        // come of letting it continue.
        let _ = child.kill(Signal::SIGKILL);
        let _ = child.wait();
        for path in &cleanup_paths {
            let _ = std::fs::remove_dir_all(path);
        }
        return Err(protocol_err).context("id-map rendezvous failed");
    }

    let mut published: Option<NamespaceRef> = None;
    if launch.ns_ref.is_some() || launch.on_ready.is_some() {
        ready.wait();
        if status.load(Ordering::SeqCst) == 0 {
            if let Some(ref_path) = &launch.ns_ref {
                published = Some(
                    NamespaceRef::create(ref_path.clone(), child.pid())
                        .with_context(|| format!("publishing {}", ref_path.display()))?,
                );
                debug!(path = %ref_path.display(), pid = child.pid().as_raw(), "namespace reference published");
            }
            if let Some(on_ready) = launch.on_ready.take() {
                on_ready(child.pid());
            }
        }
    }

    let code = child.wait().context("waiting for namespace child")?;

    if let Some(ns_ref) = published {
        ns_ref.remove();
    }
    for path in &cleanup_paths {
        if let Err(e) = std::fs::remove_dir_all(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove temp root");
        }
    }

    Ok(code)
}

/// Attach to the namespace set behind `ns_path` and run the target
/// there.
///
/// The user and pid namespaces must be entered in this (parent) process
/// so the cloned child is born into the target pid namespace; the child
/// then enters the mount namespace itself and execs.
pub fn join(ns_path: &std::path::Path, exec: ExecSpec, stack_size: usize) -> Result<i32> {
    let ns_ref = NamespaceRef::new(ns_path);
    if ns_ref.prune_stale() {
        return Err(Errno::ENOENT).with_context(|| {
            format!("stale namespace reference removed: {}", ns_path.display())
        });
    }
    if !ns_ref.link_exists() {
        return Err(Errno::ENOENT)
            .with_context(|| format!("no such namespace reference: {}", ns_path.display()));
    }

    let dir = ns_ref
        .open_dir()
        .with_context(|| format!("opening {}", ns_path.display()))?;

    ns::join_parent(&dir)
        .map_err(crate::errors::SetupError::from)
        .context("entering user/pid namespaces")?;

    let child_fn = move || -> i32 {
        if let Err(e) = ns::join_child(&dir) {
            eprintln!("{}: {}", e.label, Errno::from_raw(e.code));
            return -e.code;
        }
        exec_app_code(&exec)
    };

    let mut child = child::vclone(child_fn, stack_size, CloneFlags::empty())?;
    install_forwarding(child.pid());
    child.wait().context("waiting for joined child")
}
