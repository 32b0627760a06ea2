//! Mount recipes: the declarative step list a namespace view is built
//! from, and the executor that applies it inside a fresh mount
//! namespace.
//!
//! Order is significant; earlier steps are visible to later ones, and a
//! `PivotRoot` step invalidates absolute paths captured before it, so it
//! must come last. The executor does not second-guess ordering: it
//! surfaces the kernel's verdict together with the failing step's label.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{umount2, MntFlags, MsFlags};
use nix::unistd;
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::errors::{ChildError, ParseError, SetupError};
use crate::{fs, mount};

/// When a mount target is allowed or required to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MkdirPolicy {
    /// Never create; a missing target is an error.
    #[default]
    Never,
    /// Create the final component if missing.
    MaybeThis,
    /// Create the target and any missing parents.
    MaybeAll,
    /// The final component must not exist yet and is created.
    RequireThis,
    /// As `RequireThis`, creating parents as needed.
    RequireAll,
}

impl MkdirPolicy {
    fn requires_fresh(self) -> bool {
        matches!(self, MkdirPolicy::RequireThis | MkdirPolicy::RequireAll)
    }

    fn may_create(self) -> bool {
        !matches!(self, MkdirPolicy::Never)
    }

    fn recursive(self) -> bool {
        matches!(self, MkdirPolicy::MaybeAll | MkdirPolicy::RequireAll)
    }
}

/// A plain mount(2) invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountStep {
    /// Filesystem type; empty for bind/move/remount operations.
    pub fstype: String,
    /// Mount source / device.
    pub source: String,
    /// Mount target.
    pub target: PathBuf,
    /// Accumulated MS_* flags.
    pub flags: MsFlags,
    /// Passthrough options, comma-joined into the data argument.
    pub data: Vec<String>,
    /// Target-creation policy.
    pub mkdir: MkdirPolicy,
}

/// A declarative overlay mount; resolved into `Copy` + `Mount` steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayStep {
    /// Where the merged view is mounted.
    pub target: PathBuf,
    /// Colon-joined read-only layers.
    pub lowerdir: Option<String>,
    /// Writable upper layer.
    pub upperdir: Option<String>,
    /// Overlayfs scratch directory.
    pub workdir: Option<String>,
    /// Seed the upper layer from this path before mounting.
    pub copy_from: Option<PathBuf>,
    /// Derive upperdir/workdir from a fresh temporary directory.
    pub tmp: bool,
    /// Prepend the target's own pre-mount content to lowerdir.
    pub shadow: bool,
    /// Additional mount flags.
    pub flags: MsFlags,
    /// Additional passthrough options.
    pub extra: Vec<String>,
    /// Target-creation policy.
    pub mkdir: MkdirPolicy,
}

impl Default for OverlayStep {
    fn default() -> Self {
        OverlayStep {
            target: PathBuf::new(),
            lowerdir: None,
            upperdir: None,
            workdir: None,
            copy_from: None,
            tmp: false,
            shadow: false,
            flags: MsFlags::empty(),
            extra: Vec::new(),
            mkdir: MkdirPolicy::Never,
        }
    }
}

/// A filesystem copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStep {
    /// Copy source.
    pub source: PathBuf,
    /// Copy destination.
    pub target: PathBuf,
    /// Descend into subdirectories.
    pub recursive: bool,
}

/// Sugar for a bind mount, creating the target as needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindStep {
    /// Existing subtree to re-expose.
    pub source: PathBuf,
    /// Where to expose it.
    pub target: PathBuf,
    /// MS_REC.
    pub recursive: bool,
    /// Remount read-only after binding.
    pub read_only: bool,
}

/// Swap the root filesystem; terminal step of a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotStep {
    /// Directory that becomes `/`.
    pub new_root: PathBuf,
    /// Where the old root lands, relative to the new root.
    pub old_root: PathBuf,
    /// Keep the old root mounted instead of detaching it.
    pub keep_old: bool,
}

/// One step of a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Plain mount.
    Mount(MountStep),
    /// Declarative overlay.
    Overlay(OverlayStep),
    /// Filesystem copy.
    Copy(CopyStep),
    /// Bind-mount sugar.
    Bind(BindStep),
    /// Root swap; must be last.
    PivotRoot(PivotStep),
    /// Bind the path onto itself and remount it read-only, recursively.
    Protect(PathBuf),
}

impl Step {
    /// The static label surfaced when this step fails.
    pub fn label(&self) -> &'static str {
        match self {
            Step::Mount(_) => "mount",
            Step::Overlay(_) => "overlay",
            Step::Copy(_) => "copy",
            Step::Bind(_) => "bind",
            Step::PivotRoot(_) => "pivot_root",
            Step::Protect(_) => "protect",
        }
    }
}

/// An ordered list of steps plus the temp roots to delete after the
/// namespace is gone.
#[derive(Debug, Clone, Default)]
pub struct Recipe {
    steps: Vec<Step>,
    cleanup: Vec<PathBuf>,
}

impl Recipe {
    /// An empty recipe.
    pub fn new() -> Self {
        Recipe::default()
    }

    /// Append a step.
    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// The steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Whether any steps have been added.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Temp roots registered by overlay resolution; delete after the
    /// last process using the namespace exited.
    pub fn cleanup_paths(&self) -> &[PathBuf] {
        &self.cleanup
    }

    /// Register an extra path for post-exit cleanup.
    pub fn register_cleanup(&mut self, path: PathBuf) {
        self.cleanup.push(path);
    }

    /// Expand declarative overlay steps into concrete `Copy` + `Mount`
    /// steps, allocating temp directories and taking ownership of the
    /// derived option strings.
    ///
    /// Call before handing the recipe to the executor child so temp
    /// roots are registered on the parent side.
    pub fn resolve(&mut self) -> Result<(), ParseError> {
        let steps = std::mem::take(&mut self.steps);
        let mut resolved = Vec::with_capacity(steps.len());
        for step in steps {
            match step {
                Step::Overlay(o) => {
                    let (copy, mount, temp_root) = resolve_overlay(&o)?;
                    if let Some(root) = temp_root {
                        self.cleanup.push(root);
                    }
                    if let Some(c) = copy {
                        resolved.push(Step::Copy(c));
                    }
                    resolved.push(Step::Mount(mount));
                }
                other => resolved.push(other),
            }
        }
        self.steps = resolved;
        Ok(())
    }

    /// Run the steps in order inside the current (fresh) mount
    /// namespace.
    ///
    /// Stops at the first failure; steps before it stay applied, steps
    /// after it are never attempted.
    pub fn execute(&self) -> Result<(), SetupError> {
        for step in &self.steps {
            debug!(step = step.label(), "recipe step");
            match step {
                Step::Mount(m) => execute_mount(m)?,
                Step::Overlay(o) => {
                    // Unresolved overlay: expand in place. The temp root
                    // cannot be registered from here; resolve() first to
                    // get cleanup tracking.
                    warn!(target = %o.target.display(), "executing unresolved overlay step");
                    let (copy, mount, _temp_root) =
                        resolve_overlay(o).map_err(|_| SetupError::Syscall {
                            label: "overlay",
                            errno: Errno::EINVAL,
                        })?;
                    if let Some(c) = copy {
                        execute_copy(&c)?;
                    }
                    execute_mount(&mount)?;
                }
                Step::Copy(c) => execute_copy(c)?,
                Step::Bind(b) => execute_bind(b)?,
                Step::PivotRoot(p) => execute_pivot(p)?,
                Step::Protect(path) => mount::protect_path(path).map_err(SetupError::from)?,
            }
        }
        Ok(())
    }

    /// Delete registered temp roots. Best-effort; failures are logged.
    pub fn cleanup(&self) {
        for path in &self.cleanup {
            if let Err(e) = std::fs::remove_dir_all(path) {
                warn!(path = %path.display(), error = %e, "could not remove overlay temp root");
            }
        }
    }
}

fn resolve_overlay(
    o: &OverlayStep,
) -> Result<(Option<CopyStep>, MountStep, Option<PathBuf>), ParseError> {
    let mut lowerdir = o.lowerdir.clone();
    let mut upperdir = o.upperdir.clone();
    let mut workdir = o.workdir.clone();
    let mut temp_root = None;

    if o.shadow {
        let target = o.target.to_string_lossy().into_owned();
        lowerdir = Some(match lowerdir {
            Some(rest) if !rest.is_empty() => format!("{target}:{rest}"),
            _ => target,
        });
    }

    if o.tmp {
        let root = fs::temp_dir("overlay-").map_err(|e| ParseError::TempDirFailed {
            msg: e.to_string(),
        })?;
        let upper = root.join("upper");
        let work = root.join("work");
        for dir in [&upper, &work] {
            fs::mkdir(dir, 0o755).map_err(|e| ParseError::TempDirFailed {
                msg: e.to_string(),
            })?;
        }
        upperdir = Some(upper.to_string_lossy().into_owned());
        workdir = Some(work.to_string_lossy().into_owned());
        temp_root = Some(root);
    }

    let lowerdir = match lowerdir {
        Some(l) if !l.is_empty() => l,
        _ => return Err(ParseError::MissingLowerdir),
    };

    let mut data = vec![format!("lowerdir={lowerdir}")];
    let mut copy = None;
    match (&upperdir, &workdir) {
        (Some(upper), Some(work)) => {
            data.push(format!("upperdir={upper}"));
            data.push(format!("workdir={work}"));
            if let Some(from) = &o.copy_from {
                copy = Some(CopyStep {
                    source: from.clone(),
                    target: PathBuf::from(upper),
                    recursive: true,
                });
            }
        }
        (None, None) => {
            if o.copy_from.is_some() {
                return Err(ParseError::UpperWorkMismatch);
            }
        }
        _ => return Err(ParseError::UpperWorkMismatch),
    }
    data.extend(o.extra.iter().cloned());

    Ok((
        copy,
        MountStep {
            fstype: "overlay".into(),
            source: "overlay".into(),
            target: o.target.clone(),
            flags: o.flags,
            data,
            mkdir: o.mkdir,
        },
        temp_root,
    ))
}

fn ensure_target(target: &Path, policy: MkdirPolicy) -> Result<(), SetupError> {
    if fs::exists(target) {
        if policy.requires_fresh() {
            return Err(SetupError::MountpointExists {
                path: target.to_path_buf(),
            });
        }
        return Ok(());
    }
    if !policy.may_create() {
        return Err(SetupError::MissingMountpoint {
            path: target.to_path_buf(),
        });
    }
    let created = if policy.recursive() {
        fs::mkdir_p(target, 0o755).map(|_| ())
    } else {
        fs::mkdir(target, 0o755)
    };
    created.map_err(|errno| SetupError::Syscall {
        label: "mkdir",
        errno,
    })
}

fn execute_mount(m: &MountStep) -> Result<(), SetupError> {
    ensure_target(&m.target, m.mkdir)?;
    let data = m.data.join(",");
    let data = if data.is_empty() {
        None
    } else {
        Some(data.as_str())
    };
    mount::mount(&m.source, &m.target, &m.fstype, m.flags, data).map_err(|errno| {
        SetupError::Syscall {
            label: "mount",
            errno,
        }
    })
}

fn execute_copy(c: &CopyStep) -> Result<(), SetupError> {
    fs::copy_tree(&c.source, &c.target, c.recursive).map_err(|errno| SetupError::Copy {
        from: c.source.clone(),
        to: c.target.clone(),
        source: std::io::Error::from(errno),
    })
}

fn execute_bind(b: &BindStep) -> Result<(), SetupError> {
    // Create the target to match the source's shape.
    if !fs::exists(&b.target) {
        let made = if fs::is_dir(&b.source) {
            fs::mkdir_p(&b.target, 0o755).map(|_| ())
        } else {
            match b.target.parent() {
                Some(parent) => fs::mkdir_p(parent, 0o755).map(|_| ()),
                None => Ok(()),
            }
            .and_then(|()| fs::touch(&b.target, 0o644))
        };
        made.map_err(|errno| SetupError::Syscall {
            label: "bind_target",
            errno,
        })?;
    }

    let flags = if b.recursive {
        MsFlags::MS_REC
    } else {
        MsFlags::empty()
    };
    mount::bind(&b.source, &b.target, flags).map_err(|errno| SetupError::Syscall {
        label: "bind",
        errno,
    })?;
    if b.read_only {
        mount::bind(
            &b.target,
            &b.target,
            flags | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        )
        .map_err(|errno| SetupError::Syscall {
            label: "bind_ro",
            errno,
        })?;
    }
    Ok(())
}

fn execute_pivot(p: &PivotStep) -> Result<(), SetupError> {
    let old_root_abs = p.new_root.join(&p.old_root);
    if !fs::exists(&old_root_abs) {
        fs::mkdir_p(&old_root_abs, 0o755).map_err(|errno| SetupError::Syscall {
            label: "pivot_mkdir",
            errno,
        })?;
    }

    Chain::new()
        .then("pivot_root", || {
            unistd::pivot_root(&p.new_root, &old_root_abs)
        })
        .then("chdir_root", || unistd::chdir("/"))
        .if_then("umount_oldroot", !p.keep_old, || {
            umount2(&p.old_root, MntFlags::MNT_DETACH)
        })
        .finish()
        .map_err(SetupError::from)
}

/// What the spawned process does once the recipe has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    /// Program and arguments; never empty.
    pub argv: Vec<String>,
    /// Working directory to enter, already translated to post-recipe
    /// path names.
    pub cwd: Option<PathBuf>,
    /// Environment entries forced into the program's environment.
    pub env_overrides: BTreeMap<String, String>,
    /// Uid to assume before exec.
    pub target_uid: u32,
    /// Gid to assume before exec.
    pub target_gid: u32,
    /// Whether a failure to enter `cwd` is fatal.
    pub preserve_cwd: bool,
    /// Program run (and waited for) during setup, before privileges
    /// drop.
    pub setup_exec: Option<PathBuf>,
}

impl ExecSpec {
    /// Build a spec for `argv`, refusing empty argument lists.
    pub fn new(argv: Vec<String>, uid: u32, gid: u32) -> Option<Self> {
        if argv.is_empty() || argv[0].is_empty() {
            return None;
        }
        Some(ExecSpec {
            argv,
            cwd: None,
            env_overrides: BTreeMap::new(),
            target_uid: uid,
            target_gid: gid,
            preserve_cwd: false,
            setup_exec: None,
        })
    }

    /// Assemble the child environment: process environment, then the
    /// fixed entries, then explicit overrides.
    fn environment(&self) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        // Subdirectories of a host TMPDIR may not exist in the new view.
        env.insert("TMPDIR".into(), "/tmp".into());
        env.entry("PULSE_SERVER".into()).or_insert_with(|| {
            format!("unix:/run/user/{}/pulse/native", self.target_uid)
        });
        for (k, v) in &self.env_overrides {
            env.insert(k.clone(), v.clone());
        }
        env.into_iter().collect()
    }
}

/// Enter the working directory, run the setup hook, drop privileges, and
/// exec the target program. Only returns on failure.
pub fn exec_app(spec: &ExecSpec) -> ChildError {
    match &spec.cwd {
        Some(cwd) => {
            if let Err(errno) = unistd::chdir(cwd.as_path()) {
                if spec.preserve_cwd {
                    return ChildError::CwdFailed {
                        path: cwd.clone(),
                        errno,
                    };
                }
            }
        }
        // The working directory carried over from the parent is already
        // the right one.
        None if spec.preserve_cwd => {}
        None => {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/"));
            let _ = fs::mkdir_p(&home, 0o755);
            let _ = unistd::chdir(&home);
        }
    }

    if let Some(setup) = &spec.setup_exec {
        match crate::child::spawn(&[setup.to_string_lossy().into_owned()]) {
            Ok(mut hook) => {
                let _ = hook.wait();
            }
            Err(e) => warn!(error = %e, "setup hook failed to spawn"),
        }
    }

    let env: Vec<CString> = spec
        .environment()
        .into_iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();
    let argv: Vec<CString> = match spec
        .argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
    {
        Ok(argv) => argv,
        Err(_) => {
            return ChildError::ExecFailed {
                argv0: spec.argv[0].clone(),
                errno: Errno::EINVAL,
            };
        }
    };

    let gid = unistd::Gid::from_raw(spec.target_gid);
    let uid = unistd::Uid::from_raw(spec.target_uid);
    let _ = unistd::setresgid(gid, gid, gid);
    let _ = unistd::setresuid(uid, uid, uid);

    let err = unistd::execvpe(&argv[0], &argv, &env).unwrap_err();
    ChildError::ExecFailed {
        argv0: spec.argv[0].clone(),
        errno: err,
    }
}

/// Exit-code shape of [`exec_app`] for use as a clone child tail.
pub fn exec_app_code(spec: &ExecSpec) -> i32 {
    match exec_app(spec) {
        ChildError::CwdFailed { path, errno } => {
            eprintln!("Could not preserve working directory {}: {errno}", path.display());
            50
        }
        ChildError::ExecFailed { argv0, errno } => {
            eprintln!("exec {argv0}: {errno}");
            -(errno as i32)
        }
    }
}

/// How the base root layout is established before recipe steps run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountMode {
    /// No base layout; the recipe is everything.
    RecipeOnly,
    /// Build the standard layout under an existing root directory:
    /// bind-self, proc, sys, dev, tmp, run (each when present).
    OwnRoot {
        /// The prepared root directory.
        root: PathBuf,
    },
    /// Re-expose the host root under `root` as a recursive slave bind.
    HostRoot {
        /// Scratch directory receiving the view.
        root: PathBuf,
        /// Bind source for the home subtree.
        home_source: PathBuf,
        /// Home subtree, relative to the root.
        home_rel: PathBuf,
        /// Remount the view read-only.
        system_ro: bool,
    },
}

impl MountMode {
    /// Apply the base layout. Runs inside the fresh mount namespace,
    /// before any recipe step.
    pub fn apply(&self) -> Result<(), SetupError> {
        match self {
            MountMode::RecipeOnly => Ok(()),
            MountMode::OwnRoot { root } => {
                mount::mount_core(root).map_err(SetupError::from)
            }
            MountMode::HostRoot {
                root,
                home_source,
                home_rel,
                system_ro,
            } => Chain::new()
                .then("bind_host_root", || {
                    mount::bind(
                        Path::new("/"),
                        root,
                        MsFlags::MS_REC | MsFlags::MS_SLAVE,
                    )
                })
                .if_then("remount_ro", *system_ro, || {
                    mount::bind(
                        Path::new("/"),
                        root,
                        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    )
                })
                .if_then("mount_tmp", fs::exists(&root.join("tmp")), || {
                    mount::mount("tmp", &root.join("tmp"), "tmpfs", MsFlags::empty(), None)
                })
                .if_then("mount_run", fs::exists(&root.join("run")), || {
                    mount::mount("run", &root.join("run"), "tmpfs", MsFlags::empty(), None)
                })
                .then("bind_home", || {
                    mount::bind(
                        home_source,
                        &root.join(home_rel),
                        MsFlags::MS_REC | MsFlags::MS_SLAVE,
                    )
                })
                .finish()
                .map_err(SetupError::from),
        }
    }
}
