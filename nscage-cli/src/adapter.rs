//! Translate parsed command-line arguments into recipes, exec specs, and
//! launch configurations, performing all validation up front.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use nix::unistd;

use nscage_core::recipe::{BindStep, ExecSpec, MountMode, PivotStep, Recipe, Step};
use nscage_core::{fs, launch::GuiMounts, launch::Launch, spec, ParseError};

use crate::parser::CageCli;

/// Synthetic passwd entry user name for the container view.
const CAGE_USER: &str = "cageuser";
/// Default container root, relative to `$HOME`.
const ROOT_DIR: &str = ".local/nscage";
const DEFAULT_SHELL: &str = "/bin/bash";

/// Build a recipe from `-m`/`-o` specs, preserving their relative order
/// on the command line.
///
/// Clap groups repeated options per flag; the argument indices restore
/// the interleaving the recipe semantics depend on.
pub fn build_mount_recipe(matches: &ArgMatches) -> Result<Recipe, ParseError> {
    let mut ordered: Vec<(usize, bool, &String)> = Vec::new();
    if let (Some(values), Some(indices)) = (
        matches.get_many::<String>("mount"),
        matches.indices_of("mount"),
    ) {
        ordered.extend(indices.zip(values).map(|(i, v)| (i, false, v)));
    }
    if let (Some(values), Some(indices)) = (
        matches.get_many::<String>("overlay"),
        matches.indices_of("overlay"),
    ) {
        ordered.extend(indices.zip(values).map(|(i, v)| (i, true, v)));
    }
    ordered.sort_by_key(|(i, _, _)| *i);

    let mut recipe = Recipe::new();
    for (_, is_overlay, value) in ordered {
        if is_overlay {
            recipe.push(Step::Overlay(spec::parse_overlay_spec(value)?));
        } else {
            recipe.push(Step::Mount(spec::parse_mount_spec(value)?));
        }
    }
    Ok(recipe)
}

/// Validated nscage configuration.
#[derive(Debug, Clone)]
pub struct CageConfig {
    /// Container root directory.
    pub root: PathBuf,
    /// The caller's home directory.
    pub home: PathBuf,
    /// Program to run.
    pub argv: Vec<String>,
    /// Inside uid/gid (0/0 in fakeroot mode).
    pub uid: u32,
    /// Inside gid.
    pub gid: u32,
    /// Set up the base mounts at all.
    pub mounts: bool,
    /// Set up GUI support mounts.
    pub gui: bool,
    /// Protect /usr and /etc read-only.
    pub system_ro: bool,
    /// Keep the old root at /mnt.
    pub keep_root: bool,
    /// Preserve the working directory across the pivot.
    pub keep_pwd: bool,
    /// Use the host rootfs instead of the container root.
    pub host_root: bool,
    /// Idle as namespace keepalive instead of running a program.
    pub daemon: bool,
    /// Publish a reference at this path.
    pub create: Option<PathBuf>,
    /// Join the namespaces behind this reference.
    pub join: Option<PathBuf>,
    /// Setup hook.
    pub setup_exec: Option<PathBuf>,
}

/// Apply the sanity rules and defaults. Violations are reported as
/// errors the runner turns into exit code 5.
pub fn validate_cage(cli: CageCli) -> Result<CageConfig> {
    if cli.create.is_some() && cli.join.is_some() {
        return Err(anyhow!("-c and -j cannot be combined"));
    }
    if cli.join.is_some()
        && !cli.daemon
        && (cli.no_mounts || cli.no_gui || cli.keep_root || cli.host_root)
    {
        return Err(anyhow!(
            "-j cannot be combined with namespace setup options (-M/-G/-k/-H) unless -D is given"
        ));
    }
    if (cli.create.is_some() || cli.join.is_some()) && cli.fakeroot {
        return Err(anyhow!("-r cannot be combined with -c or -j"));
    }
    if (cli.create.is_some() || cli.join.is_some()) && cli.host_root {
        return Err(anyhow!("-H cannot be combined with -c or -j"));
    }
    if cli.daemon && cli.create.is_none() && cli.join.is_none() {
        return Err(anyhow!("-D must be combined with -c or -j"));
    }

    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .context("HOME is not set")?;
    let root = cli.root.unwrap_or_else(|| home.join(ROOT_DIR));

    // '-' selects the conventional reference inside the root.
    let fix_ref = |p: PathBuf| -> PathBuf {
        if p.as_os_str() == "-" {
            root.join(".namespace")
        } else {
            p
        }
    };

    let argv = if cli.command.is_empty() {
        vec![std::env::var("SHELL").unwrap_or_else(|_| DEFAULT_SHELL.to_string())]
    } else {
        cli.command
    };

    let (uid, gid) = if cli.fakeroot {
        (0, 0)
    } else {
        (unistd::getuid().as_raw(), unistd::getgid().as_raw())
    };

    Ok(CageConfig {
        home,
        argv,
        uid,
        gid,
        mounts: !cli.no_mounts,
        gui: !cli.no_gui && !cli.no_mounts,
        system_ro: !cli.writable_system && !cli.fakeroot,
        keep_root: cli.keep_root,
        keep_pwd: cli.keep_pwd,
        host_root: cli.host_root,
        daemon: cli.daemon,
        create: cli.create.map(&fix_ref),
        join: cli.join.map(&fix_ref),
        setup_exec: cli.setup_exec,
        root,
    })
}

fn transpose_prefix(path: &Path, prefix: &Path, replace: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(prefix).ok()?;
    Some(replace.join(rel))
}

/// Translate a host path into the post-pivot view: paths under the
/// container root map to `/`, `/media` stays, everything else lands
/// under `/mnt`.
pub fn convert_path(root: &Path, path: &Path) -> PathBuf {
    if let Some(p) = transpose_prefix(path, root, Path::new("/")) {
        return p;
    }
    if let Some(p) = transpose_prefix(path, Path::new("/media"), Path::new("/media")) {
        return p;
    }
    Path::new("/mnt").join(path.strip_prefix("/").unwrap_or(path))
}

/// Relative form of the home path (`/home/user` -> `home/user`).
fn home_rel(home: &Path) -> PathBuf {
    home.strip_prefix("/").unwrap_or(home).to_path_buf()
}

fn exec_spec(conf: &CageConfig) -> Result<ExecSpec> {
    let mut exec = ExecSpec::new(conf.argv.clone(), conf.uid, conf.gid)
        .context("empty child command line")?;
    exec.setup_exec = conf.setup_exec.clone();
    if conf.keep_pwd {
        let cwd = std::env::current_dir().context("reading working directory")?;
        exec.cwd = Some(convert_path(&conf.root, &cwd));
        exec.preserve_cwd = true;
    }
    Ok(exec)
}

/// The exec spec for the join path (no pivot happens; paths are already
/// container paths).
pub fn join_exec_spec(conf: &CageConfig) -> Result<ExecSpec> {
    let mut exec = ExecSpec::new(conf.argv.clone(), conf.uid, conf.gid)
        .context("empty child command line")?;
    exec.setup_exec = conf.setup_exec.clone();
    Ok(exec)
}

/// Append a synthetic passwd entry for the container user and return the
/// bind step placing it over `<root>/etc/passwd`.
fn passwd_shim(conf: &CageConfig) -> Result<Option<(Step, PathBuf)>> {
    let etc_passwd = conf.root.join("etc/passwd");
    if !fs::exists(&etc_passwd) {
        return Ok(None);
    }
    let mut contents =
        std::fs::read_to_string(&etc_passwd).context("reading container passwd")?;
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&format!(
        "{}:x:{}:{}:Container User:{}:/bin/bash\n",
        CAGE_USER,
        conf.uid,
        conf.gid,
        conf.home.display()
    ));
    let dir = fs::temp_dir("passwd-").context("allocating passwd shim dir")?;
    let shim = dir.join("passwd");
    std::fs::write(&shim, contents).context("writing passwd shim")?;
    Ok(Some((
        Step::Bind(BindStep {
            source: shim,
            target: etc_passwd,
            recursive: false,
            read_only: false,
        }),
        dir,
    )))
}

/// Build the full launch description for creating (or simply occupying)
/// a namespace set.
pub fn build_launch(conf: &CageConfig) -> Result<Launch> {
    let mut recipe = Recipe::new();
    let mut mode = MountMode::RecipeOnly;
    let mut gui = None;

    if conf.mounts {
        let rundir_rel = PathBuf::from(format!("run/user/{}", conf.uid));
        let home_rel = home_rel(&conf.home);

        let root = if conf.host_root {
            let scratch = fs::temp_dir("root-").context("allocating host-root scratch dir")?;
            recipe.register_cleanup(scratch.clone());
            mode = MountMode::HostRoot {
                root: scratch.clone(),
                home_source: conf.root.join(&home_rel),
                home_rel: home_rel.clone(),
                system_ro: conf.system_ro,
            };
            scratch
        } else {
            mode = MountMode::OwnRoot {
                root: conf.root.clone(),
            };
            conf.root.clone()
        };

        if !conf.host_root {
            // File permissions are useless in a single-uid namespace;
            // keep the system trees immutable instead.
            for tree in ["usr", "etc"] {
                let path = root.join(tree);
                if conf.system_ro && fs::exists(&path) {
                    recipe.push(Step::Protect(path));
                }
            }
            if fs::exists(Path::new("/media")) && fs::exists(&root.join("media")) {
                recipe.push(Step::Bind(BindStep {
                    source: "/media".into(),
                    target: root.join("media"),
                    recursive: true,
                    read_only: false,
                }));
            }
            if let Some((step, cleanup)) = passwd_shim(conf)? {
                recipe.push(step);
                recipe.register_cleanup(cleanup);
            }
        }

        if let Some(user) = std::env::var_os("USER") {
            let run_media = Path::new("/run/media").join(&user);
            if fs::exists(&run_media) {
                let target = if conf.host_root {
                    root.join(run_media.strip_prefix("/").unwrap_or(&run_media))
                } else {
                    root.join("run/media").join(CAGE_USER)
                };
                recipe.push(Step::Bind(BindStep {
                    source: run_media,
                    target,
                    recursive: true,
                    read_only: false,
                }));
            }
        }

        if conf.gui {
            gui = Some(GuiMounts {
                root: root.clone(),
                home_rel: home_rel.clone(),
                rundir_rel: rundir_rel.clone(),
            });
        }

        recipe.push(Step::PivotRoot(PivotStep {
            new_root: root,
            old_root: PathBuf::from("mnt"),
            keep_old: conf.keep_root,
        }));
    }

    let mut launch = Launch::new(recipe, exec_spec(conf)?);
    launch.mode = mode;
    launch.gui = gui;
    launch.pid_ns = true;
    launch.idle = conf.daemon;
    launch.ns_ref = conf.create.clone();
    Ok(launch)
}
