//! Drive the two front-ends and map every outcome onto the documented
//! exit codes: 0 success, 1 generic parse failure, 2 missing required
//! argument, 5 sanity check failure, 22 missing child argv, 33 spec
//! parse error, 41 mountpoint error, 50 cwd preservation failure,
//! negated errno for syscall failures, and otherwise the exit code of
//! the executed program.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, FromArgMatches, Parser};
use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid};

use nscage_core::recipe::ExecSpec;
use nscage_core::{fd, DEFAULT_STACK_SIZE, NamespaceRef, ParseError, ProtocolError, SetupError};

use crate::adapter::{self, CageConfig};
use crate::parser::{CageCli, MountCli};

fn clap_exit(e: clap::Error) -> i32 {
    use clap::error::ErrorKind;
    let code = match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        ErrorKind::MissingRequiredArgument => 2,
        _ => 1,
    };
    let _ = e.print();
    code
}

fn error_exit(program: &str, err: &anyhow::Error) -> i32 {
    eprintln!("{program}: {err:#}");
    if let Some(setup) = err.downcast_ref::<SetupError>() {
        return setup.exit_code();
    }
    if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
        return -(protocol.errno as i32);
    }
    if let Some(errno) = err.downcast_ref::<Errno>() {
        return -(*errno as i32);
    }
    if err.downcast_ref::<ParseError>().is_some() {
        return 33;
    }
    1
}

/// Entry point for `nsmnt`.
pub fn run_mount(args: Vec<String>) -> i32 {
    let matches = match MountCli::command().try_get_matches_from(&args) {
        Ok(m) => m,
        Err(e) => return clap_exit(e),
    };
    let cli = match MountCli::from_arg_matches(&matches) {
        Ok(c) => c,
        Err(e) => return clap_exit(e),
    };

    let recipe = match adapter::build_mount_recipe(&matches) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error parsing spec: {e}");
            return 33;
        }
    };

    if cli.command.is_empty() {
        eprintln!("Missing child commandline");
        return 22;
    }
    let uid = unistd::getuid().as_raw();
    let gid = unistd::getgid().as_raw();
    let mut exec = match ExecSpec::new(cli.command, uid, gid) {
        Some(e) => e,
        None => {
            eprintln!("Missing child commandline");
            return 22;
        }
    };
    // The command runs where the user invoked us.
    exec.preserve_cwd = true;

    let launch = nscage_core::Launch::new(recipe, exec);
    match nscage_core::launch(launch) {
        Ok(code) => code,
        Err(e) => error_exit("nsmnt", &e),
    }
}

/// Entry point for `nscage`.
pub fn run_cage(args: Vec<String>) -> i32 {
    let cli = match CageCli::try_parse_from(&args) {
        Ok(c) => c,
        Err(e) => return clap_exit(e),
    };
    let conf = match adapter::validate_cage(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return 5;
        }
    };

    // Reference bookkeeping before anything expensive happens.
    if let Some(path) = &conf.create {
        let ns_ref = NamespaceRef::new(path.clone());
        ns_ref.prune_stale();
        if ns_ref.link_exists() {
            eprintln!("Error: File exists: {}", path.display());
            return -libc::EEXIST;
        }
    }
    if let Some(path) = &conf.join {
        let ns_ref = NamespaceRef::new(path.clone());
        ns_ref.prune_stale();
        if !ns_ref.link_exists() && !conf.daemon {
            eprintln!("Error: No such file: {}", path.display());
            return -libc::ENOENT;
        }
    }

    if conf.join.is_some() {
        return run_join(&conf);
    }

    let launch = match adapter::build_launch(&conf) {
        Ok(l) => l,
        Err(e) => return error_exit("nscage", &e),
    };
    match nscage_core::launch(launch) {
        Ok(code) => code,
        Err(e) => error_exit("nscage", &e),
    }
}

fn run_join(conf: &CageConfig) -> i32 {
    let join_path = match &conf.join {
        Some(p) => p.clone(),
        None => return 5,
    };

    let ns_path = if !NamespaceRef::new(join_path.clone()).link_exists() && conf.daemon {
        match spawn_keepalive(conf) {
            Ok(path) => path,
            Err(code) => return code,
        }
    } else {
        join_path
    };

    let exec = match adapter::join_exec_spec(conf) {
        Ok(e) => e,
        Err(e) => return error_exit("nscage", &e),
    };
    match nscage_core::join(&ns_path, exec, DEFAULT_STACK_SIZE) {
        Ok(code) => code,
        Err(e) => error_exit("nscage", &e),
    }
}

/// Detach a keepalive instance that creates the namespace set, and learn
/// the owner pid through a pipe.
///
/// Double fork: the intermediate child exits immediately so the
/// keepalive is reparented to init; the pid of the namespace owner
/// travels back over the inherited pipe once setup completed.
fn spawn_keepalive(conf: &CageConfig) -> Result<PathBuf, i32> {
    let (pipe_r, pipe_w): (OwnedFd, OwnedFd) = match unistd::pipe() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Could not allocate pipe for keepalive: {e}");
            return Err(31);
        }
    };

    match unsafe { unistd::fork() } {
        Err(e) => {
            eprintln!("Could not spawn keepalive: {e}");
            Err(32)
        }
        Ok(ForkResult::Child) => {
            // The intermediate only exists to orphan the keepalive.
            match unsafe { unistd::fork() } {
                Err(_) => unsafe { libc::_exit(1) },
                Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
                Ok(ForkResult::Child) => {
                    drop(pipe_r);
                    let code = run_keepalive(conf, pipe_w);
                    unsafe { libc::_exit(code) };
                }
            }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(pipe_w);
            match waitpid(child, None) {
                Ok(nix::sys::wait::WaitStatus::Exited(_, 0)) => {}
                _ => {
                    eprintln!("Could not spawn keepalive: double fork failed");
                    return Err(33);
                }
            }
            let pid: Option<i32> = fd::read_bin(&pipe_r);
            match pid {
                Some(pid) if pid > 0 => Ok(PathBuf::from(format!("/proc/{pid}/ns"))),
                _ => {
                    eprintln!("Keepalive instance reported failure");
                    Err(34)
                }
            }
        }
    }
}

fn run_keepalive(conf: &CageConfig, pipe_w: OwnedFd) -> i32 {
    let mut keepalive_conf = conf.clone();
    keepalive_conf.daemon = true;
    keepalive_conf.create = conf.join.clone();
    keepalive_conf.join = None;

    let mut launch = match adapter::build_launch(&keepalive_conf) {
        Ok(l) => l,
        Err(e) => return error_exit("nscage", &e),
    };
    launch.idle = true;
    launch.ns_ref = keepalive_conf.create.clone();
    launch.on_ready = Some(Box::new(move |pid: Pid| {
        let _ = fd::write_bin(&pipe_w, &pid.as_raw());
    }));

    match nscage_core::launch(launch) {
        Ok(code) => code,
        Err(e) => error_exit("nscage", &e),
    }
}
