//! Command-line argument parsers using `clap` derive macros.

use clap::Parser;
use std::path::PathBuf;

/// Run a command in its own mount namespace built from mount/overlay
/// specs.
#[derive(Parser, Debug)]
#[command(
    name = "nsmnt",
    version,
    about,
    long_about = "Run a command in its own mount namespace.\n\n\
        Mount spec:   -m <fstype>,<device>,<mountpoint>[,<option>...]\n\
        Shortcuts:    `-m bind,/a,/b` equals `-m ,/a,/b,bind`;\n\
        \x20             `-m rbind,/a,/b` equals `-m ,/a,/b,bind,rec`\n\n\
        Overlay spec: -o <mountpoint>[,<option>...]\n\
        Options:      lowerdir=, upperdir=, workdir=, copyfrom=<path>,\n\
        \x20             tmp (fresh temp upper/work), shadow (target becomes\n\
        \x20             its own lower layer), plus any mount option.\n\n\
        Commas inside option values may be escaped with a backslash."
)]
pub struct MountCli {
    /// Add a mount to the namespace
    #[arg(short = 'm', long = "mount", value_name = "SPEC", action = clap::ArgAction::Append)]
    pub mount: Vec<String>,

    /// Add an overlay to the namespace
    #[arg(short = 'o', long = "overlay", value_name = "SPEC", action = clap::ArgAction::Append)]
    pub overlay: Vec<String>,

    /// The command to run inside the namespace
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Isolate a program in a pivoted-root container, or join one.
#[derive(Parser, Debug)]
#[command(
    name = "nscage",
    version,
    about,
    long_about = "Isolate a program inside a user+mount+pid namespace with a \
        pivoted root, optionally publishing the namespace set for other \
        instances to join."
)]
pub struct CageCli {
    /// Run in fakeroot mode (implies --writable-system)
    #[arg(short = 'r', long)]
    pub fakeroot: bool,

    /// Use the host rootfs, only mounting the container home
    #[arg(short = 'H', long)]
    pub host_root: bool,

    /// Custom container root path
    #[arg(short = 'p', long, value_name = "PATH")]
    pub root: Option<PathBuf>,

    /// Don't set up mounts (implies --no-gui)
    #[arg(short = 'M', long)]
    pub no_mounts: bool,

    /// Don't set up GUI-related mounts
    #[arg(short = 'G', long)]
    pub no_gui: bool,

    /// Don't make system paths read-only (/usr, /etc)
    #[arg(short = 'W', long)]
    pub writable_system: bool,

    /// Keep the original root filesystem at /mnt
    #[arg(short = 'k', long)]
    pub keep_root: bool,

    /// Preserve the working directory (may require --keep-root)
    #[arg(short = 'w', long)]
    pub keep_pwd: bool,

    /// Execute a file during namespace setup
    #[arg(short = 'e', long, value_name = "PATH")]
    pub setup_exec: Option<PathBuf>,

    /// Create a joinable namespace reference ('-' for <root>/.namespace)
    #[arg(short = 'c', long, value_name = "REF")]
    pub create: Option<PathBuf>,

    /// Join the namespaces identified by a reference ('-' for
    /// <root>/.namespace)
    #[arg(short = 'j', long, value_name = "REF")]
    pub join: Option<PathBuf>,

    /// Don't run a program; idle to keep the namespace alive, reaping
    /// zombies as PID 1. With --join, auto-spawn the keepalive when the
    /// reference doesn't exist yet.
    #[arg(short = 'D', long)]
    pub daemon: bool,

    /// The command to run inside the namespace (default: /bin/bash)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}
