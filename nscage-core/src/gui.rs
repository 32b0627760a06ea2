//! Bind in the host paths GUI programs need to talk to the display and
//! sound services. Some of these are serious isolation breaches; that is
//! the point of a compatibility container, not a security boundary.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::warn;

use crate::chain::{Chain, ChainError};
use crate::{fs, mount};

/// Read a path from the environment, strip `prefix` when given, and make
/// the result relative by dropping the leading slash. Falls back to
/// `default` for unset or relative values.
fn path_from_env(name: &str, default: PathBuf, prefix: Option<&str>) -> PathBuf {
    if let Ok(mut value) = std::env::var(name) {
        if let Some(prefix) = prefix {
            if let Some(stripped) = value.strip_prefix(prefix) {
                value = stripped.to_string();
            }
        }
        if let Some(rel) = value.strip_prefix('/') {
            return PathBuf::from(rel);
        }
    }
    default
}

/// Narrow the X11 bind to the single socket `DISPLAY` names.
///
/// Returns the socket's root-relative path when `DISPLAY` is a purely
/// numeric `:N` form; pre-creates the socket directory (mode 01777, as
/// required by xwayland servers) and an empty bind target for the
/// socket. `KONS_BIND_X11=all` disables narrowing.
fn narrow_x11(root: &Path, whole_dir: &Path) -> Option<PathBuf> {
    if std::env::var("KONS_BIND_X11")
        .map(|v| v.eq_ignore_ascii_case("all"))
        .unwrap_or(false)
    {
        return None;
    }
    let display = std::env::var("DISPLAY").ok()?;
    let digits = display.strip_prefix(':').unwrap_or(&display);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let dirname = root.join(whole_dir);
    if fs::mkdir_p(&dirname, 0o755).is_err() {
        return None;
    }
    let _ = std::fs::set_permissions(&dirname, std::fs::Permissions::from_mode(0o1777));
    let socket = whole_dir.join(format!("X{digits}"));
    let _ = fs::touch(&root.join(&socket), 0o644);
    Some(socket)
}

/// Bind the well-known host paths GUI programs expect into `root`.
///
/// `home_rel` and `rundir_rel` are relative and are interpreted against
/// both `/` and `root`. Returns the `PULSE_SERVER` value the target
/// program should see if the variable is not already set; publishing the
/// server address directly beats binding `/etc/machine-id` across two
/// root filesystems.
pub fn mount_gui(
    root: &Path,
    home_rel: &Path,
    rundir_rel: &Path,
) -> Result<String, ChainError> {
    let mut frags: Vec<PathBuf> = vec![
        PathBuf::from("tmp/.X11-unix"),
        PathBuf::from("run/dbus"),
        // Udev database for correct ENV entries e.g. ID_INPUT_JOYSTICK
        // markers.
        PathBuf::from("run/udev"),
        path_from_env("XAUTHORITY", home_rel.join(".Xauthority"), None),
        home_rel.join(".config/pulse/cookie"),
        path_from_env(
            "DBUS_SESSION_BUS_ADDRESS",
            rundir_rel.join("bus"),
            Some("unix:path="),
        ),
        rundir_rel.join("pulse"),
        rundir_rel.join("pipewire-0"),
        match std::env::var("WAYLAND_DISPLAY") {
            Ok(display) => rundir_rel.join(display),
            Err(_) => rundir_rel.join("wayland-0"),
        },
    ];

    // /tmp/.X11-unix must be owned by the user or root for wlroots
    // xwayland to work (e.g. gamescope), so bind only our own socket
    // when DISPLAY permits.
    match narrow_x11(root, &frags[0]) {
        Some(socket) => frags[0] = socket,
        None => {
            warn!("invalid $DISPLAY value; bind-mounting /tmp/.X11-unix whole");
        }
    }

    let pulse = format!("unix:/{}/pulse/native", rundir_rel.display());

    let mut chain = Chain::new();
    for frag in &frags {
        let hpath = Path::new("/").join(frag);
        if !fs::exists(&hpath) {
            continue;
        }
        let path = root.join(frag);
        if !fs::exists(&path) {
            if fs::is_dir(&hpath) {
                let _ = fs::mkdir_p(&path, 0o755);
            } else {
                if let Some(parent) = path.parent() {
                    let _ = fs::mkdir_p(parent, 0o755);
                }
                let _ = fs::touch(&path, 0o644);
            }
        }
        chain = chain.then("mount_gui", || {
            mount::bind(&hpath, &path, MsFlags::empty())
        });
        if !chain.ok() {
            break;
        }
    }

    chain.finish().map(|()| pulse)
}
