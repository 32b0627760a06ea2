//! Thin mount syscall wrappers and the fixed base-filesystem recipe.

use std::path::Path;

use nix::errno::Errno;
use nix::mount::MsFlags;

use crate::chain::{Chain, ChainResult};
use crate::fs;

/// Mount `source` on `target`, translating failure into the errno.
pub fn mount(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), Errno> {
    let source = if source.is_empty() { None } else { Some(source) };
    let fstype = if fstype.is_empty() { None } else { Some(fstype) };
    nix::mount::mount(source, target, fstype, flags, data)
}

/// Bind-mount `source` onto `target` with extra flags.
pub fn bind(source: &Path, target: &Path, flags: MsFlags) -> Result<(), Errno> {
    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | flags,
        None::<&str>,
    )
}

/// Decode the octal escapes `getmntent` would (`\040` space, `\011` tab,
/// `\012` newline, `\134` backslash).
fn unescape_mnt(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(oct) = field.get(i + 1..i + 4) {
                if let Ok(v) = u8::from_str_radix(oct, 8) {
                    out.push(v as char);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Whether `path` appears as a mount target in `/proc/self/mounts`.
pub fn is_mountpoint(path: &Path) -> bool {
    let table = match std::fs::read_to_string("/proc/self/mounts") {
        Ok(t) => t,
        Err(_) => return false,
    };
    let want = path.to_string_lossy();
    table.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|dir| unescape_mnt(dir) == want)
    })
}

/// Mount the basic filesystems under `root`.
///
/// Binds `root` onto itself unless it already is a mountpoint, then
/// mounts fresh `proc`, recursive `/sys` and `/dev` binds, and tmpfs on
/// `tmp` and `run` for each of those that exist under `root`.
pub fn mount_core(root: &Path) -> ChainResult {
    Chain::new()
        .if_then("mount_root", !is_mountpoint(root), || {
            bind(root, root, MsFlags::empty())
        })
        .if_then("mount_proc", fs::exists(&root.join("proc")), || {
            mount("proc", &root.join("proc"), "proc", MsFlags::empty(), None)
        })
        .if_then("mount_sys", fs::exists(&root.join("sys")), || {
            bind(Path::new("/sys"), &root.join("sys"), MsFlags::MS_REC)
        })
        .if_then("mount_dev", fs::exists(&root.join("dev")), || {
            bind(Path::new("/dev"), &root.join("dev"), MsFlags::MS_REC)
        })
        .if_then("mount_tmp", fs::exists(&root.join("tmp")), || {
            mount("tmp", &root.join("tmp"), "tmpfs", MsFlags::empty(), None)
        })
        .if_then("mount_run", fs::exists(&root.join("run")), || {
            mount("run", &root.join("run"), "tmpfs", MsFlags::empty(), None)
        })
        .finish()
}

/// Write-protect `path` to mitigate the useless file permissions of a
/// single-uid namespace.
///
/// Two steps: the read-only flag cannot be applied together with the
/// initial bind, only via a follow-up remount.
pub fn protect_path(path: &Path) -> ChainResult {
    Chain::new()
        .then("bind_protect", || bind(path, path, MsFlags::MS_REC))
        .then("bind_protect_ro", || {
            bind(
                path,
                path,
                MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            )
        })
        .finish()
}
