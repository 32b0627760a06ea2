//! Uid/gid map construction and the `/proc/<pid>` writers that install
//! them.
//!
//! For unprivileged single-user namespaces the kernel accepts exactly one
//! map line per file and requires `setgroups` to be denied before
//! `gid_map` can be written. The write order used throughout this crate
//! is uid_map, setgroups=deny, gid_map.

use std::fmt::Write as _;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{self, Gid, Pid, Uid};

/// One range of the map: `count` ids starting at `inside_start` translate
/// to ids starting at `outside_start` in the parent namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapEntry {
    /// First id inside the namespace.
    pub inside_start: u32,
    /// First id outside the namespace.
    pub outside_start: u32,
    /// Number of consecutive ids mapped; at least 1.
    pub count: u32,
}

/// An ordered sequence of map entries with non-overlapping inside ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    entries: Vec<IdMapEntry>,
}

impl IdMap {
    /// An empty map.
    pub fn new() -> Self {
        IdMap::default()
    }

    /// The map translating exactly one id.
    pub fn single(inside: u32, outside: u32) -> Self {
        IdMap {
            entries: vec![IdMapEntry {
                inside_start: inside,
                outside_start: outside,
                count: 1,
            }],
        }
    }

    /// Append an entry, rejecting zero-length ranges and overlaps with
    /// existing inside ranges.
    pub fn push(&mut self, entry: IdMapEntry) -> Result<(), Errno> {
        if entry.count == 0 {
            return Err(Errno::EINVAL);
        }
        let new_end = entry.inside_start as u64 + entry.count as u64;
        for e in &self.entries {
            let end = e.inside_start as u64 + e.count as u64;
            if (entry.inside_start as u64) < end && (e.inside_start as u64) < new_end {
                return Err(Errno::EINVAL);
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// The entries in insertion order.
    pub fn entries(&self) -> &[IdMapEntry] {
        &self.entries
    }

    /// Render the kernel's `inside outside count` line format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            let _ = writeln!(out, "{} {} {}", e.inside_start, e.outside_start, e.count);
        }
        out
    }

    /// Write the map into a `uid_map`/`gid_map` file.
    ///
    /// The whole map must be written in a single write; success means the
    /// kernel accepted it.
    pub fn write(&self, path: &std::path::Path) -> std::io::Result<()> {
        std::fs::write(path, self.render())
    }
}

/// Path of the `uid_map` or `gid_map` file for `pid`.
///
/// `map_type` is `"uid"` or `"gid"`.
pub fn map_path(pid: Pid, map_type: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/{map_type}_map"))
}

/// Write `deny` into `/proc/<pid>/setgroups`.
///
/// Required before an unprivileged process may write a gid map.
pub fn deny_setgroups(pid: Pid) -> std::io::Result<()> {
    std::fs::write(format!("/proc/{pid}/setgroups"), "deny")
}

/// Enter a new single-user namespace in place.
///
/// Adds `CLONE_NEWUSER` to `flags`, then maps `uid`/`gid` inside onto the
/// caller's effective ids outside. Use this when the calling process is
/// itself the future occupant; when a child is the occupant the parent
/// must do the map writes instead.
pub fn unshare_single(uid: u32, gid: u32, flags: CloneFlags) -> Result<(), Errno> {
    let euid = unistd::geteuid();
    let egid = unistd::getegid();
    unshare(flags | CloneFlags::CLONE_NEWUSER)?;
    write_self_maps(uid, euid, gid, egid)
}

fn write_self_maps(uid: u32, euid: Uid, gid: u32, egid: Gid) -> Result<(), Errno> {
    let to_errno = |e: std::io::Error| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EPERM));
    IdMap::single(uid, euid.as_raw())
        .write(std::path::Path::new("/proc/self/uid_map"))
        .map_err(to_errno)?;
    deny_setgroups(unistd::getpid()).map_err(to_errno)?;
    IdMap::single(gid, egid.as_raw())
        .write(std::path::Path::new("/proc/self/gid_map"))
        .map_err(to_errno)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_renders_one_line() {
        let map = IdMap::single(1000, 1000);
        assert_eq!(map.render(), "1000 1000 1\n");
    }

    #[test]
    fn push_rejects_overlap_and_empty_ranges() {
        let mut map = IdMap::new();
        map.push(IdMapEntry {
            inside_start: 0,
            outside_start: 100_000,
            count: 1000,
        })
        .unwrap();
        assert_eq!(
            map.push(IdMapEntry {
                inside_start: 999,
                outside_start: 0,
                count: 1,
            })
            .unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            map.push(IdMapEntry {
                inside_start: 2000,
                outside_start: 0,
                count: 0,
            })
            .unwrap_err(),
            Errno::EINVAL
        );
        map.push(IdMapEntry {
            inside_start: 1000,
            outside_start: 0,
            count: 1,
        })
        .unwrap();
        assert_eq!(map.entries().len(), 2);
    }

    #[test]
    fn multi_entry_render_keeps_order() {
        let mut map = IdMap::new();
        map.push(IdMapEntry {
            inside_start: 1000,
            outside_start: 1,
            count: 1,
        })
        .unwrap();
        map.push(IdMapEntry {
            inside_start: 0,
            outside_start: 100_000,
            count: 1,
        })
        .unwrap();
        assert_eq!(map.render(), "1000 1 1\n0 100000 1\n");
    }

    #[test]
    fn map_path_points_into_proc() {
        assert_eq!(
            map_path(Pid::from_raw(42), "uid"),
            PathBuf::from("/proc/42/uid_map")
        );
        assert_eq!(
            map_path(Pid::from_raw(42), "gid"),
            PathBuf::from("/proc/42/gid_map")
        );
    }

    #[test]
    fn write_lands_whole_map_in_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("uid_map");
        IdMap::single(0, 1000).write(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0 1000 1\n");
    }
}
