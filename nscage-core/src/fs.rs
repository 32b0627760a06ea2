//! Filesystem helpers: path primitives, lazy directory iteration, file
//! copying, and temporary directories.

use std::ffi::CString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{self, Mode, SFlag};
use nix::unistd;

use crate::fd::{read_full, write_full};

fn cstr(path: &Path) -> nix::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

/// Check for existence without following errors into details.
pub fn exists(path: &Path) -> bool {
    stat::stat(path).is_ok()
}

/// Whether `path` names a directory.
pub fn is_dir(path: &Path) -> bool {
    stat::stat(path)
        .map(|st| SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFDIR))
        .unwrap_or(false)
}

/// Create a symbolic link at `link` pointing at `target`.
pub fn symlink(target: &Path, link: &Path) -> nix::Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
}

/// Create one directory with the given mode.
pub fn mkdir(path: &Path, mode: u32) -> nix::Result<()> {
    unistd::mkdir(path, Mode::from_bits_truncate(mode))
}

/// Create a directory and any missing parents.
///
/// Returns the number of directories newly created. Fails with `ENOTDIR`
/// when an intermediate component exists as something other than a
/// directory.
pub fn mkdir_p(path: &Path, mode: u32) -> nix::Result<usize> {
    match stat::stat(if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    }) {
        Ok(st) => {
            return if SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFDIR) {
                Ok(0)
            } else {
                Err(Errno::ENOTDIR)
            };
        }
        Err(Errno::ENOENT) if !path.as_os_str().is_empty() => {}
        Err(e) => return Err(e),
    }
    let parents = match path.parent() {
        Some(parent) => mkdir_p(parent, mode)?,
        None => 0,
    };
    mkdir(path, mode)?;
    Ok(parents + 1)
}

/// Create `path` as an empty file if it does not exist.
pub fn touch(path: &Path, mode: u32) -> nix::Result<()> {
    let fd = fcntl::open(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(mode),
    )?;
    unistd::close(fd)
}

/// Remove a file.
pub fn unlink(path: &Path) -> nix::Result<()> {
    unistd::unlink(path)
}

/// Remove an empty directory.
pub fn rmdir(path: &Path) -> nix::Result<()> {
    std::fs::remove_dir(path).map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
}

/// Read the target of a symbolic link.
///
/// Targets longer than the initial buffer are handled by re-reading with
/// a buffer sized from `lstat`.
pub fn read_link(path: &Path) -> nix::Result<PathBuf> {
    const STATIC_BUFSIZE: usize = 4096;
    read_link_with(path, STATIC_BUFSIZE)
}

fn read_link_with(path: &Path, bufsize: usize) -> nix::Result<PathBuf> {
    let cpath = cstr(path)?;
    let mut buf = vec![0u8; bufsize];
    let sz = unsafe { libc::readlink(cpath.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    if sz < 0 {
        return Err(Errno::last());
    }
    if (sz as usize) < buf.len() {
        buf.truncate(sz as usize);
        return Ok(PathBuf::from(std::ffi::OsString::from_vec(buf)));
    }
    // Possibly truncated; size the buffer from the inode and retry.
    let st = stat::lstat(path)?;
    let mut big = vec![0u8; (st.st_size as usize).max(buf.len() + 1)];
    let sz = unsafe { libc::readlink(cpath.as_ptr(), big.as_mut_ptr().cast(), big.len()) };
    if sz < 0 {
        return Err(Errno::last());
    }
    big.truncate(sz as usize);
    Ok(PathBuf::from(std::ffi::OsString::from_vec(big)))
}

/// Resolve one level of symlink, or hand the path back unchanged for
/// non-symlinks and absent files.
///
/// Relative targets are rebased onto the link's parent directory.
pub fn read_link_or_self(path: &Path) -> nix::Result<PathBuf> {
    match read_link(path) {
        Ok(target) => {
            if target.is_relative() {
                Ok(path.parent().unwrap_or(Path::new("")).join(target))
            } else {
                Ok(target)
            }
        }
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(path.to_path_buf()),
        Err(e) => Err(e),
    }
}

/// Lazily yields the entries of one directory.
///
/// Finite and non-restartable; `.` and `..` are yielded and left for the
/// caller to skip.
pub struct DirIter {
    iter: nix::dir::OwningIter,
}

impl DirIter {
    /// Open `path` for iteration.
    pub fn open(path: &Path) -> nix::Result<Self> {
        let dir = Dir::open(
            path,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(DirIter {
            iter: dir.into_iter(),
        })
    }
}

impl Iterator for DirIter {
    type Item = nix::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|entry| {
            entry.map(|e| e.file_name().to_string_lossy().into_owned())
        })
    }
}

/// Count entries of `path` whose names start with an ASCII digit.
///
/// The PID-1 reaper uses this on `/proc` to decide whether it is the last
/// process in its namespace.
pub fn count_numeric_entries(path: &Path) -> nix::Result<usize> {
    let mut count = 0;
    for entry in DirIter::open(path)? {
        let name = entry?;
        if name.as_bytes().first().is_some_and(|b| b.is_ascii_digit()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Create a fresh private temporary directory named after `prefix`.
///
/// The directory lives under `$TMPDIR` (default `/tmp`), is accessible
/// only to the creator, and ownership of the path passes to the caller.
pub fn temp_dir(prefix: &str) -> std::io::Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()?;
    let path = dir.keep();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    Ok(path)
}

fn fcopy_raw(src: i32, dst: i32, mut len: usize) -> nix::Result<()> {
    let mut buf = [0u8; 8192];
    while len > 0 {
        let target = len.min(buf.len());
        let nread = read_full(unsafe { std::os::fd::BorrowedFd::borrow_raw(src) }, &mut buf[..target])?;
        if nread == 0 {
            return Ok(());
        }
        write_full(unsafe { std::os::fd::BorrowedFd::borrow_raw(dst) }, &buf[..nread])?;
        len -= nread;
    }
    Ok(())
}

fn fcopy(src: i32, dst: i32, mut len: usize) -> nix::Result<()> {
    while len > 0 {
        let r = unsafe {
            libc::copy_file_range(src, std::ptr::null_mut(), dst, std::ptr::null_mut(), len, 0)
        };
        if r < 0 {
            match Errno::last() {
                Errno::ENOSYS | Errno::EXDEV | Errno::EINVAL => break,
                _ => return fcopy_raw(src, dst, len),
            }
        } else if r == 0 {
            return Ok(());
        } else {
            len -= r as usize;
        }
    }
    while len > 0 {
        let r = unsafe { libc::sendfile(dst, src, std::ptr::null_mut(), len) };
        if r < 0 {
            return fcopy_raw(src, dst, len);
        }
        if r == 0 {
            return Ok(());
        }
        len -= r as usize;
    }
    Ok(())
}

/// Copy one regular file, preserving its mode.
///
/// Tries a reflink first, then `copy_file_range`, then `sendfile`, then a
/// buffered loop.
pub fn copy_file(src: &Path, dst: &Path) -> nix::Result<()> {
    let st = stat::stat(src)?;
    let fs = fcntl::open(src, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    let fd = fcntl::open(
        dst,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(st.st_mode),
    );
    let fd = match fd {
        Ok(fd) => fd,
        Err(e) => {
            let _ = unistd::close(fs);
            return Err(e);
        }
    };

    let ret = unsafe { libc::ioctl(fd, libc::FICLONE, fs) };
    let result = if ret == 0 {
        Ok(())
    } else {
        fcopy(fs, fd, st.st_size as usize)
    };

    let _ = unistd::close(fs);
    let _ = unistd::close(fd);
    result
}

/// Copy a symbolic link, preserving its target verbatim.
pub fn copy_symlink(src: &Path, dst: &Path) -> nix::Result<()> {
    let target = read_link(src)?;
    symlink(&target, dst)
}

/// Copy a file tree.
///
/// Directories are recreated with the source mode; symlinks are copied as
/// links. With `recursive` unset only the direct children of a source
/// directory are copied.
pub fn copy_tree(src: &Path, dst: &Path, recursive: bool) -> nix::Result<()> {
    let st = stat::lstat(src)?;
    let kind = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
    if kind == SFlag::S_IFLNK {
        return copy_symlink(src, dst);
    }
    if kind != SFlag::S_IFDIR {
        return copy_file(src, dst);
    }
    if !exists(dst) {
        mkdir(dst, st.st_mode & 0o7777)?;
    }
    for entry in DirIter::open(src)? {
        let name = entry?;
        if name == "." || name == ".." {
            continue;
        }
        let from = src.join(&name);
        let to = dst.join(&name);
        let est = stat::lstat(&from)?;
        let ekind = SFlag::from_bits_truncate(est.st_mode) & SFlag::S_IFMT;
        if ekind == SFlag::S_IFDIR {
            if recursive {
                copy_tree(&from, &to, true)?;
            }
        } else if ekind == SFlag::S_IFLNK {
            copy_symlink(&from, &to)?;
        } else {
            copy_file(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn mkdir_p_counts_new_directories() {
        let tmp = TempDir::new().unwrap();
        let deep = tmp.path().join("a/b/c");
        assert_eq!(mkdir_p(&deep, 0o755).unwrap(), 3);
        assert_eq!(mkdir_p(&deep, 0o755).unwrap(), 0);
        assert_eq!(mkdir_p(&tmp.path().join("a/b/c/d"), 0o755).unwrap(), 1);
    }

    #[test]
    fn mkdir_p_rejects_file_in_the_way() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(
            mkdir_p(&file.join("below"), 0o755).unwrap_err(),
            Errno::ENOTDIR
        );
        assert_eq!(mkdir_p(&file, 0o755).unwrap_err(), Errno::ENOTDIR);
    }

    #[test]
    fn read_link_retries_past_a_short_buffer() {
        let tmp = TempDir::new().unwrap();
        let target = PathBuf::from("x".repeat(200));
        let link = tmp.path().join("long");
        symlink(&target, &link).unwrap();
        // First read fits: no retry needed.
        assert_eq!(read_link(&link).unwrap(), target);
        // Force the stat-then-retry path with a buffer smaller than the
        // target.
        assert_eq!(read_link_with(&link, 16).unwrap(), target);
    }

    #[test]
    fn read_link_or_self_passes_through_non_links() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(read_link_or_self(&file).unwrap(), file);
        let missing = tmp.path().join("missing");
        assert_eq!(read_link_or_self(&missing).unwrap(), missing);
    }

    #[test]
    fn read_link_or_self_rebases_relative_targets() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("rel");
        symlink(Path::new("sibling"), &link).unwrap();
        assert_eq!(
            read_link_or_self(&link).unwrap(),
            tmp.path().join("sibling")
        );
    }

    #[test]
    fn copy_file_preserves_content_and_mode() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::write(&src, b"payload bytes").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o640)).unwrap();
        copy_file(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload bytes");
        let mode = std::fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn copy_tree_recurses_and_keeps_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        mkdir_p(&src.join("sub"), 0o755).unwrap();
        std::fs::write(src.join("f"), b"top").unwrap();
        std::fs::write(src.join("sub/g"), b"nested").unwrap();
        symlink(Path::new("f"), &src.join("l")).unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst, true).unwrap();
        assert_eq!(std::fs::read(dst.join("f")).unwrap(), b"top");
        assert_eq!(std::fs::read(dst.join("sub/g")).unwrap(), b"nested");
        assert_eq!(read_link(&dst.join("l")).unwrap(), PathBuf::from("f"));
    }

    #[test]
    fn temp_dir_is_private_and_owned_by_caller() {
        let path = temp_dir("nscage-test-").unwrap();
        assert!(path.is_dir());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("nscage-test-")
        );
        std::fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn dir_iter_lists_all_entries_once() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("one"), b"").unwrap();
        std::fs::write(tmp.path().join("two"), b"").unwrap();
        let mut names: Vec<String> = DirIter::open(tmp.path())
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|n| n.as_str() != "." && n.as_str() != "..")
            .collect();
        names.sort();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn proc_count_sees_this_process() {
        let count = count_numeric_entries(Path::new("/proc")).unwrap();
        assert!(count >= 1);
    }
}
