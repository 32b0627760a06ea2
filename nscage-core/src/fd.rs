//! Owned file descriptors and transfer-safe I/O.
//!
//! `Fd` is a move-only owner of one descriptor with an explicit empty
//! state, closing on drop. The free functions retry partial transfers
//! until the requested byte count has moved, end-of-file, or a real
//! error; `read_deadline` adds a select(2) budget between chunks.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;

/// Exclusive owner of a raw file descriptor.
///
/// The held value is either empty or a currently-open descriptor owned by
/// this process. Movable, non-copyable; closes on drop.
#[derive(Debug, Default)]
pub struct Fd(Option<OwnedFd>);

impl Fd {
    /// An empty holder, owning nothing.
    pub fn empty() -> Self {
        Fd(None)
    }

    /// Whether a descriptor is held.
    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    /// Borrow the descriptor, if any.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.0.as_ref().map(|fd| fd.as_fd())
    }

    /// The raw descriptor value, or -1 when empty.
    pub fn raw(&self) -> RawFd {
        self.0.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    /// Close early. Closing an empty holder is a no-op.
    pub fn close(&mut self) {
        self.0 = None;
    }

    /// Give up ownership without closing.
    pub fn into_raw(mut self) -> RawFd {
        self.0.take().map_or(-1, |fd| fd.into_raw_fd())
    }

    /// Duplicate the descriptor.
    pub fn dup(&self) -> nix::Result<Fd> {
        match &self.0 {
            Some(fd) => {
                let dup = fd
                    .try_clone()
                    .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))?;
                Ok(Fd::from(dup))
            }
            None => Err(Errno::EBADF),
        }
    }
}

impl From<OwnedFd> for Fd {
    fn from(fd: OwnedFd) -> Self {
        Fd(Some(fd))
    }
}

impl Fd {
    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    /// `raw` must be an open descriptor not owned elsewhere. Negative
    /// values yield an empty holder.
    pub unsafe fn from_raw(raw: RawFd) -> Self {
        if raw < 0 {
            Fd(None)
        } else {
            Fd(Some(unsafe { OwnedFd::from_raw_fd(raw) }))
        }
    }
}

fn read_once(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(Errno::last())
    } else {
        Ok(n as usize)
    }
}

fn write_once(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(Errno::last())
    } else {
        Ok(n as usize)
    }
}

/// Read until `buf` is full, end-of-file, or an error.
///
/// Returns the number of bytes read; a short count with `Ok` means EOF.
pub fn read_full<F: AsFd>(fd: F, buf: &mut [u8]) -> nix::Result<usize> {
    let raw = fd.as_fd().as_raw_fd();
    let mut have = 0;
    while have < buf.len() {
        match read_once(raw, &mut buf[have..]) {
            Ok(0) => break,
            Ok(n) => have += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(have)
}

/// Write the whole of `buf` unless an error occurs.
pub fn write_full<F: AsFd>(fd: F, buf: &[u8]) -> nix::Result<usize> {
    let raw = fd.as_fd().as_raw_fd();
    let mut done = 0;
    while done < buf.len() {
        match write_once(raw, &buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Like [`read_full`] but with a time budget between chunks.
///
/// Budget exhaustion before EOF reports `ETIMEDOUT`.
pub fn read_deadline<F: AsFd>(fd: F, buf: &mut [u8], timeout: TimeVal) -> nix::Result<usize> {
    let mut have = 0;
    let borrowed = fd.as_fd();
    while have < buf.len() {
        let mut readfds = FdSet::new();
        readfds.insert(borrowed);
        let mut tv = timeout;
        let ready = select(
            borrowed.as_raw_fd() + 1,
            Some(&mut readfds),
            None,
            None,
            Some(&mut tv),
        )?;
        if ready == 0 {
            return Err(Errno::ETIMEDOUT);
        }
        match read_once(borrowed.as_raw_fd(), &mut buf[have..]) {
            Ok(0) => break,
            Ok(n) => have += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(have)
}

/// Write a fixed-size plain-old-data value in native byte order.
pub fn write_bin<F: AsFd, T: Copy>(fd: F, value: &T) -> nix::Result<usize> {
    // A Copy value with no padding reads back byte-identical; callers
    // only move integers and packed structs through here.
    let bytes = unsafe {
        std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
    };
    write_full(fd, bytes)
}

/// Read a fixed-size plain-old-data value in native byte order.
///
/// Returns `None` on EOF or error before `size_of::<T>()` bytes arrived.
pub fn read_bin<F: AsFd, T: Copy>(fd: F) -> Option<T> {
    let mut value = MaybeUninit::<T>::uninit();
    let buf = unsafe {
        std::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), std::mem::size_of::<T>())
    };
    match read_full(fd, buf) {
        Ok(n) if n == std::mem::size_of::<T>() => Some(unsafe { value.assume_init() }),
        _ => None,
    }
}

/// Read up to `max` bytes of a file into a `Vec`.
pub fn slurp<F: AsFd>(fd: F, max: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    let n = read_full(fd, &mut buf).map_err(io::Error::from)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;

    #[test]
    fn empty_fd_is_invalid() {
        let fd = Fd::empty();
        assert!(!fd.is_valid());
        assert_eq!(fd.raw(), -1);
    }

    #[test]
    fn pipe_round_trip_full_transfers() {
        let (r, w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let payload = b"namespace".repeat(100);
        let writer = std::thread::spawn({
            let payload = payload.clone();
            move || {
                write_full(&w, &payload).unwrap();
            }
        });
        let mut buf = vec![0u8; payload.len()];
        let n = read_full(&r, &mut buf).unwrap();
        writer.join().unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf, payload);
    }

    #[test]
    fn short_read_reports_eof_count() {
        let (r, w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        write_full(&w, b"abc").unwrap();
        drop(w);
        let mut buf = [0u8; 16];
        let n = read_full(&r, &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn deadline_read_times_out() {
        let (r, _w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut buf = [0u8; 4];
        let err = read_deadline(&r, &mut buf, TimeVal::new(0, 50_000)).unwrap_err();
        assert_eq!(err, Errno::ETIMEDOUT);
    }

    #[test]
    fn binary_values_round_trip() {
        let (r, w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        write_bin(&w, &0x1234_5678_u32).unwrap();
        let v: u32 = read_bin(&r).unwrap();
        assert_eq!(v, 0x1234_5678);
    }
}
