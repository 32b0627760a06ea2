//! A bidirectional pair of pipe ends, as handed out by `popen`.

use std::os::fd::BorrowedFd;

use nix::sys::time::TimeVal;

use crate::fd::{self, Fd};

/// One read end and one write end, owned together.
///
/// The two descriptors point at different underlying pipes: reads see the
/// peer's stdout, writes feed the peer's stdin.
#[derive(Debug)]
pub struct Pipe {
    read: Fd,
    write: Fd,
}

impl Pipe {
    /// Assemble from separately owned ends.
    pub fn new(read: Fd, write: Fd) -> Self {
        Pipe { read, write }
    }

    /// Borrow the read end.
    pub fn read_fd(&self) -> Option<BorrowedFd<'_>> {
        self.read.as_fd()
    }

    /// Borrow the write end.
    pub fn write_fd(&self) -> Option<BorrowedFd<'_>> {
        self.write.as_fd()
    }

    /// Read until `buf` is full or the peer closes its end.
    pub fn read(&self, buf: &mut [u8]) -> nix::Result<usize> {
        match self.read.as_fd() {
            Some(fd) => fd::read_full(fd, buf),
            None => Err(nix::errno::Errno::EBADF),
        }
    }

    /// Read with a per-chunk time budget.
    pub fn read_deadline(&self, buf: &mut [u8], timeout: TimeVal) -> nix::Result<usize> {
        match self.read.as_fd() {
            Some(fd) => fd::read_deadline(fd, buf, timeout),
            None => Err(nix::errno::Errno::EBADF),
        }
    }

    /// Write all of `buf` to the peer's stdin.
    pub fn write(&self, buf: &[u8]) -> nix::Result<usize> {
        match self.write.as_fd() {
            Some(fd) => fd::write_full(fd, buf),
            None => Err(nix::errno::Errno::EBADF),
        }
    }

    /// Write a plain-old-data value.
    pub fn write_bin<T: Copy>(&self, value: &T) -> nix::Result<usize> {
        match self.write.as_fd() {
            Some(fd) => fd::write_bin(fd, value),
            None => Err(nix::errno::Errno::EBADF),
        }
    }

    /// Read a plain-old-data value, `None` on EOF or error.
    pub fn read_bin<T: Copy>(&self) -> Option<T> {
        self.read.as_fd().and_then(fd::read_bin)
    }

    /// Drop the write end, signalling EOF to the peer's stdin.
    pub fn close_write(&mut self) {
        self.write.close();
    }
}
