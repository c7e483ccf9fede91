//! Zero-copy transfers through a kernel pipe
//!
//! This module wraps `splice(2)`, `tee(2)` and `vmsplice(2)`:
//!
//! - [`relay::PipeRelay`] moves bytes descriptor → pipe → descriptor,
//!   keeping track of short moves and of bytes left sitting in the pipe.
//! - [`pages`] hands user pages to a pipe (and back) with explicit
//!   ownership states, so a gifted buffer cannot be touched until the kernel
//!   is done with it.
//! - [`tee`] duplicates pipe contents to two destinations (store and
//!   stream).
//!
//! All raw syscalls go through [`SpliceOps`] so the bookkeeping can be driven
//! by a scripted implementation in tests.

pub mod pages;
pub mod relay;
pub mod tee;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use thiserror::Error;

/// Move pages instead of copying (a hint)
pub const SPLICE_F_MOVE: u32 = 0x01;
/// Do not block on the pipe
pub const SPLICE_F_NONBLOCK: u32 = 0x02;
/// More data will follow
pub const SPLICE_F_MORE: u32 = 0x04;
/// Pages handed to `vmsplice` are a gift to the kernel
pub const SPLICE_F_GIFT: u32 = 0x08;
/// Undo a `vmsplice` map-out
pub const SPLICE_F_UNMAP: u32 = 0x10;

/// A failed splice-family call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op} failed (errno {os_code})")]
pub struct TransferError {
    /// Syscall or step that failed
    pub op: &'static str,
    /// Raw `errno`
    pub os_code: i32,
}

impl TransferError {
    pub fn new(op: &'static str, os_code: i32) -> Self {
        Self { op, os_code }
    }

    /// Capture `errno` after a failed call
    pub fn last_os_error(op: &'static str) -> Self {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Self::new(op, code)
    }

    /// EAGAIN and EINTR mean "try again"; anything else is an abort
    pub fn is_retryable(&self) -> bool {
        self.os_code == libc::EAGAIN || self.os_code == libc::EINTR
    }

    pub fn would_block(&self) -> bool {
        self.os_code == libc::EAGAIN
    }
}

impl From<TransferError> for io::Error {
    fn from(e: TransferError) -> Self {
        io::Error::from_raw_os_error(e.os_code)
    }
}

/// Readiness a caller waits for before retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
}

/// The splice-family syscalls
///
/// Offsets follow the kernel contract: `Some` for seekable descriptors, and
/// the value is advanced by the number of bytes moved.
pub trait SpliceOps {
    fn splice(
        &mut self,
        fd_in: RawFd,
        off_in: Option<&mut i64>,
        fd_out: RawFd,
        off_out: Option<&mut i64>,
        len: usize,
        flags: u32,
    ) -> Result<usize, TransferError>;

    fn tee(&mut self, fd_in: RawFd, fd_out: RawFd, len: usize, flags: u32) -> Result<usize, TransferError>;

    /// Block until `fd` is ready or `timeout_ms` passes (-1 waits forever)
    fn wait(&mut self, fd: RawFd, readiness: Readiness, timeout_ms: i32) -> Result<bool, TransferError>;
}

/// [`SpliceOps`] backed by the real syscalls
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelSplice;

impl SpliceOps for KernelSplice {
    fn splice(
        &mut self,
        fd_in: RawFd,
        off_in: Option<&mut i64>,
        fd_out: RawFd,
        off_out: Option<&mut i64>,
        len: usize,
        flags: u32,
    ) -> Result<usize, TransferError> {
        let off_in = off_in.map_or(std::ptr::null_mut(), |o| o as *mut i64);
        let off_out = off_out.map_or(std::ptr::null_mut(), |o| o as *mut i64);

        // SAFETY: offsets are either null or point at live i64s for the call
        let ret = unsafe { libc::splice(fd_in, off_in, fd_out, off_out, len, flags as libc::c_uint) };
        if ret < 0 {
            return Err(TransferError::last_os_error("splice"));
        }
        Ok(ret as usize)
    }

    fn tee(&mut self, fd_in: RawFd, fd_out: RawFd, len: usize, flags: u32) -> Result<usize, TransferError> {
        // SAFETY: plain syscall on caller-provided descriptors
        let ret = unsafe { libc::tee(fd_in, fd_out, len, flags as libc::c_uint) };
        if ret < 0 {
            return Err(TransferError::last_os_error("tee"));
        }
        Ok(ret as usize)
    }

    fn wait(&mut self, fd: RawFd, readiness: Readiness, timeout_ms: i32) -> Result<bool, TransferError> {
        wait_fd(fd, readiness, timeout_ms)
    }
}

/// poll(2) a single descriptor
pub fn wait_fd(fd: RawFd, readiness: Readiness, timeout_ms: i32) -> Result<bool, TransferError> {
    let events = match readiness {
        Readiness::Readable => libc::POLLIN,
        Readiness::Writable => libc::POLLOUT,
    };
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    loop {
        // SAFETY: one valid pollfd
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = TransferError::last_os_error("poll");
            if err.os_code == libc::EINTR {
                continue;
            }
            return Err(err);
        }
        return Ok(ret > 0);
    }
}

/// A kernel pipe used as the intermediate buffer of a transfer
#[derive(Debug)]
pub struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
    capacity: usize,
}

impl Pipe {
    /// Create a pipe with the default capacity
    pub fn new() -> Result<Self, TransferError> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds has room for two descriptors
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if ret < 0 {
            return Err(TransferError::last_os_error("pipe2"));
        }
        // SAFETY: pipe2 just returned these descriptors and nothing else owns them
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let mut pipe = Self { read, write, capacity: 0 };
        pipe.capacity = pipe.query_capacity().unwrap_or(64 * 1024);
        Ok(pipe)
    }

    /// Create a pipe and try to resize it to hold `size` bytes
    ///
    /// Resizing past the system limit fails softly; the pipe keeps whatever
    /// capacity the kernel allowed.
    pub fn with_capacity(size: usize) -> Result<Self, TransferError> {
        let mut pipe = Self::new()?;
        // SAFETY: fcntl on a descriptor we own
        let ret = unsafe { libc::fcntl(pipe.write.as_raw_fd(), libc::F_SETPIPE_SZ, size as libc::c_int) };
        if ret < 0 {
            tracing::debug!(size, err = %io::Error::last_os_error(), "pipe resize refused");
        }
        pipe.capacity = pipe.query_capacity().unwrap_or(pipe.capacity);
        Ok(pipe)
    }

    fn query_capacity(&self) -> Result<usize, TransferError> {
        // SAFETY: fcntl on a descriptor we own
        let ret = unsafe { libc::fcntl(self.write.as_raw_fd(), libc::F_GETPIPE_SZ) };
        if ret < 0 {
            return Err(TransferError::last_os_error("fcntl(F_GETPIPE_SZ)"));
        }
        Ok(ret as usize)
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Bytes the pipe can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered in the pipe
    pub fn pending(&self) -> Result<usize, TransferError> {
        let mut n: libc::c_int = 0;
        // SAFETY: FIONREAD writes one c_int
        let ret = unsafe { libc::ioctl(self.read.as_raw_fd(), libc::FIONREAD, &mut n) };
        if ret < 0 {
            return Err(TransferError::last_os_error("ioctl(FIONREAD)"));
        }
        Ok(n.max(0) as usize)
    }

    /// Switch both ends to non-blocking mode
    pub fn set_nonblocking(&self) -> Result<(), TransferError> {
        for fd in [self.read_fd(), self.write_fd()] {
            // SAFETY: fcntl on descriptors we own
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0 {
                return Err(TransferError::last_os_error("fcntl(F_GETFL)"));
            }
            // SAFETY: as above
            if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
                return Err(TransferError::last_os_error("fcntl(F_SETFL)"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_capacity_and_pending() {
        let pipe = Pipe::new().unwrap();
        assert!(pipe.capacity() >= 4096);
        assert_eq!(pipe.pending().unwrap(), 0);

        let data = [7u8; 100];
        // SAFETY: writing a local buffer to our own pipe
        let n = unsafe { libc::write(pipe.write_fd(), data.as_ptr() as *const libc::c_void, data.len()) };
        assert_eq!(n, 100);
        assert_eq!(pipe.pending().unwrap(), 100);
    }

    #[test]
    fn test_pipe_with_capacity_grows() {
        let pipe = Pipe::with_capacity(256 * 1024).unwrap();
        assert!(pipe.capacity() >= 64 * 1024);
    }

    #[test]
    fn test_retryable_codes() {
        assert!(TransferError::new("splice", libc::EAGAIN).is_retryable());
        assert!(TransferError::new("splice", libc::EINTR).is_retryable());
        assert!(!TransferError::new("splice", libc::EINVAL).is_retryable());
        let msg = TransferError::new("tee", libc::EINVAL).to_string();
        assert!(msg.starts_with("tee failed"));
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let pipe = Pipe::new().unwrap();
        pipe.set_nonblocking().unwrap();
        let mut ops = KernelSplice;
        let sink = Pipe::new().unwrap();
        sink.set_nonblocking().unwrap();
        let err = ops
            .splice(pipe.read_fd(), None, sink.write_fd(), None, 4096, SPLICE_F_NONBLOCK)
            .unwrap_err();
        assert!(err.would_block());
        assert!(!wait_fd(pipe.read_fd(), Readiness::Readable, 0).unwrap());
    }
}
