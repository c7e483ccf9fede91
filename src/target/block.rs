//! Block device ioctls
//!
//! Size query and buffer-cache flush for raw block devices. Both need the
//! device opened; neither works on regular files (the kernel answers
//! `ENOTTY`).

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

// _IOR(0x12, 114, size_t)
const BLKGETSIZE64: libc::c_ulong = 0x80081272;
// _IO(0x12, 97)
const BLKFLSBUF: libc::c_ulong = 0x1261;
// _IO(0x12, 104)
const BLKSSZGET: libc::c_ulong = 0x1268;

static ROOT_WARNED: AtomicBool = AtomicBool::new(false);

/// Device size in bytes
pub fn device_size(fd: RawFd) -> io::Result<u64> {
    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes one u64
    let ret = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}

/// Logical sector size, the O_DIRECT alignment unit
pub fn logical_block_size(fd: RawFd) -> io::Result<u32> {
    let mut size: libc::c_int = 0;
    // SAFETY: BLKSSZGET writes one int
    let ret = unsafe { libc::ioctl(fd, BLKSSZGET as _, &mut size) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size.max(0) as u32)
}

/// Drop the device's buffer cache
///
/// Only root may flush. For anyone else a permission error is reported once
/// and the flush is skipped.
pub fn flush_buffers(fd: RawFd) -> io::Result<()> {
    // SAFETY: BLKFLSBUF takes no argument
    let ret = unsafe { libc::ioctl(fd, BLKFLSBUF as _, 0) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // SAFETY: geteuid has no preconditions
    let non_root = unsafe { libc::geteuid() } != 0;
    if err.raw_os_error() == Some(libc::EACCES) && non_root {
        if !ROOT_WARNED.swap(true, Ordering::Relaxed) {
            warn!("only root may flush block devices, cache flush bypassed");
        }
        return Ok(());
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_size_query_rejects_regular_file() {
        let file = tempfile::tempfile().unwrap();
        let err = device_size(file.as_raw_fd()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTTY));
        assert!(logical_block_size(file.as_raw_fd()).is_err());
    }

    #[test]
    fn test_flush_rejects_regular_file() {
        let file = tempfile::tempfile().unwrap();
        assert!(flush_buffers(file.as_raw_fd()).is_err());
    }
}
