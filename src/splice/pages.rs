//! Page ownership between user buffers and a pipe
//!
//! `vmsplice(2)` can hand user pages to a pipe instead of copying them. Once
//! gifted, the pages belong to the kernel until whoever reads the pipe has
//! consumed them; touching them earlier corrupts the data in flight. The
//! types here make those states explicit:
//!
//! ```text
//!   PageBuffer --gift_into--> KernelPages --reclaim (pipe drained)--> PageBuffer
//!   PageBuffer --map_out(Move)--> MappedPages --unmap--> PageBuffer
//! ```
//!
//! [`KernelPages`] exposes no way to read or write the memory. The copy-mode
//! calls borrow the buffer and leave it usable as soon as they return.

use super::{wait_fd, Pipe, Readiness, TransferError, SPLICE_F_GIFT, SPLICE_F_MOVE, SPLICE_F_UNMAP};
use crate::util::buffer::AlignedBuffer;
use std::os::fd::RawFd;
use tracing::{debug, warn};

/// How pages cross the user/kernel boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// The kernel copies; the caller's buffer stays usable
    Copy,
    /// Ownership of the pages moves
    Move,
}

/// Caller-owned, page-aligned memory
#[derive(Debug)]
pub struct PageBuffer {
    buf: AlignedBuffer,
    /// Valid bytes from the start of the buffer
    len: usize,
}

impl PageBuffer {
    /// At least `size` bytes of whole pages
    pub fn new(size: usize) -> anyhow::Result<Self> {
        Ok(Self::from_buffer(AlignedBuffer::page_aligned(size)?))
    }

    pub fn from_buffer(buf: AlignedBuffer) -> Self {
        Self { buf, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.size()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the first `len` bytes as valid
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Valid bytes
    pub fn data(&self) -> &[u8] {
        &self.buf.as_slice()[..self.len]
    }

    /// Whole buffer, for filling before a gift
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }

    /// Copy `src` into the buffer and mark it valid
    pub fn fill_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.capacity());
        self.buf.as_mut_slice()[..n].copy_from_slice(&src[..n]);
        self.len = n;
    }

    /// Queue the valid bytes into `pipe` by copy
    ///
    /// The buffer can be modified as soon as this returns.
    pub fn copy_into(&self, pipe: &Pipe) -> Result<usize, TransferError> {
        let data = self.data();
        let mut done = 0;
        while done < data.len() {
            wait_fd(pipe.write_fd(), Readiness::Writable, -1)?;
            let rest = &data[done..];
            // SAFETY: rest is a live slice for the duration of the call
            let ret = unsafe { libc::write(pipe.write_fd(), rest.as_ptr() as *const libc::c_void, rest.len()) };
            if ret < 0 {
                let err = TransferError::last_os_error("write");
                if err.is_retryable() {
                    continue;
                }
                return Err(err);
            }
            done += ret as usize;
        }
        Ok(done)
    }

    /// Give the valid bytes' pages to `pipe`
    ///
    /// The buffer is consumed; it comes back from [`KernelPages::reclaim`]
    /// once the pipe has been drained. The valid length must fit in the pipe
    /// so the call cannot wait on a reader that does not exist yet. On error
    /// nothing was handed over and the buffer is returned.
    pub fn gift_into(self, pipe: &Pipe) -> Result<KernelPages, (PageBuffer, TransferError)> {
        if self.len > pipe.capacity() {
            return Err((self, TransferError::new("vmsplice", libc::EINVAL)));
        }

        let base = self.buf.as_ptr() as *mut u8;
        let mut iov = libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: self.len,
        };
        let mut gifted = 0;
        while iov.iov_len > 0 {
            if let Err(e) = wait_fd(pipe.write_fd(), Readiness::Writable, -1) {
                return self.partial_gift(gifted, e);
            }
            match vmsplice(pipe.write_fd(), &mut iov, SPLICE_F_GIFT) {
                Ok(0) => return self.partial_gift(gifted, TransferError::new("vmsplice", libc::EPIPE)),
                Ok(n) => {
                    gifted += n;
                    iov.iov_len -= n;
                    // SAFETY: stays within the valid range
                    iov.iov_base = unsafe { base.add(gifted) } as *mut libc::c_void;
                }
                Err(e) if e.is_retryable() => continue,
                Err(e) => return self.partial_gift(gifted, e),
            }
        }

        debug!(len = self.len, "pages gifted to pipe");
        Ok(KernelPages { buf: Some(self.buf), len: self.len })
    }

    // Once any page has gone to the kernel the buffer cannot be handed back.
    fn partial_gift(self, gifted: usize, err: TransferError) -> Result<KernelPages, (PageBuffer, TransferError)> {
        if gifted == 0 {
            return Err((self, err));
        }
        warn!(gifted, len = self.len, %err, "gift interrupted, keeping pages with the kernel");
        Ok(KernelPages { buf: Some(self.buf), len: gifted })
    }

    /// Read `len` bytes out of `pipe` into this buffer
    ///
    /// Copy mode fills the buffer in place. Move mode asks the kernel to map
    /// the pipe's pages instead; the returned [`MappedPages`] must be
    /// unmapped to get a buffer back.
    pub fn map_out(self, pipe: &Pipe, len: usize, mode: MapMode) -> Result<MappedPages, (PageBuffer, TransferError)> {
        let mut this = self;
        let want = len.min(this.capacity());
        let base = this.buf.as_mut_ptr();
        let mut iov = libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: want,
        };
        let flags = match mode {
            MapMode::Copy => 0,
            MapMode::Move => SPLICE_F_MOVE,
        };

        let mut view: Option<*const u8> = None;
        let mut got = 0;
        while iov.iov_len > 0 {
            // block for the first bytes only; afterwards take what is there
            let timeout = if got == 0 { -1 } else { 0 };
            match wait_fd(pipe.read_fd(), Readiness::Readable, timeout) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if got == 0 => return Err((this, e)),
                Err(_) => break,
            }
            match vmsplice(pipe.read_fd(), &mut iov, flags) {
                Ok(0) => break,
                Ok(n) => {
                    if view.is_none() {
                        view = Some(iov.iov_base as *const u8);
                    }
                    got += n;
                    iov.iov_len -= n;
                    iov.iov_base = (iov.iov_base as *mut u8).wrapping_add(n) as *mut libc::c_void;
                }
                Err(e) if e.is_retryable() => continue,
                Err(e) if got == 0 => return Err((this, e)),
                Err(e) => {
                    debug!(got, %e, "map-out stopped early");
                    break;
                }
            }
        }

        this.len = got;
        let view = view.unwrap_or(base as *const u8);
        Ok(MappedPages {
            origin: Some(this),
            view,
            len: got,
            mode,
        })
    }
}

/// Pages currently owned by a pipe
///
/// No accessors: the memory must not be touched until [`Self::reclaim`]
/// succeeds.
#[derive(Debug)]
pub struct KernelPages {
    buf: Option<AlignedBuffer>,
    len: usize,
}

impl KernelPages {
    /// Bytes handed to the kernel
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take the pages back once `pipe` holds nothing more
    ///
    /// Returns `self` unchanged while data is still buffered.
    pub fn reclaim(mut self, pipe: &Pipe) -> Result<PageBuffer, KernelPages> {
        match pipe.pending() {
            Ok(0) => match self.buf.take() {
                Some(buf) => Ok(PageBuffer::from_buffer(buf)),
                None => Err(self),
            },
            _ => Err(self),
        }
    }
}

impl Drop for KernelPages {
    fn drop(&mut self) {
        // The pipe may still reference these pages; freeing them would let
        // the allocator hand the memory out while the kernel reads it.
        if let Some(buf) = self.buf.take() {
            warn!(len = self.len, "dropping unreclaimed pipe pages, leaking them");
            std::mem::forget(buf);
        }
    }
}

/// Result of a map-out
///
/// In copy mode the view is the original buffer. In move mode it may be
/// memory the kernel handed back, valid until [`Self::unmap`].
pub struct MappedPages {
    origin: Option<PageBuffer>,
    view: *const u8,
    len: usize,
    mode: MapMode,
}

impl MappedPages {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Whether the kernel replaced the caller's pages with its own
    ///
    /// Linux currently copies on map-out even when asked to move, so this is
    /// false there and [`Self::unmap`] has nothing to release.
    pub fn is_remapped(&self) -> bool {
        self.origin
            .as_ref()
            .map_or(true, |o| o.buf.as_ptr() != self.view)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: view covers len bytes; either our own buffer or memory the
        // kernel mapped for us, live until unmap
        unsafe { std::slice::from_raw_parts(self.view, self.len) }
    }

    /// Release the mapping and get the caller's buffer back
    ///
    /// When the kernel copied into the caller's own pages there is nothing
    /// to undo and the data stays in the returned buffer.
    pub fn unmap(mut self, pipe: &Pipe) -> Result<PageBuffer, (MappedPages, TransferError)> {
        if !self.is_remapped() {
            return match self.origin.take() {
                Some(buf) => Ok(buf),
                None => Err((self, TransferError::new("vmsplice", libc::EINVAL))),
            };
        }

        let mut iov = libc::iovec {
            iov_base: self.view as *mut libc::c_void,
            iov_len: self.len,
        };
        if let Err(e) = vmsplice(pipe.read_fd(), &mut iov, SPLICE_F_UNMAP) {
            return Err((self, e));
        }
        match self.origin.take() {
            Some(mut buf) => {
                buf.len = 0;
                Ok(buf)
            }
            None => Err((self, TransferError::new("vmsplice", libc::EINVAL))),
        }
    }
}

fn vmsplice(fd: RawFd, iov: &mut libc::iovec, flags: u32) -> Result<usize, TransferError> {
    // SAFETY: iov describes memory owned by the caller for the duration
    let ret = unsafe { libc::vmsplice(fd, iov as *const libc::iovec, 1, flags as libc::c_uint) };
    if ret < 0 {
        return Err(TransferError::last_os_error("vmsplice"));
    }
    Ok(ret as usize)
}
