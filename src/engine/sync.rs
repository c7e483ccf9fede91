//! Synchronous IO engine
//!
//! Blocking system calls, one operation at a time. Seekable targets use
//! `pread`/`pwrite` so the descriptor's file position is never touched;
//! streams use plain `read`/`write`. Short transfers are resumed until the
//! request is complete, the source reaches end of file, or an error occurs.

use super::{EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType};
use crate::Result;
use anyhow::Context;
use std::io;
use std::os::unix::io::RawFd;

/// Synchronous IO engine
pub struct SyncEngine {
    /// Single completion slot (queue depth is one)
    pending_completion: Option<IOCompletion>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self { pending_completion: None }
    }

    /// Read up to `length` bytes; fewer only at end of file
    fn do_read(&self, fd: RawFd, buffer: *mut u8, length: usize, offset: Option<u64>) -> Result<usize> {
        let mut done = 0;
        while done < length {
            let remaining = length - done;
            // SAFETY: the submitter guarantees `buffer` covers `length` bytes
            let ptr = unsafe { buffer.add(done) } as *mut libc::c_void;
            let ret = match offset {
                // SAFETY: as above
                Some(off) => unsafe { libc::pread(fd, ptr, remaining, (off + done as u64) as libc::off_t) },
                // SAFETY: as above
                None => unsafe { libc::read(fd, ptr, remaining) },
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).with_context(|| {
                    format!("read failed: fd={}, offset={:?}, length={}", fd, offset, remaining)
                });
            }
            if ret == 0 {
                break;
            }
            done += ret as usize;
        }
        Ok(done)
    }

    fn do_write(&self, fd: RawFd, buffer: *const u8, length: usize, offset: Option<u64>) -> Result<usize> {
        let mut done = 0;
        while done < length {
            let remaining = length - done;
            // SAFETY: the submitter guarantees `buffer` covers `length` bytes
            let ptr = unsafe { buffer.add(done) } as *const libc::c_void;
            let ret = match offset {
                // SAFETY: as above
                Some(off) => unsafe { libc::pwrite(fd, ptr, remaining, (off + done as u64) as libc::off_t) },
                // SAFETY: as above
                None => unsafe { libc::write(fd, ptr, remaining) },
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).with_context(|| {
                    format!("write failed: fd={}, offset={:?}, length={}", fd, offset, remaining)
                });
            }
            if ret == 0 {
                anyhow::bail!("write made no progress: fd={}, offset={:?}", fd, offset);
            }
            done += ret as usize;
        }
        Ok(done)
    }

    fn do_fsync(&self, fd: RawFd) -> Result<usize> {
        // SAFETY: fsync only needs a descriptor
        if unsafe { libc::fsync(fd) } < 0 {
            return Err(io::Error::last_os_error()).with_context(|| format!("fsync failed: fd={}", fd));
        }
        Ok(0)
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for SyncEngine {
    fn init(&mut self, _config: &EngineConfig) -> Result<()> {
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let result = match op.op_type {
            OperationType::Read => self.do_read(op.target_fd, op.buffer, op.length, op.offset),
            OperationType::Write => self.do_write(op.target_fd, op.buffer, op.length, op.offset),
            OperationType::Fsync => self.do_fsync(op.target_fd),
        };
        self.pending_completion = Some(IOCompletion {
            user_data: op.user_data,
            result,
            op_type: op.op_type,
        });
        Ok(())
    }

    fn poll_completions(&mut self) -> Result<Vec<IOCompletion>> {
        Ok(self.pending_completion.take().into_iter().collect())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.pending_completion = None;
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }
}
