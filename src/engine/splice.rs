//! Zero-copy IO engine
//!
//! Writes copy the request into a page-aligned staging buffer, gift its pages
//! to a pipe and splice the pipe into the target. The staging buffer is
//! reclaimed once the pipe is empty again. Reads splice the target into the
//! pipe and map the pages out into the staging buffer.
//!
//! Streams (sockets, pipes, character devices) go through the same path
//! without an offset, which gives the network send and receive paths:
//! buffer → pipe → socket and socket → pipe → buffer.

use super::{EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType};
use crate::splice::pages::{MapMode, PageBuffer};
use crate::splice::relay::{drain_pipe, retry, Endpoint};
use crate::splice::{KernelSplice, Pipe, Readiness, SpliceOps, TransferError, SPLICE_F_MOVE};
use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

pub struct SpliceEngine {
    ops: KernelSplice,
    pipe: Option<Pipe>,
    /// Staging pages; `None` while they are lost to the kernel
    staging: Option<PageBuffer>,
    staging_size: usize,
    map_mode: MapMode,
    pending_completion: Option<IOCompletion>,
}

impl SpliceEngine {
    pub fn new() -> Self {
        Self {
            ops: KernelSplice,
            pipe: None,
            staging: None,
            staging_size: 0,
            map_mode: MapMode::Copy,
            pending_completion: None,
        }
    }

    /// Map read pages out by moving them rather than copying
    pub fn with_map_mode(mut self, mode: MapMode) -> Self {
        self.map_mode = mode;
        self
    }

    fn take_staging(&mut self) -> Result<PageBuffer> {
        match self.staging.take() {
            Some(buf) => Ok(buf),
            None => PageBuffer::new(self.staging_size),
        }
    }

    fn endpoint(fd: RawFd, offset: Option<u64>) -> Endpoint {
        match offset {
            Some(off) => Endpoint::seekable(fd, off),
            None => Endpoint::stream(fd),
        }
    }

    fn do_write(&mut self, fd: RawFd, src: &[u8], offset: Option<u64>) -> Result<usize> {
        let pipe = self.pipe.take().context("splice engine used before init")?;
        let result = self.write_through(&pipe, fd, src, offset);
        self.pipe = Some(pipe);
        result
    }

    fn write_through(&mut self, pipe: &Pipe, fd: RawFd, src: &[u8], offset: Option<u64>) -> Result<usize> {
        let mut dst = Self::endpoint(fd, offset);
        let mut done = 0;

        while done < src.len() {
            let mut staging = self.take_staging()?;
            let chunk = (src.len() - done).min(pipe.capacity()).min(staging.capacity());
            staging.fill_from(&src[done..done + chunk]);

            let gifted = match staging.gift_into(pipe) {
                Ok(pages) => pages,
                Err((staging, e)) => {
                    self.staging = Some(staging);
                    return Err(e).with_context(|| format!("vmsplice gift failed: fd={}", fd));
                }
            };
            let n = gifted.len();
            drain_pipe(&mut self.ops, pipe.read_fd(), &mut dst, n)
                .with_context(|| format!("splice to fd={} at {:?} failed", fd, dst.offset))?;

            match gifted.reclaim(pipe) {
                Ok(staging) => self.staging = Some(staging),
                Err(pages) => {
                    warn!(len = pages.len(), "pipe not empty after splice, staging pages abandoned");
                }
            }
            done += n;
        }
        Ok(done)
    }

    fn do_read(&mut self, fd: RawFd, dst: &mut [u8], offset: Option<u64>) -> Result<usize> {
        let pipe = self.pipe.take().context("splice engine used before init")?;
        let result = self.read_through(&pipe, fd, dst, offset);
        self.pipe = Some(pipe);
        result
    }

    fn read_through(&mut self, pipe: &Pipe, fd: RawFd, dst: &mut [u8], offset: Option<u64>) -> Result<usize> {
        let mut src = Self::endpoint(fd, offset);
        let pipe_in = pipe.write_fd();
        let mut done = 0;

        while done < dst.len() {
            let want = (dst.len() - done).min(pipe.capacity()).min(self.staging_size.max(1));
            let pulled = retry(&mut self.ops, fd, Readiness::Readable, |ops| {
                ops.splice(fd, src.offset.as_mut(), pipe_in, None, want, SPLICE_F_MOVE)
            })
            .with_context(|| format!("splice from fd={} failed", fd))?;
            if pulled == 0 {
                break;
            }

            let mut left = pulled;
            while left > 0 {
                let staging = self.take_staging()?;
                let mapped = match staging.map_out(pipe, left, self.map_mode) {
                    Ok(m) => m,
                    Err((staging, e)) => {
                        self.staging = Some(staging);
                        return Err(e).context("vmsplice map-out failed");
                    }
                };
                let got = mapped.len();
                dst[done..done + got].copy_from_slice(mapped.as_slice());
                match mapped.unmap(pipe) {
                    Ok(staging) => self.staging = Some(staging),
                    Err((_, e)) => return Err(e).context("vmsplice unmap failed"),
                }
                if got == 0 {
                    return Err(TransferError::new("vmsplice", libc::EIO)).context("pipe drained short");
                }
                done += got;
                left -= got;
            }
        }
        Ok(done)
    }

    fn do_fsync(&self, fd: RawFd) -> Result<usize> {
        // SAFETY: fsync only needs a descriptor
        if unsafe { libc::fsync(fd) } < 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| format!("fsync failed: fd={}", fd));
        }
        Ok(0)
    }
}

impl Default for SpliceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for SpliceEngine {
    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        let pipe = Pipe::with_capacity(config.max_transfer).context("failed to create splice pipe")?;
        self.staging_size = config.max_transfer.min(pipe.capacity()).max(1);
        self.staging = Some(PageBuffer::new(self.staging_size)?);
        debug!(pipe = pipe.capacity(), staging = self.staging_size, "splice engine ready");
        self.pipe = Some(pipe);
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let result = match op.op_type {
            OperationType::Read => {
                // SAFETY: the submitter keeps `buffer` valid for `length` bytes
                let dst = unsafe { std::slice::from_raw_parts_mut(op.buffer, op.length) };
                self.do_read(op.target_fd, dst, op.offset)
            }
            OperationType::Write => {
                // SAFETY: as above
                let src = unsafe { std::slice::from_raw_parts(op.buffer as *const u8, op.length) };
                self.do_write(op.target_fd, src, op.offset)
            }
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
        self.staging = None;
        self.pipe = None;
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            zero_copy: true,
            max_queue_depth: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::execute;
    use std::fs::{self, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;

    fn op(op_type: OperationType, fd: RawFd, offset: Option<u64>, buf: &mut [u8]) -> IOOperation {
        IOOperation {
            op_type,
            target_fd: fd,
            offset,
            buffer: buf.as_mut_ptr(),
            length: buf.len(),
            user_data: 1,
        }
    }

    fn engine(max_transfer: usize) -> SpliceEngine {
        let mut engine = SpliceEngine::new();
        engine.init(&EngineConfig { queue_depth: 1, max_transfer }).unwrap();
        engine
    }

    #[test]
    fn test_file_round_trip_across_chunks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();
        let fd = file.as_raw_fd();
        let mut engine = engine(64 * 1024);

        let mut data: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
        let n = execute(&mut engine, op(OperationType::Write, fd, Some(4096), &mut data)).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(fs::read(&path).unwrap()[4096..], data[..]);

        let mut back = vec![0u8; data.len()];
        let n = execute(&mut engine, op(OperationType::Read, fd, Some(4096), &mut back)).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn test_move_mode_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let data: Vec<u8> = (0..32 * 1024).map(|i| (i * 7) as u8).collect();
        fs::write(&path, &data).unwrap();
        let file = fs::File::open(&path).unwrap();

        let mut engine = SpliceEngine::new().with_map_mode(MapMode::Move);
        engine.init(&EngineConfig::default()).unwrap();
        let mut back = vec![0u8; data.len()];
        let n = execute(&mut engine, op(OperationType::Read, file.as_raw_fd(), Some(0), &mut back)).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, vec![3u8; 1000]).unwrap();
        let file = fs::File::open(&path).unwrap();
        let mut engine = engine(64 * 1024);

        let mut back = vec![0u8; 8192];
        let n = execute(&mut engine, op(OperationType::Read, file.as_raw_fd(), Some(0), &mut back)).unwrap();
        assert_eq!(n, 1000);
    }

    #[test]
    fn test_socket_send_and_receive() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = engine(64 * 1024);
        let mut rx = engine(64 * 1024);

        let mut msg = b"over the wire".to_vec();
        assert_eq!(execute(&mut tx, op(OperationType::Write, a.as_raw_fd(), None, &mut msg)).unwrap(), msg.len());

        let mut back = vec![0u8; msg.len()];
        assert_eq!(execute(&mut rx, op(OperationType::Read, b.as_raw_fd(), None, &mut back)).unwrap(), msg.len());
        assert_eq!(back, msg);
    }

    #[test]
    fn test_submit_before_init_fails_cleanly() {
        let mut engine = SpliceEngine::new();
        let mut buf = [0u8; 8];
        assert!(execute(&mut engine, op(OperationType::Write, 1, None, &mut buf)).is_err());
    }
}
