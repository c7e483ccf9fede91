//! Descriptor → pipe → descriptor relay
//!
//! One call to [`PipeRelay::transfer`] pulls from the source into the pipe
//! and pushes the same bytes out to the destination. A pull that returns
//! fewer bytes than asked for is a short move: the relay finishes pushing
//! what it got and returns, so the caller resubmits the remainder. A pull
//! of zero means the source is exhausted. Bytes that were pulled but could
//! not be pushed stay in the pipe and go out first on the next call.

use super::{KernelSplice, Pipe, Readiness, SpliceOps, TransferError, SPLICE_F_MORE, SPLICE_F_MOVE};
use std::os::fd::RawFd;
use thiserror::Error;
use tracing::debug;

/// A relay call that failed after delivering part of the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{source} after {delivered} bytes delivered")]
pub struct RelayError {
    /// Bytes already at the destination when the call failed
    pub delivered: usize,
    #[source]
    pub source: TransferError,
}

/// Lifecycle of a relay transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    /// Partial progress; the caller owes a resubmission
    InFlight,
    /// Requested length delivered, or the source ran dry
    Complete,
    Failed(TransferError),
}

/// One side of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub fd: RawFd,
    /// Position for seekable descriptors; advanced as bytes move
    pub offset: Option<i64>,
}

impl Endpoint {
    /// File or block device at `offset`
    pub fn seekable(fd: RawFd, offset: u64) -> Self {
        Self { fd, offset: Some(offset as i64) }
    }

    /// Socket, pipe or character device
    pub fn stream(fd: RawFd) -> Self {
        Self { fd, offset: None }
    }
}

/// Relay state for one worker
pub struct PipeRelay<O: SpliceOps = KernelSplice> {
    ops: O,
    pipe: Pipe,
    /// Bytes pulled into the pipe but not yet pushed out
    buffered: usize,
    state: TransferState,
    exhausted: bool,
    flags: u32,
}

impl PipeRelay<KernelSplice> {
    /// Relay over a fresh kernel pipe sized for `chunk` bytes
    pub fn new(chunk: usize) -> Result<Self, TransferError> {
        Ok(Self::with_ops(KernelSplice, Pipe::with_capacity(chunk)?))
    }
}

impl<O: SpliceOps> PipeRelay<O> {
    pub fn with_ops(ops: O, pipe: Pipe) -> Self {
        Self {
            ops,
            pipe,
            buffered: 0,
            state: TransferState::Idle,
            exhausted: false,
            flags: SPLICE_F_MOVE | SPLICE_F_MORE,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Bytes carried over in the pipe
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Whether the last pull hit end of input
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    pub fn ops_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    /// Move up to `len` bytes from `src` to `dst`
    ///
    /// Returns the bytes delivered to `dst` by this call. Stops early after a
    /// short pull; the caller resubmits the rest. On failure the error says
    /// how much of the request already went out.
    pub fn transfer(&mut self, src: &mut Endpoint, dst: &mut Endpoint, len: usize) -> Result<usize, RelayError> {
        self.state = TransferState::InFlight;
        self.exhausted = false;
        let mut delivered = 0;

        match self.run(src, dst, len, &mut delivered) {
            Ok(()) => {
                self.state = if delivered == len || self.exhausted {
                    TransferState::Complete
                } else {
                    TransferState::InFlight
                };
                Ok(delivered)
            }
            Err(e) => {
                debug!(op = e.op, os_code = e.os_code, delivered, buffered = self.buffered, "relay failed");
                self.state = TransferState::Failed(e);
                Err(RelayError { delivered, source: e })
            }
        }
    }

    /// Resubmit until `len` bytes are delivered or the source is exhausted
    pub fn transfer_all(&mut self, src: &mut Endpoint, dst: &mut Endpoint, len: usize) -> Result<usize, RelayError> {
        let mut total = 0;
        while total < len {
            let n = self.transfer(src, dst, len - total).map_err(|e| RelayError {
                delivered: total + e.delivered,
                source: e.source,
            })?;
            total += n;
            if self.exhausted || n == 0 {
                break;
            }
        }
        Ok(total)
    }

    fn run(&mut self, src: &mut Endpoint, dst: &mut Endpoint, len: usize, delivered: &mut usize) -> Result<(), TransferError> {
        let pipe_in = self.pipe.write_fd();
        let pipe_out = self.pipe.read_fd();
        let flags = self.flags;

        while *delivered < len {
            let mut short = false;
            if self.buffered == 0 {
                let want = (len - *delivered).min(self.pipe.capacity());
                let n = retry(&mut self.ops, src.fd, Readiness::Readable, |ops| {
                    ops.splice(src.fd, src.offset.as_mut(), pipe_in, None, want, flags)
                })?;
                if n == 0 {
                    self.exhausted = true;
                    return Ok(());
                }
                self.buffered = n;
                short = n < want;
            }

            let mut out = self.buffered.min(len - *delivered);
            while out > 0 {
                let m = retry(&mut self.ops, dst.fd, Readiness::Writable, |ops| {
                    ops.splice(pipe_out, None, dst.fd, dst.offset.as_mut(), out, flags)
                })?;
                if m == 0 {
                    return Err(TransferError::new("splice", libc::EPIPE));
                }
                out -= m;
                self.buffered -= m;
                *delivered += m;
            }

            if short {
                break;
            }
        }
        Ok(())
    }
}

/// Retry `call` on EINTR, and on EAGAIN after `fd` becomes ready
pub fn retry<O: SpliceOps>(
    ops: &mut O,
    fd: RawFd,
    readiness: Readiness,
    mut call: impl FnMut(&mut O) -> Result<usize, TransferError>,
) -> Result<usize, TransferError> {
    loop {
        match call(ops) {
            Err(e) if e.os_code == libc::EINTR => continue,
            Err(e) if e.would_block() => {
                ops.wait(fd, readiness, -1)?;
            }
            other => return other,
        }
    }
}

/// Splice exactly `len` buffered bytes from `pipe_out` to `dst`
pub fn drain_pipe<O: SpliceOps>(ops: &mut O, pipe_out: RawFd, dst: &mut Endpoint, len: usize) -> Result<(), TransferError> {
    let mut left = len;
    while left > 0 {
        let fd = dst.fd;
        let n = retry(ops, fd, Readiness::Writable, |ops| {
            ops.splice(pipe_out, None, fd, dst.offset.as_mut(), left, SPLICE_F_MOVE)
        })?;
        if n == 0 {
            return Err(TransferError::new("splice", libc::EPIPE));
        }
        left -= n;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsRawFd;

    pub(crate) const SRC_FD: RawFd = 1000;
    pub(crate) const DST_FD: RawFd = 2000;

    /// Scripted syscalls over an in-memory source, pipe and destination
    pub(crate) struct ScriptedOps {
        pub src: Vec<u8>,
        pub dst: Vec<u8>,
        pub pipe: VecDeque<u8>,
        pub pipe_in: RawFd,
        pub pipe_out: RawFd,
        /// Per-call caps for pulls; empty means unlimited
        pub pull_limits: VecDeque<usize>,
        /// Per-call caps for pushes
        pub push_limits: VecDeque<usize>,
        /// Errors returned before the next matching call succeeds
        pub pull_errors: VecDeque<i32>,
        pub push_errors: VecDeque<i32>,
        pub waits: usize,
        pub pulls: usize,
    }

    impl ScriptedOps {
        pub(crate) fn new(src: Vec<u8>, pipe: &Pipe) -> Self {
            Self {
                src,
                dst: Vec::new(),
                pipe: VecDeque::new(),
                pipe_in: pipe.write_fd(),
                pipe_out: pipe.read_fd(),
                pull_limits: VecDeque::new(),
                push_limits: VecDeque::new(),
                pull_errors: VecDeque::new(),
                push_errors: VecDeque::new(),
                waits: 0,
                pulls: 0,
            }
        }
    }

    impl SpliceOps for ScriptedOps {
        fn splice(
            &mut self,
            fd_in: RawFd,
            off_in: Option<&mut i64>,
            fd_out: RawFd,
            off_out: Option<&mut i64>,
            len: usize,
            _flags: u32,
        ) -> Result<usize, TransferError> {
            if fd_out == self.pipe_in {
                if let Some(code) = self.pull_errors.pop_front() {
                    return Err(TransferError::new("splice", code));
                }
                self.pulls += 1;
                let pos = off_in.as_ref().map_or(0, |o| **o as usize);
                let cap = self.pull_limits.pop_front().unwrap_or(usize::MAX);
                let n = len.min(cap).min(self.src.len().saturating_sub(pos));
                self.pipe.extend(&self.src[pos..pos + n]);
                if let Some(o) = off_in {
                    *o += n as i64;
                }
                Ok(n)
            } else if fd_in == self.pipe_out {
                if let Some(code) = self.push_errors.pop_front() {
                    return Err(TransferError::new("splice", code));
                }
                let cap = self.push_limits.pop_front().unwrap_or(usize::MAX);
                let n = len.min(cap).min(self.pipe.len());
                let pos = off_out.as_ref().map_or(self.dst.len(), |o| **o as usize);
                if self.dst.len() < pos + n {
                    self.dst.resize(pos + n, 0);
                }
                for (i, b) in self.pipe.drain(..n).enumerate() {
                    self.dst[pos + i] = b;
                }
                if let Some(o) = off_out {
                    *o += n as i64;
                }
                Ok(n)
            } else {
                Err(TransferError::new("splice", libc::EBADF))
            }
        }

        fn tee(&mut self, _: RawFd, _: RawFd, _: usize, _: u32) -> Result<usize, TransferError> {
            Err(TransferError::new("tee", libc::EINVAL))
        }

        fn wait(&mut self, _: RawFd, _: Readiness, _: i32) -> Result<bool, TransferError> {
            self.waits += 1;
            Ok(true)
        }
    }

    fn scripted(data: Vec<u8>) -> PipeRelay<ScriptedOps> {
        let pipe = Pipe::new().unwrap();
        let ops = ScriptedOps::new(data, &pipe);
        PipeRelay::with_ops(ops, pipe)
    }

    fn resubmit_until_done(relay: &mut PipeRelay<ScriptedOps>, len: usize) -> usize {
        let mut src = Endpoint::seekable(SRC_FD, 0);
        let mut dst = Endpoint::seekable(DST_FD, 0);
        let mut total = 0;
        while total < len {
            let n = relay.transfer(&mut src, &mut dst, len - total).unwrap();
            total += n;
            if relay.is_exhausted() {
                break;
            }
        }
        total
    }

    proptest! {
        #[test]
        fn prop_short_moves_deliver_same_bytes(
            data in prop::collection::vec(any::<u8>(), 2..4096),
            cuts in prop::collection::vec(1usize..4096, 0..64),
        ) {
            let len = data.len();
            let mut relay = scripted(data.clone());
            relay.ops_mut().pull_limits = cuts.iter().map(|c| 1 + c % (len - 1)).collect();

            let total = resubmit_until_done(&mut relay, len);
            prop_assert_eq!(total, len);
            prop_assert_eq!(&relay.ops_mut().dst, &data);
            prop_assert_eq!(relay.state(), TransferState::Complete);
            prop_assert_eq!(relay.buffered(), 0);
        }
    }

    #[test]
    fn test_one_byte_moves() {
        let data: Vec<u8> = (0..200u8).collect();
        let mut relay = scripted(data.clone());
        relay.ops_mut().pull_limits = std::iter::repeat(1).take(200).collect();

        assert_eq!(resubmit_until_done(&mut relay, 200), 200);
        assert_eq!(relay.ops_mut().dst, data);
        assert_eq!(relay.ops_mut().pulls, 200);
    }

    #[test]
    fn test_short_move_leaves_transfer_in_flight() {
        let mut relay = scripted(vec![1u8; 1000]);
        relay.ops_mut().pull_limits = [300].into_iter().collect();
        let mut src = Endpoint::seekable(SRC_FD, 0);
        let mut dst = Endpoint::seekable(DST_FD, 0);

        assert_eq!(relay.transfer(&mut src, &mut dst, 1000).unwrap(), 300);
        assert_eq!(relay.state(), TransferState::InFlight);
        assert_eq!(src.offset, Some(300));
        assert_eq!(dst.offset, Some(300));

        assert_eq!(relay.transfer(&mut src, &mut dst, 700).unwrap(), 700);
        assert_eq!(relay.state(), TransferState::Complete);
    }

    #[test]
    fn test_exhausted_source() {
        let mut relay = scripted(vec![9u8; 100]);
        let mut src = Endpoint::seekable(SRC_FD, 0);
        let mut dst = Endpoint::stream(DST_FD);
        assert_eq!(relay.transfer_all(&mut src, &mut dst, 4096).unwrap(), 100);
        assert!(relay.is_exhausted());
        assert_eq!(relay.state(), TransferState::Complete);
    }

    #[test]
    fn test_short_pushes_are_looped() {
        let data = vec![3u8; 512];
        let mut relay = scripted(data.clone());
        relay.ops_mut().push_limits = [10, 20, 30].into_iter().collect();
        let mut src = Endpoint::seekable(SRC_FD, 0);
        let mut dst = Endpoint::seekable(DST_FD, 0);
        assert_eq!(relay.transfer(&mut src, &mut dst, 512).unwrap(), 512);
        assert_eq!(relay.ops_mut().dst, data);
    }

    #[test]
    fn test_eagain_waits_then_retries() {
        let mut relay = scripted(vec![5u8; 64]);
        relay.ops_mut().pull_errors = [libc::EAGAIN, libc::EINTR].into_iter().collect();
        relay.ops_mut().push_errors = [libc::EAGAIN].into_iter().collect();
        assert_eq!(resubmit_until_done(&mut relay, 64), 64);
        assert_eq!(relay.ops_mut().waits, 2);
    }

    #[test]
    fn test_failed_push_keeps_bytes_for_next_call() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut relay = scripted(data.clone());
        // first push moves 100 bytes, the second stalls
        relay.ops_mut().push_limits = [100, 0].into_iter().collect();
        let mut src = Endpoint::seekable(SRC_FD, 0);
        let mut dst = Endpoint::seekable(DST_FD, 0);

        let err = relay.transfer(&mut src, &mut dst, 256).unwrap_err();
        assert_eq!(err.source.os_code, libc::EPIPE);
        assert_eq!(err.delivered, 100);
        assert!(matches!(relay.state(), TransferState::Failed(_)));
        assert_eq!(relay.buffered(), 156);

        // nothing new is pulled until the carried bytes are out
        let pulls = relay.ops_mut().pulls;
        assert_eq!(relay.transfer(&mut src, &mut dst, 156).unwrap(), 156);
        assert_eq!(relay.ops_mut().pulls, pulls);
        assert_eq!(relay.ops_mut().dst, data);
    }

    #[test]
    fn test_transfer_all_reports_progress_before_failure() {
        let data = vec![7u8; 300];
        let mut relay = scripted(data);
        // two short pulls go through, the third push stalls after 20 bytes
        relay.ops_mut().pull_limits = [100, 100].into_iter().collect();
        relay.ops_mut().push_limits = [100, 100, 20, 0].into_iter().collect();
        let mut src = Endpoint::seekable(SRC_FD, 0);
        let mut dst = Endpoint::seekable(DST_FD, 0);

        let err = relay.transfer_all(&mut src, &mut dst, 300).unwrap_err();
        assert_eq!(err.delivered, 220);
        assert_eq!(err.source.os_code, libc::EPIPE);
        assert_eq!(relay.ops_mut().dst.len(), 220);
    }

    #[test]
    fn test_real_file_to_file() {
        let mut input = tempfile::tempfile().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        input.write_all(&data).unwrap();
        let mut output: File = tempfile::tempfile().unwrap();

        let mut relay = PipeRelay::new(64 * 1024).unwrap();
        let mut src = Endpoint::seekable(input.as_raw_fd(), 0);
        let mut dst = Endpoint::seekable(output.as_raw_fd(), 4096);
        let n = relay.transfer_all(&mut src, &mut dst, data.len()).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(dst.offset, Some(4096 + data.len() as i64));

        let mut copied = Vec::new();
        output.seek(SeekFrom::Start(4096)).unwrap();
        output.read_to_end(&mut copied).unwrap();
        assert_eq!(copied, data);
    }
}
