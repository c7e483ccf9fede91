//! Store-and-stream duplication
//!
//! `tee(2)` copies what is buffered in one pipe into a second pipe without
//! consuming it. Splicing each pipe to its own destination then delivers the
//! same bytes twice, for example to a file and to a socket.

use super::relay::{drain_pipe, retry, Endpoint};
use super::{KernelSplice, Pipe, Readiness, SpliceOps, TransferError};
use tracing::debug;

/// Bytes delivered to each side
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeeStats {
    pub stored: u64,
    pub streamed: u64,
}

/// Duplicates an input pipe through a private pipe
pub struct Tee<O: SpliceOps = KernelSplice> {
    ops: O,
    dup: Pipe,
}

impl Tee<KernelSplice> {
    pub fn new() -> Result<Self, TransferError> {
        Ok(Self::with_ops(KernelSplice, Pipe::new()?))
    }
}

impl<O: SpliceOps> Tee<O> {
    pub fn with_ops(ops: O, dup: Pipe) -> Self {
        Self { ops, dup }
    }

    /// Copy up to `len` buffered bytes of `input` into the private pipe
    ///
    /// `input` keeps its bytes. Zero means the input has nothing more and its
    /// write side is closed.
    pub fn duplicate(&mut self, input: &Pipe, len: usize) -> Result<usize, TransferError> {
        let want = len.min(self.dup.capacity());
        let (fd_in, fd_out) = (input.read_fd(), self.dup.write_fd());
        retry(&mut self.ops, fd_in, Readiness::Readable, |ops| ops.tee(fd_in, fd_out, want, 0))
    }

    /// Deliver `len` bytes from `input` to both `store` and `stream`
    ///
    /// Stops early if the input runs dry.
    pub fn store_and_stream(
        &mut self,
        input: &Pipe,
        store: &mut Endpoint,
        stream: &mut Endpoint,
        len: usize,
    ) -> Result<TeeStats, TransferError> {
        let mut stats = TeeStats::default();
        let mut left = len;

        while left > 0 {
            let n = self.duplicate(input, left)?;
            if n == 0 {
                debug!(delivered = stats.stored, wanted = len, "tee input ended");
                break;
            }
            drain_pipe(&mut self.ops, input.read_fd(), store, n)?;
            stats.stored += n as u64;
            drain_pipe(&mut self.ops, self.dup.read_fd(), stream, n)?;
            stats.streamed += n as u64;
            left -= n;
        }

        Ok(stats)
    }
}
