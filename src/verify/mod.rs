//! Block verification engine
//!
//! Write buffers are stamped by [`Verifier::populate`]: the buffer is filled
//! with random bytes or a cyclic pattern, cut into `interval`-sized
//! sub-blocks, and every sub-block gets a [`VerifyHeader`] carrying either a
//! digest of the bytes after the header, write metadata, or nothing (pattern
//! mode). [`Verifier::verify`] walks a read buffer with the same stride and
//! re-checks every sub-block.
//!
//! # Failure policy
//!
//! - A header that does not decode is [`VerifyError::CorruptHeader`] and
//!   ends verification of that read immediately.
//! - Digest, pattern and metadata disagreements are collected per sub-block
//!   and returned together as [`VerifyError::VerifyMismatch`]. With `fatal`
//!   set, checking stops at the first bad sub-block and the terminate token
//!   is cancelled so the owning worker stops issuing I/O.
//! - A metadata check against a range that was never written by this
//!   verifier is [`VerifyError::UntrackedBlock`].

pub mod header;
pub mod history;
pub mod pattern;

use crate::checksum::{Algorithm, Crc32cBackend, Digest};
use crate::config::VerifyConfig;
use crate::util::cancel::CancellationToken;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use self::header::{apply_swap, decode_block, header_size, HeaderFault, HeaderPayload, MetaPayload, VerifyHeader};
use self::history::{IoHistory, IoPiece};
use self::pattern::{fill_random, VerifyPattern};

/// Bytes shown per side in mismatch hex dumps
const DUMP_BYTES: usize = 64;

/// Verification failure
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("corrupt header in sub-block {index} at offset {offset}: {fault}")]
    CorruptHeader {
        offset: u64,
        index: usize,
        fault: HeaderFault,
    },

    #[error("{} of {blocks} sub-blocks failed verification", mismatches.len())]
    VerifyMismatch {
        blocks: usize,
        mismatches: Vec<BlockMismatch>,
    },

    #[error("no tracked write covers {len} bytes at offset {offset}")]
    UntrackedBlock { offset: u64, len: usize },

    #[error("sub-block of {len} bytes cannot hold a {needed} byte {algorithm} header")]
    BlockTooSmall {
        algorithm: Algorithm,
        len: usize,
        needed: usize,
    },
}

impl VerifyError {
    /// Sub-block indices that failed, for mismatch errors
    pub fn mismatch_indices(&self) -> Vec<usize> {
        match self {
            VerifyError::VerifyMismatch { mismatches, .. } => {
                mismatches.iter().map(|m| m.index).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// One failing sub-block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMismatch {
    /// Sub-block index within the checked buffer
    pub index: usize,
    /// Logical offset of the sub-block
    pub offset: u64,
    pub kind: MismatchKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchKind {
    Digest {
        stored: Digest,
        computed: Digest,
    },
    Pattern {
        /// Absolute index of the first bad byte within the sub-block
        index: usize,
        got: u8,
        wanted: u8,
        bad_bits: u32,
    },
    Meta {
        stored: MetaPayload,
        expected_offset: u64,
        expected_thread: u32,
        expected_sequence: Option<u32>,
    },
}

/// Where a buffer lives and who wrote it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockContext {
    /// Logical offset of the buffer's first byte
    pub offset: u64,
    /// Worker number of the writer (or expected writer)
    pub thread: u32,
}

/// Running verification counters for one worker
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VerifyStats {
    pub buffers_populated: u64,
    pub blocks_populated: u64,
    pub buffers_verified: u64,
    pub blocks_verified: u64,
    pub blocks_mismatched: u64,
    pub corrupt_headers: u64,
    pub untracked_reads: u64,
}

impl VerifyStats {
    pub fn failures(&self) -> u64 {
        self.blocks_mismatched + self.corrupt_headers + self.untracked_reads
    }

    pub fn merge(&mut self, other: &VerifyStats) {
        self.buffers_populated += other.buffers_populated;
        self.blocks_populated += other.blocks_populated;
        self.buffers_verified += other.buffers_verified;
        self.blocks_verified += other.blocks_verified;
        self.blocks_mismatched += other.blocks_mismatched;
        self.corrupt_headers += other.corrupt_headers;
        self.untracked_reads += other.untracked_reads;
    }
}

/// Per-worker verification state
///
/// Owned by exactly one worker; nothing in here is shared across threads
/// except the terminate token.
pub struct Verifier {
    algorithm: Algorithm,
    interval: usize,
    pattern: Option<VerifyPattern>,
    header_offset: usize,
    fatal: bool,
    backend: Crc32cBackend,
    rng: Xoshiro256PlusPlus,
    history: Option<IoHistory>,
    /// Piece most recently handed out by `next_verify`
    replaying: Option<IoPiece>,
    sequence: u32,
    stats: VerifyStats,
    terminate: CancellationToken,
}

impl Verifier {
    /// Create a verifier from the `[verify]` configuration
    ///
    /// `seed` drives the random fill so runs are reproducible.
    pub fn new(config: &VerifyConfig, seed: u64) -> Self {
        let backend = if config.crc32c_hw {
            Crc32cBackend::detect()
        } else {
            Crc32cBackend::Portable
        };
        debug!(
            algorithm = %config.algorithm,
            interval = config.interval,
            backend = ?backend,
            "verifier created"
        );

        Self {
            algorithm: config.algorithm,
            interval: config.interval,
            pattern: config.pattern,
            header_offset: config.offset,
            fatal: config.fatal,
            backend,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            history: None,
            replaying: None,
            sequence: 0,
            stats: VerifyStats::default(),
            terminate: CancellationToken::new(),
        }
    }

    /// Track every populated buffer for later replay
    pub fn with_history(mut self, history: IoHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Token cancelled when a fatal failure is seen
    pub fn with_terminate(mut self, token: CancellationToken) -> Self {
        self.terminate = token;
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Whether reads need checking at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self.algorithm, Algorithm::None | Algorithm::Null)
    }

    pub fn stats(&self) -> &VerifyStats {
        &self.stats
    }

    pub fn terminate_token(&self) -> &CancellationToken {
        &self.terminate
    }

    /// Stride used to cut a buffer of `len` bytes into sub-blocks
    fn stride(&self, len: usize) -> usize {
        if self.interval == 0 {
            len.max(1)
        } else {
            self.interval
        }
    }

    /// Fill `buf` and stamp a header into every sub-block
    ///
    /// No I/O is performed. The buffer is recorded in the write history
    /// when one is attached.
    pub fn populate(&mut self, buf: &mut [u8], ctx: BlockContext) -> Result<(), VerifyError> {
        match &self.pattern {
            Some(p) => p.fill(buf),
            None => fill_random(&mut self.rng, buf),
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.stats.buffers_populated += 1;

        if self.algorithm.writes_header() {
            let algorithm = self.algorithm;
            let hsize = header_size(algorithm);
            let stride = self.stride(buf.len());
            let (time_sec, time_usec) = now_parts();

            for (index, chunk) in buf.chunks_mut(stride).enumerate() {
                if chunk.len() < hsize {
                    return Err(VerifyError::BlockTooSmall {
                        algorithm,
                        len: chunk.len(),
                        needed: hsize,
                    });
                }

                let payload = match algorithm {
                    Algorithm::Meta => HeaderPayload::Meta(MetaPayload {
                        offset: ctx.offset + (index * stride) as u64,
                        thread: ctx.thread,
                        sequence: self.sequence,
                        time_sec,
                        time_usec,
                    }),
                    Algorithm::Pattern => HeaderPayload::Empty,
                    _ => match algorithm.digest(&chunk[hsize..], self.backend) {
                        Some(d) => HeaderPayload::Digest(d),
                        None => HeaderPayload::Empty,
                    },
                };

                let header = VerifyHeader {
                    algorithm,
                    block_len: chunk.len() as u32,
                    payload,
                };
                header
                    .encode_into(chunk)
                    .map_err(|_| VerifyError::BlockTooSmall { algorithm, len: chunk.len(), needed: hsize })?;

                if self.swaps(chunk.len(), hsize) {
                    // Length was checked by `swaps`
                    let _ = apply_swap(chunk, self.header_offset, hsize);
                }
                self.stats.blocks_populated += 1;
            }
        }

        if let Some(history) = &mut self.history {
            history.record(IoPiece {
                offset: ctx.offset,
                len: buf.len(),
                sequence: self.sequence,
            });
        }
        Ok(())
    }

    /// Check every sub-block of a buffer that was just read
    ///
    /// The buffer is modified in place when header relocation is on.
    pub fn verify(&mut self, buf: &mut [u8], ctx: BlockContext) -> Result<(), VerifyError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.stats.buffers_verified += 1;

        let algorithm = self.algorithm;
        let tracked = self.tracked_piece(ctx.offset, buf.len());
        if algorithm == Algorithm::Meta && tracked.is_none() {
            self.stats.untracked_reads += 1;
            error!(offset = ctx.offset, len = buf.len(), "meta verify of untracked block");
            return Err(VerifyError::UntrackedBlock { offset: ctx.offset, len: buf.len() });
        }
        // Only a piece written in one go has a single expected sequence
        let expected_sequence = tracked
            .filter(|p| p.offset == ctx.offset && p.len == buf.len())
            .map(|p| p.sequence);

        let hsize = header_size(algorithm);
        let stride = self.stride(buf.len());
        let blocks = buf.len().div_ceil(stride);
        let mut mismatches = Vec::new();

        for (index, chunk) in buf.chunks_mut(stride).enumerate() {
            if self.fatal && !mismatches.is_empty() {
                break;
            }
            let start = index * stride;
            let offset = ctx.offset + start as u64;

            if self.swaps(chunk.len(), hsize) {
                let _ = apply_swap(chunk, self.header_offset, hsize);
            }

            let header = match decode_block(chunk, algorithm) {
                Ok(h) => h,
                Err(fault) => {
                    self.stats.corrupt_headers += 1;
                    error!(offset, index, %fault, "corrupt verify header");
                    debug!("header bytes:\n{}", hex_dump(&chunk[..chunk.len().min(DUMP_BYTES)]));
                    if self.fatal {
                        self.terminate.cancel();
                    }
                    return Err(VerifyError::CorruptHeader { offset, index, fault });
                }
            };
            self.stats.blocks_verified += 1;

            let data = &chunk[hsize..];
            let kind = match header.payload {
                HeaderPayload::Digest(stored) => self.check_digest(data, stored),
                HeaderPayload::Meta(stored) => {
                    let meta = check_meta(&stored, offset, ctx.thread, expected_sequence);
                    match (meta, &self.pattern) {
                        (None, Some(p)) => check_pattern(p, data, start + hsize),
                        (meta, _) => meta,
                    }
                }
                HeaderPayload::Empty => self
                    .pattern
                    .as_ref()
                    .and_then(|p| check_pattern(p, data, start + hsize)),
            };

            if let Some(kind) = kind {
                log_mismatch(index, offset, &kind, data);
                mismatches.push(BlockMismatch { index, offset, kind });
            }
        }

        if mismatches.is_empty() {
            return Ok(());
        }

        self.stats.blocks_mismatched += mismatches.len() as u64;
        if self.fatal {
            self.terminate.cancel();
        }
        Err(VerifyError::VerifyMismatch { blocks, mismatches })
    }

    /// Hand out the next written piece to read back and verify
    pub fn next_verify(&mut self) -> Option<IoPiece> {
        let piece = self.history.as_mut()?.next_verify();
        self.replaying = piece;
        piece
    }

    /// Pieces still waiting to be verified
    pub fn pending(&self) -> usize {
        self.history.as_ref().map_or(0, |h| h.len())
    }

    fn tracked_piece(&self, offset: u64, len: usize) -> Option<IoPiece> {
        let end = offset + len as u64;
        self.replaying
            .filter(|p| p.offset <= offset && p.end() >= end)
            .or_else(|| self.history.as_ref()?.lookup(offset, len))
    }

    fn swaps(&self, chunk_len: usize, hsize: usize) -> bool {
        self.header_offset != 0 && chunk_len >= self.header_offset + hsize
    }

    fn check_digest(&self, data: &[u8], stored: Digest) -> Option<MismatchKind> {
        let computed = self.algorithm.digest(data, self.backend)?;
        (computed != stored).then_some(MismatchKind::Digest { stored, computed })
    }
}

fn check_meta(
    stored: &MetaPayload,
    expected_offset: u64,
    expected_thread: u32,
    expected_sequence: Option<u32>,
) -> Option<MismatchKind> {
    let sequence_ok = expected_sequence.map_or(true, |s| s == stored.sequence);
    if stored.offset == expected_offset && stored.thread == expected_thread && sequence_ok {
        return None;
    }
    Some(MismatchKind::Meta {
        stored: *stored,
        expected_offset,
        expected_thread,
        expected_sequence,
    })
}

// `phase` is the absolute buffer index of `data[0]`, which is where the fill
// pattern cycle stands at that byte.
fn check_pattern(pattern: &VerifyPattern, data: &[u8], phase: usize) -> Option<MismatchKind> {
    pattern.check(data, phase).err().map(|m| MismatchKind::Pattern {
        index: phase + m.index,
        got: m.got,
        wanted: m.wanted,
        bad_bits: m.bad_bits,
    })
}

fn log_mismatch(index: usize, offset: u64, kind: &MismatchKind, data: &[u8]) {
    match kind {
        MismatchKind::Digest { stored, computed } => {
            error!(
                index,
                offset,
                stored = %stored.to_hex(),
                computed = %computed.to_hex(),
                "digest mismatch"
            );
            debug!("data:\n{}", hex_dump(&data[..data.len().min(DUMP_BYTES)]));
        }
        MismatchKind::Pattern { index: at, got, wanted, bad_bits } => {
            error!(
                index,
                offset,
                at,
                got = *got,
                wanted = *wanted,
                bad_bits,
                "pattern mismatch"
            );
        }
        MismatchKind::Meta {
            stored,
            expected_offset,
            expected_thread,
            expected_sequence,
        } => {
            error!(
                index,
                stored_offset = stored.offset,
                expected_offset,
                stored_thread = stored.thread,
                expected_thread,
                stored_sequence = stored.sequence,
                expected_sequence = ?expected_sequence,
                "meta mismatch"
            );
        }
    }
}

/// Offset-prefixed hex dump, 16 bytes per line
pub fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(i, line)| format!("{:04x}: {}", i * 16, spaced_hex(line)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn spaced_hex(line: &[u8]) -> String {
    let hex = hex::encode(line);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or("??"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn now_parts() -> (u64, u64) {
    let now = chrono::Utc::now();
    (now.timestamp().max(0) as u64, now.timestamp_subsec_micros() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(algorithm: Algorithm, interval: usize) -> VerifyConfig {
        VerifyConfig {
            algorithm,
            interval,
            ..VerifyConfig::default()
        }
    }

    fn ctx(offset: u64) -> BlockContext {
        BlockContext { offset, thread: 3 }
    }

    const HEADERED: [Algorithm; 10] = [
        Algorithm::Md5,
        Algorithm::Crc64,
        Algorithm::Crc32c,
        Algorithm::Crc32cIntel,
        Algorithm::Crc32,
        Algorithm::Crc16,
        Algorithm::Crc7,
        Algorithm::Sha256,
        Algorithm::Sha512,
        Algorithm::Meta,
    ];

    proptest! {
        #[test]
        fn prop_populate_then_verify_passes(
            alg_idx in 0usize..HEADERED.len(),
            len in 128usize..16384,
            interval in prop_oneof![Just(0usize), 80usize..4096],
            seed in any::<u64>(),
        ) {
            let alg = HEADERED[alg_idx];
            let cfg = config(alg, interval);
            let mut v = Verifier::new(&cfg, seed).with_history(IoHistory::ordered());
            let mut buf = vec![0u8; len];
            let stride = if interval == 0 { len } else { interval };
            // residual sub-block must hold a header
            prop_assume!(len % stride == 0 || len % stride >= header_size(alg));

            v.populate(&mut buf, ctx(8192)).unwrap();
            prop_assert!(v.verify(&mut buf, ctx(8192)).is_ok());
        }
    }

    #[test]
    fn test_pattern_round_trip() {
        let mut cfg = config(Algorithm::Pattern, 512);
        cfg.pattern = VerifyPattern::parse("0xa1b2c3").ok();
        let mut v = Verifier::new(&cfg, 1);
        let mut buf = vec![0u8; 4096 + 100];
        v.populate(&mut buf, ctx(0)).unwrap();
        v.verify(&mut buf, ctx(0)).unwrap();
    }

    #[test]
    fn test_block_length_matches_header_plus_data() {
        for alg in HEADERED {
            let mut v = Verifier::new(&config(alg, 1000), 9);
            let mut buf = vec![0u8; 4500];
            v.populate(&mut buf, ctx(0)).unwrap();
            for chunk in buf.chunks(1000) {
                let h = decode_block(chunk, alg).unwrap();
                assert_eq!(h.size() + h.data_len(), h.block_len as usize, "{}", alg);
                assert_eq!(h.block_len as usize, chunk.len());
            }
        }
    }

    #[test]
    fn test_crc32_sixteen_sub_blocks_single_corruption() {
        let mut v = Verifier::new(&config(Algorithm::Crc32, 4096), 42);
        let mut buf = vec![0u8; 64 * 1024];
        v.populate(&mut buf, ctx(0)).unwrap();

        for i in 0..16 {
            let h = decode_block(&buf[i * 4096..(i + 1) * 4096], Algorithm::Crc32).unwrap();
            let HeaderPayload::Digest(stored) = h.payload else {
                panic!("expected digest payload");
            };
            let computed = Algorithm::Crc32
                .digest(&buf[i * 4096 + 16..(i + 1) * 4096], Crc32cBackend::Portable)
                .unwrap();
            assert_eq!(stored, computed);
        }

        // first payload byte of sub-block 1
        buf[4096 + header_size(Algorithm::Crc32)] ^= 0x01;
        let err = v.verify(&mut buf, ctx(0)).unwrap_err();
        assert_eq!(err.mismatch_indices(), vec![1]);
        assert_eq!(v.stats().blocks_verified, 16);
        assert_eq!(v.stats().blocks_mismatched, 1);
    }

    #[test]
    fn test_flipped_digest_byte_hits_only_that_block() {
        for alg in HEADERED.iter().copied().filter(|a| a.is_content_digest()) {
            let mut v = Verifier::new(&config(alg, 1024), 5);
            let mut buf = vec![0u8; 4096];
            v.populate(&mut buf, ctx(0)).unwrap();

            let target = 2 * 1024 + header::BASE_HEADER_SIZE + alg.digest_size() - 1;
            buf[target] ^= 0xff;
            let err = v.verify(&mut buf, ctx(0)).unwrap_err();
            assert_eq!(err.mismatch_indices(), vec![2], "{}", alg);
        }
    }

    #[test]
    fn test_residual_last_block() {
        let mut v = Verifier::new(&config(Algorithm::Sha256, 4096), 7);
        let mut buf = vec![0u8; 4096 * 2 + 300];
        v.populate(&mut buf, ctx(0)).unwrap();

        let last = decode_block(&buf[8192..], Algorithm::Sha256).unwrap();
        assert_eq!(last.block_len, 300);
        v.verify(&mut buf, ctx(0)).unwrap();
    }

    #[test]
    fn test_residual_too_small_for_header() {
        let mut v = Verifier::new(&config(Algorithm::Sha512, 4096), 7);
        let mut buf = vec![0u8; 4096 + 10];
        assert!(matches!(
            v.populate(&mut buf, ctx(0)),
            Err(VerifyError::BlockTooSmall { len: 10, needed: 76, .. })
        ));
    }

    #[test]
    fn test_meta_offset_mismatch() {
        let mut v = Verifier::new(&config(Algorithm::Meta, 512), 1).with_history(IoHistory::ordered());
        let mut buf = vec![0u8; 2048];
        v.populate(&mut buf, ctx(4096)).unwrap();

        // same data presented as a read from a different tracked offset
        let mut other = vec![0u8; 2048];
        v.populate(&mut other, ctx(0)).unwrap();
        let err = v.verify(&mut buf, ctx(0)).unwrap_err();
        assert_eq!(err.mismatch_indices(), vec![0, 1, 2, 3]);

        v.verify(&mut buf, ctx(4096)).unwrap();
    }

    #[test]
    fn test_meta_thread_mismatch() {
        let mut v = Verifier::new(&config(Algorithm::Meta, 0), 1).with_history(IoHistory::fifo());
        let mut buf = vec![0u8; 512];
        v.populate(&mut buf, ctx(0)).unwrap();
        let err = v
            .verify(&mut buf, BlockContext { offset: 0, thread: 9 })
            .unwrap_err();
        assert!(matches!(err, VerifyError::VerifyMismatch { .. }));
    }

    #[test]
    fn test_meta_untracked_block() {
        let mut v = Verifier::new(&config(Algorithm::Meta, 512), 1).with_history(IoHistory::ordered());
        let mut buf = vec![0u8; 1024];
        v.populate(&mut buf, ctx(0)).unwrap();
        let err = v.verify(&mut buf, ctx(1 << 20)).unwrap_err();
        assert!(matches!(err, VerifyError::UntrackedBlock { offset, len: 1024 } if offset == 1 << 20));
        assert_eq!(v.stats().untracked_reads, 1);
    }

    #[test]
    fn test_replayed_piece_is_tracked() {
        let mut v = Verifier::new(&config(Algorithm::Meta, 512), 1).with_history(IoHistory::fifo());
        let mut buf = vec![0u8; 1024];
        v.populate(&mut buf, ctx(0)).unwrap();

        let piece = v.next_verify().unwrap();
        assert_eq!(v.pending(), 0);
        v.verify(&mut buf, ctx(piece.offset)).unwrap();
    }

    #[test]
    fn test_corrupt_magic_is_reported_first() {
        let mut v = Verifier::new(&config(Algorithm::Crc32c, 1024), 1);
        let mut buf = vec![0u8; 4096];
        v.populate(&mut buf, ctx(0)).unwrap();
        buf[1024] ^= 0xff;
        let err = v.verify(&mut buf, ctx(0)).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::CorruptHeader { index: 1, offset: 1024, fault: HeaderFault::BadMagic(_) }
        ));
    }

    #[test]
    fn test_header_relocation() {
        let mut cfg = config(Algorithm::Md5, 1024);
        cfg.offset = 512;
        let mut v = Verifier::new(&cfg, 11);
        let mut buf = vec![0u8; 4096];
        v.populate(&mut buf, ctx(0)).unwrap();

        // header no longer sits at the start of each sub-block
        assert!(VerifyHeader::decode(&buf[..1024]).is_err());
        assert!(VerifyHeader::decode(&buf[512..1024]).is_ok());
        v.verify(&mut buf, ctx(0)).unwrap();
    }

    #[test]
    fn test_fatal_stops_at_first_mismatch() {
        let mut cfg = config(Algorithm::Crc16, 512);
        cfg.fatal = true;
        let token = CancellationToken::new();
        let mut v = Verifier::new(&cfg, 3).with_terminate(token.clone());
        let mut buf = vec![0u8; 4096];
        v.populate(&mut buf, ctx(0)).unwrap();

        buf[512 + 100] ^= 1;
        buf[2048 + 100] ^= 1;
        let err = v.verify(&mut buf, ctx(0)).unwrap_err();
        assert_eq!(err.mismatch_indices(), vec![1]);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_soft_failure_collects_all() {
        let mut v = Verifier::new(&config(Algorithm::Crc16, 512), 3);
        let mut buf = vec![0u8; 4096];
        v.populate(&mut buf, ctx(0)).unwrap();

        buf[512 + 100] ^= 1;
        buf[2048 + 100] ^= 1;
        let err = v.verify(&mut buf, ctx(0)).unwrap_err();
        assert_eq!(err.mismatch_indices(), vec![1, 4]);
        assert!(!v.terminate_token().is_cancelled());
    }

    #[test]
    fn test_pattern_reports_bad_bits() {
        let mut cfg = config(Algorithm::Pattern, 0);
        cfg.pattern = VerifyPattern::new(&[0x0f]);
        let mut v = Verifier::new(&cfg, 3);
        let mut buf = vec![0u8; 256];
        v.populate(&mut buf, ctx(0)).unwrap();

        buf[100] = 0xf0;
        let err = v.verify(&mut buf, ctx(0)).unwrap_err();
        let VerifyError::VerifyMismatch { mismatches, .. } = err else {
            panic!("expected mismatch");
        };
        assert_eq!(
            mismatches[0].kind,
            MismatchKind::Pattern { index: 100, got: 0xf0, wanted: 0x0f, bad_bits: 8 }
        );
    }

    #[test]
    fn test_none_and_null_skip_checks() {
        for alg in [Algorithm::None, Algorithm::Null] {
            let mut v = Verifier::new(&config(alg, 512), 3);
            let mut buf = vec![0u8; 1024];
            v.populate(&mut buf, ctx(0)).unwrap();
            buf.fill(0);
            assert!(v.verify(&mut buf, ctx(0)).is_ok());
            assert_eq!(v.stats().blocks_populated, 0);
        }
    }

    #[test]
    fn test_hex_dump_format() {
        let dump = hex_dump(&(0u8..20).collect::<Vec<_>>());
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000: 00 01 02"));
        assert_eq!(lines[1], "0010: 10 11 12 13");
    }
}
