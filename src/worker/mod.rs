//! Job worker
//!
//! A worker is one thread driving IO against its own copies of the laid-out
//! targets. It owns its engine, buffer, lock handles and one [`Verifier`] per
//! target; nothing here is shared with other workers except the file locks
//! and the stop token.
//!
//! # Lifecycle
//!
//! 1. **Open**: every usable target is opened with the workload's flags
//! 2. **Main passes**: `loops` passes over each target's window. Each
//!    operation is a read or a write according to `read_percent`. Writes are
//!    populated (and recorded) by the verifier first. In read-only workloads
//!    reads are verified as they complete.
//! 3. **Verify pass**: after each writing pass, every recorded piece is read
//!    back and verified, in offset order for random workloads and issue
//!    order otherwise
//! 4. **Close**: descriptors are released and [`WorkerStats`] returned
//!
//! The worker stops early when the run-wide stop token is cancelled or a
//! fatal verification failure cancels its terminate token.

pub mod latency;

use self::latency::LatencyHistogram;
use crate::checksum::Algorithm;
use crate::config::{AccessPattern, Config};
use crate::engine::{self, create_engine, EngineConfig, IOEngine, IOOperation, OperationType};
use crate::target::{LockHandle, LockTable, OpenFlags, Target};
use crate::util::buffer::AlignedBuffer;
use crate::util::cancel::CancellationToken;
use crate::verify::history::IoHistory;
use crate::verify::{BlockContext, VerifyStats, Verifier};
use crate::Result;
use anyhow::Context;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Counters for one operation type
#[derive(Debug, Clone, Default, Serialize)]
pub struct OpStats {
    pub ops: u64,
    pub bytes: u64,
    pub latency: LatencyHistogram,
}

impl OpStats {
    pub fn record(&mut self, bytes: usize, latency: Duration) {
        self.latency.record(latency);
        self.ops += 1;
        self.bytes += bytes as u64;
    }

    pub fn merge(&mut self, other: &OpStats) {
        self.latency.merge(&other.latency);
        self.ops += other.ops;
        self.bytes += other.bytes;
    }
}

/// What one worker did
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub worker: usize,
    pub read: OpStats,
    pub write: OpStats,
    pub fsyncs: u64,
    pub errors: u64,
    /// Reads that returned less than asked (end of file or stream)
    pub short_reads: u64,
    pub verify: VerifyStats,
    pub elapsed_secs: f64,
    /// Stopped by cancellation or a fatal verification failure
    pub stopped_early: bool,
}

impl WorkerStats {
    /// Fold another worker's counters into this one
    pub fn merge(&mut self, other: &WorkerStats) {
        self.read.merge(&other.read);
        self.write.merge(&other.write);
        self.fsyncs += other.fsyncs;
        self.errors += other.errors;
        self.short_reads += other.short_reads;
        self.verify.merge(&other.verify);
        self.elapsed_secs = self.elapsed_secs.max(other.elapsed_secs);
        self.stopped_early |= other.stopped_early;
    }
}

/// Worker thread state
pub struct Worker {
    id: usize,
    config: Arc<Config>,
    engine: Box<dyn IOEngine>,
    targets: Vec<Target>,
    locks: Vec<Option<LockHandle>>,
    verifiers: Vec<Verifier>,
    /// Logical position in each stream target
    stream_pos: Vec<u64>,
    buffer: AlignedBuffer,
    rng: Xoshiro256PlusPlus,
    stop: CancellationToken,
    terminate: CancellationToken,
    stats: WorkerStats,
}

impl Worker {
    /// Create a worker over its own copies of the laid-out targets
    pub fn new(
        id: usize,
        config: Arc<Config>,
        targets: Vec<Target>,
        locks: &LockTable,
        stop: CancellationToken,
        seed: u64,
    ) -> Result<Self> {
        let block_size = config.workload.block_size as usize;
        let alignment = if config.workload.direct { 4096 } else { 512 };
        let buffer = AlignedBuffer::new(block_size, alignment).context("Failed to allocate IO buffer")?;

        let terminate = CancellationToken::new();
        let worker_seed = seed ^ ((id as u64) << 32);
        let track = config.verify.is_enabled() && config.workload.has_writes();
        let verifiers = (0..targets.len())
            .map(|t| {
                let verifier = Verifier::new(&config.verify, worker_seed.wrapping_add(t as u64))
                    .with_terminate(terminate.clone());
                if !track {
                    return verifier;
                }
                let history = match config.workload.access {
                    AccessPattern::Random => IoHistory::ordered(),
                    AccessPattern::Sequential => IoHistory::fifo(),
                };
                verifier.with_history(history)
            })
            .collect();
        let locks = targets.iter().map(|t| locks.handle(&t.path, id)).collect();

        Ok(Self {
            id,
            engine: create_engine(&config.workload),
            stream_pos: vec![0; targets.len()],
            targets,
            locks,
            verifiers,
            buffer,
            rng: Xoshiro256PlusPlus::seed_from_u64(worker_seed),
            stop,
            terminate,
            stats: WorkerStats { worker: id, ..Default::default() },
            config,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run to completion and return the counters
    pub fn run(mut self) -> Result<WorkerStats> {
        let start = Instant::now();
        let engine_config = EngineConfig {
            queue_depth: 1,
            max_transfer: self.buffer.size(),
        };
        self.engine.init(&engine_config).context("Failed to initialize IO engine")?;
        self.open_targets()?;

        let result = self.run_phases();

        for target in &mut self.targets {
            target.close();
        }
        for lock in self.locks.iter_mut().flatten() {
            lock.unlock_all();
        }
        self.engine.cleanup().context("Failed to clean up IO engine")?;

        for verifier in &self.verifiers {
            self.stats.verify.merge(verifier.stats());
        }
        self.stats.stopped_early = self.should_stop();
        self.stats.elapsed_secs = start.elapsed().as_secs_f64();
        result?;

        info!(
            worker = self.id,
            reads = self.stats.read.ops,
            writes = self.stats.write.ops,
            verify_failures = self.stats.verify.failures(),
            "worker finished"
        );
        Ok(self.stats)
    }

    /// Each pass is verified before the next one overwrites it, which also
    /// empties the write history
    fn run_phases(&mut self) -> Result<()> {
        let verify_after = self.config.workload.has_writes() && self.config.verify.is_enabled();
        for pass in 0..self.config.workload.loops {
            debug!(worker = self.id, pass, "starting pass");
            self.io_pass()?;
            if self.should_stop() {
                return Ok(());
            }
            if verify_after {
                self.sync_targets()?;
                self.verify_pass()?;
                if self.should_stop() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn open_targets(&mut self) -> Result<()> {
        let workload = &self.config.workload;
        let flags = OpenFlags {
            direct: workload.direct,
            sync: workload.sync,
            write: workload.has_writes(),
            read: workload.has_reads() || self.config.verify.is_enabled(),
        };
        for target in &mut self.targets {
            if !target.is_usable() {
                warn!(worker = self.id, path = %target.path.display(), "skipping unusable target");
                continue;
            }
            target
                .open(flags)
                .with_context(|| format!("worker {} cannot open {}", self.id, target.path.display()))?;
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop.is_cancelled() || self.terminate.is_cancelled()
    }

    fn select_operation_type(&mut self) -> OperationType {
        let roll: u8 = self.rng.gen_range(0..100);
        if roll < self.config.workload.read_percent {
            OperationType::Read
        } else {
            OperationType::Write
        }
    }

    /// Offsets for one pass over a target's window
    ///
    /// Streams have no offsets; they get one `None` per block.
    fn offsets(&mut self, t: usize) -> Vec<Option<u64>> {
        let target = &self.targets[t];
        let bs = self.buffer.size() as u64;
        let blocks = target.io_size.div_ceil(bs);
        if !target.kind.is_seekable() {
            return vec![None; blocks as usize];
        }
        let start = target.io_offset;
        let mut offsets: Vec<Option<u64>> = (0..blocks).map(|i| Some(start + i * bs)).collect();
        if self.config.workload.access == AccessPattern::Random {
            offsets.shuffle(&mut self.rng);
        }
        offsets
    }

    fn io_pass(&mut self) -> Result<()> {
        for t in 0..self.targets.len() {
            if self.targets[t].fd().is_none() {
                continue;
            }
            for offset in self.offsets(t) {
                if self.should_stop() {
                    return Ok(());
                }
                let op = self.select_operation_type();
                if !self.issue(t, op, offset)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Bytes to transfer at `offset`, clipped to the end of the window
    fn length_at(&self, t: usize, offset: Option<u64>) -> usize {
        let bs = self.buffer.size();
        let target = &self.targets[t];
        let end = target.io_offset + target.io_size;
        match offset {
            Some(off) => (end.saturating_sub(off) as usize).min(bs),
            None => (end.saturating_sub(self.stream_pos[t]) as usize).min(bs),
        }
    }

    /// Issue one operation; `false` means the target has no more data
    fn issue(&mut self, t: usize, op: OperationType, offset: Option<u64>) -> Result<bool> {
        let len = self.length_at(t, offset);
        if len == 0 {
            return Ok(false);
        }
        let logical = offset.unwrap_or(self.stream_pos[t]);
        let ctx = BlockContext {
            offset: logical,
            thread: self.id as u32,
        };

        if op == OperationType::Write {
            self.verifiers[t]
                .populate(&mut self.buffer.as_mut_slice()[..len], ctx)
                .with_context(|| format!("cannot populate {} bytes at {}", len, logical))?;
        }

        let n = match self.transfer(t, op, offset, len) {
            Ok(n) => n,
            Err(e) => return self.io_failed(t, op, logical, e),
        };
        if offset.is_none() {
            self.stream_pos[t] += n as u64;
        }

        if op == OperationType::Read {
            if n < len {
                self.stats.short_reads += 1;
                debug!(worker = self.id, path = %self.targets[t].path.display(), logical, n, "short read");
            }
            if self.verifies_inline() && n > 0 {
                self.check(t, n, ctx);
            }
            return Ok(n == len);
        }
        Ok(true)
    }

    /// Reads of data written by an earlier run are checked as they land
    fn verifies_inline(&self) -> bool {
        !self.config.workload.has_writes()
            && self.config.verify.is_enabled()
            && self.config.verify.algorithm != Algorithm::Meta
    }

    fn transfer(&mut self, t: usize, op: OperationType, offset: Option<u64>, len: usize) -> Result<usize> {
        let fd = self.targets[t].fd().context("target is not open")?;
        if let Some(lock) = self.locks[t].as_mut() {
            lock.lock(op);
        }

        let started = Instant::now();
        let result = engine::execute(
            self.engine.as_mut(),
            IOOperation {
                op_type: op,
                target_fd: fd,
                offset,
                buffer: self.buffer.as_mut_ptr(),
                length: len,
                user_data: self.stats.read.ops + self.stats.write.ops,
            },
        );
        let latency = started.elapsed();

        if let Some(lock) = self.locks[t].as_mut() {
            lock.unlock();
        }

        let n = result?;
        match op {
            OperationType::Read => self.stats.read.record(n, latency),
            OperationType::Write => self.stats.write.record(n, latency),
            OperationType::Fsync => self.stats.fsyncs += 1,
        }
        Ok(n)
    }

    fn io_failed(&mut self, t: usize, op: OperationType, logical: u64, err: anyhow::Error) -> Result<bool> {
        self.stats.errors += 1;
        let path = self.targets[t].path.display().to_string();
        if self.config.runtime.continue_on_error {
            warn!(worker = self.id, %path, %op, logical, err = %err, "IO error, continuing");
            return Ok(true);
        }
        Err(err).with_context(|| format!("worker {}: {} at {} on {} failed", self.id, op, logical, path))
    }

    fn check(&mut self, t: usize, len: usize, ctx: BlockContext) {
        if let Err(e) = self.verifiers[t].verify(&mut self.buffer.as_mut_slice()[..len], ctx) {
            warn!(
                worker = self.id,
                path = %self.targets[t].path.display(),
                offset = ctx.offset,
                err = %e,
                "verification failed"
            );
        }
    }

    fn sync_targets(&mut self) -> Result<()> {
        for t in 0..self.targets.len() {
            if self.targets[t].fd().is_none() || !self.targets[t].kind.is_seekable() {
                continue;
            }
            if let Err(e) = self.transfer(t, OperationType::Fsync, None, 0) {
                self.io_failed(t, OperationType::Fsync, 0, e)?;
            }
        }
        Ok(())
    }

    /// Read back and check every recorded write
    fn verify_pass(&mut self) -> Result<()> {
        for t in 0..self.targets.len() {
            if self.targets[t].fd().is_none() || !self.targets[t].kind.is_seekable() {
                continue;
            }
            debug!(worker = self.id, pending = self.verifiers[t].pending(), "verify pass");
            while let Some(piece) = self.verifiers[t].next_verify() {
                if self.should_stop() {
                    return Ok(());
                }
                let len = piece.len.min(self.buffer.size());
                let n = match self.transfer(t, OperationType::Read, Some(piece.offset), len) {
                    Ok(n) => n,
                    Err(e) => {
                        self.io_failed(t, OperationType::Read, piece.offset, e)?;
                        continue;
                    }
                };
                if n < len {
                    self.stats.short_reads += 1;
                }
                let ctx = BlockContext {
                    offset: piece.offset,
                    thread: self.id as u32,
                };
                self.check(t, n, ctx);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineType, FileLockMode};
    use crate::target::layout::{LayoutManager, LayoutOptions};
    use std::fs;
    use tempfile::TempDir;

    fn config(path: &std::path::Path, size: u64) -> Config {
        let mut config = Config::default();
        config.workload.block_size = 4096;
        config.layout.size = Some(size);
        config.layout.invalidate_cache = false;
        config.verify.algorithm = Algorithm::Crc32c;
        config.verify.interval = 1024;
        config.targets.push(crate::config::TargetConfig {
            path: path.to_path_buf(),
            size: None,
        });
        config
    }

    fn laid_out(config: &Config) -> Vec<Target> {
        let mut targets: Vec<Target> = config.targets.iter().map(|t| Target::new(&t.path)).collect();
        let mut mgr = LayoutManager::new(LayoutOptions::from_config(config), CancellationToken::new(), 1);
        mgr.resolve_and_extend(&mut targets).unwrap();
        targets
    }

    fn run(config: Config, targets: Vec<Target>) -> WorkerStats {
        let locks = LockTable::new(config.workers.lock_mode, config.workers.lock_batch);
        Worker::new(0, Arc::new(config), targets, &locks, CancellationToken::new(), 42)
            .unwrap()
            .run()
            .unwrap()
    }

    #[test]
    fn test_write_then_verify() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let config = config(&path, 64 * 1024);
        let targets = laid_out(&config);

        let stats = run(config, targets);
        assert_eq!(stats.write.ops, 16);
        assert_eq!(stats.write.bytes, 64 * 1024);
        assert_eq!(stats.read.ops, 16, "every write is read back");
        assert_eq!(stats.verify.blocks_populated, 64);
        assert_eq!(stats.verify.blocks_verified, 64);
        assert_eq!(stats.verify.failures(), 0);
        assert_eq!(stats.fsyncs, 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), 64 * 1024);
    }

    #[test]
    fn test_random_meta_verify_with_splice_engine() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let mut config = config(&path, 128 * 1024);
        config.workload.engine = EngineType::Splice;
        config.workload.access = AccessPattern::Random;
        config.verify.algorithm = Algorithm::Meta;
        let targets = laid_out(&config);

        let stats = run(config, targets);
        assert_eq!(stats.write.ops, 32);
        assert_eq!(stats.read.ops, 32);
        assert_eq!(stats.verify.failures(), 0);
    }

    #[test]
    fn test_splice_move_reads_verify() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let mut config = config(&path, 64 * 1024);
        config.workload.engine = EngineType::Splice;
        config.workload.splice_move = true;
        let targets = laid_out(&config);

        let stats = run(config, targets);
        assert_eq!(stats.read.ops, 16);
        assert_eq!(stats.verify.blocks_verified, 64);
        assert_eq!(stats.verify.failures(), 0);
    }

    #[test]
    fn test_read_only_pass_verifies_existing_data() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let config = config(&path, 32 * 1024);
        let targets = laid_out(&config);
        run(config.clone(), targets);

        let mut reader = config;
        reader.workload.read_percent = 100;
        reader.workload.write_percent = 0;
        reader.layout.overwrite = true;
        let mut targets = vec![Target::new(&path)];
        let mut mgr = LayoutManager::new(LayoutOptions::from_config(&reader), CancellationToken::new(), 1);
        mgr.plan(&mut targets).unwrap();

        let stats = run(reader, targets);
        assert_eq!(stats.read.ops, 8);
        assert_eq!(stats.verify.blocks_verified, 32);
        assert_eq!(stats.verify.failures(), 0);
    }

    #[test]
    fn test_corrupted_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let config = config(&path, 16 * 1024);
        let targets = laid_out(&config);
        run(config.clone(), targets);

        let mut data = fs::read(&path).unwrap();
        data[5000] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let mut reader = config;
        reader.workload.read_percent = 100;
        reader.workload.write_percent = 0;
        let mut targets = vec![Target::new(&path)];
        let mut mgr = LayoutManager::new(LayoutOptions::from_config(&reader), CancellationToken::new(), 1);
        mgr.plan(&mut targets).unwrap();

        let stats = run(reader, targets);
        assert_eq!(stats.verify.blocks_mismatched, 1);
        assert!(!stats.stopped_early);
    }

    #[test]
    fn test_cancelled_worker_stops() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let config = config(&path, 64 * 1024);
        let targets = laid_out(&config);
        let stop = CancellationToken::new();
        stop.cancel();

        let locks = LockTable::new(FileLockMode::None, 1);
        let stats = Worker::new(0, Arc::new(config), targets, &locks, stop, 1)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(stats.write.ops, 0);
        assert!(stats.stopped_early);
    }

    #[test]
    fn test_op_stats_merge() {
        let mut a = OpStats::default();
        a.record(4096, Duration::from_micros(10));
        let mut b = OpStats::default();
        b.record(4096, Duration::from_micros(4));
        b.record(4096, Duration::from_micros(30));
        a.merge(&b);
        assert_eq!(a.ops, 3);
        assert_eq!(a.bytes, 12288);
        assert_eq!(a.latency.len(), 3);
        assert_eq!(a.latency.min(), Some(Duration::from_micros(4)));
    }

    #[test]
    fn test_sequential_meta_over_two_loops() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let mut config = config(&path, 16 * 1024);
        config.verify.algorithm = Algorithm::Meta;
        config.workload.loops = 2;
        let targets = laid_out(&config);

        let stats = run(config, targets);
        assert_eq!(stats.write.ops, 8);
        assert_eq!(stats.read.ops, 8, "each pass is read back once");
        assert_eq!(stats.verify.blocks_verified, 32);
        assert_eq!(stats.verify.failures(), 0);
        assert_eq!(stats.fsyncs, 2);
    }

    #[test]
    fn test_random_crc_over_three_loops() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let mut config = config(&path, 32 * 1024);
        config.workload.access = AccessPattern::Random;
        config.workload.loops = 3;
        let targets = laid_out(&config);

        let stats = run(config, targets);
        assert_eq!(stats.write.ops, 24);
        assert_eq!(stats.read.ops, 24);
        assert_eq!(stats.verify.failures(), 0);
    }
}
