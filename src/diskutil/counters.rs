//! Per-device IO accounting counters
//!
//! The kernel exposes one line of whitespace separated counters per block
//! device (`/sys/block/<dev>/stat`). Only the first eleven fields are used:
//!
//! ```text
//! reads  read_merges  sectors_read  read_ticks
//! writes write_merges sectors_written write_ticks
//! in_flight  io_ticks  time_in_queue
//! ```

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Number of counters a stat line must carry
pub const STAT_FIELDS: usize = 11;

/// Failure to probe or sample a device
#[derive(Debug, Error)]
pub enum DeviceProbeError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stat line has {found} counters, expected {STAT_FIELDS}")]
    ShortLine { found: usize },

    #[error("bad counter value {value:?}")]
    BadField { value: String },

    #[error("bad device number {text:?}")]
    BadDeviceNumber { text: String },

    #[error("no sysfs directory for device {major}:{minor}")]
    NotFound { major: u32, minor: u32 },

    #[error("unknown sysfs layout at {path}")]
    UnknownLayout { path: PathBuf },
}

/// Cumulative counters, index 0 for reads and 1 for writes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskCounters {
    pub ios: [u64; 2],
    pub merges: [u64; 2],
    pub sectors: [u64; 2],
    pub ticks: [u64; 2],
    pub io_ticks: u64,
    pub time_in_queue: u64,
}

impl DiskCounters {
    /// Parse one stat line; fields past the eleventh are ignored
    pub fn parse(line: &str) -> Result<Self, DeviceProbeError> {
        let mut fields = [0u64; STAT_FIELDS];
        let mut found = 0;
        for token in line.split_whitespace().take(STAT_FIELDS) {
            fields[found] = token.parse().map_err(|_| DeviceProbeError::BadField {
                value: token.to_string(),
            })?;
            found += 1;
        }
        if found < STAT_FIELDS {
            return Err(DeviceProbeError::ShortLine { found });
        }

        // fields[8] is in_flight, an instantaneous gauge
        Ok(Self {
            ios: [fields[0], fields[4]],
            merges: [fields[1], fields[5]],
            sectors: [fields[2], fields[6]],
            ticks: [fields[3], fields[7]],
            io_ticks: fields[9],
            time_in_queue: fields[10],
        })
    }

    /// Counter growth since `prev`
    ///
    /// A counter that went backwards (device reset) contributes zero.
    pub fn delta(&self, prev: &Self) -> Self {
        let pair = |a: [u64; 2], b: [u64; 2]| [a[0].saturating_sub(b[0]), a[1].saturating_sub(b[1])];
        Self {
            ios: pair(self.ios, prev.ios),
            merges: pair(self.merges, prev.merges),
            sectors: pair(self.sectors, prev.sectors),
            ticks: pair(self.ticks, prev.ticks),
            io_ticks: self.io_ticks.saturating_sub(prev.io_ticks),
            time_in_queue: self.time_in_queue.saturating_sub(prev.time_in_queue),
        }
    }

    pub fn accumulate(&mut self, other: &Self) {
        for i in 0..2 {
            self.ios[i] += other.ios[i];
            self.merges[i] += other.merges[i];
            self.sectors[i] += other.sectors[i];
            self.ticks[i] += other.ticks[i];
        }
        self.io_ticks += other.io_ticks;
        self.time_in_queue += other.time_in_queue;
    }

    /// Every counter divided by `n`
    pub fn averaged(&self, n: u64) -> Self {
        if n == 0 {
            return *self;
        }
        let pair = |a: [u64; 2]| [a[0] / n, a[1] / n];
        Self {
            ios: pair(self.ios),
            merges: pair(self.merges),
            sectors: pair(self.sectors),
            ticks: pair(self.ticks),
            io_ticks: self.io_ticks / n,
            time_in_queue: self.time_in_queue / n,
        }
    }
}

/// `min(100, 100 * io_ticks / elapsed_ms)`
pub fn utilization(io_ticks: u64, elapsed_ms: u64) -> f64 {
    if elapsed_ms == 0 {
        return 0.0;
    }
    (100.0 * io_ticks as f64 / elapsed_ms as f64).min(100.0)
}
