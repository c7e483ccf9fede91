//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod toml;
pub mod validator;
pub mod workload;

use crate::checksum::Algorithm;
use crate::verify::pattern::VerifyPattern;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
pub use workload::*;

/// Complete run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub diskutil: DiskUtilConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Workload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Read percentage (0-100)
    #[serde(default)]
    pub read_percent: u8,
    /// Write percentage (0-100)
    #[serde(default = "default_write_percent")]
    pub write_percent: u8,
    /// Block size for every IO
    #[serde(default = "default_block_size", deserialize_with = "deserialize_size")]
    pub block_size: u64,
    /// Offset ordering
    #[serde(default)]
    pub access: AccessPattern,
    /// IO engine type
    #[serde(default)]
    pub engine: EngineType,
    /// Use direct IO (O_DIRECT)
    #[serde(default)]
    pub direct: bool,
    /// Use synchronous IO (O_SYNC)
    #[serde(default)]
    pub sync: bool,
    /// Passes over the IO window
    #[serde(default = "default_loops")]
    pub loops: u32,
    /// Splice engine reads ask the kernel to move pages instead of copying
    #[serde(default)]
    pub splice_move: bool,
}

fn default_write_percent() -> u8 {
    100
}

fn default_block_size() -> u64 {
    4096
}

fn default_loops() -> u32 {
    1
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            read_percent: 0,
            write_percent: default_write_percent(),
            block_size: default_block_size(),
            access: AccessPattern::default(),
            engine: EngineType::default(),
            direct: false,
            sync: false,
            loops: default_loops(),
            splice_move: false,
        }
    }
}

impl WorkloadConfig {
    pub fn has_reads(&self) -> bool {
        self.read_percent > 0
    }

    pub fn has_writes(&self) -> bool {
        self.write_percent > 0
    }
}

/// Data verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Checksum or check method stamped into written blocks
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    /// Sub-block size; 0 means one header per IO
    #[serde(default, deserialize_with = "deserialize_size")]
    pub interval: usize,
    /// Fill pattern for written data (1-4 bytes)
    #[serde(default)]
    pub pattern: Option<VerifyPattern>,
    /// Relocate the header to this offset inside each sub-block; 0 disables
    #[serde(default, deserialize_with = "deserialize_size")]
    pub offset: usize,
    /// Stop the worker on the first failure
    #[serde(default)]
    pub fatal: bool,
    /// Use the hardware CRC32C instruction when the CPU has it
    #[serde(default = "default_true")]
    pub crc32c_hw: bool,
}

fn default_algorithm() -> Algorithm {
    Algorithm::None
}

fn default_true() -> bool {
    true
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            interval: 0,
            pattern: None,
            offset: 0,
            fatal: false,
            crc32c_hw: true,
        }
    }
}

impl VerifyConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self.algorithm, Algorithm::None | Algorithm::Null)
    }
}

/// File sizing and layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Total bytes of IO window, split evenly across files
    #[serde(default, deserialize_with = "deserialize_opt_size")]
    pub size: Option<u64>,
    /// First byte of the IO window in each file
    #[serde(default, deserialize_with = "deserialize_size")]
    pub start_offset: u64,
    /// Lower bound for a random per-file size
    #[serde(default, deserialize_with = "deserialize_opt_size")]
    pub file_size_low: Option<u64>,
    /// Upper bound for a random per-file size
    #[serde(default, deserialize_with = "deserialize_opt_size")]
    pub file_size_high: Option<u64>,
    /// Write into the existing file instead of recreating it
    #[serde(default)]
    pub overwrite: bool,
    /// fsync after laying out a file
    #[serde(default = "default_true")]
    pub create_fsync: bool,
    /// posix_fallocate before filling
    #[serde(default = "default_true")]
    pub preallocate: bool,
    /// Drop cached pages for the IO window before starting
    #[serde(default = "default_true")]
    pub invalidate_cache: bool,
    /// Remove files at teardown
    #[serde(default)]
    pub unlink: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            size: None,
            start_offset: 0,
            file_size_low: None,
            file_size_high: None,
            overwrite: false,
            create_fsync: true,
            preallocate: true,
            invalidate_cache: true,
            unlink: false,
        }
    }
}

/// Target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Path to target (file, directory, block device, char device or fifo)
    pub path: PathBuf,
    /// Per-target size, overrides the split of `layout.size`
    #[serde(default, deserialize_with = "deserialize_opt_size")]
    pub size: Option<u64>,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// File locking mode
    #[serde(default)]
    pub lock_mode: FileLockMode,
    /// Operations a worker may issue per lock acquisition
    #[serde(default = "default_lock_batch")]
    pub lock_batch: u32,
}

fn default_threads() -> usize {
    1
}

fn default_lock_batch() -> u32 {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            lock_mode: FileLockMode::None,
            lock_batch: default_lock_batch(),
        }
    }
}

/// Disk utilization tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskUtilConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sampling period of the monitor thread
    #[serde(default = "default_diskutil_interval")]
    pub interval_ms: u64,
    /// Root of the per-device accounting hierarchy
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

fn default_diskutil_interval() -> u64 {
    250
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/block")
}

impl Default for DiskUtilConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_diskutil_interval(),
            sysfs_root: default_sysfs_root(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Print the JSON report instead of text
    #[serde(default)]
    pub json: bool,
    /// Also write the JSON report to this file
    pub json_output: Option<PathBuf>,
}

/// Runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Seed for buffer contents and offset shuffling
    pub seed: Option<u64>,
    /// Keep going after IO errors
    #[serde(default)]
    pub continue_on_error: bool,
    /// Enable debug output
    #[serde(default)]
    pub debug: bool,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "  Workload: {}", self.workload)?;
        writeln!(f, "  Verify: {}", self.verify)?;
        writeln!(f, "  Targets: {} target(s)", self.targets.len())?;
        writeln!(f, "  Workers: {}", self.workers)?;
        Ok(())
    }
}

impl fmt::Display for WorkloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}% read / {}% write, bs={}, {}, engine={}",
            self.read_percent,
            self.write_percent,
            format_bytes(self.block_size),
            self.access,
            self.engine
        )?;
        if self.direct {
            write!(f, ", direct")?;
        }
        if self.sync {
            write!(f, ", sync")?;
        }
        Ok(())
    }
}

impl fmt::Display for VerifyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.algorithm)?;
        if self.interval > 0 {
            write!(f, ", interval={}", format_bytes(self.interval as u64))?;
        }
        if let Some(p) = &self.pattern {
            write!(f, ", pattern={}", p)?;
        }
        if self.offset > 0 {
            write!(f, ", offset={}", self.offset)?;
        }
        if self.fatal {
            write!(f, ", fatal")?;
        }
        Ok(())
    }
}

impl fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} thread(s), lock={}", self.threads, self.lock_mode)?;
        if self.lock_mode != FileLockMode::None {
            write!(f, " batch={}", self.lock_batch)?;
        }
        Ok(())
    }
}
