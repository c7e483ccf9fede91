//! CLI argument parsing using clap

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// ioforge - I/O workload generator with block verification
#[derive(Parser, Debug)]
#[command(name = "ioforge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging (same as RUST_LOG=debug)
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lay out targets, write with verification headers, read back and verify
    Run(RunArgs),
    /// Discover a path's backing device(s) and sample utilization
    Diskstats(DiskstatsArgs),
    /// Resolve and extend a target file, then exit
    Layout(LayoutArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Target path (file, directory, block device, char device or fifo)
    #[arg(value_name = "PATH")]
    pub target: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Basic Options ===
    /// Number of worker threads
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Block size for IO operations (e.g., 4k, 1M, 64k)
    #[arg(short = 'b', long)]
    pub block_size: Option<String>,

    /// Total IO window size (e.g., 1G, 100M)
    #[arg(short = 's', long)]
    pub size: Option<String>,

    /// Passes over the IO window
    #[arg(long)]
    pub loops: Option<u32>,

    // === Workload Options ===
    /// Use random offsets instead of sequential
    #[arg(long)]
    pub random: bool,

    /// Read percentage for mixed workloads (0-100)
    #[arg(long)]
    pub read_percent: Option<u8>,

    /// Write percentage for mixed workloads (0-100)
    #[arg(long)]
    pub write_percent: Option<u8>,

    /// IO engine
    #[arg(long, value_enum)]
    pub engine: Option<EngineType>,

    /// Use O_DIRECT
    #[arg(long)]
    pub direct: bool,

    /// Use O_SYNC
    #[arg(long)]
    pub sync: bool,

    /// Map splice engine reads out by moving pages (splice engine only)
    #[arg(long)]
    pub splice_move: bool,

    // === Verification Options ===
    /// Verification algorithm (md5, crc64, crc32c, crc32c-intel, crc32,
    /// crc16, crc7, sha256, sha512, meta, pattern, null, none)
    #[arg(long)]
    pub verify: Option<String>,

    /// Bytes covered by each verification header (e.g., 4k)
    #[arg(long)]
    pub verify_interval: Option<String>,

    /// Fill pattern for written data (e.g., 0xdeadbeef)
    #[arg(long)]
    pub verify_pattern: Option<String>,

    /// Relocate the header to this offset inside each verified block
    #[arg(long)]
    pub verify_offset: Option<String>,

    /// Stop a worker at its first verification failure
    #[arg(long)]
    pub verify_fatal: bool,

    /// Always use the portable CRC32C implementation
    #[arg(long)]
    pub no_crc32c_hw: bool,

    // === Layout Options ===
    /// Start offset within each file
    #[arg(long)]
    pub start_offset: Option<String>,

    /// Random file size range, lower bound
    #[arg(long)]
    pub file_size_low: Option<String>,

    /// Random file size range, upper bound
    #[arg(long)]
    pub file_size_high: Option<String>,

    /// Reuse existing file contents instead of recreating files
    #[arg(long)]
    pub overwrite: bool,

    /// Skip posix_fallocate during layout
    #[arg(long)]
    pub no_preallocate: bool,

    /// Skip page cache invalidation before IO
    #[arg(long)]
    pub no_invalidate: bool,

    /// Remove files after the run
    #[arg(long)]
    pub unlink: bool,

    // === Locking Options ===
    /// File locking mode
    #[arg(long, value_enum)]
    pub lock_mode: Option<LockMode>,

    /// Operations per lock acquisition
    #[arg(long)]
    pub lock_batch: Option<u32>,

    // === Output Options ===
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Write the JSON report to a file
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Disable disk utilization tracking
    #[arg(long)]
    pub no_diskutil: bool,

    /// Seed for data and offset generation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Keep going after IO errors
    #[arg(long)]
    pub continue_on_error: bool,
}

#[derive(Args, Debug)]
pub struct DiskstatsArgs {
    /// Any path on the device(s) to watch
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Sampling interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub interval_ms: u64,

    /// Number of samples
    #[arg(long, default_value = "5")]
    pub count: u32,

    /// Root of the per-device accounting hierarchy
    #[arg(long, default_value = "/sys/block")]
    pub sysfs_root: PathBuf,
}

#[derive(Args, Debug)]
pub struct LayoutArgs {
    /// File to create or extend
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Required file size (e.g., 1G)
    #[arg(short = 's', long)]
    pub size: String,

    /// Chunk size for the zero fill
    #[arg(short = 'b', long, default_value = "1M")]
    pub block_size: String,

    /// Skip posix_fallocate
    #[arg(long)]
    pub no_preallocate: bool,

    /// Skip the final fsync
    #[arg(long)]
    pub no_fsync: bool,
}

/// IO engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineType {
    Sync,
    Splice,
}

/// File locking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LockMode {
    None,
    Exclusive,
    Readwrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "ioforge", "run", "/tmp/f", "--verify", "crc32c", "--verify-interval", "4k",
            "-s", "64M", "--engine", "splice", "--lock-mode", "readwrite", "--splice-move",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.target, Some(PathBuf::from("/tmp/f")));
        assert_eq!(args.verify.as_deref(), Some("crc32c"));
        assert_eq!(args.engine, Some(EngineType::Splice));
        assert!(args.splice_move);
        assert_eq!(args.lock_mode, Some(LockMode::Readwrite));
    }

    #[test]
    fn test_parse_diskstats_defaults() {
        let cli = Cli::try_parse_from(["ioforge", "--debug", "diskstats", "/"]).unwrap();
        assert!(cli.debug);
        let Command::Diskstats(args) = cli.command else {
            panic!("expected diskstats");
        };
        assert_eq!(args.interval_ms, 1000);
        assert_eq!(args.count, 5);
    }
}
