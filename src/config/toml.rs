//! TOML configuration file parsing

use super::*;
use crate::config::cli::{EngineType as CliEngineType, LockMode as CliLockMode, RunArgs};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Build the run configuration from an optional file plus CLI overrides
pub fn load_run_config(args: &RunArgs) -> Result<Config> {
    let base = match &args.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(args, base)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &RunArgs, mut config: Config) -> Result<Config> {
    if let Some(path) = &cli.target {
        config.targets = vec![TargetConfig { path: path.clone(), size: None }];
    }

    // Workload
    if let Some(read_pct) = cli.read_percent {
        config.workload.read_percent = read_pct;
        if cli.write_percent.is_none() {
            config.workload.write_percent = 100u8.saturating_sub(read_pct);
        }
    }
    if let Some(write_pct) = cli.write_percent {
        config.workload.write_percent = write_pct;
        if cli.read_percent.is_none() {
            config.workload.read_percent = 100u8.saturating_sub(write_pct);
        }
    }
    if let Some(bs) = &cli.block_size {
        config.workload.block_size = parse_size(bs)?;
    }
    if let Some(loops) = cli.loops {
        config.workload.loops = loops;
    }
    if cli.random {
        config.workload.access = AccessPattern::Random;
    }
    if let Some(engine) = cli.engine {
        config.workload.engine = match engine {
            CliEngineType::Sync => EngineType::Sync,
            CliEngineType::Splice => EngineType::Splice,
        };
    }
    if cli.direct {
        config.workload.direct = true;
    }
    if cli.sync {
        config.workload.sync = true;
    }
    if cli.splice_move {
        config.workload.splice_move = true;
    }

    // Verify
    if let Some(alg) = &cli.verify {
        config.verify.algorithm = alg.parse()?;
    }
    if let Some(interval) = &cli.verify_interval {
        config.verify.interval = to_usize(parse_size(interval)?)?;
    }
    if let Some(pattern) = &cli.verify_pattern {
        config.verify.pattern = Some(VerifyPattern::parse(pattern)?);
    }
    if let Some(offset) = &cli.verify_offset {
        config.verify.offset = to_usize(parse_size(offset)?)?;
    }
    if cli.verify_fatal {
        config.verify.fatal = true;
    }
    if cli.no_crc32c_hw {
        config.verify.crc32c_hw = false;
    }

    // Layout
    if let Some(size) = &cli.size {
        config.layout.size = Some(parse_size(size)?);
    }
    if let Some(off) = &cli.start_offset {
        config.layout.start_offset = parse_size(off)?;
    }
    if let Some(low) = &cli.file_size_low {
        config.layout.file_size_low = Some(parse_size(low)?);
    }
    if let Some(high) = &cli.file_size_high {
        config.layout.file_size_high = Some(parse_size(high)?);
    }
    if cli.overwrite {
        config.layout.overwrite = true;
    }
    if cli.no_preallocate {
        config.layout.preallocate = false;
    }
    if cli.no_invalidate {
        config.layout.invalidate_cache = false;
    }
    if cli.unlink {
        config.layout.unlink = true;
    }

    // Workers
    if let Some(threads) = cli.threads {
        config.workers.threads = threads;
    }
    if let Some(mode) = cli.lock_mode {
        config.workers.lock_mode = match mode {
            CliLockMode::None => FileLockMode::None,
            CliLockMode::Exclusive => FileLockMode::Exclusive,
            CliLockMode::Readwrite => FileLockMode::ReadWrite,
        };
    }
    if let Some(batch) = cli.lock_batch {
        config.workers.lock_batch = batch;
    }

    // Output and runtime
    if cli.json {
        config.output.json = true;
    }
    if let Some(path) = &cli.json_output {
        config.output.json_output = Some(path.clone());
    }
    if cli.no_diskutil {
        config.diskutil.enabled = false;
    }
    if let Some(seed) = cli.seed {
        config.runtime.seed = Some(seed);
    }
    if cli.continue_on_error {
        config.runtime.continue_on_error = true;
    }

    Ok(config)
}

fn to_usize(n: u64) -> Result<usize> {
    usize::try_from(n).with_context(|| format!("value {} does not fit in usize", n))
}
