//! Configuration validation

use super::*;
use crate::verify::header::{header_size, MAX_SWAP_SIZE};
use anyhow::Result;
use tracing::warn;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_workload(&config.workload)?;
    validate_verify(&config.verify, config.workload.block_size)?;
    validate_layout(&config.layout)?;
    validate_targets(&config.targets)?;
    validate_workers(&config.workers)?;
    validate_diskutil(&config.diskutil)?;
    validate_sharing(config)?;
    Ok(())
}

/// Validate workload configuration
pub fn validate_workload(workload: &WorkloadConfig) -> Result<()> {
    if workload.read_percent as u32 + workload.write_percent as u32 != 100 {
        anyhow::bail!(
            "read_percent ({}) + write_percent ({}) must equal 100",
            workload.read_percent,
            workload.write_percent
        );
    }

    if workload.block_size == 0 {
        anyhow::bail!("block_size must be greater than 0");
    }
    if workload.block_size > 64 * 1024 * 1024 {
        anyhow::bail!("block_size {} > 64MB", workload.block_size);
    }
    if workload.direct && workload.block_size % 512 != 0 {
        anyhow::bail!(
            "block_size {} must be a multiple of 512 with direct IO",
            workload.block_size
        );
    }
    if !workload.block_size.is_power_of_two() {
        warn!(block_size = workload.block_size, "block_size is not a power of 2");
    }

    if workload.splice_move && workload.engine != EngineType::Splice {
        anyhow::bail!("splice_move needs the splice engine, not {}", workload.engine);
    }

    if workload.loops == 0 {
        anyhow::bail!("loops must be at least 1");
    }

    Ok(())
}

/// Validate verification options against the IO size they apply to
pub fn validate_verify(verify: &VerifyConfig, block_size: u64) -> Result<()> {
    let algorithm = verify.algorithm;
    let hsize = header_size(algorithm);
    let interval = if verify.interval == 0 {
        block_size as usize
    } else {
        verify.interval
    };

    if verify.is_enabled() {
        if interval < hsize {
            anyhow::bail!(
                "verify interval {} is smaller than the {} byte {} header",
                interval,
                hsize,
                algorithm
            );
        }
        if verify.interval as u64 > block_size {
            anyhow::bail!(
                "verify interval {} exceeds block_size {}",
                verify.interval,
                block_size
            );
        }
        let residual = (block_size % interval as u64) as usize;
        if residual != 0 && residual < hsize {
            anyhow::bail!(
                "block_size {} leaves a {} byte tail after {} byte intervals, too small for the {} byte {} header",
                block_size,
                residual,
                interval,
                hsize,
                algorithm
            );
        }
    }

    if algorithm == Algorithm::Pattern && verify.pattern.is_none() {
        anyhow::bail!("verify algorithm 'pattern' needs a verify pattern");
    }

    if verify.offset > 0 {
        if !algorithm.writes_header() {
            anyhow::bail!("verify offset has no effect with algorithm {}", algorithm);
        }
        if hsize > MAX_SWAP_SIZE {
            anyhow::bail!("{} header is too large to relocate", algorithm);
        }
        if verify.offset < hsize {
            anyhow::bail!(
                "verify offset {} overlaps the {} byte header",
                verify.offset,
                hsize
            );
        }
        if verify.offset + hsize > interval {
            anyhow::bail!(
                "verify offset {} puts the header outside the {} byte interval",
                verify.offset,
                interval
            );
        }
    }

    Ok(())
}

/// Validate layout configuration
pub fn validate_layout(layout: &LayoutConfig) -> Result<()> {
    match (layout.file_size_low, layout.file_size_high) {
        (Some(low), Some(high)) if low > high => {
            anyhow::bail!("file_size_low ({}) exceeds file_size_high ({})", low, high);
        }
        (Some(_), None) | (None, Some(_)) => {
            anyhow::bail!("file_size_low and file_size_high must be set together");
        }
        _ => {}
    }
    if layout.size == Some(0) {
        anyhow::bail!("size must be greater than 0");
    }
    Ok(())
}

/// Validate target list
pub fn validate_targets(targets: &[TargetConfig]) -> Result<()> {
    if targets.is_empty() {
        anyhow::bail!("At least one target must be specified");
    }

    for (i, target) in targets.iter().enumerate() {
        if target.path.as_os_str().is_empty() {
            anyhow::bail!("Target {} has an empty path", i);
        }
        if target.size == Some(0) {
            anyhow::bail!("Target {} size must be greater than 0", i);
        }
    }

    Ok(())
}

/// Validate worker configuration
pub fn validate_workers(workers: &WorkerConfig) -> Result<()> {
    if workers.threads == 0 {
        anyhow::bail!("threads must be at least 1");
    }
    if workers.threads > 1024 {
        anyhow::bail!("threads must be at most 1024, got {}", workers.threads);
    }
    if workers.lock_mode != FileLockMode::None && workers.lock_batch == 0 {
        anyhow::bail!("lock_batch must be at least 1 with lock_mode {}", workers.lock_mode);
    }
    Ok(())
}

/// Every worker covers the full window of every target, so headers that
/// name their writer cannot survive more than one worker
pub fn validate_sharing(config: &Config) -> Result<()> {
    if config.verify.algorithm == Algorithm::Meta && config.workers.threads > 1 {
        anyhow::bail!(
            "verify algorithm meta records the writing worker and cannot be used with {} threads",
            config.workers.threads
        );
    }
    Ok(())
}

/// Validate disk utilization settings
pub fn validate_diskutil(diskutil: &DiskUtilConfig) -> Result<()> {
    if diskutil.enabled && diskutil.interval_ms == 0 {
        anyhow::bail!("diskutil interval_ms must be greater than 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            targets: vec![TargetConfig { path: "/tmp/t".into(), size: None }],
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        validate_config(&base()).unwrap();
    }

    #[test]
    fn test_validate_workload_percentages() {
        let mut config = base();
        config.workload.read_percent = 50;
        config.workload.write_percent = 60;
        assert!(validate_config(&config).is_err());

        config.workload.write_percent = 50;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_block_size() {
        let mut config = base();
        config.workload.block_size = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_interval_smaller_than_header() {
        let mut config = base();
        config.verify.algorithm = Algorithm::Sha512;
        config.verify.interval = 64;
        assert!(validate_config(&config).is_err());

        config.verify.interval = 512;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_interval_larger_than_block() {
        let mut config = base();
        config.verify.algorithm = Algorithm::Crc32;
        config.verify.interval = 8192;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_interval_tail_too_small_for_header() {
        let mut config = base();
        config.workload.block_size = 4096;
        config.verify.algorithm = Algorithm::Sha512;
        config.verify.interval = 4090;
        assert!(validate_config(&config).is_err(), "6 byte tail");

        config.verify.interval = 4000;
        assert!(validate_config(&config).is_ok(), "96 byte tail holds the header");

        config.verify.interval = 1024;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_splice_move_needs_splice_engine() {
        let mut config = base();
        config.workload.splice_move = true;
        assert!(validate_config(&config).is_err());

        config.workload.engine = EngineType::Splice;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_meta_needs_single_worker() {
        let mut config = base();
        config.verify.algorithm = Algorithm::Meta;
        config.workers.threads = 2;
        assert!(validate_config(&config).is_err());

        config.workers.threads = 1;
        assert!(validate_config(&config).is_ok());

        config.verify.algorithm = Algorithm::Md5;
        config.workers.threads = 4;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_pattern_algorithm_requires_pattern() {
        let mut config = base();
        config.verify.algorithm = Algorithm::Pattern;
        assert!(validate_config(&config).is_err());

        config.verify.pattern = VerifyPattern::new(&[0xaa]);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_verify_offset_bounds() {
        let mut config = base();
        config.verify.algorithm = Algorithm::Md5;
        config.verify.interval = 1024;

        config.verify.offset = 16;
        assert!(validate_config(&config).is_err(), "overlaps header");

        config.verify.offset = 1000;
        assert!(validate_config(&config).is_err(), "past interval");

        config.verify.offset = 512;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_lock_batch_zero() {
        let mut config = base();
        config.workers.lock_mode = FileLockMode::Exclusive;
        config.workers.lock_batch = 0;
        assert!(validate_config(&config).is_err());

        config.workers.lock_mode = FileLockMode::None;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_file_size_range() {
        let mut config = base();
        config.layout.file_size_low = Some(4096);
        assert!(validate_config(&config).is_err());

        config.layout.file_size_high = Some(1024);
        assert!(validate_config(&config).is_err());

        config.layout.file_size_high = Some(8192);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_no_targets() {
        assert!(validate_config(&Config::default()).is_err());
    }
}
