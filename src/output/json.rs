//! JSON output formatting
//!
//! The document carries the effective configuration next to the run
//! report so a result file is enough to reproduce the run.

use crate::config::Config;
use crate::coordinator::RunReport;
use crate::worker::OpStats;
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Throughput with bytes/sec and op rate
#[derive(Debug, Clone, Serialize)]
pub struct JsonRate {
    pub iops: f64,
    pub bytes_per_sec: u64,
}

impl JsonRate {
    fn new(op: &OpStats, secs: f64) -> Self {
        if secs <= 0.0 {
            return Self { iops: 0.0, bytes_per_sec: 0 };
        }
        Self {
            iops: op.ops as f64 / secs,
            bytes_per_sec: (op.bytes as f64 / secs) as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRates {
    pub read: JsonRate,
    pub write: JsonRate,
}

/// Top-level JSON document
#[derive(Debug, Serialize)]
pub struct JsonOutput<'a> {
    pub version: &'static str,
    pub config: &'a Config,
    pub rates: JsonRates,
    pub report: &'a RunReport,
    pub failed: bool,
}

impl<'a> JsonOutput<'a> {
    pub fn new(config: &'a Config, report: &'a RunReport) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            config,
            rates: JsonRates {
                read: JsonRate::new(&report.total.read, report.elapsed_secs),
                write: JsonRate::new(&report.total.write, report.elapsed_secs),
            },
            report,
            failed: report.has_failures(),
        }
    }
}

/// Pretty-printed JSON document for a finished run
pub fn to_json(config: &Config, report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(&JsonOutput::new(config, report)).context("Failed to serialize run report")
}

/// Write the JSON document to `path`
pub fn write_json_output(path: &Path, config: &Config, report: &RunReport) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create JSON output {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &JsonOutput::new(config, report))
        .with_context(|| format!("Failed to write JSON output {}", path.display()))?;
    Ok(())
}
