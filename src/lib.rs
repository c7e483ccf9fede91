//! ioforge - IO workload generator with end-to-end data verification
//!
//! Workers write blocks stamped with a verification header, read them back
//! and check them, through either blocking syscalls or a zero-copy path
//! built on `splice`/`vmsplice`.
//!
//! # Architecture
//!
//! - **Layout**: target sizing and file extension before any IO
//! - **Verification**: per-block headers with pluggable checksums
//! - **Engines**: sync (`pread`/`pwrite`) and splice (page gifting)
//! - **Disk utilization**: `/sys/block` sampling for every backing device

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod diskutil;
pub mod engine;
pub mod output;
pub mod splice;
pub mod target;
pub mod util;
pub mod verify;
pub mod worker;

pub use config::Config;
pub use engine::IOEngine;

/// Result type used throughout ioforge
pub type Result<T> = anyhow::Result<T>;
