//! IO engine abstraction
//!
//! An engine turns an [`IOOperation`] into system calls and reports an
//! [`IOCompletion`]. Workers only see the [`IOEngine`] trait, so the engine
//! is picked at runtime from the configuration.
//!
//! # Engine Types
//!
//! - **sync**: blocking `pread`/`pwrite`, or `read`/`write` on streams
//! - **splice**: zero-copy through a kernel pipe. Writes gift the buffer's
//!   pages to the pipe and splice them to the target; reads splice the
//!   target into the pipe and map the pages out.
//!
//! Both engines complete each operation before `submit` returns, so the
//! queue depth is one.

use crate::config::{EngineType, WorkloadConfig};
use crate::splice::pages::MapMode;
use crate::Result;
use std::fmt;
use std::os::unix::io::RawFd;

pub mod splice;
pub mod sync;

/// IO engine trait for all backends
///
/// `submit` hands an operation to the engine; its result shows up in a later
/// `poll_completions`. The buffer behind an operation must stay valid until
/// its completion has been polled.
pub trait IOEngine: Send {
    /// Prepare engine resources (pipes, staging buffers)
    fn init(&mut self, config: &EngineConfig) -> Result<()>;

    fn submit(&mut self, op: IOOperation) -> Result<()>;

    fn poll_completions(&mut self) -> Result<Vec<IOCompletion>>;

    /// Release engine resources
    fn cleanup(&mut self) -> Result<()>;

    fn capabilities(&self) -> EngineCapabilities;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue_depth: usize,
    /// Largest single operation; sizes staging buffers and pipes
    pub max_transfer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1,
            max_transfer: 1 << 20,
        }
    }
}

/// One IO request
#[derive(Debug)]
pub struct IOOperation {
    pub op_type: OperationType,
    pub target_fd: RawFd,
    /// Position for seekable targets; `None` for pipes, sockets and
    /// character devices
    pub offset: Option<u64>,
    pub buffer: *mut u8,
    pub length: usize,
    pub user_data: u64,
}

// SAFETY: the submitter keeps the buffer alive and untouched until the
// completion is polled, and only one thread drives an engine
unsafe impl Send for IOOperation {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Read,
    Write,
    Fsync,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Read => write!(f, "read"),
            OperationType::Write => write!(f, "write"),
            OperationType::Fsync => write!(f, "fsync"),
        }
    }
}

#[derive(Debug)]
pub struct IOCompletion {
    pub user_data: u64,
    /// Bytes transferred
    pub result: Result<usize>,
    pub op_type: OperationType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Data moves without a user-space copy
    pub zero_copy: bool,
    pub max_queue_depth: usize,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            zero_copy: false,
            max_queue_depth: 1,
        }
    }
}

/// Build the engine selected by the configuration
pub fn create_engine(workload: &WorkloadConfig) -> Box<dyn IOEngine> {
    match workload.engine {
        EngineType::Sync => Box::new(sync::SyncEngine::new()),
        EngineType::Splice if workload.splice_move => {
            Box::new(splice::SpliceEngine::new().with_map_mode(MapMode::Move))
        }
        EngineType::Splice => Box::new(splice::SpliceEngine::new()),
    }
}

/// Submit one operation and wait for its completion
pub fn execute(engine: &mut dyn IOEngine, op: IOOperation) -> Result<usize> {
    let user_data = op.user_data;
    engine.submit(op)?;
    for completion in engine.poll_completions()? {
        if completion.user_data == user_data {
            return completion.result;
        }
    }
    anyhow::bail!("engine returned no completion for request {}", user_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_display() {
        assert_eq!(OperationType::Read.to_string(), "read");
        assert_eq!(OperationType::Fsync.to_string(), "fsync");
    }

    #[test]
    fn test_create_engine() {
        let mut workload = WorkloadConfig::default();
        assert!(!create_engine(&workload).capabilities().zero_copy);
        workload.engine = EngineType::Splice;
        assert!(create_engine(&workload).capabilities().zero_copy);
        workload.splice_move = true;
        assert!(create_engine(&workload).capabilities().zero_copy);
    }
}
