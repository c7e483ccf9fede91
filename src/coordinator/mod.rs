//! Coordinator module
//!
//! Orchestrates one run: expand and lay out the targets, register their
//! backing devices for utilization tracking, start the workers and the
//! monitor thread, then collect worker stats and the disk report.
//!
//! Layout happens once, before any worker starts, so no two callers ever
//! extend the same file. Each worker then gets a detached copy of every
//! laid-out target.

use crate::config::validator::validate_config;
use crate::config::Config;
use crate::diskutil::{DiskUtilRegistry, DiskUtilReport};
use crate::target::layout::{LayoutManager, LayoutOptions, LayoutSummary};
use crate::target::{expand_paths, LockTable, Target};
use crate::util::cancel::CancellationToken;
use crate::worker::{Worker, WorkerStats};
use crate::Result;
use anyhow::Context;
use crossbeam::channel::{bounded, tick, Receiver};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Local start time, RFC 3339
    pub started: String,
    pub elapsed_secs: f64,
    pub seed: u64,
    pub targets: Vec<String>,
    pub layout: LayoutReport,
    pub workers: Vec<WorkerStats>,
    pub total: WorkerStats,
    pub disks: Vec<DiskUtilReport>,
}

/// Serializable view of the layout outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayoutReport {
    pub total_io: u64,
    pub files_extended: usize,
    pub bytes_extended: u64,
    pub cancelled: bool,
}

impl From<&LayoutSummary> for LayoutReport {
    fn from(s: &LayoutSummary) -> Self {
        Self {
            total_io: s.total_io,
            files_extended: s.files_extended,
            bytes_extended: s.bytes_extended,
            cancelled: s.cancelled,
        }
    }
}

impl RunReport {
    /// Whether any worker saw an IO error or a verification failure
    pub fn has_failures(&self) -> bool {
        self.total.errors > 0 || self.total.verify.failures() > 0
    }
}

pub struct Coordinator {
    config: Arc<Config>,
    stop: CancellationToken,
    registry: Arc<DiskUtilRegistry>,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(DiskUtilRegistry::new(config.diskutil.sysfs_root.clone()));
        Self {
            config: Arc::new(config),
            stop: CancellationToken::new(),
            registry,
        }
    }

    /// Token that aborts layout and stops workers when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn registry(&self) -> &Arc<DiskUtilRegistry> {
        &self.registry
    }

    /// Targets named by the configuration, directories expanded
    pub fn build_targets(&self) -> Result<Vec<Target>> {
        let mut targets = Vec::new();
        for cfg in &self.config.targets {
            for path in expand_paths(std::slice::from_ref(&cfg.path))? {
                let mut target = Target::new(path);
                target.requested_size = cfg.size;
                targets.push(target);
            }
        }
        if targets.is_empty() {
            anyhow::bail!("no targets to run against");
        }
        Ok(targets)
    }

    /// Register each target's backing device; failures are logged and skipped
    fn register_devices(&self, targets: &[Target]) {
        if !self.config.diskutil.enabled {
            return;
        }
        for target in targets {
            match self.registry.register(&target.path) {
                Ok(Some(id)) => debug!(path = %target.path.display(), %id, "tracking device"),
                Ok(None) => debug!(path = %target.path.display(), "no device to track"),
                Err(e) => warn!(path = %target.path.display(), err = %e, "device utilization unavailable"),
            }
        }
    }

    pub fn run(&self) -> Result<RunReport> {
        validate_config(&self.config).context("Configuration validation failed")?;
        let started = chrono::Local::now();
        let clock = Instant::now();
        let seed = self.config.runtime.seed.unwrap_or_else(rand::random);

        let mut targets = self.build_targets()?;
        self.register_devices(&targets);

        let mut layout = LayoutManager::new(LayoutOptions::from_config(&self.config), self.stop.clone(), seed);
        let summary = layout.resolve_and_extend(&mut targets).context("Failed to lay out targets")?;
        info!(
            targets = targets.len(),
            total_io = summary.total_io,
            extended = summary.files_extended,
            "layout complete"
        );

        let monitor = self.spawn_monitor()?;
        let workers = self.run_workers(&targets, seed);
        let disks = match monitor {
            Some(monitor) => monitor.finish(&self.registry),
            None => Vec::new(),
        };
        layout.teardown(&mut targets);
        let workers = workers?;

        let mut total = WorkerStats::default();
        for stats in &workers {
            total.merge(stats);
        }
        Ok(RunReport {
            started: started.to_rfc3339(),
            elapsed_secs: clock.elapsed().as_secs_f64(),
            seed,
            targets: targets.iter().map(|t| t.path.display().to_string()).collect(),
            layout: LayoutReport::from(&summary),
            workers,
            total,
            disks,
        })
    }

    fn run_workers(&self, targets: &[Target], seed: u64) -> Result<Vec<WorkerStats>> {
        let locks = LockTable::new(self.config.workers.lock_mode, self.config.workers.lock_batch);
        let mut handles: Vec<JoinHandle<Result<WorkerStats>>> = Vec::new();
        let mut first_error = None;

        for id in 0..self.config.workers.threads {
            match self.spawn_worker(id, targets, &locks, seed) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // workers already running are stopped and joined below
                    self.stop.cancel();
                    first_error = Some(e);
                    break;
                }
            }
        }

        let mut stats = Vec::with_capacity(handles.len());
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(s)) => stats.push(s),
                Ok(Err(e)) => {
                    error!(worker = id, err = %format!("{:#}", e), "worker failed");
                    // one failure ends the run for everyone
                    self.stop.cancel();
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    self.stop.cancel();
                    first_error.get_or_insert_with(|| anyhow::anyhow!("worker {} panicked", id));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    fn spawn_worker(
        &self,
        id: usize,
        targets: &[Target],
        locks: &LockTable,
        seed: u64,
    ) -> Result<JoinHandle<Result<WorkerStats>>> {
        let copies = targets.iter().map(Target::detached).collect();
        let worker = Worker::new(id, self.config.clone(), copies, locks, self.stop.clone(), seed)?;
        thread::Builder::new()
            .name(format!("ioforge-worker-{}", id))
            .spawn(move || worker.run())
            .with_context(|| format!("Failed to spawn worker {}", id))
    }

    fn spawn_monitor(&self) -> Result<Option<Monitor>> {
        if !self.config.diskutil.enabled || self.registry.is_empty() {
            return Ok(None);
        }
        let interval = Duration::from_millis(self.config.diskutil.interval_ms.max(1));
        Monitor::spawn(self.registry.clone(), interval).map(Some)
    }
}

/// Thread ticking the disk registry on a fixed period
pub struct Monitor {
    stop_tx: crossbeam::channel::Sender<()>,
    handle: JoinHandle<()>,
}

impl Monitor {
    pub fn spawn(registry: Arc<DiskUtilRegistry>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("ioforge-diskutil".to_string())
            .spawn(move || monitor_loop(&registry, interval, &stop_rx))
            .context("Failed to spawn disk monitor")?;
        Ok(Self { stop_tx, handle })
    }

    /// Stop ticking, take a last sample, and drain the registry
    pub fn finish(self, registry: &DiskUtilRegistry) -> Vec<DiskUtilReport> {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("disk monitor panicked");
        }
        registry.tick_all();
        registry.drain_and_report()
    }
}

fn monitor_loop(registry: &DiskUtilRegistry, interval: Duration, stop: &Receiver<()>) {
    let ticker = tick(interval);
    loop {
        crossbeam::select! {
            recv(ticker) -> _ => {
                let ticked = registry.tick_all();
                debug!(ticked, "disk utilization tick");
            }
            recv(stop) -> _ => break,
        }
    }
}
