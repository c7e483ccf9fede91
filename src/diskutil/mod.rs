//! Disk utilization tracking
//!
//! A [`DiskUtilRegistry`] holds one node per distinct block device touched by
//! the run. Each [`tick_all`](DiskUtilRegistry::tick_all) re-reads the
//! device's stat line and folds the growth since the previous sample into
//! cumulative counters. Software RAID and device-mapper devices are modelled
//! as masters whose `slaves` are registered as children; a master's
//! utilization is the busiest child's.
//!
//! The registry is shared between workers (which register targets) and the
//! monitor thread (which ticks), so its state sits behind a mutex.

pub mod counters;
pub mod discovery;

pub use counters::{utilization, DeviceProbeError, DiskCounters};
pub use discovery::DeviceId;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// One tracked device
#[derive(Debug)]
pub struct DiskUtilNode {
    pub id: DeviceId,
    pub name: String,
    pub sysfs_dir: PathBuf,
    stat_path: PathBuf,
    counters: DiskCounters,
    last: DiskCounters,
    last_tick: Instant,
    elapsed_ms: u64,
    children: Vec<DeviceId>,
    is_child: bool,
}

impl DiskUtilNode {
    fn new(id: DeviceId, dir: PathBuf) -> Self {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        let stat_path = dir.join("stat");
        let mut node = Self {
            id,
            name,
            sysfs_dir: dir,
            stat_path,
            counters: DiskCounters::default(),
            last: DiskCounters::default(),
            last_tick: Instant::now(),
            elapsed_ms: 0,
            children: Vec::new(),
            is_child: false,
        };
        // baseline; a device that cannot be read yet starts from zero
        match node.sample() {
            Ok(c) => node.last = c,
            Err(e) => debug!(name = %node.name, err = %e, "no baseline sample"),
        }
        node
    }

    fn sample(&self) -> Result<DiskCounters, DeviceProbeError> {
        let text = fs::read_to_string(&self.stat_path).map_err(|source| DeviceProbeError::Read {
            path: self.stat_path.clone(),
            source,
        })?;
        let line = text.lines().next().unwrap_or("");
        DiskCounters::parse(line)
    }

    /// Sample the device and fold in the growth since the last sample
    ///
    /// On failure nothing changes, so the next good tick covers the gap.
    pub fn tick(&mut self, now: Instant) -> Result<(), DeviceProbeError> {
        let snapshot = self.sample()?;
        let elapsed = now.saturating_duration_since(self.last_tick).as_millis() as u64;
        self.apply_snapshot(snapshot, elapsed);
        self.last_tick = now;
        Ok(())
    }

    /// Fold in a sample taken `elapsed_ms` after the previous one
    pub fn apply_snapshot(&mut self, snapshot: DiskCounters, elapsed_ms: u64) {
        let delta = snapshot.delta(&self.last);
        self.counters.accumulate(&delta);
        self.last = snapshot;
        self.elapsed_ms += elapsed_ms;
    }

    pub fn counters(&self) -> &DiskCounters {
        &self.counters
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// Busy percentage from this device's own counters
    pub fn utilization(&self) -> f64 {
        utilization(self.counters.io_ticks, self.elapsed_ms)
    }

    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }

    pub fn is_master(&self) -> bool {
        !self.children.is_empty()
    }
}

/// Children's counters summed and averaged, with the busiest child's load
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    pub children: usize,
    pub counters: DiskCounters,
    pub utilization: f64,
}

/// Report line for one device
#[derive(Debug, Clone, Serialize)]
pub struct DiskUtilReport {
    pub name: String,
    pub device: DeviceId,
    pub counters: DiskCounters,
    pub elapsed_ms: u64,
    pub utilization: f64,
    /// Member of a master device
    pub is_child: bool,
    pub aggregate: Option<AggregateStats>,
}

impl fmt::Display for DiskUtilReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        if self.is_child {
            write!(f, "  ")?;
        }
        write!(
            f,
            "  {}: ios={}/{}, merge={}/{}, ticks={}/{}, in_queue={}, util={:.2}%",
            self.name,
            c.ios[0],
            c.ios[1],
            c.merges[0],
            c.merges[1],
            c.ticks[0],
            c.ticks[1],
            c.time_in_queue,
            self.utilization
        )?;
        if let Some(agg) = &self.aggregate {
            let a = &agg.counters;
            write!(
                f,
                ", aggrios={}/{}, aggrmerge={}/{}, aggrticks={}/{}, aggrin_queue={}, aggrutil={:.2}%",
                a.ios[0], a.ios[1], a.merges[0], a.merges[1], a.ticks[0], a.ticks[1], a.time_in_queue, agg.utilization
            )?;
        }
        Ok(())
    }
}

/// Text block for a set of device reports; empty when there are none
pub fn render_report(reports: &[DiskUtilReport]) -> String {
    if reports.is_empty() {
        return String::new();
    }
    let mut out = String::from("Disk stats (read/write):\n");
    for r in reports {
        out.push_str(&r.to_string());
        out.push('\n');
    }
    out
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    nodes: Vec<DiskUtilNode>,
    index: HashMap<DeviceId, usize>,
    /// Last device whose sysfs walk came up empty
    last_miss: Option<DeviceId>,
}

impl Inner {
    fn node(&self, id: DeviceId) -> Option<&DiskUtilNode> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    fn add_tree(&mut self, id: DeviceId, dir: PathBuf) -> Result<(), DeviceProbeError> {
        let mut worklist = vec![(id, dir, None::<DeviceId>)];

        while let Some((id, dir, master)) = worklist.pop() {
            let dir = discovery::whole_device_dir(&dir)?;

            if !self.index.contains_key(&id) {
                debug!(%id, dir = %dir.display(), "adding device");
                let node = DiskUtilNode::new(id, dir.clone());
                self.index.insert(id, self.nodes.len());
                self.nodes.push(node);
                for (slave, slave_dir) in discovery::slave_dirs(&dir).into_iter().rev() {
                    worklist.push((slave, slave_dir, Some(id)));
                }
            }

            if let Some(master) = master {
                if master != id {
                    if let Some(&mi) = self.index.get(&master) {
                        if !self.nodes[mi].children.contains(&id) {
                            self.nodes[mi].children.push(id);
                        }
                    }
                    if let Some(&ci) = self.index.get(&id) {
                        self.nodes[ci].is_child = true;
                    }
                }
            }
        }
        Ok(())
    }

    fn report(&self, node: &DiskUtilNode) -> DiskUtilReport {
        let aggregate = if node.is_master() {
            let mut sum = DiskCounters::default();
            let mut max_util: f64 = 0.0;
            let mut n = 0u64;
            for child in node.children.iter().filter_map(|c| self.node(*c)) {
                sum.accumulate(child.counters());
                max_util = max_util.max(child.utilization());
                n += 1;
            }
            Some(AggregateStats {
                children: n as usize,
                counters: sum.averaged(n),
                utilization: max_util.min(100.0),
            })
        } else {
            None
        };

        DiskUtilReport {
            name: node.name.clone(),
            device: node.id,
            counters: node.counters,
            elapsed_ms: node.elapsed_ms,
            utilization: aggregate.as_ref().map_or_else(|| node.utilization(), |a| a.utilization),
            is_child: node.is_child,
            aggregate,
        }
    }
}

/// Process-wide set of tracked devices
#[derive(Debug)]
pub struct DiskUtilRegistry {
    inner: Mutex<Inner>,
}

impl Default for DiskUtilRegistry {
    fn default() -> Self {
        Self::new("/sys/block")
    }
}

impl DiskUtilRegistry {
    /// Registry discovering devices under `sysfs_root` (normally `/sys/block`)
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: sysfs_root.into(),
                nodes: Vec::new(),
                index: HashMap::new(),
                last_miss: None,
            }),
        }
    }

    /// Track the device backing `path`
    ///
    /// Returns `None` for paths without a backing device and for a device
    /// whose lookup failed on the previous call.
    pub fn register(&self, path: &Path) -> Result<Option<DeviceId>, DeviceProbeError> {
        match discovery::device_for_path(path)? {
            Some(id) => {
                debug!(path = %path.display(), %id, "path belongs to device");
                self.register_device(id)
            }
            None => Ok(None),
        }
    }

    /// Track a device by number, with any RAID members it has
    ///
    /// Registering the same device again is a no-op.
    pub fn register_device(&self, id: DeviceId) -> Result<Option<DeviceId>, DeviceProbeError> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&id) {
            return Ok(Some(id));
        }
        // filesystems without a device would otherwise walk sysfs once per file
        if inner.last_miss == Some(id) {
            return Ok(None);
        }

        let dir = match discovery::find_device_dir(&inner.root, id) {
            Some(d) => d,
            None => {
                inner.last_miss = Some(id);
                return Err(DeviceProbeError::NotFound {
                    major: id.major,
                    minor: id.minor,
                });
            }
        };
        inner.add_tree(id, dir)?;
        Ok(Some(id))
    }

    /// Sample every device; returns how many samples succeeded
    pub fn tick_all(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut ok = 0;
        for node in inner.nodes.iter_mut() {
            match node.tick(now) {
                Ok(()) => ok += 1,
                Err(e) => warn!(device = %node.name, err = %e, "disk stats tick skipped"),
            }
        }
        ok
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is tracked
    pub fn contains(&self, id: DeviceId) -> bool {
        self.inner.lock().index.contains_key(&id)
    }

    /// Apply a snapshot to one node directly
    pub fn apply_snapshot(&self, id: DeviceId, snapshot: DiskCounters, elapsed_ms: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.get(&id).copied() {
            Some(i) => {
                inner.nodes[i].apply_snapshot(snapshot, elapsed_ms);
                true
            }
            None => false,
        }
    }

    /// Reports in registration order, masters before their members
    pub fn snapshot(&self) -> Vec<DiskUtilReport> {
        let inner = self.inner.lock();
        inner.nodes.iter().map(|n| inner.report(n)).collect()
    }

    /// Final reports; the registry is empty afterwards
    pub fn drain_and_report(&self) -> Vec<DiskUtilReport> {
        let mut inner = self.inner.lock();
        let reports: Vec<_> = inner.nodes.iter().map(|n| inner.report(n)).collect();
        inner.nodes.clear();
        inner.index.clear();
        inner.last_miss = None;
        reports
    }
}
