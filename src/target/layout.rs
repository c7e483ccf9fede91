//! Target sizing and file layout
//!
//! Before IO starts every target needs a known extent and a window
//! `(io_offset, io_size)` inside it. Regular files whose window reaches past
//! their current end are laid out first: truncated to length, optionally
//! preallocated, then filled with zeroes one chunk at a time so a cancelled
//! run can stop between chunks.

use super::{block, Target, TargetKind};
use crate::config::Config;
use crate::util::cancel::CancellationToken;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("cannot resolve size of {path}: {source}")]
    ExtentResolution {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: offset {offset} extends past end {extent}")]
    OffsetBeyondExtent { path: PathBuf, offset: u64, extent: u64 },

    #[error("layout of {path} was cancelled")]
    Cancelled { path: PathBuf },

    #[error("{path} is a {kind} and cannot be extended")]
    NotExtendable { path: PathBuf, kind: TargetKind },

    #[error("{op} failed on {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no target has a known size, a size must be given")]
    SizeRequired,
}

/// Layout settings taken from the run configuration
#[derive(Debug, Clone)]
pub struct LayoutOptions {
    /// Total window size split across targets
    pub size: Option<u64>,
    pub start_offset: u64,
    /// Random per-file size range
    pub file_size_range: Option<(u64, u64)>,
    pub overwrite: bool,
    pub create_fsync: bool,
    pub preallocate: bool,
    pub invalidate_cache: bool,
    pub unlink: bool,
    pub has_reads: bool,
    pub has_writes: bool,
    /// Random sizes are rounded down to a multiple of this
    pub min_block: u64,
    /// Bytes written per fill step
    pub fill_chunk: usize,
}

impl LayoutOptions {
    pub fn from_config(config: &Config) -> Self {
        let layout = &config.layout;
        let file_size_range = match (layout.file_size_low, layout.file_size_high) {
            (Some(low), Some(high)) => Some((low, high)),
            _ => None,
        };
        Self {
            size: layout.size,
            start_offset: layout.start_offset,
            file_size_range,
            overwrite: layout.overwrite,
            create_fsync: layout.create_fsync,
            preallocate: layout.preallocate,
            invalidate_cache: layout.invalidate_cache,
            unlink: layout.unlink,
            has_reads: config.workload.has_reads(),
            has_writes: config.workload.has_writes(),
            min_block: config.workload.block_size,
            fill_chunk: config.workload.block_size.max(1) as usize,
        }
    }
}

/// Outcome of laying out a set of targets
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LayoutSummary {
    /// Sum of all windows
    pub total_io: u64,
    pub files_extended: usize,
    pub bytes_extended: u64,
    /// A layout was abandoned; the affected target is marked unusable
    pub cancelled: bool,
}

/// Sizes targets and lays out files
pub struct LayoutManager {
    opts: LayoutOptions,
    cancel: CancellationToken,
    rng: Xoshiro256PlusPlus,
}

impl LayoutManager {
    pub fn new(opts: LayoutOptions, cancel: CancellationToken, seed: u64) -> Self {
        Self {
            opts,
            cancel,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    pub fn options(&self) -> &LayoutOptions {
        &self.opts
    }

    /// Size of `target`, resolved once and then cached on the target
    ///
    /// Files are `stat`ed (a missing file is empty), block devices are asked
    /// for their size, and character devices and pipes have none.
    pub fn resolve_extent(&self, target: &mut Target) -> Result<Option<u64>, LayoutError> {
        if target.extent_resolved() {
            return Ok(target.real_extent());
        }

        let resolution = |source| LayoutError::ExtentResolution {
            path: target.path.clone(),
            source,
        };
        let (extent, exists) = match target.kind {
            TargetKind::File => match fs::metadata(&target.path) {
                Ok(meta) => (Some(meta.len()), true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => (Some(0), false),
                Err(e) => return Err(resolution(e)),
            },
            TargetKind::Block => {
                let dev = File::open(&target.path).map_err(resolution)?;
                (Some(block::device_size(dev.as_raw_fd()).map_err(resolution)?), true)
            }
            TargetKind::Char | TargetKind::Pipe => (None, false),
        };

        if let (Some(extent), true) = (extent, exists) {
            if self.opts.start_offset > extent {
                return Err(LayoutError::OffsetBeyondExtent {
                    path: target.path.clone(),
                    offset: self.opts.start_offset,
                    extent,
                });
            }
        }

        debug!(path = %target.path.display(), ?extent, "resolved extent");
        target.set_extent(extent);
        Ok(extent)
    }

    /// Resolve every target and assign its IO window
    ///
    /// Returns the sum of the windows.
    pub fn plan(&mut self, targets: &mut [Target]) -> Result<u64, LayoutError> {
        let n = targets.len().max(1) as u64;

        let mut total: Option<u64> = Some(0);
        for target in targets.iter_mut() {
            let mut extent = self.resolve_extent(target)?;
            if extent.is_none() {
                if let Some(size) = self.opts.size {
                    extent = Some(size / n);
                    target.set_extent(extent);
                }
            }
            total = match (total, extent) {
                (Some(t), Some(e)) => Some(t + e),
                _ => None,
            };
        }
        let all_requested = targets.iter().all(|t| t.requested_size.is_some());
        if matches!(total, None | Some(0)) && self.opts.size.is_none() && !all_requested {
            return Err(LayoutError::SizeRequired);
        }

        let mut io_total = 0;
        for target in targets.iter_mut() {
            let offset = self.opts.start_offset;
            let real = target.real_extent().unwrap_or(0);
            target.io_offset = offset;

            target.io_size = match (target.requested_size, self.opts.file_size_range) {
                (Some(size), _) => size,
                (None, None) => match self.opts.size.unwrap_or(0) / n {
                    0 => real.saturating_sub(offset),
                    share => share,
                },
                (None, Some((low, high))) if real < low || real > high => {
                    if offset > low {
                        return Err(LayoutError::OffsetBeyondExtent {
                            path: target.path.clone(),
                            offset,
                            extent: low,
                        });
                    }
                    let size = if low == high { low } else { self.random_size(low, high) };
                    size.saturating_sub(offset)
                }
                (None, Some(_)) => real.saturating_sub(offset),
            };
            io_total += target.io_size;
        }
        Ok(io_total)
    }

    fn random_size(&mut self, low: u64, high: u64) -> u64 {
        let size = low + self.rng.gen_range(0..high - low);
        match self.opts.min_block {
            0 => size,
            bs => size - size % bs,
        }
    }

    /// Lay out `target` to cover its window and return it open for writing
    ///
    /// Only regular files can be extended. Reads, and writes that overwrite,
    /// need the whole file present, so it is recreated and filled. Plain
    /// writes only need an empty file. A cancelled fill removes the file.
    pub fn extend(&self, target: &mut Target) -> Result<File, LayoutError> {
        self.extend_with_progress(target, |_| {})
    }

    /// [`Self::extend`], calling `on_chunk` with the bytes filled so far
    pub fn extend_with_progress(
        &self,
        target: &mut Target,
        mut on_chunk: impl FnMut(u64),
    ) -> Result<File, LayoutError> {
        if target.kind != TargetKind::File {
            return Err(LayoutError::NotExtendable {
                path: target.path.clone(),
                kind: target.kind,
            });
        }
        let path = target.path.clone();
        let required = target.io_offset + target.io_size;
        let io_err = |op: &'static str, path: &PathBuf| {
            let path = path.clone();
            move |source| LayoutError::Io { op, path, source }
        };

        let o = &self.opts;
        let new_layout = o.has_reads || (o.has_writes && o.overwrite);
        let recreate = o.has_writes && !o.overwrite;

        if new_layout || recreate {
            debug!(path = %path.display(), "layout unlink");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err("unlink", &path)(e)),
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(new_layout)
            .mode(0o644)
            .open(&path)
            .map_err(io_err("open", &path))?;

        if !new_layout {
            target.set_extent(Some(0));
            return Ok(file);
        }

        debug!(path = %path.display(), size = required, "truncate");
        file.set_len(required).map_err(io_err("ftruncate", &path))?;

        if o.preallocate {
            // SAFETY: fallocate on a descriptor we own
            let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, required as libc::off_t) };
            if ret != 0 {
                warn!(
                    path = %path.display(),
                    err = %io::Error::from_raw_os_error(ret),
                    "posix_fallocate failed"
                );
            }
        }

        let chunk = vec![0u8; o.fill_chunk.max(1)];
        let mut filled: u64 = 0;
        while filled < required {
            if self.cancel.is_cancelled() {
                break;
            }
            let n = (required - filled).min(chunk.len() as u64) as usize;
            match file.write(&chunk[..n]) {
                Ok(w) if w == n => {}
                Ok(_) => {
                    return Err(io_err("write", &path)(io::Error::from_raw_os_error(libc::EIO)));
                }
                Err(e) => return Err(io_err("write", &path)(e)),
            }
            filled += n as u64;
            on_chunk(filled);
        }

        if self.cancel.is_cancelled() {
            debug!(path = %path.display(), filled, "layout cancelled, removing file");
            drop(file);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), err = %e, "cannot remove partially laid out file"),
            }
            target.mark_unusable();
            return Err(LayoutError::Cancelled { path });
        }

        if o.create_fsync {
            file.sync_all().map_err(io_err("fsync", &path))?;
        }

        target.set_extent(Some(required));
        Ok(file)
    }

    /// Plan windows and lay out every file that needs it
    ///
    /// A cancelled layout is not an error: the target is marked unusable and
    /// the summary says so.
    pub fn resolve_and_extend(&mut self, targets: &mut [Target]) -> Result<LayoutSummary, LayoutError> {
        let total_io = self.plan(targets)?;
        let mut summary = LayoutSummary { total_io, ..Default::default() };

        let pending: Vec<usize> = (0..targets.len()).filter(|&i| targets[i].needs_extend()).collect();
        if pending.is_empty() {
            return Ok(summary);
        }
        let extend_bytes: u64 = pending.iter().map(|&i| targets[i].io_offset + targets[i].io_size).sum();
        info!(files = pending.len(), mib = extend_bytes >> 20, "laying out IO files");

        for i in pending {
            let target = &mut targets[i];
            let old_len = target.real_extent().unwrap_or(0);
            let file = match self.extend(target) {
                Ok(f) => f,
                Err(LayoutError::Cancelled { path }) => {
                    warn!(path = %path.display(), "layout cancelled");
                    summary.cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            let new_len = target.real_extent().unwrap_or(0);
            summary.files_extended += 1;
            summary.bytes_extended += new_len.saturating_sub(old_len);

            if self.opts.invalidate_cache {
                if let Err(e) = invalidate_cache(&file, target.kind, old_len, new_len.saturating_sub(old_len)) {
                    warn!(path = %target.path.display(), err = %e, "cache invalidation failed");
                }
            }
        }
        Ok(summary)
    }

    /// Remove transient files
    pub fn teardown(&self, targets: &mut [Target]) {
        for target in targets.iter_mut() {
            while target.references() > 0 {
                target.close();
            }
            if self.opts.unlink && target.kind == TargetKind::File {
                debug!(path = %target.path.display(), "unlink at teardown");
                if let Err(e) = fs::remove_file(&target.path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(path = %target.path.display(), err = %e, "unlink failed");
                    }
                }
            }
        }
    }
}

/// Drop cached pages for `len` bytes at `offset`
///
/// Files use `posix_fadvise(DONTNEED)`, block devices a buffer flush.
/// Character devices and pipes have nothing to drop.
pub fn invalidate_cache(file: &File, kind: TargetKind, offset: u64, len: u64) -> io::Result<()> {
    debug!(?kind, offset, len, "invalidate cache");
    match kind {
        TargetKind::File => {
            // SAFETY: fadvise on a descriptor we own
            let ret = unsafe {
                libc::posix_fadvise(
                    file.as_raw_fd(),
                    offset as libc::off_t,
                    len as libc::off_t,
                    libc::POSIX_FADV_DONTNEED,
                )
            };
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
            Ok(())
        }
        TargetKind::Block => block::flush_buffers(file.as_raw_fd()),
        TargetKind::Char | TargetKind::Pipe => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts() -> LayoutOptions {
        LayoutOptions {
            size: None,
            start_offset: 0,
            file_size_range: None,
            overwrite: false,
            create_fsync: false,
            preallocate: true,
            invalidate_cache: true,
            unlink: false,
            has_reads: true,
            has_writes: true,
            min_block: 4096,
            fill_chunk: 4096,
        }
    }

    fn manager(opts: LayoutOptions) -> LayoutManager {
        LayoutManager::new(opts, CancellationToken::new(), 7)
    }

    #[test]
    fn test_resolve_extent_of_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, vec![0u8; 10_000]).unwrap();

        let mgr = manager(opts());
        let mut target = Target::new(&path);
        assert_eq!(mgr.resolve_extent(&mut target).unwrap(), Some(10_000));

        // cached: the file growing does not change the answer
        fs::write(&path, vec![0u8; 20_000]).unwrap();
        assert_eq!(mgr.resolve_extent(&mut target).unwrap(), Some(10_000));

        let mut missing = Target::new(tmp.path().join("missing"));
        assert_eq!(mgr.resolve_extent(&mut missing).unwrap(), Some(0));
    }

    #[test]
    fn test_char_device_has_no_extent() {
        let mgr = manager(opts());
        let mut target = Target::new("/dev/null");
        assert_eq!(mgr.resolve_extent(&mut target).unwrap(), None);
        assert!(mgr.extend(&mut target).is_err());
    }

    #[test]
    fn test_offset_beyond_extent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, vec![0u8; 4096]).unwrap();

        let mut o = opts();
        o.start_offset = 8192;
        let mgr = manager(o);
        let err = mgr.resolve_extent(&mut Target::new(&path)).unwrap_err();
        assert!(matches!(err, LayoutError::OffsetBeyondExtent { offset: 8192, extent: 4096, .. }));
    }

    #[test]
    fn test_size_required() {
        let tmp = TempDir::new().unwrap();
        let mut targets = vec![Target::new(tmp.path().join("a"))];
        let mut mgr = manager(opts());
        assert!(matches!(mgr.plan(&mut targets), Err(LayoutError::SizeRequired)));

        let mut pipes = vec![Target::new("/dev/null")];
        assert!(matches!(mgr.plan(&mut pipes), Err(LayoutError::SizeRequired)));
    }

    #[test]
    fn test_plan_splits_size() {
        let tmp = TempDir::new().unwrap();
        let mut targets = vec![Target::new(tmp.path().join("a")), Target::new(tmp.path().join("b"))];
        let mut o = opts();
        o.size = Some(1 << 20);
        let mut mgr = manager(o);

        assert_eq!(mgr.plan(&mut targets).unwrap(), 1 << 20);
        assert!(targets.iter().all(|t| t.io_size == 512 * 1024 && t.needs_extend()));
    }

    #[test]
    fn test_plan_random_size_in_range() {
        let tmp = TempDir::new().unwrap();
        let mut targets: Vec<Target> = (0..8).map(|i| Target::new(tmp.path().join(format!("f{i}")))).collect();
        let mut o = opts();
        o.size = Some(1 << 30);
        o.file_size_range = Some((64 * 1024, 256 * 1024));
        let mut mgr = manager(o);

        mgr.plan(&mut targets).unwrap();
        for t in &targets {
            assert!(t.io_size >= 64 * 1024 && t.io_size < 256 * 1024, "{}", t.io_size);
            assert_eq!(t.io_size % 4096, 0);
        }
    }

    #[test]
    fn test_extend_fills_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let mut o = opts();
        o.size = Some(64 * 1024);
        let mut mgr = manager(o);
        let mut targets = vec![Target::new(&path)];

        let summary = mgr.resolve_and_extend(&mut targets).unwrap();
        assert_eq!(summary.files_extended, 1);
        assert_eq!(summary.bytes_extended, 64 * 1024);
        assert!(!summary.cancelled);
        assert_eq!(fs::metadata(&path).unwrap().len(), 64 * 1024);
        assert_eq!(targets[0].real_extent(), Some(64 * 1024));
        assert!(!targets[0].needs_extend());
    }

    #[test]
    fn test_write_only_layout_leaves_empty_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, b"old contents").unwrap();
        let mut o = opts();
        o.has_reads = false;
        o.size = Some(8192);
        let mut mgr = manager(o);
        let mut targets = vec![Target::new(&path)];

        mgr.resolve_and_extend(&mut targets).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_cancel_mid_fill_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let cancel = CancellationToken::new();
        let mut o = opts();
        o.size = Some(1 << 20);
        let mut mgr = LayoutManager::new(o, cancel.clone(), 1);
        let mut targets = vec![Target::new(&path)];
        mgr.plan(&mut targets).unwrap();

        let mut chunks = 0;
        let err = mgr
            .extend_with_progress(&mut targets[0], |_| {
                chunks += 1;
                if chunks == 2 {
                    cancel.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(err, LayoutError::Cancelled { .. }));
        assert_eq!(chunks, 2);
        assert!(!path.exists());
        assert!(!targets[0].is_usable());
    }

    #[test]
    fn test_cancel_after_file_vanished() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let cancel = CancellationToken::new();
        let mut o = opts();
        o.size = Some(1 << 20);
        let mut mgr = LayoutManager::new(o, cancel.clone(), 1);
        let mut targets = vec![Target::new(&path)];
        mgr.plan(&mut targets).unwrap();

        let err = mgr
            .extend_with_progress(&mut targets[0], |_| {
                let _ = fs::remove_file(&path);
                cancel.cancel();
            })
            .unwrap_err();
        assert!(matches!(err, LayoutError::Cancelled { .. }));
        assert!(!path.exists());
        assert!(!targets[0].is_usable());
    }

    #[test]
    fn test_cancelled_layout_is_reported_not_failed() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut o = opts();
        o.size = Some(8192);
        let mut mgr = LayoutManager::new(o, cancel, 1);
        let mut targets = vec![Target::new(tmp.path().join("data"))];

        let summary = mgr.resolve_and_extend(&mut targets).unwrap();
        assert!(summary.cancelled);
        assert!(!targets[0].is_usable());
    }

    #[test]
    fn test_teardown_unlinks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, b"x").unwrap();
        let mut o = opts();
        o.unlink = true;
        let mgr = manager(o);
        let mut targets = vec![Target::new(&path)];
        mgr.teardown(&mut targets);
        assert!(!path.exists());
    }
}
