//! IO targets
//!
//! A [`Target`] is one destination a worker issues IO against: a regular
//! file, a block device, a character device, or a pipe/socket. It carries the
//! extent resolved by the layout step and the window of it this run touches.
//!
//! # Lifecycle
//!
//! 1. [`Target::new`] probes the kind with `lstat`
//! 2. [`layout::LayoutManager`] resolves the extent and extends files
//! 3. [`Target::open`] / [`Target::close`] are reference counted, so several
//!    logical streams can share one descriptor
//! 4. [`layout::LayoutManager::teardown`] removes transient files
//!
//! Workers that address the same path coordinate through a shared
//! [`FileLock`] taken from a [`LockTable`]. Each worker drives it through its
//! own [`LockHandle`], which remembers how many more operations the current
//! acquisition covers.

pub mod block;
pub mod layout;

use crate::config::FileLockMode;
use crate::engine::OperationType;
use crate::Result;
use anyhow::Context;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name that maps to stdin/stdout
pub const STDIO_NAME: &str = "-";

/// What a target path refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    File,
    Block,
    Char,
    /// Named pipe, socket or stdio
    Pipe,
}

impl TargetKind {
    /// Probe `path` without following a final symlink
    ///
    /// Paths that do not exist yet are files to be created.
    pub fn probe(path: &Path) -> Self {
        if path.as_os_str() == STDIO_NAME {
            return TargetKind::Pipe;
        }
        match fs::symlink_metadata(path) {
            Ok(meta) => {
                let ft = meta.file_type();
                if ft.is_block_device() {
                    TargetKind::Block
                } else if ft.is_char_device() {
                    TargetKind::Char
                } else if ft.is_fifo() || ft.is_socket() {
                    TargetKind::Pipe
                } else {
                    TargetKind::File
                }
            }
            Err(_) => TargetKind::File,
        }
    }

    /// Seekable with a meaningful size
    pub fn is_seekable(&self) -> bool {
        matches!(self, TargetKind::File | TargetKind::Block)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::File => write!(f, "file"),
            TargetKind::Block => write!(f, "block device"),
            TargetKind::Char => write!(f, "character device"),
            TargetKind::Pipe => write!(f, "pipe"),
        }
    }
}

/// How a target is opened
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// O_DIRECT
    pub direct: bool,
    /// O_SYNC
    pub sync: bool,
    /// The workload writes
    pub write: bool,
    /// The workload reads
    pub read: bool,
}

/// One IO destination
#[derive(Debug)]
pub struct Target {
    pub path: PathBuf,
    pub kind: TargetKind,
    /// Known size; `None` until resolved, and for targets without one
    real_extent: Option<u64>,
    extent_resolved: bool,
    /// Start of the window this run touches
    pub io_offset: u64,
    /// Length of the window
    pub io_size: u64,
    /// Window length asked for this target alone
    pub requested_size: Option<u64>,
    file: Option<File>,
    refs: usize,
    usable: bool,
}

impl Target {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = TargetKind::probe(&path);
        Self {
            path,
            kind,
            real_extent: None,
            extent_resolved: false,
            io_offset: 0,
            io_size: 0,
            requested_size: None,
            file: None,
            refs: 0,
            usable: true,
        }
    }

    /// Copy of the laid-out window without the open descriptor
    ///
    /// Each worker takes its own copy of a target laid out once up front.
    pub fn detached(&self) -> Self {
        Self {
            path: self.path.clone(),
            kind: self.kind,
            real_extent: self.real_extent,
            extent_resolved: self.extent_resolved,
            io_offset: self.io_offset,
            io_size: self.io_size,
            requested_size: self.requested_size,
            file: None,
            refs: 0,
            usable: self.usable,
        }
    }

    pub fn real_extent(&self) -> Option<u64> {
        self.real_extent
    }

    pub fn extent_resolved(&self) -> bool {
        self.extent_resolved
    }

    /// Record the resolved extent; later resolution is served from here
    pub fn set_extent(&mut self, extent: Option<u64>) {
        self.real_extent = extent;
        self.extent_resolved = true;
    }

    /// The window reaches past the current end of a regular file
    pub fn needs_extend(&self) -> bool {
        self.kind == TargetKind::File
            && self.io_offset + self.io_size > self.real_extent.unwrap_or(0)
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    /// Layout was abandoned; the target must not be used
    pub fn mark_unusable(&mut self) {
        self.usable = false;
    }

    /// Open the target, or share the descriptor already open
    pub fn open(&mut self, flags: OpenFlags) -> Result<RawFd> {
        if let Some(file) = &self.file {
            self.refs += 1;
            debug!(path = %self.path.display(), refs = self.refs, "reusing open descriptor");
            return Ok(file.as_raw_fd());
        }
        if !self.usable {
            anyhow::bail!("target {} is unusable after an abandoned layout", self.path.display());
        }

        let file = if self.path.as_os_str() == STDIO_NAME {
            open_stdio(flags)?
        } else {
            let mut options = OpenOptions::new();
            let mut custom = 0;
            match self.kind {
                TargetKind::File => {
                    options.read(true);
                    if flags.write {
                        options.write(true).create(true).mode(0o644);
                    }
                }
                TargetKind::Block | TargetKind::Char => {
                    options.read(true).write(flags.write);
                }
                TargetKind::Pipe => {
                    // a pipe end is opened for one direction
                    if flags.write {
                        options.write(true);
                    } else {
                        options.read(true);
                    }
                }
            }
            if flags.direct {
                custom |= libc::O_DIRECT;
            }
            if flags.sync {
                custom |= libc::O_SYNC;
            }
            options.custom_flags(custom);
            options
                .open(&self.path)
                .with_context(|| format!("Failed to open {} {}", self.kind, self.path.display()))?
        };

        let fd = file.as_raw_fd();
        self.file = Some(file);
        self.refs = 1;
        debug!(path = %self.path.display(), fd, "opened target");
        Ok(fd)
    }

    /// Drop one reference; the descriptor closes with the last
    ///
    /// Returns whether the descriptor was closed.
    pub fn close(&mut self) -> bool {
        if self.refs == 0 {
            return false;
        }
        self.refs -= 1;
        if self.refs == 0 {
            self.file = None;
            debug!(path = %self.path.display(), "closed target");
            return true;
        }
        false
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    pub fn references(&self) -> usize {
        self.refs
    }
}

fn open_stdio(flags: OpenFlags) -> Result<File> {
    if flags.read && flags.write {
        anyhow::bail!("cannot both read and write stdin/stdout");
    }
    let src = if flags.write { libc::STDOUT_FILENO } else { libc::STDIN_FILENO };
    // SAFETY: dup on a standard descriptor
    let fd = unsafe { libc::dup(src) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("dup of stdio failed");
    }
    // SAFETY: fd was just returned by dup and is owned by nobody else
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Expand directories into the regular files beneath them
///
/// Other paths (files, devices, paths not created yet) pass through.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        let is_dir = fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            out.push(path.clone());
            continue;
        }

        let before = out.len();
        let mut worklist = vec![path.clone()];
        while let Some(dir) = worklist.pop() {
            let mut entries: Vec<PathBuf> = fs::read_dir(&dir)
                .with_context(|| format!("opendir({}) failed", dir.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .collect();
            entries.sort();
            for entry in entries.into_iter().rev() {
                let meta = match fs::symlink_metadata(&entry) {
                    Ok(m) => m,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e).with_context(|| format!("stat {} failed", entry.display())),
                };
                if meta.is_file() {
                    out.push(entry);
                } else if meta.is_dir() {
                    worklist.push(entry);
                }
            }
        }
        info!(dir = %path.display(), files = out.len() - before, "added directory files");
    }
    Ok(out)
}

/// Advisory lock shared by every worker addressing one path
pub struct FileLock {
    mode: FileLockMode,
    raw: RawRwLock,
    /// Worker holding the lock exclusively
    owner: Mutex<Option<usize>>,
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("mode", &self.mode)
            .field("owner", &*self.owner.lock())
            .finish()
    }
}

impl FileLock {
    pub fn new(mode: FileLockMode) -> Self {
        Self {
            mode,
            raw: RawRwLock::INIT,
            owner: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> FileLockMode {
        self.mode
    }

    pub fn owner(&self) -> Option<usize> {
        *self.owner.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Shared,
    Exclusive,
}

/// One worker's use of a [`FileLock`]
///
/// An acquisition covers `batch` consecutive operations; `lock` before each
/// operation and `unlock` after it, and the lock is only taken and released
/// at batch boundaries.
#[derive(Debug)]
pub struct LockHandle {
    lock: Arc<FileLock>,
    worker: usize,
    batch: u32,
    held: Option<Held>,
    remaining: u32,
}

impl LockHandle {
    pub fn new(lock: Arc<FileLock>, worker: usize, batch: u32) -> Self {
        Self {
            lock,
            worker,
            batch: batch.max(1),
            held: None,
            remaining: 0,
        }
    }

    fn wanted(&self, op: OperationType) -> Option<Held> {
        match self.lock.mode {
            FileLockMode::None => None,
            FileLockMode::Exclusive => Some(Held::Exclusive),
            FileLockMode::ReadWrite => Some(if op == OperationType::Read {
                Held::Shared
            } else {
                Held::Exclusive
            }),
        }
    }

    /// Take the lock for an operation of type `op`
    pub fn lock(&mut self, op: OperationType) {
        let want = match self.wanted(op) {
            Some(w) => w,
            None => return,
        };

        if let Some(held) = self.held {
            // a shared hold does not cover a write
            if self.remaining > 0 && (held == want || held == Held::Exclusive) {
                self.remaining -= 1;
                return;
            }
            self.release();
        }

        match want {
            Held::Shared => self.lock.raw.lock_shared(),
            Held::Exclusive => {
                self.lock.raw.lock_exclusive();
                *self.lock.owner.lock() = Some(self.worker);
            }
        }
        self.held = Some(want);
        self.remaining = self.batch - 1;
    }

    /// Release after an operation, unless the batch has more to cover
    pub fn unlock(&mut self) {
        if self.held.is_some() && self.remaining == 0 {
            self.release();
        }
    }

    /// Release regardless of the batch count
    pub fn unlock_all(&mut self) {
        self.remaining = 0;
        if self.held.is_some() {
            self.release();
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    fn release(&mut self) {
        match self.held.take() {
            // SAFETY: this handle acquired the lock in the matching mode
            Some(Held::Shared) => unsafe { self.lock.raw.unlock_shared() },
            Some(Held::Exclusive) => {
                *self.lock.owner.lock() = None;
                // SAFETY: as above
                unsafe { self.lock.raw.unlock_exclusive() }
            }
            None => {}
        }
        self.remaining = 0;
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.unlock_all();
    }
}

/// Locks keyed by path, shared across workers
#[derive(Debug)]
pub struct LockTable {
    mode: FileLockMode,
    batch: u32,
    locks: Mutex<HashMap<PathBuf, Arc<FileLock>>>,
}

impl LockTable {
    pub fn new(mode: FileLockMode, batch: u32) -> Self {
        Self {
            mode,
            batch,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle on the lock for `path`; `None` when locking is off
    pub fn handle(&self, path: &Path, worker: usize) -> Option<LockHandle> {
        if self.mode == FileLockMode::None {
            return None;
        }
        let lock = self
            .locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(FileLock::new(self.mode)))
            .clone();
        Some(LockHandle::new(lock, worker, self.batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_probe_kinds() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data");
        fs::write(&file, b"abc").unwrap();

        assert_eq!(TargetKind::probe(&file), TargetKind::File);
        assert_eq!(TargetKind::probe(&tmp.path().join("new")), TargetKind::File);
        assert_eq!(TargetKind::probe(Path::new("/dev/null")), TargetKind::Char);
        assert_eq!(TargetKind::probe(Path::new("-")), TargetKind::Pipe);
    }

    #[test]
    fn test_open_is_refcounted() {
        let tmp = TempDir::new().unwrap();
        let mut target = Target::new(tmp.path().join("data"));
        let flags = OpenFlags { write: true, ..Default::default() };

        let fd = target.open(flags).unwrap();
        assert_eq!(target.open(flags).unwrap(), fd);
        assert_eq!(target.references(), 2);

        assert!(!target.close());
        assert_eq!(target.fd(), Some(fd));
        assert!(target.close());
        assert_eq!(target.fd(), None);
        assert!(!target.close());
    }

    #[test]
    fn test_unusable_target_refuses_open() {
        let tmp = TempDir::new().unwrap();
        let mut target = Target::new(tmp.path().join("data"));
        target.mark_unusable();
        assert!(target.open(OpenFlags { write: true, ..Default::default() }).is_err());
    }

    #[test]
    fn test_needs_extend() {
        let mut target = Target::new("/nonexistent/ioforge-test");
        target.set_extent(Some(4096));
        target.io_size = 4096;
        assert!(!target.needs_extend());
        target.io_offset = 512;
        assert!(target.needs_extend());
    }

    #[test]
    fn test_expand_paths() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top"), b"").unwrap();
        fs::write(root.join("a/one"), b"").unwrap();
        fs::write(root.join("a/b/two"), b"").unwrap();
        let plain = tmp.path().join("plain");

        let out = expand_paths(&[root.clone(), plain.clone()]).unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.contains(&root.join("top")));
        assert!(out.contains(&root.join("a/one")));
        assert!(out.contains(&root.join("a/b/two")));
        assert_eq!(out[3], plain);
    }

    #[test]
    fn test_lock_batching() {
        let table = LockTable::new(FileLockMode::Exclusive, 3);
        let path = Path::new("/tmp/shared");
        let mut a = table.handle(path, 1).unwrap();

        a.lock(OperationType::Write);
        assert_eq!(a.lock.owner(), Some(1));
        a.unlock();
        assert!(a.is_held(), "batch keeps the lock");
        a.lock(OperationType::Write);
        a.unlock();
        a.lock(OperationType::Write);
        a.unlock();
        assert!(!a.is_held(), "released after three operations");
        assert_eq!(a.lock.owner(), None);

        a.lock(OperationType::Read);
        a.unlock_all();
        assert!(!a.is_held());
    }

    #[test]
    fn test_none_mode_has_no_handle() {
        let table = LockTable::new(FileLockMode::None, 1);
        assert!(table.handle(Path::new("/tmp/x"), 0).is_none());
    }

    #[test]
    fn test_exclusive_lock_serializes_workers() {
        let table = Arc::new(LockTable::new(FileLockMode::Exclusive, 1));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|worker| {
                let table = table.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                std::thread::spawn(move || {
                    let mut handle = table.handle(Path::new("/tmp/shared"), worker).unwrap();
                    for _ in 0..50 {
                        handle.lock(OperationType::Write);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        handle.unlock();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_readwrite_mode_shares_reads() {
        let table = LockTable::new(FileLockMode::ReadWrite, 1);
        let path = Path::new("/tmp/rw");
        let mut a = table.handle(path, 1).unwrap();
        let mut b = table.handle(path, 2).unwrap();

        // two readers at once would deadlock under an exclusive lock
        a.lock(OperationType::Read);
        b.lock(OperationType::Read);
        assert!(a.is_held() && b.is_held());
        a.unlock();
        b.unlock();

        a.lock(OperationType::Write);
        assert_eq!(a.lock.owner(), Some(1));
        a.unlock();
    }
}
