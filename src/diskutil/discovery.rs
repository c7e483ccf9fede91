//! Mapping paths to block devices and their sysfs directories

use super::counters::DeviceProbeError;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Deepest directory level searched below the sysfs root
const MAX_WALK_DEPTH: usize = 8;

/// Block device identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Split a Linux `dev_t`
    pub fn from_dev(dev: u64) -> Self {
        let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff);
        let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff);
        Self::new(major as u32, minor as u32)
    }

    /// Parse the `major:minor` text of a sysfs `dev` file
    pub fn parse(text: &str) -> Result<Self, DeviceProbeError> {
        let bad = || DeviceProbeError::BadDeviceNumber { text: text.trim().to_string() };
        let (major, minor) = text.trim().split_once(':').ok_or_else(bad)?;
        Ok(Self::new(
            major.parse().map_err(|_| bad())?,
            minor.parse().map_err(|_| bad())?,
        ))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Device backing `path`
///
/// Block and character devices report their own number, anything else the
/// device of the filesystem holding it. A path that does not exist yet is
/// resolved through its parent directory. Pipes and sockets have no backing
/// device and give `None`.
pub fn device_for_path(path: &Path) -> Result<Option<DeviceId>, DeviceProbeError> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            let ft = meta.file_type();
            if ft.is_block_device() || ft.is_char_device() {
                Ok(Some(DeviceId::from_dev(meta.rdev())))
            } else if ft.is_fifo() || ft.is_socket() {
                Ok(None)
            } else {
                Ok(Some(DeviceId::from_dev(meta.dev())))
            }
        }
        Err(_) => {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let meta = fs::metadata(parent).map_err(|source| DeviceProbeError::Read {
                path: parent.to_path_buf(),
                source,
            })?;
            Ok(Some(DeviceId::from_dev(meta.dev())))
        }
    }
}

/// Read and parse a sysfs `dev` file
pub fn read_dev_file(path: &Path) -> Result<DeviceId, DeviceProbeError> {
    let text = fs::read_to_string(path).map_err(|source| DeviceProbeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    DeviceId::parse(&text)
}

/// Find the directory under `root` whose `dev` file names `id`
///
/// Entries directly under the root are followed through symlinks (that is
/// how `/sys/block` is populated); deeper symlinks are not followed.
pub fn find_device_dir(root: &Path, id: DeviceId) -> Option<PathBuf> {
    let mut worklist: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];

    while let Some((dir, depth)) = worklist.pop() {
        if depth > 0 {
            if let Ok(found) = read_dev_file(&dir.join("dev")) {
                if found == id {
                    debug!(%id, dir = %dir.display(), "found device directory");
                    return Some(dir);
                }
            }
        }
        if depth >= MAX_WALK_DEPTH {
            continue;
        }

        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        let mut children = Vec::new();
        for entry in entries.flatten() {
            let child = entry.path();
            let is_dir = if depth == 0 {
                fs::metadata(&child).map(|m| m.is_dir()).unwrap_or(false)
            } else {
                entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
            };
            if is_dir {
                children.push(child);
            }
        }
        // pop in name order
        children.sort();
        worklist.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
    }
    None
}

/// Move from a partition directory to its whole-disk parent
///
/// A partition sits inside the disk's directory, next to the disk's `queue`
/// directory. Loop, md and dm devices are already whole devices.
pub fn whole_device_dir(dir: &Path) -> Result<PathBuf, DeviceProbeError> {
    if !dir.join("../queue").exists() {
        return Ok(dir.to_path_buf());
    }
    match dir.parent() {
        Some(parent) if parent.join("queue").exists() => Ok(parent.to_path_buf()),
        _ => Err(DeviceProbeError::UnknownLayout { path: dir.to_path_buf() }),
    }
}

/// Member devices listed under `dir/slaves`
///
/// Each entry is a symlink to the member's directory.
pub fn slave_dirs(dir: &Path) -> Vec<(DeviceId, PathBuf)> {
    let slaves = dir.join("slaves");
    let entries = match fs::read_dir(&slaves) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let link = entry.path();
        let target = match fs::read_link(&link) {
            Ok(t) => slaves.join(t),
            Err(e) => {
                debug!(path = %link.display(), err = %e, "slave entry is not a link");
                continue;
            }
        };
        match read_dev_file(&target.join("dev")) {
            Ok(id) => found.push((id, target)),
            Err(e) => debug!(path = %target.display(), err = %e, "skipping slave"),
        }
    }
    found.sort();
    found
}
