//! The mounted-filesystem registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity of one registered mountpath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountpathInfo {
    /// Root directory of the mountpath.
    pub path: String,
    /// Identifier of the filesystem backing the mountpath (the source
    /// device). Used as the key for disk utilization queries.
    pub file_system: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("mountpath {0} is already registered")]
    AlreadyRegistered(String),

    #[error("mountpath {0} is not registered")]
    NotRegistered(String),

    #[error("mountpath {0} is not a directory")]
    NotADirectory(String),

    #[error("no backing filesystem found for {0}")]
    UnknownFilesystem(String),
}

/// Registry of the filesystems used by the storage target.
///
/// Mountpaths are either *available* (participating in the data path) or
/// *disabled* (registered but excluded from routing). All tables are behind
/// short read-write locks; `resolve` is called on every object access and
/// takes the read side only.
#[derive(Debug, Default)]
pub struct MountedFs {
    available: RwLock<HashMap<String, Arc<MountpathInfo>>>,
    disabled: RwLock<HashMap<String, Arc<MountpathInfo>>>,
}

impl MountedFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mountpath, detecting its backing filesystem from the
    /// mount table.
    pub fn add(&self, mpath: &str) -> Result<(), FsError> {
        if !Path::new(mpath).is_dir() {
            return Err(FsError::NotADirectory(mpath.to_string()));
        }
        let fs = filesystem_of(mpath)?;
        self.add_with_filesystem(mpath, &fs)
    }

    /// Register a mountpath with an explicitly supplied filesystem id.
    ///
    /// Used when the caller already knows the backing device, and by tests
    /// that run on scratch directories sharing one filesystem.
    pub fn add_with_filesystem(&self, mpath: &str, file_system: &str) -> Result<(), FsError> {
        let mpath = normalize(mpath);
        let mut available = self.available.write();
        if available.contains_key(&mpath) || self.disabled.read().contains_key(&mpath) {
            return Err(FsError::AlreadyRegistered(mpath));
        }
        debug!(mpath = %mpath, fs = %file_system, "registering mountpath");
        available.insert(
            mpath.clone(),
            Arc::new(MountpathInfo {
                path: mpath,
                file_system: file_system.to_string(),
            }),
        );
        Ok(())
    }

    /// Forget a mountpath, available or disabled.
    pub fn remove(&self, mpath: &str) -> Result<(), FsError> {
        let mpath = normalize(mpath);
        if self.available.write().remove(&mpath).is_some()
            || self.disabled.write().remove(&mpath).is_some()
        {
            debug!(mpath = %mpath, "removed mountpath");
            return Ok(());
        }
        Err(FsError::NotRegistered(mpath))
    }

    /// Exclude an available mountpath from routing. The registration is kept
    /// so the mountpath can be re-enabled without re-detection.
    pub fn disable(&self, mpath: &str) -> Result<(), FsError> {
        let mpath = normalize(mpath);
        // one lock at a time; lookups between the two writes simply miss
        let removed = self.available.write().remove(&mpath);
        match removed {
            Some(info) => {
                self.disabled.write().insert(mpath, info);
                Ok(())
            }
            None => Err(FsError::NotRegistered(mpath)),
        }
    }

    /// Return a disabled mountpath to the available set.
    pub fn enable(&self, mpath: &str) -> Result<(), FsError> {
        let mpath = normalize(mpath);
        let removed = self.disabled.write().remove(&mpath);
        match removed {
            Some(info) => {
                self.available.write().insert(mpath, info);
                Ok(())
            }
            None => Err(FsError::NotRegistered(mpath)),
        }
    }

    /// Snapshot of the (available, disabled) mountpaths.
    pub fn enumerate(&self) -> (Vec<Arc<MountpathInfo>>, Vec<Arc<MountpathInfo>>) {
        let available = self.available.read().values().cloned().collect();
        let disabled = self.disabled.read().values().cloned().collect();
        (available, disabled)
    }

    /// Exact-key lookup of a registered mountpath, available or disabled.
    pub fn lookup(&self, mpath: &str) -> Option<Arc<MountpathInfo>> {
        let mpath = normalize(mpath);
        self.available
            .read()
            .get(&mpath)
            .cloned()
            .or_else(|| self.disabled.read().get(&mpath).cloned())
    }

    /// Map an object path to the available mountpath that owns it.
    ///
    /// The owner is the longest registered mountpath that is a
    /// whole-component prefix of the object path. Disabled mountpaths do
    /// not route.
    pub fn resolve(&self, object_path: &str) -> Option<Arc<MountpathInfo>> {
        let available = self.available.read();
        let mut best: Option<&Arc<MountpathInfo>> = None;
        for (mpath, info) in available.iter() {
            if !is_component_prefix(mpath, object_path) {
                continue;
            }
            if best.is_none_or(|b| mpath.len() > b.path.len()) {
                best = Some(info);
            }
        }
        best.cloned()
    }
}

/// Whether `mpath` owns `path` at a path-component boundary, so that
/// `/mnt/a` claims `/mnt/a/obj` but not `/mnt/ab`.
fn is_component_prefix(mpath: &str, path: &str) -> bool {
    if mpath == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(mpath) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn normalize(mpath: &str) -> String {
    if mpath.len() > 1 {
        mpath.trim_end_matches('/').to_string()
    } else {
        mpath.to_string()
    }
}

/// Identify the device backing `path` from the process mount table.
///
/// Scans `/proc/self/mounts` for the longest mount point that is a
/// component prefix of the path and returns the corresponding source
/// device.
pub fn filesystem_of(path: &str) -> Result<String, FsError> {
    let mounts = std::fs::read_to_string("/proc/self/mounts")
        .map_err(|_| FsError::UnknownFilesystem(path.to_string()))?;
    filesystem_from_mount_table(&mounts, path)
        .ok_or_else(|| FsError::UnknownFilesystem(path.to_string()))
}

fn filesystem_from_mount_table(table: &str, path: &str) -> Option<String> {
    let mut best: Option<(String, String)> = None;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        // Mount points with blanks are octal-escaped in the mount table.
        let mount_point = mount_point.replace("\\040", " ");
        if !is_component_prefix(&mount_point, path) {
            continue;
        }
        if best.as_ref().is_none_or(|(mp, _)| mount_point.len() >= mp.len()) {
            best = Some((mount_point, device.to_string()));
        }
    }
    best.map(|(_, device)| device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mfs = MountedFs::new();
        mfs.add_with_filesystem("/mnt/a", "sda1").unwrap();

        let info = mfs.lookup("/mnt/a").unwrap();
        assert_eq!(info.path, "/mnt/a");
        assert_eq!(info.file_system, "sda1");
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let mfs = MountedFs::new();
        mfs.add_with_filesystem("/mnt/a", "sda1").unwrap();

        let err = mfs.add_with_filesystem("/mnt/a/", "sda1").unwrap_err();
        assert!(matches!(err, FsError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_resolve_longest_component_prefix() {
        let mfs = MountedFs::new();
        mfs.add_with_filesystem("/mnt/a", "sda1").unwrap();
        mfs.add_with_filesystem("/mnt/a/nested", "sdb1").unwrap();

        let info = mfs.resolve("/mnt/a/nested/obj").unwrap();
        assert_eq!(info.path, "/mnt/a/nested");

        let info = mfs.resolve("/mnt/a/other/obj").unwrap();
        assert_eq!(info.path, "/mnt/a");
    }

    #[test]
    fn test_resolve_respects_component_boundaries() {
        let mfs = MountedFs::new();
        mfs.add_with_filesystem("/mnt/a", "sda1").unwrap();

        assert!(mfs.resolve("/mnt/ab/obj").is_none());
        assert!(mfs.resolve("/mnt").is_none());
        assert!(mfs.resolve("/mnt/a").is_some());
    }

    #[test]
    fn test_disabled_mountpath_does_not_route() {
        let mfs = MountedFs::new();
        mfs.add_with_filesystem("/mnt/a", "sda1").unwrap();
        mfs.disable("/mnt/a").unwrap();

        assert!(mfs.resolve("/mnt/a/obj").is_none());
        // identity is still registered
        assert!(mfs.lookup("/mnt/a").is_some());

        mfs.enable("/mnt/a").unwrap();
        assert!(mfs.resolve("/mnt/a/obj").is_some());
    }

    #[test]
    fn test_remove_from_either_state() {
        let mfs = MountedFs::new();
        mfs.add_with_filesystem("/mnt/a", "sda1").unwrap();
        mfs.add_with_filesystem("/mnt/b", "sdb1").unwrap();
        mfs.disable("/mnt/b").unwrap();

        mfs.remove("/mnt/a").unwrap();
        mfs.remove("/mnt/b").unwrap();
        assert!(matches!(
            mfs.remove("/mnt/b"),
            Err(FsError::NotRegistered(_))
        ));

        let (available, disabled) = mfs.enumerate();
        assert!(available.is_empty());
        assert!(disabled.is_empty());
    }

    #[test]
    fn test_filesystem_from_mount_table() {
        let table = "\
/dev/root / ext4 rw,relatime 0 0
/dev/sda1 /mnt/a ext4 rw,noatime 0 0
/dev/sdb1 /mnt/a/nested xfs rw,noatime 0 0
";
        assert_eq!(
            filesystem_from_mount_table(table, "/mnt/a/obj").as_deref(),
            Some("/dev/sda1")
        );
        assert_eq!(
            filesystem_from_mount_table(table, "/mnt/a/nested/obj").as_deref(),
            Some("/dev/sdb1")
        );
        assert_eq!(
            filesystem_from_mount_table(table, "/var/tmp").as_deref(),
            Some("/dev/root")
        );
    }
}
