//! Filesystem capacity queries.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use serde::Serialize;

/// Block-level capacity of a mounted filesystem.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FsCapacity {
    /// Total data blocks.
    pub blocks: u64,
    /// Blocks available to unprivileged callers.
    pub available: u64,
    /// Fundamental block size in bytes.
    pub block_size: u64,
}

/// `statvfs` the filesystem containing `path`.
pub fn fs_stats(path: &Path) -> io::Result<FsCapacity> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mut vfs = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: c_path is a valid NUL-terminated string for the duration of
    // the call, and statvfs fully initializes vfs when it returns 0.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), vfs.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: rc == 0, so the struct is initialized.
    let vfs = unsafe { vfs.assume_init() };
    Ok(FsCapacity {
        blocks: vfs.f_blocks as u64,
        available: vfs.f_bavail as u64,
        block_size: vfs.f_frsize as u64,
    })
}

/// Percentage of the filesystem containing `path` that is in use, or
/// `None` when the query fails.
pub fn fs_used_percentage(path: &Path) -> Option<u64> {
    let cap = fs_stats(path).ok()?;
    if cap.blocks == 0 {
        return None;
    }
    let used = cap.blocks - cap.available;
    Some(used * 100 / cap.blocks)
}
