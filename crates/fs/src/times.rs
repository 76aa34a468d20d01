//! File timestamp reads and explicit updates.
//!
//! On storage servers the data filesystems are mounted `noatime`, so the
//! kernel never maintains access times for us. These helpers are the write
//! path for the target's own access-time bookkeeping: read the current
//! modification time, then set both timestamps so that only the access time
//! actually changes.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use filetime::FileTime;

/// Current modification time of `path`.
pub fn modification_time(path: &Path) -> io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

/// Set the access and modification times of `path`.
///
/// Callers that only want to move the access time pass the value returned
/// by [`modification_time`] back as `mtime`.
pub fn set_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
    filetime::set_file_times(
        path,
        FileTime::from_system_time(atime),
        FileTime::from_system_time(mtime),
    )
}

/// The (access, modification) times of `path`.
pub fn times_of(path: &Path) -> io::Result<(SystemTime, SystemTime)> {
    let meta = std::fs::metadata(path)?;
    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);
    Ok((file_time_to_system(atime), file_time_to_system(mtime)))
}

fn file_time_to_system(ft: FileTime) -> SystemTime {
    if ft.unix_seconds() >= 0 {
        SystemTime::UNIX_EPOCH
            + std::time::Duration::new(ft.unix_seconds() as u64, ft.nanoseconds())
    } else {
        SystemTime::UNIX_EPOCH
            - std::time::Duration::from_secs(ft.unix_seconds().unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_times_moves_atime_and_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj");
        std::fs::write(&path, b"payload").unwrap();

        let mtime = modification_time(&path).unwrap();
        let atime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_times(&path, atime, mtime).unwrap();

        let (got_atime, got_mtime) = times_of(&path).unwrap();
        assert_eq!(got_atime, atime);
        // mtime survives at filesystem resolution
        let drift = got_mtime
            .duration_since(mtime)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1), "mtime drifted by {drift:?}");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");

        let err = modification_time(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let now = SystemTime::now();
        let err = set_times(&path, now, now).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
