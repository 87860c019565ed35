use crate::models::StorageUsage;
use std::path::Path;

/// Filesystem usage for the volume holding `path`. `total == -1` is never
/// produced here; local volumes always have a fixed capacity.
pub fn volume_usage(path: &Path) -> Option<StorageUsage> {
    path_usage(path)
}

fn to_i64_saturated(value: u128) -> i64 {
    value.min(i64::MAX as u128) as i64
}

#[cfg(unix)]
fn path_usage(path: &Path) -> Option<StorageUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let raw = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(raw.as_ptr(), &mut stat) };
    if result != 0 {
        return None;
    }
    let block_size = u128::from(stat.f_frsize.max(stat.f_bsize));
    let total = block_size.saturating_mul(u128::from(stat.f_blocks));
    let available = block_size.saturating_mul(u128::from(stat.f_bavail));
    let used = total.saturating_sub(available);
    Some(StorageUsage {
        used: to_i64_saturated(used),
        total: to_i64_saturated(total),
    })
}

#[cfg(not(unix))]
fn path_usage(_path: &Path) -> Option<StorageUsage> {
    None
}

#[cfg(test)]
mod tests {
    use super::{to_i64_saturated, volume_usage};
    use std::path::PathBuf;

    #[test]
    fn to_i64_saturated_clamps_large_numbers() {
        assert_eq!(to_i64_saturated(42), 42);
        assert_eq!(to_i64_saturated(u128::MAX), i64::MAX);
    }

    #[test]
    fn volume_usage_reads_existing_path() {
        let usage = volume_usage(&std::env::temp_dir()).expect("usage");
        assert!(usage.total > 0);
        assert!(usage.used >= 0);
        assert!(usage.used <= usage.total);
    }

    #[test]
    fn volume_usage_fails_for_missing_path() {
        let missing = PathBuf::from("/path/not/found/archivist");
        assert!(volume_usage(&missing).is_none());
    }
}
