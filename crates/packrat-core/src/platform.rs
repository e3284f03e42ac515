//! Host filesystem shims: node names use `/` separators everywhere in the
//! engine and are translated here, at the I/O boundary.

use std::fs::{File, Metadata};
use std::path::{Path, PathBuf};

/// Mode for directories the engine creates for itself.
pub const DEFAULT_DIR_PERM: u32 = 0o700;
/// Mode for scratch files the engine creates for itself.
pub const DEFAULT_FILE_PERM: u32 = 0o600;

/// Create `dir` and any missing parents with [`DEFAULT_DIR_PERM`].
pub fn create_dir_all(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(DEFAULT_DIR_PERM)
            .create(dir)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Create (or truncate) a scratch file with [`DEFAULT_FILE_PERM`].
pub fn create_scratch_file(path: &Path) -> std::io::Result<File> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(DEFAULT_FILE_PERM);
    }
    opts.open(path)
}

pub fn to_host_path(name: &str) -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(name.replace('/', "\\"))
    }
    #[cfg(not(windows))]
    {
        PathBuf::from(name)
    }
}

/// Permission bits of a scanned entry.
pub fn perm_bits(meta: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mode() & 0o777
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() {
            if meta.is_dir() {
                0o555
            } else {
                0o444
            }
        } else if meta.is_dir() {
            0o755
        } else {
            0o644
        }
    }
}

/// Modification time in nanoseconds since the Unix epoch.
pub fn mtime_ns(meta: &Metadata) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
    }
    #[cfg(not(unix))]
    {
        meta.modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

pub fn apply_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly((mode & 0o200) == 0);
        std::fs::set_permissions(path, perms)
    }
}

pub fn create_symlink(target: &str, path: &std::path::Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, path)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(target, path)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (target, path);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlinks are not supported on this platform",
        ))
    }
}

/// Set a file's modification time from engine nanoseconds.
pub fn set_file_mtime(path: &std::path::Path, mtime_ns: i64) -> std::io::Result<()> {
    use std::time::{Duration, UNIX_EPOCH};
    let mtime = if mtime_ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(mtime_ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(mtime_ns.unsigned_abs())
    };
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_times(std::fs::FileTimes::new().set_modified(mtime))
}
