pub mod local;
pub mod rclone;

use std::sync::Arc;

use crate::error::Result;

/// Capability set every repository target must provide.
///
/// Paths are plain strings joined with [`StorageBackend::join`]; callers never
/// assume a host path convention. All methods are safe to call from multiple
/// worker threads at once.
pub trait StorageBackend: Send + Sync {
    fn join(&self, dir: &str, name: &str) -> String;

    /// Names of the regular files directly inside `dir`.
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Enumerate two-level children of `dir` as `(subdir, file)` pairs.
    fn list2(&self, dir: &str, f: &mut dyn FnMut(&str, &str)) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool>;

    fn mkdir_all(&self, dir: &str) -> Result<()>;

    /// Read a whole object. `None` when it does not exist.
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Write a whole object. The object must never be observable in a
    /// half-written state; the local backend publishes via temp file + rename.
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Remove an object. Fails if it does not exist.
    fn delete(&self, path: &str) -> Result<()>;

    /// Exclusively create the lock object. Fails with `Locked` if present.
    fn write_lock(&self, path: &str) -> Result<()>;

    /// Remove the lock object. Fails if it does not exist.
    fn remove_lock(&self, path: &str) -> Result<()>;
}

/// Prefix routing repository paths to the rclone subprocess shim.
const RCLONE_SCHEME: &str = "rclone:";

/// Pick a backend for a repository path and strip any scheme prefix.
pub fn backend_for_path(path: &str, rclone_bin: &str) -> (Arc<dyn StorageBackend>, String) {
    if let Some(rest) = path.strip_prefix(RCLONE_SCHEME) {
        (
            Arc::new(rclone::RcloneBackend::new(rclone_bin)),
            rest.to_string(),
        )
    } else {
        (Arc::new(local::LocalBackend::new()), path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_prefix_selects_rclone() {
        let (_, path) = backend_for_path("rclone:remote:backups/repo", "rclone");
        assert_eq!(path, "remote:backups/repo");
    }

    #[test]
    fn bare_path_selects_local() {
        let (_, path) = backend_for_path("/backups/repo", "rclone");
        assert_eq!(path, "/backups/repo");
    }
}
