use std::sync::Arc;

use tracing::warn;

use crate::chunks::ChunkStore;
use crate::config::{self, Config};
use crate::error::{PackratError, Result};
use crate::pool::{check_max_dop, DEFAULT_MAX_DOP};
use crate::storage::{backend_for_path, StorageBackend};
use crate::versions::VersionStore;

/// Directory of version files inside a repository.
pub const VERSIONS_DIR: &str = "versions";
/// Directory of the chunk fan-out inside a repository.
pub const CHUNKS_DIR: &str = "chunks";
/// Name of the lock file inside a repository.
pub const LOCK_FILENAME: &str = "lock";

/// Run-wide settings threaded through every public entry point.
#[derive(Debug, Clone)]
pub struct Context {
    /// Helper binary for `rclone:`-prefixed repository paths.
    pub rclone_bin: String,
    /// Worker pool size for backup, restore and verify.
    pub max_dop: usize,
}

impl Context {
    pub fn new(rclone_bin: Option<String>, max_dop: Option<usize>) -> Result<Self> {
        Ok(Context {
            rclone_bin: rclone_bin.unwrap_or_else(|| "rclone".to_string()),
            max_dop: check_max_dop(max_dop.unwrap_or(DEFAULT_MAX_DOP))?,
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Context {
            rclone_bin: "rclone".to_string(),
            max_dop: DEFAULT_MAX_DOP,
        }
    }
}

/// An opened repository: storage routing, decoded config and the chunk and
/// version stores wired to it.
pub struct Repository {
    pub storage: Arc<dyn StorageBackend>,
    /// Repository root with any scheme prefix stripped.
    pub root: String,
    pub config: Config,
    pub chunks: ChunkStore,
    pub versions: VersionStore,
}

impl Repository {
    /// Open an existing repository, checking the password against the
    /// config envelope and loading the chunk presence index.
    pub fn open(ctx: &Context, repo: &str, password: Option<&[u8]>) -> Result<Self> {
        if repo.is_empty() {
            return Err(PackratError::Other(
                "backup repository must be specified".into(),
            ));
        }
        let (storage, root) = backend_for_path(repo, &ctx.rclone_bin);
        let config = config::load_config(storage.as_ref(), &root, password)?;

        let versions = VersionStore::new(
            Arc::clone(&storage),
            storage.join(&root, VERSIONS_DIR),
            config.storage_key,
        );
        let chunks = ChunkStore::open(
            Arc::clone(&storage),
            storage.join(&root, CHUNKS_DIR),
            config.storage_key,
            config.compress,
        )?;
        Ok(Repository {
            storage,
            root,
            config,
            chunks,
            versions,
        })
    }

    /// Secret mixed into chunk fingerprints, when the repository has one.
    pub fn fp_secret(&self) -> Option<&[u8]> {
        self.config.fp_secret.as_deref()
    }
}

/// Held repository lock. Removal is guaranteed on drop; `release` surfaces
/// the removal error instead of swallowing it.
pub struct RepoLock {
    storage: Arc<dyn StorageBackend>,
    path: String,
    released: bool,
}

impl RepoLock {
    /// Exclusively create the lock object. Its mere existence blocks other
    /// writers.
    pub fn acquire(storage: Arc<dyn StorageBackend>, path: String) -> Result<Self> {
        storage.write_lock(&path)?;
        Ok(RepoLock {
            storage,
            path,
            released: false,
        })
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.storage.remove_lock(&self.path)
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.storage.remove_lock(&self.path) {
                warn!("cannot remove lock file {}: {e}", self.path);
            }
        }
    }
}

/// Resolve the lock path for a repository: an explicit `--lock-file`
/// override, or `<repo>/lock`.
pub fn lock_target(
    ctx: &Context,
    repo: &str,
    lock_file: Option<&str>,
) -> (Arc<dyn StorageBackend>, String) {
    match lock_file {
        Some(path) => {
            let (storage, stripped) = backend_for_path(path, &ctx.rclone_bin);
            (storage, stripped)
        }
        None => {
            let (storage, root) = backend_for_path(repo, &ctx.rclone_bin);
            let path = storage.join(&root, LOCK_FILENAME);
            (storage, path)
        }
    }
}

/// Forcibly remove a lock left behind by a crashed backup.
pub fn remove_lock(ctx: &Context, repo: &str, lock_file: Option<&str>) -> Result<()> {
    let (storage, path) = lock_target(ctx, repo, lock_file);
    storage.remove_lock(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_validates_max_dop() {
        assert!(Context::new(None, Some(0)).is_err());
        assert!(Context::new(None, Some(101)).is_err());
        let ctx = Context::new(None, None).unwrap();
        assert_eq!(ctx.max_dop, DEFAULT_MAX_DOP);
        assert_eq!(ctx.rclone_bin, "rclone");
    }

    #[test]
    fn lock_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::default();
        let repo = tmp.path().to_str().unwrap();
        let (storage, path) = lock_target(&ctx, repo, None);
        {
            let _lock = RepoLock::acquire(Arc::clone(&storage), path.clone()).unwrap();
            assert!(storage.exists(&path).unwrap());
        }
        assert!(!storage.exists(&path).unwrap());
    }

    #[test]
    fn second_lock_fails_until_released() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::default();
        let repo = tmp.path().to_str().unwrap();
        let (storage, path) = lock_target(&ctx, repo, None);

        let lock = RepoLock::acquire(Arc::clone(&storage), path.clone()).unwrap();
        assert!(matches!(
            RepoLock::acquire(Arc::clone(&storage), path.clone()),
            Err(PackratError::Locked(_))
        ));
        lock.release().unwrap();
        RepoLock::acquire(storage, path).unwrap();
    }

    #[test]
    fn remove_lock_recovers_from_stale_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::default();
        let repo = tmp.path().to_str().unwrap();
        let (storage, path) = lock_target(&ctx, repo, None);
        storage.write(&path, b"stale").unwrap();

        remove_lock(&ctx, repo, None).unwrap();
        assert!(!storage.exists(&path).unwrap());
        // Nothing left to remove.
        assert!(remove_lock(&ctx, repo, None).is_err());
    }
}
