use crate::config::{self, DEFAULT_CHUNK_SIZE, DEFAULT_ITERATIONS};
use crate::error::{PackratError, Result};
use crate::proto::CompressionMode;
use crate::repo::{Context, CHUNKS_DIR, VERSIONS_DIR};
use crate::storage::backend_for_path;

pub struct InitOptions {
    pub chunk_size: i32,
    pub iterations: u32,
    pub compress: CompressionMode,
}

impl Default for InitOptions {
    fn default() -> Self {
        InitOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            iterations: DEFAULT_ITERATIONS,
            compress: CompressionMode::Auto,
        }
    }
}

/// Create a new repository: the directory skeleton plus the config file.
pub fn run(ctx: &Context, repo: &str, password: Option<&[u8]>, opts: &InitOptions) -> Result<()> {
    if repo.is_empty() {
        return Err(PackratError::Other(
            "backup repository must be specified".into(),
        ));
    }
    let (storage, root) = backend_for_path(repo, &ctx.rclone_bin);

    match storage.list(&root) {
        Ok(files) if !files.is_empty() => {
            return Err(PackratError::RepoAlreadyExists(repo.to_string()));
        }
        _ => {}
    }

    storage.mkdir_all(&root)?;
    storage.mkdir_all(&storage.join(&root, VERSIONS_DIR))?;
    storage.mkdir_all(&storage.join(&root, CHUNKS_DIR))?;
    config::write_new_config(
        storage.as_ref(),
        &root,
        password,
        opts.iterations,
        opts.chunk_size,
        opts.compress,
    )
}
