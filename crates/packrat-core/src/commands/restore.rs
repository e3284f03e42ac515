use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha512_256};
use tracing::{info, warn};

use crate::error::{PackratError, Result};
use crate::node::Node;
use crate::platform;
use crate::pool::run_tasks;
use crate::repo::{Context, Repository};

/// Suffix of the per-file scratch sibling a restore streams into before the
/// final rename.
const RESTORE_TEMP_SUFFIX: &str = ".restore.temp";

#[derive(Default)]
pub struct RestoreOptions {
    /// Version to restore; latest when unset.
    pub version: Option<String>,
    /// Allow restoring into an existing target, skipping files already
    /// present with matching size and mtime.
    pub merge: bool,
    /// Reconstruct and check every file without writing anything.
    pub verify_only: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default, Clone)]
pub struct RestoreStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    /// Nodes that could not be restored.
    pub errors: usize,
}

/// Restore a version into `target`.
///
/// Three passes: directories and symlinks serially (directories broadened
/// to `mode | 0o700` so the restore itself can write under them), then
/// regular files under the worker pool, then exact directory modes applied
/// in reverse path order once all contents exist.
pub fn run(
    ctx: &Context,
    repo: &str,
    password: Option<&[u8]>,
    target: Option<&str>,
    patterns: &[String],
    opts: &RestoreOptions,
) -> Result<RestoreStats> {
    let repository = Repository::open(ctx, repo, password)?;

    let writing = !opts.verify_only && !opts.dry_run;
    let target = match target {
        Some(t) if !t.is_empty() => PathBuf::from(t),
        _ if !writing => PathBuf::new(),
        _ => return Err(PackratError::Other("restore target must be specified".into())),
    };
    if writing && target.exists() && !opts.merge {
        return Err(PackratError::Other(format!(
            "restore target {} already exists",
            target.display()
        )));
    }

    let version = match &opts.version {
        Some(v) => v.clone(),
        None => repository
            .versions
            .latest()?
            .ok_or_else(|| PackratError::Other("nothing to restore: repository is empty".into()))?,
    };

    let (nodes, invalid) = repository.versions.load(&version)?;
    let mut stats = RestoreStats {
        errors: invalid,
        ..RestoreStats::default()
    };

    let selected: Vec<&Node> = nodes
        .iter()
        .filter(|n| matches_patterns(&n.name, patterns))
        .collect();

    if writing {
        platform::create_dir_all(&target)?;
    }

    // Pass 1: directories and symlinks, in version (path) order.
    for node in &selected {
        if node.is_file() {
            continue;
        }
        if opts.dry_run {
            info!("{}", node.pretty());
            count_node(&mut stats, node);
            continue;
        }
        match restore_tree_node(node, &target, opts) {
            Ok(()) => {
                info!("{}", node.pretty());
                count_node(&mut stats, node);
            }
            Err(e) => {
                warn!("F {}: {e}", node.pretty());
                stats.errors += 1;
            }
        }
    }

    // Pass 2: regular files under the worker pool.
    let files: Vec<&Node> = selected.iter().copied().filter(|n| n.is_file()).collect();
    let stats = Mutex::new(stats);
    {
        let repository = &repository;
        let target = &target;
        let stats = &stats;
        run_tasks(ctx.max_dop, files, |node, _scratch| {
            if opts.dry_run {
                info!("{}", node.pretty());
                stats.lock().unwrap().files += 1;
                return;
            }
            match restore_file(repository, node, target, opts) {
                Ok(()) => {
                    info!("{}", node.pretty());
                    stats.lock().unwrap().files += 1;
                }
                Err(e) => {
                    warn!("F {}: {e}", node.pretty());
                    stats.lock().unwrap().errors += 1;
                }
            }
        });
    }
    let mut stats = stats.into_inner().unwrap();

    // Pass 3: exact directory permissions, deepest first.
    if writing {
        for node in selected.iter().rev() {
            if !node.is_dir() {
                continue;
            }
            let path = host_path(&target, &node.name);
            if let Err(e) = platform::apply_mode(&path, node.perm) {
                warn!("F {}: {e}", node.pretty());
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

/// A node is selected when any pattern equals its path, is empty, or is a
/// strict path prefix ending at a separator boundary. No patterns selects
/// everything.
fn matches_patterns(name: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|pat| {
        pat.is_empty()
            || name == pat
            || (name.len() > pat.len()
                && name.starts_with(pat.as_str())
                && name.as_bytes()[pat.len()] == b'/')
    })
}

fn count_node(stats: &mut RestoreStats, node: &Node) {
    if node.is_dir() {
        stats.dirs += 1;
    } else if node.is_symlink() {
        stats.symlinks += 1;
    } else {
        stats.files += 1;
    }
}

/// Node names may be absolute source paths; they are re-rooted under the
/// restore target, never joined as absolute paths.
fn host_path(target: &Path, name: &str) -> PathBuf {
    target.join(platform::to_host_path(name.trim_start_matches('/')))
}

/// Restore one directory or symlink.
fn restore_tree_node(node: &Node, target: &Path, opts: &RestoreOptions) -> Result<()> {
    let path = host_path(target, &node.name);
    if node.is_dir() {
        if opts.verify_only {
            return Ok(());
        }
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(PackratError::Other(
                    "a non-directory occupies the path".into(),
                ));
            }
            Err(_) => platform::create_dir_all(&path)?,
        }
        // Broadened so this restore can write beneath it; the exact mode is
        // applied in the final pass.
        platform::apply_mode(&path, node.perm | platform::DEFAULT_DIR_PERM)?;
        return Ok(());
    }

    // Symlink.
    if opts.verify_only {
        return Ok(());
    }
    match fs::symlink_metadata(&path) {
        Err(_) => {
            platform::create_symlink(&node.target, &path)?;
            Ok(())
        }
        Ok(meta) if meta.file_type().is_symlink() => {
            let existing = fs::read_link(&path)?;
            if existing == platform::to_host_path(&node.target) {
                Ok(())
            } else {
                Err(PackratError::Other(
                    "an existing symlink points at a different target".into(),
                ))
            }
        }
        Ok(_) => Err(PackratError::Other(
            "a non-symlink occupies the path".into(),
        )),
    }
}

/// Reconstruct one regular file from its chunks, verifying every chunk
/// fingerprint and the whole-file checksum before the atomic rename.
fn restore_file(
    repository: &Repository,
    node: &Node,
    target: &Path,
    opts: &RestoreOptions,
) -> Result<()> {
    let path = host_path(target, &node.name);

    if opts.merge {
        if let Ok(meta) = fs::symlink_metadata(&path) {
            if meta.is_file()
                && meta.len() as i64 == node.size
                && platform::mtime_ns(&meta) == node.mtime_ns
            {
                return Ok(());
            }
        }
    }

    let temp = if opts.verify_only {
        None
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(RESTORE_TEMP_SUFFIX);
        Some(PathBuf::from(name))
    };

    let result = write_file_data(repository, node, temp.as_deref());
    match result {
        Ok(()) => {
            let Some(temp) = temp else {
                return Ok(());
            };
            let finish = (|| -> Result<()> {
                platform::set_file_mtime(&temp, node.mtime_ns)?;
                platform::apply_mode(&temp, node.perm)?;
                fs::rename(&temp, &path)?;
                Ok(())
            })();
            if finish.is_err() {
                let _ = fs::remove_file(&temp);
            }
            finish
        }
        Err(e) => {
            if let Some(temp) = temp {
                let _ = fs::remove_file(&temp);
            }
            Err(e)
        }
    }
}

/// Stream the node's chunks into `temp` (or just through the checksum when
/// `temp` is `None`), failing on any fingerprint, length or checksum
/// mismatch.
fn write_file_data(repository: &Repository, node: &Node, temp: Option<&Path>) -> Result<()> {
    let secret = repository.fp_secret();
    let mut out = match temp {
        Some(temp) => {
            if let Some(parent) = temp.parent() {
                platform::create_dir_all(parent)?;
            }
            Some(platform::create_scratch_file(temp)?)
        }
        None => None,
    };

    let mut hasher = Sha512_256::new();
    let mut total: i64 = 0;
    for &fp in &node.chunks {
        let data = repository.chunks.read(fp).map_err(|e| {
            if e.is_not_found() {
                PackratError::ChunkMissing(fp.name())
            } else {
                PackratError::BadChunk {
                    fp: fp.name(),
                    reason: e.to_string(),
                }
            }
        })?;
        if !fp.matches(secret, &data) {
            return Err(PackratError::BadChunk {
                fp: fp.name(),
                reason: "fingerprint mismatch".into(),
            });
        }
        hasher.update(&data);
        total += data.len() as i64;
        if let Some(out) = out.as_mut() {
            out.write_all(&data)?;
        }
    }

    if total != node.size {
        return Err(PackratError::Integrity(format!(
            "length mismatch: {} vs {}",
            total, node.size
        )));
    }
    if hasher.finalize().as_slice() != node.file_checksum.as_slice() {
        return Err(PackratError::Integrity("file checksum mismatch".into()));
    }
    Ok(())
}
