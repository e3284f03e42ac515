use std::io::Read;
use std::sync::Mutex;

use sha2::{Digest, Sha512_256};
use tracing::{info, warn};

use crate::crypto::Fingerprint;
use crate::error::{PackratError, Result};
use crate::node::{path_compare, Node};
use crate::platform;
use crate::pool::{run_tasks, Scratch};
use crate::repo::{lock_target, Context, RepoLock, Repository};
use crate::scan::{scan_sources, ExcludeList, NodeMap};
use crate::versions::{decode_version_time, next_version};

#[derive(Default)]
pub struct BackupOptions {
    /// File of exclude patterns, one per line.
    pub exclude_from: Option<String>,
    /// Back up under this version string instead of the current time.
    pub set_version: Option<String>,
    /// Lock file location override; default is `<repo>/lock`.
    pub lock_file: Option<String>,
    pub dry_run: bool,
    /// Re-add every file even when size and mtime are unchanged.
    pub force: bool,
    /// Probe presence of every referenced chunk of unchanged files.
    pub check_chunks: bool,
}

#[derive(Debug, Default, Clone)]
pub struct BackupStats {
    /// Version written; empty on dry runs.
    pub version: String,
    pub dirs: usize,
    pub dirs_new: usize,
    pub dirs_updated: usize,
    pub dirs_removed: usize,
    pub files: usize,
    pub files_new: usize,
    pub files_updated: usize,
    pub files_removed: usize,
    pub symlinks: usize,
    pub symlinks_new: usize,
    pub symlinks_updated: usize,
    pub symlinks_removed: usize,
    /// Per-node soft failures (unreadable files, invalid records).
    pub errors: usize,
    /// Total size of all regular files in the new version.
    pub size: i64,
    /// Source bytes newly ingested this run.
    pub add_src_size: i64,
    /// Repository bytes added, after compression and encryption.
    pub add_repo_size: i64,
}

impl BackupStats {
    fn count_removed(&mut self, old: &Node) {
        if old.is_file() {
            self.files_removed += 1;
        } else if old.is_dir() {
            self.dirs_removed += 1;
        } else {
            self.symlinks_removed += 1;
        }
    }
}

/// Take a new backup of `srcs` into `repo`.
///
/// Scans the sources, merges against the previous version, fans per-node
/// work out to `ctx.max_dop` workers, and persists the surviving nodes in
/// path order as the new version. Per-node failures are counted in
/// `BackupStats::errors` and the affected paths dropped; the version file
/// is still written.
pub fn run(
    ctx: &Context,
    repo: &str,
    password: Option<&[u8]>,
    srcs: &[String],
    opts: &BackupOptions,
) -> Result<BackupStats> {
    if srcs.is_empty() {
        return Err(PackratError::Other(
            "at least one backup source must be specified".into(),
        ));
    }

    let repository = Repository::open(ctx, repo, password)?;

    let (lock_storage, lock_path) = lock_target(ctx, repo, opts.lock_file.as_deref());
    let lock = RepoLock::acquire(lock_storage, lock_path)?;

    let excludes = ExcludeList::from_file(opts.exclude_from.as_deref())?;

    let latest = repository.versions.latest()?.unwrap_or_default();
    let new_version = match &opts.set_version {
        Some(v) => {
            if decode_version_time(v).is_none() {
                return Err(PackratError::InvalidVersion(v.clone()));
            }
            v.clone()
        }
        None => next_version(&latest),
    };

    let mut stats = BackupStats::default();

    let (scanned, scan_errors) = scan_sources(srcs, &excludes);
    stats.errors += scan_errors;
    if scanned.is_empty() {
        return Err(PackratError::Other("nothing to back up".into()));
    }

    let mut previous = NodeMap::default();
    if !latest.is_empty() {
        let (nodes, invalid) = repository.versions.load(&latest)?;
        stats.errors += invalid;
        for node in nodes {
            let name = node.name.clone();
            if !previous.insert(node) {
                warn!("ignoring duplicate item in version file: {name}");
            }
        }
    }

    // Union of old and new names, in version-file order.
    let mut names: Vec<&String> = previous.names.iter().chain(scanned.names.iter()).collect();
    names.sort_by(|a, b| path_compare(a.as_str(), b.as_str()));
    names.dedup();

    let stats = Mutex::new(stats);
    let slots: Vec<Mutex<Option<Node>>> = names.iter().map(|_| Mutex::new(None)).collect();
    {
        let repository = &repository;
        let names = &names;
        let slots = &slots;
        let stats = &stats;
        run_tasks(ctx.max_dop, (0..names.len()).collect(), |i, scratch| {
            let name = names[i].as_str();
            let node = update_node(
                repository,
                opts,
                scratch,
                previous.get(name),
                scanned.get(name),
                stats,
            );
            *slots[i].lock().unwrap() = node;
        });
    }

    let nodes: Vec<Node> = slots
        .into_iter()
        .filter_map(|slot| slot.into_inner().unwrap())
        .collect();

    let mut stats = stats.into_inner().unwrap();
    if !opts.dry_run {
        repository.versions.save(&new_version, &nodes)?;
        stats.version = new_version;
    }
    lock.release()?;
    Ok(stats)
}

/// Decide the fate of one path present in the old version, the scan, or
/// both. Returns the node to carry into the new version, or `None` when the
/// path was removed or failed.
fn update_node(
    repository: &Repository,
    opts: &BackupOptions,
    scratch: &mut Scratch,
    old: Option<&Node>,
    new: Option<&Node>,
    stats: &Mutex<BackupStats>,
) -> Option<Node> {
    let Some(new) = new else {
        // Removed since the previous version: absent from the new one.
        let old = old?;
        info!("- {}", old.pretty());
        stats.lock().unwrap().count_removed(old);
        return None;
    };

    let reuse = match old {
        _ if opts.force => None,
        None => None,
        Some(old) if old.kind != new.kind => None,
        Some(old)
            if old.is_file() && (old.size != new.size || old.mtime_ns != new.mtime_ns) =>
        {
            None
        }
        Some(old) if old.is_symlink() && old.target != new.target => None,
        Some(old)
            if opts.check_chunks
                && old.is_file()
                && old.chunks.iter().any(|&fp| !repository.chunks.contains(fp)) =>
        {
            warn!("{}: referenced chunk missing, re-adding", old.pretty());
            None
        }
        Some(old) => Some(old),
    };

    if let Some(old) = reuse {
        let mut kept = old.clone();
        if !kept.is_symlink() {
            kept.perm = new.perm;
        }
        info!("= {}", kept.pretty());
        count_total(&mut stats.lock().unwrap(), &kept);
        return Some(kept);
    }

    let mut node = new.clone();
    let mut added = (0i64, 0i64);
    if node.is_file() && !opts.dry_run {
        match add_chunks(repository, &mut node, scratch) {
            Ok(n) => added = n,
            Err(e) => {
                warn!("F {}: {e}", node.pretty());
                stats.lock().unwrap().errors += 1;
                return None;
            }
        }
    }

    info!("+ {}", node.pretty());
    let mut st = stats.lock().unwrap();
    match (&node, old) {
        (n, Some(old)) if n.is_file() && old.is_file() => st.files_updated += 1,
        (n, Some(old)) if n.is_dir() && old.is_dir() => st.dirs_updated += 1,
        (n, Some(old)) if n.is_symlink() && old.is_symlink() => st.symlinks_updated += 1,
        (n, old) => {
            if let Some(old) = old {
                st.count_removed(old);
            }
            if n.is_file() {
                st.files_new += 1;
            } else if n.is_dir() {
                st.dirs_new += 1;
            } else {
                st.symlinks_new += 1;
            }
        }
    }
    st.add_src_size += added.0;
    st.add_repo_size += added.1;
    count_total(&mut st, &node);
    drop(st);
    Some(node)
}

fn count_total(stats: &mut BackupStats, node: &Node) {
    if node.is_file() {
        stats.files += 1;
        stats.size += node.size;
    } else if node.is_dir() {
        stats.dirs += 1;
    } else {
        stats.symlinks += 1;
    }
}

/// Read the file behind `node` in chunk-size slices, pushing each slice to
/// the chunk store and accumulating the whole-file checksum. Returns
/// `(source_bytes_added, repo_bytes_added)` for deduplication stats.
fn add_chunks(
    repository: &Repository,
    node: &mut Node,
    scratch: &mut Scratch,
) -> Result<(i64, i64)> {
    let chunk_size = repository.config.chunk_size as usize;
    let secret = repository.fp_secret();

    let mut file = std::fs::File::open(platform::to_host_path(&node.name))?;
    let mut hasher = Sha512_256::new();
    let mut chunks = Vec::new();
    let mut sizes = Vec::new();
    let mut total: i64 = 0;
    let mut added: i64 = 0;
    let mut added_repo: i64 = 0;

    loop {
        let count = {
            let buf = scratch.resize(chunk_size);
            read_full(&mut file, buf)?
        };
        if count > 0 {
            let slice = &scratch.buf[..count];
            total += count as i64;
            hasher.update(slice);
            let fp = Fingerprint::compute(secret, slice);
            let (dup, written) = repository.chunks.add(fp, slice)?;
            if !dup {
                added += count as i64;
                added_repo += written as i64;
            }
            chunks.push(fp);
            sizes.push(count as i32);
        }
        if total > node.size {
            return Err(PackratError::Integrity(format!(
                "file size changed: {}",
                node.name
            )));
        }
        if count < chunk_size {
            if total < node.size {
                return Err(PackratError::Integrity(format!(
                    "file size changed: {}",
                    node.name
                )));
            }
            break;
        }
    }

    node.chunks = chunks;
    node.sizes = sizes;
    node.file_checksum = hasher.finalize().to_vec();
    Ok((added, added_repo))
}

/// Fill as much of `buf` as the reader can provide; short only at EOF.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
