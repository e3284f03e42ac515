use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::warn;

use crate::crypto::Fingerprint;
use crate::error::Result;
use crate::pool::run_tasks;
use crate::repo::{Context, Repository};

#[derive(Default)]
pub struct VerifyOptions {
    /// Only stat chunk files instead of reading and re-fingerprinting them.
    pub quick: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Health {
    Ok,
    Error,
    Missing,
}

/// Per-version verification summary.
#[derive(Debug, Clone)]
pub struct VersionVerify {
    pub version: String,
    /// Plaintext bytes referenced by the version.
    pub bytes: i64,
    /// Distinct chunks referenced by the version.
    pub chunks: usize,
    /// Newly classified within this version's walk.
    pub errors: usize,
    pub missing: usize,
    /// Invalid node records dropped while loading.
    pub invalid_nodes: usize,
    /// The version file itself could not be read.
    pub load_failed: bool,
}

#[derive(Debug, Default, Clone)]
pub struct VerifyResult {
    /// Chunks present or referenced anywhere.
    pub chunks: usize,
    pub ok: usize,
    pub errors: usize,
    pub missing: usize,
    /// Present chunks referenced by no version.
    pub unused: usize,
    /// Per-version summaries, newest first.
    pub versions: Vec<VersionVerify>,
}

impl VerifyResult {
    /// Any error, missing chunk, or unreadable version is a failing outcome.
    pub fn failed(&self) -> bool {
        self.errors > 0 || self.missing > 0 || self.versions.iter().any(|v| v.load_failed)
    }
}

/// Verify every chunk referenced by every version, newest first.
///
/// Each chunk is classified ok/error/missing exactly once per run; chunk
/// probes are fanned out to the worker pool. In quick mode a probe is a
/// stat, otherwise the chunk is read, decoded and re-fingerprinted.
pub fn run(
    ctx: &Context,
    repo: &str,
    password: Option<&[u8]>,
    opts: &VerifyOptions,
) -> Result<VerifyResult> {
    let repository = Repository::open(ctx, repo, password)?;

    let mut versions = repository.versions.versions()?;
    versions.reverse();

    // Reference counts over everything present, so unreferenced chunks can
    // be reported at the end.
    let mut refcounts: HashMap<Fingerprint, usize> =
        repository.chunks.all().into_iter().map(|fp| (fp, 0)).collect();
    let classified: Mutex<HashMap<Fingerprint, Health>> = Mutex::new(HashMap::new());

    let mut result = VerifyResult::default();
    for v in versions {
        let (nodes, invalid_nodes) = match repository.versions.load(&v) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("failed to read version {v}: {e}");
                result.versions.push(VersionVerify {
                    version: v,
                    bytes: 0,
                    chunks: 0,
                    errors: 0,
                    missing: 0,
                    invalid_nodes: 0,
                    load_failed: true,
                });
                continue;
            }
        };

        let mut bytes: i64 = 0;
        let mut version_chunks: HashSet<Fingerprint> = HashSet::new();
        let mut to_probe: Vec<Fingerprint> = Vec::new();
        for node in &nodes {
            for (i, &fp) in node.chunks.iter().enumerate() {
                bytes += node.sizes[i] as i64;
                if !version_chunks.insert(fp) {
                    continue;
                }
                let count = refcounts.entry(fp).or_insert(0);
                *count += 1;
                if *count == 1 {
                    to_probe.push(fp);
                }
            }
        }

        // First reference anywhere: classify now, in parallel.
        {
            let repository = &repository;
            let classified = &classified;
            run_tasks(ctx.max_dop, to_probe, |fp, _scratch| {
                let health = probe_chunk(repository, fp, opts.quick);
                classified.lock().unwrap().insert(fp, health);
            });
        }

        let classified = classified.lock().unwrap();
        let mut errors = 0usize;
        let mut missing = 0usize;
        for fp in &version_chunks {
            match classified.get(fp) {
                Some(Health::Error) => errors += 1,
                Some(Health::Missing) => missing += 1,
                _ => {}
            }
        }
        drop(classified);

        result.versions.push(VersionVerify {
            chunks: version_chunks.len(),
            version: v,
            bytes,
            errors,
            missing,
            invalid_nodes,
            load_failed: false,
        });
    }

    let classified = classified.into_inner().unwrap();
    result.chunks = refcounts.len();
    for (fp, count) in &refcounts {
        if *count == 0 {
            result.unused += 1;
            continue;
        }
        match classified.get(fp) {
            Some(Health::Ok) => result.ok += 1,
            Some(Health::Error) => {
                warn!("error chunk {fp}");
                result.errors += 1;
            }
            Some(Health::Missing) => {
                warn!("missing chunk {fp}");
                result.missing += 1;
            }
            None => {}
        }
    }
    Ok(result)
}

fn probe_chunk(repository: &Repository, fp: Fingerprint, quick: bool) -> Health {
    if quick {
        return match repository.chunks.probe(fp) {
            Ok(true) => Health::Ok,
            Ok(false) => Health::Missing,
            Err(_) => Health::Error,
        };
    }
    match repository.chunks.read(fp) {
        Ok(data) => {
            if fp.matches(repository.fp_secret(), &data) {
                Health::Ok
            } else {
                Health::Error
            }
        }
        Err(e) if e.is_not_found() => Health::Missing,
        Err(_) => Health::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::backup::{self, BackupOptions};
    use crate::commands::init::{self, InitOptions};
    use crate::proto::CompressionMode;

    struct Fixture {
        _tmp: tempfile::TempDir,
        repo: String,
        src: String,
        ctx: Context,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo").to_str().unwrap().to_string();
        let src = tmp.path().join("src").to_str().unwrap().to_string();
        std::fs::create_dir(&src).unwrap();
        let ctx = Context::default();
        let opts = InitOptions {
            chunk_size: 1024,
            compress: CompressionMode::Auto,
            ..InitOptions::default()
        };
        init::run(&ctx, &repo, None, &opts).unwrap();
        Fixture { _tmp: tmp, repo, src, ctx }
    }

    fn backup(f: &Fixture) {
        backup::run(
            &f.ctx,
            &f.repo,
            None,
            &[f.src.clone()],
            &BackupOptions::default(),
        )
        .unwrap();
    }

    fn chunk_files(repo: &str) -> Vec<std::path::PathBuf> {
        let mut found = Vec::new();
        for sub in std::fs::read_dir(format!("{repo}/chunks")).unwrap() {
            let sub = sub.unwrap();
            if sub.file_type().unwrap().is_dir() {
                for child in std::fs::read_dir(sub.path()).unwrap() {
                    found.push(child.unwrap().path());
                }
            }
        }
        found
    }

    #[test]
    fn clean_repo_verifies_ok() {
        let f = fixture();
        std::fs::write(format!("{}/a", f.src), vec![1u8; 3000]).unwrap();
        backup(&f);

        for quick in [false, true] {
            let r = run(&f.ctx, &f.repo, None, &VerifyOptions { quick }).unwrap();
            assert!(!r.failed());
            // Two 1024-byte slices of equal content share one chunk.
            assert_eq!(r.chunks, 2);
            assert_eq!(r.ok, 2);
            assert_eq!(r.unused, 0);
            assert_eq!(r.versions.len(), 1);
            assert_eq!(r.versions[0].bytes, 3000);
        }
    }

    #[test]
    fn corruption_detected_by_full_but_not_quick() {
        let f = fixture();
        std::fs::write(format!("{}/a", f.src), vec![2u8; 600]).unwrap();
        backup(&f);

        let chunk = &chunk_files(&f.repo)[0];
        let mut data = std::fs::read(chunk).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        std::fs::write(chunk, &data).unwrap();

        let quick = run(&f.ctx, &f.repo, None, &VerifyOptions { quick: true }).unwrap();
        assert!(!quick.failed(), "quick mode only stats the file");

        let full = run(&f.ctx, &f.repo, None, &VerifyOptions { quick: false }).unwrap();
        assert!(full.failed());
        assert_eq!(full.errors, 1);
        assert_eq!(full.missing, 0);
    }

    #[test]
    fn deleted_chunk_reported_missing_in_both_modes() {
        let f = fixture();
        std::fs::write(format!("{}/a", f.src), vec![3u8; 600]).unwrap();
        backup(&f);
        std::fs::remove_file(&chunk_files(&f.repo)[0]).unwrap();

        for quick in [false, true] {
            let r = run(&f.ctx, &f.repo, None, &VerifyOptions { quick }).unwrap();
            assert!(r.failed());
            assert_eq!(r.missing, 1);
        }
    }

    #[test]
    fn unused_chunks_are_counted() {
        let f = fixture();
        let path = format!("{}/a", f.src);
        std::fs::write(&path, vec![4u8; 600]).unwrap();
        backup(&f);

        // Replace the file and back up again, then delete the old version:
        // the first chunk is now referenced by nothing.
        std::fs::write(&path, vec![5u8; 600]).unwrap();
        backup(&f);
        let repository = Repository::open(&f.ctx, &f.repo, None).unwrap();
        let old = repository.versions.versions().unwrap()[0].clone();
        repository.versions.delete(&old).unwrap();
        drop(repository);

        let r = run(&f.ctx, &f.repo, None, &VerifyOptions::default()).unwrap();
        assert!(!r.failed());
        assert_eq!(r.chunks, 2);
        assert_eq!(r.ok, 1);
        assert_eq!(r.unused, 1);
    }

    #[test]
    fn shared_chunks_classified_once_across_versions() {
        let f = fixture();
        std::fs::write(format!("{}/a", f.src), vec![6u8; 600]).unwrap();
        backup(&f);
        backup(&f);

        let r = run(&f.ctx, &f.repo, None, &VerifyOptions::default()).unwrap();
        assert_eq!(r.versions.len(), 2);
        assert_eq!(r.chunks, 1);
        assert_eq!(r.ok, 1);
        // Newest version claims the classification; the older one sees a
        // cached result and reports no new failures.
        assert!(!r.failed());
    }

    #[test]
    fn encrypted_repo_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo").to_str().unwrap().to_string();
        let src = tmp.path().join("src").to_str().unwrap().to_string();
        std::fs::create_dir(&src).unwrap();
        std::fs::write(format!("{src}/a"), vec![7u8; 600]).unwrap();
        let ctx = Context::default();
        init::run(
            &ctx,
            &repo,
            Some(b"pw"),
            &InitOptions {
                chunk_size: 1024,
                ..InitOptions::default()
            },
        )
        .unwrap();
        backup::run(&ctx, &repo, Some(b"pw"), &[src], &BackupOptions::default()).unwrap();

        let chunk = &chunk_files(&repo)[0];
        let mut data = std::fs::read(chunk).unwrap();
        let last = data.len() - 1;
        data[last] ^= 1;
        std::fs::write(chunk, &data).unwrap();

        let r = run(&ctx, &repo, Some(b"pw"), &VerifyOptions::default()).unwrap();
        assert!(r.failed());
        assert_eq!(r.errors, 1);
    }
}
