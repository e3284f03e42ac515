use tracing::{info, warn};

use crate::error::{PackratError, Result};
use crate::repo::{Context, Repository};

#[derive(Default)]
pub struct PurgeOptions {
    pub dry_run: bool,
}

#[derive(Debug, Default, Clone)]
pub struct PurgeStats {
    /// Chunks present before the purge.
    pub total: usize,
    /// Chunks deleted (or, on a dry run, that would be deleted).
    pub purged: usize,
    /// Deletions that failed.
    pub failed: usize,
}

/// Delete every chunk referenced by no version.
///
/// The live set is the union of chunk references across all versions; the
/// complement of the presence snapshot is deleted. A version that cannot be
/// read cleanly aborts the purge, since its references would be invisible.
pub fn run(
    ctx: &Context,
    repo: &str,
    password: Option<&[u8]>,
    opts: &PurgeOptions,
) -> Result<PurgeStats> {
    let repository = Repository::open(ctx, repo, password)?;

    let mut unreferenced = repository.chunks.all();
    let mut stats = PurgeStats {
        total: unreferenced.len(),
        ..PurgeStats::default()
    };

    for v in repository.versions.versions()? {
        let (nodes, invalid) = repository.versions.load(&v)?;
        if invalid > 0 {
            return Err(PackratError::Other(format!(
                "version {v} has {invalid} invalid node record(s); refusing to purge"
            )));
        }
        for node in &nodes {
            for fp in &node.chunks {
                unreferenced.remove(fp);
            }
        }
    }

    for fp in unreferenced {
        if opts.dry_run {
            info!("would delete {fp}");
            stats.purged += 1;
            continue;
        }
        match repository.chunks.delete(fp) {
            Ok(()) => {
                info!("deleted {fp}");
                stats.purged += 1;
            }
            Err(e) => {
                warn!("failed to delete {fp}: {e}");
                stats.failed += 1;
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::backup::{self, BackupOptions};
    use crate::commands::init::{self, InitOptions};
    use crate::commands::{restore, verify};
    use crate::proto::CompressionMode;

    struct Fixture {
        tmp: tempfile::TempDir,
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
        Fixture { tmp, repo, src, ctx }
    }

    fn backup(f: &Fixture) -> String {
        backup::run(
            &f.ctx,
            &f.repo,
            None,
            &[f.src.clone()],
            &BackupOptions::default(),
        )
        .unwrap()
        .version
    }

    #[test]
    fn nothing_unreferenced_purges_nothing() {
        let f = fixture();
        std::fs::write(format!("{}/a", f.src), vec![1u8; 600]).unwrap();
        backup(&f);

        let stats = run(&f.ctx, &f.repo, None, &PurgeOptions::default()).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.purged, 0);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn deleting_versions_frees_their_chunks() {
        let f = fixture();
        let path = format!("{}/a", f.src);

        // Five versions with distinct content each.
        let mut versions = Vec::new();
        for i in 0..5u8 {
            std::fs::write(&path, vec![i; 600]).unwrap();
            versions.push(backup(&f));
        }
        let repository = Repository::open(&f.ctx, &f.repo, None).unwrap();
        assert_eq!(repository.chunks.len(), 5);
        for v in &versions[1..4] {
            repository.versions.delete(v).unwrap();
        }
        drop(repository);

        let stats = run(&f.ctx, &f.repo, None, &PurgeOptions::default()).unwrap();
        assert_eq!(stats.purged, 3);
        assert_eq!(stats.failed, 0);

        // Both surviving versions still verify and restore cleanly.
        let r = verify::run(&f.ctx, &f.repo, None, &verify::VerifyOptions::default()).unwrap();
        assert!(!r.failed());
        assert_eq!(r.unused, 0);

        for (i, v) in [(0u8, &versions[0]), (4u8, &versions[4])] {
            let out = f.tmp.path().join(format!("out-{i}"));
            let stats = restore::run(
                &f.ctx,
                &f.repo,
                None,
                Some(out.to_str().unwrap()),
                &[],
                &restore::RestoreOptions {
                    version: Some(v.clone()),
                    ..restore::RestoreOptions::default()
                },
            )
            .unwrap();
            assert_eq!(stats.errors, 0);
        }
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let f = fixture();
        std::fs::write(format!("{}/a", f.src), vec![1u8; 600]).unwrap();
        let v = backup(&f);
        let repository = Repository::open(&f.ctx, &f.repo, None).unwrap();
        repository.versions.delete(&v).unwrap();
        drop(repository);

        let stats = run(
            &f.ctx,
            &f.repo,
            None,
            &PurgeOptions { dry_run: true },
        )
        .unwrap();
        assert_eq!(stats.purged, 1);
        let repository = Repository::open(&f.ctx, &f.repo, None).unwrap();
        assert_eq!(repository.chunks.len(), 1);
    }
}
