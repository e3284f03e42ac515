use chrono::Utc;
use tracing::info;

use crate::error::Result;
use crate::repo::{Context, Repository};
use crate::versions::reduce_versions;

/// All version strings in ascending (chronological) order.
pub fn list(ctx: &Context, repo: &str, password: Option<&[u8]>) -> Result<Vec<String>> {
    let repository = Repository::open(ctx, repo, password)?;
    repository.versions.versions()
}

/// Pretty-printed node list of one version (latest when unspecified),
/// plus the number of invalid records dropped while loading.
pub fn ls(
    ctx: &Context,
    repo: &str,
    password: Option<&[u8]>,
    version: Option<&str>,
) -> Result<(Vec<String>, usize)> {
    let repository = Repository::open(ctx, repo, password)?;
    let version = match version {
        Some(v) => v.to_string(),
        None => match repository.versions.latest()? {
            Some(v) => v,
            None => return Ok((Vec::new(), 0)),
        },
    };
    let (nodes, invalid) = repository.versions.load(&version)?;
    Ok((nodes.iter().map(|n| n.pretty()).collect(), invalid))
}

/// Delete one version file. Chunks are left alone; `purge-unused` reclaims
/// them later.
pub fn delete(ctx: &Context, repo: &str, password: Option<&[u8]>, version: &str) -> Result<()> {
    let repository = Repository::open(ctx, repo, password)?;
    repository.versions.delete(version)
}

/// Apply the retention policy, deleting every version it rejects.
/// Returns the affected version strings.
pub fn delete_old(
    ctx: &Context,
    repo: &str,
    password: Option<&[u8]>,
    dry_run: bool,
) -> Result<Vec<String>> {
    let repository = Repository::open(ctx, repo, password)?;
    let versions = repository.versions.versions()?;
    let doomed = reduce_versions(Utc::now(), &versions);
    for v in &doomed {
        info!("deleting version {v}");
        if !dry_run {
            repository.versions.delete(v)?;
        }
    }
    Ok(doomed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init::{self, InitOptions};

    fn test_repo() -> (tempfile::TempDir, String, Context) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo").to_str().unwrap().to_string();
        let ctx = Context::default();
        init::run(&ctx, &repo, None, &InitOptions::default()).unwrap();
        (tmp, repo, ctx)
    }

    #[test]
    fn empty_repo_lists_nothing() {
        let (_tmp, repo, ctx) = test_repo();
        assert!(list(&ctx, &repo, None).unwrap().is_empty());
        assert_eq!(ls(&ctx, &repo, None, None).unwrap().0.len(), 0);
    }

    #[test]
    fn delete_then_list() {
        let (_tmp, repo, ctx) = test_repo();
        let repository = Repository::open(&ctx, &repo, None).unwrap();
        let v1 = "2024-01-01T00:00:00.000000000Z";
        let v2 = "2024-01-02T00:00:00.000000000Z";
        repository.versions.save(v1, &[]).unwrap();
        repository.versions.save(v2, &[]).unwrap();

        delete(&ctx, &repo, None, v1).unwrap();
        assert_eq!(list(&ctx, &repo, None).unwrap(), vec![v2.to_string()]);
        assert!(delete(&ctx, &repo, None, v1).is_err());
    }

    #[test]
    fn delete_old_respects_dry_run() {
        let (_tmp, repo, ctx) = test_repo();
        let repository = Repository::open(&ctx, &repo, None).unwrap();
        // Two versions in the same long-gone 30-day bucket.
        let v1 = "2014-01-01T00:00:00.000000000Z";
        let v2 = "2014-01-02T00:00:00.000000000Z";
        repository.versions.save(v1, &[]).unwrap();
        repository.versions.save(v2, &[]).unwrap();

        let doomed = delete_old(&ctx, &repo, None, true).unwrap();
        assert_eq!(doomed, vec![v2.to_string()]);
        assert_eq!(list(&ctx, &repo, None).unwrap().len(), 2);

        delete_old(&ctx, &repo, None, false).unwrap();
        assert_eq!(list(&ctx, &repo, None).unwrap(), vec![v1.to_string()]);
    }
}
