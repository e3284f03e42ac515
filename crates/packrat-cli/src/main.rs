mod cli;

use clap::Parser;

use packrat_core::commands;
use packrat_core::error::{PackratError, Result};
use packrat_core::proto::CompressionMode;
use packrat_core::repo::{self, Context};

use cli::{Cli, Commands, RepoArgs};

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    if let Err(e) = run(&cli.command) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn context(args: &RepoArgs) -> Result<Context> {
    Context::new(args.rclone.clone(), args.max_dop)
}

fn read_password(args: &RepoArgs) -> Result<Option<Vec<u8>>> {
    match &args.password_file {
        None => Ok(None),
        Some(path) => std::fs::read(path)
            .map(Some)
            .map_err(|e| PackratError::Other(format!("cannot read password file {path}: {e}"))),
    }
}

fn run(command: &Commands) -> Result<()> {
    let args = command.repo_args();
    let ctx = context(args)?;
    let password = read_password(args)?;
    let password = password.as_deref();

    match command {
        Commands::Init {
            repo,
            chunk_size,
            iterations,
            compress,
        } => {
            let mut opts = commands::init::InitOptions::default();
            if let Some(cs) = chunk_size {
                opts.chunk_size = *cs;
            }
            if let Some(it) = iterations {
                opts.iterations = *it;
            }
            opts.compress = compress
                .parse::<CompressionMode>()
                .map_err(PackratError::Other)?;
            commands::init::run(&ctx, &repo.repo, password, &opts)?;
            println!("Repository initialized at: {}", repo.repo);
            Ok(())
        }

        Commands::Backup {
            repo,
            exclude_from,
            set_version,
            lock_file,
            dry_run,
            force,
            check_chunks,
            sources,
        } => {
            let opts = commands::backup::BackupOptions {
                exclude_from: exclude_from.clone(),
                set_version: set_version.clone(),
                lock_file: lock_file.clone(),
                dry_run: *dry_run,
                force: *force,
                check_chunks: *check_chunks,
            };
            let stats = commands::backup::run(&ctx, &repo.repo, password, sources, &opts)?;
            if !stats.version.is_empty() {
                println!("Version: {}", stats.version);
            }
            println!(
                "Dirs: {} ({} new, {} updated, {} removed)",
                stats.dirs, stats.dirs_new, stats.dirs_updated, stats.dirs_removed
            );
            println!(
                "Files: {} ({} new, {} updated, {} removed)",
                stats.files, stats.files_new, stats.files_updated, stats.files_removed
            );
            println!(
                "Symlinks: {} ({} new, {} updated, {} removed)",
                stats.symlinks, stats.symlinks_new, stats.symlinks_updated, stats.symlinks_removed
            );
            println!(
                "Source size: {} bytes, added: {} bytes, repo bytes added: {}",
                stats.size, stats.add_src_size, stats.add_repo_size
            );
            fail_on_errors(stats.errors)
        }

        Commands::Ls { repo, version } => {
            let (lines, invalid) =
                commands::versions::ls(&ctx, &repo.repo, password, version.as_deref())?;
            for line in lines {
                println!("{line}");
            }
            fail_on_errors(invalid)
        }

        Commands::Versions { repo } => {
            for v in commands::versions::list(&ctx, &repo.repo, password)? {
                println!("{v}");
            }
            Ok(())
        }

        Commands::Restore {
            repo,
            version,
            target,
            merge,
            verify_only,
            dry_run,
            patterns,
        } => {
            let opts = commands::restore::RestoreOptions {
                version: version.clone(),
                merge: *merge,
                verify_only: *verify_only,
                dry_run: *dry_run,
            };
            let stats = commands::restore::run(
                &ctx,
                &repo.repo,
                password,
                target.as_deref(),
                patterns,
                &opts,
            )?;
            println!(
                "Restored {} files, {} dirs, {} symlinks",
                stats.files, stats.dirs, stats.symlinks
            );
            fail_on_errors(stats.errors)
        }

        Commands::DeleteVersion { repo, version } => {
            commands::versions::delete(&ctx, &repo.repo, password, version)
        }

        Commands::DeleteOldVersions { repo, dry_run } => {
            let doomed = commands::versions::delete_old(&ctx, &repo.repo, password, *dry_run)?;
            for v in doomed {
                if *dry_run {
                    println!("Would delete version {v}");
                } else {
                    println!("Deleted version {v}");
                }
            }
            Ok(())
        }

        Commands::VerifyRepo { repo, quick } => {
            let opts = commands::verify::VerifyOptions { quick: *quick };
            let result = commands::verify::run(&ctx, &repo.repo, password, &opts)?;
            for v in &result.versions {
                if v.load_failed {
                    println!("Version {} : unreadable", v.version);
                    continue;
                }
                let invalid = if v.invalid_nodes > 0 {
                    format!(" {} invalid file record(s).", v.invalid_nodes)
                } else {
                    String::new()
                };
                println!(
                    "Version {} : {} bytes, {} chunk(s), {} bad, {} missing.{}",
                    v.version, v.bytes, v.chunks, v.errors, v.missing, invalid
                );
            }
            println!(
                "Summary: {} chunk(s), {} good, {} bad, {} missing, {} unused",
                result.chunks, result.ok, result.errors, result.missing, result.unused
            );
            if result.failed() {
                return Err(PackratError::Other("repository verification failed".into()));
            }
            Ok(())
        }

        Commands::PurgeUnused { repo, dry_run } => {
            let opts = commands::purge::PurgeOptions { dry_run: *dry_run };
            let stats = commands::purge::run(&ctx, &repo.repo, password, &opts)?;
            if *dry_run {
                println!(
                    "Chunks to be purged (dry run): {} out of {}",
                    stats.purged, stats.total
                );
            } else {
                println!("Chunks purged: {} out of {}", stats.purged, stats.total);
            }
            fail_on_errors(stats.failed)
        }

        Commands::RemoveLock { repo, lock_file } => {
            repo::remove_lock(&ctx, &repo.repo, lock_file.as_deref())
        }
    }
}

fn fail_on_errors(errors: usize) -> Result<()> {
    if errors > 0 {
        Err(PackratError::CompletedWithErrors(errors))
    } else {
        Ok(())
    }
}
