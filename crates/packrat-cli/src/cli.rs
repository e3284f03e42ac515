use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "packrat",
    version,
    about = "Content-addressed, encrypted, deduplicating backups",
    after_help = "\
Repository paths starting with 'rclone:' are routed through the rclone
helper binary; everything else is a local directory.

Exclude patterns (one per line in the --exclude-from file):
  Patterns starting with '/' match the full backed-up path.
  All other patterns match the file name only.
  '*' and '?' never match a path separator."
)]
pub(crate) struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every repository-touching subcommand.
#[derive(Args)]
pub(crate) struct RepoArgs {
    /// Repository path (prefix with 'rclone:' for remote storage)
    #[arg(short = 'r', long = "repo")]
    pub repo: String,

    /// File containing the repository password
    #[arg(long = "pw", value_name = "FILE")]
    pub password_file: Option<String>,

    /// Max degree of parallelism (1-100)
    #[arg(long, value_name = "N")]
    pub max_dop: Option<usize>,

    /// rclone helper binary for remote repositories
    #[arg(long, value_name = "BIN")]
    pub rclone: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Initialize a new repository
    Init {
        #[command(flatten)]
        repo: RepoArgs,

        /// Chunk size in bytes
        #[arg(long, value_name = "BYTES")]
        chunk_size: Option<i32>,

        /// PBKDF2 iteration count (min 100000)
        #[arg(long, value_name = "N")]
        iterations: Option<u32>,

        /// Compression mode: auto, slow, no, yes
        #[arg(long, value_name = "MODE", default_value = "auto")]
        compress: String,
    },

    /// Back up sources into a new version
    Backup {
        #[command(flatten)]
        repo: RepoArgs,

        /// File of exclude patterns, one per line
        #[arg(long, value_name = "FILE")]
        exclude_from: Option<String>,

        /// Save under this version string instead of the current time
        #[arg(long, value_name = "VERSION")]
        set_version: Option<String>,

        /// Lock file location override
        #[arg(long, value_name = "PATH")]
        lock_file: Option<String>,

        /// Show what would be backed up without writing anything
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Re-add files even when size and mtime are unchanged
        #[arg(short = 'f', long)]
        force: bool,

        /// Verify presence of every referenced chunk of unchanged files
        #[arg(long = "cs")]
        check_chunks: bool,

        /// Source paths to back up
        #[arg(required = true)]
        sources: Vec<String>,
    },

    /// List the files of a version
    Ls {
        #[command(flatten)]
        repo: RepoArgs,

        /// Version to list; latest when omitted
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,
    },

    /// List all versions in chronological order
    Versions {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Restore files from a version
    Restore {
        #[command(flatten)]
        repo: RepoArgs,

        /// Version to restore; latest when omitted
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,

        /// Target directory (must not exist unless --merge)
        #[arg(long, value_name = "DIR")]
        target: Option<String>,

        /// Merge into an existing target, skipping unchanged files
        #[arg(long)]
        merge: bool,

        /// Reconstruct and check files without writing anything
        #[arg(short = 't', long)]
        verify_only: bool,

        /// Show what would be restored without writing anything
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Restore only these paths (and everything under them)
        patterns: Vec<String>,
    },

    /// Delete one version (chunks are kept for purge-unused)
    DeleteVersion {
        #[command(flatten)]
        repo: RepoArgs,

        /// Version to delete
        version: String,
    },

    /// Delete versions rejected by the retention policy
    DeleteOldVersions {
        #[command(flatten)]
        repo: RepoArgs,

        /// Show what would be deleted without deleting
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Verify that every chunk of every version is present and intact
    VerifyRepo {
        #[command(flatten)]
        repo: RepoArgs,

        /// Only check chunk existence, not content
        #[arg(long)]
        quick: bool,
    },

    /// Delete chunks referenced by no version
    PurgeUnused {
        #[command(flatten)]
        repo: RepoArgs,

        /// Show what would be purged without deleting
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Remove a lock file left behind by a crashed backup
    RemoveLock {
        #[command(flatten)]
        repo: RepoArgs,

        /// Lock file location override
        #[arg(long, value_name = "PATH")]
        lock_file: Option<String>,
    },
}

impl Commands {
    pub(crate) fn repo_args(&self) -> &RepoArgs {
        match self {
            Commands::Init { repo, .. }
            | Commands::Backup { repo, .. }
            | Commands::Ls { repo, .. }
            | Commands::Versions { repo }
            | Commands::Restore { repo, .. }
            | Commands::DeleteVersion { repo, .. }
            | Commands::DeleteOldVersions { repo, .. }
            | Commands::VerifyRepo { repo, .. }
            | Commands::PurgeUnused { repo, .. }
            | Commands::RemoveLock { repo, .. } => repo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backup_command() {
        let cli = Cli::try_parse_from([
            "packrat", "backup", "-r", "/repo", "--pw", "/pw", "--max-dop", "7", "-n", "/src",
        ])
        .unwrap();
        let Commands::Backup {
            repo,
            dry_run,
            sources,
            ..
        } = cli.command
        else {
            panic!("expected backup");
        };
        assert_eq!(repo.repo, "/repo");
        assert_eq!(repo.password_file.as_deref(), Some("/pw"));
        assert_eq!(repo.max_dop, Some(7));
        assert!(dry_run);
        assert_eq!(sources, vec!["/src".to_string()]);
    }

    #[test]
    fn backup_requires_a_source() {
        assert!(Cli::try_parse_from(["packrat", "backup", "-r", "/repo"]).is_err());
    }

    #[test]
    fn repo_flag_is_required() {
        assert!(Cli::try_parse_from(["packrat", "versions"]).is_err());
    }
}
