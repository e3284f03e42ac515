use thiserror::Error;

pub type Result<T> = std::result::Result<T, PackratError>;

#[derive(Debug, Error)]
pub enum PackratError {
    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("invalid repository config: {0}")]
    InvalidConfig(String),

    #[error("wrong password or corrupted data")]
    DecryptionFailed,

    #[error("repository is encrypted; a password file is required")]
    PasswordRequired,

    #[error("repository is not encrypted")]
    PasswordNotExpected,

    #[error("version not found: '{0}'")]
    VersionNotFound(String),

    #[error("invalid version string: '{0}'")]
    InvalidVersion(String),

    #[error("invalid version file: {0}")]
    InvalidVersionFile(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("missing chunk {0}")]
    ChunkMissing(String),

    #[error("bad chunk {fp}: {reason}")]
    BadChunk { fp: String, reason: String },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("repository is locked (lock file {0} exists)")]
    Locked(String),

    #[error("parallelism must be between 1 and 100, got {0}")]
    ParallelismOutOfRange(usize),

    #[error("operation completed with {0} error(s)")]
    CompletedWithErrors(usize),

    #[error("{0}")]
    Other(String),
}

impl PackratError {
    /// True for "the object does not exist" failures, as opposed to
    /// failures reading an object that does exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            PackratError::ChunkMissing(_) => true,
            PackratError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
