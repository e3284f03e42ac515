use prost::Message;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{self, EncKey, FP_SECRET_LEN};
use crate::error::{PackratError, Result};
use crate::proto::{
    CompressionMode, ConfigProto, EncConfigProto, EncType, CONFIG_MAGIC, CONFIG_SCHEMA_VERSION,
};
use crate::storage::StorageBackend;

/// Name of the repository config file. Part of the published layout.
pub const CONFIG_FILE: &str = "vecbackup-config";

/// PBKDF2 iteration counts below this are refused at init.
pub const MIN_ITERATIONS: u32 = 100_000;
/// Default chunk size: 16 MiB.
pub const DEFAULT_CHUNK_SIZE: i32 = 16 * 1024 * 1024;
/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Decoded inner repository config. Key material is only populated for
/// encrypted repositories.
pub struct Config {
    pub chunk_size: i32,
    pub compress: CompressionMode,
    pub storage_key: Option<EncKey>,
    pub fp_secret: Option<Vec<u8>>,
}

impl Config {
    fn to_bytes(&self) -> Vec<u8> {
        let cp = ConfigProto {
            chunk_size: self.chunk_size,
            encryption_key: self.storage_key.map(|k| k.to_vec()).unwrap_or_default(),
            fp_secret: self.fp_secret.clone().unwrap_or_default(),
            compress: self.compress as i32,
        };
        cp.encode_to_vec()
    }

    fn from_bytes(b: &[u8], encrypted: bool) -> Result<Self> {
        let cp = ConfigProto::decode(b)?;
        let compress = CompressionMode::try_from(cp.compress)
            .map_err(|_| PackratError::InvalidConfig(format!("bad compression mode {}", cp.compress)))?;
        if cp.chunk_size < 1 {
            return Err(PackratError::InvalidConfig(format!(
                "bad chunk size {}",
                cp.chunk_size
            )));
        }
        if !encrypted {
            return Ok(Config {
                chunk_size: cp.chunk_size,
                compress,
                storage_key: None,
                fp_secret: None,
            });
        }
        let storage_key: EncKey = cp
            .encryption_key
            .as_slice()
            .try_into()
            .map_err(|_| PackratError::InvalidConfig("bad storage key length".into()))?;
        if cp.fp_secret.len() < FP_SECRET_LEN {
            return Err(PackratError::InvalidConfig(
                "bad fingerprint secret length".into(),
            ));
        }
        Ok(Config {
            chunk_size: cp.chunk_size,
            compress,
            storage_key: Some(storage_key),
            fp_secret: Some(cp.fp_secret),
        })
    }
}

fn write_envelope(
    storage: &dyn StorageBackend,
    repo: &str,
    enc_type: EncType,
    iterations: i64,
    salt: Vec<u8>,
    config: Vec<u8>,
) -> Result<()> {
    let path = storage.join(repo, CONFIG_FILE);
    if storage.exists(&path)? {
        return Err(PackratError::RepoAlreadyExists(repo.to_string()));
    }
    let ec = EncConfigProto {
        version: CONFIG_SCHEMA_VERSION,
        enc_type: enc_type as i32,
        iterations,
        salt,
        config,
    };
    let mut out = Vec::with_capacity(4 + ec.encoded_len());
    out.extend_from_slice(CONFIG_MAGIC);
    out.extend_from_slice(&ec.encode_to_vec());
    storage.write(&path, &out)
}

/// Materialize and persist a fresh repository config.
///
/// Without a password the inner config rides in the envelope verbatim; with
/// one it is sealed under the PBKDF2 master key, carrying the random storage
/// key and fingerprint secret inside.
pub fn write_new_config(
    storage: &dyn StorageBackend,
    repo: &str,
    password: Option<&[u8]>,
    iterations: u32,
    chunk_size: i32,
    compress: CompressionMode,
) -> Result<()> {
    if chunk_size < 1 {
        return Err(PackratError::InvalidConfig(format!(
            "chunk size must be positive, got {chunk_size}"
        )));
    }
    let Some(password) = password else {
        let cfg = Config {
            chunk_size,
            compress,
            storage_key: None,
            fp_secret: None,
        };
        return write_envelope(storage, repo, EncType::NoEncryption, 0, Vec::new(), cfg.to_bytes());
    };

    if iterations < MIN_ITERATIONS {
        return Err(PackratError::InvalidConfig(format!(
            "at least {MIN_ITERATIONS} key derivation iterations required, got {iterations}"
        )));
    }
    let keys = crypto::derive_new_keys(password, iterations);
    let cfg = Config {
        chunk_size,
        compress,
        storage_key: Some(keys.storage_key),
        fp_secret: Some(keys.fp_secret),
    };
    let sealed = crypto::encrypt(&keys.master_key, &Zeroizing::new(cfg.to_bytes()))?;
    write_envelope(
        storage,
        repo,
        EncType::Symmetric,
        iterations as i64,
        keys.salt,
        sealed,
    )
}

/// Read and decode the repository config, deriving the master key and
/// unsealing the inner payload when the repository is encrypted. A
/// successful unseal is itself the password check.
pub fn load_config(
    storage: &dyn StorageBackend,
    repo: &str,
    password: Option<&[u8]>,
) -> Result<Config> {
    let path = storage.join(repo, CONFIG_FILE);
    let raw = storage
        .read(&path)?
        .ok_or_else(|| PackratError::RepoNotFound(repo.to_string()))?;

    let body = raw
        .strip_prefix(CONFIG_MAGIC.as_slice())
        .ok_or_else(|| PackratError::InvalidConfig("bad magic".into()))?;
    let ec = EncConfigProto::decode(body)?;
    if ec.version != CONFIG_SCHEMA_VERSION {
        return Err(PackratError::InvalidConfig(format!(
            "unsupported config version {}",
            ec.version
        )));
    }

    match EncType::try_from(ec.enc_type) {
        Ok(EncType::NoEncryption) => {
            if password.is_some() {
                return Err(PackratError::PasswordNotExpected);
            }
            Config::from_bytes(&ec.config, false)
        }
        Ok(EncType::Symmetric) => {
            let Some(password) = password else {
                return Err(PackratError::PasswordRequired);
            };
            if ec.salt.is_empty() {
                return Err(PackratError::InvalidConfig("missing salt".into()));
            }
            debug!(iterations = ec.iterations, "deriving master key");
            let master = crypto::master_key(password, &ec.salt, ec.iterations as u32);
            let plain = Zeroizing::new(
                crypto::decrypt(&master, &ec.config).map_err(|_| PackratError::DecryptionFailed)?,
            );
            Config::from_bytes(&plain, true)
        }
        Err(_) => Err(PackratError::InvalidConfig(format!(
            "unknown encryption type {}",
            ec.enc_type
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::storage::local::LocalBackend;

    fn repo_dir() -> (tempfile::TempDir, LocalBackend) {
        (tempfile::tempdir().unwrap(), LocalBackend::new())
    }

    #[test]
    fn plaintext_config_roundtrip() {
        let (tmp, storage) = repo_dir();
        let repo = tmp.path().to_str().unwrap();
        write_new_config(&storage, repo, None, 0, 1024, CompressionMode::Auto).unwrap();

        let cfg = load_config(&storage, repo, None).unwrap();
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.compress, CompressionMode::Auto);
        assert!(cfg.storage_key.is_none());
        assert!(cfg.fp_secret.is_none());
    }

    #[test]
    fn encrypted_config_roundtrip() {
        let (tmp, storage) = repo_dir();
        let repo = tmp.path().to_str().unwrap();
        write_new_config(
            &storage,
            repo,
            Some(b"hunter2"),
            MIN_ITERATIONS,
            4096,
            CompressionMode::Slow,
        )
        .unwrap();

        let cfg = load_config(&storage, repo, Some(b"hunter2")).unwrap();
        assert_eq!(cfg.chunk_size, 4096);
        assert_eq!(cfg.compress, CompressionMode::Slow);
        assert_eq!(cfg.storage_key.unwrap().len(), KEY_LEN);
        assert_eq!(cfg.fp_secret.unwrap().len(), FP_SECRET_LEN);
    }

    #[test]
    fn wrong_password_is_detected() {
        let (tmp, storage) = repo_dir();
        let repo = tmp.path().to_str().unwrap();
        write_new_config(
            &storage,
            repo,
            Some(b"hunter2"),
            MIN_ITERATIONS,
            1024,
            CompressionMode::Auto,
        )
        .unwrap();

        assert!(matches!(
            load_config(&storage, repo, Some(b"wrong")),
            Err(PackratError::DecryptionFailed)
        ));
    }

    #[test]
    fn password_mismatch_with_repo_mode() {
        let (tmp, storage) = repo_dir();
        let repo = tmp.path().to_str().unwrap();
        write_new_config(&storage, repo, None, 0, 1024, CompressionMode::Auto).unwrap();

        assert!(matches!(
            load_config(&storage, repo, Some(b"pw")),
            Err(PackratError::PasswordNotExpected)
        ));

        let (tmp2, _) = repo_dir();
        let repo2 = tmp2.path().to_str().unwrap();
        write_new_config(
            &storage,
            repo2,
            Some(b"pw"),
            MIN_ITERATIONS,
            1024,
            CompressionMode::Auto,
        )
        .unwrap();
        assert!(matches!(
            load_config(&storage, repo2, None),
            Err(PackratError::PasswordRequired)
        ));
    }

    #[test]
    fn low_iteration_count_is_refused() {
        let (tmp, storage) = repo_dir();
        let repo = tmp.path().to_str().unwrap();
        assert!(write_new_config(
            &storage,
            repo,
            Some(b"pw"),
            MIN_ITERATIONS - 1,
            1024,
            CompressionMode::Auto
        )
        .is_err());
    }

    #[test]
    fn bad_magic_is_refused() {
        let (tmp, storage) = repo_dir();
        let repo = tmp.path().to_str().unwrap();
        storage
            .write(&storage.join(repo, CONFIG_FILE), b"NOPEgarbage")
            .unwrap();
        assert!(matches!(
            load_config(&storage, repo, None),
            Err(PackratError::InvalidConfig(_))
        ));
    }

    #[test]
    fn missing_config_reads_as_missing_repo() {
        let (tmp, storage) = repo_dir();
        let repo = tmp.path().to_str().unwrap();
        assert!(matches!(
            load_config(&storage, repo, None),
            Err(PackratError::RepoNotFound(_))
        ));
    }

    #[test]
    fn double_init_is_refused() {
        let (tmp, storage) = repo_dir();
        let repo = tmp.path().to_str().unwrap();
        write_new_config(&storage, repo, None, 0, 1024, CompressionMode::Auto).unwrap();
        assert!(matches!(
            write_new_config(&storage, repo, None, 0, 1024, CompressionMode::Auto),
            Err(PackratError::RepoAlreadyExists(_))
        ));
    }
}
