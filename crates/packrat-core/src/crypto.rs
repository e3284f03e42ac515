use std::fmt;

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use rand::RngCore;
use sha2::{Digest, Sha512_256};
use zeroize::Zeroizing;

use crate::error::{PackratError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const SALT_LEN: usize = 32;
pub const FP_SECRET_LEN: usize = 64;
pub const FP_LEN: usize = 32;

/// A 32-byte secretbox key.
pub type EncKey = [u8; KEY_LEN];

/// Seal `plaintext` under `key`. Output is `nonce ‖ ciphertext+MAC`.
///
/// The nonce is drawn fresh from the OS CSPRNG for every call; at 192 bits
/// a random collision under one key is negligible.
pub fn encrypt(key: &EncKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| PackratError::Other("secretbox seal failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a blob produced by [`encrypt`]. Fails if the MAC does not verify.
pub fn decrypt(key: &EncKey, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(PackratError::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| PackratError::DecryptionFailed)
}

/// Derive a master key from a password with PBKDF2-HMAC-SHA1.
pub fn master_key(password: &[u8], salt: &[u8], rounds: u32) -> Zeroizing<EncKey> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password, salt, rounds, &mut *key);
    key
}

/// Key material produced when an encrypted repository is initialized.
pub struct DerivedKeys {
    pub salt: Vec<u8>,
    /// PBKDF2-derived key; wraps the inner config and nothing else.
    pub master_key: Zeroizing<EncKey>,
    /// Random key encrypting chunks and version files.
    pub storage_key: EncKey,
    /// Random secret mixed into chunk fingerprints so equal content is not
    /// observable without the password.
    pub fp_secret: Vec<u8>,
}

/// Generate fresh repository keys: a random salt, the PBKDF2 master key,
/// a random 32-byte storage key and a random 64-byte fingerprint secret.
pub fn derive_new_keys(password: &[u8], rounds: u32) -> DerivedKeys {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let master_key = master_key(password, &salt, rounds);

    let mut storage_key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut storage_key);

    let mut fp_secret = vec![0u8; FP_SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut fp_secret);

    DerivedKeys {
        salt,
        master_key,
        storage_key,
        fp_secret,
    }
}

/// Content address of a chunk: 32 bytes of SHA-512/256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; FP_LEN]);

impl Fingerprint {
    /// Fingerprint of `data`. With a secret, the plain digest is re-hashed
    /// under `secret ‖ digest` to hide content equality from observers.
    pub fn compute(secret: Option<&[u8]>, data: &[u8]) -> Self {
        let digest: [u8; FP_LEN] = Sha512_256::digest(data).into();
        match secret {
            None => Fingerprint(digest),
            Some(secret) => {
                let mut h = Sha512_256::new();
                h.update(secret);
                h.update(digest);
                Fingerprint(h.finalize().into())
            }
        }
    }

    /// Check that `data` hashes back to this fingerprint.
    pub fn matches(&self, secret: Option<&[u8]>, data: &[u8]) -> bool {
        *self == Fingerprint::compute(secret, data)
    }

    /// Lowercase-hex chunk file name.
    pub fn name(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a chunk file name back into a fingerprint.
    pub fn from_name(name: &str) -> Option<Self> {
        let bytes = hex::decode(name).ok()?;
        let arr: [u8; FP_LEN] = bytes.try_into().ok()?;
        Some(Fingerprint(arr))
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; FP_LEN] = bytes.try_into().ok()?;
        Some(Fingerprint(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.name())
    }
}
