use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::compress::{compress_chunk, uncompress_chunk};
use crate::crypto::{decrypt, encrypt, EncKey, Fingerprint};
use crate::error::{PackratError, Result};
use crate::proto::CompressionMode;
use crate::storage::StorageBackend;

/// Length of the fan-out directory name under `chunks/`.
const DIR_PREFIX_LEN: usize = 2;

struct ChunkState {
    /// Fingerprints with a chunk file on storage.
    present: HashSet<Fingerprint>,
    /// Fingerprints some worker is currently materializing.
    pending: HashSet<Fingerprint>,
}

/// Content-addressed chunk CRUD over a storage backend.
///
/// The presence index is loaded once at open and kept in memory for the rest
/// of the run; operations that mutate storage behind its back (purge after
/// verify, etc.) must happen at operation boundaries.
pub struct ChunkStore {
    storage: Arc<dyn StorageBackend>,
    dir: String,
    key: Option<EncKey>,
    compress: CompressionMode,
    state: Mutex<ChunkState>,
    done: Condvar,
}

impl ChunkStore {
    /// Open the chunk store rooted at `chunks_dir`, scanning the two-level
    /// fan-out to build the presence index.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        chunks_dir: String,
        key: Option<EncKey>,
        compress: CompressionMode,
    ) -> Result<Self> {
        let mut present = HashSet::new();
        let listed = storage.list2(&chunks_dir, &mut |sub, name| {
            if sub.len() != DIR_PREFIX_LEN || !name.starts_with(sub) {
                return;
            }
            if let Some(fp) = Fingerprint::from_name(name) {
                present.insert(fp);
            }
        });
        match listed {
            Ok(()) => {}
            // A repository with no chunks written yet has no fan-out to list.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        debug!(chunks = present.len(), "chunk index loaded");
        Ok(ChunkStore {
            storage,
            dir: chunks_dir,
            key,
            compress,
            state: Mutex::new(ChunkState {
                present,
                pending: HashSet::new(),
            }),
            done: Condvar::new(),
        })
    }

    fn chunk_path(&self, fp: Fingerprint) -> String {
        let name = fp.name();
        let sub = self.storage.join(&self.dir, &name[..DIR_PREFIX_LEN]);
        self.storage.join(&sub, &name)
    }

    /// O(1) membership test against the in-memory presence index.
    pub fn contains(&self, fp: Fingerprint) -> bool {
        self.state.lock().unwrap().present.contains(&fp)
    }

    /// Stat the chunk file itself, bypassing the in-memory index.
    pub fn probe(&self, fp: Fingerprint) -> Result<bool> {
        self.storage.exists(&self.chunk_path(fp))
    }

    /// Read, decrypt and decompress one chunk back to plaintext.
    pub fn read(&self, fp: Fingerprint) -> Result<Vec<u8>> {
        let path = self.chunk_path(fp);
        let raw = self
            .storage
            .read(&path)?
            .ok_or_else(|| PackratError::ChunkMissing(fp.name()))?;
        let packed = match &self.key {
            Some(key) => decrypt(key, &raw)?,
            None => raw,
        };
        uncompress_chunk(&packed)
    }

    /// Store one chunk, deduplicating against the presence index.
    ///
    /// Returns `(already_present, bytes_written)`. At most one caller
    /// materializes a given fingerprint: concurrent adds of the same
    /// fingerprint wait on the first writer and then observe its result.
    pub fn add(&self, fp: Fingerprint, data: &[u8]) -> Result<(bool, u64)> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.present.contains(&fp) {
                return Ok((true, 0));
            }
            if st.pending.insert(fp) {
                break;
            }
            // Another worker is writing this fingerprint right now.
            st = self.done.wait(st).unwrap();
        }
        drop(st);

        let written = self.write_chunk(fp, data);

        // The pending entry must come out and waiters must be woken on the
        // failure path too, or they would block forever.
        let mut st = self.state.lock().unwrap();
        st.pending.remove(&fp);
        match written {
            Ok(n) => {
                st.present.insert(fp);
                self.done.notify_all();
                Ok((false, n))
            }
            Err(e) => {
                self.done.notify_all();
                Err(e)
            }
        }
    }

    fn write_chunk(&self, fp: Fingerprint, data: &[u8]) -> Result<u64> {
        let mut packed = compress_chunk(data, self.compress)?;
        if let Some(key) = &self.key {
            packed = encrypt(key, &packed)?;
        }
        let name = fp.name();
        let sub = self.storage.join(&self.dir, &name[..DIR_PREFIX_LEN]);
        self.storage.mkdir_all(&sub)?;
        self.storage.write(&self.storage.join(&sub, &name), &packed)?;
        Ok(packed.len() as u64)
    }

    /// Remove one chunk from storage and from the presence index.
    pub fn delete(&self, fp: Fingerprint) -> Result<()> {
        self.storage.delete(&self.chunk_path(fp))?;
        self.state.lock().unwrap().present.remove(&fp);
        Ok(())
    }

    /// Snapshot of the presence index.
    pub fn all(&self) -> HashSet<Fingerprint> {
        self.state.lock().unwrap().present.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
