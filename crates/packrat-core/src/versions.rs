use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Buf;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use prost::encoding::{decode_varint, encode_varint};
use prost::Message;
use tracing::warn;

use crate::crypto::{decrypt, encrypt, EncKey};
use crate::error::{PackratError, Result};
use crate::node::Node;
use crate::proto::{NodeDataProto, VersionProto, VERSION_MAGIC, VERSION_SCHEMA_VERSION};
use crate::storage::StorageBackend;

/// File name prefix inside the `versions/` directory.
pub const VERSION_FILENAME_PREFIX: &str = "version-";

/// Fixed-width RFC 3339 form with nanosecond precision, always UTC.
/// Its string ordering coincides with chronological ordering.
const VERSION_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%fZ";
const VERSION_TIME_LEN: usize = 30;

/// Format a time as a version string.
pub fn encode_version_time(t: DateTime<Utc>) -> String {
    t.format(VERSION_TIME_FORMAT).to_string()
}

/// Parse a version string, insisting on the exact fixed-width encoding so
/// that re-encoding always reproduces the input.
pub fn decode_version_time(v: &str) -> Option<DateTime<Utc>> {
    if v.len() != VERSION_TIME_LEN {
        return None;
    }
    let naive =
        chrono::NaiveDateTime::parse_from_str(v.strip_suffix('Z')?, "%Y-%m-%dT%H:%M:%S.%f").ok()?;
    let t = Utc.from_utc_datetime(&naive);
    if encode_version_time(t) == v {
        Some(t)
    } else {
        None
    }
}

/// Produce a version string for "now" that sorts strictly after `last`.
/// Identical clock readings back off for a few nanoseconds and retry.
pub fn next_version(last: &str) -> String {
    loop {
        let v = encode_version_time(Utc::now());
        if v.as_str() > last {
            return v;
        }
        std::thread::sleep(std::time::Duration::from_nanos(10));
    }
}

/// Encodes, decodes, enumerates and deletes version files.
pub struct VersionStore {
    storage: Arc<dyn StorageBackend>,
    dir: String,
    key: Option<EncKey>,
}

impl VersionStore {
    pub fn new(storage: Arc<dyn StorageBackend>, versions_dir: String, key: Option<EncKey>) -> Self {
        VersionStore {
            storage,
            dir: versions_dir,
            key,
        }
    }

    fn version_path(&self, v: &str) -> String {
        self.storage
            .join(&self.dir, &format!("{VERSION_FILENAME_PREFIX}{v}"))
    }

    /// All version strings, ascending.
    pub fn versions(&self) -> Result<Vec<String>> {
        let mut versions: Vec<String> = self
            .storage
            .list(&self.dir)?
            .into_iter()
            .filter_map(|name| {
                let v = name.strip_prefix(VERSION_FILENAME_PREFIX)?;
                decode_version_time(v).map(|_| v.to_string())
            })
            .collect();
        versions.sort();
        Ok(versions)
    }

    /// The most recent version, if any.
    pub fn latest(&self) -> Result<Option<String>> {
        Ok(self.versions()?.into_iter().next_back())
    }

    /// Load a version's nodes. Individually invalid nodes are dropped and
    /// counted; a malformed envelope is a fatal read error.
    pub fn load(&self, v: &str) -> Result<(Vec<Node>, usize)> {
        let raw = self
            .storage
            .read(&self.version_path(v))?
            .ok_or_else(|| PackratError::VersionNotFound(v.to_string()))?;
        let sealed = match &self.key {
            Some(key) => decrypt(key, &raw)?,
            None => raw,
        };

        let mut stream = Vec::with_capacity(sealed.len() * 4);
        ZlibDecoder::new(&sealed[..])
            .read_to_end(&mut stream)
            .map_err(|e| PackratError::InvalidVersionFile(format!("bad zlib stream: {e}")))?;

        let mut cursor: &[u8] = &stream;
        let mut magic = [0u8; VERSION_MAGIC.len()];
        if cursor.remaining() < magic.len() {
            return Err(PackratError::InvalidVersionFile("truncated header".into()));
        }
        cursor.copy_to_slice(&mut magic);
        if &magic != VERSION_MAGIC {
            return Err(PackratError::InvalidVersionFile("bad magic".into()));
        }

        let header_bytes = read_record(&mut cursor)?
            .ok_or_else(|| PackratError::InvalidVersionFile("missing header".into()))?;
        let header = VersionProto::decode(header_bytes)?;
        if header.version != VERSION_SCHEMA_VERSION {
            return Err(PackratError::InvalidVersionFile(format!(
                "unsupported schema version {}",
                header.version
            )));
        }

        let mut nodes = Vec::new();
        let mut invalid = 0usize;
        while let Some(record) = read_record(&mut cursor)? {
            let nd = NodeDataProto::decode(record)?;
            match Node::from_proto(&nd) {
                Some(node) if node.is_valid() => nodes.push(node),
                _ => {
                    warn!(name = %nd.name, version = %v, "dropping invalid node record");
                    invalid += 1;
                }
            }
        }
        Ok((nodes, invalid))
    }

    /// Persist `nodes` as version `v`. The caller passes nodes already in
    /// path order; the write publishes atomically.
    pub fn save(&self, v: &str, nodes: &[Node]) -> Result<()> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(VERSION_MAGIC)?;

        let header = VersionProto {
            version: VERSION_SCHEMA_VERSION,
        };
        write_record(&mut enc, &header.encode_to_vec())?;
        for node in nodes {
            if !node.is_valid() {
                return Err(PackratError::Other(format!(
                    "refusing to write invalid node: {}",
                    node.name
                )));
            }
            write_record(&mut enc, &node.to_proto().encode_to_vec())?;
        }
        let stream = enc
            .finish()
            .map_err(|e| PackratError::Other(format!("zlib deflate failed: {e}")))?;

        let out = match &self.key {
            Some(key) => encrypt(key, &stream)?,
            None => stream,
        };
        self.storage.write(&self.version_path(v), &out)
    }

    /// Delete one version file. Fails if it does not exist.
    pub fn delete(&self, v: &str) -> Result<()> {
        let path = self.version_path(v);
        if !self.storage.exists(&path)? {
            return Err(PackratError::VersionNotFound(v.to_string()));
        }
        self.storage.delete(&path)
    }
}

fn write_record<W: Write>(w: &mut W, record: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(10 + record.len());
    encode_varint(record.len() as u64, &mut frame);
    frame.extend_from_slice(record);
    w.write_all(&frame)?;
    Ok(())
}

/// Read one varint-framed record, or `None` at end of stream.
fn read_record<'a>(cursor: &mut &'a [u8]) -> Result<Option<&'a [u8]>> {
    if !cursor.has_remaining() {
        return Ok(None);
    }
    let len = decode_varint(cursor)
        .map_err(|_| PackratError::InvalidVersionFile("bad record length".into()))?;
    if len > i32::MAX as u64 || len as usize > cursor.remaining() {
        return Err(PackratError::InvalidVersionFile(
            "record length out of range".into(),
        ));
    }
    let tail: &'a [u8] = *cursor;
    let (record, rest) = tail.split_at(len as usize);
    *cursor = rest;
    Ok(Some(record))
}

/// Pruning policy: given the current time and ascending `versions`, return
/// the versions to delete.
///
/// Everything younger than 24 hours is kept. Older versions keep only the
/// earliest per wall-clock hour (up to 7 days), per day (up to 30 days),
/// per 7-day bucket (up to 365 days), and per 30-day bucket beyond that.
/// Bucket keys truncate the version time to the bucket width, relative to
/// the Unix epoch.
pub fn reduce_versions(now: DateTime<Utc>, versions: &[String]) -> Vec<String> {
    const HOUR: i64 = 3600;
    const DAY: i64 = 24 * HOUR;

    let mut seen = std::collections::HashSet::new();
    let mut doomed = Vec::new();
    for v in versions {
        let Some(ts) = decode_version_time(v) else {
            continue;
        };
        let age_cutoff = |d: i64| now - chrono::Duration::seconds(d);
        if ts > age_cutoff(DAY) {
            continue;
        }
        let bucket_secs = if ts > age_cutoff(7 * DAY) {
            HOUR
        } else if ts > age_cutoff(30 * DAY) {
            DAY
        } else if ts > age_cutoff(365 * DAY) {
            7 * DAY
        } else {
            30 * DAY
        };
        let t = ts.timestamp();
        if !seen.insert(t - t.rem_euclid(bucket_secs)) {
            doomed.push(v.clone());
        }
    }
    doomed
}
