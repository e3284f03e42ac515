use std::cmp::Ordering;

use prost_types::Timestamp;

use crate::crypto::Fingerprint;
use crate::proto::{FileType, NodeDataProto};

/// One entry of a version: a regular file, directory, or symbolic link.
///
/// `name` always uses forward-slash separators; translation to the host
/// convention happens at I/O time.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub kind: FileType,
    pub size: i64,
    /// Modification time in nanoseconds since the Unix epoch; 0 means unset.
    pub mtime_ns: i64,
    pub perm: u32,
    /// SHA-512/256 over the whole file content.
    pub file_checksum: Vec<u8>,
    /// Symlink target.
    pub target: String,
    /// Plaintext chunk sizes, aligned 1:1 with `chunks`.
    pub sizes: Vec<i32>,
    pub chunks: Vec<Fingerprint>,
}

impl Node {
    pub fn regular_file(name: String, size: i64, mtime_ns: i64, perm: u32) -> Self {
        Node {
            name,
            kind: FileType::RegularFile,
            size,
            mtime_ns,
            perm,
            file_checksum: Vec::new(),
            target: String::new(),
            sizes: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn directory(name: String, perm: u32) -> Self {
        Node {
            name,
            kind: FileType::Directory,
            size: 0,
            mtime_ns: 0,
            perm,
            file_checksum: Vec::new(),
            target: String::new(),
            sizes: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn symlink(name: String, target: String) -> Self {
        Node {
            name,
            kind: FileType::Symlink,
            size: 0,
            mtime_ns: 0,
            perm: 0,
            file_checksum: Vec::new(),
            target,
            sizes: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileType::RegularFile
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileType::Symlink
    }

    /// Structural validity of a decoded node. Invalid nodes are dropped from
    /// version loads with a warning rather than failing the whole read.
    pub fn is_valid(&self) -> bool {
        if self.name.is_empty() {
            return false;
        }
        match self.kind {
            FileType::Directory => true,
            FileType::Symlink => !self.target.is_empty(),
            FileType::RegularFile => {
                if self.size > 0 {
                    self.mtime_ns != 0
                        && !self.chunks.is_empty()
                        && self.chunks.len() == self.sizes.len()
                } else {
                    self.mtime_ns != 0
                }
            }
        }
    }

    /// Display form: directories get a trailing `/`, symlinks a trailing `@`.
    pub fn pretty(&self) -> String {
        match self.kind {
            FileType::Directory => format!("{}/", self.name),
            FileType::Symlink => format!("{}@", self.name),
            FileType::RegularFile => self.name.clone(),
        }
    }

    pub fn to_proto(&self) -> NodeDataProto {
        match self.kind {
            FileType::RegularFile => NodeDataProto {
                name: self.name.clone(),
                node_type: FileType::RegularFile as i32,
                size: self.size,
                mod_time: Some(timestamp_from_ns(self.mtime_ns)),
                perm: self.perm as i32,
                file_checksum: self.file_checksum.clone(),
                target: String::new(),
                sizes: self.sizes.clone(),
                chunks: self.chunks.iter().map(|fp| fp.0.to_vec()).collect(),
            },
            FileType::Directory => NodeDataProto {
                name: self.name.clone(),
                node_type: FileType::Directory as i32,
                perm: self.perm as i32,
                ..Default::default()
            },
            FileType::Symlink => NodeDataProto {
                name: self.name.clone(),
                node_type: FileType::Symlink as i32,
                target: self.target.clone(),
                ..Default::default()
            },
        }
    }

    /// Rebuild a node from its wire form. `None` for unknown types or
    /// malformed fingerprints; the caller counts and drops those.
    pub fn from_proto(nd: &NodeDataProto) -> Option<Self> {
        let kind = FileType::try_from(nd.node_type).ok()?;
        match kind {
            FileType::RegularFile => {
                let mut chunks = Vec::with_capacity(nd.chunks.len());
                for raw in &nd.chunks {
                    chunks.push(Fingerprint::from_bytes(raw)?);
                }
                Some(Node {
                    name: nd.name.clone(),
                    kind,
                    size: nd.size,
                    mtime_ns: nd.mod_time.as_ref().map_or(0, timestamp_to_ns),
                    perm: nd.perm as u32,
                    file_checksum: nd.file_checksum.clone(),
                    target: String::new(),
                    sizes: nd.sizes.clone(),
                    chunks,
                })
            }
            FileType::Directory => Some(Node::directory(nd.name.clone(), nd.perm as u32)),
            FileType::Symlink => Some(Node::symlink(nd.name.clone(), nd.target.clone())),
        }
    }
}

fn timestamp_from_ns(ns: i64) -> Timestamp {
    Timestamp {
        seconds: ns.div_euclid(1_000_000_000),
        nanos: ns.rem_euclid(1_000_000_000) as i32,
    }
}

fn timestamp_to_ns(ts: &Timestamp) -> i64 {
    ts.seconds.saturating_mul(1_000_000_000) + ts.nanos as i64
}

/// Per-component path ordering on the logical `/` separator.
///
/// This differs from plain string ordering: `a/b` sorts before `a!x/c`
/// would under bytewise comparison rules that let `!` beat `/`. Version
/// files rely on this ordering, so plain `str` comparison must not be
/// substituted.
pub fn path_compare(a: &str, b: &str) -> Ordering {
    let mut ia = a.split('/');
    let mut ib = b.split('/');
    loop {
        match (ia.next(), ib.next()) {
            (Some(ca), Some(cb)) => match ca.cmp(cb) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_compare_is_per_component() {
        assert_eq!(path_compare("a/b", "a/b"), Ordering::Equal);
        assert_eq!(path_compare("a/b", "a/c"), Ordering::Less);
        assert_eq!(path_compare("a", "a/b"), Ordering::Less);
        // '.' (0x2E) sorts before '/' (0x2F) bytewise, but "a.d" is a
        // sibling of "a" and must not interleave with "a"'s children.
        assert_eq!(path_compare("a.d", "a/zz"), Ordering::Greater);
        assert_eq!(path_compare("a/zz", "a.d"), Ordering::Less);
    }

    #[test]
    fn file_node_proto_roundtrip() {
        let mut n = Node::regular_file("dir/file.txt".into(), 10, 1_700_000_000_123_456_789, 0o644);
        n.file_checksum = vec![9u8; 32];
        n.chunks = vec![Fingerprint([1u8; 32]), Fingerprint([2u8; 32])];
        n.sizes = vec![8, 2];
        let back = Node::from_proto(&n.to_proto()).unwrap();
        assert_eq!(back, n);
        assert!(back.is_valid());
    }

    #[test]
    fn dir_and_symlink_proto_roundtrip() {
        let d = Node::directory("some/dir".into(), 0o755);
        assert_eq!(Node::from_proto(&d.to_proto()).unwrap(), d);

        let s = Node::symlink("link".into(), "/tmp/x".into());
        assert_eq!(Node::from_proto(&s.to_proto()).unwrap(), s);
    }

    #[test]
    fn validity_rules() {
        assert!(!Node::directory(String::new(), 0o755).is_valid());
        assert!(!Node::symlink("l".into(), String::new()).is_valid());

        // File with content but no mtime.
        let mut f = Node::regular_file("f".into(), 5, 0, 0o644);
        assert!(!f.is_valid());
        f.mtime_ns = 123;
        // Still invalid: 5 bytes but no chunks.
        assert!(!f.is_valid());
        f.chunks = vec![Fingerprint([0u8; 32])];
        f.sizes = vec![5];
        assert!(f.is_valid());
        // Misaligned chunk/size lists.
        f.sizes = vec![4, 1];
        assert!(!f.is_valid());

        // Empty file: no chunks, but mtime still required.
        let mut e = Node::regular_file("e".into(), 0, 77, 0o644);
        assert!(e.is_valid());
        // Stray lists on a zero-size record are tolerated; only files with
        // content gate on chunk/size alignment.
        e.sizes = vec![1];
        assert!(e.is_valid());
    }

    #[test]
    fn pretty_marks_node_kinds() {
        assert_eq!(Node::directory("d".into(), 0o755).pretty(), "d/");
        assert_eq!(Node::symlink("s".into(), "t".into()).pretty(), "s@");
        assert_eq!(Node::regular_file("f".into(), 0, 1, 0o644).pretty(), "f");
    }
}
