//! Hand-derived prost messages for every record persisted in a repository.
//!
//! Tags and field names follow the published wire format and must not be
//! renumbered; `version-*` files and `vecbackup-config` written by one build
//! must decode under every other.

/// Magic prefix of the repository config file.
pub const CONFIG_MAGIC: &[u8; 4] = b"VBKC";
/// Magic prefix of the decompressed version stream.
pub const VERSION_MAGIC: &[u8; 4] = b"VBKV";

/// Schema version of `EncConfigProto`.
pub const CONFIG_SCHEMA_VERSION: i32 = 1;
/// Schema version of `VersionProto`.
pub const VERSION_SCHEMA_VERSION: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FileType {
    RegularFile = 0,
    Directory = 1,
    Symlink = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum EncType {
    NoEncryption = 0,
    Symmetric = 1,
}

/// On-disk chunk body tag. Not a protobuf enum on the wire: the raw byte
/// value is the first byte of every chunk payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum CompressionType {
    NoCompression = 0,
    Zlib = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum CompressionMode {
    Auto = 0,
    Slow = 1,
    No = 2,
    Yes = 3,
}

impl std::str::FromStr for CompressionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(CompressionMode::Auto),
            "slow" => Ok(CompressionMode::Slow),
            "no" => Ok(CompressionMode::No),
            "yes" => Ok(CompressionMode::Yes),
            other => Err(format!("unknown compression mode: '{other}'")),
        }
    }
}

/// One node record in a version file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeDataProto {
    /// Path with forward-slash separators, regardless of host convention.
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(enumeration = "FileType", tag = "2")]
    pub node_type: i32,

    #[prost(int64, tag = "3")]
    pub size: i64,

    #[prost(message, optional, tag = "4")]
    pub mod_time: Option<::prost_types::Timestamp>,

    #[prost(int32, tag = "5")]
    pub perm: i32,

    /// SHA-512/256 over the whole file content.
    #[prost(bytes = "vec", tag = "6")]
    pub file_checksum: Vec<u8>,

    /// Symlink target; empty for other node types.
    #[prost(string, tag = "7")]
    pub target: String,

    /// Plaintext size of each chunk, aligned 1:1 with `chunks`.
    #[prost(int32, repeated, tag = "8")]
    pub sizes: Vec<i32>,

    /// 32-byte chunk fingerprints in file order.
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub chunks: Vec<Vec<u8>>,
}

/// Header record of a version file.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct VersionProto {
    #[prost(int32, tag = "1")]
    pub version: i32,
}

/// Inner repository config. Under symmetric encryption this message is
/// only ever stored as ciphertext inside `EncConfigProto.config`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigProto {
    #[prost(int32, tag = "1")]
    pub chunk_size: i32,

    #[prost(bytes = "vec", tag = "2")]
    pub encryption_key: Vec<u8>,

    #[prost(bytes = "vec", tag = "3")]
    pub fp_secret: Vec<u8>,

    #[prost(enumeration = "CompressionMode", tag = "4")]
    pub compress: i32,
}

/// Outer config envelope, stored in cleartext after the `VBKC` magic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncConfigProto {
    #[prost(int32, tag = "1")]
    pub version: i32,

    #[prost(enumeration = "EncType", tag = "2")]
    pub enc_type: i32,

    #[prost(int64, tag = "3")]
    pub iterations: i64,

    #[prost(bytes = "vec", tag = "4")]
    pub salt: Vec<u8>,

    #[prost(bytes = "vec", tag = "5")]
    pub config: Vec<u8>,
}
