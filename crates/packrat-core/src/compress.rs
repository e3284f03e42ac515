//! Per-chunk compression: a 1-byte codec tag followed by the (possibly
//! zlib-deflated) body.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{PackratError, Result};
use crate::proto::{CompressionMode, CompressionType};

/// Chunks smaller than this are never worth deflating.
const MIN_COMPRESS_SIZE: usize = 128;
/// In AUTO mode, larger chunks are probed by compressing this prefix first.
const PREFIX_CHECK_SIZE: usize = 4096;

fn deflate_tagged(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::default(),
    );
    enc.get_mut().push(CompressionType::Zlib as u8);
    enc.write_all(data)
        .and_then(|_| enc.finish())
        .map_err(|e| PackratError::Other(format!("zlib deflate failed: {e}")))
}

fn tag_uncompressed(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(CompressionType::NoCompression as u8);
    out.extend_from_slice(data);
    out
}

/// Encode one chunk under the given mode.
///
/// `Slow` compresses and keeps the result only when it is no larger than the
/// input. `Auto` skips tiny chunks outright, tries small chunks whole, and
/// probes the first 4 KiB of large chunks before committing to a full pass.
pub fn compress_chunk(data: &[u8], mode: CompressionMode) -> Result<Vec<u8>> {
    let mut mode = mode;
    if mode == CompressionMode::Auto {
        if data.len() < MIN_COMPRESS_SIZE {
            mode = CompressionMode::No;
        } else if data.len() < PREFIX_CHECK_SIZE {
            let out = deflate_tagged(data)?;
            if out.len() <= data.len() {
                return Ok(out);
            }
            mode = CompressionMode::No;
        } else {
            let probe = &data[..PREFIX_CHECK_SIZE];
            let out = deflate_tagged(probe)?;
            mode = if out.len() <= probe.len() {
                CompressionMode::Slow
            } else {
                CompressionMode::No
            };
        }
    }
    if mode == CompressionMode::Slow {
        let out = deflate_tagged(data)?;
        if out.len() <= data.len() {
            return Ok(out);
        }
        mode = CompressionMode::No;
    }
    if mode == CompressionMode::No {
        return Ok(tag_uncompressed(data));
    }
    deflate_tagged(data)
}

/// Decode one chunk, dispatching on its tag byte.
pub fn uncompress_chunk(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, body)) = data.split_first() else {
        return Err(PackratError::Integrity("empty chunk payload".into()));
    };
    if tag == CompressionType::NoCompression as u8 {
        return Ok(body.to_vec());
    }
    if tag != CompressionType::Zlib as u8 {
        return Err(PackratError::UnknownCompressionTag(tag));
    }
    let mut out = Vec::with_capacity(body.len() * 2);
    ZlibDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| PackratError::Integrity(format!("zlib inflate failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [CompressionMode; 4] = [
        CompressionMode::Auto,
        CompressionMode::Slow,
        CompressionMode::No,
        CompressionMode::Yes,
    ];

    #[test]
    fn roundtrip_every_mode() {
        let payloads: &[Vec<u8>] = &[
            Vec::new(),
            b"tiny".to_vec(),
            vec![0x41; 2048],
            vec![0x41; 8192],
            (0..8192u32).flat_map(|i| i.to_le_bytes()).collect(),
        ];
        for &mode in &ALL_MODES {
            for payload in payloads {
                let packed = compress_chunk(payload, mode).unwrap();
                assert_eq!(&uncompress_chunk(&packed).unwrap(), payload);
            }
        }
    }

    #[test]
    fn no_mode_stores_verbatim() {
        let packed = compress_chunk(b"abc", CompressionMode::No).unwrap();
        assert_eq!(packed, b"\x00abc");
    }

    #[test]
    fn auto_skips_tiny_chunks() {
        let packed = compress_chunk(&[0u8; 64], CompressionMode::Auto).unwrap();
        assert_eq!(packed[0], CompressionType::NoCompression as u8);
    }

    #[test]
    fn auto_compresses_redundant_chunks() {
        let packed = compress_chunk(&vec![0u8; 65536], CompressionMode::Auto).unwrap();
        assert_eq!(packed[0], CompressionType::Zlib as u8);
        assert!(packed.len() < 65536);
    }

    #[test]
    fn slow_falls_back_on_incompressible_data() {
        // High-entropy data deflates to something larger; SLOW must store it raw.
        let data: Vec<u8> = (0..4096u64)
            .flat_map(|i| (i.wrapping_mul(0x9E3779B97F4A7C15)).to_le_bytes())
            .collect();
        let packed = compress_chunk(&data, CompressionMode::Slow).unwrap();
        assert_eq!(packed[0], CompressionType::NoCompression as u8);
        assert_eq!(packed.len(), data.len() + 1);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            uncompress_chunk(&[9, 1, 2, 3]),
            Err(PackratError::UnknownCompressionTag(9))
        ));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(uncompress_chunk(&[]).is_err());
    }
}
