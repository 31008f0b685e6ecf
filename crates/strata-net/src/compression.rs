//! LZ4 compression of chunk payloads behind a one-byte flag.
//!
//! Fragment payloads are dominated by runs of identical palette indices, so
//! whole-blob LZ4 pays off for all but near-empty chunks. Blobs under the
//! threshold are stored raw under [`COMPRESSION_FLAG_NONE`].

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Body is `lz4_flex` block format with a little-endian `u32` size prefix.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Largest size a compressed payload may claim to expand to.
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Blobs shorter than this are sent raw. Default: 256.
    pub threshold: usize,
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
        }
    }
}

impl CompressionConfig {
    fn should_compress(&self, len: usize) -> bool {
        self.enabled && len >= self.threshold
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("empty payload, no compression flag")]
    EmptyPayload,
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
    #[error("payload claims {0} bytes uncompressed")]
    TooLarge(usize),
}

/// Flag byte followed by `data`, LZ4-compressed when the config asks for it.
pub fn compress_payload(data: &[u8], config: &CompressionConfig) -> Vec<u8> {
    let (flag, body) = if config.should_compress(data.len()) {
        (COMPRESSION_FLAG_LZ4, compress_prepend_size(data))
    } else {
        (COMPRESSION_FLAG_NONE, data.to_vec())
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(flag);
    out.extend_from_slice(&body);
    out
}

/// Inverse of [`compress_payload`].
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&flag, body) = data.split_first().ok_or(CompressionError::EmptyPayload)?;
    match flag {
        COMPRESSION_FLAG_NONE => Ok(body.to_vec()),
        COMPRESSION_FLAG_LZ4 => {
            let claimed = body
                .first_chunk::<4>()
                .map(|size| u32::from_le_bytes(*size) as usize)
                .ok_or_else(|| CompressionError::DecompressFailed("missing size prefix".into()))?;
            if claimed > MAX_DECOMPRESSED_SIZE {
                return Err(CompressionError::TooLarge(claimed));
            }
            decompress_size_prepended(body)
                .map_err(|e| CompressionError::DecompressFailed(e.to_string()))
        }
        other => Err(CompressionError::UnknownFlag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shaped like a mostly-air fragment payload: long runs of few values.
    fn chunk_like_payload() -> Vec<u8> {
        let mut data = vec![0u8; 16_384];
        data.extend(std::iter::repeat_n(1u8, 8_192));
        data.extend((0..8_192u32).map(|i| (i / 512) as u8));
        data
    }

    #[test]
    fn test_threshold_selects_flag() {
        let config = CompressionConfig {
            threshold: 10,
            enabled: true,
        };
        let raw = compress_payload(b"tiny", &config);
        assert_eq!(raw, [&[COMPRESSION_FLAG_NONE][..], &b"tiny"[..]].concat());

        let packed = compress_payload(&[5u8; 64], &config);
        assert_eq!(packed[0], COMPRESSION_FLAG_LZ4);
        assert_eq!(decompress_payload(&packed).unwrap(), vec![5u8; 64]);
    }

    #[test]
    fn test_disabled_never_compresses() {
        let config = CompressionConfig {
            threshold: 0,
            enabled: false,
        };
        let data = chunk_like_payload();
        let payload = compress_payload(&data, &config);
        assert_eq!(payload[0], COMPRESSION_FLAG_NONE);
        assert_eq!(payload.len(), data.len() + 1);
    }

    #[test]
    fn test_chunk_payload_shrinks() {
        let data = chunk_like_payload();
        let payload = compress_payload(&data, &CompressionConfig::default());
        assert_eq!(payload[0], COMPRESSION_FLAG_LZ4);
        assert!(
            payload.len() * 4 < data.len(),
            "{} bytes compressed to {}",
            data.len(),
            payload.len()
        );
        assert_eq!(decompress_payload(&payload).unwrap(), data);
    }

    #[test]
    fn test_empty_and_unknown_flag() {
        assert!(matches!(
            decompress_payload(&[]),
            Err(CompressionError::EmptyPayload)
        ));
        assert!(matches!(
            decompress_payload(&[0x7F, 1, 2]),
            Err(CompressionError::UnknownFlag(0x7F))
        ));
    }

    #[test]
    fn test_corrupt_body_is_an_error() {
        let payload = [COMPRESSION_FLAG_LZ4, 10, 0, 0, 0, 0xFF];
        assert!(matches!(
            decompress_payload(&payload),
            Err(CompressionError::DecompressFailed(_))
        ));
        assert!(matches!(
            decompress_payload(&[COMPRESSION_FLAG_LZ4, 1]),
            Err(CompressionError::DecompressFailed(_))
        ));
    }

    #[test]
    fn test_oversized_claim_rejected() {
        let payload = [COMPRESSION_FLAG_LZ4, 0xFF, 0xFF, 0xFF, 0x7F, 0x00];
        assert!(matches!(
            decompress_payload(&payload),
            Err(CompressionError::TooLarge(_))
        ));
    }
}
