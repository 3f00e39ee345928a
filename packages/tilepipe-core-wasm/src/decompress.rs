use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::io::{ErrorKind, Read, Write};

use crate::console_warn;
use crate::error::PipelineError;

/// Gzip magic number
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Read size used while inflating
pub const CHUNK_SIZE: usize = 4096;

/// Highest level accepted by `compress`
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

// Function to detect if data is gzipped (checking for gzip magic number)
pub fn is_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == GZIP_MAGIC[0] && data[1] == GZIP_MAGIC[1]
}

/// Inflate a gzip payload, or hand the input back untouched.
///
/// Buffers without the gzip marker are returned as-is (borrowed). If the
/// stream fails part way through, the partial output is discarded and the
/// original, still-compressed bytes are returned instead. Only the decoder's
/// I/O error is swallowed here.
pub fn decompress(data: &[u8]) -> Cow<'_, [u8]> {
    if !is_gzipped(data) {
        return Cow::Borrowed(data);
    }

    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::with_capacity(data.len() * 2);
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => decompressed.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                console_warn!(
                    "Failed to decompress gzipped tile ({} bytes), passing original through: {}",
                    data.len(),
                    e
                );
                return Cow::Borrowed(data);
            }
        }
    }

    Cow::Owned(decompressed)
}

/// Gzip `data` in one shot at `level` (0-9).
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, PipelineError> {
    if level > MAX_COMPRESSION_LEVEL {
        return Err(PipelineError::InvalidCompressionLevel(level));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| PipelineError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| PipelineError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn plain_bytes_pass_through_borrowed() {
        let data = b"\x1a\x05plain mvt bytes";
        let out = decompress(data);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, &data[..]);
    }

    #[test]
    fn short_buffers_pass_through() {
        assert_eq!(&*decompress(&[]), &[] as &[u8]);
        assert_eq!(&*decompress(&[0x1F]), &[0x1F]);
    }

    #[test]
    fn only_first_byte_matching_is_not_gzip() {
        let data = [0x1F, 0x8C, 0x08, 0x00];
        assert!(!is_gzipped(&data));
        assert_eq!(&*decompress(&data), &data[..]);
    }

    #[test]
    fn inflates_payload_larger_than_one_chunk() {
        let payload: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&payload, 6).unwrap();
        assert!(is_gzipped(&compressed));

        let out = decompress(&compressed);
        assert!(matches!(out, Cow::Owned(_)));
        assert_eq!(out.into_owned(), payload);
    }

    #[test]
    fn invalid_deflate_block_returns_original() {
        // valid gzip header followed by a deflate block with the reserved type
        let mut corrupt = vec![0x1F, 0x8B, 0x08, 0, 0, 0, 0, 0, 0, 0xFF];
        corrupt.extend_from_slice(&[0xFF; 32]);

        assert_eq!(&*decompress(&corrupt), &corrupt[..]);
    }

    #[test]
    fn checksum_mismatch_returns_original_not_partial() {
        let payload = b"building layer payload".repeat(50);
        let mut compressed = compress(&payload, 9).unwrap();
        let crc_offset = compressed.len() - 8;
        compressed[crc_offset] ^= 0xFF;

        let out = decompress(&compressed);
        assert_eq!(&*out, &compressed[..]);
    }

    #[test]
    fn truncated_stream_returns_original() {
        let payload: Vec<u8> = (0..CHUNK_SIZE * 2).map(|i| (i * 7 % 253) as u8).collect();
        let compressed = compress(&payload, 6).unwrap();
        let truncated = &compressed[..compressed.len() / 2];
        assert!(is_gzipped(truncated));

        let out = decompress(truncated);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, truncated);
    }

    #[test]
    fn rejects_unsupported_level() {
        assert_eq!(
            compress(b"abc", 10),
            Err(PipelineError::InvalidCompressionLevel(10))
        );
    }

    proptest! {
        #[test]
        fn round_trip_at_every_level(data in proptest::collection::vec(any::<u8>(), 0..2048), level in 0u32..=9) {
            let compressed = compress(&data, level).unwrap();
            prop_assert_eq!(decompress(&compressed).into_owned(), data);
        }

        #[test]
        fn non_gzip_input_is_identity(mut data in proptest::collection::vec(any::<u8>(), 0..512)) {
            if data.len() >= 2 && data[0] == 0x1F && data[1] == 0x8B {
                data[1] = 0x00;
            }
            prop_assert_eq!(&*decompress(&data), &data[..]);
        }
    }
}
