//! Payload codec — zlib compression with a CRC32 integrity header.
//!
//! Every chunk that travels over the packet channel is wrapped in a 4-byte
//! big-endian CRC32 of the *uncompressed* bytes followed by the zlib-compressed
//! payload. The receive side verifies the checksum before trusting the chunk.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::CodecError;

/// Size of the CRC32 integrity header in bytes.
pub const CRC_HEADER_SIZE: usize = 4;

/// A decoded payload and the result of its integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// The decompressed payload bytes.
    pub data: Vec<u8>,
    /// Whether the recomputed CRC32 matched the header.
    pub crc_ok: bool,
}

/// Encode a payload: CRC32 header over the raw input, then the
/// zlib-compressed bytes.
pub fn encode(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let crc = crc32fast::hash(data);

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + CRC_HEADER_SIZE), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Deflate(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CodecError::Deflate(e.to_string()))?;

    let mut out = Vec::with_capacity(CRC_HEADER_SIZE + compressed.len());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode an encoded payload and report whether its checksum held up.
///
/// Inputs shorter than the header or that fail inflation are decode errors;
/// a CRC mismatch is not an error, it is reported through [`Decoded::crc_ok`]
/// so the caller can answer with an inline error instead of crashing.
pub fn decode(encoded: &[u8]) -> Result<Decoded, CodecError> {
    if encoded.len() < CRC_HEADER_SIZE {
        return Err(CodecError::Truncated { len: encoded.len() });
    }

    let (header, compressed) = encoded.split_at(CRC_HEADER_SIZE);
    let expected = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);

    let mut data = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut data)
        .map_err(|e| CodecError::Inflate(e.to_string()))?;

    let crc_ok = crc32fast::hash(&data) == expected;
    Ok(Decoded { data, crc_ok })
}
