//! Chunk codec — record framing and chunk-level encode/decode.
//!
//! # On-disk chunk frame
//!
//! ```text
//! Offset  Size  Field
//!    0      1   flavor       ChecksumFlavor, or 0 at a zero-padded tail
//!    1      4   length L     big-endian u32, length of payload
//!    5      L   payload      compression tag + (orig_len) + body
//!  5+L      4   checksum     little-endian u32, digest(flavor, payload)
//! ```
//!
//! `payload` is itself `[compression_tag: u8]` followed by, when the tag is
//! not `None`, an 8-byte little-endian original (decompressed) length and
//! the compressed bytes; when `None`, the tag is followed directly by the
//! serialized record body.
//!
//! # On-disk record (within a chunk body)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   serial   LE u64
//!    8      4   lid      LE u32
//!   12      4   len      LE u32
//!   16      len bytes    payload (empty means a logical remove)
//! ```
//!
//! Grounded on `block.rs`'s `encode_block`/`decode_block` framing style
//! (build a flat buffer, checksum it, verify before trusting any other
//! field) generalized from a single fixed header to a variable-count
//! record body.

use crate::config::{ChecksumFlavor, CompressionAlgo, MAX_TRUNCATION_SENTINEL};
use crate::crc;
use crate::error::{Result, StoreError};

/// Fixed per-record framing overhead: serial(8) + lid(4) + len(4).
pub const RECORD_HEADER_SIZE: usize = 16;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_LZ4: u8 = 1;
const COMPRESSION_ZSTD: u8 = 2;

/// A single `(serial, lid, payload)` record, decoded out of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub serial: u64,
    pub lid: u32,
    pub bytes: Vec<u8>,
}

impl Record {
    pub fn is_remove(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes this record occupies once framed — used for bloat/footprint
    /// accounting in the lid directory.
    pub fn framed_size(&self) -> u32 {
        (RECORD_HEADER_SIZE + self.bytes.len()) as u32
    }
}

/// Append the on-disk framing of `(serial, lid, bytes)` to `out`.
///
/// Constant-time in `bytes.len()`; fails with `InvalidArgument` if `bytes`
/// does not fit in the 32-bit record length field.
pub fn encode_record(serial: u64, lid: u32, bytes: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if bytes.len() > u32::MAX as usize {
        return Err(StoreError::InvalidArgument(format!(
            "record payload {} bytes exceeds the 32-bit length field",
            bytes.len()
        )));
    }
    out.reserve(RECORD_HEADER_SIZE + bytes.len());
    out.extend_from_slice(&serial.to_le_bytes());
    out.extend_from_slice(&lid.to_le_bytes());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Decode one record from the front of `buf`, returning it plus the number
/// of bytes consumed.
fn decode_record(buf: &[u8]) -> Result<(Record, usize)> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(StoreError::ShortRead {
            expected: RECORD_HEADER_SIZE,
            actual: buf.len(),
        });
    }
    let serial = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let lid = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let len = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
    let total = RECORD_HEADER_SIZE + len;
    if buf.len() < total {
        return Err(StoreError::ShortRead {
            expected: total,
            actual: buf.len(),
        });
    }
    let bytes = buf[RECORD_HEADER_SIZE..total].to_vec();
    Ok((Record { serial, lid, bytes }, total))
}

/// Encode a non-empty batch of records as one framed chunk.
///
/// Fails with `InvalidArgument` if `records` is empty — a chunk always
/// describes at least one record.
pub fn encode_chunk(
    records: &[Record],
    compression: CompressionAlgo,
    flavor: ChecksumFlavor,
) -> Result<Vec<u8>> {
    if records.is_empty() {
        return Err(StoreError::InvalidArgument(
            "cannot encode an empty chunk".into(),
        ));
    }

    let mut body = Vec::new();
    for r in records {
        encode_record(r.serial, r.lid, &r.bytes, &mut body)?;
    }

    let payload = match compression {
        CompressionAlgo::None => {
            let mut p = Vec::with_capacity(1 + body.len());
            p.push(COMPRESSION_NONE);
            p.extend_from_slice(&body);
            p
        }
        CompressionAlgo::Lz4 => {
            let compressed = lz4_flex::block::compress(&body);
            let mut p = Vec::with_capacity(9 + compressed.len());
            p.push(COMPRESSION_LZ4);
            p.extend_from_slice(&(body.len() as u64).to_le_bytes());
            p.extend_from_slice(&compressed);
            p
        }
        CompressionAlgo::Zstd => {
            let compressed = zstd::bulk::compress(&body, 0)
                .map_err(|e| StoreError::InvalidState(format!("zstd compress failed: {e}")))?;
            let mut p = Vec::with_capacity(9 + compressed.len());
            p.push(COMPRESSION_ZSTD);
            p.extend_from_slice(&(body.len() as u64).to_le_bytes());
            p.extend_from_slice(&compressed);
            p
        }
    };

    if payload.len() > u32::MAX as usize {
        return Err(StoreError::InvalidArgument(
            "encoded chunk exceeds the 32-bit frame length field".into(),
        ));
    }

    let mut frame = Vec::with_capacity(1 + 4 + payload.len() + 4);
    frame.push(flavor.as_u8());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc::digest(flavor, &payload).to_le_bytes());
    Ok(frame)
}

/// Result of examining the first few bytes of a would-be chunk frame.
pub enum Peek {
    /// The full frame is `len` bytes long, including flavor/length/checksum.
    Length(usize),
    /// Fewer than 5 bytes are available; the caller should supply more.
    NeedMore,
}

/// Inspect only the frame's flavor + length prefix.
pub fn peek_length(input: &[u8]) -> Peek {
    if input.len() < 5 {
        return Peek::NeedMore;
    }
    let l = u32::from_be_bytes(input[1..5].try_into().unwrap()) as usize;
    Peek::Length(5 + l + 4)
}

/// A frame whose flavor and length bytes are both zero, with the remaining
/// bytes (up to `MAX_TRUNCATION_SENTINEL`) also zero, is a zero-padded tail
/// left behind by a crash mid-write — not corruption.
pub fn is_zero_tail(tail: &[u8]) -> bool {
    tail.len() <= MAX_TRUNCATION_SENTINEL && tail.iter().all(|&b| b == 0)
}

/// Verify checksum (unless `skip_crc`), decompress, and split a chunk frame
/// back into its records.
pub fn decode_chunk(frame: &[u8], skip_crc: bool) -> Result<Vec<Record>> {
    if frame.len() < 5 {
        return Err(StoreError::ShortRead {
            expected: 5,
            actual: frame.len(),
        });
    }
    let flavor_byte = frame[0];
    let length = u32::from_be_bytes(frame[1..5].try_into().unwrap()) as usize;
    let total = 5 + length + 4;
    if frame.len() < total {
        return Err(StoreError::ShortRead {
            expected: total,
            actual: frame.len(),
        });
    }
    let flavor = ChecksumFlavor::from_u8(flavor_byte)
        .ok_or_else(|| StoreError::UnknownFormat(format!("unrecognized CRC flavor byte {flavor_byte}")))?;

    let payload = &frame[5..5 + length];
    let stored_checksum = u32::from_le_bytes(frame[5 + length..total].try_into().unwrap());
    if !skip_crc {
        crc::verify(flavor, payload, stored_checksum)
            .map_err(|(expected, actual)| StoreError::BadChecksum { expected, actual })?;
    }

    if payload.is_empty() {
        return Err(StoreError::ShortRead {
            expected: 1,
            actual: 0,
        });
    }
    let tag = payload[0];
    let body = match tag {
        COMPRESSION_NONE => payload[1..].to_vec(),
        COMPRESSION_LZ4 => {
            if payload.len() < 9 {
                return Err(StoreError::ShortRead {
                    expected: 9,
                    actual: payload.len(),
                });
            }
            let orig_len = u64::from_le_bytes(payload[1..9].try_into().unwrap()) as usize;
            let decompressed = lz4_flex::block::decompress(&payload[9..], orig_len)
                .map_err(|e| StoreError::Corrupt(format!("lz4 decompress failed: {e}")))?;
            if decompressed.len() != orig_len {
                return Err(StoreError::Corrupt(format!(
                    "decompressed size {} disagrees with encoded length {orig_len}",
                    decompressed.len()
                )));
            }
            decompressed
        }
        COMPRESSION_ZSTD => {
            if payload.len() < 9 {
                return Err(StoreError::ShortRead {
                    expected: 9,
                    actual: payload.len(),
                });
            }
            let orig_len = u64::from_le_bytes(payload[1..9].try_into().unwrap()) as usize;
            let decompressed = zstd::bulk::decompress(&payload[9..], orig_len)
                .map_err(|e| StoreError::Corrupt(format!("zstd decompress failed: {e}")))?;
            if decompressed.len() != orig_len {
                return Err(StoreError::Corrupt(format!(
                    "decompressed size {} disagrees with encoded length {orig_len}",
                    decompressed.len()
                )));
            }
            decompressed
        }
        other => {
            return Err(StoreError::UnknownFormat(format!(
                "unrecognized compression tag {other}"
            )))
        }
    };

    let mut records = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let (record, consumed) = decode_record(&body[pos..])?;
        records.push(record);
        pos += consumed;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(serial: u64, lid: u32, bytes: &[u8]) -> Record {
        Record {
            serial,
            lid,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn round_trip_uncompressed() {
        let records = vec![rec(1, 10, b"hello"), rec(2, 11, b"world")];
        let frame =
            encode_chunk(&records, CompressionAlgo::None, ChecksumFlavor::CcittCrc32).unwrap();
        let decoded = decode_chunk(&frame, false).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn round_trip_lz4() {
        let records = vec![rec(1, 10, &[7u8; 500]), rec(2, 11, b"world")];
        let frame = encode_chunk(&records, CompressionAlgo::Lz4, ChecksumFlavor::Xxh64).unwrap();
        let decoded = decode_chunk(&frame, false).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn round_trip_zstd() {
        let records = vec![rec(5, 1, &[1u8; 4096])];
        let frame = encode_chunk(
            &records,
            CompressionAlgo::Zstd,
            ChecksumFlavor::CcittCrc32,
        )
        .unwrap();
        let decoded = decode_chunk(&frame, false).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn empty_chunk_rejected() {
        let err = encode_chunk(&[], CompressionAlgo::None, ChecksumFlavor::CcittCrc32).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn bad_checksum_detected() {
        let records = vec![rec(1, 10, b"hello")];
        let mut frame =
            encode_chunk(&records, CompressionAlgo::None, ChecksumFlavor::CcittCrc32).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = decode_chunk(&frame, false).unwrap_err();
        assert!(matches!(err, StoreError::BadChecksum { .. }));
    }

    #[test]
    fn zero_tail_is_not_corruption() {
        let tail = vec![0u8; 4096];
        assert!(is_zero_tail(&tail));
        let mut dirty = tail.clone();
        dirty[100] = 1;
        assert!(!is_zero_tail(&dirty));
    }

    #[test]
    fn peek_length_needs_more() {
        assert!(matches!(peek_length(&[1, 2, 3]), Peek::NeedMore));
    }
}
