//! Checksummed frames.
//!
//! ```text
//! | magic (4) | version (2) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The checksum covers header and payload.

use crate::error::{CoreError, CoreResult};

/// Magic bytes of a write-ahead log frame.
pub const WAL_MAGIC: [u8; 4] = *b"TSWL";

/// Magic bytes of a snapshot frame.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"TSSN";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

const HEADER_LEN: usize = 10;
const TRAILER_LEN: usize = 4;

/// Wraps `payload` in a frame.
#[must_use]
pub fn encode_frame(magic: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    out.extend_from_slice(&magic);
    out.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let crc = compute_crc32(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Sequential reader over a buffer of frames.
///
/// A frame cut short by the end of the buffer is treated as a torn write
/// and ends iteration cleanly; [`FrameReader::torn`] then reports it. Bad
/// magic, an unknown version or a checksum mismatch are errors.
#[derive(Debug)]
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    magic: [u8; 4],
    torn: bool,
}

impl<'a> FrameReader<'a> {
    /// Creates a reader over `bytes` expecting frames tagged with `magic`.
    #[must_use]
    pub fn new(bytes: &'a [u8], magic: [u8; 4]) -> Self {
        Self {
            bytes,
            offset: 0,
            magic,
            torn: false,
        }
    }

    /// Offset just past the last complete frame.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    /// Whether iteration stopped at a partial frame.
    #[must_use]
    pub fn torn(&self) -> bool {
        self.torn
    }

    /// Returns the next payload, or `None` at the end of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] or [`CoreError::ChecksumMismatch`]
    /// if a complete frame is invalid.
    pub fn next_frame(&mut self) -> CoreResult<Option<&'a [u8]>> {
        let start = self.offset;
        let remaining = self.bytes.len() - start;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_LEN {
            self.torn = true;
            return Ok(None);
        }

        let header = &self.bytes[start..start + HEADER_LEN];
        if header[0..4] != self.magic {
            return Err(CoreError::log_corruption(start as u64, "bad frame magic"));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FRAME_VERSION {
            return Err(CoreError::log_corruption(
                start as u64,
                format!("unsupported frame version {version}"),
            ));
        }
        let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
        if remaining < HEADER_LEN + len + TRAILER_LEN {
            self.torn = true;
            return Ok(None);
        }

        let body_end = start + HEADER_LEN + len;
        let stored = &self.bytes[body_end..body_end + TRAILER_LEN];
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let actual = compute_crc32(&self.bytes[start..body_end]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch {
                offset: start as u64,
                expected,
                actual,
            });
        }

        self.offset = body_end + TRAILER_LEN;
        Ok(Some(&self.bytes[start + HEADER_LEN..body_end]))
    }
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn reads_back_consecutive_frames() {
        let mut buf = encode_frame(WAL_MAGIC, b"one");
        buf.extend(encode_frame(WAL_MAGIC, b"two"));

        let mut reader = FrameReader::new(&buf, WAL_MAGIC);
        assert_eq!(reader.next_frame().unwrap(), Some(&b"one"[..]));
        assert_eq!(reader.next_frame().unwrap(), Some(&b"two"[..]));
        assert_eq!(reader.next_frame().unwrap(), None);
        assert!(!reader.torn());
        assert_eq!(reader.offset(), buf.len() as u64);
    }

    #[test]
    fn partial_frame_is_a_torn_tail() {
        let first = encode_frame(WAL_MAGIC, b"complete");
        let mut buf = first.clone();
        let second = encode_frame(WAL_MAGIC, b"partial");
        buf.extend_from_slice(&second[..second.len() - 3]);

        let mut reader = FrameReader::new(&buf, WAL_MAGIC);
        assert!(reader.next_frame().unwrap().is_some());
        assert_eq!(reader.next_frame().unwrap(), None);
        assert!(reader.torn());
        assert_eq!(reader.offset(), first.len() as u64);
    }

    #[test]
    fn short_header_is_a_torn_tail() {
        let mut buf = encode_frame(WAL_MAGIC, b"x");
        buf.extend_from_slice(b"TSW");
        let mut reader = FrameReader::new(&buf, WAL_MAGIC);
        reader.next_frame().unwrap();
        assert_eq!(reader.next_frame().unwrap(), None);
        assert!(reader.torn());
    }

    #[test]
    fn flipped_payload_bit_is_fatal() {
        let mut buf = encode_frame(WAL_MAGIC, b"payload");
        buf[12] ^= 0x01;
        let mut reader = FrameReader::new(&buf, WAL_MAGIC);
        assert!(matches!(
            reader.next_frame(),
            Err(CoreError::ChecksumMismatch { offset: 0, .. })
        ));
    }

    #[test]
    fn wrong_magic_is_fatal() {
        let buf = encode_frame(SNAPSHOT_MAGIC, b"snapshot");
        let mut reader = FrameReader::new(&buf, WAL_MAGIC);
        assert!(matches!(
            reader.next_frame(),
            Err(CoreError::LogCorruption { .. })
        ));
    }
}
