//! # TreeSync Codec
//!
//! CBOR encoding for everything TreeSync writes to disk or to the wire:
//! log records, snapshots and sync protocol frames.
//!
//! Types opt in through serde; this crate pins the format (CBOR via
//! `ciborium`) and maps its errors into [`CodecError`].
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use treesync_codec::{from_cbor, to_cbor};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Ping {
//!     seq: u64,
//! }
//!
//! let bytes = to_cbor(&Ping { seq: 7 }).unwrap();
//! let back: Ping = from_cbor(&bytes).unwrap();
//! assert_eq!(back, Ping { seq: 7 });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;

pub use error::{CodecError, CodecResult};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as CBOR.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the value cannot be serialized.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR value.
///
/// Trailing bytes after the first complete item are rejected so that a
/// frame can never silently carry extra data.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] on malformed input and
/// [`CodecError::TrailingBytes`] if input remains after the value.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let mut reader = bytes;
    let value =
        ciborium::de::from_reader(&mut reader).map_err(|e| CodecError::Decode(e.to_string()))?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes(reader.len()));
    }
    Ok(value)
}

/// Types that encode themselves as CBOR.
pub trait Encode {
    /// Encodes `self`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Types that decode themselves from CBOR.
pub trait Decode: Sized {
    /// Decodes a value from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl<T: Serialize> Encode for T {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl<T: DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Message {
        Hello { name: String },
        Batch(Vec<u64>),
        Ack,
    }

    #[test]
    fn enum_variants_roundtrip() {
        for message in [
            Message::Hello {
                name: "alice".into(),
            },
            Message::Batch(vec![1, 2, 3]),
            Message::Ack,
        ] {
            let bytes = message.encode().unwrap();
            assert_eq!(Message::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = to_cbor(&Message::Batch(vec![10, 20, 30])).unwrap();
        let result: CodecResult<Message> = from_cbor(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = to_cbor(&Message::Ack).unwrap();
        bytes.push(0x00);
        let result: CodecResult<Message> = from_cbor(&bytes);
        assert!(matches!(result, Err(CodecError::TrailingBytes(1))));
    }

    #[test]
    fn wrong_shape_is_an_error() {
        let bytes = to_cbor(&42u32).unwrap();
        let result: CodecResult<Message> = from_cbor(&bytes);
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn strings_survive_encoding(text in ".*") {
            let bytes = to_cbor(&text).unwrap();
            let back: String = from_cbor(&bytes).unwrap();
            prop_assert_eq!(back, text);
        }
    }
}
