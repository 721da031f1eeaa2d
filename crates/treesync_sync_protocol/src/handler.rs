//! Frame-level seam between clients and an authority.

use crate::error::ProtocolResult;
use crate::messages::{ErrorCode, SyncRequest, SyncResponse};
use treesync_codec::{Decode, Encode};

/// Something that answers encoded request frames with encoded response
/// frames.
///
/// Implementations never fail at this level: a frame that cannot be
/// decoded is answered with an [`ErrorCode::BadRequest`] response.
pub trait FrameHandler: Send + Sync {
    /// Handles one request frame.
    fn handle_frame(&self, frame: &[u8]) -> Vec<u8>;
}

/// Encodes a request frame.
///
/// # Errors
///
/// Returns a codec error if the request cannot be serialized.
pub fn encode_request(request: &SyncRequest) -> ProtocolResult<Vec<u8>> {
    Ok(request.encode()?)
}

/// Decodes a request frame.
///
/// # Errors
///
/// Returns a codec error on malformed frames.
pub fn decode_request(frame: &[u8]) -> ProtocolResult<SyncRequest> {
    Ok(SyncRequest::decode(frame)?)
}

/// Encodes a response frame. A response that cannot be encoded is replaced
/// by an encodable error response.
#[must_use]
pub fn encode_response(response: &SyncResponse) -> Vec<u8> {
    match response.encode() {
        Ok(bytes) => bytes,
        Err(err) => SyncResponse::error(ErrorCode::BadRequest, err.to_string())
            .encode()
            .unwrap_or_default(),
    }
}

/// Decodes a response frame.
///
/// # Errors
///
/// Returns a codec error on malformed frames.
pub fn decode_response(frame: &[u8]) -> ProtocolResult<SyncResponse> {
    Ok(SyncResponse::decode(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{OutboundChange, SessionId};
    use treesync_core::{ChangeOp, LogicalTimestamp, Node, NodeRecord, SequenceNumber};

    struct Echo;

    impl FrameHandler for Echo {
        fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
            match decode_request(frame) {
                Ok(request) => encode_response(&SyncResponse::error(
                    ErrorCode::BadRequest,
                    request.kind(),
                )),
                Err(err) => encode_response(&SyncResponse::error(
                    ErrorCode::BadRequest,
                    err.to_string(),
                )),
            }
        }
    }

    #[test]
    fn push_frame_survives_the_wire() {
        let node = Node::new_child("alice".into(), "hello");
        let request = SyncRequest::Push {
            session: SessionId(1),
            changes: vec![OutboundChange {
                seq: SequenceNumber::new(4),
                op: ChangeOp::Upsert(NodeRecord::created_at(&node, LogicalTimestamp::new(2, 3))),
            }],
        };
        let frame = encode_request(&request).unwrap();
        assert_eq!(decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn handler_answers_garbage_with_bad_request() {
        let reply = decode_response(&Echo.handle_frame(&[0xff, 0x00])).unwrap();
        assert!(matches!(
            reply,
            SyncResponse::Error {
                code: ErrorCode::BadRequest,
                ..
            }
        ));
    }

    #[test]
    fn handler_sees_decoded_request() {
        let frame = encode_request(&SyncRequest::Ack {
            session: SessionId(2),
            cursor: 10,
        })
        .unwrap();
        let reply = decode_response(&Echo.handle_frame(&frame)).unwrap();
        assert_eq!(reply, SyncResponse::error(ErrorCode::BadRequest, "ack"));
    }
}
