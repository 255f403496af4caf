use crate::error::{ProtocolError, ServerErrorKind};

pub const MAGIC_V2: &[u8] = b"  V2";

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR: i32 = 1;
const FRAME_TYPE_MESSAGE: i32 = 2;

const MESSAGE_HEADER_SIZE: usize = 8 + 2 + 16; // timestamp + attempts + id

/// A decoded server frame, already stripped of its own length prefix (that
/// prefix is consumed by the length-delimited reader in `nsq-net` before
/// the frame body ever reaches this crate).
pub enum Frame {
    Response(Vec<u8>),
    Error(ServerErrorKind),
    Message(RawMessage),
}

/// The wire shape of a `MESSAGE` frame, not yet the public `Message` type
/// `nsq-core` hands to message handlers — this just mirrors what is on the
/// wire, byte for byte.
pub struct RawMessage {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; 16],
    pub body: Vec<u8>,
}

/// Decodes a complete frame body (the 4-byte frame-type tag plus payload)
/// into a `Frame`. The caller has already stripped the 4-byte frame length
/// prefix.
pub fn decode_frame(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::FrameTooShort { got: data.len(), need: 4 });
    }
    let frame_type = i32::from_be_bytes(data[..4].try_into().unwrap());
    let payload = &data[4..];

    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(payload.to_vec())),
        FRAME_TYPE_ERROR => Ok(Frame::Error(ServerErrorKind::from_body(payload))),
        FRAME_TYPE_MESSAGE => decode_message(payload).map(Frame::Message),
        other => Err(ProtocolError::UnknownFrameType(other)),
    }
}

fn decode_message(data: &[u8]) -> Result<RawMessage, ProtocolError> {
    if data.len() < MESSAGE_HEADER_SIZE {
        return Err(ProtocolError::FrameTooShort { got: data.len(), need: MESSAGE_HEADER_SIZE });
    }
    let timestamp = i64::from_be_bytes(data[0..8].try_into().unwrap());
    let attempts = u16::from_be_bytes(data[8..10].try_into().unwrap());
    let mut id = [0u8; 16];
    id.copy_from_slice(&data[10..26]);
    let body = data[26..].to_vec();
    Ok(RawMessage { timestamp, attempts, id, body })
}

/// `true` when a response frame's payload is the legacy bare `"OK"`, as
/// opposed to an IDENTIFY negotiation's JSON body.
pub fn is_ok_response(payload: &[u8]) -> bool {
    payload == b"OK"
}

/// `true` when a response frame's payload is the heartbeat sentinel, which
/// the client must answer with `NOP` rather than treat as a real response.
pub fn is_heartbeat(payload: &[u8]) -> bool {
    payload == b"_heartbeat_"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(frame_type: i32, payload: &[u8]) -> Vec<u8> {
        let mut buf = frame_type.to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn decodes_response_frame() {
        let data = frame_bytes(FRAME_TYPE_RESPONSE, b"OK");
        match decode_frame(&data).unwrap() {
            Frame::Response(payload) => assert!(is_ok_response(&payload)),
            _ => panic!("expected Response"),
        }
    }

    #[test]
    fn decodes_error_frame() {
        let data = frame_bytes(FRAME_TYPE_ERROR, b"E_INVALID bad command");
        match decode_frame(&data).unwrap() {
            Frame::Error(kind) => assert!(kind.is_fatal()),
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn decodes_message_frame() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&123_i64.to_be_bytes());
        payload.extend_from_slice(&1_u16.to_be_bytes());
        payload.extend_from_slice(&[7u8; 16]);
        payload.extend_from_slice(b"hello");

        let data = frame_bytes(FRAME_TYPE_MESSAGE, &payload);
        match decode_frame(&data).unwrap() {
            Frame::Message(msg) => {
                assert_eq!(msg.timestamp, 123);
                assert_eq!(msg.attempts, 1);
                assert_eq!(msg.id, [7u8; 16]);
                assert_eq!(msg.body, b"hello");
            }
            _ => panic!("expected Message"),
        }
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let data = frame_bytes(99, b"");
        assert!(decode_frame(&data).is_err());
    }
}
