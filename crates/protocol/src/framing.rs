//! Stream frame codec.
//!
//! # Frame Format
//!
//! Frames are single text lines, distinguished by a literal prefix:
//!
//! - `[REQUEST]:<name>\n`: one-shot connection proposal from peer `<name>`
//! - `[MESSAGE]<token>\n`: a sealed chat line (see [`crate::crypto`])
//!
//! A stream carries any number of frames; each ends at the first `\n`.
//! Decoding never fails: anything that does not match a known prefix is
//! [`Frame::Unknown`] and the caller decides what to do with it.

use crate::error::{ProtocolError, Result};

/// Prefix of a connection request frame.
pub const REQUEST_PREFIX: &str = "[REQUEST]:";

/// Prefix of a chat message frame.
pub const MESSAGE_PREFIX: &str = "[MESSAGE]";

/// Byte terminating every frame on a stream.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Maximum length of a single frame line, delimiter excluded (64 KiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// A decoded stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Peer `name` asks the local operator for a chat.
    Request {
        /// Announced name of the requester.
        name: String,
    },
    /// An opaque sealed chat line.
    Message {
        /// Text-safe token produced by `seal`.
        token: String,
    },
    /// Anything else.
    Unknown,
}

impl Frame {
    /// Short name of the frame kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "request",
            Frame::Message { .. } => "message",
            Frame::Unknown => "unknown",
        }
    }

    /// Encode this frame, delimiter included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Frame::Request { name } => encode_request(name),
            Frame::Message { token } => encode_message(token),
            Frame::Unknown => Err(ProtocolError::Encode(
                "unknown frames cannot be encoded".to_string(),
            )),
        }
    }
}

/// Encode a connection request from `name`.
pub fn encode_request(name: &str) -> Result<Vec<u8>> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ProtocolError::Encode(
            "request name must not be empty".to_string(),
        ));
    }
    encode_line(REQUEST_PREFIX, name)
}

/// Encode a sealed chat message token.
pub fn encode_message(token: &str) -> Result<Vec<u8>> {
    encode_line(MESSAGE_PREFIX, token)
}

fn encode_line(prefix: &str, body: &str) -> Result<Vec<u8>> {
    if body.contains(['\n', '\r']) {
        return Err(ProtocolError::Encode(format!(
            "{} frame body must not contain line breaks",
            prefix
        )));
    }

    let len = prefix.len() + body.len();
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut out = Vec::with_capacity(len + 1);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out.push(FRAME_DELIMITER);
    Ok(out)
}

/// Decode one frame.
///
/// Accepts the line with or without its trailing `\n` / `\r\n`.
pub fn decode(bytes: &[u8]) -> Frame {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);

    let Ok(line) = std::str::from_utf8(bytes) else {
        return Frame::Unknown;
    };

    if let Some(rest) = line.strip_prefix(REQUEST_PREFIX) {
        let name = rest.trim();
        if name.is_empty() {
            return Frame::Unknown;
        }
        return Frame::Request {
            name: name.to_string(),
        };
    }

    if let Some(rest) = line.strip_prefix(MESSAGE_PREFIX) {
        return Frame::Message {
            token: rest.trim().to_string(),
        };
    }

    Frame::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let encoded = encode_request("bob").unwrap();
        assert_eq!(encoded, b"[REQUEST]:bob\n");
        assert_eq!(
            decode(&encoded),
            Frame::Request {
                name: "bob".to_string()
            }
        );
    }

    #[test]
    fn test_message_roundtrip() {
        let token = "AQID-_abc";
        let encoded = encode_message(token).unwrap();
        assert_eq!(encoded, b"[MESSAGE]AQID-_abc\n");
        assert_eq!(
            decode(&encoded),
            Frame::Message {
                token: token.to_string()
            }
        );
    }

    #[test]
    fn test_decode_without_delimiter() {
        assert_eq!(
            decode(b"[REQUEST]:alice"),
            Frame::Request {
                name: "alice".to_string()
            }
        );
        assert_eq!(
            decode(b"[MESSAGE]tok\r\n"),
            Frame::Message {
                token: "tok".to_string()
            }
        );
    }

    #[test]
    fn test_request_name_is_trimmed() {
        assert_eq!(
            decode(b"[REQUEST]:  carol \n"),
            Frame::Request {
                name: "carol".to_string()
            }
        );
    }

    #[test]
    fn test_names_with_spaces_and_unicode() {
        let encoded = encode_request("María José").unwrap();
        assert_eq!(
            decode(&encoded),
            Frame::Request {
                name: "María José".to_string()
            }
        );
    }

    #[test]
    fn test_unrelated_bytes_are_unknown() {
        assert_eq!(decode(b""), Frame::Unknown);
        assert_eq!(decode(b"hello there"), Frame::Unknown);
        assert_eq!(decode(b"[REQUEST]bob"), Frame::Unknown);
        assert_eq!(decode(b"[REQUEST]:   "), Frame::Unknown);
        assert_eq!(decode(&[0xff, 0xfe, 0x00, 0x01]), Frame::Unknown);
        assert_eq!(decode(b"{\"username\":\"a\",\"port\":1}"), Frame::Unknown);
    }

    #[test]
    fn test_encode_rejects_line_breaks() {
        assert!(matches!(
            encode_request("bo\nb"),
            Err(ProtocolError::Encode(_))
        ));
        assert!(matches!(
            encode_message("to\rken"),
            Err(ProtocolError::Encode(_))
        ));
    }

    #[test]
    fn test_encode_rejects_empty_name() {
        assert!(matches!(encode_request("  "), Err(ProtocolError::Encode(_))));
    }

    #[test]
    fn test_encode_rejects_oversized_token() {
        let token = "a".repeat(MAX_FRAME_LEN);
        assert!(matches!(
            encode_message(&token),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_encode_dispatch() {
        let frame = Frame::Request {
            name: "dave".to_string(),
        };
        assert_eq!(decode(&frame.encode().unwrap()), frame);
        assert!(Frame::Unknown.encode().is_err());
        assert_eq!(frame.kind(), "request");
    }
}
