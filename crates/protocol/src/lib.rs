//! # LanChat Protocol Library
//!
//! Wire-level building blocks shared by every LanChat peer.
//!
//! ## Overview
//!
//! - **Discovery records**: the JSON [`Announcement`] each peer broadcasts
//! - **Stream frames**: `[REQUEST]:<name>` and `[MESSAGE]<token>` lines
//! - **Message sealing**: ChaCha20-Poly1305 under a shared [`ChatKey`]
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Chat text                  │  UTF-8
//! ├─────────────────────────────────────────┤
//! │         Confidentiality transform       │  ChaCha20-Poly1305, base64 token
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Prefixed, newline-delimited
//! ├─────────────────────────────────────────┤
//! │                TCP                      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{framing, ChatKey, Confidentiality, Frame, MessageCipher};
//!
//! let cipher = MessageCipher::new(&ChatKey::generate());
//! let token = cipher.seal(b"hello").unwrap();
//! let bytes = framing::encode_message(&token).unwrap();
//!
//! match framing::decode(&bytes) {
//!     Frame::Message { token } => assert_eq!(cipher.open(&token).unwrap(), b"hello"),
//!     other => panic!("unexpected frame {:?}", other),
//! }
//! ```

pub mod crypto;
pub mod discovery;
pub mod error;
pub mod framing;

pub use crypto::{ChatKey, Confidentiality, MessageCipher, KEY_LENGTH};
pub use discovery::{Announcement, DISCOVERY_PORT, MAX_ANNOUNCEMENT_SIZE};
pub use error::{ProtocolError, Result};
pub use framing::{
    decode, encode_message, encode_request, Frame, FRAME_DELIMITER, MAX_FRAME_LEN,
    MESSAGE_PREFIX, REQUEST_PREFIX,
};
