//! Discovery datagram record.
//!
//! Every peer periodically broadcasts one [`Announcement`] as compact JSON,
//! for example `{"username":"alice","port":50123}`. The sender's IP address
//! is taken from the datagram itself, not from the record.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default UDP port used for discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 54545;

/// Receive buffer large enough for any announcement.
pub const MAX_ANNOUNCEMENT_SIZE: usize = 1024;

/// Presence announcement: who is broadcasting and where they accept chats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Announcement {
    /// Self-chosen display name of the peer.
    pub username: String,
    /// TCP port of the peer's connection server.
    pub port: u16,
}

impl Announcement {
    pub fn new(username: impl Into<String>, port: u16) -> Self {
        Self {
            username: username.into(),
            port,
        }
    }

    /// Serialize to the datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_ANNOUNCEMENT_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_ANNOUNCEMENT_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Parse a received datagram payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let announcement: Announcement = serde_json::from_slice(bytes)?;
        if announcement.username.trim().is_empty() {
            return Err(ProtocolError::Decode(
                "announcement username is empty".to_string(),
            ));
        }
        Ok(announcement)
    }
}
