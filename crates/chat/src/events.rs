//! Operator notifications published by the background services.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::sync::broadcast;

use crate::session::{Direction, SessionId};

/// Capacity of the event channel. Slow subscribers lag rather than block.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the operator should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A peer announced itself for the first time.
    PeerDiscovered { name: String, addr: SocketAddr },
    /// A connection request was queued.
    RequestReceived { name: String, host: IpAddr },
    /// A chat session became active.
    SessionOpened {
        id: SessionId,
        peer: String,
        direction: Direction,
    },
    /// A chat line was received and opened.
    MessageReceived {
        session: SessionId,
        peer: String,
        text: String,
    },
    /// A chat session ended.
    SessionClosed {
        id: SessionId,
        peer: String,
        reason: String,
    },
    /// A background service stopped.
    ServiceFailed {
        service: &'static str,
        error: String,
    },
}

impl fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatEvent::PeerDiscovered { name, addr } => {
                write!(f, "[INFO] {} is online at {}", name, addr)
            }
            ChatEvent::RequestReceived { name, .. } => write!(
                f,
                "[INFO] New connection request from {}. Check 'Handle connection requests'.",
                name
            ),
            ChatEvent::SessionOpened {
                id,
                peer,
                direction,
            } => write!(f, "[INFO] Chat #{} with {} opened ({})", id, peer, direction),
            ChatEvent::MessageReceived { peer, text, .. } => {
                write!(f, "[CHAT] {}: {}", peer, text)
            }
            ChatEvent::SessionClosed { id, peer, reason } => {
                write!(f, "[INFO] Chat #{} with {} ended: {}", id, peer, reason)
            }
            ChatEvent::ServiceFailed { service, error } => {
                write!(f, "[ERROR] {} stopped: {}", service, error)
            }
        }
    }
}

/// Creates the event channel shared by all services.
pub fn channel() -> broadcast::Sender<ChatEvent> {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}
