//! Shared table of discovered peers and pending connection requests.
//!
//! One [`PeerDirectory`] is created at startup and shared (`Arc`) by the
//! discovery listener, the connection server, the session manager and the
//! operator menu. Peers, pending requests and message counters all live behind
//! a single mutex; the lock is only held for the duration of a read or a
//! mutation, never across network I/O.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Errors returned by directory lookups and selections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// The operator picked a position outside the displayed list.
    #[error("invalid selection {index}: choose a number between 1 and {len}")]
    InvalidSelection {
        /// The 1-based position that was requested.
        index: usize,
        /// Number of entries that were available.
        len: usize,
    },

    /// No peer with this name has announced itself.
    #[error("unknown peer: {0}")]
    NotFound(String),
}

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Announced name. Unique within the directory; last announcement wins.
    pub name: String,
    /// Sender IP of the announcement.
    pub host: IpAddr,
    /// Announced connection server port.
    pub port: u16,
}

impl PeerRecord {
    /// Address of the peer's connection server.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}:{}", self.name, self.host, self.port)
    }
}

/// A connection request waiting for the operator's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Name the requester put in its REQUEST frame.
    pub requester_name: String,
    /// IP address the request arrived from.
    pub requester_host: IpAddr,
}

impl fmt::Display for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request from {} at {}",
            self.requester_name, self.requester_host
        )
    }
}

/// Process-wide chat counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageStats {
    /// Chat lines written to sessions.
    pub sent: u64,
    /// Chat lines received and opened successfully.
    pub received: u64,
}

#[derive(Debug, Default)]
struct Inner {
    peers: Vec<PeerRecord>,
    requests: Vec<ConnectionRequest>,
    stats: MessageStats,
}

/// Thread-safe directory of peers, pending requests and message counters.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    inner: Mutex<Inner>,
}

impl PeerDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    // Every operation is a short critical section that cannot leave the
    // tables half-updated, so a poisoned lock still holds consistent data.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Inserts a peer or replaces the record with the same name.
    ///
    /// A replaced peer keeps its position in [`list_peers`](Self::list_peers).
    /// Returns `true` if the name was not known before.
    pub fn upsert_peer(&self, name: &str, host: IpAddr, port: u16) -> bool {
        let record = PeerRecord {
            name: name.to_string(),
            host,
            port,
        };
        let mut inner = self.lock();
        match inner.peers.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                if *existing != record {
                    tracing::debug!(peer = %name, "Peer address changed to {}:{}", host, port);
                }
                *existing = record;
                false
            }
            None => {
                tracing::debug!(peer = %name, "Discovered peer at {}:{}", host, port);
                inner.peers.push(record);
                true
            }
        }
    }

    /// Snapshot of all known peers in first-seen order.
    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.lock().peers.clone()
    }

    /// Returns the peer at a 1-based position of [`list_peers`](Self::list_peers).
    pub fn peer_at(&self, index: usize) -> Result<PeerRecord, DirectoryError> {
        let inner = self.lock();
        select(&inner.peers, index).cloned()
    }

    /// Looks up a peer by name.
    pub fn lookup(&self, name: &str) -> Result<PeerRecord, DirectoryError> {
        self.lock()
            .peers
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    /// Finds the peer announcing from `host`.
    ///
    /// Returns `None` when several peers share the host, since the address
    /// alone cannot tell them apart.
    pub fn find_by_host(&self, host: IpAddr) -> Option<PeerRecord> {
        let inner = self.lock();
        let mut matches = inner.peers.iter().filter(|p| p.host == host);
        match (matches.next(), matches.next()) {
            (Some(peer), None) => Some(peer.clone()),
            _ => None,
        }
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    // =========================================================================
    // Pending requests
    // =========================================================================

    /// Appends a request to the pending queue.
    pub fn enqueue_request(&self, name: &str, host: IpAddr) {
        let mut inner = self.lock();
        inner.requests.push(ConnectionRequest {
            requester_name: name.to_string(),
            requester_host: host,
        });
        tracing::info!(
            peer = %name,
            pending = inner.requests.len(),
            "Queued connection request from {}",
            host
        );
    }

    /// Snapshot of pending requests in arrival order.
    pub fn list_requests(&self) -> Vec<ConnectionRequest> {
        self.lock().requests.clone()
    }

    /// Removes and returns the request at a 1-based position.
    ///
    /// The queue is left untouched when the position is out of range.
    pub fn take_request(&self, index: usize) -> Result<ConnectionRequest, DirectoryError> {
        let mut inner = self.lock();
        select(&inner.requests, index)?;
        Ok(inner.requests.remove(index - 1))
    }

    /// Number of pending requests.
    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Counts one chat line sent.
    pub fn record_sent(&self) {
        self.lock().stats.sent += 1;
    }

    /// Counts one chat line received.
    pub fn record_received(&self) {
        self.lock().stats.received += 1;
    }

    /// Current counter values.
    pub fn stats(&self) -> MessageStats {
        self.lock().stats
    }
}

fn select<T>(items: &[T], index: usize) -> Result<&T, DirectoryError> {
    index
        .checked_sub(1)
        .and_then(|i| items.get(i))
        .ok_or(DirectoryError::InvalidSelection {
            index,
            len: items.len(),
        })
}
