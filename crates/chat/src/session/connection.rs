//! A single chat session over one duplex TCP connection.
//!
//! Either side may write MESSAGE frames at any time; the read half is owned by
//! the session's receive loop (see [`super::manager`]).

use std::fmt;
use std::io;
use std::net::SocketAddr;

use protocol::{ProtocolError, FRAME_DELIMITER, MAX_FRAME_LEN};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::directory::DirectoryError;

/// Identifier of a session, unique for the lifetime of the process.
pub type SessionId = u64;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The operator's selection did not resolve to a peer or request.
    #[error(transparent)]
    Selection(#[from] DirectoryError),

    /// Could not reach the peer's connection server.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The connection failed mid-write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be built or sealed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No session with this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has already ended.
    #[error("session already closed: {0}")]
    Closed(SessionId),
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We accepted a request and connected out.
    Outbound,
    /// The peer connected to our server after we asked.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Snapshot of a session for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Name of the peer at the other end.
    pub peer_name: String,
    /// Address of the other end.
    pub remote_addr: SocketAddr,
    /// Who connected to whom.
    pub direction: Direction,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({}, {})",
            self.id, self.peer_name, self.remote_addr, self.direction
        )
    }
}

/// An active chat session.
pub struct Session {
    id: SessionId,
    peer_name: String,
    remote_addr: SocketAddr,
    direction: Direction,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl Session {
    /// Creates a session around the write half of a connection.
    ///
    /// The session is closed when `parent` is cancelled.
    pub(crate) fn new(
        id: SessionId,
        peer_name: String,
        remote_addr: SocketAddr,
        direction: Direction,
        writer: OwnedWriteHalf,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_name,
            remote_addr,
            direction,
            writer: Mutex::new(writer),
            closed: parent.child_token(),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the peer's name.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Returns the peer's address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns who opened the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Checks if the session is still open.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Completes once the session is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Returns a display snapshot.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer_name: self.peer_name.clone(),
            remote_addr: self.remote_addr,
            direction: self.direction,
        }
    }

    /// Writes one encoded frame.
    pub(crate) async fn write_frame(&self, frame: &[u8]) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed(self.id));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Marks the session closed and shuts down the write half.
    pub(crate) async fn shutdown(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(session_id = self.id, "Error shutting down connection: {}", e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_name", &self.peer_name)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Reads one frame line into `buf`, delimiter included.
///
/// Returns `Ok(false)` on a clean end of stream. A line longer than
/// [`MAX_FRAME_LEN`] is an error and the connection should be dropped.
pub(crate) async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<bool, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    // Room for the longest allowed line plus "\r\n".
    let limit = (MAX_FRAME_LEN + 2) as u64;
    let n = (&mut *reader)
        .take(limit)
        .read_until(FRAME_DELIMITER, buf)
        .await?;
    if n == 0 {
        return Ok(false);
    }

    let line: &[u8] = buf;
    let body = line.strip_suffix(b"\n").unwrap_or(line);
    let body = body.strip_suffix(b"\r").unwrap_or(body);
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_frame_splits_lines() {
        let data: &[u8] = b"[REQUEST]:bob\n[MESSAGE]abc\r\ntrailing";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert!(read_frame(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"[REQUEST]:bob\n");
        assert!(read_frame(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"[MESSAGE]abc\r\n");
        // A final line without delimiter is still delivered
        assert!(read_frame(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"trailing");
        assert!(!read_frame(&mut reader, &mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_frame_accepts_max_length() {
        let mut data = vec![b'x'; MAX_FRAME_LEN];
        data.push(b'\n');
        let mut reader = BufReader::new(data.as_slice());
        let mut buf = Vec::new();
        assert!(read_frame(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf.len(), MAX_FRAME_LEN + 1);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_line() {
        let mut data = vec![b'x'; MAX_FRAME_LEN + 10];
        data.push(b'\n');
        let mut reader = BufReader::new(data.as_slice());
        let mut buf = Vec::new();
        let err = read_frame(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Outbound.to_string(), "outbound");
        assert_eq!(Direction::Inbound.to_string(), "inbound");
    }

    #[test]
    fn test_session_error_messages() {
        let err = SessionError::from(DirectoryError::InvalidSelection { index: 5, len: 2 });
        assert_eq!(
            err.to_string(),
            "invalid selection 5: choose a number between 1 and 2"
        );
        assert_eq!(SessionError::NotFound(7).to_string(), "session not found: 7");
    }
}
