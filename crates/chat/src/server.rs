//! TCP connection server.
//!
//! Every accepted connection gets its own task. The first frame decides what
//! the connection is:
//!
//! - `REQUEST`: queued for the operator, connection closed
//! - `MESSAGE`: the connection becomes an inbound chat session
//! - anything else: logged and dropped

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{framing, Frame};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::session::connection::read_frame;
use crate::session::SessionManager;

/// Accepts chat connections from other peers.
pub struct ConnectionServer {
    listener: TcpListener,
    sessions: Arc<SessionManager>,
}

impl ConnectionServer {
    /// Bind the server to the given address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound. The caller treats this
    /// as fatal to the server only.
    pub async fn bind(addr: SocketAddr, sessions: Arc<SessionManager>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, sessions })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!("Connection server listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Connection server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let sessions = Arc::clone(&self.sessions);
                        tokio::spawn(async move {
                            handle_connection(stream, remote, sessions).await;
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                },
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, sessions: Arc<SessionManager>) {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    match read_frame(&mut reader, &mut buf).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("Connection from {} closed without data", remote);
            return;
        }
        Err(e) => {
            tracing::warn!("Error reading from {}: {}", remote, e);
            return;
        }
    }

    match framing::decode(&buf) {
        Frame::Request { name } => {
            sessions.queue_request(&name, remote.ip());
        }
        Frame::Message { token } => {
            sessions.serve_inbound(reader, writer, remote, &token).await;
        }
        Frame::Unknown => {
            tracing::error!("Unknown message received from {}", remote.ip());
        }
    }
}
