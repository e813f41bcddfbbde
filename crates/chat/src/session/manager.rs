//! Session manager: connection requests, accept/reject and active chats.
//!
//! The manager owns every open [`Session`] and the receive loop of each one.
//! Outbound sessions are created here when the operator accepts a request;
//! inbound sessions are handed over by the connection server when the first
//! frame on a connection is a MESSAGE.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::{framing, Confidentiality, Frame};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::action::ActionSource;
use super::connection::{read_frame, Direction, Session, SessionError, SessionId, SessionInfo};
use crate::directory::{ConnectionRequest, PeerDirectory, PeerRecord};
use crate::events::ChatEvent;

/// How the operator picked a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSelector {
    /// 1-based position in the peer list.
    Index(usize),
    /// Announced name.
    Name(String),
}

impl PeerSelector {
    /// Interprets operator input: a number is a list position, anything else a name.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        match input.parse::<usize>() {
            Ok(index) => PeerSelector::Index(index),
            Err(_) => PeerSelector::Name(input.to_string()),
        }
    }
}

/// The operator's answer to a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// Owns the lifecycle of all chat sessions.
pub struct SessionManager {
    /// Name sent in our REQUEST frames.
    username: String,
    directory: Arc<PeerDirectory>,
    cipher: Arc<dyn Confidentiality>,
    events: broadcast::Sender<ChatEvent>,
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Peers we asked for a chat, by host, until one of them connects back.
    awaiting_reply: DashMap<IpAddr, Vec<String>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Creates a new session manager.
    ///
    /// Every session is closed when `shutdown` is cancelled.
    pub fn new(
        username: impl Into<String>,
        directory: Arc<PeerDirectory>,
        cipher: Arc<dyn Confidentiality>,
        events: broadcast::Sender<ChatEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            username: username.into(),
            directory,
            cipher,
            events,
            sessions: DashMap::new(),
            awaiting_reply: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Returns the local username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the shared peer directory.
    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    // =========================================================================
    // Connection requests
    // =========================================================================

    /// Asks a discovered peer for a chat.
    ///
    /// Opens a short-lived connection to the peer's server, writes a REQUEST
    /// frame carrying our username and closes it. The peer's operator decides
    /// later; nothing is awaited here.
    pub async fn request_connection(
        &self,
        selector: &PeerSelector,
    ) -> Result<PeerRecord, SessionError> {
        let peer = match selector {
            PeerSelector::Index(index) => self.directory.peer_at(*index)?,
            PeerSelector::Name(name) => self.directory.lookup(name)?,
        };
        let frame = framing::encode_request(&self.username)?;

        let mut stream = connect(peer.addr()).await?;
        stream.write_all(&frame).await?;
        stream.shutdown().await?;

        {
            let mut names = self.awaiting_reply.entry(peer.host).or_default();
            if !names.contains(&peer.name) {
                names.push(peer.name.clone());
            }
        }

        tracing::info!(peer = %peer.name, "Sent connection request to {}", peer.addr());
        Ok(peer)
    }

    /// Pending requests in arrival order.
    pub fn pending_requests(&self) -> Vec<ConnectionRequest> {
        self.directory.list_requests()
    }

    /// Removes the pending request at a 1-based position.
    pub fn take_request(&self, index: usize) -> Result<ConnectionRequest, SessionError> {
        Ok(self.directory.take_request(index)?)
    }

    /// Accepts a request by connecting back to the requester.
    ///
    /// The requester must have announced itself, since the request only
    /// carries its host, not its server port.
    pub async fn accept_request(
        self: &Arc<Self>,
        request: ConnectionRequest,
    ) -> Result<SessionId, SessionError> {
        let peer = self.directory.lookup(&request.requester_name)?;
        let addr = SocketAddr::new(request.requester_host, peer.port);

        let stream = connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let session = self.register(peer.name, addr, Direction::Outbound, writer);

        let manager = Arc::clone(self);
        let receiving = Arc::clone(&session);
        tokio::spawn(async move {
            manager
                .receive_loop(receiving, BufReader::new(reader))
                .await;
        });

        Ok(session.id())
    }

    /// Discards a request without contacting the requester.
    pub fn reject_request(&self, request: ConnectionRequest) {
        tracing::info!(
            peer = %request.requester_name,
            "Rejected connection request from {}",
            request.requester_host
        );
    }

    /// Takes the request at `index` and applies the operator's decision.
    ///
    /// Returns the new session on acceptance.
    pub async fn resolve_request(
        self: &Arc<Self>,
        index: usize,
        decision: Decision,
    ) -> Result<Option<SessionId>, SessionError> {
        let request = self.take_request(index)?;
        match decision {
            Decision::Accept => self.accept_request(request).await.map(Some),
            Decision::Reject => {
                self.reject_request(request);
                Ok(None)
            }
        }
    }

    /// Queues a request received over the network and notifies the operator.
    pub(crate) fn queue_request(&self, name: &str, host: IpAddr) {
        self.directory.enqueue_request(name, host);
        self.emit(ChatEvent::RequestReceived {
            name: name.to_string(),
            host,
        });
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Runs an inbound session on a connection whose first frame was a MESSAGE.
    ///
    /// Delivers `first_token`, then keeps receiving until the connection ends.
    pub(crate) async fn serve_inbound(
        self: &Arc<Self>,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        remote: SocketAddr,
        first_token: &str,
    ) {
        let peer_name = self.inbound_peer_name(remote.ip());
        let session = self.register(peer_name, remote, Direction::Inbound, writer);
        self.deliver(&session, first_token);
        self.receive_loop(session, reader).await;
    }

    /// Names the peer behind an inbound connection from `host`.
    ///
    /// The peer we asked is preferred. Without a single candidate request the
    /// directory is consulted, and the address is the last resort.
    fn inbound_peer_name(&self, host: IpAddr) -> String {
        let answered = self
            .awaiting_reply
            .remove_if(&host, |_, names| names.len() == 1)
            .and_then(|(_, mut names)| names.pop());
        if let Some(name) = answered {
            return name;
        }

        self.directory
            .find_by_host(host)
            .map(|p| p.name)
            .unwrap_or_else(|| host.to_string())
    }

    /// Sends one chat line on a session.
    pub async fn send(&self, id: SessionId, text: &str) -> Result<(), SessionError> {
        let session = self.get(id)?;
        let token = self.cipher.seal(text.as_bytes())?;
        let frame = framing::encode_message(&token)?;

        if let Err(e) = session.write_frame(&frame).await {
            if matches!(e, SessionError::Io(_)) {
                self.finish(id, format!("write failed: {}", e)).await;
            }
            return Err(e);
        }

        self.directory.record_sent();
        tracing::debug!(session_id = id, peer = %session.peer_name(), "Sent chat message");
        Ok(())
    }

    /// Interactive chat loop.
    ///
    /// Pulls actions from `source` until it ends the chat or runs dry, the
    /// peer disconnects, or a send fails. The session is closed afterwards.
    pub async fn run_session<S: ActionSource>(
        &self,
        id: SessionId,
        source: &mut S,
    ) -> Result<(), SessionError> {
        let session = self.get(id)?;

        loop {
            let action = tokio::select! {
                action = source.next_action() => action,
                _ = session.closed() => return Ok(()),
            };
            let Some(text) = action.as_ref().and_then(|a| a.text()) else {
                break;
            };
            if let Err(e) = self.send(id, text).await {
                self.finish(id, format!("send failed: {}", e)).await;
                return Err(e);
            }
        }

        match self.close(id).await {
            Ok(()) | Err(SessionError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Ends a session and closes its connection.
    pub async fn close(&self, id: SessionId) -> Result<(), SessionError> {
        let (_, session) = self
            .sessions
            .remove(&id)
            .ok_or(SessionError::NotFound(id))?;
        session.shutdown().await;

        tracing::info!(session_id = id, peer = %session.peer_name(), "Chat ended by operator");
        self.emit(ChatEvent::SessionClosed {
            id,
            peer: session.peer_name().to_string(),
            reason: "ended by operator".to_string(),
        });
        Ok(())
    }

    /// Closes every open session.
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.finish(id, "shutting down".to_string()).await;
        }
    }

    /// Looks up an open session.
    pub fn get(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::NotFound(id))
    }

    /// Snapshot of open sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Returns the number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn register(
        &self,
        peer_name: String,
        remote: SocketAddr,
        direction: Direction,
        writer: OwnedWriteHalf,
    ) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            id,
            peer_name,
            remote,
            direction,
            writer,
            &self.shutdown,
        ));
        self.sessions.insert(id, Arc::clone(&session));

        tracing::info!(
            session_id = id,
            peer = %session.peer_name(),
            direction = %direction,
            "Chat session opened with {}",
            remote
        );
        self.emit(ChatEvent::SessionOpened {
            id,
            peer: session.peer_name().to_string(),
            direction,
        });
        session
    }

    async fn receive_loop(&self, session: Arc<Session>, mut reader: BufReader<OwnedReadHalf>) {
        let id = session.id();
        let mut buf = Vec::new();

        let reason = loop {
            let result = tokio::select! {
                _ = session.closed() => {
                    break if self.shutdown.is_cancelled() {
                        "shutting down".to_string()
                    } else {
                        "closed".to_string()
                    };
                }
                result = read_frame(&mut reader, &mut buf) => result,
            };

            match result {
                Ok(true) => {}
                Ok(false) => break "connection closed by peer".to_string(),
                Err(e) => break e.to_string(),
            }

            match framing::decode(&buf) {
                Frame::Message { token } => self.deliver(&session, &token),
                Frame::Request { name } => {
                    self.queue_request(&name, session.remote_addr().ip());
                }
                Frame::Unknown => {
                    tracing::warn!(
                        session_id = id,
                        "Unknown frame received from {}",
                        session.remote_addr()
                    );
                    break "unknown frame".to_string();
                }
            }
        };

        self.finish(id, reason).await;
    }

    fn deliver(&self, session: &Session, token: &str) {
        match self.cipher.open(token) {
            Ok(plaintext) => {
                self.directory.record_received();
                self.emit(ChatEvent::MessageReceived {
                    session: session.id(),
                    peer: session.peer_name().to_string(),
                    text: String::from_utf8_lossy(&plaintext).into_owned(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    session_id = session.id(),
                    peer = %session.peer_name(),
                    "Discarding message: {}",
                    e
                );
            }
        }
    }

    /// Removes a session after its connection ended. Notifies at most once.
    async fn finish(&self, id: SessionId, reason: String) {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return;
        };
        session.shutdown().await;

        tracing::info!(session_id = id, peer = %session.peer_name(), "Chat session closed: {}", reason);
        self.emit(ChatEvent::SessionClosed {
            id,
            peer: session.peer_name().to_string(),
            reason,
        });
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

async fn connect(addr: SocketAddr) -> Result<TcpStream, SessionError> {
    TcpStream::connect(addr)
        .await
        .map_err(|source| SessionError::Connect { addr, source })
}
