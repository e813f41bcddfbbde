//! LAN discovery: periodic UDP broadcast announcements and the listener that
//! turns them into directory entries.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Announcement, ProtocolError, MAX_ANNOUNCEMENT_SIZE};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::directory::PeerDirectory;
use crate::events::ChatEvent;

/// Period between two announcements.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

/// Broadcasts this peer's presence.
pub struct Announcer {
    socket: UdpSocket,
    target: SocketAddr,
    payload: Vec<u8>,
    interval: Duration,
}

impl Announcer {
    /// Opens a broadcast-capable socket that sends `announcement` to `target`.
    pub async fn bind(announcement: &Announcement, target: SocketAddr) -> anyhow::Result<Self> {
        let payload = announcement.encode()?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            target,
            payload,
            interval: ANNOUNCE_INTERVAL,
        })
    }

    /// Overrides the announcement period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sends one announcement.
    pub async fn announce_once(&self) -> io::Result<()> {
        self.socket.send_to(&self.payload, self.target).await?;
        Ok(())
    }

    /// Announces immediately, then once per interval, until `shutdown` is
    /// cancelled. Send failures are retried on the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            "Announcing presence to {} every {:?}",
            self.target,
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.announce_once().await {
                        tracing::warn!("Failed to send announcement to {}: {}", self.target, e);
                    }
                }
            }
        }
    }
}

/// Receives announcements and records the senders in the directory.
pub struct DiscoveryListener {
    socket: UdpSocket,
    directory: Arc<PeerDirectory>,
    events: broadcast::Sender<ChatEvent>,
    own: Option<Announcement>,
}

impl DiscoveryListener {
    /// Binds the discovery socket.
    ///
    /// The address is reusable so several peers on one host can listen on
    /// the same discovery port.
    pub async fn bind(
        addr: SocketAddr,
        directory: Arc<PeerDirectory>,
        events: broadcast::Sender<ChatEvent>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Self {
            socket,
            directory,
            events,
            own: None,
        })
    }

    /// Skips datagrams carrying our own announcement.
    pub fn ignore_own(mut self, own: Announcement) -> Self {
        self.own = Some(own);
        self
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Applies one received datagram to the directory.
    ///
    /// Returns `true` if the sender was not known before.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Result<bool, ProtocolError> {
        let announcement = Announcement::decode(bytes)?;
        if self.own.as_ref() == Some(&announcement) {
            return Ok(false);
        }

        let is_new =
            self.directory
                .upsert_peer(&announcement.username, from.ip(), announcement.port);
        if is_new {
            let _ = self.events.send(ChatEvent::PeerDiscovered {
                name: announcement.username,
                addr: SocketAddr::new(from.ip(), announcement.port),
            });
        }
        Ok(is_new)
    }

    /// Receive loop. Runs until `shutdown` is cancelled; bad datagrams and
    /// socket errors are logged and skipped.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!("Listening for announcements on {}", addr);
        }
        let mut buf = vec![0u8; MAX_ANNOUNCEMENT_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((n, from)) => {
                    if let Err(e) = self.handle_datagram(&buf[..n], from) {
                        tracing::warn!("Ignoring datagram from {}: {}", from, e);
                    }
                }
                Err(e) => tracing::warn!("Discovery receive error: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listener() -> (DiscoveryListener, broadcast::Receiver<ChatEvent>) {
        let events = crate::events::channel();
        let rx = events.subscribe();
        let listener = DiscoveryListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(PeerDirectory::new()),
            events,
        )
        .await
        .unwrap();
        (listener, rx)
    }

    #[tokio::test]
    async fn test_announcement_creates_peer() {
        let (listener, mut rx) = listener().await;
        let from: SocketAddr = "10.0.0.5:40000".parse().unwrap();

        let is_new = listener
            .handle_datagram(br#"{"username":"alice","port":5001}"#, from)
            .unwrap();
        assert!(is_new);

        let peers = listener.directory.list_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "alice");
        assert_eq!(peers[0].addr(), "10.0.0.5:5001".parse::<SocketAddr>().unwrap());

        assert_eq!(
            rx.try_recv().unwrap(),
            ChatEvent::PeerDiscovered {
                name: "alice".to_string(),
                addr: "10.0.0.5:5001".parse().unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_repeated_announcement_is_quiet() {
        let (listener, mut rx) = listener().await;
        let from: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let datagram = br#"{"username":"alice","port":5001}"#;

        assert!(listener.handle_datagram(datagram, from).unwrap());
        assert!(!listener.handle_datagram(datagram, from).unwrap());
        assert_eq!(listener.directory.peer_count(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_datagram_leaves_directory_untouched() {
        let (listener, _rx) = listener().await;
        let from: SocketAddr = "10.0.0.5:40000".parse().unwrap();

        let err = listener.handle_datagram(b"garbage", from).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
        assert_eq!(listener.directory.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_own_announcement_is_skipped() {
        let (listener, _rx) = listener().await;
        let listener = listener.ignore_own(Announcement::new("me", 5000));
        let from: SocketAddr = "10.0.0.2:40000".parse().unwrap();

        assert!(!listener
            .handle_datagram(br#"{"username":"me","port":5000}"#, from)
            .unwrap());
        assert_eq!(listener.directory.peer_count(), 0);

        // Same name on a different port is another process
        assert!(listener
            .handle_datagram(br#"{"username":"me","port":5001}"#, from)
            .unwrap());
    }

    #[tokio::test]
    async fn test_announcer_reaches_listener() {
        let (listener, mut rx) = listener().await;
        let directory = Arc::clone(&listener.directory);
        let target = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let announcer = Announcer::bind(&Announcement::new("alice", 5001), target)
            .await
            .unwrap()
            .with_interval(Duration::from_millis(50));

        tokio::spawn(listener.run(shutdown.clone()));
        tokio::spawn(announcer.run(shutdown.clone()));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no announcement received")
            .unwrap();
        assert!(matches!(event, ChatEvent::PeerDiscovered { ref name, .. } if name == "alice"));

        let alice = directory.lookup("alice").unwrap();
        assert_eq!(alice.port, 5001);
        assert!(alice.host.is_loopback());

        shutdown.cancel();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_discovery_port_is_shared() {
        let (first, _rx) = listener().await;
        let addr = first.local_addr().unwrap();

        let second = DiscoveryListener::bind(addr, Arc::new(PeerDirectory::new()), crate::events::channel()).await;
        assert!(second.is_ok());
    }
}
