//! Node orchestrator wiring the peer's components together.
//!
//! A [`ChatNode`] builds the shared directory, cipher and session manager
//! once, then starts the three background services: the connection server,
//! the discovery listener and the announcer. A failing service is reported
//! and the others keep running.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::{Announcement, ChatKey, MessageCipher};
use rand::Rng;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{validate_username, Config};
use crate::directory::PeerDirectory;
use crate::discovery::{Announcer, DiscoveryListener};
use crate::events::{self, ChatEvent};
use crate::server::ConnectionServer;
use crate::session::SessionManager;

/// Range the listen port is drawn from when none is configured.
pub const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not started, or stopped.
    Stopped,
    /// Services are running.
    Running,
}

/// A running LanChat peer.
pub struct ChatNode {
    config: Config,
    username: String,
    listen_port: u16,
    state: Arc<RwLock<NodeState>>,
    directory: Arc<PeerDirectory>,
    sessions: Arc<SessionManager>,
    listen_addr: Option<SocketAddr>,
    discovery_addr: Option<SocketAddr>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatNode {
    /// Creates a node for `username` from a validated configuration.
    ///
    /// Without a configured key a random one is generated, which means no
    /// other peer can read this node's messages.
    pub fn new(config: Config, username: impl Into<String>) -> Result<Self> {
        let username = username.into();
        config.validate().context("Invalid configuration")?;
        validate_username(&username)?;

        let key = match config.security.chat_key()? {
            Some(key) => key,
            None => {
                warn!(
                    "No shared key configured; using a random key. Peers will not be able \
                     to read your messages. Run `lanchat keygen` and share the result."
                );
                ChatKey::generate()
            }
        };

        let listen_port = match config.network.listen_port {
            0 => rand::thread_rng().gen_range(EPHEMERAL_PORTS),
            port => port,
        };

        let directory = Arc::new(PeerDirectory::new());
        let event_tx = events::channel();
        let shutdown_token = CancellationToken::new();
        let sessions = Arc::new(SessionManager::new(
            username.clone(),
            Arc::clone(&directory),
            Arc::new(MessageCipher::new(&key)),
            event_tx.clone(),
            shutdown_token.clone(),
        ));

        Ok(Self {
            config,
            username,
            listen_port,
            state: Arc::new(RwLock::new(NodeState::Stopped)),
            directory,
            sessions,
            listen_addr: None,
            discovery_addr: None,
            shutdown_token,
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    /// Returns a receiver for node events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the background services.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != NodeState::Stopped {
                anyhow::bail!("Node is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Node has been stopped and cannot be restarted");
            }
            *state = NodeState::Running;
        }

        info!(username = %self.username, "Starting LanChat node...");
        let network = self.config.network.clone();
        let bind_ip = network.bind_ip()?;
        let broadcast_ip = network.broadcast_ip()?;

        // Connection server
        let server_addr = SocketAddr::new(bind_ip, self.listen_port);
        match ConnectionServer::bind(server_addr, Arc::clone(&self.sessions)).await {
            Ok(server) => {
                self.listen_addr = server.local_addr().ok();
                tokio::spawn(server.run(self.shutdown_token.clone()));
            }
            Err(e) => {
                let e = anyhow::Error::new(e)
                    .context(format!("Failed to bind connection server on {}", server_addr));
                self.report_failure("connection server", &e);
            }
        }

        // Discovery listener. bind_host only applies to TCP: a socket bound to
        // a unicast address never sees broadcast datagrams.
        let own = Announcement::new(self.username.clone(), self.listen_port);
        let discovery_addr =
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), network.discovery_port);
        match DiscoveryListener::bind(
            discovery_addr,
            Arc::clone(&self.directory),
            self.event_tx.clone(),
        )
        .await
        {
            Ok(listener) => {
                self.discovery_addr = listener.local_addr().ok();
                tokio::spawn(listener.ignore_own(own.clone()).run(self.shutdown_token.clone()));
            }
            Err(e) => {
                let e = anyhow::Error::new(e)
                    .context(format!("Failed to bind discovery port {}", discovery_addr));
                self.report_failure("discovery listener", &e);
            }
        }

        // Announcer
        let target = SocketAddr::new(broadcast_ip, network.discovery_port);
        match Announcer::bind(&own, target).await {
            Ok(announcer) => {
                tokio::spawn(announcer.run(self.shutdown_token.clone()));
            }
            Err(e) => self.report_failure("announcer", &e.context("Failed to create broadcast socket")),
        }

        info!(
            "Node started: {} listening on port {}",
            self.username, self.listen_port
        );
        Ok(())
    }

    /// Stops all services and closes every session.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == NodeState::Stopped {
                return Ok(());
            }
            *state = NodeState::Stopped;
        }

        info!("Stopping LanChat node...");
        self.shutdown_token.cancel();
        self.sessions.close_all().await;
        debug!("All sessions closed");

        info!("LanChat node stopped");
        Ok(())
    }

    fn report_failure(&self, service: &'static str, err: &anyhow::Error) {
        error!("{} stopped: {:#}", service, err);
        let _ = self.event_tx.send(ChatEvent::ServiceFailed {
            service,
            error: format!("{:#}", err),
        });
    }

    /// Returns the announced username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the announced connection server port.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Returns the bound connection server address once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Returns the bound discovery listener address once started.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery_addr
    }

    /// Returns the peer directory.
    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Returns the session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.network.bind_host = "127.0.0.1".to_string();
        config.network.broadcast_address = "127.0.0.1".to_string();
        config.security.passphrase = "node tests".to_string();
        config
    }

    #[test]
    fn test_new_picks_ephemeral_port() {
        let node = ChatNode::new(test_config(), "alice").unwrap();
        assert!(EPHEMERAL_PORTS.contains(&node.listen_port()));
        assert_eq!(node.username(), "alice");
        assert!(node.listen_addr().is_none());
    }

    #[test]
    fn test_new_keeps_configured_port() {
        let mut config = test_config();
        config.network.listen_port = 5001;
        let node = ChatNode::new(config, "alice").unwrap();
        assert_eq!(node.listen_port(), 5001);
    }

    #[test]
    fn test_new_rejects_bad_input() {
        assert!(ChatNode::new(test_config(), "bad\nname").is_err());
        assert!(ChatNode::new(test_config(), "").is_err());
        assert!(ChatNode::new(test_config(), "   ").is_err());
        assert!(ChatNode::new(test_config(), " alice").is_err());

        let mut config = test_config();
        config.security.shared_key = "not a key".to_string();
        config.security.passphrase.clear();
        assert!(ChatNode::new(config, "alice").is_err());
    }

    #[test]
    fn test_new_without_key_still_works() {
        let mut config = test_config();
        config.security.passphrase.clear();
        assert!(ChatNode::new(config, "alice").is_ok());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut node = ChatNode::new(test_config(), "alice").unwrap();
        assert_eq!(node.state().await, NodeState::Stopped);

        node.start().await.unwrap();
        assert_eq!(node.state().await, NodeState::Running);
        let addr = node.listen_addr().expect("server should be bound");
        assert_eq!(addr.port(), node.listen_port());
        assert!(node.start().await.is_err());

        node.stop().await.unwrap();
        assert_eq!(node.state().await, NodeState::Stopped);
        assert!(node.shutdown_token().is_cancelled());

        // Stopping twice is harmless; restarting is not supported
        node.stop().await.unwrap();
        assert!(node.start().await.is_err());
    }

    #[tokio::test]
    async fn test_discovery_ignores_bind_host() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = test_config();
        config.network.discovery_port = port;

        let mut node = ChatNode::new(config, "alice").unwrap();
        let mut events = node.subscribe();
        node.start().await.unwrap();

        // TCP honours bind_host, discovery listens on every interface
        assert!(node.listen_addr().unwrap().ip().is_loopback());
        let discovery = node.discovery_addr().expect("discovery should be bound");
        assert!(discovery.ip().is_unspecified());
        assert_eq!(discovery.port(), port);

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(br#"{"username":"bob","port":6001}"#, ("127.0.0.1", port))
            .await
            .unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("no discovery event")
            .unwrap();
        assert!(matches!(event, ChatEvent::PeerDiscovered { ref name, .. } if name == "bob"));
        assert_eq!(node.directory().lookup("bob").unwrap().port, 6001);

        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_bind_failure_is_reported() {
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config();
        config.network.listen_port = blocker.local_addr().unwrap().port();

        let mut node = ChatNode::new(config, "alice").unwrap();
        let mut events = node.subscribe();
        node.start().await.unwrap();

        assert!(node.listen_addr().is_none());
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            ChatEvent::ServiceFailed {
                service: "connection server",
                ..
            }
        ));
        node.stop().await.unwrap();
    }
}
