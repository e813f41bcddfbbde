//! Chat session management.
//!
//! A session is one duplex TCP connection carrying sealed MESSAGE frames in
//! both directions. Sessions are created by accepting a request (outbound) or
//! by the connection server when a peer starts talking to us (inbound).

pub mod action;
pub mod connection;
pub mod manager;

pub use action::{ActionSource, SessionAction, ALARM_TEXT, EMERGENCY_TEXT};
pub use connection::{Direction, Session, SessionError, SessionId, SessionInfo};
pub use manager::{Decision, PeerSelector, SessionManager};
