//! Operator actions inside an active chat.

use std::collections::VecDeque;

/// Fixed text sent by [`SessionAction::Alarm`].
pub const ALARM_TEXT: &str = "[ALARM] Something is wrong!";

/// Fixed text sent by [`SessionAction::Emergency`].
pub const EMERGENCY_TEXT: &str = "[EMERGENCY] I need help immediately!";

/// One step of the interactive chat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send a free-form line.
    Send(String),
    /// Send the alarm line.
    Alarm,
    /// Send the emergency line.
    Emergency,
    /// Leave the chat.
    End,
}

impl SessionAction {
    /// Text this action puts on the wire, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            SessionAction::Send(text) => Some(text),
            SessionAction::Alarm => Some(ALARM_TEXT),
            SessionAction::Emergency => Some(EMERGENCY_TEXT),
            SessionAction::End => None,
        }
    }
}

/// Supplies actions to [`SessionManager::run_session`](super::SessionManager::run_session).
///
/// Returning `None` means the source is exhausted and the session ends.
#[allow(async_fn_in_trait)]
pub trait ActionSource {
    async fn next_action(&mut self) -> Option<SessionAction>;
}

/// A scripted source, mostly useful for tests and batch sends.
impl ActionSource for VecDeque<SessionAction> {
    async fn next_action(&mut self) -> Option<SessionAction> {
        self.pop_front()
    }
}
