//! Communication channels between the fleet and its sessions

use tokio::sync::mpsc;

use crate::config::Role;
use crate::protocol::{Lobby, LobbyId};
use crate::session::SessionState;
use crate::timer::TimerFired;
use crate::transport::TransportEvent;

/// Everything a session reacts to, handled strictly in arrival order
#[derive(Debug)]
pub enum SessionInput {
    Transport { epoch: u64, event: TransportEvent },
    Timer(TimerFired),
    Command(SessionCommand),
}

/// Instructions from the fleet to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Push a join target to an idle follower
    AssignLobby(LobbyId),
    /// Leave any lobby and log off for shutdown
    Vacate,
}

/// Reports from sessions to the fleet
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    StateChanged { account: String, state: SessionState },
    JoinedLobby { account: String, lobby_id: LobbyId },
    LeftLobby { account: String, lobby_id: LobbyId },
    LobbyConfirmed { lobby: Lobby },
    LobbyRetired { lobby_id: LobbyId },
    Abandoned { account: String, reason: String },
    Vacated { account: String },
}

/// Fleet-side handle to one session's inbox
#[derive(Debug, Clone)]
pub struct SessionChannel {
    account: String,
    role: Role,
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl SessionChannel {
    /// Create the handle and the inbox the session will drain
    pub fn new(account: impl Into<String>, role: Role) -> (Self, mpsc::UnboundedReceiver<SessionInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            account: account.into(),
            role,
            tx,
        };
        (channel, rx)
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn send(&self, command: SessionCommand) -> Result<(), ChannelError> {
        self.tx
            .send(SessionInput::Command(command))
            .map_err(|_| ChannelError::Closed)
    }

    pub fn assign_lobby(&self, lobby_id: LobbyId) -> Result<(), ChannelError> {
        self.send(SessionCommand::AssignLobby(lobby_id))
    }

    pub fn vacate(&self) -> Result<(), ChannelError> {
        self.send(SessionCommand::Vacate)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<SessionInput> {
        self.tx.clone()
    }
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,
}

impl From<ChannelError> for crate::error::FleetError {
    fn from(err: ChannelError) -> Self {
        crate::error::FleetError::Channel(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_creation() {
        let (channel, _rx) = SessionChannel::new("f1", Role::Follower);
        assert!(!channel.is_closed());
        assert_eq!(channel.account(), "f1");
        assert_eq!(channel.role(), Role::Follower);
    }

    #[test]
    fn test_send_command() {
        let (channel, mut rx) = SessionChannel::new("f1", Role::Follower);
        channel.assign_lobby(LobbyId(7)).unwrap();

        let received = rx.try_recv();
        assert!(matches!(
            received,
            Ok(SessionInput::Command(SessionCommand::AssignLobby(LobbyId(7))))
        ));
    }

    #[test]
    fn test_send_after_close() {
        let (channel, rx) = SessionChannel::new("f1", Role::Follower);
        drop(rx);
        assert!(channel.is_closed());
        assert!(matches!(channel.vacate(), Err(ChannelError::Closed)));
    }
}
