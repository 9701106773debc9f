//! Fleet roster - the fleet's view of every session
//!
//! Built purely from [`FleetEvent`]s, so it can lag the sessions themselves.
//! It is good enough for progress reporting and for picking the followers a
//! freshly confirmed lobby is pushed to.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::channel::FleetEvent;
use crate::config::Role;
use crate::protocol::{Lobby, LobbyId};
use crate::session::SessionState;

/// Progress snapshot polled by the presentation layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetProgress {
    pub bots_in_lobby: usize,
    pub total_bots: usize,
    pub distinct_lobbies: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone)]
struct RosterEntry {
    role: Role,
    state: SessionState,
    lobby: Option<LobbyId>,
}

/// Per-account state as reported by the sessions
#[derive(Debug, Default)]
pub struct FleetRoster {
    entries: HashMap<String, RosterEntry>,
    /// Registration order, leader first
    order: Vec<String>,
    confirmed: Option<Lobby>,
}

impl FleetRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, account: impl Into<String>, role: Role) {
        let account = account.into();
        if self.entries.contains_key(&account) {
            return;
        }
        self.order.push(account.clone());
        self.entries.insert(
            account,
            RosterEntry {
                role,
                state: SessionState::Offline,
                lobby: None,
            },
        );
    }

    /// Fold one session report into the roster
    pub fn apply(&mut self, event: &FleetEvent) {
        match event {
            FleetEvent::StateChanged { account, state } => {
                if let Some(entry) = self.entries.get_mut(account) {
                    entry.state = *state;
                }
            }
            FleetEvent::JoinedLobby { account, lobby_id } => {
                if let Some(entry) = self.entries.get_mut(account) {
                    entry.lobby = Some(*lobby_id);
                }
            }
            FleetEvent::LeftLobby { account, lobby_id } => {
                if let Some(entry) = self.entries.get_mut(account) {
                    if entry.lobby == Some(*lobby_id) {
                        entry.lobby = None;
                    }
                }
            }
            FleetEvent::LobbyConfirmed { lobby } => self.confirmed = Some(lobby.clone()),
            FleetEvent::LobbyRetired { lobby_id } => {
                if self.confirmed.as_ref().is_some_and(|l| l.lobby_id == *lobby_id) {
                    self.confirmed = None;
                }
            }
            FleetEvent::Abandoned { account, .. } | FleetEvent::Vacated { account } => {
                if let Some(entry) = self.entries.get_mut(account) {
                    entry.lobby = None;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, account: &str) -> Option<SessionState> {
        self.entries.get(account).map(|e| e.state)
    }

    pub fn lobby(&self, account: &str) -> Option<LobbyId> {
        self.entries.get(account).and_then(|e| e.lobby)
    }

    /// Lobby currently published for followers
    pub fn confirmed(&self) -> Option<&Lobby> {
        self.confirmed.as_ref()
    }

    /// Followers waiting for a lobby, in registration order
    pub fn idle_followers(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|a| {
                self.entries
                    .get(*a)
                    .is_some_and(|e| e.role == Role::Follower && e.state == SessionState::IdlePool)
            })
            .cloned()
            .collect()
    }

    /// Accounts that can still be signaled
    pub fn live_accounts(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|a| {
                self.entries
                    .get(*a)
                    .is_some_and(|e| e.state != SessionState::Abandoned)
            })
            .cloned()
            .collect()
    }

    pub fn count_in(&self, state: SessionState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }

    pub fn progress(&self) -> FleetProgress {
        let lobbies: BTreeSet<LobbyId> = self.entries.values().filter_map(|e| e.lobby).collect();
        FleetProgress {
            bots_in_lobby: self.entries.values().filter(|e| e.lobby.is_some()).count(),
            total_bots: self.entries.len(),
            distinct_lobbies: lobbies.len(),
            abandoned: self.count_in(SessionState::Abandoned),
        }
    }
}
