//! Leader-side lobby seeding
//!
//! The leader keeps exactly one fresh lobby on offer. Each cycle creates a
//! lobby, waits for a snapshot showing the leader alone in it, publishes it
//! to the fleet, and pivots to the next cycle the moment membership grows.
//! Lobby ids that have been pivoted away from are retired for good, so a
//! late or duplicated snapshot can never republish them.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::protocol::{Lobby, LobbyId};

/// What the leader session should do after a seeding input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedDecision {
    /// Leader is alone in a fresh lobby; hand it to the followers
    Publish(Lobby),
    /// Lobby started filling up; leave it and start the next cycle
    Pivot { retired: LobbyId },
    /// The current lobby vanished before confirmation; create it again
    Recreate { name: String },
    Ignore,
}

#[derive(Debug)]
pub struct LobbySeedingController {
    base_name: String,
    cycle: u64,
    current: Option<LobbyId>,
    confirmed: Option<LobbyId>,
    last_seen_members: u32,
    retired: HashSet<LobbyId>,
}

impl LobbySeedingController {
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            cycle: 0,
            current: None,
            confirmed: None,
            last_seen_members: 0,
            retired: HashSet::new(),
        }
    }

    /// Start a new cycle and return the name of the lobby to create
    pub fn begin_cycle(&mut self) -> String {
        self.cycle += 1;
        self.current = None;
        self.confirmed = None;
        self.last_seen_members = 0;
        let name = self.current_name();
        info!(cycle = self.cycle, name = %name, "Starting seeding cycle");
        name
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn current_name(&self) -> String {
        format!("{}#{}", self.base_name, self.cycle)
    }

    pub fn current_lobby(&self) -> Option<LobbyId> {
        self.current
    }

    pub fn confirmed(&self) -> Option<LobbyId> {
        self.confirmed
    }

    pub fn is_retired(&self, lobby_id: LobbyId) -> bool {
        self.retired.contains(&lobby_id)
    }

    fn is_ours(&self, lobby: &Lobby) -> bool {
        match self.current {
            Some(id) => id == lobby.lobby_id,
            None => self.cycle > 0 && lobby.name == self.current_name(),
        }
    }

    /// Reconcile a lobby snapshot
    pub fn on_snapshot(&mut self, lobby: &Lobby, removed: bool) -> SeedDecision {
        if self.retired.contains(&lobby.lobby_id) || !self.is_ours(lobby) {
            debug!(lobby_id = %lobby.lobby_id, "Ignoring snapshot for a lobby outside this cycle");
            return SeedDecision::Ignore;
        }

        if removed {
            self.retired.insert(lobby.lobby_id);
            self.current = None;
            if self.confirmed.take().is_some() {
                return SeedDecision::Pivot { retired: lobby.lobby_id };
            }
            return SeedDecision::Recreate { name: self.current_name() };
        }

        self.current = Some(lobby.lobby_id);

        if self.confirmed.is_none() {
            return match lobby.member_count {
                0 => SeedDecision::Ignore,
                1 => {
                    self.confirmed = Some(lobby.lobby_id);
                    self.last_seen_members = 1;
                    SeedDecision::Publish(lobby.clone())
                }
                _ => self.pivot(lobby.lobby_id),
            };
        }

        if lobby.member_count > self.last_seen_members {
            return self.pivot(lobby.lobby_id);
        }
        self.last_seen_members = lobby.member_count;
        SeedDecision::Ignore
    }

    fn pivot(&mut self, lobby_id: LobbyId) -> SeedDecision {
        info!(lobby_id = %lobby_id, cycle = self.cycle, "Lobby is filling, pivoting");
        self.retired.insert(lobby_id);
        self.current = None;
        self.confirmed = None;
        SeedDecision::Pivot { retired: lobby_id }
    }

    /// Creation timed out; returns the name to create again, if still waiting
    pub fn on_create_timeout(&mut self) -> Option<String> {
        if self.confirmed.is_some() {
            return None;
        }
        if let Some(stale) = self.current.take() {
            self.retired.insert(stale);
        }
        Some(self.current_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby(id: u64, name: &str, members: u32) -> Lobby {
        Lobby {
            lobby_id: LobbyId(id),
            name: name.into(),
            member_count: members,
            region: 0,
            fingerprint: Default::default(),
        }
    }

    #[test]
    fn test_cycle_names() {
        let mut seeder = LobbySeedingController::new("A");
        assert_eq!(seeder.begin_cycle(), "A#1");
        assert_eq!(seeder.begin_cycle(), "A#2");
        assert_eq!(seeder.cycle(), 2);
    }

    #[test]
    fn test_publish_when_leader_alone() {
        let mut seeder = LobbySeedingController::new("A");
        seeder.begin_cycle();
        let snap = lobby(1, "A#1", 1);
        assert_eq!(seeder.on_snapshot(&snap, false), SeedDecision::Publish(snap.clone()));
        assert_eq!(seeder.confirmed(), Some(LobbyId(1)));

        // duplicate snapshot does not republish
        assert_eq!(seeder.on_snapshot(&snap, false), SeedDecision::Ignore);
    }

    #[test]
    fn test_partial_snapshot_is_ignored() {
        let mut seeder = LobbySeedingController::new("A");
        seeder.begin_cycle();
        assert_eq!(seeder.on_snapshot(&lobby(1, "A#1", 0), false), SeedDecision::Ignore);
        assert_eq!(seeder.current_lobby(), Some(LobbyId(1)));
        assert!(seeder.confirmed().is_none());
    }

    #[test]
    fn test_growth_pivots_and_retires() {
        let mut seeder = LobbySeedingController::new("A");
        seeder.begin_cycle();
        seeder.on_snapshot(&lobby(1, "A#1", 1), false);

        assert_eq!(
            seeder.on_snapshot(&lobby(1, "A#1", 2), false),
            SeedDecision::Pivot { retired: LobbyId(1) }
        );
        assert!(seeder.is_retired(LobbyId(1)));

        // late snapshot of the retired lobby never republishes it
        seeder.begin_cycle();
        assert_eq!(seeder.on_snapshot(&lobby(1, "A#1", 1), false), SeedDecision::Ignore);
        assert_eq!(
            seeder.on_snapshot(&lobby(2, "A#2", 1), false),
            SeedDecision::Publish(lobby(2, "A#2", 1))
        );
    }

    #[test]
    fn test_shrink_then_grow_pivots() {
        let mut seeder = LobbySeedingController::new("A");
        seeder.begin_cycle();
        seeder.on_snapshot(&lobby(1, "A#1", 1), false);
        assert_eq!(seeder.on_snapshot(&lobby(1, "A#1", 1), false), SeedDecision::Ignore);
        assert_eq!(
            seeder.on_snapshot(&lobby(1, "A#1", 3), false),
            SeedDecision::Pivot { retired: LobbyId(1) }
        );
    }

    #[test]
    fn test_crowded_before_confirmation_pivots() {
        let mut seeder = LobbySeedingController::new("A");
        seeder.begin_cycle();
        assert_eq!(
            seeder.on_snapshot(&lobby(1, "A#1", 4), false),
            SeedDecision::Pivot { retired: LobbyId(1) }
        );
    }

    #[test]
    fn test_foreign_snapshot_ignored() {
        let mut seeder = LobbySeedingController::new("A");
        seeder.begin_cycle();
        assert_eq!(seeder.on_snapshot(&lobby(9, "Other", 1), false), SeedDecision::Ignore);
        assert!(seeder.current_lobby().is_none());
    }

    #[test]
    fn test_create_timeout_recreates_until_confirmed() {
        let mut seeder = LobbySeedingController::new("A");
        seeder.begin_cycle();
        seeder.on_snapshot(&lobby(1, "A#1", 0), false);
        assert_eq!(seeder.on_create_timeout(), Some("A#1".to_string()));
        assert!(seeder.is_retired(LobbyId(1)));

        seeder.on_snapshot(&lobby(2, "A#1", 1), false);
        assert_eq!(seeder.on_create_timeout(), None);
    }

    #[test]
    fn test_removed_lobby() {
        let mut seeder = LobbySeedingController::new("A");
        seeder.begin_cycle();
        seeder.on_snapshot(&lobby(1, "A#1", 0), false);
        assert_eq!(
            seeder.on_snapshot(&lobby(1, "A#1", 0), true),
            SeedDecision::Recreate { name: "A#1".into() }
        );

        seeder.on_snapshot(&lobby(2, "A#1", 1), false);
        assert_eq!(
            seeder.on_snapshot(&lobby(2, "A#1", 1), true),
            SeedDecision::Pivot { retired: LobbyId(2) }
        );
    }
}
