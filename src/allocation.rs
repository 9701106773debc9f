//! Room allocation table
//!
//! Fleet-shared registry of known lobbies, consulted by followers to pick a
//! join target. Each entry carries the last observed follower count and a
//! count of virtual reservations: a reservation is taken when a follower is
//! told to join and expires on its own after the reservation TTL, whether or
//! not the join went through. The sum is only trusted inside that window.
//!
//! There is no table-wide lock held across a decision. Capacity is enforced
//! per entry with a single compare-and-swap on the reservation counter, so
//! two followers racing for the last slot cannot both win it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::FleetSettings;
use crate::protocol::{Lobby, LobbyId};

/// Allocation state for one lobby name
#[derive(Debug)]
pub struct AllocationEntry {
    pub lobby_id: LobbyId,
    pub name: String,
    observed: AtomicU32,
    pending: AtomicU32,
    last_updated: Mutex<Instant>,
}

impl AllocationEntry {
    fn new(lobby_id: LobbyId, name: String, observed: u32, at: Instant) -> Self {
        Self {
            lobby_id,
            name,
            observed: AtomicU32::new(observed),
            pending: AtomicU32::new(0),
            last_updated: Mutex::new(at),
        }
    }

    pub fn observed(&self) -> u32 {
        self.observed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn last_updated(&self) -> Instant {
        *self.last_updated.lock()
    }

    fn touch(&self, observed: u32, at: Instant) {
        self.observed.store(observed, Ordering::Release);
        let mut guard = self.last_updated.lock();
        if at > *guard {
            *guard = at;
        }
    }

    /// Take one slot if `observed + pending` stays within `capacity`
    fn try_reserve(&self, capacity: u32) -> bool {
        let observed = self.observed();
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (observed.saturating_add(pending) < capacity).then_some(pending + 1)
            })
            .is_ok()
    }
}

#[derive(Debug)]
struct ReservationInner {
    entry: Arc<AllocationEntry>,
    released: AtomicBool,
}

/// A virtual slot held in one lobby
///
/// Released exactly once, either early by the session or by the expiry timer.
#[derive(Debug, Clone)]
pub struct Reservation {
    inner: Arc<ReservationInner>,
}

impl Reservation {
    pub fn lobby_id(&self) -> LobbyId {
        self.inner.entry.lobby_id
    }

    pub fn lobby_name(&self) -> &str {
        &self.inner.entry.name
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Returns true only for the call that actually gave the slot back
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.entry.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }
}

/// Outcome of a follower asking for a lobby
#[derive(Debug, Clone)]
pub enum JoinDecision {
    Join { lobby_id: LobbyId, reservation: Reservation },
    Wait,
}

impl JoinDecision {
    pub fn lobby_id(&self) -> Option<LobbyId> {
        match self {
            JoinDecision::Join { lobby_id, .. } => Some(*lobby_id),
            JoinDecision::Wait => None,
        }
    }
}

/// Lobby the leader confirmed and currently sits in
#[derive(Debug, Clone)]
struct ConfirmedLobby {
    lobby: Lobby,
    published_at: Instant,
}

/// Read-only view of one entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntryView {
    pub lobby_id: LobbyId,
    pub name: String,
    pub observed: u32,
    pub pending: u32,
    pub age: Duration,
}

/// Shared lobby registry with self-expiring reservations
#[derive(Debug)]
pub struct RoomAllocationTable {
    capacity: u32,
    freshness: Duration,
    reservation_ttl: Duration,
    /// Base name of the fleet's lobbies; `None` admits every lobby
    lobby_name: Option<String>,
    entries: RwLock<HashMap<String, Arc<AllocationEntry>>>,
    confirmed: RwLock<Option<ConfirmedLobby>>,
}

impl RoomAllocationTable {
    pub fn new(capacity: u32, freshness: Duration, reservation_ttl: Duration) -> Self {
        Self {
            capacity,
            freshness,
            reservation_ttl,
            lobby_name: None,
            entries: RwLock::new(HashMap::new()),
            confirmed: RwLock::new(None),
        }
    }

    pub fn from_settings(settings: &FleetSettings) -> Self {
        Self::new(
            settings.lobby_capacity,
            settings.freshness_window(),
            settings.reservation_ttl(),
        )
        .with_lobby_name(settings.lobby_name.clone())
    }

    /// Only track lobbies named `<name>` or `<name>#<n>`
    pub fn with_lobby_name(mut self, name: impl Into<String>) -> Self {
        self.lobby_name = Some(name.into());
        self
    }

    /// Whether a lobby with this name belongs to the fleet
    pub fn admits(&self, name: &str) -> bool {
        let Some(base) = &self.lobby_name else {
            return true;
        };
        match name.strip_prefix(base.as_str()) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix('#')
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())),
            None => false,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Followers in a lobby, not counting a leader sitting in it
    fn followers_in(&self, lobby: &Lobby) -> u32 {
        let leader_inside = self
            .confirmed
            .read()
            .as_ref()
            .is_some_and(|c| c.lobby.lobby_id == lobby.lobby_id);
        if leader_inside {
            lobby.member_count.saturating_sub(1)
        } else {
            lobby.member_count
        }
    }

    fn upsert(&self, lobby: &Lobby, observed: u32, at: Instant) {
        let mut entries = self.entries.write();
        match entries.get(&lobby.name) {
            Some(entry) if entry.lobby_id == lobby.lobby_id => entry.touch(observed, at),
            _ => {
                entries.insert(
                    lobby.name.clone(),
                    Arc::new(AllocationEntry::new(lobby.lobby_id, lobby.name.clone(), observed, at)),
                );
            }
        }
    }

    /// Reconcile one observed lobby into the table
    pub fn observe(&self, lobby: &Lobby) {
        if !self.admits(&lobby.name) {
            debug!(lobby_id = %lobby.lobby_id, name = %lobby.name, "Ignoring foreign lobby");
            return;
        }
        let observed = self.followers_in(lobby);
        self.upsert(lobby, observed, Instant::now());
    }

    pub fn observe_all<'a>(&self, lobbies: impl IntoIterator<Item = &'a Lobby>) {
        for lobby in lobbies {
            self.observe(lobby);
        }
    }

    /// Treat a lobby as full until the next observation says otherwise
    pub fn mark_full(&self, lobby_id: LobbyId) {
        if let Some(entry) = self.entries.read().values().find(|e| e.lobby_id == lobby_id) {
            entry.observed.store(self.capacity, Ordering::Release);
            debug!(lobby_id = %lobby_id, name = %entry.name, "Marked lobby full");
        }
    }

    /// Forget a lobby that no longer exists
    pub fn remove(&self, lobby_id: LobbyId) {
        self.entries.write().retain(|_, e| e.lobby_id != lobby_id);
    }

    /// Publish the leader's confirmed lobby
    pub fn publish_confirmed(&self, lobby: Lobby) {
        let now = Instant::now();
        info!(lobby_id = %lobby.lobby_id, name = %lobby.name, "Published confirmed lobby");
        *self.confirmed.write() = Some(ConfirmedLobby {
            lobby: lobby.clone(),
            published_at: now,
        });
        let observed = self.followers_in(&lobby);
        self.upsert(&lobby, observed, now);
    }

    pub fn clear_confirmed(&self) {
        if let Some(previous) = self.confirmed.write().take() {
            debug!(lobby_id = %previous.lobby.lobby_id, "Cleared confirmed lobby");
        }
    }

    pub fn confirmed(&self) -> Option<Lobby> {
        self.confirmed.read().as_ref().map(|c| c.lobby.clone())
    }

    /// Decide where a follower should go
    pub fn request_join_slot(&self, account: &str) -> JoinDecision {
        let now = Instant::now();

        let confirmed = self.confirmed.read().clone();
        if let Some(confirmed) = confirmed {
            let missing = self
                .entries
                .read()
                .get(&confirmed.lobby.name)
                .map_or(true, |e| e.lobby_id != confirmed.lobby.lobby_id);
            if missing {
                let observed = self.followers_in(&confirmed.lobby);
                self.upsert(&confirmed.lobby, observed, confirmed.published_at);
            }
        }

        let mut candidates: Vec<Arc<AllocationEntry>> = self
            .entries
            .read()
            .values()
            .filter(|e| now.saturating_duration_since(e.last_updated()) <= self.freshness && self.admits(&e.name))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            name_suffix(&a.name)
                .cmp(&name_suffix(&b.name))
                .then_with(|| a.name.cmp(&b.name))
        });

        for entry in candidates {
            if !entry.try_reserve(self.capacity) {
                continue;
            }
            let reservation = Reservation {
                inner: Arc::new(ReservationInner {
                    entry: Arc::clone(&entry),
                    released: AtomicBool::new(false),
                }),
            };
            self.schedule_expiry(reservation.clone());
            debug!(
                account,
                lobby_id = %entry.lobby_id,
                name = %entry.name,
                observed = entry.observed(),
                pending = entry.pending(),
                "Reserved lobby slot"
            );
            return JoinDecision::Join {
                lobby_id: entry.lobby_id,
                reservation,
            };
        }

        debug!(account, "No lobby with free capacity");
        JoinDecision::Wait
    }

    /// Reserve a slot in one specific lobby pushed to a follower
    ///
    /// Unknown, stale or full lobbies yield `Wait`.
    pub fn reserve_lobby(&self, account: &str, lobby_id: LobbyId) -> JoinDecision {
        let now = Instant::now();
        let entry = self
            .entries
            .read()
            .values()
            .find(|e| e.lobby_id == lobby_id)
            .cloned();
        let Some(entry) = entry else {
            debug!(account, lobby_id = %lobby_id, "Pushed lobby is not in the table");
            return JoinDecision::Wait;
        };
        if now.saturating_duration_since(entry.last_updated()) > self.freshness || !entry.try_reserve(self.capacity) {
            debug!(account, lobby_id = %lobby_id, "Pushed lobby is stale or full");
            return JoinDecision::Wait;
        }
        let reservation = Reservation {
            inner: Arc::new(ReservationInner {
                entry,
                released: AtomicBool::new(false),
            }),
        };
        self.schedule_expiry(reservation.clone());
        JoinDecision::Join { lobby_id, reservation }
    }

    fn schedule_expiry(&self, reservation: Reservation) {
        let ttl = self.reservation_ttl;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(ttl).await;
                    if reservation.release() {
                        debug!(lobby_id = %reservation.lobby_id(), "Reservation expired");
                    }
                });
            }
            Err(_) => debug!("No runtime, reservation expires only on release"),
        }
    }

    /// Drop entries not updated within `max_age`
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.last_updated()) <= max_age);
        before - entries.len()
    }

    pub fn entries(&self) -> Vec<EntryView> {
        let now = Instant::now();
        let mut views: Vec<EntryView> = self
            .entries
            .read()
            .values()
            .map(|e| EntryView {
                lobby_id: e.lobby_id,
                name: e.name.clone(),
                observed: e.observed(),
                pending: e.pending(),
                age: now.saturating_duration_since(e.last_updated()),
            })
            .collect();
        views.sort_by(|a, b| name_suffix(&a.name).cmp(&name_suffix(&b.name)).then_with(|| a.name.cmp(&b.name)));
        views
    }

    pub fn entry(&self, name: &str) -> Option<EntryView> {
        self.entries().into_iter().find(|e| e.name == name)
    }
}

/// Trailing number of a lobby name; unnumbered names sort last
pub fn name_suffix(name: &str) -> u64 {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(u64::MAX)
}
