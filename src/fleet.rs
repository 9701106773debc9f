//! Fleet manager - owns the leader and follower sessions
//!
//! Sessions run as independent tasks. The fleet only keeps their inbox
//! handles and a roster folded from their [`FleetEvent`]s, pushes freshly
//! confirmed lobbies to idle followers, and signals everyone on cleanup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::allocation::RoomAllocationTable;
use crate::channel::{FleetEvent, SessionChannel};
use crate::config::{Account, FleetDefinition, FleetSettings, Role};
use crate::error::FleetError;
use crate::protocol::{LobbyId, MessageCodec};
use crate::proxy::ProxySupervisor;
use crate::roster::{FleetProgress, FleetRoster};
use crate::session::{BotSession, SessionContext, SessionState};
use crate::transport::TransportFactory;

type Channels = Arc<HashMap<String, SessionChannel>>;
type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<FleetEvent>>>>;

/// One leader and its followers
pub struct Fleet {
    leader: Account,
    followers: Vec<Account>,
    ctx: SessionContext,
    roster: Arc<RwLock<FleetRoster>>,
    subscribers: Subscribers,
    channels: Channels,
    events_rx: Option<mpsc::UnboundedReceiver<FleetEvent>>,
    sessions: Vec<JoinHandle<()>>,
    event_loop: Option<JoinHandle<()>>,
}

impl Fleet {
    /// Build a fleet from its definition; nothing runs until [`Fleet::start`]
    pub fn new(
        definition: FleetDefinition,
        factory: Arc<dyn TransportFactory>,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self, FleetError> {
        let FleetDefinition {
            mut leader,
            mut followers,
            proxies,
            settings,
        } = definition;
        settings.validate()?;

        leader.role = Role::Leader;
        for follower in &mut followers {
            follower.role = Role::Follower;
        }

        let mut roster = FleetRoster::new();
        roster.register(leader.username.clone(), Role::Leader);
        for follower in &followers {
            roster.register(follower.username.clone(), Role::Follower);
        }
        if roster.len() != 1 + followers.len() {
            return Err(FleetError::Config("account usernames must be unique".into()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            proxies: Arc::new(ProxySupervisor::new(proxies, 1, settings.accounts_per_proxy)),
            table: Arc::new(RoomAllocationTable::from_settings(&settings)),
            settings: Arc::new(settings),
            factory,
            codec,
            events: events_tx,
        };

        info!(leader = %leader.username, followers = followers.len(), proxies = ctx.proxies.len(), "Created fleet");

        Ok(Self {
            leader,
            followers,
            ctx,
            roster: Arc::new(RwLock::new(roster)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            channels: Arc::new(HashMap::new()),
            events_rx: Some(events_rx),
            sessions: Vec::new(),
            event_loop: None,
        })
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.ctx.settings
    }

    pub fn table(&self) -> Arc<RoomAllocationTable> {
        Arc::clone(&self.ctx.table)
    }

    pub fn proxies(&self) -> Arc<ProxySupervisor> {
        Arc::clone(&self.ctx.proxies)
    }

    pub fn is_started(&self) -> bool {
        self.events_rx.is_none()
    }

    /// Receive a copy of every session report from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FleetEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Spawn every session and the fleet event loop
    pub fn start(&mut self) -> Result<(), FleetError> {
        let events_rx = self.events_rx.take().ok_or(FleetError::AlreadyStarted)?;

        let mut channels = HashMap::new();
        let accounts = std::iter::once((self.leader.clone(), 0))
            .chain(self.followers.iter().cloned().enumerate().map(|(i, a)| (a, i)));
        for (account, role_index) in accounts {
            let (channel, inbox) = SessionChannel::new(account.username.clone(), account.role);
            let session = BotSession::new(account, role_index, self.ctx.clone(), &channel);
            self.sessions.push(tokio::spawn(session.run(inbox)));
            channels.insert(channel.account().to_string(), channel);
        }
        self.channels = Arc::new(channels);

        let event_loop = FleetLoop {
            roster: Arc::clone(&self.roster),
            channels: Arc::clone(&self.channels),
            subscribers: Arc::clone(&self.subscribers),
            settings: Arc::clone(&self.ctx.settings),
            release: None,
        };
        self.event_loop = Some(tokio::spawn(event_loop.run(events_rx)));

        info!(sessions = self.sessions.len(), "Fleet started");
        Ok(())
    }

    pub fn progress(&self) -> FleetProgress {
        self.roster.read().progress()
    }

    pub fn state(&self, account: &str) -> Option<SessionState> {
        self.roster.read().state(account)
    }

    /// Push a join target to one follower
    pub fn assign_lobby(&self, account: &str, lobby_id: LobbyId) -> Result<(), FleetError> {
        let channel = self
            .channels
            .get(account)
            .ok_or_else(|| FleetError::SessionNotFound(account.to_string()))?;
        channel.assign_lobby(lobby_id)?;
        Ok(())
    }

    /// Ask every live session to leave its lobby and log off
    ///
    /// Waits up to the shutdown grace period for sessions to finish and
    /// returns how many were signaled.
    pub async fn cleanup(&mut self) -> usize {
        let live = self.roster.read().live_accounts();
        let signaled = live
            .iter()
            .filter_map(|account| self.channels.get(account))
            .filter(|channel| channel.vacate().is_ok())
            .count();
        info!(signaled, "Vacating fleet");

        let deadline = Instant::now() + self.ctx.settings.shutdown_grace();
        let mut stragglers = 0;
        for handle in self.sessions.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                abort.abort();
                stragglers += 1;
            }
        }
        if stragglers > 0 {
            warn!(stragglers, "Sessions did not vacate within the grace period");
        }

        if let Some(event_loop) = self.event_loop.take() {
            event_loop.abort();
        }
        signaled
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        for handle in &self.sessions {
            handle.abort();
        }
        if let Some(event_loop) = &self.event_loop {
            event_loop.abort();
        }
    }
}

struct FleetLoop {
    roster: Arc<RwLock<FleetRoster>>,
    channels: Channels,
    subscribers: Subscribers,
    settings: Arc<FleetSettings>,
    /// Release task for the currently confirmed lobby
    release: Option<(LobbyId, JoinHandle<()>)>,
}

impl FleetLoop {
    #[instrument(skip_all)]
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<FleetEvent>) {
        info!("Fleet event loop started");
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        self.stop_release();
        info!("Fleet event loop stopped");
    }

    fn handle(&mut self, event: FleetEvent) {
        self.roster.write().apply(&event);

        match &event {
            FleetEvent::LobbyConfirmed { lobby } => {
                let idle = self.roster.read().idle_followers();
                info!(lobby_id = %lobby.lobby_id, name = %lobby.name, idle = idle.len(), "Releasing followers");
                self.stop_release();
                let task = tokio::spawn(release_in_batches(
                    lobby.lobby_id,
                    idle,
                    Arc::clone(&self.channels),
                    self.settings.release_batch_size,
                    self.settings.release_stagger(),
                ));
                self.release = Some((lobby.lobby_id, task));
            }
            FleetEvent::LobbyRetired { lobby_id } => {
                if self.release.as_ref().is_some_and(|(id, _)| id == lobby_id) {
                    self.stop_release();
                }
            }
            FleetEvent::StateChanged {
                account,
                state: SessionState::IdlePool,
            } => {
                let roster = self.roster.read();
                let confirmed = roster.confirmed().map(|l| l.lobby_id);
                let is_follower = self.channels.get(account).map(|c| c.role()) == Some(Role::Follower);
                if let (Some(lobby_id), true) = (confirmed, is_follower) {
                    debug!(account = %account, lobby_id = %lobby_id, "Pointing idle follower at confirmed lobby");
                    if let Some(channel) = self.channels.get(account) {
                        let _ = channel.assign_lobby(lobby_id);
                    }
                }
            }
            FleetEvent::Abandoned { account, reason } => {
                warn!(account = %account, reason = %reason, "Session abandoned");
            }
            _ => {}
        }

        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn stop_release(&mut self) {
        if let Some((lobby_id, task)) = self.release.take() {
            debug!(lobby_id = %lobby_id, "Stopping follower release");
            task.abort();
        }
    }
}

/// Point `accounts` at `lobby_id`, `batch` at a time with `stagger` between batches
async fn release_in_batches(
    lobby_id: LobbyId,
    accounts: Vec<String>,
    channels: Channels,
    batch: usize,
    stagger: std::time::Duration,
) {
    for (i, chunk) in accounts.chunks(batch.max(1)).enumerate() {
        if i > 0 {
            tokio::time::sleep(stagger).await;
        }
        for account in chunk {
            if let Some(channel) = channels.get(account) {
                if channel.assign_lobby(lobby_id).is_err() {
                    debug!(account = %account, "Session inbox closed");
                }
            }
        }
    }
}
