//! Bot session - one account driven through login, coordinator handshake
//! and the leader or follower lobby flow
//!
//! A session is a single-writer state machine. All of its inputs (transport
//! events, timer fires, fleet commands) arrive through one inbox and are
//! handled in order; no handler ever sleeps. Anything that has to happen
//! later is a [`Timers`] entry that posts back into the same inbox.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::allocation::{JoinDecision, Reservation, RoomAllocationTable};
use crate::channel::{FleetEvent, SessionChannel, SessionCommand, SessionInput};
use crate::config::{Account, FleetSettings, Role};
use crate::error::TransportError;
use crate::protocol::{
    self, AbandonCurrentGame, ConnectionStatus, Hello, Inbound, JoinResult, JoinableLobbiesRequest,
    JoinableLobbiesResponse, LobbyCreate, LobbyCreateResponse, LobbyId, LobbyJoin, LobbyJoinResponse, LobbyLeave,
    LobbySnapshot, MessageCodec, Payload, ReadyUp, ReadyUpStatus, SetTeamSlot, TEAM_PLAYER_POOL,
};
use crate::proxy::ProxySupervisor;
use crate::seeding::{LobbySeedingController, SeedDecision};
use crate::timer::{TimerFired, TimerKind, Timers};
use crate::transport::{ErrorClass, SessionTransport, TransportErrorKind, TransportEvent, TransportFactory, TransportSink};

/// Engine id announced in the coordinator hello
const HELLO_ENGINE: u32 = 1;

/// Lobby slot claimed after joining
const TEAM_SLOT: u32 = 1;

/// Steps of the lobby entry sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LobbyPhase {
    Entering,
    TeamSet,
    Ready,
}

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Offline,
    LoggingIn,
    Online,
    ConnectingCoordinator,
    CreatingLobby,
    Seeding,
    IdlePool,
    Joining,
    InLobby(LobbyPhase),
    Reconnecting,
    LeavingLobby,
    Abandoned,
}

impl SessionState {
    /// Any phase of the lobby entry sequence
    pub fn is_in_lobby(&self) -> bool {
        matches!(self, SessionState::InLobby(_))
    }
}

/// Fleet-wide services a session works against
#[derive(Clone)]
pub struct SessionContext {
    pub settings: Arc<FleetSettings>,
    pub proxies: Arc<ProxySupervisor>,
    pub table: Arc<RoomAllocationTable>,
    pub factory: Arc<dyn TransportFactory>,
    pub codec: Arc<dyn MessageCodec>,
    pub events: mpsc::UnboundedSender<FleetEvent>,
}

/// One account's session
pub struct BotSession {
    pub id: Uuid,
    account: Account,
    ctx: SessionContext,
    state: SessionState,
    inbox_tx: mpsc::UnboundedSender<SessionInput>,
    timers: Timers,
    transport: Box<dyn SessionTransport>,
    epoch: u64,
    proxy_index: Option<usize>,
    lobby_id: Option<LobbyId>,
    join_target: Option<LobbyId>,
    rejoin_target: Option<LobbyId>,
    reservation: Option<Reservation>,
    seeder: Option<LobbySeedingController>,
    login_timeouts: u32,
    failures: u32,
    join_failures: u32,
    health_misses: u32,
    create_sent: bool,
    direct_join_exhausted: bool,
    shutting_down: bool,
}

impl BotSession {
    /// Create a session bound to its initial proxy
    ///
    /// `role_index` is the account's position among accounts of the same role.
    pub fn new(account: Account, role_index: usize, ctx: SessionContext, channel: &SessionChannel) -> Self {
        let inbox_tx = channel.sender();
        let proxy_index = ctx.proxies.assign(&account.username, account.role, role_index);
        let epoch = 1;
        let transport = ctx.factory.build(
            &account,
            ctx.proxies.endpoint(proxy_index),
            TransportSink::new(epoch, inbox_tx.clone()),
        );
        let seeder = (account.is_leader() && ctx.settings.seeding)
            .then(|| LobbySeedingController::new(ctx.settings.lobby_name.clone()));
        let id = Uuid::new_v4();

        info!(session_id = %id, account = %account.username, role = ?account.role, proxy = ?proxy_index, "Creating bot session");

        Self {
            id,
            account,
            ctx,
            state: SessionState::Offline,
            timers: Timers::new(inbox_tx.clone()),
            inbox_tx,
            transport,
            epoch,
            proxy_index,
            lobby_id: None,
            join_target: None,
            rejoin_target: None,
            reservation: None,
            seeder,
            login_timeouts: 0,
            failures: 0,
            join_failures: 0,
            health_misses: 0,
            create_sent: false,
            direct_join_exhausted: false,
            shutting_down: false,
        }
    }

    /// Username this session logs in as
    pub fn account(&self) -> &str {
        &self.account.username
    }

    /// Leader or follower
    pub fn role(&self) -> Role {
        self.account.role
    }

    /// Current protocol state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Lobby the session is sitting in
    pub fn lobby_id(&self) -> Option<LobbyId> {
        self.lobby_id
    }

    /// Lobby a join is in flight for
    pub fn join_target(&self) -> Option<LobbyId> {
        self.join_target
    }

    /// Pool index of the proxy in use, `None` when connecting directly
    pub fn proxy_index(&self) -> Option<usize> {
        self.proxy_index
    }

    /// Generation of the current transport
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Consecutive network failures since the last successful login
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether a timer of `kind` is pending
    pub fn has_timer(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    /// Number of pending timers
    pub fn armed_timers(&self) -> usize {
        self.timers.armed_count()
    }

    /// Seeding state, only present on a seeding leader
    pub fn seeder(&self) -> Option<&LobbySeedingController> {
        self.seeder.as_ref()
    }

    /// Session is done and its loop can stop
    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Abandoned || (self.shutting_down && self.state == SessionState::Offline)
    }

    /// Drive the session until it is abandoned or vacated
    #[instrument(skip(self, inbox), fields(account = %self.account.username))]
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        self.start().await;
        while !self.is_finished() {
            let Some(input) = inbox.recv().await else {
                break;
            };
            self.handle(input).await;
        }
        self.timers.cancel_all();
        debug!(state = ?self.state, "Session loop finished");
    }

    /// Kick off the first login
    pub async fn start(&mut self) {
        if self.state == SessionState::Offline && !self.shutting_down {
            self.begin_login().await;
        }
    }

    /// Handle one input
    pub async fn handle(&mut self, input: SessionInput) {
        if self.state == SessionState::Abandoned {
            debug!(account = %self.account.username, input = ?input, "Ignoring input for abandoned session");
            return;
        }
        match input {
            SessionInput::Transport { epoch, event } => {
                if epoch != self.epoch {
                    debug!(account = %self.account.username, epoch, current = self.epoch, "Dropping event from replaced transport");
                    return;
                }
                self.on_transport_event(event).await;
            }
            SessionInput::Timer(fired) => self.on_timer(fired).await,
            SessionInput::Command(command) => self.on_command(command).await,
        }
    }


    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(account = %self.account.username, from = ?self.state, to = ?state, "State transition");
        self.state = state;
        self.emit(FleetEvent::StateChanged {
            account: self.account.username.clone(),
            state,
        });
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.ctx.events.send(event);
    }

    async fn send<P: Payload>(&self, payload: &P) {
        let (message_type, bytes) = match protocol::encode(self.ctx.codec.as_ref(), payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(account = %self.account.username, kind = ?P::KIND, error = %e, "Failed to encode message");
                return;
            }
        };
        if let Err(e) = self.transport.send_message(self.ctx.settings.app_id, message_type, bytes).await {
            warn!(account = %self.account.username, kind = ?P::KIND, error = %e, "Failed to send message");
        }
    }

    async fn send_lobby_list_request(&self) {
        self.send(&JoinableLobbiesRequest {
            app_id: self.ctx.settings.app_id,
            region: self.ctx.settings.lobby_region,
        })
        .await;
    }

    fn release_reservation(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            if reservation.release() {
                debug!(account = %self.account.username, lobby_id = %reservation.lobby_id(), "Released reservation");
            }
        }
    }

    fn post_error(&self, err: TransportError) {
        let _ = self.inbox_tx.send(SessionInput::Transport {
            epoch: self.epoch,
            event: TransportEvent::Error(err),
        });
    }

    /// Replace the transport, e.g. after a proxy change
    async fn rebuild_transport(&mut self, proxy_index: Option<usize>) {
        self.transport.log_off().await;
        self.epoch += 1;
        self.proxy_index = proxy_index;
        self.transport = self.ctx.factory.build(
            &self.account,
            self.ctx.proxies.endpoint(proxy_index),
            TransportSink::new(self.epoch, self.inbox_tx.clone()),
        );
        debug!(account = %self.account.username, epoch = self.epoch, proxy = ?proxy_index, "Rebuilt transport");
    }


    async fn begin_login(&mut self) {
        self.set_state(SessionState::LoggingIn);
        self.timers.arm(TimerKind::LoginTimeout, self.ctx.settings.login_timeout());
        info!(account = %self.account.username, proxy = ?self.proxy_index, "Logging in");
        if let Err(e) = self.transport.log_on(&self.account).await {
            self.post_error(e);
        }
    }

    async fn on_logged_on(&mut self) {
        if self.state != SessionState::LoggingIn {
            debug!(account = %self.account.username, state = ?self.state, "Duplicate logon ignored");
            return;
        }
        self.timers.cancel(TimerKind::LoginTimeout);
        self.login_timeouts = 0;
        self.failures = 0;
        self.ctx.proxies.record_success(self.proxy_index);
        info!(account = %self.account.username, "Logged on");

        if let Err(e) = self.transport.announce_presence().await {
            warn!(account = %self.account.username, error = %e, "Failed to announce presence");
        }
        self.set_state(SessionState::Online);
        if let Err(e) = self.transport.declare_online_intent(self.ctx.settings.app_id).await {
            self.post_error(e);
        }
    }

    async fn on_app_launched(&mut self, app_id: u32) {
        if app_id != self.ctx.settings.app_id || self.state != SessionState::Online {
            debug!(account = %self.account.username, app_id, state = ?self.state, "Ignoring app launch");
            return;
        }
        self.open_coordinator().await;
    }

    async fn open_coordinator(&mut self) {
        self.set_state(SessionState::ConnectingCoordinator);
        self.send(&Hello { engine: HELLO_ENGINE }).await;
        self.timers.arm(TimerKind::HelloRetry, self.ctx.settings.hello_retry());
    }

    async fn on_login_timeout(&mut self) {
        if self.state != SessionState::LoggingIn {
            return;
        }
        self.login_timeouts += 1;
        warn!(account = %self.account.username, attempts = self.login_timeouts, "Login timed out");
        if self.login_timeouts >= 2 {
            self.abandon("login timed out twice").await;
            return;
        }
        self.ctx.proxies.record_failure(self.proxy_index);
        let next = self
            .ctx
            .proxies
            .rotate(&self.account.username, self.account.role, self.proxy_index);
        self.rebuild_transport(next).await;
        self.begin_login().await;
    }

    async fn on_transport_error(&mut self, err: TransportError) {
        if self.shutting_down {
            debug!(account = %self.account.username, error = %err, "Ignoring error during shutdown");
            return;
        }
        match err.kind.class() {
            ErrorClass::Fatal => {
                self.abandon(&err.to_string()).await;
            }
            ErrorClass::RateLimited => {
                warn!(account = %self.account.username, "Rate limited, cooling down");
                self.teardown();
                self.schedule_login(self.proxy_index, self.ctx.settings.rate_limit_cooldown())
                    .await;
            }
            ErrorClass::Transient => {
                self.failures += 1;
                self.login_timeouts = 0;
                self.ctx.proxies.record_failure(self.proxy_index);
                warn!(account = %self.account.username, error = %err, failures = self.failures, "Network failure");
                self.teardown();
                // leaders stay on their proxy, followers move one along
                let next = self
                    .ctx
                    .proxies
                    .rotate(&self.account.username, self.account.role, self.proxy_index);
                let delay = self.ctx.settings.backoff(self.failures);
                info!(account = %self.account.username, delay = ?delay, proxy = ?next, "Backing off");
                self.schedule_login(next, delay).await;
            }
        }
    }

    /// Swap to a fresh transport on `proxy_index` and log in after `delay`
    async fn schedule_login(&mut self, proxy_index: Option<usize>, delay: std::time::Duration) {
        self.rebuild_transport(proxy_index).await;
        self.set_state(SessionState::Reconnecting);
        self.timers.arm(TimerKind::LoginRetry, delay);
    }

    /// Drop everything tied to the current connection
    fn teardown(&mut self) {
        self.timers.cancel_all();
        self.release_reservation();
        self.join_target = None;
        self.create_sent = false;
        if let Some(seeder) = &self.seeder {
            if let Some(confirmed) = seeder.confirmed() {
                if self.ctx.table.confirmed().is_some_and(|l| l.lobby_id == confirmed) {
                    self.ctx.table.clear_confirmed();
                }
                self.emit(FleetEvent::LobbyRetired { lobby_id: confirmed });
            }
        }
        if let Some(lobby_id) = self.lobby_id.take() {
            if self.seeder.is_none() {
                self.rejoin_target = Some(lobby_id);
            }
            self.emit(FleetEvent::LeftLobby {
                account: self.account.username.clone(),
                lobby_id,
            });
        }
    }

    /// Give up on this account for the rest of the run
    ///
    /// One-way and idempotent: a second call is a no-op.
    pub async fn abandon(&mut self, reason: &str) -> bool {
        if self.state == SessionState::Abandoned {
            return false;
        }
        error!(account = %self.account.username, reason, "Abandoning session");
        self.teardown();
        self.rejoin_target = None;
        self.ctx.proxies.release(&self.account.username, self.proxy_index);
        self.transport.log_off().await;
        self.set_state(SessionState::Abandoned);
        self.emit(FleetEvent::Abandoned {
            account: self.account.username.clone(),
            reason: reason.to_string(),
        });
        true
    }


    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LoggedOn => self.on_logged_on().await,
            TransportEvent::AppLaunched(app_id) => self.on_app_launched(app_id).await,
            TransportEvent::MessageReceived {
                app_id,
                message_type,
                payload,
            } => {
                if app_id != self.ctx.settings.app_id {
                    debug!(account = %self.account.username, app_id, "Message for another app");
                    return;
                }
                match protocol::decode_inbound(self.ctx.codec.as_ref(), message_type, &payload) {
                    Ok(inbound) => self.on_message(inbound).await,
                    Err(e) => {
                        warn!(account = %self.account.username, message_type, error = %e, "Discarding malformed message")
                    }
                }
            }
            TransportEvent::Error(err) => self.on_transport_error(err).await,
            TransportEvent::Disconnected => {
                if self.shutting_down {
                    self.set_state(SessionState::Offline);
                } else {
                    let err = TransportError::new(TransportErrorKind::ConnectionReset, "disconnected");
                    self.on_transport_error(err).await;
                }
            }
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            debug!(account = %self.account.username, kind = ?fired.kind, "Stale timer");
            return;
        }
        match fired.kind {
            TimerKind::LoginTimeout => self.on_login_timeout().await,
            TimerKind::LoginRetry => {
                if self.state == SessionState::Reconnecting {
                    self.begin_login().await;
                }
            }
            TimerKind::HelloRetry => {
                if self.state == SessionState::ConnectingCoordinator {
                    debug!(account = %self.account.username, "Resending hello");
                    self.send(&Hello { engine: HELLO_ENGINE }).await;
                    self.timers.arm(TimerKind::HelloRetry, self.ctx.settings.hello_retry());
                }
            }
            TimerKind::CreateTimeout => self.on_create_timeout().await,
            TimerKind::KeepAlive => {
                let waiting = self.seeder.as_ref().is_some_and(|s| s.confirmed().is_none());
                if self.state == SessionState::Seeding && waiting {
                    self.send(&Hello { engine: HELLO_ENGINE }).await;
                    self.timers.arm(TimerKind::KeepAlive, self.ctx.settings.keep_alive());
                }
            }
            TimerKind::JoinTimeout => {
                if self.state == SessionState::Joining {
                    warn!(account = %self.account.username, target = ?self.join_target, "Join timed out");
                    self.on_join_rejected(JoinResult::GenericError).await;
                }
            }
            TimerKind::JoinRetry => {
                if let (SessionState::Joining, Some(target)) = (self.state, self.join_target) {
                    let reservation = self.reservation.take();
                    self.begin_join(target, reservation).await;
                }
            }
            TimerKind::LobbyStep => self.advance_lobby_step().await,
            TimerKind::ReadyUp => {
                if let (SessionState::InLobby(LobbyPhase::Ready), Some(lobby_id)) = (self.state, self.lobby_id) {
                    self.send(&ReadyUp { lobby_id, ready: true }).await;
                    self.timers.arm(TimerKind::ReadyUp, self.ctx.settings.ready_up_interval());
                }
            }
            TimerKind::HealthCheck => {
                if self.state.is_in_lobby() {
                    self.send_lobby_list_request().await;
                    self.timers
                        .arm(TimerKind::HealthCheck, self.ctx.settings.health_check_interval());
                }
            }
            TimerKind::Poll => {
                if self.state == SessionState::IdlePool && self.ctx.settings.follower_self_poll {
                    self.send_lobby_list_request().await;
                    self.timers.arm(TimerKind::Poll, self.ctx.settings.poll_interval());
                }
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::AssignLobby(lobby_id) => {
                if self.account.role != Role::Follower || self.state != SessionState::IdlePool {
                    debug!(account = %self.account.username, state = ?self.state, lobby_id = %lobby_id, "Ignoring lobby assignment");
                    return;
                }
                match self.ctx.table.reserve_lobby(&self.account.username, lobby_id) {
                    JoinDecision::Join { lobby_id, reservation } => self.begin_join(lobby_id, Some(reservation)).await,
                    JoinDecision::Wait => {
                        debug!(account = %self.account.username, lobby_id = %lobby_id, "Assigned lobby has no room")
                    }
                }
            }
            SessionCommand::Vacate => self.vacate().await,
        }
    }

    async fn on_message(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Welcome(_) => self.on_coordinator_ready().await,
            Inbound::ConnectionStatus(status) => self.on_connection_status(status).await,
            Inbound::LobbyCreateResponse(resp) => self.on_create_response(resp).await,
            Inbound::LobbySnapshot(snapshot) => self.on_snapshot(snapshot).await,
            Inbound::LobbyJoinResponse(resp) => self.on_join_response(resp).await,
            Inbound::ReadyUpStatus(status) => self.on_ready_status(status).await,
            Inbound::JoinableLobbies(list) => self.on_lobby_list(list).await,
            Inbound::Unhandled(id) => debug!(account = %self.account.username, message_type = id, "Unhandled message"),
        }
    }


    async fn on_coordinator_ready(&mut self) {
        if self.state != SessionState::ConnectingCoordinator {
            return;
        }
        self.timers.cancel(TimerKind::HelloRetry);
        info!(account = %self.account.username, "Coordinator channel open");
        self.send(&LobbyLeave {}).await;
        self.send(&AbandonCurrentGame {}).await;
        self.start_role_flow().await;
    }

    async fn on_connection_status(&mut self, status: ConnectionStatus) {
        if status.is_healthy() {
            match self.state {
                SessionState::ConnectingCoordinator => self.on_coordinator_ready().await,
                SessionState::InLobby(_) => {
                    if let Some(lobby_id) = self.lobby_id {
                        debug!(account = %self.account.username, "Coordinator session restored, readying up");
                        self.send(&ReadyUp { lobby_id, ready: true }).await;
                    }
                }
                _ => {}
            }
            return;
        }

        match self.state {
            SessionState::Offline
            | SessionState::LoggingIn
            | SessionState::Online
            | SessionState::ConnectingCoordinator
            | SessionState::Reconnecting
            | SessionState::LeavingLobby
            | SessionState::Abandoned => {}
            _ => {
                warn!(account = %self.account.username, status = status.status, "Coordinator session lost");
                self.teardown();
                self.open_coordinator().await;
            }
        }
    }

    async fn start_role_flow(&mut self) {
        match self.account.role {
            Role::Leader if self.seeder.is_some() => self.begin_seeding_cycle().await,
            Role::Leader => {
                let target = self
                    .rejoin_target
                    .take()
                    .or(self.ctx.settings.leader_join_target.map(LobbyId));
                match target {
                    Some(target) if !self.direct_join_exhausted => self.begin_join(target, None).await,
                    _ => self.begin_create().await,
                }
            }
            Role::Follower => match self.rejoin_target.take() {
                Some(target) => self.begin_join(target, None).await,
                None => self.enter_idle_pool().await,
            },
        }
    }


    fn lobby_create(&self, name: String) -> LobbyCreate {
        LobbyCreate {
            name,
            password: self.ctx.settings.lobby_password.clone(),
            region: self.ctx.settings.lobby_region,
            fingerprint: self.ctx.settings.fingerprint,
        }
    }

    /// Single lobby creation for a non-seeding leader
    async fn begin_create(&mut self) {
        self.set_state(SessionState::CreatingLobby);
        if self.create_sent {
            return;
        }
        self.create_sent = true;
        info!(account = %self.account.username, name = %self.ctx.settings.lobby_name, "Creating lobby");
        self.send(&self.lobby_create(self.ctx.settings.lobby_name.clone())).await;
    }

    async fn begin_seeding_cycle(&mut self) {
        let Some(seeder) = self.seeder.as_mut() else {
            return;
        };
        let name = seeder.begin_cycle();
        self.set_state(SessionState::Seeding);
        self.send(&self.lobby_create(name)).await;
        self.timers.arm(TimerKind::CreateTimeout, self.ctx.settings.create_timeout());
        self.timers.arm(TimerKind::KeepAlive, self.ctx.settings.keep_alive());
    }

    async fn on_create_timeout(&mut self) {
        if self.state != SessionState::Seeding {
            return;
        }
        let Some(name) = self.seeder.as_mut().and_then(|s| s.on_create_timeout()) else {
            return;
        };
        warn!(account = %self.account.username, name = %name, "Lobby creation timed out, recreating");
        self.send(&LobbyLeave {}).await;
        self.send(&self.lobby_create(name)).await;
        self.timers.arm(TimerKind::CreateTimeout, self.ctx.settings.create_timeout());
    }

    async fn on_create_response(&mut self, resp: LobbyCreateResponse) {
        if resp.is_success() {
            debug!(account = %self.account.username, "Lobby create accepted");
            return;
        }
        warn!(account = %self.account.username, result = resp.result, "Lobby create rejected");
        if self.state == SessionState::Seeding {
            self.timers.cancel(TimerKind::CreateTimeout);
            self.on_create_timeout().await;
        }
    }

    async fn on_snapshot(&mut self, snapshot: LobbySnapshot) {
        let lobby = &snapshot.lobby;
        if snapshot.removed {
            self.ctx.table.remove(lobby.lobby_id);
        } else {
            self.ctx.table.observe(lobby);
        }

        match self.state {
            SessionState::Seeding => {
                let decision = match self.seeder.as_mut() {
                    Some(seeder) => seeder.on_snapshot(lobby, snapshot.removed),
                    None => SeedDecision::Ignore,
                };
                self.apply_seed_decision(decision).await;
            }
            SessionState::CreatingLobby => {
                if !snapshot.removed && lobby.name == self.ctx.settings.lobby_name {
                    info!(account = %self.account.username, lobby_id = %lobby.lobby_id, "Lobby created");
                    self.ctx.table.publish_confirmed(lobby.clone());
                    self.emit(FleetEvent::LobbyConfirmed { lobby: lobby.clone() });
                    self.enter_lobby(lobby.lobby_id).await;
                }
            }
            SessionState::InLobby(_) => {
                if snapshot.removed && self.lobby_id == Some(lobby.lobby_id) {
                    self.on_lobby_lost("lobby removed").await;
                }
            }
            _ => {}
        }
    }

    async fn apply_seed_decision(&mut self, decision: SeedDecision) {
        match decision {
            SeedDecision::Publish(lobby) => {
                self.timers.cancel(TimerKind::CreateTimeout);
                self.timers.cancel(TimerKind::KeepAlive);
                self.lobby_id = Some(lobby.lobby_id);
                info!(account = %self.account.username, lobby_id = %lobby.lobby_id, name = %lobby.name, "Lobby confirmed");
                self.ctx.table.publish_confirmed(lobby.clone());
                self.emit(FleetEvent::LobbyConfirmed { lobby });
            }
            SeedDecision::Pivot { retired } => {
                self.send(&LobbyLeave {}).await;
                if self.ctx.table.confirmed().is_some_and(|l| l.lobby_id == retired) {
                    self.ctx.table.clear_confirmed();
                }
                self.lobby_id = None;
                self.emit(FleetEvent::LobbyRetired { lobby_id: retired });
                self.begin_seeding_cycle().await;
            }
            SeedDecision::Recreate { name } => {
                warn!(account = %self.account.username, name = %name, "Lobby vanished before confirmation");
                self.send(&self.lobby_create(name)).await;
                self.timers.arm(TimerKind::CreateTimeout, self.ctx.settings.create_timeout());
            }
            SeedDecision::Ignore => {}
        }
    }


    async fn enter_idle_pool(&mut self) {
        self.set_state(SessionState::IdlePool);
        if self.ctx.settings.follower_self_poll {
            self.send_lobby_list_request().await;
            self.timers.arm(TimerKind::Poll, self.ctx.settings.poll_interval());
        }
    }

    async fn begin_join(&mut self, lobby_id: LobbyId, reservation: Option<Reservation>) {
        if self.reservation.as_ref().map(|r| r.lobby_id()) != reservation.as_ref().map(|r| r.lobby_id()) {
            self.release_reservation();
        }
        if reservation.is_some() {
            self.reservation = reservation;
        }
        self.timers.cancel(TimerKind::Poll);
        self.join_target = Some(lobby_id);
        self.set_state(SessionState::Joining);
        info!(account = %self.account.username, lobby_id = %lobby_id, "Joining lobby");
        self.send(&LobbyJoin {
            lobby_id,
            password: self.ctx.settings.lobby_password.clone(),
            fingerprint: self.ctx.settings.fingerprint,
        })
        .await;
        self.timers.arm(TimerKind::JoinTimeout, self.ctx.settings.join_timeout());
    }

    async fn on_join_response(&mut self, resp: LobbyJoinResponse) {
        if self.state != SessionState::Joining {
            debug!(account = %self.account.username, state = ?self.state, "Unexpected join response");
            return;
        }
        self.timers.cancel(TimerKind::JoinTimeout);
        match (resp.result, self.join_target) {
            (JoinResult::Success, Some(target)) => {
                self.join_failures = 0;
                // the slot stays reserved until it expires, covering the lag before snapshots show us
                self.reservation = None;
                self.enter_lobby(target).await;
            }
            (result, _) => self.on_join_rejected(result).await,
        }
    }

    async fn on_join_rejected(&mut self, result: JoinResult) {
        self.join_failures += 1;
        warn!(
            account = %self.account.username,
            target = ?self.join_target,
            result = ?result,
            failures = self.join_failures,
            "Join rejected"
        );
        let retry_same = match result {
            JoinResult::AlreadyInGame => {
                self.send(&AbandonCurrentGame {}).await;
                self.send(&LobbyLeave {}).await;
                true
            }
            JoinResult::InvalidLobby | JoinResult::NoLobbyFound | JoinResult::GenericError | JoinResult::Other(_) => true,
            _ => false,
        };
        if retry_same && self.join_failures < self.ctx.settings.max_direct_join_failures {
            self.timers.arm(TimerKind::JoinRetry, self.ctx.settings.join_retry());
            return;
        }
        if let Some(target) = self.join_target {
            match result {
                JoinResult::LobbyFull
                | JoinResult::AccessDenied
                | JoinResult::IncorrectPassword
                | JoinResult::IncorrectVersion => self.ctx.table.mark_full(target),
                JoinResult::InvalidLobby | JoinResult::NoLobbyFound => self.ctx.table.remove(target),
                _ => {}
            }
        }
        self.give_up_target().await;
    }

    async fn give_up_target(&mut self) {
        self.release_reservation();
        if let Some(target) = self.join_target.take() {
            debug!(account = %self.account.username, lobby_id = %target, "Dropping join target");
        }
        self.join_failures = 0;
        match self.account.role {
            Role::Leader => {
                self.direct_join_exhausted = true;
                self.begin_create().await;
            }
            Role::Follower => {
                self.enter_idle_pool().await;
                if !self.ctx.settings.follower_self_poll {
                    self.try_allocate().await;
                }
            }
        }
    }

    /// Ask the allocation table where to go
    async fn try_allocate(&mut self) {
        match self.ctx.table.request_join_slot(&self.account.username) {
            JoinDecision::Join { lobby_id, reservation } => self.begin_join(lobby_id, Some(reservation)).await,
            JoinDecision::Wait => debug!(account = %self.account.username, "Waiting for a lobby"),
        }
    }

    async fn on_lobby_list(&mut self, list: JoinableLobbiesResponse) {
        self.ctx.table.observe_all(&list.lobbies);
        match self.state {
            SessionState::IdlePool => self.try_allocate().await,
            SessionState::InLobby(_) => {
                let Some(lobby_id) = self.lobby_id else {
                    return;
                };
                if list.lobbies.iter().any(|l| l.lobby_id == lobby_id) {
                    self.health_misses = 0;
                    return;
                }
                self.health_misses += 1;
                debug!(account = %self.account.username, lobby_id = %lobby_id, misses = self.health_misses, "Lobby missing from list");
                if self.health_misses >= self.ctx.settings.health_miss_limit {
                    self.on_lobby_lost("lobby missing from listings").await;
                }
            }
            _ => {}
        }
    }


    async fn enter_lobby(&mut self, lobby_id: LobbyId) {
        self.lobby_id = Some(lobby_id);
        self.join_target = None;
        self.health_misses = 0;
        self.set_state(SessionState::InLobby(LobbyPhase::Entering));
        info!(account = %self.account.username, lobby_id = %lobby_id, "Entered lobby");
        self.emit(FleetEvent::JoinedLobby {
            account: self.account.username.clone(),
            lobby_id,
        });
        self.timers.arm(TimerKind::LobbyStep, self.ctx.settings.team_slot_delay());
    }

    async fn advance_lobby_step(&mut self) {
        let Some(lobby_id) = self.lobby_id else {
            return;
        };
        match self.state {
            SessionState::InLobby(LobbyPhase::Entering) => {
                self.send(&SetTeamSlot {
                    team: TEAM_PLAYER_POOL,
                    slot: TEAM_SLOT,
                })
                .await;
                self.set_state(SessionState::InLobby(LobbyPhase::TeamSet));
                self.timers.arm(TimerKind::LobbyStep, self.ctx.settings.ready_up_delay());
            }
            SessionState::InLobby(LobbyPhase::TeamSet) => {
                self.send(&ReadyUp { lobby_id, ready: true }).await;
                self.set_state(SessionState::InLobby(LobbyPhase::Ready));
                self.timers.arm(TimerKind::ReadyUp, self.ctx.settings.ready_up_interval());
                self.timers
                    .arm(TimerKind::HealthCheck, self.ctx.settings.health_check_interval());
            }
            _ => {}
        }
    }

    async fn on_ready_status(&mut self, status: ReadyUpStatus) {
        if !self.state.is_in_lobby() || self.lobby_id != Some(status.lobby_id) {
            return;
        }
        if !status.ready_accounts.iter().any(|a| *a == self.account.username) {
            debug!(account = %self.account.username, "Not marked ready, readying up");
            self.send(&ReadyUp {
                lobby_id: status.lobby_id,
                ready: true,
            })
            .await;
        }
    }

    async fn on_lobby_lost(&mut self, reason: &str) {
        warn!(account = %self.account.username, lobby_id = ?self.lobby_id, reason, "Lobby lost");
        self.timers.cancel(TimerKind::LobbyStep);
        self.timers.cancel(TimerKind::ReadyUp);
        self.timers.cancel(TimerKind::HealthCheck);
        self.health_misses = 0;
        if let Some(lobby_id) = self.lobby_id.take() {
            self.ctx.table.remove(lobby_id);
            if self.ctx.table.confirmed().is_some_and(|l| l.lobby_id == lobby_id) {
                self.ctx.table.clear_confirmed();
            }
            self.emit(FleetEvent::LeftLobby {
                account: self.account.username.clone(),
                lobby_id,
            });
        }
        self.create_sent = false;
        self.set_state(SessionState::Online);
        self.start_role_flow().await;
    }


    async fn vacate(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.timers.cancel_all();
        self.release_reservation();
        info!(account = %self.account.username, "Vacating");
        if self.lobby_id.is_some() || self.join_target.is_some() || self.state == SessionState::Seeding {
            self.set_state(SessionState::LeavingLobby);
            self.send(&LobbyLeave {}).await;
            self.send(&AbandonCurrentGame {}).await;
        }
        if let Some(lobby_id) = self.lobby_id.take() {
            self.emit(FleetEvent::LeftLobby {
                account: self.account.username.clone(),
                lobby_id,
            });
        }
        if self.seeder.is_some() {
            self.ctx.table.clear_confirmed();
        }
        self.join_target = None;
        self.transport.log_off().await;
        self.ctx.proxies.release(&self.account.username, self.proxy_index);
        self.set_state(SessionState::Offline);
        self.emit(FleetEvent::Vacated {
            account: self.account.username.clone(),
        });
    }
}
