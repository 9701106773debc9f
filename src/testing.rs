//! Test doubles: recording transport, fake coordinator and a JSON codec

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::{Account, ProxyEndpoint};
use crate::error::{SchemaError, TransportError};
use crate::transport::TransportErrorKind;
use crate::protocol::{
    mask, unmask, JoinResult, JoinableLobbiesResponse, Lobby, LobbyCreate, LobbyCreateResponse, LobbyId, LobbyJoin,
    LobbyJoinResponse, LobbySnapshot, MessageCodec, MessageKind, Payload, Welcome,
};
use crate::transport::{SessionTransport, TransportEvent, TransportFactory, TransportSink};

/// Codec that treats the structured value as JSON bytes
pub(crate) struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, kind: &str, value: &Value) -> Result<Vec<u8>, SchemaError> {
        serde_json::to_vec(value).map_err(|e| SchemaError::malformed(kind, e))
    }

    fn decode(&self, kind: &str, bytes: &[u8]) -> Result<Value, SchemaError> {
        serde_json::from_slice(bytes).map_err(|e| SchemaError::malformed(kind, e))
    }
}

pub(crate) fn wire<P: Payload>(payload: &P) -> TransportEvent {
    TransportEvent::MessageReceived {
        app_id: 570,
        message_type: mask(P::KIND.id()),
        payload: serde_json::to_vec(payload).unwrap(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    LogOn,
    AnnouncePresence,
    DeclareIntent(u32),
    Send { message_type: u32, payload: Vec<u8> },
    LogOff,
}

/// Everything every mock transport was asked to do
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    calls: Mutex<Vec<(String, Call)>>,
    builds: Mutex<Vec<(String, Option<ProxyEndpoint>)>>,
}

impl Recorder {
    fn record(&self, account: &str, call: Call) {
        self.calls.lock().push((account.to_string(), call));
    }

    pub fn calls(&self, account: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|(a, _)| a == account)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn sent_kinds(&self, account: &str) -> Vec<MessageKind> {
        self.calls(account)
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { message_type, .. } => MessageKind::from_id(unmask(message_type).0),
                _ => None,
            })
            .collect()
    }

    pub fn sent<P: Payload>(&self, account: &str) -> Vec<P> {
        self.calls(account)
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { message_type, payload } if unmask(message_type).0 == P::KIND.id() => {
                    serde_json::from_slice(&payload).ok()
                }
                _ => None,
            })
            .collect()
    }

    pub fn log_ons(&self, account: &str) -> usize {
        self.calls(account).iter().filter(|c| **c == Call::LogOn).count()
    }

    pub fn builds(&self, account: &str) -> Vec<Option<ProxyEndpoint>> {
        self.builds
            .lock()
            .iter()
            .filter(|(a, _)| a == account)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

struct MockTransport {
    account: String,
    sink: TransportSink,
    recorder: Arc<Recorder>,
    coordinator: Option<Arc<FakeCoordinator>>,
    refuse: bool,
}

#[async_trait]
impl SessionTransport for MockTransport {
    async fn log_on(&self, _account: &Account) -> Result<(), TransportError> {
        self.recorder.record(&self.account, Call::LogOn);
        if self.refuse {
            self.sink.emit(TransportEvent::Error(TransportError::new(
                TransportErrorKind::ProxyUnreachable,
                "connection refused",
            )));
        } else if self.coordinator.is_some() {
            self.sink.emit(TransportEvent::LoggedOn);
        }
        Ok(())
    }

    async fn announce_presence(&self) -> Result<(), TransportError> {
        self.recorder.record(&self.account, Call::AnnouncePresence);
        Ok(())
    }

    async fn declare_online_intent(&self, app_id: u32) -> Result<(), TransportError> {
        self.recorder.record(&self.account, Call::DeclareIntent(app_id));
        if self.coordinator.is_some() {
            self.sink.emit(TransportEvent::AppLaunched(app_id));
        }
        Ok(())
    }

    async fn send_message(&self, _app_id: u32, message_type: u32, payload: Vec<u8>) -> Result<(), TransportError> {
        self.recorder.record(
            &self.account,
            Call::Send {
                message_type,
                payload: payload.clone(),
            },
        );
        if let Some(coordinator) = &self.coordinator {
            coordinator.handle(&self.account, &self.sink, message_type, &payload);
        }
        Ok(())
    }

    async fn log_off(&self) {
        self.recorder.record(&self.account, Call::LogOff);
        if let Some(coordinator) = &self.coordinator {
            coordinator.leave(&self.account);
        }
    }
}

/// Factory handing out recording transports
pub(crate) struct MockFactory {
    recorder: Arc<Recorder>,
    coordinator: Option<Arc<FakeCoordinator>>,
    refuse: bool,
}

impl MockFactory {
    /// Transports that record calls and never answer
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            coordinator: None,
            refuse: false,
        }
    }

    /// Transports whose every login fails with an unreachable proxy
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new()
        }
    }

    /// Transports wired to an in-memory coordinator
    pub fn with_coordinator(max_members: usize) -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            coordinator: Some(Arc::new(FakeCoordinator::new(max_members))),
            refuse: false,
        }
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }

    pub fn coordinator(&self) -> Option<Arc<FakeCoordinator>> {
        self.coordinator.clone()
    }
}

impl TransportFactory for MockFactory {
    fn build(&self, account: &Account, proxy: Option<&ProxyEndpoint>, sink: TransportSink) -> Box<dyn SessionTransport> {
        self.recorder
            .builds
            .lock()
            .push((account.username.clone(), proxy.cloned()));
        Box::new(MockTransport {
            account: account.username.clone(),
            sink,
            recorder: Arc::clone(&self.recorder),
            coordinator: self.coordinator.clone(),
            refuse: self.refuse,
        })
    }
}

#[derive(Debug)]
struct FakeLobby {
    name: String,
    members: Vec<String>,
}

#[derive(Default)]
struct CoordinatorState {
    lobbies: HashMap<u64, FakeLobby>,
    sinks: HashMap<String, TransportSink>,
    location: HashMap<String, u64>,
}

/// Minimal in-memory lobby coordinator
pub(crate) struct FakeCoordinator {
    max_members: usize,
    next_id: AtomicU64,
    state: Mutex<CoordinatorState>,
}

impl FakeCoordinator {
    fn new(max_members: usize) -> Self {
        Self {
            max_members,
            next_id: AtomicU64::new(100),
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    pub fn members(&self, lobby_id: LobbyId) -> Vec<String> {
        self.state
            .lock()
            .lobbies
            .get(&lobby_id.0)
            .map(|l| l.members.clone())
            .unwrap_or_default()
    }

    pub fn lobby_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().lobbies.values().map(|l| l.name.clone()).collect();
        names.sort();
        names
    }

    fn reply<P: Payload>(sink: &TransportSink, payload: &P) {
        sink.emit(wire(payload));
    }

    fn lobby_view(id: u64, lobby: &FakeLobby) -> Lobby {
        Lobby {
            lobby_id: LobbyId(id),
            name: lobby.name.clone(),
            member_count: lobby.members.len() as u32,
            region: 0,
            fingerprint: Default::default(),
        }
    }

    fn broadcast(state: &CoordinatorState, id: u64) {
        if let Some(lobby) = state.lobbies.get(&id) {
            let snapshot = LobbySnapshot {
                lobby: Self::lobby_view(id, lobby),
                removed: false,
            };
            for member in &lobby.members {
                if let Some(sink) = state.sinks.get(member) {
                    Self::reply(sink, &snapshot);
                }
            }
        }
    }

    fn leave_locked(state: &mut CoordinatorState, account: &str) {
        let Some(id) = state.location.remove(account) else {
            return;
        };
        let empty = match state.lobbies.get_mut(&id) {
            Some(lobby) => {
                lobby.members.retain(|m| m != account);
                lobby.members.is_empty()
            }
            None => false,
        };
        if empty {
            state.lobbies.remove(&id);
        } else {
            Self::broadcast(state, id);
        }
    }

    fn leave(&self, account: &str) {
        Self::leave_locked(&mut self.state.lock(), account);
    }

    fn handle(&self, account: &str, sink: &TransportSink, message_type: u32, payload: &[u8]) {
        let mut state = self.state.lock();
        state.sinks.insert(account.to_string(), sink.clone());

        let Some(kind) = MessageKind::from_id(unmask(message_type).0) else {
            return;
        };
        match kind {
            MessageKind::Hello => Self::reply(sink, &Welcome { version: 1 }),
            MessageKind::LobbyLeave | MessageKind::AbandonCurrentGame => Self::leave_locked(&mut state, account),
            MessageKind::LobbyCreate => {
                let Ok(create) = serde_json::from_slice::<LobbyCreate>(payload) else {
                    return;
                };
                Self::leave_locked(&mut state, account);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                state.lobbies.insert(
                    id,
                    FakeLobby {
                        name: create.name,
                        members: vec![account.to_string()],
                    },
                );
                state.location.insert(account.to_string(), id);
                Self::reply(sink, &LobbyCreateResponse { result: 0 });
                Self::broadcast(&state, id);
            }
            MessageKind::LobbyJoin => {
                let Ok(join) = serde_json::from_slice::<LobbyJoin>(payload) else {
                    return;
                };
                let id = join.lobby_id.0;
                let result = match state.lobbies.get(&id) {
                    None => JoinResult::InvalidLobby,
                    Some(lobby) if lobby.members.len() >= self.max_members => JoinResult::LobbyFull,
                    Some(_) => JoinResult::Success,
                };
                if result == JoinResult::Success {
                    Self::leave_locked(&mut state, account);
                    if let Some(lobby) = state.lobbies.get_mut(&id) {
                        lobby.members.push(account.to_string());
                    }
                    state.location.insert(account.to_string(), id);
                }
                Self::reply(sink, &LobbyJoinResponse { result });
                if result == JoinResult::Success {
                    Self::broadcast(&state, id);
                }
            }
            MessageKind::JoinableLobbiesRequest => {
                let lobbies = state
                    .lobbies
                    .iter()
                    .map(|(id, lobby)| Self::lobby_view(*id, lobby))
                    .collect();
                Self::reply(sink, &JoinableLobbiesResponse { lobbies });
            }
            _ => {}
        }
    }
}
