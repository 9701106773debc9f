//! Coordinator protocol surface
//!
//! Every message kind the engine sends or receives is a fixed-schema payload
//! type implementing [`Payload`]. The core owns the mapping from numeric
//! message ids to kind names; the external [`MessageCodec`] only turns a
//! structured value into bytes and back.
//!
//! Ids on the wire carry a high bit marking structured (schema-encoded)
//! messages. [`mask`] sets it before sending and [`unmask`] strips it on
//! receipt; raw messages of a known kind are reported as unhandled.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaError;

/// High bit flagging a schema-encoded message
pub const PROTO_MASK: u32 = 0x8000_0000;

/// Team id of the unassigned player pool
pub const TEAM_PLAYER_POOL: u32 = 4;

/// Connection status reported while the coordinator session is healthy
pub const STATUS_HAVE_SESSION: u32 = 0;

pub fn mask(id: u32) -> u32 {
    id | PROTO_MASK
}

/// Split a wire id into the bare id and the structured flag
pub fn unmask(raw: u32) -> (u32, bool) {
    (raw & !PROTO_MASK, raw & PROTO_MASK != 0)
}

/// Opaque 64-bit lobby handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LobbyId(pub u64);

impl std::fmt::Display for LobbyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build identity required to create or join a lobby of a given game build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameFingerprint {
    pub crc: u64,
    pub timestamp: u32,
}

/// Coordinator-side lobby as mirrored from snapshots and listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lobby {
    pub lobby_id: LobbyId,
    pub name: String,
    #[serde(default)]
    pub member_count: u32,
    #[serde(default)]
    pub region: u32,
    #[serde(default)]
    pub fingerprint: GameFingerprint,
}

/// Message kinds the engine knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Welcome,
    ConnectionStatus,
    LobbyCreate,
    LobbyCreateResponse,
    LobbySnapshot,
    LobbyJoin,
    LobbyJoinResponse,
    LobbyLeave,
    AbandonCurrentGame,
    SetTeamSlot,
    ReadyUp,
    ReadyUpStatus,
    JoinableLobbiesRequest,
    JoinableLobbiesResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 15] = [
        MessageKind::Hello,
        MessageKind::Welcome,
        MessageKind::ConnectionStatus,
        MessageKind::LobbyCreate,
        MessageKind::LobbyCreateResponse,
        MessageKind::LobbySnapshot,
        MessageKind::LobbyJoin,
        MessageKind::LobbyJoinResponse,
        MessageKind::LobbyLeave,
        MessageKind::AbandonCurrentGame,
        MessageKind::SetTeamSlot,
        MessageKind::ReadyUp,
        MessageKind::ReadyUpStatus,
        MessageKind::JoinableLobbiesRequest,
        MessageKind::JoinableLobbiesResponse,
    ];

    /// Numeric id without the structured flag
    pub fn id(self) -> u32 {
        match self {
            MessageKind::Hello => 4006,
            MessageKind::Welcome => 4004,
            MessageKind::ConnectionStatus => 4009,
            MessageKind::LobbyCreate => 7038,
            MessageKind::LobbyCreateResponse => 7055,
            MessageKind::LobbySnapshot => 26,
            MessageKind::LobbyJoin => 7044,
            MessageKind::LobbyJoinResponse => 7113,
            MessageKind::LobbyLeave => 7040,
            MessageKind::AbandonCurrentGame => 7035,
            MessageKind::SetTeamSlot => 7047,
            MessageKind::ReadyUp => 7070,
            MessageKind::ReadyUpStatus => 7170,
            MessageKind::JoinableLobbiesRequest => 7468,
            MessageKind::JoinableLobbiesResponse => 7469,
        }
    }

    /// Schema name handed to the codec
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Hello => "ClientHello",
            MessageKind::Welcome => "ClientWelcome",
            MessageKind::ConnectionStatus => "ConnectionStatus",
            MessageKind::LobbyCreate => "PracticeLobbyCreate",
            MessageKind::LobbyCreateResponse => "PracticeLobbyResponse",
            MessageKind::LobbySnapshot => "LobbySnapshot",
            MessageKind::LobbyJoin => "PracticeLobbyJoin",
            MessageKind::LobbyJoinResponse => "PracticeLobbyJoinResponse",
            MessageKind::LobbyLeave => "PracticeLobbyLeave",
            MessageKind::AbandonCurrentGame => "AbandonCurrentGame",
            MessageKind::SetTeamSlot => "PracticeLobbySetTeamSlot",
            MessageKind::ReadyUp => "ReadyUp",
            MessageKind::ReadyUpStatus => "ReadyUpStatus",
            MessageKind::JoinableLobbiesRequest => "JoinableCustomLobbiesRequest",
            MessageKind::JoinableLobbiesResponse => "JoinableCustomLobbiesResponse",
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.id() == id)
    }
}

/// Converts structured values to bytes for a named kind and back
pub trait MessageCodec: Send + Sync {
    fn encode(&self, kind: &str, value: &Value) -> Result<Vec<u8>, SchemaError>;
    fn decode(&self, kind: &str, bytes: &[u8]) -> Result<Value, SchemaError>;
}

/// A fixed-schema coordinator payload
pub trait Payload: Serialize + DeserializeOwned {
    const KIND: MessageKind;
}

/// Encode a payload into its masked wire id and bytes
pub fn encode<P: Payload>(codec: &dyn MessageCodec, payload: &P) -> Result<(u32, Vec<u8>), SchemaError> {
    let kind = P::KIND.name();
    let value = serde_json::to_value(payload).map_err(|e| SchemaError::malformed(kind, e))?;
    let bytes = codec.encode(kind, &value)?;
    Ok((mask(P::KIND.id()), bytes))
}

fn decode_as<P: Payload>(codec: &dyn MessageCodec, bytes: &[u8]) -> Result<P, SchemaError> {
    let kind = P::KIND.name();
    let value = codec.decode(kind, bytes)?;
    serde_json::from_value(value).map_err(|e| SchemaError::malformed(kind, e))
}

/// Hello sent to open the coordinator channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub engine: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: u32,
}

impl ConnectionStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == STATUS_HAVE_SESSION
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyCreate {
    pub name: String,
    pub password: Option<String>,
    pub region: u32,
    pub fingerprint: GameFingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyCreateResponse {
    pub result: u32,
}

impl LobbyCreateResponse {
    pub fn is_success(&self) -> bool {
        self.result == 0
    }
}

/// Full or partial lobby state pushed by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbySnapshot {
    pub lobby: Lobby,
    /// The lobby object was destroyed on the coordinator
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyJoin {
    pub lobby_id: LobbyId,
    pub password: Option<String>,
    pub fingerprint: GameFingerprint,
}

/// Result code of a join attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum JoinResult {
    Success,
    AlreadyInGame,
    InvalidLobby,
    IncorrectPassword,
    AccessDenied,
    GenericError,
    IncorrectVersion,
    InTeamParty,
    NoLobbyFound,
    LobbyFull,
    Other(i32),
}

impl From<i32> for JoinResult {
    fn from(code: i32) -> Self {
        match code {
            0 => JoinResult::Success,
            1 => JoinResult::AlreadyInGame,
            2 => JoinResult::InvalidLobby,
            3 => JoinResult::IncorrectPassword,
            4 => JoinResult::AccessDenied,
            5 => JoinResult::GenericError,
            6 => JoinResult::IncorrectVersion,
            7 => JoinResult::InTeamParty,
            8 => JoinResult::NoLobbyFound,
            9 => JoinResult::LobbyFull,
            other => JoinResult::Other(other),
        }
    }
}

impl From<JoinResult> for i32 {
    fn from(result: JoinResult) -> Self {
        match result {
            JoinResult::Success => 0,
            JoinResult::AlreadyInGame => 1,
            JoinResult::InvalidLobby => 2,
            JoinResult::IncorrectPassword => 3,
            JoinResult::AccessDenied => 4,
            JoinResult::GenericError => 5,
            JoinResult::IncorrectVersion => 6,
            JoinResult::InTeamParty => 7,
            JoinResult::NoLobbyFound => 8,
            JoinResult::LobbyFull => 9,
            JoinResult::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyJoinResponse {
    pub result: JoinResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LobbyLeave {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbandonCurrentGame {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTeamSlot {
    pub team: u32,
    pub slot: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyUp {
    pub lobby_id: LobbyId,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyUpStatus {
    pub lobby_id: LobbyId,
    #[serde(default)]
    pub ready_accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinableLobbiesRequest {
    pub app_id: u32,
    pub region: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinableLobbiesResponse {
    #[serde(default)]
    pub lobbies: Vec<Lobby>,
}

macro_rules! payload_kind {
    ($($ty:ident => $kind:ident),* $(,)?) => {
        $(impl Payload for $ty {
            const KIND: MessageKind = MessageKind::$kind;
        })*
    };
}

payload_kind! {
    Hello => Hello,
    Welcome => Welcome,
    ConnectionStatus => ConnectionStatus,
    LobbyCreate => LobbyCreate,
    LobbyCreateResponse => LobbyCreateResponse,
    LobbySnapshot => LobbySnapshot,
    LobbyJoin => LobbyJoin,
    LobbyJoinResponse => LobbyJoinResponse,
    LobbyLeave => LobbyLeave,
    AbandonCurrentGame => AbandonCurrentGame,
    SetTeamSlot => SetTeamSlot,
    ReadyUp => ReadyUp,
    ReadyUpStatus => ReadyUpStatus,
    JoinableLobbiesRequest => JoinableLobbiesRequest,
    JoinableLobbiesResponse => JoinableLobbiesResponse,
}

/// Decoded inbound coordinator message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Welcome(Welcome),
    ConnectionStatus(ConnectionStatus),
    LobbyCreateResponse(LobbyCreateResponse),
    LobbySnapshot(LobbySnapshot),
    LobbyJoinResponse(LobbyJoinResponse),
    ReadyUpStatus(ReadyUpStatus),
    JoinableLobbies(JoinableLobbiesResponse),
    /// Known id the session never acts on, or a raw (unstructured) message
    Unhandled(u32),
}

/// Dispatch a wire message into its typed variant
pub fn decode_inbound(codec: &dyn MessageCodec, raw_type: u32, bytes: &[u8]) -> Result<Inbound, SchemaError> {
    let (id, structured) = unmask(raw_type);
    let kind = match MessageKind::from_id(id) {
        Some(kind) if structured => kind,
        _ => return Ok(Inbound::Unhandled(id)),
    };

    let inbound = match kind {
        MessageKind::Welcome => Inbound::Welcome(decode_as(codec, bytes)?),
        MessageKind::ConnectionStatus => Inbound::ConnectionStatus(decode_as(codec, bytes)?),
        MessageKind::LobbyCreateResponse => Inbound::LobbyCreateResponse(decode_as(codec, bytes)?),
        MessageKind::LobbySnapshot => Inbound::LobbySnapshot(decode_as(codec, bytes)?),
        MessageKind::LobbyJoinResponse => Inbound::LobbyJoinResponse(decode_as(codec, bytes)?),
        MessageKind::ReadyUpStatus => Inbound::ReadyUpStatus(decode_as(codec, bytes)?),
        MessageKind::JoinableLobbiesResponse => Inbound::JoinableLobbies(decode_as(codec, bytes)?),
        other => Inbound::Unhandled(other.id()),
    };
    Ok(inbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::JsonCodec;

    #[test]
    fn test_mask_and_unmask() {
        let wire = mask(MessageKind::LobbyJoin.id());
        assert_eq!(wire, 7044 | 0x8000_0000);
        assert_eq!(unmask(wire), (7044, true));
        assert_eq!(unmask(7044), (7044, false));
    }

    #[test]
    fn test_kind_ids_are_unique() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(MessageKind::from_id(1), None);
    }

    #[test]
    fn test_join_result_codes() {
        assert_eq!(JoinResult::from(9), JoinResult::LobbyFull);
        assert_eq!(JoinResult::from(42), JoinResult::Other(42));
        assert_eq!(i32::from(JoinResult::InvalidLobby), 2);

        let resp: LobbyJoinResponse = serde_json::from_str(r#"{"result":2}"#).unwrap();
        assert_eq!(resp.result, JoinResult::InvalidLobby);
    }

    #[test]
    fn test_encode_masks_id() {
        let codec = JsonCodec;
        let (id, bytes) = encode(&codec, &LobbyLeave {}).unwrap();
        assert_eq!(unmask(id), (MessageKind::LobbyLeave.id(), true));
        assert_eq!(bytes, b"{}");
    }

    #[test]
    fn test_decode_join_response() {
        let codec = JsonCodec;
        let inbound = decode_inbound(&codec, mask(7113), br#"{"result":9}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::LobbyJoinResponse(LobbyJoinResponse { result: JoinResult::LobbyFull })
        );
    }

    #[test]
    fn test_decode_snapshot_with_defaults() {
        let codec = JsonCodec;
        let bytes = br#"{"lobby":{"lobby_id":77,"name":"A#1","member_count":1}}"#;
        match decode_inbound(&codec, mask(26), bytes).unwrap() {
            Inbound::LobbySnapshot(snap) => {
                assert_eq!(snap.lobby.lobby_id, LobbyId(77));
                assert_eq!(snap.lobby.member_count, 1);
                assert!(!snap.removed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_raw_and_unknown_messages_fall_through() {
        let codec = JsonCodec;
        assert_eq!(decode_inbound(&codec, 7113, b"garbage").unwrap(), Inbound::Unhandled(7113));
        assert_eq!(decode_inbound(&codec, mask(9999), b"").unwrap(), Inbound::Unhandled(9999));
        assert_eq!(
            decode_inbound(&codec, mask(MessageKind::Hello.id()), b"").unwrap(),
            Inbound::Unhandled(4006)
        );
    }

    #[test]
    fn test_malformed_payload_is_schema_error() {
        let codec = JsonCodec;
        let err = decode_inbound(&codec, mask(7113), br#"{"nope":true}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Malformed { .. }));
    }
}
