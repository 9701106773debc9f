//! # Warband
//!
//! Fleet orchestration for coordinator lobby sessions - a leader and the
//! followers that fill its lobbies.
//!
//! Every account runs as its own [`BotSession`]: login through an assigned
//! proxy, coordinator handshake, then either seeding lobbies (leader) or
//! joining them (followers). Sessions share nothing but the allocation table
//! and the proxy pool, and never hold either across an await.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                               FLEET                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────┐   │
//! │  │ Fleet Roster │  │ Release Task │  │ Room Allocation Table    │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────────┘   │
//! │                                      ┌──────────────────────────┐   │
//! │                                      │ Proxy Supervisor         │   │
//! │                                      └──────────────────────────┘   │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │  SessionCommand ▼   ▲ FleetEvent
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │   Leader    │     │  Follower   │     │  Follower   │
//!   │  (Seeding)  │     │   Session   │     │   Session   │
//!   └──────┬──────┘     └──────┬──────┘     └──────┬──────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!   SessionTransport + MessageCodec  (supplied by the embedding process)
//! ```
//!
//! ## Key Concepts
//!
//! - **Session**: one account's protocol state machine, fed by a single inbox
//! - **Seeding**: the leader's rolling cycle of fresh `<name>#<n>` lobbies
//! - **Reservation**: a self-expiring slot claim that keeps followers from
//!   over-filling a lobby
//! - **Epoch**: a transport generation; events from a replaced transport are dropped

pub mod allocation;
pub mod channel;
pub mod config;
pub mod error;
pub mod fleet;
pub mod protocol;
pub mod proxy;
pub mod roster;
pub mod seeding;
pub mod session;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod testing;

pub use allocation::{JoinDecision, Reservation, RoomAllocationTable};
pub use channel::{FleetEvent, SessionChannel, SessionCommand};
pub use config::{Account, FleetDefinition, FleetSettings, ProxyEndpoint, Role};
pub use error::{FleetError, SchemaError, TransportError};
pub use fleet::Fleet;
pub use protocol::{Lobby, LobbyId, MessageCodec, MessageKind};
pub use proxy::ProxySupervisor;
pub use roster::{FleetProgress, FleetRoster};
pub use seeding::LobbySeedingController;
pub use session::{BotSession, LobbyPhase, SessionState};
pub use transport::{SessionTransport, TransportErrorKind, TransportEvent, TransportFactory, TransportSink};
