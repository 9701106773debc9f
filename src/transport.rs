//! Session transport boundary
//!
//! The authenticated connection, its encryption and raw delivery live outside
//! this crate. A [`TransportFactory`] builds one [`SessionTransport`] per
//! session and proxy; the transport reports lifecycle events back through the
//! [`TransportSink`] it was built with. Calls on the transport only initiate
//! work, outcomes always arrive as [`TransportEvent`]s.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::SessionInput;
use crate::config::{Account, ProxyEndpoint};
use crate::error::TransportError;

/// Transport failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Account is actively used from another client
    LoggedInElsewhere,
    RateLimited,
    InvalidCredentials,
    Timeout,
    ConnectionReset,
    ProxyUnreachable,
    Other,
}

/// How a session reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Never retried; the session is abandoned
    Fatal,
    /// Fixed cool-down before logging in again
    RateLimited,
    /// Backoff and retry, rotating the proxy where allowed
    Transient,
}

impl TransportErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            TransportErrorKind::LoggedInElsewhere | TransportErrorKind::InvalidCredentials => ErrorClass::Fatal,
            TransportErrorKind::RateLimited => ErrorClass::RateLimited,
            TransportErrorKind::Timeout
            | TransportErrorKind::ConnectionReset
            | TransportErrorKind::ProxyUnreachable
            | TransportErrorKind::Other => ErrorClass::Transient,
        }
    }
}

/// Lifecycle events emitted by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LoggedOn,
    AppLaunched(u32),
    MessageReceived {
        app_id: u32,
        message_type: u32,
        payload: Vec<u8>,
    },
    Error(TransportError),
    Disconnected,
}

/// One authenticated connection for one account
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Start logging in; the outcome arrives as `LoggedOn` or `Error`
    async fn log_on(&self, account: &Account) -> Result<(), TransportError>;

    /// Mark the account as online
    async fn announce_presence(&self) -> Result<(), TransportError>;

    /// Signal intent to use the game's online features; answered by `AppLaunched`
    async fn declare_online_intent(&self, app_id: u32) -> Result<(), TransportError>;

    async fn send_message(&self, app_id: u32, message_type: u32, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn log_off(&self);
}

/// Builds transports bound to a proxy
pub trait TransportFactory: Send + Sync {
    fn build(
        &self,
        account: &Account,
        proxy: Option<&ProxyEndpoint>,
        sink: TransportSink,
    ) -> Box<dyn SessionTransport>;
}

/// Delivers transport events into a session inbox
///
/// Each rebuilt transport gets a fresh epoch so the session can drop events
/// from a transport it has already replaced.
#[derive(Debug, Clone)]
pub struct TransportSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl TransportSink {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the session is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionInput::Transport {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}
