//! Fleet configuration
//!
//! Every tunable of the engine lives in [`FleetSettings`]. The external loader
//! deserializes a [`FleetDefinition`] (usually from JSON) and hands it to
//! [`Fleet::new`](crate::fleet::Fleet::new); missing fields fall back to the
//! compiled defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::protocol::GameFingerprint;

/// Role an account plays in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

/// Login identity of one bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    /// Seed for rotating login codes, consumed by the transport
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Follower
}

impl Account {
    pub fn new(username: impl Into<String>, password: impl Into<String>, role: Role) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            shared_secret: None,
            role,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

/// Outbound proxy endpoint (`host:port`, optionally with credentials)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyEndpoint(pub String);

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to start a fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetDefinition {
    pub leader: Account,
    #[serde(default)]
    pub followers: Vec<Account>,
    #[serde(default)]
    pub proxies: Vec<ProxyEndpoint>,
    #[serde(default)]
    pub settings: FleetSettings,
}

impl FleetDefinition {
    pub fn total_bots(&self) -> usize {
        1 + self.followers.len()
    }
}

/// Shared settings for every session of a fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Game application id used for the coordinator channel
    pub app_id: u32,
    /// Display name prefix; cycles are named `<base>#<n>`
    pub lobby_name: String,
    pub lobby_password: Option<String>,
    pub lobby_region: u32,
    /// Maximum followers per lobby
    pub lobby_capacity: u32,
    /// Leader cycles lobbies instead of holding a single one
    pub seeding: bool,
    /// Lobby a non-seeding leader tries to join before creating its own
    pub leader_join_target: Option<u64>,
    /// Followers poll the lobby list themselves instead of waiting for a push
    pub follower_self_poll: bool,
    pub fingerprint: GameFingerprint,

    pub login_timeout_secs: u64,
    pub rate_limit_cooldown_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub hello_retry_ms: u64,
    pub create_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub join_timeout_secs: u64,
    pub join_retry_ms: u64,
    pub max_direct_join_failures: u32,
    pub team_slot_delay_ms: u64,
    pub ready_up_delay_ms: u64,
    pub ready_up_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub health_miss_limit: u32,
    pub poll_interval_secs: u64,

    pub freshness_window_secs: u64,
    pub reservation_ttl_secs: u64,

    pub accounts_per_proxy: usize,
    pub release_batch_size: usize,
    pub release_stagger_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            app_id: 570,
            lobby_name: "Lobby".into(),
            lobby_password: None,
            lobby_region: 0,
            lobby_capacity: 9,
            seeding: true,
            leader_join_target: None,
            follower_self_poll: false,
            fingerprint: GameFingerprint::default(),
            login_timeout_secs: 90,
            rate_limit_cooldown_secs: 60,
            backoff_base_secs: 5,
            backoff_cap_secs: 300,
            hello_retry_ms: 5_000,
            create_timeout_secs: 15,
            keep_alive_secs: 10,
            join_timeout_secs: 20,
            join_retry_ms: 1_000,
            max_direct_join_failures: 2,
            team_slot_delay_ms: 500,
            ready_up_delay_ms: 300,
            ready_up_interval_secs: 30,
            health_check_interval_secs: 20,
            health_miss_limit: 5,
            poll_interval_secs: 5,
            freshness_window_secs: 60,
            reservation_ttl_secs: 30,
            accounts_per_proxy: 3,
            release_batch_size: 3,
            release_stagger_ms: 750,
            shutdown_grace_secs: 5,
        }
    }
}

impl FleetSettings {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.lobby_capacity == 0 {
            return Err(FleetError::Config("lobby_capacity must be at least 1".into()));
        }
        if self.accounts_per_proxy == 0 {
            return Err(FleetError::Config("accounts_per_proxy must be at least 1".into()));
        }
        if self.release_batch_size == 0 {
            return Err(FleetError::Config("release_batch_size must be at least 1".into()));
        }
        if self.health_miss_limit == 0 {
            return Err(FleetError::Config("health_miss_limit must be at least 1".into()));
        }
        let intervals = [
            ("login_timeout_secs", self.login_timeout_secs),
            ("hello_retry_ms", self.hello_retry_ms),
            ("create_timeout_secs", self.create_timeout_secs),
            ("keep_alive_secs", self.keep_alive_secs),
            ("join_timeout_secs", self.join_timeout_secs),
            ("ready_up_interval_secs", self.ready_up_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("freshness_window_secs", self.freshness_window_secs),
            ("reservation_ttl_secs", self.reservation_ttl_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(FleetError::Config(format!("{name} must be non-zero")));
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(FleetError::Config("backoff_cap_secs is below backoff_base_secs".into()));
        }
        Ok(())
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    /// Leader reconnect delay after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let secs = self.backoff_base_secs.saturating_mul(1u64 << exp);
        Duration::from_secs(secs.min(self.backoff_cap_secs))
    }

    pub fn hello_retry(&self) -> Duration {
        Duration::from_millis(self.hello_retry_ms)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn join_retry(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms)
    }

    pub fn team_slot_delay(&self) -> Duration {
        Duration::from_millis(self.team_slot_delay_ms)
    }

    pub fn ready_up_delay(&self) -> Duration {
        Duration::from_millis(self.ready_up_delay_ms)
    }

    pub fn ready_up_interval(&self) -> Duration {
        Duration::from_secs(self.ready_up_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn release_stagger(&self) -> Duration {
        Duration::from_millis(self.release_stagger_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
