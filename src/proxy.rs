//! Proxy pool supervision
//!
//! Leaders are pinned: the k-th leader owns the k-th proxy for its whole
//! lifetime because its network identity is bound to its verified login.
//! Followers share the remaining proxies, `accounts_per_proxy` at a time,
//! and move to the next proxy (wrapping) after a network failure.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{ProxyEndpoint, Role};

/// One proxy in the pool
#[derive(Debug)]
pub struct ProxyRecord {
    pub endpoint: ProxyEndpoint,
    consecutive_failures: AtomicU32,
    owners: Mutex<BTreeSet<String>>,
}

impl ProxyRecord {
    fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoint,
            consecutive_failures: AtomicU32::new(0),
            owners: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn owners(&self) -> Vec<String> {
        self.owners.lock().iter().cloned().collect()
    }
}

/// Hands out proxies to sessions and rotates followers on failure
#[derive(Debug)]
pub struct ProxySupervisor {
    records: Vec<ProxyRecord>,
    leader_count: usize,
    accounts_per_proxy: usize,
}

impl ProxySupervisor {
    pub fn new(endpoints: Vec<ProxyEndpoint>, leader_count: usize, accounts_per_proxy: usize) -> Self {
        Self {
            records: endpoints.into_iter().map(ProxyRecord::new).collect(),
            leader_count,
            accounts_per_proxy: accounts_per_proxy.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pool index for the `role_index`-th account of `role`, `None` without proxies
    pub fn initial_index(&self, role: Role, role_index: usize) -> Option<usize> {
        if self.records.is_empty() {
            return None;
        }
        let slot = match role {
            Role::Leader => role_index,
            Role::Follower => self.leader_count + role_index / self.accounts_per_proxy,
        };
        Some(slot % self.records.len())
    }

    /// Bind an account to its initial proxy
    pub fn assign(&self, account: &str, role: Role, role_index: usize) -> Option<usize> {
        let index = self.initial_index(role, role_index)?;
        self.records[index].owners.lock().insert(account.to_string());
        debug!(account, proxy = %self.records[index].endpoint, index, "Assigned proxy");
        Some(index)
    }

    pub fn endpoint(&self, index: Option<usize>) -> Option<&ProxyEndpoint> {
        index.and_then(|i| self.records.get(i)).map(|r| &r.endpoint)
    }

    pub fn record(&self, index: usize) -> Option<&ProxyRecord> {
        self.records.get(index)
    }

    /// Count a network failure against a proxy, returning the new streak
    pub fn record_failure(&self, index: Option<usize>) -> u32 {
        match index.and_then(|i| self.records.get(i)) {
            Some(record) => record.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1,
            None => 0,
        }
    }

    pub fn record_success(&self, index: Option<usize>) {
        if let Some(record) = index.and_then(|i| self.records.get(i)) {
            record.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    /// Next proxy for a session after a failure on `current`
    ///
    /// Leaders keep their proxy; followers advance by exactly one, wrapping.
    pub fn rotate(&self, account: &str, role: Role, current: Option<usize>) -> Option<usize> {
        let current = current?;
        if role == Role::Leader || self.records.len() < 2 {
            return Some(current);
        }
        let next = (current + 1) % self.records.len();
        self.records[current].owners.lock().remove(account);
        self.records[next].owners.lock().insert(account.to_string());
        info!(
            account,
            from = %self.records[current].endpoint,
            to = %self.records[next].endpoint,
            "Rotated proxy"
        );
        Some(next)
    }

    /// Forget an account's ownership
    pub fn release(&self, account: &str, index: Option<usize>) {
        if let Some(record) = index.and_then(|i| self.records.get(i)) {
            record.owners.lock().remove(account);
        }
    }
}
