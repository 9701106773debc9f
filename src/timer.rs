//! Scheduled callbacks for a session
//!
//! A session never sleeps inline. Every wait is a timer that posts a
//! [`TimerFired`] back into the session inbox. Re-arming or cancelling a kind
//! aborts the previous task, and each arm gets a fresh generation so a fire
//! that raced the abort is recognised as stale and dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::SessionInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    LoginTimeout,
    /// Delayed login after a cool-down or backoff
    LoginRetry,
    HelloRetry,
    CreateTimeout,
    KeepAlive,
    JoinTimeout,
    JoinRetry,
    /// Next step of the lobby entry sequence
    LobbyStep,
    ReadyUp,
    HealthCheck,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug)]
pub struct Timers {
    tx: mpsc::UnboundedSender<SessionInput>,
    armed: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Schedule `kind` to fire after `after`, replacing any pending one
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionInput::Timer(TimerFired { kind, generation }));
        });
        self.armed.insert(kind, (generation, handle));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.armed.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    pub(crate) fn generation(&self, kind: TimerKind) -> Option<u64> {
        self.armed.get(&kind).map(|(generation, _)| *generation)
    }

    /// Consume a fire; false when it belongs to a cancelled or replaced arm
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.kind) {
            Some((generation, _)) if *generation == fired.generation => {
                self.armed.remove(&fired.kind);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::Poll, Duration::from_secs(5));
        assert!(timers.is_armed(TimerKind::Poll));

        let Some(SessionInput::Timer(fired)) = rx.recv().await else {
            panic!("expected a timer");
        };
        assert_eq!(fired.kind, TimerKind::Poll);
        assert!(timers.accept(fired));
        assert!(!timers.accept(fired));
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::ReadyUp, Duration::from_secs(1));
        let stale = TimerFired {
            kind: TimerKind::ReadyUp,
            generation: 1,
        };
        timers.arm(TimerKind::ReadyUp, Duration::from_secs(2));
        assert!(!timers.accept(stale));

        let Some(SessionInput::Timer(fired)) = rx.recv().await else {
            panic!("expected a timer");
        };
        assert_eq!(fired.generation, 2);
        assert!(timers.accept(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::LoginTimeout, Duration::from_secs(1));
        timers.arm(TimerKind::HealthCheck, Duration::from_secs(1));
        timers.cancel_all();
        assert_eq!(timers.armed_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
