//! Lease — time-bounded leadership backed by the lock service.
//!
//! DESIGN
//! ======
//! `try_acquire` is one non-blocking attempt; a miss is `NotHeld`, which the
//! queue treats as "I am a follower", never as an error. While held, a renewal
//! task extends the lock every `ttl / RENEWAL_DIVISOR`. The first failed
//! extension clears the held token and stops the task, so the next
//! `try_acquire` starts from scratch.
//!
//! The held token also carries a local deadline: the instant the last
//! successful acquire or extend was issued, plus `ttl`. The lock service
//! cannot expire the lock before then. Past it, a stalled renewal no longer
//! counts as leadership and the lease is demoted on the next check.
//!
//! LIFECYCLE
//! =========
//! NotHeld --acquire hit--> Held --renew fail / deadline / release--> NotHeld

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::backend::{LockService, LockToken};
use crate::config::RENEWAL_DIVISOR;

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Acquired,
    NotHeld,
}

struct Held {
    token: LockToken,
    renewal: JoinHandle<()>,
    valid_until: Instant,
}

struct LeaseInner {
    locks: Arc<dyn LockService>,
    name: String,
    ttl: Duration,
    held: Mutex<Option<Held>>,
    leader_tx: watch::Sender<bool>,
}

impl LeaseInner {
    fn held(&self) -> MutexGuard<'_, Option<Held>> {
        self.held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Clear the held lease if it is still `token`. Returns the cleared entry.
    fn demote(&self, token: LockToken) -> Option<Held> {
        let mut held = self.held();
        if held.as_ref().is_some_and(|h| h.token == token) {
            let cleared = held.take();
            drop(held);
            self.leader_tx.send_replace(false);
            return cleared;
        }
        None
    }

    /// Whether the lease is held and inside its deadline. A lease past its
    /// deadline is demoted here.
    fn check(&self) -> bool {
        let mut held = self.held();
        let Some(current) = held.as_ref() else {
            return false;
        };
        if Instant::now() < current.valid_until {
            return true;
        }
        if let Some(lapsed) = held.take() {
            lapsed.renewal.abort();
        }
        drop(held);
        self.leader_tx.send_replace(false);
        warn!(lease = %self.name, "lease: lapsed past deadline without renewal");
        false
    }

    /// Push the deadline of `token` forward after a successful extension.
    fn renewed(&self, token: LockToken, valid_until: Instant) {
        if let Some(current) = self.held().as_mut().filter(|h| h.token == token) {
            current.valid_until = valid_until;
        }
    }
}

#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    pub fn new(locks: Arc<dyn LockService>, name: impl Into<String>, ttl: Duration) -> Self {
        let (leader_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(LeaseInner { locks, name: name.into(), ttl, held: Mutex::new(None), leader_tx }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.inner.check()
    }

    /// Leadership changes: `true` on acquisition, `false` on loss.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.leader_tx.subscribe()
    }

    /// Confirm or acquire the lease with a single attempt.
    pub async fn try_acquire(&self) -> LeaseStatus {
        if self.is_held() {
            return LeaseStatus::Acquired;
        }

        let inner = &self.inner;
        let issued = Instant::now();
        let token = match inner.locks.acquire(&inner.name, inner.ttl).await {
            Ok(Some(token)) => token,
            Ok(None) => return LeaseStatus::NotHeld,
            Err(e) => {
                warn!(lease = %inner.name, error = %e, "lease: acquire failed");
                return LeaseStatus::NotHeld;
            }
        };

        let installed = {
            let mut held = inner.held();
            if held.is_none() {
                let renewal = spawn_renewal(Arc::downgrade(inner), token, inner.ttl);
                *held = Some(Held { token, renewal, valid_until: issued + inner.ttl });
                true
            } else {
                false
            }
        };
        if !installed {
            // Another caller on this replica won the race; keep theirs.
            if let Err(e) = inner.locks.release(&inner.name, token).await {
                warn!(lease = %inner.name, error = %e, "lease: release of duplicate token failed");
            }
            return LeaseStatus::Acquired;
        }

        inner.leader_tx.send_replace(true);
        info!(lease = %inner.name, "lease: acquired");
        LeaseStatus::Acquired
    }

    /// Give the lease up. The holder must re-acquire from scratch afterwards.
    pub async fn release(&self) {
        let inner = &self.inner;
        let Some(held) = inner.held().take() else {
            return;
        };
        held.renewal.abort();
        inner.leader_tx.send_replace(false);

        if let Err(e) = inner.locks.release(&inner.name, held.token).await {
            warn!(lease = %inner.name, error = %e, "lease: release failed");
        }
        info!(lease = %inner.name, "lease: released");
    }
}

fn spawn_renewal(inner: Weak<LeaseInner>, token: LockToken, ttl: Duration) -> JoinHandle<()> {
    let period = ttl / RENEWAL_DIVISOR;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the lock was just taken.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let issued = Instant::now();
            let lost = match inner.locks.extend(&inner.name, token, ttl).await {
                Ok(true) => {
                    inner.renewed(token, issued + ttl);
                    None
                }
                Ok(false) => Some("lock expired or taken"),
                Err(e) => {
                    warn!(lease = %inner.name, error = %e, "lease: renewal error");
                    Some("renewal error")
                }
            };
            if let Some(reason) = lost {
                if inner.demote(token).is_some() {
                    warn!(lease = %inner.name, reason, "lease: lost");
                }
                break;
            }
        }
    })
}

#[cfg(test)]
#[path = "lease_test.rs"]
mod tests;
