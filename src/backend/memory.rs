//! In-process backend implementing every coordination contract.
//!
//! Clones share state, so handing one clone to each simulated replica gives
//! them a common durable log, lock table, and bus. Used by single-process
//! deployments without `DATABASE_URL` and by the multi-replica tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{BroadcastBus, DurableStore, LockService, LockToken, StoreError};

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    locks: HashMap<String, (LockToken, Instant)>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    /// Number of `set` calls per key.
    writes: HashMap<String, usize>,
    failing: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn guard(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        let inner = self.lock();
        if inner.failing {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    /// How many times `set` was called for `key`.
    #[must_use]
    pub fn write_count(&self, key: &str) -> usize {
        self.lock().writes.get(key).copied().unwrap_or(0)
    }

    /// Number of pending entries in `list`.
    #[must_use]
    pub fn list_len(&self, list: &str) -> usize {
        self.lock().lists.get(list).map_or(0, VecDeque::len)
    }

    /// Make every store, lock, and bus call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Drop a lock as if its TTL had elapsed.
    pub fn expire_lock(&self, name: &str) {
        self.lock().locks.remove(name);
    }
}

#[async_trait::async_trait]
impl DurableStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.guard()?.records.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        *inner.writes.entry(key.to_owned()).or_default() += 1;
        inner.records.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn push_tail(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.guard()?
            .lists
            .entry(list.to_owned())
            .or_default()
            .push_back(value.to_owned());
        Ok(())
    }

    async fn pop_head(&self, list: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .guard()?
            .lists
            .get_mut(list)
            .and_then(VecDeque::pop_front))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.records.remove(key);
        inner.lists.remove(key);
        Ok(())
    }
}

#[async_trait::async_trait]
impl LockService for MemoryBackend {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError> {
        let mut inner = self.guard()?;
        let now = Instant::now();
        if let Some((_, expires_at)) = inner.locks.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = LockToken(Uuid::new_v4());
        inner.locks.insert(name.to_owned(), (token, now + ttl));
        Ok(Some(token))
    }

    async fn extend(&self, name: &str, token: LockToken, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.guard()?;
        let now = Instant::now();
        match inner.locks.get_mut(name) {
            Some((held, expires_at)) if *held == token && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, token: LockToken) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        if inner.locks.get(name).is_some_and(|(held, _)| *held == token) {
            inner.locks.remove(name);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BroadcastBus for MemoryBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        if let Some(subscribers) = inner.channels.get_mut(channel) {
            subscribers.retain(|tx| tx.send(payload.to_owned()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.guard()?
            .channels
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
