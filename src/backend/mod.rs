//! Backend — contracts for the shared coordination primitives.
//!
//! DESIGN
//! ======
//! Replicas coordinate only through three external primitives: a durable
//! store (keyed records plus FIFO lists), a lock service handing out leased
//! mutual exclusion, and a publish/subscribe bus. Each is a trait so the queue
//! can run against Postgres in production and the in-memory backend in tests
//! and single-process deployments.
//!
//! Values are strings; callers own the encoding (JSON everywhere in this
//! crate).

pub mod memory;
pub mod postgres;

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("backend closed")]
    Closed,
}

// =============================================================================
// NAMESPACE
// =============================================================================

/// Optional key prefix so several independent stores can share one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// `<prefix>:<name>`, or just `name` without a prefix.
    #[must_use]
    pub fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}:{name}", self.prefix)
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        if self.prefix.is_empty() { "-" } else { &self.prefix }
    }
}

// =============================================================================
// CONTRACTS
// =============================================================================

/// Durable keyed records and FIFO lists.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Append to the tail of `list`. Safe from any replica.
    async fn push_tail(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically remove and return the head of `list`.
    async fn pop_head(&self, list: &str) -> Result<Option<String>, StoreError>;

    /// Delete a record or a whole list.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Proof of holding a named lock. Opaque to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken(pub Uuid);

/// Leased mutual exclusion. `acquire` is a single attempt: `Ok(None)` is a
/// miss, never an error.
#[async_trait::async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError>;

    /// Extend a held lock. `Ok(false)` means the lock was lost.
    async fn extend(&self, name: &str, token: LockToken, ttl: Duration) -> Result<bool, StoreError>;

    async fn release(&self, name: &str, token: LockToken) -> Result<(), StoreError>;
}

/// Publish/subscribe. Messages from one publisher on one channel arrive in
/// publish order.
#[async_trait::async_trait]
pub trait BroadcastBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>, StoreError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
