//! Action queue — ordered, at-least-once log of pending actions.
//!
//! ARCHITECTURE
//! ============
//! The dispatcher only sees the `ActionQueue` trait. Two implementations:
//! - `LocalQueue`: in-process FIFO for a single replica.
//! - `ReplicatedQueue`: shared durable log drained by the leaseholder and
//!   replayed by followers from the leader's broadcast.
//!
//! `get_next` never blocks. Callers that want to wait for work use the
//! queue's `notifier`, which is signalled whenever this replica learns the
//! queue became non-empty.

pub mod local;
pub mod replicated;

use std::sync::Arc;

use tokio::sync::Notify;

use crate::action::{Action, QueueItem};
use crate::backend::StoreError;
use crate::reducer::Reducer;
use crate::snapshot::Snapshot;

pub use local::LocalQueue;
pub use replicated::ReplicatedQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("no snapshot found in store")]
    NoSnapshot,
}

#[async_trait::async_trait]
pub trait ActionQueue: Send + Sync {
    /// Adopt the persisted snapshot, or seed and persist version 0 from the
    /// reducer's initial state.
    async fn init(&self, reducer: &dyn Reducer) -> Result<(), QueueError>;

    /// Record an item at the tail of the log.
    async fn enqueue(&self, target_client: Option<String>, action: Action) -> Result<(), QueueError>;

    /// Remove and return the oldest item visible to this replica.
    async fn get_next(&self) -> Result<Option<QueueItem>, QueueError>;

    /// Persist `snapshot` if this replica is allowed to; otherwise only keep it
    /// as the local copy.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), QueueError>;

    async fn load_snapshot(&self) -> Result<Snapshot, QueueError>;

    /// Catch up when items this replica never saw were applied elsewhere.
    /// Returns a newer persisted snapshot to adopt in place of the current
    /// one, or `None` if there is nothing to adopt yet.
    async fn resync(&self) -> Result<Option<Snapshot>, QueueError> {
        Ok(None)
    }

    /// Drop pending items and the persisted snapshot.
    async fn clean(&self) -> Result<(), QueueError>;

    /// Signalled when the queue became non-empty.
    fn notifier(&self) -> Arc<Notify>;
}
