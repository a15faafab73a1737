//! Replicated queue — primary/backup action log across replicas.
//!
//! DESIGN
//! ======
//! - Any replica appends to the shared durable log (`<prefix>:queue`).
//! - On `get_next` a replica makes one lease attempt. The leaseholder pops the
//!   oldest durable item and publishes it on the `action` channel before
//!   returning it, stamped with the version it will produce.
//! - Followers never read the durable log. They buffer the leader's
//!   broadcasts and `get_next` drains that buffer, so every replica applies
//!   items in the leader's pop order.
//! - Only the leaseholder writes `<prefix>:present`.
//!
//! EDGE CASES
//! ==========
//! - Own broadcasts are ignored by origin id, so a replica never replays what
//!   it popped itself.
//! - Buffered entries whose version is already covered by the local snapshot
//!   are dropped: duplicate deliveries, and items already folded into the
//!   snapshot loaded at startup.
//! - A replica that becomes leader drains its follower buffer before popping
//!   the durable log; those items were already popped by the previous leader.
//! - A buffered entry more than one version ahead is never handed out. It
//!   stays at the head of the buffer and `get_next` yields nothing, leader or
//!   not, until `resync` adopts a persisted snapshot that closes the gap.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ActionQueue, QueueError};
use crate::action::{Action, QueueItem};
use crate::backend::{BroadcastBus, DurableStore, LockService, Namespace};
use crate::channel::BroadcastChannel;
use crate::lease::{Lease, LeaseStatus};
use crate::reducer::Reducer;
use crate::snapshot::Snapshot;

const ACTION_CHANNEL: &str = "action";
const QUEUE_KEY: &str = "queue";
const PRESENT_KEY: &str = "present";
const LOCK_KEY: &str = "lock";

/// Broadcast form of a drained item.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Replicated {
    origin: Uuid,
    version: u64,
    item: QueueItem,
}

#[derive(Default)]
struct ReplicaState {
    /// Items received from the leader, in publish order.
    buffer: VecDeque<Replicated>,
    /// Latest snapshot seen by this replica, persisted or not.
    snapshot: Option<Snapshot>,
}

impl ReplicaState {
    fn applied_version(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.version)
    }
}

/// Head of the follower buffer.
enum Buffered {
    Next(Replicated),
    Empty,
    /// The head entry skips versions this replica never applied.
    Gap { version: u64, applied: u64 },
}

/// Coordination primitives one replicated queue runs on.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DurableStore>,
    pub locks: Arc<dyn LockService>,
    pub bus: Arc<dyn BroadcastBus>,
}

impl Backends {
    /// Use one value for all three roles.
    pub fn single<B>(backend: B) -> Self
    where
        B: DurableStore + LockService + BroadcastBus + 'static,
    {
        let backend = Arc::new(backend);
        Self { store: backend.clone(), locks: backend.clone(), bus: backend }
    }
}

pub struct ReplicatedQueue {
    replica_id: Uuid,
    namespace: Namespace,
    store: Arc<dyn DurableStore>,
    channel: BroadcastChannel,
    lease: Lease,
    state: Arc<Mutex<ReplicaState>>,
    notify: Arc<Notify>,
    listener: JoinHandle<()>,
}

impl ReplicatedQueue {
    /// Subscribe to the action channel and build the queue. The subscription
    /// is live before this returns, so no broadcast published afterwards is
    /// missed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscription fails.
    pub async fn connect(backends: Backends, namespace: Namespace, lock_ttl: Duration) -> Result<Self, QueueError> {
        let replica_id = Uuid::new_v4();
        let channel = BroadcastChannel::new(backends.bus, namespace.clone());
        let lease = Lease::new(backends.locks, namespace.key(LOCK_KEY), lock_ttl);
        let state = Arc::new(Mutex::new(ReplicaState::default()));
        let notify = Arc::new(Notify::new());

        let mut subscription = channel.subscribe::<Replicated>(ACTION_CHANNEL).await?;
        let listener = {
            let state = Arc::clone(&state);
            let notify = Arc::clone(&notify);
            let prefix = namespace.label().to_owned();
            tokio::spawn(async move {
                while let Some(entry) = subscription.recv().await {
                    if entry.origin == replica_id {
                        continue;
                    }
                    debug!(
                        prefix = %prefix,
                        kind = %entry.item.action.kind,
                        client = entry.item.target_client.as_deref().unwrap_or("-"),
                        version = entry.version,
                        "replicated queue: buffered broadcast action"
                    );
                    lock_state(&state).buffer.push_back(entry);
                    notify.notify_one();
                }
                debug!(prefix = %prefix, "replicated queue: subscription closed");
            })
        };

        info!(prefix = %namespace.label(), %replica_id, "replicated queue: connected");
        Ok(Self { replica_id, namespace, store: backends.store, channel, lease, state, notify, listener })
    }

    #[must_use]
    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    #[must_use]
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.lease.is_held()
    }

    fn state(&self) -> MutexGuard<'_, ReplicaState> {
        lock_state(&self.state)
    }

    /// Next buffered item not yet covered by the local snapshot. A gapped
    /// head is left in place.
    fn pop_buffered(&self) -> Buffered {
        let mut state = self.state();
        let applied = state.applied_version();
        while let Some(entry) = state.buffer.pop_front() {
            if entry.version <= applied {
                debug!(prefix = %self.namespace.label(), version = entry.version, applied, "replicated queue: skipping already applied item");
                continue;
            }
            if entry.version > applied + 1 {
                let version = entry.version;
                state.buffer.push_front(entry);
                return Buffered::Gap { version, applied };
            }
            return Buffered::Next(entry);
        }
        Buffered::Empty
    }

    /// Version of the buffered head if it is ahead of `applied + 1`.
    fn pending_gap(&self) -> Option<u64> {
        let mut state = self.state();
        let applied = state.applied_version();
        while state.buffer.front().is_some_and(|e| e.version <= applied) {
            state.buffer.pop_front();
        }
        state
            .buffer
            .front()
            .map(|head| head.version)
            .filter(|version| *version > applied + 1)
    }

    async fn pop_durable(&self) -> Result<Option<QueueItem>, QueueError> {
        let Some(raw) = self.store.pop_head(&self.namespace.key(QUEUE_KEY)).await? else {
            return Ok(None);
        };
        let item: QueueItem = serde_json::from_str(&raw).inspect_err(|e| {
            error!(prefix = %self.namespace.label(), error = %e, "replicated queue: dropping undecodable log entry");
        })?;

        let entry = Replicated { origin: self.replica_id, version: self.state().applied_version() + 1, item };
        if let Err(e) = self.channel.publish(ACTION_CHANNEL, &entry).await {
            // The item is already off the log; apply it here regardless.
            error!(prefix = %self.namespace.label(), error = %e, version = entry.version, "replicated queue: broadcast failed");
        }
        Ok(Some(entry.item))
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), QueueError> {
        let raw = serde_json::to_string(snapshot)?;
        self.store
            .set(&self.namespace.key(PRESENT_KEY), &raw)
            .await
            .inspect_err(|e| warn!(prefix = %self.namespace.label(), error = %e, "replicated queue: failed to save snapshot"))?;
        debug!(prefix = %self.namespace.label(), version = snapshot.version, "replicated queue: saved snapshot");
        Ok(())
    }
}

impl Drop for ReplicatedQueue {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn lock_state(state: &Mutex<ReplicaState>) -> MutexGuard<'_, ReplicaState> {
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait::async_trait]
impl ActionQueue for ReplicatedQueue {
    async fn init(&self, reducer: &dyn Reducer) -> Result<(), QueueError> {
        let prefix = self.namespace.label();
        let stored = self
            .store
            .get(&self.namespace.key(PRESENT_KEY))
            .await
            .inspect_err(|e| error!(prefix = %prefix, error = %e, "replicated queue: failed to init"))?;

        if let Some(raw) = stored {
            let snapshot: Snapshot = serde_json::from_str(&raw)?;
            reducer.restore(&Action::present(serde_json::to_value(&snapshot)?));
            info!(prefix = %prefix, version = snapshot.version, "replicated queue: init from existing snapshot");
            self.state().snapshot = Some(snapshot);
        } else {
            let snapshot = Snapshot::initial(reducer.initial_state());
            self.save_snapshot(&snapshot).await?;
            info!(prefix = %prefix, "replicated queue: init from scratch");
        }
        Ok(())
    }

    async fn enqueue(&self, target_client: Option<String>, action: Action) -> Result<(), QueueError> {
        let kind = action.kind.clone();
        let item = QueueItem::new(target_client, action);
        let raw = serde_json::to_string(&item)?;
        self.store
            .push_tail(&self.namespace.key(QUEUE_KEY), &raw)
            .await
            .inspect_err(|e| warn!(prefix = %self.namespace.label(), error = %e, "replicated queue: failed to enqueue"))?;

        debug!(
            prefix = %self.namespace.label(),
            %kind,
            client = item.target_client.as_deref().unwrap_or("-"),
            "replicated queue: enqueued"
        );
        self.notify.notify_one();
        Ok(())
    }

    async fn get_next(&self) -> Result<Option<QueueItem>, QueueError> {
        let leader = self.lease.try_acquire().await == LeaseStatus::Acquired;
        match self.pop_buffered() {
            Buffered::Next(entry) => Ok(Some(entry.item)),
            Buffered::Gap { version, applied } => {
                debug!(prefix = %self.namespace.label(), version, applied, "replicated queue: holding gapped item until resync");
                Ok(None)
            }
            Buffered::Empty if leader => self.pop_durable().await,
            Buffered::Empty => Ok(None),
        }
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), QueueError> {
        self.state().snapshot = Some(snapshot.clone());
        if self.lease.try_acquire().await == LeaseStatus::Acquired {
            self.persist(snapshot).await?;
        }
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Snapshot, QueueError> {
        let stored = self
            .store
            .get(&self.namespace.key(PRESENT_KEY))
            .await
            .inspect_err(|e| warn!(prefix = %self.namespace.label(), error = %e, "replicated queue: failed to load snapshot"))?;

        if let Some(raw) = stored {
            let snapshot: Snapshot = serde_json::from_str(&raw)?;
            self.state().snapshot = Some(snapshot.clone());
            return Ok(snapshot);
        }
        self.state().snapshot.clone().ok_or(QueueError::NoSnapshot)
    }

    async fn resync(&self) -> Result<Option<Snapshot>, QueueError> {
        let Some(gap) = self.pending_gap() else {
            return Ok(None);
        };
        let stored = self
            .store
            .get(&self.namespace.key(PRESENT_KEY))
            .await
            .inspect_err(|e| warn!(prefix = %self.namespace.label(), error = %e, "replicated queue: failed to load snapshot for resync"))?;
        let Some(raw) = stored else {
            return Ok(None);
        };
        let stored: Snapshot = serde_json::from_str(&raw)?;

        let mut state = self.state();
        let applied = state.applied_version();
        if stored.version <= applied {
            warn!(
                prefix = %self.namespace.label(),
                version = gap,
                applied,
                persisted = stored.version,
                "replicated queue: version gap not yet covered by persisted snapshot"
            );
            return Ok(None);
        }
        let covered = stored.version;
        state.buffer.retain(|entry| entry.version > covered);
        state.snapshot = Some(stored.clone());
        info!(prefix = %self.namespace.label(), from = applied, to = covered, "replicated queue: resynced from persisted snapshot");
        Ok(Some(stored))
    }

    async fn clean(&self) -> Result<(), QueueError> {
        self.store.delete(&self.namespace.key(QUEUE_KEY)).await?;
        self.store.delete(&self.namespace.key(PRESENT_KEY)).await?;
        self.lease.release().await;
        debug!(prefix = %self.namespace.label(), "replicated queue: cleanup done");
        Ok(())
    }

    fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

#[cfg(test)]
#[path = "replicated_test.rs"]
mod tests;
