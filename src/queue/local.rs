//! In-process queue for a single replica. No coordination, no durability.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use super::{ActionQueue, QueueError};
use crate::action::{Action, QueueItem};
use crate::reducer::Reducer;
use crate::snapshot::Snapshot;

#[derive(Default)]
struct LocalInner {
    items: VecDeque<QueueItem>,
    snapshot: Option<Snapshot>,
}

#[derive(Default)]
pub struct LocalQueue {
    inner: Mutex<LocalInner>,
    notify: Arc<Notify>,
}

impl LocalQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, LocalInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ActionQueue for LocalQueue {
    async fn init(&self, reducer: &dyn Reducer) -> Result<(), QueueError> {
        self.inner().snapshot = Some(Snapshot::initial(reducer.initial_state()));
        debug!("local queue: initialized from scratch");
        Ok(())
    }

    async fn enqueue(&self, target_client: Option<String>, action: Action) -> Result<(), QueueError> {
        debug!(kind = %action.kind, client = target_client.as_deref().unwrap_or("-"), "local queue: enqueued");
        self.inner()
            .items
            .push_back(QueueItem::new(target_client, action));
        self.notify.notify_one();
        Ok(())
    }

    async fn get_next(&self) -> Result<Option<QueueItem>, QueueError> {
        Ok(self.inner().items.pop_front())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), QueueError> {
        self.inner().snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Snapshot, QueueError> {
        self.inner().snapshot.clone().ok_or(QueueError::NoSnapshot)
    }

    async fn clean(&self) -> Result<(), QueueError> {
        let mut inner = self.inner();
        inner.items.clear();
        inner.snapshot = None;
        Ok(())
    }

    fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

#[cfg(test)]
#[path = "local_test.rs"]
mod tests;
