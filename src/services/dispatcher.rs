//! Dispatcher — drains the action queue and applies items one at a time.
//!
//! DESIGN
//! ======
//! The dispatcher exclusively owns the current snapshot. A single task loops:
//! poll the queue, and for each item reduce, advance the version, persist,
//! broadcast to sockets, then notify host listeners and one-shot waiters.
//! Readers only ever see immutable `Arc<Snapshot>` values published through a
//! `watch` channel.
//!
//! LIFECYCLE
//! =========
//! Resync: before each poll the queue may hand back a newer persisted
//! snapshot (this replica missed items applied elsewhere). It replaces the
//! current snapshot outright and every connection gets a version notice.
//! Draining: `get_next` returned an item; poll again immediately.
//! Idle: the queue was empty; wait for the queue's notifier, the fallback
//! poll interval, or `stop()`, whichever comes first.
//!
//! ERROR HANDLING
//! ==============
//! Queue and persistence failures are logged and the loop carries on.
//! Listener errors and panics are caught per listener and logged.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::hub::{Hub, MANAGERS_ROOM};
use crate::action::{Action, QueueItem};
use crate::message::Outbound;
use crate::queue::{ActionQueue, QueueError};
use crate::reducer::Reducer;
use crate::snapshot::Snapshot;

// =============================================================================
// TYPES
// =============================================================================

/// One applied action, as seen by listeners and waiters.
#[derive(Debug, Clone)]
pub struct Applied {
    /// The action as reduced, with the target merged into `client`.
    pub action: Action,
    pub target_client: Option<String>,
    pub previous: Arc<Snapshot>,
    pub current: Arc<Snapshot>,
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Host hook invoked after every applied action.
pub trait ActionListener: Send + Sync {
    /// # Errors
    ///
    /// Errors are logged by the dispatcher and otherwise ignored.
    fn on_applied(&self, applied: &Applied) -> Result<(), ListenerError>;
}

impl<F> ActionListener for F
where
    F: Fn(&Applied) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_applied(&self, applied: &Applied) -> Result<(), ListenerError> {
        self(applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Waiter {
    kind: String,
    target: Option<String>,
    tx: oneshot::Sender<Applied>,
}

impl Waiter {
    fn matches(&self, applied: &Applied) -> bool {
        self.kind == applied.action.kind && self.target == applied.target_client
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

pub struct Dispatcher {
    queue: Arc<dyn ActionQueue>,
    reducer: Arc<dyn Reducer>,
    hub: Hub,
    present: watch::Sender<Arc<Snapshot>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ActionListener>)>>,
    next_listener: AtomicU64,
    waiters: Mutex<Vec<Waiter>>,
    /// Held for the whole of one apply cycle.
    cycle: tokio::sync::Mutex<()>,
    stop_tx: watch::Sender<bool>,
    poll_interval: Duration,
}

impl Dispatcher {
    /// Initialize the queue, load the starting snapshot, and build a
    /// dispatcher that has not started polling yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot initialize or no snapshot can be
    /// loaded. Either is fatal for startup.
    pub async fn new(
        queue: Arc<dyn ActionQueue>,
        reducer: Arc<dyn Reducer>,
        hub: Hub,
        poll_interval: Duration,
    ) -> Result<Arc<Self>, QueueError> {
        queue.init(reducer.as_ref()).await?;
        let snapshot = queue.load_snapshot().await?;
        info!(version = snapshot.version, "dispatcher: loaded snapshot");

        let (present, _) = watch::channel(Arc::new(snapshot));
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            queue,
            reducer,
            hub,
            present,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
            cycle: tokio::sync::Mutex::new(()),
            stop_tx,
            poll_interval,
        }))
    }

    /// [`Dispatcher::new`] followed by [`Dispatcher::spawn`].
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::new`].
    pub async fn start(
        queue: Arc<dyn ActionQueue>,
        reducer: Arc<dyn Reducer>,
        hub: Hub,
        poll_interval: Duration,
    ) -> Result<Arc<Self>, QueueError> {
        let dispatcher = Self::new(queue, reducer, hub, poll_interval).await?;
        dispatcher.spawn();
        Ok(dispatcher)
    }

    /// Spawn the drain loop. The task ends after `stop()`.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.run().await })
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<dyn ActionQueue> {
        &self.queue
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.present.borrow())
    }

    /// Receiver that observes every snapshot this dispatcher publishes.
    #[must_use]
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.present.subscribe()
    }

    /// Stop scheduling further polls. An in-flight apply runs to completion.
    pub fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!("dispatcher: stopping");
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    pub fn subscribe(&self, listener: impl ActionListener + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let listener: Arc<dyn ActionListener> = Arc::new(listener);
        self.listeners().push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// One-shot waiter for the next applied action of type `kind` addressed to
    /// `target`. The waiter removes itself once it fires; dropping the
    /// receiver cancels it.
    pub fn wait_for(&self, kind: &str, target: Option<&str>) -> oneshot::Receiver<Applied> {
        let (tx, rx) = oneshot::channel();
        self.waiters().push(Waiter { kind: kind.to_owned(), target: target.map(str::to_owned), tx });
        rx
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Arc<dyn ActionListener>)>> {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn waiters(&self) -> MutexGuard<'_, Vec<Waiter>> {
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Drain loop
    // -------------------------------------------------------------------------

    async fn run(&self) {
        let notify = self.queue.notifier();
        let mut stop_rx = self.stop_tx.subscribe();
        info!(poll = ?self.poll_interval, "dispatcher: started");

        while !*stop_rx.borrow() {
            let notified = notify.notified();
            match self.step().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "dispatcher: queue poll failed"),
            }
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(self.poll_interval) => {}
                _ = stop_rx.changed() => {}
            }
        }
        info!(version = self.snapshot().version, "dispatcher: stopped");
    }

    /// Poll the queue once and apply the item it yields, if any. Returns
    /// whether an item was applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue poll fails.
    pub async fn step(&self) -> Result<bool, QueueError> {
        let _cycle = self.cycle.lock().await;
        if let Some(snapshot) = self.queue.resync().await? {
            self.adopt(snapshot).await;
        }
        let Some(item) = self.queue.get_next().await? else {
            return Ok(false);
        };
        self.apply(item).await;
        Ok(true)
    }

    async fn apply(&self, item: QueueItem) {
        let action = item.addressed_action();
        let previous = self.snapshot();
        let current = Arc::new(previous.advance(self.reducer.reduce(&previous.state, &action)));
        debug!(
            kind = %action.kind,
            client = item.target_client.as_deref().unwrap_or("-"),
            version = current.version,
            "dispatcher: applied action"
        );

        if let Err(e) = self.queue.save_snapshot(&current).await {
            error!(error = %e, version = current.version, "dispatcher: failed to save snapshot");
        }
        self.present.send_replace(Arc::clone(&current));

        self.broadcast(&item, current.version).await;

        let applied = Applied { action, target_client: item.target_client, previous, current };
        self.notify_listeners(&applied);
        self.fire_waiters(&applied);
    }

    /// Replace the current snapshot with one persisted by another replica.
    async fn adopt(&self, snapshot: Snapshot) {
        match serde_json::to_value(&snapshot) {
            Ok(value) => self.reducer.restore(&Action::present(value)),
            Err(e) => warn!(error = %e, "dispatcher: failed to encode adopted snapshot for restore"),
        }
        let previous = self.snapshot().version;
        let version = snapshot.version;
        self.present.send_replace(Arc::new(snapshot));
        warn!(from = previous, to = version, "dispatcher: adopted persisted snapshot");
        self.hub.emit_all(&Outbound::Version { version }).await;
    }

    async fn broadcast(&self, item: &QueueItem, version: u64) {
        let msg = Outbound::Action { action: item.action.clone(), target_client: item.target_client.clone(), version };
        match item.target_client.as_deref() {
            Some(target) => {
                let involved = [target, MANAGERS_ROOM];
                self.hub.emit_to_rooms(&involved, &msg).await;
                self.hub
                    .emit_excluding_rooms(&involved, &Outbound::Version { version })
                    .await;
            }
            None => self.hub.emit_all(&msg).await,
        }
    }

    fn notify_listeners(&self, applied: &Applied) {
        let listeners: Vec<_> = self.listeners().clone();
        for (id, listener) in listeners {
            match std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_applied(applied))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(listener = id.0, kind = %applied.action.kind, error = %e, "dispatcher: listener failed");
                }
                Err(_) => {
                    error!(listener = id.0, kind = %applied.action.kind, "dispatcher: listener panicked");
                }
            }
        }
    }

    fn fire_waiters(&self, applied: &Applied) {
        let matched: Vec<Waiter> = {
            let mut waiters = self.waiters();
            let (matched, pending) = std::mem::take(&mut *waiters)
                .into_iter()
                .filter(|w| !w.tx.is_closed())
                .partition(|w| w.matches(applied));
            *waiters = pending;
            matched
        };
        for waiter in matched {
            if waiter.tx.send(applied.clone()).is_err() {
                debug!(kind = %waiter.kind, "dispatcher: waiter dropped before firing");
            }
        }
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod tests;
