//! Connection coordinator: authentication, rooms, and hydration.
//!
//! DESIGN
//! ======
//! On connect the authenticator decides `(is_manager, identity)`. The
//! connection joins its identity room, plus `managers` if it is one.
//! Managers and identities already present in the snapshot hydrate at once.
//! A new identity is provisioned first: the coordinator registers a waiter
//! for `ADD_CLIENT` tagged with that identity, enqueues the action, and only
//! sends the first `present` once the waiter fires. Until then `present`
//! requests from that connection are ignored, so no socket ever sees a
//! projection for a client slot that does not exist yet.
//!
//! Provisioning is enqueued at most once per identity on this replica while
//! it is pending; further connections for the same identity just wait. Each
//! waiting session holds a slot on the pending entry. When the last slot is
//! dropped before `ADD_CLIENT` lands, the entry is forgotten and the next
//! connection for that identity enqueues it again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::dispatcher::{Applied, Dispatcher, ListenerError};
use super::hub::{ConnectionId, Hub, MANAGERS_ROOM};
use super::projector::project;
use crate::action::{ADD_CLIENT, Action, accept};
use crate::message::{Inbound, Outbound};
use crate::queue::QueueError;

// =============================================================================
// AUTHENTICATION
// =============================================================================

/// What the transport knows about a connection when it opens.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// Query parameters of the upgrade request.
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub is_manager: bool,
    /// Defaults to the connection id.
    pub identity: Option<String>,
}

#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, info: &ConnectionInfo) -> Decision;
}

/// Managers present `token` equal to the configured manager token. The
/// identity comes from `client_id`, so a client reconnecting with the same id
/// gets its existing record back.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    manager_token: Option<String>,
}

impl TokenAuthenticator {
    #[must_use]
    pub fn new(manager_token: Option<String>) -> Self {
        Self { manager_token }
    }
}

#[async_trait::async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, info: &ConnectionInfo) -> Decision {
        let is_manager = match (&self.manager_token, info.params.get("token")) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        };
        let identity = info
            .params
            .get("client_id")
            .filter(|id| !id.is_empty())
            .cloned();
        Decision { is_manager, identity }
    }
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug)]
pub enum Hydration {
    /// Projections may be sent.
    Ready,
    /// Waiting for this identity's `ADD_CLIENT` to be applied.
    Pending(oneshot::Receiver<Applied>),
    /// The provisioning waiter was dropped before it fired.
    Unavailable,
}

/// Provisioning in flight for one identity on this replica.
#[derive(Debug)]
struct Provisioning {
    id: u64,
    waiters: usize,
}

type PendingTable = Arc<Mutex<HashMap<String, Provisioning>>>;

/// A pending session's claim on its identity's provisioning.
#[derive(Debug)]
struct PendingSlot {
    table: PendingTable,
    identity: String,
    id: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let mut table = lock_pending(&self.table);
        let Some(entry) = table.get_mut(&self.identity).filter(|p| p.id == self.id) else {
            return;
        };
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters == 0 {
            table.remove(&self.identity);
            debug!(identity = %self.identity, "coordinator: provisioning abandoned by last waiter");
        }
    }
}

/// Per-connection state owned by the transport task.
#[derive(Debug)]
pub struct Session {
    pub connection: ConnectionId,
    pub identity: String,
    pub is_manager: bool,
    hydration: Hydration,
    slot: Option<PendingSlot>,
}

impl Session {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.hydration, Hydration::Ready)
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.hydration, Hydration::Pending(_))
    }

    /// Resolves once provisioning completes. Returns `true` if the session
    /// became ready. Never resolves for a session that is not pending.
    pub async fn provisioned(&mut self) -> bool {
        let Hydration::Pending(rx) = &mut self.hydration else {
            return std::future::pending().await;
        };
        let ready = rx.await.is_ok();
        self.hydration = if ready { Hydration::Ready } else { Hydration::Unavailable };
        self.slot = None;
        ready
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

pub struct Coordinator {
    dispatcher: Arc<Dispatcher>,
    hub: Hub,
    authenticator: Arc<dyn Authenticator>,
    /// Identities with an `ADD_CLIENT` enqueued but not yet applied.
    pending: PendingTable,
    next_provisioning: AtomicU64,
}

impl Coordinator {
    pub fn new(dispatcher: Arc<Dispatcher>, hub: Hub, authenticator: Arc<dyn Authenticator>) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let provisioned = Arc::clone(&pending);
        dispatcher.subscribe(move |applied: &Applied| -> Result<(), ListenerError> {
            if applied.action.kind == ADD_CLIENT {
                if let Some(identity) = &applied.target_client {
                    lock_pending(&provisioned).remove(identity);
                }
            }
            Ok(())
        });
        Self { dispatcher, hub, authenticator, pending, next_provisioning: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Provisioning>> {
        lock_pending(&self.pending)
    }

    /// Claim a slot on `identity`'s provisioning. Returns `true` as the second
    /// value if this call started it.
    fn join_provisioning(&self, identity: &str) -> (PendingSlot, bool) {
        let mut table = self.pending();
        let first = !table.contains_key(identity);
        let entry = table
            .entry(identity.to_owned())
            .or_insert_with(|| Provisioning { id: self.next_provisioning.fetch_add(1, Ordering::Relaxed), waiters: 0 });
        entry.waiters += 1;
        let slot = PendingSlot { table: Arc::clone(&self.pending), identity: identity.to_owned(), id: entry.id };
        (slot, first)
    }

    /// Authenticate and register a connection. The returned session is either
    /// ready (and already hydrated) or pending provisioning.
    ///
    /// # Errors
    ///
    /// Returns an error if the provisioning action cannot be enqueued. The
    /// connection is unregistered in that case.
    pub async fn connect(&self, info: ConnectionInfo, tx: tokio::sync::mpsc::Sender<Outbound>) -> Result<Session, QueueError> {
        let decision = self.authenticator.authenticate(&info).await;
        let identity = decision.identity.unwrap_or_else(|| info.id.to_string());

        self.hub.register(info.id, tx).await;
        self.hub.join(info.id, &identity).await;
        if decision.is_manager {
            self.hub.join(info.id, MANAGERS_ROOM).await;
        }
        info!(connection = %info.id, %identity, is_manager = decision.is_manager, "coordinator: connected");

        let mut session = Session {
            connection: info.id,
            identity,
            is_manager: decision.is_manager,
            hydration: Hydration::Ready,
            slot: None,
        };
        if session.is_manager || self.is_provisioned(&session.identity) {
            self.present(&session).await;
            return Ok(session);
        }

        // Register before enqueueing so the applied action cannot be missed.
        let rx = self.dispatcher.wait_for(ADD_CLIENT, Some(session.identity.as_str()));
        if self.is_provisioned(&session.identity) {
            self.present(&session).await;
            return Ok(session);
        }
        session.hydration = Hydration::Pending(rx);

        let (slot, first) = self.join_provisioning(&session.identity);
        let provisioning = slot.id;
        session.slot = Some(slot);
        if first {
            let action = Action::add_client(&session.identity);
            if let Err(e) = self.dispatcher.queue().enqueue(Some(session.identity.clone()), action).await {
                {
                    let mut pending = self.pending();
                    if pending.get(&session.identity).is_some_and(|p| p.id == provisioning) {
                        pending.remove(&session.identity);
                    }
                }
                self.hub.unregister(info.id).await;
                return Err(e);
            }
            debug!(identity = %session.identity, "coordinator: provisioning enqueued");
        } else {
            debug!(identity = %session.identity, "coordinator: provisioning already pending");
        }
        Ok(session)
    }

    /// Finish a pending session after [`Session::provisioned`] resolved.
    pub async fn complete_hydration(&self, session: &Session) {
        if session.is_ready() {
            self.present(session).await;
        } else {
            warn!(connection = %session.connection, identity = %session.identity, "coordinator: provisioning wait abandoned");
        }
    }

    /// Route one inbound message.
    ///
    /// # Errors
    ///
    /// Returns an error if an action cannot be enqueued.
    pub async fn handle(&self, session: &Session, msg: Inbound) -> Result<(), QueueError> {
        match msg {
            Inbound::Action(action) => self.dispatch(action).await,
            Inbound::ClientAction(action) => self.dispatch_to_client(&session.identity, action).await,
            Inbound::Present => {
                if session.is_ready() {
                    self.present(session).await;
                } else {
                    debug!(connection = %session.connection, "coordinator: present before provisioning; ignored");
                }
                Ok(())
            }
        }
    }

    /// Enqueue a global action. `None` and `PRESENT` are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue rejects the action.
    pub async fn dispatch(&self, action: Option<Action>) -> Result<(), QueueError> {
        let Some(action) = accept(action) else {
            return Ok(());
        };
        self.dispatcher.queue().enqueue(None, action).await
    }

    /// Enqueue an action scoped to `identity`. `None` and `PRESENT` are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue rejects the action.
    pub async fn dispatch_to_client(&self, identity: &str, action: Option<Action>) -> Result<(), QueueError> {
        let Some(action) = accept(action) else {
            return Ok(());
        };
        self.dispatcher
            .queue()
            .enqueue(Some(identity.to_owned()), action)
            .await
    }

    pub async fn disconnect(&self, session: &Session) {
        self.hub.unregister(session.connection).await;
        info!(connection = %session.connection, identity = %session.identity, "coordinator: disconnected");
    }

    fn is_provisioned(&self, identity: &str) -> bool {
        self.dispatcher.snapshot().state.clients.contains(identity)
    }

    /// Send the connection its projection of the current snapshot.
    async fn present(&self, session: &Session) {
        let snapshot = self.dispatcher.snapshot();
        match project(&snapshot, &session.identity, session.is_manager) {
            Some(view) => self.hub.emit_to(session.connection, &Outbound::Present(view)).await,
            None => warn!(identity = %session.identity, "coordinator: no client record to project"),
        }
    }
}

fn lock_pending(pending: &Mutex<HashMap<String, Provisioning>>) -> MutexGuard<'_, HashMap<String, Provisioning>> {
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod tests;
