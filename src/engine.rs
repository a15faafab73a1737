//! Host-facing handle on one replica of a store.
//!
//! ARCHITECTURE
//! ============
//! `Engine::start` wires a queue and a reducer into a running dispatcher,
//! a socket hub, and a connection coordinator. Hosts embedding the store use
//! this type; the websocket routes reach the same coordinator through
//! `AppState`.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::action::Action;
use crate::queue::{ActionQueue, QueueError};
use crate::reducer::Reducer;
use crate::services::coordinator::{Authenticator, Coordinator};
use crate::services::dispatcher::{ActionListener, Dispatcher, ListenerId};
use crate::services::hub::Hub;
use crate::snapshot::Snapshot;

pub struct Engine {
    hub: Hub,
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<Coordinator>,
}

impl Engine {
    /// Initialize the queue and start draining it.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot initialize or load a snapshot.
    pub async fn start(
        queue: Arc<dyn ActionQueue>,
        reducer: Arc<dyn Reducer>,
        authenticator: Arc<dyn Authenticator>,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let hub = Hub::new();
        let dispatcher = Dispatcher::new(queue, reducer, hub.clone(), poll_interval).await?;
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&dispatcher), hub.clone(), authenticator));
        dispatcher.spawn();
        info!(version = dispatcher.snapshot().version, "engine: started");
        Ok(Self { hub, dispatcher, coordinator })
    }

    /// Register a listener called with every applied action.
    pub fn subscribe(&self, listener: impl ActionListener + 'static) -> ListenerId {
        self.dispatcher.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Current snapshot of this replica.
    #[must_use]
    pub fn get_state(&self) -> Arc<Snapshot> {
        self.dispatcher.snapshot()
    }

    /// # Errors
    ///
    /// Returns an error if the queue rejects the action.
    pub async fn dispatch(&self, action: Option<Action>) -> Result<(), QueueError> {
        self.coordinator.dispatch(action).await
    }

    /// # Errors
    ///
    /// Returns an error if the queue rejects the action.
    pub async fn dispatch_to_client(&self, identity: &str, action: Option<Action>) -> Result<(), QueueError> {
        self.coordinator.dispatch_to_client(identity, action).await
    }

    /// Stop polling the queue. Connections stay open.
    pub fn stop(&self) {
        self.dispatcher.stop();
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
