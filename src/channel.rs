//! Broadcast channel — namespaced, typed publish/subscribe.
//!
//! Wraps a `BroadcastBus` so callers publish and receive serde values on
//! short channel names; the namespace prefix keeps independent stores on one
//! bus apart. Payloads that fail to decode are logged and skipped.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::warn;

use crate::backend::{BroadcastBus, Namespace, StoreError};

#[derive(Clone)]
pub struct BroadcastChannel {
    bus: Arc<dyn BroadcastBus>,
    namespace: Namespace,
}

impl BroadcastChannel {
    pub fn new(bus: Arc<dyn BroadcastBus>, namespace: Namespace) -> Self {
        Self { bus, namespace }
    }

    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded or the bus rejects it.
    pub async fn publish<T: Serialize + Sync>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let payload = serde_json::to_string(value)?;
        self.bus
            .publish(&self.namespace.key(name), &payload)
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the bus subscription cannot be established.
    pub async fn subscribe<T: DeserializeOwned>(&self, name: &str) -> Result<Subscription<T>, StoreError> {
        let channel = self.namespace.key(name);
        let rx = self.bus.subscribe(&channel).await?;
        Ok(Subscription { channel, rx, _marker: PhantomData })
    }
}

/// Receiving end of one channel.
pub struct Subscription<T> {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    /// Next decodable value, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let raw = self.rx.recv().await?;
            match serde_json::from_str(&raw) {
                Ok(value) => return Some(value),
                Err(e) => warn!(channel = %self.channel, error = %e, "channel: dropping undecodable payload"),
            }
        }
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
