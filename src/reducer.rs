//! Reducer — the injected pure state transition.
//!
//! DESIGN
//! ======
//! The core treats the reducer as a black box: `reduce(state, action)` must be
//! deterministic so every replica folding the same action stream ends with an
//! equivalent state. `ClientRegistry` wraps a host reducer and owns the one
//! transition the core depends on, `ADD_CLIENT`, so provisioning works no
//! matter what the host reduces.

use crate::action::{ADD_CLIENT, Action};
use crate::snapshot::StoreState;

/// Host-supplied state transition.
pub trait Reducer: Send + Sync {
    /// State of a store that has never applied an action.
    fn initial_state(&self) -> StoreState;

    /// Fold one action. The action's `client` is set for client-scoped items.
    fn reduce(&self, state: &StoreState, action: &Action) -> StoreState;

    /// Called with a `PRESENT` action whenever a persisted snapshot is adopted:
    /// at startup instead of the initial state, and when a lagging replica
    /// resyncs.
    fn restore(&self, _action: &Action) {}
}

// =============================================================================
// CLIENT REGISTRY
// =============================================================================

/// Handles `ADD_CLIENT` and delegates everything else to `inner`.
pub struct ClientRegistry<R> {
    inner: R,
}

impl<R: Reducer> ClientRegistry<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Reducer> Reducer for ClientRegistry<R> {
    fn initial_state(&self) -> StoreState {
        self.inner.initial_state()
    }

    fn reduce(&self, state: &StoreState, action: &Action) -> StoreState {
        if action.kind != ADD_CLIENT {
            return self.inner.reduce(state, action);
        }
        let identity = action.client.as_deref().or_else(|| {
            action
                .payload
                .get("id")
                .and_then(serde_json::Value::as_str)
        });
        let Some(identity) = identity else {
            return state.clone();
        };
        let mut next = state.clone();
        next.clients
            .insert(identity, serde_json::json!({ "id": identity }));
        next
    }

    fn restore(&self, action: &Action) {
        self.inner.restore(action);
    }
}

// =============================================================================
// MERGE REDUCER
// =============================================================================

/// Action type understood by [`MergeReducer`].
pub const MERGE: &str = "MERGE";

/// Generic reducer used by the standalone binary: `MERGE` shallow-merges an
/// object payload into the caller's client record when client-scoped, or into
/// `shared` otherwise. Other actions leave the state unchanged.
#[derive(Debug, Clone, Default)]
pub struct MergeReducer {
    initial: serde_json::Map<String, serde_json::Value>,
}

impl MergeReducer {
    #[must_use]
    pub fn new(initial: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { initial }
    }
}

impl Reducer for MergeReducer {
    fn initial_state(&self) -> StoreState {
        StoreState::new(serde_json::Value::Object(self.initial.clone()))
    }

    fn reduce(&self, state: &StoreState, action: &Action) -> StoreState {
        if action.kind != MERGE {
            return state.clone();
        }
        let Some(patch) = action.payload.as_object() else {
            return state.clone();
        };

        let mut next = state.clone();
        let target = match action.client.as_deref() {
            Some(identity) => next.clients.get_mut(identity),
            None => Some(&mut next.shared),
        };
        if let Some(serde_json::Value::Object(fields)) = target {
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
        }
        next
    }
}

#[cfg(test)]
#[path = "reducer_test.rs"]
mod tests;
