//! Action — the unit of change folded into the shared state.
//!
//! DESIGN
//! ======
//! Actions are opaque to this crate: a `type` tag plus an arbitrary JSON
//! payload. The only shapes the core knows are the two reserved types below.
//! A `QueueItem` wraps an action with the identity it is scoped to, if any.

use serde::{Deserialize, Serialize};

// =============================================================================
// RESERVED TYPES
// =============================================================================

/// Restore notification. Never enqueued; filtered at every entry point.
pub const PRESENT: &str = "PRESENT";

/// Provisioning action that creates the client record for a new identity.
pub const ADD_CLIENT: &str = "ADD_CLIENT";

// =============================================================================
// TYPES
// =============================================================================

/// An action as received from a socket or issued by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Client identity the action is scoped to. Filled in by the dispatcher
    /// from the queue item's target before the reducer sees the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

impl Action {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { kind: kind.into(), payload, client: None }
    }

    /// Provisioning action for `identity`.
    #[must_use]
    pub fn add_client(identity: &str) -> Self {
        Self::new(ADD_CLIENT, serde_json::json!({ "id": identity }))
    }

    /// Restore notification carrying a persisted snapshot.
    #[must_use]
    pub fn present(payload: serde_json::Value) -> Self {
        Self::new(PRESENT, payload)
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.kind == PRESENT
    }

    #[must_use]
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }
}

/// Entry-point filter shared by every enqueue path: drops missing actions and
/// the reserved `PRESENT` type.
#[must_use]
pub fn accept(action: Option<Action>) -> Option<Action> {
    action.filter(|a| !a.is_reserved())
}

/// One pending entry of the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    #[serde(default)]
    pub target_client: Option<String>,
    pub action: Action,
}

impl QueueItem {
    #[must_use]
    pub fn new(target_client: Option<String>, action: Action) -> Self {
        Self { target_client, action }
    }

    /// The action as the reducer sees it: target merged into `client`.
    #[must_use]
    pub fn addressed_action(&self) -> Action {
        let mut action = self.action.clone();
        if let Some(target) = &self.target_client {
            action.client = Some(target.clone());
        }
        action
    }
}

#[cfg(test)]
#[path = "action_test.rs"]
mod tests;
