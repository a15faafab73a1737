//! Message — the socket wire format.
//!
//! ARCHITECTURE
//! ============
//! Every websocket text frame is one JSON object `{"event": ..., "data": ...}`.
//! Inbound events carry actions or a hydrate request; outbound events carry
//! projections, applied actions, and version notices. The transport routes
//! on `event` and never inspects action payloads.

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::snapshot::Snapshot;

// =============================================================================
// INBOUND
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Inbound {
    /// Global action. `null` is accepted on the wire and dropped later.
    Action(Option<Action>),
    /// Action scoped to the sending connection's identity.
    ClientAction(Option<Action>),
    /// Request for a fresh projection.
    Present,
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// A connection's own client record next to the shared state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientState {
    pub shared: serde_json::Value,
    pub client: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientView {
    pub version: u64,
    pub state: ClientState,
}

/// What a connection is entitled to see of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum View {
    Full(Snapshot),
    Client(ClientView),
}

impl View {
    #[must_use]
    pub fn version(&self) -> u64 {
        match self {
            Self::Full(snapshot) => snapshot.version,
            Self::Client(view) => view.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Outbound {
    /// Hydrate: the connection's projection of the current snapshot.
    Present(View),
    /// An applied action and the version it produced.
    Action {
        action: Action,
        #[serde(rename = "targetClient", skip_serializing_if = "Option::is_none")]
        target_client: Option<String>,
        version: u64,
    },
    /// Version notice for connections not involved in a targeted action.
    Version { version: u64 },
}

impl Outbound {
    /// Event name, for logging.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::Present(_) => "present",
            Self::Action { .. } => "action",
            Self::Version { .. } => "version",
        }
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
