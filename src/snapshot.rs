//! Snapshot — the immutable, versioned state record.
//!
//! DESIGN
//! ======
//! `shared` is opaque to the core. The client collection is the one part of
//! the state the core inspects: projections look a connection's record up by
//! identity through `mappings`, which index into `items`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-client records plus the identity index into them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCollection {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    #[serde(default)]
    pub mappings: BTreeMap<String, usize>,
}

impl ClientCollection {
    /// Record for `identity`, if it has been provisioned.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<&serde_json::Value> {
        self.mappings.get(identity).and_then(|&idx| self.items.get(idx))
    }

    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.get(identity).is_some()
    }

    /// Append a record for `identity` and index it. Existing identities keep
    /// their slot.
    pub fn insert(&mut self, identity: &str, record: serde_json::Value) -> usize {
        if let Some(&idx) = self.mappings.get(identity) {
            return idx;
        }
        self.items.push(record);
        let idx = self.items.len() - 1;
        self.mappings.insert(identity.to_owned(), idx);
        idx
    }

    #[must_use]
    pub fn get_mut(&mut self, identity: &str) -> Option<&mut serde_json::Value> {
        let idx = *self.mappings.get(identity)?;
        self.items.get_mut(idx)
    }
}

/// Full application state folded by the reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub shared: serde_json::Value,
    #[serde(default)]
    pub clients: ClientCollection,
}

impl StoreState {
    #[must_use]
    pub fn new(shared: serde_json::Value) -> Self {
        Self { shared, clients: ClientCollection::default() }
    }
}

impl Default for StoreState {
    fn default() -> Self {
        Self::new(serde_json::Value::Object(serde_json::Map::new()))
    }
}

/// Authoritative versioned state. Version 0 is the seeded initial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub state: StoreState,
}

impl Snapshot {
    #[must_use]
    pub fn initial(state: StoreState) -> Self {
        Self { version: 0, state }
    }

    /// Successor snapshot for one applied action.
    #[must_use]
    pub fn advance(&self, state: StoreState) -> Self {
        Self { version: self.version + 1, state }
    }
}

#[cfg(test)]
#[path = "snapshot_test.rs"]
mod tests;
