//! Client view projector.
//!
//! Managers see the whole snapshot. Everyone else sees `shared` plus their
//! own client record and nothing of any other client.

use crate::message::{ClientState, ClientView, View};
use crate::snapshot::Snapshot;

/// Projection of `snapshot` for `identity`. `None` when a non-manager
/// identity has not been provisioned yet.
#[must_use]
pub fn project(snapshot: &Snapshot, identity: &str, is_manager: bool) -> Option<View> {
    if is_manager {
        return Some(View::Full(snapshot.clone()));
    }
    let client = snapshot.state.clients.get(identity)?;
    Some(View::Client(ClientView {
        version: snapshot.version,
        state: ClientState { shared: snapshot.state.shared.clone(), client: client.clone() },
    }))
}

#[cfg(test)]
#[path = "projector_test.rs"]
mod tests;
