//! Hub — live connections and their room memberships.
//!
//! DESIGN
//! ======
//! Each connection registers a bounded sender; the websocket task drains the
//! matching receiver. Rooms are plain names: one per client identity plus
//! `managers`. Emits are best-effort `try_send`: a connection whose buffer is
//! full misses that message rather than stalling the dispatcher. Emitting to
//! several rooms reaches each connection at most once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::message::Outbound;

/// Room every manager connection joins.
pub const MANAGERS_ROOM: &str = "managers";

pub type ConnectionId = Uuid;

struct Connection {
    tx: mpsc::Sender<Outbound>,
    rooms: HashSet<String>,
}

impl Connection {
    fn in_any(&self, rooms: &[&str]) -> bool {
        rooms.iter().any(|room| self.rooms.contains(*room))
    }
}

#[derive(Clone, Default)]
pub struct Hub {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: ConnectionId, tx: mpsc::Sender<Outbound>) {
        let mut connections = self.connections.write().await;
        connections.insert(id, Connection { tx, rooms: HashSet::new() });
        info!(connection = %id, total = connections.len(), "hub: connection registered");
    }

    pub async fn unregister(&self, id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if connections.remove(&id).is_some() {
            info!(connection = %id, total = connections.len(), "hub: connection removed");
        }
    }

    pub async fn join(&self, id: ConnectionId, room: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(&id) {
            conn.rooms.insert(room.to_owned());
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn rooms_of(&self, id: ConnectionId) -> HashSet<String> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|conn| conn.rooms.clone())
            .unwrap_or_default()
    }

    /// Send to one connection.
    pub async fn emit_to(&self, id: ConnectionId, msg: &Outbound) {
        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(&id) {
            deliver(id, conn, msg);
        }
    }

    /// Send to every connection in at least one of `rooms`.
    pub async fn emit_to_rooms(&self, rooms: &[&str], msg: &Outbound) {
        let connections = self.connections.read().await;
        for (id, conn) in connections.iter().filter(|(_, conn)| conn.in_any(rooms)) {
            deliver(*id, conn, msg);
        }
    }

    /// Send to every connection in none of `rooms`.
    pub async fn emit_excluding_rooms(&self, rooms: &[&str], msg: &Outbound) {
        let connections = self.connections.read().await;
        for (id, conn) in connections.iter().filter(|(_, conn)| !conn.in_any(rooms)) {
            deliver(*id, conn, msg);
        }
    }

    pub async fn emit_all(&self, msg: &Outbound) {
        self.emit_excluding_rooms(&[], msg).await;
    }
}

fn deliver(id: ConnectionId, conn: &Connection, msg: &Outbound) {
    if conn.tx.try_send(msg.clone()).is_err() {
        debug!(connection = %id, event = msg.event(), "hub: outbound buffer full or closed; dropping");
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
