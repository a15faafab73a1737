//! Per-replica runtime around the action queue.
//!
//! ARCHITECTURE
//! ============
//! - `dispatcher`: drains the queue, owns the current snapshot
//! - `hub`: live connections, rooms, best-effort fan-out
//! - `coordinator`: authentication, provisioning, hydration
//! - `projector`: what each connection may see of a snapshot

pub mod coordinator;
pub mod dispatcher;
pub mod hub;
pub mod projector;
