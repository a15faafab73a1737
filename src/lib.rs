//! Replicated shared store served over websockets.
//!
//! Clients send actions; one leader replica drains them in a single total
//! order, every replica folds them through the same reducer, and each
//! connection receives the actions and projections it is entitled to.

pub mod action;
pub mod backend;
pub mod channel;
pub mod config;
pub mod db;
pub mod engine;
pub mod lease;
pub mod message;
pub mod queue;
pub mod reducer;
pub mod routes;
pub mod services;
pub mod snapshot;
pub mod state;
