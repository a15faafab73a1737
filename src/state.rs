//! Shared application state and startup wiring.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the running engine and the config it was built from.
//!
//! Backend selection: `DATABASE_URL` set means Postgres for storage, leases,
//! and broadcast; otherwise one in-process `MemoryBackend`. `REPLICATED`
//! picks the lease/broadcast queue over the in-process one.

use std::sync::Arc;

use tracing::info;

use crate::backend::Namespace;
use crate::backend::memory::MemoryBackend;
use crate::backend::postgres::PgBackend;
use crate::config::{ConfigError, ServerConfig};
use crate::engine::Engine;
use crate::queue::replicated::Backends;
use crate::queue::{ActionQueue, LocalQueue, QueueError, ReplicatedQueue};
use crate::reducer::Reducer;
use crate::services::coordinator::{Authenticator, TokenAuthenticator};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue init failed: {0}")]
    Queue(#[from] QueueError),
}

/// Shared application state, injected into Axum handlers via State extractor.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Engine, config: ServerConfig) -> Self {
        Self { engine: Arc::new(engine), config: Arc::new(config) }
    }

    /// Open the configured queue and start an engine on it with the token
    /// authenticator.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the database is unreachable,
    /// or the queue cannot initialize.
    pub async fn bootstrap(config: ServerConfig, reducer: Arc<dyn Reducer>) -> Result<Self, StartupError> {
        config.validate()?;
        let queue = open_queue(&config).await?;
        let authenticator: Arc<dyn Authenticator> = Arc::new(TokenAuthenticator::new(config.manager_token.clone()));
        let engine = Engine::start(queue, reducer, authenticator, config.poll_interval).await?;
        Ok(Self::new(engine, config))
    }
}

/// Build the queue the config asks for.
///
/// # Errors
///
/// Returns an error if the database pool or the broadcast subscription
/// cannot be set up.
pub async fn open_queue(config: &ServerConfig) -> Result<Arc<dyn ActionQueue>, StartupError> {
    if !config.replicated {
        info!("startup: in-process queue");
        return Ok(Arc::new(LocalQueue::new()));
    }

    let namespace = Namespace::new(config.prefix.clone());
    let backends = match &config.database_url {
        Some(url) => {
            let pool = crate::db::init_pool(url).await?;
            info!(prefix = %namespace.label(), "startup: replicated queue on postgres");
            Backends::single(PgBackend::new(pool))
        }
        None => {
            info!(prefix = %namespace.label(), "startup: replicated queue on in-memory backend");
            Backends::single(MemoryBackend::new())
        }
    };
    let queue = ReplicatedQueue::connect(backends, namespace, config.lock_ttl).await?;
    Ok(Arc::new(queue))
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
