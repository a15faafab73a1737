//! Postgres backend.
//!
//! DESIGN
//! ======
//! - Records live in `store_records`, lists in `store_lists` ordered by a
//!   `BIGSERIAL` id. `pop_head` deletes the oldest row with
//!   `FOR UPDATE SKIP LOCKED`, so concurrent poppers never return the same row.
//! - Locks live in `store_leases`. Acquisition is one upsert that only
//!   overwrites an expired row; expiry is evaluated by the database clock so
//!   replicas never compare their own clocks.
//! - The bus is `pg_notify` / `LISTEN`. Notifications from one session are
//!   delivered in commit order, which gives the per-publisher ordering the
//!   queue relies on. Payloads are capped by Postgres at 8000 bytes.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BroadcastBus, DurableStore, LockService, LockToken, StoreError};

const LISTENER_RETRY_MS: u64 = 250;

#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DurableStore for PgBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM store_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO store_records (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn push_tail(&self, list: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO store_lists (list_key, value) VALUES ($1, $2)")
            .bind(list)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_head(&self, list: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>(
            "DELETE FROM store_lists WHERE id = ( \
                 SELECT id FROM store_lists WHERE list_key = $1 \
                 ORDER BY id ASC LIMIT 1 FOR UPDATE SKIP LOCKED \
             ) RETURNING value",
        )
        .bind(list)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM store_records WHERE key = $1")
            .bind(key)
            .execute(tx.as_mut())
            .await?;
        sqlx::query("DELETE FROM store_lists WHERE list_key = $1")
            .bind(key)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LockService for PgBackend {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError> {
        let token = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO store_leases (name, token, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3)) \
             ON CONFLICT (name) DO UPDATE SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at \
             WHERE store_leases.expires_at <= now() \
             RETURNING token",
        )
        .bind(name)
        .bind(Uuid::new_v4())
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(token.map(LockToken))
    }

    async fn extend(&self, name: &str, token: LockToken, ttl: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE store_leases SET expires_at = now() + make_interval(secs => $3) \
             WHERE name = $1 AND token = $2 AND expires_at > now()",
        )
        .bind(name)
        .bind(token.0)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, token: LockToken) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM store_leases WHERE name = $1 AND token = $2")
            .bind(name)
            .bind(token.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BroadcastBus for PgBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(channel.to_owned(), listener, tx));
        Ok(rx)
    }
}

// =============================================================================
// LISTENER TASK
// =============================================================================

/// Source of notification payloads for one subscription.
#[async_trait::async_trait]
trait Notifications: Send {
    async fn next_payload(&mut self) -> Result<String, sqlx::Error>;
}

#[async_trait::async_trait]
impl Notifications for PgListener {
    async fn next_payload(&mut self) -> Result<String, sqlx::Error> {
        Ok(self.recv().await?.payload().to_owned())
    }
}

/// Forward payloads to `tx` until the subscriber drops its receiver. A quiet
/// channel does not keep the task alive.
async fn forward(channel: String, mut source: impl Notifications, tx: mpsc::UnboundedSender<String>) {
    debug!(%channel, "pg bus: listening");
    loop {
        let received = tokio::select! {
            () = tx.closed() => break,
            received = source.next_payload() => received,
        };
        match received {
            Ok(payload) => {
                if tx.send(payload).is_err() {
                    break;
                }
            }
            Err(e) => {
                // PgListener reconnects on the next recv().
                warn!(%channel, error = %e, "pg bus: listener error");
                tokio::select! {
                    () = tx.closed() => break,
                    () = tokio::time::sleep(Duration::from_millis(LISTENER_RETRY_MS)) => {}
                }
            }
        }
    }
    debug!(%channel, "pg bus: subscriber dropped");
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
