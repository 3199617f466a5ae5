//! Postgres-backed implementation of the liveness store.
//!
//! # What this module is
//! Durable storage for connection, producer, consumer and poison-message
//! records, shared by every broker node pointed at the same database. The
//! reaper's bulk updates map to single `UPDATE ... WHERE` statements so one
//! sweep step is one round trip.
//!
//! # Consistency
//! - There is no optimistic-concurrency token. Concurrent writers to
//!   `is_active` are last-writer-wins.
//! - `deactivate_connections` re-checks `is_active` and `last_heartbeat` in
//!   its `WHERE` clause, so a heartbeat landing between the stale query and
//!   the update keeps the connection alive.
//! - The producer and consumer cascade runs in one transaction.
//!
//! # Security
//! Database URLs may contain credentials; never log `PostgresConfig::url`.
use super::{LivenessStore, StoreError, StoreResult};
use crate::model::{
    ChildrenDeactivated, ConnectionRecord, ConsumerRecord, PoisonMessageRecord, ProducerRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PostgresLivenessStore {
    pool: PgPool,
}

#[derive(Debug, Clone, FromRow)]
struct DbConnection {
    id: String,
    last_heartbeat: DateTime<Utc>,
    is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
struct DbChild {
    id: String,
    connection_id: String,
    is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
struct DbPoisonMessage {
    id: String,
    subject: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl From<DbConnection> for ConnectionRecord {
    fn from(row: DbConnection) -> Self {
        Self {
            id: row.id,
            last_heartbeat: row.last_heartbeat,
            is_active: row.is_active,
        }
    }
}

impl From<DbPoisonMessage> for PoisonMessageRecord {
    fn from(row: DbPoisonMessage) -> Self {
        Self {
            id: row.id,
            subject: row.subject,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

impl PostgresLivenessStore {
    /// Connect and run embedded migrations before returning.
    pub async fn connect(pg: &PostgresConfig) -> StoreResult<Self> {
        let store = Self::connect_without_migrations(pg).await?;
        sqlx::migrate!("./migrations").run(&store.pool).await?;
        Ok(store)
    }

    pub async fn connect_without_migrations(pg: &PostgresConfig) -> StoreResult<Self> {
        // Fail fast on an exhausted pool rather than stalling the sweep.
        let connect_options = PgConnectOptions::from_str(&pg.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_child(&self, table: &'static str, record: DbChild) -> StoreResult<()> {
        // `table` comes from the two call sites below, never from input.
        let query = format!(
            "INSERT INTO {table} (id, connection_id, is_active) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO NOTHING"
        );
        let result = sqlx::query(&query)
            .bind(&record.id)
            .bind(&record.connection_id)
            .bind(record.is_active)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("{table} {}", record.id)));
        }
        Ok(())
    }

    async fn get_child(&self, table: &'static str, id: &str) -> StoreResult<DbChild> {
        let query = format!("SELECT id, connection_id, is_active FROM {table} WHERE id = $1");
        sqlx::query_as::<_, DbChild>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{table} {id}")))
    }
}

#[async_trait]
impl LivenessStore for PostgresLivenessStore {
    async fn upsert_connection(&self, record: ConnectionRecord) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO connections (id, last_heartbeat, is_active) VALUES ($1, $2, $3)
               ON CONFLICT (id) DO UPDATE
               SET last_heartbeat = EXCLUDED.last_heartbeat, is_active = EXCLUDED.is_active"#,
        )
        .bind(&record.id)
        .bind(record.last_heartbeat)
        .bind(record.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_heartbeat(&self, connection_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "UPDATE connections SET last_heartbeat = $2 WHERE id = $1 RETURNING is_active",
        )
        .bind(connection_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("connection {connection_id}")))
    }

    async fn get_connection(&self, connection_id: &str) -> StoreResult<ConnectionRecord> {
        sqlx::query_as::<_, DbConnection>(
            "SELECT id, last_heartbeat, is_active FROM connections WHERE id = $1",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ConnectionRecord::from)
        .ok_or_else(|| StoreError::NotFound(format!("connection {connection_id}")))
    }

    async fn insert_producer(&self, record: ProducerRecord) -> StoreResult<()> {
        self.insert_child(
            "producers",
            DbChild {
                id: record.id,
                connection_id: record.connection_id,
                is_active: record.is_active,
            },
        )
        .await
    }

    async fn get_producer(&self, producer_id: &str) -> StoreResult<ProducerRecord> {
        let row = self.get_child("producers", producer_id).await?;
        Ok(ProducerRecord {
            id: row.id,
            connection_id: row.connection_id,
            is_active: row.is_active,
        })
    }

    async fn insert_consumer(&self, record: ConsumerRecord) -> StoreResult<()> {
        self.insert_child(
            "consumers",
            DbChild {
                id: record.id,
                connection_id: record.connection_id,
                is_active: record.is_active,
            },
        )
        .await
    }

    async fn get_consumer(&self, consumer_id: &str) -> StoreResult<ConsumerRecord> {
        let row = self.get_child("consumers", consumer_id).await?;
        Ok(ConsumerRecord {
            id: row.id,
            connection_id: row.connection_id,
            is_active: row.is_active,
        })
    }

    async fn insert_poison_message(&self, record: PoisonMessageRecord) -> StoreResult<()> {
        let result = sqlx::query(
            r#"INSERT INTO poison_messages (id, subject, payload, created_at)
               VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(&record.id)
        .bind(&record.subject)
        .bind(&record.payload)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("poison message {}", record.id)));
        }
        Ok(())
    }

    async fn list_poison_messages(&self) -> StoreResult<Vec<PoisonMessageRecord>> {
        let rows = sqlx::query_as::<_, DbPoisonMessage>(
            "SELECT id, subject, payload, created_at FROM poison_messages ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PoisonMessageRecord::from).collect())
    }

    async fn find_stale_connections(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM connections WHERE is_active AND last_heartbeat < $1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn deactivate_connections(
        &self,
        connection_ids: &[String],
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        if connection_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = sqlx::query_scalar::<_, String>(
            r#"UPDATE connections SET is_active = FALSE
               WHERE id = ANY($1) AND is_active AND last_heartbeat < $2
               RETURNING id"#,
        )
        .bind(connection_ids)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn deactivate_children(
        &self,
        connection_ids: &[String],
    ) -> StoreResult<ChildrenDeactivated> {
        if connection_ids.is_empty() {
            return Ok(ChildrenDeactivated::default());
        }
        let mut tx = self.pool.begin().await?;
        let producers = sqlx::query(
            "UPDATE producers SET is_active = FALSE WHERE is_active AND connection_id = ANY($1)",
        )
        .bind(connection_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let consumers = sqlx::query(
            "UPDATE consumers SET is_active = FALSE WHERE is_active AND connection_id = ANY($1)",
        )
        .bind(connection_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(ChildrenDeactivated {
            producers,
            consumers,
        })
    }

    async fn deactivate_orphaned_children(&self) -> StoreResult<ChildrenDeactivated> {
        let mut tx = self.pool.begin().await?;
        let producers = sqlx::query(
            r#"UPDATE producers SET is_active = FALSE
               WHERE is_active
                 AND connection_id IN (SELECT id FROM connections WHERE NOT is_active)"#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let consumers = sqlx::query(
            r#"UPDATE consumers SET is_active = FALSE
               WHERE is_active
                 AND connection_id IN (SELECT id FROM connections WHERE NOT is_active)"#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(ChildrenDeactivated {
            producers,
            consumers,
        })
    }

    async fn purge_poison_messages(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM poison_messages WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
