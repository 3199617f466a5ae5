//! Persistence port for liveness records.
//!
//! The reaper only talks to durable records through [`LivenessStore`]; it
//! never consults the broker's in-memory connection index. Every bulk
//! operation is idempotent so a sweep interrupted half-way can simply run
//! again on the next tick.
use crate::model::{
    ChildrenDeactivated, ConnectionRecord, ConsumerRecord, PoisonMessageRecord, ProducerRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod postgres;


#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait LivenessStore: Send + Sync {
    /// Insert or replace a connection record.
    async fn upsert_connection(&self, record: ConnectionRecord) -> StoreResult<()>;
    /// Move `last_heartbeat` forward. Returns the record's `is_active` flag so
    /// the caller can tell whether the connection was already reaped.
    async fn record_heartbeat(&self, connection_id: &str, at: DateTime<Utc>) -> StoreResult<bool>;
    async fn get_connection(&self, connection_id: &str) -> StoreResult<ConnectionRecord>;

    async fn insert_producer(&self, record: ProducerRecord) -> StoreResult<()>;
    async fn get_producer(&self, producer_id: &str) -> StoreResult<ProducerRecord>;
    async fn insert_consumer(&self, record: ConsumerRecord) -> StoreResult<()>;
    async fn get_consumer(&self, consumer_id: &str) -> StoreResult<ConsumerRecord>;

    async fn insert_poison_message(&self, record: PoisonMessageRecord) -> StoreResult<()>;
    async fn list_poison_messages(&self) -> StoreResult<Vec<PoisonMessageRecord>>;

    /// Ids of active connections whose last heartbeat is before `cutoff`.
    async fn find_stale_connections(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>>;
    /// Flip `is_active=false` on the given connections that are still active
    /// and still older than `cutoff`. Returns the ids actually flipped.
    async fn deactivate_connections(
        &self,
        connection_ids: &[String],
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>>;
    /// Flip `is_active=false` on producers and consumers owned by the given
    /// connections.
    async fn deactivate_children(
        &self,
        connection_ids: &[String],
    ) -> StoreResult<ChildrenDeactivated>;
    /// Flip `is_active=false` on any still-active producer or consumer whose
    /// connection is inactive.
    async fn deactivate_orphaned_children(&self) -> StoreResult<ChildrenDeactivated>;
    /// Delete poison messages created before `older_than`.
    async fn purge_poison_messages(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}
