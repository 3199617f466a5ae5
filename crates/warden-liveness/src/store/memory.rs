//! In-memory implementation of the liveness store.
//!
//! # Purpose
//! Implements [`LivenessStore`] with `HashMap`s guarded by
//! `tokio::sync::RwLock`. Used for local development, tests, and single-node
//! deployments where losing liveness records on restart is acceptable.
//!
//! # Consistency
//! Each bulk update holds the write lock of the collection it mutates for the
//! whole update, so it is atomic within that collection. Cross-collection
//! updates (connections then children) take the locks one after another,
//! never nested, matching the eventual-consistency contract of the reaper.
use super::{LivenessStore, StoreError, StoreResult};
use crate::model::{
    ChildrenDeactivated, ConnectionRecord, ConsumerRecord, PoisonMessageRecord, ProducerRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryLivenessStore {
    connections: Arc<RwLock<HashMap<String, ConnectionRecord>>>,
    producers: Arc<RwLock<HashMap<String, ProducerRecord>>>,
    consumers: Arc<RwLock<HashMap<String, ConsumerRecord>>>,
    poison_messages: Arc<RwLock<HashMap<String, PoisonMessageRecord>>>,
}

impl InMemoryLivenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn inactive_connection_ids(&self) -> HashSet<String> {
        self.connections
            .read()
            .await
            .values()
            .filter(|record| !record.is_active)
            .map(|record| record.id.clone())
            .collect()
    }
}

// Shared cascade body for producers and consumers.
macro_rules! deactivate_owned {
    ($map:expr, $owners:expr) => {{
        let mut flipped = 0u64;
        for record in $map.write().await.values_mut() {
            if record.is_active && $owners.contains(&record.connection_id) {
                record.is_active = false;
                flipped += 1;
            }
        }
        flipped
    }};
}

#[async_trait]
impl LivenessStore for InMemoryLivenessStore {
    async fn upsert_connection(&self, record: ConnectionRecord) -> StoreResult<()> {
        self.connections
            .write()
            .await
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn record_heartbeat(&self, connection_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut connections = self.connections.write().await;
        let record = connections
            .get_mut(connection_id)
            .ok_or_else(|| StoreError::NotFound(format!("connection {connection_id}")))?;
        record.last_heartbeat = at;
        Ok(record.is_active)
    }

    async fn get_connection(&self, connection_id: &str) -> StoreResult<ConnectionRecord> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("connection {connection_id}")))
    }

    async fn insert_producer(&self, record: ProducerRecord) -> StoreResult<()> {
        let mut producers = self.producers.write().await;
        if producers.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("producer {}", record.id)));
        }
        producers.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_producer(&self, producer_id: &str) -> StoreResult<ProducerRecord> {
        self.producers
            .read()
            .await
            .get(producer_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("producer {producer_id}")))
    }

    async fn insert_consumer(&self, record: ConsumerRecord) -> StoreResult<()> {
        let mut consumers = self.consumers.write().await;
        if consumers.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("consumer {}", record.id)));
        }
        consumers.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_consumer(&self, consumer_id: &str) -> StoreResult<ConsumerRecord> {
        self.consumers
            .read()
            .await
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("consumer {consumer_id}")))
    }

    async fn insert_poison_message(&self, record: PoisonMessageRecord) -> StoreResult<()> {
        let mut messages = self.poison_messages.write().await;
        if messages.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("poison message {}", record.id)));
        }
        messages.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list_poison_messages(&self) -> StoreResult<Vec<PoisonMessageRecord>> {
        let mut messages: Vec<_> = self.poison_messages.read().await.values().cloned().collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn find_stale_connections(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut stale: Vec<String> = self
            .connections
            .read()
            .await
            .values()
            .filter(|record| record.is_active && record.last_heartbeat < cutoff)
            .map(|record| record.id.clone())
            .collect();
        stale.sort();
        Ok(stale)
    }

    async fn deactivate_connections(
        &self,
        connection_ids: &[String],
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let mut connections = self.connections.write().await;
        let mut flipped = Vec::new();
        for id in connection_ids {
            if let Some(record) = connections.get_mut(id)
                && record.is_active
                && record.last_heartbeat < cutoff
            {
                record.is_active = false;
                flipped.push(id.clone());
            }
        }
        Ok(flipped)
    }

    async fn deactivate_children(
        &self,
        connection_ids: &[String],
    ) -> StoreResult<ChildrenDeactivated> {
        let owners: HashSet<String> = connection_ids.iter().cloned().collect();
        Ok(ChildrenDeactivated {
            producers: deactivate_owned!(self.producers, owners),
            consumers: deactivate_owned!(self.consumers, owners),
        })
    }

    async fn deactivate_orphaned_children(&self) -> StoreResult<ChildrenDeactivated> {
        let owners = self.inactive_connection_ids().await;
        if owners.is_empty() {
            return Ok(ChildrenDeactivated::default());
        }
        Ok(ChildrenDeactivated {
            producers: deactivate_owned!(self.producers, owners),
            consumers: deactivate_owned!(self.consumers, owners),
        })
    }

    async fn purge_poison_messages(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut messages = self.poison_messages.write().await;
        let before = messages.len();
        messages.retain(|_, record| record.created_at >= older_than);
        Ok((before - messages.len()) as u64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn heartbeat_updates_timestamp_and_reports_active_flag() {
        let store = InMemoryLivenessStore::new();
        let t0 = Utc::now() - Duration::minutes(5);
        store
            .upsert_connection(ConnectionRecord::active("c1", t0))
            .await
            .expect("upsert");
        let now = Utc::now();
        assert!(store.record_heartbeat("c1", now).await.expect("heartbeat"));
        assert_eq!(
            store.get_connection("c1").await.expect("get").last_heartbeat,
            now
        );
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_connection_is_not_found() {
        let store = InMemoryLivenessStore::new();
        let err = store
            .record_heartbeat("missing", Utc::now())
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_producer_is_conflict() {
        let store = InMemoryLivenessStore::new();
        store
            .insert_producer(ProducerRecord::active("p1", "c1"))
            .await
            .expect("insert");
        let err = store
            .insert_producer(ProducerRecord::active("p1", "c2"))
            .await
            .expect_err("dup");
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(
            store.get_producer("p1").await.expect("get").connection_id,
            "c1"
        );
    }

    #[tokio::test]
    async fn find_stale_skips_fresh_and_inactive() {
        let store = InMemoryLivenessStore::new();
        let now = Utc::now();
        let old = now - Duration::minutes(10);
        store
            .upsert_connection(ConnectionRecord::active("stale", old))
            .await
            .expect("upsert");
        store
            .upsert_connection(ConnectionRecord::active("fresh", now))
            .await
            .expect("upsert");
        store
            .upsert_connection(ConnectionRecord {
                id: "gone".to_string(),
                last_heartbeat: old,
                is_active: false,
            })
            .await
            .expect("upsert");
        let cutoff = now - Duration::minutes(1);
        assert_eq!(
            store.find_stale_connections(cutoff).await.expect("find"),
            vec!["stale".to_string()]
        );
    }

    #[tokio::test]
    async fn deactivate_connections_skips_records_refreshed_since_query() {
        let store = InMemoryLivenessStore::new();
        let now = Utc::now();
        let cutoff = now - Duration::minutes(1);
        store
            .upsert_connection(ConnectionRecord::active("c1", now - Duration::minutes(5)))
            .await
            .expect("upsert");
        let stale = store.find_stale_connections(cutoff).await.expect("find");
        store.record_heartbeat("c1", now).await.expect("heartbeat");
        let flipped = store
            .deactivate_connections(&stale, cutoff)
            .await
            .expect("deactivate");
        assert!(flipped.is_empty());
        assert!(store.get_connection("c1").await.expect("get").is_active);
    }

    #[tokio::test]
    async fn deactivate_children_is_idempotent() {
        let store = InMemoryLivenessStore::new();
        store
            .insert_producer(ProducerRecord::active("p1", "c1"))
            .await
            .expect("insert");
        store
            .insert_consumer(ConsumerRecord::active("k1", "c1"))
            .await
            .expect("insert");
        store
            .insert_consumer(ConsumerRecord::active("k2", "c2"))
            .await
            .expect("insert");
        let ids = vec!["c1".to_string()];
        let first = store.deactivate_children(&ids).await.expect("cascade");
        assert_eq!(
            first,
            ChildrenDeactivated {
                producers: 1,
                consumers: 1
            }
        );
        let second = store.deactivate_children(&ids).await.expect("cascade");
        assert_eq!(second.total(), 0);
        assert!(store.get_consumer("k2").await.expect("get").is_active);
    }

    #[tokio::test]
    async fn purge_removes_only_old_poison_messages() {
        let store = InMemoryLivenessStore::new();
        let now = Utc::now();
        for (id, age) in [("old", 48), ("new", 1)] {
            store
                .insert_poison_message(PoisonMessageRecord {
                    id: id.to_string(),
                    subject: "orders.created".to_string(),
                    payload: b"{}".to_vec(),
                    created_at: now - Duration::hours(age),
                })
                .await
                .expect("insert");
        }
        let purged = store
            .purge_poison_messages(now - Duration::hours(24))
            .await
            .expect("purge");
        assert_eq!(purged, 1);
        let remaining = store.list_poison_messages().await.expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "new");
    }
}
