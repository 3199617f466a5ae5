use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use warden_liveness::{
    ChildrenDeactivated, ConnectionRecord, ConsumerRecord, InMemoryLivenessStore, LivenessStore,
    PoisonMessageRecord, ProducerRecord, Reaper, ReaperConfig, StoreError, StoreResult, SweepStep,
};

fn config() -> ReaperConfig {
    ReaperConfig {
        heartbeat_interval: Duration::from_secs(10),
        grace_period: Duration::from_secs(20),
        sweep_interval: Duration::from_millis(10),
        poison_retention: Duration::from_secs(3600),
        ..ReaperConfig::default()
    }
}

async fn seed_connection(store: &dyn LivenessStore, id: &str, last_heartbeat: DateTime<Utc>) {
    store
        .upsert_connection(ConnectionRecord::active(id, last_heartbeat))
        .await
        .expect("connection");
    store
        .insert_producer(ProducerRecord::active(format!("{id}-p"), id))
        .await
        .expect("producer");
    store
        .insert_consumer(ConsumerRecord::active(format!("{id}-c"), id))
        .await
        .expect("consumer");
}

#[tokio::test]
async fn stale_connection_and_children_are_retired_fresh_untouched() {
    let store = Arc::new(InMemoryLivenessStore::new());
    let now = Utc::now();
    seed_connection(store.as_ref(), "zombie", now - ChronoDuration::seconds(31)).await;
    seed_connection(store.as_ref(), "alive", now - ChronoDuration::seconds(5)).await;

    let reaper = Reaper::new(store.clone(), config()).expect("reaper");
    let report = reaper.sweep_at(now).await;

    assert!(report.is_clean());
    assert_eq!(report.connections_deactivated, vec!["zombie".to_string()]);
    assert_eq!(
        report.cascaded,
        ChildrenDeactivated {
            producers: 1,
            consumers: 1
        }
    );
    assert!(!store.get_connection("zombie").await.expect("get").is_active);
    assert!(!store.get_producer("zombie-p").await.expect("get").is_active);
    assert!(!store.get_consumer("zombie-c").await.expect("get").is_active);
    assert!(store.get_connection("alive").await.expect("get").is_active);
    assert!(store.get_producer("alive-p").await.expect("get").is_active);
    assert!(store.get_consumer("alive-c").await.expect("get").is_active);
}

#[tokio::test]
async fn heartbeat_exactly_at_cutoff_is_not_stale() {
    let store = Arc::new(InMemoryLivenessStore::new());
    let now = Utc::now();
    seed_connection(store.as_ref(), "edge", now - ChronoDuration::seconds(30)).await;
    let reaper = Reaper::new(store.clone(), config()).expect("reaper");
    let report = reaper.sweep_at(now).await;
    assert_eq!(report.stale_found, 0);
    assert!(store.get_connection("edge").await.expect("get").is_active);
}

#[tokio::test]
async fn second_sweep_is_a_no_op() {
    let store = Arc::new(InMemoryLivenessStore::new());
    let now = Utc::now();
    seed_connection(store.as_ref(), "zombie", now - ChronoDuration::minutes(5)).await;
    let reaper = Reaper::new(store.clone(), config()).expect("reaper");
    reaper.sweep_at(now).await;
    let report = reaper.sweep_at(now).await;
    assert_eq!(report.stale_found, 0);
    assert!(report.connections_deactivated.is_empty());
    assert_eq!(report.orphans_repaired.total(), 0);
}

#[tokio::test]
async fn poison_messages_past_retention_are_purged() {
    let store = Arc::new(InMemoryLivenessStore::new());
    let now = Utc::now();
    for (id, age_secs) in [("expired", 7200), ("recent", 60)] {
        store
            .insert_poison_message(PoisonMessageRecord {
                id: id.to_string(),
                subject: "payments.settle".to_string(),
                payload: vec![0xde, 0xad],
                created_at: now - ChronoDuration::seconds(age_secs),
            })
            .await
            .expect("insert");
    }
    let reaper = Reaper::new(store.clone(), config()).expect("reaper");
    let report = reaper.sweep_at(now).await;
    assert_eq!(report.poison_purged, 1);
    let remaining: Vec<String> = store
        .list_poison_messages()
        .await
        .expect("list")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(remaining, vec!["recent".to_string()]);
}

/// Wraps the in-memory store and fails selected operations on demand.
struct FlakyStore {
    inner: InMemoryLivenessStore,
    fail_find: AtomicBool,
    fail_cascade: AtomicBool,
    fail_purge: AtomicBool,
    cascade_calls: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryLivenessStore::new(),
            fail_find: AtomicBool::new(false),
            fail_cascade: AtomicBool::new(false),
            fail_purge: AtomicBool::new(false),
            cascade_calls: AtomicUsize::new(0),
        }
    }

    fn outage(step: &str) -> StoreError {
        StoreError::Unexpected(anyhow::anyhow!("injected {step} failure"))
    }
}

#[async_trait]
impl LivenessStore for FlakyStore {
    async fn upsert_connection(&self, record: ConnectionRecord) -> StoreResult<()> {
        self.inner.upsert_connection(record).await
    }

    async fn record_heartbeat(&self, connection_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.record_heartbeat(connection_id, at).await
    }

    async fn get_connection(&self, connection_id: &str) -> StoreResult<ConnectionRecord> {
        self.inner.get_connection(connection_id).await
    }

    async fn insert_producer(&self, record: ProducerRecord) -> StoreResult<()> {
        self.inner.insert_producer(record).await
    }

    async fn get_producer(&self, producer_id: &str) -> StoreResult<ProducerRecord> {
        self.inner.get_producer(producer_id).await
    }

    async fn insert_consumer(&self, record: ConsumerRecord) -> StoreResult<()> {
        self.inner.insert_consumer(record).await
    }

    async fn get_consumer(&self, consumer_id: &str) -> StoreResult<ConsumerRecord> {
        self.inner.get_consumer(consumer_id).await
    }

    async fn insert_poison_message(&self, record: PoisonMessageRecord) -> StoreResult<()> {
        self.inner.insert_poison_message(record).await
    }

    async fn list_poison_messages(&self) -> StoreResult<Vec<PoisonMessageRecord>> {
        self.inner.list_poison_messages().await
    }

    async fn find_stale_connections(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>> {
        if self.fail_find.load(Ordering::SeqCst) {
            return Err(Self::outage("find"));
        }
        self.inner.find_stale_connections(cutoff).await
    }

    async fn deactivate_connections(
        &self,
        connection_ids: &[String],
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        self.inner
            .deactivate_connections(connection_ids, cutoff)
            .await
    }

    async fn deactivate_children(
        &self,
        connection_ids: &[String],
    ) -> StoreResult<ChildrenDeactivated> {
        self.cascade_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_cascade.load(Ordering::SeqCst) {
            return Err(Self::outage("cascade"));
        }
        self.inner.deactivate_children(connection_ids).await
    }

    async fn deactivate_orphaned_children(&self) -> StoreResult<ChildrenDeactivated> {
        if self.fail_cascade.load(Ordering::SeqCst) {
            return Err(Self::outage("orphans"));
        }
        self.inner.deactivate_orphaned_children().await
    }

    async fn purge_poison_messages(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        if self.fail_purge.load(Ordering::SeqCst) {
            return Err(Self::outage("purge"));
        }
        self.inner.purge_poison_messages(older_than).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test]
async fn failed_cascade_is_repaired_on_next_tick() {
    let store = Arc::new(FlakyStore::new());
    let now = Utc::now();
    seed_connection(store.as_ref(), "zombie", now - ChronoDuration::minutes(5)).await;
    let reaper = Reaper::new(store.clone(), config()).expect("reaper");

    store.fail_cascade.store(true, Ordering::SeqCst);
    let report = reaper.sweep_at(now).await;
    assert_eq!(
        report.failed_steps,
        vec![SweepStep::Cascade, SweepStep::RepairOrphans]
    );
    assert!(!store.get_connection("zombie").await.expect("get").is_active);
    // Parent is inactive but the children are orphaned and still active.
    assert!(store.get_producer("zombie-p").await.expect("get").is_active);

    store.fail_cascade.store(false, Ordering::SeqCst);
    let report = reaper.sweep_at(now).await;
    assert!(report.is_clean());
    // The parent is no longer a candidate, so only orphan repair can reach it.
    assert_eq!(report.stale_found, 0);
    assert_eq!(
        report.orphans_repaired,
        ChildrenDeactivated {
            producers: 1,
            consumers: 1
        }
    );
    assert!(!store.get_producer("zombie-p").await.expect("get").is_active);
    assert!(!store.get_consumer("zombie-c").await.expect("get").is_active);
}

#[tokio::test]
async fn find_failure_still_purges_poison_messages() {
    let store = Arc::new(FlakyStore::new());
    let now = Utc::now();
    store
        .insert_poison_message(PoisonMessageRecord {
            id: "old".to_string(),
            subject: "s".to_string(),
            payload: Vec::new(),
            created_at: now - ChronoDuration::days(30),
        })
        .await
        .expect("insert");
    store.fail_find.store(true, Ordering::SeqCst);
    let reaper = Reaper::new(store.clone(), config()).expect("reaper");
    let report = reaper.sweep_at(now).await;
    assert_eq!(report.failed_steps, vec![SweepStep::FindStale]);
    assert_eq!(report.poison_purged, 1);
    assert_eq!(store.cascade_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn run_survives_failures_and_stops_on_shutdown() {
    let store = Arc::new(FlakyStore::new());
    store.fail_find.store(true, Ordering::SeqCst);
    store.fail_purge.store(true, Ordering::SeqCst);
    let reaper = Reaper::new(store.clone(), config()).expect("reaper");

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(reaper.run(async {
        let _ = rx.await;
    }));

    seed_connection(
        store.as_ref(),
        "zombie",
        Utc::now() - ChronoDuration::minutes(5),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert!(store.get_connection("zombie").await.expect("get").is_active);

    // Storage recovers; a later tick retires the zombie.
    store.fail_find.store(false, Ordering::SeqCst);
    let mut retired = false;
    for _ in 0..100 {
        if !store.get_connection("zombie").await.expect("get").is_active {
            retired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(retired);

    tx.send(()).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("reaper stops")
        .expect("join");
}
