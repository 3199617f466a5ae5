//! Durable liveness records and the reaper that keeps them honest.
//!
//! The broker gets no notification when a client silently disappears, so
//! persisted connection, producer and consumer records can keep claiming to
//! be active long after their owner is gone. [`Reaper`] reconciles them on a
//! timer against heartbeat timestamps held by a [`LivenessStore`].
pub mod model;
pub mod reaper;
pub mod store;

pub use model::{
    ChildrenDeactivated, ConnectionRecord, ConsumerRecord, PoisonMessageRecord, ProducerRecord,
};
pub use reaper::{Reaper, ReaperConfig, ReaperError, SweepReport, SweepStep};
pub use store::memory::InMemoryLivenessStore;
pub use store::postgres::{PostgresConfig, PostgresLivenessStore};
pub use store::{LivenessStore, StoreError, StoreResult};
