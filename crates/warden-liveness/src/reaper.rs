//! Periodic zombie-resource sweep.
//!
//! # Purpose
//! Clients that vanish without closing their connection leave persisted
//! records that still claim to be active. On every tick the [`Reaper`]
//! retires connections whose heartbeat is older than
//! `heartbeat_interval + grace_period`, cascades the retirement to their
//! producers and consumers, and deletes poison messages past retention.
//!
//! # Sweep steps
//! 1. `cutoff = now - (heartbeat_interval + grace_period)`
//! 2. find active connections with `last_heartbeat < cutoff`
//! 3. flip those connections to inactive
//! 4. flip the flipped connections' producers/consumers to inactive, then
//!    repair children of any inactive connection that are still active
//! 5. purge poison messages created before `now - poison_retention`
//!
//! # Failure model
//! A failing step is logged (rate limited), counted, recorded in the
//! [`SweepReport`], and skipped. Steps 2-4 are a chain; step 5 always runs.
//! Nothing escapes the tick, so a storage blip never ends the task. Every
//! step is idempotent, so the next tick finishes whatever this one missed.
//!
//! # Scheduling
//! [`Reaper::run`] drives sweeps from a `tokio::time::interval` with
//! `MissedTickBehavior::Delay`: a slow sweep pushes the next tick back and
//! two sweeps never run at once.
use crate::model::ChildrenDeactivated;
use crate::store::{LivenessStore, StoreError};
use chrono::{DateTime, TimeDelta, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use warden_ratelimit::{RateCounter, RateLimitError};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Interval at which healthy clients heartbeat.
    pub heartbeat_interval: Duration,
    /// Extra slack before a silent connection counts as dead.
    pub grace_period: Duration,
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// Age after which poison messages are deleted.
    pub poison_retention: Duration,
    /// Failure log lines admitted per `diagnostic_window`.
    pub diagnostic_capacity: u64,
    pub diagnostic_window: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            poison_retention: Duration::from_secs(7 * 24 * 60 * 60),
            diagnostic_capacity: 10,
            diagnostic_window: Duration::from_secs(60),
        }
    }
}

impl ReaperConfig {
    /// Silence longer than this marks a connection as a zombie.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval + self.grace_period
    }
}

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error("sweep interval must be greater than zero")]
    ZeroSweepInterval,
    #[error("invalid diagnostic rate limit: {0}")]
    Diagnostics(#[from] RateLimitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStep {
    FindStale,
    DeactivateConnections,
    Cascade,
    RepairOrphans,
    PurgePoison,
}

impl SweepStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindStale => "find_stale",
            Self::DeactivateConnections => "deactivate_connections",
            Self::Cascade => "cascade",
            Self::RepairOrphans => "repair_orphans",
            Self::PurgePoison => "purge_poison",
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_found: usize,
    pub connections_deactivated: Vec<String>,
    pub cascaded: ChildrenDeactivated,
    pub orphans_repaired: ChildrenDeactivated,
    pub poison_purged: u64,
    pub failed_steps: Vec<SweepStep>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

pub struct Reaper {
    store: Arc<dyn LivenessStore>,
    config: ReaperConfig,
    diagnostics: RateCounter,
}

impl Reaper {
    pub fn new(store: Arc<dyn LivenessStore>, config: ReaperConfig) -> Result<Self, ReaperError> {
        if config.sweep_interval.is_zero() {
            return Err(ReaperError::ZeroSweepInterval);
        }
        let diagnostics = RateCounter::new(config.diagnostic_capacity, config.diagnostic_window)?;
        Ok(Self {
            store,
            config,
            diagnostics,
        })
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Sweep on every tick until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(
            backend = self.store.backend_name(),
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            stale_after_ms = self.config.stale_after().as_millis() as u64,
            "liveness reaper started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = &mut shutdown => break,
            }
        }
        tracing::info!("liveness reaper stopped");
    }

    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = subtract(now, self.config.stale_after());

        if let Err((step, err)) = self.retire_stale(cutoff, &mut report).await {
            self.report_failure(&mut report, step, &err);
        }

        match self.store.deactivate_orphaned_children().await {
            Ok(repaired) => report.orphans_repaired = repaired,
            Err(err) => self.report_failure(&mut report, SweepStep::RepairOrphans, &err),
        }

        let horizon = subtract(now, self.config.poison_retention);
        match self.store.purge_poison_messages(horizon).await {
            Ok(purged) => report.poison_purged = purged,
            Err(err) => self.report_failure(&mut report, SweepStep::PurgePoison, &err),
        }

        self.record(&report);
        report
    }

    async fn retire_stale(
        &self,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), (SweepStep, StoreError)> {
        let stale = self
            .store
            .find_stale_connections(cutoff)
            .await
            .map_err(|err| (SweepStep::FindStale, err))?;
        report.stale_found = stale.len();
        if stale.is_empty() {
            return Ok(());
        }

        let deactivated = self
            .store
            .deactivate_connections(&stale, cutoff)
            .await
            .map_err(|err| (SweepStep::DeactivateConnections, err))?;
        report.connections_deactivated = deactivated;
        if report.connections_deactivated.is_empty() {
            return Ok(());
        }

        report.cascaded = self
            .store
            .deactivate_children(&report.connections_deactivated)
            .await
            .map_err(|err| (SweepStep::Cascade, err))?;
        Ok(())
    }

    fn report_failure(&self, report: &mut SweepReport, step: SweepStep, err: &StoreError) {
        report.failed_steps.push(step);
        metrics::counter!("warden_reaper_errors_total", "step" => step.as_str()).increment(1);
        if self.diagnostics.allow() {
            let suppressed = self.diagnostics.count_blocked();
            tracing::warn!(step = step.as_str(), error = %err, suppressed, "liveness sweep step failed");
        }
    }

    fn record(&self, report: &SweepReport) {
        let connections = report.connections_deactivated.len() as u64;
        let producers = report.cascaded.producers + report.orphans_repaired.producers;
        let consumers = report.cascaded.consumers + report.orphans_repaired.consumers;
        metrics::counter!("warden_reaper_sweeps_total").increment(1);
        metrics::counter!("warden_reaper_deactivated_total", "kind" => "connection")
            .increment(connections);
        metrics::counter!("warden_reaper_deactivated_total", "kind" => "producer")
            .increment(producers);
        metrics::counter!("warden_reaper_deactivated_total", "kind" => "consumer")
            .increment(consumers);
        metrics::counter!("warden_reaper_poison_purged_total").increment(report.poison_purged);

        if connections > 0 || producers > 0 || consumers > 0 {
            tracing::info!(
                connections,
                producers,
                consumers,
                "retired zombie resources"
            );
        }
        if report.poison_purged > 0 {
            tracing::debug!(purged = report.poison_purged, "purged expired poison messages");
        }
    }
}

fn subtract(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
