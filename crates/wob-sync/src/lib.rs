//! Sync pipeline orchestration: cycle execution + interval scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wob_adapters::{fetch_raw_orders, FetchPlan, OrderSource, DEFAULT_DOCUMENT_FLAG, DEFAULT_PROCEDURE};
use wob_core::Order;
use wob_storage::OrderStore;

pub const CRATE_NAME: &str = "wob-sync";

pub const DEFAULT_ORDERS_INTERVAL_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub source_url: String,
    pub source_query: Option<String>,
    pub source_procedure: String,
    pub source_document_flag: String,
    pub orders_interval: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("WOB_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://wob.db".to_string()),
            source_url: std::env::var("WOB_SOURCE_URL")
                .unwrap_or_else(|_| "postgres://wob@localhost:5432/warehouse".to_string()),
            source_query: std::env::var("WOB_SOURCE_QUERY").ok(),
            source_procedure: std::env::var("WOB_SOURCE_PROCEDURE")
                .unwrap_or_else(|_| DEFAULT_PROCEDURE.to_string()),
            source_document_flag: std::env::var("WOB_SOURCE_DOCUMENT_FLAG")
                .unwrap_or_else(|_| DEFAULT_DOCUMENT_FLAG.to_string()),
            orders_interval: Duration::from_millis(
                std::env::var("WOB_ORDERS_SYNC_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_ORDERS_INTERVAL_MS),
            ),
        }
    }

    pub fn fetch_plan(&self) -> FetchPlan {
        FetchPlan {
            adhoc_query: self.source_query.clone(),
            procedure: self.source_procedure.clone(),
            document_flag: self.source_document_flag.clone(),
        }
    }
}

/// Outcome of one completed fetch→normalize→upsert pass.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Raw rows the source yielded.
    pub fetched: usize,
    /// Rows dropped by normalization (missing key or arrival date).
    pub dropped: usize,
    /// Orders written to the destination store.
    pub synced: usize,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// A previous cycle was still running; this trigger was skipped
    /// entirely, not queued.
    Busy,
}

/// One sync pipeline with its own overlap guard. Independent sync kinds
/// (orders today, photos elsewhere) each own a pipeline and therefore an
/// independent busy flag.
pub struct SyncPipeline {
    store: OrderStore,
    source: Arc<dyn OrderSource>,
    plan: FetchPlan,
    busy: AtomicBool,
}

// Clears the busy flag on every exit path out of a cycle.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncPipeline {
    pub fn new(store: OrderStore, source: Arc<dyn OrderSource>, plan: FetchPlan) -> Self {
        Self {
            store,
            source,
            plan,
            busy: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &OrderStore {
        &self.store
    }

    /// Run one cycle unless a previous one is still in flight.
    pub async fn try_run_cycle(&self) -> Result<CycleOutcome> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(CycleOutcome::Busy);
        }
        let _guard = BusyGuard(&self.busy);
        self.run_cycle().await.map(CycleOutcome::Completed)
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        self.store
            .ensure_schema()
            .await
            .context("ensuring destination schema")?;

        let raw = fetch_raw_orders(self.source.as_ref(), &self.plan)
            .await
            .context("fetching raw orders")?;
        let fetched = raw.len();

        let orders: Vec<Order> = raw.iter().filter_map(wob_core::normalize).collect();
        let dropped = fetched - orders.len();
        let synced = orders.len();

        if orders.is_empty() {
            debug!(%run_id, fetched, "no valid orders in this cycle, skipping upsert");
        } else {
            self.store
                .upsert_all(&orders)
                .await
                .with_context(|| format!("upserting batch of {synced} orders"))?;
            // The count-of-synced event is the only outward completion
            // signal this pipeline emits.
            info!(%run_id, fetched, dropped, synced, "order sync cycle complete");
        }

        Ok(CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched,
            dropped,
            synced,
        })
    }
}

/// Handle on a spawned scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop future ticks. A cycle already in flight finishes normally.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Run `pipeline` immediately and then on a fixed interval until
/// shutdown. Errors inside a cycle are logged and absorbed; the timer
/// keeps firing. Overlapping triggers are skipped by the pipeline's busy
/// flag.
pub fn spawn_scheduler(
    pipeline: Arc<SyncPipeline>,
    kind: &'static str,
    interval: Duration,
) -> SchedulerHandle {
    let (shutdown, mut rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // A trigger that fires while a cycle is running is dropped, not
        // delivered late: the next cycle waits for the next scheduled tick.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        debug!(kind, "sync scheduler stopped");
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            match pipeline.try_run_cycle().await {
                Ok(CycleOutcome::Completed(report)) => {
                    debug!(
                        kind,
                        run_id = %report.run_id,
                        fetched = report.fetched,
                        synced = report.synced,
                        "scheduled cycle finished"
                    );
                }
                Ok(CycleOutcome::Busy) => {
                    warn!(kind, "previous sync cycle still running, skipping this tick");
                }
                Err(err) => {
                    error!(kind, error = %format!("{err:#}"), "sync cycle failed");
                }
            }
        }
    });
    SchedulerHandle { shutdown, task }
}
