//! Merge engine + sync orchestration for Quill.
//!
//! The merge itself is a pure, deterministic, single-pass function over two
//! snapshots; all IO (remote fetch, publish, persistence) happens around it
//! in [`SyncEngine::run_cycle`]. Conflict policy: on an id collision the
//! remote record unconditionally wins. Import-by-recency lives in
//! `quill_core::merge_by_recency` and is a separate, timestamp-aware path.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use quill_core::{dedupe_by_id, synthetic_id, QuoteRecord, RecordStore};
use quill_remote::{GatewayError, RemoteGateway};
use quill_storage::QuoteStorage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "quill-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote fetch failed: {0}")]
    Fetch(#[source] GatewayError),
}

/// Output of the pure planning phase: the records that survive as-is, and
/// the local records that still need a remote identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub merged: Vec<QuoteRecord>,
    pub to_publish: Vec<QuoteRecord>,
}

/// Reconcile a local and a remote snapshot.
///
/// Every remote record enters the merged set (remote wins on id collision,
/// no timestamp comparison). Local records whose id the remote does not know
/// pass through unchanged. Locals with a synthetic id (never acknowledged
/// by the remote) go on the publish list instead; the caller appends them
/// back after the publish attempt, so no record is ever lost.
pub fn plan_merge(local: &[QuoteRecord], remote: &[QuoteRecord]) -> MergePlan {
    // Last occurrence wins should the remote ever repeat an id.
    let merged = dedupe_by_id(remote.to_vec());
    let remote_ids: HashSet<String> = merged.iter().map(|r| r.id.clone()).collect();

    let mut plan = MergePlan {
        merged,
        to_publish: Vec::new(),
    };

    for record in local {
        if record.needs_publish() {
            plan.to_publish.push(record.clone());
        } else if !remote_ids.contains(record.id.as_str()) {
            plan.merged.push(record.clone());
        }
        // else: superseded by the already-seeded remote version.
    }

    plan
}

/// Counters for one completed sync cycle, logged and shown by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub remote_records: usize,
    pub local_records: usize,
    pub merged_records: usize,
    pub published: usize,
    pub publish_failures: usize,
}

/// Orchestrates one sync cycle: snapshot → fetch → merge → publish →
/// commit → persist. Holds the single re-entrancy guard that keeps
/// overlapping triggers from interleaving with an in-flight cycle.
pub struct SyncEngine {
    store: Arc<Mutex<RecordStore>>,
    storage: QuoteStorage,
    gateway: Arc<dyn RemoteGateway>,
    cycle_guard: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Mutex<RecordStore>>,
        storage: QuoteStorage,
        gateway: Arc<dyn RemoteGateway>,
    ) -> Self {
        Self {
            store,
            storage,
            gateway,
            cycle_guard: Mutex::new(()),
        }
    }

    /// Run one merge cycle. Returns `Ok(None)` when a cycle is already in
    /// flight (the overlapping trigger is suppressed, never queued). A fetch
    /// failure aborts before any local mutation.
    pub async fn run_cycle(&self) -> Result<Option<SyncSummary>, SyncError> {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            warn!("sync cycle already in flight; suppressing overlapping trigger");
            return Ok(None);
        };

        let started_at = Utc::now();
        let remote = self
            .gateway
            .fetch_quotes()
            .await
            .map_err(SyncError::Fetch)?;

        let local = self.store.lock().await.snapshot();
        let MergePlan {
            mut merged,
            to_publish,
        } = plan_merge(&local, &remote);

        let mut published = 0usize;
        let mut publish_failures = 0usize;
        for record in to_publish {
            match self.gateway.publish_quote(&record).await {
                Ok(stored) => {
                    published += 1;
                    merged.push(stored);
                }
                Err(err) => {
                    // Isolated per record: keep it resident under a synthetic
                    // id so the next cycle retries the publish.
                    warn!(error = %err, text = %record.text, "publish failed; keeping record locally");
                    publish_failures += 1;
                    let mut kept = record;
                    if !kept.needs_publish() {
                        kept.id = synthetic_id();
                    }
                    kept.updated_at = Utc::now();
                    merged.push(kept);
                }
            }
        }

        let merged = dedupe_by_id(merged);
        let merged_records = merged.len();

        let snapshot = {
            let mut store = self.store.lock().await;
            store.replace_all(merged);
            store.snapshot()
        };

        // Persistence failures are non-fatal: the in-memory store stays
        // authoritative and the next cycle will write again.
        if let Err(err) = self.storage.save_quotes(&snapshot).await {
            warn!(error = %err, "failed to persist merged snapshot");
        }
        let finished_at = Utc::now();
        if let Err(err) = self.storage.save_last_sync(finished_at).await {
            warn!(error = %err, "failed to persist last-sync timestamp");
        }

        let summary = SyncSummary {
            started_at,
            finished_at,
            remote_records: remote.len(),
            local_records: local.len(),
            merged_records,
            published,
            publish_failures,
        };
        info!(
            remote = summary.remote_records,
            merged = summary.merged_records,
            published = summary.published,
            failures = summary.publish_failures,
            "sync cycle complete"
        );
        Ok(Some(summary))
    }

    /// Build a started-but-not-running scheduler that fires [`run_cycle`] on
    /// the given cron expression. The caller starts it, and shuts it down
    /// for cancellation; a cycle in flight at shutdown completes on its own.
    ///
    /// [`run_cycle`]: SyncEngine::run_cycle
    pub async fn build_scheduler(self: Arc<Self>, cron: &str) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let engine = self;
        let job = Job::new_async(cron, move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                match engine.run_cycle().await {
                    Ok(Some(summary)) => info!(
                        published = summary.published,
                        merged = summary.merged_records,
                        "scheduled sync cycle finished"
                    ),
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "scheduled sync cycle failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}
