use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, instrument, warn};

use crate::job::{CounterIncrements, ExecutionFields, Job};
use crate::store::{Store, StoreError};
use crate::template::Handler;

/// Result of one execution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The job was already locked by another cycle. Nothing was written.
    Skipped,
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Runs one cycle of `job`: lock, up to `max_retries` attempts, release.
///
/// Handler failures and panics are recorded on the job and never returned.
/// Only store errors come back as `Err`; in that case the lock is released
/// on a best-effort basis.
#[instrument(skip_all, fields(job_id = %job.id, template = %job.template))]
pub async fn execute(
    store: &dyn Store,
    job: &Job,
    handler: &dyn Handler,
) -> Result<CycleOutcome, StoreError> {
    if job.locked_at.is_some() {
        debug!("Job is locked by another cycle, skipping");
        return Ok(CycleOutcome::Skipped);
    }
    if !store.try_lock(&job.id, Utc::now()).await? {
        debug!("Job lock was taken concurrently, skipping");
        return Ok(CycleOutcome::Skipped);
    }

    match run_cycle(store, job, handler).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            let release = ExecutionFields {
                locked_at: Some(None),
                ..Default::default()
            };
            if let Err(release_err) = store.set_execution_fields(&job.id, release).await {
                error!(error = %release_err, "Failed to release job lock");
            }
            Err(err)
        }
    }
}

async fn run_cycle(
    store: &dyn Store,
    job: &Job,
    handler: &dyn Handler,
) -> Result<CycleOutcome, StoreError> {
    let max_retries = job.max_retries.max(1);
    let mut attempts = 0u32;
    let mut succeeded = false;
    let mut last_finished_at = None;

    while attempts < max_retries {
        attempts += 1;

        let started = CounterIncrements {
            run_count: 1,
            fail_count: 0,
        };
        store.increment_counters(&job.id, started).await?;
        let run_at = ExecutionFields {
            last_run_at: Some(Utc::now()),
            ..Default::default()
        };
        store.set_execution_fields(&job.id, run_at).await?;

        let result = invoke(handler, job.data.clone()).await;
        let finished_at = Utc::now();
        last_finished_at = Some(finished_at);

        match result {
            Ok(()) => {
                succeeded = true;
                break;
            }
            Err(reason) => {
                warn!(attempt = attempts, max_retries, error = %reason, "Job attempt failed");
                record_failure(store, &job.id, finished_at, reason).await?;
            }
        }
    }

    if job.is_one_shot() {
        store.remove_job(&job.id).await?;
    } else {
        let finished = ExecutionFields {
            last_finished_at,
            locked_at: Some(None),
            ..Default::default()
        };
        store.set_execution_fields(&job.id, finished).await?;
    }

    if succeeded {
        debug!(attempts, "Job completed");
        return Ok(CycleOutcome::Succeeded { attempts });
    }

    if job.is_one_shot() {
        error!(attempts, "One-shot job failed every attempt and was removed");
    } else {
        error!(
            attempts,
            "Job failed every attempt, it will be reconsidered at the next due check"
        );
    }
    Ok(CycleOutcome::Exhausted { attempts })
}

/// Persists one failed attempt before the next one starts.
async fn record_failure(
    store: &dyn Store,
    id: &str,
    failed_at: DateTime<Utc>,
    reason: String,
) -> Result<(), StoreError> {
    let failed = CounterIncrements {
        run_count: 0,
        fail_count: 1,
    };
    store.increment_counters(id, failed).await?;
    let fields = ExecutionFields {
        last_finished_at: Some(failed_at),
        last_failed_at: Some(failed_at),
        last_fail_reason: Some(reason),
        ..Default::default()
    };
    store.set_execution_fields(id, fields).await?;
    Ok(())
}

async fn invoke(handler: &dyn Handler, data: Value) -> Result<(), String> {
    match AssertUnwindSafe(handler.handle(data)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("handler panicked".to_string()),
    }
}
