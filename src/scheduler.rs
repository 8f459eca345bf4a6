use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::executor::{self, CycleOutcome};
use crate::job::{Job, JobUpdate, NewJob};
use crate::store::{self, Store, StoreError};
use crate::template::Handler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What one pass of the dispatch loop did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    /// Due jobs already locked by another cycle.
    pub skipped: usize,
    pub missing_template: usize,
    /// Executions that ended in a store error or a crashed task.
    pub errors: usize,
}

struct Dispatcher {
    store: Arc<dyn Store>,
    max_concurrency: usize,
}

impl Dispatcher {
    /// Runs every due job, at most `max_concurrency` at a time, and waits for all of them.
    #[instrument(skip_all, err)]
    async fn tick(&self) -> Result<TickReport, StoreError> {
        let now = Utc::now();
        let jobs = self.store.get_jobs().await?;

        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut running = JoinSet::new();
        let mut report = TickReport::default();

        for job in jobs.into_iter().filter(|job| job.is_due(now)) {
            report.due += 1;

            let Some(handler) = self.store.get_template(&job.template) else {
                warn!(job_id = %job.id, template = %job.template, "Job template not found");
                report.missing_template += 1;
                continue;
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            running.spawn(async move {
                let _permit = permit;
                let outcome = executor::execute(store.as_ref(), &job, handler.as_ref()).await;
                (job.id, outcome)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((_, Ok(CycleOutcome::Succeeded { .. }))) => report.succeeded += 1,
                Ok((_, Ok(CycleOutcome::Exhausted { .. }))) => report.exhausted += 1,
                Ok((_, Ok(CycleOutcome::Skipped))) => report.skipped += 1,
                Ok((job_id, Err(err))) => {
                    error!(job_id = %job_id, error = %err, "Failed to execute job");
                    report.errors += 1;
                }
                Err(err) => {
                    error!(error = %err, "Job execution task failed");
                    report.errors += 1;
                }
            }
        }

        if report.due > 0 {
            debug!(?report, "Processed due jobs");
        }
        Ok(report)
    }
}

struct Ticker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Ticker {
    fn spawn(dispatcher: Arc<Dispatcher>, period: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let cancelled = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(err) = dispatcher.tick().await {
                    error!(error = %err, "Failed to process jobs");
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Stops future ticks and waits for a tick in progress to finish.
    async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.handle.await {
            error!(error = %err, "Scheduler timer task failed");
        }
    }
}

/// Polls a [`Store`] on a fixed interval and runs the jobs that are due.
pub struct Scheduler {
    config: SchedulerConfig,
    dispatcher: Arc<Dispatcher>,
    state: RwLock<SchedulerState>,
    ticker: Mutex<Option<Ticker>>,
}

impl Scheduler {
    /// Builds the store selected by `config.store`. Call [`Scheduler::start`] to connect.
    pub async fn new(config: SchedulerConfig) -> Result<Self> {
        let store = store::connect(&config).await?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: SchedulerConfig, store: Arc<dyn Store>) -> Self {
        let dispatcher = Dispatcher {
            store,
            max_concurrency: config.max_concurrency(),
        };
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            state: RwLock::new(SchedulerState::Stopped),
            ticker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.dispatcher.store
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    fn set_state(&self, state: SchedulerState) {
        *self.state.write() = state;
    }

    /// Initializes the store and arms the timer. Restarting replaces the running timer.
    #[instrument(skip_all, err)]
    pub async fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock().await;
        if let Some(previous) = ticker.take() {
            debug!("Replacing running scheduler timer");
            previous.stop().await;
        }

        self.set_state(SchedulerState::Starting);
        if let Err(err) = self.store().init().await {
            self.set_state(SchedulerState::Stopped);
            return Err(SchedulerError::StoreInit(err));
        }

        *ticker = Some(Ticker::spawn(
            self.dispatcher.clone(),
            self.config.process_every(),
        ));
        self.set_state(SchedulerState::Running);
        info!(
            process_every_ms = self.config.process_every().as_millis() as u64,
            max_concurrency = self.dispatcher.max_concurrency,
            "Scheduler started"
        );
        Ok(())
    }

    /// Disarms the timer and closes the store. In-flight jobs finish first.
    #[instrument(skip_all, err)]
    pub async fn stop(&self) -> Result<()> {
        let mut ticker = self.ticker.lock().await;
        let Some(running) = ticker.take() else {
            return Ok(());
        };

        self.set_state(SchedulerState::Stopping);
        running.stop().await;
        let closed = self.store().close().await;
        self.set_state(SchedulerState::Stopped);

        closed?;
        info!("Scheduler stopped");
        Ok(())
    }

    /// Runs one dispatch pass immediately, independent of the timer.
    pub async fn process_jobs(&self) -> Result<TickReport> {
        Ok(self.dispatcher.tick().await?)
    }

    pub fn add_template<H: Handler>(&self, name: &str, handler: H) {
        self.store().add_template(name, Arc::new(handler));
        debug!(template = name, "Template registered");
    }

    /// Enqueues a job and returns its id.
    ///
    /// An existing id is rejected with [`SchedulerError::DuplicateJob`] unless
    /// the request asks for an upsert, in which case the record's definition is
    /// overwritten and its run state reset.
    #[instrument(skip_all, err, fields(template = %request.template))]
    pub async fn add_job(&self, request: NewJob) -> Result<String> {
        if request.template.is_empty() {
            return Err(SchedulerError::InvalidJob("template name is empty".to_string()));
        }
        validate(request.repeat_ms, request.max_retries)?;

        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let upsert = request.upsert;
        let overwrite = request.as_overwrite();

        let job = request.into_job(id.clone());

        match self.store().add_job(job.clone()).await {
            Ok(()) => {
                debug!(job_id = %id, "Job added");
                Ok(id)
            }
            Err(StoreError::DuplicateJob(_)) if upsert => {
                if self.store().update_job(&id, overwrite).await? {
                    info!(job_id = %id, "Job updated in place");
                    return Ok(id);
                }
                // Removed between the insert and the overwrite.
                match self.store().add_job(job).await {
                    Ok(()) => {
                        debug!(job_id = %id, "Job added");
                        Ok(id)
                    }
                    Err(StoreError::DuplicateJob(_)) => Err(SchedulerError::DuplicateJob(id)),
                    Err(err) => Err(err.into()),
                }
            }
            Err(StoreError::DuplicateJob(_)) => {
                warn!(job_id = %id, "Job already exists");
                Err(SchedulerError::DuplicateJob(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn pause_job(&self, id: &str) -> Result<bool> {
        self.set_active(id, false).await
    }

    pub async fn resume_job(&self, id: &str) -> Result<bool> {
        self.set_active(id, true).await
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        let update = JobUpdate {
            active: Some(active),
            ..Default::default()
        };
        let found = self.store().update_job(id, update).await?;
        match (found, active) {
            (false, _) => warn!(job_id = id, "Job not found"),
            (true, false) => info!(job_id = id, "Job paused"),
            (true, true) => info!(job_id = id, "Job resumed"),
        }
        Ok(found)
    }

    pub async fn remove_job(&self, id: &str) -> Result<bool> {
        let removed = self.store().remove_job(id).await?;
        if removed {
            info!(job_id = id, "Job removed");
        } else {
            warn!(job_id = id, "Job not found");
        }
        Ok(removed)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.store().get_job(id).await?)
    }

    pub async fn get_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store().get_jobs().await?)
    }

    pub async fn update_job(&self, id: &str, update: JobUpdate) -> Result<bool> {
        if matches!(&update.template, Some(template) if template.is_empty()) {
            return Err(SchedulerError::InvalidJob("template name is empty".to_string()));
        }
        validate(update.repeat_ms.flatten(), update.max_retries)?;

        let updated = self.store().update_job(id, update).await?;
        if updated {
            info!(job_id = id, "Job updated");
        } else {
            warn!(job_id = id, "Job not found");
        }
        Ok(updated)
    }

    pub async fn flush_jobs(&self) -> Result<()> {
        self.store().flush_jobs().await?;
        info!("Jobs flushed");
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.shutdown.cancel();
        }
    }
}

fn validate(repeat_ms: Option<u64>, max_retries: Option<u32>) -> Result<()> {
    if repeat_ms == Some(0) {
        return Err(SchedulerError::InvalidJob(
            "repeat interval must be positive".to_string(),
        ));
    }
    if max_retries == Some(0) {
        return Err(SchedulerError::InvalidJob(
            "max_retries must be positive".to_string(),
        ));
    }
    Ok(())
}
