use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A persisted unit of schedulable work together with its execution bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub template: String,
    #[serde(default)]
    pub data: Value,
    pub active: bool,
    pub start_at: Option<DateTime<Utc>>,
    /// Repeat interval in milliseconds. `None` marks a one-shot job.
    pub repeat_ms: Option<u64>,
    pub max_retries: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_fail_reason: Option<String>,
    pub run_count: u64,
    pub fail_count: u64,
    pub locked_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_one_shot(&self) -> bool {
        self.repeat_ms.is_none()
    }

    /// Decides whether the job should run at `now`.
    ///
    /// Start-time gating is checked before run history, so a future-dated job
    /// with no runs yet is not triggered early.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        if matches!(self.start_at, Some(start_at) if start_at > now) {
            return false;
        }
        let Some(last_run_at) = self.last_run_at else {
            return true;
        };
        match self.repeat_ms {
            None => false,
            Some(repeat_ms) => {
                let elapsed = now.signed_duration_since(last_run_at).num_milliseconds();
                elapsed >= 0 && elapsed as u64 >= repeat_ms
            }
        }
    }

    /// Applies a partial update in place. Fields left as `None` are untouched.
    pub fn apply(&mut self, update: &JobUpdate) {
        if let Some(template) = &update.template {
            self.template = template.clone();
        }
        if let Some(data) = &update.data {
            self.data = data.clone();
        }
        if let Some(active) = update.active {
            self.active = active;
        }
        if let Some(start_at) = update.start_at {
            self.start_at = start_at;
        }
        if let Some(repeat_ms) = update.repeat_ms {
            self.repeat_ms = repeat_ms;
        }
        if let Some(max_retries) = update.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(last_run_at) = update.last_run_at {
            self.last_run_at = last_run_at;
        }
        if let Some(last_finished_at) = update.last_finished_at {
            self.last_finished_at = last_finished_at;
        }
        if let Some(last_failed_at) = update.last_failed_at {
            self.last_failed_at = last_failed_at;
        }
        if let Some(last_fail_reason) = &update.last_fail_reason {
            self.last_fail_reason = last_fail_reason.clone();
        }
        if let Some(locked_at) = update.locked_at {
            self.locked_at = locked_at;
        }
        if let Some(run_count) = update.run_count {
            self.run_count = run_count;
        }
        if let Some(fail_count) = update.fail_count {
            self.fail_count = fail_count;
        }
    }
}

/// Enqueue request for a new job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub id: Option<String>,
    pub template: String,
    pub data: Value,
    pub repeat_ms: Option<u64>,
    pub start_at: Option<DateTime<Utc>>,
    pub active: Option<bool>,
    pub max_retries: Option<u32>,
    /// Overwrite an existing job with the same id instead of rejecting.
    pub upsert: bool,
}

impl NewJob {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn repeat_every(mut self, interval: std::time::Duration) -> Self {
        self.repeat_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    pub(crate) fn into_job(self, id: String) -> Job {
        Job {
            id,
            template: self.template,
            data: self.data,
            active: self.active.unwrap_or(true),
            start_at: self.start_at,
            repeat_ms: self.repeat_ms,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            last_run_at: None,
            last_finished_at: None,
            last_failed_at: None,
            last_fail_reason: None,
            run_count: 0,
            fail_count: 0,
            locked_at: None,
        }
    }

    /// Update written over an existing record when upserting. Counters are kept.
    pub(crate) fn as_overwrite(&self) -> JobUpdate {
        JobUpdate {
            template: Some(self.template.clone()),
            data: Some(self.data.clone()),
            active: Some(self.active.unwrap_or(true)),
            start_at: Some(self.start_at),
            repeat_ms: Some(self.repeat_ms),
            max_retries: self.max_retries,
            last_run_at: Some(None),
            locked_at: Some(None),
            ..Default::default()
        }
    }
}

/// Partial update of a job record.
///
/// Nullable fields use `Option<Option<T>>`: the outer `None` leaves the
/// field alone, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub template: Option<String>,
    pub data: Option<Value>,
    pub active: Option<bool>,
    pub start_at: Option<Option<DateTime<Utc>>>,
    pub repeat_ms: Option<Option<u64>>,
    pub max_retries: Option<u32>,
    pub last_run_at: Option<Option<DateTime<Utc>>>,
    pub last_finished_at: Option<Option<DateTime<Utc>>>,
    pub last_failed_at: Option<Option<DateTime<Utc>>>,
    pub last_fail_reason: Option<Option<String>>,
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub run_count: Option<u64>,
    pub fail_count: Option<u64>,
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Execution timestamps written by the executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionFields {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_fail_reason: Option<String>,
    /// `Some(None)` releases the lock.
    pub locked_at: Option<Option<DateTime<Utc>>>,
}

impl From<ExecutionFields> for JobUpdate {
    fn from(fields: ExecutionFields) -> Self {
        JobUpdate {
            last_run_at: fields.last_run_at.map(Some),
            last_finished_at: fields.last_finished_at.map(Some),
            last_failed_at: fields.last_failed_at.map(Some),
            last_fail_reason: fields.last_fail_reason.map(Some),
            locked_at: fields.locked_at,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterIncrements {
    pub run_count: u64,
    pub fail_count: u64,
}
