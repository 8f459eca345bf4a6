use bson::{Bson, DateTime};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobDocument {
    pub id: String,
    pub template: String,
    pub data: Bson,
    pub active: bool,
    pub start_at: Option<DateTime>,
    pub repeat_ms: Option<i64>,
    pub max_retries: i64,
    pub last_run_at: Option<DateTime>,
    pub last_finished_at: Option<DateTime>,
    pub last_failed_at: Option<DateTime>,
    pub last_fail_reason: Option<String>,
    pub run_count: i64,
    pub fail_count: i64,
    pub locked_at: Option<DateTime>,
}

pub(crate) fn to_bson_datetime(at: chrono::DateTime<Utc>) -> DateTime {
    DateTime::from_millis(at.timestamp_millis())
}

pub(crate) fn from_bson_datetime(at: DateTime) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(at.timestamp_millis())
        .single()
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
}

impl TryFrom<&Job> for JobDocument {
    type Error = bson::ser::Error;

    fn try_from(job: &Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: job.id.clone(),
            template: job.template.clone(),
            data: bson::to_bson(&job.data)?,
            active: job.active,
            start_at: job.start_at.map(to_bson_datetime),
            repeat_ms: job.repeat_ms.map(|ms| ms as i64),
            max_retries: job.max_retries as i64,
            last_run_at: job.last_run_at.map(to_bson_datetime),
            last_finished_at: job.last_finished_at.map(to_bson_datetime),
            last_failed_at: job.last_failed_at.map(to_bson_datetime),
            last_fail_reason: job.last_fail_reason.clone(),
            run_count: job.run_count as i64,
            fail_count: job.fail_count as i64,
            locked_at: job.locked_at.map(to_bson_datetime),
        })
    }
}

impl From<JobDocument> for Job {
    fn from(doc: JobDocument) -> Self {
        Job {
            id: doc.id,
            template: doc.template,
            data: doc.data.into_relaxed_extjson(),
            active: doc.active,
            start_at: doc.start_at.map(from_bson_datetime),
            repeat_ms: doc.repeat_ms.filter(|ms| *ms > 0).map(|ms| ms as u64),
            max_retries: doc.max_retries.max(1) as u32,
            last_run_at: doc.last_run_at.map(from_bson_datetime),
            last_finished_at: doc.last_finished_at.map(from_bson_datetime),
            last_failed_at: doc.last_failed_at.map(from_bson_datetime),
            last_fail_reason: doc.last_fail_reason,
            run_count: doc.run_count.max(0) as u64,
            fail_count: doc.fail_count.max(0) as u64,
            locked_at: doc.locked_at.map(from_bson_datetime),
        }
    }
}
