use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{Store, StoreError};
use crate::job::{CounterIncrements, Job, JobUpdate};
use crate::template::TemplateRegistry;

/// In-process store. Every operation takes one lock, so field updates are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, Job>>,
    templates: TemplateRegistry,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.jobs.lock().clear();
        Ok(())
    }

    async fn add_job(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateJob(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn remove_job(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().remove(id).is_some())
    }

    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<bool, StoreError> {
        match self.jobs.lock().get_mut(id) {
            Some(job) => {
                job.apply(&update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.jobs.lock().values().cloned().collect())
    }

    async fn flush_jobs(&self) -> Result<(), StoreError> {
        self.jobs.lock().clear();
        Ok(())
    }

    fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    async fn try_lock(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match self.jobs.lock().get_mut(id) {
            Some(job) if job.locked_at.is_none() => {
                job.locked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_counters(
        &self,
        id: &str,
        increments: CounterIncrements,
    ) -> Result<bool, StoreError> {
        match self.jobs.lock().get_mut(id) {
            Some(job) => {
                job.run_count += increments.run_count;
                job.fail_count += increments.fail_count;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExecutionFields, NewJob};

    fn job(id: &str) -> Job {
        NewJob::new("t").into_job(id.to_string())
    }

    #[tokio::test]
    async fn add_rejects_duplicate_ids() {
        let store = MemoryStore::new();
        store.add_job(job("a")).await.unwrap();

        let err = store.add_job(job("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateJob(id) if id == "a"));
        assert_eq!(store.get_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_and_remove_report_missing_jobs() {
        let store = MemoryStore::new();
        assert!(!store.update_job("nope", JobUpdate::default()).await.unwrap());
        assert!(!store.remove_job("nope").await.unwrap());

        store.add_job(job("a")).await.unwrap();
        let update = JobUpdate {
            active: Some(false),
            ..Default::default()
        };
        assert!(store.update_job("a", update).await.unwrap());
        assert!(!store.get_job("a").await.unwrap().unwrap().active);
        assert!(store.remove_job("a").await.unwrap());
        assert!(store.get_job("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_taken_once() {
        let store = MemoryStore::new();
        store.add_job(job("a")).await.unwrap();
        let now = Utc::now();

        assert!(store.try_lock("a", now).await.unwrap());
        assert!(!store.try_lock("a", now).await.unwrap());
        assert!(!store.try_lock("missing", now).await.unwrap());

        let release = ExecutionFields {
            locked_at: Some(None),
            ..Default::default()
        };
        store.set_execution_fields("a", release).await.unwrap();
        assert!(store.try_lock("a", now).await.unwrap());
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let store = MemoryStore::new();
        store.add_job(job("a")).await.unwrap();

        let increments = CounterIncrements {
            run_count: 2,
            fail_count: 1,
        };
        store.increment_counters("a", increments).await.unwrap();
        store.increment_counters("a", increments).await.unwrap();

        let job = store.get_job("a").await.unwrap().unwrap();
        assert_eq!(job.run_count, 4);
        assert_eq!(job.fail_count, 2);
    }

    #[tokio::test]
    async fn close_drops_jobs_but_keeps_templates() {
        let store = MemoryStore::new();
        store.add_job(job("a")).await.unwrap();
        let handler = |_: serde_json::Value| async { anyhow::Ok(()) };
        store.add_template("t", std::sync::Arc::new(handler));

        store.close().await.unwrap();

        assert!(store.get_jobs().await.unwrap().is_empty());
        assert!(store.get_template("t").is_some());
    }
}
