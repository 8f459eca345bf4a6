//! Job storage contract and its backends.
//!
//! The scheduler only talks to [`Store`]. Backends are picked by
//! [`StoreKind`] through [`connect`].

mod memory;
mod mongo;
mod redis;

pub use self::memory::MemoryStore;
pub use self::mongo::MongoDbStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::job::{CounterIncrements, ExecutionFields, Job, JobUpdate};
use crate::template::{Handler, TemplateRegistry};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store is not connected")]
    NotConnected,
    #[error("job {0} already exists")]
    DuplicateJob(String),
    #[error("{0} store requires a connection uri")]
    MissingUri(StoreKind),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence contract consumed by the scheduler.
///
/// Writes are treated as atomic per job record; nothing here spans records.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Establishes backend connectivity. Calling it again is harmless.
    async fn init(&self) -> Result<(), StoreError>;

    /// Releases backend resources. Registered templates are kept.
    async fn close(&self) -> Result<(), StoreError>;

    /// Inserts `job`, failing with [`StoreError::DuplicateJob`] if the id is taken.
    async fn add_job(&self, job: Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Returns `false` if no job had this id.
    async fn remove_job(&self, id: &str) -> Result<bool, StoreError>;

    /// Returns `false` if no job had this id.
    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<bool, StoreError>;

    async fn get_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn flush_jobs(&self) -> Result<(), StoreError>;

    fn templates(&self) -> &TemplateRegistry;

    fn add_template(&self, name: &str, handler: Arc<dyn Handler>) {
        self.templates().register(name, handler);
    }

    fn get_template(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.templates().get(name)
    }

    /// Sets `locked_at` to `now` if the job exists and is not locked.
    /// Returns whether the lock was taken.
    async fn try_lock(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match self.get_job(id).await? {
            Some(job) if job.locked_at.is_none() => {
                let update = JobUpdate {
                    locked_at: Some(Some(now)),
                    ..Default::default()
                };
                self.update_job(id, update).await
            }
            _ => Ok(false),
        }
    }

    async fn set_execution_fields(
        &self,
        id: &str,
        fields: ExecutionFields,
    ) -> Result<bool, StoreError> {
        self.update_job(id, fields.into()).await
    }

    async fn increment_counters(
        &self,
        id: &str,
        increments: CounterIncrements,
    ) -> Result<bool, StoreError> {
        let Some(job) = self.get_job(id).await? else {
            return Ok(false);
        };
        let update = JobUpdate {
            run_count: Some(job.run_count + increments.run_count),
            fail_count: Some(job.fail_count + increments.fail_count),
            ..Default::default()
        };
        self.update_job(id, update).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    #[serde(alias = "in-memory", alias = "inmemory")]
    Memory,
    #[serde(alias = "mongo")]
    MongoDb,
    Redis,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreKind::Memory => "memory",
            StoreKind::MongoDb => "mongodb",
            StoreKind::Redis => "redis",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown store kind: {0}")]
pub struct UnknownStoreKind(String);

impl FromStr for StoreKind {
    type Err = UnknownStoreKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(StoreKind::Memory),
            "mongodb" | "mongo" => Ok(StoreKind::MongoDb),
            "redis" => Ok(StoreKind::Redis),
            _ => Err(UnknownStoreKind(s.to_string())),
        }
    }
}

/// Builds the backend named by `config.store`. The store is not initialized yet.
pub async fn connect(config: &SchedulerConfig) -> Result<Arc<dyn Store>, StoreError> {
    let store: Arc<dyn Store> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::MongoDb => {
            let uri = config
                .uri
                .as_deref()
                .ok_or(StoreError::MissingUri(StoreKind::MongoDb))?;
            Arc::new(
                MongoDbStore::new(uri, config.cert_file.clone(), config.database.as_deref())
                    .await?,
            )
        }
        StoreKind::Redis => {
            let uri = config
                .uri
                .as_deref()
                .ok_or(StoreError::MissingUri(StoreKind::Redis))?;
            Arc::new(RedisStore::new(uri)?)
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_store_kinds() {
        assert_eq!("memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert_eq!("In-Memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert_eq!("mongo".parse::<StoreKind>().unwrap(), StoreKind::MongoDb);
        assert_eq!("redis".parse::<StoreKind>().unwrap(), StoreKind::Redis);
        assert!("sqlite".parse::<StoreKind>().is_err());
    }

    #[tokio::test]
    async fn remote_stores_need_a_uri() {
        let config = SchedulerConfig {
            store: StoreKind::Redis,
            ..Default::default()
        };
        let err = connect(&config).await.err().unwrap();
        assert!(matches!(err, StoreError::MissingUri(StoreKind::Redis)));
    }

    #[tokio::test]
    async fn memory_is_the_default_backend() {
        let store = connect(&SchedulerConfig::default()).await.unwrap();
        store.init().await.unwrap();
        assert!(store.get_jobs().await.unwrap().is_empty());
    }
}
