use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::job::{Job, JobUpdate};
use crate::store::{Store, StoreError};
use crate::template::TemplateRegistry;

const JOB_KEY: &str = "job";
const JOB_LOCK_KEY: &str = "job-lock";
const JOB_SET_KEY: &str = "jobs";

fn job_key(id: &str) -> String {
    format!("{JOB_KEY}:{id}")
}

fn lock_key(id: &str) -> String {
    format!("{JOB_LOCK_KEY}:{id}")
}

/// A job store keeping each job as a JSON string under `job:{id}`, indexed by the `jobs` set.
///
/// Read-modify-write updates are serialized within the process. The run lock
/// is additionally claimed with `SET NX` on `job-lock:{id}`.
pub struct RedisStore {
    client: redis::Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    writes: Mutex<()>,
    templates: TemplateRegistry,
}

impl RedisStore {
    /// Parses the connection URI. No connection is made until [`Store::init`].
    pub fn new(uri: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(uri).context("Invalid Redis connection uri")?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            writes: Mutex::new(()),
            templates: TemplateRegistry::new(),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.connection.read().clone().ok_or(StoreError::NotConnected)
    }

    async fn read_job(
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let raw: Option<String> = conn.get(job_key(id)).await.context("Failed to get job")?;
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).context("Failed to decode job")?,
            )),
            None => Ok(None),
        }
    }

    async fn write_job(conn: &mut MultiplexedConnection, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job).context("Failed to encode job")?;
        let _: () = conn
            .set(job_key(&job.id), payload)
            .await
            .context("Failed to write job")?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    #[instrument(skip_all, err)]
    async fn init(&self) -> Result<(), StoreError> {
        if self.connection.read().is_some() {
            return Ok(());
        }

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Failed to ping Redis")?;

        *self.connection.write() = Some(conn);
        info!("Connected to Redis");
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn close(&self) -> Result<(), StoreError> {
        if self.connection.write().take().is_some() {
            info!("Closed Redis connection");
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id))]
    async fn add_job(&self, job: Job) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let key = job_key(&job.id);
        let payload = serde_json::to_string(&job).context("Failed to encode job")?;

        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .context("Failed to add job")?;
        if created.is_none() {
            return Err(StoreError::DuplicateJob(job.id));
        }

        let _: () = conn
            .sadd(JOB_SET_KEY, &key)
            .await
            .context("Failed to index job")?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.connection()?;
        Self::read_job(&mut conn, id).await
    }

    #[instrument(skip_all, err)]
    async fn remove_job(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let key = job_key(id);
        let _guard = self.writes.lock().await;

        let deleted: i64 = conn.del(&key).await.context("Failed to remove job")?;
        let _: () = conn
            .srem(JOB_SET_KEY, &key)
            .await
            .context("Failed to unindex job")?;
        let _: () = conn
            .del(lock_key(id))
            .await
            .context("Failed to remove job lock")?;
        Ok(deleted > 0)
    }

    #[instrument(skip_all, err)]
    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let _guard = self.writes.lock().await;

        let Some(mut job) = Self::read_job(&mut conn, id).await? else {
            return Ok(false);
        };
        job.apply(&update);
        Self::write_job(&mut conn, &job).await?;

        if update.locked_at == Some(None) {
            let _: () = conn
                .del(lock_key(id))
                .await
                .context("Failed to release job lock")?;
        }
        Ok(true)
    }

    #[instrument(skip_all, err)]
    async fn get_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection()?;
        let keys: Vec<String> = conn
            .smembers(JOB_SET_KEY)
            .await
            .context("Failed to list jobs")?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .context("Failed to get jobs")?;

        values
            .into_iter()
            .flatten()
            .map(|raw| {
                serde_json::from_str(&raw)
                    .context("Failed to decode job")
                    .map_err(StoreError::from)
            })
            .collect()
    }

    #[instrument(skip_all, err)]
    async fn flush_jobs(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _guard = self.writes.lock().await;

        let keys: Vec<String> = conn
            .smembers(JOB_SET_KEY)
            .await
            .context("Failed to list jobs")?;
        if keys.is_empty() {
            return Ok(());
        }

        let lock_keys: Vec<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&format!("{JOB_KEY}:")).map(lock_key))
            .collect();
        let _: () = redis::cmd("DEL")
            .arg(&keys)
            .arg(&lock_keys)
            .arg(JOB_SET_KEY)
            .query_async(&mut conn)
            .await
            .context("Failed to flush jobs")?;
        Ok(())
    }

    fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    #[instrument(skip_all, err)]
    async fn try_lock(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let _guard = self.writes.lock().await;

        let Some(mut job) = Self::read_job(&mut conn, id).await? else {
            return Ok(false);
        };
        if job.locked_at.is_some() {
            return Ok(false);
        }

        let claimed: Option<String> = redis::cmd("SET")
            .arg(lock_key(id))
            .arg(now.timestamp_millis())
            .arg("NX")
            .query_async(&mut conn)
            .await
            .context("Failed to lock job")?;
        if claimed.is_none() {
            return Ok(false);
        }

        job.locked_at = Some(now);
        Self::write_job(&mut conn, &job).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CounterIncrements, NewJob};

    fn uri() -> String {
        std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string())
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(job_key("a"), "job:a");
        assert_eq!(lock_key("a"), "job-lock:a");
    }

    #[tokio::test]
    async fn operations_fail_before_init() {
        let store = RedisStore::new("redis://127.0.0.1:6379").unwrap();
        assert!(matches!(
            store.get_job("a").await.unwrap_err(),
            StoreError::NotConnected
        ));
        assert!(store.close().await.is_ok());
    }

    #[test]
    fn rejects_bad_uri() {
        assert!(RedisStore::new("not a uri").is_err());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn stores_locks_and_flushes_jobs() {
        let store = RedisStore::new(&uri()).unwrap();
        store.init().await.unwrap();
        store.flush_jobs().await.unwrap();

        let job = NewJob::new("t").into_job("a".to_string());
        store.add_job(job.clone()).await.unwrap();
        assert!(matches!(
            store.add_job(job).await.unwrap_err(),
            StoreError::DuplicateJob(_)
        ));

        let now = Utc::now();
        assert!(store.try_lock("a", now).await.unwrap());
        assert!(!store.try_lock("a", now).await.unwrap());

        let increments = CounterIncrements {
            run_count: 1,
            fail_count: 1,
        };
        assert!(store.increment_counters("a", increments).await.unwrap());

        let release = JobUpdate {
            locked_at: Some(None),
            ..Default::default()
        };
        assert!(store.update_job("a", release).await.unwrap());
        assert!(store.try_lock("a", now).await.unwrap());

        let jobs = store.get_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].run_count, 1);

        store.flush_jobs().await.unwrap();
        assert!(store.get_jobs().await.unwrap().is_empty());
        store.close().await.unwrap();
    }
}
