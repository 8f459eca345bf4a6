mod types;

use anyhow::Context;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, ConnectionString, IndexOptions, Tls, TlsOptions},
    Client, Collection, Database, IndexModel,
};
use parking_lot::RwLock;
use tracing::{info, instrument};

use self::types::{to_bson_datetime, JobDocument};
use crate::job::{CounterIncrements, ExecutionFields, Job, JobUpdate};
use crate::store::{Store, StoreError};
use crate::template::TemplateRegistry;

const COLLECTION: &str = "cadence_jobs";
const DEFAULT_DATABASE: &str = "cadence";
const DUPLICATE_KEY: i32 = 11000;

/// A job store backed by MongoDB, one document per job.
pub struct MongoDbStore {
    options: ClientOptions,
    database_name: String,
    connection: RwLock<Option<(Client, Database)>>,
    templates: TemplateRegistry,
}

impl MongoDbStore {
    /// Parses the connection settings. No connection is made until [`Store::init`].
    pub async fn new(
        uri: &str,
        cert_file: Option<String>,
        database: Option<&str>,
    ) -> Result<Self, StoreError> {
        let options = Self::client_options(uri, cert_file).await?;
        let database_name = database
            .map(str::to_string)
            .or_else(|| options.default_database.clone())
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        Ok(Self {
            options,
            database_name,
            connection: RwLock::new(None),
            templates: TemplateRegistry::new(),
        })
    }

    async fn client_options(
        uri: &str,
        cert_path: Option<String>,
    ) -> Result<ClientOptions, StoreError> {
        let conn_str = ConnectionString::parse(uri).context("Invalid MongoDB connection string")?;
        let mut options = ClientOptions::parse_connection_string(conn_str)
            .await
            .context("Failed to resolve MongoDB connection string")?;
        if let Some(cert_path) = cert_path {
            let mut tls_options = TlsOptions::default();
            tls_options.ca_file_path = Some(cert_path.into());
            tls_options.allow_invalid_hostnames = Some(true);
            options.tls = Some(Tls::Enabled(tls_options));
        }
        Ok(options)
    }

    fn collection(&self) -> Result<Collection<JobDocument>, StoreError> {
        self.connection
            .read()
            .as_ref()
            .map(|(_, database)| database.collection(COLLECTION))
            .ok_or(StoreError::NotConnected)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let found = self
            .collection()?
            .find_one(doc! { "id": id }, None)
            .await
            .context("Failed to look up job")?;
        Ok(found.is_some())
    }

    #[cfg(test)]
    pub async fn delete_database(&self) -> Result<(), StoreError> {
        let (_, database) = self
            .connection
            .read()
            .clone()
            .ok_or(StoreError::NotConnected)?;
        database.drop(None).await.context("Failed to drop database")?;
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

fn set_document(update: &JobUpdate) -> anyhow::Result<Document> {
    let datetime = |at: Option<DateTime<Utc>>| at.map(to_bson_datetime);

    let mut set = Document::new();
    if let Some(template) = &update.template {
        set.insert("template", template.as_str());
    }
    if let Some(data) = &update.data {
        set.insert("data", bson::to_bson(data).context("Failed to encode job data")?);
    }
    if let Some(active) = update.active {
        set.insert("active", active);
    }
    if let Some(start_at) = update.start_at {
        set.insert("start_at", datetime(start_at));
    }
    if let Some(repeat_ms) = update.repeat_ms {
        set.insert("repeat_ms", repeat_ms.map(|ms| ms as i64));
    }
    if let Some(max_retries) = update.max_retries {
        set.insert("max_retries", max_retries as i64);
    }
    if let Some(last_run_at) = update.last_run_at {
        set.insert("last_run_at", datetime(last_run_at));
    }
    if let Some(last_finished_at) = update.last_finished_at {
        set.insert("last_finished_at", datetime(last_finished_at));
    }
    if let Some(last_failed_at) = update.last_failed_at {
        set.insert("last_failed_at", datetime(last_failed_at));
    }
    if let Some(last_fail_reason) = &update.last_fail_reason {
        set.insert("last_fail_reason", last_fail_reason.clone());
    }
    if let Some(locked_at) = update.locked_at {
        set.insert("locked_at", datetime(locked_at));
    }
    if let Some(run_count) = update.run_count {
        set.insert("run_count", run_count as i64);
    }
    if let Some(fail_count) = update.fail_count {
        set.insert("fail_count", fail_count as i64);
    }
    Ok(set)
}

#[async_trait]
impl Store for MongoDbStore {
    #[instrument(skip_all, err)]
    async fn init(&self) -> Result<(), StoreError> {
        if self.connection.read().is_some() {
            return Ok(());
        }

        let client =
            Client::with_options(self.options.clone()).context("Failed to create MongoDB client")?;
        let database = client.database(&self.database_name);
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .context("Failed to connect to MongoDB")?;

        let index = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        database
            .collection::<JobDocument>(COLLECTION)
            .create_index(index, None)
            .await
            .context("Failed to create job index")?;

        *self.connection.write() = Some((client, database));
        info!(database = %self.database_name, "Connected to MongoDB");
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn close(&self) -> Result<(), StoreError> {
        let connection = self.connection.write().take();
        if let Some((client, _)) = connection {
            client.shutdown().await;
            info!("Closed MongoDB connection");
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id))]
    async fn add_job(&self, job: Job) -> Result<(), StoreError> {
        let document = JobDocument::try_from(&job).context("Failed to encode job")?;
        match self.collection()?.insert_one(document, None).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(StoreError::DuplicateJob(job.id)),
            Err(err) => Err(anyhow::Error::new(err)
                .context("Failed to add job")
                .into()),
        }
    }

    #[instrument(skip_all, err)]
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let document = self
            .collection()?
            .find_one(doc! { "id": id }, None)
            .await
            .context("Failed to get job")?;
        Ok(document.map(Job::from))
    }

    #[instrument(skip_all, err)]
    async fn remove_job(&self, id: &str) -> Result<bool, StoreError> {
        let result = self
            .collection()?
            .delete_one(doc! { "id": id }, None)
            .await
            .context("Failed to remove job")?;
        Ok(result.deleted_count > 0)
    }

    #[instrument(skip_all, err)]
    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<bool, StoreError> {
        let set = set_document(&update)?;
        if set.is_empty() {
            return self.exists(id).await;
        }
        let result = self
            .collection()?
            .update_one(doc! { "id": id }, doc! { "$set": set }, None)
            .await
            .context("Failed to update job")?;
        Ok(result.matched_count > 0)
    }

    #[instrument(skip_all, err)]
    async fn get_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let documents: Vec<JobDocument> = self
            .collection()?
            .find(doc! {}, None)
            .await
            .context("Failed to query jobs")?
            .try_collect()
            .await
            .context("Failed to read jobs")?;
        Ok(documents.into_iter().map(Job::from).collect())
    }

    #[instrument(skip_all, err)]
    async fn flush_jobs(&self) -> Result<(), StoreError> {
        self.collection()?
            .delete_many(doc! {}, None)
            .await
            .context("Failed to flush jobs")?;
        Ok(())
    }

    fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    #[instrument(skip_all, err)]
    async fn try_lock(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let locked = self
            .collection()?
            .find_one_and_update(
                doc! { "id": id, "locked_at": None::<bson::DateTime> },
                doc! { "$set": { "locked_at": to_bson_datetime(now) } },
                None,
            )
            .await
            .context("Failed to lock job")?;
        Ok(locked.is_some())
    }

    #[instrument(skip_all, err)]
    async fn set_execution_fields(
        &self,
        id: &str,
        fields: ExecutionFields,
    ) -> Result<bool, StoreError> {
        self.update_job(id, fields.into()).await
    }

    #[instrument(skip_all, err)]
    async fn increment_counters(
        &self,
        id: &str,
        increments: CounterIncrements,
    ) -> Result<bool, StoreError> {
        let inc = doc! {
            "run_count": Bson::Int64(increments.run_count as i64),
            "fail_count": Bson::Int64(increments.fail_count as i64),
        };
        let result = self
            .collection()?
            .update_one(doc! { "id": id }, doc! { "$inc": inc }, None)
            .await
            .context("Failed to update job counters")?;
        Ok(result.matched_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;

    fn uri() -> String {
        std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string())
    }

    async fn store(database: &str) -> MongoDbStore {
        let store = MongoDbStore::new(&uri(), None, Some(database)).await.unwrap();
        store.init().await.unwrap();
        store.flush_jobs().await.unwrap();
        store
    }

    #[tokio::test]
    async fn operations_fail_before_init() {
        let store = MongoDbStore::new("mongodb://localhost:27017", None, None)
            .await
            .unwrap();
        assert!(matches!(
            store.get_jobs().await.unwrap_err(),
            StoreError::NotConnected
        ));
        assert_eq!(store.database_name, DEFAULT_DATABASE);
    }

    #[tokio::test]
    async fn database_name_comes_from_uri() {
        let store = MongoDbStore::new("mongodb://localhost:27017/uptime", None, None)
            .await
            .unwrap();
        assert_eq!(store.database_name, "uptime");
    }

    #[tokio::test]
    async fn cert_file_enables_tls() {
        let store = MongoDbStore::new(
            "mongodb://localhost:27017",
            Some("/etc/ssl/mongo-ca.pem".to_string()),
            None,
        )
        .await
        .unwrap();
        let Some(Tls::Enabled(tls)) = &store.options.tls else {
            panic!("tls not enabled: {:?}", store.options.tls);
        };
        assert_eq!(
            tls.ca_file_path.as_deref(),
            Some(std::path::Path::new("/etc/ssl/mongo-ca.pem"))
        );
    }

    #[tokio::test]
    async fn close_before_init_is_a_no_op() {
        let store = MongoDbStore::new("mongodb://localhost:27017", None, None)
            .await
            .unwrap();
        store.close().await.unwrap();
        assert!(store.connection.read().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn close_shuts_down_and_init_reconnects() {
        let store = store("cadence_test_reconnect").await;
        store.close().await.unwrap();
        assert!(matches!(
            store.get_jobs().await.unwrap_err(),
            StoreError::NotConnected
        ));

        store.init().await.unwrap();
        assert!(store.get_jobs().await.unwrap().is_empty());
        store.delete_database().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn stores_and_updates_jobs() {
        let store = store("cadence_test_crud").await;
        let job = NewJob::new("t").into_job("a".to_string());

        store.add_job(job.clone()).await.unwrap();
        assert!(matches!(
            store.add_job(job).await.unwrap_err(),
            StoreError::DuplicateJob(_)
        ));

        let update = JobUpdate {
            active: Some(false),
            repeat_ms: Some(Some(250)),
            ..Default::default()
        };
        assert!(store.update_job("a", update).await.unwrap());
        assert!(!store.update_job("b", JobUpdate::default()).await.unwrap());

        let stored = store.get_job("a").await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.repeat_ms, Some(250));

        assert!(store.remove_job("a").await.unwrap());
        assert!(store.get_jobs().await.unwrap().is_empty());
        store.delete_database().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn lock_and_counters_are_atomic() {
        let store = store("cadence_test_lock").await;
        store
            .add_job(NewJob::new("t").into_job("a".to_string()))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(store.try_lock("a", now).await.unwrap());
        assert!(!store.try_lock("a", now).await.unwrap());

        let increments = CounterIncrements {
            run_count: 3,
            fail_count: 2,
        };
        assert!(store.increment_counters("a", increments).await.unwrap());

        let job = store.get_job("a").await.unwrap().unwrap();
        assert_eq!(job.run_count, 3);
        assert_eq!(job.fail_count, 2);
        assert!(job.locked_at.is_some());
        store.delete_database().await.unwrap();
    }
}
