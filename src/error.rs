use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store failed to initialize: {0}")]
    StoreInit(#[source] StoreError),
    #[error("job {0} already exists")]
    DuplicateJob(String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
