//! Polling job scheduler.
//!
//! Jobs are bound by name to registered templates and kept in a pluggable
//! [`Store`] (in-process, MongoDB or Redis). A [`Scheduler`] polls the store on
//! a fixed interval, picks the jobs that are due and runs them with a per-job
//! lock, bounded retries and bounded concurrency.
//!
//! ```no_run
//! use cadence_scheduler::{NewJob, Scheduler, SchedulerConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> cadence_scheduler::Result<()> {
//! let scheduler = Scheduler::new(SchedulerConfig::default()).await?;
//! scheduler.add_template("ping", |data: serde_json::Value| async move {
//!     println!("ping {data}");
//!     anyhow::Ok(())
//! });
//! scheduler.start().await?;
//! scheduler
//!     .add_job(NewJob::new("ping").repeat_every(Duration::from_secs(5)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod scheduler;
pub mod store;
pub mod template;

pub use config::{LogLevel, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use executor::CycleOutcome;
pub use job::{CounterIncrements, ExecutionFields, Job, JobUpdate, NewJob};
pub use scheduler::{Scheduler, SchedulerState, TickReport};
pub use store::{MemoryStore, MongoDbStore, RedisStore, Store, StoreError, StoreKind};
pub use template::{Handler, TemplateRegistry};
