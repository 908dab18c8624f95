//! Storage adapters for the metronome scheduling pipeline.
//!
//! Both pipeline stages persist through the [`Storage`] trait: the registry
//! writes the job catalog, the broadcaster writes the last-execution
//! watermark. Two backends are provided — [`MemoryStorage`] for tests and
//! ephemeral schedulers, [`SqliteStorage`] for durable single-node
//! deployments.
//!
//! A fresh store is distinguishable from an empty one: [`Storage::jobs`]
//! returns `None` until the adapter has seen its first catalog write, so a
//! brand-new scheduler seeds from its configured job list, while a scheduler
//! whose catalog was deliberately emptied stays empty across restarts.

pub mod error;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use chrono::NaiveDateTime;

use metronome_core::{Job, JobName, JobState, StorageConfig};

pub use error::{Result, StorageError};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Durable state shared by the two pipeline stages.
///
/// Adapters must tolerate concurrent calls from independent stages; within
/// one stage all calls are serial.
pub trait Storage: Send + Sync {
    /// The persisted catalog, or `None` if this store has never been
    /// written to.
    fn jobs(&self) -> Result<Option<Vec<Job>>>;

    /// Insert or overwrite a job by name.
    fn add_job(&self, job: &Job) -> Result<()>;

    /// Remove a job by name. Unknown names are not an error.
    fn delete_job(&self, name: &JobName) -> Result<()>;

    /// Update the state of a persisted job. Unknown names are not an error.
    fn update_job_state(&self, name: &JobName, state: JobState) -> Result<()>;

    /// Drop every persisted job. The catalog is now known-empty, not
    /// unknown.
    fn purge(&self) -> Result<()>;

    /// Watermark of the last emitted firing, or `None` if never recorded.
    fn last_execution_date(&self) -> Result<Option<NaiveDateTime>>;

    fn update_last_execution_date(&self, dt: NaiveDateTime) -> Result<()>;
}

/// Build the storage backend selected by `config`.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageConfig::Sqlite { path } => Ok(Arc::new(SqliteStorage::open(path)?)),
    }
}
