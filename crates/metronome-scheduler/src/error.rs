use chrono::NaiveDateTime;
use thiserror::Error;

use metronome_storage::StorageError;

/// Errors that stop a pipeline stage.
///
/// Either variant terminates the owning stage task; whatever supervises the
/// pipeline is expected to restart it, at which point state is recovered
/// from storage.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A computed firing landed before the watermark. Firing it would spin
    /// on the same instant forever, so the stage stops instead.
    #[error("job {job} scheduled at {scheduled}, before watermark {watermark}")]
    JobInPast {
        job: String,
        scheduled: NaiveDateTime,
        watermark: NaiveDateTime,
    },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
