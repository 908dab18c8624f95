use chrono::NaiveDateTime;
use thiserror::Error;

/// The provided schedule expression cannot be parsed.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidExpression { expr: String, reason: String },
}

/// Timezone conversion failures.
///
/// The two variants must stay distinct: an unknown zone drops the job from
/// scheduling entirely, while a valid zone rejecting one particular instant
/// (a DST spring-forward gap) is retried at a bumped probe time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("unknown timezone {zone:?}")]
    InvalidZone { zone: String },

    #[error("{dt} does not exist in timezone {zone}")]
    InvalidForZone { dt: NaiveDateTime, zone: String },
}

/// Configuration could not be loaded or deserialized.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(#[from] figment::Error);
