use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Unique identity of a job within one scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobName(pub String);

impl JobName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether a job takes part in scheduling.
///
/// Only `Active` jobs are announced downstream and produce executions;
/// `Inactive` jobs stay in the catalog but are invisible to the firing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Active,
    Inactive,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Active => "active",
            JobState::Inactive => "inactive",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobState::Active),
            "inactive" => Ok(JobState::Inactive),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A cron-like schedule: the parsed expression plus its source text and the
/// `@reboot` marker.
///
/// Serializes as the source string, so catalog round-trips through storage
/// re-parse on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    source: String,
    reboot: bool,
    expr: Option<cron::Schedule>,
}

impl Schedule {
    /// Parse a schedule expression.
    ///
    /// Accepts `@reboot`, the standard `@`-aliases, and 5/6/7-field cron
    /// expressions. Classic 5-field input gets second zero prepended — the
    /// cron parser wants an explicit seconds field.
    pub fn parse(source: &str) -> std::result::Result<Self, ScheduleError> {
        let source = source.trim();
        if source.eq_ignore_ascii_case("@reboot") {
            return Ok(Self {
                source: source.to_string(),
                reboot: true,
                expr: None,
            });
        }

        let normalized = if source.split_whitespace().count() == 5 {
            format!("0 {source}")
        } else {
            source.to_string()
        };
        let expr = cron::Schedule::from_str(&normalized).map_err(|e| {
            ScheduleError::InvalidExpression {
                expr: source.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            source: source.to_string(),
            reboot: false,
            expr: Some(expr),
        })
    }

    /// A reboot schedule fires once on registration instead of recurring.
    pub fn is_reboot(&self) -> bool {
        self.reboot
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn expr(&self) -> Option<&cron::Schedule> {
        self.expr.as_ref()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.reboot == other.reboot
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Schedule::parse(&s)
    }
}

impl From<Schedule> for String {
    fn from(s: Schedule) -> Self {
        s.source
    }
}

/// A scheduled unit of work.
///
/// The `task` payload and `overlap` policy are opaque to the scheduling
/// core: they are persisted and forwarded with the job but never
/// interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: JobName,
    pub schedule: Schedule,
    /// IANA zone identifier the schedule is evaluated in.
    pub timezone: String,
    pub state: JobState,
    #[serde(default)]
    pub task: serde_json::Value,
    #[serde(default)]
    pub overlap: bool,
}

impl Job {
    /// A new active job evaluated in UTC with an empty task payload.
    pub fn new(name: impl Into<JobName>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            schedule,
            timezone: "UTC".to_string(),
            state: JobState::Active,
            task: serde_json::Value::Null,
            overlap: false,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    pub fn with_task(mut self, task: serde_json::Value) -> Self {
        self.task = task;
        self
    }

    pub fn with_overlap(mut self, overlap: bool) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == JobState::Active
    }
}

/// Catalog mutation flowing from the registry stage to the broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEvent {
    Add(Job),
    Remove(JobName),
}

/// A due job fanned out to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteEvent {
    pub job: Job,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_parse() {
        let s = Schedule::parse("* * * * *").unwrap();
        assert!(!s.is_reboot());
        assert_eq!(s.source(), "* * * * *");
    }

    #[test]
    fn six_field_expressions_parse() {
        assert!(Schedule::parse("0 30 9 * * *").is_ok());
    }

    #[test]
    fn aliases_parse() {
        assert!(Schedule::parse("@daily").is_ok());
        assert!(Schedule::parse("@hourly").is_ok());
    }

    #[test]
    fn reboot_is_recognized() {
        let s = Schedule::parse("@reboot").unwrap();
        assert!(s.is_reboot());
        assert!(s.expr().is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Schedule::parse("every tuesday").is_err());
        assert!(Schedule::parse("* * *").is_err());
    }

    #[test]
    fn schedule_round_trips_through_serde() {
        let s = Schedule::parse("0 * * * *").unwrap();
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, r#""0 * * * *""#);
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn job_defaults() {
        let job = Job::new("backup", Schedule::parse("@daily").unwrap());
        assert_eq!(job.timezone, "UTC");
        assert!(job.is_active());
        assert!(job.task.is_null());
        assert!(!job.overlap);
    }

    #[test]
    fn job_round_trips_through_serde() {
        let job = Job::new("report", Schedule::parse("0 9 * * 1-5").unwrap())
            .with_timezone("Europe/Berlin")
            .with_state(JobState::Inactive)
            .with_task(serde_json::json!({"cmd": "make report"}));
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
