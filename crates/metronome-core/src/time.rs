//! Wall-clock math for schedule evaluation.
//!
//! The scheduling stages keep a single naive-UTC watermark and evaluate cron
//! expressions on wall-clock fields in each job's own zone. The helpers here
//! do the conversion on both sides of that evaluation and surface the two
//! failure modes the stages must treat differently (see [`TimeError`]).

use chrono::{LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::TimeError;
use crate::types::Schedule;

/// Parse an IANA zone identifier.
pub fn parse_zone(zone: &str) -> Result<Tz, TimeError> {
    zone.parse::<Tz>().map_err(|_| TimeError::InvalidZone {
        zone: zone.to_string(),
    })
}

/// Convert a naive UTC instant to the wall-clock time in `zone`.
pub fn to_zone(utc: NaiveDateTime, zone: &str) -> Result<NaiveDateTime, TimeError> {
    let tz = parse_zone(zone)?;
    Ok(tz.from_utc_datetime(&utc).naive_local())
}

/// Convert a wall-clock time in `zone` back to naive UTC.
///
/// A local time inside a spring-forward gap does not exist and yields
/// [`TimeError::InvalidForZone`]; a fall-back overlap resolves to the
/// earlier of the two mappings.
pub fn to_utc(local: NaiveDateTime, zone: &str) -> Result<NaiveDateTime, TimeError> {
    let tz = parse_zone(zone)?;
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.naive_utc()),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.naive_utc()),
        LocalResult::None => Err(TimeError::InvalidForZone {
            dt: local,
            zone: zone.to_string(),
        }),
    }
}

/// Next wall-clock instant matching `schedule`, strictly after `after`.
///
/// The cron expression is evaluated on wall-clock fields only; the caller
/// owns zone conversion on both sides. `None` means the expression has no
/// matching date (reboot schedules included — they never recur).
pub fn next_run_after(schedule: &Schedule, after: NaiveDateTime) -> Option<NaiveDateTime> {
    let expr = schedule.expr()?;
    let probe = Utc.from_utc_datetime(&after);
    expr.after(&probe).next().map(|dt| dt.naive_utc())
}
