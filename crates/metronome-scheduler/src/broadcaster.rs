//! The broadcaster stage: time-ordered fan-out of `execute` events.
//!
//! Catalog mutations coming off the registry become buckets in a firing
//! queue keyed by naive-UTC instant. A single timer sleeps until the head
//! bucket is due; firing persists the watermark, emits one execution per
//! job in the bucket, and reschedules those jobs against the advanced
//! watermark.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use metronome_core::{time, CatalogEvent, ExecuteEvent, Job, JobName, TimeError};
use metronome_storage::Storage;

use crate::error::{Result, SchedulerError};
use crate::registry::RegistryHandle;

/// Probe bump (seconds) applied when a candidate local time falls in a DST
/// gap. Any such gap is finite, so repeated bumps always escape it.
const INVALID_TIME_STEP_SECS: i64 = 60;

/// Commands accepted by the broadcaster mailbox (cluster lifecycle only —
/// job traffic arrives on the event stream).
#[derive(Debug)]
pub(crate) enum BroadcasterCommand {
    BeginHandoff(oneshot::Sender<BroadcasterSnapshot>),
    EndHandoff(BroadcasterSnapshot),
    ResolveConflict(BroadcasterSnapshot),
    Die,
}

/// Firing queue and watermark as carried between cluster nodes during
/// hand-off.
#[derive(Debug, Clone)]
pub struct BroadcasterSnapshot {
    pub queue: BTreeMap<NaiveDateTime, Vec<Job>>,
    pub watermark: NaiveDateTime,
}

/// Firing queue plus watermark.
///
/// Transitions keep every bucket instant ahead of the watermark, never
/// retain an empty bucket, and never move the watermark backwards (hand-off
/// merges excepted — there the earlier watermark deliberately wins).
struct BroadcasterState {
    queue: BTreeMap<NaiveDateTime, Vec<Job>>,
    time: NaiveDateTime,
}

impl BroadcasterState {
    fn new(time: NaiveDateTime) -> Self {
        Self {
            queue: BTreeMap::new(),
            time,
        }
    }

    /// Work out the next firing for `job` and slot it into the queue.
    ///
    /// An unknown zone or an exhausted schedule drops the job from the
    /// queue only — it stays in the catalog upstream. A conversion landing
    /// in a nonexistent local time advances the watermark by
    /// [`INVALID_TIME_STEP_SECS`] and retries.
    fn add(&mut self, job: Job) -> Result<()> {
        let run_at = loop {
            let local_from = match time::to_zone(self.time, &job.timezone) {
                Ok(dt) => dt,
                Err(TimeError::InvalidForZone { .. }) => {
                    self.time = self.time + Duration::seconds(INVALID_TIME_STEP_SECS);
                    continue;
                }
                Err(TimeError::InvalidZone { .. }) => {
                    error!(job = %job.name, zone = %job.timezone, "unknown timezone, job will not be scheduled");
                    return Ok(());
                }
            };

            let Some(local_next) = time::next_run_after(&job.schedule, local_from) else {
                warn!(job = %job.name, schedule = %job.schedule, "schedule has no future run date, job will not be scheduled");
                return Ok(());
            };

            match time::to_utc(local_next, &job.timezone) {
                Ok(dt) => break dt,
                Err(TimeError::InvalidForZone { .. }) => {
                    self.time = self.time + Duration::seconds(INVALID_TIME_STEP_SECS);
                }
                Err(TimeError::InvalidZone { .. }) => {
                    error!(job = %job.name, zone = %job.timezone, "unknown timezone, job will not be scheduled");
                    return Ok(());
                }
            }
        };

        // A firing behind the watermark would re-fire on the same instant
        // forever.
        if run_at < self.time {
            return Err(SchedulerError::JobInPast {
                job: job.name.to_string(),
                scheduled: run_at,
                watermark: self.time,
            });
        }

        // Same-instant jobs share a bucket, most recently inserted first.
        self.queue.entry(run_at).or_default().insert(0, job);
        Ok(())
    }

    /// Drop every queued occurrence of `name`, pruning emptied buckets.
    fn remove(&mut self, name: &JobName) {
        self.queue.retain(|_, jobs| {
            jobs.retain(|job| &job.name != name);
            !jobs.is_empty()
        });
    }

    /// Instant of the nearest pending firing.
    fn head(&self) -> Option<NaiveDateTime> {
        self.queue.keys().next().copied()
    }

    fn take_head(&mut self) -> Option<(NaiveDateTime, Vec<Job>)> {
        self.queue.pop_first()
    }

    fn advance(&mut self, to: NaiveDateTime) {
        self.time = self.time.max(to);
    }

    /// Adopt state handed over from another node: the earlier watermark
    /// wins so no firings are skipped, and incoming jobs are rescheduled
    /// under the merged watermark.
    fn merge(&mut self, snapshot: BroadcasterSnapshot) -> Result<()> {
        self.time = self.time.min(snapshot.watermark);
        for jobs in snapshot.queue.into_values() {
            for job in jobs {
                self.add(job)?;
            }
        }
        Ok(())
    }
}

/// The broadcaster stage task.
pub struct ExecutionBroadcaster {
    commands: mpsc::Receiver<BroadcasterCommand>,
    events: mpsc::Receiver<CatalogEvent>,
    executions: mpsc::Sender<ExecuteEvent>,
    registry: RegistryHandle,
    storage: Arc<dyn Storage>,
    state: BroadcasterState,
    initial_demand: usize,
}

impl ExecutionBroadcaster {
    /// Build the stage, recovering the watermark from storage (current UTC
    /// when none was ever recorded).
    pub(crate) fn new(
        commands: mpsc::Receiver<BroadcasterCommand>,
        events: mpsc::Receiver<CatalogEvent>,
        executions: mpsc::Sender<ExecuteEvent>,
        registry: RegistryHandle,
        storage: Arc<dyn Storage>,
        initial_demand: usize,
    ) -> Result<Self> {
        let time = match storage.last_execution_date()? {
            Some(dt) => {
                info!(watermark = %dt, "recovered execution watermark");
                dt
            }
            None => Utc::now().naive_utc(),
        };

        Ok(Self {
            commands,
            events,
            executions,
            registry,
            storage,
            state: BroadcasterState::new(time),
            initial_demand,
        })
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        info!(watermark = %self.state.time, "execution broadcaster started");
        self.registry.request(self.initial_demand).await;

        loop {
            let armed = self.state.head();
            let deadline = armed.map(timer_deadline).unwrap_or_else(Instant::now);

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(BroadcasterCommand::BeginHandoff(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(BroadcasterCommand::EndHandoff(snapshot))
                    | Some(BroadcasterCommand::ResolveConflict(snapshot)) => {
                        info!(
                            incoming_watermark = %snapshot.watermark,
                            incoming_buckets = snapshot.queue.len(),
                            "merging handed-off broadcaster state"
                        );
                        self.state.merge(snapshot)?;
                    }
                    Some(BroadcasterCommand::Die) | None => break,
                },
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event).await?;
                        self.registry.request(1).await;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if armed.is_some() => {
                    self.fire().await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: CatalogEvent) -> Result<()> {
        match event {
            // Reboot jobs run once on registration and never enter the
            // queue.
            CatalogEvent::Add(job) if job.schedule.is_reboot() => {
                debug!(job = %job.name, "emitting reboot execution");
                let _ = self.executions.send(ExecuteEvent { job }).await;
            }
            CatalogEvent::Add(job) => {
                debug!(job = %job.name, "scheduling job");
                self.state.add(job)?;
            }
            CatalogEvent::Remove(name) => {
                debug!(job = %name, "unscheduling job");
                self.state.remove(&name);
            }
        }
        Ok(())
    }

    /// The armed instant has arrived: persist the watermark, advance it,
    /// reschedule the bucket's jobs, and emit one execution per job.
    async fn fire(&mut self) -> Result<()> {
        let Some(at) = self.state.head() else {
            return Ok(());
        };
        // The watermark must be durable before anything is emitted, so a
        // restart resumes after this bucket instead of re-firing history.
        self.storage.update_last_execution_date(at)?;

        let Some((at, jobs)) = self.state.take_head() else {
            return Ok(());
        };
        self.state.advance(at + Duration::seconds(1));
        info!(at = %at, jobs = jobs.len(), "firing");

        for job in &jobs {
            self.state.add(job.clone())?;
        }
        for job in jobs {
            let _ = self.executions.send(ExecuteEvent { job }).await;
        }
        Ok(())
    }

    fn snapshot(&self) -> BroadcasterSnapshot {
        BroadcasterSnapshot {
            queue: self.state.queue.clone(),
            watermark: self.state.time,
        }
    }
}

/// Translate a wall-clock firing instant into a monotonic timer deadline.
///
/// Instants at or before the current wall clock map to an already-elapsed
/// deadline, so the timer arm completes immediately and the head bucket is
/// processed on the next loop iteration.
fn timer_deadline(run_at: NaiveDateTime) -> Instant {
    let now = Instant::now();
    match (run_at - Utc::now().naive_utc()).to_std() {
        Ok(remaining) => now + remaining,
        Err(_) => now,
    }
}
