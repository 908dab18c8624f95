use std::collections::HashMap;
use std::sync::Mutex;

use chrono::NaiveDateTime;

use metronome_core::{Job, JobName, JobState};

use crate::error::Result;
use crate::Storage;

/// In-memory adapter.
///
/// The catalog map stays `None` until the first write, upholding the
/// fresh-vs-empty contract documented on [`Storage::jobs`].
#[derive(Default)]
pub struct MemoryStorage {
    jobs: Mutex<Option<HashMap<JobName, Job>>>,
    last_execution: Mutex<Option<NaiveDateTime>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `jobs`, as if written by a previous run.
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        let map = jobs
            .into_iter()
            .map(|job| (job.name.clone(), job))
            .collect::<HashMap<_, _>>();
        Self {
            jobs: Mutex::new(Some(map)),
            last_execution: Mutex::new(None),
        }
    }

    /// Pre-set the last-execution watermark.
    pub fn with_last_execution(self, dt: NaiveDateTime) -> Self {
        *self.last_execution.lock().unwrap() = Some(dt);
        self
    }
}

impl Storage for MemoryStorage {
    fn jobs(&self) -> Result<Option<Vec<Job>>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .as_ref()
            .map(|map| map.values().cloned().collect()))
    }

    fn add_job(&self, job: &Job) -> Result<()> {
        self.jobs
            .lock()
            .unwrap()
            .get_or_insert_with(HashMap::new)
            .insert(job.name.clone(), job.clone());
        Ok(())
    }

    fn delete_job(&self, name: &JobName) -> Result<()> {
        if let Some(map) = self.jobs.lock().unwrap().as_mut() {
            map.remove(name);
        }
        Ok(())
    }

    fn update_job_state(&self, name: &JobName, state: JobState) -> Result<()> {
        if let Some(job) = self
            .jobs
            .lock()
            .unwrap()
            .get_or_insert_with(HashMap::new)
            .get_mut(name)
        {
            job.state = state;
        }
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        *self.jobs.lock().unwrap() = Some(HashMap::new());
        Ok(())
    }

    fn last_execution_date(&self) -> Result<Option<NaiveDateTime>> {
        Ok(*self.last_execution.lock().unwrap())
    }

    fn update_last_execution_date(&self, dt: NaiveDateTime) -> Result<()> {
        *self.last_execution.lock().unwrap() = Some(dt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use metronome_core::Schedule;

    fn job(name: &str) -> Job {
        Job::new(name, Schedule::parse("* * * * *").unwrap())
    }

    #[test]
    fn fresh_store_reports_no_catalog() {
        let storage = MemoryStorage::new();
        assert!(storage.jobs().unwrap().is_none());
        assert!(storage.last_execution_date().unwrap().is_none());
    }

    #[test]
    fn first_write_creates_the_catalog() {
        let storage = MemoryStorage::new();
        storage.add_job(&job("a")).unwrap();
        let jobs = storage.jobs().unwrap().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name.as_str(), "a");
    }

    #[test]
    fn purge_leaves_a_known_empty_catalog() {
        let storage = MemoryStorage::new();
        storage.add_job(&job("a")).unwrap();
        storage.purge().unwrap();
        // Empty, not unknown: a restart must not re-seed.
        assert_eq!(storage.jobs().unwrap(), Some(vec![]));
    }

    #[test]
    fn state_updates_are_persisted() {
        let storage = MemoryStorage::new();
        storage.add_job(&job("a")).unwrap();
        storage
            .update_job_state(&JobName::from("a"), JobState::Inactive)
            .unwrap();
        let jobs = storage.jobs().unwrap().unwrap();
        assert_eq!(jobs[0].state, JobState::Inactive);
    }

    #[test]
    fn watermark_round_trips() {
        let storage = MemoryStorage::new();
        let dt = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 1, 0)
            .unwrap();
        storage.update_last_execution_date(dt).unwrap();
        assert_eq!(storage.last_execution_date().unwrap(), Some(dt));
    }
}
