//! The registry stage: authoritative job catalog and source of catalog
//! mutation events.
//!
//! Every mutation is persisted before its event is released, so a consumer
//! never learns about a job the storage layer could lose. Events wait in an
//! outbound buffer and are released strictly against downstream demand
//! (see [`RegistryHandle::request`] — the broadcaster pulls, the registry
//! never pushes ahead of demand).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use metronome_core::{CatalogEvent, Job, JobName, JobState};
use metronome_storage::Storage;

use crate::error::Result;

/// Commands accepted by the registry mailbox.
#[derive(Debug)]
pub(crate) enum RegistryCommand {
    Add(Job),
    Delete(JobName),
    ChangeState(JobName, JobState),
    DeleteAll,
    Jobs(oneshot::Sender<Vec<Job>>),
    Find(JobName, oneshot::Sender<Option<Job>>),
    /// Downstream demand: release up to this many buffered events.
    Request(usize),
    BeginHandoff(oneshot::Sender<RegistrySnapshot>),
    EndHandoff(RegistrySnapshot),
    ResolveConflict(RegistrySnapshot),
    Die,
}

/// Catalog and outbound buffer as carried between cluster nodes during
/// hand-off.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub catalog: HashMap<JobName, Job>,
    pub buffer: VecDeque<CatalogEvent>,
}

/// Catalog, outbound buffer and outstanding demand.
///
/// Pure state transitions; persistence and event release live in
/// [`JobRegistry`].
struct RegistryState {
    catalog: HashMap<JobName, Job>,
    buffer: VecDeque<CatalogEvent>,
    demand: usize,
}

impl RegistryState {
    fn new(catalog: HashMap<JobName, Job>) -> Self {
        // Announce every already-active job to the first subscriber.
        let buffer = catalog
            .values()
            .filter(|job| job.is_active())
            .map(|job| CatalogEvent::Add(job.clone()))
            .collect();
        Self {
            catalog,
            buffer,
            demand: 0,
        }
    }

    /// Insert or overwrite by name; active jobs are announced downstream.
    fn add(&mut self, job: Job) {
        if job.is_active() {
            self.buffer.push_back(CatalogEvent::Add(job.clone()));
        }
        self.catalog.insert(job.name.clone(), job);
    }

    /// Remove by name. Only the removal of an active job is announced.
    fn delete(&mut self, name: &JobName) {
        if let Some(job) = self.catalog.remove(name) {
            if job.is_active() {
                self.buffer.push_back(CatalogEvent::Remove(name.clone()));
            }
        }
    }

    fn change_state(&mut self, name: &JobName, state: JobState) {
        let Some(job) = self.catalog.get_mut(name) else {
            return;
        };
        job.state = state;
        match state {
            JobState::Active => self.buffer.push_back(CatalogEvent::Add(job.clone())),
            JobState::Inactive => self.buffer.push_back(CatalogEvent::Remove(name.clone())),
        }
    }

    fn delete_all(&mut self) {
        for (name, job) in self.catalog.drain() {
            if job.is_active() {
                self.buffer.push_back(CatalogEvent::Remove(name));
            }
        }
    }

    /// Merge a snapshot handed over from another node. Incoming jobs win on
    /// name collision; incoming buffered events queue behind local ones.
    fn merge(&mut self, snapshot: RegistrySnapshot) {
        for (name, job) in snapshot.catalog {
            self.catalog.insert(name, job);
        }
        self.buffer.extend(snapshot.buffer);
    }

    /// Take releasable events off the front of the buffer, consuming demand.
    fn releasable(&mut self) -> Vec<CatalogEvent> {
        let n = self.demand.min(self.buffer.len());
        self.demand -= n;
        self.buffer.drain(..n).collect()
    }
}

/// The registry stage task.
pub struct JobRegistry {
    commands: mpsc::Receiver<RegistryCommand>,
    events: mpsc::Sender<CatalogEvent>,
    storage: Arc<dyn Storage>,
    state: RegistryState,
}

impl JobRegistry {
    /// Build the stage.
    ///
    /// Adopts the persisted catalog when storage has one (the stored copy is
    /// authoritative and `initial_jobs` is discarded); otherwise persists and
    /// adopts `initial_jobs`.
    pub(crate) fn new(
        commands: mpsc::Receiver<RegistryCommand>,
        events: mpsc::Sender<CatalogEvent>,
        storage: Arc<dyn Storage>,
        initial_jobs: Vec<Job>,
    ) -> Result<Self> {
        let catalog: HashMap<JobName, Job> = match storage.jobs()? {
            Some(jobs) => {
                info!(count = jobs.len(), "adopted persisted job catalog");
                jobs.into_iter().map(|job| (job.name.clone(), job)).collect()
            }
            None => {
                for job in &initial_jobs {
                    storage.add_job(job)?;
                }
                info!(count = initial_jobs.len(), "seeded job catalog from initial job list");
                initial_jobs
                    .into_iter()
                    .map(|job| (job.name.clone(), job))
                    .collect()
            }
        };

        Ok(Self {
            commands,
            events,
            storage,
            state: RegistryState::new(catalog),
        })
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        while let Some(command) = self.commands.recv().await {
            match command {
                RegistryCommand::Add(job) => {
                    debug!(job = %job.name, state = %job.state, "adding job");
                    self.storage.add_job(&job)?;
                    self.state.add(job);
                    self.flush().await;
                }
                RegistryCommand::Delete(name) => {
                    // Unknown names are a no-op, storage included.
                    if self.state.catalog.contains_key(&name) {
                        debug!(job = %name, "deleting job");
                        self.storage.delete_job(&name)?;
                        self.state.delete(&name);
                        self.flush().await;
                    }
                }
                RegistryCommand::ChangeState(name, state) => {
                    let changes = self
                        .state
                        .catalog
                        .get(&name)
                        .is_some_and(|job| job.state != state);
                    // A transition to the current state writes and emits
                    // nothing.
                    if changes {
                        debug!(job = %name, state = %state, "changing job state");
                        self.storage.update_job_state(&name, state)?;
                        self.state.change_state(&name, state);
                        self.flush().await;
                    }
                }
                RegistryCommand::DeleteAll => {
                    info!(count = self.state.catalog.len(), "deleting all jobs");
                    self.storage.purge()?;
                    self.state.delete_all();
                    self.flush().await;
                }
                RegistryCommand::Jobs(reply) => {
                    let _ = reply.send(self.state.catalog.values().cloned().collect());
                }
                RegistryCommand::Find(name, reply) => {
                    let _ = reply.send(self.state.catalog.get(&name).cloned());
                }
                RegistryCommand::Request(n) => {
                    self.state.demand += n;
                    self.flush().await;
                }
                RegistryCommand::BeginHandoff(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                RegistryCommand::EndHandoff(snapshot)
                | RegistryCommand::ResolveConflict(snapshot) => {
                    info!(
                        incoming_jobs = snapshot.catalog.len(),
                        incoming_events = snapshot.buffer.len(),
                        "merging handed-off registry state"
                    );
                    self.state.merge(snapshot);
                    self.flush().await;
                }
                RegistryCommand::Die => break,
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            catalog: self.state.catalog.clone(),
            buffer: self.state.buffer.clone(),
        }
    }

    /// Release buffered events up to the outstanding demand.
    async fn flush(&mut self) {
        for event in self.state.releasable() {
            if self.events.send(event).await.is_err() {
                warn!("event consumer is gone; dropping released events");
                break;
            }
        }
    }
}

/// Client-facing handle to the registry mailbox.
///
/// Mutations are casts (fire-and-forget); [`jobs`](Self::jobs) and
/// [`find_job`](Self::find_job) await a reply. All methods are inert once
/// the stage has stopped.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub(crate) fn new(tx: mpsc::Sender<RegistryCommand>) -> Self {
        Self { tx }
    }

    pub async fn add_job(&self, job: Job) {
        let _ = self.tx.send(RegistryCommand::Add(job)).await;
    }

    pub async fn delete_job(&self, name: impl Into<JobName>) {
        let _ = self.tx.send(RegistryCommand::Delete(name.into())).await;
    }

    pub async fn change_job_state(&self, name: impl Into<JobName>, state: JobState) {
        let _ = self
            .tx
            .send(RegistryCommand::ChangeState(name.into(), state))
            .await;
    }

    pub async fn activate_job(&self, name: impl Into<JobName>) {
        self.change_job_state(name, JobState::Active).await;
    }

    pub async fn deactivate_job(&self, name: impl Into<JobName>) {
        self.change_job_state(name, JobState::Inactive).await;
    }

    pub async fn delete_all_jobs(&self) {
        let _ = self.tx.send(RegistryCommand::DeleteAll).await;
    }

    /// Snapshot of the full catalog.
    pub async fn jobs(&self) -> Vec<Job> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryCommand::Jobs(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn find_job(&self, name: impl Into<JobName>) -> Option<Job> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::Find(name.into(), reply))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Declare downstream demand for up to `n` more events.
    pub(crate) async fn request(&self, n: usize) {
        let _ = self.tx.send(RegistryCommand::Request(n)).await;
    }

    /// Cluster hand-off: snapshot local state for a continuing node.
    pub async fn begin_handoff(&self) -> Option<RegistrySnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::BeginHandoff(reply))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    /// Cluster hand-off: adopt state from a departing node.
    pub async fn end_handoff(&self, snapshot: RegistrySnapshot) {
        let _ = self.tx.send(RegistryCommand::EndHandoff(snapshot)).await;
    }

    /// Cluster conflict resolution; same merge rule as
    /// [`end_handoff`](Self::end_handoff).
    pub async fn resolve_conflict(&self, snapshot: RegistrySnapshot) {
        let _ = self.tx.send(RegistryCommand::ResolveConflict(snapshot)).await;
    }

    /// Stop the stage without draining its mailbox.
    pub async fn die(&self) {
        let _ = self.tx.send(RegistryCommand::Die).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metronome_core::Schedule;
    use metronome_storage::MemoryStorage;

    fn job(name: &str) -> Job {
        Job::new(name, Schedule::parse("* * * * *").unwrap())
    }

    fn inactive_job(name: &str) -> Job {
        job(name).with_state(JobState::Inactive)
    }

    /// Spawn a registry over fresh memory storage, returning the handle, the
    /// event stream and the storage for inspection.
    fn spawn_registry(
        initial: Vec<Job>,
    ) -> (
        RegistryHandle,
        mpsc::Receiver<CatalogEvent>,
        Arc<MemoryStorage>,
    ) {
        spawn_registry_on(Arc::new(MemoryStorage::new()), initial)
    }

    fn spawn_registry_on(
        storage: Arc<MemoryStorage>,
        initial: Vec<Job>,
    ) -> (
        RegistryHandle,
        mpsc::Receiver<CatalogEvent>,
        Arc<MemoryStorage>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let registry = JobRegistry::new(cmd_rx, event_tx, storage.clone(), initial).unwrap();
        tokio::spawn(registry.run());
        (RegistryHandle::new(cmd_tx), event_rx, storage)
    }

    #[tokio::test]
    async fn events_wait_for_demand() {
        let (handle, mut events, _) = spawn_registry(vec![]);
        handle.add_job(job("a")).await;
        handle.add_job(job("b")).await;
        handle.add_job(job("c")).await;

        // No demand yet: catalog is written but nothing is released.
        assert_eq!(handle.jobs().await.len(), 3);
        assert!(events.try_recv().is_err());

        handle.request(2).await;
        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(j)) if j.name.as_str() == "a"));
        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(j)) if j.name.as_str() == "b"));
        assert!(events.try_recv().is_err());

        handle.request(1).await;
        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(j)) if j.name.as_str() == "c"));
    }

    #[tokio::test]
    async fn residual_demand_is_retained() {
        let (handle, mut events, _) = spawn_registry(vec![]);
        handle.request(5).await;
        // Demand arrived first; the next mutation releases immediately.
        handle.add_job(job("a")).await;
        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(_))));
    }

    #[tokio::test]
    async fn inactive_adds_emit_nothing() {
        let (handle, mut events, storage) = spawn_registry(vec![]);
        handle.request(10).await;
        handle.add_job(inactive_job("quiet")).await;

        // Persisted, in the catalog, but never announced.
        assert_eq!(handle.jobs().await.len(), 1);
        assert_eq!(storage.jobs().unwrap().unwrap().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_of_missing_job_is_a_noop() {
        let (handle, mut events, storage) = spawn_registry(vec![]);
        handle.request(10).await;
        handle.delete_job("ghost").await;

        assert!(handle.jobs().await.is_empty());
        assert!(storage.jobs().unwrap().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn add_then_delete_round_trips() {
        let (handle, mut events, storage) = spawn_registry(vec![]);
        handle.request(10).await;
        handle.add_job(job("a")).await;
        handle.delete_job("a").await;

        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(_))));
        assert!(
            matches!(events.recv().await, Some(CatalogEvent::Remove(n)) if n.as_str() == "a")
        );
        assert!(handle.jobs().await.is_empty());
        assert_eq!(storage.jobs().unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn state_change_to_same_state_is_a_noop() {
        let (handle, mut events, storage) = spawn_registry(vec![]);
        handle.request(10).await;
        handle.add_job(inactive_job("a")).await;
        handle.deactivate_job("a").await;
        let _ = handle.jobs().await;

        assert!(events.try_recv().is_err());
        assert_eq!(storage.jobs().unwrap().unwrap()[0].state, JobState::Inactive);
    }

    #[tokio::test]
    async fn activation_announces_the_updated_job() {
        let (handle, mut events, _) = spawn_registry(vec![]);
        handle.request(10).await;
        handle.add_job(inactive_job("a")).await;
        handle.activate_job("a").await;

        match events.recv().await {
            Some(CatalogEvent::Add(j)) => {
                assert_eq!(j.name.as_str(), "a");
                assert_eq!(j.state, JobState::Active);
            }
            other => panic!("expected add event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deactivation_announces_removal() {
        let (handle, mut events, _) = spawn_registry(vec![]);
        handle.request(10).await;
        handle.add_job(job("a")).await;
        handle.deactivate_job("a").await;

        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(_))));
        assert!(
            matches!(events.recv().await, Some(CatalogEvent::Remove(n)) if n.as_str() == "a")
        );
    }

    #[tokio::test]
    async fn delete_all_announces_only_active_jobs() {
        let (handle, mut events, storage) = spawn_registry(vec![]);
        handle.request(10).await;
        handle.add_job(job("a")).await;
        handle.add_job(inactive_job("b")).await;
        let _ = events.recv().await; // a's add

        handle.delete_all_jobs().await;
        assert!(
            matches!(events.recv().await, Some(CatalogEvent::Remove(n)) if n.as_str() == "a")
        );
        assert!(events.try_recv().is_err());
        assert_eq!(storage.jobs().unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn initial_jobs_seed_a_fresh_store() {
        let (handle, mut events, storage) =
            spawn_registry(vec![job("a"), inactive_job("b")]);
        handle.request(10).await;

        // Active jobs are announced to the first subscriber.
        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(j)) if j.name.as_str() == "a"));
        assert!(events.try_recv().is_err());
        // And everything was persisted.
        assert_eq!(storage.jobs().unwrap().unwrap().len(), 2);
        assert_eq!(handle.jobs().await.len(), 2);
    }

    #[tokio::test]
    async fn persisted_catalog_wins_over_initial_jobs() {
        let storage = Arc::new(MemoryStorage::with_jobs(vec![job("stored")]));
        let (handle, _events, _) = spawn_registry_on(storage, vec![job("ignored")]);

        let names: Vec<_> = handle
            .jobs()
            .await
            .into_iter()
            .map(|j| j.name.0)
            .collect();
        assert_eq!(names, vec!["stored".to_string()]);
    }

    #[tokio::test]
    async fn find_job_returns_the_catalog_entry() {
        let (handle, _events, _) = spawn_registry(vec![]);
        handle.add_job(job("a")).await;

        assert!(handle.find_job("a").await.is_some());
        assert!(handle.find_job("b").await.is_none());
    }

    #[tokio::test]
    async fn handoff_merge_prefers_incoming_and_appends_buffer() {
        let (handle, mut events, _) = spawn_registry(vec![]);
        handle.add_job(job("local").with_task(serde_json::json!("mine"))).await;

        let incoming = RegistrySnapshot {
            catalog: [
                (JobName::from("local"), job("local").with_task(serde_json::json!("theirs"))),
                (JobName::from("remote"), job("remote")),
            ]
            .into_iter()
            .collect(),
            buffer: VecDeque::from([CatalogEvent::Add(job("remote"))]),
        };
        handle.end_handoff(incoming).await;

        let merged = handle.find_job("local").await.unwrap();
        assert_eq!(merged.task, serde_json::json!("theirs"));
        assert_eq!(handle.jobs().await.len(), 2);

        // Local buffered events drain before the incoming ones.
        handle.request(10).await;
        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(j)) if j.name.as_str() == "local"));
        assert!(matches!(events.recv().await, Some(CatalogEvent::Add(j)) if j.name.as_str() == "remote"));
    }

    #[tokio::test]
    async fn die_stops_the_stage() {
        let (handle, _events, _) = spawn_registry(vec![]);
        handle.die().await;
        // The mailbox is gone, so queries fall back to their defaults.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(handle.jobs().await.is_empty());
    }
}
