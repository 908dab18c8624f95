//! `metronome-scheduler` — the two-stage scheduling pipeline.
//!
//! # Overview
//!
//! ```text
//!  client API ──► JobRegistry ──(catalog events)──► ExecutionBroadcaster ──► executions
//!                    │                                      │
//!                    └── storage (catalog)                  └── storage (watermark)
//! ```
//!
//! Each stage is a tokio task owning its state behind an mpsc mailbox, so
//! handlers run one at a time per stage. The registry releases catalog
//! events only against demand the broadcaster has declared, which
//! back-pressures bursts of job-set edits. The broadcaster keeps exactly
//! one pending timer — for the nearest firing instant — and fans out one
//! [`ExecuteEvent`] per due job when it elapses.
//!
//! ```no_run
//! use metronome_core::{Job, Schedule, SchedulerConfig};
//! use metronome_scheduler::Pipeline;
//!
//! # async fn demo() -> metronome_scheduler::Result<()> {
//! let config = SchedulerConfig::default();
//! let storage = metronome_storage::from_config(&config.storage)?;
//! let mut pipeline = Pipeline::spawn(&config, storage, vec![])?;
//!
//! let job = Job::new("tick", Schedule::parse("* * * * *").unwrap());
//! pipeline.registry.add_job(job).await;
//!
//! while let Some(execution) = pipeline.executions.recv().await {
//!     println!("due: {}", execution.job.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broadcaster;
pub mod error;
pub mod registry;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use metronome_core::{ExecuteEvent, Job, SchedulerConfig};
use metronome_storage::Storage;

use broadcaster::{BroadcasterCommand, ExecutionBroadcaster};
use registry::JobRegistry;

pub use broadcaster::BroadcasterSnapshot;
pub use error::{Result, SchedulerError};
pub use registry::{RegistryHandle, RegistrySnapshot};

/// Handle to the broadcaster mailbox: cluster lifecycle only, since job
/// traffic reaches the stage through its registry subscription.
#[derive(Clone)]
pub struct BroadcasterHandle {
    tx: mpsc::Sender<BroadcasterCommand>,
}

impl BroadcasterHandle {
    /// Cluster hand-off: snapshot local state for a continuing node.
    pub async fn begin_handoff(&self) -> Option<BroadcasterSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(BroadcasterCommand::BeginHandoff(reply))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    /// Cluster hand-off: adopt state from a departing node.
    pub async fn end_handoff(&self, snapshot: BroadcasterSnapshot) {
        let _ = self.tx.send(BroadcasterCommand::EndHandoff(snapshot)).await;
    }

    /// Cluster conflict resolution; same merge rule as
    /// [`end_handoff`](Self::end_handoff).
    pub async fn resolve_conflict(&self, snapshot: BroadcasterSnapshot) {
        let _ = self
            .tx
            .send(BroadcasterCommand::ResolveConflict(snapshot))
            .await;
    }

    /// Cancel any pending timer and stop the stage.
    pub async fn die(&self) {
        let _ = self.tx.send(BroadcasterCommand::Die).await;
    }
}

/// A running scheduling pipeline.
pub struct Pipeline {
    pub registry: RegistryHandle,
    pub broadcaster: BroadcasterHandle,
    /// Stream of due jobs for the executor.
    pub executions: mpsc::Receiver<ExecuteEvent>,
    registry_task: JoinHandle<Result<()>>,
    broadcaster_task: JoinHandle<Result<()>>,
}

impl Pipeline {
    /// Spawn both stages and subscribe the broadcaster to the registry.
    ///
    /// `initial_jobs` seeds the catalog only when `storage` has never been
    /// written (a persisted catalog is authoritative).
    pub fn spawn(
        config: &SchedulerConfig,
        storage: Arc<dyn Storage>,
        initial_jobs: Vec<Job>,
    ) -> Result<Self> {
        let mailbox = config.channels.mailbox_capacity.max(1);
        let demand = config.channels.initial_demand.max(1);

        let (registry_tx, registry_rx) = mpsc::channel(mailbox);
        let (event_tx, event_rx) = mpsc::channel(demand);
        let (broadcaster_tx, broadcaster_rx) = mpsc::channel(mailbox);
        let (execute_tx, executions) = mpsc::channel(mailbox);

        let registry_handle = RegistryHandle::new(registry_tx);
        let registry = JobRegistry::new(registry_rx, event_tx, storage.clone(), initial_jobs)?;
        let broadcaster = ExecutionBroadcaster::new(
            broadcaster_rx,
            event_rx,
            execute_tx,
            registry_handle.clone(),
            storage,
            demand,
        )?;

        info!(scheduler = %config.name, "starting scheduling pipeline");
        let registry_task = spawn_stage("job registry", registry.run());
        let broadcaster_task = spawn_stage("execution broadcaster", broadcaster.run());

        Ok(Self {
            registry: registry_handle,
            broadcaster: BroadcasterHandle { tx: broadcaster_tx },
            executions,
            registry_task,
            broadcaster_task,
        })
    }

    /// Stop both stages and wait for their tasks to finish.
    ///
    /// Undelivered executions are discarded, not flushed — closing the
    /// output first also unblocks a broadcaster mid-send.
    pub async fn shutdown(self) {
        let Self {
            registry,
            broadcaster,
            executions,
            registry_task,
            broadcaster_task,
        } = self;
        drop(executions);
        broadcaster.die().await;
        registry.die().await;
        let _ = broadcaster_task.await;
        let _ = registry_task.await;
    }
}

fn spawn_stage(
    stage: &'static str,
    fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = fut.await;
        if let Err(e) = &result {
            error!(stage, error = %e, "pipeline stage stopped with error");
        }
        result
    })
}
