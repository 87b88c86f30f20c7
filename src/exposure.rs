//! Fire-and-forget delivery of exposure and feedback side effects.
//!
//! Ranking must never wait on the behavior log or the policy store for bookkeeping writes, so
//! they go through a bounded queue drained by a background worker. The worker runs at most
//! `max_concurrent_deliveries` deliveries at once and retries each one with exponential backoff.
//! When the queue is full, or a task runs out of retries, the task is dropped and logged.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};

use crate::{
    bandit::ArmSnapshot,
    behavior::BehaviorEvent,
    config::{doubled, ExposureConfig},
    store::{BehaviorLog, PolicyStore},
    Error, JobId, Result, UserId,
};

/// A side effect queued on the [`ExposureDispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureTask {
    /// Append an event to the behavior log.
    Event(BehaviorEvent),
    /// Persist a freshly created arm unless the store already has one for this (user, job).
    RegisterArm {
        /// Owner of the arm.
        user_id: UserId,
        /// Job the arm belongs to.
        job_id: JobId,
        /// Initial arm state.
        arm: ArmSnapshot,
    },
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded background queue for [`ExposureTask`]s.
pub struct ExposureDispatcher {
    sender: mpsc::Sender<ExposureTask>,
    worker: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl ExposureDispatcher {
    /// Spawn the delivery worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<P, L>(
        policy_store: Arc<P>,
        behavior_log: Arc<L>,
        config: ExposureConfig,
    ) -> ExposureDispatcher
    where
        P: PolicyStore + Send + Sync + 'static,
        L: BehaviorLog + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(
            receiver,
            policy_store,
            behavior_log,
            config,
            counters.clone(),
        ));

        ExposureDispatcher {
            sender,
            worker,
            counters,
        }
    }

    /// Enqueue a task without waiting. Returns `false` if the task was dropped.
    pub fn dispatch(&self, task: ExposureTask) -> bool {
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(target: "jobrank", task:? = task; "exposure queue is full, dropping task");
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(target: "jobrank", task:? = task; "exposure queue is closed, dropping task");
                false
            }
        }
    }

    /// Tasks delivered successfully so far.
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Tasks dropped so far, either because the queue was full or because retries ran out.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting tasks and wait until every queued task has been delivered or dropped.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.sender);
        self.worker.await.map_err(|_| Error::DispatcherPanicked)
    }
}

async fn run_worker<P, L>(
    mut receiver: mpsc::Receiver<ExposureTask>,
    policy_store: Arc<P>,
    behavior_log: Arc<L>,
    config: ExposureConfig,
    counters: Arc<Counters>,
) where
    P: PolicyStore + Send + Sync + 'static,
    L: BehaviorLog + Send + Sync + 'static,
{
    let max_concurrent = config.max_concurrent_deliveries.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    while let Some(task) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            // The semaphore is never closed.
            break;
        };
        let policy_store = policy_store.clone();
        let behavior_log = behavior_log.clone();
        let config = config.clone();
        let counters = counters.clone();

        tokio::spawn(async move {
            if deliver_with_retry(&task, &*policy_store, &*behavior_log, &config).await {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            drop(permit);
        });
    }

    // Wait for in-flight deliveries by taking every permit back.
    let _ = semaphore.acquire_many(max_concurrent as u32).await;
    log::debug!(target: "jobrank", "exposure dispatcher drained");
}

async fn deliver_with_retry<P, L>(
    task: &ExposureTask,
    policy_store: &P,
    behavior_log: &L,
    config: &ExposureConfig,
) -> bool
where
    P: PolicyStore,
    L: BehaviorLog,
{
    let mut delay = config.retry_interval;
    let mut attempt = 0;
    loop {
        match deliver(task, policy_store, behavior_log).await {
            Ok(()) => return true,
            Err(err @ Error::InvalidInput(_)) => {
                log::warn!(target: "jobrank", task:? = task; "dropping invalid exposure task: {}", err);
                return false;
            }
            Err(err) if attempt < config.max_retries => {
                log::debug!(target: "jobrank", attempt; "exposure delivery failed, retrying: {}", err);
                tokio::time::sleep(delay).await;
                delay = doubled(delay, config.max_retry_delay);
                attempt += 1;
            }
            Err(err) => {
                log::warn!(target: "jobrank", task:? = task; "exposure delivery failed, dropping task: {}", err);
                return false;
            }
        }
    }
}

async fn deliver<P, L>(task: &ExposureTask, policy_store: &P, behavior_log: &L) -> Result<()>
where
    P: PolicyStore,
    L: BehaviorLog,
{
    match task {
        ExposureTask::Event(event) => {
            event.validate()?;
            let event_id = behavior_log.append_event(event.clone()).await?;
            log::trace!(target: "jobrank", event_id; "appended behavior event");
            Ok(())
        }
        ExposureTask::RegisterArm {
            user_id,
            job_id,
            arm,
        } => match policy_store.save_policy(user_id, job_id, arm, None).await {
            // Another request registered the arm first, which is just as good.
            Ok(_) | Err(Error::PersistenceConflict { .. }) => Ok(()),
            Err(err) => Err(err),
        },
    }
}
