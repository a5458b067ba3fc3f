use crate::cache::Cache;
use crate::scheduler::{ManagerTask, RunReason, TaskKind, TaskQueue, TaskState};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Scheduling,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Scheduling => write!(f, "scheduling"),
        }
    }
}

/// One member of the pool. Loops forever: dequeue, run (unless the task
/// coalesced into a skip), schedule the task's next cycle.
pub struct TaskWorker {
    pub id: usize,
    queue: TaskQueue,
    global: Arc<Cache>,
    // Leaf lock. Taking the queue lock while holding this is not allowed;
    // the reverse order is fine.
    state: RwLock<(WorkerState, DateTime<Utc>)>,
}

impl TaskWorker {
    pub fn new(id: usize, queue: TaskQueue, global: Arc<Cache>) -> Self {
        TaskWorker {
            id,
            queue,
            global,
            state: RwLock::new((WorkerState::Idle, Utc::now())),
        }
    }

    /// The worker's current state and when it entered it.
    pub fn state(&self) -> (WorkerState, DateTime<Utc>) {
        self.state
            .read()
            .map(|guard| *guard)
            .unwrap_or((WorkerState::Idle, Utc::now()))
    }

    fn set_state(&self, state: WorkerState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = (state, Utc::now());
        }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                self.run_once().await;
            }
        });
    }

    async fn run_once(&self) {
        let task = self.queue.dequeue(self.id).await;

        if task.state == TaskState::Skip {
            tracing::info!(
                "Worker {} skipping {} {} of `{}'",
                self.id,
                task.reason,
                task.kind,
                task.source.name
            );
        } else {
            self.set_state(WorkerState::Running);
            tracing::info!(
                "Worker {} running {} {} of `{}'",
                self.id,
                task.reason,
                task.kind,
                task.source.name
            );

            self.run_task(&task).await;

            self.set_state(WorkerState::Scheduling);
            self.queue.complete(task.id).await;
        }

        self.schedule_next_run(&task).await;
        self.set_state(WorkerState::Idle);
    }

    async fn run_task(&self, task: &ManagerTask) {
        let started = Instant::now();
        match task.kind {
            TaskKind::Refresh => match task.source.refresh(&self.global).await {
                Ok(stats) => tracing::info!(
                    "Finished {} refresh of `{}' after {:?}. {}/{} paths searched. {} certs found",
                    task.reason,
                    task.source.name,
                    started.elapsed(),
                    stats.num_success,
                    stats.num_paths,
                    stats.num_certs
                ),
                Err(e) => {
                    tracing::error!(
                        "Error refreshing from backend `{}': {}",
                        task.source.name,
                        e
                    );
                    // A refresh that died on a stale token gets the token
                    // fixed right away instead of waiting for the next
                    // scheduled auth; coalescing absorbs any pile-up.
                    if e.is_auth_expired() {
                        self.queue
                            .enqueue(
                                task.source.clone(),
                                TaskKind::Auth,
                                Utc::now(),
                                RunReason::Adhoc,
                            )
                            .await;
                    }
                }
            },
            TaskKind::Auth => match task.source.auth().await {
                Ok(()) => tracing::info!(
                    "Finished auth for `{}' after {:?}",
                    task.source.name,
                    started.elapsed()
                ),
                Err(e) => {
                    tracing::error!("Failed auth for `{}': {}", task.source.name, e)
                }
            },
        }
    }

    /// Re-enqueues the next cycle of a scheduled task. Ad-hoc tasks are
    /// one-shot, and a source whose token never expires gets no further
    /// auth tasks at all. Skipped scheduled tasks still reschedule, so a
    /// coalesced skip never ends a source's periodic chain.
    async fn schedule_next_run(&self, task: &ManagerTask) {
        if task.reason == RunReason::Adhoc {
            return;
        }

        let (next, skip_sched) = match task.kind {
            TaskKind::Auth => task.source.calc_next_auth().await,
            TaskKind::Refresh => (task.source.calc_next_refresh().await, false),
        };

        if skip_sched {
            tracing::info!(
                "Skipping further scheduling of {} for `{}'",
                task.kind,
                task.source.name
            );
            return;
        }

        self.queue
            .enqueue(task.source.clone(), task.kind, next, RunReason::Scheduled)
            .await;
    }
}
