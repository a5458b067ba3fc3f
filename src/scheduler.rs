use crate::source::Source;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Auth,
    Refresh,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Auth => write!(f, "auth"),
            TaskKind::Refresh => write!(f, "refresh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    Scheduled,
    Adhoc,
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReason::Scheduled => write!(f, "scheduled"),
            RunReason::Adhoc => write!(f, "ad-hoc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Skip,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Skip => write!(f, "skip"),
        }
    }
}

/// One scheduled unit of work against one source. Tasks are created by
/// `enqueue` and destroyed when a worker pops them; scheduled tasks are
/// re-created for the next cycle after they run.
#[derive(Clone)]
pub struct ManagerTask {
    pub id: u64,
    pub kind: TaskKind,
    pub source: Arc<Source>,
    pub run_at: DateTime<Utc>,
    pub reason: RunReason,
    pub state: TaskState,
    pub worker_id: Option<usize>,
}

/// Priority queue of auth/refresh tasks, shared by cloning. A sorted vector
/// under one lock is plenty here; the number of backends is single-digit
/// and clarity beats asymptotics.
#[derive(Clone, Default)]
pub struct TaskQueue {
    shared: Arc<QueueShared>,
}

#[derive(Default)]
struct QueueShared {
    inner: Mutex<QueueInner>,
    ready: Notify,
}

#[derive(Default)]
struct QueueInner {
    pending: Vec<ManagerTask>,
    running: Vec<ManagerTask>,
    next_id: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task and arms a timer that flips it to ready (or skip, if
    /// an equivalent task is already ready or running) at `run_at`.
    pub async fn enqueue(
        &self,
        source: Arc<Source>,
        kind: TaskKind,
        run_at: DateTime<Utc>,
        reason: RunReason,
    ) {
        let id = {
            let mut inner = self.shared.inner.lock().await;
            let id = inner.next_id;
            inner.next_id += 1;

            inner.pending.push(ManagerTask {
                id,
                kind,
                source,
                run_at,
                reason,
                state: TaskState::Pending,
                worker_id: None,
            });
            sort_tasks(&mut inner.pending);
            id
        };

        let queue = self.clone();
        tokio::spawn(async move {
            let delay = (run_at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(delay).await;
            queue.mark_ready(id).await;
        });
    }

    /// Timer callback: marks the task ready unless an equivalent
    /// `(source, kind)` task is already ready in pending or held by a
    /// worker, in which case this one coalesces into a skip. A task that
    /// was dequeued before its timer fired is ignored.
    pub(crate) async fn mark_ready(&self, id: u64) {
        let mut inner = self.shared.inner.lock().await;

        let Some(pos) = inner.pending.iter().position(|task| task.id == id) else {
            return;
        };

        let source = inner.pending[pos].source.clone();
        let kind = inner.pending[pos].kind;

        let duplicate_ready = inner
            .pending
            .iter()
            .any(|task| {
                task.id != id
                    && task.state == TaskState::Ready
                    && task.kind == kind
                    && Arc::ptr_eq(&task.source, &source)
            })
            || inner
                .running
                .iter()
                .any(|task| task.kind == kind && Arc::ptr_eq(&task.source, &source));

        inner.pending[pos].state = if duplicate_ready {
            TaskState::Skip
        } else {
            TaskState::Ready
        };
        sort_tasks(&mut inner.pending);
        drop(inner);

        self.shared.ready.notify_waiters();
    }

    /// Blocks until the head of the queue is runnable, then pops it. A
    /// popped skip task is returned as-is for the worker to discard;
    /// anything else is moved to the running set first.
    pub async fn dequeue(&self, worker_id: usize) -> ManagerTask {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.inner.lock().await;
                let runnable = inner
                    .pending
                    .first()
                    .map(|task| task.state != TaskState::Pending)
                    .unwrap_or(false);

                if runnable {
                    let mut task = inner.pending.remove(0);
                    if task.state == TaskState::Skip {
                        return task;
                    }
                    task.worker_id = Some(worker_id);
                    inner.running.push(task.clone());
                    return task;
                }
            }

            notified.await;
        }
    }

    /// Called by a worker when it exits the task body.
    pub async fn complete(&self, id: u64) {
        let mut inner = self.shared.inner.lock().await;
        inner.running.retain(|task| task.id != id);
    }

    /// Copies of the running and pending sets, taken under the queue lock.
    pub async fn snapshot(&self) -> (Vec<ManagerTask>, Vec<ManagerTask>) {
        let inner = self.shared.inner.lock().await;
        (inner.running.clone(), inner.pending.clone())
    }
}

/// Stable order: skip > ready > pending, auth before refresh, then earlier
/// run time, then smaller id. Skips float to the front so they drain before
/// real work is handed out.
fn sort_tasks(tasks: &mut [ManagerTask]) {
    fn state_rank(state: TaskState) -> u8 {
        match state {
            TaskState::Skip => 0,
            TaskState::Ready => 1,
            TaskState::Pending => 2,
        }
    }

    fn kind_rank(kind: TaskKind) -> u8 {
        match kind {
            TaskKind::Auth => 0,
            TaskKind::Refresh => 1,
        }
    }

    tasks.sort_by_key(|task| (state_rank(task.state), kind_rank(task.kind), task.run_at, task.id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::MockAccessor;
    use chrono::Duration;

    fn source(name: &str) -> Arc<Source> {
        Arc::new(Source::new(
            Arc::new(MockAccessor::new(name)),
            Duration::minutes(30),
        ))
    }

    fn far_future() -> DateTime<Utc> {
        Utc::now() + Duration::hours(1)
    }

    #[tokio::test]
    async fn test_dequeue_blocks_while_head_pending() {
        let queue = TaskQueue::new();
        queue
            .enqueue(source("v"), TaskKind::Refresh, far_future(), RunReason::Scheduled)
            .await;

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(50), queue.dequeue(0))
                .await
                .is_err();
        assert!(timed_out);
    }

    #[tokio::test]
    async fn test_mark_ready_unblocks_dequeue() {
        let queue = TaskQueue::new();
        queue
            .enqueue(source("v"), TaskKind::Refresh, far_future(), RunReason::Scheduled)
            .await;
        queue.mark_ready(0).await;

        let task = queue.dequeue(3).await;
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.worker_id, Some(3));

        let (running, pending) = queue.snapshot().await;
        assert_eq!(running.len(), 1);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_coalesces_same_source_and_kind() {
        let queue = TaskQueue::new();
        let src = source("v");
        queue
            .enqueue(src.clone(), TaskKind::Refresh, far_future(), RunReason::Scheduled)
            .await;
        queue
            .enqueue(src.clone(), TaskKind::Refresh, far_future(), RunReason::Adhoc)
            .await;

        // The second timer fires while the first task is still ready in
        // pending: the newcomer coalesces into a skip.
        queue.mark_ready(0).await;
        queue.mark_ready(1).await;

        // Skips float to the front and drain first.
        let skipped = queue.dequeue(0).await;
        assert_eq!(skipped.id, 1);
        assert_eq!(skipped.state, TaskState::Skip);

        let real = queue.dequeue(0).await;
        assert_eq!(real.id, 0);
        assert_eq!(real.state, TaskState::Ready);
    }

    #[tokio::test]
    async fn test_coalesces_against_running_task() {
        let queue = TaskQueue::new();
        let src = source("v");
        queue
            .enqueue(src.clone(), TaskKind::Refresh, far_future(), RunReason::Scheduled)
            .await;
        queue.mark_ready(0).await;
        let running = queue.dequeue(0).await;
        assert_eq!(running.state, TaskState::Ready);

        queue
            .enqueue(src.clone(), TaskKind::Refresh, far_future(), RunReason::Adhoc)
            .await;
        queue.mark_ready(1).await;

        let task = queue.dequeue(1).await;
        assert_eq!(task.state, TaskState::Skip);
    }

    #[tokio::test]
    async fn test_no_coalescing_across_kinds_or_sources() {
        let queue = TaskQueue::new();
        let src_a = source("a");
        let src_b = source("b");
        queue
            .enqueue(src_a.clone(), TaskKind::Refresh, far_future(), RunReason::Scheduled)
            .await;
        queue
            .enqueue(src_a.clone(), TaskKind::Auth, far_future(), RunReason::Scheduled)
            .await;
        queue
            .enqueue(src_b, TaskKind::Refresh, far_future(), RunReason::Scheduled)
            .await;

        queue.mark_ready(0).await;
        queue.mark_ready(1).await;
        queue.mark_ready(2).await;

        let states: Vec<TaskState> = vec![
            queue.dequeue(0).await.state,
            queue.dequeue(0).await.state,
            queue.dequeue(0).await.state,
        ];
        assert!(states.iter().all(|state| *state == TaskState::Ready));
    }

    #[tokio::test]
    async fn test_ready_auth_sorts_before_ready_refresh() {
        let queue = TaskQueue::new();
        let src = source("v");
        queue
            .enqueue(src.clone(), TaskKind::Refresh, far_future(), RunReason::Scheduled)
            .await;
        queue
            .enqueue(src.clone(), TaskKind::Auth, far_future(), RunReason::Scheduled)
            .await;

        queue.mark_ready(0).await;
        queue.mark_ready(1).await;

        assert_eq!(queue.dequeue(0).await.kind, TaskKind::Auth);
        assert_eq!(queue.dequeue(0).await.kind, TaskKind::Refresh);
    }

    #[tokio::test]
    async fn test_complete_removes_from_running() {
        let queue = TaskQueue::new();
        queue
            .enqueue(source("v"), TaskKind::Refresh, far_future(), RunReason::Scheduled)
            .await;
        queue.mark_ready(0).await;
        let task = queue.dequeue(0).await;

        queue.complete(task.id).await;
        let (running, _) = queue.snapshot().await;
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_timer_fires_for_past_run_time() {
        let queue = TaskQueue::new();
        queue
            .enqueue(source("v"), TaskKind::Refresh, Utc::now(), RunReason::Scheduled)
            .await;

        let task = tokio::time::timeout(std::time::Duration::from_secs(1), queue.dequeue(0))
            .await
            .expect("timer should have marked the task ready");
        assert_eq!(task.state, TaskState::Ready);
    }
}
