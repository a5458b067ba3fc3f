use crate::cache::Cache;
use crate::config::Config;
use crate::scheduler::{ManagerTask, RunReason, TaskKind, TaskQueue};
use crate::source::Source;
use crate::storage;
use crate::types::{CacheItem, CacheItemPath, SchedulerResponse, SchedulerTask, SchedulerWorker};
use crate::worker::TaskWorker;
use chrono::{Duration, Utc};
use std::sync::Arc;

const NUM_WORKERS: usize = 4;

/// Top-level facade over the sources, the task queue, the worker pool, and
/// the global cache. Sources are created once from configuration and never
/// added or removed at runtime.
pub struct SourceManager {
    sources: Vec<Arc<Source>>,
    queue: TaskQueue,
    workers: Vec<Arc<TaskWorker>>,
    global: Arc<Cache>,
}

impl SourceManager {
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let mut sources = Vec::new();
        for backend_config in &config.backends {
            let accessor = storage::new_accessor(backend_config)?;
            sources.push(Arc::new(Source::new(
                accessor,
                Duration::minutes(backend_config.refresh_interval as i64),
            )));
        }
        Ok(Self::new(sources, NUM_WORKERS))
    }

    pub fn new(sources: Vec<Arc<Source>>, num_workers: usize) -> Self {
        let queue = TaskQueue::new();
        let global = Arc::new(Cache::new());
        let workers = (0..num_workers)
            .map(|id| Arc::new(TaskWorker::new(id, queue.clone(), global.clone())))
            .collect();

        SourceManager {
            sources,
            queue,
            workers,
            global,
        }
    }

    /// Bootstraps the scheduler: every source is authenticated up front
    /// (the first failure aborts startup), an immediate refresh is queued
    /// for each, auth renewal is queued where the token actually expires,
    /// and only then do the workers start consuming.
    pub async fn background_scheduler(&self) -> crate::Result<()> {
        for source in &self.sources {
            tracing::info!("Starting authentication for `{}'", source.name);
            source.auth().await.map_err(|e| {
                crate::DoomsdayError::auth(format!(
                    "Initial authentication of backend `{}' failed: {}",
                    source.name, e
                ))
            })?;
        }

        for source in &self.sources {
            self.queue
                .enqueue(
                    source.clone(),
                    TaskKind::Refresh,
                    Utc::now(),
                    RunReason::Scheduled,
                )
                .await;
        }

        for source in &self.sources {
            let (next_auth, skip) = source.calc_next_auth().await;
            if skip {
                tracing::info!("Skipping further scheduling of auth for `{}'", source.name);
                continue;
            }
            self.queue
                .enqueue(source.clone(), TaskKind::Auth, next_auth, RunReason::Scheduled)
                .await;
        }

        for worker in &self.workers {
            worker.clone().spawn();
        }

        Ok(())
    }

    /// Queues an immediate ad-hoc refresh of every source. Coalescing in
    /// the task queue turns a storm of these into at most one refresh per
    /// source.
    pub async fn refresh_all(&self) {
        for source in &self.sources {
            self.queue
                .enqueue(
                    source.clone(),
                    TaskKind::Refresh,
                    Utc::now(),
                    RunReason::Adhoc,
                )
                .await;
        }
    }

    /// The global cache projected into the API shape, ascending by expiry.
    pub async fn data(&self) -> Vec<CacheItem> {
        let mut items: Vec<CacheItem> = self
            .global
            .map()
            .await
            .into_values()
            .map(|object| CacheItem {
                common_name: object.common_name,
                not_after: object.not_after.timestamp(),
                not_before: object.not_before.timestamp(),
                paths: object
                    .paths
                    .into_iter()
                    .map(|path| CacheItemPath {
                        backend: path.source,
                        location: path.location,
                    })
                    .collect(),
            })
            .collect();

        items.sort_by_key(|item| item.not_after);
        items
    }

    pub async fn scheduler_state(&self) -> SchedulerResponse {
        let (running, pending) = self.queue.snapshot().await;

        let workers = self
            .workers
            .iter()
            .map(|worker| {
                let (state, state_at) = worker.state();
                SchedulerWorker {
                    id: worker.id,
                    state: state.to_string(),
                    state_at: state_at.timestamp(),
                }
            })
            .collect();

        SchedulerResponse {
            running: running.iter().map(task_to_wire).collect(),
            pending: pending.iter().map(task_to_wire).collect(),
            workers,
        }
    }
}

fn task_to_wire(task: &ManagerTask) -> SchedulerTask {
    SchedulerTask {
        id: task.id,
        at: task.run_at.timestamp(),
        backend: task.source.name.clone(),
        reason: task.reason.to_string(),
        kind: task.kind.to_string(),
        state: task.state.to_string(),
        worker: task.worker_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::MockAccessor;
    use std::time::Duration as StdDuration;

    fn pem_expiring(cn: &str, year: i32) -> String {
        let mut params =
            rcgen::CertificateParams::new(vec![format!("{}.example.com", cn)]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(year, 1, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn manager_with(sources: Vec<Arc<Source>>) -> SourceManager {
        SourceManager::new(sources, 2)
    }

    #[tokio::test]
    async fn test_initial_auth_failure_aborts_startup() {
        let mut backend = MockAccessor::new("broken");
        backend.fail_auth = true;
        let manager = manager_with(vec![Arc::new(Source::new(
            Arc::new(backend),
            Duration::minutes(30),
        ))]);

        assert!(manager.background_scheduler().await.is_err());
        let state = manager.scheduler_state().await;
        assert!(state.pending.is_empty());
        assert!(state.running.is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_refresh_and_data() {
        let sooner = pem_expiring("sooner", 2029);
        let later = pem_expiring("later", 2033);

        let manager = manager_with(vec![
            Arc::new(Source::new(
                Arc::new(MockAccessor::new("v1").with_secret("a", "pem", &later)),
                Duration::minutes(30),
            )),
            Arc::new(Source::new(
                Arc::new(MockAccessor::new("v2").with_secret("b", "pem", &sooner)),
                Duration::minutes(30),
            )),
        ]);

        manager.background_scheduler().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        let items = manager.data().await;
        assert_eq!(items.len(), 2);
        // Ascending by expiry.
        assert_eq!(items[0].common_name, "sooner");
        assert_eq!(items[1].common_name, "later");
        assert_eq!(
            items[0].paths,
            vec![crate::types::CacheItemPath {
                backend: "v2".to_string(),
                location: "b:pem".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_shared_cert_is_one_item_with_both_paths() {
        let shared = pem_expiring("shared", 2030);

        let manager = manager_with(vec![
            Arc::new(Source::new(
                Arc::new(MockAccessor::new("v1").with_secret("a", "pem", &shared)),
                Duration::minutes(30),
            )),
            Arc::new(Source::new(
                Arc::new(MockAccessor::new("v2").with_secret("b", "pem", &shared)),
                Duration::minutes(30),
            )),
        ]);

        manager.background_scheduler().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        let items = manager.data().await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0]
                .paths
                .iter()
                .map(|path| (path.backend.as_str(), path.location.as_str()))
                .collect::<Vec<_>>(),
            vec![("v1", "a:pem"), ("v2", "b:pem")]
        );
    }

    #[tokio::test]
    async fn test_refresh_all_enqueues_adhoc_tasks() {
        let manager = manager_with(vec![
            Arc::new(Source::new(
                Arc::new(MockAccessor::new("v1")),
                Duration::minutes(30),
            )),
            Arc::new(Source::new(
                Arc::new(MockAccessor::new("v2")),
                Duration::minutes(30),
            )),
        ]);

        // Workers are not started, so the tasks stay visible in pending.
        manager.refresh_all().await;

        let state = manager.scheduler_state().await;
        assert_eq!(state.pending.len(), 2);
        assert!(state
            .pending
            .iter()
            .all(|task| task.reason == "ad-hoc" && task.kind == "refresh"));
        assert_eq!(state.workers.len(), 2);
        assert!(state.workers.iter().all(|worker| worker.state == "idle"));
    }

    #[tokio::test]
    async fn test_infinite_ttl_sources_get_no_auth_task() {
        let manager = manager_with(vec![Arc::new(Source::new(
            Arc::new(MockAccessor::new("v1")),
            Duration::minutes(30),
        ))]);

        manager.background_scheduler().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        // The mock reports an infinite TTL, so after the initial refresh
        // cycle the only pending task is the next scheduled refresh.
        let state = manager.scheduler_state().await;
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending[0].kind, "refresh");
    }
}
