use crate::cache::{Cache, CacheObject, PathObject};
use crate::cert;
use crate::storage::{Accessor, AuthMetadata, TokenAuth, TokenTTL};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// Floor for the gap between auth attempts, so a short-lived token cannot
/// drive the scheduler into a hot loop.
const MIN_AUTH_INTERVAL_SECS: i64 = 5;
/// Retry cadence once a token is past the point where halving the time to
/// expiry makes sense (or the backend never told us the TTL).
const EXPIRED_RETRY_INTERVAL_SECS: i64 = 5 * 60;

/// The binding of one backend accessor to its refresh interval, auth
/// lifecycle, and the local cache produced by its last refresh.
pub struct Source {
    pub backend: Arc<dyn Accessor>,
    pub name: String,
    pub interval: Duration,
    state: Mutex<SourceState>,
}

struct SourceState {
    auth_status: RunInfo,
    refresh_status: RunInfo,
    auth_ttl: TokenTTL,
    auth_metadata: AuthMetadata,
    cache: Arc<Cache>,
}

#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    pub last_run: RunTiming,
    pub last_success: RunTiming,
    pub last_err: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunTiming {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PopulateStats {
    pub num_paths: usize,
    pub num_success: usize,
    pub num_certs: usize,
}

impl Source {
    pub fn new(backend: Arc<dyn Accessor>, interval: Duration) -> Self {
        let name = backend.name().to_string();
        Source {
            backend,
            name,
            interval,
            state: Mutex::new(SourceState {
                auth_status: RunInfo::default(),
                refresh_status: RunInfo::default(),
                auth_ttl: TokenTTL::Unknown,
                auth_metadata: AuthMetadata::None,
                cache: Arc::new(Cache::new()),
            }),
        }
    }

    /// Rebuilds this source's local cache and swaps the result into the
    /// global cache as one atomic diff. Single-path failures are counted
    /// against the stats but never abort the refresh.
    pub async fn refresh(&self, global: &Cache) -> crate::Result<PopulateStats> {
        let old = {
            let mut state = self.state.lock().await;
            state.refresh_status.last_run = RunTiming {
                started_at: Some(Utc::now()),
                finished_at: None,
            };
            state.cache.clone()
        };

        let result = self.populate().await;

        let mut state = self.state.lock().await;
        state.refresh_status.last_run.finished_at = Some(Utc::now());

        match result {
            Err(e) => {
                state.refresh_status.last_err = Some(e.to_string());
                Err(e)
            }
            Ok((new_cache, stats)) => {
                state.refresh_status.last_err = None;
                state.refresh_status.last_success = state.refresh_status.last_run;
                global.apply_diff(&old, &new_cache).await;
                state.cache = new_cache;
                Ok(stats)
            }
        }
    }

    async fn populate(&self) -> crate::Result<(Arc<Cache>, PopulateStats)> {
        let paths = self.backend.list().await?;
        let num_paths = paths.len();
        let new_cache = Arc::new(Cache::new());

        if num_paths == 0 {
            return Ok((new_cache, PopulateStats::default()));
        }

        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let num_fetchers = parallelism.saturating_sub(1).max(1).min(num_paths);

        let queue: StdMutex<VecDeque<String>> = StdMutex::new(paths.into_iter().collect());

        let fetchers = (0..num_fetchers).map(|_| self.fetch(&queue, &new_cache));
        let counts = futures::future::join_all(fetchers).await;

        let stats = PopulateStats {
            num_paths,
            num_success: counts.iter().map(|(success, _)| success).sum(),
            num_certs: counts.iter().map(|(_, certs)| certs).sum(),
        };

        Ok((new_cache, stats))
    }

    /// One fetcher: drains the shared path queue, extracting certificates
    /// from every subkey of every secret into the fresh local cache.
    async fn fetch(&self, queue: &StdMutex<VecDeque<String>>, cache: &Cache) -> (usize, usize) {
        let mut success_count = 0;
        let mut cert_count = 0;

        loop {
            let path = match queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            let Some(path) = path else {
                break;
            };

            let secret = match self.backend.get(&path).await {
                Ok(secret) => secret,
                Err(e) => {
                    tracing::debug!(
                        "Skipping path {} of `{}' after error: {}",
                        path,
                        self.name,
                        e
                    );
                    continue;
                }
            };

            for (subkey, value) in &secret {
                for found in cert::extract(value) {
                    let location = match &found.yaml_path {
                        Some(yaml_path) => format!("{}:{}:{}", path, subkey, yaml_path),
                        None => format!("{}:{}", path, subkey),
                    };

                    cert_count += 1;
                    cache
                        .merge(
                            &found.info.fingerprint,
                            CacheObject::from_cert(
                                &found.info,
                                PathObject {
                                    source: self.name.clone(),
                                    location,
                                },
                            ),
                        )
                        .await;
                }
            }

            success_count += 1;
        }

        (success_count, cert_count)
    }

    /// Acquires or renews the backend token, round-tripping the opaque
    /// metadata from the previous call.
    pub async fn auth(&self) -> crate::Result<()> {
        let metadata = {
            let mut state = self.state.lock().await;
            state.auth_status.last_run = RunTiming {
                started_at: Some(Utc::now()),
                finished_at: None,
            };
            state.auth_metadata.clone()
        };

        let result = self.backend.authenticate(&metadata).await;

        let mut state = self.state.lock().await;
        state.auth_status.last_run.finished_at = Some(Utc::now());

        match result {
            Ok(TokenAuth { ttl, metadata }) => {
                state.auth_status.last_err = None;
                state.auth_status.last_success = state.auth_status.last_run;
                state.auth_ttl = ttl;
                state.auth_metadata = metadata;
                Ok(())
            }
            Err(e) => {
                state.auth_status.last_err = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn calc_next_refresh(&self) -> DateTime<Utc> {
        let state = self.state.lock().await;
        state
            .refresh_status
            .last_run
            .finished_at
            .unwrap_or_else(Utc::now)
            + self.interval
    }

    /// The time of the next auth attempt. The second value is true when
    /// auth should never be scheduled again for this source.
    pub async fn calc_next_auth(&self) -> (DateTime<Utc>, bool) {
        let state = self.state.lock().await;
        let finished = state
            .auth_status
            .last_run
            .finished_at
            .unwrap_or_else(Utc::now);

        let ttl = match state.auth_ttl {
            TokenTTL::Infinite => return (Utc::now(), true),
            TokenTTL::Unknown => {
                return (
                    finished + Duration::seconds(EXPIRED_RETRY_INTERVAL_SECS),
                    false,
                )
            }
            TokenTTL::Expires(ttl) => Duration::from_std(ttl).unwrap_or(Duration::MAX),
        };

        let expiry = state
            .auth_status
            .last_success
            .started_at
            .unwrap_or_else(Utc::now)
            + ttl;

        let mut auth_interval = (expiry - finished) / 2;
        if auth_interval < Duration::seconds(MIN_AUTH_INTERVAL_SECS) {
            auth_interval = Duration::seconds(MIN_AUTH_INTERVAL_SECS);
        }

        let mut next_auth = finished + auth_interval;
        if next_auth > expiry {
            next_auth = finished + Duration::seconds(EXPIRED_RETRY_INTERVAL_SECS);
        }

        (next_auth, false)
    }

    /// The local cache produced by the most recent successful refresh.
    pub async fn cache(&self) -> Arc<Cache> {
        self.state.lock().await.cache.clone()
    }

    pub async fn refresh_status(&self) -> RunInfo {
        self.state.lock().await.refresh_status.clone()
    }

    pub async fn auth_status(&self) -> RunInfo {
        self.state.lock().await.auth_status.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::PathList;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory accessor for exercising the scheduling machinery without a
    /// network.
    pub(crate) struct MockAccessor {
        pub name: String,
        pub secrets: StdMutex<HashMap<String, HashMap<String, String>>>,
        pub ttl: StdMutex<TokenTTL>,
        pub auth_calls: AtomicUsize,
        pub fail_auth: bool,
    }

    impl MockAccessor {
        pub(crate) fn new(name: &str) -> Self {
            MockAccessor {
                name: name.to_string(),
                secrets: StdMutex::new(HashMap::new()),
                ttl: StdMutex::new(TokenTTL::Infinite),
                auth_calls: AtomicUsize::new(0),
                fail_auth: false,
            }
        }

        pub(crate) fn with_secret(self, path: &str, subkey: &str, value: &str) -> Self {
            self.secrets
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_default()
                .insert(subkey.to_string(), value.to_string());
            self
        }

        pub(crate) fn with_ttl(self, ttl: TokenTTL) -> Self {
            *self.ttl.lock().unwrap() = ttl;
            self
        }

        pub(crate) fn set_secrets(&self, secrets: HashMap<String, HashMap<String, String>>) {
            *self.secrets.lock().unwrap() = secrets;
        }
    }

    #[async_trait]
    impl Accessor for MockAccessor {
        fn name(&self) -> &str {
            &self.name
        }

        async fn authenticate(&self, _last: &AuthMetadata) -> crate::Result<TokenAuth> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_auth {
                return Err(crate::DoomsdayError::auth("mock credentials rejected"));
            }
            Ok(TokenAuth {
                ttl: *self.ttl.lock().unwrap(),
                metadata: AuthMetadata::None,
            })
        }

        async fn list(&self) -> crate::Result<PathList> {
            Ok(self.secrets.lock().unwrap().keys().cloned().collect())
        }

        async fn get(&self, path: &str) -> crate::Result<HashMap<String, String>> {
            Ok(self
                .secrets
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or_default())
        }
    }

    pub(crate) fn self_signed_pem(cn: &str) -> String {
        let mut params = rcgen::CertificateParams::new(vec![format!("{}.example.com", cn)]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        let key = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    #[tokio::test]
    async fn test_refresh_populates_global_cache() {
        let pem = self_signed_pem("one");
        let backend = Arc::new(MockAccessor::new("v").with_secret("a", "pem", &pem));
        let source = Source::new(backend, Duration::minutes(30));
        let global = Cache::new();

        let stats = source.refresh(&global).await.unwrap();
        assert_eq!(stats.num_paths, 1);
        assert_eq!(stats.num_success, 1);
        assert_eq!(stats.num_certs, 1);

        let map = global.map().await;
        assert_eq!(map.len(), 1);
        let object = map.values().next().unwrap();
        assert_eq!(object.common_name, "one");
        assert_eq!(object.paths.len(), 1);
        assert_eq!(object.paths[0].source, "v");
        assert_eq!(object.paths[0].location, "a:pem");

        let status = source.refresh_status().await;
        assert!(status.last_err.is_none());
        assert!(status.last_success.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_removal_shrinks_global_cache() {
        let pem = self_signed_pem("gone");
        let backend = Arc::new(MockAccessor::new("v").with_secret("a", "pem", &pem));
        let source = Source::new(backend.clone(), Duration::minutes(30));
        let global = Cache::new();

        source.refresh(&global).await.unwrap();
        assert_eq!(global.len().await, 1);

        backend.set_secrets(HashMap::new());
        source.refresh(&global).await.unwrap();
        assert!(global.is_empty().await);
    }

    #[tokio::test]
    async fn test_two_sources_same_cert_union_paths() {
        let pem = self_signed_pem("shared");
        let source1 = Source::new(
            Arc::new(MockAccessor::new("v1").with_secret("a", "pem", &pem)),
            Duration::minutes(30),
        );
        let source2 = Source::new(
            Arc::new(MockAccessor::new("v2").with_secret("b", "pem", &pem)),
            Duration::minutes(30),
        );
        let global = Cache::new();

        source1.refresh(&global).await.unwrap();
        source2.refresh(&global).await.unwrap();

        let map = global.map().await;
        assert_eq!(map.len(), 1);
        let object = map.values().next().unwrap();
        assert_eq!(
            object
                .paths
                .iter()
                .map(|p| (p.source.as_str(), p.location.as_str()))
                .collect::<Vec<_>>(),
            vec![("v1", "a:pem"), ("v2", "b:pem")]
        );
    }

    #[tokio::test]
    async fn test_yaml_wrapped_location_naming() {
        let pem = self_signed_pem("wrapped");
        let indented = pem
            .lines()
            .map(|l| format!("    {}", l))
            .collect::<Vec<_>>()
            .join("\n");
        let value = format!("foo:\n  bar: |\n{}", indented);

        let backend = Arc::new(MockAccessor::new("v").with_secret("a", "config", &value));
        let source = Source::new(backend, Duration::minutes(30));
        let global = Cache::new();

        source.refresh(&global).await.unwrap();

        let map = global.map().await;
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.values().next().unwrap().paths[0].location,
            "a:config:foo.bar"
        );
    }

    #[tokio::test]
    async fn test_failed_list_records_error() {
        struct BrokenAccessor;

        #[async_trait]
        impl Accessor for BrokenAccessor {
            fn name(&self) -> &str {
                "broken"
            }
            async fn authenticate(&self, _last: &AuthMetadata) -> crate::Result<TokenAuth> {
                Ok(TokenAuth {
                    ttl: TokenTTL::Infinite,
                    metadata: AuthMetadata::None,
                })
            }
            async fn list(&self) -> crate::Result<PathList> {
                Err(crate::DoomsdayError::backend("listing is broken"))
            }
            async fn get(&self, _path: &str) -> crate::Result<HashMap<String, String>> {
                Ok(HashMap::new())
            }
        }

        let source = Source::new(Arc::new(BrokenAccessor), Duration::minutes(30));
        let global = Cache::new();

        assert!(source.refresh(&global).await.is_err());
        let status = source.refresh_status().await;
        assert!(status.last_err.is_some());
        assert!(status.last_success.started_at.is_none());
        assert!(global.is_empty().await);
    }

    #[tokio::test]
    async fn test_calc_next_auth_infinite_skips() {
        let backend = Arc::new(MockAccessor::new("v").with_ttl(TokenTTL::Infinite));
        let source = Source::new(backend, Duration::minutes(30));
        source.auth().await.unwrap();

        let (_, skip) = source.calc_next_auth().await;
        assert!(skip);
    }

    #[tokio::test]
    async fn test_calc_next_auth_halves_time_to_expiry() {
        let backend = Arc::new(
            MockAccessor::new("v").with_ttl(TokenTTL::Expires(std::time::Duration::from_secs(
                20 * 60,
            ))),
        );
        let source = Source::new(backend, Duration::minutes(30));
        source.auth().await.unwrap();

        let (next, skip) = source.calc_next_auth().await;
        assert!(!skip);

        let status = source.auth_status().await;
        let finished = status.last_run.finished_at.unwrap();
        let offset = next - finished;
        // Roughly half of 20 minutes; auth itself took near zero time.
        assert!(offset > Duration::minutes(9) && offset < Duration::minutes(11));
    }

    #[tokio::test]
    async fn test_calc_next_auth_clamps_to_minimum() {
        let backend = Arc::new(
            MockAccessor::new("v").with_ttl(TokenTTL::Expires(std::time::Duration::from_secs(7))),
        );
        let source = Source::new(backend, Duration::minutes(30));
        source.auth().await.unwrap();

        let (next, skip) = source.calc_next_auth().await;
        assert!(!skip);

        let finished = source.auth_status().await.last_run.finished_at.unwrap();
        // Half of 7s is below the 5s floor, so the floor wins.
        assert_eq!(next - finished, Duration::seconds(MIN_AUTH_INTERVAL_SECS));
    }

    #[tokio::test]
    async fn test_calc_next_auth_past_expiry_backs_off() {
        let backend = Arc::new(
            MockAccessor::new("v").with_ttl(TokenTTL::Expires(std::time::Duration::from_secs(1))),
        );
        let source = Source::new(backend, Duration::minutes(30));
        source.auth().await.unwrap();

        // Make the clamped 5s interval overshoot the 1s expiry.
        let (next, skip) = source.calc_next_auth().await;
        assert!(!skip);

        let finished = source.auth_status().await.last_run.finished_at.unwrap();
        assert_eq!(
            next - finished,
            Duration::seconds(EXPIRED_RETRY_INTERVAL_SECS)
        );
    }

    #[tokio::test]
    async fn test_calc_next_auth_unknown_retries_periodically() {
        let backend = Arc::new(MockAccessor::new("v").with_ttl(TokenTTL::Unknown));
        let source = Source::new(backend, Duration::minutes(30));
        source.auth().await.unwrap();

        let (next, skip) = source.calc_next_auth().await;
        assert!(!skip);

        let finished = source.auth_status().await.last_run.finished_at.unwrap();
        assert_eq!(
            next - finished,
            Duration::seconds(EXPIRED_RETRY_INTERVAL_SECS)
        );
    }

    #[tokio::test]
    async fn test_failed_auth_records_error() {
        let mut backend = MockAccessor::new("v");
        backend.fail_auth = true;
        let source = Source::new(Arc::new(backend), Duration::minutes(30));

        assert!(source.auth().await.is_err());
        let status = source.auth_status().await;
        assert!(status.last_err.is_some());
        assert!(status.last_success.started_at.is_none());
    }

    #[tokio::test]
    async fn test_calc_next_refresh_is_finish_plus_interval() {
        let backend = Arc::new(MockAccessor::new("v"));
        let source = Source::new(backend, Duration::minutes(30));
        let global = Cache::new();
        source.refresh(&global).await.unwrap();

        let finished = source
            .refresh_status()
            .await
            .last_run
            .finished_at
            .unwrap();
        assert_eq!(
            source.calc_next_refresh().await,
            finished + Duration::minutes(30)
        );
    }
}
