use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

/// One deduplicated certificate as served by `GET /v1/cache`. Timestamps
/// are unix seconds; `paths` is every place the cert was seen, sorted by
/// backend then location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem {
    pub common_name: String,
    pub not_after: i64,
    pub not_before: i64,
    pub paths: Vec<CacheItemPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheItemPath {
    pub backend: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheResponse {
    pub content: Vec<CacheItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub version: String,
    pub auth_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerTask {
    pub id: u64,
    pub at: i64,
    pub backend: String,
    pub reason: String,
    pub kind: String,
    pub state: String,
    pub worker: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerWorker {
    pub id: usize,
    pub state: String,
    pub state_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerResponse {
    pub running: Vec<SchedulerTask>,
    pub pending: Vec<SchedulerTask>,
    pub workers: Vec<SchedulerWorker>,
}

/// Client-side window over a `not_after`-ascending item list. `beyond`
/// advances the lower bound past everything expiring sooner; `within`
/// truncates everything expiring later.
#[derive(Debug, Clone, Default)]
pub struct CacheFilter {
    pub beyond: Option<Duration>,
    pub within: Option<Duration>,
}

impl CacheFilter {
    pub fn apply(&self, items: Vec<CacheItem>) -> Vec<CacheItem> {
        let now = Utc::now().timestamp();
        let mut start = 0;
        let mut end = items.len();

        if let Some(beyond) = self.beyond {
            let bound = now + beyond.num_seconds();
            start = items.partition_point(|item| item.not_after <= bound);
        }

        if let Some(within) = self.within {
            let bound = now + within.num_seconds();
            end = items.partition_point(|item| item.not_after <= bound);
        }

        if start >= end {
            return Vec::new();
        }
        items[start..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(cn: &str, expires_in: Duration) -> CacheItem {
        let not_after = Utc::now() + expires_in;
        CacheItem {
            common_name: cn.to_string(),
            not_after: not_after.timestamp(),
            not_before: (not_after - Duration::days(365)).timestamp(),
            paths: vec![],
        }
    }

    fn names(items: &[CacheItem]) -> Vec<&str> {
        items.iter().map(|item| item.common_name.as_str()).collect()
    }

    fn sorted_items() -> Vec<CacheItem> {
        vec![
            item("soon", Duration::days(1)),
            item("month", Duration::days(30)),
            item("year", Duration::days(365)),
        ]
    }

    #[test]
    fn test_no_filter_passes_everything() {
        let filtered = CacheFilter::default().apply(sorted_items());
        assert_eq!(names(&filtered), vec!["soon", "month", "year"]);
    }

    #[test]
    fn test_beyond_advances_lower_bound() {
        let filter = CacheFilter {
            beyond: Some(Duration::days(7)),
            within: None,
        };
        assert_eq!(names(&filter.apply(sorted_items())), vec!["month", "year"]);
    }

    #[test]
    fn test_within_truncates() {
        let filter = CacheFilter {
            beyond: None,
            within: Some(Duration::days(60)),
        };
        assert_eq!(names(&filter.apply(sorted_items())), vec!["soon", "month"]);
    }

    #[test]
    fn test_beyond_and_within_window() {
        let filter = CacheFilter {
            beyond: Some(Duration::days(7)),
            within: Some(Duration::days(60)),
        };
        assert_eq!(names(&filter.apply(sorted_items())), vec!["month"]);
    }

    #[test]
    fn test_empty_window() {
        let filter = CacheFilter {
            beyond: Some(Duration::days(60)),
            within: Some(Duration::days(7)),
        };
        assert!(filter.apply(sorted_items()).is_empty());
    }
}
