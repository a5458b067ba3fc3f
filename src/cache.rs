use crate::cert::CertInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One place a certificate was seen: the configured backend name and the
/// backend-specific location string. Ordered by source, then location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathObject {
    pub source: String,
    pub location: String,
}

/// The value stored per fingerprint. Everything but `paths` comes from the
/// certificate itself and is identical no matter which backend supplied it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheObject {
    pub common_name: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<String>,
    /// Sorted, duplicate-free.
    pub paths: Vec<PathObject>,
}

impl CacheObject {
    pub fn from_cert(info: &CertInfo, path: PathObject) -> Self {
        CacheObject {
            common_name: info.common_name.clone(),
            not_before: info.not_before,
            not_after: info.not_after,
            dns_names: info.dns_names.clone(),
            ip_addresses: info.ip_addresses.clone(),
            paths: vec![path],
        }
    }
}

/// Fingerprint-keyed certificate map. The same type backs both the
/// per-source local caches (paths from exactly one backend, rebuilt on every
/// refresh) and the process-wide global cache (paths across all backends,
/// mutated only through `apply_diff`).
#[derive(Debug, Default)]
pub struct Cache {
    store: RwLock<HashMap<String, CacheObject>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the object, or unions its paths into the existing entry.
    /// Concurrent fetchers within one refresh funnel through here.
    pub async fn merge(&self, fingerprint: &str, mut object: CacheObject) {
        object.paths.sort();
        object.paths.dedup();

        let mut store = self.store.write().await;
        match store.get_mut(fingerprint) {
            Some(existing) => merge_paths(&mut existing.paths, &object.paths),
            None => {
                store.insert(fingerprint.to_string(), object);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }

    /// Snapshot of the full map, taken under the read lock.
    pub async fn map(&self) -> HashMap<String, CacheObject> {
        self.store.read().await.clone()
    }

    /// Replaces one source's previous contribution (`old`) with its freshly
    /// computed one (`new`). Runs entirely under one write lock so readers
    /// see either the pre-diff or post-diff view, never a partial one.
    pub async fn apply_diff(&self, old: &Cache, new: &Cache) {
        let old_store = old.store.read().await;
        let new_store = new.store.read().await;
        let mut store = self.store.write().await;

        for (fingerprint, old_obj) in old_store.iter() {
            match new_store.get(fingerprint) {
                // Gone from the backend entirely: drop its paths, and the
                // whole entry once no path anywhere refers to it.
                None => {
                    let emptied = match store.get_mut(fingerprint) {
                        Some(entry) => {
                            remove_paths(&mut entry.paths, &old_obj.paths);
                            entry.paths.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        store.remove(fingerprint);
                    }
                }
                Some(new_obj) => {
                    let (to_delete, to_add) = path_list_diff(&old_obj.paths, &new_obj.paths);
                    let emptied = match store.get_mut(fingerprint) {
                        Some(entry) => {
                            remove_paths(&mut entry.paths, &to_delete);
                            merge_paths(&mut entry.paths, &to_add);
                            entry.paths.is_empty()
                        }
                        None => {
                            store.insert(fingerprint.clone(), new_obj.clone());
                            false
                        }
                    };
                    if emptied {
                        store.remove(fingerprint);
                    }
                }
            }
        }

        for (fingerprint, new_obj) in new_store.iter() {
            if old_store.contains_key(fingerprint) {
                continue;
            }
            match store.get_mut(fingerprint) {
                Some(entry) => merge_paths(&mut entry.paths, &new_obj.paths),
                None => {
                    store.insert(fingerprint.clone(), new_obj.clone());
                }
            }
        }
    }
}

/// Merge-diff over two sorted path slices: what must be deleted from `old`
/// and added to it to arrive at `new`.
pub fn path_list_diff(
    old: &[PathObject],
    new: &[PathObject],
) -> (Vec<PathObject>, Vec<PathObject>) {
    let mut to_delete = Vec::new();
    let mut to_add = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            Ordering::Less => {
                to_delete.push(old[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                to_add.push(new[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }

    to_delete.extend(old[i..].iter().cloned());
    to_add.extend(new[j..].iter().cloned());
    (to_delete, to_add)
}

fn merge_paths(dst: &mut Vec<PathObject>, add: &[PathObject]) {
    dst.extend(add.iter().cloned());
    dst.sort();
    dst.dedup();
}

fn remove_paths(dst: &mut Vec<PathObject>, del: &[PathObject]) {
    dst.retain(|p| del.binary_search(p).is_err());
}
