//! Result Cache (C7, spec.md §4.7).
//!
//! Keyed on `(prefix, datasource, sql, sorted params)`. A shared back-end, if
//! configured, is authoritative and consulted first; the process-local map is
//! always written through regardless, so a cold shared cache degrades to
//! local-only rather than to no caching at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::sql::where_planner::BoundParam;

/// A cached query result: column names plus row-major values.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Prefix for an ordinary data query's cache entries.
pub const DATA_PREFIX: &str = "q";
/// Prefix for a `SELECT COUNT(*) FROM (inner)` total-row-count entry (spec.md
/// §4.7: counts are cached separately from the page they total).
pub const COUNT_PREFIX: &str = "c";

/// A pluggable shared cache back-end (e.g. a redis-compatible store). No
/// implementation ships in this crate; callers wire one in when available.
#[async_trait]
pub trait SharedCacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResult>>;
    async fn put(&self, key: &str, value: &CachedResult, ttl: Duration) -> Result<()>;
}

struct LocalEntry {
    value: CachedResult,
    expires_at: Instant,
}

pub struct ResultCache {
    ttl: Duration,
    local: Mutex<HashMap<String, LocalEntry>>,
    shared: Option<Arc<dyn SharedCacheBackend>>,
    key_prefix: String,
}

impl ResultCache {
    pub fn new(ttl: Duration, key_prefix: impl Into<String>) -> Self {
        ResultCache {
            ttl,
            local: Mutex::new(HashMap::new()),
            shared: None,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn with_shared_backend(mut self, backend: Arc<dyn SharedCacheBackend>) -> Self {
        self.shared = Some(backend);
        self
    }

    /// Build the cache key for a query. `params` is sorted by name so that
    /// equivalent bindings in different orders hash identically.
    pub fn key(&self, prefix: &str, datasource_id: &str, sql: &str, params: &[BoundParam]) -> String {
        let mut sorted: Vec<&BoundParam> = params.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let params_repr: String = sorted
            .iter()
            .map(|p| format!("{}={}", p.name, serde_json::to_string(&p.value).unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}|{}|{}|{}|{}", self.key_prefix, prefix, datasource_id, sql, params_repr)
    }

    /// Look up `key`, consulting the shared back-end first when configured.
    pub async fn get(&self, key: &str) -> Result<Option<CachedResult>> {
        if let Some(shared) = &self.shared {
            if let Some(hit) = shared.get(key).await? {
                self.write_local(key, hit.clone());
                return Ok(Some(hit));
            }
        }
        Ok(self.get_local(key))
    }

    /// Write `value` through to both the shared back-end (if any) and the
    /// local map.
    pub async fn put(&self, key: &str, value: CachedResult) -> Result<()> {
        if let Some(shared) = &self.shared {
            shared.put(key, &value, self.ttl).await?;
        }
        self.write_local(key, value);
        Ok(())
    }

    fn get_local(&self, key: &str) -> Option<CachedResult> {
        let mut local = self.local.lock();
        match local.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                local.remove(key);
                None
            }
            None => None,
        }
    }

    fn write_local(&self, key: &str, value: CachedResult) {
        self.local.lock().insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop expired entries from the local map. Callers may run this
    /// periodically; it is never required for correctness since `get_local`
    /// already treats expired entries as absent.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.local.lock().retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CachedResult {
        CachedResult {
            columns: vec!["x".to_string(), "value".to_string()],
            rows: vec![vec![Value::String("a".into()), Value::from(1)]],
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_local() {
        let cache = ResultCache::new(Duration::from_secs(5), "qh");
        let key = cache.key(DATA_PREFIX, "ds1", "SELECT 1", &[]);
        cache.put(&key, sample()).await.unwrap();
        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit, Some(sample()));
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_miss() {
        let cache = ResultCache::new(Duration::from_millis(1), "qh");
        let key = cache.key(DATA_PREFIX, "ds1", "SELECT 1", &[]);
        cache.put(&key, sample()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[test]
    fn key_is_order_independent_over_params() {
        let cache = ResultCache::new(Duration::from_secs(5), "qh");
        let a = vec![
            BoundParam { name: "b".to_string(), value: crate::model::FilterValue::Number(2.0) },
            BoundParam { name: "a".to_string(), value: crate::model::FilterValue::Number(1.0) },
        ];
        let b = vec![
            BoundParam { name: "a".to_string(), value: crate::model::FilterValue::Number(1.0) },
            BoundParam { name: "b".to_string(), value: crate::model::FilterValue::Number(2.0) },
        ];
        assert_eq!(
            cache.key(DATA_PREFIX, "ds1", "SELECT 1", &a),
            cache.key(DATA_PREFIX, "ds1", "SELECT 1", &b)
        );
    }

    #[test]
    fn count_and_data_prefixes_produce_distinct_keys() {
        let cache = ResultCache::new(Duration::from_secs(5), "qh");
        assert_ne!(
            cache.key(DATA_PREFIX, "ds1", "SELECT 1", &[]),
            cache.key(COUNT_PREFIX, "ds1", "SELECT 1", &[])
        );
    }
}
