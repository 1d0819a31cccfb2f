//! In-memory `MetadataStore`, grounded in `rowanfr-gluon-salsa`'s
//! `parking_lot::Mutex`-guarded incremental-computation state. Used by unit
//! tests and as a local-dev fallback when no Postgres catalog is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::model::{Datasource, SyncLock, SyncRun, SyncState, SyncTask};

use super::{MetadataStore, StoreTransaction};

#[derive(Default)]
struct Inner {
    datasources: HashMap<String, Datasource>,
    tasks: HashMap<String, SyncTask>,
    states: HashMap<String, SyncState>,
    runs: HashMap<String, Vec<SyncRun>>,
    locks: HashMap<String, SyncLock>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { inner: RwLock::new(Inner::default()) }
    }

    pub fn put_datasource(&self, ds: Datasource) {
        self.inner.write().datasources.insert(ds.id.clone(), ds);
    }

    pub fn put_task(&self, task: SyncTask) {
        self.inner.write().tasks.insert(task.id.clone(), task);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_datasource(&self, id: &str) -> Result<Option<Datasource>> {
        Ok(self.inner.read().datasources.get(id).cloned())
    }

    async fn list_datasources(&self) -> Result<Vec<Datasource>> {
        Ok(self.inner.read().datasources.values().cloned().collect())
    }

    async fn get_task(&self, id: &str) -> Result<Option<SyncTask>> {
        Ok(self.inner.read().tasks.get(id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<SyncTask>> {
        Ok(self.inner.read().tasks.values().cloned().collect())
    }

    async fn list_tasks_by_group(&self, group_key: &str) -> Result<Vec<SyncTask>> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.group_key == group_key)
            .cloned()
            .collect())
    }

    async fn get_sync_state(&self, task_id: &str) -> Result<Option<SyncState>> {
        Ok(self.inner.read().states.get(task_id).cloned())
    }

    async fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.inner
            .write()
            .states
            .insert(state.task_id.clone(), state.clone());
        Ok(())
    }

    async fn list_stuck_states(&self, stale_after: chrono::Duration) -> Result<Vec<SyncState>> {
        let now = chrono::Utc::now();
        Ok(self
            .inner
            .read()
            .states
            .values()
            .filter(|s| {
                s.in_progress
                    && s.started_at
                        .map(|t| now - t > stale_after)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn record_run(&self, run: &SyncRun) -> Result<()> {
        self.inner
            .write()
            .runs
            .entry(run.task_id.clone())
            .or_default()
            .push(run.clone());
        Ok(())
    }

    async fn list_runs(&self, task_id: &str, limit: u32) -> Result<Vec<SyncRun>> {
        let inner = self.inner.read();
        let mut runs = inner.runs.get(task_id).cloned().unwrap_or_default();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn try_acquire_lock(&self, group_key: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.locks.contains_key(group_key) {
            return Ok(false);
        }
        inner.locks.insert(
            group_key.to_string(),
            SyncLock { group_key: group_key.to_string(), acquired_at: chrono::Utc::now() },
        );
        Ok(true)
    }

    async fn release_lock(&self, group_key: &str) -> Result<()> {
        self.inner.write().locks.remove(group_key);
        Ok(())
    }

    async fn get_lock(&self, group_key: &str) -> Result<Option<SyncLock>> {
        Ok(self.inner.read().locks.get(group_key).cloned())
    }

    async fn force_release_lock(&self, group_key: &str) -> Result<()> {
        self.inner.write().locks.remove(group_key);
        Ok(())
    }

    async fn with_transaction<'a>(
        &'a self,
        f: Box<dyn for<'t> FnOnce(&'t mut dyn StoreTransaction) -> super::TxnFuture<'t> + Send + 'a>,
    ) -> Result<()> {
        let mut txn = MemoryTransaction { store: self };
        f(&mut txn).await
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
}

#[async_trait]
impl<'a> StoreTransaction for MemoryTransaction<'a> {
    async fn load_sync_state(&mut self, task_id: &str) -> Result<Option<SyncState>> {
        Ok(self.store.inner.read().states.get(task_id).cloned())
    }

    async fn save_sync_state(&mut self, state: &SyncState) -> Result<()> {
        self.store
            .inner
            .write()
            .states
            .insert(state.task_id.clone(), state.clone());
        Ok(())
    }

    async fn acquire_lock(&mut self, group_key: &str) -> Result<bool> {
        let mut inner = self.store.inner.write();
        if inner.locks.contains_key(group_key) {
            return Ok(false);
        }
        inner.locks.insert(
            group_key.to_string(),
            SyncLock { group_key: group_key.to_string(), acquired_at: chrono::Utc::now() },
        );
        Ok(true)
    }

    async fn release_lock(&mut self, group_key: &str) -> Result<()> {
        self.store.inner.write().locks.remove(group_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncMode;

    fn task(group_key: &str) -> SyncTask {
        SyncTask {
            id: "t1".to_string(),
            datasource_id: "ds1".to_string(),
            source_schema: None,
            source_table: "orders".to_string(),
            dest_table: "orders_copy".to_string(),
            mode: SyncMode::Sequence,
            pk_columns: vec!["id".to_string()],
            select_columns: vec![],
            sequence_column: Some("updated_at".to_string()),
            batch_size: 1000,
            schedule_cron: None,
            enabled: true,
            group_key: group_key.to_string(),
            custom_query: None,
        }
    }

    #[tokio::test]
    async fn lock_acquire_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.try_acquire_lock("g1").await.unwrap());
        assert!(!store.try_acquire_lock("g1").await.unwrap());
        store.release_lock("g1").await.unwrap();
        assert!(store.try_acquire_lock("g1").await.unwrap());
    }

    #[tokio::test]
    async fn tasks_filter_by_group_key() {
        let store = MemoryStore::new();
        store.put_task(task("g1"));
        let mut t2 = task("g1");
        t2.id = "t2".to_string();
        t2.group_key = "g2".to_string();
        store.put_task(t2);
        let group = store.list_tasks_by_group("g1").await.unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].id, "t1");
    }

    #[tokio::test]
    async fn stuck_states_require_in_progress_and_age() {
        let store = MemoryStore::new();
        let fresh = SyncState {
            task_id: "fresh".to_string(),
            in_progress: true,
            started_at: Some(chrono::Utc::now()),
            ..Default::default()
        };
        let stale = SyncState {
            task_id: "stale".to_string(),
            in_progress: true,
            started_at: Some(chrono::Utc::now() - chrono::Duration::hours(2)),
            ..Default::default()
        };
        store.save_sync_state(&fresh).await.unwrap();
        store.save_sync_state(&stale).await.unwrap();
        let stuck = store
            .list_stuck_states(chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].task_id, "stale");
    }
}
