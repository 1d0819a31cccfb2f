//! Metadata persistence (spec.md §6's "transactional semantics" requirement).
//!
//! `MetadataStore` is the boundary between the sync/query core and whatever
//! durable store backs it. `postgres` is the production implementation;
//! `memory` backs unit tests and local dev, mirroring the teacher's own
//! split between a real catalog and an in-memory fixture used in its
//! non-container tests.

pub mod memory;
pub mod postgres;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Datasource, SyncLock, SyncRun, SyncState, SyncTask};

/// A boxed, transaction-scoped future — `with_transaction`'s callback needs
/// to `.await` the `StoreTransaction` methods it calls, so it can't be a
/// plain synchronous `FnOnce`.
pub type TxnFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A unit of work that must observe either all-or-nothing effects on the
/// store. Implementations decide whether this maps to a real database
/// transaction or, for `memory`, a single critical section.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    async fn load_sync_state(&mut self, task_id: &str) -> Result<Option<SyncState>>;
    async fn save_sync_state(&mut self, state: &SyncState) -> Result<()>;
    async fn acquire_lock(&mut self, group_key: &str) -> Result<bool>;
    async fn release_lock(&mut self, group_key: &str) -> Result<()>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_datasource(&self, id: &str) -> Result<Option<Datasource>>;
    async fn list_datasources(&self) -> Result<Vec<Datasource>>;

    async fn get_task(&self, id: &str) -> Result<Option<SyncTask>>;
    async fn list_tasks(&self) -> Result<Vec<SyncTask>>;
    async fn list_tasks_by_group(&self, group_key: &str) -> Result<Vec<SyncTask>>;

    async fn get_sync_state(&self, task_id: &str) -> Result<Option<SyncState>>;
    async fn save_sync_state(&self, state: &SyncState) -> Result<()>;
    async fn list_stuck_states(&self, stale_after: chrono::Duration) -> Result<Vec<SyncState>>;

    async fn record_run(&self, run: &SyncRun) -> Result<()>;
    async fn list_runs(&self, task_id: &str, limit: u32) -> Result<Vec<SyncRun>>;

    async fn try_acquire_lock(&self, group_key: &str) -> Result<bool>;
    async fn release_lock(&self, group_key: &str) -> Result<()>;
    async fn get_lock(&self, group_key: &str) -> Result<Option<SyncLock>>;
    async fn force_release_lock(&self, group_key: &str) -> Result<()>;

    /// Run `f` against a transactional view of the store. Implementations
    /// guarantee `f`'s effects are atomic from the perspective of any other
    /// caller of this trait.
    async fn with_transaction<'a>(
        &'a self,
        f: Box<dyn for<'t> FnOnce(&'t mut dyn StoreTransaction) -> TxnFuture<'t> + Send + 'a>,
    ) -> Result<()>;
}
