//! Sync Coordinator (C13, spec.md §4.13).
//!
//! Orchestrates one or more `SyncTask`s per request: blackout/concurrency
//! gating, `groupKey` mutual exclusion (locks acquired in a fixed order to
//! avoid deadlock across concurrent batch requests), snapshot-before-sequence
//! ordering, and post-snapshot watermark refresh for sibling sequence tasks.
//! Grounded on the teacher's DAG/scheduler orchestration shape, generalized
//! from a refresh-ordering problem to a sync-task-ordering one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Timelike;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::exec::embedded::EmbeddedHandle;
use crate::model::{Datasource, ProgressPhase, SyncMode, SyncRun, SyncState, SyncTask};
use crate::store::MetadataStore;
use crate::sync::engine::{
    self, FetchedBatch, SequenceSyncParams, SnapshotSyncParams, SyncSource,
};

/// Resolves the `SyncSource` a task should read from. In the full assembly
/// this bridges to C9 (router) + C10 (pool) for remote datasources, or
/// wraps the shared `EmbeddedHandle` when the source is itself embedded.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, task: &SyncTask, datasource: &Datasource) -> Result<Arc<dyn SyncSource>>;
}

#[derive(Debug, Clone)]
pub struct TaskRunOutcome {
    pub task_id: String,
    pub row_count: u64,
    pub aborted: bool,
    pub error: Option<String>,
}

pub struct SyncCoordinator<S: MetadataStore> {
    store: Arc<S>,
    dest: Arc<EmbeddedHandle>,
    sources: Arc<dyn SourceResolver>,
    stale_after: chrono::Duration,
}

impl<S: MetadataStore + 'static> SyncCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        dest: Arc<EmbeddedHandle>,
        sources: Arc<dyn SourceResolver>,
        stale_after: StdDuration,
    ) -> Self {
        SyncCoordinator {
            store,
            dest,
            sources,
            stale_after: chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::minutes(30)),
        }
    }

    /// Run the given tasks as one coordinated batch (spec.md §4.13).
    pub async fn run_batch(&self, task_ids: &[String], force: bool) -> Result<Vec<TaskRunOutcome>> {
        let mut tasks = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            let task = self
                .store
                .get_task(id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("sync task {id} not found")))?;
            if !task.enabled {
                return Err(EngineError::BadRequest(format!("sync task {id} is disabled")));
            }
            tasks.push(task);
        }

        for task in &tasks {
            self.check_datasource_eligible(task).await?;
        }

        let mut group_keys: Vec<String> = tasks.iter().map(|t| t.group_key.clone()).collect();
        group_keys.sort();
        group_keys.dedup();

        if force {
            for key in &group_keys {
                self.store.force_release_lock(key).await?;
            }
        }

        let mut acquired = Vec::new();
        let mut busy = Vec::new();
        for key in &group_keys {
            if self.store.try_acquire_lock(key).await? {
                acquired.push(key.clone());
            } else {
                busy.push(key.clone());
            }
        }
        if !busy.is_empty() {
            for key in &acquired {
                self.store.release_lock(key).await?;
            }
            return Err(EngineError::Conflict(format!(
                "sync group(s) already in progress: {}",
                busy.join(", ")
            )));
        }

        let result = self.run_ordered(&tasks).await;

        for key in &group_keys {
            if let Err(e) = self.store.release_lock(key).await {
                warn!(group_key = %key, error = %e, "failed releasing sync lock");
            }
        }

        result
    }

    async fn check_datasource_eligible(&self, task: &SyncTask) -> Result<()> {
        let datasource = self
            .store
            .get_datasource(&task.datasource_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("datasource {} not found", task.datasource_id)))?;
        if !datasource.active {
            return Err(EngineError::BadRequest(format!("datasource {} is inactive", task.datasource_id)));
        }
        let minute_of_day = (chrono::Utc::now().time().num_seconds_from_midnight() / 60) as u16;
        if datasource
            .options
            .blackout_windows
            .iter()
            .any(|w| w.contains(minute_of_day))
        {
            return Err(EngineError::BadRequest(format!(
                "datasource {} is within a blackout window",
                task.datasource_id
            )));
        }

        let max_concurrent = datasource.options.max_concurrent_syncs;
        if max_concurrent > 0 {
            let siblings = self.store.list_tasks().await?;
            let mut in_progress_count = 0u32;
            for sibling in siblings.iter().filter(|t| t.datasource_id == task.datasource_id) {
                if let Some(state) = self.store.get_sync_state(&sibling.id).await? {
                    if state.in_progress {
                        in_progress_count += 1;
                    }
                }
            }
            if in_progress_count >= max_concurrent {
                return Err(EngineError::BadRequest(format!(
                    "datasource {} already has {} sync(s) in progress (max {})",
                    task.datasource_id, in_progress_count, max_concurrent
                )));
            }
        }
        Ok(())
    }

    async fn run_ordered(&self, tasks: &[SyncTask]) -> Result<Vec<TaskRunOutcome>> {
        let mut ordered: Vec<&SyncTask> = tasks.iter().collect();
        ordered.sort_by_key(|t| match t.mode {
            SyncMode::Snapshot => 0,
            SyncMode::Sequence => 1,
        });

        let mut outcomes = Vec::with_capacity(ordered.len());
        let mut snapshotted_groups: HashSet<String> = HashSet::new();

        for task in ordered {
            let outcome = self.run_one(task).await;
            match &outcome {
                Ok(o) => {
                    if task.mode == SyncMode::Snapshot && !o.aborted {
                        snapshotted_groups.insert(task.group_key.clone());
                    }
                    outcomes.push(o.clone());
                }
                Err(e) => {
                    outcomes.push(TaskRunOutcome {
                        task_id: task.id.clone(),
                        row_count: 0,
                        aborted: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        for task in tasks.iter().filter(|t| t.mode == SyncMode::Sequence) {
            if snapshotted_groups.contains(&task.group_key) {
                if let Err(e) = self.refresh_watermark_after_snapshot(task).await {
                    warn!(task_id = %task.id, error = %e, "failed refreshing watermark after sibling snapshot");
                }
            }
        }

        Ok(outcomes)
    }

    async fn run_one(&self, task: &SyncTask) -> Result<TaskRunOutcome> {
        let datasource = self
            .store
            .get_datasource(&task.datasource_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("datasource {} not found", task.datasource_id)))?;
        let source = self.sources.resolve(task, &datasource).await?;

        let mut state = self
            .store
            .get_sync_state(&task.id)
            .await?
            .unwrap_or_else(|| SyncState { task_id: task.id.clone(), ..Default::default() });

        if task.mode == SyncMode::Sequence && state.last_sequence_value.is_none() {
            if let Some(seq_col) = &task.sequence_column {
                state.last_sequence_value = self.max_dest_value(&task.dest_table, seq_col);
            }
        }
        if let Some(last_path) = &state.last_embedded_path {
            if *last_path != self.dest.active_path().to_string_lossy() {
                info!(task_id = %task.id, "embedded store path changed, resetting watermark");
                state.last_sequence_value = None;
            }
        }

        state.in_progress = true;
        state.cancel_requested = false;
        state.started_at = Some(chrono::Utc::now());
        state.progress_current = 0;
        state.progress_total = 0;
        state.error = None;
        state.last_embedded_path = Some(self.dest.active_path().to_string_lossy().into_owned());
        self.store.save_sync_state(&state).await?;

        let run = SyncRun {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            datasource_id: task.datasource_id.clone(),
            mode: task.mode,
            started_at: state.started_at.unwrap(),
            finished_at: None,
            row_count: None,
            error: None,
        };
        self.store.record_run(&run).await?;

        let abort_flag = Arc::new(AtomicBool::new(false));
        let poll_handle = self.spawn_abort_poller(task.id.clone(), abort_flag.clone());

        let result = match task.mode {
            SyncMode::Sequence => self.run_sequence(task, source.as_ref(), &state, &abort_flag).await,
            SyncMode::Snapshot => self.run_snapshot(task, source.as_ref(), &abort_flag).await,
        };

        poll_handle.abort();

        let mut final_state = self.store.get_sync_state(&task.id).await?.unwrap_or(state);
        final_state.in_progress = false;
        final_state.last_run_at = Some(chrono::Utc::now());

        let mut finished_run = run.clone();
        finished_run.finished_at = Some(chrono::Utc::now());

        let outcome = match result {
            Ok((row_count, aborted, last_seq)) => {
                final_state.last_row_count = Some(row_count);
                final_state.last_sequence_value = last_seq.or(final_state.last_sequence_value.clone());
                finished_run.row_count = Some(row_count);
                TaskRunOutcome { task_id: task.id.clone(), row_count, aborted, error: None }
            }
            Err(e) => {
                final_state.error = Some(e.to_string());
                finished_run.error = Some(e.to_string());
                TaskRunOutcome { task_id: task.id.clone(), row_count: 0, aborted: false, error: Some(e.to_string()) }
            }
        };

        self.store.save_sync_state(&final_state).await?;
        self.store.record_run(&finished_run).await?;
        Ok(outcome)
    }

    async fn run_sequence(
        &self,
        task: &SyncTask,
        source: &dyn SyncSource,
        state: &SyncState,
        abort_flag: &Arc<AtomicBool>,
    ) -> Result<(u64, bool, Option<String>)> {
        let sequence_column = task
            .sequence_column
            .clone()
            .ok_or_else(|| EngineError::BadRequest(format!("task {} is sequence mode but has no sequenceColumn", task.id)))?;
        let params = SequenceSyncParams {
            dest_table: task.dest_table.clone(),
            sequence_column,
            pk_columns: task.pk_columns.clone(),
            select_columns: task.select_columns.clone(),
            last_sequence_value: state.last_sequence_value.clone(),
            batch_size: task.batch_size,
            max_batches: 1000,
        };
        let task_id = task.id.clone();
        let store = self.store.clone();
        let sink = move |phase: ProgressPhase, current: u64, total: u64| {
            let store = store.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                if let Ok(Some(mut s)) = store.get_sync_state(&task_id).await {
                    s.progress_phase = Some(phase);
                    s.progress_current = current;
                    s.progress_total = total;
                    let _ = store.save_sync_state(&s).await;
                }
            });
        };
        let abort_flag = abort_flag.clone();
        let abort = move || abort_flag.load(Ordering::Relaxed);
        let outcome = engine::run_sequence_sync(source, &self.dest, &params, sink, &abort).await?;
        Ok((outcome.row_count, outcome.aborted, outcome.last_sequence_value))
    }

    async fn run_snapshot(
        &self,
        task: &SyncTask,
        source: &dyn SyncSource,
        abort_flag: &Arc<AtomicBool>,
    ) -> Result<(u64, bool, Option<String>)> {
        let params = SnapshotSyncParams {
            dest_table: task.dest_table.clone(),
            select_columns: task.select_columns.clone(),
            page_size: task.batch_size,
        };
        let task_id = task.id.clone();
        let store = self.store.clone();
        let sink = move |phase: ProgressPhase, current: u64, total: u64| {
            let store = store.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                if let Ok(Some(mut s)) = store.get_sync_state(&task_id).await {
                    s.progress_phase = Some(phase);
                    s.progress_current = current;
                    s.progress_total = total;
                    let _ = store.save_sync_state(&s).await;
                }
            });
        };
        let abort_flag = abort_flag.clone();
        let abort = move || abort_flag.load(Ordering::Relaxed);
        let outcome = engine::run_snapshot_sync(source, &self.dest, &params, sink, &abort).await?;
        Ok((outcome.row_count, outcome.aborted, None))
    }

    fn spawn_abort_poller(&self, task_id: String, flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(StdDuration::from_secs(1)).await;
                match store.get_sync_state(&task_id).await {
                    Ok(Some(s)) if s.cancel_requested => {
                        flag.store(true, Ordering::Relaxed);
                        break;
                    }
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        })
    }

    async fn refresh_watermark_after_snapshot(&self, sequence_task: &SyncTask) -> Result<()> {
        let Some(seq_col) = &sequence_task.sequence_column else { return Ok(()) };
        let Some(new_max) = self.max_dest_value(&sequence_task.dest_table, seq_col) else {
            return Ok(());
        };
        if let Some(mut state) = self.store.get_sync_state(&sequence_task.id).await? {
            state.last_sequence_value = Some(new_max);
            self.store.save_sync_state(&state).await?;
            info!(task_id = %sequence_task.id, "watermark refreshed after sibling snapshot");
        }
        Ok(())
    }

    fn max_dest_value(&self, table: &str, column: &str) -> Option<String> {
        self.dest
            .with_connection(|conn| {
                conn.query_row(&format!("SELECT MAX(\"{column}\") FROM \"{table}\""), [], |row| {
                    row.get::<_, Option<String>>(0)
                })
            })
            .ok()
            .flatten()
    }

    /// Administrative `reset-stuck` operation (spec.md §4.13 "Stuck-job
    /// recovery"): clears `inProgress` for any state whose last heartbeat
    /// predates `stale_after`.
    pub async fn reset_stuck(&self) -> Result<u32> {
        let stuck = self.store.list_stuck_states(self.stale_after).await?;
        let mut count = 0;
        for mut state in stuck {
            warn!(task_id = %state.task_id, "resetting stuck sync state");
            state.in_progress = false;
            state.error = Some("reset by administrative reset-stuck operation".to_string());
            self.store.save_sync_state(&state).await?;
            if let Ok(Some(task)) = self.store.get_task(&state.task_id).await {
                let _ = self.store.force_release_lock(&task.group_key).await;
            }
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::embedded::EmbeddedPragmas;
    use crate::model::{DatasourceKind, DatasourceOptions, SyncMode};
    use crate::store::memory::MemoryStore;
    use tempfile::tempdir;

    struct NullSource;

    #[async_trait]
    impl SyncSource for NullSource {
        async fn fetch_after(&self, _s: &str, _a: Option<&str>, _c: &[String], _l: u64) -> Result<FetchedBatch> {
            Ok(FetchedBatch::default())
        }
        async fn count_rows(&self) -> Result<Option<u64>> {
            Ok(Some(0))
        }
        async fn fetch_page(&self, _c: &[String], _o: u64, _l: u64) -> Result<FetchedBatch> {
            Ok(FetchedBatch::default())
        }
        async fn probe_columns(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct NullResolver;

    #[async_trait]
    impl SourceResolver for NullResolver {
        async fn resolve(&self, _task: &SyncTask, _ds: &Datasource) -> Result<Arc<dyn SyncSource>> {
            Ok(Arc::new(NullSource))
        }
    }

    fn make_coordinator() -> (SyncCoordinator<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dir = tempdir().unwrap();
        let dest = Arc::new(
            EmbeddedHandle::open(&dir.path().join("db.duckdb"), dir.path().join("active"), EmbeddedPragmas::default())
                .unwrap(),
        );
        std::mem::forget(dir);
        let coordinator = SyncCoordinator::new(store.clone(), dest, Arc::new(NullResolver), StdDuration::from_secs(1800));
        (coordinator, store)
    }

    fn datasource(active: bool) -> Datasource {
        Datasource {
            id: "ds1".to_string(),
            kind: DatasourceKind::PostgresFamily,
            connection_string: None,
            options: DatasourceOptions::default(),
            owner: "owner1".to_string(),
            active,
        }
    }

    fn task() -> SyncTask {
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
            batch_size: 100,
            schedule_cron: None,
            enabled: true,
            group_key: "g1".to_string(),
            custom_query: None,
        }
    }

    #[tokio::test]
    async fn rejects_inactive_datasource() {
        let (coordinator, store) = make_coordinator();
        store.put_datasource(datasource(false));
        store.put_task(task());
        let err = coordinator.run_batch(&["t1".to_string()], false).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::BadRequest));
    }

    #[tokio::test]
    async fn runs_enabled_task_against_active_datasource() {
        let (coordinator, store) = make_coordinator();
        store.put_datasource(datasource(true));
        store.put_task(task());
        let outcomes = coordinator.run_batch(&["t1".to_string()], false).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].task_id, "t1");
        assert_eq!(outcomes[0].row_count, 0);
    }

    #[tokio::test]
    async fn reset_stuck_clears_stale_in_progress_state() {
        let (coordinator, store) = make_coordinator();
        let stale = SyncState {
            task_id: "t1".to_string(),
            in_progress: true,
            started_at: Some(chrono::Utc::now() - chrono::Duration::hours(2)),
            ..Default::default()
        };
        store.save_sync_state(&stale).await.unwrap();
        let reset_count = coordinator.reset_stuck().await.unwrap();
        assert_eq!(reset_count, 1);
        let state = store.get_sync_state("t1").await.unwrap().unwrap();
        assert!(!state.in_progress);
    }
}
