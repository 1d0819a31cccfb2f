//! Sync Engine (C12, spec.md §4.12).
//!
//! Copies rows from a source into the embedded store in one of two modes,
//! both driven by the same progress/abort contract. Grounded on
//! `original_source/backend/app/db.py`'s `run_sequence_sync`/
//! `run_snapshot_sync`, reimplemented against a `SyncSource` trait so this
//! module stays agnostic to whether the source is the embedded store itself
//! or a pooled remote engine (C9/C10 decide that upstream).

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::exec::embedded::EmbeddedHandle;
use crate::model::ProgressPhase;

/// One page of rows read from a `SyncSource`, column-major header plus
/// row-major data (mirrors the shape results already travel in through C7).
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl FetchedBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Abstracts the source side of a sync task: either the embedded store
/// itself (C11) or a pooled remote engine (C10), queried with the already-
/// compiled dialect-appropriate SQL (C9 decides OFFSET/FETCH vs LIMIT/OFFSET).
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn fetch_after(
        &self,
        sequence_column: &str,
        after: Option<&str>,
        columns: &[String],
        limit: u64,
    ) -> Result<FetchedBatch>;

    async fn count_rows(&self) -> Result<Option<u64>>;

    async fn fetch_page(&self, columns: &[String], offset: u64, limit: u64) -> Result<FetchedBatch>;

    /// Column names as the source sees them, used when `selectColumns` is
    /// empty (spec.md §4.12 "zero-row probe").
    async fn probe_columns(&self) -> Result<Vec<String>>;
}

pub trait ProgressSink: Send {
    fn report(&mut self, phase: ProgressPhase, current: u64, total: u64);
}

impl<F: FnMut(ProgressPhase, u64, u64) + Send> ProgressSink for F {
    fn report(&mut self, phase: ProgressPhase, current: u64, total: u64) {
        self(phase, current, total)
    }
}

pub trait AbortCheck: Send + Sync {
    fn is_requested(&self) -> bool;
}

impl<F: Fn() -> bool + Send + Sync> AbortCheck for F {
    fn is_requested(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct SequenceSyncParams {
    pub dest_table: String,
    pub sequence_column: String,
    pub pk_columns: Vec<String>,
    pub select_columns: Vec<String>,
    pub last_sequence_value: Option<String>,
    pub batch_size: u64,
    pub max_batches: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SequenceSyncOutcome {
    pub row_count: u64,
    pub last_sequence_value: Option<String>,
    pub aborted: bool,
}

/// Sequence (watermark) mode (spec.md §4.12 "Sequence").
pub async fn run_sequence_sync(
    source: &dyn SyncSource,
    dest: &EmbeddedHandle,
    params: &SequenceSyncParams,
    mut progress: impl ProgressSink,
    abort: &dyn AbortCheck,
) -> Result<SequenceSyncOutcome> {
    let columns = if params.select_columns.is_empty() {
        source.probe_columns().await?
    } else {
        params.select_columns.clone()
    };

    let mut watermark = params.last_sequence_value.clone();
    let mut total_rows = 0u64;
    let mut batches_done = 0u32;

    while batches_done < params.max_batches {
        if abort.is_requested() {
            info!(table = %params.dest_table, "sequence sync aborted before fetch");
            return Ok(SequenceSyncOutcome { row_count: total_rows, last_sequence_value: watermark, aborted: true });
        }

        progress.report(ProgressPhase::Fetch, total_rows, 0);
        let batch = source
            .fetch_after(&params.sequence_column, watermark.as_deref(), &columns, params.batch_size)
            .await?;
        if batch.is_empty() {
            debug!(table = %params.dest_table, "sequence sync: source exhausted");
            break;
        }

        if abort.is_requested() {
            info!(table = %params.dest_table, "sequence sync aborted before insert");
            return Ok(SequenceSyncOutcome { row_count: total_rows, last_sequence_value: watermark, aborted: true });
        }

        let seq_idx = batch
            .columns
            .iter()
            .position(|c| c == &params.sequence_column)
            .ok_or_else(|| EngineError::Internal(format!("sequence column {} missing from fetched batch", params.sequence_column)))?;

        ensure_destination_typed(dest, &params.dest_table, &batch)?;
        upsert_batch(dest, &params.dest_table, &batch, &params.pk_columns)?;

        for row in &batch.rows {
            if let Some(v) = row.get(seq_idx) {
                watermark = Some(value_to_watermark(v));
            }
        }

        total_rows += batch.rows.len() as u64;
        progress.report(ProgressPhase::Insert, total_rows, 0);
        batches_done += 1;
    }

    if batches_done >= params.max_batches {
        warn!(table = %params.dest_table, max_batches = params.max_batches, "sequence sync hit max batches, more data may remain");
    }

    Ok(SequenceSyncOutcome { row_count: total_rows, last_sequence_value: watermark, aborted: false })
}

fn value_to_watermark(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSyncParams {
    pub dest_table: String,
    pub select_columns: Vec<String>,
    pub page_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotSyncOutcome {
    pub row_count: u64,
    pub aborted: bool,
}

/// Snapshot mode (spec.md §4.12 "Snapshot"): stage into `stg_<destTable>`,
/// then atomically drop-and-rename over the real destination.
pub async fn run_snapshot_sync(
    source: &dyn SyncSource,
    dest: &EmbeddedHandle,
    params: &SnapshotSyncParams,
    mut progress: impl ProgressSink,
    abort: &dyn AbortCheck,
) -> Result<SnapshotSyncOutcome> {
    let staging_table = format!("stg_{}", params.dest_table);
    let columns = if params.select_columns.is_empty() {
        source.probe_columns().await?
    } else {
        params.select_columns.clone()
    };

    dest.with_connection(|conn| -> Result<()> {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{staging_table}\""))
            .map_err(|e| EngineError::Internal(e.to_string()))
    })?;

    let total = source.count_rows().await?.unwrap_or(0);
    let mut offset = 0u64;
    let mut total_rows = 0u64;
    let mut created = false;

    loop {
        if abort.is_requested() {
            info!(table = %params.dest_table, "snapshot sync aborted before fetch");
            return Ok(SnapshotSyncOutcome { row_count: total_rows, aborted: true });
        }

        progress.report(ProgressPhase::Fetch, total_rows, total);
        let page = source.fetch_page(&columns, offset, params.page_size).await?;
        if page.is_empty() {
            break;
        }

        if abort.is_requested() {
            info!(table = %params.dest_table, "snapshot sync aborted before insert");
            return Ok(SnapshotSyncOutcome { row_count: total_rows, aborted: true });
        }

        if !created {
            ensure_destination_typed(dest, &staging_table, &page)?;
            created = true;
        }
        insert_plain(dest, &staging_table, &page)?;

        let page_len = page.rows.len() as u64;
        total_rows += page_len;
        offset += page_len;
        progress.report(ProgressPhase::Insert, total_rows, total);
        if page_len < params.page_size {
            break;
        }
    }

    dest.with_connection(|conn| -> Result<()> {
        conn.execute_batch(&format!(
            "BEGIN; DROP TABLE IF EXISTS \"{dest_table}\"; ALTER TABLE \"{staging_table}\" RENAME TO \"{dest_table}\"; COMMIT;",
            dest_table = params.dest_table,
            staging_table = staging_table,
        ))
        .map_err(|e| EngineError::Internal(e.to_string()))
    })?;

    info!(table = %params.dest_table, row_count = total_rows, "snapshot sync completed");
    Ok(SnapshotSyncOutcome { row_count: total_rows, aborted: false })
}

// ---------------------------------------------------------------------------
// Destination schema / writes (spec.md §4.12 "Type inference")
// ---------------------------------------------------------------------------

fn infer_duck_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "VARCHAR",
        Value::Bool(_) => "BOOLEAN",
        Value::Number(n) if n.is_i64() || n.is_u64() => "BIGINT",
        Value::Number(_) => "DOUBLE",
        Value::String(s) => {
            if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
                "TIMESTAMP"
            } else if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                "DATE"
            } else {
                "VARCHAR"
            }
        }
        Value::Array(_) | Value::Object(_) => "VARCHAR",
    }
}

/// Create the destination if absent, typed from the first non-null sample
/// per column; add any missing columns via `ALTER TABLE` (existing columns
/// are never altered, per spec.md's "existing destination columns are
/// preserved").
fn ensure_destination_typed(dest: &EmbeddedHandle, table: &str, batch: &FetchedBatch) -> Result<()> {
    let mut col_types = Vec::with_capacity(batch.columns.len());
    for (i, col) in batch.columns.iter().enumerate() {
        let sample = batch
            .rows
            .iter()
            .map(|r| r.get(i).cloned().unwrap_or(Value::Null))
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null);
        col_types.push((col.clone(), infer_duck_type(&sample)));
    }

    dest.with_connection(|conn| -> Result<()> {
        let mut existing = HashSet::new();
        if let Ok(mut stmt) = conn.prepare(&format!("PRAGMA table_info('{table}')")) {
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            for r in rows.flatten() {
                existing.insert(r);
            }
        }
        if existing.is_empty() {
            let cols_sql = col_types
                .iter()
                .map(|(c, t)| format!("\"{c}\" {t}"))
                .collect::<Vec<_>>()
                .join(", ");
            conn.execute_batch(&format!("CREATE TABLE IF NOT EXISTS \"{table}\" ({cols_sql})"))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        } else {
            for (c, t) in &col_types {
                if !existing.contains(c) {
                    conn.execute_batch(&format!("ALTER TABLE \"{table}\" ADD COLUMN \"{c}\" {t}"))
                        .map_err(|e| EngineError::Internal(e.to_string()))?;
                }
            }
        }
        Ok(())
    })
}

fn json_to_duck_param(value: &Value) -> duckdb::types::Value {
    match value {
        Value::Null => duckdb::types::Value::Null,
        Value::Bool(b) => duckdb::types::Value::Boolean(*b),
        Value::Number(n) if n.is_i64() => duckdb::types::Value::BigInt(n.as_i64().unwrap()),
        Value::Number(n) => duckdb::types::Value::Double(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => duckdb::types::Value::Text(s.clone()),
        other => duckdb::types::Value::Text(other.to_string()),
    }
}

fn insert_plain(dest: &EmbeddedHandle, table: &str, batch: &FetchedBatch) -> Result<()> {
    if batch.rows.is_empty() {
        return Ok(());
    }
    let quoted = batch.columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
    let placeholders = batch.columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO \"{table}\" ({quoted}) VALUES ({placeholders})");
    dest.with_connection(|conn| -> Result<()> {
        let mut stmt = conn.prepare(&sql).map_err(|e| EngineError::Internal(e.to_string()))?;
        for row in &batch.rows {
            let params: Vec<duckdb::types::Value> = row.iter().map(json_to_duck_param).collect();
            stmt.execute(duckdb::params_from_iter(params))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }
        Ok(())
    })
}

/// Upsert-by-PK: delete existing rows whose PK matches any row in `batch`,
/// then insert the batch (spec.md §4.12 "upsert by deleting existing PK
/// matches then inserting").
fn upsert_batch(dest: &EmbeddedHandle, table: &str, batch: &FetchedBatch, pk_columns: &[String]) -> Result<()> {
    if pk_columns.is_empty() {
        return insert_plain(dest, table, batch);
    }
    let pk_indices: Vec<usize> = pk_columns
        .iter()
        .filter_map(|pk| batch.columns.iter().position(|c| c == pk))
        .collect();
    if pk_indices.len() != pk_columns.len() {
        warn!(table, "pk column missing from batch, falling back to append-only insert");
        return insert_plain(dest, table, batch);
    }

    let pk_clause = pk_columns.iter().map(|c| format!("\"{c}\" = ?")).collect::<Vec<_>>().join(" AND ");
    let delete_sql = format!("DELETE FROM \"{table}\" WHERE {pk_clause}");

    dest.with_connection(|conn| -> Result<()> {
        let mut del_stmt = conn.prepare(&delete_sql).map_err(|e| EngineError::Internal(e.to_string()))?;
        for row in &batch.rows {
            let params: Vec<duckdb::types::Value> =
                pk_indices.iter().map(|&i| json_to_duck_param(&row[i])).collect();
            del_stmt
                .execute(duckdb::params_from_iter(params))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }
        Ok(())
    })?;

    insert_plain(dest, table, batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    use crate::exec::embedded::EmbeddedPragmas;

    struct FakeSource {
        pages: Mutex<Vec<FetchedBatch>>,
        call_count: AtomicU32,
    }

    #[async_trait]
    impl SyncSource for FakeSource {
        async fn fetch_after(&self, _seq: &str, _after: Option<&str>, _cols: &[String], _limit: u64) -> Result<FetchedBatch> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst) as usize;
            let pages = self.pages.lock().unwrap();
            Ok(pages.get(idx).cloned().unwrap_or_default())
        }

        async fn count_rows(&self) -> Result<Option<u64>> {
            Ok(Some(self.pages.lock().unwrap().iter().map(|p| p.rows.len() as u64).sum()))
        }

        async fn fetch_page(&self, _cols: &[String], offset: u64, _limit: u64) -> Result<FetchedBatch> {
            let idx = (offset / 2) as usize;
            let pages = self.pages.lock().unwrap();
            Ok(pages.get(idx).cloned().unwrap_or_default())
        }

        async fn probe_columns(&self) -> Result<Vec<String>> {
            Ok(self.pages.lock().unwrap().first().map(|p| p.columns.clone()).unwrap_or_default())
        }
    }

    fn batch(ids: &[i64], seqs: &[&str]) -> FetchedBatch {
        FetchedBatch {
            columns: vec!["id".to_string(), "updated_at".to_string()],
            rows: ids
                .iter()
                .zip(seqs.iter())
                .map(|(id, seq)| vec![Value::from(*id), Value::String(seq.to_string())])
                .collect(),
        }
    }

    #[tokio::test]
    async fn sequence_sync_advances_watermark_and_inserts_rows() {
        let dir = tempdir().unwrap();
        let handle = EmbeddedHandle::open(&dir.path().join("db.duckdb"), dir.path().join("active"), EmbeddedPragmas::default()).unwrap();
        let source = FakeSource {
            pages: Mutex::new(vec![
                batch(&[1, 2], &["2026-01-01", "2026-01-02"]),
                FetchedBatch::default(),
            ]),
            call_count: AtomicU32::new(0),
        };
        let params = SequenceSyncParams {
            dest_table: "orders_copy".to_string(),
            sequence_column: "updated_at".to_string(),
            pk_columns: vec!["id".to_string()],
            select_columns: vec!["id".to_string(), "updated_at".to_string()],
            last_sequence_value: None,
            batch_size: 100,
            max_batches: 10,
        };
        let outcome = run_sequence_sync(&source, &handle, &params, |_, _, _| {}, &|| false)
            .await
            .unwrap();
        assert_eq!(outcome.row_count, 2);
        assert_eq!(outcome.last_sequence_value.as_deref(), Some("2026-01-02"));
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn sequence_sync_honors_abort_before_fetch() {
        let dir = tempdir().unwrap();
        let handle = EmbeddedHandle::open(&dir.path().join("db.duckdb"), dir.path().join("active"), EmbeddedPragmas::default()).unwrap();
        let source = FakeSource { pages: Mutex::new(vec![batch(&[1], &["2026-01-01"])]), call_count: AtomicU32::new(0) };
        let params = SequenceSyncParams {
            dest_table: "orders_copy".to_string(),
            sequence_column: "updated_at".to_string(),
            pk_columns: vec!["id".to_string()],
            select_columns: vec!["id".to_string(), "updated_at".to_string()],
            last_sequence_value: None,
            batch_size: 100,
            max_batches: 10,
        };
        let outcome = run_sequence_sync(&source, &handle, &params, |_, _, _| {}, &|| true)
            .await
            .unwrap();
        assert!(outcome.aborted);
        assert_eq!(outcome.row_count, 0);
    }

    #[tokio::test]
    async fn snapshot_sync_stages_then_swaps() {
        let dir = tempdir().unwrap();
        let handle = EmbeddedHandle::open(&dir.path().join("db.duckdb"), dir.path().join("active"), EmbeddedPragmas::default()).unwrap();
        let source = FakeSource {
            pages: Mutex::new(vec![batch(&[1, 2], &["2026-01-01", "2026-01-02"]), FetchedBatch::default()]),
            call_count: AtomicU32::new(0),
        };
        let params = SnapshotSyncParams {
            dest_table: "orders_snapshot".to_string(),
            select_columns: vec!["id".to_string(), "updated_at".to_string()],
            page_size: 2,
        };
        let outcome = run_snapshot_sync(&source, &handle, &params, |_, _, _| {}, &|| false)
            .await
            .unwrap();
        assert_eq!(outcome.row_count, 2);
        let count: i64 = handle
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM orders_snapshot", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn infer_duck_type_preserves_existing_columns_contract() {
        assert_eq!(infer_duck_type(&Value::Null), "VARCHAR");
        assert_eq!(infer_duck_type(&Value::Bool(true)), "BOOLEAN");
        assert_eq!(infer_duck_type(&Value::from(42)), "BIGINT");
    }
}
