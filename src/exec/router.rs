//! Execution Router (C9, spec.md §4.9).
//!
//! Chooses between the embedded columnar connection and a pooled remote
//! engine, rewrites inner SQL for positional pagination, and retries once on
//! a classified transient error with the offending engine disposed first.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{classify_db_error, EngineError, Result};
use crate::model::{Datasource, DatasourceKind, Dialect};

/// Where a compiled query actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTarget {
    Embedded,
    Remote,
}

/// Decide embedded vs. remote (spec.md §4.9 "Decision"). `table_in_embedded`
/// tells the router whether the referenced table already lives in the
/// embedded store (a synced destination table, typically).
pub fn choose_target(
    kind: DatasourceKind,
    prefer_local: bool,
    table_in_embedded: bool,
) -> ExecTarget {
    if kind == DatasourceKind::EmbeddedColumnar {
        return ExecTarget::Embedded;
    }
    if prefer_local && table_in_embedded {
        return ExecTarget::Embedded;
    }
    ExecTarget::Remote
}

pub fn choose_target_for(ds: &Datasource, prefer_local: bool, table_in_embedded: bool) -> ExecTarget {
    choose_target(ds.kind, prefer_local, table_in_embedded)
}

/// Wrap `inner` for positional pagination (spec.md §4.9 "Pagination").
/// `limit` is clamped to `max_limit`. MSSQL needs an explicit `ORDER BY` to
/// use `OFFSET ... FETCH`; when `inner` lacks one, wrap it in a stable
/// `ROW_NUMBER() OVER (ORDER BY (SELECT 1))` ordering first.
pub fn wrap_pagination(
    dialect: Dialect,
    inner: &str,
    limit: u64,
    offset: u64,
    max_limit: u64,
) -> String {
    let clamped_limit = limit.min(max_limit);
    match dialect {
        Dialect::Mssql => {
            let has_order_by = inner.to_ascii_uppercase().contains("ORDER BY");
            if has_order_by {
                format!(
                    "SELECT * FROM ({inner}) AS _q ORDER BY (SELECT 1) OFFSET {offset} ROWS FETCH NEXT {clamped_limit} ROWS ONLY"
                )
            } else {
                format!(
                    "SELECT * FROM (SELECT _q.*, ROW_NUMBER() OVER (ORDER BY (SELECT 1)) AS _rn FROM ({inner}) AS _q) AS _ranked ORDER BY _rn OFFSET {offset} ROWS FETCH NEXT {clamped_limit} ROWS ONLY"
                )
            }
        }
        _ => format!("SELECT * FROM ({inner}) AS _q LIMIT {clamped_limit} OFFSET {offset}"),
    }
}

/// Build a count query over `inner` (spec.md §4.7: counts are cached under a
/// separate prefix from the page they total, but both are compiled the same
/// way).
pub fn wrap_count(inner: &str) -> String {
    format!("SELECT COUNT(*) AS \"count\" FROM ({inner}) AS _q")
}

/// The dialect-specific statement-timeout `SET` to issue before running a
/// query (spec.md §4.9 "Statement timeouts").
pub fn statement_timeout_sql(dialect: Dialect, timeout: Duration) -> Option<String> {
    let secs = timeout.as_secs();
    match dialect {
        Dialect::Postgres => Some(format!("SET statement_timeout = {}", secs * 1000)),
        Dialect::Mysql => Some(format!("SET SESSION MAX_EXECUTION_TIME = {}", secs * 1000)),
        Dialect::Mssql => Some(format!("SET LOCK_TIMEOUT {}", secs * 1000)),
        Dialect::EmbeddedColumnar | Dialect::Sqlite => None,
    }
}

/// Run `attempt` once, and on a classified transient failure call `on_retry`
/// (the caller's hook to dispose the offending pooled engine) before retrying
/// exactly once (spec.md §4.9 "Retry policy"). A second failure is surfaced
/// as the mapped `EngineError` (`GatewayTimeout`/`BadGateway`), not retried
/// again.
pub async fn execute_with_retry<F, Fut, T, D, DFut>(
    mut attempt: F,
    mut on_retry: D,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    D: FnMut() -> DFut,
    DFut: Future<Output = ()>,
{
    match attempt().await {
        Ok(v) => Ok(v),
        Err(e) => {
            let message = e.to_string();
            match classify_db_error(&message) {
                Some(class) => {
                    warn!(class = %class, "transient db error, disposing engine and retrying once");
                    on_retry().await;
                    attempt().await.map_err(|retry_err| {
                        let retry_message = retry_err.to_string();
                        match classify_db_error(&retry_message) {
                            Some(class) => EngineError::from(class),
                            None => retry_err,
                        }
                    })
                }
                None => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_datasource_always_routes_embedded() {
        assert_eq!(
            choose_target(DatasourceKind::EmbeddedColumnar, false, false),
            ExecTarget::Embedded
        );
    }

    #[test]
    fn remote_datasource_with_local_preference_and_table_present_routes_embedded() {
        assert_eq!(
            choose_target(DatasourceKind::PostgresFamily, true, true),
            ExecTarget::Embedded
        );
    }

    #[test]
    fn remote_datasource_without_local_table_routes_remote() {
        assert_eq!(
            choose_target(DatasourceKind::PostgresFamily, true, false),
            ExecTarget::Remote
        );
    }

    #[test]
    fn pagination_clamps_to_max_limit() {
        let sql = wrap_pagination(Dialect::Postgres, "SELECT * FROM orders", 50_000, 0, 10_000);
        assert!(sql.contains("LIMIT 10000"));
    }

    #[test]
    fn mssql_wraps_row_number_when_no_order_by() {
        let sql = wrap_pagination(Dialect::Mssql, "SELECT * FROM orders", 50, 0, 10_000);
        assert!(sql.contains("ROW_NUMBER()"));
        assert!(sql.contains("FETCH NEXT 50 ROWS ONLY"));
    }

    #[test]
    fn mssql_skips_row_number_when_order_by_present() {
        let sql = wrap_pagination(Dialect::Mssql, "SELECT * FROM orders ORDER BY id", 50, 0, 10_000);
        assert!(!sql.contains("ROW_NUMBER()"));
    }

    #[tokio::test]
    async fn retries_once_on_transient_error_then_succeeds() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let disposed = std::sync::atomic::AtomicU32::new(0);
        let result = execute_with_retry(
            || {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(EngineError::Internal("08S01 connection lost".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
            || {
                disposed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {}
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(disposed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_transient_error_is_not_retried() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = execute_with_retry(
            || {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err::<i32, _>(EngineError::BadRequest("bad column".to_string())) }
            },
            || async {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
