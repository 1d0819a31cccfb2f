//! Engine Pool (C10, spec.md §4.10).
//!
//! Caches remote engines keyed by normalized DSN. Pool-tuning query
//! parameters the caller may have embedded in the DSN are stripped and
//! replaced with dialect defaults before the connection is actually opened.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{MySqlPool, PgPool, SqlitePool};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{EngineError, Result};
use crate::model::Dialect;

/// Pool-tuning query parameters this crate owns and therefore strips from a
/// caller-supplied DSN before applying its own defaults (spec.md §4.10).
const TUNING_PARAMS: &[&str] = &["poolSize", "maxOverflow", "poolTimeout", "poolClamp"];

const NETWORKED_POOL_SIZE: u32 = 5;
const NETWORKED_MAX_OVERFLOW: u32 = 20;
const NETWORKED_POOL_RECYCLE: Duration = Duration::from_secs(1800);

/// A live remote engine. MSSQL uses `tiberius` directly (no connection-pool
/// crate for it in this stack), guarded by a mutex since `tiberius::Client`
/// is not internally synchronized for concurrent statements.
pub enum RemoteEngine {
    Postgres(PgPool),
    Mysql(MySqlPool),
    Sqlite(SqlitePool),
    Mssql(Arc<AsyncMutex<tiberius::Client<tokio_util::compat::Compat<tokio::net::TcpStream>>>>),
}

/// Strip this crate's own tuning query params from a DSN, leaving everything
/// else (host, credentials, driver-native params) untouched.
pub fn normalize_dsn(dsn: &str) -> String {
    match dsn.split_once('?') {
        None => dsn.to_string(),
        Some((base, query)) => {
            let kept: Vec<&str> = query
                .split('&')
                .filter(|kv| {
                    let key = kv.split('=').next().unwrap_or("");
                    !TUNING_PARAMS.iter().any(|p| p.eq_ignore_ascii_case(key))
                })
                .collect();
            if kept.is_empty() {
                base.to_string()
            } else {
                format!("{base}?{}", kept.join("&"))
            }
        }
    }
}

pub struct EnginePool {
    engines: Mutex<HashMap<String, Arc<RemoteEngine>>>,
}

impl EnginePool {
    pub fn new() -> Self {
        EnginePool {
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached engine for `dsn`, opening one on demand.
    pub async fn get(&self, dialect: Dialect, dsn: &str) -> Result<Arc<RemoteEngine>> {
        let key = normalize_dsn(dsn);
        if let Some(existing) = self.engines.lock().get(&key).cloned() {
            return Ok(existing);
        }
        let engine = Arc::new(Self::open(dialect, &key).await?);
        self.engines.lock().insert(key, engine.clone());
        Ok(engine)
    }

    async fn open(dialect: Dialect, dsn: &str) -> Result<RemoteEngine> {
        match dialect {
            Dialect::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(NETWORKED_POOL_SIZE + NETWORKED_MAX_OVERFLOW)
                    .max_lifetime(NETWORKED_POOL_RECYCLE)
                    .test_before_acquire(true)
                    .connect(dsn)
                    .await
                    .map_err(|e| EngineError::BadGateway(e.to_string()))?;
                Ok(RemoteEngine::Postgres(pool))
            }
            Dialect::Mysql => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(NETWORKED_POOL_SIZE + NETWORKED_MAX_OVERFLOW)
                    .max_lifetime(NETWORKED_POOL_RECYCLE)
                    .test_before_acquire(true)
                    .connect(dsn)
                    .await
                    .map_err(|e| EngineError::BadGateway(e.to_string()))?;
                Ok(RemoteEngine::Mysql(pool))
            }
            Dialect::Sqlite => {
                // Embedded sqlite datasources allow cross-thread access; a
                // small pool is still used so writers don't starve readers.
                let pool = SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect(dsn)
                    .await
                    .map_err(|e| EngineError::BadGateway(e.to_string()))?;
                Ok(RemoteEngine::Sqlite(pool))
            }
            Dialect::Mssql => {
                use tokio_util::compat::TokioAsyncWriteCompatExt;

                let config = tiberius::Config::from_ado_string(dsn)
                    .map_err(|e| EngineError::BadRequest(format!("invalid mssql DSN: {e}")))?;
                let tcp = tokio::net::TcpStream::connect(config.get_addr())
                    .await
                    .map_err(|e| EngineError::BadGateway(e.to_string()))?;
                tcp.set_nodelay(true)
                    .map_err(|e| EngineError::BadGateway(e.to_string()))?;
                let client = tiberius::Client::connect(config, tcp.compat_write())
                    .await
                    .map_err(|e| EngineError::BadGateway(e.to_string()))?;
                Ok(RemoteEngine::Mssql(Arc::new(AsyncMutex::new(client))))
            }
            Dialect::EmbeddedColumnar => Err(EngineError::Internal(
                "embedded datasources are served by EmbeddedHandle, not EnginePool".to_string(),
            )),
        }
    }

    /// Dispose a single cached engine, e.g. after a classified transient
    /// error (spec.md §4.9 "Retry policy").
    pub fn dispose(&self, dsn: &str) {
        self.engines.lock().remove(&normalize_dsn(dsn));
    }

    pub fn dispose_by_dsn(&self, dsn: &str) {
        self.dispose(dsn);
    }

    /// Administrative: drop every cached engine (spec.md §4.10 "Admin
    /// operations").
    pub fn dispose_all(&self) {
        self.engines.lock().clear();
    }

    pub fn cached_count(&self) -> usize {
        self.engines.lock().len()
    }
}

impl Default for EnginePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_dsn_strips_known_tuning_params() {
        let dsn = "postgres://u:p@host/db?poolSize=10&sslmode=require&maxOverflow=5";
        assert_eq!(normalize_dsn(dsn), "postgres://u:p@host/db?sslmode=require");
    }

    #[test]
    fn normalize_dsn_leaves_plain_dsn_untouched() {
        let dsn = "postgres://u:p@host/db";
        assert_eq!(normalize_dsn(dsn), dsn);
    }

    #[test]
    fn normalize_dsn_drops_query_entirely_when_only_tuning_params_present() {
        let dsn = "postgres://u:p@host/db?poolSize=10&poolTimeout=30";
        assert_eq!(normalize_dsn(dsn), "postgres://u:p@host/db");
    }

    #[test]
    fn dispose_all_clears_cache() {
        let pool = EnginePool::new();
        assert_eq!(pool.cached_count(), 0);
        pool.dispose_all();
        assert_eq!(pool.cached_count(), 0);
    }
}
