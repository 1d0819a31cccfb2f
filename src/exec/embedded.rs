//! Embedded Store Handle (C11, spec.md §4.11).
//!
//! A single process-wide connection to the active embedded columnar file.
//! All writes (sync destinations, C12/C14) go through this one connection by
//! convention; reads may share it or open a throwaway ephemeral connection
//! against a different path. The active path survives restarts via a sidecar
//! marker file next to the embedded store.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::info;

use crate::error::{EngineError, Result};

/// Pragmas applied on every connection open (spec.md §4.11).
#[derive(Debug, Clone, Default)]
pub struct EmbeddedPragmas {
    pub threads: Option<u32>,
    pub memory_limit_mb: Option<u64>,
    pub temp_dir: Option<String>,
}

pub struct EmbeddedHandle {
    pragmas: EmbeddedPragmas,
    active_path: Mutex<PathBuf>,
    marker_path: PathBuf,
    conn: Mutex<duckdb::Connection>,
}

impl EmbeddedHandle {
    /// Open the shared connection against `path`, restoring the last active
    /// path from `marker_path` when it exists and `path` was not explicitly
    /// overridden by the caller's configuration.
    pub fn open(path: &Path, marker_path: PathBuf, pragmas: EmbeddedPragmas) -> Result<Self> {
        let active = if let Ok(marker) = std::fs::read_to_string(&marker_path) {
            let trimmed = marker.trim();
            if !trimmed.is_empty() {
                PathBuf::from(trimmed)
            } else {
                path.to_path_buf()
            }
        } else {
            path.to_path_buf()
        };

        let conn = Self::connect(&active, &pragmas)?;
        Ok(EmbeddedHandle {
            pragmas,
            active_path: Mutex::new(active),
            marker_path,
            conn: Mutex::new(conn),
        })
    }

    fn connect(path: &Path, pragmas: &EmbeddedPragmas) -> Result<duckdb::Connection> {
        let conn = duckdb::Connection::open(path)
            .map_err(|e| EngineError::Internal(format!("failed to open embedded store: {e}")))?;
        if let Some(threads) = pragmas.threads {
            conn.execute_batch(&format!("PRAGMA threads={threads}"))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }
        if let Some(mem) = pragmas.memory_limit_mb {
            conn.execute_batch(&format!("PRAGMA memory_limit='{mem}MB'"))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }
        if let Some(dir) = &pragmas.temp_dir {
            conn.execute_batch(&format!("PRAGMA temp_directory='{dir}'"))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }
        conn.execute_batch("PRAGMA enable_object_cache")
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(conn)
    }

    /// Run `f` against the shared connection, serializing all callers behind
    /// the same mutex (spec.md §5 "single writer convention").
    pub fn with_connection<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&duckdb::Connection) -> R,
    {
        let guard = self.conn.lock();
        f(&guard)
    }

    pub fn active_path(&self) -> PathBuf {
        self.active_path.lock().clone()
    }

    /// Switch the active embedded file: dispose the current shared
    /// connection, open a new one against `new_path`, and persist the marker
    /// (spec.md §4.11 "Switching the active path").
    pub fn switch_active_path(&self, new_path: PathBuf) -> Result<()> {
        let new_conn = Self::connect(&new_path, &self.pragmas)?;
        *self.conn.lock() = new_conn;
        *self.active_path.lock() = new_path.clone();
        std::fs::write(&self.marker_path, new_path.to_string_lossy().as_bytes())
            .map_err(|e| EngineError::Internal(format!("failed to persist active path marker: {e}")))?;
        info!(path = %new_path.display(), "embedded store active path switched");
        Ok(())
    }

    /// Open a short-lived connection against an explicitly-targeted file
    /// path, independent of the active path (spec.md §4.11 "ephemeral
    /// connections").
    pub fn ephemeral_connection(&self, path: &Path) -> Result<duckdb::Connection> {
        Self::connect(path, &self.pragmas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_file_and_applies_pragmas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.duckdb");
        let marker = dir.path().join("active.marker");
        let handle = EmbeddedHandle::open(
            &path,
            marker,
            EmbeddedPragmas {
                threads: Some(2),
                memory_limit_mb: Some(256),
                temp_dir: None,
            },
        )
        .unwrap();
        assert_eq!(handle.active_path(), path);
    }

    #[test]
    fn switch_active_path_persists_marker() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.duckdb");
        let second = dir.path().join("b.duckdb");
        let marker = dir.path().join("active.marker");
        let handle = EmbeddedHandle::open(&first, marker.clone(), EmbeddedPragmas::default()).unwrap();
        handle.switch_active_path(second.clone()).unwrap();
        assert_eq!(handle.active_path(), second);
        let persisted = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(persisted, second.to_string_lossy());
    }

    #[test]
    fn ephemeral_connection_targets_a_different_path_without_switching_active() {
        let dir = tempdir().unwrap();
        let active = dir.path().join("active.duckdb");
        let other = dir.path().join("other.duckdb");
        let marker = dir.path().join("active.marker");
        let handle = EmbeddedHandle::open(&active, marker, EmbeddedPragmas::default()).unwrap();
        let _ephemeral = handle.ephemeral_connection(&other).unwrap();
        assert_eq!(handle.active_path(), active);
    }
}
