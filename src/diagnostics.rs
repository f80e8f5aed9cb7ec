//! Diagnostics for the reorder sync core.
//!
//! Provides:
//! - **Build info**: version, build timestamp, git SHA, platform
//! - **Sync health**: queue backlog by operation and status, recent errors
//! - **Log rotation helpers**: used by `logging` to place and prune log files

use rusqlite::params;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db::DbState;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "reorder";

// ---------------------------------------------------------------------------
// Build info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: &'static str,
    pub build_timestamp: &'static str,
    pub git_sha: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
}

/// Version, build timestamp, git SHA and platform of this build.
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        git_sha: env!("BUILD_GIT_SHA"),
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}

// ---------------------------------------------------------------------------
// Sync health
// ---------------------------------------------------------------------------

/// Queue backlog and recent failures, for a support/health screen.
pub fn get_sync_health(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let schema_version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    let unsynced_records: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM reorder_items WHERE pending_sync = 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(json!({
        "build": build_info(),
        "schemaVersion": schema_version,
        "unsyncedRecords": unsynced_records,
        "syncBacklog": get_sync_backlog(&conn),
        "recentErrors": get_recent_sync_errors(&conn, 20),
    }))
}

fn get_sync_backlog(conn: &rusqlite::Connection) -> Value {
    let mut result = serde_json::Map::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT operation, status, COUNT(*) FROM sync_queue GROUP BY operation, status",
    ) {
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .ok();
        if let Some(rows) = rows {
            for (operation, status, count) in rows.flatten() {
                let entry = result.entry(operation).or_insert_with(|| json!({}));
                entry[&status] = json!(count);
            }
        }
    }
    Value::Object(result)
}

fn get_recent_sync_errors(conn: &rusqlite::Connection, limit: i64) -> Vec<Value> {
    let mut errors = Vec::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT id, operation, entity_id, status, last_error, retry_count, created_at
         FROM sync_queue
         WHERE last_error IS NOT NULL AND last_error != ''
         ORDER BY updated_at DESC, id DESC LIMIT ?1",
    ) {
        if let Ok(rows) = stmt.query_map(params![limit], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "operation": row.get::<_, String>(1)?,
                "entityId": row.get::<_, String>(2)?,
                "status": row.get::<_, String>(3)?,
                "lastError": row.get::<_, String>(4)?,
                "retryCount": row.get::<_, i64>(5)?,
                "createdAt": row.get::<_, String>(6)?,
            }))
        }) {
            errors.extend(rows.flatten());
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Default log directory under the platform's local data dir.
pub fn get_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.reorder").join("logs")
}

/// Keep only the newest `MAX_LOG_FILES` log files in `log_dir`.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
