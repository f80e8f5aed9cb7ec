//! Cold-start recovery.
//!
//! A fresh install (or a wiped database) starts with an empty reorder list
//! and no vendor data even though the team's backend has both. On first
//! launch with both tables empty, pull them once. The outcome is recorded
//! in `local_settings` so later launches never try again.

use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{SyncError, SyncResult};
use crate::models::{format_ts, ChangeEvent, ChangeOperation, ChangeTable, VendorSnapshot};
use crate::notifier::ChangeNotifier;
use crate::remote::RemoteReorderStore;
use crate::reorder::{MergeBatch, ReorderStore};

const SETTINGS_CATEGORY: &str = "recovery";
const STATUS_KEY: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Attempted,
    Succeeded,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Attempted => "attempted",
            RecoveryStatus::Succeeded => "succeeded",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "attempted" => Some(RecoveryStatus::Attempted),
            "succeeded" => Some(RecoveryStatus::Succeeded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A previous launch already ran recovery.
    AlreadyRan(RecoveryStatus),
    /// Local data exists; nothing to recover.
    LocalDataPresent,
    Recovered { records: usize, vendor_rows: usize },
    /// The pull failed; the app continues local-only.
    Deferred,
}

pub struct RecoveryService {
    db: Arc<DbState>,
    store: Arc<ReorderStore>,
    remote: Arc<dyn RemoteReorderStore>,
    notifier: Arc<ChangeNotifier>,
}

impl RecoveryService {
    pub fn new(
        db: Arc<DbState>,
        store: Arc<ReorderStore>,
        remote: Arc<dyn RemoteReorderStore>,
        notifier: Arc<ChangeNotifier>,
    ) -> Self {
        Self {
            db,
            store,
            remote,
            notifier,
        }
    }

    pub fn status(&self) -> Option<RecoveryStatus> {
        let conn = self.db.conn.lock().ok()?;
        db::get_setting(&conn, SETTINGS_CATEGORY, STATUS_KEY)
            .as_deref()
            .and_then(RecoveryStatus::parse)
    }

    pub async fn run_if_needed(&self) -> SyncResult<RecoveryOutcome> {
        if let Some(status) = self.status() {
            return Ok(RecoveryOutcome::AlreadyRan(status));
        }

        let empty = {
            let conn = self.db.conn.lock()?;
            is_empty(&conn, "reorder_items")? && is_empty(&conn, "vendor_data")?
        };
        if !empty {
            return Ok(RecoveryOutcome::LocalDataPresent);
        }

        // Recorded up front so a crash mid-pull does not retry forever.
        self.set_status(RecoveryStatus::Attempted)?;
        info!("local reorder data empty; attempting one-time recovery");

        let records = match self.remote.list_records().await {
            Ok(records) => records,
            Err(e) => {
                warn!("recovery pull of reorder records failed, continuing local-only: {e}");
                return Ok(RecoveryOutcome::Deferred);
            }
        };
        let vendor_rows = match self.remote.list_vendor_data().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("recovery pull of vendor data failed, continuing local-only: {e}");
                return Ok(RecoveryOutcome::Deferred);
            }
        };

        let valid: Vec<_> = records
            .into_iter()
            .filter(|record| match record.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(record_id = %record.id, "skipping invalid recovered record: {e}");
                    false
                }
            })
            .collect();
        let record_count = valid.len();
        self.store.apply_merge(MergeBatch {
            adopt: valid,
            ..MergeBatch::default()
        })?;

        let vendor_count = {
            let mut conn = self.db.conn.lock()?;
            upsert_vendor_rows(&mut conn, &vendor_rows)?
        };
        for row in &vendor_rows {
            self.notifier.publish(&ChangeEvent::row(
                ChangeTable::VendorData,
                ChangeOperation::Insert,
                &row.item_id,
            ));
        }

        self.set_status(RecoveryStatus::Succeeded)?;
        info!(
            records = record_count,
            vendor_rows = vendor_count,
            "recovery complete"
        );
        Ok(RecoveryOutcome::Recovered {
            records: record_count,
            vendor_rows: vendor_count,
        })
    }

    fn set_status(&self, status: RecoveryStatus) -> SyncResult<()> {
        let conn = self.db.conn.lock()?;
        db::set_setting(&conn, SETTINGS_CATEGORY, STATUS_KEY, status.as_str())
            .map_err(SyncError::Storage)
    }
}

fn is_empty(conn: &Connection, table: &str) -> SyncResult<bool> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .map_err(SyncError::from_sqlite)?;
    Ok(count == 0)
}

fn upsert_vendor_rows(conn: &mut Connection, rows: &[VendorSnapshot]) -> SyncResult<usize> {
    let now = format_ts(&Utc::now());
    let tx = conn.transaction()?;
    for row in rows {
        tx.execute(
            "INSERT INTO vendor_data
                (item_id, vendor, case_cost, case_quantity, discontinued, notes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(item_id) DO UPDATE SET
                vendor = excluded.vendor,
                case_cost = excluded.case_cost,
                case_quantity = excluded.case_quantity,
                discontinued = excluded.discontinued,
                notes = excluded.notes,
                updated_at = excluded.updated_at",
            params![
                row.item_id,
                row.vendor,
                row.case_cost,
                row.case_quantity,
                row.discontinued as i64,
                row.notes,
                now
            ],
        )?;
    }
    tx.commit()?;
    Ok(rows.len())
}
