//! Database change monitor.
//!
//! SQLite gives us no change feed for rows written by the catch-up sync, so
//! this polls each watched table on a short interval. A cheap checksum
//! (row count + max `updated_at`) gates a follow-up query for the rows that
//! changed since the last check; every such row is published through the
//! `ChangeNotifier`. The poll task is reference counted: it starts with the
//! first subscriber and stops when the last one leaves.

use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::models::{ChangeEvent, ChangeOperation, ChangeTable};
use crate::notifier::{ChangeListener, ChangeNotifier, SubscriptionId};

/// Tables written by the catch-up sync.
pub const WATCHED_TABLES: &[ChangeTable] = &[
    ChangeTable::CatalogItems,
    ChangeTable::ItemVariations,
    ChangeTable::Categories,
    ChangeTable::Images,
    ChangeTable::VendorData,
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableChecksum {
    row_count: i64,
    max_updated_at: Option<String>,
}

#[derive(Default)]
struct MonitorState {
    subscribers: usize,
    cancel: Option<CancellationToken>,
    checksums: HashMap<ChangeTable, TableChecksum>,
}

pub struct DatabaseChangeMonitor {
    db: Arc<DbState>,
    notifier: Arc<ChangeNotifier>,
    interval: Duration,
    state: Mutex<MonitorState>,
}

impl DatabaseChangeMonitor {
    pub fn new(db: Arc<DbState>, notifier: Arc<ChangeNotifier>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            db,
            notifier,
            interval,
            state: Mutex::new(MonitorState::default()),
        })
    }

    /// Subscribe to change events. The first subscriber starts polling.
    pub fn subscribe(
        self: &Arc<Self>,
        tables: &[ChangeTable],
        listener: ChangeListener,
    ) -> SubscriptionId {
        let id = self.notifier.subscribe(tables, listener);
        let first = match self.state.lock() {
            Ok(mut state) => {
                state.subscribers += 1;
                state.subscribers == 1
            }
            Err(e) => {
                warn!("change monitor lock poisoned: {e}");
                false
            }
        };
        if first {
            self.start();
        }
        id
    }

    /// Drop a subscription. The last unsubscribe stops polling.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if !self.notifier.unsubscribe(id) {
            return;
        }
        let last = match self.state.lock() {
            Ok(mut state) => {
                state.subscribers = state.subscribers.saturating_sub(1);
                state.subscribers == 0
            }
            Err(_) => false,
        };
        if last {
            self.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.cancel.is_some())
            .unwrap_or(false)
    }

    /// Start the poll loop. No-op if it is already running.
    pub fn start(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("change monitor start requested outside a tokio runtime");
            return;
        };

        let token = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.cancel.is_some() {
                return;
            }
            let token = CancellationToken::new();
            state.cancel = Some(token.clone());
            token
        };

        // Baseline first so pre-existing rows are not reported as changes.
        self.prime();

        let monitor = Arc::clone(self);
        let interval = self.interval;
        runtime.spawn(async move {
            info!(
                interval_ms = interval.as_millis() as u64,
                "Database change monitor started"
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        monitor.poll_once();
                    }
                }
            }
            info!("Database change monitor stopped");
        });
    }

    /// Stop the poll loop. No-op if it is not running.
    pub fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
        }
    }

    /// Record current checksums without emitting events.
    pub fn prime(&self) {
        let Ok(conn) = self.db.conn.lock() else {
            return;
        };
        let mut fresh = HashMap::new();
        for table in WATCHED_TABLES {
            if let Some(sum) = table_checksum(&conn, *table) {
                fresh.insert(*table, sum);
            }
        }
        drop(conn);
        if let Ok(mut state) = self.state.lock() {
            state.checksums = fresh;
        }
    }

    /// Run one detection pass and publish whatever changed.
    pub fn poll_once(&self) -> Vec<ChangeEvent> {
        let previous = match self.state.lock() {
            Ok(state) => state.checksums.clone(),
            Err(_) => return Vec::new(),
        };

        let mut events = Vec::new();
        let mut next = HashMap::new();
        {
            let Ok(conn) = self.db.conn.lock() else {
                return Vec::new();
            };
            for table in WATCHED_TABLES {
                let Some(current) = table_checksum(&conn, *table) else {
                    continue;
                };
                match previous.get(table) {
                    Some(prev) if *prev == current => {}
                    Some(prev) => {
                        let rows = changed_rows(&conn, *table, prev.max_updated_at.as_deref());
                        if rows.is_empty() {
                            let op = if current.row_count < prev.row_count {
                                ChangeOperation::Delete
                            } else {
                                ChangeOperation::Update
                            };
                            events.push(ChangeEvent::table_wide(*table, op));
                        } else {
                            events.extend(rows);
                        }
                    }
                    // Table appeared since the last pass.
                    None => {
                        if current.row_count > 0 {
                            events.push(ChangeEvent::table_wide(*table, ChangeOperation::Insert));
                        }
                    }
                }
                next.insert(*table, current);
            }
        }

        if let Ok(mut state) = self.state.lock() {
            state.checksums = next;
        }

        if !events.is_empty() {
            debug!(count = events.len(), "Database change monitor detected changes");
        }
        for event in &events {
            self.notifier.publish(event);
        }
        events
    }
}

fn table_checksum(conn: &Connection, table: ChangeTable) -> Option<TableChecksum> {
    let name = table.table_name();
    if !db::table_exists(conn, name) {
        return None;
    }
    let sql = format!("SELECT COUNT(*), MAX(updated_at) FROM {name}");
    conn.query_row(&sql, [], |row| {
        Ok(TableChecksum {
            row_count: row.get(0)?,
            max_updated_at: row.get(1)?,
        })
    })
    .map_err(|e| warn!(table = name, "checksum query failed: {e}"))
    .ok()
}

fn changed_rows(conn: &Connection, table: ChangeTable, since: Option<&str>) -> Vec<ChangeEvent> {
    let name = table.table_name();
    let column = table.entity_column();
    let deleted_expr = if table == ChangeTable::VendorData {
        "0"
    } else {
        "is_deleted"
    };
    let sql = format!(
        "SELECT {column}, {deleted_expr} FROM {name}
         WHERE updated_at > ?1 ORDER BY updated_at ASC"
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => {
            warn!(table = name, "changed rows prepare failed: {e}");
            return Vec::new();
        }
    };
    let rows = stmt.query_map(params![since.unwrap_or("")], |row| {
        Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
    });
    let mut seen = HashSet::new();
    match rows {
        Ok(rows) => rows
            .flatten()
            .filter_map(|(id, deleted)| {
                let id = id?;
                if !seen.insert(id.clone()) {
                    return None;
                }
                let op = if deleted != 0 {
                    ChangeOperation::Delete
                } else {
                    ChangeOperation::Update
                };
                Some(ChangeEvent::row(table, op, &id))
            })
            .collect(),
        Err(e) => {
            warn!(table = name, "changed rows query failed: {e}");
            Vec::new()
        }
    }
}
