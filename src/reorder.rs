//! Reorder record store.
//!
//! Holds the in-memory working set of reorder records and persists every
//! mutation to SQLite together with its outbound `sync_queue` row in one
//! transaction, before returning. The caller never waits on the network;
//! the sync engine picks up queued operations later.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{SyncError, SyncResult};
use crate::models::{format_ts, parse_ts, OperationKind, ReorderRecord, ReorderStatus};
use crate::sync;

/// Called with the full item list after every mutation or merge.
pub type ItemsListener = Arc<dyn Fn(&[ReorderRecord]) + Send + Sync>;

/// Called after a mutation queued outbound work.
pub type EnqueueHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, ItemsListener)>>,
}

/// Returned by `add_listener`; call `unsubscribe` to stop notifications.
pub struct ListenerHandle {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let Ok(mut entries) = registry.entries.lock() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != self.id);
        entries.len() != before
    }
}

/// Remote-sourced changes applied as one transaction and one notification.
#[derive(Debug, Default)]
pub(crate) struct MergeBatch {
    /// Remote copies written as-is; nothing queued.
    pub adopt: Vec<ReorderRecord>,
    /// Local state to push back out with the given operation.
    pub push: Vec<(ReorderRecord, OperationKind)>,
    /// Rows removed locally without queueing anything.
    pub delete: Vec<String>,
    /// Rows superseded by a remote copy under another id; their pending
    /// queue operations are dropped too.
    pub rekey: Vec<String>,
    /// Conflicting queue operations settled by this merge; removed in the
    /// same transaction.
    pub resolved_ops: Vec<i64>,
}

impl MergeBatch {
    pub fn is_empty(&self) -> bool {
        self.adopt.is_empty()
            && self.push.is_empty()
            && self.delete.is_empty()
            && self.rekey.is_empty()
            && self.resolved_ops.is_empty()
    }
}

pub struct ReorderStore {
    db: Arc<DbState>,
    items: Mutex<Vec<ReorderRecord>>,
    listeners: Arc<ListenerRegistry>,
    on_enqueue: Mutex<Option<EnqueueHook>>,
}

impl ReorderStore {
    /// Load the working set from `reorder_items`.
    pub fn load(db: Arc<DbState>) -> SyncResult<Arc<Self>> {
        let items = {
            let conn = db.conn.lock()?;
            load_records(&conn)?
        };
        info!(count = items.len(), "reorder list loaded");
        Ok(Arc::new(Self {
            db,
            items: Mutex::new(items),
            listeners: Arc::new(ListenerRegistry::default()),
            on_enqueue: Mutex::new(None),
        }))
    }

    pub fn get_items(&self) -> Vec<ReorderRecord> {
        self.items.lock().map(|items| items.clone()).unwrap_or_default()
    }

    pub fn get_count(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn get_item(&self, id: &str) -> Option<ReorderRecord> {
        self.items
            .lock()
            .ok()?
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn add_listener(&self, listener: ItemsListener) -> ListenerHandle {
        let id = self.listeners.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut entries) = self.listeners.entries.lock() {
            entries.push((id, listener));
        }
        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn set_enqueue_hook(&self, hook: EnqueueHook) {
        if let Ok(mut slot) = self.on_enqueue.lock() {
            *slot = Some(hook);
        }
    }

    /// Add `quantity` of `item_ref`. An incomplete record for the same item
    /// is reused: `overwrite` replaces its quantity, otherwise it is summed.
    pub fn add_item(
        &self,
        item_ref: &str,
        quantity: i64,
        added_by: &str,
        overwrite: bool,
    ) -> SyncResult<ReorderRecord> {
        let item_ref = item_ref.trim();
        if item_ref.is_empty() {
            return Err(SyncError::Validation("item reference is empty".into()));
        }
        if quantity < 1 {
            return Err(SyncError::Validation(format!(
                "quantity must be at least 1 (got {quantity})"
            )));
        }

        let now = Utc::now();
        let (record, operation) = {
            let mut items = self.items.lock()?;
            let existing = items
                .iter()
                .find(|r| r.catalog_item_id == item_ref && r.status == ReorderStatus::Incomplete)
                .cloned();

            let (record, operation) = match existing {
                Some(mut record) => {
                    record.quantity = if overwrite {
                        quantity
                    } else {
                        record.quantity.checked_add(quantity).ok_or_else(|| {
                            SyncError::Validation(format!(
                                "quantity {} + {quantity} is out of range",
                                record.quantity
                            ))
                        })?
                    };
                    record.updated_at = now;
                    (record, OperationKind::Update)
                }
                None => (
                    ReorderRecord {
                        id: Uuid::new_v4().to_string(),
                        catalog_item_id: item_ref.to_string(),
                        quantity,
                        status: ReorderStatus::Incomplete,
                        added_by: added_by.to_string(),
                        created_at: now,
                        updated_at: now,
                    },
                    OperationKind::Create,
                ),
            };

            self.persist_upsert(&record, operation)?;
            upsert_in_memory(&mut items, record.clone());
            (record, operation)
        };

        info!(
            record_id = %record.id,
            item_id = %record.catalog_item_id,
            quantity = record.quantity,
            operation = %operation,
            "reorder item added"
        );
        self.after_mutation();
        Ok(record)
    }

    pub fn update_status(&self, id: &str, status: ReorderStatus) -> SyncResult<ReorderRecord> {
        let record = self.modify(id, |record| record.status = status)?;
        info!(record_id = %id, status = %status, "reorder status updated");
        Ok(record)
    }

    pub fn update_quantity(&self, id: &str, quantity: i64) -> SyncResult<ReorderRecord> {
        if quantity < 1 {
            return Err(SyncError::Validation(format!(
                "quantity must be at least 1 (got {quantity})"
            )));
        }
        let record = self.modify(id, |record| record.quantity = quantity)?;
        info!(record_id = %id, quantity, "reorder quantity updated");
        Ok(record)
    }

    pub fn remove(&self, id: &str) -> SyncResult<ReorderRecord> {
        let record = self.delete_local(id)?;
        info!(record_id = %id, item_id = %record.catalog_item_id, "reorder item removed");
        Ok(record)
    }

    /// The delivery arrived: the record leaves the list.
    pub fn mark_received(&self, id: &str) -> SyncResult<ReorderRecord> {
        let record = self.delete_local(id)?;
        info!(
            record_id = %id,
            item_id = %record.catalog_item_id,
            quantity = record.quantity,
            "reorder item received"
        );
        Ok(record)
    }

    /// Remove every record, queueing one DELETE per record.
    pub fn clear(&self) -> SyncResult<usize> {
        let removed = {
            let mut items = self.items.lock()?;
            if items.is_empty() {
                return Ok(0);
            }
            let mut conn = self.db.conn.lock()?;
            let tx = conn.transaction()?;
            for record in items.iter() {
                tx.execute("DELETE FROM reorder_items WHERE id = ?1", params![record.id])?;
                sync::enqueue_op(
                    &tx,
                    OperationKind::Delete,
                    &record.id,
                    &delete_payload(&record.id),
                )?;
            }
            tx.commit()?;
            let removed = items.len();
            items.clear();
            removed
        };
        info!(count = removed, "reorder list cleared");
        self.after_mutation();
        Ok(removed)
    }

    /// Apply remote-sourced changes in one transaction.
    pub(crate) fn apply_merge(&self, batch: MergeBatch) -> SyncResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let queued = !batch.push.is_empty();
        {
            let mut items = self.items.lock()?;
            let mut conn = self.db.conn.lock()?;
            let tx = conn.transaction()?;
            let now = format_ts(&Utc::now());

            for id in &batch.rekey {
                tx.execute("DELETE FROM reorder_items WHERE id = ?1", params![id])?;
                sync::drop_pending_ops(&tx, id)?;
            }
            for id in &batch.delete {
                tx.execute("DELETE FROM reorder_items WHERE id = ?1", params![id])?;
            }
            for record in &batch.adopt {
                write_row(&tx, record, false, Some(now.as_str()))?;
            }
            for (record, operation) in &batch.push {
                write_row(&tx, record, true, None)?;
                sync::enqueue_op(&tx, *operation, &record.id, &serde_json::to_value(record)?)?;
            }
            for op_id in &batch.resolved_ops {
                sync::settle_op(&tx, *op_id)?;
            }
            tx.commit()?;

            items.retain(|r| !batch.rekey.contains(&r.id) && !batch.delete.contains(&r.id));
            for record in batch.adopt.iter().chain(batch.push.iter().map(|(r, _)| r)) {
                upsert_in_memory(&mut items, record.clone());
            }
        }
        debug!(
            adopted = batch.adopt.len(),
            pushed = batch.push.len(),
            deleted = batch.delete.len() + batch.rekey.len(),
            "remote changes merged"
        );
        if queued {
            self.after_mutation();
        } else {
            self.notify();
        }
        Ok(())
    }

    fn modify(&self, id: &str, change: impl FnOnce(&mut ReorderRecord)) -> SyncResult<ReorderRecord> {
        let record = {
            let mut items = self.items.lock()?;
            let mut record = items
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("reorder record {id}")))?;
            change(&mut record);
            record.updated_at = Utc::now();
            self.persist_upsert(&record, OperationKind::Update)?;
            upsert_in_memory(&mut items, record.clone());
            record
        };
        self.after_mutation();
        Ok(record)
    }

    fn delete_local(&self, id: &str) -> SyncResult<ReorderRecord> {
        let record = {
            let mut items = self.items.lock()?;
            let position = items
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| SyncError::NotFound(format!("reorder record {id}")))?;

            let mut conn = self.db.conn.lock()?;
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM reorder_items WHERE id = ?1", params![id])?;
            sync::enqueue_op(&tx, OperationKind::Delete, id, &delete_payload(id))?;
            tx.commit()?;
            items.remove(position)
        };
        self.after_mutation();
        Ok(record)
    }

    /// Write the row and its queue entry atomically.
    fn persist_upsert(&self, record: &ReorderRecord, operation: OperationKind) -> SyncResult<()> {
        record.validate()?;
        let payload = serde_json::to_value(record)?;
        let mut conn = self.db.conn.lock()?;
        let tx = conn.transaction()?;
        write_row(&tx, record, true, None)?;
        sync::enqueue_op(&tx, operation, &record.id, &payload)?;
        tx.commit()?;
        Ok(())
    }

    fn after_mutation(&self) {
        self.notify();
        let hook = self.on_enqueue.lock().ok().and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            hook();
        }
    }

    fn notify(&self) {
        let snapshot = self.get_items();
        let listeners: Vec<ItemsListener> = match self.listeners.entries.lock() {
            Ok(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            Err(e) => {
                warn!("reorder listener lock poisoned: {e}");
                return;
            }
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

fn delete_payload(id: &str) -> serde_json::Value {
    serde_json::json!({ "id": id })
}

fn upsert_in_memory(items: &mut Vec<ReorderRecord>, record: ReorderRecord) {
    match items.iter_mut().find(|r| r.id == record.id) {
        Some(slot) => *slot = record,
        None => {
            items.push(record);
            items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        }
    }
}

fn write_row(
    tx: &Transaction<'_>,
    record: &ReorderRecord,
    pending_sync: bool,
    last_sync_at: Option<&str>,
) -> SyncResult<()> {
    tx.execute(
        "INSERT INTO reorder_items
            (id, item_id, quantity, status, added_by, created_at, updated_at, last_sync_at, pending_sync)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            item_id = excluded.item_id,
            quantity = excluded.quantity,
            status = excluded.status,
            added_by = excluded.added_by,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            last_sync_at = COALESCE(excluded.last_sync_at, reorder_items.last_sync_at),
            pending_sync = excluded.pending_sync",
        params![
            record.id,
            record.catalog_item_id,
            record.quantity,
            record.status.as_str(),
            record.added_by,
            format_ts(&record.created_at),
            format_ts(&record.updated_at),
            last_sync_at,
            pending_sync as i64,
        ],
    )?;
    Ok(())
}

pub(crate) fn load_records(conn: &Connection) -> SyncResult<Vec<ReorderRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, item_id, quantity, status, added_by, created_at, updated_at
             FROM reorder_items ORDER BY created_at, id",
        )
        .map_err(SyncError::from_sqlite)?;
    let rows = stmt.query_map([], |row| {
        let status: String = row.get(3)?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;
        Ok(ReorderRecord {
            id: row.get(0)?,
            catalog_item_id: row.get(1)?,
            quantity: row.get(2)?,
            status: status.parse().unwrap_or(ReorderStatus::Incomplete),
            added_by: row.get(4)?,
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// `pending_sync` flag of one row, if the row exists.
pub(crate) fn pending_flag(conn: &Connection, id: &str) -> SyncResult<Option<bool>> {
    Ok(conn
        .query_row(
            "SELECT pending_sync FROM reorder_items WHERE id = ?1",
            params![id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .map(|flag| flag != 0))
}
