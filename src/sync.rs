//! Outbound sync engine for the reorder list.
//!
//! Every local mutation lands in `sync_queue` (see `reorder::ReorderStore`).
//! This module drains that queue against the shared backend:
//!
//! - Mutations arm a debounce timer; a full batch flushes immediately.
//! - Ready operations are grouped into per-record chains that run in
//!   enqueue order, with a bounded number of chains in flight.
//! - Failures back off exponentially and are dropped (`failed`) once the
//!   retry limit is exceeded. Later operations of the same record wait.
//! - Expired credentials trigger one refresh, then offline mode.
//! - Conflicts are resolved by pulling the remote list and merging. The
//!   conflicting operation stays queued until that merge is written.
//!
//! Remote state comes back through `reload_from_remote` (bulk, merge by
//! identity) and `apply_remote_change` (single pushed change).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolutionStrategy, ConflictResolver, Reconciliation};
use crate::db::DbState;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    format_ts, parse_ts, OperationKind, QueuedOperationSummary, ReorderRecord, SyncOperation,
    SyncStatus,
};
use crate::reorder::{MergeBatch, ReorderStore};
use crate::remote::{RemoteChange, RemoteReorderStore};
use crate::scheduler::{backoff_delay, DebounceTimer};

const STATUS_PENDING: &str = "pending";
const STATUS_IN_PROGRESS: &str = "in_progress";
const STATUS_FAILED: &str = "failed";

// ---------------------------------------------------------------------------
// Queue persistence
// ---------------------------------------------------------------------------

/// Append one operation to `sync_queue`. Runs inside the caller's transaction.
pub(crate) fn enqueue_op(
    conn: &Connection,
    operation: OperationKind,
    entity_id: &str,
    payload: &serde_json::Value,
) -> SyncResult<i64> {
    conn.execute(
        "INSERT INTO sync_queue (entity_id, operation, payload, status, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![
            entity_id,
            operation.as_str(),
            payload.to_string(),
            format_ts(&Utc::now())
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Forget queued (not yet dispatched) operations for one record.
pub(crate) fn drop_pending_ops(conn: &Connection, entity_id: &str) -> SyncResult<usize> {
    Ok(conn.execute(
        "DELETE FROM sync_queue WHERE entity_id = ?1 AND status = 'pending'",
        params![entity_id],
    )?)
}

fn has_pending_ops(conn: &Connection, entity_id: &str) -> SyncResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue
         WHERE entity_id = ?1 AND status IN ('pending', 'in_progress')",
        params![entity_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Records with queued or in-flight work, ignoring the operations in
/// `exclude`.
fn pending_entity_ids(conn: &Connection, exclude: &[i64]) -> SyncResult<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_id FROM sync_queue WHERE status IN ('pending', 'in_progress')",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
    let mut ids = HashSet::new();
    for row in rows {
        let (op_id, entity_id) = row?;
        if !exclude.contains(&op_id) {
            ids.insert(entity_id);
        }
    }
    Ok(ids)
}

/// Records deleted on this device whose DELETE has not reached the backend,
/// including DELETEs dropped after the retry limit.
fn locally_deleted_ids(conn: &Connection) -> SyncResult<HashSet<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT entity_id FROM sync_queue WHERE operation = 'DELETE'")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

fn count_with_status(conn: &Connection, statuses: &[&str]) -> SyncResult<usize> {
    let placeholders = (1..=statuses.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM sync_queue WHERE status IN ({placeholders})"),
        rusqlite::params_from_iter(statuses.iter()),
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn load_pending_ops(conn: &Connection) -> SyncResult<Vec<SyncOperation>> {
    let mut stmt = conn.prepare(
        "SELECT id, operation, entity_id, payload, created_at, retry_count, next_retry_at, last_error
         FROM sync_queue WHERE status = 'pending' ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
        ))
    })?;

    let mut ops = Vec::new();
    for row in rows {
        let (id, operation, entity_id, payload, created_at, retry_count, next_retry_at, last_error) =
            row?;
        let operation: OperationKind = match operation.parse() {
            Ok(op) => op,
            Err(e) => {
                warn!(op_id = id, "skipping unreadable queue row: {e}");
                continue;
            }
        };
        ops.push(SyncOperation {
            id,
            operation,
            entity_id,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            enqueued_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            retry_count,
            next_retry_at: next_retry_at.as_deref().and_then(parse_ts),
            last_error,
        });
    }
    Ok(ops)
}

/// Group pending operations into per-record chains, in enqueue order.
///
/// A chain stops at its first operation still backing off. At most `limit`
/// operations are returned in total.
fn build_chains(ops: Vec<SyncOperation>, now: DateTime<Utc>, limit: usize) -> Vec<Vec<SyncOperation>> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<SyncOperation>> = HashMap::new();
    for op in ops {
        if !grouped.contains_key(&op.entity_id) {
            order.push(op.entity_id.clone());
        }
        grouped.entry(op.entity_id.clone()).or_default().push(op);
    }

    let mut chains = Vec::new();
    let mut budget = limit.max(1);
    for entity in order {
        if budget == 0 {
            break;
        }
        let Some(ops) = grouped.remove(&entity) else {
            continue;
        };
        let chain: Vec<SyncOperation> = ops
            .into_iter()
            .take_while(|op| op.next_retry_at.map_or(true, |at| at <= now))
            .take(budget)
            .collect();
        if !chain.is_empty() {
            budget -= chain.len();
            chains.push(chain);
        }
    }
    chains
}

fn set_status(conn: &Connection, ids: &[i64], status: &str) -> SyncResult<()> {
    for id in ids {
        conn.execute(
            "UPDATE sync_queue SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![status, id],
        )?;
    }
    Ok(())
}

/// Remove a finished operation; clear `pending_sync` once the record has
/// nothing left in flight.
fn complete_op(conn: &Connection, op: &SyncOperation) -> SyncResult<()> {
    conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![op.id])?;
    if !has_pending_ops(conn, &op.entity_id)? {
        conn.execute(
            "UPDATE reorder_items SET pending_sync = 0, last_sync_at = ?1 WHERE id = ?2",
            params![format_ts(&Utc::now()), op.entity_id],
        )?;
    }
    Ok(())
}

/// Remove a conflicting operation whose outcome a merge has recorded.
/// Runs inside the merge transaction.
pub(crate) fn settle_op(conn: &Connection, op_id: i64) -> SyncResult<()> {
    let entity_id: Option<String> = conn
        .query_row(
            "SELECT entity_id FROM sync_queue WHERE id = ?1",
            params![op_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(entity_id) = entity_id else {
        return Ok(());
    };
    conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![op_id])?;
    if !has_pending_ops(conn, &entity_id)? {
        conn.execute(
            "UPDATE reorder_items SET pending_sync = 0 WHERE id = ?1",
            params![entity_id],
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Counters for one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub synced: usize,
    pub retried: usize,
    pub dropped: usize,
    pub conflicts: usize,
    pub went_offline: bool,
}

enum ChainOutcome {
    Done,
    Backoff,
    Dropped,
    /// The operation stays `in_progress` until a reload settles it.
    Conflict(SyncOperation),
    AuthExpired,
}

struct ChainResult {
    synced: usize,
    outcome: ChainOutcome,
}

pub struct ReorderSyncEngine {
    db: Arc<DbState>,
    store: Arc<ReorderStore>,
    remote: Arc<dyn RemoteReorderStore>,
    resolver: ConflictResolver,
    config: SyncConfig,
    debounce: DebounceTimer,
    flush_lock: tokio::sync::Mutex<()>,
    online: AtomicBool,
    last_sync: Mutex<Option<String>>,
    this: Weak<ReorderSyncEngine>,
}

impl ReorderSyncEngine {
    /// Build the engine and hook it to the store so every mutation
    /// schedules a flush.
    pub fn new(
        db: Arc<DbState>,
        store: Arc<ReorderStore>,
        remote: Arc<dyn RemoteReorderStore>,
        strategy: Box<dyn ConflictResolutionStrategy>,
        config: SyncConfig,
    ) -> Arc<Self> {
        match db.conn.lock() {
            Ok(conn) => {
                // Anything left in flight by a previous process is retried.
                match conn.execute(
                    "UPDATE sync_queue SET status = 'pending' WHERE status = 'in_progress'",
                    [],
                ) {
                    Ok(n) if n > 0 => info!(count = n, "requeued interrupted sync operations"),
                    Ok(_) => {}
                    Err(e) => warn!("failed to requeue interrupted sync operations: {e}"),
                }
            }
            Err(e) => warn!("sync engine: db lock poisoned: {e}"),
        }

        let engine = Arc::new_cyclic(|this| Self {
            db,
            store: store.clone(),
            remote,
            resolver: ConflictResolver::new(strategy),
            config,
            debounce: DebounceTimer::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            online: AtomicBool::new(true),
            last_sync: Mutex::new(None),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&engine);
        store.set_enqueue_hook(Arc::new(move || {
            if let Some(engine) = weak.upgrade() {
                engine.schedule_flush();
            }
        }));
        engine
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            if online {
                info!("reorder sync back online");
            } else {
                warn!("reorder sync offline; queued operations kept for later");
            }
        }
    }

    /// Debounce a flush, or flush right away once a full batch is queued.
    pub fn schedule_flush(&self) {
        let pending = self
            .with_conn(|conn| count_with_status(conn, &[STATUS_PENDING]))
            .unwrap_or(0);

        if pending >= self.config.max_batch_size {
            debug!(pending, "batch full; flushing now");
            self.debounce.cancel();
            let Some(task) = self.flush_task() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(task);
                }
                Err(_) => warn!("flush requested outside a tokio runtime"),
            }
            return;
        }

        if let Some(task) = self.flush_task() {
            self.debounce.schedule_after(self.config.debounce(), task);
        }
    }

    fn flush_task(&self) -> Option<impl Future<Output = ()> + Send + 'static> {
        let engine = self.this.upgrade()?;
        Some(async move {
            engine.debounce.clear_fired();
            if let Err(e) = engine.flush().await {
                warn!("scheduled reorder flush failed: {e}");
            }
        })
    }

    /// Flush now, bypassing debounce and backoff, then pull remote state.
    pub async fn force_sync(&self) -> SyncResult<FlushReport> {
        self.debounce.cancel();

        if !self.is_online() {
            if self.remote.check_connectivity().await {
                self.set_online(true);
            } else {
                return Err(SyncError::TransientNetwork("backend unreachable".into()));
            }
        }

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue SET next_retry_at = NULL WHERE status = 'pending'",
                [],
            )?;
            Ok(())
        })?;

        let report = self.flush().await?;
        if self.is_online() {
            if let Err(e) = self.reload_from_remote().await {
                warn!("post-sync reload failed: {e}");
            }
        }
        info!(
            synced = report.synced,
            retried = report.retried,
            dropped = report.dropped,
            "forced reorder sync complete"
        );
        Ok(report)
    }

    /// Cancel any armed flush timer. Queued operations stay persisted.
    pub fn shutdown(&self) {
        if self.debounce.cancel() {
            debug!("pending reorder flush cancelled on shutdown");
        }
    }

    pub async fn on_foreground(&self) {
        debug!("app foregrounded; forcing reorder sync");
        if let Err(e) = self.force_sync().await {
            warn!("foreground sync failed: {e}");
        }
    }

    pub async fn on_background(&self) {
        debug!("app backgrounded; flushing reorder queue");
        if let Err(e) = self.force_sync().await {
            warn!("background sync failed: {e}");
        }
    }

    /// Drain every ready operation. One flush runs at a time.
    pub async fn flush(&self) -> SyncResult<FlushReport> {
        let _guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();

        if !self.is_online() {
            debug!("offline; skipping reorder flush");
            return Ok(report);
        }

        let mut refreshed = false;
        let mut reloaded = false;
        loop {
            let chains = self.with_conn(|conn| {
                let chains = build_chains(
                    load_pending_ops(conn)?,
                    Utc::now(),
                    self.config.max_batch_size,
                );
                let ids: Vec<i64> = chains.iter().flatten().map(|op| op.id).collect();
                set_status(conn, &ids, STATUS_IN_PROGRESS)?;
                Ok(chains)
            })?;
            if chains.is_empty() {
                break;
            }

            let op_count: usize = chains.iter().map(Vec::len).sum();
            debug!(chains = chains.len(), operations = op_count, "dispatching reorder batch");

            let allow_conflict_reload = !reloaded;
            let results: Vec<ChainResult> = stream::iter(chains)
                .map(|chain| self.run_chain(chain, allow_conflict_reload))
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;

            let mut auth_expired = false;
            let mut conflicted: Vec<SyncOperation> = Vec::new();
            for result in results {
                report.synced += result.synced;
                match result.outcome {
                    ChainOutcome::Done => {}
                    ChainOutcome::Backoff => report.retried += 1,
                    ChainOutcome::Dropped => report.dropped += 1,
                    ChainOutcome::Conflict(op) => {
                        report.conflicts += 1;
                        conflicted.push(op);
                    }
                    ChainOutcome::AuthExpired => auth_expired = true,
                }
            }
            if report.synced > 0 {
                self.mark_synced_now();
            }

            if auth_expired {
                let ids: Vec<i64> = conflicted.iter().map(|op| op.id).collect();
                self.release(&ids);
                if !refreshed && matches!(self.remote.refresh_auth().await, Ok(true)) {
                    info!("backend credentials refreshed; resuming flush");
                    refreshed = true;
                    continue;
                }
                self.set_online(false);
                report.went_offline = true;
                break;
            }

            if !conflicted.is_empty() {
                reloaded = true;
                self.settle_conflicts(&conflicted, &mut report).await;
            }
        }

        self.arm_retry_timer();
        Ok(report)
    }

    async fn run_chain(&self, chain: Vec<SyncOperation>, allow_conflict_reload: bool) -> ChainResult {
        let mut synced = 0;
        let mut remaining = chain.into_iter();
        while let Some(op) = remaining.next() {
            match self.dispatch(&op).await {
                Ok(()) => {
                    if let Err(e) = self.with_conn(|conn| complete_op(conn, &op)) {
                        warn!(op_id = op.id, "failed to complete sync operation: {e}");
                    }
                    self.set_online(true);
                    synced += 1;
                }
                Err(err) => {
                    let rest: Vec<i64> = remaining.map(|op| op.id).collect();
                    let outcome = if err.is_auth() {
                        warn!(op_id = op.id, entity_id = %op.entity_id, "sync auth expired: {err}");
                        let mut ids = vec![op.id];
                        ids.extend(&rest);
                        self.release(&ids);
                        return ChainResult {
                            synced,
                            outcome: ChainOutcome::AuthExpired,
                        };
                    } else if err.is_conflict() && allow_conflict_reload {
                        info!(op_id = op.id, entity_id = %op.entity_id, "remote conflict; will reconcile");
                        ChainOutcome::Conflict(op)
                    } else {
                        self.record_failure(&op, &err)
                    };
                    self.release(&rest);
                    return ChainResult { synced, outcome };
                }
            }
        }
        ChainResult {
            synced,
            outcome: ChainOutcome::Done,
        }
    }

    async fn dispatch(&self, op: &SyncOperation) -> SyncResult<()> {
        match op.operation {
            OperationKind::Create => {
                let record: ReorderRecord = serde_json::from_value(op.payload.clone())?;
                self.remote.create_record(&record).await
            }
            OperationKind::Update => {
                let record: ReorderRecord = serde_json::from_value(op.payload.clone())?;
                self.remote.update_record(&record).await
            }
            OperationKind::Delete => self.remote.delete_record(&op.entity_id).await,
        }
    }

    /// Back off, or drop once the retry limit is exceeded.
    fn record_failure(&self, op: &SyncOperation, err: &SyncError) -> ChainOutcome {
        let retries = op.retry_count + 1;
        let message = err.to_string();
        // A conflict seen again after this flush already reconciled backs off.
        let retryable = err.is_retryable() || err.is_conflict();
        let drop_now = !retryable || retries > self.config.max_retries;

        let result = self.with_conn(|conn| {
            if drop_now {
                conn.execute(
                    "UPDATE sync_queue
                     SET status = 'failed', retry_count = ?1, next_retry_at = NULL,
                         last_error = ?2, updated_at = datetime('now')
                     WHERE id = ?3",
                    params![retries, message, op.id],
                )?;
            } else {
                let delay = backoff_delay(
                    Duration::from_millis(self.config.retry_base_ms),
                    (retries - 1) as u32,
                    Duration::from_millis(self.config.retry_cap_ms),
                );
                let next = Utc::now()
                    + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                conn.execute(
                    "UPDATE sync_queue
                     SET status = 'pending', retry_count = ?1, next_retry_at = ?2,
                         last_error = ?3, updated_at = datetime('now')
                     WHERE id = ?4",
                    params![retries, format_ts(&next), message, op.id],
                )?;
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(op_id = op.id, "failed to record sync failure: {e}");
        }

        if drop_now {
            let dropped = SyncError::MaxRetriesExceeded {
                operation_id: op.id,
                retries,
                last_error: message,
            };
            warn!(entity_id = %op.entity_id, operation = %op.operation, "{dropped}");
            ChainOutcome::Dropped
        } else {
            debug!(
                op_id = op.id,
                entity_id = %op.entity_id,
                retries,
                "sync operation failed; backing off: {message}"
            );
            ChainOutcome::Backoff
        }
    }

    /// Reload and merge for operations the backend rejected as conflicting.
    ///
    /// Settled operations are removed in the merge transaction. If the reload
    /// fails they back off like any other failure. A conflicting DELETE is
    /// never settled by a merge; it backs off and is sent again.
    async fn settle_conflicts(&self, conflicted: &[SyncOperation], report: &mut FlushReport) {
        let settleable: Vec<i64> = conflicted
            .iter()
            .filter(|op| op.operation != OperationKind::Delete)
            .map(|op| op.id)
            .collect();

        let retry: Vec<&SyncOperation> = match self.merge_remote(&settleable).await {
            Ok(_) => conflicted
                .iter()
                .filter(|op| op.operation == OperationKind::Delete)
                .collect(),
            Err(e) => {
                warn!("conflict reload failed; conflicting operations kept: {e}");
                conflicted.iter().collect()
            }
        };

        for op in retry {
            let err = SyncError::DataConflict(format!("unresolved conflict on {}", op.entity_id));
            match self.record_failure(op, &err) {
                ChainOutcome::Dropped => report.dropped += 1,
                _ => report.retried += 1,
            }
        }
    }

    /// Put undispatched operations back in the queue untouched.
    fn release(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.with_conn(|conn| set_status(conn, ids, STATUS_PENDING)) {
            warn!("failed to release sync operations: {e}");
        }
    }

    /// Wake up for the earliest backing-off operation.
    fn arm_retry_timer(&self) {
        if !self.is_online() {
            return;
        }
        let next = self
            .with_conn(|conn| {
                Ok(load_pending_ops(conn)?
                    .into_iter()
                    .filter_map(|op| op.next_retry_at)
                    .min())
            })
            .ok()
            .flatten();
        let Some(at) = next else {
            return;
        };
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if let Some(task) = self.flush_task() {
            self.debounce.schedule_if_idle(delay, task);
        }
    }

    fn mark_synced_now(&self) {
        if let Ok(mut last) = self.last_sync.lock() {
            *last = Some(format_ts(&Utc::now()));
        }
    }

    /// Pull the remote list and merge it into local state.
    ///
    /// Remote copies never blindly overwrite local ones: records match by id
    /// or by `(catalog_item_id, created_at)`, matches go through the conflict
    /// resolver, local-only records are pushed again.
    pub async fn reload_from_remote(&self) -> SyncResult<usize> {
        self.merge_remote(&[]).await
    }

    /// `reload_from_remote`, additionally settling the conflicting queue
    /// operations in `resolved_ops` once the merge is written.
    async fn merge_remote(&self, resolved_ops: &[i64]) -> SyncResult<usize> {
        let remote_records = match self.remote.list_records().await {
            Ok(records) => records,
            Err(e) if e.is_auth() => {
                if matches!(self.remote.refresh_auth().await, Ok(true)) {
                    self.remote.list_records().await?
                } else {
                    self.set_online(false);
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        };

        let local = self.store.get_items();
        let (pending, deleted) = self.with_conn(|conn| {
            Ok((
                pending_entity_ids(conn, resolved_ops)?,
                locally_deleted_ids(conn)?,
            ))
        })?;
        let mut batch = MergeBatch {
            resolved_ops: resolved_ops.to_vec(),
            ..MergeBatch::default()
        };
        let mut matched: HashSet<String> = HashSet::new();

        for remote in remote_records {
            if let Err(e) = remote.validate() {
                warn!(record_id = %remote.id, "ignoring invalid remote record: {e}");
                continue;
            }
            let local_match = local
                .iter()
                .find(|l| l.id == remote.id)
                .or_else(|| {
                    local.iter().find(|l| {
                        !matched.contains(&l.id)
                            && l.catalog_item_id == remote.catalog_item_id
                            && l.created_at == remote.created_at
                    })
                })
                .cloned();

            let Some(local_record) = local_match else {
                if pending.contains(&remote.id) || deleted.contains(&remote.id) {
                    debug!(record_id = %remote.id, "remote record deleted locally; not re-adopting");
                } else {
                    batch.adopt.push(remote);
                }
                continue;
            };
            matched.insert(local_record.id.clone());
            if local_record == remote {
                continue;
            }
            self.merge_matched(&local_record, remote, &pending, &mut batch)
                .await;
        }

        for record in local.iter().filter(|l| !matched.contains(&l.id)) {
            if !pending.contains(&record.id) {
                debug!(record_id = %record.id, "local record missing remotely; pushing again");
                batch
                    .push
                    .push((record.clone(), OperationKind::Create));
            }
        }

        let changes = batch.adopt.len() + batch.push.len();
        self.store.apply_merge(batch)?;
        if changes > 0 {
            info!(changes, "merged remote reorder list");
        }
        Ok(changes)
    }

    async fn merge_matched(
        &self,
        local: &ReorderRecord,
        remote: ReorderRecord,
        pending: &HashSet<String>,
        batch: &mut MergeBatch,
    ) {
        match self.resolver.reconcile(local, &remote).await {
            Reconciliation::AdoptRemote(adopted) => {
                // Stale local pushes must not overwrite the newer remote copy.
                if local.id != adopted.id || pending.contains(&local.id) {
                    batch.rekey.push(local.id.clone());
                }
                batch.adopt.push(adopted);
            }
            Reconciliation::Resolved { mut record, .. } => {
                if local.id != remote.id {
                    batch.rekey.push(local.id.clone());
                    record.id = remote.id.clone();
                }
                batch.push.push((record, OperationKind::Update));
            }
        }
    }

    /// Apply one change pushed by the backend.
    pub async fn apply_remote_change(&self, change: RemoteChange) -> SyncResult<()> {
        if let Some(actor) = change.actor() {
            if !self.config.user_id.is_empty() && actor == self.config.user_id {
                debug!("ignoring remote echo of our own write");
                return Ok(());
            }
        }

        let mut batch = MergeBatch::default();
        match change {
            RemoteChange::Upsert { record, .. } => {
                record.validate()?;
                let (pending, deleted) = self.with_conn(|conn| {
                    Ok((pending_entity_ids(conn, &[])?, locally_deleted_ids(conn)?))
                })?;
                match self.store.get_item(&record.id) {
                    Some(local) if local == record => return Ok(()),
                    Some(local) => self.merge_matched(&local, record, &pending, &mut batch).await,
                    None if pending.contains(&record.id) || deleted.contains(&record.id) => {
                        debug!(record_id = %record.id, "remote update for locally deleted record");
                        return Ok(());
                    }
                    None => batch.adopt.push(record),
                }
            }
            RemoteChange::Delete { id, .. } => {
                let pending = self.with_conn(|conn| has_pending_ops(conn, &id))?;
                if pending {
                    info!(record_id = %id, "remote delete ignored; local change pending");
                    return Ok(());
                }
                if self.store.get_item(&id).is_none() {
                    return Ok(());
                }
                batch.delete.push(id);
            }
        }
        self.store.apply_merge(batch)
    }

    pub fn get_sync_status(&self) -> SyncResult<SyncStatus> {
        let (pending_count, failed_count, queue_operations) = self.with_conn(|conn| {
            let pending = count_with_status(conn, &[STATUS_PENDING, STATUS_IN_PROGRESS])?;
            let failed = count_with_status(conn, &[STATUS_FAILED])?;
            let mut stmt = conn.prepare(
                "SELECT id, operation, entity_id, retry_count, status, last_error
                 FROM sync_queue ORDER BY id",
            )?;
            let ops = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .filter_map(|row| row.ok())
                .filter_map(|(id, operation, entity_id, retry_count, status, last_error)| {
                    Some(QueuedOperationSummary {
                        id,
                        operation: operation.parse().ok()?,
                        entity_id,
                        retry_count,
                        status,
                        last_error,
                    })
                })
                .collect::<Vec<_>>();
            Ok((pending, failed, ops))
        })?;

        Ok(SyncStatus {
            is_online: self.is_online(),
            pending_count,
            failed_count,
            last_sync_at: self.last_sync.lock().ok().and_then(|g| g.clone()),
            queue_operations,
        })
    }

    /// Re-arm every dropped operation with a fresh retry budget.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let rearmed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sync_queue
                 SET status = 'pending', retry_count = 0, next_retry_at = NULL,
                     updated_at = datetime('now')
                 WHERE status = 'failed'",
                [],
            )?)
        })?;
        if rearmed > 0 {
            info!(count = rearmed, "re-armed failed sync operations");
            self.schedule_flush();
        }
        Ok(rearmed)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> SyncResult<T>) -> SyncResult<T> {
        let conn = self.db.conn.lock()?;
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictChoice, FixedChoice};
    use crate::db;
    use crate::models::ReorderStatus;
    use crate::remote::memory::{Failure, MemoryRemote};

    struct Harness {
        store: Arc<ReorderStore>,
        remote: Arc<MemoryRemote>,
        engine: Arc<ReorderSyncEngine>,
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            // Keep the debounce out of the way; tests flush explicitly.
            debounce_ms: 60_000,
            retry_base_ms: 60_000,
            user_id: "alice".into(),
            ..SyncConfig::default()
        }
    }

    fn harness_with(config: SyncConfig, choice: ConflictChoice) -> Harness {
        let db = Arc::new(db::open_in_memory_for_test());
        let store = ReorderStore::load(db.clone()).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let engine = ReorderSyncEngine::new(
            db,
            store.clone(),
            remote.clone(),
            Box::new(FixedChoice(choice)),
            config,
        );
        Harness {
            store,
            remote,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), ConflictChoice::Merge)
    }

    fn remote_record(id: &str, qty: i64, minutes_ago: i64) -> ReorderRecord {
        let at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        ReorderRecord {
            id: id.into(),
            catalog_item_id: format!("ITEM-{id}"),
            quantity: qty,
            status: ReorderStatus::Incomplete,
            added_by: "bob".into(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_build_chains_respects_order_backoff_and_limit() {
        let now = Utc::now();
        let op = |id: i64, entity: &str, wait: Option<i64>| SyncOperation {
            id,
            operation: OperationKind::Update,
            entity_id: entity.into(),
            payload: serde_json::Value::Null,
            enqueued_at: now,
            retry_count: 0,
            next_retry_at: wait.map(|s| now + ChronoDuration::seconds(s)),
            last_error: None,
        };
        let ops = vec![
            op(1, "a", None),
            op(2, "b", Some(30)),
            op(3, "a", None),
            op(4, "b", None),
            op(5, "c", None),
        ];

        let chains = build_chains(ops.clone(), now, 25);
        let ids: Vec<Vec<i64>> = chains
            .iter()
            .map(|c| c.iter().map(|op| op.id).collect())
            .collect();
        // "b" is blocked by its backing-off head.
        assert_eq!(ids, vec![vec![1, 3], vec![5]]);

        let limited = build_chains(ops, now, 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].len(), 1);
    }

    #[tokio::test]
    async fn test_update_update_delete_leaves_record_deleted() {
        let h = harness();
        let seeded = remote_record("r1", 2, 5);
        h.remote.seed(seeded.clone());
        h.store
            .apply_merge(MergeBatch {
                adopt: vec![seeded],
                ..MergeBatch::default()
            })
            .unwrap();

        h.store.update_quantity("r1", 3).unwrap();
        h.store.update_quantity("r1", 4).unwrap();
        h.store.remove("r1").unwrap();

        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(
            h.remote.calls(),
            vec!["update:r1:3", "update:r1:4", "delete:r1"]
        );
        assert_eq!(h.remote.count(), 0);
        assert_eq!(h.engine.get_sync_status().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_offline_add_then_forced_sync() {
        let h = harness();
        h.remote.fail_with(Failure::Transient);

        let record = h.store.add_item("ITEM1", 2, "alice", false).unwrap();
        assert_eq!(h.store.get_count(), 1);

        let first = h.engine.force_sync().await.unwrap();
        assert_eq!(first.retried, 1);
        let status = h.engine.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.queue_operations[0].retry_count, 1);

        h.remote.fail_with(Failure::None);
        let second = h.engine.force_sync().await.unwrap();
        assert_eq!(second.synced, 1);
        assert_eq!(h.remote.record(&record.id).unwrap().quantity, 2);

        let status = h.engine.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync_at.is_some());
        let conn = h.engine.db.conn.lock().unwrap();
        assert_eq!(
            crate::reorder::pending_flag(&conn, &record.id).unwrap(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_operation_dropped_after_retry_limit() {
        let config = SyncConfig {
            retry_base_ms: 0,
            ..test_config()
        };
        let h = harness_with(config, ConflictChoice::Merge);
        h.remote.fail_with(Failure::Transient);
        let record = h.store.add_item("ITEM1", 1, "alice", false).unwrap();

        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.retried, 3);
        assert_eq!(report.dropped, 1);
        assert_eq!(h.remote.calls().len(), 4);

        let status = h.engine.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.failed_count, 1);
        // Local state is kept even though the push was abandoned.
        assert!(h.store.get_item(&record.id).is_some());

        h.remote.fail_with(Failure::None);
        assert_eq!(h.engine.retry_failed().unwrap(), 1);
        h.engine.flush().await.unwrap();
        assert!(h.remote.record(&record.id).is_some());
        assert_eq!(h.engine.get_sync_status().unwrap().failed_count, 0);
    }

    #[tokio::test]
    async fn test_backing_off_operation_blocks_later_ops_of_same_record() {
        let h = harness();
        h.remote.fail_with(Failure::Transient);
        let record = h.store.add_item("ITEM1", 1, "alice", false).unwrap();
        h.engine.flush().await.unwrap();

        h.remote.fail_with(Failure::None);
        h.store.update_quantity(&record.id, 5).unwrap();
        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.synced, 0);
        assert!(h.remote.record(&record.id).is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_goes_offline_without_burning_retries() {
        let h = harness();
        h.remote.fail_with(Failure::Auth);
        h.store.add_item("ITEM1", 1, "alice", false).unwrap();

        let report = h.engine.flush().await.unwrap();
        assert!(report.went_offline);
        let status = h.engine.get_sync_status().unwrap();
        assert!(!status.is_online);
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.queue_operations[0].retry_count, 0);
        assert_eq!(status.queue_operations[0].status, "pending");

        // Offline flushes are no-ops.
        assert_eq!(h.engine.flush().await.unwrap(), FlushReport::default());
    }

    #[tokio::test]
    async fn test_auth_refresh_resumes_flush() {
        let h = harness();
        h.remote.fail_with(Failure::Auth);
        h.remote.refresh_succeeds.store(true, Ordering::SeqCst);
        let record = h.store.add_item("ITEM1", 1, "alice", false).unwrap();

        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(h.engine.is_online());
        assert!(h.remote.record(&record.id).is_some());
    }

    #[tokio::test]
    async fn test_conflict_reloads_and_merges() {
        let h = harness();
        let older = remote_record("r1", 5, 10);
        h.remote.seed(older.clone());
        let mut local = older.clone();
        local.quantity = 1;
        h.store
            .apply_merge(MergeBatch {
                adopt: vec![local],
                ..MergeBatch::default()
            })
            .unwrap();
        h.store.update_quantity("r1", 2).unwrap();

        h.remote.fail_with(Failure::Conflict);
        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert!(h.remote.list_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(h.store.get_item("r1").unwrap().quantity, 5);

        let status = h.engine.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.queue_operations[0].operation, OperationKind::Update);
    }

    #[tokio::test]
    async fn test_conflict_with_failed_reload_keeps_local_edit_queued() {
        let h = harness();
        let base = remote_record("r1", 2, 10);
        h.remote.seed(base.clone());
        h.store
            .apply_merge(MergeBatch {
                adopt: vec![base],
                ..MergeBatch::default()
            })
            .unwrap();
        h.store.update_quantity("r1", 7).unwrap();

        h.remote.fail_with(Failure::Conflict);
        *h.remote.list_failure.lock().unwrap() = Failure::Transient;
        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.retried, 1);

        let status = h.engine.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.failed_count, 0);
        assert_eq!(status.queue_operations[0].operation, OperationKind::Update);
        assert_eq!(status.queue_operations[0].retry_count, 1);
        assert_eq!(h.store.get_item("r1").unwrap().quantity, 7);
        {
            let conn = h.engine.db.conn.lock().unwrap();
            assert_eq!(crate::reorder::pending_flag(&conn, "r1").unwrap(), Some(true));
        }

        h.remote.fail_with(Failure::None);
        *h.remote.list_failure.lock().unwrap() = Failure::None;
        let report = h.engine.force_sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(h.remote.record("r1").unwrap().quantity, 7);
        assert_eq!(h.engine.get_sync_status().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_dropped_delete_keeps_record_deleted_on_reload() {
        let config = SyncConfig {
            retry_base_ms: 0,
            ..test_config()
        };
        let h = harness_with(config, ConflictChoice::Merge);
        let base = remote_record("r1", 2, 10);
        h.remote.seed(base.clone());
        h.store
            .apply_merge(MergeBatch {
                adopt: vec![base.clone()],
                ..MergeBatch::default()
            })
            .unwrap();
        h.store.remove("r1").unwrap();

        h.remote.fail_with(Failure::Transient);
        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.dropped, 1);

        h.remote.fail_with(Failure::None);
        h.engine.reload_from_remote().await.unwrap();
        assert!(h.store.get_item("r1").is_none());

        h.engine
            .apply_remote_change(RemoteChange::Upsert {
                record: base,
                actor: Some("bob".into()),
            })
            .await
            .unwrap();
        assert!(h.store.get_item("r1").is_none());
        assert_eq!(h.engine.get_sync_status().unwrap().failed_count, 1);

        assert_eq!(h.engine.retry_failed().unwrap(), 1);
        h.engine.flush().await.unwrap();
        assert_eq!(h.remote.count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_operation_is_dropped_without_retry() {
        let h = harness();
        h.remote.fail_with(Failure::Rejected);
        let record = h.store.add_item("ITEM1", 1, "alice", false).unwrap();

        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(h.remote.calls().len(), 1);

        let status = h.engine.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.failed_count, 1);
        assert!(h.store.get_item(&record.id).is_some());
    }

    #[tokio::test]
    async fn test_full_batch_flushes_without_waiting_for_debounce() {
        let config = SyncConfig {
            max_batch_size: 2,
            ..test_config()
        };
        let h = harness_with(config, ConflictChoice::Merge);
        let first = h.store.add_item("ITEM1", 1, "alice", false).unwrap();
        assert!(h.engine.debounce.is_pending());
        let second = h.store.add_item("ITEM2", 1, "alice", false).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.remote.record(&first.id).is_some());
        assert!(h.remote.record(&second.id).is_some());
        assert!(!h.engine.debounce.is_pending());
        assert_eq!(h.engine.get_sync_status().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_dispatch_respects_max_concurrency() {
        let config = SyncConfig {
            max_concurrency: 2,
            ..test_config()
        };
        let h = harness_with(config, ConflictChoice::Merge);
        h.remote.latency_ms.store(20, Ordering::SeqCst);
        for i in 0..5 {
            h.store
                .add_item(&format!("ITEM{i}"), 1, "alice", false)
                .unwrap();
        }

        let report = h.engine.flush().await.unwrap();
        assert_eq!(report.synced, 5);
        assert_eq!(h.remote.count(), 5);
        assert_eq!(h.remote.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_force_sync_cancels_armed_debounce() {
        let config = SyncConfig {
            debounce_ms: 50,
            ..test_config()
        };
        let h = harness_with(config, ConflictChoice::Merge);
        let record = h.store.add_item("ITEM1", 1, "alice", false).unwrap();
        assert!(h.engine.debounce.is_pending());

        let report = h.engine.force_sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(!h.engine.debounce.is_pending());

        // Queued without the enqueue hook: only the cancelled timer could send it.
        {
            let conn = h.engine.db.conn.lock().unwrap();
            enqueue_op(
                &conn,
                OperationKind::Update,
                &record.id,
                &serde_json::to_value(&record).unwrap(),
            )
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.engine.get_sync_status().unwrap().pending_count, 1);
        assert_eq!(h.remote.calls(), vec![format!("create:{}:1", record.id)]);
    }

    #[tokio::test]
    async fn test_pushed_update_for_newer_local_merges_to_max_quantity() {
        let h = harness();
        let base = remote_record("r1", 2, 10);
        h.store
            .apply_merge(MergeBatch {
                adopt: vec![base.clone()],
                ..MergeBatch::default()
            })
            .unwrap();
        h.store.update_quantity("r1", 2).unwrap();

        let mut incoming = base;
        incoming.quantity = 5;
        incoming.updated_at = incoming.updated_at + ChronoDuration::minutes(1);
        h.engine
            .apply_remote_change(RemoteChange::Upsert {
                record: incoming,
                actor: Some("bob".into()),
            })
            .await
            .unwrap();

        assert_eq!(h.store.get_item("r1").unwrap().quantity, 5);
        let ops = h.engine.get_sync_status().unwrap().queue_operations;
        assert_eq!(ops.last().unwrap().operation, OperationKind::Update);
    }

    #[tokio::test]
    async fn test_remote_changes_from_self_are_ignored() {
        let h = harness();
        h.engine
            .apply_remote_change(RemoteChange::Upsert {
                record: remote_record("r9", 3, 1),
                actor: Some("alice".into()),
            })
            .await
            .unwrap();
        assert_eq!(h.store.get_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_delete_respects_pending_local_ops() {
        let h = harness();
        let record = h.store.add_item("ITEM1", 1, "alice", false).unwrap();
        h.engine
            .apply_remote_change(RemoteChange::Delete {
                id: record.id.clone(),
                actor: Some("bob".into()),
            })
            .await
            .unwrap();
        assert!(h.store.get_item(&record.id).is_some());

        h.engine.flush().await.unwrap();
        h.engine
            .apply_remote_change(RemoteChange::Delete {
                id: record.id.clone(),
                actor: Some("bob".into()),
            })
            .await
            .unwrap();
        assert!(h.store.get_item(&record.id).is_none());
    }

    #[tokio::test]
    async fn test_reload_inserts_remote_and_requeues_local_only() {
        let h = harness();
        h.remote.seed(remote_record("remote-only", 4, 3));

        let local = remote_record("local-only", 1, 2);
        h.store
            .apply_merge(MergeBatch {
                adopt: vec![local],
                ..MergeBatch::default()
            })
            .unwrap();

        let changes = h.engine.reload_from_remote().await.unwrap();
        assert_eq!(changes, 2);
        assert!(h.store.get_item("remote-only").is_some());
        assert!(h.store.get_item("local-only").is_some());

        let ops = h.engine.get_sync_status().unwrap().queue_operations;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, OperationKind::Create);
        assert_eq!(ops[0].entity_id, "local-only");
    }

    #[tokio::test]
    async fn test_reload_matches_by_item_and_creation_time() {
        let h = harness();
        let remote = remote_record("server-id", 3, 5);
        h.remote.seed(remote.clone());
        let mut local = remote.clone();
        local.id = "device-id".into();
        h.store
            .apply_merge(MergeBatch {
                adopt: vec![local],
                ..MergeBatch::default()
            })
            .unwrap();

        h.engine.reload_from_remote().await.unwrap();
        let ids: Vec<String> = h.store.get_items().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["server-id".to_string()]);
    }

    #[tokio::test]
    async fn test_mutation_schedules_debounced_flush() {
        let config = SyncConfig {
            debounce_ms: 20,
            ..test_config()
        };
        let h = harness_with(config, ConflictChoice::Merge);
        let record = h.store.add_item("ITEM1", 2, "alice", false).unwrap();
        assert!(h.engine.debounce.is_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.remote.record(&record.id).is_some());
    }
}
