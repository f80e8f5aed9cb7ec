//! Reorder Sync Core
//!
//! Offline-first reorder list shared by every device of a team. Local
//! mutations apply immediately and are persisted with a queued operation;
//! the sync engine pushes them to the backend in the background and merges
//! remote state back without clobbering local edits. Display records are
//! cross-referenced at read time against the local catalog mirror and
//! vendor data through an invalidating cache.
//!
//! `ReorderRuntime::start` wires every service together; hosts call
//! `logging::init_tracing` first if they want file logs.

use anyhow::{anyhow, Context};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub mod api;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod notifier;
pub mod recovery;
pub mod remote;
pub mod reorder;
pub mod scheduler;
pub mod storage;
pub mod sync;

pub use cache::{CacheStats, CrossReferenceCache};
pub use config::SyncConfig;
pub use conflict::{ConflictChoice, ConflictResolutionStrategy, FixedChoice, LastWriteWins};
pub use error::{SyncError, SyncResult};
pub use models::{
    ChangeEvent, DisplayReorderRecord, ReorderRecord, ReorderStatus, SyncStatus,
};
pub use recovery::{RecoveryOutcome, RecoveryStatus};
pub use remote::{RemoteChange, RemoteReorderStore};
pub use reorder::{ItemsListener, ListenerHandle, ReorderStore};
pub use sync::{FlushReport, ReorderSyncEngine};

use db::DbState;
use monitor::DatabaseChangeMonitor;
use notifier::{ChangeNotifier, SubscriptionId};
use recovery::RecoveryService;

/// All reorder services for one data directory.
pub struct ReorderRuntime {
    db: Arc<DbState>,
    config: SyncConfig,
    notifier: Arc<ChangeNotifier>,
    monitor: Arc<DatabaseChangeMonitor>,
    cache: Arc<CrossReferenceCache>,
    cache_subscription: SubscriptionId,
    store: Arc<ReorderStore>,
    engine: Arc<ReorderSyncEngine>,
    recovery: RecoveryOutcome,
}

impl ReorderRuntime {
    /// Open the database, start the monitor and cache optimizer, load the
    /// reorder list and run cold-start recovery. Must be called inside a
    /// tokio runtime.
    pub async fn start(
        data_dir: &Path,
        config: SyncConfig,
        remote: Arc<dyn RemoteReorderStore>,
        strategy: Box<dyn ConflictResolutionStrategy>,
    ) -> anyhow::Result<Self> {
        let build = diagnostics::build_info();
        info!(
            version = build.version,
            git_sha = build.git_sha,
            built = build.build_timestamp,
            "Starting reorder sync core"
        );

        let db = Arc::new(
            db::init(data_dir)
                .map_err(|e| anyhow!(e))
                .with_context(|| format!("opening reorder database in {}", data_dir.display()))?,
        );

        let config = {
            let conn = db.conn.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            config.with_local_overrides(&conn)
        };

        let notifier = Arc::new(ChangeNotifier::new());
        let monitor = DatabaseChangeMonitor::new(
            db.clone(),
            notifier.clone(),
            config.monitor_interval(),
        );
        let cache = CrossReferenceCache::new(db.clone(), &config);
        let cache_subscription = monitor.subscribe(cache::CACHE_TABLES, cache.listener());
        cache.start_optimizer(config.optimize_interval());

        let store = ReorderStore::load(db.clone()).context("loading reorder list")?;
        let engine = ReorderSyncEngine::new(
            db.clone(),
            store.clone(),
            remote.clone(),
            strategy,
            config.clone(),
        );

        let recovery = RecoveryService::new(db.clone(), store.clone(), remote, notifier.clone())
            .run_if_needed()
            .await
            .context("cold-start recovery")?;
        info!(outcome = ?recovery, items = store.get_count(), "Reorder sync core ready");

        // Anything queued by a previous session goes out on the normal cadence.
        match engine.get_sync_status() {
            Ok(status) if status.pending_count > 0 => engine.schedule_flush(),
            Ok(_) => {}
            Err(e) => warn!("could not read sync status at startup: {e}"),
        }

        Ok(Self {
            db,
            config,
            notifier,
            monitor,
            cache,
            cache_subscription,
            store,
            engine,
            recovery,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ReorderStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ReorderSyncEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<CrossReferenceCache> {
        &self.cache
    }

    /// Publish point for local writers of catalog and vendor tables.
    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn recovery_outcome(&self) -> &RecoveryOutcome {
        &self.recovery
    }

    // -- UI surface ----------------------------------------------------------

    pub fn get_items(&self) -> Vec<ReorderRecord> {
        self.store.get_items()
    }

    pub fn get_count(&self) -> usize {
        self.store.get_count()
    }

    /// Current list joined with catalog and vendor snapshots.
    pub fn get_display_items(&self) -> Vec<DisplayReorderRecord> {
        self.cache.build_display_records(&self.store.get_items())
    }

    pub fn add_listener(&self, listener: ItemsListener) -> ListenerHandle {
        self.store.add_listener(listener)
    }

    pub fn add_item(
        &self,
        item_ref: &str,
        quantity: i64,
        added_by: &str,
        overwrite: bool,
    ) -> SyncResult<ReorderRecord> {
        self.store.add_item(item_ref, quantity, added_by, overwrite)
    }

    pub fn update_status(&self, id: &str, status: ReorderStatus) -> SyncResult<ReorderRecord> {
        self.store.update_status(id, status)
    }

    pub fn update_quantity(&self, id: &str, quantity: i64) -> SyncResult<ReorderRecord> {
        self.store.update_quantity(id, quantity)
    }

    pub fn remove(&self, id: &str) -> SyncResult<ReorderRecord> {
        self.store.remove(id)
    }

    pub fn mark_received(&self, id: &str) -> SyncResult<ReorderRecord> {
        self.store.mark_received(id)
    }

    pub fn clear(&self) -> SyncResult<usize> {
        self.store.clear()
    }

    pub fn get_sync_status(&self) -> SyncResult<SyncStatus> {
        self.engine.get_sync_status()
    }

    pub async fn force_sync(&self) -> SyncResult<FlushReport> {
        self.engine.force_sync().await
    }

    pub async fn on_foreground(&self) {
        self.engine.on_foreground().await;
    }

    pub async fn on_background(&self) {
        self.engine.on_background().await;
    }

    pub async fn apply_remote_change(&self, change: RemoteChange) -> SyncResult<()> {
        self.engine.apply_remote_change(change).await
    }

    pub fn retry_failed(&self) -> SyncResult<usize> {
        self.engine.retry_failed()
    }

    pub fn sync_health(&self) -> Result<serde_json::Value, String> {
        diagnostics::get_sync_health(&self.db)
    }

    /// Stop background loops. Queued operations stay in SQLite for the next
    /// start.
    pub fn shutdown(&self) {
        self.monitor.unsubscribe(self.cache_subscription);
        self.monitor.stop();
        self.cache.stop_optimizer();
        self.engine.shutdown();
        info!("Reorder sync core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryRemote;
    use chrono::Utc;

    fn test_config() -> SyncConfig {
        SyncConfig {
            debounce_ms: 60_000,
            user_id: "alice".into(),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_recovers_and_serves_display_items() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let now = Utc::now();
        remote.seed(ReorderRecord {
            id: "r1".into(),
            catalog_item_id: "ITEM1".into(),
            quantity: 2,
            status: ReorderStatus::Incomplete,
            added_by: "bob".into(),
            created_at: now,
            updated_at: now,
        });

        let runtime = ReorderRuntime::start(
            dir.path(),
            test_config(),
            remote.clone(),
            Box::new(LastWriteWins),
        )
        .await
        .unwrap();

        assert!(matches!(
            runtime.recovery_outcome(),
            RecoveryOutcome::Recovered { records: 1, .. }
        ));
        let display = runtime.get_display_items();
        assert_eq!(display.len(), 1);
        assert_eq!(display[0].name, "Unknown Item (ITEM1)");
        assert!(display[0].missing_square_data);

        runtime.shutdown();
        assert!(!runtime.monitor.is_running());
    }

    #[tokio::test]
    async fn test_queued_work_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());

        let first = ReorderRuntime::start(
            dir.path(),
            test_config(),
            remote.clone(),
            Box::new(LastWriteWins),
        )
        .await
        .unwrap();
        let record = first.add_item("ITEM1", 3, "alice", false).unwrap();
        assert_eq!(first.get_sync_status().unwrap().pending_count, 1);
        first.shutdown();
        drop(first);

        let second = ReorderRuntime::start(
            dir.path(),
            test_config(),
            remote.clone(),
            Box::new(LastWriteWins),
        )
        .await
        .unwrap();
        assert_eq!(
            second.recovery_outcome(),
            &RecoveryOutcome::AlreadyRan(RecoveryStatus::Succeeded)
        );
        assert_eq!(second.get_count(), 1);

        let report = second.force_sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(remote.record(&record.id).unwrap().quantity, 3);
        assert_eq!(second.get_sync_status().unwrap().pending_count, 0);
        second.shutdown();
    }
}
