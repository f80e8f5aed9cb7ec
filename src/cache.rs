//! Cross-reference cache.
//!
//! Reorder records carry only a catalog item id. Everything the list screen
//! shows (name, barcode, price, images, vendor) is joined in at read time
//! from the local catalog mirror and vendor table. This module keeps those
//! lookups cheap: snapshots are cached with TTL + weighted LRU eviction and
//! invalidated from `ChangeEvent`s.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params_from_iter, Connection};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MissingVendorSeverity, SyncConfig};
use crate::db::DbState;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    fallback_item_name, is_custom_item, CatalogSnapshot, ChangeEvent, ChangeTable,
    DisplayReorderRecord, ReorderRecord, VendorSnapshot,
};
use crate::notifier::ChangeListener;

/// Tables whose changes invalidate cached snapshots.
pub const CACHE_TABLES: &[ChangeTable] = &[
    ChangeTable::CatalogItems,
    ChangeTable::ItemVariations,
    ChangeTable::Categories,
    ChangeTable::Images,
    ChangeTable::VendorData,
];

/// Stay under SQLite's legacy bound-parameter limit.
const MAX_IN_PARAMS: usize = 900;

// ---------------------------------------------------------------------------
// Generic snapshot cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    data: T,
    timestamp: DateTime<Utc>,
    access_count: u64,
    last_accessed: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    /// `access_count + recency`, recency in (0, 1] decaying with idle minutes.
    fn score(&self, now: DateTime<Utc>) -> f64 {
        let idle_ms = (now - self.last_accessed).num_milliseconds().max(0) as f64;
        let recency = 1.0 / (1.0 + idle_ms / 60_000.0);
        self.access_count as f64 + recency
    }
}

/// Keyed snapshot store with TTL and weighted-LRU eviction.
pub struct SnapshotCache<T> {
    entries: HashMap<String, CacheEntry<T>>,
    capacity: usize,
    ttl: ChronoDuration,
    soft_limit: usize,
    target: usize,
    /// Bumped on every invalidation; loads started under an older value
    /// are not cached.
    generation: u64,
}

impl<T: Clone> SnapshotCache<T> {
    pub fn new(capacity: usize, ttl_secs: i64, soft_ratio: f64, target_ratio: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::new(),
            capacity,
            ttl: ChronoDuration::seconds(ttl_secs.max(1)),
            soft_limit: ((capacity as f64) * soft_ratio).ceil().max(1.0) as usize,
            target: ((capacity as f64) * target_ratio).floor() as usize,
            generation: 0,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.cache_capacity,
            config.cache_ttl_secs,
            config.cache_soft_ratio,
            config.cache_target_ratio,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Cache-first read. Expired entries are dropped and reported as a miss.
    pub fn get(&mut self, id: &str, now: DateTime<Utc>) -> Option<T> {
        let expired = match self.entries.get(id) {
            Some(entry) => now - entry.timestamp > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(id);
            return None;
        }
        let entry = self.entries.get_mut(id)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        Some(entry.data.clone())
    }

    pub fn insert(&mut self, id: String, data: T, now: DateTime<Utc>) {
        if !self.entries.contains_key(&id) && self.entries.len() >= self.capacity {
            self.evict_lru(now);
        }
        self.entries.insert(
            id,
            CacheEntry {
                data,
                timestamp: now,
                access_count: 0,
                last_accessed: now,
            },
        );
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Insert a snapshot loaded while `generation` was current. Returns
    /// false (and caches nothing) if an invalidation happened since.
    pub fn insert_loaded(&mut self, id: String, data: T, now: DateTime<Utc>, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.insert(id, data, now);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.generation += 1;
        self.entries.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.entries.clear();
    }

    /// Periodic maintenance. Returns the number of entries removed.
    pub fn optimize(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.timestamp <= ttl);

        if self.entries.len() >= self.capacity {
            self.evict_lru(now);
        } else if self.entries.len() >= self.soft_limit {
            self.evict_oldest_half();
        }
        before - self.entries.len()
    }

    /// Remove lowest-scoring entries until the target size is reached.
    fn evict_lru(&mut self, now: DateTime<Utc>) {
        if self.entries.len() <= self.target {
            return;
        }
        let mut scored: Vec<(String, f64)> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.score(now)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        let excess = self.entries.len() - self.target;
        for (id, _) in scored.into_iter().take(excess) {
            self.entries.remove(&id);
        }
    }

    fn evict_oldest_half(&mut self) {
        let mut by_age: Vec<(String, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.timestamp))
            .collect();
        by_age.sort_by_key(|(_, ts)| *ts);

        let half = by_age.len() / 2;
        for (id, _) in by_age.into_iter().take(half) {
            self.entries.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-reference cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub catalog_entries: usize,
    pub vendor_entries: usize,
}

pub struct CrossReferenceCache {
    db: Arc<DbState>,
    catalog: Mutex<SnapshotCache<CatalogSnapshot>>,
    vendor: Mutex<SnapshotCache<VendorSnapshot>>,
    missing_vendor_severity: MissingVendorSeverity,
    optimizer: Mutex<Option<CancellationToken>>,
}

impl CrossReferenceCache {
    pub fn new(db: Arc<DbState>, config: &SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            catalog: Mutex::new(SnapshotCache::from_config(config)),
            vendor: Mutex::new(SnapshotCache::from_config(config)),
            missing_vendor_severity: config.missing_vendor_severity,
            optimizer: Mutex::new(None),
        })
    }

    pub fn get_catalog_snapshot(&self, item_id: &str) -> Option<CatalogSnapshot> {
        if is_custom_item(item_id) {
            return None;
        }
        let now = Utc::now();
        let generation = {
            let mut cache = self.catalog.lock().ok()?;
            if let Some(hit) = cache.get(item_id, now) {
                return Some(hit);
            }
            cache.generation()
        };

        let ids = [item_id.to_string()];
        let loaded = self.read_db("catalog", |conn| load_catalog(conn, &ids));
        store_loaded(&self.catalog, generation, &loaded, now);
        loaded.get(item_id).cloned()
    }

    pub fn get_vendor_snapshot(&self, item_id: &str) -> Option<VendorSnapshot> {
        let now = Utc::now();
        let generation = {
            let mut cache = self.vendor.lock().ok()?;
            if let Some(hit) = cache.get(item_id, now) {
                return Some(hit);
            }
            cache.generation()
        };

        let ids = [item_id.to_string()];
        let loaded = self.read_db("vendor", |conn| load_vendor(conn, &ids));
        store_loaded(&self.vendor, generation, &loaded, now);
        loaded.get(item_id).cloned()
    }

    /// Assemble display rows for `records`, loading every missing snapshot
    /// with one query per table.
    pub fn build_display_records(&self, records: &[ReorderRecord]) -> Vec<DisplayReorderRecord> {
        let now = Utc::now();
        let mut catalog_hits: HashMap<String, CatalogSnapshot> = HashMap::new();
        let mut vendor_hits: HashMap<String, VendorSnapshot> = HashMap::new();
        let mut catalog_misses: Vec<String> = Vec::new();
        let mut vendor_misses: Vec<String> = Vec::new();

        let unique: HashSet<&str> = records.iter().map(|r| r.catalog_item_id.as_str()).collect();
        let mut catalog_generation = 0;
        let mut vendor_generation = 0;

        if let Ok(mut cache) = self.catalog.lock() {
            catalog_generation = cache.generation();
            for id in unique.iter().filter(|id| !is_custom_item(id)) {
                match cache.get(id, now) {
                    Some(hit) => {
                        catalog_hits.insert(id.to_string(), hit);
                    }
                    None => catalog_misses.push(id.to_string()),
                }
            }
        }
        if let Ok(mut cache) = self.vendor.lock() {
            vendor_generation = cache.generation();
            for id in &unique {
                match cache.get(id, now) {
                    Some(hit) => {
                        vendor_hits.insert(id.to_string(), hit);
                    }
                    None => vendor_misses.push(id.to_string()),
                }
            }
        }

        if !catalog_misses.is_empty() {
            let loaded = self.read_db("catalog", |conn| load_catalog(conn, &catalog_misses));
            store_loaded(&self.catalog, catalog_generation, &loaded, now);
            catalog_hits.extend(loaded);
        }
        if !vendor_misses.is_empty() {
            let loaded = self.read_db("vendor", |conn| load_vendor(conn, &vendor_misses));
            store_loaded(&self.vendor, vendor_generation, &loaded, now);
            vendor_hits.extend(loaded);
        }

        debug!(
            records = records.len(),
            catalog_loaded = catalog_misses.len(),
            vendor_loaded = vendor_misses.len(),
            "built display records"
        );

        records
            .iter()
            .map(|record| {
                let display = compose_display(
                    record,
                    catalog_hits.get(&record.catalog_item_id),
                    vendor_hits.get(&record.catalog_item_id),
                );
                if display.missing_vendor_data {
                    self.log_missing_vendor(&record.catalog_item_id);
                }
                display
            })
            .collect()
    }

    /// Drop whatever `event` makes stale. Safe to apply repeatedly.
    pub fn invalidate(&self, event: &ChangeEvent) {
        match event.table {
            ChangeTable::CatalogItems | ChangeTable::ItemVariations => {
                if let Ok(mut cache) = self.catalog.lock() {
                    match event.entity_id.as_deref() {
                        Some(id) => {
                            cache.remove(id);
                        }
                        None => cache.clear(),
                    }
                }
            }
            // Image and category rows fan out to many items.
            ChangeTable::Images | ChangeTable::Categories => {
                if let Ok(mut cache) = self.catalog.lock() {
                    cache.clear();
                }
            }
            ChangeTable::VendorData => {
                if let Ok(mut cache) = self.vendor.lock() {
                    match event.entity_id.as_deref() {
                        Some(id) => {
                            cache.remove(id);
                        }
                        None => cache.clear(),
                    }
                }
            }
            ChangeTable::ReorderItems => {}
        }
        debug!(table = ?event.table, entity_id = ?event.entity_id, "cache invalidated");
    }

    /// Listener to register with the notifier or change monitor.
    pub fn listener(self: &Arc<Self>) -> ChangeListener {
        let cache: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |event: &ChangeEvent| {
            if let Some(cache) = cache.upgrade() {
                cache.invalidate(event);
            }
        })
    }

    /// One maintenance pass over both caches.
    pub fn optimize(&self) -> usize {
        let now = Utc::now();
        let catalog = self.catalog.lock().map(|mut c| c.optimize(now)).unwrap_or(0);
        let vendor = self.vendor.lock().map(|mut c| c.optimize(now)).unwrap_or(0);
        if catalog + vendor > 0 {
            debug!(catalog, vendor, "cache optimizer evicted entries");
        }
        catalog + vendor
    }

    /// Start the periodic optimizer. No-op if already running.
    pub fn start_optimizer(self: &Arc<Self>, interval: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("cache optimizer start requested outside a tokio runtime");
            return;
        };
        let token = {
            let Ok(mut slot) = self.optimizer.lock() else {
                return;
            };
            if slot.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let cache = Arc::downgrade(self);
        runtime.spawn(async move {
            info!(interval_secs = interval.as_secs(), "Cache optimizer started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match cache.upgrade() {
                            Some(cache) => {
                                cache.optimize();
                            }
                            None => break,
                        }
                    }
                }
            }
            info!("Cache optimizer stopped");
        });
    }

    pub fn stop_optimizer(&self) {
        if let Ok(mut slot) = self.optimizer.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            catalog_entries: self.catalog.lock().map(|c| c.len()).unwrap_or(0),
            vendor_entries: self.vendor.lock().map(|c| c.len()).unwrap_or(0),
        }
    }

    /// Run a read against the local tables, degrading to empty on failure.
    fn read_db<T: Default>(
        &self,
        what: &str,
        read: impl FnOnce(&Connection) -> SyncResult<T>,
    ) -> T {
        let conn = match self.db.conn.lock() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("cache {what} read: db lock poisoned: {e}");
                return T::default();
            }
        };
        match read(&conn) {
            Ok(value) => value,
            Err(SyncError::SchemaMissing(table)) => {
                debug!(table = %table, "cache {what} read: table not provisioned yet");
                T::default()
            }
            Err(e) => {
                warn!("cache {what} read failed: {e}");
                T::default()
            }
        }
    }

    fn log_missing_vendor(&self, item_id: &str) {
        match self.missing_vendor_severity {
            MissingVendorSeverity::Off => {}
            MissingVendorSeverity::Debug => debug!(item_id, "no vendor data for reorder item"),
            MissingVendorSeverity::Warn => warn!(item_id, "no vendor data for reorder item"),
        }
    }
}

/// Cache freshly loaded snapshots unless an invalidation raced the load.
fn store_loaded<T: Clone>(
    cache: &Mutex<SnapshotCache<T>>,
    generation: u64,
    loaded: &HashMap<String, T>,
    now: DateTime<Utc>,
) {
    let Ok(mut cache) = cache.lock() else {
        return;
    };
    for (id, snapshot) in loaded {
        if !cache.insert_loaded(id.clone(), snapshot.clone(), now, generation) {
            debug!("cache invalidated during load; result not cached");
            return;
        }
    }
}

/// Join one record with whatever snapshots exist for it.
pub fn compose_display(
    record: &ReorderRecord,
    catalog: Option<&CatalogSnapshot>,
    vendor: Option<&VendorSnapshot>,
) -> DisplayReorderRecord {
    let mut display = DisplayReorderRecord {
        record: record.clone(),
        name: fallback_item_name(&record.catalog_item_id),
        barcode: None,
        category: None,
        price: None,
        images: Vec::new(),
        vendor: vendor.and_then(|v| v.vendor.clone()),
        case_cost: vendor.and_then(|v| v.case_cost),
        case_quantity: vendor.and_then(|v| v.case_quantity),
        discontinued: vendor.is_some_and(|v| v.discontinued),
        missing_square_data: false,
        missing_vendor_data: vendor.is_none(),
    };

    if record.is_custom() {
        if let Some(notes) = vendor.and_then(VendorSnapshot::custom_notes) {
            if let Some(name) = notes.name.filter(|n| !n.trim().is_empty()) {
                display.name = name;
            }
            display.category = notes.category;
            display.price = notes.price;
        }
        return display;
    }

    match catalog {
        Some(snapshot) => {
            display.name = snapshot.name.clone();
            display.barcode = snapshot.barcode.clone();
            display.category = snapshot.category.clone();
            display.price = snapshot.price;
            display.images = snapshot.images.clone();
        }
        None => display.missing_square_data = true,
    }
    display
}

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load live catalog items joined with category, primary variation and images.
fn load_catalog(conn: &Connection, ids: &[String]) -> SyncResult<HashMap<String, CatalogSnapshot>> {
    let mut out = HashMap::new();
    for chunk in ids.chunks(MAX_IN_PARAMS) {
        let sql = format!(
            "SELECT ci.id,
                    ci.name,
                    c.name,
                    (SELECT v.sku FROM item_variations v
                      WHERE v.item_id = ci.id AND v.is_deleted = 0
                      ORDER BY v.rowid LIMIT 1),
                    (SELECT v.price_amount FROM item_variations v
                      WHERE v.item_id = ci.id AND v.is_deleted = 0
                      ORDER BY v.rowid LIMIT 1),
                    (SELECT group_concat(i.url, char(31)) FROM images i
                      WHERE i.item_id = ci.id AND i.is_deleted = 0 AND i.url IS NOT NULL)
             FROM catalog_items ci
             LEFT JOIN categories c ON c.id = ci.category_id AND c.is_deleted = 0
             WHERE ci.is_deleted = 0 AND ci.id IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(SyncError::from_sqlite)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                let id: String = row.get(0)?;
                let name: Option<String> = row.get(1)?;
                let price_amount: Option<i64> = row.get(4)?;
                let images: Option<String> = row.get(5)?;
                Ok(CatalogSnapshot {
                    name: name
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| fallback_item_name(&id)),
                    item_id: id,
                    barcode: row.get(3)?,
                    category: row.get(2)?,
                    price: price_amount.map(|cents| cents as f64 / 100.0),
                    images: images
                        .map(|joined| {
                            joined
                                .split('\u{1f}')
                                .filter(|url| !url.is_empty())
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                })
            })
            .map_err(SyncError::from_sqlite)?;
        for row in rows {
            let snapshot = row.map_err(SyncError::from_sqlite)?;
            out.insert(snapshot.item_id.clone(), snapshot);
        }
    }
    Ok(out)
}

fn load_vendor(conn: &Connection, ids: &[String]) -> SyncResult<HashMap<String, VendorSnapshot>> {
    let mut out = HashMap::new();
    for chunk in ids.chunks(MAX_IN_PARAMS) {
        let sql = format!(
            "SELECT item_id, vendor, case_cost, case_quantity, discontinued, notes
             FROM vendor_data WHERE item_id IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(SyncError::from_sqlite)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok(VendorSnapshot {
                    item_id: row.get(0)?,
                    vendor: row.get(1)?,
                    case_cost: row.get(2)?,
                    case_quantity: row.get(3)?,
                    discontinued: row.get::<_, i64>(4)? != 0,
                    notes: row.get(5)?,
                })
            })
            .map_err(SyncError::from_sqlite)?;
        for row in rows {
            let snapshot = row.map_err(SyncError::from_sqlite)?;
            out.insert(snapshot.item_id.clone(), snapshot);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{ChangeOperation, ReorderStatus};
    use rusqlite::params;

    fn seed_catalog(db: &DbState) {
        let conn = db.conn.lock().unwrap();
        conn.execute_batch(
            "INSERT INTO categories (id, name, updated_at) VALUES ('CAT1', 'Dairy', 't1');
             INSERT INTO catalog_items (id, name, category_id, updated_at)
                VALUES ('ITEM1', 'Whole Milk', 'CAT1', 't1'),
                       ('ITEM2', 'Oat Milk', 'CAT1', 't1'),
                       ('ITEM9', 'Retired Yogurt', 'CAT1', 't1');
             UPDATE catalog_items SET is_deleted = 1 WHERE id = 'ITEM9';
             INSERT INTO item_variations (id, item_id, sku, price_amount, updated_at)
                VALUES ('V1', 'ITEM1', '0123456789', 399, 't1'),
                       ('V1b', 'ITEM1', 'SECONDARY', 999, 't1'),
                       ('V2', 'ITEM2', '555', 450, 't1');
             INSERT INTO images (id, url, item_id, updated_at)
                VALUES ('IMG1', 'https://img/milk.png', 'ITEM1', 't1');
             INSERT INTO vendor_data (item_id, vendor, case_cost, case_quantity, discontinued, updated_at)
                VALUES ('ITEM1', 'Dairy Co', 24.5, 12, 0, 't1');",
        )
        .unwrap();
    }

    fn record(item: &str) -> ReorderRecord {
        let now = Utc::now();
        ReorderRecord {
            id: format!("r-{item}"),
            catalog_item_id: item.into(),
            quantity: 2,
            status: ReorderStatus::Incomplete,
            added_by: "alice".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn cache_with_catalog() -> Arc<CrossReferenceCache> {
        let db = Arc::new(db::open_in_memory_for_test());
        seed_catalog(&db);
        CrossReferenceCache::new(db, &SyncConfig::default())
    }

    #[test]
    fn test_catalog_snapshot_joins_primary_variation_and_images() {
        let cache = cache_with_catalog();
        let snap = cache.get_catalog_snapshot("ITEM1").expect("catalog row");
        assert_eq!(snap.name, "Whole Milk");
        assert_eq!(snap.category.as_deref(), Some("Dairy"));
        assert_eq!(snap.barcode.as_deref(), Some("0123456789"));
        assert_eq!(snap.price, Some(3.99));
        assert_eq!(snap.images, vec!["https://img/milk.png".to_string()]);
        assert_eq!(cache.stats().catalog_entries, 1);
    }

    #[test]
    fn test_deleted_catalog_item_yields_unknown_item() {
        let cache = cache_with_catalog();
        let rows = cache.build_display_records(&[record("ITEM9")]);
        assert_eq!(rows[0].name, "Unknown Item (ITEM9)");
        assert!(rows[0].missing_square_data);
        assert!(rows[0].missing_vendor_data);
    }

    #[test]
    fn test_batch_matches_individual_lookups() {
        let records = vec![record("ITEM1"), record("ITEM2"), record("NOPE")];

        let batch_cache = cache_with_catalog();
        let batch = batch_cache.build_display_records(&records);

        let single_cache = cache_with_catalog();
        let single: Vec<_> = records
            .iter()
            .map(|r| {
                compose_display(
                    r,
                    single_cache.get_catalog_snapshot(&r.catalog_item_id).as_ref(),
                    single_cache.get_vendor_snapshot(&r.catalog_item_id).as_ref(),
                )
            })
            .collect();

        assert_eq!(batch, single);
        assert_eq!(batch[0].vendor.as_deref(), Some("Dairy Co"));
        assert_eq!(batch[0].case_quantity, Some(12));
        assert!(batch[2].missing_square_data);
    }

    #[test]
    fn test_custom_item_resolves_from_vendor_notes() {
        let cache = cache_with_catalog();
        {
            let conn = cache.db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO vendor_data (item_id, vendor, notes, updated_at) VALUES (?1, ?2, ?3, 't1')",
                params![
                    "custom_basil",
                    "Local Farm",
                    r#"{"name":"Fresh Basil","category":"Produce","price":2.5}"#
                ],
            )
            .unwrap();
        }
        let rows = cache.build_display_records(&[record("custom_basil")]);
        assert_eq!(rows[0].name, "Fresh Basil");
        assert_eq!(rows[0].category.as_deref(), Some("Produce"));
        assert_eq!(rows[0].price, Some(2.5));
        assert!(!rows[0].missing_square_data);
        assert!(!rows[0].missing_vendor_data);
        assert_eq!(cache.stats().catalog_entries, 0);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let cache = cache_with_catalog();
        let first = cache.get_catalog_snapshot("ITEM1").unwrap();
        cache.get_vendor_snapshot("ITEM1").unwrap();

        let event = ChangeEvent::row(ChangeTable::CatalogItems, ChangeOperation::Update, "ITEM1");
        cache.invalidate(&event);
        let after_once = cache.stats();
        cache.invalidate(&event);
        assert_eq!(cache.stats(), after_once);
        assert_eq!(after_once.catalog_entries, 0);
        assert_eq!(after_once.vendor_entries, 1);

        assert_eq!(cache.get_catalog_snapshot("ITEM1").unwrap(), first);
    }

    #[test]
    fn test_image_event_clears_whole_catalog_cache() {
        let cache = cache_with_catalog();
        cache.get_catalog_snapshot("ITEM1");
        cache.get_catalog_snapshot("ITEM2");
        cache.invalidate(&ChangeEvent::row(
            ChangeTable::Images,
            ChangeOperation::Insert,
            "IMG7",
        ));
        assert_eq!(cache.stats().catalog_entries, 0);
    }

    #[test]
    fn test_listener_invalidates_through_notifier() {
        let cache = cache_with_catalog();
        let notifier = crate::notifier::ChangeNotifier::new();
        notifier.subscribe(CACHE_TABLES, cache.listener());
        cache.get_vendor_snapshot("ITEM1");
        notifier.publish(&ChangeEvent::table_wide(
            ChangeTable::VendorData,
            ChangeOperation::Update,
        ));
        assert_eq!(cache.stats().vendor_entries, 0);
    }

    #[test]
    fn test_missing_tables_degrade_to_none() {
        let state = DbState {
            conn: Mutex::new(Connection::open_in_memory().unwrap()),
            db_path: ":memory:".into(),
        };
        let cache = CrossReferenceCache::new(Arc::new(state), &SyncConfig::default());
        assert!(cache.get_catalog_snapshot("ITEM1").is_none());
        assert!(cache.get_vendor_snapshot("ITEM1").is_none());
        let rows = cache.build_display_records(&[record("ITEM1")]);
        assert!(rows[0].missing_square_data);
    }

    #[test]
    fn test_hard_limit_evicts_lowest_score_first() {
        let mut cache: SnapshotCache<u32> = SnapshotCache::new(10, 3600, 0.8, 0.7);
        let t0 = Utc::now();
        for i in 0..10u32 {
            cache.insert(format!("k{i}"), i, t0);
        }
        // k5..k9 are read repeatedly; k0..k4 never.
        for i in 5..10 {
            for _ in 0..3 {
                cache.get(&format!("k{i}"), t0 + ChronoDuration::seconds(5));
            }
        }

        cache.insert("k10".into(), 10, t0 + ChronoDuration::seconds(10));
        assert!(cache.len() <= 10);
        assert_eq!(cache.len(), 8);
        for i in 5..11 {
            assert!(cache.contains(&format!("k{i}")), "k{i} should survive");
        }
    }

    #[test]
    fn test_optimize_at_capacity_shrinks_to_target() {
        let mut cache: SnapshotCache<u32> = SnapshotCache::new(10, 3600, 0.8, 0.7);
        let t0 = Utc::now();
        for i in 0..10u32 {
            cache.insert(format!("k{i}"), i, t0);
        }
        assert_eq!(cache.optimize(t0), 3);
        assert_eq!(cache.len(), 7);
    }

    #[test]
    fn test_soft_limit_drops_oldest_half() {
        let mut cache: SnapshotCache<u32> = SnapshotCache::new(10, 3600, 0.8, 0.7);
        let t0 = Utc::now();
        for i in 0..8u32 {
            cache.insert(format!("k{i}"), i, t0 + ChronoDuration::seconds(i as i64));
        }
        assert_eq!(cache.optimize(t0 + ChronoDuration::seconds(20)), 4);
        for i in 0..4 {
            assert!(!cache.contains(&format!("k{i}")));
        }
        for i in 4..8 {
            assert!(cache.contains(&format!("k{i}")));
        }
    }

    #[test]
    fn test_expired_entries_are_misses_and_dropped_first() {
        let mut cache: SnapshotCache<u32> = SnapshotCache::new(10, 60, 0.8, 0.7);
        let t0 = Utc::now();
        cache.insert("old".into(), 1, t0);
        cache.insert("fresh".into(), 2, t0 + ChronoDuration::seconds(50));

        let later = t0 + ChronoDuration::seconds(90);
        assert_eq!(cache.optimize(later), 1);
        assert!(cache.contains("fresh"));
        assert_eq!(cache.get("old", later), None);

        assert_eq!(cache.get("fresh", t0 + ChronoDuration::seconds(200)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidation_during_load_is_not_overwritten() {
        let cache = cache_with_catalog();
        let now = Utc::now();
        let generation = cache.catalog.lock().unwrap().generation();
        let ids = vec!["ITEM1".to_string()];
        let stale = cache.read_db("catalog", |conn| load_catalog(conn, &ids));

        // Catalog row changes after the read but before the result is cached.
        {
            let conn = cache.db.conn.lock().unwrap();
            conn.execute("UPDATE catalog_items SET name = 'Skim Milk' WHERE id = 'ITEM1'", [])
                .unwrap();
        }
        cache.invalidate(&ChangeEvent::row(
            ChangeTable::CatalogItems,
            ChangeOperation::Update,
            "ITEM1",
        ));
        store_loaded(&cache.catalog, generation, &stale, now);

        assert_eq!(cache.stats().catalog_entries, 0);
        assert_eq!(cache.get_catalog_snapshot("ITEM1").unwrap().name, "Skim Milk");
    }

    #[test]
    fn test_insert_loaded_respects_generation() {
        let mut cache: SnapshotCache<u32> = SnapshotCache::new(10, 3600, 0.8, 0.7);
        let now = Utc::now();
        let generation = cache.generation();
        cache.remove("k1");
        assert!(!cache.insert_loaded("k1".into(), 1, now, generation));
        assert!(cache.is_empty());
        assert!(cache.insert_loaded("k1".into(), 1, now, cache.generation()));
        assert!(cache.contains("k1"));
    }

    #[tokio::test]
    async fn test_periodic_optimizer_evicts_without_reads() {
        let db = Arc::new(db::open_in_memory_for_test());
        seed_catalog(&db);
        let config = SyncConfig {
            cache_capacity: 2,
            ..SyncConfig::default()
        };
        let cache = CrossReferenceCache::new(db, &config);
        cache.get_catalog_snapshot("ITEM1").unwrap();
        cache.get_catalog_snapshot("ITEM2").unwrap();
        assert_eq!(cache.stats().catalog_entries, 2);

        cache.start_optimizer(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.stop_optimizer();

        // Capacity 2 reached: weighted LRU trims to floor(2 * 0.7) = 1.
        assert_eq!(cache.stats().catalog_entries, 1);
    }

    #[tokio::test]
    async fn test_optimizer_start_is_idempotent_and_stops() {
        let cache = cache_with_catalog();
        cache.start_optimizer(Duration::from_millis(10));
        cache.start_optimizer(Duration::from_millis(10));
        assert!(cache.optimizer.lock().unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.stop_optimizer();
        assert!(cache.optimizer.lock().unwrap().is_none());
    }
}
