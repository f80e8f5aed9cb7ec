//! Data model shared across the store, cache and sync engine.
//!
//! `ReorderRecord` is the only persisted reorder shape. Everything shown to
//! the user is a `DisplayReorderRecord` assembled at read time from the
//! record plus catalog and vendor snapshots.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Prefix marking reorder entries with no catalog backing.
pub const CUSTOM_ITEM_PREFIX: &str = "custom_";

pub fn is_custom_item(item_id: &str) -> bool {
    item_id.starts_with(CUSTOM_ITEM_PREFIX)
}

/// Canonical timestamp encoding for SQLite columns and wire payloads.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

// ---------------------------------------------------------------------------
// Reorder records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReorderStatus {
    Incomplete,
    Complete,
}

impl ReorderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReorderStatus::Incomplete => "incomplete",
            ReorderStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for ReorderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReorderStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incomplete" | "added" | "pending" => Ok(ReorderStatus::Incomplete),
            "complete" | "completed" => Ok(ReorderStatus::Complete),
            other => Err(SyncError::Validation(format!("unknown reorder status: {other}"))),
        }
    }
}

/// Minimal reorder row. Never carries catalog fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRecord {
    pub id: String,
    pub catalog_item_id: String,
    pub quantity: i64,
    pub status: ReorderStatus,
    pub added_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReorderRecord {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.id.trim().is_empty() {
            return Err(SyncError::Validation("record id is empty".into()));
        }
        if self.catalog_item_id.trim().is_empty() {
            return Err(SyncError::Validation("catalog item id is empty".into()));
        }
        if self.quantity < 1 {
            return Err(SyncError::Validation(format!(
                "quantity must be at least 1 (got {})",
                self.quantity
            )));
        }
        Ok(())
    }

    pub fn is_custom(&self) -> bool {
        is_custom_item(&self.catalog_item_id)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub item_id: String,
    pub name: String,
    pub barcode: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorSnapshot {
    pub item_id: String,
    pub vendor: Option<String>,
    pub case_cost: Option<f64>,
    pub case_quantity: Option<i64>,
    pub discontinued: bool,
    pub notes: Option<String>,
}

/// Display fields stored in `vendor_data.notes` for custom items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomItemNotes {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
}

impl VendorSnapshot {
    pub fn custom_notes(&self) -> Option<CustomItemNotes> {
        self.notes
            .as_deref()
            .and_then(|raw| serde_json::from_str::<CustomItemNotes>(raw).ok())
    }
}

/// Ephemeral view handed to the UI. Rebuilt on every read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayReorderRecord {
    pub record: ReorderRecord,
    pub name: String,
    pub barcode: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub images: Vec<String>,
    pub vendor: Option<String>,
    pub case_cost: Option<f64>,
    pub case_quantity: Option<i64>,
    pub discontinued: bool,
    pub missing_square_data: bool,
    pub missing_vendor_data: bool,
}

pub fn fallback_item_name(item_id: &str) -> String {
    format!("Unknown Item ({item_id})")
}

// ---------------------------------------------------------------------------
// Sync operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Ok(OperationKind::Create),
            "UPDATE" => Ok(OperationKind::Update),
            "DELETE" => Ok(OperationKind::Delete),
            other => Err(SyncError::Validation(format!("unknown operation: {other}"))),
        }
    }
}

/// One queued outbound change, as stored in `sync_queue`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: i64,
    pub operation: OperationKind,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: i64,
    #[serde(skip)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    CatalogItems,
    ItemVariations,
    Categories,
    Images,
    VendorData,
    ReorderItems,
}

impl ChangeTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            ChangeTable::CatalogItems => "catalog_items",
            ChangeTable::ItemVariations => "item_variations",
            ChangeTable::Categories => "categories",
            ChangeTable::Images => "images",
            ChangeTable::VendorData => "vendor_data",
            ChangeTable::ReorderItems => "reorder_items",
        }
    }

    /// Column that identifies the affected catalog item for this table.
    pub fn entity_column(&self) -> &'static str {
        match self {
            ChangeTable::ItemVariations | ChangeTable::VendorData => "item_id",
            _ => "id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: ChangeTable,
    pub operation: ChangeOperation,
    /// `None` means the whole table may have changed.
    pub entity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn row(table: ChangeTable, operation: ChangeOperation, entity_id: &str) -> Self {
        Self {
            table,
            operation,
            entity_id: Some(entity_id.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn table_wide(table: ChangeTable, operation: ChangeOperation) -> Self {
        Self {
            table,
            operation,
            entity_id: None,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperationSummary {
    pub id: i64,
    pub operation: OperationKind,
    pub entity_id: String,
    pub retry_count: i64,
    pub status: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_sync_at: Option<String>,
    pub queue_operations: Vec<QueuedOperationSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(quantity: i64) -> ReorderRecord {
        let now = Utc::now();
        ReorderRecord {
            id: "r-1".into(),
            catalog_item_id: "ITEM1".into(),
            quantity,
            status: ReorderStatus::Incomplete,
            added_by: "alice".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_quantity_must_be_positive() {
        assert!(record(1).validate().is_ok());
        assert!(matches!(
            record(0).validate(),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_custom_notes_parse() {
        let vendor = VendorSnapshot {
            item_id: "custom_abc".into(),
            vendor: Some("Local Farm".into()),
            case_cost: None,
            case_quantity: None,
            discontinued: false,
            notes: Some(r#"{"name":"Fresh Basil","category":"Produce"}"#.into()),
        };
        let notes = vendor.custom_notes().expect("notes");
        assert_eq!(notes.name.as_deref(), Some("Fresh Basil"));
        assert_eq!(notes.category.as_deref(), Some("Produce"));
        assert!(is_custom_item("custom_abc"));
        assert!(!is_custom_item("ABCDEF"));
    }

    #[test]
    fn test_record_wire_shape_is_camel_case() {
        let json = serde_json::to_value(record(2)).unwrap();
        assert_eq!(json["catalogItemId"], "ITEM1");
        assert_eq!(json["status"], "incomplete");
        let back: ReorderRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.quantity, 2);
    }

    #[test]
    fn test_timestamp_format_round_trips() {
        let ts = parse_ts("2026-03-01T10:15:30.250Z").unwrap();
        assert_eq!(format_ts(&ts), "2026-03-01T10:15:30.250Z");
        assert!(parse_ts("not a date").is_none());
    }
}
