//! Tunables for the sync engine, cache and change monitor.
//!
//! Defaults are compiled in; any field can be overridden per install through
//! `local_settings` rows in the `reorder_sync` category, keyed by field name.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::db;

/// `local_settings.setting_category` holding config overrides.
pub const SETTINGS_CATEGORY: &str = "reorder_sync";

/// Log level used when a display record has no vendor row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingVendorSeverity {
    Off,
    Debug,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce_ms: u64,
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub max_retries: i64,

    pub cache_capacity: usize,
    pub cache_ttl_secs: i64,
    pub cache_soft_ratio: f64,
    pub cache_target_ratio: f64,
    pub cache_optimize_interval_secs: u64,

    pub monitor_interval_ms: u64,
    pub missing_vendor_severity: MissingVendorSeverity,

    /// Id of the user on this device; remote changes by this user are ignored.
    pub user_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            max_batch_size: 25,
            max_concurrency: 4,
            retry_base_ms: 1_000,
            retry_cap_ms: 60_000,
            max_retries: 3,

            cache_capacity: 500,
            cache_ttl_secs: 30 * 60,
            cache_soft_ratio: 0.8,
            cache_target_ratio: 0.7,
            cache_optimize_interval_secs: 60,

            monitor_interval_ms: 3_000,
            missing_vendor_severity: MissingVendorSeverity::Debug,

            user_id: String::new(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(100))
    }

    pub fn optimize_interval(&self) -> Duration {
        Duration::from_secs(self.cache_optimize_interval_secs.max(1))
    }

    /// Apply `local_settings` overrides on top of `self`.
    ///
    /// Unknown keys and unparsable values are logged and skipped so a bad row
    /// never prevents startup.
    pub fn with_local_overrides(mut self, conn: &Connection) -> Self {
        let overrides = db::get_settings_in_category(conn, SETTINGS_CATEGORY);
        if overrides.is_empty() {
            return self;
        }

        let mut merged = match serde_json::to_value(&self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return self,
        };

        for (key, raw) in overrides {
            let Some(current) = merged.get(&key) else {
                warn!(key = %key, "Ignoring unknown reorder_sync setting");
                continue;
            };
            let parsed = match current {
                serde_json::Value::String(_) => {
                    // Enum and string fields: accept bare or JSON-quoted text.
                    serde_json::from_str::<serde_json::Value>(&raw)
                        .ok()
                        .filter(|v| v.is_string())
                        .unwrap_or(serde_json::Value::String(raw.clone()))
                }
                _ => match serde_json::from_str::<serde_json::Value>(&raw) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(key = %key, value = %raw, "Unparsable reorder_sync setting: {e}");
                        continue;
                    }
                },
            };
            debug!(key = %key, value = %raw, "Applying reorder_sync setting override");
            merged.insert(key, parsed);
        }

        match serde_json::from_value::<SyncConfig>(serde_json::Value::Object(merged)) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("reorder_sync overrides rejected, keeping defaults: {e}");
                self
            }
        }
    }
}
