//! Remote reorder protocol seam.
//!
//! The backend is a multi-writer store shared by every device of a team.
//! `RemoteReorderStore` is what the sync engine and recovery service speak;
//! `api::HttpReorderRemote` binds it to the REST backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::models::{ReorderRecord, VendorSnapshot};

#[async_trait]
pub trait RemoteReorderStore: Send + Sync {
    async fn list_records(&self) -> SyncResult<Vec<ReorderRecord>>;

    async fn create_record(&self, record: &ReorderRecord) -> SyncResult<()>;

    async fn update_record(&self, record: &ReorderRecord) -> SyncResult<()>;

    /// Deleting a record the backend no longer has is a success.
    async fn delete_record(&self, id: &str) -> SyncResult<()>;

    async fn list_vendor_data(&self) -> SyncResult<Vec<VendorSnapshot>>;

    /// Ask the auth layer for fresh credentials. `Ok(false)` means nothing
    /// changed and the caller should go offline.
    async fn refresh_auth(&self) -> SyncResult<bool> {
        Ok(false)
    }

    /// Cheap reachability probe used before a forced sync while offline.
    async fn check_connectivity(&self) -> bool {
        true
    }
}

/// A change pushed by the backend for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RemoteChange {
    Upsert {
        record: ReorderRecord,
        actor: Option<String>,
    },
    Delete {
        id: String,
        actor: Option<String>,
    },
}

impl RemoteChange {
    pub fn actor(&self) -> Option<&str> {
        match self {
            RemoteChange::Upsert { actor, .. } | RemoteChange::Delete { actor, .. } => {
                actor.as_deref()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory backend with failure injection for tests.

    use super::*;
    use crate::error::SyncError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Failure {
        None,
        Transient,
        Auth,
        Conflict,
        Rejected,
    }

    impl Failure {
        fn into_result(self) -> SyncResult<()> {
            match self {
                Failure::None => Ok(()),
                Failure::Transient => Err(SyncError::TransientNetwork("connection refused".into())),
                Failure::Auth => Err(SyncError::AuthExpired("HTTP 401".into())),
                Failure::Conflict => Err(SyncError::DataConflict("HTTP 409".into())),
                Failure::Rejected => Err(SyncError::Remote("HTTP 422".into())),
            }
        }
    }

    pub struct MemoryRemote {
        pub records: Mutex<BTreeMap<String, ReorderRecord>>,
        pub vendor: Mutex<Vec<VendorSnapshot>>,
        pub calls: Mutex<Vec<String>>,
        pub failure: Mutex<Failure>,
        pub refresh_succeeds: AtomicBool,
        pub list_calls: AtomicUsize,
        /// Failure for `list_records` alone, checked before `failure`.
        pub list_failure: Mutex<Failure>,
        pub latency_ms: AtomicU64,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl MemoryRemote {
        pub fn new() -> Self {
            Self {
                records: Mutex::new(BTreeMap::new()),
                vendor: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                failure: Mutex::new(Failure::None),
                refresh_succeeds: AtomicBool::new(false),
                list_calls: AtomicUsize::new(0),
                list_failure: Mutex::new(Failure::None),
                latency_ms: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn fail_with(&self, failure: Failure) {
            *self.failure.lock().unwrap() = failure;
        }

        pub fn seed(&self, record: ReorderRecord) {
            self.records
                .lock()
                .unwrap()
                .insert(record.id.clone(), record);
        }

        pub fn record(&self, id: &str) -> Option<ReorderRecord> {
            self.records.lock().unwrap().get(id).cloned()
        }

        pub fn count(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn check(&self, call: String) -> SyncResult<()> {
            let failure = *self.failure.lock().unwrap();
            self.calls.lock().unwrap().push(call);
            failure.into_result()
        }

        /// Hold a write call open for `latency_ms`, tracking peak concurrency.
        async fn simulate_latency(&self) {
            let latency = self.latency_ms.load(Ordering::SeqCst);
            if latency == 0 {
                return;
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RemoteReorderStore for MemoryRemote {
        async fn list_records(&self) -> SyncResult<Vec<ReorderRecord>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let list_failure = *self.list_failure.lock().unwrap();
            if list_failure != Failure::None {
                self.calls.lock().unwrap().push("list".into());
                list_failure.into_result()?;
            }
            let failure = *self.failure.lock().unwrap();
            if matches!(failure, Failure::Transient | Failure::Auth) {
                self.check("list".into())?;
            }
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }

        async fn create_record(&self, record: &ReorderRecord) -> SyncResult<()> {
            self.simulate_latency().await;
            self.check(format!("create:{}:{}", record.id, record.quantity))?;
            self.seed(record.clone());
            Ok(())
        }

        async fn update_record(&self, record: &ReorderRecord) -> SyncResult<()> {
            self.simulate_latency().await;
            self.check(format!("update:{}:{}", record.id, record.quantity))?;
            self.seed(record.clone());
            Ok(())
        }

        async fn delete_record(&self, id: &str) -> SyncResult<()> {
            self.simulate_latency().await;
            self.check(format!("delete:{id}"))?;
            self.records.lock().unwrap().remove(id);
            Ok(())
        }

        async fn list_vendor_data(&self) -> SyncResult<Vec<VendorSnapshot>> {
            let failure = *self.failure.lock().unwrap();
            if matches!(failure, Failure::Transient | Failure::Auth) {
                self.check("list_vendor".into())?;
            }
            Ok(self.vendor.lock().unwrap().clone())
        }

        async fn refresh_auth(&self) -> SyncResult<bool> {
            let ok = self.refresh_succeeds.load(Ordering::SeqCst);
            if ok {
                self.fail_with(Failure::None);
            }
            Ok(ok)
        }

        async fn check_connectivity(&self) -> bool {
            *self.failure.lock().unwrap() != Failure::Transient
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_change_wire_shape() {
        let change: RemoteChange = serde_json::from_value(serde_json::json!({
            "type": "delete",
            "id": "r-9",
            "actor": "bob"
        }))
        .unwrap();
        assert_eq!(change.actor(), Some("bob"));
        assert!(matches!(change, RemoteChange::Delete { ref id, .. } if id == "r-9"));
    }
}
