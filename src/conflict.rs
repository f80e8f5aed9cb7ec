//! Conflict detection and resolution for reorder records.
//!
//! A conflict exists only when an incoming remote copy is older than the
//! local one. Then the configured strategy picks take-local, take-remote or
//! merge; whatever wins is written locally and pushed back out so every
//! device converges on the same row.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::ReorderRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    TakeLocal,
    TakeRemote,
    Merge,
}

/// Picks a side for a genuine conflict.
///
/// Production binds a UI prompt; tests bind one of the deterministic
/// strategies below.
#[async_trait]
pub trait ConflictResolutionStrategy: Send + Sync {
    async fn resolve(&self, local: &ReorderRecord, remote: &ReorderRecord) -> ConflictChoice;
}

/// Always answers with the same choice.
pub struct FixedChoice(pub ConflictChoice);

#[async_trait]
impl ConflictResolutionStrategy for FixedChoice {
    async fn resolve(&self, _local: &ReorderRecord, _remote: &ReorderRecord) -> ConflictChoice {
        self.0
    }
}

/// Newest `updated_at` wins; ties go to the remote copy.
pub struct LastWriteWins;

#[async_trait]
impl ConflictResolutionStrategy for LastWriteWins {
    async fn resolve(&self, local: &ReorderRecord, remote: &ReorderRecord) -> ConflictChoice {
        if local.updated_at > remote.updated_at {
            ConflictChoice::TakeLocal
        } else {
            ConflictChoice::TakeRemote
        }
    }
}

/// What the engine has to do after reconciling one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Local copy is not newer: adopt remote as-is, nothing to push.
    AdoptRemote(ReorderRecord),
    /// Genuine conflict: write `record` locally and enqueue an UPDATE.
    Resolved {
        record: ReorderRecord,
        choice: ConflictChoice,
    },
}

impl Reconciliation {
    pub fn record(&self) -> &ReorderRecord {
        match self {
            Reconciliation::AdoptRemote(record) => record,
            Reconciliation::Resolved { record, .. } => record,
        }
    }

    pub fn needs_push(&self) -> bool {
        matches!(self, Reconciliation::Resolved { .. })
    }
}

pub fn is_conflict(local: &ReorderRecord, remote: &ReorderRecord) -> bool {
    local.updated_at > remote.updated_at
}

/// Field-level merge: larger quantity, status from the later writer.
pub fn merge_records(local: &ReorderRecord, remote: &ReorderRecord) -> ReorderRecord {
    let status = if local.updated_at >= remote.updated_at {
        local.status
    } else {
        remote.status
    };
    ReorderRecord {
        id: local.id.clone(),
        catalog_item_id: local.catalog_item_id.clone(),
        quantity: local.quantity.max(remote.quantity),
        status,
        added_by: local.added_by.clone(),
        created_at: local.created_at.min(remote.created_at),
        updated_at: local.updated_at.max(remote.updated_at),
    }
}

pub struct ConflictResolver {
    strategy: Box<dyn ConflictResolutionStrategy>,
}

impl ConflictResolver {
    pub fn new(strategy: Box<dyn ConflictResolutionStrategy>) -> Self {
        Self { strategy }
    }

    pub async fn reconcile(&self, local: &ReorderRecord, remote: &ReorderRecord) -> Reconciliation {
        if !is_conflict(local, remote) {
            debug!(record_id = %local.id, "remote copy is current; adopting");
            return Reconciliation::AdoptRemote(remote.clone());
        }

        let choice = self.strategy.resolve(local, remote).await;
        let mut record = match choice {
            ConflictChoice::TakeLocal => local.clone(),
            ConflictChoice::TakeRemote => remote.clone(),
            ConflictChoice::Merge => merge_records(local, remote),
        };
        // The pushed copy must beat both sides or the next pull re-conflicts.
        record.updated_at = Utc::now().max(local.updated_at);

        info!(
            record_id = %record.id,
            choice = ?choice,
            local_qty = local.quantity,
            remote_qty = remote.quantity,
            resolved_qty = record.quantity,
            "reorder conflict resolved"
        );
        Reconciliation::Resolved { record, choice }
    }
}
