//! In-process change notifier.
//!
//! Table-keyed publish/subscribe for `ChangeEvent`s. Writers of catalog,
//! vendor and image data publish here; the cross-reference cache and the
//! change monitor's consumers subscribe. Listeners run synchronously on the
//! publishing task and must not block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

use crate::models::{ChangeEvent, ChangeTable};

pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Identifies one registration; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct ChangeNotifier {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ChangeTable, Vec<(SubscriptionId, ChangeListener)>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events on any of `tables`.
    pub fn subscribe(&self, tables: &[ChangeTable], listener: ChangeListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        match self.listeners.lock() {
            Ok(mut guard) => {
                for table in tables {
                    guard
                        .entry(*table)
                        .or_default()
                        .push((id, listener.clone()));
                }
            }
            Err(e) => warn!("change notifier lock poisoned on subscribe: {e}"),
        }
        id
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut guard) = self.listeners.lock() else {
            return false;
        };
        let mut removed = false;
        for entries in guard.values_mut() {
            let before = entries.len();
            entries.retain(|(sub, _)| *sub != id);
            removed |= entries.len() != before;
        }
        guard.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Deliver `event` to every listener of its table.
    pub fn publish(&self, event: &ChangeEvent) {
        // Clone out so listeners can (un)subscribe without deadlocking.
        let targets: Vec<ChangeListener> = match self.listeners.lock() {
            Ok(guard) => guard
                .get(&event.table)
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default(),
            Err(e) => {
                warn!("change notifier lock poisoned on publish: {e}");
                return;
            }
        };
        trace!(
            table = ?event.table,
            entity_id = ?event.entity_id,
            listeners = targets.len(),
            "publishing change event"
        );
        for listener in targets {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .map(|guard| guard.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}
