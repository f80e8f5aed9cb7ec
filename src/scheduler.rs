//! Timers for the sync engine: a re-armable debounce and retry backoff.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// One-shot timer that keeps at most one pending callback.
///
/// Re-arming cancels whatever was pending. The callback runs on the tokio
/// runtime that was current when `schedule_after` was called.
#[derive(Default)]
pub struct DebounceTimer {
    pending: Mutex<Option<CancellationToken>>,
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless cancelled or re-armed first.
    ///
    /// Returns the token that cancels this particular arming, or `None`
    /// when called outside a tokio runtime.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> Option<CancellationToken>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("debounce requested outside a tokio runtime; skipping");
            return None;
        };

        let token = CancellationToken::new();
        {
            let Ok(mut pending) = self.pending.lock() else {
                return None;
            };
            if let Some(previous) = pending.replace(token.clone()) {
                previous.cancel();
            }
        }

        let armed = token.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = armed.cancelled() => {
                    trace!("debounce timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    task.await;
                }
            }
        });
        Some(token)
    }

    /// Arm only if nothing is pending. Keeps the original deadline so a
    /// steady stream of mutations cannot postpone the flush forever.
    pub fn schedule_if_idle<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_pending() {
            return false;
        }
        self.schedule_after(delay, task).is_some()
    }

    /// Cancel the pending callback, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match self.pending.lock() {
            Ok(mut pending) => match pending.take() {
                Some(token) => {
                    let live = !token.is_cancelled();
                    token.cancel();
                    live
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Forget the pending token once its callback has started.
    pub fn clear_fired(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|p| p.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }
}

/// `base × 2^retry`, capped at `cap`.
pub fn backoff_delay(base: Duration, retry: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}
