// ============================================================================
// LATCH.RS - ONE-SHOT SIGNALS
// Shared between the callback server handlers and the orchestrator
// ============================================================================

use std::time::Duration;
use tokio::sync::watch;

/// A flag that can be set once and waited on with a timeout.
///
/// Setting is idempotent. Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_if_modified(|value| {
            if *value {
                false
            } else {
                *value = true;
                true
            }
        });
    }

    /// Clear the flag for the next session
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is set or `wait` elapses. Returns the final state.
    pub async fn wait(&self, wait: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let _ = tokio::time::timeout(wait, rx.wait_for(|value| *value)).await;
        self.is_set()
    }

    /// Wait for every latch in `latches`; true only if all are set in time
    pub async fn wait_all(latches: &[&Latch], wait: Duration) -> bool {
        let all = async {
            for latch in latches {
                let mut rx = latch.tx.subscribe();
                let _ = rx.wait_for(|value| *value).await;
            }
        };
        let _ = tokio::time::timeout(wait, all).await;
        latches.iter().all(|latch| latch.is_set())
    }
}
