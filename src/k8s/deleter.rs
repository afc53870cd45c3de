// deleter.rs - Deferred removal of index entries
//
// Telemetry is aggregated on roughly one-minute windows, so a record that
// references a just-deleted pod IP can arrive well after the delete event.
// Removals are therefore scheduled instead of applied immediately; the
// default delay of two minutes covers two aggregation windows.

use std::{hash::Hash, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::time::sleep;
use tracing::trace;

/// Default removal delay applied to every index.
pub const DEFAULT_DELETION_DELAY: Duration = Duration::from_secs(120);

/// Removes keys from shared indexes after a fixed delay.
///
/// Each call detaches one task that sleeps and then deletes. There is no
/// cancellation: if the same key is re-added inside the window, the pending
/// removal deletes the new value too. Add/Delete/Re-Add of one address
/// within the window would require the cluster to reuse an IP immediately,
/// which does not happen in practice, and per-key cancellation would cost
/// coordination on every event.
#[derive(Clone, Debug)]
pub struct TimedDeleter {
    delay: Duration,
}

impl TimedDeleter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Schedules removal of `key` and returns immediately.
    pub fn delete_after<K, V>(&self, index: &Arc<DashMap<K, V>>, key: K)
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let index = Arc::clone(index);
        let delay = self.delay;

        tokio::spawn(async move {
            sleep(delay).await;
            index.remove(&key);
            trace!(event.name = "k8s.deleter.removed", "deferred removal applied");
        });
    }
}

impl Default for TimedDeleter {
    fn default() -> Self {
        Self::new(DEFAULT_DELETION_DELAY)
    }
}
