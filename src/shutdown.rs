use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::broadcast;
use tracing::info;

/// A stop signal that can be closed any number of times.
///
/// The resolver handle is shared by the trace and the metric processor, and
/// both may ask it to stop. The first `shutdown()` call broadcasts to every
/// subscribed loop; later calls are no-ops.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(8);
        Self {
            inner: Arc::new(Inner {
                tx,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe before spawning a loop; receivers created after `shutdown()`
    /// has fired will never see the signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.tx.subscribe()
    }

    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(event.name = "shutdown.signaled", "stop signal closed");
            // Fails only when no loop is listening, which is fine.
            let _ = self.inner.tx.send(());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
