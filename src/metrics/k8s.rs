//! Helper functions for watcher metrics.

use crate::metrics::registry;

/// Watched resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchResource {
    Pod,
    Service,
}

impl AsRef<str> for WatchResource {
    fn as_ref(&self) -> &str {
        match self {
            WatchResource::Pod => "pod",
            WatchResource::Service => "service",
        }
    }
}

/// Watch event types for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Apply,
    Delete,
    Init,
    InitDone,
    Error,
}

impl AsRef<str> for WatchEventType {
    fn as_ref(&self) -> &str {
        match self {
            WatchEventType::Apply => "apply",
            WatchEventType::Delete => "delete",
            WatchEventType::Init => "init",
            WatchEventType::InitDone => "init_done",
            WatchEventType::Error => "error",
        }
    }
}

/// Increment the watch events counter.
pub fn inc_watch_event(resource: WatchResource, event: WatchEventType) {
    registry::WATCH_EVENTS_TOTAL
        .with_label_values(&[resource.as_ref(), event.as_ref()])
        .inc();
}
