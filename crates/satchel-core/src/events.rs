/// Store and replication lifecycle events.
///
/// Delivery is synchronous on the thread that completed the mutation;
/// listeners must queue any follow-up work instead of re-entering the
/// store.
use std::sync::{Arc, RwLock};

use crate::revision::Revision;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DocumentCreated {
        doc_id: String,
        rev: Revision,
    },
    DocumentUpdated {
        doc_id: String,
        rev: Revision,
    },
    DocumentDeleted {
        doc_id: String,
        rev: Revision,
    },
    ReplicationStarted {
        replication_id: String,
    },
    ReplicationCompleted {
        replication_id: String,
        documents_written: u64,
    },
    ReplicationErrored {
        replication_id: String,
        message: String,
    },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Fan-out of events to registered listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .push(listener);
    }

    pub fn post(&self, event: Event) {
        let listeners = self
            .listeners
            .read()
            .expect("event bus lock poisoned")
            .clone();
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.read().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn post_reaches_all_listeners() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe(Arc::new(move |_: &Event| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bus.post(Event::DocumentCreated {
            doc_id: "d".into(),
            rev: Revision::new(1, "a"),
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn post_without_listeners_is_noop() {
        let bus = EventBus::new();
        bus.post(Event::ReplicationStarted {
            replication_id: "r".into(),
        });
    }
}
