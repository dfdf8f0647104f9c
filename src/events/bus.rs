//! Local cache event bus.

use super::CacheEvent;
use crate::listeners::{ListenerId, ListenerRegistry};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

/// Receiver of cache events.
pub trait CacheListener: Send + Sync {
    /// Called for every event on the bus. `from_remote` is true when the
    /// event was received from another node.
    fn on_event(&self, event: &CacheEvent, from_remote: bool);
}

/// In-process bus delivering cache events to registered listeners.
#[derive(Default)]
pub struct CacheEventBus {
    listeners: ListenerRegistry<dyn CacheListener>,
}

impl CacheEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver an event to every listener registered at call time.
    ///
    /// A panicking listener is logged and does not keep the event from the
    /// remaining listeners.
    pub fn notify(&self, event: &CacheEvent, from_remote: bool) {
        trace!(
            region = %event.region,
            operation = %event.operation,
            keys = event.keys.len(),
            from_remote,
            "dispatching cache event"
        );
        for listener in self.listeners.snapshot() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_event(event, from_remote)
            }));
            if result.is_err() {
                error!(region = %event.region, "cache listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(CacheEvent, bool)>>);

    impl CacheListener for Recorder {
        fn on_event(&self, event: &CacheEvent, from_remote: bool) {
            self.0.lock().push((event.clone(), from_remote));
        }
    }

    struct Panicker;

    impl CacheListener for Panicker {
        fn on_event(&self, _: &CacheEvent, _: bool) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_notify_all_listeners() {
        let bus = CacheEventBus::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        bus.notify(&CacheEvent::invalidate_user(7, 3), true);

        assert_eq!(a.0.lock().len(), 1);
        assert!(b.0.lock()[0].1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = CacheEventBus::new();
        let a = Arc::new(Recorder::default());
        let id = bus.subscribe(a.clone());
        assert!(bus.unsubscribe(id));

        bus.notify(&CacheEvent::clear_region(), false);
        assert!(a.0.lock().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = CacheEventBus::new();
        let a = Arc::new(Recorder::default());
        bus.subscribe(Arc::new(Panicker));
        bus.subscribe(a.clone());

        bus.notify(&CacheEvent::clear_region(), false);
        assert_eq!(a.0.lock().len(), 1);
    }
}
