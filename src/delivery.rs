//! Delivery side: transports pushing notifications to devices.

use crate::error::Result;
use crate::types::{PushMatch, PushNotification};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Delivers notifications to matched subscriptions.
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    /// Deliver one notification to all given matches, which share the same
    /// client and transport.
    fn transport(&self, notification: &PushNotification, matches: &[PushMatch]) -> Result<()>;
}

/// Lookup of the transport serving a client.
pub trait TransportRegistry: Send + Sync {
    fn get_transport_for(&self, client: &str, transport_id: &str) -> Option<Arc<dyn Transport>>;
}

/// Transports registered by id, optionally restricted to certain clients.
#[derive(Default)]
pub struct TransportMap {
    transports: RwLock<HashMap<String, Registered>>,
}

struct Registered {
    transport: Arc<dyn Transport>,
    /// Clients served; empty serves every client.
    clients: Vec<String>,
}

impl TransportMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport for all clients, replacing one with the same id.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        self.register_for_clients(transport, Vec::new());
    }

    pub fn register_for_clients(&self, transport: Arc<dyn Transport>, clients: Vec<String>) {
        let id = transport.id().to_string();
        self.transports
            .write()
            .insert(id, Registered { transport, clients });
    }

    pub fn unregister(&self, transport_id: &str) -> bool {
        self.transports.write().remove(transport_id).is_some()
    }
}

impl TransportRegistry for TransportMap {
    fn get_transport_for(&self, client: &str, transport_id: &str) -> Option<Arc<dyn Transport>> {
        let transports = self.transports.read();
        let registered = transports.get(transport_id)?;
        if registered.clients.is_empty() || registered.clients.iter().any(|c| c == client) {
            Some(Arc::clone(&registered.transport))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    impl Transport for Noop {
        fn id(&self) -> &str {
            self.0
        }

        fn transport(&self, _: &PushNotification, _: &[PushMatch]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lookup() {
        let map = TransportMap::new();
        map.register(Arc::new(Noop("apn")));
        map.register_for_clients(Arc::new(Noop("gcm")), vec!["app".into()]);

        assert!(map.get_transport_for("anyone", "apn").is_some());
        assert!(map.get_transport_for("app", "gcm").is_some());
        assert!(map.get_transport_for("web", "gcm").is_none());
        assert!(map.get_transport_for("app", "wns").is_none());

        assert!(map.unregister("apn"));
        assert!(map.get_transport_for("anyone", "apn").is_none());
    }
}
