//! Durable subscription registry and its in-memory cache.

mod cache;

pub use cache::RegistryCache;

use crate::error::Result;
use crate::types::PushSubscription;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Read access to the durable subscription store.
pub trait DurableRegistry: Send + Sync {
    /// All subscriptions of a user.
    fn load_subscriptions_for(&self, user_id: i32, context_id: i32) -> Result<Vec<PushSubscription>>;
}

/// Write access to the durable subscription store.
pub trait RegistryStore: DurableRegistry {
    /// Store a subscription, replacing one with the same identity.
    /// Returns true if it was not known before.
    fn register(&self, subscription: &PushSubscription) -> Result<bool>;

    /// Returns true if the subscription existed.
    fn unregister(&self, subscription: &PushSubscription) -> Result<bool>;

    /// Remove all subscriptions of a user, returning how many were removed.
    fn unregister_all(&self, user_id: i32, context_id: i32) -> Result<usize>;
}

/// Registry kept in process memory.
#[derive(Default)]
pub struct MemoryRegistry {
    subscriptions: RwLock<HashMap<(i32, i32), Vec<PushSubscription>>>,
    loads: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load_subscriptions_for` calls served.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl DurableRegistry for MemoryRegistry {
    fn load_subscriptions_for(&self, user_id: i32, context_id: i32) -> Result<Vec<PushSubscription>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .subscriptions
            .read()
            .get(&(context_id, user_id))
            .cloned()
            .unwrap_or_default())
    }
}

impl RegistryStore for MemoryRegistry {
    fn register(&self, subscription: &PushSubscription) -> Result<bool> {
        let key = subscription.key();
        let mut subs = self.subscriptions.write();
        let list = subs
            .entry((subscription.context_id, subscription.user_id))
            .or_default();
        let existed = list.iter().position(|s| s.key() == key);
        match existed {
            Some(pos) => list[pos] = subscription.clone(),
            None => list.push(subscription.clone()),
        }
        Ok(existed.is_none())
    }

    fn unregister(&self, subscription: &PushSubscription) -> Result<bool> {
        let key = subscription.key();
        let mut subs = self.subscriptions.write();
        let map_key = (subscription.context_id, subscription.user_id);
        let Some(list) = subs.get_mut(&map_key) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|s| s.key() != key);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(&map_key);
        }
        Ok(removed)
    }

    fn unregister_all(&self, user_id: i32, context_id: i32) -> Result<usize> {
        Ok(self
            .subscriptions
            .write()
            .remove(&(context_id, user_id))
            .map_or(0, |list| list.len()))
    }
}
