//! Two-level (context, then user) cache of subscription indexes.

use super::DurableRegistry;
use crate::config::PushConfig;
use crate::error::Result;
use crate::events::{CacheEvent, CacheEventBus, CacheKey, CacheListener, CacheOperation, SUBSCRIPTION_REGION};
use crate::listeners::ListenerId;
use crate::subscriptions::SubscriptionIndex;
use crate::types::PushSubscription;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A loaded index and when it was last handed out.
struct Loaded {
    index: Arc<SubscriptionIndex>,
    last_access: Instant,
}

/// Cache entry of one user.
///
/// The slot mutex is held for the duration of a load, so concurrent
/// requests for the same user wait for that load instead of starting their
/// own. Requests for other users use other slots.
#[derive(Default)]
struct Slot {
    state: Mutex<Option<Loaded>>,
}

type UserSlots = HashMap<i32, Arc<Slot>>;

/// Memoizing cache of [`SubscriptionIndex`] instances backed by a
/// [`DurableRegistry`].
///
/// Entries expire after an idle period and are dropped on invalidation. Local
/// mutations are written through to cached indexes and announced on the
/// cache event bus; invalidations received from remote nodes drop entries.
pub struct RegistryCache {
    registry: Arc<dyn DurableRegistry>,
    bus: Arc<CacheEventBus>,
    contexts: Mutex<LruCache<i32, UserSlots>>,
    idle_time: Duration,
    listener_id: Mutex<Option<ListenerId>>,
}

impl RegistryCache {
    /// Create the cache and register it for remote invalidations on `bus`.
    pub fn new(
        registry: Arc<dyn DurableRegistry>,
        bus: Arc<CacheEventBus>,
        config: &PushConfig,
    ) -> Arc<Self> {
        let capacity = NonZeroUsize::new(config.max_cached_contexts).unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(Self {
            registry,
            bus: Arc::clone(&bus),
            contexts: Mutex::new(LruCache::new(capacity)),
            idle_time: config.cache_idle_time,
            listener_id: Mutex::new(None),
        });

        let listener = Arc::new(RemoteInvalidation {
            cache: Arc::downgrade(&cache),
        });
        *cache.listener_id.lock() = Some(bus.subscribe(listener));
        cache
    }

    /// Stop listening for remote invalidations.
    pub fn detach(&self) {
        if let Some(id) = self.listener_id.lock().take() {
            self.bus.unsubscribe(id);
        }
    }

    /// Index of a user, loaded from the registry if absent or expired.
    ///
    /// A failed load leaves the entry empty, so the next call retries.
    pub fn get_index_for(&self, user_id: i32, context_id: i32) -> Result<Arc<SubscriptionIndex>> {
        let slot = self.slot_for(user_id, context_id);
        let mut state = slot.state.lock();

        if let Some(loaded) = state.as_mut() {
            if loaded.last_access.elapsed() <= self.idle_time {
                loaded.last_access = Instant::now();
                return Ok(Arc::clone(&loaded.index));
            }
            debug!(user_id, context_id, "cached subscription index expired");
            *state = None;
        }

        let subscriptions = match self.registry.load_subscriptions_for(user_id, context_id) {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                drop(state);
                self.discard_empty_slot(user_id, context_id, &slot);
                return Err(e);
            }
        };
        debug!(
            user_id,
            context_id,
            count = subscriptions.len(),
            "loaded subscriptions"
        );
        let index = Arc::new(SubscriptionIndex::with_subscriptions(
            user_id,
            context_id,
            subscriptions,
        ));
        *state = Some(Loaded {
            index: Arc::clone(&index),
            last_access: Instant::now(),
        });
        Ok(index)
    }

    /// Add to the cached index of the subscription's user, if there is one,
    /// and announce the change.
    ///
    /// Returns false (and does nothing) if no index is cached.
    pub fn add_and_invalidate_if_present(&self, subscription: &PushSubscription) -> bool {
        let Some(index) = self.cached_index(subscription.user_id, subscription.context_id) else {
            return false;
        };
        index.add(subscription);
        self.announce(CacheEvent::invalidate_user(
            subscription.user_id,
            subscription.context_id,
        ));
        true
    }

    /// Remove from the cached index of the subscription's user, if there is
    /// one, and announce the change.
    ///
    /// Returns false (and does nothing) if no index is cached.
    pub fn remove_and_invalidate_if_present(&self, subscription: &PushSubscription) -> bool {
        let Some(index) = self.cached_index(subscription.user_id, subscription.context_id) else {
            return false;
        };
        index.remove(subscription);
        self.announce(CacheEvent::invalidate_user(
            subscription.user_id,
            subscription.context_id,
        ));
        true
    }

    /// Evict cached indexes.
    ///
    /// `user_id == 0` drops the whole context, `context_id <= 0` drops
    /// everything. With `notify` the eviction is announced on the bus.
    pub fn drop_for(&self, user_id: i32, context_id: i32, notify: bool) {
        if context_id <= 0 {
            self.clear(notify);
            return;
        }

        {
            let mut contexts = self.contexts.lock();
            if user_id == 0 {
                contexts.pop(&context_id);
            } else if let Some(users) = contexts.peek_mut(&context_id) {
                users.remove(&user_id);
                if users.is_empty() {
                    contexts.pop(&context_id);
                }
            }
        }
        debug!(user_id, context_id, notify, "dropped cached subscriptions");

        if notify {
            self.announce(CacheEvent::invalidate_user(user_id, context_id));
        }
    }

    /// Drop every cached index.
    pub fn clear(&self, notify: bool) {
        self.contexts.lock().clear();
        debug!(notify, "cleared subscription cache");
        if notify {
            self.announce(CacheEvent::clear_region());
        }
    }

    /// Evict entries idle for longer than the idle time. Entries currently
    /// being loaded are left alone. Returns the number of evicted entries.
    pub fn purge_expired(&self) -> usize {
        let mut contexts = self.contexts.lock();
        let mut purged = 0;
        let mut empty = Vec::new();

        for (context_id, users) in contexts.iter_mut() {
            users.retain(|_, slot| {
                let Some(state) = slot.state.try_lock() else {
                    return true;
                };
                let keep = match state.as_ref() {
                    Some(loaded) => loaded.last_access.elapsed() <= self.idle_time,
                    None => false,
                };
                if !keep {
                    purged += 1;
                }
                keep
            });
            if users.is_empty() {
                empty.push(*context_id);
            }
        }
        for context_id in empty {
            contexts.pop(&context_id);
        }
        purged
    }

    /// Whether a live index is cached for the user.
    pub fn is_cached(&self, user_id: i32, context_id: i32) -> bool {
        self.cached_index(user_id, context_id).is_some()
    }

    /// Context ids with cache entries, most recently used first.
    pub fn cached_contexts(&self) -> Vec<i32> {
        self.contexts.lock().iter().map(|(ctx, _)| *ctx).collect()
    }

    fn slot_for(&self, user_id: i32, context_id: i32) -> Arc<Slot> {
        let mut contexts = self.contexts.lock();
        let users = contexts.get_or_insert_mut(context_id, UserSlots::new);
        Arc::clone(users.entry(user_id).or_default())
    }

    /// Remove a slot left empty by a failed load, unless another caller
    /// is already loading into it.
    fn discard_empty_slot(&self, user_id: i32, context_id: i32, slot: &Arc<Slot>) {
        let mut contexts = self.contexts.lock();
        let Some(users) = contexts.peek_mut(&context_id) else {
            return;
        };
        let unused = users.get(&user_id).map_or(false, |current| {
            Arc::ptr_eq(current, slot) && slot.state.try_lock().map_or(false, |s| s.is_none())
        });
        if unused {
            users.remove(&user_id);
        }
        if users.is_empty() {
            contexts.pop(&context_id);
        }
    }

    /// The live cached index, without loading.
    fn cached_index(&self, user_id: i32, context_id: i32) -> Option<Arc<SubscriptionIndex>> {
        let slot = {
            let mut contexts = self.contexts.lock();
            Arc::clone(contexts.get(&context_id)?.get(&user_id)?)
        };
        let state = slot.state.lock();
        state
            .as_ref()
            .filter(|loaded| loaded.last_access.elapsed() <= self.idle_time)
            .map(|loaded| Arc::clone(&loaded.index))
    }

    fn announce(&self, event: CacheEvent) {
        self.bus.notify(&event, false);
    }

    /// Apply an invalidation received from another node.
    fn apply_remote(&self, event: &CacheEvent) {
        match event.operation {
            CacheOperation::Clear => self.clear(false),
            CacheOperation::InvalidateGroup => {
                match event.group_name.as_deref().and_then(|g| g.parse::<i32>().ok()) {
                    Some(context_id) => self.drop_for(0, context_id, false),
                    None => self.clear(false),
                }
            }
            CacheOperation::Invalidate | CacheOperation::Update | CacheOperation::Remove => {
                if !event.has_keys() {
                    self.clear(false);
                    return;
                }
                for key in &event.keys {
                    self.apply_remote_key(key);
                }
            }
        }
    }

    fn apply_remote_key(&self, key: &CacheKey) {
        match (key.context_id(), key.user_id()) {
            (Some(context_id), Some(user_id)) => self.drop_for(user_id, context_id, false),
            (Some(context_id), None) => {
                warn!(%key, context_id, "cannot resolve cache key, dropping whole context");
                self.drop_for(0, context_id, false);
            }
            (None, _) => {
                warn!(%key, "cannot resolve cache key, clearing subscription cache");
                self.clear(false);
            }
        }
    }
}

impl Drop for RegistryCache {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Bus listener applying remote invalidations to a cache.
struct RemoteInvalidation {
    cache: Weak<RegistryCache>,
}

impl CacheListener for RemoteInvalidation {
    fn on_event(&self, event: &CacheEvent, from_remote: bool) {
        // Local events were already written through.
        if !from_remote || event.region != SUBSCRIPTION_REGION {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.apply_remote(event);
        }
    }
}
