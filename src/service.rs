//! Push service of one node, tying the components together.

use crate::config::PushConfig;
use crate::delivery::TransportRegistry;
use crate::error::Result;
use crate::events::{CacheEventBus, CurrentKeyFactory};
use crate::fanout::CacheEventFanout;
use crate::pubsub::PubSub;
use crate::registry::{DurableRegistry, RegistryCache, RegistryStore};
use crate::scheduler::{NotificationScheduler, SchedulerStats};
use crate::types::{Hits, PushNotification, PushSubscription};
use std::sync::Arc;
use tracing::{debug, info};

/// Subscription management and notification dispatch for one node.
///
/// Subscription changes are written to the store, then applied to the local
/// registry cache. Peers learn about them through the cache event fanout.
pub struct PushService {
    config: PushConfig,
    store: Arc<dyn RegistryStore>,
    bus: Arc<CacheEventBus>,
    cache: Arc<RegistryCache>,
    fanout: Arc<CacheEventFanout>,
    scheduler: NotificationScheduler,
}

impl PushService {
    pub fn new<S>(
        config: PushConfig,
        store: Arc<S>,
        pubsub: &dyn PubSub,
        transports: Arc<dyn TransportRegistry>,
        key_factory: Arc<CurrentKeyFactory>,
    ) -> Self
    where
        S: RegistryStore + 'static,
    {
        let bus = Arc::new(CacheEventBus::new());
        let registry: Arc<dyn DurableRegistry> = store.clone();
        let cache = RegistryCache::new(registry, Arc::clone(&bus), &config);
        let fanout = CacheEventFanout::start(Arc::clone(&bus), pubsub, key_factory, &config);
        let scheduler = NotificationScheduler::new(Arc::clone(&cache), transports, &config);

        info!(
            node_id = %config.node_id,
            topic_count = config.topic_count,
            delay_ms = config.delay.as_millis() as u64,
            "push service started"
        );

        Self {
            config,
            store,
            bus,
            cache,
            fanout,
            scheduler,
        }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        self.fanout.node_id()
    }

    pub fn bus(&self) -> &Arc<CacheEventBus> {
        &self.bus
    }

    pub fn cache(&self) -> &Arc<RegistryCache> {
        &self.cache
    }

    pub fn fanout(&self) -> &Arc<CacheEventFanout> {
        &self.fanout
    }

    /// Store a subscription and make it visible on every node.
    pub fn subscribe(&self, subscription: &PushSubscription) -> Result<bool> {
        let created = self.store.register(subscription)?;
        if !self.cache.add_and_invalidate_if_present(subscription) {
            // Not cached here, but peers may hold a stale index.
            self.cache
                .drop_for(subscription.user_id, subscription.context_id, true);
        }
        debug!(
            user_id = subscription.user_id,
            context_id = subscription.context_id,
            client = %subscription.client,
            transport_id = %subscription.transport_id,
            created,
            "subscribed"
        );
        Ok(created)
    }

    /// Remove a subscription. Returns false if it was not stored.
    pub fn unsubscribe(&self, subscription: &PushSubscription) -> Result<bool> {
        let removed = self.store.unregister(subscription)?;
        if !self.cache.remove_and_invalidate_if_present(subscription) {
            self.cache
                .drop_for(subscription.user_id, subscription.context_id, true);
        }
        debug!(
            user_id = subscription.user_id,
            context_id = subscription.context_id,
            client = %subscription.client,
            removed,
            "unsubscribed"
        );
        Ok(removed)
    }

    /// Remove every subscription of a user.
    pub fn unsubscribe_all_for(&self, user_id: i32, context_id: i32) -> Result<usize> {
        let removed = self.store.unregister_all(user_id, context_id)?;
        self.cache.drop_for(user_id, context_id, true);
        debug!(user_id, context_id, removed, "removed all subscriptions");
        Ok(removed)
    }

    /// Schedule a notification for delivery.
    pub fn handle(&self, notification: PushNotification) -> Result<()> {
        self.scheduler.handle(notification)
    }

    pub fn has_interested_subscriptions(
        &self,
        user_id: i32,
        context_id: i32,
        client: Option<&str>,
        topic: &str,
    ) -> Result<bool> {
        Ok(self
            .cache
            .get_index_for(user_id, context_id)?
            .has_interested(client, topic))
    }

    pub fn interested_subscriptions(
        &self,
        user_id: i32,
        context_id: i32,
        client: Option<&str>,
        topic: &str,
    ) -> Result<Hits> {
        Ok(self
            .cache
            .get_index_for(user_id, context_id)?
            .interested_subscriptions(client, topic))
    }

    pub fn pending_notifications(&self) -> usize {
        self.scheduler.pending_count()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Stop dispatching and detach from the cluster.
    pub fn stop(&self) {
        self.scheduler.stop();
        self.fanout.shutdown();
        self.cache.detach();
        info!(node_id = %self.config.node_id, "push service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::TransportMap;
    use crate::events::CompositeKeyFactory;
    use crate::pubsub::LocalHub;
    use crate::registry::MemoryRegistry;

    fn service(hub: &LocalHub, store: Arc<MemoryRegistry>) -> PushService {
        PushService::new(
            PushConfig::default(),
            store,
            hub,
            Arc::new(TransportMap::new()),
            Arc::new(CurrentKeyFactory::with(Arc::new(CompositeKeyFactory))),
        )
    }

    #[test]
    fn test_subscribe_visible_after_cached() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryRegistry::new());
        let svc = service(&hub, store.clone());

        assert!(!svc
            .has_interested_subscriptions(7, 3, None, "ox:mail:new")
            .unwrap());
        assert!(svc.cache().is_cached(7, 3));

        let sub = PushSubscription::new(7, 3, "app", "apn", "t1").with_topic("ox:mail:*");
        assert!(svc.subscribe(&sub).unwrap());
        assert!(svc
            .has_interested_subscriptions(7, 3, Some("app"), "ox:mail:new")
            .unwrap());
        // Written through, not reloaded.
        assert_eq!(store.load_count(), 1);

        assert!(svc.unsubscribe(&sub).unwrap());
        assert!(!svc.unsubscribe(&sub).unwrap());
        assert!(svc
            .interested_subscriptions(7, 3, None, "ox:mail:new")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unsubscribe_all_drops_cache() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryRegistry::new());
        let svc = service(&hub, store);

        svc.subscribe(&PushSubscription::new(7, 3, "app", "apn", "t1").with_topic("*"))
            .unwrap();
        svc.subscribe(&PushSubscription::new(7, 3, "web", "wns", "t2").with_topic("*"))
            .unwrap();
        svc.has_interested_subscriptions(7, 3, None, "x").unwrap();

        assert_eq!(svc.unsubscribe_all_for(7, 3).unwrap(), 2);
        assert!(!svc.cache().is_cached(7, 3));
        assert!(!svc.has_interested_subscriptions(7, 3, None, "x").unwrap());
    }

    #[test]
    fn test_stop_detaches() {
        let hub = LocalHub::new();
        let svc = service(&hub, Arc::new(MemoryRegistry::new()));
        assert_eq!(svc.bus().listener_count(), 2);

        svc.stop();
        assert_eq!(svc.bus().listener_count(), 0);
        svc.handle(PushNotification::new(7, 3, "ox:mail:new")).unwrap();
        assert_eq!(svc.pending_notifications(), 0);
    }
}
