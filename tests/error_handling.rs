//! Error handling and edge case tests.

use push_fanout::{
    CacheEvent, CacheEventBus, CompositeKeyFactory, CurrentKeyFactory, DurableRegistry,
    ErrorCode, LocalHub, MapConfig, MemoryRegistry, PortableCacheEvent, PubSub, PushConfig,
    PushError, PushService, PushSubscription, RegistryCache, RegistryStore, TransportMap,
};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Registry failing a given number of loads before delegating.
struct Flaky {
    inner: MemoryRegistry,
    failures_left: AtomicUsize,
}

impl DurableRegistry for Flaky {
    fn load_subscriptions_for(
        &self,
        user_id: i32,
        context_id: i32,
    ) -> push_fanout::Result<Vec<PushSubscription>> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(PushError::registry(user_id, context_id, "database unavailable"));
        }
        self.inner.load_subscriptions_for(user_id, context_id)
    }
}

fn test_service(hub: &LocalHub, node_id: &str) -> PushService {
    PushService::new(
        PushConfig {
            node_id: node_id.to_string(),
            ..Default::default()
        },
        Arc::new(MemoryRegistry::new()),
        hub,
        Arc::new(TransportMap::new()),
        Arc::new(CurrentKeyFactory::with(Arc::new(CompositeKeyFactory))),
    )
}

// --- Registry Errors ---

#[test]
fn test_failed_load_is_retried() {
    let inner = MemoryRegistry::new();
    inner
        .register(&PushSubscription::new(7, 3, "app", "apn", "t1").with_topic("*"))
        .unwrap();
    let registry = Arc::new(Flaky {
        inner,
        failures_left: AtomicUsize::new(1),
    });
    let cache = RegistryCache::new(
        registry,
        Arc::new(CacheEventBus::new()),
        &PushConfig::default(),
    );

    let err = cache.get_index_for(7, 3).unwrap_err();
    assert_eq!(err.code(), ErrorCode::RegistryFailure);
    assert_eq!(err.code().to_string(), "PNS-0001");
    assert!(!cache.is_cached(7, 3));

    let index = cache.get_index_for(7, 3).unwrap();
    assert!(index.has_interested(None, "anything"));
}

#[test]
fn test_mutation_without_cached_index_is_noop() {
    let cache = RegistryCache::new(
        Arc::new(MemoryRegistry::new()),
        Arc::new(CacheEventBus::new()),
        &PushConfig::default(),
    );
    let sub = PushSubscription::new(7, 3, "app", "apn", "t1").with_topic("*");
    assert!(!cache.add_and_invalidate_if_present(&sub));
    assert!(!cache.remove_and_invalidate_if_present(&sub));
    assert!(cache.cached_contexts().is_empty());
}

// --- Wire Errors ---

#[test]
fn test_decode_rejects_garbage() {
    let err = PortableCacheEvent::decode(b"nope").unwrap_err();
    assert!(matches!(err, PushError::InvalidFormat(_)));

    let err = PortableCacheEvent::decode(b"XXXX\x01\x00\x00\x00\x00\x00\x00\x00\x00").unwrap_err();
    assert!(matches!(err, PushError::InvalidFormat(_)));
}

#[test]
fn test_decode_rejects_tampered_frame() {
    let mut frame = PortableCacheEvent::wrap("node-a", &CacheEvent::invalidate_user(7, 3))
        .encode()
        .unwrap();
    let last = frame.len() - 5;
    frame[last] ^= 0xff;
    let err = PortableCacheEvent::decode(&frame).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Corruption);

    let mut frame = PortableCacheEvent::wrap("node-a", &CacheEvent::invalidate_user(7, 3))
        .encode()
        .unwrap();
    frame[4] = 99;
    assert!(matches!(
        PortableCacheEvent::decode(&frame),
        Err(PushError::UnsupportedVersion(99))
    ));
}

#[test]
fn test_malformed_message_does_not_disturb_node() {
    let hub = LocalHub::new();
    let svc = test_service(&hub, "node-a");
    svc.has_interested_subscriptions(7, 3, None, "x").unwrap();

    hub.topic("pns-cache-events-3")
        .publish(b"definitely not a cache event")
        .unwrap();

    assert!(svc.cache().is_cached(7, 3));
}

// --- Configuration Errors ---

#[test]
fn test_config_rejects_nested_values() {
    let err = MapConfig::from_json_str(r#"{"push.delayDuration": {"ms": 10}}"#).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);

    let err = MapConfig::from_json_str("[1, 2]").unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeserializationFailure);
}

#[test]
fn test_config_file_missing() {
    let err = MapConfig::from_json_file("/nonexistent/push.json").unwrap_err();
    assert!(matches!(err, PushError::Io(_)));
}

#[test]
fn test_config_file_with_bad_values_falls_back() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"push.delayDuration": -5, "push.cacheEvents.topicCount": "many", "push.timerFrequency": 250}}"#
    )
    .unwrap();

    let config = PushConfig::from_provider(&MapConfig::from_json_file(file.path()).unwrap());
    let defaults = PushConfig::default();
    assert_eq!(config.delay, defaults.delay);
    assert_eq!(config.topic_count, defaults.topic_count);
    assert_eq!(config.timer_frequency.as_millis(), 250);
}
