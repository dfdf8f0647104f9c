//! # Push Fanout
//!
//! Subscription matching, cluster cache coherence and delayed dispatch for
//! push notifications.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: per-user indexes matching topics exactly, by colon
//!   prefix or catch-all
//! - **Registry cache**: load-once, idle-expiring cache of those indexes
//! - **Cache events**: invalidations partitioned by context and exchanged
//!   between nodes over pub/sub topics
//! - **Scheduler**: coalesces bursts of notifications and hands them to
//!   transports
//!
//! ## Example
//!
//! ```ignore
//! use push_fanout::{PushService, PushConfig, PushSubscription, PushNotification};
//!
//! let service = PushService::new(config, store, &hub, transports, key_factory);
//!
//! service.subscribe(&PushSubscription::new(7, 3, "app", "apn", token).with_topic("ox:mail:*"))?;
//! service.handle(PushNotification::new(7, 3, "ox:mail:new"))?;
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod fanout;
pub mod listeners;
pub mod pubsub;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::{ConfigProvider, MapConfig, PushConfig};
pub use delivery::{Transport, TransportMap, TransportRegistry};
pub use error::{ErrorCode, PushError, Result};
pub use events::{
    CacheEvent, CacheEventBus, CacheKey, CacheListener, CacheOperation, CompositeKeyFactory,
    CurrentKeyFactory, KeyFactory, PortableCacheEvent, SUBSCRIPTION_REGION,
};
pub use fanout::{partition_of, topic_name, CacheEventFanout};
pub use listeners::ListenerId;
pub use pubsub::{LocalHub, MessageListener, PubSub, Topic};
pub use registry::{DurableRegistry, MemoryRegistry, RegistryCache, RegistryStore};
pub use scheduler::{DispatchGroup, NotificationScheduler, SchedulerStats};
pub use service::PushService;
pub use subscriptions::SubscriptionIndex;
pub use types::{
    ClientAndTransport, Hits, NotificationGroupKey, PushMatch, PushNotification,
    PushSubscription, SubscriptionKey, TopicRule,
};
