//! Propagation of cache events between nodes.
//!
//! Locally originated events of the subscription registry region are wrapped
//! and published on one of `topic_count` topics, chosen by the context id of
//! each key. Every node listens on all of these topics and replays received
//! events on its local bus flagged as remote, which keeps them from being
//! published again.

use crate::config::PushConfig;
use crate::error::Result;
use crate::events::{
    CacheEvent, CacheEventBus, CacheListener, CurrentKeyFactory, PortableCacheEvent,
    SUBSCRIPTION_REGION,
};
use crate::listeners::ListenerId;
use crate::pubsub::{MessageListener, PubSub, Topic};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Name of the topic responsible for a context.
///
/// Contexts whose ids are congruent modulo `topic_count` share a topic,
/// which keeps all events of one context in order on a single topic.
pub fn topic_name(prefix: &str, context_id: i32, topic_count: u32) -> String {
    format!("{}{}", prefix, partition_of(context_id, topic_count))
}

/// Partition number of a context.
pub fn partition_of(context_id: i32, topic_count: u32) -> u32 {
    let count = i64::from(topic_count.max(1));
    i64::from(context_id).rem_euclid(count) as u32
}

/// Split an event into one event per destination partition.
///
/// Keys keep their relative order. Keys without a context id and events
/// without keys go to partition 0.
pub fn partition_event(event: &CacheEvent, topic_count: u32) -> BTreeMap<u32, CacheEvent> {
    let mut parts: BTreeMap<u32, CacheEvent> = BTreeMap::new();
    if !event.has_keys() {
        parts.insert(0, event.clone());
        return parts;
    }
    for key in &event.keys {
        let partition = key
            .context_id()
            .map_or(0, |ctx| partition_of(ctx, topic_count));
        parts
            .entry(partition)
            .or_insert_with(|| CacheEvent {
                keys: Vec::new(),
                ..event.clone()
            })
            .keys
            .push(key.clone());
    }
    parts
}

struct Attachments {
    bus_listener: Option<ListenerId>,
    topic_listeners: Vec<(Arc<dyn Topic>, ListenerId)>,
}

/// Bridges the local cache event bus and the cluster pub/sub transport.
pub struct CacheEventFanout {
    node_id: String,
    topic_prefix: String,
    topic_count: u32,
    bus: Arc<CacheEventBus>,
    topics: Vec<Arc<dyn Topic>>,
    key_factory: Arc<CurrentKeyFactory>,
    attachments: Mutex<Attachments>,
}

impl CacheEventFanout {
    /// Create the fanout and attach it to the bus and to all event topics.
    pub fn start(
        bus: Arc<CacheEventBus>,
        pubsub: &dyn PubSub,
        key_factory: Arc<CurrentKeyFactory>,
        config: &PushConfig,
    ) -> Arc<Self> {
        let topic_count = config.topic_count.max(1);
        let topics: Vec<Arc<dyn Topic>> = (0..topic_count)
            .map(|p| pubsub.topic(&format!("{}{}", config.topic_prefix, p)))
            .collect();

        let fanout = Arc::new(Self {
            node_id: config.node_id.clone(),
            topic_prefix: config.topic_prefix.clone(),
            topic_count,
            bus: Arc::clone(&bus),
            topics,
            key_factory,
            attachments: Mutex::new(Attachments {
                bus_listener: None,
                topic_listeners: Vec::new(),
            }),
        });

        let weak = Arc::downgrade(&fanout);
        let mut attachments = fanout.attachments.lock();
        for topic in &fanout.topics {
            let id = topic.add_message_listener(Arc::new(Inbound { fanout: weak.clone() }));
            attachments.topic_listeners.push((Arc::clone(topic), id));
        }
        attachments.bus_listener = Some(bus.subscribe(Arc::new(Outbound { fanout: weak })));
        drop(attachments);

        debug!(
            node_id = %fanout.node_id,
            topic_count,
            prefix = %fanout.topic_prefix,
            "cache event fanout started"
        );
        fanout
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn topic_count(&self) -> u32 {
        self.topic_count
    }

    /// Topic a context's events are published on.
    pub fn topic_for(&self, context_id: i32) -> String {
        topic_name(&self.topic_prefix, context_id, self.topic_count)
    }

    /// Wrap and publish a local event, one message per partition.
    pub fn publish(&self, event: &CacheEvent) -> Result<()> {
        for (partition, part) in partition_event(event, self.topic_count) {
            let frame = PortableCacheEvent::wrap(&self.node_id, &part).encode()?;
            let topic = &self.topics[partition as usize];
            trace!(
                topic = topic.name(),
                partition,
                operation = %part.operation,
                keys = part.keys.len(),
                "publishing cache event"
            );
            topic.publish(&frame)?;
        }
        Ok(())
    }

    /// Unwrap a received frame and replay it on the local bus.
    pub fn receive(&self, topic: &str, frame: &[u8]) {
        let portable = match PortableCacheEvent::decode(frame) {
            Ok(portable) => portable,
            Err(e) => {
                warn!(topic, code = %e.code(), error = %e, "dropping malformed cache event");
                return;
            }
        };
        if portable.origin == self.node_id {
            return;
        }
        let event = portable.unwrap_event(&self.key_factory);
        trace!(topic, region = %event.region, operation = %event.operation, "received cache event");
        self.bus.notify(&event, true);
    }

    /// Detach from the bus and all topics.
    pub fn shutdown(&self) {
        let mut attachments = self.attachments.lock();
        if let Some(id) = attachments.bus_listener.take() {
            self.bus.unsubscribe(id);
        }
        for (topic, id) in attachments.topic_listeners.drain(..) {
            topic.remove_message_listener(id);
        }
    }
}

impl Drop for CacheEventFanout {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Local bus to transport.
struct Outbound {
    fanout: Weak<CacheEventFanout>,
}

impl CacheListener for Outbound {
    fn on_event(&self, event: &CacheEvent, from_remote: bool) {
        if from_remote || event.region != SUBSCRIPTION_REGION {
            return;
        }
        let Some(fanout) = self.fanout.upgrade() else {
            return;
        };
        if let Err(e) = fanout.publish(event) {
            error!(code = %e.code(), error = %e, "failed to publish cache event");
        }
    }
}

/// Transport to local bus.
struct Inbound {
    fanout: Weak<CacheEventFanout>,
}

impl MessageListener for Inbound {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.receive(topic, payload);
        }
    }
}
