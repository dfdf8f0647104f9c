//! Topic based publish/subscribe abstraction.
//!
//! The cluster transport is external; [`LocalHub`] is an in-process
//! implementation that delivers synchronously, in publication order, to every
//! listener of a topic (including the publisher's own listeners).

use crate::error::Result;
use crate::listeners::{ListenerId, ListenerRegistry};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::Arc;

/// Receiver of messages published on a topic.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// A named topic.
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, payload: &[u8]) -> Result<()>;

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId;

    fn remove_message_listener(&self, id: ListenerId) -> bool;
}

/// Source of topics.
pub trait PubSub: Send + Sync {
    fn topic(&self, name: &str) -> Arc<dyn Topic>;
}

struct LocalTopic {
    name: String,
    listeners: ListenerRegistry<dyn MessageListener>,
    /// Serializes deliveries so that listeners observe publication order.
    /// Reentrant: a listener may publish on the topic it is notified by.
    delivery: ReentrantMutex<()>,
}

impl Topic for LocalTopic {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, payload: &[u8]) -> Result<()> {
        let _order = self.delivery.lock();
        for listener in self.listeners.snapshot() {
            listener.on_message(&self.name, payload);
        }
        Ok(())
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// In-process pub/sub hub. Clones share the same topics.
#[derive(Clone, Default)]
pub struct LocalHub {
    topics: Arc<Mutex<HashMap<String, Arc<LocalTopic>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of topics created so far.
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl PubSub for LocalHub {
    fn topic(&self, name: &str) -> Arc<dyn Topic> {
        let mut topics = self.topics.lock();
        let topic = topics.entry(name.to_string()).or_insert_with(|| {
            Arc::new(LocalTopic {
                name: name.to_string(),
                listeners: ListenerRegistry::new(),
                delivery: ReentrantMutex::new(()),
            })
        });
        Arc::clone(topic) as Arc<dyn Topic>
    }
}
