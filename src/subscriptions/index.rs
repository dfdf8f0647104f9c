//! Per-user topic index of push subscriptions.

use crate::types::{topic_prefixes, Hits, PushMatch, PushSubscription, SubscriptionKey, TopicRule};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type Bucket = HashMap<SubscriptionKey, Arc<PushSubscription>>;

/// The three partitions of an index.
#[derive(Default)]
struct Partitions {
    /// Subscriptions declaring `*`.
    matching_all: Bucket,
    /// Prefix (without `:*`) to subscriptions declaring `prefix:*`.
    matching_prefix: HashMap<String, Bucket>,
    /// Exact topic to subscriptions declaring it.
    matching_topic: HashMap<String, Bucket>,
}

impl Partitions {
    fn insert(&mut self, subscription: Arc<PushSubscription>) {
        let key = subscription.key();
        for topic in &subscription.topics {
            match TopicRule::parse(topic) {
                Some(TopicRule::All) => {
                    self.matching_all.insert(key.clone(), Arc::clone(&subscription));
                }
                Some(TopicRule::Prefix(prefix)) => {
                    self.matching_prefix
                        .entry(prefix.to_string())
                        .or_default()
                        .insert(key.clone(), Arc::clone(&subscription));
                }
                Some(TopicRule::Exact(exact)) => {
                    self.matching_topic
                        .entry(exact.to_string())
                        .or_default()
                        .insert(key.clone(), Arc::clone(&subscription));
                }
                None => {}
            }
        }
    }

    fn remove(&mut self, key: &SubscriptionKey) -> bool {
        let mut removed = self.matching_all.remove(key).is_some();
        for buckets in [&mut self.matching_prefix, &mut self.matching_topic] {
            buckets.retain(|_, bucket| {
                removed |= bucket.remove(key).is_some();
                !bucket.is_empty()
            });
        }
        removed
    }

    /// Walk catch-all, prefixes (longest first) and the exact topic, calling
    /// `visit` with each matching subscription and the pattern that matched.
    /// Stops as soon as `visit` returns false.
    fn walk<'a, F>(&'a self, topic: &'a str, mut visit: F)
    where
        F: FnMut(&'a PushSubscription, &'a str) -> bool,
    {
        if topic.is_empty() {
            return;
        }

        for sub in self.matching_all.values() {
            if !visit(sub, crate::types::ALL_TOPICS) {
                return;
            }
        }

        for prefix in topic_prefixes(topic) {
            if let Some(bucket) = self.matching_prefix.get(prefix) {
                for sub in bucket.values() {
                    if !visit(sub, wildcard_of(sub, prefix)) {
                        return;
                    }
                }
            }
        }

        if let Some(bucket) = self.matching_topic.get(topic) {
            for sub in bucket.values() {
                if !visit(sub, topic) {
                    return;
                }
            }
        }
    }

    fn len(&self) -> usize {
        let mut keys: HashSet<&SubscriptionKey> = self.matching_all.keys().collect();
        for bucket in self.matching_prefix.values().chain(self.matching_topic.values()) {
            keys.extend(bucket.keys());
        }
        keys.len()
    }
}

/// The declared topic of `sub` that produced a prefix hit on `prefix`.
fn wildcard_of<'a>(sub: &'a PushSubscription, prefix: &str) -> &'a str {
    sub.topics
        .iter()
        .find(|t| matches!(TopicRule::parse(t), Some(TopicRule::Prefix(p)) if p == prefix))
        .map(String::as_str)
        .unwrap_or(crate::types::ALL_TOPICS)
}

fn client_matches(client: Option<&str>, sub: &PushSubscription) -> bool {
    client.map_or(true, |c| c == sub.client)
}

/// Subscriptions of one user, indexed for topic lookup.
///
/// All operations lock the index for their whole duration, so a reader never
/// sees a half-applied add or remove. Nothing is atomic across calls.
pub struct SubscriptionIndex {
    user_id: i32,
    context_id: i32,
    partitions: Mutex<Partitions>,
}

impl SubscriptionIndex {
    /// Create an empty index.
    pub fn new(user_id: i32, context_id: i32) -> Self {
        Self {
            user_id,
            context_id,
            partitions: Mutex::new(Partitions::default()),
        }
    }

    /// Create an index holding the given subscriptions.
    pub fn with_subscriptions(
        user_id: i32,
        context_id: i32,
        subscriptions: impl IntoIterator<Item = PushSubscription>,
    ) -> Self {
        let index = Self::new(user_id, context_id);
        {
            let mut partitions = index.partitions.lock();
            for sub in subscriptions {
                partitions.insert(Arc::new(sub));
            }
        }
        index
    }

    pub fn user_id(&self) -> i32 {
        self.user_id
    }

    pub fn context_id(&self) -> i32 {
        self.context_id
    }

    /// Add a subscription to the partition of each declared topic.
    ///
    /// A subscription already present under the same identity is replaced,
    /// so adding an identical subscription twice changes nothing.
    pub fn add(&self, subscription: &PushSubscription) {
        if subscription.topics.is_empty() {
            return;
        }
        let mut partitions = self.partitions.lock();
        partitions.remove(&subscription.key());
        partitions.insert(Arc::new(subscription.clone()));
    }

    /// Remove a subscription from every partition.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, subscription: &PushSubscription) -> bool {
        self.remove_key(&subscription.key())
    }

    /// Remove by identity.
    pub fn remove_key(&self, key: &SubscriptionKey) -> bool {
        self.partitions.lock().remove(key)
    }

    /// Whether any subscription matches `topic` (and `client`, if given).
    pub fn has_interested(&self, client: Option<&str>, topic: &str) -> bool {
        let partitions = self.partitions.lock();
        let mut found = false;
        partitions.walk(topic, |sub, _| {
            found = client_matches(client, sub);
            !found
        });
        found
    }

    /// All subscriptions matching `topic` (and `client`, if given), grouped
    /// by client and transport.
    ///
    /// A subscription reachable through several partitions is reported once,
    /// with the first pattern hit in catch-all, prefix, exact order.
    pub fn interested_subscriptions(&self, client: Option<&str>, topic: &str) -> Hits {
        let partitions = self.partitions.lock();
        let mut hits = Hits::new();
        let mut seen: HashSet<SubscriptionKey> = HashSet::new();
        partitions.walk(topic, |sub, matched| {
            if client_matches(client, sub) && seen.insert(sub.key()) {
                hits.push(PushMatch::new(sub, matched));
            }
            true
        });
        hits
    }

    /// Snapshot of all stored subscriptions.
    pub fn subscriptions(&self) -> Vec<PushSubscription> {
        let partitions = self.partitions.lock();
        let mut by_key: HashMap<&SubscriptionKey, &Arc<PushSubscription>> = HashMap::new();
        by_key.extend(partitions.matching_all.iter());
        for bucket in partitions
            .matching_prefix
            .values()
            .chain(partitions.matching_topic.values())
        {
            by_key.extend(bucket.iter());
        }
        let mut subs: Vec<PushSubscription> = by_key.into_values().map(|s| (**s).clone()).collect();
        subs.sort_by_key(PushSubscription::key);
        subs
    }

    /// Number of distinct subscriptions.
    pub fn len(&self) -> usize {
        self.partitions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all partitions.
    pub fn clear(&self) {
        *self.partitions.lock() = Partitions::default();
    }
}

impl std::fmt::Debug for SubscriptionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionIndex")
            .field("user_id", &self.user_id)
            .field("context_id", &self.context_id)
            .field("len", &self.len())
            .finish()
    }
}
