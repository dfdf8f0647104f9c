//! Core types of the push core.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Topic matching every notification.
pub const ALL_TOPICS: &str = "*";

/// Suffix turning a topic into a prefix wildcard (`ox:mail:*`).
pub const WILDCARD_SUFFIX: &str = ":*";

/// Separator between topic segments.
pub const TOPIC_SEPARATOR: char = ':';

/// How a single topic declared by a subscription is matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicRule<'a> {
    /// `*`
    All,
    /// `prefix:*`, carrying the prefix without the wildcard suffix.
    Prefix(&'a str),
    /// Exact topic string.
    Exact(&'a str),
}

impl<'a> TopicRule<'a> {
    /// Classify a declared topic. Empty topics are never matchable.
    pub fn parse(topic: &'a str) -> Option<Self> {
        if topic.is_empty() {
            return None;
        }
        if topic == ALL_TOPICS {
            return Some(TopicRule::All);
        }
        match topic.strip_suffix(WILDCARD_SUFFIX) {
            Some("") => None,
            Some(prefix) => Some(TopicRule::Prefix(prefix)),
            None => Some(TopicRule::Exact(topic)),
        }
    }
}

/// Iterate the progressively shorter colon-delimited prefixes of a topic.
///
/// `ox:mail:new` yields `ox:mail` then `ox`. The topic itself is not
/// yielded.
pub fn topic_prefixes(topic: &str) -> impl Iterator<Item = &str> {
    let mut rest = topic;
    std::iter::from_fn(move || {
        let pos = rest.rfind(TOPIC_SEPARATOR)?;
        rest = &rest[..pos];
        Some(rest)
    })
}

/// Identity of a subscription, independent of its topics.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub user_id: i32,
    pub context_id: i32,
    pub client: String,
    pub transport_id: String,
    pub token: String,
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SubscriptionKey({}@{}, {}/{}, {})",
            self.user_id, self.context_id, self.client, self.transport_id, self.token
        )
    }
}

/// Interest of a client in notifications of a set of topics.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PushSubscription {
    pub user_id: i32,
    pub context_id: i32,
    /// Client identifier, e.g. the app that registered the token.
    pub client: String,
    /// Identifier of the transport delivering to this subscription.
    pub transport_id: String,
    /// Opaque delivery address.
    pub token: String,
    pub topics: BTreeSet<String>,
}

impl PushSubscription {
    pub fn new(
        user_id: i32,
        context_id: i32,
        client: impl Into<String>,
        transport_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            context_id,
            client: client.into(),
            transport_id: transport_id.into(),
            token: token.into(),
            topics: BTreeSet::new(),
        }
    }

    /// Add a topic (builder style).
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.insert(topic.into());
        self
    }

    /// Add several topics (builder style).
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            user_id: self.user_id,
            context_id: self.context_id,
            client: self.client.clone(),
            transport_id: self.transport_id.clone(),
            token: self.token.clone(),
        }
    }

    pub fn client_and_transport(&self) -> ClientAndTransport {
        ClientAndTransport {
            client: self.client.clone(),
            transport_id: self.transport_id.clone(),
        }
    }
}

/// An inbound event to be pushed to interested subscriptions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub user_id: i32,
    pub context_id: i32,
    pub topic: String,
    /// Token of the subscription that caused the event, if any.
    pub source_token: Option<String>,
    pub payload: serde_json::Value,
}

impl PushNotification {
    pub fn new(user_id: i32, context_id: i32, topic: impl Into<String>) -> Self {
        Self {
            user_id,
            context_id,
            topic: topic.into(),
            source_token: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_source_token(mut self, token: impl Into<String>) -> Self {
        self.source_token = Some(token.into());
        self
    }

    /// Key notifications are grouped by when dispatched.
    pub fn group_key(&self) -> NotificationGroupKey {
        NotificationGroupKey {
            user_id: self.user_id,
            context_id: self.context_id,
            topic: self.topic.clone(),
        }
    }
}

/// (user, context, topic) triple a dispatch group is formed for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationGroupKey {
    pub user_id: i32,
    pub context_id: i32,
    pub topic: String,
}

/// Destination a set of matches is delivered through.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientAndTransport {
    pub client: String,
    pub transport_id: String,
}

/// A subscription matched by a notification topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushMatch {
    pub user_id: i32,
    pub context_id: i32,
    pub client: String,
    pub transport_id: String,
    pub token: String,
    /// The subscription topic that matched (`*`, `prefix:*` or exact).
    pub matched_topic: String,
}

impl PushMatch {
    pub(crate) fn new(subscription: &PushSubscription, matched_topic: &str) -> Self {
        Self {
            user_id: subscription.user_id,
            context_id: subscription.context_id,
            client: subscription.client.clone(),
            transport_id: subscription.transport_id.clone(),
            token: subscription.token.clone(),
            matched_topic: matched_topic.to_string(),
        }
    }
}

/// Matches grouped by delivery destination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hits {
    groups: BTreeMap<ClientAndTransport, Vec<PushMatch>>,
}

impl Hits {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, m: PushMatch) {
        let key = ClientAndTransport {
            client: m.client.clone(),
            transport_id: m.transport_id.clone(),
        };
        self.groups.entry(key).or_default().push(m);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of distinct destinations.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Total number of matches across all destinations.
    pub fn match_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn get(&self, destination: &ClientAndTransport) -> Option<&[PushMatch]> {
        self.groups.get(destination).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientAndTransport, &[PushMatch])> {
        self.groups.iter().map(|(k, v)| (k, v.as_slice()))
    }
}

impl IntoIterator for Hits {
    type Item = (ClientAndTransport, Vec<PushMatch>);
    type IntoIter = std::collections::btree_map::IntoIter<ClientAndTransport, Vec<PushMatch>>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_rule_parse() {
        assert_eq!(TopicRule::parse("*"), Some(TopicRule::All));
        assert_eq!(TopicRule::parse("ox:mail:*"), Some(TopicRule::Prefix("ox:mail")));
        assert_eq!(TopicRule::parse("ox:mail:new"), Some(TopicRule::Exact("ox:mail:new")));
        assert_eq!(TopicRule::parse(""), None);
        assert_eq!(TopicRule::parse(":*"), None);
    }

    #[test]
    fn test_topic_prefixes() {
        let prefixes: Vec<_> = topic_prefixes("ox:mail:sub:new").collect();
        assert_eq!(prefixes, vec!["ox:mail:sub", "ox:mail", "ox"]);

        assert_eq!(topic_prefixes("plain").count(), 0);
        assert_eq!(topic_prefixes("").count(), 0);
    }

    #[test]
    fn test_subscription_key_ignores_topics() {
        let a = PushSubscription::new(1, 2, "app", "apn", "t").with_topic("ox:mail:new");
        let b = PushSubscription::new(1, 2, "app", "apn", "t").with_topic("ox:calendar:new");
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
    }
}
