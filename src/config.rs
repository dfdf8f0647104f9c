//! Configuration of the push core.

use crate::error::{PushError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROP_DELAY: &str = "push.delayDuration";
pub const PROP_TIMER_FREQUENCY: &str = "push.timerFrequency";
pub const PROP_MAX_DELAY: &str = "push.maxDelayDuration";
pub const PROP_TOPIC_COUNT: &str = "push.cacheEvents.topicCount";
pub const PROP_TOPIC_PREFIX: &str = "push.cacheEvents.topicPrefix";
pub const PROP_CACHE_IDLE_TIME: &str = "push.registry.cacheIdleTime";
pub const PROP_MAX_CACHED_CONTEXTS: &str = "push.registry.maxCachedContexts";
pub const PROP_NODE_ID: &str = "push.nodeId";

/// Source of typed configuration values.
pub trait ConfigProvider: Send + Sync {
    /// Raw value of a property.
    fn get_property(&self, name: &str) -> Option<String>;

    /// Integer value of a property, `default` if absent or unparsable.
    fn get_int_property(&self, name: &str, default: i64) -> i64 {
        self.get_property(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// Map backed configuration provider.
#[derive(Clone, Debug, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(name.into(), value.to_string());
        self
    }

    /// Load a flat JSON object of property names to values.
    ///
    /// Numbers and booleans are stored by their textual form; nested values
    /// are rejected.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut values = HashMap::with_capacity(object.len());
        for (name, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => continue,
                _ => return Err(PushError::config(name, "expected a scalar value")),
            };
            values.insert(name, text);
        }
        Ok(Self { values })
    }
}

impl ConfigProvider for MapConfig {
    fn get_property(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Push core configuration.
#[derive(Clone, Debug)]
pub struct PushConfig {
    /// Coalescing window of a buffered notification.
    /// Default: 3s
    pub delay: Duration,

    /// Tick of the flush timer.
    /// Default: 1.5s
    pub timer_frequency: Duration,

    /// Longest a notification is held back, however often it is refreshed.
    /// Default: 10s
    pub max_delay: Duration,

    /// Number of cache event topics.
    /// Default: 5
    pub topic_count: u32,

    /// Name prefix of the cache event topics.
    pub topic_prefix: String,

    /// Idle time after which a cached index expires.
    /// Default: 30min
    pub cache_idle_time: Duration,

    /// Contexts kept in the registry cache before the least recently used
    /// one is evicted.
    pub max_cached_contexts: usize,

    /// Identity of this node in published cache events.
    pub node_id: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(3000),
            timer_frequency: Duration::from_millis(1500),
            max_delay: Duration::from_millis(10_000),
            topic_count: 5,
            topic_prefix: "pns-cache-events-".to_string(),
            cache_idle_time: Duration::from_secs(30 * 60),
            max_cached_contexts: 10_000,
            node_id: generate_node_id(),
        }
    }
}

impl PushConfig {
    /// Read the configuration, falling back to defaults for absent or
    /// non-positive values.
    pub fn from_provider(provider: &dyn ConfigProvider) -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            positive(provider.get_int_property(name, default.as_millis() as i64))
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            delay: millis(PROP_DELAY, defaults.delay),
            timer_frequency: millis(PROP_TIMER_FREQUENCY, defaults.timer_frequency),
            max_delay: millis(PROP_MAX_DELAY, defaults.max_delay),
            topic_count: positive(provider.get_int_property(PROP_TOPIC_COUNT, 0))
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.topic_count),
            topic_prefix: provider
                .get_property(PROP_TOPIC_PREFIX)
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.topic_prefix),
            cache_idle_time: millis(PROP_CACHE_IDLE_TIME, defaults.cache_idle_time),
            max_cached_contexts: positive(provider.get_int_property(PROP_MAX_CACHED_CONTEXTS, 0))
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(defaults.max_cached_contexts),
            node_id: provider
                .get_property(PROP_NODE_ID)
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.node_id),
        }
    }
}

fn positive(value: i64) -> Option<u64> {
    u64::try_from(value).ok().filter(|v| *v > 0)
}

fn generate_node_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{:x}-{}",
        std::process::id(),
        nanos,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
