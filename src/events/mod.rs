//! Cache invalidation events.
//!
//! A [`CacheEvent`] names a cache region, an operation and the keys it
//! applies to. Events travel on the local [`CacheEventBus`]; the
//! [`crate::fanout::CacheEventFanout`] carries them between nodes in their
//! wire form ([`PortableCacheEvent`]).

mod bus;
mod keys;
mod portable;

pub use bus::{CacheEventBus, CacheListener};
pub use keys::{CompositeKeyFactory, CurrentKeyFactory, KeyFactory};
pub use portable::{PortableCacheEvent, PortableKey, FRAME_VERSION};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Region of the push subscription registry cache.
pub const SUBSCRIPTION_REGION: &str = "PushSubscriptionRegistry";

/// What happened to the keys of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheOperation {
    /// Entries for the keys are stale.
    Invalidate,
    /// All entries of the event's group are stale.
    InvalidateGroup,
    /// Entries for the keys were replaced.
    Update,
    /// Entries for the keys were removed.
    Remove,
    /// The whole region is stale.
    Clear,
}

impl CacheOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOperation::Invalidate => "INVALIDATE",
            CacheOperation::InvalidateGroup => "INVALIDATE_GROUP",
            CacheOperation::Update => "UPDATE",
            CacheOperation::Remove => "REMOVE",
            CacheOperation::Clear => "CLEAR",
        }
    }
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Context-scoped key, e.g. `(context 3, ["7"])` for user 7.
    Composite { context_id: i32, parts: Vec<String> },
    Text(String),
    Integer(i64),
    /// Key only known as bytes.
    Opaque(Vec<u8>),
    /// A composite key received from a remote node that could not be rebuilt
    /// because no key factory was available.
    Unresolved {
        context_id: Option<i32>,
        parts: Vec<String>,
    },
}

impl CacheKey {
    /// Key of the subscription index of one user. `user_id == 0` stands for
    /// the whole context.
    pub fn for_user(user_id: i32, context_id: i32) -> Self {
        CacheKey::Composite {
            context_id,
            parts: vec![user_id.to_string()],
        }
    }

    /// Context the key belongs to, if it carries one.
    pub fn context_id(&self) -> Option<i32> {
        match self {
            CacheKey::Composite { context_id, .. } => Some(*context_id),
            CacheKey::Unresolved { context_id, .. } => *context_id,
            _ => None,
        }
    }

    /// User id of a fully resolved composite key.
    pub fn user_id(&self) -> Option<i32> {
        match self {
            CacheKey::Composite { parts, .. } => parts.first()?.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Composite { context_id, parts } => {
                write!(f, "{}:{}", context_id, parts.join(","))
            }
            CacheKey::Text(s) => f.write_str(s),
            CacheKey::Integer(i) => write!(f, "{i}"),
            CacheKey::Opaque(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            CacheKey::Unresolved { context_id, parts } => match context_id {
                Some(ctx) => write!(f, "unresolved({}:{})", ctx, parts.join(",")),
                None => write!(f, "unresolved({})", parts.join(",")),
            },
        }
    }
}

/// An invalidation notice for a cache region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEvent {
    pub region: String,
    /// Free-form group, used as a partition key for log filtering.
    pub group_name: Option<String>,
    pub operation: CacheOperation,
    pub keys: Vec<CacheKey>,
}

impl CacheEvent {
    pub fn new(region: impl Into<String>, operation: CacheOperation, keys: Vec<CacheKey>) -> Self {
        Self {
            region: region.into(),
            group_name: None,
            operation,
            keys,
        }
    }

    pub fn with_group(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    /// Invalidation of one user's subscription index (`user_id == 0` for the
    /// whole context).
    pub fn invalidate_user(user_id: i32, context_id: i32) -> Self {
        Self::new(
            SUBSCRIPTION_REGION,
            CacheOperation::Invalidate,
            vec![CacheKey::for_user(user_id, context_id)],
        )
        .with_group(context_id.to_string())
    }

    /// Invalidation of the whole subscription registry region.
    pub fn clear_region() -> Self {
        Self::new(SUBSCRIPTION_REGION, CacheOperation::Clear, Vec::new())
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }
}
