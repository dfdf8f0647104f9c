//! Topic matching of push subscriptions.
//!
//! A [`SubscriptionIndex`] holds the subscriptions of one user, split into
//! three partitions by the kind of topic they declare:
//!
//! - `*` matches every topic
//! - `prefix:*` matches every topic below `prefix`
//! - anything else matches only itself
//!
//! # Example
//!
//! ```ignore
//! let index = SubscriptionIndex::new(7, 3);
//! index.add(&PushSubscription::new(7, 3, "app", "apn", "token").with_topic("ox:mail:*"));
//!
//! assert!(index.has_interested(None, "ox:mail:new"));
//! let hits = index.interested_subscriptions(Some("app"), "ox:mail:new");
//! ```

mod index;

pub use index::SubscriptionIndex;
