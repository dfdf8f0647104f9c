//! Reconstruction of composite cache keys received from remote nodes.

use super::CacheKey;
use parking_lot::RwLock;
use std::sync::Arc;

/// Rebuilds a composite key from its context id and string parts.
pub trait KeyFactory: Send + Sync {
    fn new_cache_key(&self, context_id: i32, parts: &[String]) -> CacheKey;
}

/// Factory producing plain [`CacheKey::Composite`] keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompositeKeyFactory;

impl KeyFactory for CompositeKeyFactory {
    fn new_cache_key(&self, context_id: i32, parts: &[String]) -> CacheKey {
        CacheKey::Composite {
            context_id,
            parts: parts.to_vec(),
        }
    }
}

/// The key factory currently in effect, owned by whoever composes the node.
///
/// Starts out empty or with a given factory and can be swapped at runtime.
#[derive(Default)]
pub struct CurrentKeyFactory {
    factory: RwLock<Option<Arc<dyn KeyFactory>>>,
}

impl CurrentKeyFactory {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(factory: Arc<dyn KeyFactory>) -> Self {
        Self {
            factory: RwLock::new(Some(factory)),
        }
    }

    /// Replace the factory, returning the previous one.
    pub fn set(&self, factory: Arc<dyn KeyFactory>) -> Option<Arc<dyn KeyFactory>> {
        self.factory.write().replace(factory)
    }

    pub fn unset(&self) -> Option<Arc<dyn KeyFactory>> {
        self.factory.write().take()
    }

    pub fn current(&self) -> Option<Arc<dyn KeyFactory>> {
        self.factory.read().clone()
    }

    /// Rebuild a key, or fall back to [`CacheKey::Unresolved`] when no
    /// factory is available.
    pub fn rebuild(&self, context_id: i32, parts: Vec<String>) -> CacheKey {
        match self.current() {
            Some(factory) => factory.new_cache_key(context_id, &parts),
            None => CacheKey::Unresolved {
                context_id: Some(context_id),
                parts,
            },
        }
    }
}
