//! Wire form of cache events.
//!
//! Frame layout:
//!
//! ```text
//! magic "PCE\0" | version u8 | body length u32 LE | MessagePack body | CRC32 LE
//! ```

use super::{CacheEvent, CacheKey, CacheOperation, CurrentKeyFactory};
use crate::error::{PushError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Magic bytes of a cache event frame.
const FRAME_MAGIC: &[u8; 4] = b"PCE\0";

/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Header size (magic + version + length).
const HEADER_SIZE: usize = 9;

/// Upper bound for a frame body.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

const KEY_COMPOSITE: i32 = 1;
const KEY_TEXT: i32 = 2;
const KEY_INTEGER: i32 = 3;
const KEY_BLOB: i32 = 4;

/// A key in wire form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortableKey {
    pub key_type: i32,
    pub context_id: Option<i32>,
    pub parts: Vec<String>,
    pub blob: Option<Vec<u8>>,
}

impl PortableKey {
    pub fn wrap(key: &CacheKey) -> Self {
        match key {
            CacheKey::Composite { context_id, parts } => Self {
                key_type: KEY_COMPOSITE,
                context_id: Some(*context_id),
                parts: parts.clone(),
                blob: None,
            },
            // Sent on as composite so that a node with a factory can rebuild it.
            CacheKey::Unresolved { context_id, parts } => Self {
                key_type: KEY_COMPOSITE,
                context_id: *context_id,
                parts: parts.clone(),
                blob: None,
            },
            CacheKey::Text(s) => Self {
                key_type: KEY_TEXT,
                context_id: None,
                parts: vec![s.clone()],
                blob: None,
            },
            CacheKey::Integer(i) => Self {
                key_type: KEY_INTEGER,
                context_id: None,
                parts: vec![i.to_string()],
                blob: None,
            },
            CacheKey::Opaque(bytes) => Self {
                key_type: KEY_BLOB,
                context_id: None,
                parts: Vec::new(),
                blob: Some(bytes.clone()),
            },
        }
    }

    /// Rebuild the key. Never fails: anything that cannot be interpreted
    /// becomes an unresolved or opaque key.
    pub fn unwrap_key(self, factory: &CurrentKeyFactory) -> CacheKey {
        match (self.key_type, self.context_id) {
            (KEY_COMPOSITE, Some(context_id)) => factory.rebuild(context_id, self.parts),
            (KEY_TEXT, _) if self.parts.len() == 1 => {
                CacheKey::Text(self.parts.into_iter().next().unwrap_or_default())
            }
            (KEY_INTEGER, _) => match self.parts.first().and_then(|p| p.parse().ok()) {
                Some(i) => CacheKey::Integer(i),
                None => self.fallback(),
            },
            (KEY_BLOB, _) => CacheKey::Opaque(self.blob.unwrap_or_default()),
            (key_type, context_id) => {
                warn!(key_type, ?context_id, "unrecognized cache key in wire form");
                self.fallback()
            }
        }
    }

    fn fallback(self) -> CacheKey {
        match self.blob {
            Some(bytes) if self.context_id.is_none() => CacheKey::Opaque(bytes),
            _ => CacheKey::Unresolved {
                context_id: self.context_id,
                parts: self.parts,
            },
        }
    }
}

/// A cache event in wire form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortableCacheEvent {
    /// Node that published the event.
    pub origin: String,
    pub region: String,
    pub group_name: Option<String>,
    pub operation: CacheOperation,
    pub keys: Vec<PortableKey>,
}

impl PortableCacheEvent {
    pub fn wrap(origin: impl Into<String>, event: &CacheEvent) -> Self {
        Self {
            origin: origin.into(),
            region: event.region.clone(),
            group_name: event.group_name.clone(),
            operation: event.operation,
            keys: event.keys.iter().map(PortableKey::wrap).collect(),
        }
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn unwrap_event(self, factory: &CurrentKeyFactory) -> CacheEvent {
        CacheEvent {
            region: self.region,
            group_name: self.group_name,
            operation: self.operation,
            keys: self
                .keys
                .into_iter()
                .map(|k| k.unwrap_key(factory))
                .collect(),
        }
    }

    /// Encode into a checksummed frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec_named(self)?;
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len() + 4);
        frame.extend_from_slice(FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(frame)
    }

    /// Decode a frame produced by [`encode`](Self::encode).
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_SIZE + 4 {
            return Err(PushError::InvalidFormat("frame too short".into()));
        }
        if &frame[0..4] != FRAME_MAGIC {
            return Err(PushError::InvalidFormat("invalid frame magic".into()));
        }
        let version = frame[4];
        if version != FRAME_VERSION {
            return Err(PushError::UnsupportedVersion(version));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&frame[5..9]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_BODY_SIZE {
            return Err(PushError::Corruption("frame body too large".into()));
        }
        if frame.len() != HEADER_SIZE + len + 4 {
            return Err(PushError::Corruption(format!(
                "frame length mismatch: header says {}, got {}",
                len,
                frame.len().saturating_sub(HEADER_SIZE + 4)
            )));
        }

        let body = &frame[HEADER_SIZE..HEADER_SIZE + len];
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&frame[HEADER_SIZE + len..]);
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(PushError::Corruption(format!(
                "checksum mismatch: expected {stored:#010x}, got {computed:#010x}"
            )));
        }

        Ok(rmp_serde::from_slice(body)?)
    }
}
