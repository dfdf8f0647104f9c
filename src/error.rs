//! Error types for the push core.
//!
//! Every error carries a stable [`ErrorCode`] from a small catalog so that
//! log lines and callers can match on a numeric code instead of on message
//! text.

use std::fmt;
use thiserror::Error;

/// Catalog of error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Durable registry could not be read.
    RegistryFailure,
    /// A delivery transport rejected a notification.
    TransportFailure,
    /// A cache event could not be published.
    PublishFailure,
    /// Encoding into the wire form failed.
    SerializationFailure,
    /// Decoding from the wire form failed.
    DeserializationFailure,
    /// Checksum or length check failed on a wire frame.
    Corruption,
    /// A wire frame had an unknown layout.
    InvalidFormat,
    /// A wire frame was written by an unsupported protocol version.
    UnsupportedVersion,
    /// A configuration value could not be read or parsed.
    InvalidConfiguration,
    /// The flush timer could not be started.
    SchedulerFailure,
    /// Underlying I/O failure.
    Io,
}

impl ErrorCode {
    /// Prefix shared by every code of this catalog.
    pub const PREFIX: &'static str = "PNS";

    /// Numeric code, stable across releases.
    pub fn number(self) -> u16 {
        match self {
            ErrorCode::RegistryFailure => 1,
            ErrorCode::TransportFailure => 2,
            ErrorCode::PublishFailure => 3,
            ErrorCode::SerializationFailure => 4,
            ErrorCode::DeserializationFailure => 5,
            ErrorCode::Corruption => 6,
            ErrorCode::InvalidFormat => 7,
            ErrorCode::UnsupportedVersion => 8,
            ErrorCode::InvalidConfiguration => 9,
            ErrorCode::SchedulerFailure => 10,
            ErrorCode::Io => 11,
        }
    }

    /// Message template for the code.
    pub fn template(self) -> &'static str {
        match self {
            ErrorCode::RegistryFailure => "Subscriptions could not be loaded",
            ErrorCode::TransportFailure => "Push transport failed",
            ErrorCode::PublishFailure => "Cache event could not be published",
            ErrorCode::SerializationFailure => "Serialization failed",
            ErrorCode::DeserializationFailure => "Deserialization failed",
            ErrorCode::Corruption => "Corrupt cache event frame",
            ErrorCode::InvalidFormat => "Invalid cache event frame",
            ErrorCode::UnsupportedVersion => "Unsupported cache event version",
            ErrorCode::InvalidConfiguration => "Invalid configuration",
            ErrorCode::SchedulerFailure => "Notification scheduler failure",
            ErrorCode::Io => "I/O error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04}", Self::PREFIX, self.number())
    }
}

/// Main error type of the push core.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("{}: {message} (user {user_id}, context {context_id})", ErrorCode::RegistryFailure.template())]
    Registry {
        user_id: i32,
        context_id: i32,
        message: String,
    },

    #[error("{}: {transport_id} for client {client}: {message}", ErrorCode::TransportFailure.template())]
    Transport {
        client: String,
        transport_id: String,
        message: String,
    },

    #[error("{}: topic {topic}: {message}", ErrorCode::PublishFailure.template())]
    Publish { topic: String, message: String },

    #[error("{}: {0}", ErrorCode::SerializationFailure.template())]
    Serialization(String),

    #[error("{}: {0}", ErrorCode::DeserializationFailure.template())]
    Deserialization(String),

    #[error("{}: {0}", ErrorCode::Corruption.template())]
    Corruption(String),

    #[error("{}: {0}", ErrorCode::InvalidFormat.template())]
    InvalidFormat(String),

    #[error("{}: {0}", ErrorCode::UnsupportedVersion.template())]
    UnsupportedVersion(u8),

    #[error("{}: {name}: {message}", ErrorCode::InvalidConfiguration.template())]
    Config { name: String, message: String },

    #[error("{}: {0}", ErrorCode::SchedulerFailure.template())]
    Scheduler(String),

    #[error("{}: {0}", ErrorCode::Io.template())]
    Io(#[from] std::io::Error),
}

impl PushError {
    pub fn registry(user_id: i32, context_id: i32, message: impl Into<String>) -> Self {
        PushError::Registry {
            user_id,
            context_id,
            message: message.into(),
        }
    }

    pub fn transport(
        client: impl Into<String>,
        transport_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        PushError::Transport {
            client: client.into(),
            transport_id: transport_id.into(),
            message: message.into(),
        }
    }

    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        PushError::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn config(name: impl Into<String>, message: impl Into<String>) -> Self {
        PushError::Config {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn scheduler(message: impl Into<String>) -> Self {
        PushError::Scheduler(message.into())
    }

    /// Catalog code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            PushError::Registry { .. } => ErrorCode::RegistryFailure,
            PushError::Transport { .. } => ErrorCode::TransportFailure,
            PushError::Publish { .. } => ErrorCode::PublishFailure,
            PushError::Serialization(_) => ErrorCode::SerializationFailure,
            PushError::Deserialization(_) => ErrorCode::DeserializationFailure,
            PushError::Corruption(_) => ErrorCode::Corruption,
            PushError::InvalidFormat(_) => ErrorCode::InvalidFormat,
            PushError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            PushError::Config { .. } => ErrorCode::InvalidConfiguration,
            PushError::Scheduler(_) => ErrorCode::SchedulerFailure,
            PushError::Io(_) => ErrorCode::Io,
        }
    }
}

impl From<serde_json::Error> for PushError {
    fn from(e: serde_json::Error) -> Self {
        PushError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for PushError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PushError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PushError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PushError::Deserialization(e.to_string())
    }
}

/// Result type for push core operations.
pub type Result<T> = std::result::Result<T, PushError>;
