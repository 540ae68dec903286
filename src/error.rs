//! Crate-wide error type.

use std::io;

use thiserror::Error;

use crate::cache::CacheError;
use crate::remote::RemoteError;
use crate::serialization::deserializer::DeserializeError;
use crate::serialization::serializer::SerializeError;
use crate::types::ObjectId;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failure reported by a cache or remote store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The local cache failed.
    #[error("local cache: {0}")]
    Cache(#[from] CacheError),
    /// The remote store failed.
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
}

/// Errors surfaced by the transport's public operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Bytes that do not parse, or a record that does not describe a node.
    #[error("malformed record{}: {message}", .id.as_ref().map(|id| format!(" {id}")).unwrap_or_default())]
    Malformed {
        id: Option<ObjectId>,
        message: String,
    },
    /// The type discriminator names a type absent from the registry.
    #[error("unknown type '{0}'")]
    UnknownType(String),
    /// A store gave up; `context` names the failing batch or call.
    #[error("storage failure during {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: StorageError,
    },
    /// The caller asked the run to stop.
    #[error("operation cancelled")]
    Cancelled,
    /// A reference whose target is in neither the cache nor the remote.
    #[error("referenced object {0} is missing from cache and remote")]
    PartialGraph(ObjectId),
    /// A node could not be serialized.
    #[error(transparent)]
    Serialize(SerializeError),
    /// Another run is active on the same pipeline instance.
    #[error("a {0} run is already active on this pipeline")]
    Busy(&'static str),
    /// The configuration file is unusable.
    #[error("configuration error: {0}")]
    Config(String),
    /// A post-receive hook returned an error.
    #[error("post-receive hook for '{speckle_type}' failed: {message}")]
    Hook {
        speckle_type: String,
        message: String,
    },
    /// A bug or a broken runtime invariant, such as a panicked worker.
    #[error("internal error: {0}")]
    Internal(String),
    /// Filesystem or stream failure outside the stores.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub(crate) fn malformed(id: Option<&ObjectId>, message: impl Into<String>) -> Self {
        TransportError::Malformed {
            id: id.cloned(),
            message: message.into(),
        }
    }

    pub(crate) fn cache(context: impl Into<String>, source: CacheError) -> Self {
        TransportError::Storage {
            context: context.into(),
            source: StorageError::Cache(source),
        }
    }

    pub(crate) fn remote(context: impl Into<String>, source: RemoteError) -> Self {
        TransportError::Storage {
            context: context.into(),
            source: StorageError::Remote(source),
        }
    }

    /// Whether this error is the cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

impl From<SerializeError> for TransportError {
    fn from(err: SerializeError) -> Self {
        match err {
            SerializeError::Cancelled => TransportError::Cancelled,
            other => TransportError::Serialize(other),
        }
    }
}

impl From<DeserializeError> for TransportError {
    fn from(err: DeserializeError) -> Self {
        match err {
            DeserializeError::UnknownType(name) => TransportError::UnknownType(name),
            DeserializeError::MissingReference(id) => TransportError::PartialGraph(id),
            DeserializeError::Resolver(inner) => *inner,
            other => TransportError::Malformed {
                id: None,
                message: other.to_string(),
            },
        }
    }
}
