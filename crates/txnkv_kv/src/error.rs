//! Error types for the KV client surface.

use thiserror::Error;

/// Result alias for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors surfaced by a [`crate::KvClient`].
///
/// The transaction engine classifies these into coarse error classes, so the
/// variants here deliberately mirror the failure surface of a real cluster
/// rather than collapsing into a single opaque error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// The document does not exist (or is a tombstone and the operation did
    /// not request access to deleted documents).
    #[error("document not found")]
    DocumentNotFound,

    /// The document already exists and the operation required it not to.
    #[error("document already exists")]
    DocumentExists,

    /// A sub-document path did not exist.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// A sub-document path already existed and the operation required it not
    /// to.
    #[error("path already exists: {0}")]
    PathExists(String),

    /// The CAS supplied with the mutation did not match the document.
    #[error("cas mismatch")]
    CasMismatch,

    /// The server asked the client to back off and retry.
    #[error("temporary failure")]
    Temporary,

    /// The document is locked by another actor.
    #[error("document locked")]
    DocumentLocked,

    /// The operation deadline elapsed before the server responded.
    #[error("operation timed out")]
    Timeout,

    /// A durable write may or may not have taken effect.
    #[error("durability ambiguous")]
    DurabilityAmbiguous,

    /// The server rejected the mutation for lack of space (including
    /// value-too-large rejections).
    #[error("out of space")]
    OutOfSpace,

    /// The named bucket is not known to the cluster.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// The scope or collection addressed by the operation does not exist.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// The caller is not permitted to perform the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A malformed request the server will never accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Payload could not be encoded or decoded as JSON.
    #[error("encoding failure: {0}")]
    Encoding(String),

    /// Any other server-side failure.
    #[error("server failure: {0}")]
    Server(String),
}

impl KvError {
    /// Build an [`KvError::Encoding`] from any serde_json error.
    pub fn encoding(err: serde_json::Error) -> Self {
        KvError::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_path() {
        let err = KvError::PathNotFound("txn.op".to_string());
        assert_eq!(err.to_string(), "path not found: txn.op");
    }

    #[test]
    fn errors_compare_by_value() {
        assert_eq!(KvError::CasMismatch, KvError::CasMismatch);
        assert_ne!(KvError::CasMismatch, KvError::Temporary);
    }
}
