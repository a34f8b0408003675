//! Client traits, operation descriptors, and result types.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{KvError, KvResult};
use crate::types::{Cas, DurabilityLevel, KeySpace, ResourceUnits};

/// Server macro expanding to the mutation's CAS in hex form.
pub const MACRO_CAS: &str = "${Mutation.CAS}";
/// Server macro expanding to the CRC32C of the document body after the
/// mutation.
pub const MACRO_VALUE_CRC32C: &str = "${Mutation.value_crc32c}";

/// Virtual xattr path serving document metadata.
pub const VATTR_DOCUMENT: &str = "$document";
/// Virtual xattr path serving the server's hybrid logical clock.
pub const VATTR_HLC: &str = "$vbucket.HLC";

/// A single path lookup inside a [`KvClient::lookup_in`] call.
///
/// An empty `path` addresses the whole document body.
#[derive(Debug, Clone)]
pub struct LookupInOp {
    /// Sub-document path, dot-separated. Virtual paths (`$document`,
    /// `$vbucket.HLC`) are served from document/server metadata.
    pub path: String,
    /// Whether the path addresses an extended attribute.
    pub xattr: bool,
}

impl LookupInOp {
    /// Look up an xattr path.
    pub fn xattr(path: impl Into<String>) -> Self {
        LookupInOp {
            path: path.into(),
            xattr: true,
        }
    }

    /// Look up the whole document body.
    pub fn full_body() -> Self {
        LookupInOp {
            path: String::new(),
            xattr: false,
        }
    }
}

/// The kind of a single sub-document mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateInOpType {
    /// Insert a dictionary entry, failing if the path already exists.
    DictAdd,
    /// Insert or overwrite a dictionary entry.
    DictSet,
    /// Remove the value at the path, failing if it does not exist.
    Delete,
    /// Replace the whole document body.
    SetDoc,
}

/// A single mutation inside a [`KvClient::mutate_in`] call.
#[derive(Debug, Clone)]
pub struct MutateInOp {
    /// Mutation kind.
    pub op: MutateInOpType,
    /// Sub-document path. Ignored for `SetDoc`.
    pub path: String,
    /// JSON-encoded value. Ignored for `Delete`.
    pub value: Vec<u8>,
    /// Whether the path addresses an extended attribute.
    pub xattr: bool,
    /// Create missing intermediate dictionaries.
    pub create_path: bool,
    /// Expand server macros (`${Mutation.CAS}`, `${Mutation.value_crc32c}`)
    /// in the value.
    pub expand_macros: bool,
}

impl MutateInOp {
    /// A `DictAdd` of an xattr path with intermediate-path creation.
    pub fn xattr_add(path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInOp {
            op: MutateInOpType::DictAdd,
            path: path.into(),
            value,
            xattr: true,
            create_path: true,
            expand_macros: false,
        }
    }

    /// A `DictSet` of an xattr path with intermediate-path creation.
    pub fn xattr_set(path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInOp {
            op: MutateInOpType::DictSet,
            path: path.into(),
            value,
            xattr: true,
            create_path: true,
            expand_macros: false,
        }
    }

    /// A `Delete` of an xattr path.
    pub fn xattr_delete(path: impl Into<String>) -> Self {
        MutateInOp {
            op: MutateInOpType::Delete,
            path: path.into(),
            value: Vec::new(),
            xattr: true,
            create_path: false,
            expand_macros: false,
        }
    }

    /// A whole-body replacement carried alongside xattr mutations.
    pub fn set_doc(value: Vec<u8>) -> Self {
        MutateInOp {
            op: MutateInOpType::SetDoc,
            path: String::new(),
            value,
            xattr: false,
            create_path: false,
            expand_macros: false,
        }
    }

    /// Enable server macro expansion on this op.
    pub fn with_macros(mut self) -> Self {
        self.expand_macros = true;
        self
    }
}

/// Document-level flags on a sub-document mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocFlags {
    /// Create the document if it does not exist (upsert semantics).
    pub mk_doc: bool,
    /// Create the document, failing if it already exists.
    pub add_doc: bool,
    /// Operate on tombstones as well as live documents.
    pub access_deleted: bool,
    /// When creating, create the document as a tombstone.
    pub create_as_deleted: bool,
}

/// Options for a whole-document read.
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Keyspace containing the document.
    pub keyspace: KeySpace,
    /// Document key.
    pub key: String,
    /// Absolute deadline for the operation, if any.
    pub deadline: Option<Instant>,
}

/// Options for a sub-document lookup.
#[derive(Debug, Clone)]
pub struct LookupInOptions {
    /// Keyspace containing the document.
    pub keyspace: KeySpace,
    /// Document key.
    pub key: String,
    /// The paths to fetch.
    pub ops: Vec<LookupInOp>,
    /// Serve the lookup from a tombstone if the document is deleted.
    pub access_deleted: bool,
    /// Absolute deadline for the operation, if any.
    pub deadline: Option<Instant>,
}

/// Options for a sub-document mutation.
#[derive(Debug, Clone)]
pub struct MutateInOptions {
    /// Keyspace containing the document.
    pub keyspace: KeySpace,
    /// Document key.
    pub key: String,
    /// The mutations to apply atomically.
    pub ops: Vec<MutateInOp>,
    /// CAS guard; [`Cas::ZERO`] means no check.
    pub cas: Cas,
    /// Durability requirement.
    pub durability: DurabilityLevel,
    /// Document-level flags.
    pub flags: DocFlags,
    /// Absolute deadline for the operation, if any.
    pub deadline: Option<Instant>,
}

/// Options for a whole-document write (`add` or `set`).
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Keyspace containing the document.
    pub keyspace: KeySpace,
    /// Document key.
    pub key: String,
    /// JSON-encoded document body.
    pub value: Vec<u8>,
    /// CAS guard; [`Cas::ZERO`] means no check.
    pub cas: Cas,
    /// Durability requirement.
    pub durability: DurabilityLevel,
    /// Absolute deadline for the operation, if any.
    pub deadline: Option<Instant>,
}

/// Options for a whole-document delete.
#[derive(Debug, Clone)]
pub struct DeleteOptions {
    /// Keyspace containing the document.
    pub keyspace: KeySpace,
    /// Document key.
    pub key: String,
    /// CAS guard; [`Cas::ZERO`] means no check.
    pub cas: Cas,
    /// Durability requirement.
    pub durability: DurabilityLevel,
    /// Absolute deadline for the operation, if any.
    pub deadline: Option<Instant>,
}

/// Result of a whole-document read.
#[derive(Debug, Clone)]
pub struct GetResult {
    /// Document CAS at read time.
    pub cas: Cas,
    /// Document body.
    pub value: Vec<u8>,
    /// Resource units reported by the server, if any.
    pub resource_units: Option<ResourceUnits>,
}

/// Result of a sub-document lookup.
#[derive(Debug, Clone)]
pub struct LookupInResult {
    /// Document CAS at read time.
    pub cas: Cas,
    /// Whether the document is a tombstone.
    pub is_deleted: bool,
    /// Per-op results, in request order. Individual paths may fail while the
    /// lookup as a whole succeeds.
    pub ops: Vec<KvResult<Vec<u8>>>,
    /// Resource units reported by the server, if any.
    pub resource_units: Option<ResourceUnits>,
}

impl LookupInResult {
    /// Decode the op at `index` as JSON, or `None` if the path was missing.
    ///
    /// Other per-path failures are surfaced as errors.
    pub fn content<T: serde::de::DeserializeOwned>(&self, index: usize) -> KvResult<Option<T>> {
        match self.ops.get(index) {
            None => Err(KvError::InvalidArgument(format!(
                "lookup op index {index} out of range"
            ))),
            Some(Err(KvError::PathNotFound(_))) => Ok(None),
            Some(Err(err)) => Err(err.clone()),
            Some(Ok(bytes)) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(KvError::encoding),
        }
    }
}

/// Result of a mutation.
#[derive(Debug, Clone)]
pub struct MutateInResult {
    /// Document CAS after the mutation.
    pub cas: Cas,
    /// Resource units reported by the server, if any.
    pub resource_units: Option<ResourceUnits>,
}

/// Result of a whole-document write or delete.
#[derive(Debug, Clone)]
pub struct StoreResult {
    /// Document CAS after the mutation.
    pub cas: Cas,
    /// Resource units reported by the server, if any.
    pub resource_units: Option<ResourceUnits>,
}

/// Blocking client for a single bucket.
///
/// Implementations must be safe to share across threads; the transaction
/// engine calls into the same client from application threads and from
/// background cleanup threads.
pub trait KvClient: Send + Sync {
    /// The bucket this client is bound to.
    fn bucket_name(&self) -> &str;

    /// Read a whole document. Tombstones report [`KvError::DocumentNotFound`].
    fn get(&self, opts: GetOptions) -> KvResult<GetResult>;

    /// Read one or more sub-document paths.
    fn lookup_in(&self, opts: LookupInOptions) -> KvResult<LookupInResult>;

    /// Apply one or more sub-document mutations atomically.
    fn mutate_in(&self, opts: MutateInOptions) -> KvResult<MutateInResult>;

    /// Create a document, failing with [`KvError::DocumentExists`] if a live
    /// document is present.
    fn add(&self, opts: StoreOptions) -> KvResult<StoreResult>;

    /// Create or replace a document.
    fn set(&self, opts: StoreOptions) -> KvResult<StoreResult>;

    /// Delete a document.
    fn delete(&self, opts: DeleteOptions) -> KvResult<StoreResult>;
}

/// Resolves bucket names to clients.
///
/// The engine holds one of these for the lifetime of a
/// transactions instance; cleanup uses it to reach buckets it has never seen
/// an application operation against.
pub trait BucketProvider: Send + Sync {
    /// Get (or open) a client for the named bucket.
    fn bucket(&self, name: &str) -> KvResult<Arc<dyn KvClient>>;
}

/// Derive an op deadline from a timeout relative to now.
pub fn deadline_from_timeout(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_content_maps_missing_path_to_none() {
        let res = LookupInResult {
            cas: Cas::new(1),
            is_deleted: false,
            ops: vec![
                Err(KvError::PathNotFound("txn".to_string())),
                Ok(b"{\"a\":1}".to_vec()),
            ],
            resource_units: None,
        };
        let missing: Option<serde_json::Value> = res.content(0).unwrap();
        assert!(missing.is_none());
        let found: Option<serde_json::Value> = res.content(1).unwrap();
        assert_eq!(found.unwrap()["a"], 1);
    }

    #[test]
    fn lookup_content_out_of_range_is_error() {
        let res = LookupInResult {
            cas: Cas::ZERO,
            is_deleted: false,
            ops: vec![],
            resource_units: None,
        };
        let err = res.content::<serde_json::Value>(3).unwrap_err();
        assert!(matches!(err, KvError::InvalidArgument(_)));
    }
}
