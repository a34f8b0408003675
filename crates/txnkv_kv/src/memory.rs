//! In-memory cluster implementing the KV client surface.
//!
//! Used by the test suite and by embedders that want a local stand-in for a
//! real cluster. Time is logical: every mutation advances a shared
//! [`LogicalClock`], CAS values are nanosecond timestamps drawn from it, and
//! tests can advance the clock to drive expiry-based behaviour
//! deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::client::{
    BucketProvider, DeleteOptions, GetOptions, GetResult, KvClient, LookupInOp, LookupInOptions,
    LookupInResult, MutateInOp, MutateInOpType, MutateInOptions, MutateInResult, StoreOptions,
    StoreResult, MACRO_CAS, MACRO_VALUE_CRC32C, VATTR_DOCUMENT, VATTR_HLC,
};
use crate::error::{KvError, KvResult};
use crate::types::{Cas, ResourceUnits};

/// Monotonic logical clock shared by all buckets of a [`MemoryCluster`].
///
/// Starts at a fixed epoch well past 1970 so CAS values look like plausible
/// wall-clock nanoseconds. Each mutation advances it by one microsecond,
/// which keeps CAS values unique and strictly increasing.
#[derive(Debug)]
pub struct LogicalClock {
    nanos: AtomicU64,
}

/// Epoch the clock starts from (2020-09-13T12:26:40Z in nanoseconds).
const CLOCK_EPOCH_NANOS: u64 = 1_600_000_000_000_000_000;

impl LogicalClock {
    fn new() -> Self {
        LogicalClock {
            nanos: AtomicU64::new(CLOCK_EPOCH_NANOS),
        }
    }

    /// Current logical time in nanoseconds.
    pub fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    /// Current logical time in milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }

    /// Current logical time in whole seconds.
    pub fn now_secs(&self) -> u64 {
        self.now_nanos() / 1_000_000_000
    }

    /// Advance the clock, e.g. to push transactions past their expiry.
    pub fn advance(&self, duration: std::time::Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Draw a fresh CAS, advancing the clock by one microsecond.
    pub fn next_cas(&self) -> Cas {
        Cas::new(self.nanos.fetch_add(1_000, Ordering::SeqCst) + 1_000)
    }
}

#[derive(Debug, Clone)]
struct DocEntry {
    body: Vec<u8>,
    xattrs: Map<String, Value>,
    cas: Cas,
    deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocId {
    scope: String,
    collection: String,
    key: String,
}

impl DocId {
    fn from_parts(scope: &str, collection: &str, key: &str) -> Self {
        DocId {
            scope: scope.to_string(),
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }
}

/// A single in-memory bucket.
#[derive(Debug)]
pub struct MemoryBucket {
    name: String,
    clock: Arc<LogicalClock>,
    docs: Mutex<HashMap<DocId, DocEntry>>,
}

/// An in-memory cluster of buckets sharing one logical clock.
///
/// Cheap to clone; clones share state. Implements [`BucketProvider`]
/// directly, creating buckets on demand.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

#[derive(Debug)]
struct ClusterInner {
    clock: Arc<LogicalClock>,
    buckets: Mutex<HashMap<String, Arc<MemoryBucket>>>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        MemoryCluster {
            inner: Arc::new(ClusterInner {
                clock: Arc::new(LogicalClock::new()),
                buckets: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The cluster's logical clock.
    pub fn clock(&self) -> &LogicalClock {
        &self.inner.clock
    }

    /// Get or create the named bucket.
    pub fn open_bucket(&self, name: &str) -> Arc<MemoryBucket> {
        let mut buckets = self.inner.buckets.lock();
        buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryBucket {
                    name: name.to_string(),
                    clock: Arc::clone(&self.inner.clock),
                    docs: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        MemoryCluster::new()
    }
}

impl BucketProvider for MemoryCluster {
    fn bucket(&self, name: &str) -> KvResult<Arc<dyn KvClient>> {
        Ok(self.open_bucket(name))
    }
}

fn crc_hex(body: &[u8]) -> String {
    format!("0x{:08x}", crc32fast::hash(body))
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Read the value at a dot-separated path within `root`.
fn lookup_value<'a>(root: &'a Value, path: &str) -> KvResult<&'a Value> {
    let mut cur = root;
    for seg in path_segments(path) {
        cur = cur
            .get(seg)
            .ok_or_else(|| KvError::PathNotFound(path.to_string()))?;
    }
    Ok(cur)
}

/// Descend to the dictionary holding the final path segment, optionally
/// creating intermediate dictionaries.
fn navigate_parent<'a>(
    root: &'a mut Value,
    path: &str,
    create: bool,
) -> KvResult<(&'a mut Map<String, Value>, String)> {
    let segs = path_segments(path);
    let (last, parents) = match segs.split_last() {
        Some(split) => split,
        None => return Err(KvError::InvalidArgument("empty subdoc path".to_string())),
    };
    let mut cur = root;
    for seg in parents {
        let obj = cur
            .as_object_mut()
            .ok_or_else(|| KvError::PathNotFound(path.to_string()))?;
        cur = if create {
            obj.entry((*seg).to_string())
                .or_insert_with(|| Value::Object(Map::new()))
        } else {
            obj.get_mut(*seg)
                .ok_or_else(|| KvError::PathNotFound(path.to_string()))?
        };
    }
    let obj = cur
        .as_object_mut()
        .ok_or_else(|| KvError::PathNotFound(path.to_string()))?;
    Ok((obj, (*last).to_string()))
}

fn parse_json(bytes: &[u8]) -> KvResult<Value> {
    if bytes.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(bytes).map_err(KvError::encoding)
}

impl MemoryBucket {
    fn units(reads: u16, writes: u16) -> Option<ResourceUnits> {
        Some(ResourceUnits {
            read_units: reads,
            write_units: writes,
        })
    }

    fn serve_lookup_op(
        &self,
        entry: &DocEntry,
        op: &LookupInOp,
    ) -> KvResult<Vec<u8>> {
        if op.path == VATTR_DOCUMENT {
            let meta = serde_json::json!({
                "CAS": entry.cas.to_hex(),
                "value_crc32c": crc_hex(&entry.body),
                "exptime": 0,
            });
            return serde_json::to_vec(&meta).map_err(KvError::encoding);
        }
        if op.path == VATTR_HLC {
            let hlc = serde_json::json!({
                "now": self.clock.now_secs().to_string(),
                "mode": "real",
            });
            return serde_json::to_vec(&hlc).map_err(KvError::encoding);
        }
        if op.xattr {
            let root = Value::Object(entry.xattrs.clone());
            let value = lookup_value(&root, &op.path)?;
            return serde_json::to_vec(value).map_err(KvError::encoding);
        }
        if op.path.is_empty() {
            return Ok(entry.body.clone());
        }
        let body = parse_json(&entry.body)?;
        let value = lookup_value(&body, &op.path)?;
        serde_json::to_vec(value).map_err(KvError::encoding)
    }

    fn expand_macro(op: &MutateInOp, new_cas: Cas, body_crc: &str) -> KvResult<Option<Vec<u8>>> {
        if !op.expand_macros {
            return Ok(None);
        }
        let text: String = serde_json::from_slice(&op.value).map_err(KvError::encoding)?;
        let expanded = match text.as_str() {
            MACRO_CAS => new_cas.to_hex(),
            MACRO_VALUE_CRC32C => body_crc.to_string(),
            other => {
                return Err(KvError::InvalidArgument(format!(
                    "unknown server macro: {other}"
                )))
            }
        };
        serde_json::to_vec(&expanded).map(Some).map_err(KvError::encoding)
    }
}

impl KvClient for MemoryBucket {
    fn bucket_name(&self) -> &str {
        &self.name
    }

    fn get(&self, opts: GetOptions) -> KvResult<GetResult> {
        let docs = self.docs.lock();
        let id = DocId::from_parts(&opts.keyspace.scope, &opts.keyspace.collection, &opts.key);
        match docs.get(&id) {
            Some(entry) if !entry.deleted => Ok(GetResult {
                cas: entry.cas,
                value: entry.body.clone(),
                resource_units: Self::units(1, 0),
            }),
            _ => Err(KvError::DocumentNotFound),
        }
    }

    fn lookup_in(&self, opts: LookupInOptions) -> KvResult<LookupInResult> {
        let docs = self.docs.lock();
        let id = DocId::from_parts(&opts.keyspace.scope, &opts.keyspace.collection, &opts.key);
        let entry = docs.get(&id).ok_or(KvError::DocumentNotFound)?;
        if entry.deleted && !opts.access_deleted {
            return Err(KvError::DocumentNotFound);
        }
        let ops = opts
            .ops
            .iter()
            .map(|op| self.serve_lookup_op(entry, op))
            .collect();
        Ok(LookupInResult {
            cas: entry.cas,
            is_deleted: entry.deleted,
            ops,
            resource_units: Self::units(1, 0),
        })
    }

    fn mutate_in(&self, opts: MutateInOptions) -> KvResult<MutateInResult> {
        let mut docs = self.docs.lock();
        let id = DocId::from_parts(&opts.keyspace.scope, &opts.keyspace.collection, &opts.key);

        let mut entry = match docs.get(&id) {
            None => {
                if opts.flags.mk_doc || opts.flags.add_doc {
                    DocEntry {
                        body: Vec::new(),
                        xattrs: Map::new(),
                        cas: Cas::ZERO,
                        deleted: opts.flags.create_as_deleted,
                    }
                } else {
                    return Err(KvError::DocumentNotFound);
                }
            }
            Some(existing) => {
                if opts.flags.add_doc {
                    // Tombstones count as existing here: a staged insert
                    // retrying over a tombstone must take the CAS-guarded
                    // path instead.
                    return Err(KvError::DocumentExists);
                }
                if existing.deleted && !opts.flags.access_deleted {
                    if opts.flags.mk_doc {
                        DocEntry {
                            body: Vec::new(),
                            xattrs: Map::new(),
                            cas: existing.cas,
                            deleted: false,
                        }
                    } else {
                        return Err(KvError::DocumentNotFound);
                    }
                } else {
                    existing.clone()
                }
            }
        };

        if opts.cas.is_set() && opts.cas != entry.cas {
            return Err(KvError::CasMismatch);
        }

        let new_cas = self.clock.next_cas();

        // First pass applies every op, leaving macro values unexpanded so the
        // body CRC reflects the post-mutation state. A second pass rewrites
        // the macro paths with their expanded values.
        let mut macro_ops: Vec<&MutateInOp> = Vec::new();
        for op in &opts.ops {
            if op.expand_macros {
                macro_ops.push(op);
            }
            apply_mutate_op(&mut entry, op, &op.value)?;
        }
        let body_crc = crc_hex(&entry.body);
        for op in macro_ops {
            if let Some(expanded) = Self::expand_macro(op, new_cas, &body_crc)? {
                let rewrite = MutateInOp {
                    op: MutateInOpType::DictSet,
                    ..op.clone()
                };
                apply_mutate_op(&mut entry, &rewrite, &expanded)?;
            }
        }

        entry.cas = new_cas;
        if entry.deleted && entry.xattrs.is_empty() && entry.body.is_empty() {
            // A tombstone stripped of its last xattr has nothing left to say.
            docs.remove(&id);
        } else {
            docs.insert(id, entry);
        }
        Ok(MutateInResult {
            cas: new_cas,
            resource_units: Self::units(0, 1),
        })
    }

    fn add(&self, opts: StoreOptions) -> KvResult<StoreResult> {
        let mut docs = self.docs.lock();
        let id = DocId::from_parts(&opts.keyspace.scope, &opts.keyspace.collection, &opts.key);
        if let Some(existing) = docs.get(&id) {
            if !existing.deleted {
                return Err(KvError::DocumentExists);
            }
        }
        let cas = self.clock.next_cas();
        docs.insert(
            id,
            DocEntry {
                body: opts.value,
                xattrs: Map::new(),
                cas,
                deleted: false,
            },
        );
        Ok(StoreResult {
            cas,
            resource_units: Self::units(0, 1),
        })
    }

    fn set(&self, opts: StoreOptions) -> KvResult<StoreResult> {
        let mut docs = self.docs.lock();
        let id = DocId::from_parts(&opts.keyspace.scope, &opts.keyspace.collection, &opts.key);
        if opts.cas.is_set() {
            match docs.get(&id) {
                None => return Err(KvError::DocumentNotFound),
                Some(existing) if existing.cas != opts.cas => return Err(KvError::CasMismatch),
                Some(_) => {}
            }
        }
        let cas = self.clock.next_cas();
        docs.insert(
            id,
            DocEntry {
                body: opts.value,
                xattrs: Map::new(),
                cas,
                deleted: false,
            },
        );
        Ok(StoreResult {
            cas,
            resource_units: Self::units(0, 1),
        })
    }

    fn delete(&self, opts: DeleteOptions) -> KvResult<StoreResult> {
        let mut docs = self.docs.lock();
        let id = DocId::from_parts(&opts.keyspace.scope, &opts.keyspace.collection, &opts.key);
        match docs.get(&id) {
            None => Err(KvError::DocumentNotFound),
            Some(existing) if existing.deleted => Err(KvError::DocumentNotFound),
            Some(existing) => {
                if opts.cas.is_set() && opts.cas != existing.cas {
                    return Err(KvError::CasMismatch);
                }
                docs.remove(&id);
                Ok(StoreResult {
                    cas: self.clock.next_cas(),
                    resource_units: Self::units(0, 1),
                })
            }
        }
    }
}

fn apply_mutate_op(entry: &mut DocEntry, op: &MutateInOp, value: &[u8]) -> KvResult<()> {
    match op.op {
        MutateInOpType::SetDoc => {
            entry.body = value.to_vec();
            return Ok(());
        }
        MutateInOpType::DictAdd | MutateInOpType::DictSet | MutateInOpType::Delete => {}
    }

    let mut root = if op.xattr {
        Value::Object(std::mem::take(&mut entry.xattrs))
    } else {
        parse_json(&entry.body)?
    };

    let result = apply_dict_op(&mut root, op, value);

    if op.xattr {
        match root {
            Value::Object(map) => entry.xattrs = map,
            _ => return Err(KvError::Encoding("xattr root is not an object".to_string())),
        }
        result
    } else {
        result?;
        entry.body = serde_json::to_vec(&root).map_err(KvError::encoding)?;
        Ok(())
    }
}

fn apply_dict_op(root: &mut Value, op: &MutateInOp, value: &[u8]) -> KvResult<()> {
    match op.op {
        MutateInOpType::DictAdd => {
            let (parent, last) = navigate_parent(root, &op.path, op.create_path)?;
            if parent.contains_key(&last) {
                return Err(KvError::PathExists(op.path.clone()));
            }
            let parsed = parse_json(value)?;
            parent.insert(last, parsed);
            Ok(())
        }
        MutateInOpType::DictSet => {
            let (parent, last) = navigate_parent(root, &op.path, op.create_path)?;
            let parsed = parse_json(value)?;
            parent.insert(last, parsed);
            Ok(())
        }
        MutateInOpType::Delete => {
            let (parent, last) = navigate_parent(root, &op.path, false)?;
            if parent.remove(&last).is_none() {
                return Err(KvError::PathNotFound(op.path.clone()));
            }
            Ok(())
        }
        MutateInOpType::SetDoc => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DocFlags;
    use crate::types::{DurabilityLevel, KeySpace};

    fn test_bucket() -> (MemoryCluster, Arc<MemoryBucket>, KeySpace) {
        let cluster = MemoryCluster::new();
        let bucket = cluster.open_bucket("main");
        let ks = KeySpace::default_for_bucket("main");
        (cluster, bucket, ks)
    }

    fn store_opts(ks: &KeySpace, key: &str, value: &[u8]) -> StoreOptions {
        StoreOptions {
            keyspace: ks.clone(),
            key: key.to_string(),
            value: value.to_vec(),
            cas: Cas::ZERO,
            durability: DurabilityLevel::None,
            deadline: None,
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let (_c, bucket, ks) = test_bucket();
        let stored = bucket.add(store_opts(&ks, "doc", b"{\"a\":1}")).unwrap();
        assert!(stored.cas.is_set());
        let got = bucket
            .get(GetOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                deadline: None,
            })
            .unwrap();
        assert_eq!(got.value, b"{\"a\":1}");
        assert_eq!(got.cas, stored.cas);
    }

    #[test]
    fn add_over_live_doc_fails() {
        let (_c, bucket, ks) = test_bucket();
        bucket.add(store_opts(&ks, "doc", b"{}")).unwrap();
        let err = bucket.add(store_opts(&ks, "doc", b"{}")).unwrap_err();
        assert_eq!(err, KvError::DocumentExists);
    }

    #[test]
    fn set_with_stale_cas_fails() {
        let (_c, bucket, ks) = test_bucket();
        let first = bucket.add(store_opts(&ks, "doc", b"{}")).unwrap();
        bucket.set(store_opts(&ks, "doc", b"{\"v\":2}")).unwrap();
        let mut opts = store_opts(&ks, "doc", b"{\"v\":3}");
        opts.cas = first.cas;
        assert_eq!(bucket.set(opts).unwrap_err(), KvError::CasMismatch);
    }

    #[test]
    fn xattr_dict_add_and_lookup() {
        let (_c, bucket, ks) = test_bucket();
        bucket.add(store_opts(&ks, "doc", b"{}")).unwrap();
        bucket
            .mutate_in(MutateInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![MutateInOp::xattr_add("txn.id", b"\"t1\"".to_vec())],
                cas: Cas::ZERO,
                durability: DurabilityLevel::None,
                flags: DocFlags::default(),
                deadline: None,
            })
            .unwrap();
        let res = bucket
            .lookup_in(LookupInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![LookupInOp::xattr("txn.id")],
                access_deleted: false,
                deadline: None,
            })
            .unwrap();
        let id: Option<String> = res.content(0).unwrap();
        assert_eq!(id.as_deref(), Some("t1"));
    }

    #[test]
    fn dict_add_on_existing_path_fails() {
        let (_c, bucket, ks) = test_bucket();
        bucket.add(store_opts(&ks, "doc", b"{}")).unwrap();
        let op = MutateInOp::xattr_add("txn", b"{}".to_vec());
        let opts = MutateInOptions {
            keyspace: ks.clone(),
            key: "doc".to_string(),
            ops: vec![op.clone()],
            cas: Cas::ZERO,
            durability: DurabilityLevel::None,
            flags: DocFlags::default(),
            deadline: None,
        };
        bucket.mutate_in(opts.clone()).unwrap();
        let err = bucket.mutate_in(opts).unwrap_err();
        assert!(matches!(err, KvError::PathExists(_)));
    }

    #[test]
    fn create_as_deleted_makes_tombstone() {
        let (_c, bucket, ks) = test_bucket();
        bucket
            .mutate_in(MutateInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![MutateInOp::xattr_set("txn.id", b"\"t1\"".to_vec())],
                cas: Cas::ZERO,
                durability: DurabilityLevel::None,
                flags: DocFlags {
                    add_doc: true,
                    create_as_deleted: true,
                    access_deleted: true,
                    ..Default::default()
                },
                deadline: None,
            })
            .unwrap();
        // Invisible to plain reads.
        assert_eq!(
            bucket
                .get(GetOptions {
                    keyspace: ks.clone(),
                    key: "doc".to_string(),
                    deadline: None,
                })
                .unwrap_err(),
            KvError::DocumentNotFound
        );
        // Visible to access-deleted lookups.
        let res = bucket
            .lookup_in(LookupInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![LookupInOp::xattr("txn.id")],
                access_deleted: true,
                deadline: None,
            })
            .unwrap();
        assert!(res.is_deleted);
        let id: Option<String> = res.content(0).unwrap();
        assert_eq!(id.as_deref(), Some("t1"));
    }

    #[test]
    fn stripping_last_xattr_from_tombstone_drops_entry() {
        let (_c, bucket, ks) = test_bucket();
        bucket
            .mutate_in(MutateInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![MutateInOp::xattr_set("txn", b"{}".to_vec())],
                cas: Cas::ZERO,
                durability: DurabilityLevel::None,
                flags: DocFlags {
                    add_doc: true,
                    create_as_deleted: true,
                    access_deleted: true,
                    ..Default::default()
                },
                deadline: None,
            })
            .unwrap();
        bucket
            .mutate_in(MutateInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![MutateInOp::xattr_delete("txn")],
                cas: Cas::ZERO,
                durability: DurabilityLevel::None,
                flags: DocFlags {
                    access_deleted: true,
                    ..Default::default()
                },
                deadline: None,
            })
            .unwrap();
        // Nothing left, not even a tombstone.
        let err = bucket
            .lookup_in(LookupInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![LookupInOp::xattr("txn")],
                access_deleted: true,
                deadline: None,
            })
            .unwrap_err();
        assert_eq!(err, KvError::DocumentNotFound);
    }

    #[test]
    fn cas_macro_expands_to_mutation_cas() {
        let (_c, bucket, ks) = test_bucket();
        bucket.add(store_opts(&ks, "doc", b"{}")).unwrap();
        let macro_value = serde_json::to_vec(MACRO_CAS).unwrap();
        let res = bucket
            .mutate_in(MutateInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![MutateInOp::xattr_set("meta.ts", macro_value).with_macros()],
                cas: Cas::ZERO,
                durability: DurabilityLevel::None,
                flags: DocFlags::default(),
                deadline: None,
            })
            .unwrap();
        let lookup = bucket
            .lookup_in(LookupInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![LookupInOp::xattr("meta.ts")],
                access_deleted: false,
                deadline: None,
            })
            .unwrap();
        let ts: Option<String> = lookup.content(0).unwrap();
        assert_eq!(ts.unwrap(), res.cas.to_hex());
    }

    #[test]
    fn document_vattr_reports_cas_and_crc() {
        let (_c, bucket, ks) = test_bucket();
        let stored = bucket.add(store_opts(&ks, "doc", b"{\"a\":1}")).unwrap();
        let res = bucket
            .lookup_in(LookupInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![LookupInOp::xattr(VATTR_DOCUMENT)],
                access_deleted: false,
                deadline: None,
            })
            .unwrap();
        let meta: Option<serde_json::Value> = res.content(0).unwrap();
        let meta = meta.unwrap();
        assert_eq!(meta["CAS"], stored.cas.to_hex());
        assert_eq!(meta["value_crc32c"], crc_hex(b"{\"a\":1}"));
    }

    #[test]
    fn hlc_vattr_follows_logical_clock() {
        let (cluster, bucket, ks) = test_bucket();
        bucket.add(store_opts(&ks, "doc", b"{}")).unwrap();
        cluster.clock().advance(std::time::Duration::from_secs(90));
        let res = bucket
            .lookup_in(LookupInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![LookupInOp::xattr(VATTR_HLC)],
                access_deleted: false,
                deadline: None,
            })
            .unwrap();
        let hlc: Option<serde_json::Value> = res.content(0).unwrap();
        let now: u64 = hlc.unwrap()["now"].as_str().unwrap().parse().unwrap();
        assert!(now >= CLOCK_EPOCH_NANOS / 1_000_000_000 + 90);
    }

    #[test]
    fn delete_removes_doc_entirely() {
        let (_c, bucket, ks) = test_bucket();
        let stored = bucket.add(store_opts(&ks, "doc", b"{}")).unwrap();
        bucket
            .delete(DeleteOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                cas: stored.cas,
                durability: DurabilityLevel::None,
                deadline: None,
            })
            .unwrap();
        let err = bucket
            .lookup_in(LookupInOptions {
                keyspace: ks.clone(),
                key: "doc".to_string(),
                ops: vec![LookupInOp::full_body()],
                access_deleted: true,
                deadline: None,
            })
            .unwrap_err();
        assert_eq!(err, KvError::DocumentNotFound);
    }

    #[test]
    fn mutations_produce_strictly_increasing_cas() {
        let (_c, bucket, ks) = test_bucket();
        let a = bucket.add(store_opts(&ks, "a", b"{}")).unwrap();
        let b = bucket.add(store_opts(&ks, "b", b"{}")).unwrap();
        assert!(b.cas > a.cas);
    }
}
