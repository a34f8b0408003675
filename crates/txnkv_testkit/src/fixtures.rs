//! In-memory cluster fixtures.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use txnkv_core::{AtrLocation, Transactions, TransactionsConfig};
use txnkv_kv::{
    BucketProvider, Cas, DeleteOptions, DurabilityLevel, GetOptions, KeySpace, KvClient, KvError,
    LookupInOp, LookupInOptions, MemoryCluster, StoreOptions,
};
use txnkv_protocol::atr::attempt_path;
use txnkv_protocol::doc::paths;

/// Installs a fmt subscriber honoring `RUST_LOG`, once per process. Safe to
/// call from every test; later calls are no-ops.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// An engine configuration tuned for tests: short budgets, a small ATR
/// pool, and both cleanup subsystems off. Tests that exercise cleanup turn
/// the relevant flag back on.
pub fn fast_config() -> TransactionsConfig {
    TransactionsConfig::new()
        .with_expiration_time(Duration::from_secs(5))
        .with_kv_timeout(Duration::from_millis(500))
        .with_num_atrs(16)
        .with_durability(DurabilityLevel::None)
        .with_cleanup_client_attempts(false)
        .with_cleanup_lost_attempts(false)
}

/// An in-memory cluster with one bucket, plus helpers for seeding documents
/// and inspecting the transactional state the engine leaves on them.
///
/// Inspection helpers go straight to the KV layer with `access_deleted`
/// lookups, so they see staged xattr blocks and tombstones the engine hides
/// from application reads.
pub struct TestCluster {
    cluster: Arc<MemoryCluster>,
    keyspace: KeySpace,
}

impl TestCluster {
    /// A fresh cluster with a bucket named `main`.
    pub fn new() -> Self {
        init_logging();
        let cluster = Arc::new(MemoryCluster::new());
        cluster.open_bucket("main");
        TestCluster {
            cluster,
            keyspace: KeySpace::default_for_bucket("main"),
        }
    }

    /// The underlying cluster.
    pub fn cluster(&self) -> &Arc<MemoryCluster> {
        &self.cluster
    }

    /// The cluster as a provider for engine construction.
    pub fn provider(&self) -> Arc<dyn BucketProvider> {
        self.cluster.clone()
    }

    /// The default keyspace (`main._default._default`).
    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    /// Advance the cluster's logical clock.
    pub fn advance(&self, duration: Duration) {
        self.cluster.clock().advance(duration);
    }

    /// An engine over this cluster with [`fast_config`].
    pub fn engine(&self) -> Transactions {
        self.engine_with(fast_config())
    }

    /// An engine over this cluster with the given configuration.
    pub fn engine_with(&self, config: TransactionsConfig) -> Transactions {
        Transactions::new(self.provider(), config).expect("engine config invalid")
    }

    fn client(&self) -> Arc<dyn KvClient> {
        self.cluster
            .bucket(&self.keyspace.bucket)
            .expect("bucket missing")
    }

    /// Create a document outside any transaction.
    pub fn seed(&self, key: &str, value: &Value) -> Cas {
        self.client()
            .add(StoreOptions {
                keyspace: self.keyspace.clone(),
                key: key.to_string(),
                value: serde_json::to_vec(value).expect("seed value not JSON"),
                cas: Cas::ZERO,
                durability: DurabilityLevel::None,
                deadline: None,
            })
            .expect("seed failed")
            .cas
    }

    /// Delete a document outside any transaction.
    pub fn purge(&self, key: &str) {
        self.client()
            .delete(DeleteOptions {
                keyspace: self.keyspace.clone(),
                key: key.to_string(),
                cas: Cas::ZERO,
                durability: DurabilityLevel::None,
                deadline: None,
            })
            .expect("purge failed");
    }

    /// The committed body of a live document, or `None` if absent.
    pub fn body(&self, key: &str) -> Option<Value> {
        match self.client().get(GetOptions {
            keyspace: self.keyspace.clone(),
            key: key.to_string(),
            deadline: None,
        }) {
            Ok(result) => Some(serde_json::from_slice(&result.value).expect("body not JSON")),
            Err(KvError::DocumentNotFound) => None,
            Err(err) => panic!("get failed: {err}"),
        }
    }

    /// Whether a live document exists.
    pub fn exists(&self, key: &str) -> bool {
        self.body(key).is_some()
    }

    fn xattr(&self, keyspace: &KeySpace, key: &str, path: &str) -> Option<Value> {
        let result = match self.client().lookup_in(LookupInOptions {
            keyspace: keyspace.clone(),
            key: key.to_string(),
            ops: vec![LookupInOp::xattr(path)],
            access_deleted: true,
            deadline: None,
        }) {
            Ok(result) => result,
            Err(KvError::DocumentNotFound) => return None,
            Err(err) => panic!("lookup failed: {err}"),
        };
        result.content(0).expect("xattr not JSON")
    }

    /// The hidden `txn` xattr block on a document (live or tombstone), or
    /// `None` if the document carries no staged state.
    pub fn txn_block(&self, key: &str) -> Option<Value> {
        self.xattr(&self.keyspace, key, paths::ROOT)
    }

    /// The staged body inside a document's `txn` block.
    pub fn staged_value(&self, key: &str) -> Option<Value> {
        self.xattr(&self.keyspace, key, paths::STAGED)
    }

    /// The full `attempts` map on an ATR document, or `None` if the ATR does
    /// not exist.
    pub fn atr_attempts(&self, atr: &AtrLocation) -> Option<Value> {
        self.xattr(&atr.keyspace, &atr.key, txnkv_protocol::atr::ATTEMPTS_PATH)
    }

    /// Whether the document exists only as a tombstone.
    pub fn is_tombstone(&self, key: &str) -> bool {
        if self.exists(key) {
            return false;
        }
        match self.client().lookup_in(LookupInOptions {
            keyspace: self.keyspace.clone(),
            key: key.to_string(),
            ops: vec![LookupInOp::xattr(paths::ROOT)],
            access_deleted: true,
            deadline: None,
        }) {
            Ok(result) => result.is_deleted,
            Err(KvError::DocumentNotFound) => false,
            Err(err) => panic!("lookup failed: {err}"),
        }
    }

    /// One attempt's entry in an ATR document, or `None` if absent.
    pub fn atr_entry(&self, atr: &AtrLocation, attempt_id: &str) -> Option<Value> {
        self.xattr(&atr.keyspace, &atr.key, &attempt_path(attempt_id))
    }

    /// The lost-cleanup client record's `records` xattr, or `None` if no
    /// record exists.
    pub fn client_record(&self) -> Option<Value> {
        self.xattr(
            &self.keyspace,
            txnkv_protocol::client_record::CLIENT_RECORD_KEY,
            txnkv_protocol::client_record::RECORDS_PATH,
        )
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        TestCluster::new()
    }
}
