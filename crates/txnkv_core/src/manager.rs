//! The engine entry point.
//!
//! [`Transactions`] owns the cleanup machinery and hands out
//! [`Transaction`] handles; a transaction hands out [`Attempt`]s, one per
//! try, all sharing the transaction's time budget.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use txnkv_kv::{BucketProvider, Cas, DurabilityLevel, KeySpace};
use txnkv_protocol::{SerializedAttempt, StagedOpType};

use crate::attempt::{Attempt, AttemptParams, AtrLocation, StagedMutation};
use crate::cleanup::Cleaner;
use crate::config::{PerTransactionConfig, TransactionsConfig};
use crate::error::{TxnError, TxnResult};
use crate::hooks::TransactionHooks;
use crate::lost::LostCleaner;

/// The transactions engine.
///
/// One per process per cluster, typically. Starting it spins up the regular
/// cleanup queue and, when enabled, the lost-cleanup scanner; both stop on
/// [`Transactions::close`] (or drop).
pub struct Transactions {
    config: TransactionsConfig,
    provider: Arc<dyn BucketProvider>,
    cleaner: Option<Arc<Cleaner>>,
    lost: Option<Arc<LostCleaner>>,
    closed: AtomicBool,
}

impl Transactions {
    /// Start the engine against the given cluster.
    pub fn new(
        provider: Arc<dyn BucketProvider>,
        config: TransactionsConfig,
    ) -> TxnResult<Transactions> {
        config.validate()?;
        // Lost cleanup feeds finished requests through the regular cleaner,
        // so either flag needs one running.
        let cleaner = if config.cleanup_client_attempts || config.cleanup_lost_attempts {
            Some(Cleaner::start(
                provider.clone(),
                config.cleanup_hooks.clone(),
                config.kv_timeout,
                config.cleanup_queue_size,
            ))
        } else {
            None
        };
        let lost = match (&cleaner, config.cleanup_lost_attempts) {
            (Some(cleaner), true) => Some(LostCleaner::start(
                provider.clone(),
                cleaner.clone(),
                config.cleanup_hooks.clone(),
                config.client_record_hooks.clone(),
                config.kv_timeout,
                config.cleanup_window,
                config.num_atrs,
                config.durability,
                config.cleanup_locations.clone(),
            )),
            _ => None,
        };
        Ok(Transactions {
            config,
            provider,
            cleaner,
            lost,
            closed: AtomicBool::new(false),
        })
    }

    /// Begin a transaction, optionally overriding engine settings for it.
    pub fn begin_transaction(&self, per_config: Option<PerTransactionConfig>) -> Transaction {
        let per_config = per_config.unwrap_or_default();
        let expiration_time = per_config
            .expiration_time
            .unwrap_or(self.config.expiration_time);
        Transaction {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            expiry_time: Instant::now() + expiration_time,
            durability: per_config.durability.unwrap_or(self.config.durability),
            kv_timeout: self.config.kv_timeout,
            num_atrs: self.config.num_atrs,
            custom_atr_location: per_config
                .custom_atr_location
                .or_else(|| self.config.custom_atr_location.clone()),
            provider: self.provider.clone(),
            hooks: self.config.hooks.clone(),
            cleaner: self
                .config
                .cleanup_client_attempts
                .then(|| self.cleaner.clone())
                .flatten(),
            lost: self.lost.clone(),
            attempt: Mutex::new(None),
        }
    }

    /// Run every queued cleanup request now, on the calling thread.
    pub fn force_cleanup_queue(&self) {
        if let Some(cleaner) = &self.cleaner {
            cleaner.force_drain();
        }
    }

    /// Number of cleanup requests currently queued.
    pub fn cleanup_queue_length(&self) -> usize {
        self.cleaner
            .as_ref()
            .map(|cleaner| cleaner.queue_length())
            .unwrap_or(0)
    }

    /// The regular cleaner, when one is running.
    pub fn cleaner(&self) -> Option<&Arc<Cleaner>> {
        self.cleaner.as_ref()
    }

    /// The lost-cleanup scanner, when one is running.
    pub fn lost_cleaner(&self) -> Option<&Arc<LostCleaner>> {
        self.lost.as_ref()
    }

    /// Keyspaces lost cleanup is monitoring.
    pub fn cleanup_locations(&self) -> Vec<KeySpace> {
        self.lost
            .as_ref()
            .map(|lost| lost.locations())
            .unwrap_or_default()
    }

    /// Stop the cleanup machinery. Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The lost scanner pushes into the cleaner, so it stops first.
        if let Some(lost) = &self.lost {
            lost.close();
        }
        if let Some(cleaner) = &self.cleaner {
            cleaner.close();
        }
    }
}

impl Drop for Transactions {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Transactions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transactions")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// One logical transaction.
///
/// Holds the identity and time budget shared by every attempt of the
/// transaction; retries create fresh attempts against the same budget.
pub struct Transaction {
    transaction_id: String,
    expiry_time: Instant,
    durability: DurabilityLevel,
    kv_timeout: Duration,
    num_atrs: usize,
    custom_atr_location: Option<KeySpace>,
    provider: Arc<dyn BucketProvider>,
    hooks: Arc<dyn TransactionHooks>,
    cleaner: Option<Arc<Cleaner>>,
    lost: Option<Arc<LostCleaner>>,
    attempt: Mutex<Option<Arc<Attempt>>>,
}

impl Transaction {
    /// The transaction's ID.
    pub fn id(&self) -> &str {
        &self.transaction_id
    }

    /// The attempt most recently created or resumed, if any.
    pub fn attempt(&self) -> Option<Arc<Attempt>> {
        self.attempt.lock().clone()
    }

    /// Start a fresh attempt.
    pub fn new_attempt(&self) -> Arc<Attempt> {
        let attempt = Arc::new(Attempt::new(AttemptParams {
            transaction_id: self.transaction_id.clone(),
            attempt_id: uuid::Uuid::new_v4().to_string(),
            expiry_time: self.expiry_time,
            durability: self.durability,
            kv_timeout: self.kv_timeout,
            num_atrs: self.num_atrs,
            custom_atr_location: self.custom_atr_location.clone(),
            provider: self.provider.clone(),
            hooks: self.hooks.clone(),
            cleaner: self.cleaner.clone(),
            lost: self.lost.clone(),
        }));
        *self.attempt.lock() = Some(attempt.clone());
        attempt
    }

    /// Resume an attempt serialized elsewhere with [`Attempt::serialize`].
    ///
    /// The envelope's identity, remaining time budget, and configuration
    /// take precedence over this transaction's own. Staged bodies are not
    /// carried in the envelope; commit re-fetches them from the staged
    /// documents.
    pub fn resume_attempt(&self, data: &[u8]) -> TxnResult<Arc<Attempt>> {
        let envelope: SerializedAttempt = serde_json::from_slice(data)
            .map_err(|err| TxnError::Serialization(err.to_string()))?;
        let kv_timeout = envelope
            .config
            .kv_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.kv_timeout);
        let durability = envelope
            .config
            .durability
            .as_deref()
            .map(DurabilityLevel::from_shorthand)
            .unwrap_or(self.durability);
        let atr = match (
            envelope.atr.bucket,
            envelope.atr.scope,
            envelope.atr.collection,
            envelope.atr.key,
        ) {
            (Some(bucket), Some(scope), Some(collection), Some(key)) => Some(AtrLocation {
                keyspace: KeySpace::new(bucket, scope, collection),
                key,
            }),
            _ => None,
        };
        let mut staged = Vec::with_capacity(envelope.mutations.len());
        for mutation in envelope.mutations {
            let op_type = match mutation.op_type.as_str() {
                "insert" => StagedOpType::Insert,
                "replace" => StagedOpType::Replace,
                "remove" => StagedOpType::Remove,
                other => {
                    return Err(TxnError::Serialization(format!(
                        "unknown staged operation type {other:?}"
                    )))
                }
            };
            let cas = Cas::from_hex(&mutation.cas).ok_or_else(|| {
                TxnError::Serialization(format!("bad staged CAS {:?}", mutation.cas))
            })?;
            staged.push(StagedMutation {
                op_type,
                keyspace: KeySpace::new(mutation.bucket, mutation.scope, mutation.collection),
                key: mutation.key,
                cas,
                restore_cas: None,
                staged_value: None,
            });
        }
        let attempt = Arc::new(Attempt::new(AttemptParams {
            transaction_id: envelope.id.transaction_id,
            attempt_id: envelope.id.attempt_id,
            expiry_time: Instant::now() + Duration::from_millis(envelope.state.time_left_ms),
            durability,
            kv_timeout,
            num_atrs: envelope.config.num_atrs.unwrap_or(self.num_atrs),
            custom_atr_location: self.custom_atr_location.clone(),
            provider: self.provider.clone(),
            hooks: self.hooks.clone(),
            cleaner: self.cleaner.clone(),
            lost: self.lost.clone(),
        }));
        attempt.restore(atr, staged);
        *self.attempt.lock() = Some(attempt.clone());
        Ok(attempt)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("transaction_id", &self.transaction_id)
            .field("durability", &self.durability)
            .field("num_atrs", &self.num_atrs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txnkv_kv::MemoryCluster;

    fn engine() -> Transactions {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.open_bucket("main");
        let config = TransactionsConfig::new()
            .with_cleanup_client_attempts(false)
            .with_cleanup_lost_attempts(false);
        Transactions::new(cluster, config).unwrap()
    }

    #[test]
    fn invalid_config_rejected() {
        let cluster = Arc::new(MemoryCluster::new());
        let config = TransactionsConfig::new().with_expiration_time(Duration::ZERO);
        assert!(matches!(
            Transactions::new(cluster, config),
            Err(TxnError::Config(_))
        ));
    }

    #[test]
    fn attempts_share_the_transaction_identity() {
        let engine = engine();
        let txn = engine.begin_transaction(None);
        let first = txn.new_attempt();
        let second = txn.new_attempt();
        assert_eq!(first.transaction_id(), txn.id());
        assert_eq!(second.transaction_id(), txn.id());
        assert_ne!(first.id(), second.id());
        assert_eq!(txn.attempt().unwrap().id(), second.id());
    }

    #[test]
    fn per_transaction_overrides_apply() {
        let engine = engine();
        let txn = engine.begin_transaction(Some(
            PerTransactionConfig::new()
                .with_durability(DurabilityLevel::None)
                .with_custom_atr_location(KeySpace::default_for_bucket("meta")),
        ));
        let attempt = txn.new_attempt();
        assert_eq!(attempt.durability(), DurabilityLevel::None);
        assert_eq!(
            attempt.custom_atr_location(),
            Some(&KeySpace::default_for_bucket("meta"))
        );
    }

    #[test]
    fn resume_rejects_garbage() {
        let engine = engine();
        let txn = engine.begin_transaction(None);
        assert!(matches!(
            txn.resume_attempt(b"not json"),
            Err(TxnError::Serialization(_))
        ));
    }

    #[test]
    fn resume_restores_staged_mutations() {
        let engine = engine();
        let txn = engine.begin_transaction(None);
        let resumed = txn
            .resume_attempt(
                br#"{
                    "id": {"txn": "t-1", "atmpt": "a-1"},
                    "atr": {"bkt": "main", "scp": "_default",
                            "coll": "_default", "id": "_txn:atr-7"},
                    "config": {"kvTimeoutMs": 1000, "numAtrs": 64,
                               "durabilityLevel": "n"},
                    "state": {"timeLeftMs": 5000},
                    "mutations": [{"bkt": "main", "scp": "_default",
                                   "coll": "_default", "id": "doc-1",
                                   "cas": "0x0000000000000010",
                                   "type": "replace"}]
                }"#,
            )
            .unwrap();
        assert_eq!(resumed.transaction_id(), "t-1");
        assert_eq!(resumed.id(), "a-1");
        assert_eq!(resumed.durability(), DurabilityLevel::None);
        assert_eq!(resumed.num_atrs(), 64);
        let atr = resumed.atr_location().unwrap();
        assert_eq!(atr.key, "_txn:atr-7");
        assert_eq!(atr.keyspace, KeySpace::default_for_bucket("main"));
        assert_eq!(resumed.state(), crate::attempt::AttemptState::Pending);
    }

    #[test]
    fn cleanup_accessors_inert_when_disabled() {
        let engine = engine();
        assert_eq!(engine.cleanup_queue_length(), 0);
        assert!(engine.cleanup_locations().is_empty());
        engine.force_cleanup_queue();
        engine.close();
        engine.close();
    }
}
