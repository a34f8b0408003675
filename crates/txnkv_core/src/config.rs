//! Configuration for the transactions engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use txnkv_kv::{DurabilityLevel, KeySpace};
use txnkv_protocol::DEFAULT_NUM_ATRS;

use crate::error::TxnError;
use crate::hooks::{CleanupHooks, ClientRecordHooks, DefaultHooks, TransactionHooks};

/// Default attempt time budget.
pub const DEFAULT_EXPIRATION_TIME: Duration = Duration::from_secs(15);
/// Default per-operation KV timeout.
pub const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2_500);
/// Default lost-cleanup window.
pub const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_secs(60);
/// Default regular-cleanup queue capacity.
pub const DEFAULT_CLEANUP_QUEUE_SIZE: usize = 10_000;

/// Engine-wide configuration.
///
/// Built with `with_*` methods from [`TransactionsConfig::new`] and
/// validated when handed to [`crate::Transactions::new`].
#[derive(Clone)]
pub struct TransactionsConfig {
    /// Attempt time budget.
    pub expiration_time: Duration,
    /// Durability level for every transactional mutation.
    pub durability: DurabilityLevel,
    /// Per-operation KV timeout.
    pub kv_timeout: Duration,
    /// Number of ATR documents per collection.
    pub num_atrs: usize,
    /// Place every ATR in this keyspace instead of alongside the first
    /// written document.
    pub custom_atr_location: Option<KeySpace>,
    /// Run the regular cleanup queue for this client's own attempts.
    pub cleanup_client_attempts: bool,
    /// Run lost-transaction cleanup.
    pub cleanup_lost_attempts: bool,
    /// Target scan interval of one full pass over this client's ATR shards.
    pub cleanup_window: Duration,
    /// Capacity of the regular cleanup queue.
    pub cleanup_queue_size: usize,
    /// Keyspaces lost cleanup monitors from startup. Keyspaces that host an
    /// ATR of a live attempt are added automatically.
    pub cleanup_locations: Vec<KeySpace>,
    /// Attempt-level hooks.
    pub hooks: Arc<dyn TransactionHooks>,
    /// Regular-cleanup hooks.
    pub cleanup_hooks: Arc<dyn CleanupHooks>,
    /// Client-record hooks.
    pub client_record_hooks: Arc<dyn ClientRecordHooks>,
}

impl TransactionsConfig {
    /// Configuration with production defaults and no-op hooks.
    pub fn new() -> Self {
        TransactionsConfig {
            expiration_time: DEFAULT_EXPIRATION_TIME,
            durability: DurabilityLevel::Majority,
            kv_timeout: DEFAULT_KV_TIMEOUT,
            num_atrs: DEFAULT_NUM_ATRS,
            custom_atr_location: None,
            cleanup_client_attempts: true,
            cleanup_lost_attempts: true,
            cleanup_window: DEFAULT_CLEANUP_WINDOW,
            cleanup_queue_size: DEFAULT_CLEANUP_QUEUE_SIZE,
            cleanup_locations: Vec::new(),
            hooks: Arc::new(DefaultHooks),
            cleanup_hooks: Arc::new(DefaultHooks),
            client_record_hooks: Arc::new(DefaultHooks),
        }
    }

    /// Set the attempt time budget.
    pub fn with_expiration_time(mut self, expiration_time: Duration) -> Self {
        self.expiration_time = expiration_time;
        self
    }

    /// Set the durability level.
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    /// Set the per-operation KV timeout.
    pub fn with_kv_timeout(mut self, kv_timeout: Duration) -> Self {
        self.kv_timeout = kv_timeout;
        self
    }

    /// Set the number of ATRs per collection.
    pub fn with_num_atrs(mut self, num_atrs: usize) -> Self {
        self.num_atrs = num_atrs;
        self
    }

    /// Pin all ATRs to one keyspace.
    pub fn with_custom_atr_location(mut self, keyspace: KeySpace) -> Self {
        self.custom_atr_location = Some(keyspace);
        self
    }

    /// Enable or disable the regular cleanup queue.
    pub fn with_cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_client_attempts = enabled;
        self
    }

    /// Enable or disable lost-transaction cleanup.
    pub fn with_cleanup_lost_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_lost_attempts = enabled;
        self
    }

    /// Set the lost-cleanup window.
    pub fn with_cleanup_window(mut self, window: Duration) -> Self {
        self.cleanup_window = window;
        self
    }

    /// Set the regular-cleanup queue capacity.
    pub fn with_cleanup_queue_size(mut self, size: usize) -> Self {
        self.cleanup_queue_size = size;
        self
    }

    /// Monitor a keyspace from startup.
    pub fn with_cleanup_location(mut self, keyspace: KeySpace) -> Self {
        self.cleanup_locations.push(keyspace);
        self
    }

    /// Install attempt-level hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn TransactionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Install regular-cleanup hooks.
    pub fn with_cleanup_hooks(mut self, hooks: Arc<dyn CleanupHooks>) -> Self {
        self.cleanup_hooks = hooks;
        self
    }

    /// Install client-record hooks.
    pub fn with_client_record_hooks(mut self, hooks: Arc<dyn ClientRecordHooks>) -> Self {
        self.client_record_hooks = hooks;
        self
    }

    /// Check the configuration for nonsense values.
    pub fn validate(&self) -> Result<(), TxnError> {
        if self.expiration_time.is_zero() {
            return Err(TxnError::Config(
                "expiration_time must be non-zero".to_string(),
            ));
        }
        if self.kv_timeout.is_zero() {
            return Err(TxnError::Config("kv_timeout must be non-zero".to_string()));
        }
        if self.num_atrs == 0 || self.num_atrs > DEFAULT_NUM_ATRS {
            return Err(TxnError::Config(format!(
                "num_atrs must be in 1..={DEFAULT_NUM_ATRS}, got {}",
                self.num_atrs
            )));
        }
        if self.cleanup_window.is_zero() {
            return Err(TxnError::Config(
                "cleanup_window must be non-zero".to_string(),
            ));
        }
        if self.cleanup_queue_size == 0 {
            return Err(TxnError::Config(
                "cleanup_queue_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        TransactionsConfig::new()
    }
}

impl fmt::Debug for TransactionsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionsConfig")
            .field("expiration_time", &self.expiration_time)
            .field("durability", &self.durability)
            .field("kv_timeout", &self.kv_timeout)
            .field("num_atrs", &self.num_atrs)
            .field("custom_atr_location", &self.custom_atr_location)
            .field("cleanup_client_attempts", &self.cleanup_client_attempts)
            .field("cleanup_lost_attempts", &self.cleanup_lost_attempts)
            .field("cleanup_window", &self.cleanup_window)
            .field("cleanup_queue_size", &self.cleanup_queue_size)
            .field("cleanup_locations", &self.cleanup_locations)
            .finish_non_exhaustive()
    }
}

/// Overrides applied to a single transaction.
#[derive(Debug, Clone, Default)]
pub struct PerTransactionConfig {
    /// Override the attempt time budget.
    pub expiration_time: Option<Duration>,
    /// Override the durability level.
    pub durability: Option<DurabilityLevel>,
    /// Override the ATR placement.
    pub custom_atr_location: Option<KeySpace>,
}

impl PerTransactionConfig {
    /// No overrides.
    pub fn new() -> Self {
        PerTransactionConfig::default()
    }

    /// Override the time budget.
    pub fn with_expiration_time(mut self, expiration_time: Duration) -> Self {
        self.expiration_time = Some(expiration_time);
        self
    }

    /// Override the durability level.
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = Some(durability);
        self
    }

    /// Override the ATR placement.
    pub fn with_custom_atr_location(mut self, keyspace: KeySpace) -> Self {
        self.custom_atr_location = Some(keyspace);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(TransactionsConfig::new().validate().is_ok());
    }

    #[test]
    fn zero_expiration_rejected() {
        let config = TransactionsConfig::new().with_expiration_time(Duration::ZERO);
        assert!(matches!(config.validate(), Err(TxnError::Config(_))));
    }

    #[test]
    fn oversized_atr_pool_rejected() {
        let config = TransactionsConfig::new().with_num_atrs(4096);
        assert!(matches!(config.validate(), Err(TxnError::Config(_))));
        let config = TransactionsConfig::new().with_num_atrs(0);
        assert!(matches!(config.validate(), Err(TxnError::Config(_))));
    }

    #[test]
    fn builders_apply() {
        let ks = KeySpace::default_for_bucket("meta");
        let config = TransactionsConfig::new()
            .with_durability(DurabilityLevel::None)
            .with_num_atrs(64)
            .with_custom_atr_location(ks.clone())
            .with_cleanup_location(ks.clone());
        assert_eq!(config.durability, DurabilityLevel::None);
        assert_eq!(config.num_atrs, 64);
        assert_eq!(config.custom_atr_location, Some(ks.clone()));
        assert_eq!(config.cleanup_locations, vec![ks]);
    }
}
