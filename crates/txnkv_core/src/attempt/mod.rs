//! One attempt of one transaction.
//!
//! An [`Attempt`] owns the staged-mutation list, the ATR entry lifecycle,
//! and the expiry budget for a single try at a transaction's logic. A
//! failed attempt (when its failure permits retry) is discarded and the
//! transaction creates a fresh one with a new attempt ID.
//!
//! Concurrency follows a drain-then-lock discipline: per-document
//! operations run concurrently, counted in and out; commit, rollback, and
//! serialize first mark the attempt draining (rejecting new operations)
//! and wait for the in-flight count to reach zero.

mod atr;
mod commit;
mod mutations;
mod read;
mod rollback;
mod serialize;
mod staging;
mod state;

pub use mutations::StagedMutation;
pub use state::{AtrLocation, AttemptState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use txnkv_kv::{BucketProvider, Cas, DurabilityLevel, KeySpace, KvClient, KvError, ResourceUnits};

use crate::cleanup::Cleaner;
use crate::error::{ErrorCause, Failure, FailureReason};
use crate::hooks::TransactionHooks;
use crate::lost::LostCleaner;

/// Backoff between retries of ATR and unstage mutations.
pub(crate) const RETRY_BACKOFF: Duration = Duration::from_millis(3);

/// Total budget of a write-write conflict poll.
pub(crate) const WRITE_WRITE_POLL_BUDGET: Duration = Duration::from_secs(1);

/// Interval between write-write conflict polls.
pub(crate) const WRITE_WRITE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A document read through the attempt, used as the input to `replace` and
/// `remove`.
#[derive(Debug, Clone)]
pub struct TxnGetResult {
    /// Keyspace of the document.
    pub keyspace: KeySpace,
    /// Document key.
    pub key: String,
    /// CAS the attempt observed or produced for the document.
    pub cas: Cas,
    /// The document body visible to this attempt.
    pub value: Vec<u8>,
}

pub(crate) struct AttemptInner {
    pub state: AttemptState,
    pub staged: Vec<StagedMutation>,
    pub atr: Option<AtrLocation>,
    pub ops_in_flight: usize,
    pub draining: bool,
    pub atr_initialising: bool,
    pub should_not_commit: bool,
    pub should_not_rollback: bool,
    pub should_not_retry: bool,
}

/// Everything the manager wires into a new attempt.
pub(crate) struct AttemptParams {
    pub transaction_id: String,
    pub attempt_id: String,
    pub expiry_time: Instant,
    pub durability: DurabilityLevel,
    pub kv_timeout: Duration,
    pub num_atrs: usize,
    pub custom_atr_location: Option<KeySpace>,
    pub provider: Arc<dyn BucketProvider>,
    pub hooks: Arc<dyn TransactionHooks>,
    pub cleaner: Option<Arc<Cleaner>>,
    pub lost: Option<Arc<LostCleaner>>,
}

/// One attempt of one transaction.
pub struct Attempt {
    transaction_id: String,
    attempt_id: String,
    expiry_time: Instant,
    durability: DurabilityLevel,
    kv_timeout: Duration,
    num_atrs: usize,
    custom_atr_location: Option<KeySpace>,
    provider: Arc<dyn BucketProvider>,
    hooks: Arc<dyn TransactionHooks>,
    cleaner: Option<Arc<Cleaner>>,
    lost: Option<Arc<LostCleaner>>,
    inner: Mutex<AttemptInner>,
    cv: Condvar,
    expired: AtomicBool,
    overtime: AtomicBool,
    units: Mutex<ResourceUnits>,
}

impl Attempt {
    pub(crate) fn new(params: AttemptParams) -> Self {
        Attempt {
            transaction_id: params.transaction_id,
            attempt_id: params.attempt_id,
            expiry_time: params.expiry_time,
            durability: params.durability,
            kv_timeout: params.kv_timeout,
            num_atrs: params.num_atrs,
            custom_atr_location: params.custom_atr_location,
            provider: params.provider,
            hooks: params.hooks,
            cleaner: params.cleaner,
            lost: params.lost,
            inner: Mutex::new(AttemptInner {
                state: AttemptState::NothingWritten,
                staged: Vec::new(),
                atr: None,
                ops_in_flight: 0,
                draining: false,
                atr_initialising: false,
                should_not_commit: false,
                should_not_rollback: false,
                should_not_retry: false,
            }),
            cv: Condvar::new(),
            expired: AtomicBool::new(false),
            overtime: AtomicBool::new(false),
            units: Mutex::new(ResourceUnits::default()),
        }
    }

    /// Restore lifecycle fields when resuming a serialized attempt.
    pub(crate) fn restore(&self, atr: Option<AtrLocation>, staged: Vec<StagedMutation>) {
        let mut inner = self.inner.lock();
        if atr.is_some() {
            inner.state = AttemptState::Pending;
        }
        inner.atr = atr;
        inner.staged = staged;
    }

    /// The owning transaction's ID.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// This attempt's ID.
    pub fn id(&self) -> &str {
        &self.attempt_id
    }

    /// The attempt's current state.
    pub fn state(&self) -> AttemptState {
        self.inner.lock().state
    }

    /// Where the attempt's ATR entry lives, once one has been selected.
    pub fn atr_location(&self) -> Option<AtrLocation> {
        self.inner.lock().atr.clone()
    }

    /// Whether the attempt's time budget is exhausted. Sticky: once true,
    /// always true.
    pub fn has_expired(&self) -> bool {
        if self.expired.load(Ordering::SeqCst) {
            return true;
        }
        if Instant::now() >= self.expiry_time {
            self.expired.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub(crate) fn expiry_time(&self) -> Instant {
        self.expiry_time
    }

    pub(crate) fn durability(&self) -> DurabilityLevel {
        self.durability
    }

    pub(crate) fn num_atrs(&self) -> usize {
        self.num_atrs
    }

    pub(crate) fn custom_atr_location(&self) -> Option<&KeySpace> {
        self.custom_atr_location.as_ref()
    }

    pub(crate) fn kv_timeout(&self) -> Duration {
        self.kv_timeout
    }

    pub(crate) fn hooks(&self) -> &dyn TransactionHooks {
        &*self.hooks
    }

    pub(crate) fn provider(&self) -> &Arc<dyn BucketProvider> {
        &self.provider
    }

    pub(crate) fn cleaner(&self) -> Option<&Arc<Cleaner>> {
        self.cleaner.as_ref()
    }

    pub(crate) fn lost_cleaner(&self) -> Option<&Arc<LostCleaner>> {
        self.lost.as_ref()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.kv_timeout)
    }

    pub(crate) fn client_for(&self, keyspace: &KeySpace) -> Result<Arc<dyn KvClient>, Failure> {
        self.provider
            .bucket(&keyspace.bucket)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)).no_retry())
    }

    /// Serialize a value as JSON bytes for a sub-document op.
    pub(crate) fn json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, Failure> {
        serde_json::to_vec(value)
            .map_err(|err| Failure::new(ErrorCause::Kv(KvError::encoding(err))).no_retry())
    }

    /// Check the expiry budget at a named stage.
    ///
    /// `proceed_in_overtime` permits work that must finish even after
    /// expiry (the rollback path and post-commit unstaging).
    pub(crate) fn check_expired(
        &self,
        stage: &'static str,
        key: Option<&str>,
        proceed_in_overtime: bool,
    ) -> Result<(), Failure> {
        if proceed_in_overtime && self.overtime.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.has_expired() || self.hooks.has_expired(stage, key) {
            self.expired.store(true, Ordering::SeqCst);
            return Err(Failure::new(ErrorCause::AttemptExpired)
                .no_retry()
                .with_reason(FailureReason::Expired));
        }
        Ok(())
    }

    /// Whether the attempt has entered expiry overtime.
    pub(crate) fn in_overtime(&self) -> bool {
        self.overtime.load(Ordering::SeqCst)
    }

    /// Enter expiry overtime: the budget is gone but the current path must
    /// still run to a safe stopping point.
    pub(crate) fn enter_overtime(&self) {
        self.expired.store(true, Ordering::SeqCst);
        self.overtime.store(true, Ordering::SeqCst);
    }

    /// Count a per-document operation in, rejecting it if the attempt no
    /// longer accepts operations.
    pub(crate) fn begin_op(&self) -> Result<(), Failure> {
        let mut inner = self.inner.lock();
        if inner.draining || !inner.state.accepts_user_ops() {
            return Err(Failure::new(ErrorCause::IllegalState(format!(
                "cannot perform operation on {} attempt",
                inner.state
            )))
            .no_retry());
        }
        if inner.should_not_commit {
            return Err(Failure::new(ErrorCause::PreviousOperationFailed));
        }
        inner.ops_in_flight += 1;
        Ok(())
    }

    /// Count a per-document operation out.
    pub(crate) fn end_op(&self) {
        let mut inner = self.inner.lock();
        inner.ops_in_flight -= 1;
        if inner.ops_in_flight == 0 {
            self.cv.notify_all();
        }
    }

    /// Begin an exclusive transition: reject new operations, wait for
    /// in-flight ones to drain, and return the lock.
    pub(crate) fn drain_and_lock(&self) -> Result<parking_lot::MutexGuard<'_, AttemptInner>, Failure> {
        let mut inner = self.inner.lock();
        if inner.draining {
            return Err(Failure::new(ErrorCause::IllegalState(
                "another commit or rollback is in progress".to_string(),
            ))
            .no_retry());
        }
        inner.draining = true;
        while inner.ops_in_flight > 0 {
            self.cv.wait(&mut inner);
        }
        Ok(inner)
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, AttemptInner> {
        self.inner.lock()
    }

    pub(crate) fn notify(&self) {
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self, guard: &mut parking_lot::MutexGuard<'_, AttemptInner>) {
        self.cv.wait(guard);
    }

    /// Record a failure's restrictions on the attempt and hand it back.
    pub(crate) fn record_failure(&self, failure: Failure) -> Failure {
        let mut inner = self.inner.lock();
        inner.should_not_commit = true;
        if failure.flags.should_not_rollback {
            inner.should_not_rollback = true;
        }
        if failure.flags.should_not_retry {
            inner.should_not_retry = true;
        }
        drop(inner);
        if failure.reason == FailureReason::Expired {
            self.expired.store(true, Ordering::SeqCst);
        }
        failure
    }

    /// Whether the transaction may be retried with a fresh attempt after
    /// this one failed.
    pub fn should_retry(&self) -> bool {
        !self.inner.lock().should_not_retry && !self.has_expired()
    }

    /// Whether the attempt still needs (and permits) a rollback.
    pub fn should_rollback(&self) -> bool {
        let inner = self.inner.lock();
        !inner.should_not_rollback
            && matches!(
                inner.state,
                AttemptState::NothingWritten | AttemptState::Pending | AttemptState::Aborted
            )
    }

    /// Resource units the servers reported for this attempt's operations
    /// since the last call; reading resets the tally.
    pub fn resource_units(&self) -> ResourceUnits {
        std::mem::take(&mut *self.units.lock())
    }

    pub(crate) fn note_units(&self, units: Option<ResourceUnits>) {
        if let Some(units) = units {
            self.units.lock().add(units);
        }
    }
}

impl std::fmt::Debug for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Attempt")
            .field("transaction_id", &self.transaction_id)
            .field("attempt_id", &self.attempt_id)
            .field("state", &inner.state)
            .field("staged", &inner.staged.len())
            .field("atr", &inner.atr)
            .finish_non_exhaustive()
    }
}
