//! Test/observability hooks.
//!
//! Three hook sets bracket every externally-visible step the engine takes:
//! attempt-level operations, regular-cleanup operations, and client-record
//! operations. Every hook is an identity no-op by default; test suites
//! install implementations that inject [`KvError`]s at precise points.
//! Production code paths behave identically whether or not hooks are
//! installed; a hook error is classified exactly like a KV error from the
//! same step.

use txnkv_kv::KvResult;

/// Stage names passed to [`TransactionHooks::has_expired`].
pub mod stages {
    /// Writing the ATR pending entry.
    pub const ATR_PENDING: &str = "atrPending";
    /// Writing the ATR committed transition.
    pub const ATR_COMMIT: &str = "atrCommit";
    /// Re-reading the ATR entry to resolve an ambiguous commit.
    pub const ATR_COMMIT_AMBIGUITY_RESOLUTION: &str = "atrCommitAmbiguityResolution";
    /// Deleting the ATR entry after commit.
    pub const ATR_COMPLETE: &str = "atrComplete";
    /// Writing the ATR aborted transition.
    pub const ATR_ABORT: &str = "atrAbort";
    /// Deleting the ATR entry after rollback.
    pub const ATR_ROLLBACK: &str = "atrRollbackComplete";
    /// A MAV read.
    pub const GET: &str = "get";
    /// Staging an insert.
    pub const INSERT: &str = "insert";
    /// Staging a replace.
    pub const REPLACE: &str = "replace";
    /// Staging a remove.
    pub const REMOVE: &str = "remove";
    /// Unstaging a document during commit.
    pub const COMMIT_DOC: &str = "commitDoc";
    /// Unstaging a document during rollback.
    pub const ROLLBACK_DOC: &str = "rollbackDoc";
}

/// Hooks bracketing attempt-level operations.
#[allow(missing_docs)]
pub trait TransactionHooks: Send + Sync {
    fn before_atr_pending(&self) -> KvResult<()> {
        Ok(())
    }
    fn after_atr_pending(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_atr_committed(&self) -> KvResult<()> {
        Ok(())
    }
    fn after_atr_committed(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_atr_commit_ambiguity_resolution(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_atr_complete(&self) -> KvResult<()> {
        Ok(())
    }
    fn after_atr_complete(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_atr_aborted(&self) -> KvResult<()> {
        Ok(())
    }
    fn after_atr_aborted(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_atr_rolled_back(&self) -> KvResult<()> {
        Ok(())
    }
    fn after_atr_rolled_back(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_doc_get(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_staged_insert(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn after_staged_insert(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_staged_replace(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn after_staged_replace(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_staged_remove(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn after_staged_remove(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_doc_committed(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn after_doc_committed(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_doc_rolled_back(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn after_doc_rolled_back(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }

    /// Force an expiry verdict at a named stage. Returning `true` marks the
    /// attempt expired exactly as if its time budget had lapsed.
    fn has_expired(&self, _stage: &str, _key: Option<&str>) -> bool {
        false
    }

    /// Override ATR index selection.
    fn random_atr_index(&self) -> Option<usize> {
        None
    }
}

/// Hooks bracketing regular-cleanup operations.
#[allow(missing_docs)]
pub trait CleanupHooks: Send + Sync {
    fn before_atr_get(&self, _atr_key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_doc_get(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_commit_doc(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_remove_links(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_remove_doc(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_remove_doc_staged_for_removal(&self, _key: &str) -> KvResult<()> {
        Ok(())
    }
    fn before_atr_remove(&self, _atr_key: &str) -> KvResult<()> {
        Ok(())
    }
}

/// Hooks bracketing client-record operations.
#[allow(missing_docs)]
pub trait ClientRecordHooks: Send + Sync {
    fn before_create_record(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_get_record(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_update_record(&self) -> KvResult<()> {
        Ok(())
    }
    fn before_remove_client(&self) -> KvResult<()> {
        Ok(())
    }
}

/// The default no-op implementation of all three hook sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl TransactionHooks for DefaultHooks {}
impl CleanupHooks for DefaultHooks {}
impl ClientRecordHooks for DefaultHooks {}
