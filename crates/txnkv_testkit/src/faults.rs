//! Programmable fault injection.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use txnkv_core::{CleanupHooks, ClientRecordHooks, TransactionHooks};
use txnkv_kv::{KvError, KvResult};

struct Failpoint {
    error: KvError,
    remaining: usize,
}

#[derive(Default)]
struct State {
    failures: HashMap<String, Failpoint>,
    fired: HashMap<String, usize>,
    expire_at: HashSet<String>,
    atr_index: Option<usize>,
}

/// Hooks that fail the engine at named protocol steps.
///
/// One instance implements all three hook traits, so it can be installed as
/// attempt, cleanup, and client-record hooks at once. Points are named after
/// the hook methods; cleanup points carry a `cleanup.` prefix and
/// client-record points a `record.` prefix, since the traits share method
/// names:
///
/// ```rust
/// use std::sync::Arc;
/// use txnkv_kv::KvError;
/// use txnkv_testkit::FailpointHooks;
///
/// let hooks = Arc::new(FailpointHooks::new());
/// hooks.fail_times("before_staged_insert", KvError::Temporary, 2);
/// hooks.fail("cleanup.before_atr_remove", KvError::Timeout);
/// hooks.expire_at("commitDoc");
/// ```
///
/// Arming happens through shared references, so tests can re-arm mid-run
/// through the same `Arc` they handed the engine.
#[derive(Default)]
pub struct FailpointHooks {
    state: Mutex<State>,
}

impl FailpointHooks {
    /// Hooks with nothing armed.
    pub fn new() -> Self {
        FailpointHooks::default()
    }

    /// Fail every visit to `point` with `error`.
    pub fn fail(&self, point: &str, error: KvError) {
        self.fail_times(point, error, usize::MAX);
    }

    /// Fail the next `times` visits to `point` with `error`, then pass.
    pub fn fail_times(&self, point: &str, error: KvError, times: usize) {
        self.state.lock().failures.insert(
            point.to_string(),
            Failpoint {
                error,
                remaining: times,
            },
        );
    }

    /// Report the attempt as expired whenever `stage` asks.
    ///
    /// Stage names are the constants in `txnkv_core::hooks::stages`.
    pub fn expire_at(&self, stage: &str) {
        self.state.lock().expire_at.insert(stage.to_string());
    }

    /// Pin ATR selection to a fixed index.
    pub fn pin_atr_index(&self, index: usize) {
        self.state.lock().atr_index = Some(index);
    }

    /// How many times `point` has been visited.
    pub fn fired(&self, point: &str) -> usize {
        self.state.lock().fired.get(point).copied().unwrap_or(0)
    }

    fn check(&self, point: &str) -> KvResult<()> {
        let mut state = self.state.lock();
        *state.fired.entry(point.to_string()).or_insert(0) += 1;
        match state.failures.get_mut(point) {
            Some(failpoint) if failpoint.remaining > 0 => {
                failpoint.remaining = failpoint.remaining.saturating_sub(1);
                Err(failpoint.error.clone())
            }
            _ => Ok(()),
        }
    }
}

impl TransactionHooks for FailpointHooks {
    fn before_atr_pending(&self) -> KvResult<()> {
        self.check("before_atr_pending")
    }
    fn after_atr_pending(&self) -> KvResult<()> {
        self.check("after_atr_pending")
    }
    fn before_atr_committed(&self) -> KvResult<()> {
        self.check("before_atr_committed")
    }
    fn after_atr_committed(&self) -> KvResult<()> {
        self.check("after_atr_committed")
    }
    fn before_atr_commit_ambiguity_resolution(&self) -> KvResult<()> {
        self.check("before_atr_commit_ambiguity_resolution")
    }
    fn before_atr_complete(&self) -> KvResult<()> {
        self.check("before_atr_complete")
    }
    fn after_atr_complete(&self) -> KvResult<()> {
        self.check("after_atr_complete")
    }
    fn before_atr_aborted(&self) -> KvResult<()> {
        self.check("before_atr_aborted")
    }
    fn after_atr_aborted(&self) -> KvResult<()> {
        self.check("after_atr_aborted")
    }
    fn before_atr_rolled_back(&self) -> KvResult<()> {
        self.check("before_atr_rolled_back")
    }
    fn after_atr_rolled_back(&self) -> KvResult<()> {
        self.check("after_atr_rolled_back")
    }
    fn before_doc_get(&self, _key: &str) -> KvResult<()> {
        self.check("before_doc_get")
    }
    fn before_staged_insert(&self, _key: &str) -> KvResult<()> {
        self.check("before_staged_insert")
    }
    fn after_staged_insert(&self, _key: &str) -> KvResult<()> {
        self.check("after_staged_insert")
    }
    fn before_staged_replace(&self, _key: &str) -> KvResult<()> {
        self.check("before_staged_replace")
    }
    fn after_staged_replace(&self, _key: &str) -> KvResult<()> {
        self.check("after_staged_replace")
    }
    fn before_staged_remove(&self, _key: &str) -> KvResult<()> {
        self.check("before_staged_remove")
    }
    fn after_staged_remove(&self, _key: &str) -> KvResult<()> {
        self.check("after_staged_remove")
    }
    fn before_doc_committed(&self, _key: &str) -> KvResult<()> {
        self.check("before_doc_committed")
    }
    fn after_doc_committed(&self, _key: &str) -> KvResult<()> {
        self.check("after_doc_committed")
    }
    fn before_doc_rolled_back(&self, _key: &str) -> KvResult<()> {
        self.check("before_doc_rolled_back")
    }
    fn after_doc_rolled_back(&self, _key: &str) -> KvResult<()> {
        self.check("after_doc_rolled_back")
    }

    fn has_expired(&self, stage: &str, _key: Option<&str>) -> bool {
        self.state.lock().expire_at.contains(stage)
    }

    fn random_atr_index(&self) -> Option<usize> {
        self.state.lock().atr_index
    }
}

impl CleanupHooks for FailpointHooks {
    fn before_atr_get(&self, _atr_key: &str) -> KvResult<()> {
        self.check("cleanup.before_atr_get")
    }
    fn before_doc_get(&self, _key: &str) -> KvResult<()> {
        self.check("cleanup.before_doc_get")
    }
    fn before_commit_doc(&self, _key: &str) -> KvResult<()> {
        self.check("cleanup.before_commit_doc")
    }
    fn before_remove_links(&self, _key: &str) -> KvResult<()> {
        self.check("cleanup.before_remove_links")
    }
    fn before_remove_doc(&self, _key: &str) -> KvResult<()> {
        self.check("cleanup.before_remove_doc")
    }
    fn before_remove_doc_staged_for_removal(&self, _key: &str) -> KvResult<()> {
        self.check("cleanup.before_remove_doc_staged_for_removal")
    }
    fn before_atr_remove(&self, _atr_key: &str) -> KvResult<()> {
        self.check("cleanup.before_atr_remove")
    }
}

impl ClientRecordHooks for FailpointHooks {
    fn before_create_record(&self) -> KvResult<()> {
        self.check("record.before_create_record")
    }
    fn before_get_record(&self) -> KvResult<()> {
        self.check("record.before_get_record")
    }
    fn before_update_record(&self) -> KvResult<()> {
        self.check("record.before_update_record")
    }
    fn before_remove_client(&self) -> KvResult<()> {
        self.check("record.before_remove_client")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_point_fails_then_passes() {
        let hooks = FailpointHooks::new();
        hooks.fail_times("before_staged_insert", KvError::Temporary, 1);
        assert_eq!(
            TransactionHooks::before_staged_insert(&hooks, "k"),
            Err(KvError::Temporary)
        );
        assert_eq!(TransactionHooks::before_staged_insert(&hooks, "k"), Ok(()));
        assert_eq!(hooks.fired("before_staged_insert"), 2);
    }

    #[test]
    fn trait_namespaces_stay_separate() {
        let hooks = FailpointHooks::new();
        hooks.fail("cleanup.before_doc_get", KvError::Timeout);
        assert_eq!(TransactionHooks::before_doc_get(&hooks, "k"), Ok(()));
        assert_eq!(
            CleanupHooks::before_doc_get(&hooks, "k"),
            Err(KvError::Timeout)
        );
    }

    #[test]
    fn expiry_is_stage_scoped() {
        let hooks = FailpointHooks::new();
        hooks.expire_at("commitDoc");
        assert!(hooks.has_expired("commitDoc", None));
        assert!(!hooks.has_expired("get", None));
    }
}
