//! Commit: the ATR commit point, then unstaging every document.

use std::thread;

use serde_json::Value;
use txnkv_kv::{
    Cas, DeleteOptions, DocFlags, LookupInOp, LookupInOptions, MutateInOp, MutateInOptions,
    StoreOptions,
};
use txnkv_protocol::doc::paths;
use txnkv_protocol::{AtrState, StagedOpType};

use crate::attempt::{Attempt, AttemptState, StagedMutation, RETRY_BACKOFF};
use crate::cleanup::{CleanupRequest, DocRecord};
use crate::error::{merge_failures, ErrorClass, ErrorCause, Failure, FailureReason, TxnResult};
use crate::hooks::stages;

impl Attempt {
    /// Commit the attempt.
    ///
    /// Once this returns `Ok`, or fails with a post-commit reason, the
    /// staged values are the authoritative contents of every written
    /// document.
    pub fn commit(&self) -> TxnResult<()> {
        self.commit_inner().map_err(|failure| {
            let failure = self.record_failure(failure);
            tracing::debug!(
                attempt = self.id(),
                reason = ?failure.reason,
                "commit failed"
            );
            failure.into()
        })
    }

    fn commit_inner(&self) -> Result<(), Failure> {
        let mut inner = self.drain_and_lock()?;
        if inner.should_not_commit {
            inner.draining = false;
            return Err(Failure::new(ErrorCause::PreviousOperationFailed).no_retry());
        }
        match inner.state {
            AttemptState::NothingWritten => {
                inner.state = AttemptState::Completed;
                inner.draining = false;
                return Ok(());
            }
            AttemptState::Pending => {}
            other => {
                inner.draining = false;
                return Err(Failure::new(ErrorCause::IllegalState(format!(
                    "cannot commit {other} attempt"
                )))
                .no_retry());
            }
        }
        inner.state = AttemptState::Committing;
        let atr = match inner.atr.clone() {
            Some(atr) => atr,
            None => {
                inner.draining = false;
                return Err(Failure::new(ErrorCause::IllegalState(
                    "pending attempt has no ATR entry".to_string(),
                ))
                .no_retry());
            }
        };
        let staged = inner.staged.clone();
        drop(inner);

        if let Err(failure) = self.set_atr_committed(&atr) {
            self.lock().draining = false;
            return Err(failure);
        }
        {
            let mut inner = self.lock();
            inner.state = AttemptState::Committed;
            inner.draining = false;
        }

        let mut failures = Vec::new();
        for mutation in &staged {
            if let Err(failure) = self.commit_doc(mutation) {
                failures.push(failure);
            }
        }
        if failures.is_empty() {
            if let Err(failure) = self.set_atr_completed(&atr) {
                failures.push(failure);
            }
        }

        match merge_failures(failures) {
            None => {
                self.lock().state = AttemptState::Completed;
                Ok(())
            }
            Some(merged) => {
                self.enqueue_cleanup(AtrState::Committed);
                Err(merged)
            }
        }
    }

    /// Make one staged mutation authoritative: swap in the staged body (or
    /// delete the document) and strip the block.
    fn commit_doc(&self, mutation: &StagedMutation) -> Result<(), Failure> {
        let client = self.client_for(&mutation.keyspace)?;
        let mut cas = mutation.cas;
        let body = match mutation.op_type {
            StagedOpType::Remove => None,
            _ => Some(self.staged_body(mutation)?),
        };
        loop {
            self.overtime_guard(stages::COMMIT_DOC)
                .map_err(|f| f.with_reason(FailureReason::FailedPostCommit))?;
            let result = self
                .hooks()
                .before_doc_committed(&mutation.key)
                .map_err(|err| Failure::new(ErrorCause::Kv(err)))
                .and_then(|_| match (&mutation.op_type, &body) {
                    (StagedOpType::Remove, _) => client
                        .delete(DeleteOptions {
                            keyspace: mutation.keyspace.clone(),
                            key: mutation.key.clone(),
                            cas,
                            durability: self.durability(),
                            deadline: self.deadline(),
                        })
                        .map(|_| ())
                        .map_err(|err| Failure::new(ErrorCause::Kv(err))),
                    (_, Some(body)) => self.swap_in_body(&client, mutation, body, cas),
                    (_, None) => Err(Failure::new(ErrorCause::IllegalState(
                        "staged mutation has no staged value".to_string(),
                    ))),
                });
            let failure = match result {
                Ok(()) => {
                    self.hooks()
                        .after_doc_committed(&mutation.key)
                        .map_err(|err| {
                            Failure::new(ErrorCause::Kv(err))
                                .no_retry()
                                .no_rollback()
                                .with_reason(FailureReason::FailedPostCommit)
                        })?;
                    return Ok(());
                }
                Err(failure) => failure,
            };
            match failure.class {
                ErrorClass::Ambiguous | ErrorClass::Transient => thread::sleep(RETRY_BACKOFF),
                // The block was already stripped, by cleanup or an earlier
                // ambiguous try of ours.
                ErrorClass::PathNotFound => return Ok(()),
                ErrorClass::DocNotFound if mutation.op_type == StagedOpType::Remove => {
                    return Ok(())
                }
                // The CAS we staged with is stale; past the commit point the
                // staged value must land regardless.
                ErrorClass::CasMismatch => cas = Cas::ZERO,
                _ => {
                    return Err(failure
                        .no_retry()
                        .no_rollback()
                        .with_reason(FailureReason::FailedPostCommit))
                }
            }
        }
    }

    /// Replace the visible body with the staged one and strip the block.
    ///
    /// A staged insert, and a replace that folded over a staged insert,
    /// live on a tombstone; those are committed by a whole-document add.
    fn swap_in_body(
        &self,
        client: &std::sync::Arc<dyn txnkv_kv::KvClient>,
        mutation: &StagedMutation,
        body: &Value,
        cas: Cas,
    ) -> Result<(), Failure> {
        let encoded = Self::json_bytes(body)?;
        let tombstone_add = || {
            client
                .add(StoreOptions {
                    keyspace: mutation.keyspace.clone(),
                    key: mutation.key.clone(),
                    value: encoded.clone(),
                    cas: Cas::ZERO,
                    durability: self.durability(),
                    deadline: self.deadline(),
                })
                .map(|_| ())
                .map_err(|err| Failure::new(ErrorCause::Kv(err)))
        };
        if mutation.op_type == StagedOpType::Insert {
            return tombstone_add();
        }
        let result = client.mutate_in(MutateInOptions {
            keyspace: mutation.keyspace.clone(),
            key: mutation.key.clone(),
            ops: vec![
                MutateInOp::xattr_delete(paths::ROOT),
                MutateInOp::set_doc(encoded.clone()),
            ],
            cas,
            durability: self.durability(),
            flags: DocFlags::default(),
            deadline: self.deadline(),
        });
        match result {
            Ok(_) => Ok(()),
            // The "replace" was folded over a staged insert, so the store
            // only holds a tombstone; create the document outright.
            Err(txnkv_kv::KvError::DocumentNotFound) => tombstone_add(),
            Err(err) => Err(Failure::new(ErrorCause::Kv(err))),
        }
    }

    /// The staged body to commit, re-read from the document when the
    /// attempt (resumed from a serialized form) does not hold it.
    fn staged_body(&self, mutation: &StagedMutation) -> Result<Value, Failure> {
        if let Some(value) = &mutation.staged_value {
            return Ok(value.clone());
        }
        let client = self.client_for(&mutation.keyspace)?;
        let lookup = client
            .lookup_in(LookupInOptions {
                keyspace: mutation.keyspace.clone(),
                key: mutation.key.clone(),
                ops: vec![LookupInOp::xattr(paths::STAGED)],
                access_deleted: true,
                deadline: self.deadline(),
            })
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))?;
        let staged: Option<Value> = lookup
            .content(0)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))?;
        staged.ok_or_else(|| {
            Failure::new(ErrorCause::IllegalState(
                "document no longer carries a staged value".to_string(),
            ))
        })
    }

    /// Hand the attempt's leftovers to the regular cleanup queue.
    pub(crate) fn enqueue_cleanup(&self, state: AtrState) {
        let cleaner = match self.cleaner() {
            Some(cleaner) => cleaner.clone(),
            None => return,
        };
        let inner = self.lock();
        let atr = match inner.atr.clone() {
            Some(atr) => atr,
            None => return,
        };
        let record = |op: StagedOpType| -> Vec<DocRecord> {
            inner
                .staged
                .iter()
                .filter(|m| m.op_type == op)
                .map(|m| DocRecord {
                    keyspace: m.keyspace.clone(),
                    key: m.key.clone(),
                })
                .collect()
        };
        let request = CleanupRequest {
            transaction_id: self.transaction_id().to_string(),
            attempt_id: self.id().to_string(),
            atr,
            state,
            inserts: record(StagedOpType::Insert),
            replaces: record(StagedOpType::Replace),
            removes: record(StagedOpType::Remove),
            forward_compat: None,
            durability: self.durability(),
            enqueued_at: std::time::Instant::now(),
        };
        drop(inner);
        cleaner.add_request(request);
    }
}
