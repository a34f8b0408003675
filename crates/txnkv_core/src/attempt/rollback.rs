//! Rollback: the ATR abort transition, then removing staged metadata.

use std::thread;

use txnkv_kv::{DocFlags, MutateInOp, MutateInOptions};
use txnkv_protocol::doc::paths;
use txnkv_protocol::AtrState;

use crate::attempt::{Attempt, AttemptState, StagedMutation, RETRY_BACKOFF};
use crate::error::{merge_failures, ErrorClass, ErrorCause, Failure, TxnResult};
use crate::hooks::stages;

impl Attempt {
    /// Roll the attempt back, discarding every staged mutation.
    ///
    /// Runs to completion even after the attempt's time budget lapses;
    /// whatever it cannot finish is left for cleanup.
    pub fn rollback(&self) -> TxnResult<()> {
        self.rollback_inner().map_err(|failure| {
            tracing::debug!(attempt = self.id(), "rollback failed");
            failure.into()
        })
    }

    fn rollback_inner(&self) -> Result<(), Failure> {
        let mut inner = self.drain_and_lock()?;
        if inner.should_not_rollback {
            inner.draining = false;
            return Err(Failure::new(ErrorCause::IllegalState(
                "attempt can no longer be rolled back".to_string(),
            ))
            .no_retry()
            .no_rollback());
        }
        match inner.state {
            AttemptState::NothingWritten => {
                inner.state = AttemptState::RolledBack;
                inner.draining = false;
                return Ok(());
            }
            AttemptState::Pending | AttemptState::Aborted => {}
            other => {
                inner.draining = false;
                return Err(Failure::new(ErrorCause::IllegalState(format!(
                    "cannot roll back {other} attempt"
                )))
                .no_retry()
                .no_rollback());
            }
        }
        let atr = match inner.atr.clone() {
            Some(atr) => atr,
            None => {
                inner.draining = false;
                return Err(Failure::new(ErrorCause::IllegalState(
                    "pending attempt has no ATR entry".to_string(),
                ))
                .no_retry()
                .no_rollback());
            }
        };
        // Block further user operations while the ATR still says PENDING.
        inner.state = AttemptState::Aborted;
        let staged = inner.staged.clone();
        inner.draining = false;
        drop(inner);

        if let Err(failure) = self.set_atr_aborted(&atr) {
            self.enqueue_cleanup(AtrState::Pending);
            return Err(failure);
        }

        let mut failures = Vec::new();
        for mutation in &staged {
            if let Err(failure) = self.rollback_doc(mutation) {
                failures.push(failure);
            }
        }
        if failures.is_empty() {
            if let Err(failure) = self.set_atr_rolled_back(&atr) {
                failures.push(failure);
            }
        }

        match merge_failures(failures) {
            None => {
                self.lock().state = AttemptState::RolledBack;
                Ok(())
            }
            Some(merged) => {
                self.enqueue_cleanup(AtrState::Aborted);
                Err(merged.no_rollback())
            }
        }
    }

    /// Strip this attempt's staged block from one document.
    ///
    /// For a staged insert this leaves a bare tombstone, which the store
    /// reclaims; for replaces and removes the committed body was never
    /// touched, so stripping the block is the whole rollback.
    fn rollback_doc(&self, mutation: &StagedMutation) -> Result<(), Failure> {
        let client = self.client_for(&mutation.keyspace)?;
        let mut cas = mutation.cas;
        loop {
            self.overtime_guard(stages::ROLLBACK_DOC)?;
            let result = self
                .hooks()
                .before_doc_rolled_back(&mutation.key)
                .and_then(|_| {
                    client.mutate_in(MutateInOptions {
                        keyspace: mutation.keyspace.clone(),
                        key: mutation.key.clone(),
                        ops: vec![MutateInOp::xattr_delete(paths::ROOT)],
                        cas,
                        durability: self.durability(),
                        flags: DocFlags {
                            access_deleted: true,
                            ..DocFlags::default()
                        },
                        deadline: self.deadline(),
                    })
                })
                .and_then(|_| self.hooks().after_doc_rolled_back(&mutation.key));
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let failure = Failure::new(ErrorCause::Kv(err));
            match failure.class {
                // Already stripped, or the document is gone entirely.
                ErrorClass::DocNotFound | ErrorClass::PathNotFound => return Ok(()),
                ErrorClass::Ambiguous | ErrorClass::Transient => thread::sleep(RETRY_BACKOFF),
                // The document moved under us. If our block is still there
                // retry against its current CAS; anything else means some
                // other actor already dealt with it.
                ErrorClass::CasMismatch => {
                    match self.find_own_block(&mutation.keyspace, &mutation.key)? {
                        Some(current) => cas = current,
                        None => return Ok(()),
                    }
                }
                _ => return Err(failure.no_retry().no_rollback()),
            }
        }
    }
}
