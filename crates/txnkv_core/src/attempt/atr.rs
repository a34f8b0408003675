//! ATR entry transitions.
//!
//! Each transition is a sub-document mutation against the attempt's entry in
//! its ATR document, retried or failed according to the class of whatever
//! error comes back. The commit transition is the attempt's commit point:
//! its outcome decides whether staged values become authoritative.

use std::thread;

use txnkv_kv::{
    Cas, DocFlags, KvError, LookupInOp, LookupInOptions, MutateInOp, MutateInOptions, MACRO_CAS,
};
use txnkv_protocol::atr::{attempt_field, attempt_path, fields};
use txnkv_protocol::AtrState;

use crate::attempt::mutations::atr_lists;
use crate::attempt::{Attempt, AtrLocation, StagedMutation, RETRY_BACKOFF};
use crate::error::{ErrorClass, ErrorCause, Failure, FailureReason};
use crate::hooks::stages;

impl Attempt {
    fn atr_write(
        &self,
        loc: &AtrLocation,
        ops: Vec<MutateInOp>,
        flags: DocFlags,
    ) -> Result<(), KvError> {
        let client = self.client_for(&loc.keyspace).map_err(|f| match f.cause {
            ErrorCause::Kv(err) => err,
            _ => KvError::Server("bucket unavailable".to_string()),
        })?;
        client.mutate_in(MutateInOptions {
            keyspace: loc.keyspace.clone(),
            key: loc.key.clone(),
            ops,
            cas: Cas::ZERO,
            durability: self.durability(),
            flags,
            deadline: self.deadline(),
        })?;
        Ok(())
    }

    /// Expiry check for transitions that must keep going after the budget
    /// lapses. The first lapse enters overtime and lets one more pass run;
    /// a lapse observed while already in overtime gives up.
    pub(crate) fn overtime_guard(&self, stage: &'static str) -> Result<(), Failure> {
        if self.has_expired() || self.hooks().has_expired(stage, None) {
            if self.in_overtime() {
                return Err(Failure::new(ErrorCause::ExpiredInOvertime(stage))
                    .no_retry()
                    .no_rollback()
                    .with_reason(FailureReason::Expired));
            }
            self.enter_overtime();
        }
        Ok(())
    }

    /// Write the PENDING entry for this attempt, creating the ATR document
    /// if it does not exist yet.
    pub(crate) fn set_atr_pending(&self, loc: &AtrLocation) -> Result<(), Failure> {
        let id = self.id().to_string();
        loop {
            self.check_expired(stages::ATR_PENDING, None, false)?;
            let remaining =
                self.expiry_time().saturating_duration_since(std::time::Instant::now());
            let ops = vec![
                MutateInOp::xattr_add(
                    attempt_field(&id, fields::TRANSACTION_ID),
                    Self::json_bytes(&self.transaction_id())?,
                ),
                MutateInOp::xattr_add(
                    attempt_field(&id, fields::STATE),
                    Self::json_bytes(&AtrState::Pending)?,
                ),
                MutateInOp::xattr_add(
                    attempt_field(&id, fields::PENDING_CAS),
                    Self::json_bytes(&MACRO_CAS)?,
                )
                .with_macros(),
                MutateInOp::xattr_add(
                    attempt_field(&id, fields::EXPIRY_MS),
                    Self::json_bytes(&(remaining.as_millis() as u64))?,
                ),
                MutateInOp::xattr_add(
                    attempt_field(&id, fields::DURABILITY),
                    Self::json_bytes(&self.durability().shorthand())?,
                ),
            ];
            let result = self
                .hooks()
                .before_atr_pending()
                .and_then(|_| {
                    self.atr_write(
                        loc,
                        ops,
                        DocFlags {
                            mk_doc: true,
                            ..DocFlags::default()
                        },
                    )
                })
                .and_then(|_| self.hooks().after_atr_pending());
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let failure = Failure::new(ErrorCause::Kv(err));
            match failure.class {
                // Entry already written by an earlier ambiguous try.
                ErrorClass::PathExists => return Ok(()),
                ErrorClass::Ambiguous => {
                    thread::sleep(RETRY_BACKOFF);
                }
                ErrorClass::Transient => return Err(failure),
                ErrorClass::OutOfSpace => {
                    return Err(Failure::new(ErrorCause::AtrFull).no_retry())
                }
                ErrorClass::Expiry => {
                    return Err(failure.no_retry().with_reason(FailureReason::Expired))
                }
                _ => return Err(failure.no_retry()),
            }
        }
    }

    /// Rewrite the entry's staged-document lists.
    ///
    /// Called whenever a staging operation changes the staged set, before
    /// the document itself is touched, so that even a still-pending entry
    /// names every document an interrupted attempt may have staged.
    pub(crate) fn update_atr_lists(
        &self,
        loc: &AtrLocation,
        staged: &[StagedMutation],
    ) -> Result<(), Failure> {
        let id = self.id().to_string();
        let (inserts, replaces, removes) = atr_lists(staged);
        loop {
            let ops = vec![
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::INSERTS),
                    Self::json_bytes(&inserts)?,
                ),
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::REPLACES),
                    Self::json_bytes(&replaces)?,
                ),
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::REMOVES),
                    Self::json_bytes(&removes)?,
                ),
            ];
            let err = match self.atr_write(loc, ops, DocFlags::default()) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let failure = Failure::new(ErrorCause::Kv(err));
            match failure.class {
                ErrorClass::Ambiguous => thread::sleep(RETRY_BACKOFF),
                ErrorClass::Transient => return Err(failure),
                ErrorClass::DocNotFound => {
                    return Err(Failure::new(ErrorCause::AtrNotFound).no_retry())
                }
                ErrorClass::Expiry => {
                    return Err(failure.no_retry().with_reason(FailureReason::Expired))
                }
                _ => return Err(failure.no_retry()),
            }
        }
    }

    /// Write the COMMITTED transition. Returning `Ok` means the commit point
    /// has passed.
    pub(crate) fn set_atr_committed(&self, loc: &AtrLocation) -> Result<(), Failure> {
        let id = self.id().to_string();
        let staged = self.lock().staged.clone();
        let (inserts, replaces, removes) = atr_lists(&staged);
        let mut resolving = false;
        loop {
            if resolving {
                match self.resolve_commit_ambiguity(loc)? {
                    CommitResolution::Committed => return Ok(()),
                    CommitResolution::RewriteCommit => resolving = false,
                }
                continue;
            }
            self.check_expired(stages::ATR_COMMIT, None, false)
                .map_err(|f| f.no_rollback())?;
            let ops = vec![
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::STATE),
                    Self::json_bytes(&AtrState::Committed)?,
                ),
                // DictAdd so a second commit of the same attempt is caught.
                MutateInOp::xattr_add(
                    attempt_field(&id, fields::COMMIT_CAS),
                    Self::json_bytes(&MACRO_CAS)?,
                )
                .with_macros(),
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::INSERTS),
                    Self::json_bytes(&inserts)?,
                ),
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::REPLACES),
                    Self::json_bytes(&replaces)?,
                ),
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::REMOVES),
                    Self::json_bytes(&removes)?,
                ),
            ];
            let result = self
                .hooks()
                .before_atr_committed()
                .and_then(|_| self.atr_write(loc, ops, DocFlags::default()))
                .and_then(|_| self.hooks().after_atr_committed());
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let failure = Failure::new(ErrorCause::Kv(err));
            match failure.class {
                // The write may have landed; find out from the record.
                ErrorClass::Ambiguous | ErrorClass::PathExists => resolving = true,
                ErrorClass::Transient => thread::sleep(RETRY_BACKOFF),
                ErrorClass::DocNotFound => {
                    return Err(Failure::new(ErrorCause::AtrNotFound).no_retry())
                }
                ErrorClass::PathNotFound => {
                    return Err(Failure::new(ErrorCause::AtrEntryNotFound).no_retry())
                }
                ErrorClass::Expiry => {
                    return Err(failure
                        .no_retry()
                        .no_rollback()
                        .with_reason(FailureReason::CommitAmbiguous))
                }
                _ => return Err(failure.no_retry()),
            }
        }
    }

    fn resolve_commit_ambiguity(&self, loc: &AtrLocation) -> Result<CommitResolution, Failure> {
        let id = self.id().to_string();
        let client = self.client_for(&loc.keyspace)?;
        loop {
            if self.has_expired()
                || self
                    .hooks()
                    .has_expired(stages::ATR_COMMIT_AMBIGUITY_RESOLUTION, None)
            {
                return Err(Failure::new(ErrorCause::AttemptExpired)
                    .no_retry()
                    .no_rollback()
                    .with_reason(FailureReason::CommitAmbiguous));
            }
            let result = self
                .hooks()
                .before_atr_commit_ambiguity_resolution()
                .and_then(|_| {
                    client.lookup_in(LookupInOptions {
                        keyspace: loc.keyspace.clone(),
                        key: loc.key.clone(),
                        ops: vec![LookupInOp::xattr(attempt_field(&id, fields::STATE))],
                        access_deleted: false,
                        deadline: self.deadline(),
                    })
                });
            let lookup = match result {
                Ok(lookup) => lookup,
                Err(err) => {
                    let failure = Failure::new(ErrorCause::Kv(err));
                    match failure.class {
                        ErrorClass::Transient | ErrorClass::Ambiguous => {
                            thread::sleep(RETRY_BACKOFF);
                            continue;
                        }
                        ErrorClass::DocNotFound => {
                            return Err(Failure::new(ErrorCause::AtrNotFound)
                                .no_retry()
                                .no_rollback()
                                .with_reason(FailureReason::CommitAmbiguous))
                        }
                        _ => {
                            return Err(failure
                                .no_retry()
                                .no_rollback()
                                .with_reason(FailureReason::CommitAmbiguous))
                        }
                    }
                }
            };
            let state: Option<AtrState> = lookup
                .content(0)
                .map_err(|err| Failure::new(ErrorCause::Kv(err)).no_retry().no_rollback())?;
            return match state {
                Some(AtrState::Committed) => Ok(CommitResolution::Committed),
                // The ambiguous write never landed; write it again.
                Some(AtrState::Pending) => Ok(CommitResolution::RewriteCommit),
                // Another actor (cleanup) rolled the attempt back.
                Some(AtrState::Aborted) => Err(Failure::new(ErrorCause::IllegalState(
                    "attempt aborted during commit".to_string(),
                ))),
                Some(other) => Err(Failure::new(ErrorCause::IllegalState(format!(
                    "unexpected ATR state {other:?} resolving commit"
                )))
                .no_retry()
                .no_rollback()),
                None => Err(Failure::new(ErrorCause::AtrEntryNotFound)
                    .no_retry()
                    .no_rollback()
                    .with_reason(FailureReason::CommitAmbiguous)),
            };
        }
    }

    /// Delete the entry after every staged mutation has been unstaged.
    ///
    /// Runs after the commit point, so every failure here is post-commit:
    /// no retry, no rollback, and the entry is left for cleanup.
    pub(crate) fn set_atr_completed(&self, loc: &AtrLocation) -> Result<(), Failure> {
        let id = self.id().to_string();
        loop {
            self.overtime_guard(stages::ATR_COMPLETE)
                .map_err(|f| f.with_reason(FailureReason::FailedPostCommit))?;
            let ops = vec![MutateInOp::xattr_delete(attempt_path(&id))];
            let result = self
                .hooks()
                .before_atr_complete()
                .and_then(|_| self.atr_write(loc, ops, DocFlags::default()))
                .and_then(|_| self.hooks().after_atr_complete());
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let failure = Failure::new(ErrorCause::Kv(err));
            match failure.class {
                ErrorClass::Ambiguous | ErrorClass::Transient => thread::sleep(RETRY_BACKOFF),
                _ => {
                    return Err(failure
                        .no_retry()
                        .no_rollback()
                        .with_reason(FailureReason::FailedPostCommit))
                }
            }
        }
    }

    /// Write the ABORTED transition.
    pub(crate) fn set_atr_aborted(&self, loc: &AtrLocation) -> Result<(), Failure> {
        let id = self.id().to_string();
        loop {
            self.overtime_guard(stages::ATR_ABORT)?;
            let ops = vec![
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::STATE),
                    Self::json_bytes(&AtrState::Aborted)?,
                ),
                MutateInOp::xattr_set(
                    attempt_field(&id, fields::ROLLBACK_CAS),
                    Self::json_bytes(&MACRO_CAS)?,
                )
                .with_macros(),
            ];
            let result = self
                .hooks()
                .before_atr_aborted()
                .and_then(|_| self.atr_write(loc, ops, DocFlags::default()))
                .and_then(|_| self.hooks().after_atr_aborted());
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let failure = Failure::new(ErrorCause::Kv(err));
            match failure.class {
                ErrorClass::Expiry => {
                    if self.in_overtime() {
                        return Err(Failure::new(ErrorCause::ExpiredInOvertime(
                            stages::ATR_ABORT,
                        ))
                        .no_retry()
                        .no_rollback()
                        .with_reason(FailureReason::Expired));
                    }
                    self.enter_overtime();
                }
                ErrorClass::DocNotFound => {
                    return Err(Failure::new(ErrorCause::AtrNotFound).no_rollback())
                }
                ErrorClass::PathNotFound => {
                    return Err(Failure::new(ErrorCause::AtrEntryNotFound).no_rollback())
                }
                ErrorClass::OutOfSpace => {
                    return Err(Failure::new(ErrorCause::AtrFull).no_retry().no_rollback())
                }
                ErrorClass::Hard => return Err(failure.no_retry().no_rollback()),
                _ => thread::sleep(RETRY_BACKOFF),
            }
        }
    }

    /// Delete the entry after rollback has removed all staged metadata.
    pub(crate) fn set_atr_rolled_back(&self, loc: &AtrLocation) -> Result<(), Failure> {
        let id = self.id().to_string();
        loop {
            self.overtime_guard(stages::ATR_ROLLBACK)?;
            let ops = vec![MutateInOp::xattr_delete(attempt_path(&id))];
            let result = self
                .hooks()
                .before_atr_rolled_back()
                .and_then(|_| self.atr_write(loc, ops, DocFlags::default()))
                .and_then(|_| self.hooks().after_atr_rolled_back());
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let failure = Failure::new(ErrorCause::Kv(err));
            match failure.class {
                // Cleanup got there first.
                ErrorClass::DocNotFound | ErrorClass::PathNotFound => return Ok(()),
                ErrorClass::Hard => return Err(failure.no_retry().no_rollback()),
                _ => thread::sleep(RETRY_BACKOFF),
            }
        }
    }
}

enum CommitResolution {
    Committed,
    RewriteCommit,
}
