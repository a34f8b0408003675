//! Monotonic-atomic-view reads.
//!
//! A read must never observe a half-committed transaction. A document
//! carrying a foreign staged mutation is resolved through the ATR entry that
//! governs it: if that attempt has passed its commit point the staged value
//! is returned, otherwise the last committed body is.

use std::thread;

use serde_json::Value;
use txnkv_kv::{KeySpace, LookupInOp, LookupInOptions, VATTR_DOCUMENT};
use txnkv_protocol::atr::attempt_path;
use txnkv_protocol::doc::paths;
use txnkv_protocol::{
    check_forward_compat, AtrEntry, AtrState, ForwardCompatDecision, ForwardCompatMap,
    ForwardCompatStage, StagedOpType, TxnXattr, TxnXattrAtr,
};

use crate::attempt::{Attempt, TxnGetResult, RETRY_BACKOFF};
use crate::error::{ErrorClass, ErrorCause, Failure, TxnError, TxnResult};
use crate::hooks::stages;

impl Attempt {
    /// Read a document through this attempt's view.
    ///
    /// Returns [`TxnError::DocumentNotFound`] if the document does not exist
    /// in that view, including when this attempt itself staged its removal.
    pub fn get(&self, keyspace: &KeySpace, key: &str) -> TxnResult<TxnGetResult> {
        self.begin_op()?;
        let result = self.get_inner(keyspace, key);
        self.end_op();
        match result {
            Ok(Some(doc)) => Ok(doc),
            Ok(None) => Err(TxnError::DocumentNotFound),
            Err(failure) => Err(self.record_failure(failure).into()),
        }
    }

    fn get_inner(&self, keyspace: &KeySpace, key: &str) -> Result<Option<TxnGetResult>, Failure> {
        // This attempt's own staged mutations win over anything stored.
        {
            let inner = self.lock();
            if let Some(staged) = inner.staged.iter().find(|m| m.targets(keyspace, key)) {
                return match (&staged.op_type, &staged.staged_value) {
                    (StagedOpType::Remove, _) => Ok(None),
                    (_, Some(value)) => Ok(Some(TxnGetResult {
                        keyspace: keyspace.clone(),
                        key: key.to_string(),
                        cas: staged.cas,
                        value: Self::json_bytes(value)?,
                    })),
                    (_, None) => Err(Failure::new(ErrorCause::IllegalState(
                        "staged mutation has no staged value".to_string(),
                    ))
                    .no_retry()),
                };
            }
        }

        let client = self.client_for(keyspace)?;
        loop {
            self.check_expired(stages::GET, Some(key), false)?;
            let result = self.hooks().before_doc_get(key).and_then(|_| {
                client.lookup_in(LookupInOptions {
                    keyspace: keyspace.clone(),
                    key: key.to_string(),
                    ops: vec![
                        LookupInOp::xattr(paths::ROOT),
                        LookupInOp::xattr(VATTR_DOCUMENT),
                        LookupInOp::full_body(),
                    ],
                    access_deleted: true,
                    deadline: self.deadline(),
                })
            });
            let lookup = match result {
                Ok(lookup) => lookup,
                Err(err) => {
                    let failure = Failure::new(ErrorCause::Kv(err));
                    match failure.class {
                        ErrorClass::DocNotFound => return Ok(None),
                        ErrorClass::Transient | ErrorClass::Ambiguous => return Err(failure),
                        _ => return Err(failure.no_retry()),
                    }
                }
            };

            self.note_units(lookup.resource_units);
            let txn: Option<TxnXattr> = lookup
                .content(0)
                .map_err(|err| Failure::new(ErrorCause::Kv(err)).no_retry())?;
            let committed = if lookup.is_deleted {
                None
            } else {
                let body: Option<Value> = lookup
                    .content(2)
                    .map_err(|err| Failure::new(ErrorCause::Kv(err)).no_retry())?;
                body
            };

            let committed_view = match &committed {
                Some(value) => Some(TxnGetResult {
                    keyspace: keyspace.clone(),
                    key: key.to_string(),
                    cas: lookup.cas,
                    value: Self::json_bytes(value)?,
                }),
                None => None,
            };

            let block = match txn {
                None => return Ok(committed_view),
                Some(block) => block,
            };

            self.forward_compat_gate(ForwardCompatStage::Gets, block.forward_compat.as_ref())?;

            // Our own staging from a resumed attempt: the staged value is
            // this attempt's view.
            if block.id.attempt_id == self.id() {
                return Self::staged_view(keyspace, key, &block, lookup.cas);
            }

            let entry = match self.read_foreign_atr_entry(
                &block.atr,
                &block.id.attempt_id,
                ForwardCompatStage::GetsReadingAtr,
            ) {
                Ok(entry) => entry,
                Err(failure) if failure.class == ErrorClass::Transient => {
                    thread::sleep(RETRY_BACKOFF);
                    continue;
                }
                Err(failure) => return Err(failure),
            };

            let entry = match entry {
                Some(entry) => entry,
                // The governing entry is gone: that attempt finished after
                // our lookup, and cleanup may have rewritten the document.
                // A cached body could be stale either way, so re-read.
                None => {
                    thread::sleep(RETRY_BACKOFF);
                    continue;
                }
            };

            return match entry.state {
                // Past the commit point: the staged value is authoritative
                // even though unstaging has not reached this document.
                Some(AtrState::Committed) | Some(AtrState::Completed) => {
                    Self::staged_view(keyspace, key, &block, lookup.cas)
                }
                _ => Ok(committed_view),
            };
        }
    }

    fn staged_view(
        keyspace: &KeySpace,
        key: &str,
        block: &TxnXattr,
        cas: txnkv_kv::Cas,
    ) -> Result<Option<TxnGetResult>, Failure> {
        match (&block.op.op_type, &block.op.staged) {
            (StagedOpType::Remove, _) => Ok(None),
            (_, Some(value)) => Ok(Some(TxnGetResult {
                keyspace: keyspace.clone(),
                key: key.to_string(),
                cas,
                value: Self::json_bytes(value)?,
            })),
            (_, None) => Ok(None),
        }
    }

    /// Read the ATR entry a foreign staged block points at.
    ///
    /// `Ok(None)` means the entry (or the whole ATR) is gone, which callers
    /// treat as "that attempt is finished".
    pub(crate) fn read_foreign_atr_entry(
        &self,
        atr: &TxnXattrAtr,
        attempt_id: &str,
        fc_stage: ForwardCompatStage,
    ) -> Result<Option<AtrEntry>, Failure> {
        let keyspace = KeySpace::new(atr.bucket.clone(), atr.scope.clone(), atr.collection.clone());
        let client = self.client_for(&keyspace)?;
        let lookup = match client.lookup_in(LookupInOptions {
            keyspace: keyspace.clone(),
            key: atr.key.clone(),
            ops: vec![LookupInOp::xattr(attempt_path(attempt_id))],
            access_deleted: false,
            deadline: self.deadline(),
        }) {
            Ok(lookup) => lookup,
            Err(err) => {
                let failure = Failure::new(ErrorCause::Kv(err));
                return match failure.class {
                    ErrorClass::DocNotFound => Ok(None),
                    ErrorClass::Transient | ErrorClass::Ambiguous => {
                        Err(Failure { class: ErrorClass::Transient, ..failure })
                    }
                    _ => Err(failure.no_retry()),
                };
            }
        };
        let entry: Option<AtrEntry> = lookup
            .content(0)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)).no_retry())?;
        if let Some(entry) = &entry {
            self.forward_compat_gate(fc_stage, entry.forward_compat.as_ref())?;
        }
        Ok(entry)
    }

    /// Apply a forward-compatibility decision at a stage.
    pub(crate) fn forward_compat_gate(
        &self,
        stage: ForwardCompatStage,
        map: Option<&ForwardCompatMap>,
    ) -> Result<(), Failure> {
        match check_forward_compat(stage, map) {
            ForwardCompatDecision::Ok => Ok(()),
            ForwardCompatDecision::Fail => Err(Failure::new(ErrorCause::ForwardCompat {
                stage: stage.as_str(),
            })
            .no_retry()),
            ForwardCompatDecision::Retry { after } => {
                if let Some(after) = after {
                    thread::sleep(after);
                }
                Err(Failure::new(ErrorCause::ForwardCompat {
                    stage: stage.as_str(),
                }))
            }
        }
    }
}
