//! Staging mutations onto documents.
//!
//! Application writes never touch the visible body: each one writes the
//! hidden `txn` xattr block (and, for inserts, a tombstone) under a CAS
//! guard. A second write to a document this attempt already staged folds
//! into the existing staged mutation rather than adding another.

use std::thread;
use std::time::Instant;

use serde_json::Value;
use txnkv_kv::{
    Cas, DocFlags, KeySpace, KvError, LookupInOp, LookupInOptions, MutateInOp, MutateInOptions,
    MACRO_VALUE_CRC32C,
};
use txnkv_protocol::doc::paths;
use txnkv_protocol::{
    atr_key_for_index, atr_index_for_key, AtrState, ForwardCompatStage, StagedOpType, TxnXattr,
    TxnXattrAtr, TxnXattrId, TxnXattrOp, TxnXattrRestore,
};

use crate::attempt::{
    Attempt, AtrLocation, StagedMutation, TxnGetResult, RETRY_BACKOFF, WRITE_WRITE_POLL_BUDGET,
    WRITE_WRITE_POLL_INTERVAL,
};
use crate::attempt::state::AttemptState;
use crate::error::{ErrorClass, ErrorCause, Failure, FailureReason, TxnError, TxnResult};
use crate::hooks::stages;

impl Attempt {
    /// Stage the creation of a document.
    ///
    /// The document must not exist in this attempt's view; a live document
    /// surfaces as a document-exists failure.
    pub fn insert(&self, keyspace: &KeySpace, key: &str, value: &Value) -> TxnResult<TxnGetResult> {
        self.begin_op()?;
        let result = self.insert_inner(keyspace, key, value);
        self.end_op();
        result.map_err(|failure| self.record_failure(failure).into())
    }

    /// Stage a replacement of a previously read document.
    pub fn replace(&self, doc: &TxnGetResult, value: &Value) -> TxnResult<TxnGetResult> {
        self.begin_op()?;
        let result = self.replace_inner(doc, value);
        self.end_op();
        match result {
            Ok(Some(doc)) => Ok(doc),
            Ok(None) => Err(TxnError::DocumentNotFound),
            Err(failure) => Err(self.record_failure(failure).into()),
        }
    }

    /// Stage the removal of a previously read document.
    pub fn remove(&self, doc: &TxnGetResult) -> TxnResult<()> {
        self.begin_op()?;
        let result = self.remove_inner(doc);
        self.end_op();
        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(TxnError::DocumentNotFound),
            Err(failure) => Err(self.record_failure(failure).into()),
        }
    }

    fn insert_inner(
        &self,
        keyspace: &KeySpace,
        key: &str,
        value: &Value,
    ) -> Result<TxnGetResult, Failure> {
        self.check_expired(stages::INSERT, Some(key), false)?;

        if let Some(existing) = self.staged_for(keyspace, key) {
            // Inserting over our own staged remove resurrects the document
            // as a single staged replace.
            if existing.op_type != StagedOpType::Remove {
                return Err(Failure::new(ErrorCause::Kv(KvError::DocumentExists)).no_retry());
            }
            let staged = self.stage_write(
                keyspace,
                key,
                StagedOpType::Replace,
                Some(value.clone()),
                existing.restore_cas,
                existing.cas,
                stages::INSERT,
            )?;
            return Ok(TxnGetResult {
                keyspace: keyspace.clone(),
                key: key.to_string(),
                cas: staged,
                value: Self::json_bytes(value)?,
            });
        }

        let atr = self.ensure_atr_pending(keyspace, key)?;
        let block = self.staged_block(&atr, StagedOpType::Insert, Some(value.clone()), None);
        self.publish_staged_list_with(StagedMutation {
            op_type: StagedOpType::Insert,
            keyspace: keyspace.clone(),
            key: key.to_string(),
            cas: Cas::ZERO,
            restore_cas: None,
            staged_value: Some(value.clone()),
        })?;

        let client = self.client_for(keyspace)?;
        let mut cas = Cas::ZERO;
        loop {
            self.check_expired(stages::INSERT, Some(key), false)?;
            let flags = if cas.is_set() {
                // Retrying onto an existing tombstone.
                DocFlags {
                    access_deleted: true,
                    ..DocFlags::default()
                }
            } else {
                DocFlags {
                    add_doc: true,
                    create_as_deleted: true,
                    access_deleted: true,
                    ..DocFlags::default()
                }
            };
            let ops = Self::staged_block_ops(&block)?;
            let result = self.hooks().before_staged_insert(key).and_then(|_| {
                client.mutate_in(MutateInOptions {
                    keyspace: keyspace.clone(),
                    key: key.to_string(),
                    ops,
                    cas,
                    durability: self.durability(),
                    flags,
                    deadline: self.deadline(),
                })
            });
            match result {
                Ok(mutated) => {
                    self.note_units(mutated.resource_units);
                    self.hooks()
                        .after_staged_insert(key)
                        .map_err(|err| Failure::new(ErrorCause::Kv(err)))?;
                    self.record_staged(StagedMutation {
                        op_type: StagedOpType::Insert,
                        keyspace: keyspace.clone(),
                        key: key.to_string(),
                        cas: mutated.cas,
                        restore_cas: None,
                        staged_value: Some(value.clone()),
                    });
                    return Ok(TxnGetResult {
                        keyspace: keyspace.clone(),
                        key: key.to_string(),
                        cas: mutated.cas,
                        value: Self::json_bytes(value)?,
                    });
                }
                Err(err) => {
                    let failure = Failure::new(ErrorCause::Kv(err));
                    match failure.class {
                        ErrorClass::DocExists | ErrorClass::CasMismatch => {
                            cas = self.resolve_insert_conflict(keyspace, key, &block)?;
                        }
                        ErrorClass::Ambiguous => match self.find_own_block(keyspace, key)? {
                            Some(found) => {
                                self.record_staged(StagedMutation {
                                    op_type: StagedOpType::Insert,
                                    keyspace: keyspace.clone(),
                                    key: key.to_string(),
                                    cas: found,
                                    restore_cas: None,
                                    staged_value: Some(value.clone()),
                                });
                                return Ok(TxnGetResult {
                                    keyspace: keyspace.clone(),
                                    key: key.to_string(),
                                    cas: found,
                                    value: Self::json_bytes(value)?,
                                });
                            }
                            None => thread::sleep(RETRY_BACKOFF),
                        },
                        ErrorClass::Transient => return Err(failure),
                        ErrorClass::Expiry => {
                            return Err(failure.no_retry().with_reason(FailureReason::Expired))
                        }
                        _ => return Err(failure.no_retry()),
                    }
                }
            }
        }
    }

    /// Work out why a staged-insert write hit an existing document and
    /// return the CAS to retry with.
    fn resolve_insert_conflict(
        &self,
        keyspace: &KeySpace,
        key: &str,
        _block: &TxnXattr,
    ) -> Result<Cas, Failure> {
        let client = self.client_for(keyspace)?;
        let lookup = client
            .lookup_in(LookupInOptions {
                keyspace: keyspace.clone(),
                key: key.to_string(),
                ops: vec![LookupInOp::xattr(paths::ROOT)],
                access_deleted: true,
                deadline: self.deadline(),
            })
            .map_err(|err| {
                let failure = Failure::new(ErrorCause::Kv(err));
                match failure.class {
                    ErrorClass::DocNotFound | ErrorClass::Transient | ErrorClass::Ambiguous => {
                        failure
                    }
                    _ => failure.no_retry(),
                }
            })?;
        let txn: Option<TxnXattr> = lookup
            .content(0)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)).no_retry())?;
        match txn {
            // A plain tombstone; stage onto it CAS-guarded.
            None if lookup.is_deleted => Ok(lookup.cas),
            // A live document with no transactional state.
            None => Err(Failure::new(ErrorCause::Kv(KvError::DocumentExists)).no_retry()),
            Some(block) if block.id.attempt_id == self.id() => Ok(lookup.cas),
            Some(block) => {
                self.write_write_poll(
                    &block,
                    ForwardCompatStage::WriteWriteConflictInserting,
                    stages::INSERT,
                    key,
                )?;
                Ok(lookup.cas)
            }
        }
    }

    fn replace_inner(
        &self,
        doc: &TxnGetResult,
        value: &Value,
    ) -> Result<Option<TxnGetResult>, Failure> {
        self.check_expired(stages::REPLACE, Some(&doc.key), false)?;

        let existing = self.staged_for(&doc.keyspace, &doc.key);
        let (cas, restore_cas) = match existing {
            // Replacing our own staged remove is a lost update; the caller's
            // read predates the remove.
            Some(m) if m.op_type == StagedOpType::Remove => return Ok(None),
            // Folding onto our own staged write keeps a single staged
            // mutation; a staged insert retypes to a staged replace.
            Some(m) => (m.cas, m.restore_cas),
            None => {
                self.check_foreign_block(
                    &doc.keyspace,
                    &doc.key,
                    ForwardCompatStage::WriteWriteConflictReplacing,
                    stages::REPLACE,
                )?;
                (doc.cas, Some(doc.cas))
            }
        };

        let staged_cas = self.stage_write(
            &doc.keyspace,
            &doc.key,
            StagedOpType::Replace,
            Some(value.clone()),
            restore_cas,
            cas,
            stages::REPLACE,
        )?;
        Ok(Some(TxnGetResult {
            keyspace: doc.keyspace.clone(),
            key: doc.key.clone(),
            cas: staged_cas,
            value: Self::json_bytes(value)?,
        }))
    }

    fn remove_inner(&self, doc: &TxnGetResult) -> Result<bool, Failure> {
        self.check_expired(stages::REMOVE, Some(&doc.key), false)?;

        let existing = self.staged_for(&doc.keyspace, &doc.key);
        let (cas, restore_cas) = match existing {
            Some(m) if m.op_type == StagedOpType::Remove => return Ok(false),
            // Removing our own staged insert cancels it entirely.
            Some(m) if m.op_type == StagedOpType::Insert => {
                self.unstage_insert(&doc.keyspace, &doc.key, m.cas)?;
                return Ok(true);
            }
            Some(m) => (m.cas, m.restore_cas),
            None => {
                self.check_foreign_block(
                    &doc.keyspace,
                    &doc.key,
                    ForwardCompatStage::WriteWriteConflictRemoving,
                    stages::REMOVE,
                )?;
                (doc.cas, Some(doc.cas))
            }
        };

        self.stage_write(
            &doc.keyspace,
            &doc.key,
            StagedOpType::Remove,
            None,
            restore_cas,
            cas,
            stages::REMOVE,
        )?;
        Ok(true)
    }

    /// Write (or rewrite) the staged block on an existing document under a
    /// CAS guard, then record the staged mutation.
    #[allow(clippy::too_many_arguments)]
    fn stage_write(
        &self,
        keyspace: &KeySpace,
        key: &str,
        op_type: StagedOpType,
        value: Option<Value>,
        restore_cas: Option<Cas>,
        cas: Cas,
        stage: &'static str,
    ) -> Result<Cas, Failure> {
        let atr = self.ensure_atr_pending(keyspace, key)?;
        let restore = restore_cas.map(|c| TxnXattrRestore {
            cas: c.to_hex(),
            exptime: 0,
            revid: None,
        });
        let block = self.staged_block(&atr, op_type, value.clone(), restore);
        self.publish_staged_list_with(StagedMutation {
            op_type,
            keyspace: keyspace.clone(),
            key: key.to_string(),
            cas,
            restore_cas,
            staged_value: value.clone(),
        })?;

        let client = self.client_for(keyspace)?;
        loop {
            self.check_expired(stage, Some(key), false)?;
            let result = self
                .before_stage_hook(stage, key)
                .and_then(|_| {
                    client.mutate_in(MutateInOptions {
                        keyspace: keyspace.clone(),
                        key: key.to_string(),
                        ops: Self::staged_block_ops(&block)?,
                        cas,
                        durability: self.durability(),
                        flags: DocFlags {
                            access_deleted: true,
                            ..DocFlags::default()
                        },
                        deadline: self.deadline(),
                    })
                    .map_err(|err| Failure::new(ErrorCause::Kv(err)))
                });
            match result {
                Ok(mutated) => {
                    self.note_units(mutated.resource_units);
                    self.after_stage_hook(stage, key)
                        .map_err(|err| Failure::new(ErrorCause::Kv(err)))?;
                    self.record_staged(StagedMutation {
                        op_type,
                        keyspace: keyspace.clone(),
                        key: key.to_string(),
                        cas: mutated.cas,
                        restore_cas,
                        staged_value: value.clone(),
                    });
                    return Ok(mutated.cas);
                }
                Err(failure) => match failure.class {
                    // An ambiguous write that did land shows up as our own
                    // block; one that did not is retried with the same CAS.
                    ErrorClass::Ambiguous => match self.find_own_block(keyspace, key)? {
                        Some(found) => {
                            self.record_staged(StagedMutation {
                                op_type,
                                keyspace: keyspace.clone(),
                                key: key.to_string(),
                                cas: found,
                                restore_cas,
                                staged_value: value.clone(),
                            });
                            return Ok(found);
                        }
                        None => thread::sleep(RETRY_BACKOFF),
                    },
                    // Someone mutated the document after our read.
                    ErrorClass::CasMismatch | ErrorClass::DocNotFound => return Err(failure),
                    ErrorClass::Transient => return Err(failure),
                    ErrorClass::Expiry => {
                        return Err(failure.no_retry().with_reason(FailureReason::Expired))
                    }
                    _ => return Err(failure.no_retry()),
                },
            }
        }
    }

    /// Cancel a staged insert: strip the block from the tombstone and drop
    /// the mutation from the attempt.
    fn unstage_insert(&self, keyspace: &KeySpace, key: &str, cas: Cas) -> Result<(), Failure> {
        let client = self.client_for(keyspace)?;
        loop {
            self.check_expired(stages::REMOVE, Some(key), false)?;
            let result = self.hooks().before_staged_remove(key).and_then(|_| {
                client.mutate_in(MutateInOptions {
                    keyspace: keyspace.clone(),
                    key: key.to_string(),
                    ops: vec![MutateInOp::xattr_delete(paths::ROOT)],
                    cas,
                    durability: self.durability(),
                    flags: DocFlags {
                        access_deleted: true,
                        ..DocFlags::default()
                    },
                    deadline: self.deadline(),
                })
            });
            match result {
                Ok(_) => {
                    self.hooks()
                        .after_staged_remove(key)
                        .map_err(|err| Failure::new(ErrorCause::Kv(err)))?;
                    self.drop_staged(keyspace, key);
                    let atr = self.atr_location().ok_or_else(Self::missing_staged)?;
                    let staged = self.lock().staged.clone();
                    self.update_atr_lists(&atr, &staged)?;
                    return Ok(());
                }
                Err(err) => {
                    let failure = Failure::new(ErrorCause::Kv(err));
                    match failure.class {
                        ErrorClass::Ambiguous => thread::sleep(RETRY_BACKOFF),
                        // The tombstone is already gone; nothing to cancel.
                        ErrorClass::DocNotFound | ErrorClass::PathNotFound => {
                            self.drop_staged(keyspace, key);
                            return Ok(());
                        }
                        ErrorClass::Transient => return Err(failure),
                        ErrorClass::Expiry => {
                            return Err(failure.no_retry().with_reason(FailureReason::Expired))
                        }
                        _ => return Err(failure.no_retry()),
                    }
                }
            }
        }
    }

    /// Fail or wait if another attempt holds a staged mutation on the
    /// document the caller is about to stage onto.
    fn check_foreign_block(
        &self,
        keyspace: &KeySpace,
        key: &str,
        fc_stage: ForwardCompatStage,
        stage: &'static str,
    ) -> Result<(), Failure> {
        let client = self.client_for(keyspace)?;
        let lookup = match client.lookup_in(LookupInOptions {
            keyspace: keyspace.clone(),
            key: key.to_string(),
            ops: vec![LookupInOp::xattr(paths::ROOT)],
            access_deleted: true,
            deadline: self.deadline(),
        }) {
            Ok(lookup) => lookup,
            Err(KvError::DocumentNotFound) => return Ok(()),
            Err(err) => return Err(Failure::new(ErrorCause::Kv(err))),
        };
        let txn: Option<TxnXattr> = lookup
            .content(0)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)).no_retry())?;
        match txn {
            Some(block) if block.id.attempt_id != self.id() => {
                self.write_write_poll(&block, fc_stage, stage, key)
            }
            _ => Ok(()),
        }
    }

    /// Poll the foreign attempt's ATR entry until it finishes, within a
    /// bounded budget; past the budget the conflict is surfaced as a
    /// retryable failure.
    pub(crate) fn write_write_poll(
        &self,
        block: &TxnXattr,
        fc_stage: ForwardCompatStage,
        stage: &'static str,
        key: &str,
    ) -> Result<(), Failure> {
        self.forward_compat_gate(fc_stage, block.forward_compat.as_ref())?;
        let poll_deadline = Instant::now() + WRITE_WRITE_POLL_BUDGET;
        loop {
            self.check_expired(stage, Some(key), false)?;
            let entry = self.read_foreign_atr_entry(
                &block.atr,
                &block.id.attempt_id,
                ForwardCompatStage::WriteWriteConflictReadingAtr,
            )?;
            match entry.and_then(|e| e.state) {
                None | Some(AtrState::Completed) | Some(AtrState::RolledBack) => return Ok(()),
                _ => {
                    if Instant::now() >= poll_deadline {
                        return Err(Failure::new(ErrorCause::WriteWriteConflict {
                            key: key.to_string(),
                        }));
                    }
                    thread::sleep(WRITE_WRITE_POLL_INTERVAL);
                }
            }
        }
    }

    /// Look for this attempt's own block on a document, to resolve an
    /// ambiguous staging write.
    pub(crate) fn find_own_block(
        &self,
        keyspace: &KeySpace,
        key: &str,
    ) -> Result<Option<Cas>, Failure> {
        let client = self.client_for(keyspace)?;
        let lookup = match client.lookup_in(LookupInOptions {
            keyspace: keyspace.clone(),
            key: key.to_string(),
            ops: vec![LookupInOp::xattr(paths::ATTEMPT_ID)],
            access_deleted: true,
            deadline: self.deadline(),
        }) {
            Ok(lookup) => lookup,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(err) => return Err(Failure::new(ErrorCause::Kv(err))),
        };
        let attempt_id: Option<String> = lookup
            .content(0)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)).no_retry())?;
        Ok((attempt_id.as_deref() == Some(self.id())).then_some(lookup.cas))
    }

    /// Select and write the PENDING entry if this attempt has none yet.
    ///
    /// Concurrent first writers race through a single initialiser; the
    /// losers wait on the condvar rather than writing a second entry.
    pub(crate) fn ensure_atr_pending(
        &self,
        keyspace: &KeySpace,
        key: &str,
    ) -> Result<AtrLocation, Failure> {
        loop {
            let mut inner = self.lock();
            if let Some(atr) = inner.atr.clone() {
                return Ok(atr);
            }
            if inner.atr_initialising {
                self.wait(&mut inner);
                continue;
            }
            inner.atr_initialising = true;
            drop(inner);

            let location = self.select_atr_location(keyspace, key);
            let result = self.set_atr_pending(&location);

            let mut inner = self.lock();
            inner.atr_initialising = false;
            match result {
                Ok(()) => {
                    inner.atr = Some(location.clone());
                    inner.state = AttemptState::Pending;
                    drop(inner);
                    self.notify();
                    if let Some(lost) = self.lost_cleaner() {
                        lost.add_location(location.keyspace.clone());
                    }
                    return Ok(location);
                }
                Err(failure) => {
                    drop(inner);
                    self.notify();
                    return Err(failure);
                }
            }
        }
    }

    fn select_atr_location(&self, keyspace: &KeySpace, key: &str) -> AtrLocation {
        let keyspace = self
            .custom_atr_location()
            .cloned()
            .unwrap_or_else(|| keyspace.clone());
        let index = self
            .hooks()
            .random_atr_index()
            .map(|i| i % self.num_atrs().max(1))
            .unwrap_or_else(|| atr_index_for_key(key.as_bytes(), self.num_atrs()));
        AtrLocation {
            keyspace,
            key: atr_key_for_index(index),
        }
    }

    fn staged_block(
        &self,
        atr: &AtrLocation,
        op_type: StagedOpType,
        staged: Option<Value>,
        restore: Option<TxnXattrRestore>,
    ) -> TxnXattr {
        TxnXattr {
            id: TxnXattrId {
                transaction_id: self.transaction_id().to_string(),
                attempt_id: self.id().to_string(),
            },
            atr: TxnXattrAtr {
                key: atr.key.clone(),
                bucket: atr.keyspace.bucket.clone(),
                scope: atr.keyspace.scope.clone(),
                collection: atr.keyspace.collection.clone(),
            },
            op: TxnXattrOp {
                op_type,
                staged,
                crc32: None,
            },
            restore,
            forward_compat: None,
        }
    }

    fn staged_block_ops(block: &TxnXattr) -> Result<Vec<MutateInOp>, Failure> {
        Ok(vec![
            MutateInOp::xattr_set(paths::ROOT, Self::json_bytes(block)?),
            MutateInOp::xattr_set(paths::CRC32, Self::json_bytes(&MACRO_VALUE_CRC32C)?)
                .with_macros(),
        ])
    }

    /// Publish the ATR doc lists as they will look once the given mutation
    /// is staged. Runs before the document write so a crashed attempt's
    /// entry always names every document it may have touched.
    fn publish_staged_list_with(&self, mutation: StagedMutation) -> Result<(), Failure> {
        let atr = match self.atr_location() {
            Some(atr) => atr,
            None => return Ok(()),
        };
        let mut staged = self.lock().staged.clone();
        staged.retain(|m| !m.targets(&mutation.keyspace, &mutation.key));
        staged.push(mutation);
        self.update_atr_lists(&atr, &staged)
    }

    fn staged_for(&self, keyspace: &KeySpace, key: &str) -> Option<StagedMutation> {
        self.lock()
            .staged
            .iter()
            .find(|m| m.targets(keyspace, key))
            .cloned()
    }

    fn record_staged(&self, mutation: StagedMutation) {
        let mut inner = self.lock();
        inner
            .staged
            .retain(|m| !m.targets(&mutation.keyspace, &mutation.key));
        inner.staged.push(mutation);
    }

    fn drop_staged(&self, keyspace: &KeySpace, key: &str) {
        self.lock().staged.retain(|m| !m.targets(keyspace, key));
    }

    fn missing_staged() -> Failure {
        Failure::new(ErrorCause::IllegalState(
            "staged mutation disappeared mid-operation".to_string(),
        ))
        .no_retry()
    }

    fn before_stage_hook(&self, stage: &'static str, key: &str) -> Result<(), Failure> {
        let result = match stage {
            stages::REPLACE => self.hooks().before_staged_replace(key),
            stages::REMOVE => self.hooks().before_staged_remove(key),
            _ => self.hooks().before_staged_insert(key),
        };
        result.map_err(|err| Failure::new(ErrorCause::Kv(err)))
    }

    fn after_stage_hook(&self, stage: &'static str, key: &str) -> Result<(), KvError> {
        match stage {
            stages::REPLACE => self.hooks().after_staged_replace(key),
            stages::REMOVE => self.hooks().after_staged_remove(key),
            _ => self.hooks().after_staged_insert(key),
        }
    }
}
