//! Regular cleanup of this client's own unfinished attempts.
//!
//! Every attempt that did not finish cleanly is queued here. A background
//! thread drains the queue and finishes each attempt's protocol on its
//! behalf: completing committed attempts, rolling back pending and aborted
//! ones, and deleting the ATR entry. Everything is idempotent and guarded,
//! so racing the application, another cleanup pass, or lost cleanup is
//! safe.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use txnkv_kv::{
    BucketProvider, Cas, DeleteOptions, DocFlags, DurabilityLevel, KeySpace, KvClient, KvError,
    LookupInOp, LookupInOptions, MutateInOp, MutateInOpType, MutateInOptions, ResourceUnits,
    StoreOptions, VATTR_DOCUMENT,
};
use txnkv_protocol::atr::{attempt_field, attempt_path, fields};
use txnkv_protocol::doc::paths;
use txnkv_protocol::{
    check_forward_compat, AtrState, ForwardCompatDecision, ForwardCompatMap, ForwardCompatStage,
    StagedOpType, TxnXattr,
};

use crate::attempt::AtrLocation;
use crate::error::{classify_kv, ErrorClass, ErrorCause, Failure};
use crate::hooks::CleanupHooks;

/// How long the drainer blocks on the queue before checking for shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Requests older than this are suspicious enough to log about.
const STALE_REQUEST_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// A document an unfinished attempt staged onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRecord {
    /// Keyspace of the document.
    pub keyspace: KeySpace,
    /// Document key.
    pub key: String,
}

/// Everything cleanup needs to finish one attempt.
#[derive(Debug, Clone)]
pub struct CleanupRequest {
    /// Owning transaction's ID.
    pub transaction_id: String,
    /// The attempt's ID.
    pub attempt_id: String,
    /// Where the attempt's ATR entry lives.
    pub atr: AtrLocation,
    /// The state the attempt was last known to be in.
    pub state: AtrState,
    /// Documents with staged inserts.
    pub inserts: Vec<DocRecord>,
    /// Documents with staged replaces.
    pub replaces: Vec<DocRecord>,
    /// Documents with staged removes.
    pub removes: Vec<DocRecord>,
    /// Forward-compatibility requirements read from the entry, if any.
    pub forward_compat: Option<ForwardCompatMap>,
    /// Durability to clean up with.
    pub durability: DurabilityLevel,
    /// When the request entered the queue.
    pub enqueued_at: Instant,
}

/// The regular cleanup queue and its drainer thread.
pub struct Cleaner {
    provider: Arc<dyn BucketProvider>,
    hooks: Arc<dyn CleanupHooks>,
    kv_timeout: Duration,
    tx: SyncSender<CleanupRequest>,
    rx: Mutex<Receiver<CleanupRequest>>,
    queued: AtomicUsize,
    units: Mutex<ResourceUnits>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Cleaner {
    /// Start the drainer thread over a bounded queue.
    pub(crate) fn start(
        provider: Arc<dyn BucketProvider>,
        hooks: Arc<dyn CleanupHooks>,
        kv_timeout: Duration,
        queue_size: usize,
    ) -> Arc<Cleaner> {
        let (tx, rx) = sync_channel(queue_size);
        let stop = Arc::new(AtomicBool::new(false));
        let cleaner = Arc::new(Cleaner {
            provider,
            hooks,
            kv_timeout,
            tx,
            rx: Mutex::new(rx),
            queued: AtomicUsize::new(0),
            units: Mutex::new(ResourceUnits::default()),
            stop: stop.clone(),
            handle: Mutex::new(None),
        });
        let worker = cleaner.clone();
        let handle = std::thread::Builder::new()
            .name("txnkv-cleanup".to_string())
            .spawn(move || worker.drain())
            .ok();
        *cleaner.handle.lock() = handle;
        cleaner
    }

    fn drain(&self) {
        loop {
            match self.pop_request() {
                Some(request) => self.process(&request),
                None => {
                    if self.stop.load(Ordering::SeqCst) {
                        // Finish whatever is still queued before exiting.
                        self.force_drain();
                        return;
                    }
                    std::thread::sleep(DRAIN_POLL);
                }
            }
        }
    }

    fn process(&self, request: &CleanupRequest) {
        if let Err(failure) = self.cleanup_attempt(request) {
            tracing::debug!(
                attempt = request.attempt_id,
                atr = request.atr.key,
                error = %failure,
                "cleanup attempt failed; leaving for lost cleanup"
            );
        }
    }

    /// Queue a request, dropping it (for lost cleanup to find) if the queue
    /// is full.
    pub fn add_request(&self, request: CleanupRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(request)) => {
                tracing::debug!(
                    attempt = request.attempt_id,
                    "cleanup queue full; dropping request"
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Take the oldest queued request, if any.
    pub fn pop_request(&self) -> Option<CleanupRequest> {
        match self.rx.lock().try_recv() {
            Ok(request) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Some(request)
            }
            Err(_) => None,
        }
    }

    /// Process every queued request on the calling thread.
    pub fn force_drain(&self) {
        while let Some(request) = self.pop_request() {
            self.process(&request);
        }
    }

    /// Number of requests waiting in the queue.
    pub fn queue_length(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Resource units the servers reported for cleanup operations since the
    /// last call; reading resets the tally.
    pub fn resource_units(&self) -> ResourceUnits {
        std::mem::take(&mut *self.units.lock())
    }

    fn note_units(&self, units: Option<ResourceUnits>) {
        if let Some(units) = units {
            self.units.lock().add(units);
        }
    }

    /// Stop the drainer, letting it finish queued requests first.
    pub(crate) fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.kv_timeout)
    }

    fn client(&self, keyspace: &KeySpace) -> Result<Arc<dyn KvClient>, Failure> {
        self.provider
            .bucket(&keyspace.bucket)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))
    }

    /// Finish one attempt: resolve its staged documents per its state, then
    /// remove its ATR entry.
    pub fn cleanup_attempt(&self, request: &CleanupRequest) -> Result<(), Failure> {
        match check_forward_compat(
            ForwardCompatStage::CleanupEntry,
            request.forward_compat.as_ref(),
        ) {
            ForwardCompatDecision::Ok => {}
            _ => {
                return Err(Failure::new(ErrorCause::ForwardCompat {
                    stage: ForwardCompatStage::CleanupEntry.as_str(),
                }))
            }
        }
        if request.enqueued_at.elapsed() > STALE_REQUEST_AGE {
            tracing::warn!(
                attempt = request.attempt_id,
                "cleaning up very old attempt; check for a stuck client"
            );
        }
        self.cleanup_docs(request)?;
        self.cleanup_atr(request)
    }

    fn cleanup_docs(&self, request: &CleanupRequest) -> Result<(), Failure> {
        match request.state {
            AtrState::Committed => {
                for doc in request.inserts.iter().chain(&request.replaces) {
                    self.commit_staged_doc(request, doc)?;
                }
                for doc in &request.removes {
                    self.remove_staged_doc(request, doc)?;
                }
                Ok(())
            }
            AtrState::Pending | AtrState::Aborted => {
                for doc in request
                    .inserts
                    .iter()
                    .chain(&request.replaces)
                    .chain(&request.removes)
                {
                    self.strip_staged_doc(request, doc)?;
                }
                Ok(())
            }
            // Completed and rolled back entries have no staged documents
            // left; unknown states are left alone.
            _ => Ok(()),
        }
    }

    /// Read a document's staged block if it still belongs to the attempt
    /// being cleaned up.
    fn staged_doc(
        &self,
        request: &CleanupRequest,
        doc: &DocRecord,
        verify_crc: bool,
    ) -> Result<Option<(TxnXattr, Cas)>, Failure> {
        let client = self.client(&doc.keyspace)?;
        let result = self.hooks.before_doc_get(&doc.key).and_then(|_| {
            client.lookup_in(LookupInOptions {
                keyspace: doc.keyspace.clone(),
                key: doc.key.clone(),
                ops: vec![
                    LookupInOp::xattr(paths::ROOT),
                    LookupInOp::xattr(VATTR_DOCUMENT),
                ],
                access_deleted: true,
                deadline: self.deadline(),
            })
        });
        let lookup = match result {
            Ok(lookup) => lookup,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(err) => return Err(Failure::new(ErrorCause::Kv(err))),
        };
        self.note_units(lookup.resource_units);
        let block: Option<TxnXattr> = lookup
            .content(0)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))?;
        let block = match block {
            Some(block) if block.id.attempt_id == request.attempt_id => block,
            // No block, or a later attempt's; this document is done.
            _ => return Ok(None),
        };
        if verify_crc {
            // If the visible body changed since staging, committing the
            // staged value would overwrite someone else's write.
            let meta: Option<Value> = lookup
                .content(1)
                .map_err(|err| Failure::new(ErrorCause::Kv(err)))?;
            let current_crc = meta
                .as_ref()
                .and_then(|m| m.get("value_crc32c"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if block.op.crc32.is_some() && current_crc.is_some() && block.op.crc32 != current_crc {
                tracing::debug!(
                    key = doc.key,
                    "document changed since staging; skipping cleanup commit"
                );
                return Ok(None);
            }
        }
        Ok(Some((block, lookup.cas)))
    }

    fn commit_staged_doc(&self, request: &CleanupRequest, doc: &DocRecord) -> Result<(), Failure> {
        let (block, cas) = match self.staged_doc(request, doc, true)? {
            Some(found) => found,
            None => return Ok(()),
        };
        let staged = match &block.op.staged {
            Some(staged) => staged.clone(),
            None => return Ok(()),
        };
        let encoded = serde_json::to_vec(&staged)
            .map_err(|err| Failure::new(ErrorCause::Kv(KvError::encoding(err))))?;
        let client = self.client(&doc.keyspace)?;
        let result = self
            .hooks
            .before_commit_doc(&doc.key)
            .and_then(|_| match block.op.op_type {
                StagedOpType::Insert => client
                    .add(StoreOptions {
                        keyspace: doc.keyspace.clone(),
                        key: doc.key.clone(),
                        value: encoded.clone(),
                        cas: Cas::ZERO,
                        durability: request.durability,
                        deadline: self.deadline(),
                    })
                    .map(|res| self.note_units(res.resource_units)),
                _ => client
                    .mutate_in(MutateInOptions {
                        keyspace: doc.keyspace.clone(),
                        key: doc.key.clone(),
                        ops: vec![
                            MutateInOp::xattr_delete(paths::ROOT),
                            MutateInOp::set_doc(encoded.clone()),
                        ],
                        cas,
                        durability: request.durability,
                        flags: DocFlags::default(),
                        deadline: self.deadline(),
                    })
                    .map(|res| self.note_units(res.resource_units)),
            });
        match result {
            Ok(()) => Ok(()),
            // A replace staged over an insert lives on a tombstone.
            Err(KvError::DocumentNotFound) => client
                .add(StoreOptions {
                    keyspace: doc.keyspace.clone(),
                    key: doc.key.clone(),
                    value: encoded,
                    cas: Cas::ZERO,
                    durability: request.durability,
                    deadline: self.deadline(),
                })
                .map(|res| self.note_units(res.resource_units))
                .or_else(Self::ignore_benign)
                .map_err(|err| Failure::new(ErrorCause::Kv(err))),
            Err(err) => Self::ignore_benign(err).map_err(|err| Failure::new(ErrorCause::Kv(err))),
        }
    }

    fn remove_staged_doc(&self, request: &CleanupRequest, doc: &DocRecord) -> Result<(), Failure> {
        let (_, cas) = match self.staged_doc(request, doc, false)? {
            Some(found) => found,
            None => return Ok(()),
        };
        let client = self.client(&doc.keyspace)?;
        self.hooks
            .before_remove_doc_staged_for_removal(&doc.key)
            .and_then(|_| {
                client
                    .delete(DeleteOptions {
                        keyspace: doc.keyspace.clone(),
                        key: doc.key.clone(),
                        cas,
                        durability: request.durability,
                        deadline: self.deadline(),
                    })
                    .map(|res| self.note_units(res.resource_units))
            })
            .or_else(Self::ignore_benign)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))
    }

    /// Roll back one document by stripping the staged block. A staged
    /// insert's carrier tombstone holds nothing else, so stripping the
    /// block erases the document entirely.
    fn strip_staged_doc(&self, request: &CleanupRequest, doc: &DocRecord) -> Result<(), Failure> {
        let (_, cas) = match self.staged_doc(request, doc, false)? {
            Some(found) => found,
            None => return Ok(()),
        };
        let client = self.client(&doc.keyspace)?;
        self.hooks
            .before_remove_links(&doc.key)
            .and_then(|_| {
                client
                    .mutate_in(MutateInOptions {
                        keyspace: doc.keyspace.clone(),
                        key: doc.key.clone(),
                        ops: vec![MutateInOp::xattr_delete(paths::ROOT)],
                        cas,
                        durability: request.durability,
                        flags: DocFlags {
                            access_deleted: true,
                            ..DocFlags::default()
                        },
                        deadline: self.deadline(),
                    })
                    .map(|res| self.note_units(res.resource_units))
            })
            .or_else(Self::ignore_benign)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))
    }

    /// Delete the attempt's ATR entry.
    ///
    /// An entry still in PENDING gets a sentinel field added first in the
    /// same atomic mutation, so a concurrent staging write (which adds
    /// fields with `DictAdd`) cannot resurrect a half-deleted entry.
    fn cleanup_atr(&self, request: &CleanupRequest) -> Result<(), Failure> {
        let client = self.client(&request.atr.keyspace)?;
        let mut ops = Vec::new();
        if request.state == AtrState::Pending {
            ops.push(MutateInOp {
                op: MutateInOpType::DictAdd,
                path: attempt_field(&request.attempt_id, fields::PENDING_SENTINEL),
                value: b"0".to_vec(),
                xattr: true,
                create_path: false,
                expand_macros: false,
            });
        }
        ops.push(MutateInOp::xattr_delete(attempt_path(&request.attempt_id)));
        self.hooks
            .before_atr_remove(&request.atr.key)
            .and_then(|_| {
                client
                    .mutate_in(MutateInOptions {
                        keyspace: request.atr.keyspace.clone(),
                        key: request.atr.key.clone(),
                        ops,
                        cas: Cas::ZERO,
                        durability: request.durability,
                        flags: DocFlags::default(),
                        deadline: self.deadline(),
                    })
                    .map(|res| self.note_units(res.resource_units))
            })
            .or_else(Self::ignore_benign)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))
    }

    /// Errors that mean another actor already finished this step.
    fn ignore_benign(err: KvError) -> Result<(), KvError> {
        match classify_kv(&err) {
            ErrorClass::DocNotFound
            | ErrorClass::PathNotFound
            | ErrorClass::PathExists
            | ErrorClass::DocExists
            | ErrorClass::CasMismatch => Ok(()),
            _ => Err(err),
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("kv_timeout", &self.kv_timeout)
            .finish_non_exhaustive()
    }
}
