//! Lost-transaction cleanup.
//!
//! Attempts whose client crashed leave ATR entries nobody will finish. A
//! background thread per monitored keyspace scans that keyspace's ATRs for
//! expired entries and hands them to the cleanup logic. Multiple clients
//! coordinate through a per-keyspace client record: each heartbeats its own
//! entry, learns which peers are live, and scans a disjoint share of the
//! ATRs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use txnkv_kv::{
    BucketProvider, Cas, DocFlags, DurabilityLevel, KeySpace, KvClient, KvError, LookupInOp,
    LookupInOptions, MutateInOp, MutateInOptions, MACRO_CAS, VATTR_HLC,
};
use txnkv_protocol::atr::ATTEMPTS_PATH;
use txnkv_protocol::client_record::{
    client_field, client_path, fields as record_fields, ClientRecords, CLIENTS_PATH,
    CLIENT_RECORD_KEY, RECORDS_PATH,
};
use txnkv_protocol::{
    atr_key_for_index, shards_for_client, AtrAttempts, AtrState, HlcPayload,
};

use crate::attempt::AtrLocation;
use crate::cleanup::{Cleaner, CleanupRequest, DocRecord};
use crate::error::{ErrorCause, Failure};
use crate::hooks::{CleanupHooks, ClientRecordHooks};

/// Granularity of interruptible sleeps.
const SLEEP_CHUNK: Duration = Duration::from_millis(50);

/// Extra slack added to the liveness window written into the client record.
const EXPIRY_SLACK: Duration = Duration::from_secs(20);

/// At most this many expired peer entries are evicted per heartbeat.
const MAX_EVICTIONS: usize = 12;

/// Budget for unregistering this client on shutdown.
const UNREGISTER_BUDGET: Duration = Duration::from_millis(500);
const UNREGISTER_RETRY: Duration = Duration::from_millis(10);

/// Lost-transaction cleanup across a set of monitored keyspaces.
pub struct LostCleaner {
    client_uuid: String,
    provider: Arc<dyn BucketProvider>,
    cleaner: Arc<Cleaner>,
    cleanup_hooks: Arc<dyn CleanupHooks>,
    record_hooks: Arc<dyn ClientRecordHooks>,
    kv_timeout: Duration,
    cleanup_window: Duration,
    num_atrs: usize,
    durability: DurabilityLevel,
    stop: Arc<AtomicBool>,
    locations: Mutex<HashMap<KeySpace, Arc<AtomicBool>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// What one heartbeat pass learned.
#[derive(Debug, Clone)]
pub struct Sharding {
    /// ATR indexes this client currently owns in the keyspace.
    pub shards: Vec<usize>,
    /// Pause between consecutive ATR scans to spread one full pass over the
    /// cleanup window.
    pub check_every: Duration,
}

impl LostCleaner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        provider: Arc<dyn BucketProvider>,
        cleaner: Arc<Cleaner>,
        cleanup_hooks: Arc<dyn CleanupHooks>,
        record_hooks: Arc<dyn ClientRecordHooks>,
        kv_timeout: Duration,
        cleanup_window: Duration,
        num_atrs: usize,
        durability: DurabilityLevel,
        locations: Vec<KeySpace>,
    ) -> Arc<LostCleaner> {
        let lost = Arc::new(LostCleaner {
            client_uuid: uuid::Uuid::new_v4().to_string(),
            provider,
            cleaner,
            cleanup_hooks,
            record_hooks,
            kv_timeout,
            cleanup_window,
            num_atrs,
            durability,
            stop: Arc::new(AtomicBool::new(false)),
            locations: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        });
        for keyspace in locations {
            lost.add_location(keyspace);
        }
        lost
    }

    /// This client's UUID in the client records it participates in.
    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    /// Start monitoring a keyspace. Idempotent.
    pub fn add_location(self: &Arc<Self>, keyspace: KeySpace) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        let mut locations = self.locations.lock();
        if locations.contains_key(&keyspace) {
            return;
        }
        let local_stop = Arc::new(AtomicBool::new(false));
        locations.insert(keyspace.clone(), local_stop.clone());
        drop(locations);

        let worker = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("txnkv-lost-{}", keyspace.bucket))
            .spawn(move || worker.run_location(keyspace, local_stop))
            .ok();
        if let Some(handle) = handle {
            self.handles.lock().push(handle);
        }
    }

    fn stopped(&self, local: &AtomicBool) -> bool {
        self.stop.load(Ordering::SeqCst) || local.load(Ordering::SeqCst)
    }

    fn sleep_while_running(&self, local: &AtomicBool, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped(local) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            std::thread::sleep(remaining.min(SLEEP_CHUNK));
        }
    }

    fn run_location(&self, keyspace: KeySpace, local_stop: Arc<AtomicBool>) {
        while !self.stopped(&local_stop) {
            let sharding = match self.process_client(&keyspace) {
                Ok(sharding) => sharding,
                Err(failure) => {
                    if matches!(
                        failure.cause,
                        ErrorCause::Kv(KvError::CollectionNotFound(_))
                            | ErrorCause::Kv(KvError::BucketNotFound(_))
                    ) {
                        tracing::info!(
                            keyspace = %keyspace,
                            "keyspace gone; dropping cleanup location"
                        );
                        self.locations.lock().remove(&keyspace);
                        return;
                    }
                    tracing::debug!(
                        keyspace = %keyspace,
                        error = %failure,
                        "client record pass failed"
                    );
                    self.sleep_while_running(&local_stop, Duration::from_secs(1));
                    continue;
                }
            };
            for index in &sharding.shards {
                if self.stopped(&local_stop) {
                    return;
                }
                if let Err(failure) = self.process_atr(&keyspace, *index) {
                    tracing::debug!(
                        keyspace = %keyspace,
                        atr = index,
                        error = %failure,
                        "ATR scan failed"
                    );
                }
                self.sleep_while_running(&local_stop, sharding.check_every);
            }
            if sharding.shards.is_empty() {
                self.sleep_while_running(&local_stop, self.cleanup_window);
            }
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

    /// One heartbeat pass against the keyspace's client record: make sure
    /// the record and our entry exist, evict dead peers, and work out which
    /// ATR shards we own.
    pub fn process_client(&self, keyspace: &KeySpace) -> Result<Sharding, Failure> {
        let client = self.client(keyspace)?;
        let lookup = match self.record_hooks.before_get_record().and_then(|_| {
            client.lookup_in(LookupInOptions {
                keyspace: keyspace.clone(),
                key: CLIENT_RECORD_KEY.to_string(),
                ops: vec![
                    LookupInOp::xattr(RECORDS_PATH),
                    LookupInOp::xattr(VATTR_HLC),
                ],
                access_deleted: false,
                deadline: self.deadline(),
            })
        }) {
            Ok(lookup) => lookup,
            Err(KvError::DocumentNotFound) => {
                self.create_client_record(keyspace)?;
                return Ok(Sharding {
                    shards: Vec::new(),
                    check_every: Duration::from_millis(1),
                });
            }
            Err(err) => return Err(Failure::new(ErrorCause::Kv(err))),
        };
        let records: ClientRecords = lookup
            .content::<ClientRecords>(0)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))?
            .unwrap_or_default();
        let hlc: HlcPayload = lookup
            .content::<HlcPayload>(1)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))?
            .ok_or_else(|| {
                Failure::new(ErrorCause::IllegalState(
                    "server exposes no HLC".to_string(),
                ))
            })?;
        let now_ms = hlc.now_millis().unwrap_or(0);
        let now_ns = hlc.now_nanos().unwrap_or(0);

        if let Some(over) = &records.override_config {
            if over.is_active(now_ns) {
                return Ok(Sharding {
                    shards: Vec::new(),
                    check_every: Duration::from_millis(1),
                });
            }
        }

        let mut live: Vec<&str> = records
            .clients
            .iter()
            .filter(|(uuid, entry)| {
                uuid.as_str() == self.client_uuid || !entry.is_expired(now_ms)
            })
            .map(|(uuid, _)| uuid.as_str())
            .collect();
        if !live.contains(&self.client_uuid.as_str()) {
            live.push(&self.client_uuid);
        }
        live.sort_unstable();
        let index = live
            .iter()
            .position(|uuid| *uuid == self.client_uuid)
            .unwrap_or(0);
        let num_active = live.len();

        let expired: Vec<String> = records
            .clients
            .iter()
            .filter(|(uuid, entry)| {
                uuid.as_str() != self.client_uuid && entry.is_expired(now_ms)
            })
            .map(|(uuid, _)| uuid.clone())
            .take(MAX_EVICTIONS)
            .collect();
        self.heartbeat(keyspace, &client, &expired)?;

        let shards = shards_for_client(index, num_active, self.num_atrs);
        let check_every = self
            .cleanup_window
            .checked_div(shards.len().max(1) as u32)
            .unwrap_or(self.cleanup_window)
            .max(Duration::from_millis(1));
        Ok(Sharding {
            shards,
            check_every,
        })
    }

    fn create_client_record(&self, keyspace: &KeySpace) -> Result<(), Failure> {
        let client = self.client(keyspace)?;
        let result = self.record_hooks.before_create_record().and_then(|_| {
            client
                .mutate_in(MutateInOptions {
                    keyspace: keyspace.clone(),
                    key: CLIENT_RECORD_KEY.to_string(),
                    ops: vec![
                        MutateInOp::xattr_add(CLIENTS_PATH, b"{}".to_vec()),
                        MutateInOp::set_doc(b"{}".to_vec()),
                    ],
                    cas: Cas::ZERO,
                    durability: self.durability,
                    flags: DocFlags {
                        add_doc: true,
                        ..DocFlags::default()
                    },
                    deadline: self.deadline(),
                })
                .map(|_| ())
        });
        match result {
            Ok(()) => Ok(()),
            // A peer created it first.
            Err(KvError::DocumentExists) => Ok(()),
            Err(err) => Err(Failure::new(ErrorCause::Kv(err))),
        }
    }

    fn heartbeat(
        &self,
        keyspace: &KeySpace,
        client: &Arc<dyn KvClient>,
        expired: &[String],
    ) -> Result<(), Failure> {
        let expires_ms = (self.cleanup_window + EXPIRY_SLACK).as_millis() as u64;
        let mut ops = vec![
            MutateInOp::xattr_set(
                client_field(&self.client_uuid, record_fields::HEARTBEAT),
                serde_json::to_vec(&MACRO_CAS)
                    .map_err(|err| Failure::new(ErrorCause::Kv(KvError::encoding(err))))?,
            )
            .with_macros(),
            MutateInOp::xattr_set(
                client_field(&self.client_uuid, record_fields::EXPIRES),
                expires_ms.to_string().into_bytes(),
            ),
            MutateInOp::xattr_set(
                client_field(&self.client_uuid, record_fields::NUM_ATRS),
                self.num_atrs.to_string().into_bytes(),
            ),
        ];
        for uuid in expired {
            ops.push(MutateInOp::xattr_delete(client_path(uuid)));
        }
        let result = self.record_hooks.before_update_record().and_then(|_| {
            client
                .mutate_in(MutateInOptions {
                    keyspace: keyspace.clone(),
                    key: CLIENT_RECORD_KEY.to_string(),
                    ops,
                    cas: Cas::ZERO,
                    durability: self.durability,
                    flags: DocFlags::default(),
                    deadline: self.deadline(),
                })
                .map(|_| ())
        });
        result.map_err(|err| Failure::new(ErrorCause::Kv(err)))
    }

    /// Scan one ATR for expired entries and clean up every one found.
    pub fn process_atr(&self, keyspace: &KeySpace, index: usize) -> Result<(), Failure> {
        let atr_key = atr_key_for_index(index);
        let client = self.client(keyspace)?;
        let lookup = match self.cleanup_hooks.before_atr_get(&atr_key).and_then(|_| {
            client.lookup_in(LookupInOptions {
                keyspace: keyspace.clone(),
                key: atr_key.clone(),
                ops: vec![
                    LookupInOp::xattr(ATTEMPTS_PATH),
                    LookupInOp::xattr(VATTR_HLC),
                ],
                access_deleted: false,
                deadline: self.deadline(),
            })
        }) {
            Ok(lookup) => lookup,
            // This ATR has never been written to.
            Err(KvError::DocumentNotFound) => return Ok(()),
            Err(err) => return Err(Failure::new(ErrorCause::Kv(err))),
        };
        let attempts: AtrAttempts = lookup
            .content::<AtrAttempts>(0)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))?
            .unwrap_or_default();
        let hlc: Option<HlcPayload> = lookup
            .content(1)
            .map_err(|err| Failure::new(ErrorCause::Kv(err)))?;
        let now_ms = hlc.and_then(|h| h.now_millis()).unwrap_or(0);

        for (attempt_id, entry) in attempts {
            let state = match entry.state {
                Some(state) if state != AtrState::Unknown => state,
                _ => continue,
            };
            let started_ms = match entry.pending_cas_millis() {
                Some(ms) => ms,
                None => continue,
            };
            let budget_ms = entry.expiry_ms.unwrap_or(0);
            if now_ms <= started_ms + budget_ms {
                // Its client may still be driving it.
                continue;
            }
            let to_records = |refs: &Option<Vec<txnkv_protocol::AtrMutationRef>>| {
                refs.as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|r| DocRecord {
                        keyspace: KeySpace::new(
                            r.bucket.clone(),
                            r.scope.clone(),
                            r.collection.clone(),
                        ),
                        key: r.key.clone(),
                    })
                    .collect()
            };
            let request = CleanupRequest {
                transaction_id: entry.transaction_id.clone().unwrap_or_default(),
                attempt_id: attempt_id.clone(),
                atr: AtrLocation {
                    keyspace: keyspace.clone(),
                    key: atr_key.clone(),
                },
                state,
                inserts: to_records(&entry.inserts),
                replaces: to_records(&entry.replaces),
                removes: to_records(&entry.removes),
                forward_compat: entry.forward_compat.clone(),
                durability: DurabilityLevel::from_shorthand(
                    entry.durability.as_deref().unwrap_or("m"),
                ),
                enqueued_at: Instant::now(),
            };
            if let Err(failure) = self.cleaner.cleanup_attempt(&request) {
                tracing::debug!(
                    attempt = attempt_id,
                    atr = atr_key,
                    error = %failure,
                    "lost cleanup of attempt failed"
                );
            }
        }
        Ok(())
    }

    /// The keyspaces currently being monitored.
    pub fn locations(&self) -> Vec<KeySpace> {
        self.locations.lock().keys().cloned().collect()
    }

    /// Remove this client's entry from every record it heartbeats into.
    pub fn remove_client_from_all_locations(&self) {
        for keyspace in self.locations() {
            self.unregister(&keyspace);
        }
    }

    /// Stop all scanning threads and remove this client from every record it
    /// heartbeats into.
    pub(crate) fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        self.remove_client_from_all_locations();
    }

    fn unregister(&self, keyspace: &KeySpace) {
        let client = match self.client(keyspace) {
            Ok(client) => client,
            Err(_) => return,
        };
        let deadline = Instant::now() + UNREGISTER_BUDGET;
        loop {
            let result = self.record_hooks.before_remove_client().and_then(|_| {
                client
                    .mutate_in(MutateInOptions {
                        keyspace: keyspace.clone(),
                        key: CLIENT_RECORD_KEY.to_string(),
                        ops: vec![MutateInOp::xattr_delete(client_path(&self.client_uuid))],
                        cas: Cas::ZERO,
                        durability: self.durability,
                        flags: DocFlags::default(),
                        deadline: self.deadline(),
                    })
                    .map(|_| ())
            });
            match result {
                Ok(()) => return,
                Err(KvError::DocumentNotFound) | Err(KvError::PathNotFound(_)) => return,
                Err(_) if Instant::now() >= deadline => return,
                Err(_) => std::thread::sleep(UNREGISTER_RETRY),
            }
        }
    }
}

impl std::fmt::Debug for LostCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LostCleaner")
            .field("client_uuid", &self.client_uuid)
            .field("cleanup_window", &self.cleanup_window)
            .finish_non_exhaustive()
    }
}
