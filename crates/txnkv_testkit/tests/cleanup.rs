//! Integration tests for cleanup: the regular queue, the lost-attempt
//! scanner, and the per-keyspace client record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use txnkv_core::{AttemptState, CleanupRequest, DocRecord, FailureReason, TxnError};
use txnkv_kv::{DurabilityLevel, KvError};
use txnkv_protocol::AtrState;
use txnkv_testkit::{fast_config, FailpointHooks, TestCluster};

fn request_for(
    cluster: &TestCluster,
    attempt: &txnkv_core::Attempt,
    state: AtrState,
    inserts: &[&str],
    replaces: &[&str],
) -> CleanupRequest {
    let record = |key: &&str| DocRecord {
        keyspace: cluster.keyspace().clone(),
        key: key.to_string(),
    };
    CleanupRequest {
        transaction_id: "txn-under-test".to_string(),
        attempt_id: attempt.id().to_string(),
        atr: attempt.atr_location().expect("attempt has no ATR"),
        state,
        inserts: inserts.iter().map(record).collect(),
        replaces: replaces.iter().map(record).collect(),
        removes: Vec::new(),
        forward_compat: None,
        durability: DurabilityLevel::None,
        enqueued_at: Instant::now(),
    }
}

#[test]
fn pending_cleanup_rolls_back_abandoned_staging() {
    let cluster = TestCluster::new();
    cluster.seed("doc-r", &json!({"v": 1}));

    let writer = cluster.engine();
    let attempt = writer.begin_transaction(None).new_attempt();
    let doc = attempt.get(cluster.keyspace(), "doc-r").unwrap();
    attempt.replace(&doc, &json!({"v": 2})).unwrap();
    attempt
        .insert(cluster.keyspace(), "doc-i", &json!({"v": 3}))
        .unwrap();
    let atr = attempt.atr_location().expect("attempt has no ATR");
    let request = request_for(&cluster, &attempt, AtrState::Pending, &["doc-i"], &["doc-r"]);
    drop(writer);

    let engine = cluster.engine_with(fast_config().with_cleanup_client_attempts(true));
    let cleaner = engine.cleaner().expect("no cleaner running");
    cleaner.cleanup_attempt(&request).unwrap();

    assert_eq!(cluster.body("doc-r"), Some(json!({"v": 1})));
    assert_eq!(cluster.txn_block("doc-r"), None);
    assert!(!cluster.exists("doc-i"));
    assert!(!cluster.is_tombstone("doc-i"));
    assert_eq!(cluster.atr_entry(&atr, &request.attempt_id), None);

    let units = cleaner.resource_units();
    assert!(units.read_units >= 1);
    assert!(units.write_units >= 1);
    assert_eq!(cleaner.resource_units(), txnkv_kv::ResourceUnits::default());

    // A second run finds nothing left to do.
    cleaner.cleanup_attempt(&request).unwrap();
}

#[test]
fn lost_scan_skips_entries_still_inside_their_budget() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    let hooks = Arc::new(FailpointHooks::new());
    hooks.pin_atr_index(3);
    let writer = cluster.engine_with(fast_config().with_hooks(hooks));
    let attempt = writer.begin_transaction(None).new_attempt();
    let doc = attempt.get(cluster.keyspace(), "doc").unwrap();
    attempt.replace(&doc, &json!({"v": 2})).unwrap();
    let atr = attempt.atr_location().expect("attempt has no ATR");
    let attempt_id = attempt.id().to_string();
    drop(writer);

    let engine = cluster.engine_with(fast_config().with_cleanup_lost_attempts(true));
    let lost = engine.lost_cleaner().expect("no lost cleaner running");

    // The attempt has not outlived its expiration budget yet.
    lost.process_atr(cluster.keyspace(), 3).unwrap();
    assert!(cluster.atr_entry(&atr, &attempt_id).is_some());
    assert!(cluster.txn_block("doc").is_some());

    cluster.advance(Duration::from_secs(3600));
    lost.process_atr(cluster.keyspace(), 3).unwrap();
    assert_eq!(cluster.atr_entry(&atr, &attempt_id), None);
    assert_eq!(cluster.body("doc"), Some(json!({"v": 1})));
    assert_eq!(cluster.txn_block("doc"), None);
}

#[test]
fn lost_scan_discards_a_crashed_staged_insert() {
    let cluster = TestCluster::new();

    let hooks = Arc::new(FailpointHooks::new());
    hooks.pin_atr_index(4);
    let writer = cluster.engine_with(fast_config().with_hooks(hooks));
    let attempt = writer.begin_transaction(None).new_attempt();
    attempt
        .insert(cluster.keyspace(), "order-1", &json!({"total": 12}))
        .unwrap();
    let atr = attempt.atr_location().expect("attempt has no ATR");
    let attempt_id = attempt.id().to_string();
    assert!(cluster.is_tombstone("order-1"));
    drop(writer);

    cluster.advance(Duration::from_secs(3600));
    let engine = cluster.engine_with(fast_config().with_cleanup_lost_attempts(true));
    let lost = engine.lost_cleaner().expect("no lost cleaner running");
    lost.process_atr(cluster.keyspace(), 4).unwrap();

    // The carrier tombstone held nothing but the staged block, so both it
    // and the entry are gone.
    assert!(!cluster.exists("order-1"));
    assert!(!cluster.is_tombstone("order-1"));
    assert_eq!(cluster.atr_entry(&atr, &attempt_id), None);
}

#[test]
fn lost_scan_finishes_a_wedged_commit() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    let hooks = Arc::new(FailpointHooks::new());
    hooks.pin_atr_index(7);
    hooks.fail(
        "before_doc_committed",
        KvError::AccessDenied("injected".to_string()),
    );
    let writer = cluster.engine_with(fast_config().with_hooks(hooks));
    let attempt = writer.begin_transaction(None).new_attempt();
    let doc = attempt.get(cluster.keyspace(), "doc").unwrap();
    attempt.replace(&doc, &json!({"v": 2})).unwrap();
    match attempt.commit().unwrap_err() {
        TxnError::Failed(failure) => {
            assert_eq!(failure.reason, FailureReason::FailedPostCommit)
        }
        other => panic!("expected commit failure, got {other:?}"),
    }
    assert_eq!(attempt.state(), AttemptState::Committed);
    let atr = attempt.atr_location().expect("attempt has no ATR");
    let attempt_id = attempt.id().to_string();
    drop(writer);

    cluster.advance(Duration::from_secs(3600));
    let engine = cluster.engine_with(fast_config().with_cleanup_lost_attempts(true));
    let lost = engine.lost_cleaner().expect("no lost cleaner running");
    lost.process_atr(cluster.keyspace(), 7).unwrap();

    // The scan rolls the commit forward, not back.
    assert_eq!(cluster.body("doc"), Some(json!({"v": 2})));
    assert_eq!(cluster.txn_block("doc"), None);
    assert_eq!(cluster.atr_entry(&atr, &attempt_id), None);

    lost.process_atr(cluster.keyspace(), 7).unwrap();
}

#[test]
fn client_record_is_created_then_heartbeats_claim_shards() {
    let cluster = TestCluster::new();
    let engine = cluster.engine_with(fast_config().with_cleanup_lost_attempts(true));
    let lost = engine.lost_cleaner().expect("no lost cleaner running");

    // First pass only creates the record; shards come on the next pass.
    let sharding = lost.process_client(cluster.keyspace()).unwrap();
    assert!(sharding.shards.is_empty());
    assert_eq!(sharding.check_every, Duration::from_millis(1));

    let sharding = lost.process_client(cluster.keyspace()).unwrap();
    assert_eq!(sharding.shards.len(), 16);

    let record = cluster.client_record().expect("no client record");
    assert!(record["clients"][lost.client_uuid()].is_object());
}

#[test]
fn concurrent_clients_shard_the_atr_space_disjointly() {
    let cluster = TestCluster::new();
    let engine_a = cluster.engine_with(fast_config().with_cleanup_lost_attempts(true));
    let engine_b = cluster.engine_with(fast_config().with_cleanup_lost_attempts(true));
    let lost_a = engine_a.lost_cleaner().expect("no lost cleaner running");
    let lost_b = engine_b.lost_cleaner().expect("no lost cleaner running");

    lost_a.process_client(cluster.keyspace()).unwrap();
    lost_a.process_client(cluster.keyspace()).unwrap();
    lost_b.process_client(cluster.keyspace()).unwrap();
    let shards_a = lost_a.process_client(cluster.keyspace()).unwrap().shards;
    let shards_b = lost_b.process_client(cluster.keyspace()).unwrap().shards;

    assert!(!shards_a.is_empty());
    assert!(!shards_b.is_empty());
    assert!(shards_a.iter().all(|index| !shards_b.contains(index)));
    let mut all: Vec<usize> = shards_a.iter().chain(shards_b.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..16).collect::<Vec<_>>());
}

#[test]
fn expired_peers_are_evicted_from_the_record() {
    let cluster = TestCluster::new();
    let window = Duration::from_secs(60);
    let config = || {
        fast_config()
            .with_cleanup_lost_attempts(true)
            .with_cleanup_window(window)
    };

    let engine_a = cluster.engine_with(config());
    let engine_b = cluster.engine_with(config());
    engine_a
        .lost_cleaner()
        .unwrap()
        .process_client(cluster.keyspace())
        .unwrap();
    engine_a
        .lost_cleaner()
        .unwrap()
        .process_client(cluster.keyspace())
        .unwrap();
    engine_b
        .lost_cleaner()
        .unwrap()
        .process_client(cluster.keyspace())
        .unwrap();

    // Both heartbeats age past the window plus its slack.
    cluster.advance(Duration::from_secs(200));

    let engine_c = cluster.engine_with(config());
    let survivor = engine_c.lost_cleaner().unwrap();
    survivor.process_client(cluster.keyspace()).unwrap();

    let record = cluster.client_record().expect("no client record");
    let clients = record["clients"].as_object().expect("no clients map");
    assert_eq!(clients.len(), 1);
    assert!(clients.contains_key(survivor.client_uuid()));
}

#[test]
fn full_queue_drops_new_requests_and_keeps_order() {
    let cluster = TestCluster::new();
    let engine = cluster.engine_with(
        fast_config()
            .with_cleanup_client_attempts(true)
            .with_cleanup_queue_size(2),
    );
    // Stop the drainer so the queue holds whatever we push.
    engine.close();
    let cleaner = engine.cleaner().expect("no cleaner running");

    let request = |attempt_id: &str| CleanupRequest {
        transaction_id: "txn-under-test".to_string(),
        attempt_id: attempt_id.to_string(),
        atr: txnkv_core::AtrLocation {
            keyspace: cluster.keyspace().clone(),
            key: "_txn:atr-0".to_string(),
        },
        state: AtrState::Completed,
        inserts: Vec::new(),
        replaces: Vec::new(),
        removes: Vec::new(),
        forward_compat: None,
        durability: DurabilityLevel::None,
        enqueued_at: Instant::now(),
    };

    cleaner.add_request(request("q-1"));
    cleaner.add_request(request("q-2"));
    cleaner.add_request(request("q-3"));
    assert_eq!(cleaner.queue_length(), 2);

    assert_eq!(cleaner.pop_request().unwrap().attempt_id, "q-1");
    assert_eq!(cleaner.pop_request().unwrap().attempt_id, "q-2");
    assert!(cleaner.pop_request().is_none());
    assert_eq!(cleaner.queue_length(), 0);
}
