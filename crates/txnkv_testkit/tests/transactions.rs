//! Integration tests for the attempt lifecycle: staging, commit, rollback,
//! reads through staged state, conflicts, expiry, and serialize/resume.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use txnkv_core::hooks::stages;
use txnkv_core::{AttemptState, ErrorClass, Failure, FailureReason, TxnError};
use txnkv_kv::{
    BucketProvider, Cas, DocFlags, DurabilityLevel, KvError, MutateInOp, MutateInOptions,
    ResourceUnits,
};
use txnkv_protocol::atr::{attempt_field, attempt_path, fields};
use txnkv_testkit::{fast_config, FailpointHooks, TestCluster};

fn unwrap_failure(err: TxnError) -> Failure {
    match err {
        TxnError::Failed(failure) => failure,
        other => panic!("expected attempt failure, got {other:?}"),
    }
}

#[test]
fn commit_makes_staged_values_visible_and_strips_metadata() {
    let cluster = TestCluster::new();
    cluster.seed("acct-a", &json!({"balance": 100}));
    cluster.seed("acct-b", &json!({"balance": 50}));

    let engine = cluster.engine();
    let txn = engine.begin_transaction(None);
    let attempt = txn.new_attempt();

    let a = attempt.get(cluster.keyspace(), "acct-a").unwrap();
    attempt.replace(&a, &json!({"balance": 80})).unwrap();
    let b = attempt.get(cluster.keyspace(), "acct-b").unwrap();
    attempt.remove(&b).unwrap();
    attempt
        .insert(cluster.keyspace(), "acct-c", &json!({"balance": 20}))
        .unwrap();

    // Nothing is visible outside the attempt before the commit point.
    assert_eq!(cluster.body("acct-a"), Some(json!({"balance": 100})));
    assert_eq!(cluster.body("acct-b"), Some(json!({"balance": 50})));
    assert!(!cluster.exists("acct-c"));
    assert!(cluster.is_tombstone("acct-c"));
    assert_eq!(cluster.staged_value("acct-c"), Some(json!({"balance": 20})));

    let atr = attempt.atr_location().expect("attempt has no ATR");
    let entry = cluster.atr_entry(&atr, attempt.id()).expect("no ATR entry");
    assert_eq!(entry["st"], "PENDING");
    assert_eq!(entry["ins"][0]["id"], "acct-c");
    assert_eq!(entry["rep"][0]["id"], "acct-a");
    assert_eq!(entry["rem"][0]["id"], "acct-b");

    attempt.commit().unwrap();
    assert_eq!(attempt.state(), AttemptState::Completed);

    assert_eq!(cluster.body("acct-a"), Some(json!({"balance": 80})));
    assert!(!cluster.exists("acct-b"));
    assert!(!cluster.is_tombstone("acct-b"));
    assert_eq!(cluster.body("acct-c"), Some(json!({"balance": 20})));
    assert_eq!(cluster.txn_block("acct-a"), None);
    assert_eq!(cluster.txn_block("acct-c"), None);
    assert_eq!(cluster.atr_entry(&atr, attempt.id()), None);
}

#[test]
fn rollback_restores_the_world() {
    let cluster = TestCluster::new();
    cluster.seed("doc-r", &json!({"v": 1}));

    let engine = cluster.engine();
    let txn = engine.begin_transaction(None);
    let attempt = txn.new_attempt();

    let doc = attempt.get(cluster.keyspace(), "doc-r").unwrap();
    attempt.replace(&doc, &json!({"v": 2})).unwrap();
    attempt
        .insert(cluster.keyspace(), "doc-i", &json!({"v": 3}))
        .unwrap();
    let atr = attempt.atr_location().expect("attempt has no ATR");

    attempt.rollback().unwrap();
    assert_eq!(attempt.state(), AttemptState::RolledBack);

    assert_eq!(cluster.body("doc-r"), Some(json!({"v": 1})));
    assert_eq!(cluster.txn_block("doc-r"), None);
    // The staged insert's carrier tombstone held nothing else, so it is
    // gone entirely.
    assert!(!cluster.exists("doc-i"));
    assert!(!cluster.is_tombstone("doc-i"));
    assert_eq!(cluster.atr_entry(&atr, attempt.id()), None);
}

#[test]
fn own_writes_are_read_back_before_commit() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    let engine = cluster.engine();
    let attempt = engine.begin_transaction(None).new_attempt();

    let doc = attempt.get(cluster.keyspace(), "doc").unwrap();
    attempt.replace(&doc, &json!({"v": 2})).unwrap();
    let again = attempt.get(cluster.keyspace(), "doc").unwrap();
    let body: serde_json::Value = serde_json::from_slice(&again.value).unwrap();
    assert_eq!(body, json!({"v": 2}));

    attempt.remove(&again).unwrap();
    assert!(matches!(
        attempt.get(cluster.keyspace(), "doc"),
        Err(TxnError::DocumentNotFound)
    ));
}

#[test]
fn insert_then_replace_folds_into_one_staged_mutation() {
    let cluster = TestCluster::new();
    let engine = cluster.engine();
    let attempt = engine.begin_transaction(None).new_attempt();

    let doc = attempt
        .insert(cluster.keyspace(), "doc", &json!({"v": 1}))
        .unwrap();
    attempt.replace(&doc, &json!({"v": 2})).unwrap();

    let block = cluster.txn_block("doc").expect("no staged block");
    assert_eq!(block["op"]["type"], "replace");
    assert_eq!(block["op"]["stgd"], json!({"v": 2}));
    assert!(cluster.is_tombstone("doc"));

    let atr = attempt.atr_location().expect("attempt has no ATR");
    let entry = cluster.atr_entry(&atr, attempt.id()).expect("no ATR entry");
    assert_eq!(entry["rep"][0]["id"], "doc");
    assert!(entry.get("ins").map(|v| v.as_array().unwrap().is_empty()).unwrap_or(true));

    attempt.commit().unwrap();
    assert_eq!(cluster.body("doc"), Some(json!({"v": 2})));
    assert_eq!(cluster.txn_block("doc"), None);
}

#[test]
fn foreign_pending_write_reads_as_the_committed_body() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    let engine_a = cluster.engine();
    let staging = engine_a.begin_transaction(None).new_attempt();
    let doc = staging.get(cluster.keyspace(), "doc").unwrap();
    staging.replace(&doc, &json!({"v": 2})).unwrap();

    let engine_b = cluster.engine();
    let reader = engine_b.begin_transaction(None).new_attempt();
    let seen = reader.get(cluster.keyspace(), "doc").unwrap();
    let body: serde_json::Value = serde_json::from_slice(&seen.value).unwrap();
    assert_eq!(body, json!({"v": 1}));
}

#[test]
fn committed_but_unstaged_write_reads_as_the_staged_value() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    // Wedge the writer after its commit point: the ATR says COMMITTED but
    // the staged value never lands in the document body.
    let hooks = Arc::new(FailpointHooks::new());
    hooks.fail(
        "before_doc_committed",
        KvError::AccessDenied("injected".to_string()),
    );
    let engine_a = cluster.engine_with(fast_config().with_hooks(hooks));
    let writer = engine_a.begin_transaction(None).new_attempt();
    let doc = writer.get(cluster.keyspace(), "doc").unwrap();
    writer.replace(&doc, &json!({"v": 2})).unwrap();

    let failure = unwrap_failure(writer.commit().unwrap_err());
    assert_eq!(failure.reason, FailureReason::FailedPostCommit);
    assert!(failure.flags.should_not_retry);
    assert!(failure.flags.should_not_rollback);
    assert_eq!(writer.state(), AttemptState::Committed);
    assert!(!writer.should_rollback());

    let atr = writer.atr_location().expect("attempt has no ATR");
    let entry = cluster.atr_entry(&atr, writer.id()).expect("no ATR entry");
    assert_eq!(entry["st"], "COMMITTED");

    // The commit point passed, so readers must see the staged value even
    // though the body still holds the old one.
    assert_eq!(cluster.body("doc"), Some(json!({"v": 1})));
    let engine_b = cluster.engine();
    let reader = engine_b.begin_transaction(None).new_attempt();
    let seen = reader.get(cluster.keyspace(), "doc").unwrap();
    let body: serde_json::Value = serde_json::from_slice(&seen.value).unwrap();
    assert_eq!(body, json!({"v": 2}));
}

fn poke_atr_entry(cluster: &TestCluster, atr_key: &str, op: MutateInOp) {
    cluster
        .provider()
        .bucket("main")
        .unwrap()
        .mutate_in(MutateInOptions {
            keyspace: cluster.keyspace().clone(),
            key: atr_key.to_string(),
            ops: vec![op],
            cas: Cas::ZERO,
            durability: DurabilityLevel::None,
            flags: DocFlags::default(),
            deadline: None,
        })
        .unwrap();
}

#[test]
fn completed_foreign_attempt_reads_as_the_staged_value() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    let engine_a = cluster.engine();
    let staging = engine_a.begin_transaction(None).new_attempt();
    let doc = staging.get(cluster.keyspace(), "doc").unwrap();
    staging.replace(&doc, &json!({"v": 2})).unwrap();
    let atr = staging.atr_location().expect("attempt has no ATR");

    // Another client can move the entry to COMPLETED between a reader's
    // document lookup and its ATR lookup; model the entry having moved on
    // while the staged block is still in place.
    poke_atr_entry(
        &cluster,
        &atr.key,
        MutateInOp::xattr_set(
            attempt_field(staging.id(), fields::STATE),
            b"\"COMPLETED\"".to_vec(),
        ),
    );

    let engine_b = cluster.engine();
    let reader = engine_b.begin_transaction(None).new_attempt();
    let seen = reader.get(cluster.keyspace(), "doc").unwrap();
    let body: serde_json::Value = serde_json::from_slice(&seen.value).unwrap();
    assert_eq!(body, json!({"v": 2}));
}

#[test]
fn missing_foreign_atr_entry_is_never_served_stale() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    let engine_a = cluster.engine();
    let staging = engine_a.begin_transaction(None).new_attempt();
    let doc = staging.get(cluster.keyspace(), "doc").unwrap();
    staging.replace(&doc, &json!({"v": 2})).unwrap();
    let atr = staging.atr_location().expect("attempt has no ATR");

    // The governing entry vanishes while the staged block lingers, as when
    // a reader races cleanup. The value cannot be resolved either way, so
    // the read must keep re-fetching rather than serve the cached body.
    poke_atr_entry(
        &cluster,
        &atr.key,
        MutateInOp::xattr_delete(attempt_path(staging.id())),
    );

    let engine_b = cluster.engine_with(
        fast_config().with_expiration_time(Duration::from_millis(200)),
    );
    let reader = engine_b.begin_transaction(None).new_attempt();
    let failure = unwrap_failure(reader.get(cluster.keyspace(), "doc").unwrap_err());
    assert_eq!(failure.reason, FailureReason::Expired);
}

#[test]
fn commit_continues_past_a_permanently_failed_document() {
    let cluster = TestCluster::new();
    cluster.seed("acct-a", &json!({"balance": 100}));
    cluster.seed("acct-b", &json!({"balance": 50}));

    let hooks = Arc::new(FailpointHooks::new());
    hooks.fail_times(
        "before_doc_committed",
        KvError::AccessDenied("injected".to_string()),
        1,
    );
    let engine = cluster.engine_with(fast_config().with_hooks(hooks.clone()));
    let attempt = engine.begin_transaction(None).new_attempt();
    let a = attempt.get(cluster.keyspace(), "acct-a").unwrap();
    attempt.replace(&a, &json!({"balance": 80})).unwrap();
    let b = attempt.get(cluster.keyspace(), "acct-b").unwrap();
    attempt.replace(&b, &json!({"balance": 70})).unwrap();

    let failure = unwrap_failure(attempt.commit().unwrap_err());
    assert_eq!(failure.reason, FailureReason::FailedPostCommit);
    assert!(failure.flags.should_not_retry);
    assert!(failure.flags.should_not_rollback);
    assert_eq!(attempt.state(), AttemptState::Committed);
    // Both documents' commits were tried despite the first failing.
    assert_eq!(hooks.fired("before_doc_committed"), 2);

    // The second document committed; the first is left staged for cleanup,
    // under an entry still marked COMMITTED.
    assert_eq!(cluster.body("acct-b"), Some(json!({"balance": 70})));
    assert_eq!(cluster.txn_block("acct-b"), None);
    assert_eq!(cluster.body("acct-a"), Some(json!({"balance": 100})));
    assert!(cluster.txn_block("acct-a").is_some());
    let atr = attempt.atr_location().expect("attempt has no ATR");
    let entry = cluster.atr_entry(&atr, attempt.id()).expect("no ATR entry");
    assert_eq!(entry["st"], "COMMITTED");
}

#[test]
fn conflicting_write_fails_retryable_after_polling() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    let engine_a = cluster.engine();
    let holder = engine_a.begin_transaction(None).new_attempt();
    let doc = holder.get(cluster.keyspace(), "doc").unwrap();
    holder.replace(&doc, &json!({"v": 2})).unwrap();

    let engine_b = cluster.engine();
    let contender = engine_b.begin_transaction(None).new_attempt();
    let doc = contender.get(cluster.keyspace(), "doc").unwrap();
    let failure = unwrap_failure(contender.replace(&doc, &json!({"v": 3})).unwrap_err());
    assert_eq!(failure.class, ErrorClass::WriteWriteConflict);
    assert!(!failure.flags.should_not_retry);
    assert!(contender.should_retry());
    assert!(contender.should_rollback());
}

#[test]
fn expiry_is_sticky_and_poisons_later_operations() {
    let cluster = TestCluster::new();
    let hooks = Arc::new(FailpointHooks::new());
    hooks.expire_at(stages::INSERT);

    let engine = cluster.engine_with(fast_config().with_hooks(hooks));
    let attempt = engine.begin_transaction(None).new_attempt();

    let failure = unwrap_failure(
        attempt
            .insert(cluster.keyspace(), "doc", &json!({"v": 1}))
            .unwrap_err(),
    );
    assert_eq!(failure.reason, FailureReason::Expired);
    assert!(attempt.has_expired());
    assert!(!attempt.should_retry());

    // A failed operation poisons the attempt for further user operations.
    assert!(attempt.get(cluster.keyspace(), "doc").is_err());

    // But rollback is still permitted and leaves a terminal state.
    assert!(attempt.should_rollback());
    attempt.rollback().unwrap();
    assert_eq!(attempt.state(), AttemptState::RolledBack);
    assert!(attempt.has_expired());
}

#[test]
fn empty_attempt_commits_without_touching_the_store() {
    let cluster = TestCluster::new();
    let engine = cluster.engine();
    let attempt = engine.begin_transaction(None).new_attempt();
    attempt.commit().unwrap();
    assert_eq!(attempt.state(), AttemptState::Completed);
    assert!(attempt.atr_location().is_none());
}

#[test]
fn serialized_attempt_resumes_and_commits_elsewhere() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));

    let engine = cluster.engine();
    let txn = engine.begin_transaction(None);
    let attempt = txn.new_attempt();
    let doc = attempt.get(cluster.keyspace(), "doc").unwrap();
    attempt.replace(&doc, &json!({"v": 2})).unwrap();
    let atr = attempt.atr_location().expect("attempt has no ATR");
    let packed = attempt.serialize().unwrap();
    drop(txn);
    drop(engine);

    // A different engine picks the attempt up and finishes it. The staged
    // body is not carried in the envelope; commit re-reads it from the
    // document.
    let engine = cluster.engine();
    let txn = engine.begin_transaction(None);
    let resumed = txn.resume_attempt(&packed).unwrap();
    assert_eq!(resumed.id(), attempt.id());
    assert_eq!(resumed.state(), AttemptState::Pending);
    assert_eq!(resumed.atr_location(), Some(atr.clone()));

    resumed.commit().unwrap();
    assert_eq!(cluster.body("doc"), Some(json!({"v": 2})));
    assert_eq!(cluster.txn_block("doc"), None);
    assert_eq!(cluster.atr_entry(&atr, resumed.id()), None);
}

#[test]
fn serialize_is_refused_past_the_commit_point() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));
    let engine = cluster.engine();
    let attempt = engine.begin_transaction(None).new_attempt();
    let doc = attempt.get(cluster.keyspace(), "doc").unwrap();
    attempt.replace(&doc, &json!({"v": 2})).unwrap();
    attempt.commit().unwrap();
    assert!(attempt.serialize().is_err());
}

#[test]
fn resource_units_accumulate_and_reset_on_read() {
    let cluster = TestCluster::new();
    cluster.seed("doc", &json!({"v": 1}));
    let engine = cluster.engine();
    let attempt = engine.begin_transaction(None).new_attempt();

    attempt.get(cluster.keyspace(), "doc").unwrap();
    attempt
        .insert(cluster.keyspace(), "other", &json!({"v": 2}))
        .unwrap();

    let units = attempt.resource_units();
    assert!(units.read_units >= 1);
    assert!(units.write_units >= 1);
    assert_eq!(attempt.resource_units(), ResourceUnits::default());
}

#[test]
fn attempt_expires_with_the_transaction_budget() {
    let cluster = TestCluster::new();
    let engine = cluster.engine_with(
        fast_config().with_expiration_time(Duration::from_millis(10)),
    );
    let attempt = engine.begin_transaction(None).new_attempt();
    std::thread::sleep(Duration::from_millis(30));
    assert!(attempt.has_expired());
    let failure = unwrap_failure(
        attempt
            .insert(cluster.keyspace(), "doc", &json!({"v": 1}))
            .unwrap_err(),
    );
    assert_eq!(failure.reason, FailureReason::Expired);
}
