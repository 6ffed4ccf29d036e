//! End-to-end tests for single-home transactions on in-process clusters.

mod common;

use common::{assert_committed, make_txn, seed, TestCluster};
use meridian_store::api::StatsModule;
use meridian_store::transaction::TransactionStatus;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_partition_read_write_commits_everywhere() {
    let cluster = TestCluster::start(
        "sh-basic",
        2,
        2,
        &[seed("A", "valueA", 0, 0), seed("D", "valueD", 0, 0)],
    )
    .await;

    let txn = cluster
        .submit(0, 0, make_txn(&["A"], &["D"], "GET A SET D newD"))
        .await;
    assert_committed(&txn);
    assert_eq!(txn.read_set.get("A").map(String::as_str), Some("valueA"));
    assert_eq!(txn.write_set.get("D").map(String::as_str), Some("newD"));

    // The write lands on partition 0 of both regions.
    cluster
        .wait_for_record(0, 0, "D", |record| record.value == "newD")
        .await;
    cluster
        .wait_for_record(1, 0, "D", |record| record.value == "newD")
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_partition_mutual_write_swaps_values() {
    let cluster = TestCluster::start(
        "sh-swap",
        2,
        2,
        &[seed("B0", "valueB", 0, 0), seed("C1", "valueC", 0, 0)],
    )
    .await;

    let txn = cluster
        .submit(
            0,
            0,
            make_txn(&["B0", "C1"], &["B0", "C1"], "COPY C1 B0 COPY B0 C1"),
        )
        .await;
    assert_committed(&txn);
    assert_eq!(txn.write_set.get("B0").map(String::as_str), Some("valueC"));
    assert_eq!(txn.write_set.get("C1").map(String::as_str), Some("valueB"));

    cluster
        .wait_for_record(0, 0, "B0", |record| record.value == "valueC")
        .await;
    cluster
        .wait_for_record(0, 1, "C1", |record| record.value == "valueB")
        .await;
    cluster
        .wait_for_record(1, 1, "C1", |record| record.value == "valueB")
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_transactions_observe_prior_writes() {
    let cluster = TestCluster::start("sh-seq", 1, 1, &[seed("K", "v0", 0, 0)]).await;

    let first = cluster.submit(0, 0, make_txn(&[], &["K"], "SET K v1")).await;
    assert_committed(&first);

    let second = cluster.submit(0, 0, make_txn(&["K"], &[], "GET K")).await;
    assert_committed(&second);
    assert_eq!(second.read_set.get("K").map(String::as_str), Some("v1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_abort_surfaces_reason_and_leaves_storage_untouched() {
    let cluster = TestCluster::start("sh-abort", 1, 1, &[seed("A", "valueA", 0, 0)]).await;

    let txn = cluster
        .submit(0, 0, make_txn(&[], &["A"], "SET A changed ABORT A"))
        .await;
    assert_eq!(txn.status, TransactionStatus::Aborted);
    assert_eq!(txn.abort_reason.as_deref(), Some("User abort (key: A)"));

    let stored = cluster.node(0, 0).storage().read(&"A".to_string()).unwrap();
    assert_eq!(stored.value, "valueA");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_transaction_is_rejected_at_the_server() {
    let cluster = TestCluster::start("sh-empty", 1, 1, &[]).await;

    let txn = cluster.submit(0, 0, make_txn(&[], &[], "")).await;
    assert_eq!(txn.status, TransactionStatus::Aborted);
    assert_eq!(txn.abort_reason.as_deref(), Some("Txn accesses no key"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_requests_answer_from_both_modules() {
    let cluster = TestCluster::start("sh-stats", 1, 1, &[seed("A", "valueA", 0, 0)]).await;

    let server_stats = cluster
        .client(0, 0)
        .stats(StatsModule::Server, 1)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&server_stats).unwrap();
    assert!(parsed["server"]["txn_id_counter"].is_u64());

    let scheduler_stats = cluster
        .client(0, 0)
        .stats(StatsModule::Scheduler, 1)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&scheduler_stats).unwrap();
    assert!(parsed["scheduler"]["num_ready_workers"].is_u64());
    assert!(parsed["scheduler"]["lock_manager"]["num_locked_keys"].is_u64());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_writers_serialize_deterministically() {
    let cluster = TestCluster::start("sh-conflict", 2, 1, &[seed("K", "v0", 0, 0)]).await;

    // Fire a burst of writers against one key from the same client; all
    // must commit, and both replicas must converge to the same final value.
    let mut results = Vec::new();
    for i in 0..10 {
        let code = format!("SET K v{i}");
        results.push(cluster.submit(0, 0, make_txn(&[], &["K"], &code)).await);
    }
    for txn in &results {
        assert_committed(txn);
    }

    cluster
        .wait_for_record(0, 0, "K", |record| record.value == "v9")
        .await;
    cluster
        .wait_for_record(1, 0, "K", |record| record.value == "v9")
        .await;
}
