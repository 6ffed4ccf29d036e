//! End-to-end tests for remaster consistency: stale transactions abort,
//! early transactions wait for the remaster they were forwarded under, and
//! mastership transfers replicate everywhere.

mod common;

use common::{assert_committed, make_remaster_txn, make_txn, seed, TestCluster};
use meridian_store::transaction::TransactionStatus;
use meridian_store::types::MasterMetadata;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counter_behind_storage_aborts() {
    let cluster = TestCluster::start("rm-behind", 2, 1, &[seed("A", "valueA", 0, 1)]).await;

    // Metadata attached by the client pins the stale counter; the forwarder
    // skips its lookup and the scheduler's remaster check must reject it.
    let mut txn = make_txn(&["A"], &[], "GET A");
    txn.master_metadata
        .insert("A".to_string(), MasterMetadata::new(0, 0));

    let result = cluster.submit(0, 0, txn).await;
    assert_eq!(result.status, TransactionStatus::Aborted);
    let reason = result.abort_reason.expect("abort carries a reason");
    assert!(
        reason.contains("stale master counter"),
        "unexpected reason: {reason}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counter_ahead_waits_for_the_remaster_then_commits() {
    let cluster = TestCluster::start("rm-ahead", 2, 1, &[seed("A", "valueA", 0, 1)]).await;

    // This transaction was forwarded under a counter one remaster in the
    // future; it must park, not abort.
    let mut early = make_txn(&["A"], &[], "GET A");
    early
        .master_metadata
        .insert("A".to_string(), MasterMetadata::new(0, 2));
    let client = cluster.client(0, 0);
    let waiting = tokio::spawn(async move { client.submit(early).await });

    // Let it reach the remaster queue before the remaster shows up.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!waiting.is_finished(), "transaction committed before the remaster");

    let mut remaster = make_remaster_txn("A", 0);
    remaster
        .master_metadata
        .insert("A".to_string(), MasterMetadata::new(0, 1));
    let result = cluster.submit(0, 0, remaster).await;
    assert_committed(&result);

    let resolved = tokio::time::timeout(common::SUBMIT_TIMEOUT, waiting)
        .await
        .expect("parked transaction never resolved")
        .expect("submit task panicked")
        .expect("submit failed");
    assert_committed(&resolved);
    assert_eq!(
        resolved.read_set.get("A").map(String::as_str),
        Some("valueA")
    );

    cluster
        .wait_for_record(0, 0, "A", |record| record.metadata.counter == 2)
        .await;
    cluster
        .wait_for_record(1, 0, "A", |record| record.metadata.counter == 2)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_region_remaster_increments_the_counter() {
    let cluster = TestCluster::start("rm-same", 2, 1, &[seed("A", "valueA", 0, 0)]).await;

    let mut remaster = make_remaster_txn("A", 0);
    remaster
        .master_metadata
        .insert("A".to_string(), MasterMetadata::new(0, 0));
    let result = cluster.submit(0, 0, remaster).await;
    assert_committed(&result);

    for region in 0..2 {
        cluster
            .wait_for_record(region, 0, "A", |record| {
                record.metadata == MasterMetadata::new(0, 1) && record.value == "valueA"
            })
            .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_region_remaster_transfers_mastership() {
    let cluster = TestCluster::start("rm-cross", 2, 1, &[seed("A", "valueA", 0, 3)]).await;

    let mut remaster = make_remaster_txn("A", 1);
    remaster
        .master_metadata
        .insert("A".to_string(), MasterMetadata::new(0, 3));
    let result = cluster.submit(0, 0, remaster).await;
    assert_committed(&result);

    for region in 0..2 {
        cluster
            .wait_for_record(region, 0, "A", |record| {
                record.metadata == MasterMetadata::new(1, 4) && record.value == "valueA"
            })
            .await;
    }

    // The key now belongs to region 1: a transaction forwarded with the new
    // metadata commits as a single-home transaction of region 1.
    let follow_up = cluster.submit(1, 0, make_txn(&["A"], &[], "GET A")).await;
    assert_committed(&follow_up);
    assert_eq!(
        follow_up.read_set.get("A").map(String::as_str),
        Some("valueA")
    );
}
