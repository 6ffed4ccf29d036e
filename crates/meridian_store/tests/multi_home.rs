//! End-to-end tests for multi-home transactions: global ordering, lock-only
//! decomposition and the orderer bypass.

mod common;

use common::{assert_committed, make_txn, seed, TestCluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_home_read_across_two_regions_commits() {
    let cluster = TestCluster::start(
        "mh-read",
        2,
        1,
        &[seed("A", "valueA", 0, 0), seed("C", "valueC", 1, 0)],
    )
    .await;

    let txn = cluster.submit(0, 0, make_txn(&["A", "C"], &[], "GET A GET C")).await;
    assert_committed(&txn);
    assert_eq!(txn.read_set.get("A").map(String::as_str), Some("valueA"));
    assert_eq!(txn.read_set.get("C").map(String::as_str), Some("valueC"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_home_write_applies_in_every_region() {
    let cluster = TestCluster::start(
        "mh-write",
        2,
        1,
        &[seed("A", "valueA", 0, 0), seed("C", "valueC", 1, 0)],
    )
    .await;

    let txn = cluster
        .submit(
            0,
            0,
            make_txn(&["A", "C"], &["A", "C"], "COPY C A COPY A C"),
        )
        .await;
    assert_committed(&txn);
    assert_eq!(txn.write_set.get("A").map(String::as_str), Some("valueC"));
    assert_eq!(txn.write_set.get("C").map(String::as_str), Some("valueA"));

    for region in 0..2 {
        cluster
            .wait_for_record(region, 0, "A", |record| record.value == "valueC")
            .await;
        cluster
            .wait_for_record(region, 0, "C", |record| record.value == "valueA")
            .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_home_spanning_partitions_and_regions_commits() {
    let cluster = TestCluster::start(
        "mh-part",
        2,
        2,
        &[seed("A0", "valueA", 0, 0), seed("C1", "valueC", 1, 0)],
    )
    .await;

    let txn = cluster
        .submit(
            0,
            0,
            make_txn(&["A0", "C1"], &["A0", "C1"], "COPY C1 A0 COPY A0 C1"),
        )
        .await;
    assert_committed(&txn);
    assert_eq!(txn.write_set.get("A0").map(String::as_str), Some("valueC"));
    assert_eq!(txn.write_set.get("C1").map(String::as_str), Some("valueA"));

    cluster
        .wait_for_record(1, 0, "A0", |record| record.value == "valueC")
        .await;
    cluster
        .wait_for_record(1, 1, "C1", |record| record.value == "valueA")
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bypassing_the_orderer_still_commits_multi_home_transactions() {
    let cluster = TestCluster::start_with(
        "mh-bypass",
        2,
        1,
        &[seed("A", "valueA", 0, 0), seed("C", "valueC", 1, 0)],
        |config| config.bypass_mh_orderer = true,
    )
    .await;

    let txn = cluster
        .submit(
            0,
            0,
            make_txn(&["A", "C"], &["A", "C"], "COPY C A COPY A C"),
        )
        .await;
    assert_committed(&txn);
    assert_eq!(txn.write_set.get("A").map(String::as_str), Some("valueC"));
    assert_eq!(txn.write_set.get("C").map(String::as_str), Some("valueA"));

    for region in 0..2 {
        cluster
            .wait_for_record(region, 0, "A", |record| record.value == "valueC")
            .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_single_home_and_multi_home_writers_all_commit() {
    let cluster = TestCluster::start(
        "mh-mixed",
        2,
        1,
        &[seed("A", "a0", 0, 0), seed("C", "c0", 1, 0)],
    )
    .await;

    let single_home = cluster.submit(0, 0, make_txn(&[], &["A"], "SET A a1")).await;
    assert_committed(&single_home);

    let multi_home = cluster
        .submit(0, 0, make_txn(&["A", "C"], &["C"], "COPY A C"))
        .await;
    assert_committed(&multi_home);
    assert_eq!(multi_home.write_set.get("C").map(String::as_str), Some("a1"));

    for region in 0..2 {
        cluster
            .wait_for_record(region, 0, "C", |record| record.value == "a1")
            .await;
    }
}
