//! Cross-tree request routing: k=2, N=7, requests hop rank 0 -> 2 -> 5
//! and responses retrace the path.

mod common;

use std::time::Duration;

use serde_json::json;

use arbor_core::error::errno;
use common::{build_tree, fast_timing, shutdown_tree, wait_all_connected};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_reaches_deep_rank_and_response_returns() {
    let brokers = build_tree(2, 7, fast_timing()).await;
    let h0 = brokers[0].handle();
    wait_all_connected(&h0, 0).await;
    wait_all_connected(&brokers[2].handle(), 2).await;

    // Store at rank 5 from rank 0: the request descends 0 -> 2 -> 5.
    let mut rpc = h0
        .rpc(
            "scratchpad.sc",
            5,
            Some(json!({"key": "deep", "version": 0, "data": "payload"})),
        )
        .await
        .unwrap();
    let resp = tokio::time::timeout(Duration::from_secs(5), rpc.recv())
        .await
        .expect("response must arrive")
        .unwrap();
    assert!(resp.is_none(), "sc success response carries no payload");

    // The value is visible at rank 5 (and only there).
    let mut rpc = h0
        .rpc("scratchpad.ll", 5, Some(json!({"key": "deep"})))
        .await
        .unwrap();
    let entry = rpc.recv().await.unwrap().unwrap();
    assert_eq!(entry["version"], 1);
    assert_eq!(entry["data"], "payload");

    let mut rpc = h0
        .rpc("scratchpad.ll", 0, Some(json!({"key": "deep"})))
        .await
        .unwrap();
    let entry = rpc.recv().await.unwrap().unwrap();
    assert_eq!(entry["version"], 0);

    // A leaf can reach a rank in a different subtree (3 -> 1 -> 0 -> 2 -> 5).
    let h3 = brokers[3].handle();
    let mut rpc = h3
        .rpc("scratchpad.ll", 5, Some(json!({"key": "deep"})))
        .await
        .unwrap();
    let entry = tokio::time::timeout(Duration::from_secs(5), rpc.recv())
        .await
        .expect("cross-subtree response must arrive")
        .unwrap()
        .unwrap();
    assert_eq!(entry["version"], 1);
    assert_eq!(entry["data"], "payload");

    shutdown_tree(brokers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_service_and_unreachable_rank_fail() {
    let brokers = build_tree(2, 3, fast_timing()).await;
    let h1 = brokers[1].handle();

    // No such service on a reachable rank.
    let mut rpc = h1.rpc("nosuch.op", 0, None).await.unwrap();
    let err = rpc.recv().await.unwrap_err();
    assert_eq!(err.errnum(), Some(errno::ENOSYS));

    // A nodeid outside the tree is unreachable; the error flows back.
    let mut rpc = h1
        .rpc("scratchpad.ll", 17, Some(json!({"key": "x"})))
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), rpc.recv())
        .await
        .expect("error response must arrive")
        .unwrap_err();
    assert_eq!(err.errnum(), Some(errno::EHOSTUNREACH));

    shutdown_tree(brokers).await;
}
