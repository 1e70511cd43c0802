//! End-to-end LL/SC: racing writers from different ranks against one
//! scratchpad, both the one-shot and the streaming protocol.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use arbor_broker::{Handle, Rpc};
use arbor_core::error::errno;
use common::{build_tree, fast_timing, shutdown_tree, wait_all_connected};

async fn recv_ok(rpc: &mut Rpc) -> Option<Value> {
    tokio::time::timeout(Duration::from_secs(5), rpc.recv())
        .await
        .expect("response must arrive")
        .unwrap()
}

async fn ll(handle: &Handle, nodeid: u32, key: &str) -> (u64, Value) {
    let mut rpc = handle
        .rpc("scratchpad.ll", nodeid, Some(json!({"key": key})))
        .await
        .unwrap();
    let entry = recv_ok(&mut rpc).await.unwrap();
    (entry["version"].as_u64().unwrap(), entry["data"].clone())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ll_sc_race_loser_retries() {
    let brokers = build_tree(2, 3, fast_timing()).await;
    let h0 = brokers[0].handle();
    wait_all_connected(&h0, 0).await;
    let client_a = brokers[1].handle();
    let client_b = brokers[2].handle();

    // Both clients load-link the empty key.
    assert_eq!(ll(&client_a, 0, "x").await, (0, Value::Null));
    assert_eq!(ll(&client_b, 0, "x").await, (0, Value::Null));

    // Both store-conditional against version 0; A lands first.
    let mut sc_a = client_a
        .rpc(
            "scratchpad.sc",
            0,
            Some(json!({"key": "x", "version": 0, "data": ["a"]})),
        )
        .await
        .unwrap();
    assert!(recv_ok(&mut sc_a).await.is_none());

    let mut sc_b = client_b
        .rpc(
            "scratchpad.sc",
            0,
            Some(json!({"key": "x", "version": 0, "data": ["b"]})),
        )
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), sc_b.recv())
        .await
        .expect("response must arrive")
        .unwrap_err();
    assert_eq!(err.errnum(), Some(errno::EDEADLK));

    // The loser re-reads, merges, and retries.
    let (version, data) = ll(&client_b, 0, "x").await;
    assert_eq!(version, 1);
    assert_eq!(data, json!(["a"]));

    let mut sc_b = client_b
        .rpc(
            "scratchpad.sc",
            0,
            Some(json!({"key": "x", "version": 1, "data": ["a", "b"]})),
        )
        .await
        .unwrap();
    assert!(recv_ok(&mut sc_b).await.is_none());

    // No successful store lost the other's data.
    assert_eq!(ll(&client_a, 0, "x").await, (2, json!(["a", "b"])));

    shutdown_tree(brokers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sc_stream_race_with_retry() {
    // Service lives on rank 5; clients sit at the root and in the other
    // subtree, so requests cross the whole tree in both directions.
    let brokers = build_tree(2, 7, fast_timing()).await;
    let h0 = brokers[0].handle();
    wait_all_connected(&h0, 0).await;
    wait_all_connected(&brokers[2].handle(), 2).await;
    wait_all_connected(&brokers[1].handle(), 1).await;

    let client_b = brokers[0].handle();
    let client_a = brokers[3].handle();

    let (global_before, _) = ll(&client_b, 5, ".").await;

    // B's stream against version 0 wins outright: terminal ENODATA.
    let mut stream_b = client_b
        .rpc_streaming(
            "scratchpad.sc-stream",
            5,
            Some(json!({"key": "x", "version": 0, "data": ["b"]})),
        )
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), stream_b.recv())
        .await
        .expect("terminator must arrive")
        .unwrap_err();
    assert_eq!(err.errnum(), Some(errno::ENODATA));

    // A's stream loses: the initial response is a load-link of the
    // current entry.
    let mut stream_a = client_a
        .rpc_streaming(
            "scratchpad.sc-stream",
            5,
            Some(json!({"key": "x", "version": 0, "data": ["a"]})),
        )
        .await
        .unwrap();
    let entry = recv_ok(&mut stream_a).await.unwrap();
    assert_eq!(entry["version"], 1);
    assert_eq!(entry["data"], json!(["b"]));

    // A retries on the same stream with the merged value.
    client_a
        .send_noresponse(
            "scratchpad.sc-retry",
            5,
            Some(json!({
                "matchtag": stream_a.matchtag(),
                "version": 1,
                "data": ["b", "a"],
            })),
        )
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), stream_a.recv())
        .await
        .expect("terminator must arrive")
        .unwrap_err();
    assert_eq!(err.errnum(), Some(errno::ENODATA));

    // Final state reflects both writers; the global version advanced by
    // exactly two.
    assert_eq!(ll(&client_b, 5, "x").await, (2, json!(["b", "a"])));
    let (global_after, _) = ll(&client_b, 5, ".").await;
    assert_eq!(global_after, global_before + 2);

    shutdown_tree(brokers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_resets_key_silently() {
    let brokers = build_tree(2, 3, fast_timing()).await;
    let h0 = brokers[0].handle();
    wait_all_connected(&h0, 0).await;
    let client = brokers[1].handle();

    let mut sc = client
        .rpc(
            "scratchpad.sc",
            0,
            Some(json!({"key": "gone", "version": 0, "data": 42})),
        )
        .await
        .unwrap();
    assert!(recv_ok(&mut sc).await.is_none());
    assert_eq!(ll(&client, 0, "gone").await.0, 1);
    let (global, _) = ll(&client, 0, ".").await;

    client
        .send_noresponse("scratchpad.delete", 0, Some(json!({"key": "gone"})))
        .await
        .unwrap();

    // The entry reads as absent again and the global version bumped.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (version, data) = ll(&client, 0, "gone").await;
        if version == 0 && data.is_null() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "delete never landed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let (global_after, _) = ll(&client, 0, ".").await;
    assert_eq!(global_after, global + 1);

    // Writing to "." is refused even when the version matches.
    let mut sc = client
        .rpc(
            "scratchpad.sc",
            0,
            Some(json!({"key": ".", "version": global_after, "data": 1})),
        )
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), sc.recv())
        .await
        .expect("response must arrive")
        .unwrap_err();
    assert_eq!(err.errnum(), Some(errno::EROFS));

    shutdown_tree(brokers).await;
}
