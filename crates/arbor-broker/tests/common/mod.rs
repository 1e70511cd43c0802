//! Shared helpers: build a live broker tree on loopback sockets.
#![allow(dead_code)]

use std::time::Duration;

use serde_json::Value;

use arbor_broker::{AuthorizedPeer, Broker, BrokerConfig, Handle};
use arbor_core::hostlist::Hostlist;
use arbor_core::overlay::OverlayConfig;
use arbor_core::topology::Topology;
use arbor_net::Certificate;

/// Timing tuned for tests: quick keepalives, no spontaneous idling.
pub fn fast_timing() -> OverlayConfig {
    OverlayConfig {
        sync_min: Duration::from_millis(50),
        sync_max: Duration::from_millis(250),
        idle_min: Duration::from_millis(50),
        idle_max: Duration::from_secs(30),
    }
}

/// Start a k-ary tree of `size` brokers on ephemeral loopback ports.
/// Parents come up before their children, and each parent authorizes
/// exactly its children's keys.
pub async fn build_tree(k: u32, size: u32, overlay: OverlayConfig) -> Vec<Broker> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let certs: Vec<Certificate> = (0..size)
        .map(|rank| Certificate::generate(&format!("node{rank}")))
        .collect();
    let hosts: Hostlist = format!("node[0-{}]", size - 1).parse().unwrap();

    let mut brokers: Vec<Broker> = Vec::new();
    for rank in 0..size {
        let topo = Topology::new(k, size, rank).unwrap();
        let mut cfg = BrokerConfig::new(rank, size, k, certs[rank as usize].clone());
        cfg.overlay = overlay;
        if topo.children_count() > 0 {
            cfg.bind_addr = Some("127.0.0.1:0".to_string());
            cfg.authorized_peers = topo
                .children()
                .map(|child| AuthorizedPeer {
                    name: hosts.get(child as usize).unwrap().to_string(),
                    pubkey: certs[child as usize].public_txt(),
                })
                .collect();
        }
        if let Some(parent) = topo.parent() {
            cfg.parent_addr =
                Some(brokers[parent as usize].bind_addr().unwrap().to_string());
            cfg.parent_pubkey = Some(certs[parent as usize].public_txt());
        }
        brokers.push(Broker::start(cfg).await.unwrap());
    }
    brokers
}

/// Shut the tree down leaves-first so disconnect keepalives flow up.
pub async fn shutdown_tree(brokers: Vec<Broker>) {
    for broker in brokers.into_iter().rev() {
        broker.shutdown().await;
    }
}

/// One `overlay.monitor` snapshot via `handle`, which must be local to
/// the queried broker.
pub async fn monitor_snapshot(handle: &Handle, rank: u32) -> Vec<Value> {
    let mut rpc = handle.rpc("overlay.monitor", rank, None).await.unwrap();
    let payload = rpc.recv().await.unwrap().unwrap();
    payload["children"].as_array().unwrap().clone()
}

/// Poll until every child of `rank` is connected.
pub async fn wait_all_connected(handle: &Handle, rank: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let children = monitor_snapshot(handle, rank).await;
        if children.iter().all(|c| c["connected"] == true) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "children of rank {rank} never connected: {children:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Read the overlay's pending-request counter.
pub async fn monitor_request_count(handle: &Handle, rank: u32) -> u64 {
    let mut rpc = handle.rpc("overlay.stats.get", rank, None).await.unwrap();
    let payload = rpc.recv().await.unwrap().unwrap();
    payload["monitor-requests"].as_u64().unwrap()
}
