//! Self-organizing membership over a shared metadata store: cohort
//! formation, redistribution after instance loss, index bootstrap.

use couchstream::bus::Bus;
use couchstream::membership::{
    CouchbaseMembership, Membership, MembershipTiming, Model,
};
use couchstream::metadata::{MemoryMetadataStore, MetadataKeys, MetadataStore, SharedMetadataStore};
use couchstream::DcpConfig;
use std::sync::Arc;
use std::time::Duration;

fn fast_timing() -> MembershipTiming {
    MembershipTiming {
        expiry_secs: 1,
        heartbeat_interval: Duration::from_millis(25),
        heartbeat_tolerance: Duration::from_millis(250),
        monitor_interval: Duration::from_millis(15),
    }
}

fn config() -> DcpConfig {
    let mut config = DcpConfig::new(vec!["mock:11210".into()], "bucket", "cohort");
    config.dcp.group.membership.rebalance_delay_secs = 0;
    config
}

async fn wait_for_model(membership: &CouchbaseMembership, expected: Model, deadline: Duration) {
    tokio::time::timeout(deadline, async {
        loop {
            if membership.get_info().await.ok() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("model never reached {expected}"));
}

#[tokio::test]
async fn test_empty_index_is_initialized_by_first_member() {
    let store: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());
    let keys = MetadataKeys::new("cohort");
    assert!(store.get_raw(&keys.instance_index()).await.unwrap_err().is_not_found());

    let membership =
        CouchbaseMembership::start(&config(), Bus::new(), store.clone(), fast_timing());
    wait_for_model(&membership, Model::new(1, 1), Duration::from_secs(3)).await;

    // The starting member created and populated the index document
    let raw = store.get_raw(&keys.instance_index()).await.unwrap();
    let index: std::collections::HashMap<String, i64> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(index.len(), 1);

    membership.close().await;
}

#[tokio::test]
async fn test_three_instances_form_a_cohort() {
    let store: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());
    let bus = Bus::new();

    let mut members = Vec::new();
    for name in ["aa", "bb", "cc"] {
        // Staggered joins give distinct join times
        tokio::time::sleep(Duration::from_millis(40)).await;
        members.push(CouchbaseMembership::start_with_id(
            &config(),
            bus.clone(),
            store.clone(),
            fast_timing(),
            name.to_string(),
        ));
    }

    let deadline = Duration::from_secs(5);
    wait_for_model(&members[0], Model::new(1, 3), deadline).await;
    wait_for_model(&members[1], Model::new(2, 3), deadline).await;
    wait_for_model(&members[2], Model::new(3, 3), deadline).await;

    for membership in &members {
        membership.close().await;
    }
}

#[tokio::test]
async fn test_instance_loss_redistributes() {
    let store: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());
    let bus = Bus::new();
    let keys = MetadataKeys::new("cohort");

    let mut members = Vec::new();
    for name in ["aa", "bb", "cc"] {
        tokio::time::sleep(Duration::from_millis(40)).await;
        members.push(CouchbaseMembership::start_with_id(
            &config(),
            bus.clone(),
            store.clone(),
            fast_timing(),
            name.to_string(),
        ));
    }

    let deadline = Duration::from_secs(5);
    wait_for_model(&members[2], Model::new(3, 3), deadline).await;

    // Kill the middle instance: stop its heartbeat and expire its document
    members[1].close().await;
    store.delete_raw(&keys.instance("bb")).await.unwrap();

    // The survivors converge on a two-member cohort, order preserved
    wait_for_model(&members[0], Model::new(1, 2), deadline).await;
    wait_for_model(&members[2], Model::new(2, 2), deadline).await;

    members[0].close().await;
    members[2].close().await;
}

#[tokio::test]
async fn test_monitor_waits_for_rebalance_delay() {
    let store: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());
    let mut config = config();
    config.dcp.group.membership.rebalance_delay_secs = 3600;

    let membership = CouchbaseMembership::start(&config, Bus::new(), store, fast_timing());

    // Registration happens, but no model is computed before the delay
    let resolved =
        tokio::time::timeout(Duration::from_millis(300), membership.get_info()).await;
    assert!(resolved.is_err(), "monitor must not run before the rebalance delay");

    membership.close().await;
}
