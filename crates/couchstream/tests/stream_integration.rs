//! End-to-end scenarios against the in-memory cluster: cold start, static
//! scale-out, mid-stream rollback, the mitigation gate, restart resume and
//! graceful shutdown.

use couchstream::couchbase::mock::MockCluster;
use couchstream::{
    ConsumerEvent, Dcp, DcpConfig, Listener, ListenerContext, SeqNo, VbId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Counters {
    mutations: AtomicUsize,
    deletions: AtomicUsize,
    expirations: AtomicUsize,
    events: Mutex<Vec<(VbId, SeqNo)>>,
}

fn counting_listener(counters: Arc<Counters>) -> Listener {
    Arc::new(move |ctx: ListenerContext| {
        match &ctx.event {
            ConsumerEvent::Mutation(_) => counters.mutations.fetch_add(1, Ordering::SeqCst),
            ConsumerEvent::Deletion(_) => counters.deletions.fetch_add(1, Ordering::SeqCst),
            ConsumerEvent::Expiration(_) => counters.expirations.fetch_add(1, Ordering::SeqCst),
        };
        counters.events.lock().push((ctx.event.vb_id(), ctx.event.seq_no()));
        ctx.ack();
    })
}

fn test_config(group: &str) -> DcpConfig {
    let mut config = DcpConfig::new(vec!["mock:11210".into()], "bucket", group);
    config.api.disabled = true;
    config.checkpoint.interval_secs = 1;
    config.rollback_mitigation.disabled = true;
    config
}

async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(deadline, async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn checkpoint_key(group: &str, vb_id: VbId) -> String {
    format!("_couchstream:{group}:checkpoint:{vb_id}")
}

async fn saved_seq_no(cluster: &MockCluster, group: &str, vb_id: VbId) -> Option<SeqNo> {
    use couchstream::CouchbaseClient;
    match cluster.get_document(&checkpoint_key(group, vb_id)).await {
        Ok(raw) => {
            let offset: couchstream::Offset = serde_json::from_slice(&raw).unwrap();
            Some(offset.seq_no)
        }
        Err(_) => None,
    }
}

#[tokio::test]
async fn test_single_member_cold_start_streams_everything() {
    let cluster = MockCluster::new(1024);
    let mut seeded = Vec::new();
    for i in 0..100u32 {
        let vb = ((i * 37) % 1024) as VbId;
        let seq = cluster.add_mutation(vb, format!("doc-{i}"), format!("{{\"i\":{i}}}"));
        seeded.push((vb, seq));
    }

    let counters = Arc::new(Counters::default());
    let dcp = Arc::new(
        Dcp::new(test_config("cold-start"), cluster.clone(), counting_listener(counters.clone()))
            .unwrap(),
    );

    let runner = {
        let dcp = dcp.clone();
        tokio::spawn(async move { dcp.start().await })
    };

    // All 1024 streams open, all 100 mutations arrive, nothing else
    wait_until(Duration::from_secs(30), || cluster.open_stream_count() == 1024).await;
    wait_until(Duration::from_secs(30), || {
        counters.mutations.load(Ordering::SeqCst) == 100
    })
    .await;
    assert_eq!(counters.deletions.load(Ordering::SeqCst), 0);
    assert_eq!(counters.expirations.load(Ordering::SeqCst), 0);

    dcp.close();
    runner.await.unwrap().unwrap();

    // Checkpoints match each vbucket's high seqno
    for (vb, seq) in seeded {
        let saved = saved_seq_no(&cluster, "cold-start", vb).await;
        assert_eq!(saved, Some(seq), "vb {vb}");
    }
}

#[tokio::test]
async fn test_per_vbucket_order_is_strict() {
    let cluster = MockCluster::new(8);
    for i in 0..50u32 {
        cluster.add_mutation((i % 8) as VbId, format!("k{i}"), "v");
    }

    let counters = Arc::new(Counters::default());
    let dcp = Arc::new(
        Dcp::new(test_config("ordering"), cluster.clone(), counting_listener(counters.clone()))
            .unwrap(),
    );
    let runner = {
        let dcp = dcp.clone();
        tokio::spawn(async move { dcp.start().await })
    };

    wait_until(Duration::from_secs(10), || {
        counters.mutations.load(Ordering::SeqCst) == 50
    })
    .await;

    let events = counters.events.lock().clone();
    let mut last_per_vb: std::collections::HashMap<VbId, SeqNo> = Default::default();
    for (vb, seq) in events {
        if let Some(&last) = last_per_vb.get(&vb) {
            assert!(seq > last, "vb {vb}: seq {seq} after {last}");
        }
        last_per_vb.insert(vb, seq);
    }

    dcp.close();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_scale_from_one_to_three_members() {
    use couchstream::checkpoint::CheckpointTracker;
    use couchstream::config::{AutoReset, RollbackMitigationConfig};
    use couchstream::metadata::{MemoryMetadataStore, SharedMetadataStore};
    use couchstream::rollback::RollbackMitigation;
    use couchstream::stream::Stream;

    let cluster = MockCluster::new(1024);
    let metadata: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());

    let build = |_name: &str| {
        let mitigation = Arc::new(RollbackMitigation::start(
            cluster.clone(),
            &RollbackMitigationConfig { disabled: true, ..Default::default() },
        ));
        let checkpoint = CheckpointTracker::new(
            metadata.clone(),
            cluster.clone(),
            mitigation.clone(),
            AutoReset::Earliest,
        );
        let listener: Listener = Arc::new(|ctx: ListenerContext| ctx.ack());
        Stream::new(cluster.clone(), checkpoint, mitigation, listener, 16)
    };

    // Member 1 starts alone and owns everything
    let first = build("first");
    first.rebalance_to((0u16..1024).collect()).await.unwrap();
    wait_until(Duration::from_secs(30), || cluster.open_stream_count() == 1024).await;

    // The cohort grows to three: member 1 keeps [0, 342)
    first.rebalance_to((0u16..342).collect()).await.unwrap();
    wait_until(Duration::from_secs(30), || cluster.open_stream_count() == 342).await;

    // Members 2 and 3 pick up [342, 683) and [683, 1024)
    let second = build("second");
    second.rebalance_to((342u16..683).collect()).await.unwrap();
    let third = build("third");
    third.rebalance_to((683u16..1024).collect()).await.unwrap();

    wait_until(Duration::from_secs(30), || cluster.open_stream_count() == 1024).await;

    // Every vbucket has exactly one stream and delivery continues per vb
    let seq = cluster.add_mutation(500, "after-scale", "v");
    assert_eq!(seq, 1);

    first.close().await.unwrap();
    second.close().await.unwrap();
    third.close().await.unwrap();
    assert_eq!(cluster.open_stream_count(), 0);
}

#[tokio::test]
async fn test_rollback_mid_stream_rewinds_and_redelivers() {
    let cluster = MockCluster::new(64);
    for i in 0..500u32 {
        cluster.add_mutation(42, format!("k{i}"), "v");
    }

    let counters = Arc::new(Counters::default());
    let dcp = Arc::new(
        Dcp::new(test_config("rollback"), cluster.clone(), counting_listener(counters.clone()))
            .unwrap(),
    );
    let runner = {
        let dcp = dcp.clone();
        tokio::spawn(async move { dcp.start().await })
    };

    wait_until(Duration::from_secs(10), || {
        counters.mutations.load(Ordering::SeqCst) == 500
    })
    .await;

    // Failover: vb 42 rewinds to 450, the open stream is torn down
    cluster.inject_rollback(42, 450);
    cluster.trigger_stream_end(42, couchstream::EndStreamReason::Rebalance);

    // Events (450, 500] re-deliver under the new lineage
    wait_until(Duration::from_secs(10), || {
        counters.mutations.load(Ordering::SeqCst) == 550
    })
    .await;
    let replayed: Vec<SeqNo> = counters
        .events
        .lock()
        .iter()
        .filter(|(vb, _)| *vb == 42)
        .map(|(_, seq)| *seq)
        .skip(500)
        .collect();
    assert_eq!(replayed.first(), Some(&451));
    assert_eq!(replayed.last(), Some(&500));

    dcp.close();
    runner.await.unwrap().unwrap();

    // The final checkpoint reflects the replay under the new uuid
    let saved = saved_seq_no(&cluster, "rollback", 42).await;
    assert_eq!(saved, Some(500));
}

#[tokio::test]
async fn test_rollback_mitigation_gates_checkpoints() {
    let cluster = MockCluster::new(32);
    cluster.set_auto_persist(false);
    for i in 0..150u32 {
        cluster.add_mutation(17, format!("k{i}"), "v");
    }

    let mut config = test_config("gate");
    config.rollback_mitigation.disabled = false;
    config.rollback_mitigation.interval_ms = 10;

    let counters = Arc::new(Counters::default());
    let dcp = Arc::new(
        Dcp::new(config, cluster.clone(), counting_listener(counters.clone())).unwrap(),
    );
    let runner = {
        let dcp = dcp.clone();
        tokio::spawn(async move { dcp.start().await })
    };

    // The consumer acks all 150, but the cluster has only persisted 100
    cluster.set_persisted_all(17, 100);
    wait_until(Duration::from_secs(10), || {
        counters.mutations.load(Ordering::SeqCst) == 150
    })
    .await;
    tokio::time::timeout(Duration::from_secs(10), async {
        while saved_seq_no(&cluster, "gate", 17).await != Some(100) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("checkpoint should clamp to the watermark");

    // The watermark rises past the ack; the next flush advances to 150
    cluster.set_persisted_all(17, 160);
    tokio::time::timeout(Duration::from_secs(10), async {
        while saved_seq_no(&cluster, "gate", 17).await != Some(150) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("checkpoint should advance once permitted");

    dcp.close();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let cluster = MockCluster::new(16);
    for i in 0..40u32 {
        cluster.add_mutation((i % 16) as VbId, format!("k{i}"), "v");
    }

    let counters = Arc::new(Counters::default());
    let dcp = Arc::new(
        Dcp::new(test_config("resume"), cluster.clone(), counting_listener(counters.clone()))
            .unwrap(),
    );
    let runner = {
        let dcp = dcp.clone();
        tokio::spawn(async move { dcp.start().await })
    };
    wait_until(Duration::from_secs(10), || {
        counters.mutations.load(Ordering::SeqCst) == 40
    })
    .await;
    dcp.close();
    runner.await.unwrap().unwrap();

    // New documents land while the instance is down
    for i in 40..50u32 {
        cluster.add_mutation((i % 16) as VbId, format!("k{i}"), "v");
    }

    // The restarted instance sees only the 10 new events
    let counters2 = Arc::new(Counters::default());
    let dcp2 = Arc::new(
        Dcp::new(test_config("resume"), cluster.clone(), counting_listener(counters2.clone()))
            .unwrap(),
    );
    let runner2 = {
        let dcp = dcp2.clone();
        tokio::spawn(async move { dcp.start().await })
    };
    wait_until(Duration::from_secs(10), || {
        counters2.mutations.load(Ordering::SeqCst) == 10
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters2.mutations.load(Ordering::SeqCst), 10);

    dcp2.close();
    runner2.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_flushes_and_exits_clean() {
    let cluster = MockCluster::new(128);
    for i in 0..200u32 {
        cluster.add_mutation((i % 128) as VbId, format!("k{i}"), "v");
    }

    let counters = Arc::new(Counters::default());
    let dcp = Arc::new(
        Dcp::new(test_config("shutdown"), cluster.clone(), counting_listener(counters.clone()))
            .unwrap(),
    );
    let runner = {
        let dcp = dcp.clone();
        tokio::spawn(async move { dcp.start().await })
    };

    wait_until(Duration::from_secs(10), || {
        counters.mutations.load(Ordering::SeqCst) == 200
    })
    .await;

    dcp.close();
    // Exit is clean and bounded
    let result = tokio::time::timeout(Duration::from_secs(65), runner).await.unwrap();
    assert!(result.unwrap().is_ok());

    // Streams are gone and acked work was flushed
    assert_eq!(cluster.open_stream_count(), 0);
    for vb in [0u16, 63, 127] {
        assert!(saved_seq_no(&cluster, "shutdown", vb).await.is_some(), "vb {vb}");
    }
}
