//! Minimal consumer against the in-memory cluster.
//!
//! Run with: `cargo run --example basic_consumer`

use couchstream::couchbase::mock::MockCluster;
use couchstream::{ConsumerEvent, Dcp, DcpConfig, Listener, ListenerContext};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    couchstream::logging::init("info");

    // An in-memory stand-in for a real cluster, pre-seeded with documents
    let cluster = MockCluster::new(64);
    for i in 0..25u32 {
        cluster.add_mutation((i % 64) as u16, format!("user:{i}"), format!("{{\"id\":{i}}}"));
    }

    let mut config = DcpConfig::new(
        vec!["localhost:11210".to_string()],
        "example-bucket",
        "example-group",
    );
    config.api.disabled = true;

    let listener: Listener = Arc::new(|ctx: ListenerContext| {
        let event = ctx.event.inner();
        let kind = match &ctx.event {
            ConsumerEvent::Mutation(_) => "mutation",
            ConsumerEvent::Deletion(_) => "deletion",
            ConsumerEvent::Expiration(_) => "expiration",
        };
        println!(
            "{kind} vb={} seq={} key={}",
            event.vb_id,
            event.seq_no,
            String::from_utf8_lossy(&event.key)
        );
        ctx.ack();
    });

    let dcp = Arc::new(Dcp::new(config, cluster.clone(), listener)?);
    let runner = {
        let dcp = dcp.clone();
        tokio::spawn(async move { dcp.start().await })
    };

    // Live traffic while the group is streaming
    tokio::time::sleep(Duration::from_millis(500)).await;
    cluster.add_mutation(7, "user:live", "{\"id\":\"live\"}");
    tokio::time::sleep(Duration::from_millis(500)).await;

    dcp.close();
    runner.await??;
    Ok(())
}
