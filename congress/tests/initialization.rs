#[macro_use]
mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use congress::Config;
use fixtures::Router;
use maplit::btreeset;

/// Cluster initialization test.
///
/// What does this test do?
///
/// - brings 3 nodes online with no topology, asserting they stay silent as
///   pristine learners.
/// - initializes the cluster from one node.
/// - asserts a leader was elected at term 1 and that all nodes applied the
///   initial topology entry and the leader's blank entry.
///
/// RUST_LOG=congress,initialization=trace cargo test -p congress --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initialization() -> Result<()> {
    let ut_span = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(Router::new(config));
    router.new_congress_node(0).await;
    router.new_congress_node(1).await;
    router.new_congress_node(2).await;

    let mut want = 0;

    // A pristine node must not start elections of its own accord.
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    router.wait_for_log(&btreeset![0, 1, 2], want, None, "empty").await?;
    router.assert_pristine_cluster().await;

    // The initial topology entry plus the new leader's blank entry.
    tracing::info!("initializing cluster");
    router.initialize_from_single_node(0).await?;
    want = 2;

    router.wait_for_log(&btreeset![0, 1, 2], want, None, "init").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    Ok(())
}
