#[macro_use]
mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use congress::Config;
use congress::Role;
use fixtures::Router;
use maplit::btreeset;

/// Leader failover test.
///
/// What does this test do?
///
/// - brings a 3 node cluster online.
/// - isolates the leader and asserts a new leader is elected at a higher
///   term by the remaining majority.
/// - restores the old leader and asserts it rejoins as a follower of the new
///   leader and converges on the same log.
///
/// RUST_LOG=congress,elections=trace cargo test -p congress --test elections
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover() -> Result<()> {
    let ut_span = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(Router::new(config));
    router.new_congress_node(0).await;
    router.new_congress_node(1).await;
    router.new_congress_node(2).await;

    router.initialize_from_single_node(0).await?;
    let mut want = 2;
    router.wait_for_log(&btreeset![0, 1, 2], want, None, "init").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    let leader = router.leader().await.expect("expected the cluster to have a leader");
    let old_term = router.latest_metrics().await.first().map(|m| m.current_term).unwrap_or_default();

    tracing::info!({ leader }, "isolating leader");
    router.isolate_node(leader).await;

    // A new leader must emerge from the remaining majority, and its blank
    // entry brings the log forward by one.
    let survivors = btreeset![0, 1, 2].into_iter().filter(|id| *id != leader).collect::<std::collections::BTreeSet<_>>();
    want += 1;
    router
        .wait_for_log(&survivors, want, Some(Duration::from_secs(5)), "new leader blank entry")
        .await?;
    router.assert_stable_cluster(None, Some(want)).await;

    let new_leader = router.leader().await.expect("expected a new leader after isolation");
    assert_ne!(new_leader, leader, "expected a different node to take leadership");
    let new_term = router
        .latest_metrics()
        .await
        .into_iter()
        .find(|m| m.id == new_leader)
        .map(|m| m.current_term)
        .unwrap_or_default();
    assert!(new_term > old_term, "expected the new leader's term {} to exceed {}", new_term, old_term);

    // The deposed leader observes the higher term on first contact and
    // steps down. It may have inflated its term while partitioned, which can
    // force one more election round, so only convergence is asserted, not
    // the identity of the final leader.
    tracing::info!({ leader }, "restoring old leader");
    router.restore_node(leader).await;
    router
        .wait_for_role(&btreeset![leader], Role::Follower, Some(Duration::from_secs(5)), "old leader demoted")
        .await?;
    for id in [0, 1, 2] {
        router
            .wait(&id, Some(Duration::from_secs(5)))
            .await?
            .log_at_least(want, "rejoin convergence")
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    router.assert_stable_cluster(None, None).await;

    Ok(())
}
