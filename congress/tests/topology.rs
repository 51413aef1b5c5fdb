#[macro_use]
mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use congress::ChangeTopologyError;
use congress::Config;
use congress::Role;
use congress::SubmitError;
use fixtures::Router;
use maplit::btreeset;

/// Topology change test.
///
/// What does this test do?
///
/// - brings a 3 node cluster online and spawns two spare nodes.
/// - promotes one spare to voter and asserts every node converges on the
///   new topology.
/// - adds the other spare as a gate and asserts it replicates the log while
///   staying a non-voting learner.
/// - asserts multi-node deltas and no-op changes are refused.
/// - removes the leader from the voter set and asserts it steps down to
///   learner after commit, with a new leader elected among the rest.
///
/// RUST_LOG=congress,topology=trace cargo test -p congress --test topology
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn topology_changes() -> Result<()> {
    let ut_span = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(Router::new(config));
    router.new_congress_node(0).await;
    router.new_congress_node(1).await;
    router.new_congress_node(2).await;

    let node = router.get_node_handle(0).await?;
    node.initialize(congress::message::Topology {
        voters: btreeset![0, 1, 2],
        gates: btreeset![],
    })
    .await?;
    let mut want = 2;
    router.wait_for_log(&btreeset![0, 1, 2], want, None, "init").await?;

    let leader = router.leader().await.expect("expected the cluster to have a leader");
    let leader_node = router.get_node_handle(leader).await?;

    // Spares come online as learners outside the topology.
    router.new_congress_node(3).await;
    router.new_congress_node(4).await;

    // Refuse a delta of more than one node.
    let res = leader_node
        .change_topology(congress::message::Topology {
            voters: btreeset![0, 1, 2, 3, 4],
            gates: btreeset![],
        })
        .await;
    assert!(matches!(res, Err(ChangeTopologyError::TooManyChanges)), "two additions must be refused");

    // Refuse a change that changes nothing.
    let res = leader_node
        .change_topology(congress::message::Topology {
            voters: btreeset![0, 1, 2],
            gates: btreeset![],
        })
        .await;
    assert!(matches!(res, Err(ChangeTopologyError::Noop)), "an unchanged topology must be refused");

    // Promote node 3 to voter.
    leader_node
        .change_topology(congress::message::Topology {
            voters: btreeset![0, 1, 2, 3],
            gates: btreeset![],
        })
        .await?;
    want += 1;
    router
        .wait_for_voters(&btreeset![0, 1, 2, 3], btreeset![0, 1, 2, 3], Some(Duration::from_secs(5)), "promotion")
        .await?;
    router
        .wait_for_log(&btreeset![0, 1, 2, 3], want, Some(Duration::from_secs(5)), "new voter catches up")
        .await?;
    router
        .wait_for_role(&btreeset![3], Role::Follower, Some(Duration::from_secs(5)), "new voter is a follower")
        .await?;

    // Add node 4 as a gate: it replicates but never votes.
    leader_node.add_gate(4).await?;
    want += 1;
    router
        .wait_for_log(&btreeset![0, 1, 2, 3, 4], want, Some(Duration::from_secs(5)), "gate catches up")
        .await?;
    router
        .wait_for_role(&btreeset![4], Role::Learner, Some(Duration::from_secs(5)), "gate stays a learner")
        .await?;
    let metrics = router.latest_metrics().await;
    let gate = metrics.into_iter().find(|m| m.id == 4).expect("expected metrics for node 4");
    assert!(gate.topology.gates.contains(&4), "node 4 must know it is a gate");
    assert!(!gate.topology.voters.contains(&4), "a gate must never enter the voter set");

    // The leader removes itself; after commit it steps down and a new
    // leader emerges among the remaining voters.
    let remaining = btreeset![0, 1, 2, 3]
        .into_iter()
        .filter(|id| *id != leader)
        .collect::<std::collections::BTreeSet<_>>();
    leader_node
        .change_topology(congress::message::Topology {
            voters: remaining.clone(),
            gates: btreeset![4],
        })
        .await?;
    router
        .wait_for_role(&btreeset![leader], Role::Learner, Some(Duration::from_secs(5)), "removed leader steps down")
        .await?;

    // The demoted node must stop advertising itself as leader; a stale
    // self-hint would redirect clients back to it forever.
    let metrics = router.latest_metrics().await;
    let demoted = metrics.into_iter().find(|m| m.id == leader).expect("expected metrics for the removed leader");
    assert_ne!(
        demoted.current_leader,
        Some(leader),
        "a removed leader must not report itself as the current leader"
    );
    let res = router.send_client_request(leader, 9, 1).await;
    assert!(
        matches!(res, Err(SubmitError::NotInCongress)),
        "a removed leader must refuse submissions as an outsider"
    );

    // The new leader appends its own blank entry once elected.
    let mut new_leader = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(id) = router.leader().await {
            if id != leader {
                new_leader = Some(id);
                break;
            }
        }
    }
    let new_leader = new_leader.expect("expected a new leader after the old one stepped down");
    assert!(remaining.contains(&new_leader), "the new leader must be a remaining voter");
    router
        .wait_for_voters(&remaining, remaining.clone(), Some(Duration::from_secs(5)), "removal propagated")
        .await?;

    Ok(())
}
