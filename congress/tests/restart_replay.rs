#[macro_use]
mod fixtures;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use congress::message::ClientCommand;
use congress::message::Entry;
use congress::message::EntryPayload;
use congress::message::Topology;
use congress::storage::HardState;
use congress::storage::LogMeta;
use congress::Config;
use congress::LogId;
use fixtures::Router;
use maplit::btreeset;
use memlog::MemLog;
use memlog::MemLogStateMachine;
use pretty_assertions::assert_eq;

fn command_entry(term: u64, index: u64, serial: u32) -> Entry {
    Entry {
        log_id: LogId { term, index },
        payload: EntryPayload::Command(ClientCommand::new(7, serial, vec![index as u8])),
    }
}

/// Restart replay test.
///
/// What does this test do?
///
/// - seeds a store as a sole voter which crashed with commit 5 but only
///   applied through 2.
/// - boots a node on that store and asserts entries 3 through 5 are applied
///   exactly once, in order, before the node resumes as leader.
/// - asserts already-applied entries are not re-applied.
///
/// RUST_LOG=congress,restart_replay=trace cargo test -p congress --test restart_replay
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_replays_committed_but_unapplied_entries() -> Result<()> {
    let ut_span = init_ut!();
    let _ent = ut_span.enter();

    // The log as it stood at the crash: the initial topology entry, the old
    // leader's blank, then three commands. All five were committed, but the
    // apply pipeline had only reached the blank entry.
    let topology = Topology {
        voters: btreeset![0],
        gates: btreeset![],
    };
    let entries = vec![
        Entry::new_topology(LogId { term: 0, index: 1 }, topology),
        Entry::new_blank(LogId { term: 1, index: 2 }),
        command_entry(1, 3, 1),
        command_entry(1, 4, 2),
        command_entry(1, 5, 3),
    ];
    let log = entries.iter().map(|e| (e.log_id.index, e.clone())).collect::<BTreeMap<_, _>>();
    let sm = MemLogStateMachine {
        applied: entries[..2].to_vec(),
        client_serials: BTreeMap::new(),
    };
    let store = Arc::new(MemLog::new_with_state(
        0,
        log,
        HardState {
            current_term: 1,
            voted_for: Some(0),
        },
        LogMeta { commit: 5, applied: 2 },
        sm,
    ));

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(Router::new(config));
    router.new_congress_node_with_store(0, store.clone()).await;

    // Boot replays 3..=5, then the node resumes as sole leader and appends
    // a fresh blank entry.
    let want = 6;
    router.wait_for_log(&btreeset![0], want, None, "restart replay").await?;
    router.assert_stable_cluster(None, Some(want)).await;

    let sm = store.get_state_machine().await;
    let replayed = sm
        .applied
        .iter()
        .filter_map(|entry| match &entry.payload {
            EntryPayload::Command(cmd) => Some((entry.log_id.index, cmd.serial)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(replayed, vec![(3, 1), (4, 2), (5, 3)], "commands replayed in order, exactly once");
    assert_eq!(sm.client_serials.get(&7), Some(&3));

    // The pre-crash applies were seeded, the replay added exactly four more
    // entries: the three commands and the new leader's blank.
    assert_eq!(sm.applied.len(), 2 + 4);

    let meta = store.read_log_meta().await.expect("expected persisted log meta");
    assert_eq!(meta.commit, want);
    assert_eq!(meta.applied, want);

    Ok(())
}
