//! The wire messages exchanged between congress nodes and their clients.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::summary::MessageSummary;
use crate::LogId;
use crate::NodeId;

/// An RPC invoked by candidates to gather ballots during an election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's id.
    pub candidate: NodeId,
    /// The candidate's last log id, used for the up-to-date comparison.
    pub last_log: LogId,
}

impl BallotRequest {
    pub fn new(term: u64, candidate: NodeId, last_log: LogId) -> Self {
        Self { term, candidate, last_log }
    }
}

impl MessageSummary for BallotRequest {
    fn summary(&self) -> String {
        format!("term: {}, candidate: {}, last_log: {}", self.term, self.candidate, self.last_log)
    }
}

/// The response to a `BallotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BallotResponse {
    /// The responder's current term, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a ballot from the responder.
    pub granted: bool,
}

/// An RPC invoked by the leader to replicate log entries; also used as heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's id, so followers can redirect clients.
    pub leader: NodeId,
    /// The log id of the entry immediately preceding the new entries.
    pub prev_log: LogId,
    /// The new log entries to store. Empty for heartbeat.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendRequest {
    fn summary(&self) -> String {
        format!(
            "term: {}, leader: {}, prev_log: {}, leader_commit: {}, entries: {}",
            self.term,
            self.leader,
            self.prev_log,
            self.leader_commit,
            self.entries.as_slice().summary()
        )
    }
}

/// The response to an `AppendRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    /// The responder's current term, for the leader to update itself.
    pub term: u64,
    /// Whether the entries were accepted, and on rejection the conflict hint.
    pub outcome: AppendOutcome,
}

/// The outcome of an append RPC on the follower.
#[derive(Debug, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// The entries were stored; the follower's log now matches the leader's through `matched`.
    Accept {
        /// The index of the last entry known to match the leader's log.
        matched: u64,
    },
    /// The prev-log check failed, or the request carried a stale term.
    Reject {
        /// A hint letting the leader jump past the entire conflicting term.
        /// `None` only on a stale-term refusal, which carries no usable hint.
        conflict: Option<Conflict>,
    },
}

/// A struct used to implement the conflicting-term optimization for log replication.
///
/// Carrying the term and index of the follower's conflicting entry lets the
/// leader bypass all entries of the divergent term with a single response,
/// instead of walking back one index per round trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Conflict {
    /// The log id of the conflict point on the follower.
    pub log_id: LogId,
}

/// A congress log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    /// This entry's payload.
    pub payload: EntryPayload,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl Entry {
    /// Create a new blank log entry, used by a fresh leader to assert leadership.
    pub fn new_blank(log_id: LogId) -> Self {
        Self { log_id, payload: EntryPayload::Blank }
    }

    /// Create a new topology-change entry.
    pub fn new_topology(log_id: LogId, topology: Topology) -> Self {
        Self { log_id, payload: EntryPayload::Topology(topology) }
    }
}

/// A closed set of possible payloads of a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new leader.
    Blank,
    /// A client command to be applied to the state machine.
    Command(ClientCommand),
    /// A topology change, replicated through the log like any other entry.
    Topology(Topology),
    /// A session-adjudication record emitted when a client reattaches elsewhere.
    Adjudicate(Adjudicate),
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Command(cmd) => format!("command: client {} serial {}", cmd.client, cmd.serial),
            EntryPayload::Topology(t) => format!("topology: {}", t.summary()),
            EntryPayload::Adjudicate(a) => {
                format!("adjudicate: index {} client {} origin {} serial {}", a.index, a.client, a.origin, a.serial)
            }
        }
    }
}

/// A command submitted by a client for replication and apply.
///
/// The `(client, serial)` pair is the submission identity: it correlates the
/// committed entry back to its submitter and lets the apply boundary drop
/// duplicate deliveries of the same submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCommand {
    /// The id of the submitting client.
    pub client: u64,
    /// The client's monotonically increasing submission serial.
    pub serial: u32,
    /// The opaque command bytes handed to the apply callback.
    pub payload: Vec<u8>,
}

impl ClientCommand {
    pub fn new(client: u64, serial: u32, payload: Vec<u8>) -> Self {
        Self { client, serial, payload }
    }
}

/// An administrative record adjudicating which node owns a client session.
///
/// Routed through the submission path like a command; the downstream
/// redirection policy applied when the record commits is left to the
/// apply callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjudicate {
    /// The log index at which the contested submission was observed.
    pub index: u64,
    /// The id of the contested client.
    pub client: u64,
    /// The node now claiming the client's session.
    pub origin: NodeId,
    /// The serial of the submission that triggered adjudication.
    pub serial: u32,
}

/// The cluster topology: voting peers plus non-voting gateway peers.
///
/// Gates receive replication but never count toward quorum and never stand
/// for election.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// The voting members of the congress.
    pub voters: BTreeSet<NodeId>,
    /// Non-voting gateway peers receiving replication.
    pub gates: BTreeSet<NodeId>,
}

impl MessageSummary for Topology {
    fn summary(&self) -> String {
        format!("voters: {:?}, gates: {:?}", self.voters, self.gates)
    }
}

impl Topology {
    /// Create a new topology with the given voter set and no gates.
    pub fn new_initial(id: NodeId) -> Self {
        let mut voters = BTreeSet::new();
        voters.insert(id);
        Self { voters, gates: BTreeSet::new() }
    }

    /// All nodes receiving replication, voters and gates alike.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        self.voters.union(&self.gates).cloned().collect()
    }

    /// Check if the given id is a voting member.
    pub fn contains_voter(&self, id: &NodeId) -> bool {
        self.voters.contains(id)
    }

    /// Check if the given id appears anywhere in the topology.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.voters.contains(id) || self.gates.contains(id)
    }

    /// The number of nodes differing between this topology and `other`,
    /// counting voters and gates separately.
    pub fn delta(&self, other: &Topology) -> usize {
        self.voters.symmetric_difference(&other.voters).count() + self.gates.symmetric_difference(&other.gates).count()
    }
}

/// The application data response to a committed client command.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// The log index under which the command was committed.
    pub index: u64,
    /// The bytes synthesized by the apply callback for this command.
    pub payload: Vec<u8>,
}
