use super::{Entry, Index, NodeId, Term};
use crate::error::Result;

use serde::{Deserialize, Serialize};

/// A message identifier, used to pair append requests with their results.
pub type MessageId = u64;

/// A message passed between Raft nodes, wrapped in a routing envelope by the
/// transport. The message set is wire-compatible with the RPCs of the Raft
/// paper; empty AppendEntries double as heartbeats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResult(RequestVoteResult),
    AppendEntries(AppendEntries),
    AppendEntriesResult(AppendEntriesResult),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResult(InstallSnapshotResult),
}

/// Candidates solicit votes from all major peers when campaigning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    /// The candidate's term.
    pub term: Term,
    /// The campaigning candidate.
    pub candidate_id: NodeId,
    /// The index of the candidate's last log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// A vote reply. Does not identify the voter; candidates only count grants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// The voter's current term.
    pub term: Term,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// Leaders replicate log entries to peers, and probe their log position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// Identifies this request. Echoed in the result, which lets the leader
    /// compute the peer's match index from the request it acknowledged.
    pub message_id: MessageId,
    /// The leader's term.
    pub term: Term,
    /// The leader's id, so followers can redirect clients.
    pub leader_id: NodeId,
    /// The index of the entry immediately preceding entries.
    pub prev_log_index: Index,
    /// The term of the entry immediately preceding entries.
    pub prev_log_term: Term,
    /// Entries to append. Empty for heartbeats.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: Index,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// The message id of the request this responds to.
    pub message_id: MessageId,
    /// The responder's current term.
    pub term: Term,
    /// Whether the entries were appended (the log matched).
    pub success: bool,
}

/// Leaders stream a snapshot to peers whose required log prefix has been
/// compacted away.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    /// The leader's term.
    pub term: Term,
    /// The leader's id.
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up through this index.
    pub last_included_index: Index,
    /// The term of the entry at last_included_index.
    pub last_included_term: Term,
    /// Byte offset of this chunk within the snapshot data.
    pub offset: u64,
    /// The chunk data.
    pub data: Vec<u8>,
    /// True if this is the last chunk.
    pub done: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    /// The responder's current term.
    pub term: Term,
}

/// A routed message between two nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeId,
    /// The recipient.
    pub to: NodeId,
    /// The message.
    pub message: Message,
}

/// An AppendEntries result delivered to the core together with the request it
/// responds to. The transport layer pairs them up (see the server's sent-
/// request log); the pairing makes result handling idempotent, since the
/// acknowledged match index is computed from the echoed request rather than
/// from local replication state.
#[derive(Clone, Debug, PartialEq)]
pub struct AppendEntriesResultMessage {
    /// The responding peer.
    pub from: NodeId,
    /// The result.
    pub result: AppendEntriesResult,
    /// The request this result responds to.
    pub rpc: AppendEntries,
}

/// An InstallSnapshot result paired with the echoed request, which carries
/// the chunk offset and done flag needed to stream the next chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct InstallSnapshotResultMessage {
    /// The responding peer.
    pub from: NodeId,
    /// The result.
    pub result: InstallSnapshotResult,
    /// The request this result responds to.
    pub rpc: InstallSnapshot,
}

/// An outbound message sink, addressed by node id. Implementations are
/// expected to be fire-and-forget: the core never waits for a response, and
/// delivery failures surface as protocol retries rather than errors.
pub trait Connector: Send {
    fn send(&self, to: &NodeId, message: Message) -> Result<()>;
}

/// A connector that delivers messages into a crossbeam channel as envelopes,
/// for in-process clusters and tests.
pub struct ChannelConnector {
    from: NodeId,
    tx: crossbeam::channel::Sender<Envelope>,
}

impl ChannelConnector {
    pub fn new(from: NodeId, tx: crossbeam::channel::Sender<Envelope>) -> Self {
        Self { from, tx }
    }
}

impl Connector for ChannelConnector {
    fn send(&self, to: &NodeId, message: Message) -> Result<()> {
        Ok(self.tx.send(Envelope { from: self.from.clone(), to: to.clone(), message })?)
    }
}
