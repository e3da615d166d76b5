//! A Raft consensus core: the per-node decision engine of a replicated state
//! machine. It handles leader elections, log replication, single-node
//! membership changes, and snapshot installation.
//!
//! The deterministic core is [`RawNode`], which processes one event at a time
//! and emits outbound messages through a [`Connector`]. [`Node`] wraps a
//! RawNode in a serial executor thread plus a membership executor, giving a
//! thread-safe public API. Wire transport, state machine application, and
//! durable storage backends plug in via the [`Connector`], [`NodeStore`] and
//! [`crate::storage::Engine`] seams.

mod group;
mod log;
mod membership;
mod message;
mod node;
mod scheduler;
mod server;
mod store;

pub use group::{NodeEndpoint, NodeGroup, NodeId, NodeState, ReplicatingState};
pub use log::{Command, ConfigChange, Entry, GroupConfigEntry, Index, Log, LogEvent, Snapshot};
pub use membership::{TaskReference, TaskResult};
pub use message::{
    AppendEntries, AppendEntriesResult, AppendEntriesResultMessage, ChannelConnector, Connector,
    Envelope, InstallSnapshot, InstallSnapshotResult, InstallSnapshotResultMessage, Message,
    MessageId, RequestVote, RequestVoteResult,
};
pub use node::{Options, RawNode, RoleName, RoleState, Term};
pub use scheduler::{NullScheduler, Scheduler, ThreadScheduler, Timer, TimerEvent};
pub use server::Node;
pub use store::{FileNodeStore, MemoryNodeStore, NodeStore};

use std::time::Duration;

/// The default lower bound of the randomized election timeout.
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(3000);

/// The default upper bound of the randomized election timeout.
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(4000);

/// The default leader replication tick period.
pub const REPLICATION_INTERVAL: Duration = Duration::from_millis(1000);

/// The default minimum delay before re-sending to a peer with a request
/// already in flight.
pub const MIN_REPLICATION_INTERVAL: Duration = Duration::from_millis(900);

/// The default maximum number of entries per AppendEntries request.
pub const MAX_APPEND_ENTRIES: usize = 100;

/// The default snapshot chunk size in bytes.
pub const SNAPSHOT_CHUNK_SIZE: usize = 1024;

/// The default maximum number of catch-up rounds for an added node.
pub const NEW_NODE_MAX_ROUND: u32 = 10;

/// The default deadline for a single catch-up round.
pub const NEW_NODE_ADVANCE_TIMEOUT: Duration = Duration::from_millis(3000);

/// The default wait for a previously submitted membership change. Zero: a
/// second change submitted while one is active resolves Timeout immediately.
pub const PREVIOUS_GROUP_CONFIG_CHANGE_TIMEOUT: Duration = Duration::ZERO;
