use super::membership::{ChangeKind, ChangePhase, GroupConfigChange, TaskReference, TaskResult};
use super::message::{
    AppendEntries, AppendEntriesResult, AppendEntriesResultMessage, Connector, InstallSnapshot,
    InstallSnapshotResult, InstallSnapshotResultMessage, Message, MessageId, RequestVote,
    RequestVoteResult,
};
use super::{
    Command, ConfigChange, GroupConfigEntry, Index, Log, LogEvent, NodeEndpoint, NodeGroup,
    NodeId, NodeStore, Scheduler, Timer,
};
use crate::error::{Error, Result};

use ::log::{debug, info, warn};
use rand::Rng as _;
use std::time::{Duration, Instant};

/// A leader term.
pub type Term = u64;

/// Raft node options.
pub struct Options {
    /// The range of randomized election timeouts.
    pub election_timeout: std::ops::Range<Duration>,
    /// The leader's replication tick period.
    pub replication_interval: Duration,
    /// The minimum delay before re-sending to a peer with a replication
    /// request already in flight.
    pub min_replication_interval: Duration,
    /// Maximum number of entries in a single AppendEntries request.
    pub max_append_entries: usize,
    /// Maximum snapshot bytes in a single InstallSnapshot chunk.
    pub snapshot_chunk_size: usize,
    /// Maximum catch-up rounds for a node being added.
    pub new_node_max_round: u32,
    /// A catch-up round finishing within this duration means the new node
    /// has caught up.
    pub new_node_advance_timeout: Duration,
    /// How long add_node/remove_node wait for a previously submitted config
    /// change before giving up with Timeout.
    pub previous_group_config_change_timeout: Duration,
    /// Standby nodes never campaign; they follow, vote, and replicate only.
    pub standby: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            election_timeout: super::ELECTION_TIMEOUT_MIN..super::ELECTION_TIMEOUT_MAX,
            replication_interval: super::REPLICATION_INTERVAL,
            min_replication_interval: super::MIN_REPLICATION_INTERVAL,
            max_append_entries: super::MAX_APPEND_ENTRIES,
            snapshot_chunk_size: super::SNAPSHOT_CHUNK_SIZE,
            new_node_max_round: super::NEW_NODE_MAX_ROUND,
            new_node_advance_timeout: super::NEW_NODE_ADVANCE_TIMEOUT,
            previous_group_config_change_timeout: super::PREVIOUS_GROUP_CONFIG_CHANGE_TIMEOUT,
            standby: false,
        }
    }
}

/// A role name, for state snapshots.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RoleName {
    Follower,
    Candidate,
    Leader,
}

/// A point-in-time snapshot of the node's role state.
#[derive(Clone, Debug, PartialEq)]
pub struct RoleState {
    pub role: RoleName,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    /// The known leader, if any. Leaders report themselves.
    pub leader_id: Option<NodeId>,
    /// Votes received this term. Only meaningful for candidates.
    pub votes: u64,
}

/// The node's current role. Exactly one is active at a time; every role owns
/// its timer, and constructing a new role drops (and thereby cancels) the
/// previous role's timer.
enum Role {
    Follower {
        /// The leader in the current term, if known.
        leader: Option<NodeId>,
        /// The election timer. Inert for standby and removed nodes.
        timer: Timer,
    },
    Candidate {
        /// Granted votes this term, including our own.
        votes: u64,
        /// The election timer, restarting the election on expiry.
        #[allow(dead_code)]
        timer: Timer,
    },
    Leader {
        /// The periodic replication timer.
        #[allow(dead_code)]
        timer: Timer,
    },
}

#[derive(Clone, Copy, PartialEq)]
enum Lifecycle {
    New,
    Started,
    Stopped,
}

/// The consensus core: a single node's deterministic decision engine.
///
/// RawNode is strictly single-threaded and processes one event at a time:
/// timer events, client requests, and inbound RPC messages each mutate role,
/// log, and group state and emit outbound messages via the connector, which
/// never blocks. The [`super::Node`] wrapper runs a RawNode on a serial
/// executor; tests drive a RawNode directly for determinism.
pub struct RawNode {
    id: NodeId,
    group: NodeGroup,
    log: Log,
    store: Box<dyn NodeStore>,
    connector: Box<dyn Connector>,
    scheduler: Box<dyn Scheduler>,
    opts: Options,
    /// The current term, mirroring the node store.
    term: Term,
    /// Our vote in the current term, if any, mirroring the node store.
    voted_for: Option<NodeId>,
    role: Role,
    lifecycle: Lifecycle,
    /// The at-most-one in-flight group config change.
    config_change: Option<GroupConfigChange>,
    /// The last assigned outbound message id.
    message_id: MessageId,
}

impl RawNode {
    /// Creates a new node with the given initial membership. The node is
    /// inert until start() is called.
    pub fn new(
        id: NodeId,
        members: Vec<NodeEndpoint>,
        log: Log,
        store: Box<dyn NodeStore>,
        connector: Box<dyn Connector>,
        scheduler: Box<dyn Scheduler>,
        opts: Options,
    ) -> Self {
        let group = NodeGroup::new(id.clone(), members);
        Self {
            id,
            group,
            log,
            store,
            connector,
            scheduler,
            opts,
            term: 0,
            voted_for: None,
            role: Role::Follower { leader: None, timer: Timer::none() },
            lifecycle: Lifecycle::New,
            config_change: None,
            message_id: 0,
        }
    }

    /// Starts the node: loads the durable term and vote and enters the
    /// follower role with an election timer. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::New {
            return Ok(());
        }
        let (term, voted_for) = self.store.load()?;
        self.term = term;
        self.voted_for = voted_for;
        self.lifecycle = Lifecycle::Started;
        info!("node {} starting as follower at term {term}", self.id);
        let timer = self.arm_election_timer();
        self.role = Role::Follower { leader: None, timer };
        Ok(())
    }

    /// Stops the node, cancelling its timers and any in-flight config
    /// change. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::Started {
            return Ok(());
        }
        info!("node {} stopping", self.id);
        self.lifecycle = Lifecycle::Stopped;
        self.role = Role::Follower { leader: None, timer: Timer::none() };
        if let Some(change) = self.config_change.take() {
            change.task.complete(TaskResult::Cancelled);
        }
        Ok(())
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut Log {
        &mut self.log
    }

    pub fn group(&self) -> &NodeGroup {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut NodeGroup {
        &mut self.group
    }

    /// Returns a snapshot of the current role state.
    pub fn role_state(&self) -> RoleState {
        let (role, leader_id, votes) = match &self.role {
            Role::Follower { leader, .. } => (RoleName::Follower, leader.clone(), 0),
            Role::Candidate { votes, .. } => (RoleName::Candidate, None, *votes),
            Role::Leader { .. } => (RoleName::Leader, Some(self.id.clone()), 0),
        };
        RoleState { role, term: self.term, voted_for: self.voted_for.clone(), leader_id, votes }
    }

    /// Returns the in-flight group config change task, if any.
    pub fn group_config_change_task(&self) -> Option<TaskReference> {
        self.config_change.as_ref().map(|c| c.task.clone())
    }

    /// The election timer expired. Followers campaign for leadership in a
    /// new term, candidates restart their election, leaders ignore stale
    /// timers, and standby nodes stand down their timer.
    pub fn election_timeout(&mut self) -> Result<()> {
        self.ensure_started()?;
        if matches!(self.role, Role::Leader { .. }) {
            warn!("node {} got election timeout as leader, ignoring", self.id);
            return Ok(());
        }
        if self.opts.standby {
            info!("standby node {} won't campaign", self.id);
            if let Role::Follower { timer, .. } = &mut self.role {
                *timer = Timer::none();
            }
            return Ok(());
        }
        self.become_candidate()
    }

    /// The replication timer ticked. Leaders send AppendEntries to every
    /// peer without a recent request in flight.
    pub fn replicate_log(&mut self) -> Result<()> {
        self.ensure_started()?;
        if !matches!(self.role, Role::Leader { .. }) {
            debug!("node {} got replication tick as non-leader, ignoring", self.id);
            return Ok(());
        }
        self.do_replicate()
    }

    /// Appends a client payload to the log and replicates it, returning its
    /// index. Leader only.
    pub fn append_log(&mut self, payload: Vec<u8>) -> Result<Index> {
        self.ensure_started()?;
        self.ensure_leader()?;
        let index = self.log.append(self.term, Command::Write(payload))?;
        debug!("node {} appended client entry {index}", self.id);
        self.do_replicate()?;
        Ok(index)
    }

    /// Begins adding a node to the group. The node first catches up in
    /// rounds as a non-voting member; once caught up, an AddNode entry is
    /// appended and replicated, and the returned task resolves when it
    /// commits. Leader only, and at most one change can be in flight.
    pub fn add_node(&mut self, endpoint: NodeEndpoint) -> Result<TaskReference> {
        self.ensure_started()?;
        self.ensure_leader()?;
        if self.group.get(&endpoint.id).is_some() {
            return crate::errinput!("node {} is already a group member", endpoint.id);
        }
        if let Some(task) = self.await_previous_change() {
            return Ok(task);
        }
        info!("node {} adding node {}", self.id, endpoint);
        let (last_index, _) = self.log.get_last_index();
        self.group.add(endpoint.clone(), last_index + 1, false);
        self.group.replication_state_mut(&endpoint.id)?.round = 1;
        let task = TaskReference::new();
        self.config_change = Some(GroupConfigChange {
            kind: ChangeKind::AddNode(endpoint.clone()),
            phase: ChangePhase::CatchingUp { target: last_index, started: Instant::now() },
            task: task.clone(),
        });
        self.send_append_entries(&endpoint.id)?;
        Ok(task)
    }

    /// Begins removing a node from the group by appending and replicating a
    /// RemoveNode entry. The returned task resolves when it commits; if the
    /// local node removes itself, it steps down to a non-voting follower on
    /// commit. Leader only, and at most one change can be in flight.
    pub fn remove_node(&mut self, id: &NodeId) -> Result<TaskReference> {
        self.ensure_started()?;
        self.ensure_leader()?;
        if self.group.get(id).is_none() {
            return crate::errinput!("unknown node {id}");
        }
        if let Some(task) = self.await_previous_change() {
            return Ok(task);
        }
        info!("node {} removing node {id}", self.id);
        let prev_members = self.group.endpoints_of_major();
        let index = self
            .log
            .append(self.term, Command::Config(ConfigChange::RemoveNode { id: id.clone(), prev_members }))?;
        self.group.set_removing(id);
        let task = TaskReference::new();
        self.config_change = Some(GroupConfigChange {
            kind: ChangeKind::RemoveNode(id.clone()),
            phase: ChangePhase::AwaitingCommit { index },
            task: task.clone(),
        });
        self.do_replicate()?;
        Ok(task)
    }

    /// Cancels the in-flight group config change, resolving its task with
    /// Cancelled. A node still catching up is evicted; an already appended
    /// config entry stays in the log and may still commit.
    pub fn cancel_group_config_change(&mut self) -> Result<()> {
        self.ensure_started()?;
        let Some(change) = self.config_change.take() else {
            return Ok(());
        };
        info!("node {} cancelling group config change", self.id);
        change.task.complete(TaskResult::Cancelled);
        if let (ChangeKind::AddNode(endpoint), ChangePhase::CatchingUp { .. }) =
            (&change.kind, &change.phase)
        {
            self.group.remove(&endpoint.id);
        }
        Ok(())
    }

    /// Handles an inbound RequestVote. Grants the vote iff the sender is a
    /// known major member, its term is current, we haven't voted for anyone
    /// else this term, and its log is at least as up-to-date as ours. The
    /// vote is persisted before the reply is sent.
    pub fn on_request_vote(&mut self, from: &NodeId, rpc: RequestVote) -> Result<()> {
        self.ensure_started()?;
        if !self.group.is_major(from) {
            debug!("node {} rejecting vote for unknown or non-major {from}", self.id);
            return self.send_vote_result(from, false);
        }
        if rpc.term < self.term {
            debug!("node {} rejecting vote for {from} from stale term {}", self.id, rpc.term);
            return self.send_vote_result(from, false);
        }
        if rpc.term > self.term {
            self.become_follower(rpc.term, None)?;
        }

        let granted = match &self.role {
            Role::Follower { .. } => {
                let can_vote = self.voted_for.is_none()
                    || self.voted_for.as_ref() == Some(&rpc.candidate_id);
                let (last_index, last_term) = self.log.get_last_index();
                let up_to_date = rpc.last_log_term > last_term
                    || (rpc.last_log_term == last_term && rpc.last_log_index >= last_index);
                can_vote && up_to_date
            }
            // Candidates voted for themselves, and leaders won this term.
            Role::Candidate { .. } | Role::Leader { .. } => false,
        };

        if granted {
            info!("node {} voting for {} in term {}", self.id, rpc.candidate_id, self.term);
            self.voted_for = Some(rpc.candidate_id.clone());
            self.store.save(self.term, Some(&rpc.candidate_id))?;
            self.reset_election_timer();
        }
        self.send_vote_result(from, granted)
    }

    /// Handles a vote reply. Only meaningful while campaigning at the
    /// reply's term; a majority of granted votes wins the election.
    pub fn on_request_vote_result(&mut self, result: RequestVoteResult) -> Result<()> {
        self.ensure_started()?;
        if result.term > self.term {
            return self.become_follower(result.term, None);
        }
        let Role::Candidate { votes, .. } = &mut self.role else {
            debug!("node {} ignoring vote result as non-candidate", self.id);
            return Ok(());
        };
        if result.term < self.term || !result.vote_granted {
            return Ok(());
        }
        *votes += 1;
        let votes = *votes;
        debug!("node {} has {votes} votes in term {}", self.id, self.term);
        if votes as usize >= self.quorum_size() {
            return self.become_leader();
        }
        Ok(())
    }

    /// Handles an inbound AppendEntries: follows the sender if it has
    /// authority for the current term, matches the log at the given base,
    /// splices the entries, and advances the commit index.
    pub fn on_append_entries(&mut self, from: &NodeId, rpc: AppendEntries) -> Result<()> {
        self.ensure_started()?;
        if rpc.term < self.term {
            debug!("node {} rejecting stale AppendEntries from {from}", self.id);
            return self.send_append_result(from, rpc.message_id, false);
        }
        if rpc.term > self.term {
            self.become_follower(rpc.term, Some(rpc.leader_id.clone()))?;
        }
        let follow = match &self.role {
            Role::Leader { .. } => {
                // There can't be two leaders in the same term.
                warn!("node {} got AppendEntries from {from} in its own term", self.id);
                return self.send_append_result(from, rpc.message_id, false);
            }
            // Someone else won this term's election; follow it.
            Role::Candidate { .. } => true,
            Role::Follower { leader: None, .. } => true,
            Role::Follower { leader: Some(leader), .. } => *leader != rpc.leader_id,
        };
        if follow {
            self.become_follower(self.term, Some(rpc.leader_id.clone()))?;
        }
        // Every AppendEntries from the leader, matching or not, resets the
        // election timer.
        self.reset_election_timer();

        let success = self.log.has(rpc.prev_log_index, rpc.prev_log_term)?;
        if success {
            let last_new_index = rpc.prev_log_index + rpc.entries.len() as Index;
            self.log.splice(rpc.entries)?;
            let (commit_index, _) = self.log.get_commit_index();
            if rpc.leader_commit > commit_index {
                self.log.commit(std::cmp::min(rpc.leader_commit, last_new_index))?;
            }
        } else {
            debug!(
                "node {} log mismatch at {}@{}",
                self.id, rpc.prev_log_index, rpc.prev_log_term
            );
        }
        self.send_append_result(from, rpc.message_id, success)?;
        self.process_log_events()
    }

    /// Handles an AppendEntries result, paired with the request it answers.
    /// Advances the peer's progress, drives catch-up for nodes being added,
    /// backs off on rejection, and recomputes the commit index.
    pub fn on_append_entries_result(&mut self, msg: AppendEntriesResultMessage) -> Result<()> {
        self.ensure_started()?;
        let AppendEntriesResultMessage { from, result, rpc } = msg;
        if result.term > self.term {
            return self.become_follower(result.term, None);
        }
        if !matches!(self.role, Role::Leader { .. }) {
            debug!("node {} ignoring append result as non-leader", self.id);
            return Ok(());
        }
        let Some(member) = self.group.get(&from) else {
            debug!("node {} ignoring append result from unknown node {from}", self.id);
            return Ok(());
        };
        let major = member.major;
        if member.removing {
            // The peer's removal is in flight; its progress no longer
            // matters, just close the replication window.
            self.group.replication_state_mut(&from)?.stop_replicating();
            return Ok(());
        }
        if result.term < self.term {
            debug!("node {} ignoring append result from stale term {}", self.id, result.term);
            return Ok(());
        }

        if !result.success {
            if self.group.replication_state_mut(&from)?.back_off() {
                let next = self.group.replication_state(&from)?.next_index;
                debug!("node {} backing off to {next} for {from}", self.id);
                return self.send_append_entries(&from);
            }
            debug!("node {} can't back off further for {from}, giving up", self.id);
            self.group.replication_state_mut(&from)?.stop_replicating();
            return Ok(());
        }

        // The acknowledged match index comes from the echoed request, which
        // makes duplicate and reordered results harmless.
        let match_index = rpc.prev_log_index + rpc.entries.len() as Index;
        self.group.replication_state_mut(&from)?.advance(match_index);

        if !major {
            return self.drive_catch_up(&from);
        }
        self.continue_replication(&from)?;
        self.maybe_commit()?;
        Ok(())
    }

    /// Handles an inbound InstallSnapshot chunk. The sender has leader
    /// authority at its term; the final chunk resets the log to the
    /// snapshot point. Replies with the current term either way.
    pub fn on_install_snapshot(&mut self, from: &NodeId, rpc: InstallSnapshot) -> Result<()> {
        self.ensure_started()?;
        if rpc.term < self.term {
            debug!("node {} rejecting stale InstallSnapshot from {from}", self.id);
            return self.send_to(from, Message::InstallSnapshotResult(InstallSnapshotResult {
                term: self.term,
            }));
        }
        if rpc.term > self.term {
            self.become_follower(rpc.term, Some(rpc.leader_id.clone()))?;
        }
        let follow = match &self.role {
            Role::Leader { .. } => {
                warn!("node {} got InstallSnapshot from {from} in its own term", self.id);
                return self.send_to(from, Message::InstallSnapshotResult(
                    InstallSnapshotResult { term: self.term },
                ));
            }
            Role::Candidate { .. } | Role::Follower { leader: None, .. } => true,
            Role::Follower { leader: Some(leader), .. } => *leader != rpc.leader_id,
        };
        if follow {
            self.become_follower(self.term, Some(rpc.leader_id.clone()))?;
        }
        self.reset_election_timer();

        let installed = self.log.install(
            rpc.last_included_index,
            rpc.last_included_term,
            rpc.offset,
            rpc.data,
            rpc.done,
        )?;
        if installed {
            info!(
                "node {} installed snapshot through {}@{}",
                self.id, rpc.last_included_index, rpc.last_included_term
            );
        }
        self.send_to(from, Message::InstallSnapshotResult(InstallSnapshotResult {
            term: self.term,
        }))
    }

    /// Handles an InstallSnapshot result, paired with the request it
    /// answers. Streams the next chunk, or resumes AppendEntries past the
    /// snapshot once the peer acknowledges the final chunk.
    pub fn on_install_snapshot_result(&mut self, msg: InstallSnapshotResultMessage) -> Result<()> {
        self.ensure_started()?;
        let InstallSnapshotResultMessage { from, result, rpc } = msg;
        if result.term > self.term {
            return self.become_follower(result.term, None);
        }
        if !matches!(self.role, Role::Leader { .. }) {
            debug!("node {} ignoring snapshot result as non-leader", self.id);
            return Ok(());
        }
        let Some(member) = self.group.get(&from) else {
            debug!("node {} ignoring snapshot result from unknown node {from}", self.id);
            return Ok(());
        };
        if member.removing {
            self.group.replication_state_mut(&from)?.stop_replicating();
            return Ok(());
        }
        if rpc.done {
            self.group.replication_state_mut(&from)?.advance(rpc.last_included_index);
            self.send_append_entries(&from)
        } else {
            self.send_install_snapshot(&from, rpc.offset + rpc.data.len() as u64)
        }
    }

    /// A follower observed a group config entry appended from the leader;
    /// the membership change is applied optimistically before commit.
    pub fn on_group_config_appended(&mut self, entry: GroupConfigEntry) -> Result<()> {
        match entry.change {
            ConfigChange::AddNode { endpoint, .. } => {
                info!("node {} applying add of {} from leader", self.id, endpoint.id);
                let (last_index, _) = self.log.get_last_index();
                if self.group.get(&endpoint.id).is_none() {
                    self.group.add(endpoint, last_index + 1, true);
                } else {
                    self.group.upgrade(&endpoint.id);
                }
            }
            ConfigChange::RemoveNode { id, .. } => {
                // Our own removal only takes effect on commit.
                if id != self.id {
                    info!("node {} applying removal of {id} from leader", self.id);
                    self.group.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// A group config entry committed: finalize the change. An added node
    /// becomes major; a removed node is dropped, and a node observing its
    /// own committed removal steps down without an election timer.
    pub fn on_group_config_committed(&mut self, entry: GroupConfigEntry) -> Result<()> {
        match &entry.change {
            ConfigChange::AddNode { endpoint, .. } => {
                info!("node {} finalizing add of {}", self.id, endpoint.id);
                if self.group.get(&endpoint.id).is_none() {
                    let (last_index, _) = self.log.get_last_index();
                    self.group.add(endpoint.clone(), last_index + 1, true);
                } else {
                    self.group.upgrade(&endpoint.id);
                }
            }
            ConfigChange::RemoveNode { id, .. } => {
                info!("node {} finalizing removal of {id}", self.id);
                self.group.remove(id);
                if *id == self.id {
                    info!("node {} was removed from the group, stepping down", self.id);
                    self.role = Role::Follower { leader: None, timer: Timer::none() };
                }
            }
        }
        self.complete_config_change(entry.index, TaskResult::Ok);
        Ok(())
    }

    /// An uncommitted group config entry was truncated by a log conflict;
    /// revert to the pre-change member set carried in the entry.
    pub fn on_group_config_removed(&mut self, entry: GroupConfigEntry) -> Result<()> {
        info!("node {} reverting truncated config entry at {}", self.id, entry.index);
        let prev_members = match &entry.change {
            ConfigChange::AddNode { prev_members, .. }
            | ConfigChange::RemoveNode { prev_members, .. } => prev_members.clone(),
        };
        self.group.apply_members(&prev_members);
        self.complete_config_change(entry.index, TaskResult::Error);
        Ok(())
    }

    /// Resolves the in-flight config change if it is awaiting the commit of
    /// the given entry index.
    fn complete_config_change(&mut self, index: Index, result: TaskResult) {
        let matches = self
            .config_change
            .as_ref()
            .map(|c| matches!(c.phase, ChangePhase::AwaitingCommit { index: i } if i == index))
            .unwrap_or(false);
        if matches {
            let change = self.config_change.take().expect("config change vanished");
            change.task.complete(result);
        }
    }

    /// Drains log events and dispatches them. Called after every operation
    /// that may mutate the log.
    fn process_log_events(&mut self) -> Result<()> {
        for event in self.log.take_events() {
            match event {
                LogEvent::GroupConfigAppended(entry) => self.on_group_config_appended(entry)?,
                LogEvent::GroupConfigCommitted(entry) => self.on_group_config_committed(entry)?,
                LogEvent::GroupConfigRemoved(entry) => self.on_group_config_removed(entry)?,
            }
        }
        Ok(())
    }

    fn ensure_started(&self) -> Result<()> {
        if self.lifecycle != Lifecycle::Started {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    fn ensure_leader(&self) -> Result<()> {
        match &self.role {
            Role::Leader { .. } => Ok(()),
            Role::Follower { leader, .. } => Err(Error::NotLeader(leader.clone())),
            Role::Candidate { .. } => Err(Error::NotLeader(None)),
        }
    }

    /// Returns the quorum size (strict majority) of the major members.
    fn quorum_size(&self) -> usize {
        self.group.count_of_major() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The slice must have one element per major member.
    fn quorum_value(&self, mut values: Vec<Index>) -> Index {
        assert_eq!(values.len(), self.group.count_of_major(), "must have one value per major");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b| a.cmp(b).reverse()).1
    }

    fn next_message_id(&mut self) -> MessageId {
        self.message_id += 1;
        self.message_id
    }

    fn send_to(&self, to: &NodeId, message: Message) -> Result<()> {
        debug!("node {} sending {message:?} to {to}", self.id);
        self.connector.send(to, message)
    }

    fn send_vote_result(&self, to: &NodeId, vote_granted: bool) -> Result<()> {
        self.send_to(to, Message::RequestVoteResult(RequestVoteResult {
            term: self.term,
            vote_granted,
        }))
    }

    fn send_append_result(&self, to: &NodeId, message_id: MessageId, success: bool) -> Result<()> {
        self.send_to(to, Message::AppendEntriesResult(AppendEntriesResult {
            message_id,
            term: self.term,
            success,
        }))
    }

    /// Generates a randomized election timeout and schedules it. Standby
    /// nodes never arm an election timer.
    fn arm_election_timer(&mut self) -> Timer {
        if self.opts.standby {
            return Timer::none();
        }
        let delay = rand::thread_rng().gen_range(self.opts.election_timeout.clone());
        self.scheduler.schedule_election_timeout(delay)
    }

    fn reset_election_timer(&mut self) {
        let timer = self.arm_election_timer();
        if let Role::Follower { timer: t, .. } = &mut self.role {
            *t = timer;
        }
    }

    /// Transitions to follower. A larger term clears the vote and is
    /// persisted before any further side effects.
    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Result<()> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        if term > self.term {
            info!("node {} discovered new term {term}", self.id);
            self.term = term;
            self.voted_for = None;
            self.store.save(term, None)?;
        } else if let Some(leader) = &leader {
            info!("node {} following leader {leader} in term {term}", self.id);
        }
        let timer = self.arm_election_timer();
        self.role = Role::Follower { leader, timer };
        Ok(())
    }

    /// Transitions to candidate: increments the term, votes for ourself,
    /// persists both, and solicits votes from all major peers. A node that
    /// is its own quorum becomes leader immediately.
    fn become_candidate(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("node {} starting election for term {term}", self.id);
        self.term = term;
        self.voted_for = Some(self.id.clone());
        self.store.save(term, Some(&self.id))?;
        let timer = self.arm_election_timer();
        self.role = Role::Candidate { votes: 1, timer };

        if 1 >= self.quorum_size() {
            return self.become_leader();
        }
        let (last_log_index, last_log_term) = self.log.get_last_index();
        let message = Message::RequestVote(RequestVote {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        });
        for peer in self.group.major_peers() {
            self.send_to(&peer, message.clone())?;
        }
        Ok(())
    }

    /// Transitions to leader: resets every member's replication progress to
    /// just past the current log, arms the replication timer, and appends a
    /// no-op entry. Committing the no-op via a current-term quorum commits
    /// all earlier-term entries (see section 5.4.2 in the Raft paper).
    fn become_leader(&mut self) -> Result<()> {
        info!("node {} won election for term {}, becoming leader", self.id, self.term);
        let (last_index, _) = self.log.get_last_index();
        self.group.reset_replication_states(last_index + 1);
        let timer = self.scheduler.schedule_log_replication(self.opts.replication_interval);
        self.role = Role::Leader { timer };
        self.log.append(self.term, Command::NoOp)?;
        Ok(())
    }

    /// Sends AppendEntries to every peer without a recent request in
    /// flight. A request older than min_replication_interval is presumed
    /// lost and re-sent.
    fn do_replicate(&mut self) -> Result<()> {
        for peer in self.group.replication_targets() {
            let skip = {
                let rs = self.group.replication_state(&peer)?;
                rs.replicating
                    && rs.last_replicated_at.elapsed() < self.opts.min_replication_interval
            };
            if skip {
                debug!("node {} skipping {peer}, request in flight", self.id);
                continue;
            }
            self.send_append_entries(&peer)?;
        }
        if self.group.is_standalone() {
            self.maybe_commit()?;
        }
        Ok(())
    }

    /// Sends an AppendEntries request to the peer from its next index, or
    /// an InstallSnapshot if the required log prefix has been compacted.
    fn send_append_entries(&mut self, to: &NodeId) -> Result<()> {
        let next_index = self.group.replication_state(to)?.next_index;
        let boundary = self.log.snapshot().map(|s| s.last_index).unwrap_or(0);
        if next_index <= boundary {
            return self.send_install_snapshot(to, 0);
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = self
            .log
            .term_of(prev_log_index)?
            .ok_or_else(|| Error::Internal(format!("no term for index {prev_log_index}")))?;
        let entries = self
            .log
            .scan(next_index..)
            .take(self.opts.max_append_entries)
            .collect::<Result<Vec<_>>>()?;
        let (leader_commit, _) = self.log.get_commit_index();
        let rpc = AppendEntries {
            message_id: self.next_message_id(),
            term: self.term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };
        self.send_to(to, Message::AppendEntries(rpc))?;
        self.group.replication_state_mut(to)?.start_replicating();
        Ok(())
    }

    /// Sends an InstallSnapshot chunk at the given offset. An offset past
    /// the snapshot (e.g. after the snapshot was replaced) restarts the
    /// stream; a missing snapshot falls back to AppendEntries.
    fn send_install_snapshot(&mut self, to: &NodeId, offset: u64) -> Result<()> {
        let Some(snapshot) = self.log.snapshot() else {
            return self.send_append_entries(to);
        };
        let size = snapshot.data.len() as u64;
        let offset = if offset > size { 0 } else { offset };
        let end = std::cmp::min(offset + self.opts.snapshot_chunk_size as u64, size);
        let rpc = InstallSnapshot {
            term: self.term,
            leader_id: self.id.clone(),
            last_included_index: snapshot.last_index,
            last_included_term: snapshot.last_term,
            offset,
            data: snapshot.data[offset as usize..end as usize].to_vec(),
            done: end >= size,
        };
        debug!(
            "node {} sending snapshot chunk {offset}..{end} of {size} to {to}",
            self.id
        );
        self.send_to(to, Message::InstallSnapshot(rpc))?;
        self.group.replication_state_mut(to)?.start_replicating();
        Ok(())
    }

    /// Keeps a peer's replication going: sends more entries if it is still
    /// behind, or closes the replication window once it has caught up.
    fn continue_replication(&mut self, from: &NodeId) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        if self.group.replication_state(from)?.match_index >= last_index {
            self.group.replication_state_mut(from)?.stop_replicating();
            return Ok(());
        }
        self.send_append_entries(from)
    }

    /// Commits any entries replicated to a quorum of major members, if the
    /// quorum index carries the current term.
    fn maybe_commit(&mut self) -> Result<Index> {
        let (last_index, _) = self.log.get_last_index();
        let quorum_index = self.quorum_value(self.group.match_indexes(last_index));
        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }
        // Only entries from our own term are committed by counting
        // replicas (see figure 8 in the Raft paper).
        if self.log.term_of(quorum_index)? != Some(self.term) {
            return Ok(commit_index);
        }
        let index = self.log.commit(quorum_index)?;
        debug!("node {} committed through {index}", self.id);
        self.process_log_events()?;
        Ok(index)
    }

    /// Drives the catch-up rounds of a node being added, on a successful
    /// append result from it. A round that reaches its target within the
    /// advance timeout means the node is caught up and the AddNode entry is
    /// appended; a slower round starts over at the new last index, up to
    /// the round limit.
    fn drive_catch_up(&mut self, from: &NodeId) -> Result<()> {
        let Some(change) = &self.config_change else {
            return self.continue_replication(from);
        };
        let ChangeKind::AddNode(endpoint) = &change.kind else {
            return self.continue_replication(from);
        };
        if endpoint.id != *from {
            return self.continue_replication(from);
        }
        let ChangePhase::CatchingUp { mut target, mut started } = change.phase else {
            return self.continue_replication(from);
        };
        let endpoint = endpoint.clone();

        let (last_index, _) = self.log.get_last_index();
        let (match_index, mut round) = {
            let rs = self.group.replication_state(from)?;
            (rs.match_index, rs.round)
        };

        enum Outcome {
            Behind,
            CaughtUp,
            TimedOut,
        }
        let outcome = loop {
            if match_index < target {
                break Outcome::Behind;
            }
            if started.elapsed() <= self.opts.new_node_advance_timeout {
                break Outcome::CaughtUp;
            }
            // The round was too slow and the log may have grown meanwhile;
            // start another at the new last index.
            round += 1;
            if round > self.opts.new_node_max_round {
                break Outcome::TimedOut;
            }
            target = last_index;
            started = Instant::now();
        };

        match outcome {
            Outcome::Behind => {
                self.group.replication_state_mut(from)?.round = round;
                if let Some(change) = &mut self.config_change {
                    change.phase = ChangePhase::CatchingUp { target, started };
                }
                self.continue_replication(from)
            }
            Outcome::CaughtUp => {
                info!("node {from} caught up after {round} round(s)");
                let prev_members = self.group.endpoints_of_major();
                let index = self.log.append(
                    self.term,
                    Command::Config(ConfigChange::AddNode { endpoint, prev_members }),
                )?;
                if let Some(change) = &mut self.config_change {
                    change.phase = ChangePhase::AwaitingCommit { index };
                }
                self.send_append_entries(from)?;
                self.do_replicate()
            }
            Outcome::TimedOut => {
                warn!(
                    "node {from} failed to catch up within {} rounds",
                    self.opts.new_node_max_round
                );
                if let Some(change) = self.config_change.take() {
                    change.task.complete(TaskResult::Timeout);
                }
                self.group.remove(from);
                Ok(())
            }
        }
    }

    /// Awaits a previously submitted config change, up to the configured
    /// timeout. Returns a pre-resolved Timeout reference if the previous
    /// change is still active when the deadline expires.
    fn await_previous_change(&mut self) -> Option<TaskReference> {
        let change = self.config_change.as_ref()?;
        if !change.task.is_done() {
            change.task.get_result(self.opts.previous_group_config_change_timeout);
        }
        if let Some(change) = &self.config_change {
            if !change.task.is_done() {
                warn!("node {} still has a group config change in flight", self.id);
                return Some(TaskReference::completed(TaskResult::Timeout));
            }
        }
        self.config_change = None;
        None
    }
}
