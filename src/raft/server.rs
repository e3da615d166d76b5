use super::membership::{TaskReference, TaskResult};
use super::message::{
    AppendEntries, AppendEntriesResultMessage, Connector, Envelope, InstallSnapshot,
    InstallSnapshotResultMessage, Message, MessageId,
};
use super::scheduler::{ThreadScheduler, TimerEvent};
use super::{Index, Log, NodeEndpoint, NodeId, NodeStore, Options, RawNode, RoleState};
use crate::error::{Error, Result};

use ::log::{debug, error};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A task submitted to the node's main serial executor.
enum Task {
    Start { reply: Sender<Result<()>> },
    Stop { reply: Sender<()> },
    Deliver(Envelope),
    Append { payload: Vec<u8>, reply: Sender<Result<Index>> },
    AddNode { endpoint: NodeEndpoint, reply: Sender<Result<TaskReference>> },
    RemoveNode { id: NodeId, reply: Sender<Result<TaskReference>> },
    CancelConfigChange { reply: Sender<Result<()>> },
    ActiveConfigTask { reply: Sender<Option<TaskReference>> },
    RoleState { reply: Sender<RoleState> },
}

/// A call submitted to the membership executor. Membership changes wait for
/// the previous change there, so the wait never blocks the main loop.
enum MembershipCall {
    Add { endpoint: NodeEndpoint, reply: Sender<Result<TaskReference>> },
    Remove { id: NodeId, reply: Sender<Result<TaskReference>> },
}

/// The last request sent to each peer, so inbound results can be paired with
/// the request they acknowledge. Written by the connector wrapper on the
/// core's thread, read when delivering results on the same thread.
#[derive(Clone, Default)]
struct SentRequests {
    appends: Arc<Mutex<HashMap<NodeId, AppendEntries>>>,
    snapshots: Arc<Mutex<HashMap<NodeId, InstallSnapshot>>>,
}

impl SentRequests {
    fn record(&self, to: &NodeId, message: &Message) {
        match message {
            Message::AppendEntries(rpc) => {
                self.appends.lock().expect("sent lock poisoned").insert(to.clone(), rpc.clone());
            }
            Message::InstallSnapshot(rpc) => {
                self.snapshots.lock().expect("sent lock poisoned").insert(to.clone(), rpc.clone());
            }
            _ => {}
        }
    }

    /// Takes the append request the peer is responding to, if the message id
    /// matches the last one sent to it.
    fn take_append(&self, from: &NodeId, message_id: MessageId) -> Option<AppendEntries> {
        let mut appends = self.appends.lock().expect("sent lock poisoned");
        if appends.get(from).map(|rpc| rpc.message_id) != Some(message_id) {
            return None;
        }
        appends.remove(from)
    }

    fn take_snapshot(&self, from: &NodeId) -> Option<InstallSnapshot> {
        self.snapshots.lock().expect("sent lock poisoned").remove(from)
    }
}

/// A connector wrapper recording sent requests for result pairing.
struct RecordingConnector {
    inner: Box<dyn Connector>,
    sent: SentRequests,
}

impl Connector for RecordingConnector {
    fn send(&self, to: &NodeId, message: Message) -> Result<()> {
        self.sent.record(to, &message);
        self.inner.send(to, message)
    }
}

/// A Raft node with a thread-safe public API.
///
/// All state lives in a [`RawNode`] owned by a single serial executor
/// thread; every public method submits a task to it and the executor
/// processes tasks, timer events, and inbound messages one at a time, in
/// submission order. A second serial executor runs membership calls so that
/// waiting for a previous config change blocks the caller, not the main
/// loop. Inbound messages are handed in via [`Node::deliver`]; outbound
/// messages leave through the connector passed at construction.
pub struct Node {
    task_tx: Option<Sender<Task>>,
    membership_tx: Option<Sender<MembershipCall>>,
    main: Option<std::thread::JoinHandle<()>>,
    membership: Option<std::thread::JoinHandle<()>>,
}

impl Node {
    /// Creates the node and spawns its executors. The node remains inert
    /// until start() is called.
    pub fn new(
        id: NodeId,
        members: Vec<NodeEndpoint>,
        log: Log,
        store: Box<dyn NodeStore>,
        connector: Box<dyn Connector>,
        opts: Options,
    ) -> Self {
        let (task_tx, task_rx) = unbounded::<Task>();
        let (timer_tx, timer_rx) = unbounded::<TimerEvent>();
        let (membership_tx, membership_rx) = unbounded::<MembershipCall>();

        let sent = SentRequests::default();
        let connector = Box::new(RecordingConnector { inner: connector, sent: sent.clone() });
        let scheduler = Box::new(ThreadScheduler::new(timer_tx));
        let previous_timeout = opts.previous_group_config_change_timeout;
        let node = RawNode::new(id, members, log, store, connector, scheduler, opts);

        let main = std::thread::spawn(move || Self::eventloop(node, task_rx, timer_rx, sent));
        let membership_task_tx = task_tx.clone();
        let membership = std::thread::spawn(move || {
            Self::membership_loop(membership_rx, membership_task_tx, previous_timeout)
        });

        Self {
            task_tx: Some(task_tx),
            membership_tx: Some(membership_tx),
            main: Some(main),
            membership: Some(membership),
        }
    }

    /// Starts the node. Idempotent.
    pub fn start(&self) -> Result<()> {
        self.request(|reply| Task::Start { reply })?
    }

    /// Stops the node and its executors. Idempotent.
    pub fn stop(&self) -> Result<()> {
        // The executor acknowledges and then exits; a disconnected channel
        // means it is already gone.
        let _ = self.request(|reply| Task::Stop { reply });
        Ok(())
    }

    /// Appends a client payload, returning its log index. Leader only.
    pub fn append_log(&self, payload: Vec<u8>) -> Result<Index> {
        self.request(|reply| Task::Append { payload, reply })?
    }

    /// Begins adding a node to the group. Waits for any previously submitted
    /// change (on the membership executor) before submitting this one.
    pub fn add_node(&self, endpoint: NodeEndpoint) -> Result<TaskReference> {
        let (reply, rx) = bounded(1);
        self.membership_tx
            .as_ref()
            .expect("node dropped")
            .send(MembershipCall::Add { endpoint, reply })
            .map_err(|_| Error::NotReady)?;
        rx.recv().map_err(|_| Error::NotReady)?
    }

    /// Begins removing a node from the group, like add_node.
    pub fn remove_node(&self, id: NodeId) -> Result<TaskReference> {
        let (reply, rx) = bounded(1);
        self.membership_tx
            .as_ref()
            .expect("node dropped")
            .send(MembershipCall::Remove { id, reply })
            .map_err(|_| Error::NotReady)?;
        rx.recv().map_err(|_| Error::NotReady)?
    }

    /// Cancels the in-flight group config change, if any.
    pub fn cancel_group_config_change(&self) -> Result<()> {
        self.request(|reply| Task::CancelConfigChange { reply })?
    }

    /// Returns a snapshot of the node's role state.
    pub fn role_state(&self) -> Result<RoleState> {
        self.request(|reply| Task::RoleState { reply })
    }

    /// Delivers an inbound message from the transport.
    pub fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.task_tx
            .as_ref()
            .expect("node dropped")
            .send(Task::Deliver(envelope))
            .map_err(|_| Error::NotReady)
    }

    /// Submits a task to the main executor and awaits its reply.
    fn request<T>(&self, task: impl FnOnce(Sender<T>) -> Task) -> Result<T> {
        let (reply, rx) = bounded(1);
        self.task_tx
            .as_ref()
            .expect("node dropped")
            .send(task(reply))
            .map_err(|_| Error::NotReady)?;
        rx.recv().map_err(|_| Error::NotReady)
    }

    /// The main serial executor: owns the RawNode and processes tasks and
    /// timer events one at a time. Exits on stop, when all senders are
    /// gone, or on a fatal error (e.g. store IO failure).
    fn eventloop(
        mut node: RawNode,
        task_rx: Receiver<Task>,
        timer_rx: Receiver<TimerEvent>,
        sent: SentRequests,
    ) {
        loop {
            let result = crossbeam::channel::select! {
                recv(task_rx) -> task => {
                    let Ok(task) = task else { return };
                    match task {
                        Task::Start { reply } => {
                            let _ = reply.send(node.start());
                            Ok(())
                        }
                        Task::Stop { reply } => {
                            let _ = node.stop();
                            let _ = reply.send(());
                            return;
                        }
                        Task::Deliver(envelope) => Self::deliver_to(&mut node, envelope, &sent),
                        Task::Append { payload, reply } => {
                            let _ = reply.send(node.append_log(payload));
                            Ok(())
                        }
                        Task::AddNode { endpoint, reply } => {
                            let _ = reply.send(node.add_node(endpoint));
                            Ok(())
                        }
                        Task::RemoveNode { id, reply } => {
                            let _ = reply.send(node.remove_node(&id));
                            Ok(())
                        }
                        Task::CancelConfigChange { reply } => {
                            let _ = reply.send(node.cancel_group_config_change());
                            Ok(())
                        }
                        Task::ActiveConfigTask { reply } => {
                            let _ = reply.send(node.group_config_change_task());
                            Ok(())
                        }
                        Task::RoleState { reply } => {
                            let _ = reply.send(node.role_state());
                            Ok(())
                        }
                    }
                }
                recv(timer_rx) -> event => match event {
                    Ok(TimerEvent::ElectionTimeout) => node.election_timeout(),
                    Ok(TimerEvent::ReplicateLog) => node.replicate_log(),
                    Err(_) => return,
                }
            };
            if let Err(err) = result {
                match err {
                    Error::NotReady | Error::NotLeader(_) | Error::InvalidInput(_) => {
                        debug!("ignoring event: {err}")
                    }
                    err => {
                        // Can't safely continue, e.g. the store failed.
                        error!("node failed: {err}");
                        return;
                    }
                }
            }
        }
    }

    /// Dispatches an inbound message to the core, pairing results with the
    /// requests they acknowledge. Unmatched results are dropped; the leader
    /// re-sends on the next replication tick.
    fn deliver_to(node: &mut RawNode, envelope: Envelope, sent: &SentRequests) -> Result<()> {
        let from = envelope.from;
        match envelope.message {
            Message::RequestVote(rpc) => node.on_request_vote(&from, rpc),
            Message::RequestVoteResult(result) => node.on_request_vote_result(result),
            Message::AppendEntries(rpc) => node.on_append_entries(&from, rpc),
            Message::AppendEntriesResult(result) => {
                let Some(rpc) = sent.take_append(&from, result.message_id) else {
                    debug!("dropping unmatched append result from {from}");
                    return Ok(());
                };
                node.on_append_entries_result(AppendEntriesResultMessage { from, result, rpc })
            }
            Message::InstallSnapshot(rpc) => node.on_install_snapshot(&from, rpc),
            Message::InstallSnapshotResult(result) => {
                let Some(rpc) = sent.take_snapshot(&from) else {
                    debug!("dropping unmatched snapshot result from {from}");
                    return Ok(());
                };
                node.on_install_snapshot_result(InstallSnapshotResultMessage { from, result, rpc })
            }
        }
    }

    /// The membership executor: serializes add/remove calls, waiting out any
    /// previously submitted change before handing the next one to the main
    /// executor.
    fn membership_loop(
        calls: Receiver<MembershipCall>,
        task_tx: Sender<Task>,
        previous_timeout: Duration,
    ) {
        for call in calls {
            let (endpoint, id, reply) = match call {
                MembershipCall::Add { endpoint, reply } => (Some(endpoint), None, reply),
                MembershipCall::Remove { id, reply } => (None, Some(id), reply),
            };
            if Self::previous_change_active(&task_tx, previous_timeout) {
                let _ = reply.send(Ok(TaskReference::completed(TaskResult::Timeout)));
                continue;
            }
            let (tx, rx) = bounded(1);
            let task = match (endpoint, id) {
                (Some(endpoint), None) => Task::AddNode { endpoint, reply: tx },
                (None, Some(id)) => Task::RemoveNode { id, reply: tx },
                _ => unreachable!("invalid membership call"),
            };
            if task_tx.send(task).is_err() {
                let _ = reply.send(Err(Error::NotReady));
                continue;
            }
            let _ = reply.send(rx.recv().unwrap_or(Err(Error::NotReady)));
        }
    }

    /// Waits out an active config change, returning true if it is still
    /// active when the deadline expires.
    fn previous_change_active(task_tx: &Sender<Task>, timeout: Duration) -> bool {
        let (tx, rx) = bounded(1);
        if task_tx.send(Task::ActiveConfigTask { reply: tx }).is_err() {
            return false;
        }
        match rx.recv() {
            Ok(Some(task)) => {
                task.get_result(timeout);
                !task.is_done()
            }
            _ => false,
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.stop();
        // Disconnect the executors and wait for them to wind down.
        self.membership_tx.take();
        self.task_tx.take();
        if let Some(membership) = self.membership.take() {
            let _ = membership.join();
        }
        if let Some(main) = self.main.take() {
            let _ = main.join();
        }
    }
}
