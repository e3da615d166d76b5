use super::{Index, NodeEndpoint, NodeId};

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The outcome of a group config change task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TaskResult {
    /// The config entry committed and the membership change took effect.
    Ok,
    /// The task did not complete in time: a previous change was still in
    /// flight, or an added node did not catch up within its allowed rounds.
    /// Also returned by [`TaskReference::get_result`] when its own wait
    /// deadline expires.
    Timeout,
    /// Replicating the membership change failed.
    ReplicationFailed,
    /// The task failed, e.g. its config entry was truncated by a conflict.
    Error,
    /// The task was cancelled via cancel_group_config_change.
    Cancelled,
}

/// A handle to an in-flight group config change, returned to the caller of
/// add_node/remove_node. The result is produced by events reaching the main
/// executor (commit, failure, cancellation); waiters block on a condvar with
/// a deadline rather than polling.
#[derive(Clone, Debug)]
pub struct TaskReference {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    result: Mutex<Option<TaskResult>>,
    done: Condvar,
}

impl TaskReference {
    /// Creates an unresolved task reference.
    pub fn new() -> Self {
        Self { shared: Arc::new(Shared { result: Mutex::new(None), done: Condvar::new() }) }
    }

    /// Creates a task reference that is already resolved, e.g. when a prior
    /// change is still in flight and the await deadline expired.
    pub fn completed(result: TaskResult) -> Self {
        let reference = Self::new();
        reference.complete(result);
        reference
    }

    /// Resolves the task. The first result wins; later completions are
    /// ignored and return false.
    pub fn complete(&self, result: TaskResult) -> bool {
        let mut slot = self.shared.result.lock().expect("task lock poisoned");
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.shared.done.notify_all();
        true
    }

    /// Whether the task has resolved.
    pub fn is_done(&self) -> bool {
        self.shared.result.lock().expect("task lock poisoned").is_some()
    }

    /// Waits for the task to resolve, up to the given timeout. Returns
    /// TaskResult::Timeout if the deadline expires first; the task itself
    /// keeps running and can be waited on again.
    pub fn get_result(&self, timeout: Duration) -> TaskResult {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.result.lock().expect("task lock poisoned");
        loop {
            if let Some(result) = *slot {
                return result;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return TaskResult::Timeout;
            };
            let (guard, wait) =
                self.shared.done.wait_timeout(slot, remaining).expect("task lock poisoned");
            slot = guard;
            if wait.timed_out() && slot.is_none() {
                return TaskResult::Timeout;
            }
        }
    }
}

impl Default for TaskReference {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of membership change in flight.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeKind {
    AddNode(NodeEndpoint),
    RemoveNode(NodeId),
}

/// The phase of the in-flight change.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChangePhase {
    /// An added node is replicating in rounds towards the target index.
    CatchingUp { target: Index, started: Instant },
    /// The group config entry is appended and awaiting commit.
    AwaitingCommit { index: Index },
}

/// The at-most-one in-flight group config change. Held by the node core and
/// mutated only on the main executor.
pub struct GroupConfigChange {
    pub kind: ChangeKind,
    pub phase: ChangePhase,
    pub task: TaskReference,
}
