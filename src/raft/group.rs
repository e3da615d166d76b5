use super::Index;
use crate::error::{Error, Result};

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// A node identifier: an opaque short string, compared by value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node's network address. The id must be globally unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(id: impl Into<NodeId>, host: impl Into<String>, port: u16) -> Self {
        Self { id: id.into(), host: host.into(), port }
    }
}

impl std::fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Leader-side replication progress for a single peer.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicatingState {
    /// The next index to replicate to the peer.
    pub next_index: Index,
    /// The last index known to match the leader's log. Monotone within a
    /// leader term.
    pub match_index: Index,
    /// Whether a replication request is in flight.
    pub replicating: bool,
    /// When the last replication request was sent.
    pub last_replicated_at: Instant,
    /// Catch-up round counter for newly added nodes.
    pub round: u32,
}

impl ReplicatingState {
    pub fn new(next_index: Index) -> Self {
        assert_ne!(next_index, 0, "next_index can't be 0");
        Self {
            next_index,
            match_index: 0,
            replicating: false,
            last_replicated_at: Instant::now(),
            round: 0,
        }
    }

    /// Marks a replication request as in flight, sent now.
    pub fn start_replicating(&mut self) {
        self.start_replicating_at(Instant::now())
    }

    /// Marks a replication request as in flight, sent at the given time.
    pub fn start_replicating_at(&mut self, at: Instant) {
        self.replicating = true;
        self.last_replicated_at = at;
    }

    pub fn stop_replicating(&mut self) {
        self.replicating = false;
    }

    /// Attempts to advance the peer's match index, returning true if it did.
    /// next_index follows, but never regresses.
    pub fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Backs off next_index by one after a rejected append, returning false
    /// if it can't back off further.
    pub fn back_off(&mut self) -> bool {
        if self.next_index <= 1 {
            return false;
        }
        self.next_index -= 1;
        true
    }
}

/// A group member's state.
#[derive(Clone, Debug)]
pub struct NodeState {
    /// The member's network address.
    pub endpoint: NodeEndpoint,
    /// Whether the member is a voting member, counted for quorum. Non-major
    /// members are catching up after an add.
    pub major: bool,
    /// Whether the member is being removed; a RemoveNode entry for it has
    /// been appended but not yet committed.
    pub removing: bool,
    /// The member's replication progress. Only meaningful on the leader, and
    /// reset on every leader promotion.
    pub replication: ReplicatingState,
}

/// The cluster membership as known to the local node: major (voting) members
/// plus any non-major members that are catching up or being removed. The
/// local node is always present until its own removal commits.
pub struct NodeGroup {
    self_id: NodeId,
    members: HashMap<NodeId, NodeState>,
}

impl NodeGroup {
    /// Creates a group from the given initial members, all major.
    pub fn new(self_id: NodeId, endpoints: Vec<NodeEndpoint>) -> Self {
        let members = endpoints
            .into_iter()
            .map(|endpoint| {
                let id = endpoint.id.clone();
                let state = NodeState {
                    endpoint,
                    major: true,
                    removing: false,
                    replication: ReplicatingState::new(1),
                };
                (id, state)
            })
            .collect();
        Self { self_id, members }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Returns a member's state, if known.
    pub fn get(&self, id: &NodeId) -> Option<&NodeState> {
        self.members.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut NodeState> {
        self.members.get_mut(id)
    }

    /// Returns a member's replication state, or an error if unknown.
    pub fn replication_state(&self, id: &NodeId) -> Result<&ReplicatingState> {
        self.members
            .get(id)
            .map(|m| &m.replication)
            .ok_or_else(|| Error::Internal(format!("unknown node {id}")))
    }

    pub fn replication_state_mut(&mut self, id: &NodeId) -> Result<&mut ReplicatingState> {
        self.members
            .get_mut(id)
            .map(|m| &mut m.replication)
            .ok_or_else(|| Error::Internal(format!("unknown node {id}")))
    }

    /// Adds a member with the given replication start point. Replaces any
    /// existing member with the same id.
    pub fn add(&mut self, endpoint: NodeEndpoint, next_index: Index, major: bool) {
        let id = endpoint.id.clone();
        let state = NodeState {
            endpoint,
            major,
            removing: false,
            replication: ReplicatingState::new(next_index),
        };
        self.members.insert(id, state);
    }

    /// Removes a member. Does nothing if unknown.
    pub fn remove(&mut self, id: &NodeId) {
        self.members.remove(id);
    }

    /// Promotes a member to major, e.g. when its AddNode entry commits.
    pub fn upgrade(&mut self, id: &NodeId) {
        if let Some(member) = self.members.get_mut(id) {
            member.major = true;
            member.removing = false;
        }
    }

    /// Demotes a member to non-major.
    pub fn downgrade(&mut self, id: &NodeId) {
        if let Some(member) = self.members.get_mut(id) {
            member.major = false;
        }
    }

    /// Marks a member as being removed.
    pub fn set_removing(&mut self, id: &NodeId) {
        if let Some(member) = self.members.get_mut(id) {
            member.removing = true;
        }
    }

    /// The number of major members.
    pub fn count_of_major(&self) -> usize {
        self.members.values().filter(|m| m.major).count()
    }

    /// Whether the given node is a known major member.
    pub fn is_major(&self, id: &NodeId) -> bool {
        self.members.get(id).map(|m| m.major).unwrap_or(false)
    }

    /// Whether the local node is the only major member.
    pub fn is_standalone(&self) -> bool {
        self.count_of_major() == 1 && self.is_major(&self.self_id)
    }

    /// All members except the local node, in sorted order for determinism.
    pub fn replication_targets(&self) -> Vec<NodeId> {
        self.members.keys().filter(|id| **id != self.self_id).sorted().cloned().collect()
    }

    /// Major members except the local node, in sorted order.
    pub fn major_peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|(id, m)| m.major && **id != self.self_id)
            .map(|(id, _)| id)
            .sorted()
            .cloned()
            .collect()
    }

    /// The endpoints of all major members, sorted by id. Recorded in group
    /// config entries as the pre-change membership.
    pub fn endpoints_of_major(&self) -> Vec<NodeEndpoint> {
        self.members
            .values()
            .filter(|m| m.major)
            .map(|m| m.endpoint.clone())
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }

    /// The match indexes of all major members, substituting the given index
    /// for the local node. Input to the commit quorum computation.
    pub fn match_indexes(&self, self_last_index: Index) -> Vec<Index> {
        self.members
            .iter()
            .filter(|(_, m)| m.major)
            .map(|(id, m)| {
                if *id == self.self_id {
                    self_last_index
                } else {
                    m.replication.match_index
                }
            })
            .collect()
    }

    /// Resets all members' replication state to the given next index, on
    /// leader promotion.
    pub fn reset_replication_states(&mut self, next_index: Index) {
        for member in self.members.values_mut() {
            member.replication = ReplicatingState::new(next_index);
        }
    }

    /// Replaces the membership with exactly the given major members, e.g.
    /// when reverting a truncated group config entry. Known members keep
    /// their replication state.
    pub fn apply_members(&mut self, endpoints: &[NodeEndpoint]) {
        let keep: std::collections::HashSet<&NodeId> = endpoints.iter().map(|e| &e.id).collect();
        self.members.retain(|id, _| keep.contains(id));
        for endpoint in endpoints {
            match self.members.get_mut(&endpoint.id) {
                Some(member) => {
                    member.major = true;
                    member.removing = false;
                }
                None => self.add(endpoint.clone(), 1, true),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> NodeGroup {
        NodeGroup::new(
            NodeId::from("a"),
            vec![
                NodeEndpoint::new("a", "localhost", 2331),
                NodeEndpoint::new("b", "localhost", 2332),
                NodeEndpoint::new("c", "localhost", 2333),
            ],
        )
    }

    #[test]
    fn membership() {
        let mut group = group();
        assert_eq!(group.count_of_major(), 3);
        assert!(group.is_major(&NodeId::from("b")));
        assert!(!group.is_standalone());
        assert_eq!(
            group.replication_targets(),
            vec![NodeId::from("b"), NodeId::from("c")]
        );

        group.add(NodeEndpoint::new("d", "localhost", 2334), 4, false);
        assert_eq!(group.count_of_major(), 3);
        assert!(!group.is_major(&NodeId::from("d")));
        assert_eq!(group.replication_state(&NodeId::from("d")).unwrap().next_index, 4);

        group.upgrade(&NodeId::from("d"));
        assert_eq!(group.count_of_major(), 4);

        group.remove(&NodeId::from("d"));
        assert!(group.get(&NodeId::from("d")).is_none());
        assert_eq!(group.count_of_major(), 3);
    }

    #[test]
    fn match_indexes_substitutes_self() {
        let mut group = group();
        group.replication_state_mut(&NodeId::from("b")).unwrap().advance(2);
        let mut indexes = group.match_indexes(7);
        indexes.sort();
        assert_eq!(indexes, vec![0, 2, 7]);
    }

    #[test]
    fn replicating_state_advance_and_back_off() {
        let mut state = ReplicatingState::new(3);
        assert!(state.advance(2));
        assert_eq!((state.match_index, state.next_index), (2, 3));
        // Stale acknowledgements don't regress anything.
        assert!(!state.advance(1));
        assert_eq!((state.match_index, state.next_index), (2, 3));
        assert!(state.advance(5));
        assert_eq!((state.match_index, state.next_index), (5, 6));

        let mut state = ReplicatingState::new(2);
        assert!(state.back_off());
        assert_eq!(state.next_index, 1);
        assert!(!state.back_off());
        assert_eq!(state.next_index, 1);
    }

    #[test]
    fn apply_members_reverts() {
        let mut group = group();
        group.add(NodeEndpoint::new("d", "localhost", 2334), 4, false);
        group.set_removing(&NodeId::from("c"));

        let previous = vec![
            NodeEndpoint::new("a", "localhost", 2331),
            NodeEndpoint::new("b", "localhost", 2332),
            NodeEndpoint::new("c", "localhost", 2333),
        ];
        group.apply_members(&previous);

        assert_eq!(group.count_of_major(), 3);
        assert!(group.get(&NodeId::from("d")).is_none());
        assert!(!group.get(&NodeId::from("c")).unwrap().removing);
    }
}
