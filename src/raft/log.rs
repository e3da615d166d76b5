use super::{NodeEndpoint, NodeId, Term};
use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::storage;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A state machine command carried by a log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// A no-op, appended when a leader is elected. Committing it commits all
    /// earlier-term entries, see section 5.4.2 in the Raft paper.
    NoOp,
    /// An opaque client payload applied to the state machine.
    Write(Vec<u8>),
    /// A group membership change.
    Config(ConfigChange),
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::NoOp => write!(f, "noop"),
            Command::Write(payload) => write!(f, "write 0x{}", hex::encode(payload)),
            Command::Config(ConfigChange::AddNode { endpoint, .. }) => {
                write!(f, "add {endpoint}")
            }
            Command::Config(ConfigChange::RemoveNode { id, .. }) => write!(f, "remove {id}"),
        }
    }
}

/// A single-node membership change. Carries the pre-change major member set,
/// which is what the group reverts to if the entry is truncated by a log
/// conflict before committing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddNode { endpoint: NodeEndpoint, prev_members: Vec<NodeEndpoint> },
    RemoveNode { id: NodeId, prev_members: Vec<NodeEndpoint> },
}

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The command.
    pub command: Command,
}

impl encoding::Value for Entry {}

/// A group config entry's coordinates and change, as carried by log events.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupConfigEntry {
    pub index: Index,
    pub term: Term,
    pub change: ConfigChange,
}

/// Events published by the log and consumed by the node on the main
/// executor. The commit index is always advanced before the corresponding
/// committed event is published.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEvent {
    /// A group config entry arrived from the leader (via splice). Followers
    /// apply the membership optimistically.
    GroupConfigAppended(GroupConfigEntry),
    /// A group config entry committed.
    GroupConfigCommitted(GroupConfigEntry),
    /// An uncommitted group config entry was truncated by a log conflict.
    /// The membership reverts to the entry's pre-change member set.
    GroupConfigRemoved(GroupConfigEntry),
}

/// A snapshot of the state machine up through a log index. The log below the
/// snapshot boundary is pruned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The last log index the snapshot covers.
    pub last_index: Index,
    /// The term of the entry at last_index.
    pub last_term: Term,
    /// The serialized state machine data.
    pub data: Vec<u8>,
}

impl encoding::Value for Snapshot {}

/// A log storage key. Entries are keyed by big-endian index so that engine
/// scans return them in index order.
#[derive(Debug, PartialEq)]
enum Key {
    Entry(Index),
    CommitIndex,
    Snapshot,
}

impl Key {
    const ENTRY: u8 = 0x00;
    const COMMIT_INDEX: u8 = 0x01;
    const SNAPSHOT: u8 = 0x02;

    fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => {
                let mut key = vec![Self::ENTRY];
                key.extend(index.to_be_bytes());
                key
            }
            Key::CommitIndex => vec![Self::COMMIT_INDEX],
            Key::Snapshot => vec![Self::SNAPSHOT],
        }
    }
}

/// The replicated command log. Stores a contiguous sequence of entries,
/// possibly preceded by a snapshot, in a key/value storage engine.
///
/// In the steady state the log is append-only: the leader appends a command
/// via append() and replicates it to followers who append it via splice().
/// Once an index is replicated to a quorum of major members it is committed,
/// making the log immutable up to that index. Uncommitted entries can still
/// be replaced: if a different leader is elected and replicates different
/// entries for the same indexes, splice() truncates the conflicting suffix.
///
/// Invariants:
///
/// * Entry indexes are contiguous starting at the snapshot boundary + 1.
/// * Entry terms never decrease from the previous entry.
/// * Appended and spliced entries are durable (flushed) before returning.
/// * Committed entries are never changed or removed.
/// * The commit index is not flushed; it is recoverable from a log quorum.
pub struct Log {
    /// The underlying storage engine. A trait object avoids propagating the
    /// engine type parameter throughout the consensus core.
    engine: Box<dyn storage::Engine>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The current snapshot, if any. Kept resident so the leader can stream
    /// chunks without re-reading the engine.
    snapshot: Option<Snapshot>,
    /// A snapshot being received chunk by chunk, before installation.
    staging: Option<Snapshot>,
    /// Group config entries above the commit index, in index order. There is
    /// at most one in correct operation, but conflicts can briefly leave
    /// several before truncation reverts them.
    uncommitted_configs: VecDeque<GroupConfigEntry>,
    /// Pending events, drained by the node after every operation.
    events: VecDeque<LogEvent>,
}

impl Log {
    /// Initializes a log using the given storage engine.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        let snapshot = engine
            .get(&Key::Snapshot.encode())?
            .map(|v| Snapshot::decode(&v))
            .transpose()?;
        let boundary =
            snapshot.as_ref().map(|s| (s.last_index, s.last_term)).unwrap_or((0, 0));
        let (last_index, last_term) = engine
            .scan((
                std::ops::Bound::Included(Key::Entry(0).encode()),
                std::ops::Bound::Included(Key::Entry(Index::MAX).encode()),
            ))
            .last()
            .transpose()?
            .map(|(_, v)| Entry::decode(&v))
            .transpose()?
            .map(|e| (e.index, e.term))
            .unwrap_or(boundary);
        let (mut commit_index, mut commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| encoding::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        if commit_index < boundary.0 {
            (commit_index, commit_term) = boundary;
        }

        let mut log = Self {
            engine,
            last_index,
            last_term,
            commit_index,
            commit_term,
            snapshot,
            staging: None,
            uncommitted_configs: VecDeque::new(),
            events: VecDeque::new(),
        };

        // Rebuild the uncommitted config entry index.
        let configs = log
            .scan(log.commit_index + 1..)
            .filter_map(|r| match r {
                Ok(Entry { index, term, command: Command::Config(change) }) => {
                    Some(Ok(GroupConfigEntry { index, term, change }))
                }
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
            .collect::<Result<VecDeque<_>>>()?;
        log.uncommitted_configs = configs;
        Ok(log)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// The first index present as an entry (just past the snapshot).
    pub fn first_index(&self) -> Index {
        self.snapshot.as_ref().map(|s| s.last_index + 1).unwrap_or(1)
    }

    /// Returns the current snapshot, if any.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Whether a group config entry is waiting to commit.
    pub fn has_uncommitted_config(&self) -> bool {
        !self.uncommitted_configs.is_empty()
    }

    /// Drains and returns pending log events.
    pub fn take_events(&mut self) -> Vec<LogEvent> {
        self.events.drain(..).collect()
    }

    /// Appends a command to the log at the given term and flushes it to
    /// disk, returning its index. Used on the leader; followers splice().
    pub fn append(&mut self, term: Term, command: Command) -> Result<Index> {
        assert!(term > 0, "can't append entry in term 0");
        assert!(term >= self.last_term, "term regression {} → {}", self.last_term, term);
        let entry = Entry { index: self.last_index + 1, term, command };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode()?)?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        if let Command::Config(change) = entry.command {
            self.uncommitted_configs.push_back(GroupConfigEntry {
                index: entry.index,
                term: entry.term,
                change,
            });
        }
        Ok(self.last_index)
    }

    /// Fetches an entry at an index, or None if it does not exist (including
    /// indexes at or below the snapshot boundary).
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        if index < self.first_index() {
            return Ok(None);
        }
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Returns the term of the entry at the given index, if known. Index 0
    /// has term 0; the snapshot boundary has the snapshot's term; indexes
    /// below the boundary are unknown (None), as are indexes past the end.
    pub fn term_of(&mut self, index: Index) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.last_index {
                return Ok(Some(snapshot.last_term));
            }
            if index < snapshot.last_index {
                return Ok(None);
            }
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Checks whether the log matches the given index and term: index 0
    /// always matches, indexes at or below the snapshot boundary are
    /// committed and considered matching, and stored entries match on term.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index == 0 {
            return Ok(true);
        }
        if let Some(snapshot) = &self.snapshot {
            if index < snapshot.last_index {
                return Ok(true);
            }
            if index == snapshot.last_index {
                return Ok(snapshot.last_term == term);
            }
        }
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        Iterator::new(self.engine.scan((from, to)))
    }

    /// Splices a set of entries into the log and flushes it to disk. The
    /// entries must have contiguous indexes and non-decreasing terms, and
    /// the first entry must be in the range [1, last_index+1]. Entries
    /// already present with the same term are ignored; entries covered by
    /// the snapshot are ignored. A term conflict truncates the existing
    /// suffix from the first conflicting index, reverting any uncommitted
    /// config entries it contained, before the new entries are written.
    pub fn splice(&mut self, mut entries: Vec<Entry>) -> Result<Index> {
        let Some(first) = entries.first() else {
            return Ok(self.last_index); // empty input is a noop
        };

        assert!(first.index > 0 && first.term > 0, "spliced entry has index or term 0");
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "spliced entries are not contiguous"
        );
        assert!(
            entries.windows(2).all(|w| w[0].term <= w[1].term),
            "spliced entries have term regression"
        );
        assert!(
            first.index <= self.last_index + 1,
            "first index {} must touch existing log",
            first.index
        );

        // Skip entries already covered by the snapshot, and entries already
        // in the log with the same term (which must be identical).
        let boundary = self.snapshot.as_ref().map(|s| s.last_index).unwrap_or(0);
        let mut skip = 0;
        for entry in &entries {
            if entry.index <= boundary {
                skip += 1;
                continue;
            }
            match self.get(entry.index)? {
                Some(existing) if existing.term == entry.term => {
                    assert!(existing == *entry, "entry mismatch at {}", entry.index);
                    skip += 1;
                }
                _ => break,
            }
        }
        entries.drain(..skip);

        // If all entries already exist then we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };
        assert!(first.index > self.commit_index, "spliced entries below commit index");

        // Any existing entries from the first written index onwards are
        // being replaced or truncated. Revert uncommitted config entries
        // among them, newest first.
        let first_index = first.index;
        while let Some(config) = self.uncommitted_configs.back() {
            if config.index < first_index {
                break;
            }
            let config = self.uncommitted_configs.pop_back().expect("config entry vanished");
            self.events.push_back(LogEvent::GroupConfigRemoved(config));
        }

        // Write the new entries and remove the tail of the old log, if any.
        for entry in &entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode()?)?;
        }
        let last = entries.last().expect("no spliced entries");
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        self.last_index = last.index;
        self.last_term = last.term;

        // Register and announce new config entries.
        for entry in entries {
            if let Command::Config(change) = entry.command {
                let config =
                    GroupConfigEntry { index: entry.index, term: entry.term, change };
                self.uncommitted_configs.push_back(config.clone());
                self.events.push_back(LogEvent::GroupConfigAppended(config));
            }
        }
        Ok(self.last_index)
    }

    /// Commits entries up to and including the given index, which must
    /// exist. The commit index is advanced before committed config events
    /// are published. Commits at or below the current commit index are
    /// noops.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        if index <= self.commit_index {
            return Ok(self.commit_index);
        }
        let term = self
            .term_of(index)?
            .ok_or_else(|| Error::Internal(format!("commit index {index} does not exist")))?;
        // NB: the commit index isn't flushed, since the entries are flushed
        // and the commit index can be recovered from a log quorum.
        self.engine.set(&Key::CommitIndex.encode(), encoding::serialize(&(index, term))?)?;
        self.commit_index = index;
        self.commit_term = term;

        while let Some(config) = self.uncommitted_configs.front() {
            if config.index > index {
                break;
            }
            let config = self.uncommitted_configs.pop_front().expect("config entry vanished");
            self.events.push_back(LogEvent::GroupConfigCommitted(config));
        }
        Ok(index)
    }

    /// Compacts the log by installing a snapshot at a committed index,
    /// pruning all entries up through it. The caller provides the state
    /// machine data for the snapshot.
    pub fn compact(&mut self, index: Index, data: Vec<u8>) -> Result<()> {
        if index > self.commit_index {
            return crate::errinput!("can't compact uncommitted index {index}");
        }
        if self.snapshot.as_ref().map(|s| index <= s.last_index).unwrap_or(false) {
            return Ok(()); // already compacted past this point
        }
        let term = self
            .term_of(index)?
            .ok_or_else(|| Error::Internal(format!("compact index {index} does not exist")))?;
        let snapshot = Snapshot { last_index: index, last_term: term, data };
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode()?)?;
        for i in self.first_index()..=index {
            self.engine.delete(&Key::Entry(i).encode())?;
        }
        self.engine.flush()?;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Receives a snapshot chunk from the leader. Chunks accumulate in a
    /// staging buffer: offset 0 restarts it, and each chunk must continue at
    /// the staged length, otherwise the chunk is dropped and staging resets
    /// (the leader restarts the stream). When the final chunk arrives, the
    /// log is reset to the snapshot point, dropping all entries. Returns
    /// true if a snapshot was installed.
    ///
    /// A snapshot that doesn't extend past the local commit index is stale
    /// (e.g. a delayed retransmission) and is discarded.
    pub fn install(
        &mut self,
        last_index: Index,
        last_term: Term,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> Result<bool> {
        if offset == 0 {
            self.staging = Some(Snapshot { last_index, last_term, data });
        } else {
            match &mut self.staging {
                Some(staged)
                    if staged.last_index == last_index
                        && staged.last_term == last_term
                        && staged.data.len() as u64 == offset =>
                {
                    staged.data.extend(data);
                }
                _ => {
                    self.staging = None;
                    return Ok(false);
                }
            }
        }
        if !done {
            return Ok(false);
        }

        let snapshot = self.staging.take().expect("staging vanished");
        if snapshot.last_index <= self.commit_index {
            return Ok(false);
        }

        self.engine.set(&Key::Snapshot.encode(), snapshot.encode()?)?;
        for index in self.first_index()..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.set(
            &Key::CommitIndex.encode(),
            encoding::serialize(&(snapshot.last_index, snapshot.last_term))?,
        )?;
        self.engine.flush()?;

        self.last_index = snapshot.last_index;
        self.last_term = snapshot.last_term;
        self.commit_index = snapshot.last_index;
        self.commit_term = snapshot.last_term;
        self.uncommitted_configs.clear();
        self.snapshot = Some(snapshot);
        Ok(true)
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: storage::ScanIterator<'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: storage::ScanIterator<'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    fn log() -> Log {
        Log::new(Box::new(Memory::new())).expect("log init failed")
    }

    fn write(payload: &[u8]) -> Command {
        Command::Write(payload.to_vec())
    }

    fn entry(index: Index, term: Term, payload: &[u8]) -> Entry {
        Entry { index, term, command: write(payload) }
    }

    fn add_node_change(id: &str) -> ConfigChange {
        ConfigChange::AddNode {
            endpoint: NodeEndpoint::new(id, "localhost", 2330),
            prev_members: vec![],
        }
    }

    #[test]
    fn append_and_get() -> Result<()> {
        let mut log = log();
        assert_eq!(log.get_last_index(), (0, 0));
        assert_eq!(log.get_commit_index(), (0, 0));

        assert_eq!(log.append(1, Command::NoOp)?, 1);
        assert_eq!(log.append(1, write(b"a"))?, 2);
        assert_eq!(log.get_last_index(), (2, 1));

        assert_eq!(log.get(2)?, Some(entry(2, 1, b"a")));
        assert_eq!(log.get(3)?, None);
        assert!(log.has(2, 1)?);
        assert!(!log.has(2, 2)?);
        assert!(log.has(0, 0)?);
        Ok(())
    }

    #[test]
    fn commit_tracks_term() -> Result<()> {
        let mut log = log();
        log.append(1, Command::NoOp)?;
        log.append(2, write(b"a"))?;

        assert_eq!(log.commit(1)?, 1);
        assert_eq!(log.get_commit_index(), (1, 1));

        // Commits don't regress.
        assert_eq!(log.commit(1)?, 1);
        assert_eq!(log.commit(2)?, 2);
        assert_eq!(log.get_commit_index(), (2, 2));
        Ok(())
    }

    #[test]
    fn splice_appends_and_is_idempotent() -> Result<()> {
        let mut log = log();
        let entries = vec![entry(1, 1, b"a"), entry(2, 1, b"b")];
        assert_eq!(log.splice(entries.clone())?, 2);
        assert_eq!(log.get_last_index(), (2, 1));

        // Splicing the same entries again changes nothing.
        assert_eq!(log.splice(entries)?, 2);
        assert_eq!(log.get_last_index(), (2, 1));
        assert_eq!(log.get(1)?, Some(entry(1, 1, b"a")));
        Ok(())
    }

    #[test]
    fn splice_truncates_conflicts() -> Result<()> {
        let mut log = log();
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])?;
        log.commit(1)?;

        // A conflicting entry at index 2 truncates the old suffix.
        log.splice(vec![entry(2, 2, b"x")])?;
        assert_eq!(log.get_last_index(), (2, 2));
        assert_eq!(log.get(2)?, Some(entry(2, 2, b"x")));
        assert_eq!(log.get(3)?, None);
        Ok(())
    }

    #[test]
    fn splice_emits_config_events() -> Result<()> {
        let mut log = log();
        let change = add_node_change("d");
        log.splice(vec![
            entry(1, 1, b"a"),
            Entry { index: 2, term: 1, command: Command::Config(change.clone()) },
        ])?;

        let config = GroupConfigEntry { index: 2, term: 1, change: change.clone() };
        assert_eq!(log.take_events(), vec![LogEvent::GroupConfigAppended(config.clone())]);
        assert!(log.has_uncommitted_config());

        // A conflicting splice reverts the config entry, then the commit of
        // the replacement entries fires no config events.
        log.splice(vec![entry(2, 2, b"x")])?;
        assert_eq!(log.take_events(), vec![LogEvent::GroupConfigRemoved(config)]);
        assert!(!log.has_uncommitted_config());

        log.commit(2)?;
        assert_eq!(log.take_events(), vec![]);
        Ok(())
    }

    #[test]
    fn commit_emits_config_events() -> Result<()> {
        let mut log = log();
        let change = add_node_change("d");
        log.append(1, Command::NoOp)?;
        log.append(1, Command::Config(change.clone()))?;

        // Leader-side appends announce nothing until commit.
        assert_eq!(log.take_events(), vec![]);

        log.commit(2)?;
        let config = GroupConfigEntry { index: 2, term: 1, change };
        assert_eq!(log.take_events(), vec![LogEvent::GroupConfigCommitted(config)]);
        assert!(!log.has_uncommitted_config());
        Ok(())
    }

    #[test]
    fn compact_prunes_prefix() -> Result<()> {
        let mut log = log();
        log.append(1, write(b"a"))?;
        log.append(1, write(b"b"))?;
        log.append(1, write(b"c"))?;
        log.commit(2)?;

        assert!(log.compact(3, vec![]).is_err()); // above commit index
        log.compact(2, b"state".to_vec())?;

        assert_eq!(log.first_index(), 3);
        assert_eq!(log.get(1)?, None);
        assert_eq!(log.get(2)?, None);
        assert_eq!(log.get(3)?, Some(entry(3, 1, b"c")));
        assert_eq!(log.snapshot().map(|s| (s.last_index, s.last_term)), Some((2, 1)));

        // The boundary still matches, and entries below it are committed.
        assert!(log.has(2, 1)?);
        assert!(log.has(1, 9)?);
        assert_eq!(log.term_of(2)?, Some(1));
        Ok(())
    }

    #[test]
    fn install_stages_chunks() -> Result<()> {
        let mut log = log();
        log.append(1, write(b"a"))?;

        assert!(!log.install(3, 2, 0, b"abc".to_vec(), false)?);
        // A mismatched offset drops the chunk and resets staging.
        assert!(!log.install(3, 2, 9, b"xyz".to_vec(), true)?);
        // Restart from offset 0.
        assert!(!log.install(3, 2, 0, b"abc".to_vec(), false)?);
        assert!(log.install(3, 2, 3, b"def".to_vec(), true)?);

        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.get_commit_index(), (3, 2));
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.snapshot().map(|s| s.data.clone()), Some(b"abcdef".to_vec()));
        Ok(())
    }

    #[test]
    fn install_ignores_stale_snapshot() -> Result<()> {
        let mut log = log();
        log.append(1, write(b"a"))?;
        log.append(1, write(b"b"))?;
        log.commit(2)?;

        assert!(!log.install(1, 1, 0, vec![], true)?);
        assert_eq!(log.get_last_index(), (2, 1));
        Ok(())
    }

    #[test]
    fn reload_preserves_state() -> Result<()> {
        let mut engine: Box<dyn crate::storage::Engine> = Box::new(Memory::new());
        let change = add_node_change("d");
        {
            let mut log = Log::new(engine)?;
            log.append(1, write(b"a"))?;
            log.append(1, Command::Config(change.clone()))?;
            log.commit(1)?;
            // Steal the engine back by swapping in a dummy.
            engine = std::mem::replace(&mut log.engine, Box::new(Memory::new()));
        }
        let log = Log::new(engine)?;
        assert_eq!(log.get_last_index(), (2, 1));
        assert_eq!(log.get_commit_index(), (1, 1));
        assert!(log.has_uncommitted_config());
        Ok(())
    }
}
