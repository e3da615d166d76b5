use super::{NodeId, Term};
use crate::encoding;
use crate::error::Result;

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

/// The durable (term, voted_for) cell. The term is monotone non-decreasing
/// and must be persisted, together with the vote, before any RPC reflecting
/// it is sent; a node that forgot its vote could grant two votes in one term
/// after a crash-restart. Store failures are fatal to the node.
pub trait NodeStore: Send {
    /// Loads the stored term and vote. A fresh store returns (0, None).
    fn load(&mut self) -> Result<(Term, Option<NodeId>)>;

    /// Atomically stores the term and vote.
    fn save(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<()>;
}

/// An in-memory node store for tests and throwaway clusters. Can be seeded
/// with an initial term and vote to simulate a restart.
pub struct MemoryNodeStore {
    term: Term,
    voted_for: Option<NodeId>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self { term: 0, voted_for: None }
    }

    pub fn with(term: Term, voted_for: Option<NodeId>) -> Self {
        Self { term, voted_for }
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for MemoryNodeStore {
    fn load(&mut self) -> Result<(Term, Option<NodeId>)> {
        Ok((self.term, self.voted_for.clone()))
    }

    fn save(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<()> {
        self.term = term;
        self.voted_for = voted_for.cloned();
        Ok(())
    }
}

/// A file-backed node store. Writes go to a temporary file which is fsynced
/// and then renamed over the live file, so a crash mid-write leaves the
/// previous cell intact and readers never observe a torn write.
pub struct FileNodeStore {
    path: PathBuf,
}

impl FileNodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".tmp");
        path.into()
    }
}

impl NodeStore for FileNodeStore {
    fn load(&mut self) -> Result<(Term, Option<NodeId>)> {
        use std::io::Read as _;
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((0, None)),
            Err(err) => return Err(err.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        encoding::deserialize(&bytes)
    }

    fn save(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<()> {
        use std::io::Write as _;
        let temp = self.temp_path();
        let mut file =
            OpenOptions::new().write(true).create(true).truncate(true).open(&temp)?;
        file.write_all(&encoding::serialize(&(term, voted_for))?)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
