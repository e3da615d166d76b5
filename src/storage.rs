//! Durable storage backing the replicated log.

use crate::error::Result;

use std::ops::Bound;

/// The key/value pairs yielded by a log storage scan, in key order.
pub type ScanIterator<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// Storage for the replicated log. The log keeps entries under
/// index-ordered keys plus a couple of metadata cells (commit index and
/// snapshot), so an engine only needs point reads and writes, ordered range
/// scans, and a durability barrier. Entry appends and truncations are
/// flushed before the log acknowledges them; metadata writes are not (see
/// the log's commit handling).
///
/// All methods take a mutable reference: log access is serialized by the
/// node's executor, so engines don't need internal synchronization.
pub trait Engine: Send {
    /// Removes a key. Missing keys are ignored, since log truncation
    /// deletes index ranges blindly.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Makes all preceding writes durable. Once flush returns, an appended
    /// entry must survive a crash.
    fn flush(&mut self) -> Result<()>;

    /// Gets the value stored under a key, if any.
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Iterates over the key/value pairs in the given key range, in key
    /// order. Boxed, since the log always scans through `dyn Engine`.
    fn scan(&mut self, range: (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> ScanIterator<'_>;

    /// Stores a value under a key, replacing any existing value.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;
}

/// An in-memory engine over the standard library B-tree map. Nothing is
/// durable: a node restarting with this engine rejoins with an empty log
/// and recovers entries from the leader, or from a snapshot. Also used
/// throughout the tests.
#[derive(Default)]
pub struct Memory {
    data: std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for Memory {
    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> ScanIterator<'_> {
        Box::new(self.data.range(range).map(|(k, v)| Ok((k.clone(), v.clone()))))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(engine: &mut Memory) -> Vec<(Vec<u8>, Vec<u8>)> {
        engine
            .scan((Bound::Unbounded, Bound::Unbounded))
            .collect::<Result<Vec<_>>>()
            .expect("scan failed")
    }

    #[test]
    fn point_ops() -> Result<()> {
        let mut s = Memory::new();

        assert_eq!(s.get(b"a")?, None);
        s.set(b"a", vec![1])?;
        assert_eq!(s.get(b"a")?, Some(vec![1]));

        s.set(b"b", vec![2])?;
        assert_eq!(s.get(b"b")?, Some(vec![2]));
        assert_eq!(s.get(b"a")?, Some(vec![1]));

        s.set(b"a", vec![0])?;
        assert_eq!(s.get(b"a")?, Some(vec![0]));

        s.delete(b"a")?;
        assert_eq!(s.get(b"a")?, None);
        assert_eq!(s.get(b"b")?, Some(vec![2]));

        // Deletes are idempotent.
        s.delete(b"a")?;
        assert_eq!(s.get(b"a")?, None);

        s.flush()?;
        Ok(())
    }

    #[test]
    fn scan_ranges() -> Result<()> {
        let mut s = Memory::new();
        s.set(b"a", vec![1])?;
        s.set(b"b", vec![2])?;
        s.set(b"ba", vec![2, 1])?;
        s.set(b"c", vec![3])?;

        // A half-open range, as used for log entry scans.
        let kvs = s
            .scan((Bound::Included(b"b".to_vec()), Bound::Excluded(b"c".to_vec())))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(kvs, vec![(b"b".to_vec(), vec![2]), (b"ba".to_vec(), vec![2, 1])]);

        assert_eq!(scan_all(&mut s).len(), 4);
        Ok(())
    }
}
