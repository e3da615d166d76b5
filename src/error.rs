use serde::{Deserialize, Serialize};

/// Quorum errors. Protocol-level rejects (stale terms, log mismatches,
/// denied votes) are not errors -- they are replied to in-band. Errors are
/// what callers of the public API can observe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation requires the leader, but this node isn't it. The
    /// current leader, if known, is included so clients can redirect.
    NotLeader(Option<crate::raft::NodeId>),
    /// The node has not been started, or has been stopped.
    NotReady,
    /// Invalid data, typically decoding or state corruption.
    InvalidData(String),
    /// Invalid user input, typically a bad argument.
    InvalidInput(String),
    /// An IO error. Store and log IO failures are fatal to the node, since
    /// it can't proceed without durable term/vote and entries.
    IO(String),
    /// An internal invariant was violated.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotLeader(Some(leader)) => write!(f, "not leader, try {leader}"),
            Error::NotLeader(None) => write!(f, "not leader, and no leader known"),
            Error::NotReady => write!(f, "node is not started"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}

/// A Quorum result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
