//! Error types for pool operations

/// Errors from the allocation engine and session probe.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A pool-file line did not match the schema. Fatal at load.
    #[error("pool file parse error: {0}")]
    Parse(String),

    /// The pool file could not be rewritten. Fatal: the in-memory pool has
    /// diverged from disk and the process must not continue.
    #[error("pool storage failure: {0}")]
    Storage(String),

    /// An input failed a form check (address, username, identifier).
    #[error("rejected input: {0}")]
    Policy(String),

    /// The session-listing command could not be run or exited non-zero.
    #[error("session probe failed: {0}")]
    Probe(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
