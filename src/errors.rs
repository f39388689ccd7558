//! sqlcluster errors.

use thiserror::Error;

/// Errors encountered in the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    SQLiteError(sqlite::Error),
    /// The local node is not the cluster leader.
    #[error("not leader")]
    NotLeader,
    /// The cluster cannot serve the request right now (leader unknown,
    /// forward target unreachable, ...).
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// A committed query failed when applied to the database. The message
    /// carries the query and the engine diagnostics.
    #[error("{0}")]
    Execution(String),
    /// A node with a non-empty log was asked to join a cluster.
    #[error("cannot join with an existing log")]
    JoinWithExistingLog,
    /// The agreed-upon log would be violated. Fatal to the local node.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A log command could not be decoded.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    /// Malformed listen address or connection string.
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    /// The node is shutting down.
    #[error("node is shutting down")]
    Shutdown,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Protobuf decode error.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    /// gRPC transport error.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl StoreError {
    /// Returns `true` for errors a client may resolve by retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::NotLeader
                | StoreError::Unavailable(_)
                | StoreError::Shutdown
                | StoreError::Transport(_)
        )
    }
}

impl From<sqlite::Error> for StoreError {
    fn from(e: sqlite::Error) -> Self {
        StoreError::SQLiteError(e)
    }
}
