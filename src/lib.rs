//! sqlcluster is a replicated SQL store: a cluster of nodes that agree, via
//! Raft, on a single ordered log of SQL statements and apply that log to a
//! local [SQLite][1] database on every node.
//!
//! ## Getting Started
//!
//! Any node accepts writes over HTTP (`POST /sql`), but only the current
//! leader commits them: followers forward the statement to the leader and
//! relay its reply. Every applied statement gets a sequence number, so the
//! reply to `CREATE TABLE t (x)` on a fresh cluster is
//! `SequenceNumber: 1\n`.
//!
//! The first node bootstraps a cluster by joining itself. Further nodes join
//! by posting their name and connection string to a member's `/join`
//! endpoint. Peers talk to each other over gRPC, on TCP or on a Unix domain
//! socket.
//!
//! ```no_run
//! use anyhow::Result;
//! use sqlcluster::{Config, Database};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut config = Config::new("/tmp/sqlcluster/node1", "127.0.0.1:4101", "127.0.0.1:4001");
//!     // Leave `join` empty on the first node; point the others at it.
//!     config.join = None;
//!     let db = Database::new(config);
//!     db.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! The log has no snapshots, so it grows without bound and a restarted node
//! rebuilds its database by replaying it.
//!
//! [1]: https://www.sqlite.org/index.html

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod command;
pub mod database;
pub mod errors;
pub mod http;
pub mod join;
pub mod message;
pub mod raft_log;
pub mod replica;
pub mod rpc;
pub mod server;
pub mod sql;
pub mod state_machine;
pub mod transport;

pub use command::Command;
pub use errors::StoreError;
pub use server::StoreServer;
pub use server::StoreTransport;

pub use database::{Config, Database, Node};
