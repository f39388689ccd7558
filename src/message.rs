//! Messages exchanged between replicas.

use crate::raft_log::LogEntry;

/// Consensus message.
///
/// Requests travel from one replica to another over the peer RPC surface;
/// each request is answered by the matching response on the same call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Leader asks a follower to append `entries` after `prev_log_index`.
    /// Empty `entries` make it a heartbeat.
    AppendEntryRequest {
        /// Sending replica.
        from: String,
        /// Sender's current term.
        term: u64,
        /// Index of the entry preceding `entries`.
        prev_log_index: u64,
        /// Term of the entry at `prev_log_index`.
        prev_log_term: u64,
        /// Entries to append.
        entries: Vec<LogEntry>,
        /// Leader's commit index.
        commit_index: u64,
    },
    /// Follower's answer. On success `last_index` is the index the follower
    /// now matches the leader up to; on a log mismatch `mismatch_index` is
    /// where the leader should resume.
    AppendEntryResponse {
        /// Sending replica.
        from: String,
        /// Sender's current term.
        term: u64,
        /// Whether the entries were appended.
        success: bool,
        /// Last index matching the leader's log.
        last_index: u64,
        /// Where the leader should resume after a mismatch.
        mismatch_index: Option<u64>,
    },
    /// Candidate asks for a vote.
    VoteRequest {
        /// Sending replica.
        from: String,
        /// Sender's current term.
        term: u64,
        /// Index of the candidate's last entry.
        last_log_index: u64,
        /// Term of the candidate's last entry.
        last_log_term: u64,
    },
    /// Voter's answer.
    VoteResponse {
        /// Sending replica.
        from: String,
        /// Sender's current term.
        term: u64,
        /// Whether the vote was granted.
        vote_granted: bool,
    },
}

impl Message {
    /// Name of the sending replica.
    pub fn sender(&self) -> &str {
        match self {
            Message::AppendEntryRequest { from, .. }
            | Message::AppendEntryResponse { from, .. }
            | Message::VoteRequest { from, .. }
            | Message::VoteResponse { from, .. } => from,
        }
    }

    /// Term of the sending replica.
    pub fn term(&self) -> u64 {
        match self {
            Message::AppendEntryRequest { term, .. }
            | Message::AppendEntryResponse { term, .. }
            | Message::VoteRequest { term, .. }
            | Message::VoteResponse { term, .. } => *term,
        }
    }
}
