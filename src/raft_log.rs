//! Durable replicated log.
//!
//! Entries live in `raft.log` as a sequence of length-delimited protobuf
//! records, appended and synced as they arrive. The current term, the vote
//! cast in it and the commit index live next to it in `raft.state`, which is
//! replaced atomically on every change.

use crate::command::Command;
use crate::errors::StoreError;
use crate::rpc::proto;
use derivative::Derivative;
use log::warn;
use prost::Message as _;
use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "raft.log";
const STATE_FILE: &str = "raft.state";

/// A single entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Term of the leader that created the entry.
    pub term: u64,
    /// Position in the log, starting at 1.
    pub index: u64,
    /// The command to apply once the entry commits.
    pub command: Command,
}

impl From<&LogEntry> for proto::LogEntry {
    fn from(entry: &LogEntry) -> Self {
        proto::LogEntry {
            term: entry.term,
            index: entry.index,
            name: entry.command.name().to_string(),
            command: entry.command.encode(),
        }
    }
}

impl TryFrom<proto::LogEntry> for LogEntry {
    type Error = StoreError;

    fn try_from(entry: proto::LogEntry) -> Result<Self, Self::Error> {
        Ok(LogEntry {
            term: entry.term,
            index: entry.index,
            command: Command::decode(&entry.name, &entry.command)?,
        })
    }
}

/// Consensus state that must survive restarts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    /// Latest term this node has seen.
    pub term: u64,
    /// Candidate voted for in `term`, if any.
    pub voted_for: Option<String>,
    /// Highest index known to be committed.
    pub commit_index: u64,
}

/// Append-only log of commands with term/index metadata.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RaftLog {
    dir: PathBuf,
    #[derivative(Debug = "ignore")]
    file: File,
    #[derivative(Debug = "ignore")]
    entries: Vec<LogEntry>,
    state: HardState,
}

impl RaftLog {
    /// Opens (or creates) the log stored in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let (entries, valid_len) = decode_entries(&data)?;
        if valid_len < data.len() {
            warn!(
                "Discarding {} bytes of torn log tail in {}",
                data.len() - valid_len,
                path.display()
            );
            file.set_len(valid_len as u64)?;
        }
        let state = load_state(&dir.join(STATE_FILE))?;
        if state.commit_index > entries.len() as u64 {
            return Err(StoreError::ProtocolViolation(format!(
                "commit index {} is beyond the last log index {}",
                state.commit_index,
                entries.len()
            )));
        }
        Ok(RaftLog {
            dir,
            file,
            entries,
            state,
        })
    }

    /// Returns `true` if no entry was ever appended.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry, zero for an empty log.
    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Term of the last entry, zero for an empty log.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// The entry at `index`.
    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Term of the entry at `index`. Index zero is the empty prefix every
    /// log shares and has term zero.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `index`.
    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        let start = index.max(1) as usize - 1;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    /// Entries from `index` to the end of the log, without copying.
    pub fn iter_from(&self, index: u64) -> std::slice::Iter<'_, LogEntry> {
        let start = (index.max(1) as usize - 1).min(self.entries.len());
        self.entries[start..].iter()
    }

    /// Appends `entries`, which must continue the log without gaps.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        let mut expected = self.last_index() + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(StoreError::ProtocolViolation(format!(
                    "appending index {} to a log ending at {}",
                    entry.index,
                    expected - 1
                )));
            }
            buf.extend(proto::LogEntry::from(entry).encode_length_delimited_to_vec());
            expected += 1;
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.entries.extend(entries);
        Ok(())
    }

    /// Discards the entry at `index` and everything after it.
    ///
    /// Committed entries are never discarded; asking for it is a protocol
    /// violation.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), StoreError> {
        if index <= self.state.commit_index {
            return Err(StoreError::ProtocolViolation(format!(
                "truncating from index {} would discard committed entries (commit index {})",
                index, self.state.commit_index
            )));
        }
        if index > self.last_index() {
            return Ok(());
        }
        self.entries.truncate(index as usize - 1);
        self.rewrite()
    }

    /// Highest index known to be committed.
    pub fn commit_index(&self) -> u64 {
        self.state.commit_index
    }

    /// Advances the commit index to `index`. Returns `false` if it was
    /// already there.
    pub fn commit(&mut self, index: u64) -> Result<bool, StoreError> {
        if index <= self.state.commit_index {
            return Ok(false);
        }
        if index > self.last_index() {
            return Err(StoreError::ProtocolViolation(format!(
                "committing index {} beyond the last log index {}",
                index,
                self.last_index()
            )));
        }
        self.state.commit_index = index;
        self.save_state()?;
        Ok(true)
    }

    /// Durable term and vote.
    pub fn hard_state(&self) -> &HardState {
        &self.state
    }

    /// Records the current term and the vote cast in it.
    pub fn set_term_and_vote(
        &mut self,
        term: u64,
        voted_for: Option<String>,
    ) -> Result<(), StoreError> {
        if term < self.state.term {
            return Err(StoreError::ProtocolViolation(format!(
                "term going backwards from {} to {}",
                self.state.term, term
            )));
        }
        self.state.term = term;
        self.state.voted_for = voted_for;
        self.save_state()
    }

    fn rewrite(&mut self) -> Result<(), StoreError> {
        let path = self.dir.join(LOG_FILE);
        let tmp = self.dir.join("raft.log.tmp");
        let mut buf = Vec::new();
        for entry in &self.entries {
            buf.extend(proto::LogEntry::from(entry).encode_length_delimited_to_vec());
        }
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&path)?;
        Ok(())
    }

    fn save_state(&self) -> Result<(), StoreError> {
        let state = proto::HardState {
            term: self.state.term,
            voted_for: self.state.voted_for.clone().unwrap_or_default(),
            commit_index: self.state.commit_index,
        };
        let tmp = self.dir.join("raft.state.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&state.encode_to_vec())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(STATE_FILE))?;
        Ok(())
    }
}

fn decode_entries(data: &[u8]) -> Result<(Vec<LogEntry>, usize), StoreError> {
    let mut entries: Vec<LogEntry> = Vec::new();
    let mut buf = data;
    let mut valid_len = 0;
    while !buf.is_empty() {
        let record = match proto::LogEntry::decode_length_delimited(&mut buf) {
            Ok(record) => record,
            Err(_) => break,
        };
        let entry = LogEntry::try_from(record)?;
        if entry.index != entries.len() as u64 + 1 {
            return Err(StoreError::ProtocolViolation(format!(
                "log record {} found at position {}",
                entry.index,
                entries.len() + 1
            )));
        }
        entries.push(entry);
        valid_len = data.len() - buf.len();
    }
    Ok((entries, valid_len))
}

fn load_state(path: &Path) -> Result<HardState, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HardState::default()),
        Err(e) => return Err(e.into()),
    };
    let state = proto::HardState::decode(data.as_slice())?;
    Ok(HardState {
        term: state.term,
        voted_for: if state.voted_for.is_empty() {
            None
        } else {
            Some(state.voted_for)
        },
        commit_index: state.commit_index,
    })
}
