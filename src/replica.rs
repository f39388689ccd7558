//! Raft consensus core.
//!
//! A [`Replica`] is a deterministic state machine. Its owner feeds it
//! inbound messages, proposals and clock ticks, then drains the messages it
//! wants sent and applies the entries it has committed. The replica never
//! touches the network or the wall clock itself, which keeps elections and
//! replication testable without either.

use crate::command::Command;
use crate::errors::StoreError;
use crate::message::Message;
use crate::raft_log::{LogEntry, RaftLog};
use crate::state_machine::StateMachine;
use derivative::Derivative;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
const MIN_ELECTION_TIMEOUT: Duration = Duration::from_millis(150);
const MAX_ELECTION_TIMEOUT: Duration = Duration::from_millis(350);
const MAX_ENTRIES_PER_MESSAGE: usize = 64;

/// Consensus timing configuration.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// How often a leader sends heartbeats.
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized election timeout.
    pub min_election_timeout: Duration,
    /// Upper bound of the randomized election timeout.
    pub max_election_timeout: Duration,
    /// Maximum number of entries carried by one append request.
    pub max_entries_per_message: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            min_election_timeout: MIN_ELECTION_TIMEOUT,
            max_election_timeout: MAX_ELECTION_TIMEOUT,
            max_entries_per_message: MAX_ENTRIES_PER_MESSAGE,
        }
    }
}

/// Role of a replica in its current term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Follows the leader of the current term, if any.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Leader of the current term.
    Leader,
}

/// Outcome of applying one committed entry.
#[derive(Debug)]
pub struct Applied {
    /// Index of the applied entry.
    pub index: u64,
    /// Term of the applied entry.
    pub term: u64,
    /// Reply for whoever submitted the entry.
    pub result: Result<Vec<u8>, StoreError>,
}

/// A member of the consensus group.
///
/// The local node always counts as a voting member; `peers` holds the other
/// members. A `join` takes effect as soon as it is in the log, committed or
/// not, and is undone if its entry is truncated away.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Replica {
    id: String,
    config: RaftConfig,
    role: Role,
    #[derivative(Debug = "ignore")]
    log: RaftLog,
    leader: Option<String>,
    peers: BTreeMap<String, String>,
    last_applied: u64,
    votes: HashSet<String>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    #[derivative(Debug = "ignore")]
    outbox: Vec<(String, Message)>,
}

impl Replica {
    /// Creates a follower over `log`. Nothing is applied yet; call
    /// [`Replica::apply_committed`] to replay the committed prefix.
    pub fn new(id: String, log: RaftLog, config: RaftConfig, now: Instant) -> Self {
        let peers = membership(&id, &log);
        let mut replica = Replica {
            id,
            config,
            role: Role::Follower,
            log,
            leader: None,
            peers,
            last_applied: 0,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: now,
            heartbeat_deadline: now,
            outbox: Vec::new(),
        };
        replica.reset_election_deadline(now);
        replica
    }

    /// Name of this replica.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Is this replica the leader?
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// The leader this replica currently believes in.
    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Current term.
    pub fn term(&self) -> u64 {
        self.log.hard_state().term
    }

    /// Other members of the cluster, by name, with their connection strings.
    pub fn peers(&self) -> &BTreeMap<String, String> {
        &self.peers
    }

    /// The replicated log.
    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Highest committed index.
    pub fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }

    /// Highest applied index.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// When [`Replica::tick`] next has work to do. `None` while the replica
    /// has nothing to time out on.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.role {
            Role::Leader => Some(self.heartbeat_deadline),
            _ if self.is_promotable() => Some(self.election_deadline),
            _ => None,
        }
    }

    /// Drains the messages this replica wants sent, as `(peer, message)`.
    pub fn take_messages(&mut self) -> Vec<(String, Message)> {
        std::mem::take(&mut self.outbox)
    }

    /// Advances timers: leaders heartbeat, others start an election once
    /// their timeout elapses.
    pub fn tick(&mut self, now: Instant) -> Result<(), StoreError> {
        match self.role {
            Role::Leader => {
                if now >= self.heartbeat_deadline {
                    self.broadcast_append();
                    self.heartbeat_deadline = now + self.config.heartbeat_interval;
                }
            }
            Role::Follower | Role::Candidate => {
                if self.is_promotable() && now >= self.election_deadline {
                    self.start_election(now)?;
                }
            }
        }
        Ok(())
    }

    /// Appends `command` to the log for replication.
    ///
    /// Returns the index and term of the new entry. Fails with
    /// [`StoreError::NotLeader`] unless this replica leads, except for the
    /// self-join of a brand-new node, which bootstraps a single-node cluster.
    /// A join fails with [`StoreError::Unavailable`] while an earlier join is
    /// still uncommitted.
    pub fn propose(&mut self, command: Command, now: Instant) -> Result<(u64, u64), StoreError> {
        if self.role != Role::Leader && self.is_bootstrap(&command) {
            self.bootstrap(now)?;
        }
        if self.role != Role::Leader {
            return Err(StoreError::NotLeader);
        }
        if let Command::Join { name, .. } = &command {
            if self.has_uncommitted_join() {
                return Err(StoreError::Unavailable(format!(
                    "membership change in progress, cannot admit {} yet",
                    name
                )));
            }
        }
        let index = self.append_local(command)?;
        self.broadcast_append();
        self.advance_commit()?;
        Ok((index, self.term()))
    }

    /// Handles a message from another replica, returning the reply for
    /// requests.
    pub fn step(&mut self, msg: Message, now: Instant) -> Result<Option<Message>, StoreError> {
        match msg {
            Message::AppendEntryRequest {
                from,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            } => self
                .handle_append_request(
                    from,
                    term,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    commit_index,
                    now,
                )
                .map(Some),
            Message::AppendEntryResponse {
                from,
                term,
                success,
                last_index,
                mismatch_index,
            } => self
                .handle_append_response(from, term, success, last_index, mismatch_index, now)
                .map(|_| None),
            Message::VoteRequest {
                from,
                term,
                last_log_index,
                last_log_term,
            } => self
                .handle_vote_request(from, term, last_log_index, last_log_term, now)
                .map(Some),
            Message::VoteResponse {
                from,
                term,
                vote_granted,
            } => self
                .handle_vote_response(from, term, vote_granted, now)
                .map(|_| None),
        }
    }

    /// Applies every committed but not yet applied entry in index order.
    ///
    /// Queries go to `state_machine`. Joins already took effect when they
    /// were appended.
    pub fn apply_committed(
        &mut self,
        state_machine: &mut dyn StateMachine,
    ) -> Result<Vec<Applied>, StoreError> {
        let mut applied = Vec::new();
        while self.last_applied < self.log.commit_index() {
            let index = self.last_applied + 1;
            let entry = self.log.entry(index).cloned().ok_or_else(|| {
                StoreError::ProtocolViolation(format!("committed index {} is missing", index))
            })?;
            let result = match entry.command {
                Command::Noop | Command::Join { .. } => Ok(Vec::new()),
                Command::Query { sql } => state_machine.apply(&sql),
            };
            self.last_applied = index;
            applied.push(Applied {
                index,
                term: entry.term,
                result,
            });
        }
        Ok(applied)
    }

    fn is_promotable(&self) -> bool {
        !self.log.is_empty()
    }

    fn is_bootstrap(&self, command: &Command) -> bool {
        self.log.is_empty()
            && matches!(command, Command::Join { name, .. } if *name == self.id)
    }

    fn has_uncommitted_join(&self) -> bool {
        self.log
            .iter_from(self.log.commit_index() + 1)
            .any(|entry| matches!(entry.command, Command::Join { .. }))
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        let min = self.config.min_election_timeout.as_millis() as u64;
        let max = (self.config.max_election_timeout.as_millis() as u64).max(min);
        let timeout = rand::thread_rng().gen_range(min..=max);
        self.election_deadline = now + Duration::from_millis(timeout);
    }

    fn append_local(&mut self, command: Command) -> Result<u64, StoreError> {
        let index = self.log.last_index() + 1;
        let term = self.term();
        self.append_to_log(vec![LogEntry {
            term,
            index,
            command,
        }])?;
        Ok(index)
    }

    /// Appends to the log and admits every member the new entries join.
    fn append_to_log(&mut self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        let joins: Vec<(String, String)> = entries
            .iter()
            .filter_map(|entry| match &entry.command {
                Command::Join {
                    name,
                    connection_string,
                } => Some((name.clone(), connection_string.clone())),
                _ => None,
            })
            .collect();
        self.log.append(entries)?;
        for (name, connection_string) in joins {
            self.add_peer(name, connection_string);
        }
        Ok(())
    }

    /// Drops the log from `index` on, together with the members only those
    /// entries admitted.
    fn truncate_log(&mut self, index: u64) -> Result<(), StoreError> {
        self.log.truncate_from(index)?;
        let peers = membership(&self.id, &self.log);
        for name in self.peers.keys().filter(|name| !peers.contains_key(*name)) {
            info!("{} forgets uncommitted peer {}", self.id, name);
        }
        self.peers = peers;
        Ok(())
    }

    fn add_peer(&mut self, name: String, connection_string: String) {
        if name == self.id {
            return;
        }
        let previous = self.peers.insert(name.clone(), connection_string);
        if previous.is_some() {
            return;
        }
        info!("{} added peer {}", self.id, name);
        if self.role == Role::Leader {
            self.next_index.insert(name.clone(), self.log.last_index() + 1);
            self.match_index.insert(name, 0);
        }
    }

    fn bootstrap(&mut self, now: Instant) -> Result<(), StoreError> {
        let term = self.term() + 1;
        info!("{} bootstrapping a new cluster in term {}", self.id, term);
        self.log.set_term_and_vote(term, Some(self.id.clone()))?;
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        self.votes.clear();
        self.heartbeat_deadline = now + self.config.heartbeat_interval;
        Ok(())
    }

    fn start_election(&mut self, now: Instant) -> Result<(), StoreError> {
        let term = self.term() + 1;
        info!("{} starting election for term {}", self.id, term);
        self.log.set_term_and_vote(term, Some(self.id.clone()))?;
        self.role = Role::Candidate;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.reset_election_deadline(now);
        let request = Message::VoteRequest {
            from: self.id.clone(),
            term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers.keys() {
            self.outbox.push((peer.clone(), request.clone()));
        }
        self.maybe_become_leader(now)
    }

    fn maybe_become_leader(&mut self, now: Instant) -> Result<(), StoreError> {
        if self.role == Role::Candidate && self.votes.len() >= self.quorum() {
            self.become_leader(now)?;
        }
        Ok(())
    }

    fn become_leader(&mut self, now: Instant) -> Result<(), StoreError> {
        info!("{} elected leader for term {}", self.id, self.term());
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        self.votes.clear();
        let next = self.log.last_index() + 1;
        self.next_index = self.peers.keys().map(|p| (p.clone(), next)).collect();
        self.match_index = self.peers.keys().map(|p| (p.clone(), 0)).collect();
        // Entries from earlier terms only commit behind one of our own.
        self.append_local(Command::Noop)?;
        self.broadcast_append();
        self.heartbeat_deadline = now + self.config.heartbeat_interval;
        self.advance_commit()
    }

    fn become_follower(
        &mut self,
        term: u64,
        leader: Option<String>,
        now: Instant,
    ) -> Result<(), StoreError> {
        if term > self.term() {
            self.log.set_term_and_vote(term, None)?;
        }
        if self.role != Role::Follower {
            info!("{} stepping down to follower in term {}", self.id, term);
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.reset_election_deadline(now);
        Ok(())
    }

    fn handle_vote_request(
        &mut self,
        from: String,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        now: Instant,
    ) -> Result<Message, StoreError> {
        if term > self.term() {
            self.become_follower(term, None, now)?;
        }
        let up_to_date = last_log_term > self.log.last_term()
            || (last_log_term == self.log.last_term() && last_log_index >= self.log.last_index());
        let available = match &self.log.hard_state().voted_for {
            None => true,
            Some(candidate) => *candidate == from,
        };
        let vote_granted = term == self.term() && available && up_to_date;
        if vote_granted {
            debug!("{} votes for {} in term {}", self.id, from, term);
            self.log.set_term_and_vote(term, Some(from))?;
            self.reset_election_deadline(now);
        }
        Ok(Message::VoteResponse {
            from: self.id.clone(),
            term: self.term(),
            vote_granted,
        })
    }

    fn handle_vote_response(
        &mut self,
        from: String,
        term: u64,
        vote_granted: bool,
        now: Instant,
    ) -> Result<(), StoreError> {
        if term > self.term() {
            return self.become_follower(term, None, now);
        }
        if self.role != Role::Candidate || term != self.term() || !vote_granted {
            return Ok(());
        }
        if !self.peers.contains_key(&from) {
            debug!("{} ignoring vote from non-member {}", self.id, from);
            return Ok(());
        }
        self.votes.insert(from);
        self.maybe_become_leader(now)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_request(
        &mut self,
        from: String,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
        now: Instant,
    ) -> Result<Message, StoreError> {
        if term < self.term() {
            return Ok(self.append_response(false, self.log.last_index(), None));
        }
        if self.role == Role::Leader && term == self.term() {
            warn!(
                "{} received entries from {} while leading term {}",
                self.id, from, term
            );
        }
        self.become_follower(term, Some(from), now)?;

        if self.log.term_at(prev_log_index) != Some(prev_log_term) {
            let mismatch_index = prev_log_index.min(self.log.last_index() + 1);
            debug!(
                "{} log mismatch at index {}, asking to resume at {}",
                self.id, prev_log_index, mismatch_index
            );
            return Ok(self.append_response(false, self.log.last_index(), Some(mismatch_index)));
        }

        let last_new = prev_log_index + entries.len() as u64;
        let mut missing = Vec::new();
        for entry in entries {
            if !missing.is_empty() {
                missing.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    info!(
                        "{} discarding conflicting entries from index {}",
                        self.id, entry.index
                    );
                    self.truncate_log(entry.index)?;
                    missing.push(entry);
                }
                None => missing.push(entry),
            }
        }
        self.append_to_log(missing)?;
        if commit_index > self.log.commit_index() {
            self.log.commit(commit_index.min(last_new))?;
        }
        Ok(self.append_response(true, last_new, None))
    }

    fn append_response(
        &self,
        success: bool,
        last_index: u64,
        mismatch_index: Option<u64>,
    ) -> Message {
        Message::AppendEntryResponse {
            from: self.id.clone(),
            term: self.term(),
            success,
            last_index,
            mismatch_index,
        }
    }

    fn handle_append_response(
        &mut self,
        from: String,
        term: u64,
        success: bool,
        last_index: u64,
        mismatch_index: Option<u64>,
        now: Instant,
    ) -> Result<(), StoreError> {
        if term > self.term() {
            return self.become_follower(term, None, now);
        }
        if self.role != Role::Leader || term != self.term() || !self.peers.contains_key(&from) {
            return Ok(());
        }
        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        if success {
            let matched = matched.max(last_index);
            self.match_index.insert(from.clone(), matched);
            let next = self.next_index.entry(from.clone()).or_insert(matched + 1);
            if *next <= matched {
                *next = matched + 1;
            }
            let next = *next;
            self.advance_commit()?;
            if next <= self.log.last_index() {
                self.send_append(&from);
            }
        } else if let Some(mismatch_index) = mismatch_index {
            self.next_index
                .insert(from.clone(), mismatch_index.max(matched + 1));
            self.send_append(&from);
        }
        Ok(())
    }

    fn send_append(&mut self, to: &str) {
        let last_index = self.log.last_index();
        let next = self
            .next_index
            .get(to)
            .copied()
            .unwrap_or(last_index + 1)
            .clamp(1, last_index + 1);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(next, self.config.max_entries_per_message);
        // Pipelined: assume delivery, a mismatch reply rewinds.
        self.next_index
            .insert(to.to_string(), next + entries.len() as u64);
        let request = Message::AppendEntryRequest {
            from: self.id.clone(),
            term: self.term(),
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.log.commit_index(),
        };
        self.outbox.push((to.to_string(), request));
    }

    fn broadcast_append(&mut self) {
        let peers: Vec<String> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.send_append(&peer);
        }
    }

    fn advance_commit(&mut self) -> Result<(), StoreError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let mut matched: Vec<u64> = self
            .peers
            .keys()
            .map(|peer| self.match_index.get(peer).copied().unwrap_or(0))
            .collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.quorum() - 1];
        if candidate > self.log.commit_index() && self.log.term_at(candidate) == Some(self.term()) {
            debug!("{} committing up to index {}", self.id, candidate);
            self.log.commit(candidate)?;
        }
        Ok(())
    }
}

/// Members admitted by the joins in `log`, other than `id` itself.
fn membership(id: &str, log: &RaftLog) -> BTreeMap<String, String> {
    let mut peers = BTreeMap::new();
    for entry in log.iter_from(1) {
        if let Command::Join {
            name,
            connection_string,
        } = &entry.command
        {
            if name != id {
                peers.insert(name.clone(), connection_string.clone());
            }
        }
    }
    peers
}
