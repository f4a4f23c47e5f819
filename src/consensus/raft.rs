//! Raft Engine
//!
//! The bundled [`ConsensusLog`] implementation: persisted term/vote/log,
//! randomized-timeout elections, heartbeat replication with majority
//! commit, and a strictly ordered apply stream. Commands submitted on the
//! leader block until committed by a majority and applied locally.
//!
//! Only nodes present in the membership stand for election, so a freshly
//! started node that is joining an existing cluster stays a follower until
//! it learns the cluster through replication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::{oneshot, Mutex};

use crate::command::LogCommand;
use crate::config::ClusterConfig;
use crate::consensus::store::LogStore;
use crate::consensus::transport::{
    AppendEntriesRequest, AppendEntriesResponse, RaftClient, VoteRequest, VoteResponse,
};
use crate::consensus::{ConsensusLog, LogEntry, Member, NodeRole, StateMachine};
use crate::error::{Error, Result};

/// How often the background task checks timers
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum entries shipped in one append-entries request
const MAX_BATCH_ENTRIES: usize = 256;

/// Engine timing configuration
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between leader heartbeat rounds
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (randomized per reset)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (randomized per reset)
    pub election_timeout_max: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            election_timeout_min: Duration::from_millis(1500),
            election_timeout_max: Duration::from_millis(3000),
        }
    }
}

impl From<&ClusterConfig> for RaftConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(config.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.election_timeout_max_ms),
        }
    }
}

/// Mutable engine state, guarded by one lock so commit and apply form a
/// single ordered stream.
struct RaftState {
    role: NodeRole,
    term: u64,
    leader: Option<Member>,
    members: Vec<Member>,
    commit_index: u64,
    last_applied: u64,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    waiters: HashMap<u64, oneshot::Sender<Result<Bytes>>>,
    election_deadline: Instant,
    last_broadcast: Instant,
}

/// The bundled consensus engine
pub struct RaftLog {
    me: Member,
    store: LogStore,
    machine: Arc<dyn StateMachine>,
    client: RaftClient,
    config: RaftConfig,
    state: Mutex<RaftState>,
    shutdown: AtomicBool,
}

impl RaftLog {
    /// Create an engine for `me` over a log store and a state machine
    pub fn new(
        me: Member,
        store: LogStore,
        machine: Arc<dyn StateMachine>,
        config: RaftConfig,
    ) -> Arc<Self> {
        let now = Instant::now();
        let deadline = now + random_timeout(&config);

        Arc::new(Self {
            me,
            store,
            machine,
            client: RaftClient::default(),
            config,
            state: Mutex::new(RaftState {
                role: NodeRole::Follower,
                term: 0,
                leader: None,
                members: Vec::new(),
                commit_index: 0,
                last_applied: 0,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                waiters: HashMap::new(),
                election_deadline: deadline,
                last_broadcast: now,
            }),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Stop background timers. Pending waiters are failed.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        fail_waiters(&mut state, "engine stopped");
    }

    /// Current term
    pub async fn term(&self) -> u64 {
        self.state.lock().await.term
    }

    /// Highest committed log index
    pub async fn commit_index(&self) -> u64 {
        self.state.lock().await.commit_index
    }

    /// Highest locally applied log index
    pub async fn last_applied(&self) -> u64 {
        self.state.lock().await.last_applied
    }

    async fn tick(&self) {
        enum Action {
            Heartbeat,
            Election,
            None,
        }

        let action = {
            let state = self.state.lock().await;
            match state.role {
                NodeRole::Leader => {
                    if state.last_broadcast.elapsed() >= self.config.heartbeat_interval {
                        Action::Heartbeat
                    } else {
                        Action::None
                    }
                }
                NodeRole::Follower | NodeRole::Candidate => {
                    let is_member = state.members.iter().any(|m| m.name == self.me.name);
                    if is_member && Instant::now() >= state.election_deadline {
                        Action::Election
                    } else {
                        Action::None
                    }
                }
            }
        };

        match action {
            Action::Heartbeat => {
                if let Err(e) = self.replicate_round().await {
                    tracing::warn!("heartbeat round failed: {}", e);
                }
            }
            Action::Election => {
                if let Err(e) = self.run_election().await {
                    tracing::warn!("election failed: {}", e);
                }
            }
            Action::None => {}
        }
    }

    /// One replication round: ship pending entries (or empty heartbeats) to
    /// every peer, integrate acknowledgements, advance the commit index,
    /// and apply newly committed entries.
    async fn replicate_round(&self) -> Result<()> {
        // Snapshot everything needed for the sends, then release the lock:
        // network I/O must never run under the state lock.
        let (term, requests) = {
            let mut state = self.state.lock().await;
            if state.role != NodeRole::Leader {
                return Ok(());
            }
            state.last_broadcast = Instant::now();

            let term = state.term;
            let commit = state.commit_index;
            let mut requests = Vec::new();
            for peer in state.members.clone() {
                if peer.name == self.me.name {
                    continue;
                }
                let next = state.next_index.get(&peer.name).copied().unwrap_or(1);
                let prev_log_index = next.saturating_sub(1);
                let prev_log_term = self
                    .store
                    .term_of(prev_log_index)
                    .await?
                    .unwrap_or(0);
                let entries = self.store.entries_from(next, MAX_BATCH_ENTRIES).await?;
                requests.push((
                    peer.clone(),
                    AppendEntriesRequest {
                        term,
                        leader: self.me.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: commit,
                    },
                ));
            }
            (term, requests)
        };

        let sends = requests.into_iter().map(|(peer, request)| async move {
            let response = self
                .client
                .append_entries(&peer.connection_string, &request)
                .await;
            (peer, request, response)
        });
        let results = join_all(sends).await;

        let mut state = self.state.lock().await;
        if state.term != term || state.role != NodeRole::Leader {
            return Ok(());
        }

        for (peer, request, response) in results {
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("append to {} failed: {}", peer.name, e);
                    continue;
                }
            };

            if response.term > state.term {
                self.step_down(&mut state, response.term).await?;
                return Ok(());
            }

            if response.success {
                let matched = response
                    .match_index
                    .max(request.prev_log_index + request.entries.len() as u64);
                state.match_index.insert(peer.name.clone(), matched);
                state.next_index.insert(peer.name.clone(), matched + 1);
            } else {
                let next = state.next_index.entry(peer.name.clone()).or_insert(1);
                *next = next.saturating_sub(1).max(1);
            }
        }

        self.advance_commit(&mut state).await?;
        self.apply_committed(&mut state).await;
        Ok(())
    }

    /// Advance the commit index to the highest entry of the current term
    /// that a majority of members have matched.
    async fn advance_commit(&self, state: &mut RaftState) -> Result<()> {
        let (last_index, _) = self.store.last_index_term().await?;
        let majority = majority(state.members.len());

        let mut committed = state.commit_index;
        for index in (state.commit_index + 1)..=last_index {
            let acks = 1 + state
                .members
                .iter()
                .filter(|m| m.name != self.me.name)
                .filter(|m| state.match_index.get(&m.name).copied().unwrap_or(0) >= index)
                .count();
            if acks >= majority && self.store.term_of(index).await? == Some(state.term) {
                committed = index;
            }
        }

        state.commit_index = committed;
        Ok(())
    }

    /// Apply committed entries in order. Runs under the state lock, so
    /// application is a single strictly ordered stream per node.
    async fn apply_committed(&self, state: &mut RaftState) {
        while state.last_applied < state.commit_index {
            let index = state.last_applied + 1;
            let entry = match self.store.entry(index).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    tracing::error!("committed entry {} missing from the log store", index);
                    return;
                }
                Err(e) => {
                    tracing::error!("failed to read committed entry {}: {}", index, e);
                    return;
                }
            };

            tracing::debug!(index, command = entry.command.name(), "applying entry");
            let result: Result<Bytes> = match &entry.command {
                LogCommand::Nop => Ok(Bytes::new()),
                LogCommand::AddMember { member } => {
                    self.apply_membership(state, member);
                    Ok(Bytes::new())
                }
                LogCommand::Query { query } => {
                    self.machine.apply_query(query, state.role).await
                }
            };

            state.last_applied = index;

            if let Err(e) = &result {
                tracing::warn!("apply of entry {} failed: {}", index, e);
            }
            if let Some(waiter) = state.waiters.remove(&index) {
                let _ = waiter.send(result);
            }
        }
    }

    fn apply_membership(&self, state: &mut RaftState, member: &Member) {
        if state.members.iter().any(|m| m.name == member.name) {
            return;
        }
        tracing::info!(
            "cluster member added: {} at {}",
            member.name,
            member.connection_string
        );
        state.members.push(member.clone());
        if state.role == NodeRole::Leader && member.name != self.me.name {
            let next = state.commit_index + 1;
            state.next_index.insert(member.name.clone(), next);
            state.match_index.insert(member.name.clone(), 0);
        }
    }

    async fn run_election(&self) -> Result<()> {
        let (term, request, peers) = {
            let mut state = self.state.lock().await;

            let term = state.term + 1;
            self.store.set_current_term(term).await?;
            self.store.set_voted_for(Some(&self.me.name)).await?;
            state.term = term;
            state.role = NodeRole::Candidate;
            state.leader = None;
            state.election_deadline = Instant::now() + random_timeout(&self.config);

            let (last_log_index, last_log_term) = self.store.last_index_term().await?;
            let request = VoteRequest {
                term,
                candidate: self.me.clone(),
                last_log_index,
                last_log_term,
            };
            let peers: Vec<Member> = state
                .members
                .iter()
                .filter(|m| m.name != self.me.name)
                .cloned()
                .collect();
            (term, request, peers)
        };

        tracing::info!(term, "starting election");

        let sends = peers.iter().map(|peer| {
            let request = request.clone();
            async move {
                self.client
                    .request_vote(&peer.connection_string, &request)
                    .await
            }
        });
        let responses = join_all(sends).await;

        let mut state = self.state.lock().await;
        if state.term != term || state.role != NodeRole::Candidate {
            return Ok(());
        }

        let mut granted = 1;
        for response in responses.into_iter().flatten() {
            if response.term > state.term {
                self.step_down(&mut state, response.term).await?;
                return Ok(());
            }
            if response.vote_granted {
                granted += 1;
            }
        }

        if granted >= majority(state.members.len()) {
            tracing::info!(term, votes = granted, "election won");
            self.become_leader(&mut state).await?;
            drop(state);
            self.replicate_round().await?;
        } else {
            tracing::debug!(term, votes = granted, "election lost");
        }
        Ok(())
    }

    /// Transition to leader: initialize replication indexes and append a
    /// barrier entry so entries from earlier terms become committable.
    async fn become_leader(&self, state: &mut RaftState) -> Result<()> {
        state.role = NodeRole::Leader;
        state.leader = Some(self.me.clone());
        state.last_broadcast = Instant::now();

        let (last_index, _) = self.store.last_index_term().await?;
        state.next_index.clear();
        state.match_index.clear();
        for member in &state.members {
            if member.name != self.me.name {
                state.next_index.insert(member.name.clone(), last_index + 1);
                state.match_index.insert(member.name.clone(), 0);
            }
        }

        self.store
            .append(&[LogEntry {
                index: last_index + 1,
                term: state.term,
                command: LogCommand::Nop,
            }])
            .await?;

        // Single-member clusters commit without any network round.
        self.advance_commit(state).await?;
        self.apply_committed(state).await;
        Ok(())
    }

    async fn step_down(&self, state: &mut RaftState, new_term: u64) -> Result<()> {
        tracing::info!(
            old_term = state.term,
            new_term,
            "observed higher term, stepping down"
        );
        self.store.set_current_term(new_term).await?;
        self.store.set_voted_for(None).await?;
        state.term = new_term;
        state.role = NodeRole::Follower;
        state.leader = None;
        fail_waiters(state, "leadership lost before the entry was committed");
        Ok(())
    }

    /// Handle an append-entries request from a leader.
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut state = self.state.lock().await;

        if request.term < state.term {
            return Ok(AppendEntriesResponse {
                term: state.term,
                success: false,
                match_index: 0,
            });
        }

        if request.term > state.term {
            self.step_down(&mut state, request.term).await?;
        } else if state.role != NodeRole::Follower {
            // A leader exists in our term; yield to it.
            state.role = NodeRole::Follower;
            fail_waiters(&mut state, "another leader was elected in this term");
        }

        state.leader = Some(request.leader.clone());
        state.election_deadline = Instant::now() + random_timeout(&self.config);

        // Log consistency check
        if self.store.term_of(request.prev_log_index).await? != Some(request.prev_log_term) {
            return Ok(AppendEntriesResponse {
                term: state.term,
                success: false,
                match_index: 0,
            });
        }

        // Append new entries, truncating any conflicting suffix first
        let mut new_from = None;
        for (i, entry) in request.entries.iter().enumerate() {
            match self.store.term_of(entry.index).await? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.store.truncate_from(entry.index).await?;
                    new_from = Some(i);
                    break;
                }
                None => {
                    new_from = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = new_from {
            self.store.append(&request.entries[i..]).await?;
        }

        let match_index = request.prev_log_index + request.entries.len() as u64;

        let (last_index, _) = self.store.last_index_term().await?;
        let new_commit = request.leader_commit.min(last_index);
        if new_commit > state.commit_index {
            state.commit_index = new_commit;
        }
        self.apply_committed(&mut state).await;

        Ok(AppendEntriesResponse {
            term: state.term,
            success: true,
            match_index,
        })
    }

    /// Handle a vote request from a candidate.
    pub async fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.lock().await;

        if request.term < state.term {
            return Ok(VoteResponse {
                term: state.term,
                vote_granted: false,
            });
        }

        if request.term > state.term {
            self.step_down(&mut state, request.term).await?;
        }

        let (last_log_index, last_log_term) = self.store.last_index_term().await?;
        let up_to_date = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);

        let voted_for = self.store.voted_for().await?;
        let grant = up_to_date
            && voted_for
                .map(|v| v == request.candidate.name)
                .unwrap_or(true);

        if grant {
            self.store
                .set_voted_for(Some(&request.candidate.name))
                .await?;
            state.election_deadline = Instant::now() + random_timeout(&self.config);
        }

        Ok(VoteResponse {
            term: state.term,
            vote_granted: grant,
        })
    }

    /// Initialize a brand-new single-member cluster so the bootstrap
    /// membership command can be committed. Only reachable for the very
    /// first submit against an empty, member-less log.
    async fn initialize_cluster(&self, state: &mut RaftState) -> Result<()> {
        tracing::info!("initializing new cluster");
        self.store.set_current_term(1).await?;
        self.store.set_voted_for(Some(&self.me.name)).await?;
        state.term = 1;
        state.role = NodeRole::Leader;
        state.leader = Some(self.me.clone());
        state.last_broadcast = Instant::now();
        Ok(())
    }
}

#[async_trait]
impl ConsensusLog for RaftLog {
    async fn start(self: Arc<Self>) -> Result<()> {
        // Rebuild membership and term from the persisted log before any
        // timer fires; a restarted node must know it is a member to stand
        // for election.
        let members = self.store.scan_members().await?;
        let term = self.store.current_term().await?;
        {
            let mut state = self.state.lock().await;
            state.members = members;
            state.term = term;
            state.election_deadline = Instant::now() + random_timeout(&self.config);
        }

        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                if engine.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                engine.tick().await;
            }
            tracing::debug!("engine timer loop stopped");
        });

        Ok(())
    }

    async fn role(&self) -> NodeRole {
        self.state.lock().await.role
    }

    async fn leader_address(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .leader
            .as_ref()
            .map(|m| m.connection_string.clone())
    }

    async fn peers(&self) -> Vec<Member> {
        self.state.lock().await.members.clone()
    }

    async fn submit(&self, command: LogCommand) -> Result<Bytes> {
        let rx = {
            let mut state = self.state.lock().await;

            if state.role != NodeRole::Leader {
                let fresh = state.members.is_empty() && self.store.last_index().await? == 0;
                let bootstrapping = fresh && matches!(command, LogCommand::AddMember { .. });
                if bootstrapping {
                    self.initialize_cluster(&mut state).await?;
                } else {
                    return Err(match &state.leader {
                        Some(leader) => Error::NotLeader(leader.name.clone()),
                        None => Error::NoLeader,
                    });
                }
            }

            let (last_index, _) = self.store.last_index_term().await?;
            let index = last_index + 1;
            tracing::debug!(index, command = command.name(), "submitting command");
            self.store
                .append(&[LogEntry {
                    index,
                    term: state.term,
                    command,
                }])
                .await?;

            let (tx, rx) = oneshot::channel();
            state.waiters.insert(index, tx);
            rx
        };

        // Kick off replication immediately rather than waiting for the next
        // heartbeat tick; for a single-member cluster this round also
        // commits and applies the entry.
        self.replicate_round().await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Replication(
                "leadership lost before the entry was applied".into(),
            )),
        }
    }

    async fn add_member(&self, member: Member) -> Result<()> {
        self.submit(LogCommand::AddMember { member }).await.map(|_| ())
    }
}

fn majority(members: usize) -> usize {
    members.max(1) / 2 + 1
}

fn random_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    let ms = rand::thread_rng().gen_range(min..=max);
    Duration::from_millis(ms)
}

fn fail_waiters(state: &mut RaftState, reason: &str) {
    for (_, waiter) in state.waiters.drain() {
        let _ = waiter.send(Err(Error::Replication(reason.to_string())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::QueryMachine;
    use crate::executor::SqliteExecutor;

    fn member(name: &str) -> Member {
        Member {
            name: name.to_string(),
            connection_string: format!("http://{}.test:4001", name),
        }
    }

    fn engine(name: &str) -> (Arc<RaftLog>, Arc<QueryMachine>) {
        let machine = Arc::new(QueryMachine::new(SqliteExecutor::open_in_memory().unwrap()));
        let raft = RaftLog::new(
            member(name),
            LogStore::open_in_memory().unwrap(),
            Arc::clone(&machine) as Arc<dyn StateMachine>,
            RaftConfig::default(),
        );
        (raft, machine)
    }

    fn entry(index: u64, term: u64, command: LogCommand) -> LogEntry {
        LogEntry { index, term, command }
    }

    #[tokio::test]
    async fn test_bootstrap_initializes_single_member_cluster() {
        let (raft, machine) = engine("n1");

        raft.add_member(member("n1")).await.unwrap();
        assert_eq!(raft.role().await, NodeRole::Leader);
        assert_eq!(raft.peers().await, vec![member("n1")]);
        assert_eq!(raft.term().await, 1);

        // Commands commit without any network round on a single member.
        let response = raft
            .submit(LogCommand::query(b"CREATE TABLE t (id INTEGER)".to_vec()))
            .await
            .unwrap();
        assert_eq!(&response[..], b"SequenceNumber: 1\n");
        assert_eq!(machine.applied_count(), 1);
        assert_eq!(raft.commit_index().await, raft.last_applied().await);
    }

    #[tokio::test]
    async fn test_query_submit_on_fresh_node_is_rejected() {
        let (raft, machine) = engine("n1");

        let err = raft
            .submit(LogCommand::query(b"SELECT 1".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoLeader));
        assert_eq!(machine.applied_count(), 0);
    }

    #[tokio::test]
    async fn test_follower_applies_committed_entries() {
        let (raft, machine) = engine("n2");

        let request = AppendEntriesRequest {
            term: 1,
            leader: member("n1"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                entry(1, 1, LogCommand::AddMember { member: member("n1") }),
                entry(2, 1, LogCommand::AddMember { member: member("n2") }),
                entry(3, 1, LogCommand::query(b"CREATE TABLE t (id INTEGER)".to_vec())),
            ],
            leader_commit: 3,
        };

        let response = raft.handle_append_entries(request).await.unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, 3);

        assert_eq!(raft.role().await, NodeRole::Follower);
        assert_eq!(
            raft.leader_address().await.as_deref(),
            Some("http://n1.test:4001")
        );
        assert_eq!(raft.peers().await, vec![member("n1"), member("n2")]);
        assert_eq!(machine.applied_count(), 1);
        assert_eq!(machine.cache().len().await, 1);

        // A write submitted here is never applied locally; the caller is
        // told who the leader is.
        let err = raft
            .submit(LogCommand::query(b"INSERT INTO t VALUES (1)".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader(ref name) if name == "n1"));
        assert_eq!(machine.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_append_entries_rejects_stale_term() {
        let (raft, _machine) = engine("n2");

        let heartbeat = |term| AppendEntriesRequest {
            term,
            leader: member("n1"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        };

        assert!(raft.handle_append_entries(heartbeat(2)).await.unwrap().success);

        let stale = raft.handle_append_entries(heartbeat(1)).await.unwrap();
        assert!(!stale.success);
        assert_eq!(stale.term, 2);
    }

    #[tokio::test]
    async fn test_append_entries_consistency_check() {
        let (raft, _machine) = engine("n2");

        // The follower has nothing at index 3, so a request claiming a
        // predecessor there must be refused.
        let request = AppendEntriesRequest {
            term: 1,
            leader: member("n1"),
            prev_log_index: 3,
            prev_log_term: 1,
            entries: vec![entry(4, 1, LogCommand::Nop)],
            leader_commit: 0,
        };
        assert!(!raft.handle_append_entries(request).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_conflicting_suffix_is_replaced() {
        let (raft, _machine) = engine("n2");

        let first = AppendEntriesRequest {
            term: 1,
            leader: member("n1"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, LogCommand::Nop)],
            leader_commit: 0,
        };
        assert!(raft.handle_append_entries(first).await.unwrap().success);

        // A new leader overwrites the uncommitted entry at index 1.
        let second = AppendEntriesRequest {
            term: 2,
            leader: member("n3"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 2, LogCommand::AddMember { member: member("n3") })],
            leader_commit: 1,
        };
        assert!(raft.handle_append_entries(second).await.unwrap().success);
        assert_eq!(raft.peers().await, vec![member("n3")]);
    }

    #[tokio::test]
    async fn test_vote_is_granted_once_per_term() {
        let (raft, _machine) = engine("n3");

        let request = |term, candidate: &str| VoteRequest {
            term,
            candidate: member(candidate),
            last_log_index: 0,
            last_log_term: 0,
        };

        let granted = raft.handle_request_vote(request(1, "n1")).await.unwrap();
        assert!(granted.vote_granted);

        // Same term, different candidate: already voted.
        let denied = raft.handle_request_vote(request(1, "n2")).await.unwrap();
        assert!(!denied.vote_granted);

        // New term clears the vote.
        let regranted = raft.handle_request_vote(request(2, "n2")).await.unwrap();
        assert!(regranted.vote_granted);
        assert_eq!(regranted.term, 2);
    }

    #[tokio::test]
    async fn test_vote_requires_up_to_date_log() {
        let (raft, _machine) = engine("n2");

        let fill = AppendEntriesRequest {
            term: 1,
            leader: member("n1"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, LogCommand::Nop), entry(2, 1, LogCommand::Nop)],
            leader_commit: 0,
        };
        assert!(raft.handle_append_entries(fill).await.unwrap().success);

        // Candidate with a shorter log of the same term is denied.
        let behind = VoteRequest {
            term: 5,
            candidate: member("n3"),
            last_log_index: 1,
            last_log_term: 1,
        };
        assert!(!raft.handle_request_vote(behind).await.unwrap().vote_granted);

        // Candidate at least as long is granted.
        let current = VoteRequest {
            term: 6,
            candidate: member("n3"),
            last_log_index: 2,
            last_log_term: 1,
        };
        assert!(raft.handle_request_vote(current).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_restart_rebuilds_state_from_log_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.db");
        let fast = RaftConfig {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
        };

        {
            let machine = Arc::new(QueryMachine::new(SqliteExecutor::open_in_memory().unwrap()));
            let raft = RaftLog::new(
                member("n1"),
                LogStore::open(&log_path).unwrap(),
                Arc::clone(&machine) as Arc<dyn StateMachine>,
                fast.clone(),
            );
            raft.add_member(member("n1")).await.unwrap();
            raft.submit(LogCommand::query(b"CREATE TABLE t (id INTEGER)".to_vec()))
                .await
                .unwrap();
            raft.submit(LogCommand::query(b"INSERT INTO t VALUES (1)".to_vec()))
                .await
                .unwrap();
            assert_eq!(machine.sequence_number().await, 2);
            raft.stop().await;
        }

        // A new process over the same log: fresh database, fresh machine.
        let machine = Arc::new(QueryMachine::new(SqliteExecutor::open_in_memory().unwrap()));
        let raft = RaftLog::new(
            member("n1"),
            LogStore::open(&log_path).unwrap(),
            Arc::clone(&machine) as Arc<dyn StateMachine>,
            fast,
        );
        Arc::clone(&raft).start().await.unwrap();

        // The node re-elects itself and replay rebuilds cache and counters.
        let mut elected = false;
        for _ in 0..100 {
            if raft.role().await == NodeRole::Leader && raft.last_applied().await >= 3 {
                elected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(elected, "node never re-elected itself after restart");

        assert_eq!(machine.sequence_number().await, 2);
        assert!(machine
            .cache()
            .get(b"INSERT INTO t VALUES (1)")
            .await
            .is_some());

        let response = raft
            .submit(LogCommand::query(b"SELECT COUNT(*) FROM t".to_vec()))
            .await
            .unwrap();
        assert_eq!(&response[..], b"SequenceNumber: 3\n1\n");
        raft.stop().await;
    }
}
