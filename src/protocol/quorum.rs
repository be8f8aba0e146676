//! Majority-quorum consensus: a two-phase (prepare/accept) protocol over a
//! majority of the membership.
//!
//! The proposer inserts a proposal record, fans out `QuorumPrepare`, and
//! blocks on a condition variable until the promise/accepted handlers push
//! the proposal through its phases or the operation deadline passes. The
//! acceptor tracks the highest-promised proposal number per key and refuses
//! anything lower, so duelling proposers cannot both win an accept round
//! for the same key.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::node::NodeCore;
use crate::protocol::message::{Message, MessageKind, NodeId};

/// Default per-operation deadline.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Quorum size never adjusts below this floor (membership permitting).
const QUORUM_FLOOR: usize = 3;

/// Phase of an in-flight proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumPhase {
    Prepare,
    Accept,
    Commit,
}

#[derive(Debug)]
struct Proposal {
    phase: QuorumPhase,
    key: String,
    value: String,
    /// A read-consensus round stops after the prepare phase.
    read_only: bool,
    promised: HashSet<NodeId>,
    accepted: HashSet<NodeId>,
    started_at: Instant,
}

struct ConsensusState {
    members: Vec<NodeId>,
    quorum_size: usize,
    proposals: HashMap<u64, Proposal>,
    /// Acceptor side: highest proposal number promised per key.
    highest_promised: HashMap<String, u64>,
}

impl ConsensusState {
    fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn has_write_in_flight(&self, key: &str) -> bool {
        self.proposals
            .values()
            .any(|proposal| !proposal.read_only && proposal.key == key)
    }
}

/// Quorum replication state machine for one node.
pub struct QuorumReplication {
    core: Arc<NodeCore>,
    state: Mutex<ConsensusState>,
    progress: Condvar,
    proposal_counter: AtomicU64,
    read_optimization: AtomicBool,
    adaptive_quorum: AtomicBool,
    operation_timeout_ms: AtomicU64,
    successful_consensus: AtomicU64,
    failed_consensus: AtomicU64,
    consensus_times_us: Mutex<Vec<u64>>,
}

impl QuorumReplication {
    pub fn new(core: Arc<NodeCore>, members: Vec<NodeId>) -> QuorumReplication {
        let quorum_size = members.len() / 2 + 1;
        info!(
            node = core.node_id,
            members = members.len(),
            quorum_size,
            "quorum replication initialized"
        );
        QuorumReplication {
            core,
            state: Mutex::new(ConsensusState {
                members,
                quorum_size,
                proposals: HashMap::new(),
                highest_promised: HashMap::new(),
            }),
            progress: Condvar::new(),
            proposal_counter: AtomicU64::new(1),
            read_optimization: AtomicBool::new(true),
            adaptive_quorum: AtomicBool::new(true),
            operation_timeout_ms: AtomicU64::new(DEFAULT_OPERATION_TIMEOUT.as_millis() as u64),
            successful_consensus: AtomicU64::new(0),
            failed_consensus: AtomicU64::new(0),
            consensus_times_us: Mutex::new(Vec::new()),
        }
    }

    pub fn enable_read_optimization(&self, enable: bool) {
        self.read_optimization.store(enable, Ordering::SeqCst);
    }

    pub fn enable_adaptive_quorum(&self, enable: bool) {
        self.adaptive_quorum.store(enable, Ordering::SeqCst);
    }

    pub fn set_operation_timeout(&self, timeout: Duration) {
        self.operation_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.load(Ordering::SeqCst))
    }

    /// Proposal numbers: a per-node strictly increasing counter with the
    /// proposer id appended in the low bits, so proposals from different
    /// proposers are totally ordered.
    fn next_proposal_number(&self) -> u64 {
        let counter = self.proposal_counter.fetch_add(1, Ordering::SeqCst);
        (counter << 16) | (self.core.node_id as u64 & 0xffff)
    }

    // =========================================================================
    // PROPOSER
    // =========================================================================

    /// Majority-agreed write of `(key, value)`.
    pub fn process_write(&self, request: &Message) -> Result<Message, StoreError> {
        {
            let state = self.state.lock().unwrap();
            if state.members.is_empty() {
                return Err(StoreError::NoQuorumAvailable);
            }
            // Single-node quorum: local write is authoritative.
            if state.members.len() == 1 {
                drop(state);
                self.core.store.write(&request.key, &request.value);
                self.successful_consensus.fetch_add(1, Ordering::Relaxed);
                let mut response =
                    Message::response(MessageKind::WriteResponse, self.core.node_id, request);
                response.success = true;
                return Ok(response);
            }
        }

        let started = Instant::now();
        let proposal_number = self.begin_proposal(request, false)?;

        let outcome = self.await_commit(proposal_number);
        match outcome {
            Ok(()) => {
                self.core.store.write(&request.key, &request.value);
                self.successful_consensus.fetch_add(1, Ordering::Relaxed);
                self.consensus_times_us
                    .lock()
                    .unwrap()
                    .push(started.elapsed().as_micros() as u64);
                debug!(node = self.core.node_id, key = %request.key, proposal_number, "quorum write committed");
                let mut response =
                    Message::response(MessageKind::WriteResponse, self.core.node_id, request);
                response.sequence_number = proposal_number;
                response.success = true;
                Ok(response)
            }
            Err(err) => {
                self.failed_consensus.fetch_add(1, Ordering::Relaxed);
                self.abort_proposal(proposal_number, &request.key);
                warn!(node = self.core.node_id, key = %request.key, proposal_number, kind = err.kind(), "quorum write failed");
                Err(err)
            }
        }
    }

    /// Read `key`, optionally through a prepare round for strong
    /// consistency.
    pub fn process_read(&self, request: &Message) -> Result<Message, StoreError> {
        let fast_path = {
            let state = self.state.lock().unwrap();
            if state.members.is_empty() {
                return Err(StoreError::NoQuorumAvailable);
            }
            state.members.len() == 1
                || (self.read_optimization.load(Ordering::SeqCst)
                    && self.can_use_fast_path(&state, request))
        };

        if !fast_path {
            let started = Instant::now();
            let proposal_number = self.begin_proposal(request, true)?;
            match self.await_commit(proposal_number) {
                Ok(()) => {
                    self.successful_consensus.fetch_add(1, Ordering::Relaxed);
                    self.consensus_times_us
                        .lock()
                        .unwrap()
                        .push(started.elapsed().as_micros() as u64);
                }
                Err(err) => {
                    self.failed_consensus.fetch_add(1, Ordering::Relaxed);
                    self.abort_proposal(proposal_number, &request.key);
                    return Err(err);
                }
            }
        }

        match self.core.store.read(&request.key) {
            Some(value) => {
                let mut response =
                    Message::response(MessageKind::ReadResponse, self.core.node_id, request);
                response.value = value;
                response.success = true;
                Ok(response)
            }
            None => Err(StoreError::KeyNotFound),
        }
    }

    /// Fast-path reads require a non-empty key with no write proposal in
    /// flight for it.
    fn can_use_fast_path(&self, state: &ConsensusState, request: &Message) -> bool {
        !request.key.is_empty() && !state.has_write_in_flight(&request.key)
    }

    /// Insert the proposal record and fan out `QuorumPrepare` to a subset
    /// of at least `quorum_size` members.
    fn begin_proposal(&self, request: &Message, read_only: bool) -> Result<u64, StoreError> {
        let proposal_number = self.next_proposal_number();
        let targets;
        {
            let mut state = self.state.lock().unwrap();
            let mut promised = HashSet::new();
            promised.insert(self.core.node_id);
            state.proposals.insert(
                proposal_number,
                Proposal {
                    phase: QuorumPhase::Prepare,
                    key: request.key.clone(),
                    value: request.value.clone(),
                    read_only,
                    promised,
                    accepted: HashSet::new(),
                    started_at: Instant::now(),
                },
            );
            targets = self.prepare_targets(&state);
        }

        let mut prepare = Message::new(MessageKind::QuorumPrepare, self.core.node_id);
        prepare.key = request.key.clone();
        prepare.sequence_number = proposal_number;
        prepare.target_nodes = targets.clone();
        let payload = prepare.encode();

        for target in targets {
            if target != self.core.node_id {
                let _ = self.core.send_raw(target, payload.clone());
            }
        }
        debug!(node = self.core.node_id, proposal_number, "prepare round started");
        Ok(proposal_number)
    }

    /// All members today; an optimizer may narrow this to any subset of at
    /// least `quorum_size` members.
    fn prepare_targets(&self, state: &ConsensusState) -> Vec<NodeId> {
        state.members.clone()
    }

    /// Block until the proposal commits or the deadline passes. Returns the
    /// failure kind matching the phase that stalled.
    fn await_commit(&self, proposal_number: u64) -> Result<(), StoreError> {
        let deadline = Instant::now() + self.operation_timeout();
        let mut state = self.state.lock().unwrap();
        loop {
            if !self.core.is_running() {
                return Err(StoreError::Shutdown);
            }
            let Some(proposal) = state.proposals.get(&proposal_number) else {
                // Swept by cleanup.
                return Err(StoreError::ConsensusTimeout);
            };
            if proposal.phase == QuorumPhase::Commit {
                state.proposals.remove(&proposal_number);
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let stalled_in = proposal.phase;
                return Err(match stalled_in {
                    QuorumPhase::Prepare => StoreError::NoQuorumAvailable,
                    _ => StoreError::ConsensusTimeout,
                });
            }
            let (next, _timeout) = self
                .progress
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }
    }

    /// Drop a failed proposal and tell acceptors the round is dead.
    fn abort_proposal(&self, proposal_number: u64, key: &str) {
        let members = {
            let mut state = self.state.lock().unwrap();
            state.proposals.remove(&proposal_number);
            state.members.clone()
        };
        let mut abort = Message::new(MessageKind::QuorumAbort, self.core.node_id);
        abort.key = key.to_string();
        abort.sequence_number = proposal_number;
        let payload = abort.encode();
        for member in members {
            if member != self.core.node_id {
                let _ = self.core.send_raw(member, payload.clone());
            }
        }
    }

    // =========================================================================
    // ACCEPTOR
    // =========================================================================

    /// Phase 1 receive: promise unless we already promised a higher number
    /// for this key.
    pub fn handle_prepare(&self, message: &Message) {
        let grant = {
            let mut state = self.state.lock().unwrap();
            let current = state
                .highest_promised
                .get(&message.key)
                .copied()
                .unwrap_or(0);
            if message.sequence_number >= current {
                state
                    .highest_promised
                    .insert(message.key.clone(), message.sequence_number);
                true
            } else {
                false
            }
        };

        let mut promise = Message::response(MessageKind::QuorumPromise, self.core.node_id, message);
        promise.success = grant;
        let _ = self.core.send_raw(message.sender, promise.encode());
        debug!(
            node = self.core.node_id,
            proposal = message.sequence_number,
            grant,
            "prepare handled"
        );
    }

    /// Promise receive (proposer side): count the vote; on majority, move to
    /// the accept phase and fan out `QuorumAccept`.
    pub fn handle_promise(&self, message: &Message) {
        if !message.success {
            return;
        }
        let accept_payload = {
            let mut state = self.state.lock().unwrap();
            let quorum_size = state.quorum_size;
            let members = state.members.clone();
            let Some(proposal) = state.proposals.get_mut(&message.sequence_number) else {
                return;
            };
            proposal.promised.insert(message.sender);
            if proposal.phase != QuorumPhase::Prepare || proposal.promised.len() < quorum_size {
                self.progress.notify_all();
                return;
            }

            if proposal.read_only {
                // Read consensus needs only the promise majority.
                proposal.phase = QuorumPhase::Commit;
                self.progress.notify_all();
                return;
            }

            proposal.phase = QuorumPhase::Accept;
            proposal.accepted.insert(self.core.node_id);
            let mut accept = Message::new(MessageKind::QuorumAccept, self.core.node_id);
            accept.key = proposal.key.clone();
            accept.value = proposal.value.clone();
            accept.sequence_number = message.sequence_number;
            self.progress.notify_all();
            Some((accept.encode(), members))
        };

        if let Some((payload, members)) = accept_payload {
            for member in members {
                if member != self.core.node_id {
                    let _ = self.core.send_raw(member, payload.clone());
                }
            }
            debug!(
                node = self.core.node_id,
                proposal = message.sequence_number,
                "accept round started"
            );
        }
    }

    /// Phase 2 receive: store the value and acknowledge, unless a higher
    /// promise supersedes this proposal.
    pub fn handle_accept(&self, message: &Message) {
        let grant = {
            let state = self.state.lock().unwrap();
            let current = state
                .highest_promised
                .get(&message.key)
                .copied()
                .unwrap_or(0);
            message.sequence_number >= current
        };

        if grant {
            self.core.store.write(&message.key, &message.value);
        }
        let mut accepted =
            Message::response(MessageKind::QuorumAccepted, self.core.node_id, message);
        accepted.success = grant;
        let _ = self.core.send_raw(message.sender, accepted.encode());
        debug!(
            node = self.core.node_id,
            proposal = message.sequence_number,
            grant,
            "accept handled"
        );
    }

    /// Accepted receive (proposer side): count the vote; on majority the
    /// proposal commits and the waiting writer wakes.
    pub fn handle_accepted(&self, message: &Message) {
        if !message.success {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let quorum_size = state.quorum_size;
        let Some(proposal) = state.proposals.get_mut(&message.sequence_number) else {
            return;
        };
        proposal.accepted.insert(message.sender);
        if proposal.phase == QuorumPhase::Accept && proposal.accepted.len() >= quorum_size {
            proposal.phase = QuorumPhase::Commit;
            debug!(
                node = self.core.node_id,
                proposal = message.sequence_number,
                "consensus achieved"
            );
        }
        self.progress.notify_all();
    }

    /// Abort notification from a proposer whose round failed. The promise
    /// ledger is left untouched.
    pub fn handle_abort(&self, message: &Message) {
        debug!(
            node = self.core.node_id,
            proposal = message.sequence_number,
            "proposal aborted by proposer"
        );
    }

    // =========================================================================
    // MEMBERSHIP / MAINTENANCE
    // =========================================================================

    /// Remove a failed member and recompute the quorum size. Votes already
    /// collected from the failed node remain valid.
    pub fn handle_node_failure(&self, failed: NodeId) {
        let mut state = self.state.lock().unwrap();
        if !state.members.contains(&failed) {
            return;
        }
        state.members.retain(|&id| id != failed);
        state.quorum_size = state.majority();
        warn!(
            node = self.core.node_id,
            failed,
            members = state.members.len(),
            quorum_size = state.quorum_size,
            "member removed from quorum"
        );
        self.progress.notify_all();
    }

    pub fn handle_node_recovery(&self, recovered: NodeId) {
        let mut state = self.state.lock().unwrap();
        if !state.members.contains(&recovered) {
            state.members.push(recovered);
            state.quorum_size = state.majority();
            info!(
                node = self.core.node_id,
                recovered,
                members = state.members.len(),
                quorum_size = state.quorum_size,
                "member rejoined quorum"
            );
        }
    }

    /// Recompute the quorum size from the rolling consensus success rate.
    /// The adjustment always starts from a freshly computed majority of the
    /// current membership, so repeated calls under a steady success rate
    /// converge to a fixed point instead of ratcheting. The result never
    /// drops below a simple majority, and the adjusted value applies
    /// uniformly to both phases.
    pub fn adjust_quorum_size_based_on_load(&self) {
        if !self.adaptive_quorum.load(Ordering::SeqCst) {
            return;
        }
        let success_rate = self.consensus_success_rate();
        let mut state = self.state.lock().unwrap();
        if state.members.is_empty() {
            return;
        }
        let majority = state.majority();
        let mut optimal = majority;
        if success_rate < 0.8 {
            optimal = (optimal + 1).min(state.members.len());
        } else if success_rate > 0.95 {
            optimal = optimal.saturating_sub(1).max(QUORUM_FLOOR.min(state.members.len()));
        }
        optimal = optimal.clamp(majority, state.members.len());
        if optimal != state.quorum_size {
            state.quorum_size = optimal;
            info!(
                node = self.core.node_id,
                quorum_size = optimal,
                success_rate,
                "adaptive quorum size adjusted"
            );
        }
    }

    /// Sweep proposals past the operation deadline.
    pub fn cleanup_expired_proposals(&self) {
        let timeout = self.operation_timeout();
        let mut state = self.state.lock().unwrap();
        let before = state.proposals.len();
        state
            .proposals
            .retain(|_, proposal| proposal.started_at.elapsed() <= timeout);
        if state.proposals.len() != before {
            debug!(
                node = self.core.node_id,
                swept = before - state.proposals.len(),
                "expired proposals removed"
            );
            self.progress.notify_all();
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn quorum_size(&self) -> usize {
        self.state.lock().unwrap().quorum_size
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.state.lock().unwrap().members.clone()
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.state.lock().unwrap().members.contains(&node_id)
    }

    pub fn active_proposals(&self) -> usize {
        self.state.lock().unwrap().proposals.len()
    }

    pub fn consensus_success_rate(&self) -> f64 {
        let successes = self.successful_consensus.load(Ordering::Relaxed);
        let failures = self.failed_consensus.load(Ordering::Relaxed);
        let total = successes + failures;
        if total == 0 {
            return 0.0;
        }
        successes as f64 / total as f64
    }

    pub fn average_consensus_time_ms(&self) -> f64 {
        let times = self.consensus_times_us.lock().unwrap();
        if times.is_empty() {
            return 0.0;
        }
        let total: u64 = times.iter().sum();
        total as f64 / times.len() as f64 / 1000.0
    }
}
