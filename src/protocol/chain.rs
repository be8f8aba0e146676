//! Chain replication: a sequenced write pipeline head -> ... -> tail with
//! tail-served reads.
//!
//! Writes enter at the head, apply locally, and flow down the chain as
//! `ChainForward` messages. The tail acknowledges back along the
//! predecessor chain; every node retains a pending entry for each forwarded
//! write until the matching `ChainAck` arrives, so in-flight writes can be
//! rewired when a successor fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::node::NodeCore;
use crate::protocol::message::{Message, MessageKind, NodeId};

/// Default number of writes folded into one batch step.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// A partially filled batch is flushed after this long.
pub const BATCH_TIMEOUT: Duration = Duration::from_millis(10);

/// Default resend attempts on transient send failure.
pub const DEFAULT_SEND_RETRIES: u32 = 3;

/// Lifecycle of a forwarded write, from the forwarding node's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Pending,
    Forwarded,
    Acked,
    TimedOut,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    message: Message,
    state: WriteState,
    forwarded_to: NodeId,
    forwarded_at: Instant,
}

struct ChainState {
    /// Pipeline order; head at index 0, tail last.
    order: Vec<NodeId>,
    /// This node's index, or `order.len()` when evicted.
    position: usize,
    /// In-flight forwarded writes keyed by sequence number.
    pending: HashMap<u64, PendingWrite>,
    batch: Vec<Message>,
    batch_started: Option<Instant>,
}

impl ChainState {
    fn locate(&mut self, node_id: NodeId) {
        self.position = self
            .order
            .iter()
            .position(|&id| id == node_id)
            .unwrap_or(self.order.len());
    }

    fn is_head(&self) -> bool {
        self.position == 0 && !self.order.is_empty()
    }

    fn is_tail(&self) -> bool {
        !self.order.is_empty() && self.position + 1 == self.order.len()
    }

    fn successor(&self) -> Option<NodeId> {
        self.order.get(self.position + 1).copied()
    }

    fn predecessor(&self) -> Option<NodeId> {
        if self.position == 0 {
            None
        } else {
            self.order.get(self.position - 1).copied()
        }
    }
}

/// Chain replication state machine for one node.
pub struct ChainReplication {
    core: Arc<NodeCore>,
    state: Mutex<ChainState>,
    batching_enabled: AtomicBool,
    batch_size: usize,
    send_retries: AtomicU32,
    timed_out_writes: AtomicU64,
}

impl ChainReplication {
    pub fn new(core: Arc<NodeCore>, order: Vec<NodeId>) -> ChainReplication {
        let mut state = ChainState {
            order,
            position: 0,
            pending: HashMap::new(),
            batch: Vec::new(),
            batch_started: None,
        };
        state.locate(core.node_id);
        debug!(
            node = core.node_id,
            position = state.position,
            chain_len = state.order.len(),
            "chain replication initialized"
        );
        ChainReplication {
            core,
            state: Mutex::new(state),
            batching_enabled: AtomicBool::new(false),
            batch_size: DEFAULT_BATCH_SIZE,
            send_retries: AtomicU32::new(DEFAULT_SEND_RETRIES),
            timed_out_writes: AtomicU64::new(0),
        }
    }

    pub fn enable_batching(&self, enable: bool) {
        self.batching_enabled.store(enable, Ordering::SeqCst);
    }

    pub fn set_send_retries(&self, retries: u32) {
        self.send_retries.store(retries.max(1), Ordering::SeqCst);
    }

    // =========================================================================
    // READ / WRITE
    // =========================================================================

    /// Serve a read. Only the tail is authoritative: any other position
    /// forwards the request to the tail (which replies to the original
    /// sender) and reports a local non-success.
    pub fn process_read(&self, request: &Message) -> Result<Message, StoreError> {
        let state = self.state.lock().unwrap();
        if state.order.is_empty() {
            return Err(StoreError::NoQuorumAvailable);
        }

        if !state.is_tail() {
            let tail = *state.order.last().expect("non-empty chain");
            drop(state);
            self.send_with_retries(tail, request)?;
            debug!(node = self.core.node_id, tail, key = %request.key, "read forwarded to tail");
            let mut response =
                Message::response(MessageKind::ReadResponse, self.core.node_id, request);
            response.success = false;
            response.metadata = "forwarded".to_string();
            return Ok(response);
        }
        drop(state);

        match self.core.store.read(&request.key) {
            Some(value) => {
                let mut response =
                    Message::response(MessageKind::ReadResponse, self.core.node_id, request);
                response.value = value;
                response.success = true;
                if request.sender != self.core.node_id {
                    let _ = self.send_with_retries(request.sender, &response);
                }
                Ok(response)
            }
            None => {
                if request.sender != self.core.node_id {
                    let reply = Message::failure(
                        MessageKind::ReadResponse,
                        self.core.node_id,
                        request,
                        &StoreError::KeyNotFound,
                    );
                    let _ = self.send_with_retries(request.sender, &reply);
                }
                Err(StoreError::KeyNotFound)
            }
        }
    }

    /// Accept a write. Non-head positions forward to the head and report
    /// success (forwarding accepted); the head applies locally, then either
    /// batches or forwards down the chain.
    pub fn process_write(&self, request: &Message) -> Result<Message, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.order.is_empty() {
            return Err(StoreError::NoQuorumAvailable);
        }

        if !state.is_head() {
            let head = state.order[0];
            drop(state);
            self.send_with_retries(head, request)?;
            debug!(node = self.core.node_id, head, key = %request.key, "write forwarded to head");
            let mut response =
                Message::response(MessageKind::WriteResponse, self.core.node_id, request);
            response.success = true;
            return Ok(response);
        }

        // Flush a stale batch before admitting new work.
        self.flush_batch_locked(&mut state, false);

        if self.batching_enabled.load(Ordering::SeqCst) {
            let mut queued = request.clone();
            if queued.sequence_number == 0 {
                queued.sequence_number = self.core.next_sequence();
            }
            if state.batch.is_empty() {
                state.batch_started = Some(Instant::now());
            }
            state.batch.push(queued);
            if state.batch.len() >= self.batch_size {
                self.flush_batch_locked(&mut state, true);
            }
            let mut response =
                Message::response(MessageKind::WriteResponse, self.core.node_id, request);
            response.success = true;
            return Ok(response);
        }

        let sequence = if request.sequence_number == 0 {
            self.core.next_sequence()
        } else {
            request.sequence_number
        };
        self.apply_and_forward(&mut state, request, sequence)?;

        let mut response = Message::response(MessageKind::WriteResponse, self.core.node_id, request);
        response.sequence_number = sequence;
        response.success = true;
        Ok(response)
    }

    /// Apply one write locally and, if a successor exists, forward it and
    /// record the pending entry.
    fn apply_and_forward(
        &self,
        state: &mut ChainState,
        request: &Message,
        sequence: u64,
    ) -> Result<(), StoreError> {
        self.core.store.write(&request.key, &request.value);

        if state.successor().is_none() {
            // Single-node chain or we are the tail: the write is complete.
            return Ok(());
        }

        let mut forward = request.clone();
        forward.kind = MessageKind::ChainForward;
        forward.sender = self.core.node_id;
        forward.sequence_number = sequence;
        self.forward_write(state, forward)
    }

    /// Forward a write to the current successor, rewiring the chain on send
    /// failure. Exhausting every candidate successor breaks the chain.
    fn forward_write(&self, state: &mut ChainState, forward: Message) -> Result<(), StoreError> {
        loop {
            let Some(successor) = state.successor() else {
                // We became the tail while rewiring; the local apply stands.
                return Ok(());
            };
            match self.send_with_retries(successor, &forward) {
                Ok(()) => {
                    state.pending.insert(
                        forward.sequence_number,
                        PendingWrite {
                            message: forward,
                            state: WriteState::Forwarded,
                            forwarded_to: successor,
                            forwarded_at: Instant::now(),
                        },
                    );
                    return Ok(());
                }
                Err(_) => {
                    warn!(
                        node = self.core.node_id,
                        successor, "successor unreachable, rewiring chain"
                    );
                    self.remove_node_locked(state, successor);
                    if state.order.is_empty() {
                        return Err(StoreError::ChainBroken);
                    }
                }
            }
        }
    }

    // =========================================================================
    // INBOUND HANDLERS
    // =========================================================================

    /// A predecessor forwarded a write: apply it, pass it on, or ack if we
    /// are the tail.
    pub fn handle_forward(&self, message: &Message) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        self.core.store.write(&message.key, &message.value);

        if state.successor().is_some() {
            let mut forward = message.clone();
            forward.sender = self.core.node_id;
            return self.forward_write(&mut state, forward);
        }

        // Tail: acknowledge back along the predecessor chain, or directly
        // to the original sender on a two-node chain collapse.
        let mut ack = Message::new(MessageKind::ChainAck, self.core.node_id);
        ack.key = message.key.clone();
        ack.sequence_number = message.sequence_number;
        ack.correlation_id = message.correlation_id.clone();
        ack.success = true;
        let target = state.predecessor().unwrap_or(message.sender);
        drop(state);
        if target != self.core.node_id {
            self.send_with_retries(target, &ack)?;
        }
        debug!(node = self.core.node_id, seq = message.sequence_number, "tail acked write");
        Ok(())
    }

    /// An ack worked its way back: clear the pending entry and relay toward
    /// the head.
    pub fn handle_ack(&self, message: &Message) {
        let mut state = self.state.lock().unwrap();
        if let Some(mut pending) = state.pending.remove(&message.sequence_number) {
            pending.state = WriteState::Acked;
        }
        if let Some(predecessor) = state.predecessor() {
            let mut relay = message.clone();
            relay.sender = self.core.node_id;
            drop(state);
            let _ = self.send_with_retries(predecessor, &relay);
        }
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Replace the pipeline ordering and recompute this node's index.
    /// Duplicate ids keep their first position; each member appears once.
    pub fn update_chain_order(&self, new_order: Vec<NodeId>) {
        let mut state = self.state.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        state.order = new_order
            .into_iter()
            .filter(|&id| seen.insert(id))
            .collect();
        state.locate(self.core.node_id);
        self.reorder_hook(&mut state);
        debug!(
            node = self.core.node_id,
            position = state.position,
            chain_len = state.order.len(),
            "chain order updated"
        );
    }

    /// Topology-aware reorder hook. The default contract is a no-op.
    fn reorder_hook(&self, _state: &mut ChainState) {}

    /// Remove a failed node and rewire in-flight writes that were forwarded
    /// to it. If the tail failed, the new last entry becomes tail.
    pub fn handle_node_failure(&self, failed: NodeId) {
        let mut state = self.state.lock().unwrap();
        if !state.order.contains(&failed) {
            return;
        }
        warn!(node = self.core.node_id, failed, "removing failed node from chain");
        self.remove_node_locked(&mut state, failed);
    }

    fn remove_node_locked(&self, state: &mut ChainState, failed: NodeId) {
        state.order.retain(|&id| id != failed);
        state.locate(self.core.node_id);

        let stranded: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.forwarded_to == failed)
            .map(|(&seq, _)| seq)
            .collect();

        for sequence in stranded {
            let Some(pending) = state.pending.remove(&sequence) else {
                continue;
            };
            match state.successor() {
                Some(_) => {
                    let _ = self.forward_write(state, pending.message);
                }
                None => {
                    // We are the new tail; the write is already applied
                    // locally. Complete it toward the head.
                    let mut ack = Message::new(MessageKind::ChainAck, self.core.node_id);
                    ack.key = pending.message.key.clone();
                    ack.sequence_number = sequence;
                    ack.success = true;
                    if let Some(predecessor) = state.predecessor() {
                        let _ = self.send_with_retries(predecessor, &ack);
                    }
                }
            }
        }
    }

    /// Reference policy: a recovered node rejoins at the end of the chain.
    pub fn handle_node_recovery(&self, recovered: NodeId) {
        let mut state = self.state.lock().unwrap();
        if !state.order.contains(&recovered) {
            state.order.push(recovered);
            state.locate(self.core.node_id);
            debug!(node = self.core.node_id, recovered, "node rejoined chain");
        }
    }

    // =========================================================================
    // BATCHING / MAINTENANCE
    // =========================================================================

    /// Flush the write batch if it is full, stale, or a flush is forced.
    pub fn maybe_flush_batch(&self) {
        let mut state = self.state.lock().unwrap();
        self.flush_batch_locked(&mut state, false);
    }

    fn flush_batch_locked(&self, state: &mut ChainState, force: bool) {
        if state.batch.is_empty() {
            return;
        }
        let stale = state
            .batch_started
            .map(|started| started.elapsed() >= BATCH_TIMEOUT)
            .unwrap_or(false);
        if !force && !stale && state.batch.len() < self.batch_size {
            return;
        }

        let batch = std::mem::take(&mut state.batch);
        state.batch_started = None;
        debug!(node = self.core.node_id, size = batch.len(), "flushing write batch");
        for message in batch {
            let sequence = message.sequence_number;
            let _ = self.apply_and_forward(state, &message, sequence);
        }
    }

    /// Expire pending entries older than `timeout`. Expired writes are
    /// terminal failures.
    pub fn expire_pending(&self, timeout: Duration) {
        let mut state = self.state.lock().unwrap();
        let expired: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.forwarded_at.elapsed() > timeout)
            .map(|(&seq, _)| seq)
            .collect();
        for sequence in expired {
            if let Some(mut pending) = state.pending.remove(&sequence) {
                pending.state = WriteState::TimedOut;
                self.timed_out_writes.fetch_add(1, Ordering::Relaxed);
                warn!(node = self.core.node_id, sequence, "pending write timed out");
            }
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn is_head(&self) -> bool {
        self.state.lock().unwrap().is_head()
    }

    pub fn is_tail(&self) -> bool {
        self.state.lock().unwrap().is_tail()
    }

    pub fn successor(&self) -> Option<NodeId> {
        self.state.lock().unwrap().successor()
    }

    pub fn predecessor(&self) -> Option<NodeId> {
        self.state.lock().unwrap().predecessor()
    }

    pub fn chain_order(&self) -> Vec<NodeId> {
        self.state.lock().unwrap().order.clone()
    }

    pub fn chain_len(&self) -> usize {
        self.state.lock().unwrap().order.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn timed_out_writes(&self) -> u64 {
        self.timed_out_writes.load(Ordering::Relaxed)
    }

    /// Pending load against a nominal ceiling of 100 in-flight writes.
    pub fn utilization(&self) -> f64 {
        (self.pending_count() as f64 / 100.0).min(1.0)
    }

    fn send_with_retries(&self, target: NodeId, message: &Message) -> Result<(), StoreError> {
        let payload = message.encode();
        let mut last_err = StoreError::Unreachable(target);
        for _ in 0..self.send_retries.load(Ordering::SeqCst).max(1) {
            match self.core.send_raw(target, payload.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ClusterNet;

    fn core_with_net(id: NodeId, ids: &[NodeId]) -> (Arc<NodeCore>, ClusterNet) {
        let mut net = ClusterNet::new(ids);
        let endpoint = net.endpoint(id).unwrap();
        (Arc::new(NodeCore::new(id, endpoint)), net)
    }

    #[test]
    fn empty_chain_rejects_reads_and_writes() {
        let (core, _net) = core_with_net(1, &[1]);
        let chain = ChainReplication::new(core.clone(), vec![]);

        let read = Message::request(MessageKind::ReadRequest, 1, "k", "");
        assert_eq!(chain.process_read(&read), Err(StoreError::NoQuorumAvailable));
        let write = Message::request(MessageKind::WriteRequest, 1, "k", "v");
        assert_eq!(
            chain.process_write(&write),
            Err(StoreError::NoQuorumAvailable)
        );
    }

    #[test]
    fn single_node_chain_is_head_and_tail() {
        let (core, _net) = core_with_net(1, &[1]);
        let chain = ChainReplication::new(core.clone(), vec![1]);
        assert!(chain.is_head());
        assert!(chain.is_tail());

        let write = Message::request(MessageKind::WriteRequest, 1, "k", "v");
        let response = chain.process_write(&write).unwrap();
        assert!(response.success);
        // Applied locally, nothing forwarded, nothing pending.
        assert_eq!(core.store.read("k"), Some("v".to_string()));
        assert_eq!(chain.pending_count(), 0);

        let read = Message::request(MessageKind::ReadRequest, 1, "k", "");
        let response = chain.process_read(&read).unwrap();
        assert!(response.success);
        assert_eq!(response.value, "v");
    }

    #[test]
    fn tail_read_misses_with_key_not_found() {
        let (core, _net) = core_with_net(3, &[1, 2, 3]);
        let chain = ChainReplication::new(core, vec![1, 2, 3]);
        let read = Message::request(MessageKind::ReadRequest, 3, "missing", "");
        assert_eq!(chain.process_read(&read), Err(StoreError::KeyNotFound));
    }

    #[test]
    fn head_write_forwards_to_successor_and_tracks_pending() {
        let (core, mut net) = core_with_net(1, &[1, 2, 3]);
        let ep2 = net.endpoint(2).unwrap();
        let chain = ChainReplication::new(core.clone(), vec![1, 2, 3]);

        let write = Message::request(MessageKind::WriteRequest, 1, "k", "v");
        let response = chain.process_write(&write).unwrap();
        assert!(response.success);
        assert_eq!(core.store.read("k"), Some("v".to_string()));
        assert_eq!(chain.pending_count(), 1);

        let wire = ep2.recv_timeout(Duration::from_millis(100)).unwrap();
        let forwarded = Message::decode(&wire).unwrap();
        assert_eq!(forwarded.kind, MessageKind::ChainForward);
        assert_eq!(forwarded.sequence_number, response.sequence_number);
        assert_eq!(forwarded.value, "v");

        // Ack clears the pending entry.
        let mut ack = Message::new(MessageKind::ChainAck, 3);
        ack.sequence_number = response.sequence_number;
        chain.handle_ack(&ack);
        assert_eq!(chain.pending_count(), 0);
    }

    #[test]
    fn non_head_forwards_writes_to_head() {
        let (core, mut net) = core_with_net(2, &[1, 2, 3]);
        let ep1 = net.endpoint(1).unwrap();
        let chain = ChainReplication::new(core, vec![1, 2, 3]);

        let write = Message::request(MessageKind::WriteRequest, 2, "k", "v");
        let response = chain.process_write(&write).unwrap();
        assert!(response.success);

        let wire = ep1.recv_timeout(Duration::from_millis(100)).unwrap();
        let forwarded = Message::decode(&wire).unwrap();
        assert_eq!(forwarded.kind, MessageKind::WriteRequest);
        assert_eq!(forwarded.key, "k");
    }

    #[test]
    fn failed_successor_rewires_pending_writes() {
        let (core, mut net) = core_with_net(1, &[1, 2, 3]);
        let _ep2 = net.endpoint(2).unwrap();
        let ep3 = net.endpoint(3).unwrap();
        let chain = ChainReplication::new(core, vec![1, 2, 3]);

        let write = Message::request(MessageKind::WriteRequest, 1, "k", "v");
        let response = chain.process_write(&write).unwrap();
        assert_eq!(chain.successor(), Some(2));

        chain.handle_node_failure(2);
        assert_eq!(chain.chain_order(), vec![1, 3]);
        assert_eq!(chain.successor(), Some(3));

        // The in-flight write was re-forwarded to the new successor.
        let wire = ep3.recv_timeout(Duration::from_millis(100)).unwrap();
        let reforwarded = Message::decode(&wire).unwrap();
        assert_eq!(reforwarded.kind, MessageKind::ChainForward);
        assert_eq!(reforwarded.sequence_number, response.sequence_number);
        assert_eq!(chain.pending_count(), 1);
    }

    #[test]
    fn tail_failure_promotes_new_tail() {
        let (core, _net) = core_with_net(2, &[1, 2, 3]);
        let chain = ChainReplication::new(core, vec![1, 2, 3]);
        assert!(!chain.is_tail());
        chain.handle_node_failure(3);
        assert!(chain.is_tail());
        assert_eq!(chain.chain_order(), vec![1, 2]);
    }

    #[test]
    fn recovery_appends_to_chain() {
        let (core, _net) = core_with_net(1, &[1, 2, 3]);
        let chain = ChainReplication::new(core, vec![1, 2]);
        chain.handle_node_recovery(3);
        assert_eq!(chain.chain_order(), vec![1, 2, 3]);
        // Idempotent.
        chain.handle_node_recovery(3);
        assert_eq!(chain.chain_order(), vec![1, 2, 3]);
    }

    #[test]
    fn batch_flushes_at_capacity() {
        let (core, mut net) = core_with_net(1, &[1, 2]);
        let ep2 = net.endpoint(2).unwrap();
        let chain = ChainReplication::new(core.clone(), vec![1, 2]);
        chain.enable_batching(true);

        for i in 0..DEFAULT_BATCH_SIZE {
            let write =
                Message::request(MessageKind::WriteRequest, 1, &format!("k{i}"), &format!("v{i}"));
            let response = chain.process_write(&write).unwrap();
            assert!(response.success);
        }

        // Batch hit capacity and flushed: all writes applied and forwarded.
        assert_eq!(core.store.len(), DEFAULT_BATCH_SIZE);
        let mut forwarded = 0;
        while ep2.recv_timeout(Duration::from_millis(50)).is_some() {
            forwarded += 1;
        }
        assert_eq!(forwarded, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn stale_batch_flushes_on_tick() {
        let (core, _net) = core_with_net(1, &[1]);
        let chain = ChainReplication::new(core.clone(), vec![1]);
        chain.enable_batching(true);

        let write = Message::request(MessageKind::WriteRequest, 1, "k", "v");
        chain.process_write(&write).unwrap();
        assert_eq!(core.store.read("k"), None);

        std::thread::sleep(BATCH_TIMEOUT + Duration::from_millis(5));
        chain.maybe_flush_batch();
        assert_eq!(core.store.read("k"), Some("v".to_string()));
    }

    #[test]
    fn expired_pending_writes_are_dropped() {
        let (core, mut net) = core_with_net(1, &[1, 2]);
        let _ep2 = net.endpoint(2).unwrap();
        let chain = ChainReplication::new(core, vec![1, 2]);

        let write = Message::request(MessageKind::WriteRequest, 1, "k", "v");
        chain.process_write(&write).unwrap();
        assert_eq!(chain.pending_count(), 1);

        chain.expire_pending(Duration::from_millis(0));
        assert_eq!(chain.pending_count(), 0);
        assert_eq!(chain.timed_out_writes(), 1);
    }
}
