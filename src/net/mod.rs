//! In-process cluster transport.
//!
//! Connects nodes through crossbeam channels carrying encoded message
//! payloads. Per-pair connection flags let tests partition and heal the
//! network. Reliability, batching and compression policies are orthogonal
//! tunables that live outside the replication core.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::StoreError;
use crate::protocol::message::NodeId;

/// A transport endpoint for a single node.
pub struct Endpoint {
    pub node_id: NodeId,
    rx: Receiver<String>,
    tx_map: HashMap<NodeId, Sender<String>>,
    connected: HashMap<NodeId, Arc<AtomicBool>>,
}

impl Endpoint {
    /// Deliver an encoded message to a specific peer.
    pub fn send_to(&self, target: NodeId, payload: String) -> Result<(), StoreError> {
        if let Some(flag) = self.connected.get(&target) {
            if !flag.load(Ordering::SeqCst) {
                return Err(StoreError::Unreachable(target));
            }
        }
        match self.tx_map.get(&target) {
            Some(tx) => tx
                .send(payload)
                .map_err(|_| StoreError::Unreachable(target)),
            None => Err(StoreError::Unreachable(target)),
        }
    }

    /// Deliver to every reachable peer. Returns how many sends succeeded.
    pub fn broadcast(&self, payload: &str) -> usize {
        let mut delivered = 0;
        for &target in self.tx_map.keys() {
            if self.send_to(target, payload.to_string()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn try_recv(&self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Ids of every peer this endpoint can address.
    pub fn peers(&self) -> Vec<NodeId> {
        self.tx_map.keys().copied().collect()
    }
}

/// Builder connecting a set of nodes with pairwise links.
pub struct ClusterNet {
    senders: HashMap<NodeId, Sender<String>>,
    receivers: HashMap<NodeId, Receiver<String>>,
    links: HashMap<(NodeId, NodeId), Arc<AtomicBool>>,
}

impl ClusterNet {
    pub fn new(node_ids: &[NodeId]) -> ClusterNet {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        let mut links = HashMap::new();

        for &id in node_ids {
            let (tx, rx) = unbounded();
            senders.insert(id, tx);
            receivers.insert(id, rx);
        }
        for &from in node_ids {
            for &to in node_ids {
                if from != to {
                    links.insert((from, to), Arc::new(AtomicBool::new(true)));
                }
            }
        }

        ClusterNet {
            senders,
            receivers,
            links,
        }
    }

    /// Take the endpoint for a node. Consumes the node's receiver, so each
    /// id yields an endpoint at most once.
    pub fn endpoint(&mut self, node_id: NodeId) -> Option<Endpoint> {
        let rx = self.receivers.remove(&node_id)?;

        let mut tx_map = HashMap::new();
        for (&id, tx) in &self.senders {
            if id != node_id {
                tx_map.insert(id, tx.clone());
            }
        }

        let mut connected = HashMap::new();
        for (&(from, to), flag) in &self.links {
            if from == node_id {
                connected.insert(to, flag.clone());
            }
        }

        Some(Endpoint {
            node_id,
            rx,
            tx_map,
            connected,
        })
    }

    /// Sever all links to and from a node.
    pub fn disconnect(&self, node_id: NodeId) {
        for (&(from, to), flag) in &self.links {
            if from == node_id || to == node_id {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Restore all links to and from a node.
    pub fn reconnect(&self, node_id: NodeId) {
        for (&(from, to), flag) in &self.links {
            if from == node_id || to == node_id {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.links
            .get(&(from, to))
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Drop a payload straight into a node's inbox, bypassing link flags.
    /// Lets harnesses exercise the façade with arbitrary (including
    /// malformed) traffic.
    pub fn inject(&self, target: NodeId, payload: String) -> bool {
        self.senders
            .get(&target)
            .map(|tx| tx.send(payload).is_ok())
            .unwrap_or(false)
    }
}

/// Peer liveness bookkeeping driven by heartbeats.
///
/// Any inbound message counts as a sign of life. A peer missing for
/// `stale_after` is reported failed exactly once; the first message after
/// that reports a recovery.
pub struct Liveness {
    state: Mutex<LivenessState>,
    stale_after: Duration,
}

struct LivenessState {
    last_seen: HashMap<NodeId, Instant>,
    failed: HashSet<NodeId>,
}

impl Liveness {
    pub fn new(peers: &[NodeId], stale_after: Duration) -> Liveness {
        let now = Instant::now();
        Liveness {
            state: Mutex::new(LivenessState {
                last_seen: peers.iter().map(|&id| (id, now)).collect(),
                failed: HashSet::new(),
            }),
            stale_after,
        }
    }

    /// Record a sign of life. Returns true if this marks a recovery.
    pub fn observe(&self, peer: NodeId) -> bool {
        let mut state = self.state.lock().unwrap();
        state.last_seen.insert(peer, Instant::now());
        state.failed.remove(&peer)
    }

    /// Peers that crossed the staleness threshold since the last check.
    pub fn newly_failed(&self) -> Vec<NodeId> {
        let mut state = self.state.lock().unwrap();
        let mut failed = Vec::new();
        let stale_after = self.stale_after;
        let stale: Vec<NodeId> = state
            .last_seen
            .iter()
            .filter(|(id, seen)| seen.elapsed() > stale_after && !state.failed.contains(id))
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            state.failed.insert(id);
            failed.push(id);
        }
        failed
    }

    pub fn is_failed(&self, peer: NodeId) -> bool {
        self.state.lock().unwrap().failed.contains(&peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_receive() {
        let mut net = ClusterNet::new(&[1, 2, 3]);
        let ep1 = net.endpoint(1).unwrap();
        let ep2 = net.endpoint(2).unwrap();

        ep1.send_to(2, "hello".to_string()).unwrap();
        assert_eq!(
            ep2.recv_timeout(Duration::from_millis(100)),
            Some("hello".to_string())
        );
    }

    #[test]
    fn disconnect_makes_peer_unreachable() {
        let mut net = ClusterNet::new(&[1, 2]);
        let ep1 = net.endpoint(1).unwrap();
        let ep2 = net.endpoint(2).unwrap();

        net.disconnect(2);
        assert!(matches!(
            ep1.send_to(2, "x".to_string()),
            Err(StoreError::Unreachable(2))
        ));
        assert!(!net.is_connected(1, 2));

        net.reconnect(2);
        ep1.send_to(2, "y".to_string()).unwrap();
        assert_eq!(
            ep2.recv_timeout(Duration::from_millis(100)),
            Some("y".to_string())
        );
    }

    #[test]
    fn broadcast_skips_disconnected_peers() {
        let mut net = ClusterNet::new(&[1, 2, 3]);
        let ep1 = net.endpoint(1).unwrap();
        let _ep2 = net.endpoint(2).unwrap();
        let _ep3 = net.endpoint(3).unwrap();

        assert_eq!(ep1.broadcast("ping"), 2);
        net.disconnect(3);
        assert_eq!(ep1.broadcast("ping"), 1);
    }

    #[test]
    fn endpoint_taken_once() {
        let mut net = ClusterNet::new(&[1]);
        assert!(net.endpoint(1).is_some());
        assert!(net.endpoint(1).is_none());
    }

    #[test]
    fn liveness_reports_failure_once_then_recovery() {
        let liveness = Liveness::new(&[7], Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(liveness.newly_failed(), vec![7]);
        assert!(liveness.is_failed(7));
        // Already reported; not reported again.
        assert!(liveness.newly_failed().is_empty());

        assert!(liveness.observe(7));
        assert!(!liveness.is_failed(7));
    }
}
