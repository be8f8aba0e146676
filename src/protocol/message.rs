//! Message model: the typed envelope for all inter-node traffic and its
//! wire codec.
//!
//! The wire format is a `|`-delimited text encoding with fields in struct
//! declaration order. `kind` is encoded as its ordinal in the declared
//! enumeration order, `target_nodes` as comma-separated decimal ids. No
//! field may contain `|`; empty fields encode as empty strings. Decoding is
//! result-typed: malformed input yields `StoreError::InvalidMessage`, never
//! a panic.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StoreError;

/// Cluster-wide node identifier. Zero is reserved (never a valid node).
pub type NodeId = u32;

/// Closed enumeration of message kinds. Wire ordinals follow declaration
/// order; do not reorder variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ReadRequest,
    ReadResponse,
    WriteRequest,
    WriteResponse,
    Heartbeat,
    NodeFailure,
    NodeRecovery,
    ChainUpdate,
    ChainForward,
    ChainAck,
    QuorumPrepare,
    QuorumPromise,
    QuorumAccept,
    QuorumAccepted,
    QuorumCommit,
    QuorumAbort,
    ModeSwitch,
    CacheUpdate,
    BatchRequest,
    BatchResponse,
}

impl MessageKind {
    const ALL: [MessageKind; 20] = [
        MessageKind::ReadRequest,
        MessageKind::ReadResponse,
        MessageKind::WriteRequest,
        MessageKind::WriteResponse,
        MessageKind::Heartbeat,
        MessageKind::NodeFailure,
        MessageKind::NodeRecovery,
        MessageKind::ChainUpdate,
        MessageKind::ChainForward,
        MessageKind::ChainAck,
        MessageKind::QuorumPrepare,
        MessageKind::QuorumPromise,
        MessageKind::QuorumAccept,
        MessageKind::QuorumAccepted,
        MessageKind::QuorumCommit,
        MessageKind::QuorumAbort,
        MessageKind::ModeSwitch,
        MessageKind::CacheUpdate,
        MessageKind::BatchRequest,
        MessageKind::BatchResponse,
    ];

    /// Wire ordinal of this kind.
    pub fn ordinal(self) -> u8 {
        Self::ALL.iter().position(|&k| k == self).unwrap_or(0) as u8
    }

    /// Inverse of [`MessageKind::ordinal`].
    pub fn from_ordinal(ordinal: u8) -> Option<MessageKind> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// True for read-shaped traffic.
    pub fn is_read(self) -> bool {
        matches!(self, MessageKind::ReadRequest | MessageKind::ReadResponse)
    }

    /// True for write-shaped traffic.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            MessageKind::WriteRequest | MessageKind::WriteResponse | MessageKind::ChainForward
        )
    }
}

/// Which coordination protocol serves an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    ChainOnly,
    QuorumOnly,
    HybridAuto,
}

impl ReplicationMode {
    /// Ordinal used in metrics export.
    pub fn ordinal(self) -> u8 {
        match self {
            ReplicationMode::ChainOnly => 0,
            ReplicationMode::QuorumOnly => 1,
            ReplicationMode::HybridAuto => 2,
        }
    }
}

/// Tagged envelope for all inter-node traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub key: String,
    pub value: String,
    pub success: bool,
    /// Microseconds since the Unix epoch, stamped at construction.
    pub timestamp_us: u64,
    /// Chain sequence number or quorum proposal number, depending on kind.
    pub sequence_number: u64,
    pub correlation_id: String,
    /// Ordered node ids; order is preserved across the wire.
    pub target_nodes: Vec<NodeId>,
    /// Opaque carrier, e.g. a failure kind on a non-success response.
    pub metadata: String,
}

/// Current wall clock in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Message {
    /// New message of the given kind, stamped with the current time.
    pub fn new(kind: MessageKind, sender: NodeId) -> Message {
        Message {
            kind,
            sender,
            receiver: 0,
            key: String::new(),
            value: String::new(),
            success: false,
            timestamp_us: now_micros(),
            sequence_number: 0,
            correlation_id: String::new(),
            target_nodes: Vec::new(),
            metadata: String::new(),
        }
    }

    /// Request envelope carrying a key (and value for writes).
    pub fn request(kind: MessageKind, sender: NodeId, key: &str, value: &str) -> Message {
        let mut msg = Message::new(kind, sender);
        msg.key = key.to_string();
        msg.value = value.to_string();
        msg
    }

    /// Response envelope mirroring a request's key, sequence number and
    /// correlation id.
    pub fn response(kind: MessageKind, sender: NodeId, request: &Message) -> Message {
        let mut msg = Message::new(kind, sender);
        msg.receiver = request.sender;
        msg.key = request.key.clone();
        msg.sequence_number = request.sequence_number;
        msg.correlation_id = request.correlation_id.clone();
        msg
    }

    /// Non-success response carrying the failure kind in `metadata`.
    pub fn failure(kind: MessageKind, sender: NodeId, request: &Message, err: &StoreError) -> Message {
        let mut msg = Message::response(kind, sender, request);
        msg.success = false;
        msg.metadata = err.kind().to_string();
        msg
    }

    /// Encode to the delimited wire form.
    pub fn encode(&self) -> String {
        let targets = self
            .target_nodes
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.kind.ordinal(),
            self.sender,
            self.receiver,
            self.key,
            self.value,
            if self.success { "1" } else { "0" },
            self.timestamp_us,
            self.sequence_number,
            self.correlation_id,
            targets,
            self.metadata,
        )
    }

    /// Decode from the delimited wire form.
    pub fn decode(data: &str) -> Result<Message, StoreError> {
        let fields: Vec<&str> = data.split('|').collect();
        if fields.len() != 11 {
            return Err(StoreError::InvalidMessage(format!(
                "expected 11 fields, got {}",
                fields.len()
            )));
        }

        let ordinal: u8 = parse_field(fields[0], "kind")?;
        let kind = MessageKind::from_ordinal(ordinal)
            .ok_or_else(|| StoreError::InvalidMessage(format!("unknown kind ordinal {ordinal}")))?;

        let success = match fields[5] {
            "1" => true,
            "0" => false,
            other => {
                return Err(StoreError::InvalidMessage(format!(
                    "bad success flag {other:?}"
                )))
            }
        };

        let mut target_nodes = Vec::new();
        if !fields[9].is_empty() {
            for part in fields[9].split(',') {
                target_nodes.push(parse_field(part, "target_nodes")?);
            }
        }

        Ok(Message {
            kind,
            sender: parse_field(fields[1], "sender")?,
            receiver: parse_field(fields[2], "receiver")?,
            key: fields[3].to_string(),
            value: fields[4].to_string(),
            success,
            timestamp_us: parse_field(fields[6], "timestamp_us")?,
            sequence_number: parse_field(fields[7], "sequence_number")?,
            correlation_id: fields[8].to_string(),
            target_nodes,
            metadata: fields[10].to_string(),
        })
    }
}

fn parse_field<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::InvalidMessage(format!("bad {name} field {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut msg = Message::request(MessageKind::WriteRequest, 3, "user:42", "alice");
        msg.receiver = 1;
        msg.success = true;
        msg.sequence_number = 99;
        msg.correlation_id = "op-17".to_string();
        msg.target_nodes = vec![5, 2, 9];
        msg.metadata = "hint".to_string();
        msg
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let msg = sample();
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_preserves_target_node_order() {
        let mut msg = Message::new(MessageKind::ChainUpdate, 1);
        msg.target_nodes = vec![9, 1, 4, 4, 2];
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.target_nodes, vec![9, 1, 4, 4, 2]);
    }

    #[test]
    fn empty_fields_encode_as_empty_strings() {
        let msg = Message::new(MessageKind::Heartbeat, 2);
        let wire = msg.encode();
        assert!(wire.contains("||"));
        assert_eq!(Message::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert!(matches!(
            Message::decode("definitely-not-a-message"),
            Err(StoreError::InvalidMessage(_))
        ));
        // Wrong field count.
        assert!(Message::decode("0|1|2|k|v|1|0|0|c").is_err());
        // Non-numeric sender.
        assert!(Message::decode("0|abc|2|k|v|1|0|0|c||").is_err());
        // Out-of-range kind ordinal.
        assert!(Message::decode("42|1|2|k|v|1|0|0|c||").is_err());
        // Bad success flag.
        assert!(Message::decode("0|1|2|k|v|yes|0|0|c||").is_err());
    }

    #[test]
    fn kind_ordinals_follow_declaration_order() {
        assert_eq!(MessageKind::ReadRequest.ordinal(), 0);
        assert_eq!(MessageKind::ChainForward.ordinal(), 8);
        assert_eq!(MessageKind::QuorumPrepare.ordinal(), 10);
        assert_eq!(MessageKind::BatchResponse.ordinal(), 19);
        for ordinal in 0..20 {
            let kind = MessageKind::from_ordinal(ordinal).unwrap();
            assert_eq!(kind.ordinal(), ordinal);
        }
        assert!(MessageKind::from_ordinal(20).is_none());
    }
}
