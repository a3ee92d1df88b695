use bytes::Bytes;

use norn_types::{MsgType, ReturnCode};

/// Messages crossing the network seam. Variants carry exactly what the wire
/// protocol would: forwarding a value, forwarding a subspace handoff,
/// acknowledging a version, or answering a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ChainPut {
        version: u64,
        fresh: bool,
        key: Bytes,
        value: Vec<Bytes>,
    },
    ChainDel {
        version: u64,
        key: Bytes,
    },
    /// The old-subspace tail handing a relocated key to the new location.
    /// `next_point` tells the receiver where the op goes after its own chain.
    ChainSubspace {
        version: u64,
        key: Bytes,
        value: Vec<Bytes>,
        next_point: u64,
    },
    ChainAck {
        version: u64,
        key: Bytes,
    },
    /// Client-bound response; `msgtype` echoes the opcode of the request.
    Response {
        msgtype: MsgType,
        nonce: u64,
        result: ReturnCode,
    },
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::ChainPut { .. } => MsgType::ChainPut,
            Message::ChainDel { .. } => MsgType::ChainDel,
            Message::ChainSubspace { .. } => MsgType::ChainSubspace,
            Message::ChainAck { .. } => MsgType::ChainAck,
            Message::Response { msgtype, .. } => *msgtype,
        }
    }
}
