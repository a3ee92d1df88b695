use bytes::Bytes;

use norn_storage::DiskRef;
use norn_types::{EntityId, Instance, MsgType, RegionId, SubspaceId};

use crate::placement::Placement;

/// The chain peer a version was received from or forwarded to, with the
/// instance that was bound to the entity at the time. A peer whose entity
/// has since moved to a different instance is presumed to have lost the
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub entity: EntityId,
    pub instance: Option<Instance>,
}

/// Where a locally-originated version came from; cleared once the client has
/// been answered so that a duplicate ack cannot answer twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOrigin {
    pub region: RegionId,
    pub client: EntityId,
    pub nonce: u64,
}

/// One in-flight version of a key.
#[derive(Debug, Clone)]
pub struct Pending {
    /// `false` for deletions; the value then preserves the prior attributes
    /// so downstream placement can still be computed against them.
    pub has_value: bool,
    pub key: Bytes,
    pub value: Vec<Bytes>,
    /// First write of a brand-new key; no predecessor version is expected.
    pub fresh: bool,
    /// The forward chain has acknowledged this version.
    pub acked: bool,
    pub subspace_prev: Option<SubspaceId>,
    pub subspace_next: Option<SubspaceId>,
    pub point_prev: u64,
    pub point_this: u64,
    pub point_next: u64,
    /// Only used while handing a key across subspaces: where the op goes
    /// after the receiving chain.
    pub point_next_next: u64,
    /// Who delivered this version to us; none for point-leader originals.
    pub recv: Option<Peer>,
    /// Who we last forwarded it to; empty until the first send.
    pub sent: Option<Peer>,
    pub co: Option<ClientOrigin>,
    /// Opcode echoed in the client response.
    pub retcode: MsgType,
    /// Pins the old on-disk value until this version commits.
    pub pin: DiskRef,
}

impl Pending {
    pub fn new(has_value: bool, key: Bytes, value: Vec<Bytes>) -> Self {
        Pending {
            has_value,
            key,
            value,
            fresh: false,
            acked: false,
            subspace_prev: None,
            subspace_next: None,
            point_prev: 0,
            point_this: 0,
            point_next: 0,
            point_next_next: 0,
            recv: None,
            sent: None,
            co: None,
            retcode: MsgType::RespAtomic,
            pin: DiskRef::none(),
        }
    }

    pub fn set_placement(&mut self, placement: Placement) {
        self.subspace_prev = placement.subspace_prev;
        self.subspace_next = placement.subspace_next;
        self.point_prev = placement.point_prev;
        self.point_this = placement.point_this;
        self.point_next = placement.point_next;
        self.point_next_next = placement.point_next_next;
    }
}

/// A received update whose predecessor version has not arrived yet. Holds
/// only what is needed to rebuild a `Pending` once the gap closes.
#[derive(Debug, Clone)]
pub struct Deferred {
    pub has_value: bool,
    pub key: Bytes,
    pub value: Vec<Bytes>,
    pub from: EntityId,
    pub pin: DiskRef,
}
