use std::future::Future;

use bytes::Bytes;

use norn_types::{EntityId, RegionId};

use crate::message::Message;

/// Reliable point-to-point delivery keyed by logical entity id. `send`
/// returns whether the message was accepted for delivery; callers treat
/// `false` as "try again from the retransmit pass".
pub trait Network: Send + Sync + 'static {
    fn send(
        &self,
        from: EntityId,
        to: EntityId,
        msg: Message,
    ) -> impl Future<Output = bool> + Send;
}

/// The configuration service's callback surface: the replication core tells
/// it when all replication state has drained under a quiesce request.
pub trait Coordinator: Send + Sync + 'static {
    fn quiesced(&self, state_id: &str) -> impl Future<Output = ()> + Send;
}

/// Collects `(region, key, version)` handoff triggers for the state-transfer
/// subsystem as acks pass through.
pub trait TransferTriggers: Send + Sync + 'static {
    fn add_trigger(&self, region: RegionId, key: &Bytes, version: u64);
}
