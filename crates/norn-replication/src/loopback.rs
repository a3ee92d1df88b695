use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use norn_cluster::ClusterMap;
use norn_storage::DataLayer;
use norn_types::{EntityId, Instance, RegionId};

use crate::manager::ReplicationManager;
use crate::message::Message;
use crate::traits::{Coordinator, Network, TransferTriggers};

/// One delivered message, with its addressing preserved.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: EntityId,
    pub to: EntityId,
    pub msg: Message,
}

/// In-process message router: every registered instance (and client) owns a
/// mailbox, and `send` resolves the destination entity through the current
/// cluster map. Used by tests and the single-process node binary.
pub struct LoopbackNetwork {
    config: RwLock<Arc<ClusterMap>>,
    instances: Mutex<HashMap<Instance, mpsc::UnboundedSender<Envelope>>>,
    clients: Mutex<HashMap<EntityId, mpsc::UnboundedSender<Envelope>>>,
}

impl LoopbackNetwork {
    pub fn new(config: Arc<ClusterMap>) -> Arc<Self> {
        Arc::new(LoopbackNetwork {
            config: RwLock::new(config),
            instances: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Swap in a new cluster map for routing (mirrors `reconfigure`).
    pub fn set_config(&self, config: Arc<ClusterMap>) {
        *self.config.write() = config;
    }

    /// Open the mailbox for a daemon instance.
    pub fn register_instance(&self, instance: Instance) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.instances.lock().insert(instance, tx);
        rx
    }

    /// Open a mailbox routed by entity id directly; clients are not part
    /// of the cluster map.
    pub fn register_client(&self, entity: EntityId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.lock().insert(entity, tx);
        rx
    }
}

impl Network for LoopbackNetwork {
    async fn send(&self, from: EntityId, to: EntityId, msg: Message) -> bool {
        if let Some(tx) = self.clients.lock().get(&to) {
            return tx.send(Envelope { from, to, msg }).is_ok();
        }

        let config = self.config.read().clone();
        let Some(instance) = config.instance_for(&to) else {
            return false;
        };

        match self.instances.lock().get(&instance) {
            Some(tx) => tx.send(Envelope { from, to, msg }).is_ok(),
            None => false,
        }
    }
}

/// Drain one instance's mailbox into its manager, one message at a time.
pub fn spawn_dispatch<D, N, C, T>(
    manager: Arc<ReplicationManager<D, N, C, T>>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) -> JoinHandle<()>
where
    D: DataLayer,
    N: Network,
    C: Coordinator,
    T: TransferTriggers,
{
    tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            manager.deliver(env.from, env.to, env.msg).await;
        }
    })
}

/// Test double that records every send instead of delivering it. Whether
/// sends report success is switchable, to exercise the retransmit path.
#[derive(Default)]
pub struct RecordingNetwork {
    sent: Mutex<Vec<Envelope>>,
    reject: AtomicBool,
}

impl RecordingNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingNetwork::default())
    }

    /// Make subsequent sends report failure.
    pub fn reject_sends(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Network for RecordingNetwork {
    async fn send(&self, from: EntityId, to: EntityId, msg: Message) -> bool {
        if self.reject.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().push(Envelope { from, to, msg });
        true
    }
}

/// Coordinator that forwards quiesced notifications over a channel.
pub struct ChannelCoordinator {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelCoordinator {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelCoordinator { tx }), rx)
    }
}

impl Coordinator for ChannelCoordinator {
    async fn quiesced(&self, state_id: &str) {
        let _ = self.tx.send(state_id.to_string());
    }
}

/// Records handoff triggers for assertions.
#[derive(Default)]
pub struct RecordingTransfers {
    triggers: Mutex<Vec<(RegionId, Bytes, u64)>>,
}

impl RecordingTransfers {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingTransfers::default())
    }

    pub fn take(&self) -> Vec<(RegionId, Bytes, u64)> {
        std::mem::take(&mut *self.triggers.lock())
    }
}

impl TransferTriggers for RecordingTransfers {
    fn add_trigger(&self, region: RegionId, key: &Bytes, version: u64) {
        self.triggers.lock().push((region, key.clone(), version));
    }
}

/// Discards handoff triggers; for deployments without state transfer.
#[derive(Default)]
pub struct NullTransfers;

impl NullTransfers {
    pub fn new() -> Arc<Self> {
        Arc::new(NullTransfers)
    }
}

impl TransferTriggers for NullTransfers {
    fn add_trigger(&self, _region: RegionId, _key: &Bytes, _version: u64) {}
}
