use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use norn_cluster::ClusterMap;
use norn_storage::{DataCode, DataLayer, DiskRef, GetOutcome};
use norn_types::{EntityId, Instance, MsgType, RegionId, ReturnCode};
use norn_values::{apply_checks_and_ops, validate_as_type, MicroCheck, MicroError, MicroOp};

use crate::keyholder::{KeyHolder, KeyPair};
use crate::locks::StripedKeyLocks;
use crate::message::Message;
use crate::pending::{ClientOrigin, Deferred, Peer, Pending};
use crate::placement::prev_and_next;
use crate::table::KeyHolderTable;
use crate::traits::{Coordinator, Network, TransferTriggers};

/// Cadence of the retransmit pass.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(250);

/// The most recent known state of a key: newest blocked op, else newest
/// committable op, else whatever disk has.
struct Latest {
    version: u64,
    has_value: bool,
    value: Vec<Bytes>,
    pin: DiskRef,
}

/// The per-key replication state machine for one daemon instance.
///
/// Client writes enter at the point-leader, become `Pending` versions, and
/// move blocked → committable → disk → acked, one forward chain message per
/// transition and one ack per commit. All transitions for a key run under
/// its stripe lock; the lock is held across storage and network awaits so a
/// key's state machine never interleaves.
pub struct ReplicationManager<D, N, C, T> {
    data: Arc<D>,
    network: Arc<N>,
    coordinator: Arc<C>,
    transfers: Arc<T>,
    config: RwLock<Arc<ClusterMap>>,
    us: RwLock<Instance>,
    locks: StripedKeyLocks,
    keyholders: KeyHolderTable,
    quiesce: AtomicBool,
    quiesce_state_id: Mutex<String>,
    shutdown: AtomicBool,
}

impl<D, N, C, T> ReplicationManager<D, N, C, T>
where
    D: DataLayer,
    N: Network,
    C: Coordinator,
    T: TransferTriggers,
{
    pub fn new(
        us: Instance,
        config: Arc<ClusterMap>,
        data: Arc<D>,
        network: Arc<N>,
        coordinator: Arc<C>,
        transfers: Arc<T>,
    ) -> Arc<Self> {
        let manager = Arc::new(ReplicationManager {
            data,
            network,
            coordinator,
            transfers,
            config: RwLock::new(config.clone()),
            us: RwLock::new(us),
            locks: StripedKeyLocks::with_default_striping(),
            keyholders: KeyHolderTable::new(),
            quiesce: AtomicBool::new(false),
            quiesce_state_id: Mutex::new(String::new()),
            shutdown: AtomicBool::new(false),
        });
        manager.install(config, us);
        manager
    }

    fn config(&self) -> Arc<ClusterMap> {
        self.config.read().clone()
    }

    fn us(&self) -> Instance {
        *self.us.read()
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiesce.load(Ordering::SeqCst)
    }

    fn install(&self, new_config: Arc<ClusterMap>, us: Instance) {
        if new_config.quiesce() {
            // Repeated quiesce requests may refresh the state id, but the
            // latch never reopens short of a restart.
            *self.quiesce_state_id.lock() = new_config.quiesce_state_id().to_string();
            self.quiesce.store(true, Ordering::SeqCst);
        }

        *self.config.write() = new_config.clone();
        *self.us.write() = us;
    }

    /// Install a new cluster map and identity, then drop the keyholders of
    /// regions this replica no longer hosts.
    pub fn reconfigure(&self, new_config: Arc<ClusterMap>, us: Instance) {
        self.install(new_config.clone(), us);
        self.keyholders.retain(|kp| new_config.in_region(us, &kp.region));
    }

    /// Stop the periodic retransmitter at its next wake.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Client entry points
    // -----------------------------------------------------------------------

    /// Read-modify-write on one key: evaluate `checks`, apply `ops`, enqueue
    /// the resulting version at the point-leader. The response is emitted
    /// when the forward chain acks (or immediately, on rejection).
    #[allow(clippy::too_many_arguments)]
    pub async fn client_atomic(
        &self,
        opcode: MsgType,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        checks: Vec<MicroCheck>,
        ops: Vec<MicroOp>,
        fail_if_not_found: bool,
        fail_if_found: bool,
    ) {
        if let Err(code) = self
            .client_atomic_inner(opcode, from, to, nonce, &key, &checks, &ops, fail_if_not_found, fail_if_found)
            .await
        {
            self.respond_to_client(to, from, nonce, opcode, code).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn client_atomic_inner(
        &self,
        opcode: MsgType,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: &Bytes,
        checks: &[MicroCheck],
        ops: &[MicroOp],
        fail_if_not_found: bool,
        fail_if_found: bool,
    ) -> Result<(), ReturnCode> {
        if self.quiesce.load(Ordering::SeqCst) {
            return Err(ReturnCode::ReadOnly);
        }

        let config = self.config();
        let schema = config.get_schema(to.space).ok_or(ReturnCode::ServerError)?.clone();

        if !validate_as_type(key, schema.key_type()) {
            return Err(ReturnCode::BadDimSpec);
        }

        if !config.is_point_leader(&to) {
            return Err(ReturnCode::NotUs);
        }

        let region = to.region();
        let _guard = self.locks.lock(&region, key).await;
        let kh = self.get_keyholder(&region, key);

        let latest = self
            .retrieve_latest(region, key, &kh)
            .await
            .ok_or(ReturnCode::ServerError)?;

        let fresh = !latest.has_value;

        if !latest.has_value && fail_if_not_found {
            return Err(ReturnCode::NotFound);
        }
        if latest.has_value && fail_if_found {
            return Err(ReturnCode::CmpFail);
        }

        let mut old_value = latest.value;
        if !old_value.is_empty() && old_value.len() != schema.value_arity() {
            // The stored object does not match the schema.
            return Err(ReturnCode::ServerError);
        }
        old_value.resize(schema.value_arity(), Bytes::new());

        let applied = apply_checks_and_ops(&schema, checks, ops, &old_value);
        if applied.passed != checks.len() + ops.len() {
            return Err(if applied.error == Some(MicroError::Overflow) {
                ReturnCode::Overflow
            } else {
                ReturnCode::CmpFail
            });
        }

        let placement = prev_and_next(
            &config,
            region,
            key,
            Some(&applied.value[..]),
            latest.has_value.then_some(&old_value[..]),
        )
        .ok_or(ReturnCode::NotUs)?;

        let mut pend = Pending::new(true, key.clone(), applied.value);
        pend.retcode = opcode;
        pend.pin = latest.pin;
        pend.fresh = fresh;
        pend.co = Some(ClientOrigin { region, client: from, nonce });
        pend.set_placement(placement);

        // The point-leader only ever creates contiguous versions, so nothing
        // can be waiting on a predecessor here.
        debug_assert!(!kh.has_deferred_ops());
        kh.append_blocked(latest.version + 1, pend);
        self.move_operations_between_queues(to, key, &kh).await;
        Ok(())
    }

    /// Delete one key at the point-leader, preserving the prior value so the
    /// chain can still compute placement against it.
    pub async fn client_del(
        &self,
        opcode: MsgType,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        checks: Vec<MicroCheck>,
    ) {
        if let Err(code) = self.client_del_inner(opcode, from, to, nonce, &key, &checks).await {
            self.respond_to_client(to, from, nonce, opcode, code).await;
        }
    }

    async fn client_del_inner(
        &self,
        opcode: MsgType,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: &Bytes,
        checks: &[MicroCheck],
    ) -> Result<(), ReturnCode> {
        if self.quiesce.load(Ordering::SeqCst) {
            return Err(ReturnCode::ReadOnly);
        }

        let config = self.config();
        let schema = config.get_schema(to.space).ok_or(ReturnCode::ServerError)?.clone();

        if !validate_as_type(key, schema.key_type()) {
            return Err(ReturnCode::BadDimSpec);
        }

        if !config.is_point_leader(&to) {
            return Err(ReturnCode::NotUs);
        }

        let region = to.region();
        let _guard = self.locks.lock(&region, key).await;
        let kh = self.get_keyholder(&region, key);

        let latest = self
            .retrieve_latest(region, key, &kh)
            .await
            .ok_or(ReturnCode::ServerError)?;

        if !latest.has_value {
            return Err(ReturnCode::NotFound);
        }

        let mut old_value = latest.value;
        if !old_value.is_empty() && old_value.len() != schema.value_arity() {
            return Err(ReturnCode::ServerError);
        }
        old_value.resize(schema.value_arity(), Bytes::new());

        let applied = apply_checks_and_ops(&schema, checks, &[], &old_value);
        if applied.passed != checks.len() {
            return Err(if applied.error == Some(MicroError::Overflow) {
                ReturnCode::Overflow
            } else {
                ReturnCode::CmpFail
            });
        }

        let placement = prev_and_next(&config, region, key, None, Some(&old_value[..]))
            .ok_or(ReturnCode::NotUs)?;

        let mut pend = Pending::new(false, key.clone(), old_value);
        pend.retcode = opcode;
        pend.pin = latest.pin;
        pend.co = Some(ClientOrigin { region, client: from, nonce });
        pend.set_placement(placement);

        debug_assert!(!kh.has_deferred_ops());
        kh.append_blocked(latest.version + 1, pend);
        self.move_operations_between_queues(to, key, &kh).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chain message handlers
    // -----------------------------------------------------------------------

    pub async fn chain_put(
        &self,
        from: EntityId,
        to: EntityId,
        version: u64,
        fresh: bool,
        key: Bytes,
        value: Vec<Bytes>,
    ) {
        self.chain_common(true, from, to, version, fresh, key, value).await;
    }

    pub async fn chain_del(&self, from: EntityId, to: EntityId, version: u64, key: Bytes) {
        self.chain_common(false, from, to, version, false, key, Vec::new()).await;
    }

    async fn chain_common(
        &self,
        has_value: bool,
        from: EntityId,
        to: EntityId,
        version: u64,
        fresh: bool,
        key: Bytes,
        value: Vec<Bytes>,
    ) {
        let region = to.region();
        let _guard = self.locks.lock(&region, &key).await;
        let kh = self.get_keyholder(&region, &key);
        let config = self.config();

        let Some(schema) = config.get_schema(to.space) else {
            info!(space = to.space, "dropping chain message for an unknown space");
            return;
        };

        if has_value && schema.attrs.len() != value.len() + 1 {
            info!("dropping chain message because the dimensions are incorrect");
            return;
        }

        // Already have this version: refresh the sender and re-ack.
        if kh.get_by_version(version).is_some() {
            kh.set_recv(version, Peer { entity: from, instance: config.instance_for(&from) });
            self.send_ack(to, from, version, &key).await;
            return;
        }

        let (old_version, has_old, old_value, pin) = match kh.get_by_version(version.wrapping_sub(1)) {
            Some(oldop) => (version - 1, oldop.has_value, oldop.value, DiskRef::none()),
            None => {
                let Some((has, val, disk_version, pin)) = self.from_disk(region, &key).await else {
                    info!("dropping chain message because the data layer read failed");
                    return;
                };

                if disk_version >= version {
                    self.send_ack(to, from, version, &key).await;
                    return;
                }

                let disk_version = if disk_version < version.saturating_sub(1) { 0 } else { disk_version };
                (disk_version, has, val, pin)
            }
        };

        // Predecessor unseen: park the update until the gap closes.
        if old_version == 0 && !fresh {
            kh.insert_deferred(version, Deferred { has_value, key, value, from, pin });
            return;
        }

        if !valid_chain_edge(&config, &from, &to) {
            info!("dropping chain message which didn't come from the right host");
            return;
        }

        let placement = prev_and_next(
            &config,
            region,
            &key,
            has_value.then_some(&value[..]),
            has_old.then_some(&old_value[..]),
        );
        let Some(placement) = placement else {
            info!("dropping chain message which does not match this host");
            return;
        };

        let mut pend = Pending::new(has_value, key.clone(), value);
        pend.fresh = fresh;
        pend.pin = pin;
        pend.recv = Some(Peer { entity: from, instance: config.instance_for(&from) });
        pend.set_placement(placement);

        kh.append_blocked(version, pend);
        self.move_operations_between_queues(to, &key, &kh).await;
    }

    /// Receive a key handed across a subspace boundary: the tail of the old
    /// location delivers the value to the head of the new one, carrying the
    /// pre-computed point for the hop after this chain.
    pub async fn chain_subspace(
        &self,
        from: EntityId,
        to: EntityId,
        version: u64,
        key: Bytes,
        value: Vec<Bytes>,
        next_point: u64,
    ) {
        let region = to.region();
        let _guard = self.locks.lock(&region, &key).await;
        let kh = self.get_keyholder(&region, &key);
        let config = self.config();

        let Some(schema) = config.get_schema(to.space) else {
            info!(space = to.space, "dropping subspace handoff for an unknown space");
            return;
        };

        if schema.attrs.len() != value.len() + 1 {
            info!("dropping subspace handoff because the dimensions are incorrect");
            return;
        }

        let Some(latest) = self.retrieve_latest(region, &key, &kh).await else {
            return;
        };

        if latest.version >= version {
            self.send_ack(to, from, version, &key).await;
            return;
        }

        let subspaces = config.subspaces(to.space);
        if subspaces == 0 {
            return;
        }

        let Some(hasher) = config.hasher(to.space, to.subspace) else {
            return;
        };

        let mut pend = Pending::new(true, key.clone(), value);
        pend.recv = Some(Peer { entity: from, instance: config.instance_for(&from) });
        pend.subspace_prev = Some(to.subspace);
        pend.subspace_next = if (to.subspace as usize) < subspaces - 1 {
            Some(to.subspace + 1)
        } else {
            None
        };
        pend.point_prev = from.mask;
        pend.point_this = hasher.hash(&key, &pend.value).point;
        pend.point_next = next_point;

        let same_region_link = from.region() == to.region() && config.chain_adjacent(&from, &to);
        let cross_region_link =
            from.region() != to.region() && config.is_tail(&from) && config.is_head(&to);

        if from.subspace != to.subspace || (!same_region_link && !cross_region_link) {
            info!("dropping subspace handoff which didn't come from the right host");
            return;
        }

        if !to.region().coord().contains(&norn_types::Coordinate::new(64, pend.point_this)) {
            info!("dropping subspace handoff which didn't come to the right host");
            return;
        }

        kh.append_blocked(version, pend);
        self.move_operations_between_queues(to, &key, &kh).await;
    }

    /// A downstream replica confirmed `version`: commit it, drain the front
    /// of the committable queue, and propagate the ack upstream (or answer
    /// the client at the point-leader).
    pub async fn chain_ack(&self, from: EntityId, to: EntityId, version: u64, key: Bytes) {
        let region = to.region();
        let _guard = self.locks.lock(&region, &key).await;
        let kh = self.get_keyholder(&region, &key);

        let Some(pend) = kh.get_by_version(version) else {
            info!("dropping ack for an update we haven't seen");
            return;
        };

        let Some(sent) = pend.sent else {
            info!("dropping ack for an update we haven't sent");
            return;
        };

        if sent.entity != from {
            info!("dropping ack that came from the wrong host");
            return;
        }

        self.transfers.add_trigger(region, &key, version);
        kh.mark_acked(version);
        self.put_to_disk(region, &kh, version).await;

        // The client origin must be claimed before the drain below can
        // remove the op; claiming clears it in place, so a duplicate ack
        // can never answer twice.
        let co = kh.take_client_origin(version);

        while kh.oldest_committable().map(|(_, p)| p.acked).unwrap_or(false) {
            kh.remove_oldest_committable_op();
        }

        self.move_operations_between_queues(to, &key, &kh).await;

        let config = self.config();
        if config.is_point_leader(&to) {
            if let Some(co) = co {
                self.respond_to_client(to, co.client, co.nonce, pend.retcode, ReturnCode::Success)
                    .await;
            }
        } else if let Some(recv) = pend.recv {
            self.send_ack(to, recv.entity, version, &key).await;
        }

        if kh.empty() {
            self.erase_keyholder(&region, &key);
        }
    }

    // -----------------------------------------------------------------------
    // Queue movement and forwarding
    // -----------------------------------------------------------------------

    /// The message pump. Phase A promotes deferred updates whose predecessor
    /// has arrived; phase B forwards blocked ops down the chain, moving each
    /// into the committable queue as its message goes out.
    async fn move_operations_between_queues(&self, us: EntityId, key: &Bytes, kh: &Arc<KeyHolder>) {
        let config = self.config();

        loop {
            let Some((deferred_version, def)) = kh.oldest_deferred() else { break };

            let newest = kh
                .most_recent_blocked()
                .or_else(|| kh.most_recent_committable());
            let (old_version, old_has, old_value) = match &newest {
                Some((v, p)) => (*v, p.has_value, p.value.clone()),
                None => (0, false, Vec::new()),
            };

            if old_version >= deferred_version {
                info!("dropping a deferred update because its version was already seen");
                kh.remove_oldest_deferred_op();
                continue;
            }

            if old_version + 1 != deferred_version {
                break;
            }

            if !valid_chain_edge(&config, &def.from, &us) {
                info!("dropping a deferred update which didn't come from the right host");
                kh.remove_oldest_deferred_op();
                break;
            }

            let placement = prev_and_next(
                &config,
                us.region(),
                key,
                def.has_value.then_some(&def.value[..]),
                old_has.then_some(&old_value[..]),
            );
            let Some(placement) = placement else {
                info!("dropping a deferred update which does not match this host");
                kh.remove_oldest_deferred_op();
                break;
            };

            let mut pend = Pending::new(def.has_value, def.key.clone(), def.value.clone());
            pend.fresh = false;
            pend.pin = def.pin.clone();
            pend.recv = Some(Peer { entity: def.from, instance: config.instance_for(&def.from) });
            pend.set_placement(placement);

            kh.append_blocked(deferred_version, pend);
            kh.remove_oldest_deferred_op();
        }

        loop {
            let Some((version, op)) = kh.oldest_blocked() else { break };

            // Fresh writes and deletes must not race ahead of in-flight
            // updates to the same key.
            if (op.fresh || !op.has_value) && kh.has_committable_ops() {
                break;
            }

            kh.transfer_blocked_to_committable();
            self.send_message(us, version, key, &op, kh).await;
        }
    }

    /// Forward one committable op to its next hop. Idempotent: an op that
    /// already has a send target is left alone.
    async fn send_message(
        &self,
        us: EntityId,
        version: u64,
        key: &Bytes,
        op: &Pending,
        kh: &Arc<KeyHolder>,
    ) {
        if op.sent.is_some() {
            return;
        }

        let config = self.config();
        let dst;

        if config.is_tail(&us) {
            match op.subspace_next {
                // Tail of the last subspace: close the loop with a self-ack.
                None => {
                    let msg = Message::ChainAck { version, key: key.clone() };
                    if self.network.send(us, us, msg).await {
                        kh.record_sent(version, Peer { entity: us, instance: Some(self.us()) });
                    }
                    return;
                }
                // Subspace transfer in progress: hand off to the new
                // location inside our own subspace.
                Some(next) if next == us.subspace => {
                    let probe = EntityId::new(us.space, us.subspace, 64, op.point_next, 0);
                    let Some(target) = config.sloppy_lookup(&probe) else {
                        info!("no host covers the handoff point yet; retransmit will retry");
                        return;
                    };
                    let msg = Message::ChainSubspace {
                        version,
                        key: key.clone(),
                        value: op.value.clone(),
                        next_point: op.point_next_next,
                    };
                    if self.network.send(us, target, msg).await {
                        kh.record_sent(
                            version,
                            Peer { entity: target, instance: config.instance_for(&target) },
                        );
                    }
                    return;
                }
                // Normal hop into the next subspace.
                Some(next) if next == us.subspace + 1 => {
                    let probe = EntityId::new(us.space, next, 64, op.point_next, 0);
                    let Some(target) = config.sloppy_lookup(&probe) else {
                        info!("no host covers the next subspace point yet; retransmit will retry");
                        return;
                    };
                    dst = target;
                }
                Some(other) => {
                    panic!(
                        "replication invariant violated: subspace_next {} is neither none, current ({}), nor adjacent",
                        other, us.subspace
                    );
                }
            }
        } else if op.subspace_prev == Some(us.subspace) {
            // This op arrived as a subspace handoff; keep relaying the
            // handoff form down our chain.
            let Some(target) = config.chain_next(&us) else { return };
            let msg = Message::ChainSubspace {
                version,
                key: key.clone(),
                value: op.value.clone(),
                next_point: op.point_next,
            };
            if self.network.send(us, target, msg).await {
                kh.record_sent(version, Peer { entity: target, instance: config.instance_for(&target) });
            }
            return;
        } else {
            let Some(target) = config.chain_next(&us) else { return };
            dst = target;
        }

        let msg = if op.has_value {
            Message::ChainPut { version, fresh: op.fresh, key: key.clone(), value: op.value.clone() }
        } else {
            Message::ChainDel { version, key: key.clone() }
        };

        if self.network.send(us, dst, msg).await {
            kh.record_sent(version, Peer { entity: dst, instance: config.instance_for(&dst) });
        }
    }

    async fn send_ack(&self, us: EntityId, to: EntityId, version: u64, key: &Bytes) -> bool {
        self.network
            .send(us, to, Message::ChainAck { version, key: key.clone() })
            .await
    }

    async fn respond_to_client(
        &self,
        us: EntityId,
        client: EntityId,
        nonce: u64,
        msgtype: MsgType,
        result: ReturnCode,
    ) {
        self.network
            .send(us, client, Message::Response { msgtype, nonce, result })
            .await;
    }

    // -----------------------------------------------------------------------
    // Storage
    // -----------------------------------------------------------------------

    /// Commit `version` durably. A delete, or the old-value leg of a
    /// subspace transfer, removes the row; anything else writes it.
    /// `version_on_disk` advances only on success, so a failed commit is
    /// retried by the retransmit path.
    async fn put_to_disk(&self, region: RegionId, kh: &Arc<KeyHolder>, version: u64) -> bool {
        if version <= kh.version_on_disk() {
            return true;
        }

        let Some(op) = kh.get_by_version(version) else {
            return false;
        };

        let leaving_region = op.subspace_next == Some(region.subspace) && region.subspace != 0;

        let result = if !op.has_value || leaving_region {
            self.data.del(region, &op.key).await
        } else {
            self.data.put(region, &op.key, &op.value, version).await
        };

        match result {
            Ok(()) => {
                kh.set_version_on_disk(version);
                true
            }
            Err(e) => {
                error!(code = ?e.code, "commit caused error: {e}");
                false
            }
        }
    }

    /// Newest known state for a key: newest blocked, else newest
    /// committable, else disk. `None` means the disk read failed.
    async fn retrieve_latest(
        &self,
        region: RegionId,
        key: &Bytes,
        kh: &Arc<KeyHolder>,
    ) -> Option<Latest> {
        if let Some((version, p)) = kh.most_recent_blocked() {
            return Some(Latest { version, has_value: p.has_value, value: p.value, pin: DiskRef::none() });
        }

        if let Some((version, p)) = kh.most_recent_committable() {
            return Some(Latest { version, has_value: p.has_value, value: p.value, pin: DiskRef::none() });
        }

        let (has_value, value, version, pin) = self.from_disk(region, key).await?;
        Some(Latest { version, has_value, value, pin })
    }

    /// Read a key from the data layer, translating its result codes:
    /// "not found" is success with version 0; everything else fails.
    async fn from_disk(
        &self,
        region: RegionId,
        key: &Bytes,
    ) -> Option<(bool, Vec<Bytes>, u64, DiskRef)> {
        match self.data.get(region, key).await {
            Ok(GetOutcome::Found { value, version, pin }) => Some((true, value, version, pin)),
            Ok(GetOutcome::NotFound) => Some((false, Vec::new(), 0, DiskRef::none())),
            Err(e) if e.code == DataCode::MissingDisk => {
                error!("data layer returned MissingDisk");
                None
            }
            Err(e) => {
                warn!(code = ?e.code, "data layer returned unexpected result when reading old value");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Keyholder lifecycle
    // -----------------------------------------------------------------------

    /// Fetch or lazily create the keyholder for a key. Insert races resolve
    /// by retrying the lookup; the losing candidate is discarded.
    fn get_keyholder(&self, region: &RegionId, key: &Bytes) -> Arc<KeyHolder> {
        let kp = KeyPair::new(*region, key.clone());

        loop {
            if let Some(kh) = self.keyholders.lookup(&kp) {
                return kh;
            }

            let kh = Arc::new(KeyHolder::new());
            if self.keyholders.insert_if_absent(kp.clone(), kh.clone()) {
                return kh;
            }
        }
    }

    fn erase_keyholder(&self, region: &RegionId, key: &Bytes) {
        self.keyholders.remove(&KeyPair::new(*region, key.clone()));
    }

    // -----------------------------------------------------------------------
    // Periodic retransmission
    // -----------------------------------------------------------------------

    /// Background worker: one retransmit pass every 250 ms. While quiescing,
    /// a pass that finds no keyholders reports the quiesce state id to the
    /// coordinator and ends the task.
    pub async fn run_periodic(self: Arc<Self>) {
        info!("replication retransmit task started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let processed = self.retransmit().await;

            if self.quiesce.load(Ordering::SeqCst) && processed == 0 {
                let state_id = self.quiesce_state_id.lock().clone();
                self.coordinator.quiesced(&state_id).await;
                info!("replication manager quiesced; retransmit task stopping");
                return;
            }

            tokio::time::sleep(RETRANSMIT_INTERVAL).await;
        }

        info!("replication retransmit task stopping");
    }

    /// One pass over every keyholder: erase the empty ones, and re-send the
    /// oldest committable op wherever the send was never recorded or the
    /// recipient entity has moved to a new instance (so the previous send is
    /// presumed lost). Returns the number of keyholders visited.
    pub async fn retransmit(&self) -> usize {
        let mut processed = 0;

        for (kp, kh) in self.keyholders.snapshot() {
            processed += 1;

            let _guard = self.locks.lock(&kp.region, &kp.key).await;

            if kh.empty() {
                // Only erase if the live entry is the same object we
                // iterated over; otherwise the snapshot is stale and a
                // concurrent creator owns the slot now.
                if let Some(live) = self.keyholders.lookup(&kp) {
                    if Arc::ptr_eq(&live, &kh) {
                        self.keyholders.remove(&kp);
                    }
                }
                continue;
            }

            if !kh.has_committable_ops() {
                continue;
            }

            let config = self.config();
            let Some((version, pend)) = kh.oldest_committable() else {
                continue;
            };

            // Only the first pending update is retransmitted, so a slow
            // host is not hit with a burst of duplicates.
            let lost = match &pend.sent {
                None => true,
                Some(peer) => peer.instance != config.instance_for(&peer.entity),
            };

            if lost {
                kh.clear_sent(version);
                let mut op = pend;
                op.sent = None;

                let Some(us) = config.entity_for(self.us(), &kp.region) else {
                    continue;
                };
                self.send_message(us, version, &kp.key, &op, &kh).await;
            }
        }

        processed
    }

    /// Route one received message to its handler. Client-bound responses
    /// have no handler here.
    pub async fn deliver(&self, from: EntityId, to: EntityId, msg: Message) {
        match msg {
            Message::ChainPut { version, fresh, key, value } => {
                self.chain_put(from, to, version, fresh, key, value).await;
            }
            Message::ChainDel { version, key } => {
                self.chain_del(from, to, version, key).await;
            }
            Message::ChainSubspace { version, key, value, next_point } => {
                self.chain_subspace(from, to, version, key, value, next_point).await;
            }
            Message::ChainAck { version, key } => {
                self.chain_ack(from, to, version, key).await;
            }
            Message::Response { .. } => {}
        }
    }

    /// Number of live keyholders; exposed for tests and introspection.
    pub fn keyholder_count(&self) -> usize {
        self.keyholders.len()
    }
}

/// A chain message may only arrive from the previous link in the same
/// region, or from the tail of the previous subspace when we are the head of
/// ours.
fn valid_chain_edge(config: &ClusterMap, from: &EntityId, to: &EntityId) -> bool {
    (from.region() == to.region() && config.chain_adjacent(from, to))
        || (from.space == to.space
            && from.subspace + 1 == to.subspace
            && config.is_tail(from)
            && config.is_head(to))
}
