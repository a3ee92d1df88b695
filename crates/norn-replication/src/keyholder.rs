use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::Mutex;

use norn_types::RegionId;

use crate::pending::{ClientOrigin, Deferred, Peer, Pending};

/// Identity of one replicated key within one region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPair {
    pub region: RegionId,
    pub key: Bytes,
}

impl KeyPair {
    pub fn new(region: RegionId, key: Bytes) -> Self {
        KeyPair { region, key }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Accepted versions not yet forwarded.
    blocked: BTreeMap<u64, Pending>,
    /// Versions forwarded down the chain, awaiting ack and commit.
    committable: BTreeMap<u64, Pending>,
    /// Received versions whose predecessor is unseen.
    deferred: BTreeMap<u64, Deferred>,
    version_on_disk: u64,
}

/// The in-memory replication state for a single `(region, key)`.
///
/// The inner mutex only provides memory safety for the queue maps; logical
/// serialization comes from the key's stripe lock, which every caller holds
/// across a whole state transition. No guard is ever held across an await.
#[derive(Debug, Default)]
pub struct KeyHolder {
    state: Mutex<State>,
}

impl KeyHolder {
    pub fn new() -> Self {
        KeyHolder::default()
    }

    pub fn has_blocked_ops(&self) -> bool {
        !self.state.lock().blocked.is_empty()
    }

    pub fn oldest_blocked(&self) -> Option<(u64, Pending)> {
        let g = self.state.lock();
        g.blocked.first_key_value().map(|(v, p)| (*v, p.clone()))
    }

    pub fn most_recent_blocked(&self) -> Option<(u64, Pending)> {
        let g = self.state.lock();
        g.blocked.last_key_value().map(|(v, p)| (*v, p.clone()))
    }

    pub fn append_blocked(&self, version: u64, pend: Pending) {
        let mut g = self.state.lock();
        debug_assert!(!g.blocked.contains_key(&version) && !g.committable.contains_key(&version));
        g.blocked.insert(version, pend);
    }

    /// Move the oldest blocked op into the committable queue.
    pub fn transfer_blocked_to_committable(&self) {
        let mut g = self.state.lock();
        if let Some((version, pend)) = g.blocked.pop_first() {
            g.committable.insert(version, pend);
        }
    }

    pub fn has_committable_ops(&self) -> bool {
        !self.state.lock().committable.is_empty()
    }

    pub fn oldest_committable(&self) -> Option<(u64, Pending)> {
        let g = self.state.lock();
        g.committable.first_key_value().map(|(v, p)| (*v, p.clone()))
    }

    pub fn most_recent_committable(&self) -> Option<(u64, Pending)> {
        let g = self.state.lock();
        g.committable.last_key_value().map(|(v, p)| (*v, p.clone()))
    }

    pub fn remove_oldest_committable_op(&self) {
        self.state.lock().committable.pop_first();
    }

    pub fn has_deferred_ops(&self) -> bool {
        !self.state.lock().deferred.is_empty()
    }

    pub fn oldest_deferred(&self) -> Option<(u64, Deferred)> {
        let g = self.state.lock();
        g.deferred.first_key_value().map(|(v, d)| (*v, d.clone()))
    }

    pub fn insert_deferred(&self, version: u64, def: Deferred) {
        self.state.lock().deferred.insert(version, def);
    }

    pub fn remove_oldest_deferred_op(&self) {
        self.state.lock().deferred.pop_first();
    }

    /// Snapshot of the pending op at `version`, blocked queue first.
    pub fn get_by_version(&self, version: u64) -> Option<Pending> {
        let g = self.state.lock();
        g.blocked
            .get(&version)
            .or_else(|| g.committable.get(&version))
            .cloned()
    }

    pub fn version_on_disk(&self) -> u64 {
        self.state.lock().version_on_disk
    }

    pub fn set_version_on_disk(&self, version: u64) {
        let mut g = self.state.lock();
        debug_assert!(version >= g.version_on_disk);
        g.version_on_disk = version;
    }

    pub fn empty(&self) -> bool {
        let g = self.state.lock();
        g.blocked.is_empty() && g.committable.is_empty() && g.deferred.is_empty()
    }

    fn update<R>(&self, version: u64, f: impl FnOnce(&mut Pending) -> R) -> Option<R> {
        let mut g = self.state.lock();
        if let Some(p) = g.blocked.get_mut(&version) {
            return Some(f(p));
        }
        g.committable.get_mut(&version).map(f)
    }

    /// Remember which peer delivered `version` (idempotent redelivery
    /// refreshes it).
    pub fn set_recv(&self, version: u64, peer: Peer) {
        self.update(version, |p| p.recv = Some(peer));
    }

    /// Remember where `version` was forwarded.
    pub fn record_sent(&self, version: u64, peer: Peer) {
        self.update(version, |p| p.sent = Some(peer));
    }

    /// Forget the forwarding target so the retransmit path re-sends.
    pub fn clear_sent(&self, version: u64) {
        self.update(version, |p| p.sent = None);
    }

    pub fn mark_acked(&self, version: u64) {
        self.update(version, |p| p.acked = true);
    }

    /// Claim the client origin of `version`, clearing it in place so a
    /// duplicate ack cannot answer the client twice.
    pub fn take_client_origin(&self, version: u64) -> Option<ClientOrigin> {
        self.update(version, |p| p.co.take()).flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pend(has_value: bool) -> Pending {
        Pending::new(has_value, Bytes::from_static(b"k"), vec![Bytes::from_static(b"v")])
    }

    #[test]
    fn queues_start_empty() {
        let kh = KeyHolder::new();
        assert!(kh.empty());
        assert!(!kh.has_blocked_ops());
        assert!(!kh.has_committable_ops());
        assert!(!kh.has_deferred_ops());
        assert_eq!(kh.version_on_disk(), 0);
    }

    #[test]
    fn blocked_ordering_and_transfer() {
        let kh = KeyHolder::new();
        kh.append_blocked(4, pend(true));
        kh.append_blocked(5, pend(true));

        assert_eq!(kh.oldest_blocked().unwrap().0, 4);
        assert_eq!(kh.most_recent_blocked().unwrap().0, 5);

        kh.transfer_blocked_to_committable();
        assert_eq!(kh.oldest_blocked().unwrap().0, 5);
        assert_eq!(kh.oldest_committable().unwrap().0, 4);
        assert_eq!(kh.most_recent_committable().unwrap().0, 4);
    }

    #[test]
    fn get_by_version_searches_blocked_then_committable() {
        let kh = KeyHolder::new();
        kh.append_blocked(1, pend(true));
        kh.transfer_blocked_to_committable();
        kh.append_blocked(2, pend(false));

        assert!(kh.get_by_version(1).is_some());
        assert!(!kh.get_by_version(2).unwrap().has_value);
        assert!(kh.get_by_version(3).is_none());
    }

    #[test]
    fn committable_drains_from_the_front() {
        let kh = KeyHolder::new();
        for v in 1..=3 {
            kh.append_blocked(v, pend(true));
            kh.transfer_blocked_to_committable();
        }
        kh.remove_oldest_committable_op();
        assert_eq!(kh.oldest_committable().unwrap().0, 2);
    }

    #[test]
    fn mutators_reach_the_stored_op() {
        let kh = KeyHolder::new();
        kh.append_blocked(1, pend(true));

        kh.mark_acked(1);
        assert!(kh.get_by_version(1).unwrap().acked);

        kh.record_sent(
            1,
            Peer {
                entity: norn_types::EntityId::new(1, 0, 0, 0, 1),
                instance: Some(norn_types::Instance::new(9)),
            },
        );
        assert!(kh.get_by_version(1).unwrap().sent.is_some());
        kh.clear_sent(1);
        assert!(kh.get_by_version(1).unwrap().sent.is_none());
    }

    #[test]
    fn client_origin_is_taken_once() {
        let kh = KeyHolder::new();
        let mut p = pend(true);
        p.co = Some(ClientOrigin {
            region: RegionId::new(1, 0, 0, 0),
            client: norn_types::EntityId::new(u32::MAX, 0, 0, 0, 0),
            nonce: 42,
        });
        kh.append_blocked(1, p);

        let co = kh.take_client_origin(1).unwrap();
        assert_eq!(co.nonce, 42);
        assert!(kh.take_client_origin(1).is_none());
    }

    #[test]
    fn version_on_disk_is_monotonic() {
        let kh = KeyHolder::new();
        kh.set_version_on_disk(3);
        kh.set_version_on_disk(5);
        assert_eq!(kh.version_on_disk(), 5);
    }
}
