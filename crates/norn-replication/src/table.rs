use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::keyholder::{KeyHolder, KeyPair};

/// Concurrent map `KeyPair → KeyHolder`. One coarse lock gates insert,
/// remove, and scan; it is always ordered *after* the stripe lock of the key
/// involved and is never held across an await.
///
/// Iteration hands out a snapshot; scanners must re-`lookup` and compare
/// pointer identity before acting on an entry (the erase-vs-create race is
/// resolved under the stripe lock).
#[derive(Default)]
pub struct KeyHolderTable {
    inner: Mutex<HashMap<KeyPair, Arc<KeyHolder>>>,
}

impl KeyHolderTable {
    pub fn new() -> Self {
        KeyHolderTable::default()
    }

    pub fn lookup(&self, kp: &KeyPair) -> Option<Arc<KeyHolder>> {
        self.inner.lock().get(kp).cloned()
    }

    /// Insert only if no holder exists; returns whether `kh` went in.
    pub fn insert_if_absent(&self, kp: KeyPair, kh: Arc<KeyHolder>) -> bool {
        let mut g = self.inner.lock();
        if g.contains_key(&kp) {
            false
        } else {
            g.insert(kp, kh);
            true
        }
    }

    pub fn remove(&self, kp: &KeyPair) {
        self.inner.lock().remove(kp);
    }

    /// Stable snapshot of the current entries for the retransmit scan.
    pub fn snapshot(&self) -> Vec<(KeyPair, Arc<KeyHolder>)> {
        self.inner
            .lock()
            .iter()
            .map(|(kp, kh)| (kp.clone(), kh.clone()))
            .collect()
    }

    /// Reconfiguration sweep: drop every entry the predicate rejects.
    pub fn retain(&self, mut f: impl FnMut(&KeyPair) -> bool) {
        self.inner.lock().retain(|kp, _| f(kp));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use norn_types::RegionId;

    fn kp(key: &'static [u8]) -> KeyPair {
        KeyPair::new(RegionId::new(1, 0, 0, 0), Bytes::from_static(key))
    }

    #[test]
    fn insert_race_keeps_the_winner() {
        let table = KeyHolderTable::new();
        let first = Arc::new(KeyHolder::new());
        let second = Arc::new(KeyHolder::new());

        assert!(table.insert_if_absent(kp(b"k"), first.clone()));
        // The losing insert is discarded; the winner stays visible.
        assert!(!table.insert_if_absent(kp(b"k"), second));
        assert!(Arc::ptr_eq(&table.lookup(&kp(b"k")).unwrap(), &first));
    }

    #[test]
    fn snapshot_is_stable_against_concurrent_removal() {
        let table = KeyHolderTable::new();
        table.insert_if_absent(kp(b"a"), Arc::new(KeyHolder::new()));
        table.insert_if_absent(kp(b"b"), Arc::new(KeyHolder::new()));

        let snap = table.snapshot();
        table.remove(&kp(b"a"));

        // The snapshot still holds both, but a re-lookup reveals the removal.
        assert_eq!(snap.len(), 2);
        assert!(table.lookup(&kp(b"a")).is_none());
    }

    #[test]
    fn identity_check_detects_replacement() {
        let table = KeyHolderTable::new();
        let original = Arc::new(KeyHolder::new());
        table.insert_if_absent(kp(b"k"), original.clone());

        let snap = table.snapshot();
        table.remove(&kp(b"k"));
        let replacement = Arc::new(KeyHolder::new());
        table.insert_if_absent(kp(b"k"), replacement.clone());

        let (key, stale) = &snap[0];
        let live = table.lookup(key).unwrap();
        assert!(!Arc::ptr_eq(stale, &live));
        assert!(Arc::ptr_eq(&live, &replacement));
        assert!(Arc::ptr_eq(stale, &original));
    }

    #[test]
    fn retain_sweeps_rejected_entries() {
        let table = KeyHolderTable::new();
        table.insert_if_absent(kp(b"keep"), Arc::new(KeyHolder::new()));
        table.insert_if_absent(kp(b"drop"), Arc::new(KeyHolder::new()));

        table.retain(|kp| kp.key.as_ref() == b"keep");
        assert_eq!(table.len(), 1);
        assert!(table.lookup(&kp(b"keep")).is_some());
        assert!(table.lookup(&kp(b"drop")).is_none());
    }
}
