use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use tokio::sync::{Mutex, MutexGuard};

use norn_types::RegionId;

/// Default number of stripes; must be a power of two.
pub const LOCK_STRIPING: usize = 1024;

/// Fixed-size array of mutexes serializing all state transitions for a key.
///
/// Distinct stripes are independent; two keys on the same stripe contend
/// falsely, which is the price of bounded memory. Acquiring two stripes at
/// once is forbidden: nothing in the replication core ever needs nested
/// stripe locks, so no ordering rule exists for them.
pub struct StripedKeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl StripedKeyLocks {
    pub fn new(stripes: usize) -> Self {
        assert!(stripes.is_power_of_two(), "stripe count must be a power of two");
        StripedKeyLocks {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn with_default_striping() -> Self {
        StripedKeyLocks::new(LOCK_STRIPING)
    }

    fn stripe(&self, region: &RegionId, key: &[u8]) -> usize {
        let mut h = DefaultHasher::new();
        h.write_u64(region.seed());
        h.write(key);
        (h.finish() as usize) & (self.stripes.len() - 1)
    }

    /// Acquire-and-hold; the guard serializes every transition for keys on
    /// this stripe, including across storage and network awaits.
    pub async fn lock(&self, region: &RegionId, key: &[u8]) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(region, key)].lock().await
    }
}
