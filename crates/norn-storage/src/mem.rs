use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use norn_types::RegionId;

use crate::keys::row_key;
use crate::traits::{DataCode, DataError, DataLayer, DiskRef, GetOutcome};

#[derive(Debug, Clone)]
struct Row {
    value: Vec<Bytes>,
    version: u64,
}

/// In-memory `DataLayer` backed by a `BTreeMap`.
///
/// Intended for unit tests; not persisted across restarts. Reads and writes
/// can be made to fail on demand to exercise error paths.
pub struct MemDataLayer {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Row>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemDataLayer {
    pub fn new() -> Self {
        MemDataLayer {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent `get` calls fail with `MissingDisk`.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `put`/`del` calls fail with `SyncFailed`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of rows currently stored, across all regions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for MemDataLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLayer for MemDataLayer {
    async fn get(&self, region: RegionId, key: &[u8]) -> Result<GetOutcome, DataError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DataError::new(DataCode::MissingDisk, "injected read failure"));
        }

        let g = self.inner.read().await;
        match g.get(&row_key(region, key)) {
            Some(row) => Ok(GetOutcome::Found {
                value: row.value.clone(),
                version: row.version,
                pin: DiskRef::pin(row.value.clone()),
            }),
            None => Ok(GetOutcome::NotFound),
        }
    }

    async fn put(
        &self,
        region: RegionId,
        key: &[u8],
        value: &[Bytes],
        version: u64,
    ) -> Result<(), DataError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DataError::new(DataCode::SyncFailed, "injected write failure"));
        }

        let mut g = self.inner.write().await;
        g.insert(row_key(region, key), Row { value: value.to_vec(), version });
        Ok(())
    }

    async fn del(&self, region: RegionId, key: &[u8]) -> Result<(), DataError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DataError::new(DataCode::SyncFailed, "injected write failure"));
        }

        let mut g = self.inner.write().await;
        g.remove(&row_key(region, key));
        Ok(())
    }
}
