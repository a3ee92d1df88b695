use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use norn_types::RegionId;

/// Discriminated results a data layer can produce. Only `Success` (and
/// `NotFound`, for reads) are non-errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCode {
    Success,
    NotFound,
    MissingDisk,
    WrongArity,
    DataFull,
    SearchFull,
    SyncFailed,
    DropFailed,
    SplitFailed,
    DidNothing,
}

#[derive(thiserror::Error, Debug)]
#[error("data layer returned {code:?}: {message}")]
pub struct DataError {
    pub code: DataCode,
    pub message: String,
}

impl DataError {
    pub fn new(code: DataCode, message: impl Into<String>) -> Self {
        DataError { code, message: message.into() }
    }
}

/// Pins the backing of a value read from disk so the slices handed out stay
/// valid until the reader commits or abandons the version that replaced it.
#[derive(Debug, Clone, Default)]
pub struct DiskRef(Option<Arc<Vec<Bytes>>>);

impl DiskRef {
    pub fn pin(value: Vec<Bytes>) -> Self {
        DiskRef(Some(Arc::new(value)))
    }

    pub fn none() -> Self {
        DiskRef(None)
    }
}

#[derive(Debug, Clone)]
pub enum GetOutcome {
    Found {
        value: Vec<Bytes>,
        version: u64,
        pin: DiskRef,
    },
    NotFound,
}

/// Durable storage keyed by `(region, key)`.
///
/// Methods use RPITIT (`-> impl Future + Send`) so generic callers can
/// `.await` across thread boundaries without an `async-trait` dependency.
pub trait DataLayer: Send + Sync + 'static {
    /// Read the committed value and version for a key, or `NotFound`.
    fn get(
        &self,
        region: RegionId,
        key: &[u8],
    ) -> impl Future<Output = Result<GetOutcome, DataError>> + Send;

    /// Durably store `(value, version)` for a key, replacing any prior row.
    fn put(
        &self,
        region: RegionId,
        key: &[u8],
        value: &[Bytes],
        version: u64,
    ) -> impl Future<Output = Result<(), DataError>> + Send;

    /// Remove the row for a key. Deleting an absent key succeeds.
    fn del(&self, region: RegionId, key: &[u8]) -> impl Future<Output = Result<(), DataError>> + Send;
}
