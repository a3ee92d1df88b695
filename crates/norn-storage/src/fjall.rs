use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use norn_types::RegionId;

use crate::keys::row_key;
use crate::traits::{DataCode, DataError, DataLayer, DiskRef, GetOutcome};

fn encode(row: &StoredRow) -> Result<Vec<u8>, DataError> {
    bincode::serde::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| DataError::new(DataCode::SyncFailed, e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<StoredRow, DataError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| DataError::new(DataCode::MissingDisk, e.to_string()))
}

fn fjall_err(code: DataCode) -> impl FnOnce(fjall::Error) -> DataError {
    move |e| DataError::new(code, e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> DataError {
    DataError::new(DataCode::MissingDisk, e.to_string())
}

/// On-disk row encoding: attribute slices plus the committed version.
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredRow {
    value: Vec<Vec<u8>>,
    version: u64,
}

/// `DataLayer` backed by fjall.
///
/// One keyspace holds every region's rows under the region-prefixed key
/// encoding. All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallDataLayer {
    _db: fjall::Database,
    rows: Arc<fjall::Keyspace>,
}

impl FjallDataLayer {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, DataError> {
        let db = fjall::Database::builder(path)
            .open()
            .map_err(fjall_err(DataCode::MissingDisk))?;
        let rows = db
            .keyspace("rows", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err(DataCode::MissingDisk))?;
        Ok(FjallDataLayer { _db: db, rows: Arc::new(rows) })
    }
}

impl DataLayer for FjallDataLayer {
    async fn get(&self, region: RegionId, key: &[u8]) -> Result<GetOutcome, DataError> {
        let rows = self.rows.clone();
        let disk_key = row_key(region, key);

        tokio::task::spawn_blocking(move || -> Result<GetOutcome, DataError> {
            match rows.get(&disk_key).map_err(fjall_err(DataCode::MissingDisk))? {
                Some(raw) => {
                    let row = decode(&raw)?;
                    let value: Vec<Bytes> = row.value.into_iter().map(Bytes::from).collect();
                    Ok(GetOutcome::Found {
                        value: value.clone(),
                        version: row.version,
                        pin: DiskRef::pin(value),
                    })
                }
                None => Ok(GetOutcome::NotFound),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn put(
        &self,
        region: RegionId,
        key: &[u8],
        value: &[Bytes],
        version: u64,
    ) -> Result<(), DataError> {
        let rows = self.rows.clone();
        let disk_key = row_key(region, key);
        let row = StoredRow {
            value: value.iter().map(|b| b.to_vec()).collect(),
            version,
        };

        tokio::task::spawn_blocking(move || -> Result<(), DataError> {
            let encoded = encode(&row)?;
            rows.insert(&disk_key, encoded).map_err(fjall_err(DataCode::SyncFailed))
        })
        .await
        .map_err(join_err)?
    }

    async fn del(&self, region: RegionId, key: &[u8]) -> Result<(), DataError> {
        let rows = self.rows.clone();
        let disk_key = row_key(region, key);

        tokio::task::spawn_blocking(move || -> Result<(), DataError> {
            rows.remove(&disk_key).map_err(fjall_err(DataCode::DropFailed))
        })
        .await
        .map_err(join_err)?
    }
}
