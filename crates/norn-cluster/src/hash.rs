use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use bytes::Bytes;

use norn_types::Coordinate;

/// Maps `(key, value)` pairs onto the 64-bit linear coordinate space of one
/// subspace. Each subspace hashes a fixed list of attribute indices
/// (`dims`); index 0 is the key, index `i > 0` is `value[i - 1]`.
///
/// `DefaultHasher::new()` is seeded with fixed keys, so points are stable
/// across processes; the per-region seed keeps distinct subspaces from
/// agreeing on placement.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubspaceHasher {
    seed: u64,
    dims: Vec<u16>,
}

impl SubspaceHasher {
    pub fn new(seed: u64, dims: Vec<u16>) -> Self {
        debug_assert!(!dims.is_empty());
        SubspaceHasher { seed, dims }
    }

    /// Hash onto a fully-specified (prefix 64) coordinate.
    pub fn hash(&self, key: &[u8], value: &[Bytes]) -> Coordinate {
        let mut point = 0u64;

        for &dim in &self.dims {
            let bytes: &[u8] = if dim == 0 {
                key
            } else {
                value
                    .get(dim as usize - 1)
                    .map(|b| b.as_ref())
                    .unwrap_or(&[])
            };

            let mut h = DefaultHasher::new();
            h.write_u64(self.seed ^ dim as u64);
            h.write(bytes);
            point = point.rotate_left(7) ^ h.finish();
        }

        Coordinate::new(64, point)
    }
}
