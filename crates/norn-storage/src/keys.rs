use norn_types::RegionId;

/// Storage key for one row: `space(4) ++ subspace(2) ++ prefix(1) ++
/// mask(8) ++ key_bytes`. Big-endian on every component, so rows of one
/// region occupy one contiguous lexicographic range.
pub fn row_key(region: RegionId, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(15 + key.len());
    buf.extend_from_slice(&region.space.to_be_bytes());
    buf.extend_from_slice(&region.subspace.to_be_bytes());
    buf.push(region.prefix);
    buf.extend_from_slice(&region.mask.to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

/// 15-byte prefix shared by every row of a region.
pub fn region_prefix(region: RegionId) -> [u8; 15] {
    let mut buf = [0u8; 15];
    buf[..4].copy_from_slice(&region.space.to_be_bytes());
    buf[4..6].copy_from_slice(&region.subspace.to_be_bytes());
    buf[6] = region.prefix;
    buf[7..15].copy_from_slice(&region.mask.to_be_bytes());
    buf
}
