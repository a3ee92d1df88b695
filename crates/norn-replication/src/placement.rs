use bytes::Bytes;

use norn_cluster::ClusterMap;
use norn_types::{RegionId, SubspaceId};

/// Where a pending version sits on the coordinate space and where it flows
/// next: the adjacent subspaces and the points that resolve its upstream
/// and downstream hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement {
    pub subspace_prev: Option<SubspaceId>,
    pub subspace_next: Option<SubspaceId>,
    pub point_prev: u64,
    pub point_this: u64,
    pub point_next: u64,
    pub point_next_next: u64,
}

/// Compute a pending op's placement within region `r`.
///
/// Returns `None` when this replica cannot own the version (neither the old
/// nor the new coordinate lands inside `r`, or only the new one does) or the
/// map does not know the region's space.
///
/// A boundary-crossing update (old coordinate inside `r`, new coordinate
/// outside) becomes a subspace transfer: the op keeps flowing along the
/// current chain under the *old* coordinate so the stale row can be deleted
/// at the tail, while `point_next` routes the value to its new home inside
/// the same subspace and `point_next_next` is pre-hashed for the subspace
/// after that.
pub fn prev_and_next(
    config: &ClusterMap,
    r: RegionId,
    key: &[u8],
    new_value: Option<&[Bytes]>,
    old_value: Option<&[Bytes]>,
) -> Option<Placement> {
    let subspaces = config.subspaces(r.space);
    if subspaces == 0 {
        return None;
    }

    let subspace_prev = r.subspace.checked_sub(1);
    let mut subspace_next = if (r.subspace as usize) < subspaces - 1 {
        Some(r.subspace + 1)
    } else {
        None
    };

    let hasher_this = config.hasher(r.space, r.subspace)?;

    let (coord_old, coord_new) = match (old_value, new_value) {
        (Some(old), Some(new)) => (hasher_this.hash(key, old), hasher_this.hash(key, new)),
        (Some(old), None) => {
            let c = hasher_this.hash(key, old);
            (c, c)
        }
        (None, Some(new)) => {
            let c = hasher_this.hash(key, new);
            (c, c)
        }
        (None, None) => {
            debug_assert!(false, "placement requires at least one value");
            return None;
        }
    };

    let region_coord = r.coord();
    let point_this;
    let mut point_next = 0;
    let mut point_next_next = 0;
    let mut next_already_set = false;

    if region_coord.contains(&coord_old) && region_coord.contains(&coord_new) {
        point_this = coord_new.point;
    } else if region_coord.contains(&coord_old) {
        // Only reachable when old and new hash apart, so both are present.
        let old = old_value?;

        if let Some(next) = subspace_next {
            point_next_next = config.hasher(r.space, next)?.hash(key, old).point;
        }

        subspace_next = Some(r.subspace);
        point_this = coord_old.point;
        point_next = coord_new.point;
        next_already_set = true;
    } else {
        // Only the new coordinate (or neither) is ours: reject.
        return None;
    }

    let mut point_prev = 0;

    if let Some(prev) = subspace_prev {
        let hasher_prev = config.hasher(r.space, prev)?;
        // With both values present the upstream hop comes from the *new* one.
        let v = match (old_value, new_value) {
            (_, Some(new)) => new,
            (Some(old), None) => old,
            (None, None) => unreachable!(),
        };
        point_prev = hasher_prev.hash(key, v).point;
    }

    if !next_already_set {
        if let Some(next) = subspace_next {
            let hasher_next = config.hasher(r.space, next)?;
            // With both values present the downstream hop goes to the *old* one.
            let v = match (old_value, new_value) {
                (Some(old), _) => old,
                (None, Some(new)) => new,
                (None, None) => unreachable!(),
            };
            point_next = hasher_next.hash(key, v).point;
        }
    }

    Some(Placement {
        subspace_prev,
        subspace_next,
        point_prev,
        point_this,
        point_next,
        point_next_next,
    })
}
