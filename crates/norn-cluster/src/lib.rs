pub mod hash;
pub mod map;

pub use hash::SubspaceHasher;
pub use map::{ClusterMap, ClusterMapBuilder, SpaceInfo, SubspaceInfo};
