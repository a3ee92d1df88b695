use std::collections::{BTreeMap, HashMap};

use norn_types::{
    Coordinate, EntityId, Instance, NornError, RegionId, Schema, SpaceId, SubspaceId,
};

use crate::hash::SubspaceHasher;

/// One indexing dimension of a space: the attribute indices its hasher
/// consumes. Subspace 0 always hashes the key alone.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubspaceInfo {
    pub dims: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpaceInfo {
    pub schema: Schema,
    pub subspaces: Vec<SubspaceInfo>,
}

/// An immutable snapshot of the cluster: spaces, their subspaces, and the
/// replica chain bound to every region. Installed whole by `reconfigure`;
/// queries never block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterMap {
    spaces: HashMap<SpaceId, SpaceInfo>,
    chains: BTreeMap<RegionId, Vec<Instance>>,
    quiesce: bool,
    quiesce_state_id: String,
}

impl ClusterMap {
    pub fn builder() -> ClusterMapBuilder {
        ClusterMapBuilder::default()
    }

    pub fn get_schema(&self, space: SpaceId) -> Option<&Schema> {
        self.spaces.get(&space).map(|s| &s.schema)
    }

    /// Total number of subspaces in `space`, zero if the space is unknown.
    pub fn subspaces(&self, space: SpaceId) -> usize {
        self.spaces.get(&space).map(|s| s.subspaces.len()).unwrap_or(0)
    }

    /// The placement hasher for one subspace.
    pub fn hasher(&self, space: SpaceId, subspace: SubspaceId) -> Option<SubspaceHasher> {
        let info = self.spaces.get(&space)?.subspaces.get(subspace as usize)?;
        let seed = RegionId::new(space, subspace, 0, 0).seed();
        Some(SubspaceHasher::new(seed, info.dims.clone()))
    }

    /// Does `instance` host a replica of `region`?
    pub fn in_region(&self, instance: Instance, region: &RegionId) -> bool {
        self.chains
            .get(region)
            .map(|chain| chain.contains(&instance))
            .unwrap_or(false)
    }

    /// The instance an entity is currently bound to.
    pub fn instance_for(&self, entity: &EntityId) -> Option<Instance> {
        self.chains
            .get(&entity.region())
            .and_then(|chain| chain.get(entity.number as usize))
            .copied()
    }

    /// The entity `instance` plays in `region`, if any.
    pub fn entity_for(&self, instance: Instance, region: &RegionId) -> Option<EntityId> {
        let chain = self.chains.get(region)?;
        let number = chain.iter().position(|i| *i == instance)?;
        Some(EntityId::new(region.space, region.subspace, region.prefix, region.mask, number as u8))
    }

    pub fn is_head(&self, entity: &EntityId) -> bool {
        entity.number == 0 && self.instance_for(entity).is_some()
    }

    pub fn is_tail(&self, entity: &EntityId) -> bool {
        match self.chains.get(&entity.region()) {
            Some(chain) => entity.number as usize + 1 == chain.len(),
            None => false,
        }
    }

    /// The head of subspace 0 accepts client writes for its keys.
    pub fn is_point_leader(&self, entity: &EntityId) -> bool {
        entity.subspace == 0 && self.is_head(entity)
    }

    /// The next link down the chain in the same region.
    pub fn chain_next(&self, entity: &EntityId) -> Option<EntityId> {
        let chain = self.chains.get(&entity.region())?;
        let next = entity.number as usize + 1;
        if next < chain.len() {
            Some(EntityId::new(entity.space, entity.subspace, entity.prefix, entity.mask, next as u8))
        } else {
            None
        }
    }

    /// Is `b` the link immediately after `a` in the same chain?
    pub fn chain_adjacent(&self, a: &EntityId, b: &EntityId) -> bool {
        a.region() == b.region()
            && a.number + 1 == b.number
            && self.instance_for(b).is_some()
    }

    /// Resolve an entity named by a fully-specified point (prefix 64) to the
    /// concrete entity of whichever region contains that point. The chain
    /// position is clamped to the chain length.
    pub fn sloppy_lookup(&self, entity: &EntityId) -> Option<EntityId> {
        let target = Coordinate::new(64, entity.mask);

        for (region, chain) in &self.chains {
            if region.space != entity.space || region.subspace != entity.subspace {
                continue;
            }
            if chain.is_empty() || !region.coord().contains(&target) {
                continue;
            }
            let number = (entity.number as usize).min(chain.len() - 1) as u8;
            return Some(EntityId::new(region.space, region.subspace, region.prefix, region.mask, number));
        }

        None
    }

    /// All regions hosted by `instance`.
    pub fn regions_for(&self, instance: Instance) -> Vec<RegionId> {
        self.chains
            .iter()
            .filter(|(_, chain)| chain.contains(&instance))
            .map(|(region, _)| *region)
            .collect()
    }

    pub fn quiesce(&self) -> bool {
        self.quiesce
    }

    pub fn quiesce_state_id(&self) -> &str {
        &self.quiesce_state_id
    }
}

#[derive(Debug, Default)]
pub struct ClusterMapBuilder {
    spaces: HashMap<SpaceId, SpaceInfo>,
    chains: BTreeMap<RegionId, Vec<Instance>>,
    quiesce: bool,
    quiesce_state_id: String,
}

impl ClusterMapBuilder {
    /// Register a space. The first subspace must hash the key alone; later
    /// subspaces may hash any mix of attribute indices.
    pub fn space(mut self, space: SpaceId, schema: Schema, subspace_dims: Vec<Vec<u16>>) -> Self {
        let subspaces = subspace_dims.into_iter().map(|dims| SubspaceInfo { dims }).collect();
        self.spaces.insert(space, SpaceInfo { schema, subspaces });
        self
    }

    /// Bind a replica chain (head first) to a region.
    pub fn region(mut self, region: RegionId, chain: Vec<Instance>) -> Self {
        self.chains.insert(region, chain);
        self
    }

    /// Latch the map into quiesce mode under the given state id.
    pub fn quiesce(mut self, state_id: impl Into<String>) -> Self {
        self.quiesce = true;
        self.quiesce_state_id = state_id.into();
        self
    }

    pub fn build(self) -> Result<ClusterMap, NornError> {
        for (region, chain) in &self.chains {
            let info = self
                .spaces
                .get(&region.space)
                .ok_or(NornError::UnknownSpace(region.space))?;

            if region.subspace as usize >= info.subspaces.len() {
                return Err(NornError::InvalidConfig(format!(
                    "region {region:?} names subspace {} but space {} has {}",
                    region.subspace,
                    region.space,
                    info.subspaces.len()
                )));
            }

            if chain.is_empty() {
                return Err(NornError::InvalidConfig(format!("region {region:?} has an empty chain")));
            }

            if region.prefix > 64 {
                return Err(NornError::InvalidConfig(format!(
                    "region {region:?} has prefix > 64"
                )));
            }
        }

        for (space, info) in &self.spaces {
            match info.subspaces.first() {
                Some(first) if first.dims == [0] => {}
                _ => {
                    return Err(NornError::InvalidConfig(format!(
                        "space {space} subspace 0 must hash the key alone"
                    )));
                }
            }
        }

        Ok(ClusterMap {
            spaces: self.spaces,
            chains: self.chains,
            quiesce: self.quiesce,
            quiesce_state_id: self.quiesce_state_id,
        })
    }
}
