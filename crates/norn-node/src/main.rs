use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use norn_cluster::ClusterMap;
use norn_replication::loopback::{
    spawn_dispatch, ChannelCoordinator, LoopbackNetwork, NullTransfers,
};
use norn_replication::{Message, ReplicationManager};
use norn_storage::{DataLayer, FjallDataLayer, MemDataLayer};
use norn_types::{AttrType, EntityId, Instance, MsgType, RegionId, ReturnCode, Schema};
use norn_values::{MicroAction, MicroOp};

#[derive(clap::Parser, Debug)]
#[command(name = "norn-node", about = "Norn replication node (single-process cluster)")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the storage data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Override the demo workload size (0 disables it).
    #[arg(long)]
    ops: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    backend: String,
    data_dir: String,
}

#[derive(Debug, Deserialize)]
struct SpaceConfig {
    id: u32,
    key_type: String,
    value_types: Vec<String>,
    subspace_dims: Vec<Vec<u16>>,
}

#[derive(Debug, Deserialize)]
struct ClusterConfig {
    chain_length: usize,
    region_prefix_bits: u8,
}

#[derive(Debug, Deserialize)]
struct WorkloadConfig {
    ops: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    space: SpaceConfig,
    cluster: ClusterConfig,
    workload: WorkloadConfig,
    observability: ObservabilityConfig,
}

fn parse_attr_type(name: &str) -> anyhow::Result<AttrType> {
    match name {
        "string" => Ok(AttrType::String),
        "int" => Ok(AttrType::Int),
        "float" => Ok(AttrType::Float),
        other => anyhow::bail!("unknown attribute type '{other}'"),
    }
}

/// Build the cluster map described by the config: one chain per region, one
/// fresh instance token per chain link. Deterministic, so a quiesce rebuild
/// binds the same instances.
fn build_map(cfg: &Config, quiesce: Option<&str>) -> anyhow::Result<(Arc<ClusterMap>, Vec<Instance>)> {
    let mut attrs = vec![parse_attr_type(&cfg.space.key_type)?];
    for ty in &cfg.space.value_types {
        attrs.push(parse_attr_type(ty)?);
    }

    let mut dims: Vec<Vec<u16>> = vec![vec![0]];
    dims.extend(cfg.space.subspace_dims.iter().cloned());

    let mut builder = ClusterMap::builder().space(cfg.space.id, Schema::new(attrs), dims.clone());
    if let Some(state_id) = quiesce {
        builder = builder.quiesce(state_id);
    }

    let prefix = cfg.cluster.region_prefix_bits;
    anyhow::ensure!(prefix <= 63, "region_prefix_bits must be at most 63");
    anyhow::ensure!(cfg.cluster.chain_length > 0, "chain_length must be positive");

    let mut token = 0u64;
    let mut instances = Vec::new();

    for subspace in 0..dims.len() as u16 {
        for i in 0..(1u64 << prefix) {
            let mask = if prefix == 0 { 0 } else { i << (64 - prefix as u32) };
            let region = RegionId::new(cfg.space.id, subspace, prefix, mask);
            let chain: Vec<Instance> = (0..cfg.cluster.chain_length)
                .map(|_| {
                    token += 1;
                    let instance = Instance::new(token);
                    instances.push(instance);
                    instance
                })
                .collect();
            builder = builder.region(region, chain);
        }
    }

    let map = builder.build().context("invalid cluster map")?;
    Ok((Arc::new(map), instances))
}

type NodeManager<D> = ReplicationManager<D, LoopbackNetwork, ChannelCoordinator, NullTransfers>;

/// Value bytes for the demo workload, matching the attribute's type.
fn demo_arg(ty: AttrType, op: u64, attr: u16) -> Bytes {
    match ty {
        AttrType::String => Bytes::from(format!("value-{op}-{attr}").into_bytes()),
        AttrType::Int => Bytes::copy_from_slice(&(op as i64).to_le_bytes()),
        AttrType::Float => Bytes::copy_from_slice(&(op as f64).to_le_bytes()),
    }
}

async fn run_workload<D: DataLayer>(
    cfg: &Config,
    map: &Arc<ClusterMap>,
    net: &Arc<LoopbackNetwork>,
    managers: &HashMap<Instance, Arc<NodeManager<D>>>,
    ops: u64,
) -> anyhow::Result<()> {
    let client = EntityId::new(u32::MAX, 0, 0, 0, 0);
    let mut responses = net.register_client(client);
    let hasher = map.hasher(cfg.space.id, 0).context("space missing from map")?;

    let value_types: Vec<AttrType> = cfg
        .space
        .value_types
        .iter()
        .map(|t| parse_attr_type(t))
        .collect::<anyhow::Result<_>>()?;

    let mut succeeded = 0u64;

    for op in 0..ops {
        let key = Bytes::from(format!("key-{op:04}").into_bytes());

        // Route to the point-leader of whichever region owns the key.
        let point = hasher.hash(&key, &[]).point;
        let probe = EntityId::new(cfg.space.id, 0, 64, point, 0);
        let leader = map.sloppy_lookup(&probe).context("no region covers the key")?;
        let instance = map.instance_for(&leader).context("point-leader is unbound")?;
        let manager = managers.get(&instance).context("no manager for instance")?;

        let micro_ops: Vec<MicroOp> = value_types
            .iter()
            .enumerate()
            .map(|(i, ty)| MicroOp {
                attr: i as u16 + 1,
                action: MicroAction::Set,
                datatype: *ty,
                arg: demo_arg(*ty, op, i as u16 + 1),
            })
            .collect();

        manager
            .client_atomic(MsgType::RespAtomic, client, leader, op, key.clone(), vec![], micro_ops, false, false)
            .await;

        let response = tokio::time::timeout(Duration::from_secs(10), responses.recv())
            .await
            .context("timed out waiting for a client response")?
            .context("client mailbox closed")?;

        match response.msg {
            Message::Response { result: ReturnCode::Success, .. } => succeeded += 1,
            Message::Response { result, nonce, .. } => {
                tracing::warn!(?result, nonce, "demo write rejected");
            }
            other => tracing::warn!(?other, "unexpected message on the client mailbox"),
        }
    }

    tracing::info!(succeeded, total = ops, "demo workload finished");
    Ok(())
}

async fn run<D, F>(cfg: &Config, mut data_for: F) -> anyhow::Result<()>
where
    D: DataLayer,
    F: FnMut(Instance) -> anyhow::Result<Arc<D>>,
{
    let (map, instances) = build_map(cfg, None)?;
    let net = LoopbackNetwork::new(map.clone());

    let mut managers: HashMap<Instance, Arc<NodeManager<D>>> = HashMap::new();
    let mut quiesce_signals = Vec::new();

    for instance in &instances {
        let data = data_for(*instance)?;
        let (coordinator, quiesced) = ChannelCoordinator::new();
        let manager = ReplicationManager::new(
            *instance,
            map.clone(),
            data,
            net.clone(),
            coordinator,
            NullTransfers::new(),
        );

        let mailbox = net.register_instance(*instance);
        spawn_dispatch(manager.clone(), mailbox);
        tokio::spawn(manager.clone().run_periodic());

        quiesce_signals.push(quiesced);
        managers.insert(*instance, manager);
    }

    tracing::info!(replicas = instances.len(), "cluster assembled in-process");

    if cfg.workload.ops > 0 {
        run_workload(cfg, &map, &net, &managers, cfg.workload.ops).await?;
    }

    tracing::info!("running; press ctrl-c to quiesce and exit");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    // Drive the cooperative freeze: install a quiescing map everywhere and
    // wait for every replica's retransmitter to report a clean state.
    let (quiesce_map, _) = build_map(cfg, Some("shutdown"))?;
    net.set_config(quiesce_map.clone());
    for (instance, manager) in &managers {
        manager.reconfigure(quiesce_map.clone(), *instance);
    }

    for signal in &mut quiesce_signals {
        if let Some(state_id) = signal.recv().await {
            tracing::debug!(%state_id, "replica quiesced");
        }
    }

    tracing::info!("all replicas quiesced; exiting");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("NORN_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Some(ops) = cli.ops {
        config.workload.ops = ops;
    }
    if let Some(ref dir) = cli.data_dir {
        config.storage.data_dir = dir.display().to_string();
    }

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    tracing::info!(
        backend = %config.storage.backend,
        space = config.space.id,
        "node starting"
    );

    match config.storage.backend.as_str() {
        "mem" => run(&config, |_| Ok(Arc::new(MemDataLayer::new()))).await,
        "fjall" => {
            let base = PathBuf::from(&config.storage.data_dir);
            run(&config, move |instance| {
                let dir = base.join(format!("instance-{}", instance.token));
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
                Ok(Arc::new(FjallDataLayer::open(&dir)?))
            })
            .await
        }
        other => anyhow::bail!("unknown storage backend '{other}'"),
    }
}
