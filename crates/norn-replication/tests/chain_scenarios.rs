//! End-to-end scenarios for the replication state machine, driven over
//! recording and loopback networks with in-memory storage.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use norn_cluster::ClusterMap;
use norn_replication::loopback::{
    spawn_dispatch, ChannelCoordinator, LoopbackNetwork, RecordingNetwork, RecordingTransfers,
};
use norn_replication::{Message, ReplicationManager};
use norn_storage::{DataLayer, GetOutcome, MemDataLayer};
use norn_types::{AttrType, EntityId, Instance, MsgType, RegionId, ReturnCode, Schema};
use norn_values::{MicroAction, MicroCheck, MicroOp};

fn key() -> Bytes {
    Bytes::from_static(b"k")
}

fn client() -> EntityId {
    EntityId::new(u32::MAX, 0, 0, 0, 0)
}

fn bval(parts: &[&[u8]]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
}

fn set_str(attr: u16, v: &[u8]) -> MicroOp {
    MicroOp {
        attr,
        action: MicroAction::Set,
        datatype: AttrType::String,
        arg: Bytes::copy_from_slice(v),
    }
}

fn int_bytes(v: i64) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

/// One space, one subspace, one whole-space region served by one instance,
/// so the point-leader is also the tail.
fn single_node_map() -> Arc<ClusterMap> {
    Arc::new(
        ClusterMap::builder()
            .space(1, Schema::new(vec![AttrType::String, AttrType::String]), vec![vec![0]])
            .region(RegionId::new(1, 0, 0, 0), vec![Instance::new(1)])
            .build()
            .unwrap(),
    )
}

type TestManager =
    ReplicationManager<MemDataLayer, RecordingNetwork, ChannelCoordinator, RecordingTransfers>;

fn manager(
    us: Instance,
    map: Arc<ClusterMap>,
) -> (Arc<TestManager>, Arc<MemDataLayer>, Arc<RecordingNetwork>, Arc<RecordingTransfers>) {
    let data = Arc::new(MemDataLayer::new());
    let net = RecordingNetwork::new();
    let (coordinator, _rx) = ChannelCoordinator::new();
    let transfers = RecordingTransfers::new();
    let mgr = ReplicationManager::new(us, map, data.clone(), net.clone(), coordinator, transfers.clone());
    (mgr, data, net, transfers)
}

// ---------------------------------------------------------------------------
// S1: single-key insert, committed and acknowledged end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn insert_commits_and_answers_client_exactly_once() {
    let map = single_node_map();
    let (mgr, data, net, transfers) = manager(Instance::new(1), map);
    let leader = EntityId::new(1, 0, 0, 0, 0);
    let region = leader.region();

    mgr.client_atomic(
        MsgType::RespAtomic,
        client(),
        leader,
        7,
        key(),
        vec![],
        vec![set_str(1, b"v1")],
        false,
        false,
    )
    .await;

    // The tail of the last subspace closes the loop with a self-ack.
    let sent = net.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, leader);
    assert_eq!(sent[0].msg, Message::ChainAck { version: 1, key: key() });

    mgr.chain_ack(leader, leader, 1, key()).await;

    match data.get(region, b"k").await.unwrap() {
        GetOutcome::Found { value, version, .. } => {
            assert_eq!(version, 1);
            assert_eq!(value, bval(&[b"v1"]));
        }
        GetOutcome::NotFound => panic!("insert must be durable after the ack"),
    }

    let sent = net.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, client());
    assert_eq!(
        sent[0].msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 7, result: ReturnCode::Success }
    );

    assert_eq!(transfers.take(), vec![(region, key(), 1)]);
    // Fully drained state is erased.
    assert_eq!(mgr.keyholder_count(), 0);
}

// ---------------------------------------------------------------------------
// S2: out-of-order chain delivery defers, then forwards in order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn out_of_order_delivery_is_deferred_then_forwarded_in_order() {
    // Three-link chain; the replica under test is the middle link.
    let map = Arc::new(
        ClusterMap::builder()
            .space(1, Schema::new(vec![AttrType::String, AttrType::String]), vec![vec![0]])
            .region(
                RegionId::new(1, 0, 0, 0),
                vec![Instance::new(1), Instance::new(2), Instance::new(3)],
            )
            .build()
            .unwrap(),
    );
    let (mgr, data, net, _) = manager(Instance::new(2), map);

    let head = EntityId::new(1, 0, 0, 0, 0);
    let mid = EntityId::new(1, 0, 0, 0, 1);
    let next = EntityId::new(1, 0, 0, 0, 2);
    let region = mid.region();

    data.put(region, b"k", &bval(&[b"v3"]), 3).await.unwrap();

    // Version 5 arrives before version 4 while disk sits at 3.
    mgr.chain_put(head, mid, 5, false, key(), bval(&[b"v5"])).await;
    assert!(net.take().is_empty());
    assert_eq!(mgr.keyholder_count(), 1);

    mgr.chain_put(head, mid, 4, false, key(), bval(&[b"v4"])).await;

    let sent = net.take();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[0].msg,
        Message::ChainPut { version: 4, fresh: false, key: key(), value: bval(&[b"v4"]) }
    );
    assert_eq!(sent[0].to, next);
    assert_eq!(
        sent[1].msg,
        Message::ChainPut { version: 5, fresh: false, key: key(), value: bval(&[b"v5"]) }
    );

    // Acks commit in order and propagate upstream.
    mgr.chain_ack(next, mid, 4, key()).await;
    mgr.chain_ack(next, mid, 5, key()).await;

    match data.get(region, b"k").await.unwrap() {
        GetOutcome::Found { version, value, .. } => {
            assert_eq!(version, 5);
            assert_eq!(value, bval(&[b"v5"]));
        }
        GetOutcome::NotFound => panic!("chain writes must be durable"),
    }

    let sent = net.take();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].to, head);
    assert_eq!(sent[0].msg, Message::ChainAck { version: 4, key: key() });
    assert_eq!(sent[1].msg, Message::ChainAck { version: 5, key: key() });
    assert_eq!(mgr.keyholder_count(), 0);
}

// ---------------------------------------------------------------------------
// S3: compare-and-set mismatch rejects without a new version
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_check_returns_cmpfail_and_changes_nothing() {
    let map = Arc::new(
        ClusterMap::builder()
            .space(1, Schema::new(vec![AttrType::String, AttrType::Int]), vec![vec![0]])
            .region(RegionId::new(1, 0, 0, 0), vec![Instance::new(1)])
            .build()
            .unwrap(),
    );
    let (mgr, data, net, _) = manager(Instance::new(1), map);
    let leader = EntityId::new(1, 0, 0, 0, 0);
    let region = leader.region();

    data.put(region, b"k", &[int_bytes(1)], 1).await.unwrap();

    mgr.client_atomic(
        MsgType::RespAtomic,
        client(),
        leader,
        9,
        key(),
        vec![MicroCheck { attr: 1, datatype: AttrType::Int, value: int_bytes(2) }],
        vec![MicroOp {
            attr: 1,
            action: MicroAction::Set,
            datatype: AttrType::Int,
            arg: int_bytes(3),
        }],
        false,
        false,
    )
    .await;

    let sent = net.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 9, result: ReturnCode::CmpFail }
    );

    match data.get(region, b"k").await.unwrap() {
        GetOutcome::Found { version, value, .. } => {
            assert_eq!(version, 1);
            assert_eq!(value, vec![int_bytes(1)]);
        }
        GetOutcome::NotFound => panic!("row must be untouched"),
    }

    // Nothing was enqueued; the retransmit pass reaps the empty holder.
    assert_eq!(mgr.retransmit().await, 1);
    assert_eq!(mgr.keyholder_count(), 0);
}

// ---------------------------------------------------------------------------
// S4: a boundary-crossing update runs a subspace transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn boundary_crossing_update_hands_the_key_across_regions() {
    // Subspace 0 routes by key; subspace 1 routes by attribute 1 and is
    // split in half, so rewriting attribute 1 can relocate the key.
    let map = Arc::new(
        ClusterMap::builder()
            .space(
                1,
                Schema::new(vec![AttrType::String, AttrType::String]),
                vec![vec![0], vec![1]],
            )
            .region(RegionId::new(1, 0, 0, 0), vec![Instance::new(1)])
            .region(RegionId::new(1, 1, 1, 0), vec![Instance::new(2)])
            .region(RegionId::new(1, 1, 1, 1 << 63), vec![Instance::new(3)])
            .build()
            .unwrap(),
    );

    // Find attribute values that land in each half of subspace 1.
    let hasher = map.hasher(1, 1).unwrap();
    let mut low = None;
    let mut high = None;
    for i in 0u32..2048 {
        let v = format!("attr{i}").into_bytes();
        let point = hasher.hash(b"k", &bval(&[v.as_slice()])).point;
        if point >> 63 == 0 && low.is_none() {
            low = Some(v);
        } else if point >> 63 == 1 && high.is_none() {
            high = Some(v);
        }
        if low.is_some() && high.is_some() {
            break;
        }
    }
    let (low, high) = (low.unwrap(), high.unwrap());

    let net = LoopbackNetwork::new(map.clone());
    let transfers = RecordingTransfers::new();

    let mut datas = Vec::new();
    let mut managers = Vec::new();
    for token in 1..=3u64 {
        let us = Instance::new(token);
        let data = Arc::new(MemDataLayer::new());
        let (coordinator, _rx) = ChannelCoordinator::new();
        let mgr = ReplicationManager::new(
            us,
            map.clone(),
            data.clone(),
            net.clone(),
            coordinator,
            transfers.clone(),
        );
        let rx = net.register_instance(us);
        spawn_dispatch(mgr.clone(), rx);
        datas.push(data);
        managers.push(mgr);
    }

    let mut client_rx = net.register_client(client());
    let leader = EntityId::new(1, 0, 0, 0, 0);
    let region_low = RegionId::new(1, 1, 1, 0);
    let region_high = RegionId::new(1, 1, 1, 1 << 63);

    // Insert with the low-half attribute.
    managers[0]
        .client_atomic(
            MsgType::RespAtomic,
            client(),
            leader,
            1,
            key(),
            vec![],
            vec![set_str(1, &low)],
            false,
            false,
        )
        .await;

    let resp = tokio::time::timeout(Duration::from_secs(5), client_rx.recv())
        .await
        .expect("insert must complete")
        .unwrap();
    assert_eq!(
        resp.msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 1, result: ReturnCode::Success }
    );
    assert!(matches!(
        datas[1].get(region_low, b"k").await.unwrap(),
        GetOutcome::Found { version: 1, .. }
    ));

    // Rewrite the attribute so the key belongs to the other half.
    managers[0]
        .client_atomic(
            MsgType::RespAtomic,
            client(),
            leader,
            2,
            key(),
            vec![],
            vec![set_str(1, &high)],
            false,
            false,
        )
        .await;

    let resp = tokio::time::timeout(Duration::from_secs(5), client_rx.recv())
        .await
        .expect("update must complete")
        .unwrap();
    assert_eq!(
        resp.msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 2, result: ReturnCode::Success }
    );

    // The old location deleted its stale row on commit...
    assert!(matches!(
        datas[1].get(region_low, b"k").await.unwrap(),
        GetOutcome::NotFound
    ));
    // ...and the new location owns the key now.
    match datas[2].get(region_high, b"k").await.unwrap() {
        GetOutcome::Found { version, value, .. } => {
            assert_eq!(version, 2);
            assert_eq!(value, bval(&[high.as_slice()]));
        }
        GetOutcome::NotFound => panic!("key must live in the new region"),
    }
}

// ---------------------------------------------------------------------------
// Fresh writes and deletes wait for in-flight updates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_waits_for_inflight_update_to_drain() {
    let map = Arc::new(
        ClusterMap::builder()
            .space(1, Schema::new(vec![AttrType::String, AttrType::String]), vec![vec![0]])
            .region(RegionId::new(1, 0, 0, 0), vec![Instance::new(1), Instance::new(2)])
            .build()
            .unwrap(),
    );
    let (mgr, data, net, _) = manager(Instance::new(1), map);
    let leader = EntityId::new(1, 0, 0, 0, 0);
    let downstream = EntityId::new(1, 0, 0, 0, 1);
    let region = leader.region();

    data.put(region, b"k", &bval(&[b"v1"]), 1).await.unwrap();

    mgr.client_atomic(
        MsgType::RespAtomic,
        client(),
        leader,
        1,
        key(),
        vec![],
        vec![set_str(1, b"v2")],
        false,
        false,
    )
    .await;

    let sent = net.take();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].msg, Message::ChainPut { version: 2, .. }));

    // The delete enqueues behind the unacked update and must not be
    // forwarded yet.
    mgr.client_del(MsgType::RespAtomic, client(), leader, 2, key(), vec![]).await;
    assert!(net.take().is_empty());

    // Acking the update releases the delete; the pump forwards it before
    // the client hears about the first op.
    mgr.chain_ack(downstream, leader, 2, key()).await;
    let sent = net.take();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].msg, Message::ChainDel { version: 3, key: key() });
    assert_eq!(
        sent[1].msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 1, result: ReturnCode::Success }
    );

    mgr.chain_ack(downstream, leader, 3, key()).await;
    assert!(matches!(data.get(region, b"k").await.unwrap(), GetOutcome::NotFound));

    let sent = net.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 2, result: ReturnCode::Success }
    );
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivery_of_a_committed_version_just_acks() {
    let map = Arc::new(
        ClusterMap::builder()
            .space(1, Schema::new(vec![AttrType::String, AttrType::String]), vec![vec![0]])
            .region(RegionId::new(1, 0, 0, 0), vec![Instance::new(1), Instance::new(2)])
            .build()
            .unwrap(),
    );
    let (mgr, data, net, _) = manager(Instance::new(2), map);
    let head = EntityId::new(1, 0, 0, 0, 0);
    let tail = EntityId::new(1, 0, 0, 0, 1);
    let region = tail.region();

    data.put(region, b"k", &bval(&[b"v3"]), 3).await.unwrap();

    mgr.chain_put(head, tail, 2, false, key(), bval(&[b"v2"])).await;

    let sent = net.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, head);
    assert_eq!(sent[0].msg, Message::ChainAck { version: 2, key: key() });

    // No state was created beyond the (empty) holder, and the row is intact.
    match data.get(region, b"k").await.unwrap() {
        GetOutcome::Found { version, .. } => assert_eq!(version, 3),
        GetOutcome::NotFound => panic!("row must be untouched"),
    }
    mgr.retransmit().await;
    assert_eq!(mgr.keyholder_count(), 0);
}

#[tokio::test]
async fn any_delivery_order_forwards_versions_in_order() {
    let map = Arc::new(
        ClusterMap::builder()
            .space(1, Schema::new(vec![AttrType::String, AttrType::String]), vec![vec![0]])
            .region(
                RegionId::new(1, 0, 0, 0),
                vec![Instance::new(1), Instance::new(2), Instance::new(3)],
            )
            .build()
            .unwrap(),
    );
    let (mgr, data, net, _) = manager(Instance::new(2), map);
    let head = EntityId::new(1, 0, 0, 0, 0);
    let mid = EntityId::new(1, 0, 0, 0, 1);
    let region = mid.region();

    data.put(region, b"k", &bval(&[b"v1"]), 1).await.unwrap();

    // Deliver versions 2..=6 in a random permutation.
    let mut order: Vec<u64> = (2..=6).collect();
    order.sort_by_key(|_| rand::random::<u64>());

    for v in &order {
        let value = bval(&[format!("v{v}").as_bytes()]);
        mgr.chain_put(head, mid, *v, false, key(), value).await;
    }

    // Whatever the arrival order, the chain only ever sees 2, 3, 4, 5, 6.
    let forwarded: Vec<u64> = net
        .take()
        .into_iter()
        .map(|env| match env.msg {
            Message::ChainPut { version, .. } => version,
            other => panic!("unexpected message {other:?}"),
        })
        .collect();
    assert_eq!(forwarded, vec![2, 3, 4, 5, 6], "delivery order was {order:?}");
}

#[tokio::test]
async fn duplicate_ack_is_a_no_op() {
    let map = single_node_map();
    let (mgr, _data, net, _) = manager(Instance::new(1), map);
    let leader = EntityId::new(1, 0, 0, 0, 0);

    mgr.client_atomic(
        MsgType::RespAtomic,
        client(),
        leader,
        5,
        key(),
        vec![],
        vec![set_str(1, b"v")],
        false,
        false,
    )
    .await;
    net.take();

    mgr.chain_ack(leader, leader, 1, key()).await;
    let sent = net.take();
    assert_eq!(sent.len(), 1); // exactly one client response

    // The same ack again finds no pending op and changes nothing.
    mgr.chain_ack(leader, leader, 1, key()).await;
    assert!(net.take().is_empty());
}

#[tokio::test]
async fn conditional_put_flags_are_honored() {
    let map = single_node_map();
    let (mgr, data, net, _) = manager(Instance::new(1), map);
    let leader = EntityId::new(1, 0, 0, 0, 0);
    let region = leader.region();

    // fail_if_not_found on an absent key.
    mgr.client_atomic(
        MsgType::RespAtomic,
        client(),
        leader,
        1,
        key(),
        vec![],
        vec![set_str(1, b"v")],
        true,
        false,
    )
    .await;
    let sent = net.take();
    assert_eq!(
        sent[0].msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 1, result: ReturnCode::NotFound }
    );

    // fail_if_found on an existing key.
    data.put(region, b"k", &bval(&[b"v"]), 1).await.unwrap();
    mgr.client_atomic(
        MsgType::RespAtomic,
        client(),
        leader,
        2,
        key(),
        vec![],
        vec![set_str(1, b"w")],
        false,
        true,
    )
    .await;
    let sent = net.take();
    assert_eq!(
        sent[0].msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 2, result: ReturnCode::CmpFail }
    );

    // Deleting a missing key reports NotFound.
    mgr.client_del(MsgType::RespAtomic, client(), leader, 3, Bytes::from_static(b"absent"), vec![])
        .await;
    let sent = net.take();
    assert_eq!(
        sent[0].msg,
        Message::Response { msgtype: MsgType::RespAtomic, nonce: 3, result: ReturnCode::NotFound }
    );
}
