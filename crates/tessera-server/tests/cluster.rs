use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tessera_consensus::{RaftNode, RaftSettings, ReplicaNode};
use tessera_server::{leader_locator, serve_cluster, ClusterClient, SequenceGrantor, Store};
use tessera_storage::keys::data_key;
use tessera_storage::{KvStore, SqlValue};
use tessera_types::{Error, NodeId};
use tessera_wire::{Mux, MuxConfig, Protocol};

struct TestNode {
    node: Arc<ReplicaNode>,
    store: Store<ReplicaNode>,
    addr: String,
    _dir: tempfile::TempDir,
}

fn fast() -> RaftSettings {
    RaftSettings {
        heartbeat_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn start(id: NodeId, seed: Option<String>) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let mut mux = Mux::bind("127.0.0.1:0", MuxConfig::default()).await.unwrap();
    let peers = mux.listener(Protocol::Peer);
    let internal = mux.listener(Protocol::InternalRpc);
    let addr = mux.local_addr().to_string();
    tokio::spawn(mux.serve());

    let kv = KvStore::open(dir.path()).unwrap();
    let node = Arc::new(ReplicaNode::start(id, fast(), kv, peers, MuxConfig::default()).await.unwrap());
    let grantor = Arc::new(SequenceGrantor::new(node.clone(), 5).unwrap());
    tokio::spawn(serve_cluster(internal, node.clone(), grantor.clone()));

    let client = ClusterClient::new(seed, MuxConfig::default(), Duration::from_secs(10))
        .with_locator(leader_locator(node.clone()));
    let store = Store::new(node.clone(), grantor, Arc::new(client));
    TestNode { node, store, addr, _dir: dir }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_forward_and_replicate() {
    let n1 = start(1, None).await;
    n1.node.initialize(&n1.addr).await.unwrap();
    assert_eq!(n1.node.wait_for_leader(Duration::from_secs(10)).await.unwrap(), 1);

    let n2 = start(2, Some(n1.addr.clone())).await;
    let n3 = start(3, Some(n1.addr.clone())).await;

    // Non-members join through their seed, which reaches the leader.
    n2.store.join(2, &n2.addr).await.unwrap();
    n3.store.join(3, &n3.addr).await.unwrap();
    for n in [&n2, &n3] {
        assert_eq!(n.node.wait_for_leader(Duration::from_secs(10)).await.unwrap(), 1);
    }

    // A follower's write is forwarded to the leader.
    n3.store.set(b"region/eu", b"dc-1").await.unwrap();
    for n in [&n1, &n2, &n3] {
        let fsm = n.node.fsm().clone();
        eventually(|| {
            let fsm = fsm.clone();
            async move { fsm.get(data_key(b"region/eu")).await.unwrap().as_deref() == Some(&b"dc-1"[..]) }
        })
        .await;
    }

    // Reads through the log see the write from any member.
    assert_eq!(n2.store.get(b"region/eu").await.unwrap(), Some(b"dc-1".to_vec()));
    assert_eq!(n2.store.get(b"region/us").await.unwrap(), None);

    n2.store.set(b"region/us", b"dc-2").await.unwrap();
    n2.store.delete(b"region/eu").await.unwrap();
    assert_eq!(n1.store.get(b"region/eu").await.unwrap(), None);
    let regions = n1.store.scan_prefix(b"region/").await.unwrap();
    assert_eq!(regions, vec![(b"region/us".to_vec(), b"dc-2".to_vec())]);

    // SQL replicates; errors come back in the response.
    let resp = n3.store.exec("CREATE TABLE tenants (id INTEGER, name TEXT)").await.unwrap();
    assert!(resp.is_success, "{}", resp.error_message);
    n2.store.exec("INSERT INTO tenants VALUES (1, 'acme')").await.unwrap();
    let resp = n2.store.exec("INSERT INTO missing VALUES (1)").await.unwrap();
    assert!(!resp.is_success);
    assert!(!resp.error_message.is_empty());

    let fsm = n3.node.fsm().clone();
    eventually(|| {
        let fsm = fsm.clone();
        // The table itself may not have reached this replica yet.
        async move {
            fsm.query("SELECT name FROM tenants".into())
                .await
                .map(|result| !result.rows.is_empty())
                .unwrap_or(false)
        }
    })
    .await;
    let rows = n3.store.query("SELECT name FROM tenants").await.unwrap().rows;
    assert_eq!(rows, vec![vec![SqlValue::Text("acme".into())]]);

    // The local read path never writes to one replica behind the others' back.
    let err = n3.store.query("INSERT INTO tenants VALUES (2, 'rogue')").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let rows = n3.store.query("SELECT name FROM tenants").await.unwrap().rows;
    assert_eq!(rows.len(), 1);

    for n in [&n1, &n2, &n3] {
        n.node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequences_are_unique_across_members() {
    let n1 = start(1, None).await;
    n1.node.initialize(&n1.addr).await.unwrap();
    n1.node.wait_for_leader(Duration::from_secs(10)).await.unwrap();
    let n2 = start(2, Some(n1.addr.clone())).await;
    n2.store.join(2, &n2.addr).await.unwrap();
    n2.node.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    let mut seen = HashSet::new();
    for _ in 0..300 {
        assert!(seen.insert(n1.store.next_sequence_value_by_id("tables").await.unwrap()));
        assert!(seen.insert(n2.store.next_sequence_value_by_id("tables").await.unwrap()));
    }

    // Lanes granted to different callers never overlap.
    let a = n2.store.get_sequence_chunk("shards").await.unwrap();
    let b = n1.store.get_sequence_chunk("shards").await.unwrap();
    assert_eq!((a.start, a.offset), (0, 0));
    assert_eq!((b.start, b.offset), (0, 1));

    // Node ids come from the reserved sequence, via any member.
    let client = ClusterClient::new(Some(n2.addr.clone()), MuxConfig::default(), Duration::from_secs(10));
    let first = client.get_node_id().await.unwrap();
    let second = client.get_node_id().await.unwrap();
    // Ids held by current members are skipped.
    assert!(first > 2);
    assert_ne!(first, second);

    let err = client.get_sequence_chunk("").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    n2.node.shutdown().await.unwrap();
    n1.node.shutdown().await.unwrap();
}
