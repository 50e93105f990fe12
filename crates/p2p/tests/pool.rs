//! End-to-end pool tests over real sockets on the loopback interface.
use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dexd_p2p::client::handle::{Handle, PoolHandle};
use dexd_p2p::client::nodes::MemoryStore;
use dexd_p2p::{NodeKey, PeerEvent, PoolClient, PoolConfig};
use dexd_types::{NodeAddress, PubKey};

const WAIT: Duration = Duration::from_secs(15);

struct Daemon {
    handle: PoolHandle,
    peers: flume::Receiver<PeerEvent>,
    key: NodeKey,
    addr: SocketAddr,
    cancel: CancellationToken,
}

/// Spawn a pool listening on an OS-assigned loopback port.
async fn daemon(secret: u8, advertise: bool) -> Daemon {
    let key = NodeKey::from_secret_bytes(&[secret; 32]).unwrap();
    let config = PoolConfig {
        listen: true,
        port: 0,
        // A port of zero is patched to the bound port once known.
        addresses: if advertise {
            vec!["127.0.0.1:0".to_owned()]
        } else {
            Vec::new()
        },
        discover: true,
        discover_minutes: 0,
        ..PoolConfig::default()
    };

    let client = PoolClient::new(config, key.clone(), MemoryStore::default())
        .await
        .unwrap();
    let handle = client.handle();
    let peers = client.events().subscribe_peers();
    let cancel = CancellationToken::new();

    tokio::spawn(client.run(cancel.clone()));

    let addr = tokio::time::timeout(WAIT, handle.listening.recv_async())
        .await
        .expect("listener comes up")
        .unwrap();

    Daemon {
        handle,
        peers,
        key,
        addr,
        cancel,
    }
}

fn loopback(port: u16) -> NodeAddress {
    NodeAddress::from(SocketAddr::from(([127, 0, 0, 1], port)))
}

/// Wait until `pub_key` shows up as an active peer.
async fn wait_active(peers: &flume::Receiver<PeerEvent>, pub_key: PubKey) {
    loop {
        let event = tokio::time::timeout(WAIT, peers.recv_async())
            .await
            .expect("peer event arrives")
            .unwrap();

        if let PeerEvent::Active(info) = event {
            if info.pub_key == pub_key {
                return;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_pools_handshake_over_tcp() {
    let a = daemon(0x21, false).await;
    let b = daemon(0x22, false).await;

    let info = a
        .handle
        .add_outbound(
            b.key.pub_key(),
            Some(loopback(b.addr.port())),
            false,
            false,
        )
        .await
        .expect("outbound connection is admitted");

    assert_eq!(info.pub_key, b.key.pub_key());
    wait_active(&b.peers, a.key.pub_key()).await;

    let peers = a.handle.list_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].pub_key, b.key.pub_key());

    a.cancel.cancel();
    b.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn gossip_propagates_new_nodes() {
    // C advertises its loopback address so that B can gossip it onward.
    let b = daemon(0x31, false).await;
    let c = daemon(0x32, true).await;

    b.handle
        .add_outbound(
            c.key.pub_key(),
            Some(loopback(c.addr.port())),
            false,
            false,
        )
        .await
        .expect("b connects to c");

    // A connects to B, asks it for nodes on admission, learns about C, and
    // dials C on its own.
    let a = daemon(0x33, false).await;

    a.handle
        .add_outbound(
            b.key.pub_key(),
            Some(loopback(b.addr.port())),
            false,
            false,
        )
        .await
        .expect("a connects to b");

    wait_active(&a.peers, c.key.pub_key()).await;

    let peers = a.handle.list_peers().await.unwrap();
    let keys = peers.iter().map(|p| p.pub_key).collect::<Vec<_>>();
    assert!(keys.contains(&b.key.pub_key()));
    assert!(keys.contains(&c.key.pub_key()));

    a.cancel.cancel();
    b.cancel.cancel();
    c.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_peer_emits_close_event() {
    let a = daemon(0x41, false).await;
    let b = daemon(0x42, false).await;

    a.handle
        .add_outbound(
            b.key.pub_key(),
            Some(loopback(b.addr.port())),
            false,
            false,
        )
        .await
        .unwrap();
    wait_active(&b.peers, a.key.pub_key()).await;

    a.handle.close_peer(b.key.pub_key(), None).await.unwrap();

    loop {
        let event = tokio::time::timeout(WAIT, b.peers.recv_async())
            .await
            .expect("close event arrives")
            .unwrap();

        if let PeerEvent::Close { pub_key, .. } = event {
            assert_eq!(pub_key, Some(a.key.pub_key()));
            break;
        }
    }

    a.cancel.cancel();
    b.cancel.cancel();
}
