//! End-to-end tests over real loopback sockets: live probes between two
//! peers, the implicit welcome path, the admin plane, and table persistence.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use murmur::admin::{self, AdminCommand};
use murmur::cookies::CookieTableConfig;
use murmur::datagram::{Datagram, Kind};
use murmur::persist;
use murmur::{Cookie, NodeId, Peer, RoutingTable, Server, DEFAULT_K};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

static SCRATCH_COUNTER: AtomicU32 = AtomicU32::new(0);

fn scratch_path(tag: &str) -> PathBuf {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("murmur-it-{tag}-{}-{n}", std::process::id()))
}

fn fresh_table() -> RoutingTable {
    let id = NodeId::random().expect("rng");
    RoutingTable::new(Peer::new(id, "127.0.0.1:0".parse().unwrap()), DEFAULT_K)
}

async fn spawn_peer() -> Server {
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), fresh_table())
        .await
        .expect("bind");
    server.start();
    server
}

/// Poll until the table knows the identifier; welcomes are asynchronous.
async fn wait_for_peer(server: &Server, id: &NodeId) -> Peer {
    for _ in 0..200 {
        if let Some(peer) = server.routing().get(id).await {
            return peer;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("peer {id} never showed up in the routing table");
}

#[tokio::test]
async fn probe_round_trip_introduces_the_prober() {
    let alice = spawn_peer().await;
    let bob = spawn_peer().await;
    let bob_as_seen_by_alice = Peer::new(bob.self_peer().id, bob.local_addr().expect("addr"));

    let alive = timeout(TEST_TIMEOUT, alice.probe(&bob_as_seen_by_alice))
        .await
        .expect("probe must settle quickly on loopback");
    assert!(alive, "a live peer answers its probe");

    // Bob saw a request and welcomed its sender, at the observed address.
    let alice_in_bob = wait_for_peer(&bob, &alice.self_peer().id).await;
    assert_eq!(alice_in_bob.addr, alice.local_addr().expect("addr"));

    // Alice only saw a probe response, which does not welcome.
    assert!(
        alice.routing().get(&bob.self_peer().id).await.is_none(),
        "a probe response must not churn the prober's routing table"
    );
}

#[tokio::test]
async fn probe_to_a_silent_peer_fails_after_the_sweep() {
    let server = Server::bind_with_config(
        "127.0.0.1:0".parse().unwrap(),
        fresh_table(),
        CookieTableConfig {
            request_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
        },
    )
    .await
    .expect("bind");
    server.start();

    // A socket that receives and ignores everything.
    let mute = UdpSocket::bind("127.0.0.1:0").await.expect("bind mute");
    let target = Peer::new(NodeId::random().expect("rng"), mute.local_addr().expect("addr"));

    let alive = timeout(TEST_TIMEOUT, server.probe(&target))
        .await
        .expect("the sweep must close the sink");
    assert!(!alive, "silence reads as an unresponsive peer");
}

#[tokio::test]
async fn non_probe_datagrams_still_welcome_their_sender() {
    let server = spawn_peer().await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let sender_id = NodeId::random().expect("rng");
    let sender_peer = Peer::new(sender_id, sender.local_addr().expect("addr"));

    // A response of a kind this peer has never heard of: no correlation, no
    // handler, but the sender still gets welcomed.
    let stray = Datagram::response(
        Kind::Unknown(0x2a),
        Cookie::random().expect("rng"),
        sender_peer,
        Vec::new(),
    );
    sender
        .send_to(&stray.encode().expect("encode"), server.local_addr().expect("addr"))
        .await
        .expect("send");

    let welcomed = wait_for_peer(&server, &sender_id).await;
    assert_eq!(welcomed.addr, sender.local_addr().expect("addr"));
}

#[tokio::test]
async fn unknown_request_kinds_are_dropped_without_a_reply() {
    let server = spawn_peer().await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let sender_peer = Peer::new(NodeId::random().expect("rng"), sender.local_addr().expect("addr"));

    let stray = Datagram::request(
        Kind::Unknown(0x2a),
        Cookie::random().expect("rng"),
        sender_peer,
        Vec::new(),
    );
    sender
        .send_to(&stray.encode().expect("encode"), server.local_addr().expect("addr"))
        .await
        .expect("send");

    let mut buf = [0u8; 64];
    let answered = timeout(Duration::from_millis(300), sender.recv_from(&mut buf)).await;
    assert!(answered.is_err(), "nothing should answer an unknown kind");
}

#[tokio::test]
async fn stale_responses_are_dropped_silently() {
    let alice = spawn_peer().await;
    let bob = spawn_peer().await;
    let bob_peer = Peer::new(bob.self_peer().id, bob.local_addr().expect("addr"));

    // A response whose cookie was never registered must change nothing.
    let forged = Datagram::response(
        Kind::Probe,
        Cookie::random().expect("rng"),
        bob.self_peer(),
        Vec::new(),
    );
    let raw = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    raw.send_to(&forged.encode().expect("encode"), alice.local_addr().expect("addr"))
        .await
        .expect("send");

    // The plane keeps working: a real probe still succeeds.
    let alive = timeout(TEST_TIMEOUT, alice.probe(&bob_peer))
        .await
        .expect("probe must settle");
    assert!(alive);
}

#[tokio::test]
async fn admin_plane_round_trip() {
    let server = spawn_peer().await;
    let socket_path = scratch_path("admin");
    let listener = tokio::net::UnixListener::bind(&socket_path).expect("bind admin socket");
    let (stop_tx, mut stop_rx) = watch::channel(false);

    {
        let server = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(admin::handle(stream, server.clone(), stop_tx.clone()));
            }
        });
    }

    // self reports a decodable peer string carrying our identifier.
    let text = admin::request(&socket_path, &AdminCommand::SelfInfo)
        .await
        .expect("self info");
    let me = Peer::from_base64(&text).expect("reply is a peer string");
    assert_eq!(me.id, server.self_peer().id);

    // add a fabricated peer, then find it in the bucket listing.
    let other = Peer::new(NodeId::random().expect("rng"), "127.0.0.1:4000".parse().unwrap());
    let reply = admin::request(
        &socket_path,
        &AdminCommand::AddPeer { peer: other.to_base64().expect("encode") },
    )
    .await
    .expect("add peer");
    assert!(reply.contains(&other.id.to_string()));

    let cpl = server.self_peer().id.common_prefix_len(&other.id);
    let index = cpl.min(server.routing().max_index().await);
    let listing = admin::request(&socket_path, &AdminCommand::ListBucket { index })
        .await
        .expect("list bucket");
    assert!(listing.contains(&other.id.to_string()), "listing: {listing}");

    // freshness updates work for known ids and fail loudly for unknown ones.
    let reply = admin::request(
        &socket_path,
        &AdminCommand::UpdateFreshness { id: other.id.to_string() },
    )
    .await
    .expect("update");
    assert_eq!(reply, "peer refreshed");

    let reply = admin::request(
        &socket_path,
        &AdminCommand::UpdateFreshness { id: "00".repeat(20) },
    )
    .await
    .expect("update of unknown id still answers");
    assert!(reply.contains("no such peer"), "reply: {reply}");

    // malformed input comes back as error text, not a hang.
    let reply = admin::request(
        &socket_path,
        &AdminCommand::AddPeer { peer: "definitely not base64".into() },
    )
    .await
    .expect("malformed add still answers");
    assert!(reply.contains("malformed peer string"), "reply: {reply}");

    // stop is acknowledged before the shutdown signal fires.
    let reply = admin::request(&socket_path, &AdminCommand::Stop).await.expect("stop");
    assert!(reply.is_empty(), "stop acknowledges with an empty success");
    timeout(TEST_TIMEOUT, stop_rx.changed())
        .await
        .expect("stop must trip the shutdown signal")
        .expect("sender alive");

    let _ = std::fs::remove_file(&socket_path);
}

#[tokio::test]
async fn routing_table_survives_a_restart() {
    let first = spawn_peer().await;
    let learned = Peer::new(NodeId::random().expect("rng"), "127.0.0.1:5000".parse().unwrap());
    first.routing().add(learned.id, learned.addr, &first).await;

    let path = scratch_path("snapshot");
    persist::save(&path, &first.routing().snapshot().await)
        .await
        .expect("save");
    first.stop();

    let reloaded = RoutingTable::from_snapshot(
        persist::load(&path).await.expect("load"),
        DEFAULT_K,
    )
    .expect("rebuild");
    let _ = tokio::fs::remove_file(&path).await;

    let second = Server::bind("127.0.0.1:0".parse().unwrap(), reloaded)
        .await
        .expect("bind");
    assert_eq!(second.self_peer().id, first.self_peer().id, "identity persists");
    let restored = second.routing().get(&learned.id).await.expect("peer persisted");
    assert_eq!(restored.addr, learned.addr);
}
