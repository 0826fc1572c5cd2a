//! End-to-end protocol tests over real sockets on the loopback interface.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use svcmesh_core::{MemberConfig, NodeId};
use svcmesh_gossip::message::{self, MessageType, SuspectBody};
use svcmesh_gossip::{
    Cluster, ClusterSize, Delegate, EventDelegate, Member, TransmitLimitedQueue,
};

fn fast_config(name: &str) -> MemberConfig {
    let mut config = MemberConfig::default();
    config.service_name = "itest".to_string();
    config.node_name = name.to_string();
    config.bind_port = 0;
    config.advertise_host = "127.0.0.1".to_string();
    config.probe_interval = Duration::from_millis(300);
    config.probe_timeout = Duration::from_millis(100);
    config.gossip_interval = Duration::from_millis(40);
    config.suspicion_mult = 2;
    config.push_pull_interval = Duration::from_secs(30);
    config.tcp_timeout = Duration::from_secs(2);
    config
}

/// Records every event edge for assertions on exactness.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    fn count(&self, kind: &str, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(k, n)| k == kind && n == name)
            .count()
    }
}

impl EventDelegate for Recorder {
    fn notify_join(&self, member: &Member) {
        self.events
            .lock()
            .push(("join".to_string(), member.name.to_string()));
    }

    fn notify_leave(&self, member: &Member) {
        self.events
            .lock()
            .push(("leave".to_string(), member.name.to_string()));
    }

    fn notify_update(&self, member: &Member) {
        self.events
            .lock()
            .push(("update".to_string(), member.name.to_string()));
    }
}

/// Delegate with a real user queue and a record of everything received.
struct TestDelegate {
    queue: TransmitLimitedQueue,
    meta: Mutex<Vec<u8>>,
    state: Vec<u8>,
    received: Mutex<Vec<Vec<u8>>>,
    merged: Mutex<Vec<Vec<u8>>>,
}

impl TestDelegate {
    fn new(state: &[u8], size: ClusterSize) -> Self {
        Self {
            queue: TransmitLimitedQueue::new(4, Box::new(move || size.get())),
            meta: Mutex::new(Vec::new()),
            state: state.to_vec(),
            received: Mutex::new(Vec::new()),
            merged: Mutex::new(Vec::new()),
        }
    }
}

impl Delegate for TestDelegate {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        self.meta.lock().clone()
    }

    fn notify_msg(&self, msg: &[u8]) {
        self.received.lock().push(msg.to_vec());
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.queue
            .get_broadcasts(overhead, limit)
            .into_iter()
            .map(|b| b.body)
            .collect()
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        self.state.clone()
    }

    fn merge_remote_state(&self, state: &[u8], _join: bool) {
        self.merged.lock().push(state.to_vec());
    }
}

async fn wait_until(what: &str, deadline: Duration, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Node {
    cluster: Cluster,
    delegate: Arc<TestDelegate>,
    recorder: Arc<Recorder>,
}

async fn start_node(name: &str) -> Node {
    let size = ClusterSize::new();
    let delegate = Arc::new(TestDelegate::new(
        format!("state-of-{name}").as_bytes(),
        size.clone(),
    ));
    let recorder = Arc::new(Recorder::default());
    let cluster = Cluster::create(
        fast_config(name),
        delegate.clone(),
        Some(recorder.clone()),
        size,
    )
    .await
    .expect("cluster create");
    Node {
        cluster,
        delegate,
        recorder,
    }
}

fn seed_of(node: &Node) -> String {
    node.cluster.advertise_addr().to_string()
}

#[tokio::test]
async fn two_node_join() {
    let a = start_node("node-a").await;
    let b = start_node("node-b").await;

    let joined = b.cluster.join(&[seed_of(&a)]).await.unwrap();
    assert_eq!(joined, 1);

    wait_until("both views to reach two members", Duration::from_secs(5), || {
        a.cluster.num_members() == 2 && b.cluster.num_members() == 2
    })
    .await;

    // The join handshake exchanged delegate state in both directions.
    assert!(a
        .delegate
        .merged
        .lock()
        .iter()
        .any(|s| s.as_slice() == b"state-of-node-b"));
    assert!(b
        .delegate
        .merged
        .lock()
        .iter()
        .any(|s| s.as_slice() == b"state-of-node-a"));

    // Exactly one join event per side for the other member.
    assert_eq!(a.recorder.count("join", "node-b"), 1);
    assert_eq!(b.recorder.count("join", "node-a"), 1);

    a.cluster.shutdown().await.unwrap();
    b.cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn user_broadcast_reaches_peer() {
    let a = start_node("bcast-a").await;
    let b = start_node("bcast-b").await;
    b.cluster.join(&[seed_of(&a)]).await.unwrap();
    wait_until("membership to converge", Duration::from_secs(5), || {
        a.cluster.num_members() == 2 && b.cluster.num_members() == 2
    })
    .await;

    a.delegate
        .queue
        .enqueue("greeting", MessageType::User, b"hello mesh".to_vec());

    wait_until("user broadcast delivery", Duration::from_secs(5), || {
        b.delegate.received.lock().iter().any(|m| m.as_slice() == b"hello mesh")
    })
    .await;

    a.cluster.shutdown().await.unwrap();
    b.cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn graceful_leave_notifies_once() {
    let a = start_node("leave-a").await;
    let b = start_node("leave-b").await;
    b.cluster.join(&[seed_of(&a)]).await.unwrap();
    wait_until("membership to converge", Duration::from_secs(5), || {
        a.cluster.num_members() == 2 && b.cluster.num_members() == 2
    })
    .await;

    b.cluster.leave(Duration::from_secs(2)).await.unwrap();
    b.cluster.shutdown().await.unwrap();

    wait_until("leave to propagate", Duration::from_secs(5), || {
        a.cluster.num_members() == 1
    })
    .await;

    // Settle, then check the event fired exactly once and no false death
    // followed it.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.recorder.count("leave", "leave-b"), 1);

    a.cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn false_suspicion_is_refuted() {
    let a = start_node("refute-a").await;
    let b = start_node("refute-b").await;
    b.cluster.join(&[seed_of(&a)]).await.unwrap();
    wait_until("membership to converge", Duration::from_secs(5), || {
        a.cluster.num_members() == 2 && b.cluster.num_members() == 2
    })
    .await;

    // Inject a forged suspicion about B directly into A.
    let body = message::encode_body(&SuspectBody {
        name: NodeId::new("refute-b"),
        incarnation: 0,
        from: NodeId::new("tester"),
    })
    .unwrap();
    let frame = message::encode_frame(MessageType::Suspect, &body);
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&frame, a.cluster.advertise_addr())
        .await
        .unwrap();

    // B hears the rumor, refutes with a bumped incarnation, and A adopts it.
    wait_until("refutation to land", Duration::from_secs(5), || {
        a.cluster
            .members()
            .iter()
            .any(|m| m.name == NodeId::new("refute-b") && m.incarnation >= 1)
    })
    .await;

    assert_eq!(a.cluster.num_members(), 2);
    assert_eq!(a.recorder.count("leave", "refute-b"), 0);

    a.cluster.shutdown().await.unwrap();
    b.cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn meta_update_propagates() {
    let a = start_node("meta-a").await;
    let b = start_node("meta-b").await;
    b.cluster.join(&[seed_of(&a)]).await.unwrap();
    wait_until("membership to converge", Duration::from_secs(5), || {
        a.cluster.num_members() == 2 && b.cluster.num_members() == 2
    })
    .await;

    *a.delegate.meta.lock() = b"weight=7".to_vec();
    a.cluster.update_meta().unwrap();

    wait_until("meta update to propagate", Duration::from_secs(5), || {
        b.cluster
            .members()
            .iter()
            .any(|m| m.name == NodeId::new("meta-a") && m.meta.as_slice() == b"weight=7")
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b.recorder.count("update", "meta-a"), 1);

    a.cluster.shutdown().await.unwrap();
    b.cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn crashed_member_is_detected() {
    let a = start_node("crash-a").await;
    let b = start_node("crash-b").await;
    let c = start_node("crash-c").await;
    b.cluster.join(&[seed_of(&a)]).await.unwrap();
    c.cluster.join(&[seed_of(&a)]).await.unwrap();

    wait_until("all three views to converge", Duration::from_secs(8), || {
        a.cluster.num_members() == 3
            && b.cluster.num_members() == 3
            && c.cluster.num_members() == 3
    })
    .await;

    // Hard-kill C: its loops stop without a leave broadcast.
    c.cluster.shutdown().await.unwrap();

    wait_until("crash detection", Duration::from_secs(15), || {
        a.cluster.num_members() == 2 && b.cluster.num_members() == 2
    })
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.recorder.count("leave", "crash-c"), 1);
    assert_eq!(b.recorder.count("leave", "crash-c"), 1);

    a.cluster.shutdown().await.unwrap();
    b.cluster.shutdown().await.unwrap();
}
