//! End-to-end fabric scenarios: a real broker, real clients, real
//! eventfds and a real mailbox file, all on one current-thread reactor.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::LocalSet;
use tokio::time::timeout;

use famez_broker::{Broker, BrokerConfig, accept_loop, arm_doorbells};
use famez_client::{ClientError, FabricClient, FabricEvent};
use famez_mailbox::MailboxRegion;
use famez_wire::recv_msg;

const TICK: Duration = Duration::from_millis(50);
const PATIENCE: Duration = Duration::from_secs(5);

struct Harness {
    broker: Rc<Broker>,
    socketpath: PathBuf,
    mailbox_path: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        std::fs::remove_file(&self.socketpath).ok();
        std::fs::remove_file(&self.mailbox_path).ok();
    }
}

/// Stand a broker up inside the current LocalSet.
fn start_broker(tag: &str, nclients: u64, silent: bool, smart: bool, recycle: bool) -> Harness {
    let unique = format!("famez_it_{}_{}", tag, std::process::id());
    let socketpath = std::env::temp_dir().join(format!("{}.sock", unique));
    let mailbox_path = std::env::temp_dir().join(format!("{}.mbox", unique));
    std::fs::remove_file(&socketpath).ok();
    std::fs::remove_file(&mailbox_path).ok();

    let cfg = BrokerConfig::resolve(
        mailbox_path.to_str().unwrap().to_string(),
        socketpath.clone(),
        nclients,
        silent,
        smart,
        recycle,
        0,
        None,
    )
    .unwrap();
    let mailbox = Arc::new(MailboxRegion::create(&cfg.mailbox, cfg.nclients, cfg.smart).unwrap());
    let broker = Rc::new(Broker::new(cfg, mailbox).unwrap());
    arm_doorbells(&broker).unwrap();
    let listener = tokio::net::UnixListener::bind(&socketpath).unwrap();
    tokio::task::spawn_local(accept_loop(broker.clone(), listener));

    Harness {
        broker,
        socketpath,
        mailbox_path,
    }
}

async fn connect(h: &Harness) -> (FabricClient, UnboundedReceiver<FabricEvent>) {
    let (client, mut events) = FabricClient::connect(&h.socketpath).await.unwrap();
    loop {
        match timeout(PATIENCE, events.recv()).await.unwrap().unwrap() {
            FabricEvent::Ready { .. } => return (client, events),
            _ => {}
        }
    }
}

/// Wait for a message whose payload satisfies the predicate, skipping
/// everything else (peer-attribute chatter included).
async fn message_where(
    events: &mut UnboundedReceiver<FabricEvent>,
    pred: impl Fn(u64, &str) -> bool,
) -> (u64, String) {
    loop {
        match timeout(PATIENCE, events.recv()).await.unwrap().unwrap() {
            FabricEvent::Message { from, payload, .. } if pred(from, &payload) => {
                return (from, payload);
            }
            _ => {}
        }
    }
}

async fn settle_until(what: &str, pred: impl Fn() -> bool) {
    for _ in 0..100 {
        if pred() {
            return;
        }
        tokio::time::sleep(TICK).await;
    }
    panic!("timeout waiting for {}", what);
}

#[tokio::test]
async fn single_peer_ping() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("ping", 2, false, false, true);
            let (client, mut events) = connect(&h).await;
            assert_eq!(client.my_id(), 1);
            assert_eq!(client.server_id(), 3);

            let rung = client.ping("server").await.unwrap();
            assert_eq!(rung, 1);

            let (from, payload) =
                message_where(&mut events, |_, p| p == "pong").await;
            assert_eq!(from, client.server_id());
            assert_eq!(payload, "pong");
        })
        .await;
}

#[tokio::test]
async fn two_peer_spoofed_interrupt() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("int", 2, false, false, true);
            let (a, _a_events) = connect(&h).await;
            let (b, mut b_events) = connect(&h).await;
            assert_eq!(a.my_id(), 1);
            assert_eq!(b.my_id(), 2);
            settle_until("a learned b's doorbells", || a.knows(2)).await;

            let rung = a.interrupt(2, 1, "hello").await.unwrap();
            assert!(rung);

            let (from, payload) =
                message_where(&mut b_events, |_, p| p == "hello").await;
            assert_eq!(from, 1);
            assert_eq!(payload, "hello");
        })
        .await;
}

#[tokio::test]
async fn smart_link_rfc_configures_the_peer() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("rfc", 2, false, true, true);
            let (client, mut events) = connect(&h).await;
            let my_id = client.my_id();

            client.send_to("switch", "Link RFC TTC=10us").await.unwrap();

            // The manager answers with a tagged CTL-Write carrying its
            // own PFM identity and our (still zero) SID/CID.
            let (_, ctl_write) = message_where(&mut events, |_, p| {
                p.starts_with("CTL-Write Space=0")
            })
            .await;
            assert!(ctl_write.contains("PFMSID=27"), "{}", ctl_write);
            assert!(ctl_write.contains("PFMCID=300"), "{}", ctl_write);
            assert!(ctl_write.contains("Tag="), "{}", ctl_write);

            // The client ACKs, the broker untags and honors the AfterACK
            // hint by probing our attributes, which we answer; the proof
            // of the full loop is our C-Class landing in the registry.
            message_where(&mut events, |_, p| p.starts_with("Link CTL Peer-Attribute"))
                .await;
            settle_until("peer attributes stored on the broker", || {
                let state = h.broker.state.lock();
                state
                    .peers
                    .get(&my_id)
                    .map(|p| {
                        p.peer_attrs.get("C-Class").map(String::as_str) == Some("Debugger")
                    })
                    .unwrap_or(false)
            })
            .await;
        })
        .await;
}

#[tokio::test]
async fn oversized_payload_is_refused_end_to_end() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("toolong", 2, false, false, true);
            let (client, _events) = connect(&h).await;

            let big = "x".repeat(400);
            match client.send_to("server", &big).await {
                Err(ClientError::Mailbox(famez_mailbox::MailboxError::PayloadTooLong {
                    ..
                })) => {}
                other => panic!("expected PayloadTooLong, got {:?}", other.map(|_| ())),
            }
        })
        .await;
}

#[tokio::test]
async fn recycle_reuses_eventfds_and_stays_quiet() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("recycle", 3, false, false, true);
            let (c1, mut c1_events) = connect(&h).await;
            let (_c2, _c2_events) = connect(&h).await;
            let (c3, _c3_events) = connect(&h).await;
            assert_eq!(c3.my_id(), 3);

            let old_fds: Vec<i32> = {
                use std::os::unix::io::AsRawFd;
                let state = h.broker.state.lock();
                state.peers[&3].vectors.iter().map(|v| v.as_raw_fd()).collect()
            };

            c3.hangup();
            settle_until("peer 3 parked in the recycle pool", || {
                h.broker.state.lock().recycled.contains_key(&3)
            })
            .await;

            // No departure broadcast in recycle mode.
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(
                timeout(Duration::from_millis(100), c1_events.recv())
                    .await
                    .is_err(),
                "survivor heard about a recycled departure"
            );
            drop(c1);

            // A reconnect lands on id 3 and reacquires the same kernel
            // objects, not fresh ones.
            let (c4, _c4_events) = connect(&h).await;
            assert_eq!(c4.my_id(), 3);
            let new_fds: Vec<i32> = {
                use std::os::unix::io::AsRawFd;
                let state = h.broker.state.lock();
                state.peers[&3].vectors.iter().map(|v| v.as_raw_fd()).collect()
            };
            assert_eq!(old_fds, new_fds);
        })
        .await;
}

#[tokio::test]
async fn departures_are_broadcast_without_recycle() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("depart", 2, false, false, false);
            let (_c1, mut c1_events) = connect(&h).await;
            let (c2, _c2_events) = connect(&h).await;

            c2.hangup();
            loop {
                match timeout(PATIENCE, c1_events.recv()).await.unwrap().unwrap() {
                    FabricEvent::PeerGone(2) => break,
                    _ => {}
                }
            }
            // Exactly one notice.
            assert!(
                timeout(Duration::from_millis(200), c1_events.recv())
                    .await
                    .is_err(),
                "second death notice arrived"
            );

            // The departed slot was scrubbed, peer_id preserved.
            settle_until("slot 2 cleared", || {
                h.broker.mailbox.nodename(2).unwrap().is_empty()
            })
            .await;
        })
        .await;
}

#[tokio::test]
async fn plain_mode_reallocates_the_minimum_id() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("minid", 3, false, false, false);
            let (c1, _e1) = connect(&h).await;
            let (c2, _e2) = connect(&h).await;
            assert_eq!((c1.my_id(), c2.my_id()), (1, 2));

            c1.hangup();
            settle_until("id 1 released", || {
                !h.broker.state.lock().peers.contains_key(&1)
            })
            .await;

            let (c3, _e3) = connect(&h).await;
            assert_eq!(c3.my_id(), 1);
        })
        .await;
}

#[tokio::test]
async fn capacity_exhaustion_bombs_the_client() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("full", 2, false, false, true);
            let (_c1, _e1) = connect(&h).await;
            let (_c2, _e2) = connect(&h).await;

            match FabricClient::connect(&h.socketpath).await {
                Err(ClientError::Rejected { version }) => assert_eq!(version, -1),
                other => panic!("expected rejection, got {:?}", other.map(|_| ())),
            }
        })
        .await;
}

#[tokio::test]
async fn handshake_ends_with_the_sentinel_batch() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("sentinel", 2, false, false, true);
            let nevents = h.broker.cfg.nevents as usize;
            let server_id = h.broker.cfg.server_id as i64;

            // Drive the wire by hand: greeting, then the broker's own
            // batch (first client, non-silent), then our sentinel batch.
            let stream = UnixStream::connect(&h.socketpath).await.unwrap();
            let (version, _) = recv_msg(&stream).await.unwrap();
            assert_eq!(version, 0);
            let (my_id, _) = recv_msg(&stream).await.unwrap();
            assert_eq!(my_id, 1);
            let (minus_one, mailbox_fd) = recv_msg(&stream).await.unwrap();
            assert_eq!(minus_one, -1);
            assert!(mailbox_fd.is_some());

            for _ in 0..nevents {
                let (id, fd) = recv_msg(&stream).await.unwrap();
                assert_eq!(id, server_id);
                assert!(fd.is_some());
            }
            for _ in 0..nevents {
                let (id, fd) = recv_msg(&stream).await.unwrap();
                assert_eq!(id, my_id, "sentinel batch must repeat our own id");
                assert!(fd.is_some());
            }
        })
        .await;
}

#[tokio::test]
async fn silent_broker_advertises_no_doorbells_of_its_own() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let h = start_broker("silent", 2, true, false, true);
            assert!(h.broker.notifiers.is_empty());

            let stream = UnixStream::connect(&h.socketpath).await.unwrap();
            for _ in 0..3 {
                recv_msg(&stream).await.unwrap();
            }
            // First client, silent broker: the sentinel batch is the
            // whole advertisement stream.
            let nevents = h.broker.cfg.nevents as usize;
            for _ in 0..nevents {
                let (id, fd) = recv_msg(&stream).await.unwrap();
                assert_eq!(id, 1);
                assert!(fd.is_some());
            }
        })
        .await;
}
