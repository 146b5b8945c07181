//! Client-side session: the IVSHMSG handshake state machine and the
//! operational doorbell/mailslot plumbing.
//!
//! Life of a connection:
//!
//! 1. `Initial`: receive the three greeting words; the third carries the
//!    mailbox fd. Attach the region, read the globals, claim a nodename.
//! 2. `Learning`: accumulate `(peer_id, fd)` advertisements. When our own
//!    list is complete (the repeated-id sentinel batch), arm the doorbells,
//!    announce ourselves to the broker, and go `Ready`.
//! 3. `Ready`: doorbell traffic. Advertisement batches keep arriving as
//!    later peers join; a bare `(peer_id, no fd)` message is a departure.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, info, trace, warn};

use famez_fabric::{Correlator, Outcome, RequestEnv, Tracker, parse_request, with_tracker};
use famez_mailbox::{MailboxError, MailboxRegion};
use famez_wire::{EventNotifier, IVSHMSG_PROTOCOL_VERSION, WireError, recv_msg};

use crate::requests::{ClientCtx, dispatch_client};

/// Component class a native debugger client advertises.
pub const CLIENT_CCLASS: &str = "Debugger";

/// What the session surfaces to its observer (test harness or REPL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    /// Handshake complete; doorbells armed.
    Ready { my_id: u64, server_id: u64 },
    /// A peer rang us and this is what was in its slot.
    Message {
        from: u64,
        nodename: String,
        payload: String,
        tracker: Option<u64>,
    },
    /// A peer departed the fabric.
    PeerGone(u64),
    /// The broker closed the rendezvous socket.
    Disconnected,
}

/// Mutable session state behind the lock.
pub struct ClientState {
    /// Accumulated eventfd lists, keyed by peer id. Our own id's list is
    /// what we drain; everyone else's is what we ring.
    pub peers: BTreeMap<u64, Vec<EventNotifier>>,
    /// Broker id inferred from the advertisement stream.
    pub inferred_server: Option<u64>,
    pub prev_advert: Option<u64>,
    pub ready: bool,
    /// Our fabric identity, assigned by CTL-Write when the broker is smart.
    pub sid0: u64,
    pub cid0: u64,
    pub configured: bool,
    /// Last Link CTL ACK attributes per peer.
    pub peer_attrs: BTreeMap<u64, HashMap<String, String>>,
    pub correlator: Correlator,
    pub tracker: Tracker,
}

struct ClientInner {
    stream: UnixStream,
    mailbox: Arc<MailboxRegion>,
    my_id: u64,
    nevents: u64,
    state: Mutex<ClientState>,
    events: UnboundedSender<FabricEvent>,
}

/// Handle to a connected fabric client.
#[derive(Clone)]
pub struct FabricClient {
    inner: Rc<ClientInner>,
}

impl FabricClient {
    /// Connect to the broker, run the greeting phase, and spawn the
    /// learning/operational pump. Must be called from within a `LocalSet`.
    pub async fn connect(
        socketpath: &std::path::Path,
    ) -> Result<(Self, UnboundedReceiver<FabricEvent>), ClientError> {
        let stream = UnixStream::connect(socketpath)
            .await
            .map_err(|e| ClientError::Wire(WireError::Os(e)))?;

        // Initial: version, our new id, then -1 with the mailbox fd.
        let (version, _) = recv_msg(&stream).await.map_err(ClientError::Wire)?;
        if version != IVSHMSG_PROTOCOL_VERSION {
            // The broker bombs rejected clients with a bad version.
            return Err(ClientError::Rejected { version });
        }
        let (my_id, _) = recv_msg(&stream).await.map_err(ClientError::Wire)?;
        if my_id < 1 {
            return Err(ClientError::Protocol("assigned id out of domain"));
        }
        let (minus_one, fd) = recv_msg(&stream).await.map_err(ClientError::Wire)?;
        if minus_one != -1 {
            return Err(ClientError::Protocol("did not get -1 with mailbox fd"));
        }
        let Some(fd) = fd else {
            return Err(ClientError::Protocol("mailbox fd missing from greeting"));
        };

        let mailbox = Arc::new(MailboxRegion::attach(fd).map_err(ClientError::Mailbox)?);
        let my_id = my_id as u64;
        if my_id > mailbox.nclients() {
            return Err(ClientError::Protocol("assigned id exceeds nClients"));
        }

        // Claim our mailslot identity before anyone can ring us.
        mailbox.set_nodename(my_id, &format!("z{:02}", my_id));
        mailbox.set_cclass(my_id, CLIENT_CCLASS);
        info!(my_id, "greeting complete; learning the fabric");

        let (events, rx) = unbounded_channel();
        let inner = Rc::new(ClientInner {
            stream,
            nevents: mailbox.nevents(),
            mailbox,
            my_id,
            state: Mutex::new(ClientState {
                peers: BTreeMap::new(),
                inferred_server: None,
                prev_advert: None,
                ready: false,
                sid0: 0,
                cid0: 0,
                configured: false,
                peer_attrs: BTreeMap::new(),
                correlator: Correlator::new(),
                tracker: Tracker::new(),
            }),
            events,
        });

        let pump = inner.clone();
        tokio::task::spawn_local(async move { pump.pump().await });

        Ok((Self { inner }, rx))
    }

    pub fn my_id(&self) -> u64 {
        self.inner.my_id
    }

    /// The broker's id, from the mailbox globals.
    pub fn server_id(&self) -> u64 {
        self.inner.mailbox.server_id()
    }

    pub fn nodename(&self) -> String {
        format!("z{:02}", self.inner.my_id)
    }

    pub fn mailbox(&self) -> &MailboxRegion {
        &self.inner.mailbox
    }

    /// Whether we have learned `id`'s eventfds yet.
    pub fn knows(&self, id: u64) -> bool {
        self.inner.state.lock().peers.contains_key(&id)
    }

    /// Send a payload to a destination: a numeric id, a nodename,
    /// `server`/`switch`, `all`, or `others`. Returns how many peers were
    /// rung. The destination set snapshots the current registry.
    pub async fn send_to(&self, target: &str, payload: &str) -> Result<usize, ClientError> {
        let my_id = self.inner.my_id;
        let targets = self.resolve_targets(target);
        if targets.is_empty() {
            info!(dest = target, "no such destination");
            return Ok(0);
        }
        let mut delivered = 0;
        for id in targets {
            if self.deliver_one(id, my_id, payload).await? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// `ping <target>` sugar.
    pub async fn ping(&self, target: &str) -> Result<usize, ClientError> {
        self.send_to(target, "ping").await
    }

    /// The spoofed-interrupt command: fill `source`'s slot and ring
    /// `target`'s doorbell at index `source`. With `source` equal to our
    /// own id this is a normal send; anything else is test plumbing for
    /// the kernel driver's interrupt path.
    pub async fn interrupt(
        &self,
        target: u64,
        source: u64,
        payload: &str,
    ) -> Result<bool, ClientError> {
        let stamped = {
            let mut st = self.inner.state.lock();
            let n = st.tracker.next();
            with_tracker(payload, n)
        };
        self.inner
            .mailbox
            .fill(source, stamped.as_bytes())
            .await
            .map_err(ClientError::Mailbox)?;
        let st = self.inner.state.lock();
        let Some(vectors) = st.peers.get(&target) else {
            return Ok(false);
        };
        if source as usize >= vectors.len() {
            return Ok(false);
        }
        Ok(vectors[source as usize].ring(1).map_err(ClientError::Wire)?)
    }

    /// Sever the rendezvous socket. The broker sees a clean disconnect;
    /// the pump task winds down on the resulting EOF.
    pub fn hangup(&self) {
        use std::os::unix::io::AsRawFd;
        // SAFETY: shutdown on a valid connected socket fd; the stream
        // object stays alive, later reads just return EOF.
        unsafe {
            libc::shutdown(self.inner.stream.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    /// Log the session state (the `dump` local command).
    pub fn dump(&self) {
        let st = self.inner.state.lock();
        info!(
            my_id = self.inner.my_id,
            peers = ?st.peers.keys().collect::<Vec<_>>(),
            sid0 = st.sid0,
            cid0 = st.cid0,
            configured = st.configured,
            outstanding_tags = st.correlator.outstanding(),
            "client state"
        );
    }

    fn resolve_targets(&self, target: &str) -> Vec<u64> {
        let my_id = self.inner.my_id;
        let server_id = self.server_id();
        let st = self.inner.state.lock();
        let known: Vec<u64> = st.peers.keys().copied().filter(|&id| id != my_id).collect();
        match target {
            "server" | "switch" => {
                if st.peers.contains_key(&server_id) {
                    vec![server_id]
                } else {
                    Vec::new()
                }
            }
            "all" => known,
            "others" => known.into_iter().filter(|&id| id != server_id).collect(),
            t => {
                if let Ok(id) = t.parse::<u64>() {
                    return if st.peers.contains_key(&id) && id != my_id {
                        vec![id]
                    } else {
                        Vec::new()
                    };
                }
                known
                    .into_iter()
                    .filter(|&id| {
                        self.inner
                            .mailbox
                            .nodename(id)
                            .map(|n| n == t)
                            .unwrap_or(false)
                    })
                    .collect()
            }
        }
    }

    async fn deliver_one(&self, target: u64, my_id: u64, payload: &str) -> Result<bool, ClientError> {
        let stamped = {
            let mut st = self.inner.state.lock();
            let n = st.tracker.next();
            with_tracker(payload, n)
        };
        self.inner
            .mailbox
            .fill(my_id, stamped.as_bytes())
            .await
            .map_err(ClientError::Mailbox)?;
        let st = self.inner.state.lock();
        let Some(vectors) = st.peers.get(&target) else {
            warn!(peer = target, "peer vanished before the ring");
            return Ok(false);
        };
        Ok(vectors[my_id as usize].ring(1).map_err(ClientError::Wire)?)
    }
}

impl ClientInner {
    /// The learning/operational pump: everything the broker sends after
    /// the greeting is `(id, fd)` advertisements or `(id, no fd)` deaths.
    async fn pump(self: Rc<Self>) {
        loop {
            match recv_msg(&self.stream).await {
                Ok((id, Some(fd))) => {
                    if id < 0 {
                        warn!(id, "negative id in advertisement stream");
                        continue;
                    }
                    Self::learn(&self, id as u64, EventNotifier::from_owned(fd));
                }
                Ok((id, None)) => {
                    let id = id.max(0) as u64;
                    info!(id, "peer departed");
                    self.state.lock().peers.remove(&id);
                    self.events.send(FabricEvent::PeerGone(id)).ok();
                }
                Err(WireError::PeerGone) => {
                    info!("broker closed the rendezvous socket");
                    self.events.send(FabricEvent::Disconnected).ok();
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "rendezvous socket failed");
                    self.events.send(FabricEvent::Disconnected).ok();
                    return;
                }
            }
        }
    }

    /// Append one advertised eventfd and fire the ready path when our own
    /// batch completes.
    fn learn(this: &Rc<Self>, id: u64, notifier: EventNotifier) {
        let completed = {
            let mut st = this.state.lock();

            // The first repeat of our own id closes the stream; whatever
            // id came right before it was the broker's. The mailbox
            // globals already told us, so the inference is a cross-check.
            if id == this.my_id && st.inferred_server.is_none() {
                st.inferred_server = st.prev_advert;
                if let Some(inferred) = st.inferred_server {
                    if inferred != this.mailbox.server_id() {
                        warn!(
                            inferred,
                            globals = this.mailbox.server_id(),
                            "server id inference disagrees with the globals"
                        );
                    }
                }
            }
            st.prev_advert = Some(id);

            let len = {
                let list = st.peers.entry(id).or_default();
                list.push(notifier);
                list.len() as u64
            };
            trace!(id, len, "learned eventfd");

            let completed = !st.ready && id == this.my_id && len == this.nevents;
            if completed {
                st.ready = true;
            }
            completed
        };

        if completed {
            Self::go_ready(this);
        }
    }

    /// Arm our doorbells, announce ourselves, and tell the observer.
    fn go_ready(this: &Rc<Self>) {
        if let Err(e) = Self::arm_doorbells(this) {
            warn!(error = %e, "could not arm doorbells");
            return;
        }

        let server_id = this.mailbox.server_id();
        info!(my_id = this.my_id, server_id, "fabric ready");
        this.events
            .send(FabricEvent::Ready {
                my_id: this.my_id,
                server_id,
            })
            .ok();

        // Open the Link CTL conversation with the switch. A silent broker
        // never advertised eventfds, so there is no one to probe.
        let have_server = this.state.lock().peers.contains_key(&server_id);
        if have_server {
            let sess = this.clone();
            tokio::task::spawn_local(async move {
                if let Err(e) = sess.send_payload(server_id, "Link CTL Peer-Attribute").await {
                    warn!(error = %e, "peer-attribute probe failed");
                }
            });
        } else {
            debug!("no broker doorbells; skipping peer-attribute probe");
        }
    }

    fn arm_doorbells(this: &Rc<Self>) -> Result<(), WireError> {
        let st = this.state.lock();
        let Some(own) = st.peers.get(&this.my_id) else {
            return Ok(());
        };
        for (index, notifier) in own.iter().enumerate() {
            let dup = notifier.try_clone()?;
            let owner = this.clone();
            tokio::task::spawn_local(async move {
                let each = owner.clone();
                let result = famez_wire::watch(dup, index as u64, move |idx, count| {
                    let sess = each.clone();
                    async move { sess.service_doorbell(idx, count).await }
                })
                .await;
                if let Err(e) = result {
                    warn!(index, error = %e, "doorbell watcher died");
                }
            });
        }
        Ok(())
    }

    /// Our doorbell at index `from` fired: peer `from` has mail in its slot.
    async fn service_doorbell(&self, from: u64, count: u64) {
        trace!(from, count, "doorbell");
        let payload = match self.mailbox.retrieve(from, true) {
            Ok(p) => p,
            Err(e) => {
                warn!(from, error = %e, "could not read mailslot");
                return;
            }
        };
        self.mailbox.note_responder(from, self.my_id).ok();

        let text = String::from_utf8_lossy(&payload).into_owned();
        let nodename = self.mailbox.nodename(from).unwrap_or_default();
        let request = parse_request(&text);
        if request.tokens.is_empty() {
            return;
        }
        debug!("\"{}\" ({}) sends {:?}", nodename, from, text);
        self.events
            .send(FabricEvent::Message {
                from,
                nodename: nodename.clone(),
                payload: request.tokens.join(" "),
                tracker: request.tracker,
            })
            .ok();

        let env = RequestEnv {
            requester_id: from,
            requester_name: nodename,
            tracker: request.tracker,
        };
        let outcome = {
            let mut st = self.state.lock();
            let mut ctx = ClientCtx {
                state: &mut st,
                my_id: self.my_id,
                mailbox: &self.mailbox,
            };
            dispatch_client(&mut ctx, &env, &request.tokens)
        };

        match outcome {
            Outcome::Done => {}
            Outcome::Unhandled => {
                debug!(from, request = %text, "request not handled");
            }
            Outcome::Dump => {
                let st = self.state.lock();
                info!(
                    my_id = self.my_id,
                    peers = ?st.peers.keys().collect::<Vec<_>>(),
                    "client state"
                );
            }
            Outcome::Reply(payloads) => {
                for payload in payloads {
                    if let Err(e) = self.send_payload(from, &payload).await {
                        warn!(error = %e, "response dropped");
                        break;
                    }
                }
            }
        }
    }

    /// Fill our slot and ring `target`'s doorbell at our index.
    async fn send_payload(&self, target: u64, payload: &str) -> Result<(), ClientError> {
        let stamped = {
            let mut st = self.state.lock();
            let n = st.tracker.next();
            with_tracker(payload, n)
        };
        self.mailbox
            .fill(self.my_id, stamped.as_bytes())
            .await
            .map_err(ClientError::Mailbox)?;
        let st = self.state.lock();
        let Some(vectors) = st.peers.get(&target) else {
            warn!(peer = target, "target vanished before the ring");
            return Ok(());
        };
        vectors[self.my_id as usize]
            .ring(1)
            .map_err(ClientError::Wire)?;
        Ok(())
    }
}

/// Client-side failures.
#[derive(Debug)]
pub enum ClientError {
    /// The broker sent the bad-version sentinel (capacity, usually).
    Rejected { version: i64 },
    /// The greeting violated the protocol.
    Protocol(&'static str),
    Wire(WireError),
    Mailbox(MailboxError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { version } => {
                write!(f, "broker rejected us (protocol version {})", version)
            }
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Self::Wire(e) => write!(f, "{}", e),
            Self::Mailbox(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Mailbox(e) => Some(e),
            _ => None,
        }
    }
}
