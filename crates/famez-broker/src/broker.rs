//! Broker core: the peer registry, id allocation, doorbell service loop,
//! and outbound delivery.
//!
//! One `Broker` is shared (by `Rc`) between the accept loop, every
//! per-peer task, and the doorbell watchers. Mutable registry state lives
//! behind a single mutex that is never held across an await; the mailbox
//! itself synchronizes through its slot handshake.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UnixStream;
use tracing::{debug, info, trace, warn};

use famez_fabric::{Outcome, RequestEnv, Correlator, Tracker, parse_request, with_tracker};
use famez_mailbox::MailboxRegion;
use famez_wire::{EventNotifier, WireError, notifier_list};

use crate::config::BrokerConfig;
use crate::requests::dispatch_switch;

/// Where a peer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Greeting and advertisements are still in flight.
    Handshaking,
    /// Fully advertised; no doorbell traffic seen yet.
    Advertised,
    /// At least one doorbell has fired.
    Operational,
}

/// Broker-side record of one attached peer.
pub struct Peer {
    pub id: u64,
    pub stream: Rc<UnixStream>,
    /// The peer's doorbells. Shared with the recycle pool so a reconnect
    /// under the same id reuses the very same eventfds.
    pub vectors: Rc<Vec<EventNotifier>>,
    pub sid0: u64,
    pub cid0: u64,
    pub peer_attrs: HashMap<String, String>,
    pub phase: PeerPhase,
}

/// Registry and correlation state, all behind one lock.
pub struct BrokerState {
    pub peers: BTreeMap<u64, Peer>,
    pub recycled: HashMap<u64, Rc<Vec<EventNotifier>>>,
    pub correlator: Correlator,
    pub tracker: Tracker,
}

/// The broker singleton.
pub struct Broker {
    pub cfg: BrokerConfig,
    pub mailbox: Arc<MailboxRegion>,
    /// The broker's own doorbells; empty in silent mode.
    pub notifiers: Vec<EventNotifier>,
    pub state: Mutex<BrokerState>,
    /// Serializes handshakes so advertisement batches never interleave
    /// and the registry snapshot each one takes is consistent.
    pub handshake_gate: tokio::sync::Mutex<()>,
}

/// Why a connection was turned away before advertisement.
#[derive(Debug)]
pub enum HandshakeError {
    /// No free peer id; the client gets the bad-version sentinel.
    Exhausted,
    /// Could not create this peer's eventfds.
    Resource(WireError),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "max clients reached"),
            Self::Resource(e) => write!(f, "event notifiers failed: {}", e),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl Broker {
    pub fn new(cfg: BrokerConfig, mailbox: Arc<MailboxRegion>) -> Result<Self, WireError> {
        let notifiers = if cfg.silent {
            Vec::new()
        } else {
            notifier_list(cfg.nevents as usize)?
        };
        Ok(Self {
            cfg,
            mailbox,
            notifiers,
            state: Mutex::new(BrokerState {
                peers: BTreeMap::new(),
                recycled: HashMap::new(),
                correlator: Correlator::new(),
                tracker: Tracker::new(),
            }),
            handshake_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Pick an id for a new connection.
    ///
    /// Plain mode takes the smallest unused id; smart mode draws uniformly
    /// from the free set so fabric addresses do not leak arrival order.
    fn allocate_id(&self, state: &BrokerState) -> Option<u64> {
        let available: Vec<u64> = (1..=self.cfg.nclients)
            .filter(|id| !state.peers.contains_key(id))
            .collect();
        if available.is_empty() {
            None
        } else if self.cfg.smart {
            Some(available[rand::rng().random_range(0..available.len())])
        } else {
            Some(available[0])
        }
    }

    /// Allocate an id and its eventfd list for a new connection.
    ///
    /// Returns `(id, vectors, from_pool)`; `from_pool` says the list came
    /// from the recycle pool and must go back there if the handshake dies.
    pub fn admit(&self) -> Result<(u64, Rc<Vec<EventNotifier>>, bool), HandshakeError> {
        let mut state = self.state.lock();
        let id = self.allocate_id(&state).ok_or(HandshakeError::Exhausted)?;
        if let Some(vectors) = state.recycled.remove(&id) {
            debug!(id, "reusing recycled eventfds");
            return Ok((id, vectors, true));
        }
        drop(state);
        let vectors = notifier_list(self.cfg.nevents as usize)
            .map_err(HandshakeError::Resource)?;
        Ok((id, Rc::new(vectors), false))
    }

    /// Undo an `admit` whose handshake failed.
    pub fn restash(&self, id: u64, vectors: Rc<Vec<EventNotifier>>, from_pool: bool) {
        if from_pool {
            self.state.lock().recycled.insert(id, vectors);
        }
        // Freshly created vectors just drop, closing the fds.
    }

    /// Enter a fully advertised peer into the registry.
    pub fn register_peer(&self, id: u64, stream: Rc<UnixStream>, vectors: Rc<Vec<EventNotifier>>) {
        let mut state = self.state.lock();
        state.peers.insert(
            id,
            Peer {
                id,
                stream,
                vectors,
                sid0: 0,
                cid0: 0,
                peer_attrs: HashMap::new(),
                phase: PeerPhase::Advertised,
            },
        );
    }

    /// Registry snapshot for advertisement fan-out.
    pub fn peer_snapshot(&self) -> Vec<(u64, Rc<UnixStream>, Rc<Vec<EventNotifier>>)> {
        self.state
            .lock()
            .peers
            .values()
            .map(|p| (p.id, p.stream.clone(), p.vectors.clone()))
            .collect()
    }

    /// Take a peer out of the fabric.
    ///
    /// Without recycling this broadcasts the departure, clears the
    /// mailslot, and drops the eventfds. With recycling the record's
    /// doorbells are parked for the next connection that lands on the same
    /// id, and the survivors never hear about it.
    pub async fn lost(&self, id: u64, clean: bool) {
        let survivors = {
            let mut state = self.state.lock();
            let Some(peer) = state.peers.remove(&id) else {
                return;
            };
            if clean {
                info!(id, "clean disconnect from peer");
            } else {
                warn!(id, "dirty disconnect from peer");
            }
            if self.cfg.recycle {
                state.recycled.insert(id, peer.vectors);
                return;
            }
            state
                .peers
                .values()
                .map(|p| (p.id, p.stream.clone()))
                .collect::<Vec<_>>()
        };

        for (pid, stream) in survivors {
            if let Err(e) = famez_wire::send_msg(&stream, id as i64, None).await {
                warn!(peer = pid, error = %e, "death notice failed");
            }
        }
        if let Err(e) = self.mailbox.clear_slot(id) {
            warn!(id, error = %e, "could not clear departed mailslot");
        }
    }

    /// One doorbell fired: peer `requester` has mail for us.
    pub async fn service_doorbell(&self, requester: u64, count: u64) {
        trace!(requester, count, "doorbell");
        let payload = match self.mailbox.retrieve(requester, true) {
            Ok(p) => p,
            Err(e) => {
                warn!(requester, error = %e, "could not read mailslot");
                return;
            }
        };
        self.mailbox
            .note_responder(requester, self.cfg.server_id)
            .ok();

        let text = String::from_utf8_lossy(&payload).into_owned();
        let requester_name = self.mailbox.nodename(requester).unwrap_or_default();
        let request = parse_request(&text);
        if request.tokens.is_empty() {
            return;
        }
        debug!(
            "{:>10}@{} -> {:?}",
            requester_name, requester, text
        );

        let env = RequestEnv {
            requester_id: requester,
            requester_name,
            tracker: request.tracker,
        };
        let outcome = {
            let mut state = self.state.lock();
            if let Some(peer) = state.peers.get_mut(&requester) {
                if peer.phase == PeerPhase::Advertised {
                    peer.phase = PeerPhase::Operational;
                }
            }
            dispatch_switch(&self.cfg, &mut state, &env, &request.tokens)
        };

        match outcome {
            Outcome::Done => {}
            Outcome::Unhandled => {
                if self.cfg.verbose > 0 {
                    debug!(requester, request = %text, "request not handled");
                }
            }
            Outcome::Dump => self.log_dump(),
            Outcome::Reply(payloads) => self.deliver(requester, payloads).await,
        }
    }

    /// Write responses into our own slot and ring the requester once per
    /// payload. The slot handshake paces consecutive payloads.
    async fn deliver(&self, requester: u64, payloads: Vec<String>) {
        let vectors = {
            let state = self.state.lock();
            state.peers.get(&requester).map(|p| p.vectors.clone())
        };
        let Some(vectors) = vectors else {
            warn!(requester, "requester disappeared before the response");
            return;
        };
        for payload in payloads {
            let stamped = {
                let mut state = self.state.lock();
                let n = state.tracker.next();
                with_tracker(&payload, n)
            };
            if let Err(e) = self
                .mailbox
                .fill(self.cfg.server_id, stamped.as_bytes())
                .await
            {
                warn!(error = %e, "response dropped");
                return;
            }
            match vectors[self.cfg.server_id as usize].ring(1) {
                Ok(true) => {}
                Ok(false) => warn!(requester, "doorbell saturated; ring not delivered"),
                Err(e) => warn!(requester, error = %e, "doorbell ring failed"),
            }
        }
    }

    /// Resolve a destination token against the live registry.
    ///
    /// Accepts a numeric id, a peer nodename, or the literals `all` /
    /// `others`; `server` and `switch` mean the broker itself and resolve
    /// to nothing here.
    pub fn resolve_targets(&self, target: &str) -> Vec<u64> {
        let ids: Vec<u64> = self.state.lock().peers.keys().copied().collect();
        match target {
            "all" | "others" => ids,
            "server" | "switch" => Vec::new(),
            t => {
                if let Ok(id) = t.parse::<u64>() {
                    return if ids.contains(&id) { vec![id] } else { Vec::new() };
                }
                ids.into_iter()
                    .filter(|&id| {
                        self.mailbox
                            .nodename(id)
                            .map(|n| n == t)
                            .unwrap_or(false)
                    })
                    .collect()
            }
        }
    }

    /// Send a payload from the broker to a destination; returns how many
    /// peers it went to.
    pub async fn send_to(&self, target: &str, payload: &str) -> usize {
        let targets = self.resolve_targets(target);
        if targets.is_empty() {
            info!(dest = target, "no such destination");
            return 0;
        }
        let mut delivered = 0;
        for id in targets {
            let (vectors, stamped) = {
                let mut state = self.state.lock();
                let Some(peer) = state.peers.get(&id) else {
                    continue;
                };
                let v = peer.vectors.clone();
                let n = state.tracker.next();
                (v, with_tracker(payload, n))
            };
            if let Err(e) = self
                .mailbox
                .fill(self.cfg.server_id, stamped.as_bytes())
                .await
            {
                warn!(id, error = %e, "send failed");
                continue;
            }
            if vectors[self.cfg.server_id as usize].ring(1).unwrap_or(false) {
                delivered += 1;
            }
        }
        delivered
    }

    /// The `dump` local command: log the registry and correlation state.
    pub fn log_dump(&self) {
        let state = self.state.lock();
        info!(
            peers = ?state.peers.keys().collect::<Vec<_>>(),
            recycled = ?state.recycled.keys().collect::<Vec<_>>(),
            outstanding_tags = state.correlator.outstanding(),
            "broker state"
        );
    }
}
