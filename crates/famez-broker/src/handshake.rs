//! The IVSHMSG server-side handshake.
//!
//! Mirrors the QEMU ivshmem-server sequence: three greeting words (version,
//! assigned id, then -1 with the mailbox fd), advertisement of every
//! existing peer's eventfds both ways, the broker's own eventfds when it
//! participates, and finally the new peer's eventfds back to itself; the
//! repeated id in that last batch is the sentinel that the handshake is
//! complete.

use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use famez_wire::{IVSHMSG_BAD_VERSION, IVSHMSG_PROTOCOL_VERSION, WireError, send_msg};

use crate::broker::Broker;

/// Drive one accepted connection for its whole life: handshake, then sit
/// on the socket waiting for the disconnect.
pub async fn run_peer(broker: Rc<Broker>, stream: UnixStream) {
    let Some((id, stream)) = handshake(&broker, stream).await else {
        return;
    };
    read_until_gone(&broker, id, &stream).await;
}

/// Admit, greet, and advertise a new connection. `None` means the client
/// was turned away (or died mid-greeting) and other peers are untouched.
async fn handshake(broker: &Rc<Broker>, stream: UnixStream) -> Option<(u64, Rc<UnixStream>)> {
    // One handshake at a time: advertisement batches must not interleave
    // on any peer's socket, and the snapshot below must stay consistent.
    let _gate = broker.handshake_gate.lock().await;

    let (id, vectors, from_pool) = match broker.admit() {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(error = %e, "rejecting connection");
            // Bomb the client with a bad version; it complains but with grace.
            let _ = send_msg(&stream, IVSHMSG_BAD_VERSION, None).await;
            return None;
        }
    };

    info!(
        id,
        socket = stream.as_raw_fd(),
        recycled = from_pool,
        "peer connected"
    );

    if let Err(e) = greet_and_advertise(broker, &stream, id, &vectors).await {
        warn!(id, error = %e, "handshake failed");
        broker.restash(id, vectors, from_pool);
        return None;
    }

    let stream = Rc::new(stream);
    broker.register_peer(id, stream.clone(), vectors);
    debug!(id, "peer advertised");
    Some((id, stream))
}

async fn greet_and_advertise(
    broker: &Rc<Broker>,
    stream: &UnixStream,
    id: u64,
    vectors: &Rc<Vec<famez_wire::EventNotifier>>,
) -> Result<(), WireError> {
    // Greeting: protocol version, the assigned id, then -1 carrying the
    // mailbox fd.
    send_msg(stream, IVSHMSG_PROTOCOL_VERSION, None).await?;
    send_msg(stream, id as i64, None).await?;
    send_msg(stream, -1, Some(broker.mailbox.raw_fd())).await?;

    let existing = broker.peer_snapshot();

    // Advertise the new peer to the others. A failure there is that
    // peer's death, not the newcomer's problem.
    for (pid, pstream, _) in &existing {
        let mut dead = false;
        for vector in vectors.iter() {
            if send_msg(pstream, id as i64, Some(vector.as_raw_fd()))
                .await
                .is_err()
            {
                dead = true;
                break;
            }
        }
        if dead {
            broker.lost(*pid, false).await;
        }
    }

    // Advertise the others to the new peer.
    for (pid, _, pvectors) in &existing {
        for vector in pvectors.iter() {
            send_msg(stream, *pid as i64, Some(vector.as_raw_fd())).await?;
        }
    }

    // Non-standard voodoo: when the broker participates it advertises its
    // own eventfds as one more grouping.
    if !broker.cfg.silent {
        debug!(
            server_id = broker.cfg.server_id,
            "sending broker notifiers to peer {}", id
        );
        for vector in &broker.notifiers {
            send_msg(stream, broker.cfg.server_id as i64, Some(vector.as_raw_fd())).await?;
        }
    }

    // Finally the peer's own eventfds; the embedded id matching the
    // greeting id is the completion sentinel.
    for vector in vectors.iter() {
        send_msg(stream, id as i64, Some(vector.as_raw_fd())).await?;
    }
    Ok(())
}

/// Clients never speak on the rendezvous socket after the handshake, so
/// all that is left is to notice the disconnect.
async fn read_until_gone(broker: &Rc<Broker>, id: u64, stream: &UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        if stream.readable().await.is_err() {
            broker.lost(id, false).await;
            return;
        }
        match stream.try_read(&mut buf) {
            Ok(0) => {
                broker.lost(id, true).await;
                return;
            }
            Ok(n) => warn!(id, bytes = n, "unexpected data on rendezvous socket"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(_) => {
                broker.lost(id, false).await;
                return;
            }
        }
    }
}
