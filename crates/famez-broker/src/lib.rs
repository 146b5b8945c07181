//! The FAME-Z broker.
//!
//! Listens on a UNIX rendezvous socket, speaks the QEMU ivshmem
//! client/server protocol extended with its own eventfds, owns the shared
//! mailbox region, and (unless silent) participates in the fabric as a
//! switch that answers Link CTL traffic.
//!
//! Everything runs on one current-thread reactor; per-peer tasks and
//! doorbell watchers are `spawn_local`ed and share the [`Broker`] by `Rc`.

pub mod broker;
pub mod config;
pub mod handshake;
pub mod requests;
pub mod status;

use std::io;
use std::rc::Rc;

use tracing::warn;

pub use broker::{Broker, BrokerState, HandshakeError, Peer, PeerPhase};
pub use config::{BrokerConfig, ConfigError, SocketLock, SWITCH_CCLASS};
pub use status::StatusState;

use famez_mailbox::MailboxError;
use famez_wire::WireError;

/// Arm the broker's own doorbells on the reactor. Index 0 pairs with the
/// globals slot and never fires, so it stays unarmed.
///
/// Must be called from within a `LocalSet`.
pub fn arm_doorbells(broker: &Rc<Broker>) -> Result<(), WireError> {
    for (index, notifier) in broker.notifiers.iter().enumerate().skip(1) {
        let dup = notifier.try_clone()?;
        let owner = broker.clone();
        tokio::task::spawn_local(async move {
            let each = owner.clone();
            let result = famez_wire::watch(dup, index as u64, move |idx, count| {
                let broker = each.clone();
                async move { broker.service_doorbell(idx, count).await }
            })
            .await;
            if let Err(e) = result {
                warn!(index, error = %e, "doorbell watcher died");
            }
        });
    }
    Ok(())
}

/// Accept connections forever, one task per peer.
///
/// Must be called from within a `LocalSet`.
pub async fn accept_loop(broker: Rc<Broker>, listener: tokio::net::UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::task::spawn_local(handshake::run_peer(broker.clone(), stream));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Anything that can take the broker down. Only startup is allowed to be
/// fatal; per-peer failures never surface here.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Mailbox(MailboxError),
    Wire(WireError),
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Mailbox(e) => write!(f, "{}", e),
            Self::Wire(e) => write!(f, "{}", e),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Mailbox(e) => Some(e),
            Self::Wire(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<MailboxError> for ServerError {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<WireError> for ServerError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
