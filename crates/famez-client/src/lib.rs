//! Native FAME-Z fabric client.
//!
//! Connects to the broker's rendezvous socket, walks the IVSHMSG
//! handshake, attaches the shared mailbox, and then exchanges Link CTL
//! traffic through mailslots and doorbells like any other peer.

pub mod requests;
pub mod session;

pub use requests::{ClientCtx, dispatch_client};
pub use session::{CLIENT_CCLASS, ClientError, ClientState, FabricClient, FabricEvent};
