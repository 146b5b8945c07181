//! Wire plumbing for the FAME-Z fabric: the IVSHMSG rendezvous codec
//! (8-byte integers with optional SCM_RIGHTS fds over a UNIX socket) and
//! the eventfd doorbells distributed through it.

pub mod eventfd;
pub mod wire;

pub use eventfd::{EventNotifier, notifier_list, watch};
pub use wire::{IVSHMSG_BAD_VERSION, IVSHMSG_PROTOCOL_VERSION, WireError, recv_msg, send_msg};
