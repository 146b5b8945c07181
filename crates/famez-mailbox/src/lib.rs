//! The FAME-Z shared mailbox: a fixed-layout, file-backed region carved
//! into per-peer slots, exchanged over the IVSHMSG rendezvous socket.
//!
//! Slot 0 holds the read-only globals; slots `1..=nClients` belong to the
//! clients and slot `nClients + 1` to the broker. Payload exchange uses a
//! single-writer-per-slot discipline with `buflen` as the busy/empty
//! handshake; notification happens out-of-band via eventfd doorbells.

pub mod layout;
pub mod region;

pub use layout::{
    LayoutError, MailboxGlobals, MailslotHeader, MAILBOX_BUF_OFFSET, MAILBOX_MAX_SLOTS,
    MAILBOX_SIZE, MAILBOX_SLOT_SIZE, MAX_CLIENTS, MAX_PAYLOAD,
};
pub use region::{MailboxError, MailboxRegion};
