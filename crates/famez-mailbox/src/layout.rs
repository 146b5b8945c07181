//! Mailbox memory layout definitions.
//!
//! This module defines the `repr(C)` structures that make up the shared
//! mailbox region. The layout is consumed by QEMU guests and the famez
//! kernel driver, so it is byte-exact and never changes shape at runtime.
//!
//! # Memory Layout
//!
//! ```text
//! +---------------------------------------------------------------+
//! | Slot 0: GLOBALS (read-only after install)                     |
//! |   slot_size, buf_offset, nClients, nEvents, server_id (u64)   |
//! +---------------------------------------------------------------+
//! | Slot 1 .. nClients: peer mailslots                            |
//! |   MailslotHeader (128 bytes) + payload buffer (384 bytes)     |
//! +---------------------------------------------------------------+
//! | Slot server_id (nClients + 1): the broker's mailslot          |
//! +---------------------------------------------------------------+
//! ```
//!
//! All integers are unsigned 64-bit little-endian. Strings are NUL-padded
//! so the region reads cleanly under `od -Ad -c -tu8`.

use std::fmt;
use std::sync::atomic::AtomicU64;

/// Total slot count in the region, including the globals slot.
pub const MAILBOX_MAX_SLOTS: usize = 16;

/// Size of one mailslot in bytes.
pub const MAILBOX_SLOT_SIZE: usize = 512;

/// Offset of the payload buffer within a slot.
pub const MAILBOX_BUF_OFFSET: usize = 128;

/// Total region size. QEMU requires a power of two for the BAR mapping.
pub const MAILBOX_SIZE: usize = MAILBOX_MAX_SLOTS * MAILBOX_SLOT_SIZE;

/// Longest payload that fits a slot, leaving one byte for the NUL.
pub const MAX_PAYLOAD: usize = MAILBOX_SLOT_SIZE - MAILBOX_BUF_OFFSET - 1;

/// Highest client count the region can carry (one slot for the globals,
/// one for the broker).
pub const MAX_CLIENTS: u64 = (MAILBOX_MAX_SLOTS - 2) as u64;

const _: () = assert!(MAILBOX_SIZE.is_power_of_two());
const _: () = assert!(MAILBOX_BUF_OFFSET + MAX_PAYLOAD + 1 == MAILBOX_SLOT_SIZE);

// =============================================================================
// Globals (slot 0)
// =============================================================================

/// The five-field globals header at offset 0 of the region.
///
/// Written exactly once at broker startup and never mutated thereafter.
/// Clients and the kernel driver read it to discover the slot geometry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxGlobals {
    /// Size of one slot (always [`MAILBOX_SLOT_SIZE`]).
    pub slot_size: u64,
    /// Offset of the payload buffer within a slot (always 128).
    pub buf_offset: u64,
    /// Number of client mailslots.
    pub nclients: u64,
    /// Total slot count: clients + the unused slot 0 + the broker.
    pub nevents: u64,
    /// Slot index of the broker's mailslot (`nclients + 1`).
    pub server_id: u64,
}

const _: () = assert!(core::mem::size_of::<MailboxGlobals>() == 40);

impl MailboxGlobals {
    /// Globals for a region serving `nclients` peers.
    pub fn for_clients(nclients: u64) -> Self {
        Self {
            slot_size: MAILBOX_SLOT_SIZE as u64,
            buf_offset: MAILBOX_BUF_OFFSET as u64,
            nclients,
            nevents: nclients + 2,
            server_id: nclients + 1,
        }
    }

    /// Validate a header read back from a mapped region.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.slot_size != MAILBOX_SLOT_SIZE as u64 {
            return Err(LayoutError::BadGlobals("slot_size"));
        }
        if self.buf_offset != MAILBOX_BUF_OFFSET as u64 {
            return Err(LayoutError::BadGlobals("buf_offset"));
        }
        if self.nclients == 0 || self.nclients > MAX_CLIENTS {
            return Err(LayoutError::BadGlobals("nClients"));
        }
        if self.nevents != self.nclients + 2 {
            return Err(LayoutError::BadGlobals("nEvents"));
        }
        if self.server_id != self.nclients + 1 {
            return Err(LayoutError::BadGlobals("server_id"));
        }
        Ok(())
    }
}

// =============================================================================
// Mailslot header
// =============================================================================

/// Metadata prefix of one mailslot (the first 128 bytes).
///
/// `buflen` doubles as the busy/empty handshake: zero means the slot is
/// free for its owner to fill, anything else means an unread message is
/// present. It is atomic because the reader on the other side of the
/// mapping may be another process.
#[repr(C)]
pub struct MailslotHeader {
    /// NUL-padded UTF-8 human name of the owning peer.
    pub nodename: [u8; 32],
    /// NUL-padded component-class label.
    pub cclass: [u8; 32],
    /// Valid payload bytes; 0 means the slot is empty.
    pub buflen: AtomicU64,
    /// Index of the owning peer; equals the slot number for the life of
    /// the region.
    pub peer_id: u64,
    /// Id of the peer that last consumed this slot.
    pub last_responder: AtomicU64,
    /// Fabric subnet identifier.
    pub peer_sid: AtomicU64,
    /// Fabric component identifier.
    pub peer_cid: AtomicU64,
    /// Zero-filled.
    pub _reserved: [u8; 24],
}

const _: () = assert!(core::mem::size_of::<MailslotHeader>() == MAILBOX_BUF_OFFSET);

/// Copy a string into a NUL-padded fixed field, truncating if needed.
pub(crate) fn pack_padded(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// Read a NUL-padded fixed field back into an owned string.
pub(crate) fn unpack_padded(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// A globals field does not describe this region shape.
    BadGlobals(&'static str),
    /// The mapped file is smaller than the region.
    RegionTooSmall { required: usize, found: usize },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadGlobals(field) => write!(f, "bad globals field: {}", field),
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small: need {} bytes, got {}", required, found)
            }
        }
    }
}

impl std::error::Error for LayoutError {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn slot_header_is_exactly_the_buf_offset() {
        assert_eq!(core::mem::size_of::<MailslotHeader>(), 128);
    }

    #[test]
    fn slot_field_offsets() {
        assert_eq!(offset_of!(MailslotHeader, nodename), 0);
        assert_eq!(offset_of!(MailslotHeader, cclass), 32);
        assert_eq!(offset_of!(MailslotHeader, buflen), 64);
        assert_eq!(offset_of!(MailslotHeader, peer_id), 72);
        assert_eq!(offset_of!(MailslotHeader, last_responder), 80);
        assert_eq!(offset_of!(MailslotHeader, peer_sid), 88);
        assert_eq!(offset_of!(MailslotHeader, peer_cid), 96);
        assert_eq!(offset_of!(MailslotHeader, _reserved), 104);
    }

    #[test]
    fn globals_derivation() {
        let g = MailboxGlobals::for_clients(2);
        assert_eq!(g.nevents, 4);
        assert_eq!(g.server_id, 3);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn globals_validation_rejects_skew() {
        let mut g = MailboxGlobals::for_clients(2);
        g.server_id = 7;
        assert_eq!(g.validate(), Err(LayoutError::BadGlobals("server_id")));

        let mut g = MailboxGlobals::for_clients(2);
        g.slot_size = 4096;
        assert_eq!(g.validate(), Err(LayoutError::BadGlobals("slot_size")));

        let g = MailboxGlobals::for_clients(0);
        assert_eq!(g.validate(), Err(LayoutError::BadGlobals("nClients")));

        let g = MailboxGlobals::for_clients(MAX_CLIENTS + 1);
        assert_eq!(g.validate(), Err(LayoutError::BadGlobals("nClients")));
    }

    #[test]
    fn padded_string_round_trip() {
        let mut field = [0u8; 32];
        pack_padded(&mut field, "Z-switch");
        assert_eq!(unpack_padded(&field), "Z-switch");
        assert_eq!(field[8], 0);

        // Oversized names truncate, always leaving a terminator.
        let long = "x".repeat(40);
        pack_padded(&mut field, &long);
        assert_eq!(field[31], 0);
        assert_eq!(unpack_padded(&field).len(), 31);
    }
}
