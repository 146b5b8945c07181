//! Mailbox region lifecycle and slot I/O.
//!
//! The broker creates (or re-conditions) the backing file and installs the
//! globals; clients attach to an fd received during the IVSHMSG handshake.
//! Either way the region ends up mapped shared and all slot traffic goes
//! through the `buflen` busy-flag handshake.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::layout::{
    LayoutError, MailboxGlobals, MailslotHeader, MAILBOX_BUF_OFFSET, MAILBOX_SIZE,
    MAILBOX_SLOT_SIZE, MAX_PAYLOAD, pack_padded, unpack_padded,
};

/// Groups tried, in order, when aligning the backing file for QEMU access.
const FABRIC_GROUPS: [&str; 3] = ["libvirt-qemu", "libvirt", "libvirtd"];

/// How long `fill` waits for the previous message to drain before stomping.
const STOMP_PATIENCE: Duration = Duration::from_millis(1050);

/// Interval between `buflen` probes while waiting.
const STOMP_PROBE: Duration = Duration::from_millis(100);

/// The shared mapping. Unmapped on drop; the `File` keeps the fd alive for
/// the handshake's SCM_RIGHTS transfer.
struct Mapping {
    base: *mut u8,
    len: usize,
    file: File,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len were returned by a successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// A mapped mailbox region, broker- or client-side.
pub struct MailboxRegion {
    mapping: Mapping,
    globals: MailboxGlobals,
    path: Option<PathBuf>,
}

// SAFETY: cross-slot traffic is synchronized by the buflen handshake and the
// atomic fields of MailslotHeader; the nodename/cclass byte fields are only
// written by the slot's owner.
unsafe impl Send for MailboxRegion {}
unsafe impl Sync for MailboxRegion {}

impl MailboxRegion {
    /// Create or re-condition the backing file at `name` and install the
    /// globals for `nclients` peers.
    ///
    /// A bare name (no slash) lands in `/dev/shm`. A pre-existing file is
    /// reused when it is a regular file of at least the region size with
    /// group read/write access; group and permissions are fixed up when
    /// they fall short of that.
    pub fn create(name: &str, nclients: u64, smart: bool) -> Result<Self, MailboxError> {
        let globals = MailboxGlobals::for_clients(nclients);
        globals.validate().map_err(MailboxError::Layout)?;

        let path = if name.contains('/') {
            PathBuf::from(name)
        } else {
            Path::new("/dev/shm").join(name)
        };

        let gid = fabric_gid();

        // The 0666 create below must not be narrowed by the caller's umask.
        let old_umask = unsafe { libc::umask(0) };
        let opened = open_backing_file(&path, gid);
        unsafe { libc::umask(old_umask) };

        let file = opened.map_err(|reason| MailboxError::BadBackingFile {
            path: path.display().to_string(),
            reason,
        })?;

        let mapping = map_shared(file)?;
        let mut region = Self {
            mapping,
            globals,
            path: Some(path),
        };
        region.install_globals(smart);
        Ok(region)
    }

    /// Attach to a region fd received over the rendezvous socket and read
    /// back the globals the broker installed.
    pub fn attach(fd: OwnedFd) -> Result<Self, MailboxError> {
        let file = File::from(fd);
        let found = file.metadata().map_err(MailboxError::Io)?.len() as usize;
        if found < MAILBOX_SIZE {
            return Err(MailboxError::Layout(LayoutError::RegionTooSmall {
                required: MAILBOX_SIZE,
                found,
            }));
        }

        let mapping = map_shared(file)?;
        // SAFETY: the mapping is at least MAILBOX_SIZE bytes and the globals
        // live at offset 0; repr(C) u64 fields read back the installed bytes.
        let globals = unsafe { (mapping.base as *const MailboxGlobals).read() };
        globals.validate().map_err(MailboxError::Layout)?;

        Ok(Self {
            mapping,
            globals,
            path: None,
        })
    }

    /// Zero the region, write the globals header, stamp each slot's
    /// `peer_id`, and name the broker's own slot.
    fn install_globals(&mut self, smart: bool) {
        let g = self.globals;
        // SAFETY: exclusive access at startup; nothing has been advertised yet.
        unsafe {
            std::ptr::write_bytes(self.mapping.base, 0, self.mapping.len);
            (self.mapping.base as *mut MailboxGlobals).write(g);
            for slot in 1..=g.server_id {
                (*self.slot_ptr(slot)).peer_id = slot;
            }
        }
        let name = if smart { "Z-switch" } else { "Z-server" };
        self.set_nodename(g.server_id, name);
        self.set_cclass(g.server_id, "FabricSwitch");
        info!(
            nclients = g.nclients,
            server_id = g.server_id,
            nodename = name,
            "mailbox globals installed"
        );
    }

    pub fn globals(&self) -> &MailboxGlobals {
        &self.globals
    }

    pub fn nclients(&self) -> u64 {
        self.globals.nclients
    }

    pub fn nevents(&self) -> u64 {
        self.globals.nevents
    }

    pub fn server_id(&self) -> u64 {
        self.globals.server_id
    }

    /// The backing fd, passed to new peers during the handshake.
    pub fn raw_fd(&self) -> i32 {
        self.mapping.file.as_raw_fd()
    }

    /// The backing path, when this side created the file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn slot_ptr(&self, slot: u64) -> *mut MailslotHeader {
        // SAFETY: callers bounds-check slot against server_id; the region is
        // always MAILBOX_SIZE bytes.
        unsafe {
            self.mapping
                .base
                .add(slot as usize * MAILBOX_SLOT_SIZE)
                .cast::<MailslotHeader>()
        }
    }

    fn slot_header(&self, slot: u64) -> Result<&MailslotHeader, MailboxError> {
        if slot == 0 || slot > self.globals.server_id {
            return Err(MailboxError::BadSlot { slot });
        }
        // SAFETY: bounds-checked above; the header is within the mapping and
        // its mutable fields are atomics.
        Ok(unsafe { &*self.slot_ptr(slot) })
    }

    /// Copy a payload into `sender`'s slot and publish its length.
    ///
    /// If the previous message has not been drained, probes `buflen` every
    /// 100 ms for up to 1.05 s, then stomps: a reader that stays busy that
    /// long is assumed dead and head-of-line blocking is worse than losing
    /// its unread message.
    pub async fn fill(&self, sender: u64, payload: &[u8]) -> Result<(), MailboxError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(MailboxError::PayloadTooLong { len: payload.len() });
        }
        let hdr = self.slot_header(sender)?;

        let deadline = tokio::time::Instant::now() + STOMP_PATIENCE;
        while hdr.buflen.load(Ordering::Acquire) != 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(sender, "pseudo-HW not ready; stomping");
                break;
            }
            tokio::time::sleep(STOMP_PROBE).await;
        }

        // SAFETY: sender is bounds-checked; only the slot owner writes the
        // buffer, and the Release store below publishes it.
        unsafe {
            let buf = self
                .mapping
                .base
                .add(sender as usize * MAILBOX_SLOT_SIZE + MAILBOX_BUF_OFFSET);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), buf, payload.len());
            *buf.add(payload.len()) = 0;
        }
        hdr.buflen.store(payload.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Read the payload currently in `slot`. With `clear`, zeroes `buflen`
    /// afterwards as the "drained, refill allowed" signal.
    pub fn retrieve(&self, slot: u64, clear: bool) -> Result<Vec<u8>, MailboxError> {
        let hdr = self.slot_header(slot)?;
        let len = (hdr.buflen.load(Ordering::Acquire) as usize).min(MAX_PAYLOAD + 1);
        // SAFETY: bounds-checked slot, len clamped to the buffer size.
        let payload = unsafe {
            let buf = self
                .mapping
                .base
                .add(slot as usize * MAILBOX_SLOT_SIZE + MAILBOX_BUF_OFFSET);
            std::slice::from_raw_parts(buf, len).to_vec()
        };
        if clear {
            hdr.buflen.store(0, Ordering::Release);
        }
        Ok(payload)
    }

    /// Record which peer drained `slot` last.
    pub fn note_responder(&self, slot: u64, reader: u64) -> Result<(), MailboxError> {
        self.slot_header(slot)?
            .last_responder
            .store(reader, Ordering::Relaxed);
        Ok(())
    }

    /// Zero a departed peer's name fields; `peer_id` stays so the slot is
    /// still self-describing.
    pub fn clear_slot(&self, slot: u64) -> Result<(), MailboxError> {
        self.slot_header(slot)?;
        debug!(slot, "clearing mailslot identity");
        // SAFETY: bounds-checked above; nodename/cclass are the first 64
        // bytes of the slot.
        unsafe {
            std::ptr::write_bytes(self.mapping.base.add(slot as usize * MAILBOX_SLOT_SIZE), 0, 64);
        }
        Ok(())
    }

    pub fn nodename(&self, slot: u64) -> Result<String, MailboxError> {
        Ok(unpack_padded(&self.slot_header(slot)?.nodename))
    }

    pub fn set_nodename(&self, slot: u64, name: &str) {
        if slot == 0 || slot > self.globals.server_id {
            return;
        }
        // SAFETY: bounds-checked; only the slot owner names its slot.
        unsafe { pack_padded(&mut (*self.slot_ptr(slot)).nodename, name) }
    }

    pub fn cclass(&self, slot: u64) -> Result<String, MailboxError> {
        Ok(unpack_padded(&self.slot_header(slot)?.cclass))
    }

    pub fn set_cclass(&self, slot: u64, cclass: &str) {
        if slot == 0 || slot > self.globals.server_id {
            return;
        }
        // SAFETY: bounds-checked; only the slot owner labels its slot.
        unsafe { pack_padded(&mut (*self.slot_ptr(slot)).cclass, cclass) }
    }

    pub fn peer_sid(&self, slot: u64) -> Result<u64, MailboxError> {
        Ok(self.slot_header(slot)?.peer_sid.load(Ordering::Relaxed))
    }

    pub fn peer_cid(&self, slot: u64) -> Result<u64, MailboxError> {
        Ok(self.slot_header(slot)?.peer_cid.load(Ordering::Relaxed))
    }

    pub fn set_peer_ids(&self, slot: u64, sid: u64, cid: u64) -> Result<(), MailboxError> {
        let hdr = self.slot_header(slot)?;
        hdr.peer_sid.store(sid, Ordering::Relaxed);
        hdr.peer_cid.store(cid, Ordering::Relaxed);
        Ok(())
    }
}

/// Map the backing file shared read/write for exactly the region size.
fn map_shared(file: File) -> Result<Mapping, MailboxError> {
    // SAFETY: file is open read/write and at least MAILBOX_SIZE long.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            MAILBOX_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(MailboxError::Io(io::Error::last_os_error()));
    }
    Ok(Mapping {
        base: base as *mut u8,
        len: MAILBOX_SIZE,
        file,
    })
}

/// Best-effort lookup of a QEMU-ish group to own the backing file.
fn fabric_gid() -> Option<u32> {
    for name in FABRIC_GROUPS {
        let Ok(cname) = CString::new(name) else {
            continue;
        };
        // SAFETY: getgrnam takes a NUL-terminated name; the result is only
        // read before the next getgrnam call.
        let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
        if !grp.is_null() {
            return Some(unsafe { (*grp).gr_gid });
        }
    }
    None
}

/// Create the backing file, or validate and fix up an existing one.
fn open_backing_file(path: &Path, gid: Option<u32>) -> Result<File, String> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(0o666)
                .open(path)
                .map_err(|e| format!("create: {}", e))?;
            file.set_len(MAILBOX_SIZE as u64)
                .map_err(|e| format!("allocate: {}", e))?;
            if let Some(gid) = gid {
                // Missing group or no privilege is not fatal.
                let _ = std::os::unix::fs::fchown(&file, None, Some(gid));
            }
            return Ok(file);
        }
        Err(e) => return Err(format!("stat: {}", e)),
    };

    // Re-condition and re-use.
    if !meta.is_file() {
        return Err("not a regular file".into());
    }
    if (meta.len() as usize) < MAILBOX_SIZE {
        return Err(format!(
            "existing size ({}) is < required ({})",
            meta.len(),
            MAILBOX_SIZE
        ));
    }
    if let Some(gid) = gid {
        if meta.gid() != gid {
            info!(path = %path.display(), gid, "changing mailbox group");
            let _ = std::os::unix::fs::chown(path, None, Some(gid));
        }
    }
    if meta.mode() & 0o660 != 0o660 {
        info!(path = %path.display(), "widening mailbox permissions to 0666");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
            .map_err(|e| format!("chmod: {}", e))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| format!("open: {}", e))
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from region creation, attachment, and slot I/O.
#[derive(Debug)]
pub enum MailboxError {
    /// The backing file exists but cannot serve as a mailbox.
    BadBackingFile { path: String, reason: String },
    /// Payload does not fit the 384-byte buffer with its terminator.
    PayloadTooLong { len: usize },
    /// Slot index outside `1..=server_id`.
    BadSlot { slot: u64 },
    /// Globals or size validation failed.
    Layout(LayoutError),
    /// Underlying I/O failure.
    Io(io::Error),
}

impl std::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadBackingFile { path, reason } => {
                write!(f, "problem with {}: {}", path, reason)
            }
            Self::PayloadTooLong { len } => {
                write!(f, "payload too long: {} bytes, max {}", len, MAX_PAYLOAD)
            }
            Self::BadSlot { slot } => write!(f, "slot {} out of domain", slot),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for MailboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Layout(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
