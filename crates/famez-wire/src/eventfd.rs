//! Eventfd doorbells.
//!
//! An [`EventNotifier`] wraps a kernel event counter that is both writable
//! (increment, "ring the bell") and readable (drain, "answer the door").
//! The broker creates one list per peer, ships the raw fds across the
//! rendezvous socket via SCM_RIGHTS, and arms readers on its own list
//! through the reactor.

use std::future::Future;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::WireError;

/// A non-blocking, close-on-exec eventfd.
#[derive(Debug)]
pub struct EventNotifier {
    fd: OwnedFd,
}

impl EventNotifier {
    /// Create a fresh counter, initially zero.
    pub fn new() -> Result<Self, WireError> {
        // SAFETY: plain syscall; a non-negative return is a valid new fd.
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(WireError::Os(io::Error::last_os_error()));
        }
        // SAFETY: raw was just returned by eventfd and is owned by no one else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Adopt an fd received over the rendezvous socket.
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Increment the counter, waking whoever is armed on the read side.
    ///
    /// Returns `Ok(false)` when the kernel counter is saturated and the
    /// write would block; the ring was not delivered.
    pub fn ring(&self, delta: u64) -> Result<bool, WireError> {
        if delta == 0 {
            return Ok(false);
        }
        let bytes = delta.to_ne_bytes();
        loop {
            // SAFETY: valid fd, 8-byte buffer as the eventfd ABI requires.
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                )
            };
            if n == bytes.len() as isize {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(false),
                _ => return Err(WireError::Os(err)),
            }
        }
    }

    /// Read and reset the counter. `None` when nothing has fired.
    pub fn drain(&self) -> Result<Option<u64>, WireError> {
        let mut bytes = [0u8; 8];
        loop {
            // SAFETY: valid fd, 8-byte buffer as the eventfd ABI requires.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    bytes.as_mut_ptr() as *mut libc::c_void,
                    bytes.len(),
                )
            };
            if n == bytes.len() as isize {
                return Ok(Some(u64::from_ne_bytes(bytes)));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(WireError::Os(err)),
            }
        }
    }

    /// Duplicate the handle. Both handles refer to the same kernel counter,
    /// which is what lets the reactor drain an fd the peer record keeps for
    /// advertisement.
    pub fn try_clone(&self) -> Result<Self, WireError> {
        Ok(Self {
            fd: self.fd.try_clone().map_err(WireError::Os)?,
        })
    }
}

impl AsRawFd for EventNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Create `count` fresh notifiers, one per slot.
pub fn notifier_list(count: usize) -> Result<Vec<EventNotifier>, WireError> {
    (0..count).map(|_| EventNotifier::new()).collect()
}

/// Arm a notifier on the reactor: each time the counter fires, drain it and
/// invoke `on_fire(index, value)`.
///
/// Runs until the reactor drops the task or the fd errors out. Doorbell
/// counters are monotonic, so `value` may be ≥ 1 when rings coalesced.
pub async fn watch<F, Fut>(
    notifier: EventNotifier,
    index: u64,
    mut on_fire: F,
) -> Result<(), WireError>
where
    F: FnMut(u64, u64) -> Fut,
    Fut: Future<Output = ()>,
{
    let afd = AsyncFd::with_interest(notifier, Interest::READABLE).map_err(WireError::Os)?;
    loop {
        let mut guard = afd.readable().await.map_err(WireError::Os)?;
        match afd.get_ref().drain()? {
            Some(value) => {
                drop(guard);
                tracing::trace!(index, value, "doorbell drained");
                on_fire(index, value).await;
            }
            None => guard.clear_ready(),
        }
    }
}
