//! Broker configuration and the socket lock.
//!
//! Everything here is startup-time: once `BrokerConfig` exists the values
//! are immutable for the life of the process, and any failure is fatal
//! with a nonzero exit.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use famez_mailbox::MAX_CLIENTS;
use tracing::warn;

/// Component class the broker advertises for itself.
pub const SWITCH_CCLASS: &str = "FabricSwitch";

/// Subnet id a smart broker hands out as the fabric manager.
const DEFAULT_SID: u64 = 27;

/// Validated, derived broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Mailbox backing file name (bare names land in /dev/shm).
    pub mailbox: String,
    /// Rendezvous socket path.
    pub socketpath: PathBuf,
    /// Peer capacity.
    pub nclients: u64,
    /// Broker mediates only; owns no eventfds and no mailslot.
    pub silent: bool,
    /// Broker acts as fabric manager (answers Link RFC, randomizes ids).
    pub smart: bool,
    /// Preserve peer records across disconnects.
    pub recycle: bool,
    /// Diagnostic verbosity from the command line.
    pub verbose: u8,
    /// TCP port for the read-only status endpoint, when enabled.
    pub port: Option<u16>,

    // Derived at resolve time.
    pub nevents: u64,
    pub server_id: u64,
    pub default_sid: u64,
    pub server_sid0: u64,
    pub server_cid0: u64,
}

impl BrokerConfig {
    /// Validate raw CLI values and derive the fabric identity.
    pub fn resolve(
        mailbox: String,
        socketpath: PathBuf,
        nclients: u64,
        silent: bool,
        smart: bool,
        recycle: bool,
        verbose: u8,
        port: Option<u16>,
    ) -> Result<Self, ConfigError> {
        if mailbox.contains('/') && !mailbox.starts_with('/') {
            return Err(ConfigError::BadMailboxName(mailbox));
        }
        if silent && smart {
            return Err(ConfigError::SilentSmart);
        }
        if nclients == 0 || nclients > 62 {
            return Err(ConfigError::CapacityOutOfRange(nclients));
        }
        let nclients = if nclients > MAX_CLIENTS {
            warn!(
                requested = nclients,
                cap = MAX_CLIENTS,
                "nClients exceeds what the mailbox can hold; clamping"
            );
            MAX_CLIENTS
        } else {
            nclients
        };

        let server_id = nclients + 1;
        let (default_sid, server_sid0, server_cid0) = if smart {
            (DEFAULT_SID, DEFAULT_SID, server_id * 100)
        } else {
            (0, 0, 0)
        };

        Ok(Self {
            mailbox,
            socketpath,
            nclients,
            silent,
            smart,
            recycle,
            verbose,
            port,
            nevents: nclients + 2,
            server_id,
            default_sid,
            server_sid0,
            server_cid0,
        })
    }
}

/// The PID-symlink lock around the rendezvous socket path.
///
/// `<socketpath>.lock` is a symlink whose target is the broker's PID
/// rendered as text, so a second broker on the same path fails fast and
/// an operator can see who holds it. Dropping the lock removes both the
/// symlink and the socket file.
pub struct SocketLock {
    socketpath: PathBuf,
    lockpath: PathBuf,
}

impl SocketLock {
    pub fn acquire(socketpath: &Path) -> Result<Self, ConfigError> {
        if socketpath.exists() {
            return Err(ConfigError::SocketExists(socketpath.to_path_buf()));
        }
        let lockpath = PathBuf::from(format!("{}.lock", socketpath.display()));
        let pid = std::process::id().to_string();
        match std::os::unix::fs::symlink(&pid, &lockpath) {
            Ok(()) => Ok(Self {
                socketpath: socketpath.to_path_buf(),
                lockpath,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(ConfigError::LockHeld(lockpath))
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }
}

impl Drop for SocketLock {
    fn drop(&mut self) {
        std::fs::remove_file(&self.socketpath).ok();
        std::fs::remove_file(&self.lockpath).ok();
    }
}

/// Fatal startup problems.
#[derive(Debug)]
pub enum ConfigError {
    /// Relative mailbox names must be bare (no slashes).
    BadMailboxName(String),
    /// `--silent` and `--smart` are mutually exclusive.
    SilentSmart,
    /// nClients outside 1..=62.
    CapacityOutOfRange(u64),
    /// The socket path already exists; remove it first.
    SocketExists(PathBuf),
    /// Another broker holds the lock symlink.
    LockHeld(PathBuf),
    /// Underlying I/O failure while locking.
    Io(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMailboxName(name) => {
                write!(f, "mailbox name cannot have slashes: {}", name)
            }
            Self::SilentSmart => write!(f, "--silent and --smart are mutually exclusive"),
            Self::CapacityOutOfRange(n) => {
                write!(f, "nClients {} not in range 1-62", n)
            }
            Self::SocketExists(path) => {
                write!(f, "remove {}", path.display())
            }
            Self::LockHeld(path) => {
                write!(f, "another broker holds {}", path.display())
            }
            Self::Io(e) => write!(f, "lock I/O error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(nclients: u64, silent: bool, smart: bool) -> Result<BrokerConfig, ConfigError> {
        BrokerConfig::resolve(
            "famez_mailbox".into(),
            PathBuf::from("/tmp/famez_socket"),
            nclients,
            silent,
            smart,
            true,
            0,
            None,
        )
    }

    #[test]
    fn derived_identity_plain_vs_smart() {
        let plain = resolve(2, false, false).unwrap();
        assert_eq!(plain.server_id, 3);
        assert_eq!(plain.nevents, 4);
        assert_eq!(plain.server_sid0, 0);

        let smart = resolve(2, false, true).unwrap();
        assert_eq!(smart.default_sid, 27);
        assert_eq!(smart.server_sid0, 27);
        assert_eq!(smart.server_cid0, 300);
    }

    #[test]
    fn silent_and_smart_conflict() {
        assert!(matches!(resolve(2, true, true), Err(ConfigError::SilentSmart)));
    }

    #[test]
    fn capacity_bounds() {
        assert!(matches!(
            resolve(0, false, false),
            Err(ConfigError::CapacityOutOfRange(0))
        ));
        assert!(matches!(
            resolve(63, false, false),
            Err(ConfigError::CapacityOutOfRange(63))
        ));
        // In range for the flag but over the mailbox slot count clamps down.
        let clamped = resolve(40, false, false).unwrap();
        assert_eq!(clamped.nclients, MAX_CLIENTS);
        assert_eq!(clamped.server_id, MAX_CLIENTS + 1);
    }

    #[test]
    fn relative_mailbox_names_must_be_bare() {
        let cfg = BrokerConfig::resolve(
            "sub/dir".into(),
            PathBuf::from("/tmp/s"),
            2,
            false,
            false,
            true,
            0,
            None,
        );
        assert!(matches!(cfg, Err(ConfigError::BadMailboxName(_))));
    }

    #[test]
    fn lock_is_exclusive_and_cleans_up() {
        let sock = std::env::temp_dir().join(format!("famez_lock_test_{}", std::process::id()));
        std::fs::remove_file(&sock).ok();
        std::fs::remove_file(format!("{}.lock", sock.display())).ok();

        let lock = SocketLock::acquire(&sock).unwrap();
        assert!(matches!(
            SocketLock::acquire(&sock),
            Err(ConfigError::LockHeld(_))
        ));
        // The symlink target is this process's PID.
        let target = std::fs::read_link(format!("{}.lock", sock.display())).unwrap();
        assert_eq!(target.to_string_lossy(), std::process::id().to_string());

        drop(lock);
        assert!(SocketLock::acquire(&sock).is_ok());
        std::fs::remove_file(format!("{}.lock", sock.display())).ok();
    }
}
