//! The IVSHMSG rendezvous wire format.
//!
//! Every message on the UNIX socket is one 8-byte signed little-endian
//! integer, optionally accompanied by exactly one file descriptor in
//! SCM_RIGHTS ancillary data. This mirrors the QEMU ivshmem server and
//! client, fd-per-message; batching would improve throughput but break
//! compatibility.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::Interest;
use tokio::net::UnixStream;

/// Protocol version sent as the first greeting word.
pub const IVSHMSG_PROTOCOL_VERSION: i64 = 0;

/// Sentinel sent instead of the version to bomb a rejected client.
pub const IVSHMSG_BAD_VERSION: i64 = -1;

/// Send one protocol message, with its optional fd.
pub async fn send_msg(stream: &UnixStream, value: i64, fd: Option<RawFd>) -> Result<(), WireError> {
    let bytes = value.to_le_bytes();
    let mut sent = 0usize;
    let mut fd_pending = fd;
    while sent < bytes.len() {
        stream.writable().await.map_err(WireError::Os)?;
        match stream.try_io(Interest::WRITABLE, || {
            sendmsg_chunk(stream.as_raw_fd(), &bytes[sent..], fd_pending)
        }) {
            Ok(n) => {
                sent += n;
                // The fd rides with the first byte that makes it out.
                fd_pending = None;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(WireError::PeerGone),
            Err(e) => return Err(WireError::Os(e)),
        }
    }
    Ok(())
}

/// Receive one protocol message and any fd that rode along with it.
///
/// Returns [`WireError::PeerGone`] on a clean remote close.
pub async fn recv_msg(stream: &UnixStream) -> Result<(i64, Option<OwnedFd>), WireError> {
    let mut bytes = [0u8; 8];
    let mut got = 0usize;
    let mut fd: Option<OwnedFd> = None;
    while got < bytes.len() {
        stream.readable().await.map_err(WireError::Os)?;
        match stream.try_io(Interest::READABLE, || {
            recvmsg_chunk(stream.as_raw_fd(), &mut bytes[got..])
        }) {
            Ok((0, _)) => return Err(WireError::PeerGone),
            Ok((n, newfd)) => {
                got += n;
                if newfd.is_some() {
                    fd = newfd;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Err(WireError::PeerGone),
            Err(e) => return Err(WireError::Os(e)),
        }
    }
    Ok((i64::from_le_bytes(bytes), fd))
}

/// One sendmsg call: `data` plus an optional single SCM_RIGHTS fd.
fn sendmsg_chunk(sock: RawFd, data: &[u8], fd: Option<RawFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    // SAFETY: zero-initialized msghdr, fields filled below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let cmsg_space =
        unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as libc::c_uint) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];
    if let Some(fd) = fd {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;
        // SAFETY: the control buffer is CMSG_SPACE(sizeof(int)) bytes, so
        // the first header and its data slot are in bounds.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN(std::mem::size_of::<libc::c_int>() as libc::c_uint) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
        }
    }

    // SAFETY: msg points at live iov/control buffers for the duration of
    // the call. MSG_NOSIGNAL turns a dead peer into EPIPE, not SIGPIPE.
    let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// One recvmsg call into `buf`, capturing an SCM_RIGHTS fd if present.
fn recvmsg_chunk(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let cmsg_space =
        unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as libc::c_uint) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    // SAFETY: zero-initialized msghdr, fields filled below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: msg points at live buffers. MSG_CMSG_CLOEXEC keeps received
    // fds from leaking across an exec.
    let n = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fd = None;
    // SAFETY: the CMSG_* macros walk the control buffer the kernel filled.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw: libc::c_int =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                fd = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, fd))
}

/// Errors from the wire layer.
#[derive(Debug)]
pub enum WireError {
    /// Underlying OS failure.
    Os(io::Error),
    /// The remote end closed the stream.
    PeerGone,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Os(e) => write!(f, "wire I/O error: {}", e),
            Self::PeerGone => write!(f, "peer closed the rendezvous socket"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(e) => Some(e),
            Self::PeerGone => None,
        }
    }
}
