//! Nonblocking TCP socket wrapper.
//!
//! socket2 handles creation and option plumbing; accept goes through raw
//! `accept4` so the new descriptor is born nonblocking and close-on-exec
//! without extra fcntl round trips.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::Once;

use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::error;

/// A nonblocking stream socket owned by exactly one reactor object
/// (Acceptor, Connector, or TcpConnection). Closes on drop.
#[derive(Debug)]
pub(crate) struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a nonblocking, close-on-exec TCP socket for `addr`'s family.
    pub(crate) fn new_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let inner = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        inner.set_cloexec(true)?;
        Ok(Socket { inner })
    }

    /// Adopt an already-open descriptor (from `accept4`).
    ///
    /// The descriptor must be a connected nonblocking TCP socket.
    pub(crate) unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            inner: unsafe { socket2::Socket::from_raw_fd(fd) },
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(*addr))
    }

    pub(crate) fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// One `accept4(SOCK_NONBLOCK | SOCK_CLOEXEC)` call.
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = unsafe { Socket::from_raw_fd(fd) };
        let addr = sockaddr_to_addr(&storage).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "accepted non-inet address")
        })?;
        Ok((sock, addr))
    }

    /// Initiate a nonblocking connect. EINPROGRESS surfaces as an error with
    /// that raw os code; the caller drives completion through the poller.
    pub(crate) fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.connect(&SockAddr::from(*addr))
    }

    /// Close the write half, letting queued peer data drain.
    pub(crate) fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            error!("shutdown write on fd {}: {e}", self.fd());
        }
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub(crate) fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.inner.set_nodelay(on) {
            error!("TCP_NODELAY on fd {}: {e}", self.fd());
        }
    }

    pub(crate) fn set_keep_alive(&self, on: bool) {
        if let Err(e) = self.inner.set_keepalive(on) {
            error!("SO_KEEPALIVE on fd {}: {e}", self.fd());
        }
    }

    /// Fetch and clear the pending SO_ERROR.
    pub(crate) fn take_error(&self) -> Option<io::Error> {
        match self.inner.take_error() {
            Ok(err) => err,
            Err(e) => Some(e),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr().and_then(|a| {
            a.as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
        })
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr().and_then(|a| {
            a.as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))
        })
    }

    /// True when a connect landed on our own ephemeral port (possible when
    /// client and server share a host and the port range wraps).
    pub(crate) fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sa.sin6_port))))
        }
        _ => None,
    }
}

/// Ignore SIGPIPE process-wide. A write to a peer-closed socket must come
/// back as EPIPE, not kill the process.
pub(crate) fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listen_accept_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::new_nonblocking(&addr).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(16).unwrap();
        let bound = listener.local_addr().unwrap();
        assert_ne!(bound.port(), 0);

        let client = std::net::TcpStream::connect(bound).unwrap();
        // The connection is queued; accept may need a moment on a loaded box.
        let accepted = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("accept: {e}"),
            }
        };
        assert_eq!(accepted.1, client.local_addr().unwrap());
    }

    #[test]
    fn test_accept_on_empty_backlog_would_block() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::new_nonblocking(&addr).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(16).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_nonblocking_connect_in_progress() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::new_nonblocking(&addr).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(16).unwrap();
        let bound = listener.local_addr().unwrap();

        let client = Socket::new_nonblocking(&bound).unwrap();
        match client.connect(&bound) {
            Ok(()) => {}
            Err(e) => assert_eq!(e.raw_os_error(), Some(libc::EINPROGRESS)),
        }
    }
}
