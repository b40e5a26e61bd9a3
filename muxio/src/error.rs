use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Errors returned by muxio's public constructors.
///
/// Syscall-level failures inside a running loop are logged and handled per
/// connection; only setup paths surface errors to the caller.
#[derive(Debug)]
pub enum Error {
    /// Generic I/O failure (poller, timerfd, eventfd, or thread setup).
    Io(io::Error),
    /// Binding the listening socket failed.
    Bind { addr: SocketAddr, source: io::Error },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Bind { addr, source } => write!(f, "bind {addr}: {source}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Bind { source, .. } => Some(source),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
