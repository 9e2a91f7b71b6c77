use std::fmt;
use std::io;

/// Errors returned by the transport's lifecycle surface.
///
/// Per-connection I/O failures never appear here; they are delivered to
/// the owning half-pipe and tear down only that connection.
#[derive(Debug)]
pub enum Error {
    /// A syscall failed.
    Io(io::Error),
    /// The call is not legal in the transport's current state.
    InvalidState(&'static str),
    /// Event loop setup failed (epoll, self-pipe, or thread affinity).
    Setup(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::Setup(msg) => write!(f, "setup: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
