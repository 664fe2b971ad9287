use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Connection lifecycle states. A connection only ever advances through these, except
/// for the jumps into `Failed` (from anywhere) and `Closed` (teardown or remote close).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Closed,
    Connecting,
    Forwarding,
    Handshaking,
    Connected,
    Failed,
}

impl Status {
    /// True once the connection reached a state an application-side waiter cares about.
    #[inline]
    pub fn is_settled(self) -> bool {
        match self {
            Status::Connected | Status::Failed | Status::Closed => true,
            _ => false,
        }
    }
}

/// Failure categories captured on a connection when it transitions to `Failed`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    None,
    Socket,
    CryptoCore,
    Decryption,
    Encryption,
    Protocol,
    BufferExceeded,
    ServerError,
    PeerTimeout,
    System,
}

/// Error kind plus the accompanying numeric code: the OS errno for `Socket`, the grid
/// error code for `ServerError`/`PeerTimeout`, zero otherwise.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub code: i32,
}

impl Failure {
    #[inline]
    pub fn new(kind: ErrorKind) -> Failure {
        Failure { kind, code: 0 }
    }

    #[inline]
    pub fn coded(kind: ErrorKind, code: i32) -> Failure {
        Failure { kind, code }
    }

    #[inline]
    pub fn os(err: &io::Error) -> Failure {
        Failure {
            kind: ErrorKind::Socket,
            code: err.raw_os_error().unwrap_or(0),
        }
    }

    #[inline]
    pub fn none() -> Failure {
        Failure::new(ErrorKind::None)
    }
}

/// Internal result plumbing. `Wait` means the operation cannot make progress right now
/// and should be retried on the next readiness event; `Closed` is a clean remote close;
/// `Fatal` tears the connection down with the captured failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Closed,
    Fatal(Failure),
}

impl NetworkError {
    #[inline]
    pub fn fatal(kind: ErrorKind) -> NetworkError {
        NetworkError::Fatal(Failure::new(kind))
    }
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            _ => NetworkError::Fatal(Failure::os(&io_error)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Err(NetworkError::Fatal(_)) => true,
            _ => false,
        }
    }
}
