//! Client side of the secure device grid. Applications create [`Connection`] handles, hand
//! them to the [`EventLoop`] and talk to grid servers (or, through a forwarded tunnel, to
//! remote peer devices) over mutually authenticated, end-to-end encrypted TCP sessions.
//!
//! All connection state lives on the event loop thread once a connection is submitted.
//! Application threads communicate with the loop through a command queue on the [`Handle`]
//! and observe progress through status callbacks or blocking waits on the connection.

pub mod net;
pub mod proto;
pub mod queue;
pub mod registry;

pub use crate::net::conn::{Connection, Mode};
pub use crate::net::eventloop::{EventLoop, Handle};
pub use crate::net::support::{ErrorKind, Status};

/// Default per-connection receive buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 1536;

/// Process-wide setup. Returns the root logger the event loop and connections derive
/// their child loggers from. Cryptography initializes itself on load.
pub fn init() -> helix::logging::Logger {
    helix::logging::init()
}
