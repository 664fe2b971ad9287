//! Single-threaded non-blocking reactor driving every connection. Application threads
//! never touch a socket: they enqueue commands on the [`Handle`], which wakes the loop
//! through a poll registration, and the loop mutates the channels.

use crate::net::conn::{Channel, Connection, Mode};
use crate::net::support::{ErrorKind, Failure, NetworkError, NetworkResult, Status};
use crate::proto::PeerReply;
use crate::queue::Fifo;
use crate::registry::Registry;
use helix::logging;
use indexmap::IndexMap;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

enum Cmd {
    Connect {
        uid: u32,
        conn: Connection,
        mode: Mode,
        endpoints: Vec<String>,
        tunnel_id: Vec<u8>,
    },
    Send {
        uid: u32,
        data: Vec<u8>,
    },
    CallRemote {
        uid: u32,
        peer_id: String,
        callback: Box<dyn FnMut(PeerReply) + Send>,
    },
    Close {
        uid: u32,
    },
    Shutdown,
}

#[inline]
fn system_error(err: io::Error) -> NetworkError {
    NetworkError::Fatal(Failure::coded(ErrorKind::System, err.raw_os_error().unwrap_or(0)))
}

/// Cloneable cross-thread handle to the event loop. Every operation enqueues a command
/// and wakes the loop; none of them block on network progress.
#[derive(Clone)]
pub struct Handle {
    queue: Arc<Fifo<Cmd>>,
    wake: SetReadiness,
    registry: Arc<Registry>,
}

impl Handle {
    fn submit(&self, cmd: Cmd) -> NetworkResult<()> {
        self.queue.put(cmd);
        self.wake.set_readiness(Ready::readable()).map_err(system_error)
    }

    /// Submits a connection towards the grid. Endpoints are `host:port` strings tried
    /// in order. Returns the registry uid assigned to the connection.
    pub fn connect_to_grid(&self, conn: &Connection, endpoints: &[&str]) -> NetworkResult<u32> {
        let uid = self.registry.insert(conn);

        self.submit(Cmd::Connect {
            uid,
            conn: conn.clone(),
            mode: Mode::Grid,
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            tunnel_id: Vec::new(),
        })?;

        Ok(uid)
    }

    /// Submits a connection towards a peer device through a forwarding relay, using a
    /// tunnel id previously obtained from the grid.
    pub fn connect_to_peer(&self, conn: &Connection, endpoints: &[&str], tunnel_id: &[u8]) -> NetworkResult<u32> {
        let uid = self.registry.insert(conn);

        self.submit(Cmd::Connect {
            uid,
            conn: conn.clone(),
            mode: Mode::Peer,
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            tunnel_id: tunnel_id.to_vec(),
        })?;

        Ok(uid)
    }

    /// Asks the grid connection to open a tunnel towards `peer_id`. The callback runs
    /// on the event loop thread when the grid answers and must not block.
    pub fn request_peer<F: FnMut(PeerReply) + Send + 'static>(
        &self,
        conn: &Connection,
        peer_id: &str,
        callback: F,
    ) -> NetworkResult<()> {
        self.submit(Cmd::CallRemote {
            uid: conn.uid(),
            peer_id: peer_id.to_string(),
            callback: Box::new(callback),
        })
    }

    /// Queues an application payload on an established connection.
    pub fn send(&self, conn: &Connection, data: &[u8]) -> NetworkResult<()> {
        self.submit(Cmd::Send {
            uid: conn.uid(),
            data: data.to_vec(),
        })
    }

    /// Tears a connection down. The connection reports `Closed` once the loop has
    /// released its socket; only then may the handle be dropped for good.
    pub fn close(&self, conn: &Connection) -> NetworkResult<()> {
        self.submit(Cmd::Close { uid: conn.uid() })
    }

    /// Stops the event loop after tearing down every connection.
    pub fn shutdown(&self) -> NetworkResult<()> {
        self.submit(Cmd::Shutdown)
    }

    /// Resolves a registry uid back to a connection handle.
    pub fn resolve(&self, uid: u32) -> Option<Connection> {
        self.registry.get(uid)
    }
}

/// The reactor. Owns the poll, the wake registration, the command queue and every
/// submitted channel.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    queue: Arc<Fifo<Cmd>>,
    wake: SetReadiness,
    _registration: Registration,
    registry: Arc<Registry>,
    channels: IndexMap<u32, Channel>,
    log: logging::Logger,
}

impl EventLoop {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> NetworkResult<EventLoop> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let poll = Poll::new().map_err(system_error)?;
        let (registration, wake) = Registration::new2();

        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())
            .map_err(system_error)?;

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            queue: Arc::new(Fifo::new()),
            wake,
            _registration: registration,
            registry: Arc::new(Registry::new()),
            channels: IndexMap::new(),
            log,
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            queue: self.queue.clone(),
            wake: self.wake.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Runs the reactor until a shutdown command arrives. Call from a dedicated thread.
    pub fn run(mut self) {
        logging::info!(self.log, "event loop running");

        loop {
            self.poll.poll(&mut self.events, None).expect("Poll failed");

            let ready: Vec<(Token, Ready)> = self.events.iter().map(|e| (e.token(), e.readiness())).collect();

            for (token, readiness) in ready {
                if token == WAKE_TOKEN {
                    if self.drain_commands() {
                        self.teardown();
                        return;
                    }
                } else {
                    self.dispatch(token, readiness);
                }
            }
        }
    }

    /// Processes queued commands. Returns true once a shutdown command is seen.
    fn drain_commands(&mut self) -> bool {
        // Reset the wake readiness before draining; a producer racing with the drain
        // re-arms it and the next poll turn picks the command up.
        drop(self.wake.set_readiness(Ready::empty()));

        while let Some(cmd) = self.queue.get() {
            match cmd {
                Cmd::Connect {
                    uid,
                    conn,
                    mode,
                    endpoints,
                    tunnel_id,
                } => self.add_channel(uid, conn, mode, &endpoints, tunnel_id),
                Cmd::Send { uid, data } => {
                    let result = match self.channels.get_mut(&uid) {
                        Some(channel) => channel.app_send(&data).and_then(|_| channel.flush()),
                        None => {
                            logging::debug!(self.log, "send for unknown connection"; "uid" => uid);
                            continue;
                        }
                    };
                    self.conclude(uid, result);
                }
                Cmd::CallRemote { uid, peer_id, callback } => {
                    let result = match self.channels.get_mut(&uid) {
                        Some(channel) => channel.call_remote(peer_id, callback).and_then(|_| channel.flush()),
                        None => {
                            logging::debug!(self.log, "peer request for unknown connection"; "uid" => uid);
                            continue;
                        }
                    };
                    self.conclude(uid, result);
                }
                Cmd::Close { uid } => self.retire(uid, None),
                Cmd::Shutdown => return true,
            }
        }

        false
    }

    /// Builds a channel for a submitted connection, resolves its endpoints in order and
    /// starts the connect.
    fn add_channel(&mut self, uid: u32, conn: Connection, mode: Mode, endpoints: &[String], tunnel_id: Vec<u8>) {
        let addrs = Self::resolve_endpoints(endpoints, &self.log);

        logging::debug!(self.log, "connection submitted";
                        "uid" => uid,
                        "mode" => ?mode,
                        "endpoints" => addrs.len());

        let mut channel = Channel::new(uid, &conn, mode, addrs, tunnel_id, &self.log);

        match channel.connect(&self.poll) {
            Ok(()) => {
                self.channels.insert(uid, channel);
            }
            Err(NetworkError::Fatal(failure)) => {
                channel.fail(failure);
                self.registry.remove(uid);
            }
            Err(_) => unreachable!("Connect is infallible short of a fatal error"),
        }
    }

    fn resolve_endpoints(endpoints: &[String], log: &logging::Logger) -> VecDeque<SocketAddr> {
        let mut addrs = VecDeque::new();

        for endpoint in endpoints {
            match endpoint.to_socket_addrs() {
                Ok(resolved) => addrs.extend(resolved),
                Err(err) => {
                    logging::warn!(log, "endpoint resolution failed"; "endpoint" => %endpoint, "error" => %err);
                }
            }
        }

        addrs
    }

    /// Routes a readiness event to its channel and folds the outcome.
    fn dispatch(&mut self, token: Token, readiness: Ready) {
        let uid = usize::from(token) as u32;

        let result = {
            let poll = &self.poll;

            match self.channels.get_mut(&uid) {
                Some(channel) => Self::service(channel, poll, readiness),
                None => return,
            }
        };

        self.conclude(uid, result);
    }

    fn service(channel: &mut Channel, poll: &Poll, readiness: Ready) -> NetworkResult<()> {
        if readiness.is_writable() {
            channel.on_writable(poll)?;
        }

        if readiness.is_readable() {
            match channel.on_readable() {
                Ok(()) | Err(NetworkError::Wait) => (),
                err => return err,
            }
        }

        // The handshake engine may have queued replies.
        match channel.flush() {
            Err(NetworkError::Wait) => Ok(()),
            other => other,
        }
    }

    /// Applies the outcome of a channel operation: nothing on progress, teardown on a
    /// close or a fatal error.
    fn conclude(&mut self, uid: u32, result: NetworkResult<()>) {
        match result {
            Ok(()) | Err(NetworkError::Wait) => (),
            Err(NetworkError::Closed) => self.retire(uid, None),
            Err(NetworkError::Fatal(failure)) => self.retire(uid, Some(failure)),
        }
    }

    /// Removes a channel, releasing its socket and publishing the terminal status.
    fn retire(&mut self, uid: u32, failure: Option<Failure>) {
        if let Some(mut channel) = self.channels.swap_remove(&uid) {
            channel.deregister(&self.poll);

            match failure {
                Some(failure) => channel.fail(failure),
                None => channel.close(),
            }
        }

        self.registry.remove(uid);
    }

    /// Closes every channel, drains leftover commands and wakes any waiters.
    fn teardown(&mut self) {
        logging::info!(self.log, "event loop shutting down"; "channels" => self.channels.len());

        let poll = &self.poll;

        for (uid, channel) in self.channels.iter_mut() {
            channel.deregister(poll);
            channel.close();
            self.registry.remove(*uid);
        }

        self.channels.clear();

        // Commands past the shutdown marker are dropped; pending connects settle as
        // closed so nobody waits forever.
        while let Some(cmd) = self.queue.get() {
            if let Cmd::Connect { uid, conn, .. } = cmd {
                conn.publish(Status::Closed, None);
                self.registry.remove(uid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::packet::{self, Command};
    use crate::net::testsrv::{client_keys, client_long_public, Server};
    use crate::proto::{self, ProtocolVersion};
    use byteorder::{BigEndian, ByteOrder};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn read_frame(stream: &mut std::net::TcpStream) -> Vec<u8> {
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).unwrap();

        let size = BigEndian::read_u16(&len) as usize;
        let mut frame = vec![0u8; size];
        stream.read_exact(&mut frame).unwrap();

        frame
    }

    fn write_frame(stream: &mut std::net::TcpStream, frame: &[u8]) {
        let mut len = [0u8; 2];
        BigEndian::write_u16(&mut len, frame.len() as u16);

        stream.write_all(&len).unwrap();
        stream.write_all(frame).unwrap();
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }

        panic!("Timed out waiting for {}", what);
    }

    /// Scripted grid server over a real socket: full handshake, one client payload,
    /// then the server hangs up.
    fn serve_grid(stream: &mut std::net::TcpStream) {
        let mut server = Server::new();

        let tell = read_frame(stream);
        assert_eq!(packet::parse(&tell).unwrap().command, Command::Tell);

        write_frame(stream, &server.welc());
        server.absorb_hello(&read_frame(stream), 1);

        write_frame(stream, &server.cook());
        server.absorb_vouch(&read_frame(stream), 2, &client_long_public(), true);

        write_frame(stream, &server.redy());

        let version_plain = server.open_client_mesg(&read_frame(stream), 3);
        let (msg_type, body) = proto::open_envelope(&version_plain).unwrap();
        assert_eq!(msg_type, proto::MSG_PROTOCOL_VERSION);
        assert_eq!(
            proto::decode::<ProtocolVersion>(body).unwrap(),
            ProtocolVersion::current()
        );

        let answer = proto::envelope(proto::MSG_PROTOCOL_VERSION, &ProtocolVersion::current());
        write_frame(stream, &server.mesg(&answer));

        let payload = server.open_client_mesg(&read_frame(stream), 4);
        assert_eq!(payload, b"hello grid");
    }

    #[test]
    fn test_grid_connection_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_thread = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            serve_grid(&mut stream);
            // Dropping the stream closes the connection on the client.
        });

        let event_loop = EventLoop::new(None).unwrap();
        let handle = event_loop.handle();
        let loop_thread = thread::spawn(move || event_loop.run());

        let conn = Connection::create(client_keys(), crate::DEFAULT_BUFFER_SIZE);

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let transitions_cb = transitions.clone();
        conn.set_status_callback(move |status| {
            transitions_cb.lock().unwrap().push(status);
        });

        let uid = handle.connect_to_grid(&conn, &[&addr.to_string()]).unwrap();

        assert_eq!(conn.wait_ready(), Status::Connected);
        assert_eq!(conn.error().0, ErrorKind::None);
        assert_eq!(handle.resolve(uid).unwrap().status(), Status::Connected);

        handle.send(&conn, b"hello grid").unwrap();

        server_thread.join().unwrap();

        // The server hung up after the payload; the loop turns that into a clean close.
        wait_for("connection close", || conn.status() == Status::Closed);

        {
            let transitions = transitions.lock().unwrap();
            assert_eq!(
                *transitions,
                vec![
                    Status::Connecting,
                    Status::Handshaking,
                    Status::Connected,
                    Status::Closed
                ]
            );
        }

        handle.shutdown().unwrap();
        loop_thread.join().unwrap();
    }

    #[test]
    fn test_connect_failure_settles_as_failed() {
        let event_loop = EventLoop::new(None).unwrap();
        let handle = event_loop.handle();
        let loop_thread = thread::spawn(move || event_loop.run());

        let conn = Connection::create(client_keys(), crate::DEFAULT_BUFFER_SIZE);

        // Nothing resolves, the endpoint list comes up empty.
        handle.connect_to_grid(&conn, &["definitely-not-a-real-host.invalid:7"]).unwrap();

        assert_eq!(conn.wait_ready(), Status::Failed);
        assert_eq!(conn.error().0, ErrorKind::Socket);

        handle.shutdown().unwrap();
        loop_thread.join().unwrap();
    }

    #[test]
    fn test_refused_endpoint_fails_connection() {
        // Bind a listener and drop it so the port is (almost certainly) refused.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let event_loop = EventLoop::new(None).unwrap();
        let handle = event_loop.handle();
        let loop_thread = thread::spawn(move || event_loop.run());

        let conn = Connection::create(client_keys(), crate::DEFAULT_BUFFER_SIZE);
        handle.connect_to_grid(&conn, &[&addr.to_string()]).unwrap();

        assert_eq!(conn.wait_ready(), Status::Failed);
        assert_eq!(conn.error().0, ErrorKind::Socket);

        handle.shutdown().unwrap();
        loop_thread.join().unwrap();
    }

    #[test]
    fn test_shutdown_closes_live_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // A server that accepts and then sits silent, keeping the handshake pending.
        let server_thread = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let event_loop = EventLoop::new(None).unwrap();
        let handle = event_loop.handle();
        let loop_thread = thread::spawn(move || event_loop.run());

        let conn = Connection::create(client_keys(), crate::DEFAULT_BUFFER_SIZE);
        handle.connect_to_grid(&conn, &[&addr.to_string()]).unwrap();

        wait_for("handshake to start", || conn.status() == Status::Handshaking);

        handle.shutdown().unwrap();
        loop_thread.join().unwrap();

        assert_eq!(conn.status(), Status::Closed);

        server_thread.join().unwrap();
    }
}
