use crate::net::buffer::Buffer;
use crate::net::handshake;
use crate::net::packet::{self, Command};
use crate::net::support::{ErrorKind, Failure, NetworkError, NetworkResult, Status};
use crate::proto::PeerReply;
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use helix::crypto;
use helix::keys::KeyPair;
use helix::logging;
use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

// The write side holds several frames worth of data so short bursts survive a slow
// socket; anything beyond that queues as whole frames.
const WRITE_BUFFER_FACTOR: usize = 8;

/// What kind of endpoint the connection talks to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Unspecified,
    Grid,
    Peer,
}

/// The packet the handshake engine expects next.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Phase {
    Welcome,
    Cookie,
    Ready,
    Version,
    Data,
}

struct StatusSlot {
    status: Status,
    failure: Failure,
}

struct Callbacks {
    status: Option<Box<dyn FnMut(Status) + Send>>,
    receive: Option<Box<dyn FnMut(&[u8]) + Send>>,
}

pub(crate) struct Inner {
    uid: AtomicU32,
    buffer_size: usize,
    keys: KeyPair,
    state: Mutex<StatusSlot>,
    ready: Condvar,
    callbacks: Mutex<Callbacks>,
}

/// Application-side handle to a connection. The handle is cheap to clone; all protocol
/// state lives with the event loop once the connection is submitted, and the handle only
/// observes status, errors and decrypted payloads.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates a connection around a copy of the long-term client identity. `buffer_size`
    /// bounds the size of a single inbound frame.
    pub fn create(keys: KeyPair, buffer_size: usize) -> Connection {
        Connection {
            inner: Arc::new(Inner {
                uid: AtomicU32::new(0),
                buffer_size,
                keys,
                state: Mutex::new(StatusSlot {
                    status: Status::Closed,
                    failure: Failure::none(),
                }),
                ready: Condvar::new(),
                callbacks: Mutex::new(Callbacks {
                    status: None,
                    receive: None,
                }),
            }),
        }
    }

    /// Current status of the connection.
    pub fn status(&self) -> Status {
        self.inner.state.lock().expect("Connection state lock poisoned").status
    }

    /// The failure captured on the connection, `ErrorKind::None` while healthy.
    pub fn error(&self) -> (ErrorKind, i32) {
        let slot = self.inner.state.lock().expect("Connection state lock poisoned");
        (slot.failure.kind, slot.failure.code)
    }

    /// Registers a callback fired on every status transition. Runs on the event loop
    /// thread and must not block.
    pub fn set_status_callback<F: FnMut(Status) + Send + 'static>(&self, callback: F) {
        self.inner
            .callbacks
            .lock()
            .expect("Connection callback lock poisoned")
            .status = Some(Box::new(callback));
    }

    /// Registers a callback receiving decrypted payloads once the connection is
    /// established. Runs on the event loop thread and must not block.
    pub fn set_receive_callback<F: FnMut(&[u8]) + Send + 'static>(&self, callback: F) {
        self.inner
            .callbacks
            .lock()
            .expect("Connection callback lock poisoned")
            .receive = Some(Box::new(callback));
    }

    /// Blocks the calling thread until the connection is established, failed or closed,
    /// and returns the settled status.
    pub fn wait_ready(&self) -> Status {
        let mut slot = self.inner.state.lock().expect("Connection state lock poisoned");

        while !slot.status.is_settled() {
            slot = self.inner.ready.wait(slot).expect("Connection state lock poisoned");
        }

        slot.status
    }

    #[inline]
    pub(crate) fn keys(&self) -> KeyPair {
        self.inner.keys.clone()
    }

    #[inline]
    pub(crate) fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    #[inline]
    pub(crate) fn set_uid(&self, uid: u32) {
        self.inner.uid.store(uid, Ordering::Release);
    }

    #[inline]
    pub(crate) fn uid(&self) -> u32 {
        self.inner.uid.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    #[inline]
    pub(crate) fn from_inner(inner: Arc<Inner>) -> Connection {
        Connection { inner }
    }

    /// Publishes a status change to application-side observers. Waiters are woken first,
    /// then the status callback runs on the calling (event loop) thread.
    pub(crate) fn publish(&self, status: Status, failure: Option<Failure>) {
        {
            let mut slot = self.inner.state.lock().expect("Connection state lock poisoned");

            if slot.status == status {
                return;
            }

            slot.status = status;

            if let Some(failure) = failure {
                slot.failure = failure;
            }

            self.inner.ready.notify_all();
        }

        let mut callbacks = self.inner.callbacks.lock().expect("Connection callback lock poisoned");

        if let Some(callback) = callbacks.status.as_mut() {
            callback(status);
        }
    }

    /// Hands a decrypted payload to the application.
    pub(crate) fn deliver(&self, payload: &[u8]) {
        let mut callbacks = self.inner.callbacks.lock().expect("Connection callback lock poisoned");

        if let Some(callback) = callbacks.receive.as_mut() {
            callback(payload);
        }
    }
}

/// Event-loop side of a connection: the socket, the buffers and the complete protocol
/// state. Only the event loop thread ever touches a channel after submission.
pub(crate) struct Channel {
    pub(crate) uid: u32,
    pub(crate) mode: Mode,
    pub(crate) status: Status,
    pub(crate) phase: Phase,
    pub(crate) ctl: Connection,

    pub(crate) stream: Option<TcpStream>,
    addrs: VecDeque<SocketAddr>,
    last_error: Failure,

    pub(crate) keys: KeyPair,
    pub(crate) temp_public: [u8; packet::KEY_SIZE],
    pub(crate) temp_secret: [u8; packet::KEY_SIZE],
    pub(crate) server_key: [u8; packet::KEY_SIZE],
    pub(crate) session_key: [u8; crypto::SESSION_KEY_SIZE],
    pub(crate) cookie: [u8; packet::COOKIE_SIZE],
    pub(crate) nonce: u64,
    pub(crate) tunnel_id: Vec<u8>,

    peers: HashMap<u32, Box<dyn FnMut(PeerReply) + Send>>,
    next_peer_id: u32,

    pub(crate) read_buffer: Buffer,
    frame_size: Option<usize>,
    pub(crate) write_buffer: Buffer,
    pending: VecDeque<Vec<u8>>,

    pub(crate) log: logging::Logger,
}

impl Channel {
    pub fn new(
        uid: u32,
        ctl: &Connection,
        mode: Mode,
        addrs: VecDeque<SocketAddr>,
        tunnel_id: Vec<u8>,
        log: &logging::Logger,
    ) -> Channel {
        let buffer_size = ctl.buffer_size();

        Channel {
            uid,
            mode,
            status: Status::Closed,
            phase: Phase::Welcome,
            ctl: ctl.clone(),
            stream: None,
            addrs,
            last_error: Failure::new(ErrorKind::Socket),
            keys: ctl.keys(),
            temp_public: [0u8; packet::KEY_SIZE],
            temp_secret: [0u8; packet::KEY_SIZE],
            server_key: [0u8; packet::KEY_SIZE],
            session_key: [0u8; crypto::SESSION_KEY_SIZE],
            cookie: [0u8; packet::COOKIE_SIZE],
            nonce: 0,
            tunnel_id,
            peers: HashMap::new(),
            next_peer_id: 1,
            read_buffer: Buffer::new(buffer_size),
            frame_size: None,
            write_buffer: Buffer::new(buffer_size * WRITE_BUFFER_FACTOR),
            pending: VecDeque::new(),
            log: log.new(logging::o!("uid" => uid)),
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        Token(self.uid as usize)
    }

    /// Opens a TCP stream towards the next remaining endpoint and registers it on the
    /// poll. Endpoints that fail to open immediately are skipped in order; an exhausted
    /// list fails the connection with the last socket error.
    pub fn connect(&mut self, poll: &Poll) -> NetworkResult<()> {
        loop {
            let addr = match self.addrs.pop_front() {
                Some(addr) => addr,
                None => return Err(NetworkError::Fatal(self.last_error)),
            };

            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    logging::debug!(self.log, "connecting"; "endpoint" => %addr);

                    self.stream = Some(stream);
                    self.register(poll)?;
                    self.set_status(Status::Connecting);

                    return Ok(());
                }
                Err(err) => {
                    logging::debug!(self.log, "endpoint rejected"; "endpoint" => %addr, "error" => %err);
                    self.last_error = Failure::os(&err);
                }
            }
        }
    }

    /// Registers this channel on the supplied poll.
    pub fn register(&self, poll: &Poll) -> NetworkResult<()> {
        let stream = self.stream.as_ref().expect("Can't register a disconnected channel");

        poll.register(
            stream,
            self.token(),
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )
        .map_err(|err| NetworkError::Fatal(Failure::coded(ErrorKind::System, err.raw_os_error().unwrap_or(0))))
    }

    /// Deregisters this channel from the supplied poll. Failures are ignored, the poll
    /// drops dead sockets on its own.
    pub fn deregister(&self, poll: &Poll) {
        if let Some(stream) = self.stream.as_ref() {
            drop(poll.deregister(stream));
        }
    }

    /// Writable readiness: completes the pending connect (falling over to the next
    /// endpoint if this one failed), then drains buffered output.
    pub fn on_writable(&mut self, poll: &Poll) -> NetworkResult<()> {
        if self.status == Status::Connecting {
            let connect_error = {
                let stream = self.stream.as_ref().expect("Channel must have a stream");
                match stream.take_error() {
                    Ok(None) => None,
                    Ok(Some(err)) | Err(err) => Some(err),
                }
            };

            match connect_error {
                None => handshake::on_connect(self)?,
                Some(err) => {
                    logging::debug!(self.log, "endpoint connect failed"; "error" => %err);

                    self.last_error = Failure::os(&err);
                    self.deregister(poll);
                    self.teardown_stream();

                    return self.connect(poll);
                }
            }
        }

        self.on_readiness_flush()
    }

    /// Readable readiness: pump the socket through the two-phase frame reader.
    pub fn on_readable(&mut self) -> NetworkResult<()> {
        let stream = self.stream.take().expect("Channel must have a stream");
        let result = self.pump(&stream);
        self.stream = Some(stream);

        result
    }

    /// Two-phase frame reader: first exactly the two length bytes, then exactly the
    /// declared frame. A declared size past the receive buffer is fatal before a single
    /// body byte is requested. Complete frames go to the handshake engine.
    pub(crate) fn pump<R: io::Read>(&mut self, mut reader: R) -> NetworkResult<()> {
        loop {
            let have = self.read_buffer.len();
            let need = match self.frame_size {
                None => packet::LEN_PREFIX - have,
                Some(size) => packet::LEN_PREFIX + size - have,
            };

            if need > 0 {
                let count = self.read_buffer.ingress_limited(&mut reader, need)?;

                if count < need {
                    // End of stream. A close mid-handshake is an error, afterwards it is
                    // a normal teardown.
                    return match self.status {
                        Status::Connected => Err(NetworkError::Closed),
                        _ => Err(NetworkError::Fatal(Failure::new(ErrorKind::Socket))),
                    };
                }
            }

            match self.frame_size {
                None => {
                    let size = BigEndian::read_u16(&self.read_buffer.read_slice()[..packet::LEN_PREFIX]) as usize;

                    if packet::LEN_PREFIX + size > self.read_buffer.size() {
                        logging::debug!(self.log, "oversize frame"; "declared" => size);
                        return Err(NetworkError::fatal(ErrorKind::BufferExceeded));
                    }

                    if size == 0 {
                        return Err(NetworkError::fatal(ErrorKind::Protocol));
                    }

                    self.frame_size = Some(size);
                }
                Some(_) => {
                    let frame = self.read_buffer.read_slice()[packet::LEN_PREFIX..].to_vec();

                    self.read_buffer.clear();
                    self.frame_size = None;

                    handshake::on_packet(self, &frame)?;
                }
            }
        }
    }

    /// Queue a serialized frame for transmission. Data that does not fit the write
    /// buffer right now waits as a whole frame.
    pub(crate) fn enqueue_frame(&mut self, frame: Vec<u8>) {
        if self.pending.is_empty() && frame.len() <= self.write_buffer.free_capacity() {
            let len = frame.len();
            self.write_buffer.write_slice()[..len].copy_from_slice(&frame);
            self.write_buffer.move_tail(len);
        } else {
            self.pending.push_back(frame);
        }
    }

    /// Returns true if there is outgoing data on the channel.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty() || !self.pending.is_empty()
    }

    /// Flush buffered output to the socket until done or the socket pushes back.
    pub fn flush(&mut self) -> NetworkResult<()> {
        if !self.has_egress() || self.stream.is_none() {
            return Ok(());
        }

        let stream = self.stream.take().expect("Channel must have a stream");
        let result = self.drain(&stream);
        self.stream = Some(stream);

        result
    }

    /// Like `flush`, but swallows `Wait` so readiness handlers can tail-call it.
    fn on_readiness_flush(&mut self) -> NetworkResult<()> {
        match self.flush() {
            Err(NetworkError::Wait) => Ok(()),
            other => other,
        }
    }

    pub(crate) fn drain<W: io::Write>(&mut self, mut writer: W) -> NetworkResult<()> {
        loop {
            while let Some(front) = self.pending.front() {
                if front.len() > self.write_buffer.free_capacity() {
                    break;
                }

                let frame = self.pending.pop_front().expect("Pending queue must have a front");
                let len = frame.len();

                self.write_buffer.write_slice()[..len].copy_from_slice(&frame);
                self.write_buffer.move_tail(len);
            }

            if self.write_buffer.is_empty() {
                return Ok(());
            }

            self.write_buffer.egress(&mut writer)?;
        }
    }

    /// Encrypt and queue an application payload. Only legal on an established
    /// connection; anything else is a caller bug that gets logged and dropped.
    /// A payload that cannot fit a single frame is fatal.
    pub fn app_send(&mut self, data: &[u8]) -> NetworkResult<()> {
        if self.status != Status::Connected {
            logging::warn!(self.log, "send ignored, connection not established"; "status" => ?self.status);
            return Ok(());
        }

        let overhead = packet::LEN_PREFIX + packet::HEADER_SIZE + packet::NONCE_TAIL_SIZE + crypto::MAC_SIZE;

        if data.len() + overhead > self.read_buffer.size() {
            logging::warn!(self.log, "payload too large for a single frame"; "len" => data.len());
            return Err(NetworkError::fatal(ErrorKind::BufferExceeded));
        }

        self.send_mesg(data)
    }

    /// Seals a plaintext into a MESG frame under the session key, consuming the next
    /// nonce. Each outbound packet uses a fresh strictly increasing counter.
    pub(crate) fn send_mesg(&mut self, plain: &[u8]) -> NetworkResult<()> {
        let tail = self.next_nonce();
        let nonce = packet::short_term_nonce(packet::NONCE_CLIENT_MESSAGE, tail);
        let boxed = packet::seal_session(plain, &nonce, &self.session_key)?;

        let mut payload = vec![0u8; packet::NONCE_TAIL_SIZE];
        BigEndian::write_u64(&mut payload, tail);
        payload.extend_from_slice(&boxed);

        self.enqueue_frame(packet::frame(Command::Mesg, &payload));

        Ok(())
    }

    #[inline]
    pub(crate) fn next_nonce(&mut self) -> u64 {
        self.nonce += 1;
        self.nonce
    }

    /// Allocates a peer slot on a grid connection and asks the grid to open a tunnel
    /// towards the remote device.
    pub fn call_remote(
        &mut self,
        peer_id: String,
        callback: Box<dyn FnMut(PeerReply) + Send>,
    ) -> NetworkResult<()> {
        if self.mode != Mode::Grid || self.status != Status::Connected {
            logging::warn!(self.log, "peer request ignored";
                           "mode" => ?self.mode,
                           "status" => ?self.status);
            return Ok(());
        }

        let id = self.next_peer_id;
        self.next_peer_id += 1;
        self.peers.insert(id, callback);

        logging::debug!(self.log, "requesting peer tunnel"; "peer_id" => %peer_id, "id" => id);

        let request = crate::proto::CallRemote { id, peer_id };
        let envelope = crate::proto::envelope(crate::proto::MSG_CALL_REMOTE, &request);

        self.send_mesg(&envelope)
    }

    /// Routes a peer reply to the slot that requested it. Replies for unknown slots are
    /// logged and dropped.
    pub(crate) fn dispatch_peer_reply(&mut self, reply: PeerReply) {
        match self.peers.remove(&reply.id) {
            Some(mut callback) => callback(reply),
            None => {
                logging::debug!(self.log, "peer reply for unknown slot"; "id" => reply.id);
            }
        }
    }

    /// Atomic status update, published to the application side.
    pub fn set_status(&mut self, status: Status) {
        if self.status == status {
            return;
        }

        logging::debug!(self.log, "status change"; "from" => ?self.status, "to" => ?status);

        self.status = status;
        self.ctl.publish(status, None);
    }

    /// Captures a failure and moves the connection to `Failed`. Session secrets are
    /// wiped before the status becomes observable.
    pub fn fail(&mut self, failure: Failure) {
        logging::debug!(self.log, "connection failed";
                        "kind" => ?failure.kind,
                        "code" => failure.code,
                        "status" => ?self.status);

        self.scrub();
        self.teardown_stream();
        self.status = Status::Failed;
        self.ctl.publish(Status::Failed, Some(failure));
    }

    /// Clean teardown: wipes secrets, shuts the socket down and publishes `Closed`.
    pub fn close(&mut self) {
        logging::debug!(self.log, "closing channel"; "status" => ?self.status, "nonce" => self.nonce);

        self.scrub();
        self.teardown_stream();
        self.status = Status::Closed;
        self.ctl.publish(Status::Closed, None);
    }

    fn scrub(&mut self) {
        crypto::memzero(&mut self.temp_secret);
        crypto::memzero(&mut self.session_key);
        crypto::memzero(&mut self.cookie);
    }

    fn teardown_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream.shutdown(Shutdown::Both));
        }
    }

    /// Hands a decrypted payload to the application side.
    #[inline]
    pub(crate) fn deliver(&self, payload: &[u8]) {
        self.ctl.deliver(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_channel(mode: Mode) -> Channel {
        let conn = Connection::create(KeyPair::generate(), crate::DEFAULT_BUFFER_SIZE);
        let log = logging::Logger::root(logging::Discard, logging::o!());

        Channel::new(1, &conn, mode, VecDeque::new(), Vec::new(), &log)
    }

    #[test]
    fn test_pump_rejects_oversize_frame() {
        let mut channel = test_channel(Mode::Grid);
        channel.status = Status::Handshaking;

        // Declared size 0xffff with a 1536 byte receive buffer. The junk after the
        // length must never be requested.
        let mut wire = vec![0xffu8, 0xff];
        wire.extend_from_slice(&[0u8; 64]);

        let result = channel.pump(Cursor::new(wire));

        assert_eq!(result.unwrap_err(), NetworkError::fatal(ErrorKind::BufferExceeded));
        assert_eq!(channel.read_buffer.len(), packet::LEN_PREFIX);
    }

    #[test]
    fn test_pump_rejects_empty_frame() {
        let mut channel = test_channel(Mode::Grid);
        channel.status = Status::Handshaking;

        let result = channel.pump(Cursor::new(vec![0u8, 0]));

        assert_eq!(result.unwrap_err(), NetworkError::fatal(ErrorKind::Protocol));
    }

    #[test]
    fn test_pump_eof_mid_handshake_is_socket_error() {
        let mut channel = test_channel(Mode::Grid);
        channel.status = Status::Handshaking;

        let result = channel.pump(Cursor::new(vec![0u8]));

        assert_eq!(
            result.unwrap_err(),
            NetworkError::Fatal(Failure::new(ErrorKind::Socket))
        );
    }

    #[test]
    fn test_pump_eof_when_connected_is_clean_close() {
        let mut channel = test_channel(Mode::Peer);
        channel.status = Status::Connected;

        let result = channel.pump(Cursor::new(Vec::new()));

        assert_eq!(result.unwrap_err(), NetworkError::Closed);
    }

    #[test]
    fn test_pump_keeps_partial_frame_across_calls() {
        let mut channel = test_channel(Mode::Grid);
        channel.status = Status::Handshaking;

        struct Trickle {
            data: Vec<u8>,
            served: usize,
        }

        impl io::Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.served == self.data.len() {
                    return Err(io::ErrorKind::WouldBlock.into());
                }

                buf[0] = self.data[self.served];
                self.served += 1;
                Ok(1)
            }
        }

        let wire = packet::frame(Command::Tell, &[]);
        let mut trickle = Trickle {
            data: wire[..wire.len() - 1].to_vec(),
            served: 0,
        };

        assert_eq!(channel.pump(&mut trickle).unwrap_err(), NetworkError::Wait);
        assert_eq!(channel.read_buffer.len(), wire.len() - 1);
    }

    #[test]
    fn test_enqueue_overflow_goes_to_pending() {
        let mut channel = test_channel(Mode::Grid);

        // Leave two bytes of room so the next frame has to wait as a whole.
        let fill = channel.write_buffer.size() - 2;
        channel.enqueue_frame(vec![1u8; fill]);
        channel.enqueue_frame(vec![2u8; 100]);

        assert_eq!(channel.write_buffer.len(), fill);
        assert_eq!(channel.pending.len(), 1);

        let mut sink = Vec::new();
        channel.drain(&mut sink).unwrap();

        assert_eq!(sink.len(), fill + 100);
        assert!(!channel.has_egress());
    }

    #[test]
    fn test_send_rejects_oversize_payload() {
        let mut channel = test_channel(Mode::Grid);
        channel.status = Status::Connected;

        let result = channel.app_send(&vec![0u8; crate::DEFAULT_BUFFER_SIZE]);

        assert_eq!(result.unwrap_err(), NetworkError::fatal(ErrorKind::BufferExceeded));
        assert!(!channel.has_egress());
    }

    #[test]
    fn test_drain_moves_pending_after_buffer_clears() {
        let mut channel = test_channel(Mode::Grid);

        channel.enqueue_frame(vec![1u8; 100]);
        channel.pending.push_back(vec![2u8; 50]);

        let mut sink = Vec::new();
        channel.drain(&mut sink).unwrap();

        assert_eq!(sink.len(), 150);
        assert_eq!(&sink[..100], &[1u8; 100][..]);
        assert_eq!(&sink[100..], &[2u8; 50][..]);
        assert!(!channel.has_egress());
    }

    #[test]
    fn test_send_requires_connected() {
        let mut channel = test_channel(Mode::Grid);
        channel.status = Status::Handshaking;

        channel.app_send(b"too early").unwrap();

        assert!(!channel.has_egress());
        assert_eq!(channel.nonce, 0);
    }

    #[test]
    fn test_nonce_monotonicity() {
        let mut channel = test_channel(Mode::Peer);
        channel.status = Status::Connected;
        crypto::random_bytes(&mut channel.session_key);

        let session = channel.session_key;

        for expected in 1..=10_000u64 {
            channel.app_send(b"tick").unwrap();

            let wire = {
                let mut sink = Vec::new();
                channel.drain(&mut sink).unwrap();
                sink
            };

            let parsed = packet::parse(&wire[packet::LEN_PREFIX..]).unwrap();
            assert_eq!(parsed.command, Command::Mesg);

            let (tail, boxed) = packet::split_boxed_tail(parsed.payload).unwrap();
            assert_eq!(tail, expected);

            let nonce = packet::short_term_nonce(packet::NONCE_CLIENT_MESSAGE, tail);
            let plain = packet::open_session(boxed, &nonce, &session).unwrap();
            assert_eq!(plain, b"tick");
        }
    }

    #[test]
    fn test_status_publishes_to_handle() {
        let conn = Connection::create(KeyPair::generate(), crate::DEFAULT_BUFFER_SIZE);
        let log = logging::Logger::root(logging::Discard, logging::o!());
        let mut channel = Channel::new(1, &conn, Mode::Grid, VecDeque::new(), Vec::new(), &log);

        channel.set_status(Status::Connecting);
        assert_eq!(conn.status(), Status::Connecting);

        channel.fail(Failure::coded(ErrorKind::PeerTimeout, 2));

        assert_eq!(conn.status(), Status::Failed);
        assert_eq!(conn.error(), (ErrorKind::PeerTimeout, 2));
        assert_eq!(conn.wait_ready(), Status::Failed);
    }

    #[test]
    fn test_fail_scrubs_session_secrets() {
        let mut channel = test_channel(Mode::Grid);

        crypto::random_bytes(&mut channel.temp_secret);
        crypto::random_bytes(&mut channel.session_key);

        channel.fail(Failure::new(ErrorKind::Decryption));

        assert_eq!(channel.temp_secret, [0u8; packet::KEY_SIZE]);
        assert_eq!(channel.session_key, [0u8; crypto::SESSION_KEY_SIZE]);
    }

    #[test]
    fn test_peer_reply_dispatch() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let mut channel = test_channel(Mode::Grid);
        channel.status = Status::Connected;
        crypto::random_bytes(&mut channel.session_key);

        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = seen.clone();

        channel
            .call_remote(
                "device-01".into(),
                Box::new(move |reply| {
                    seen_cb.store(reply.id, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(channel.has_egress());

        channel.dispatch_peer_reply(PeerReply {
            id: 1,
            result: 0,
            tunnel_id: vec![0xaa; 16],
            host: "relay.example".into(),
            port: 443,
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // A second reply for the same slot has nowhere to go and must not panic.
        channel.dispatch_peer_reply(PeerReply {
            id: 1,
            result: 0,
            tunnel_id: Vec::new(),
            host: String::new(),
            port: 0,
        });
    }
}
