//! The client side of the CurveCP-derived handshake, driven packet by packet.
//!
//! The engine is purely reactive: the event loop calls [`on_connect`] once the transport
//! is up and [`on_packet`] for every complete inbound frame. Both mutate the channel and
//! may queue outbound frames; they never touch the socket themselves.
//!
//! Grid connections run `TELL -> WELC -> HELO -> COOK -> VOCH -> REDY` followed by a
//! version exchange inside MESG. Peer tunnels first clear the unencrypted forwarding
//! exchange with the relay, then run the same handshake, and are established as soon as
//! REDY arrives.

use crate::net::conn::{Channel, Mode, Phase};
use crate::net::packet::{self, Command};
use crate::net::support::{ErrorKind, Failure, NetworkError, NetworkResult, Status};
use crate::proto::{self, ForwardError, ForwardReply, PeerReply, ProtocolVersion};
use byteorder::{BigEndian, ByteOrder};
use helix::crypto;
use helix::logging;

/// The transport is connected: open the conversation. Grid connections ask for the
/// server welcome, peer tunnels present their tunnel id to the relay first.
pub(crate) fn on_connect(ch: &mut Channel) -> NetworkResult<()> {
    match ch.mode {
        Mode::Grid => {
            logging::debug!(ch.log, "transport up, requesting welcome");

            ch.enqueue_frame(packet::frame(Command::Tell, &[]));
            ch.phase = Phase::Welcome;
            ch.set_status(Status::Handshaking);
        }
        Mode::Peer => {
            logging::debug!(ch.log, "transport up, presenting tunnel id");

            let remote = proto::ForwardRemote {
                tunnel_id: ch.tunnel_id.clone(),
            };

            // The forwarding envelope is its own wire frame: the envelope size field
            // doubles as the frame length.
            ch.enqueue_frame(proto::envelope(proto::MSG_FORWARD_REMOTE, &remote));
            ch.set_status(Status::Forwarding);
        }
        Mode::Unspecified => panic!("Channel submitted without a mode"),
    }

    Ok(())
}

/// A complete inbound frame (length prefix already stripped).
pub(crate) fn on_packet(ch: &mut Channel, frame: &[u8]) -> NetworkResult<()> {
    if ch.status == Status::Forwarding {
        return on_forward_packet(ch, frame);
    }

    let packet = packet::parse(frame)?;

    match (packet.command, ch.phase) {
        (Command::Welc, Phase::Welcome) => on_welcome(ch, packet.payload),
        (Command::Cook, Phase::Cookie) => on_cookie(ch, packet.payload),
        (Command::Redy, Phase::Ready) => on_ready(ch, packet.payload),
        (Command::Mesg, Phase::Version) => on_version(ch, packet.payload),
        (Command::Mesg, Phase::Data) => on_message(ch, packet.payload),
        (command, phase) => {
            logging::warn!(ch.log, "unexpected packet"; "command" => ?command, "phase" => ?phase);
            Err(NetworkError::fatal(ErrorKind::Protocol))
        }
    }
}

/// Relay traffic preceding the handshake on a peer tunnel: `HOLD` is a keepalive while
/// the remote device is being woken up, `REPLY` switches over to the handshake, `ERROR`
/// is terminal.
fn on_forward_packet(ch: &mut Channel, frame: &[u8]) -> NetworkResult<()> {
    if frame.is_empty() {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    let msg_type = frame[0];
    let body = &frame[1..];

    match msg_type {
        proto::MSG_FORWARD_HOLD => {
            logging::trace!(ch.log, "relay holding");
            Ok(())
        }
        proto::MSG_FORWARD_REPLY => {
            let reply: ForwardReply = proto::decode(body)?;

            if reply.signature != proto::FORWARD_SIGNATURE {
                logging::warn!(ch.log, "relay signature mismatch");
                return Err(NetworkError::fatal(ErrorKind::Protocol));
            }

            logging::debug!(ch.log, "relay accepted tunnel, requesting welcome");

            ch.enqueue_frame(packet::frame(Command::Tell, &[]));
            ch.phase = Phase::Welcome;
            ch.set_status(Status::Handshaking);

            Ok(())
        }
        proto::MSG_FORWARD_ERROR => {
            let error: ForwardError = proto::decode(body)?;

            let kind = match error.code {
                proto::FORWARD_PEER_TIMEOUT => ErrorKind::PeerTimeout,
                _ => ErrorKind::ServerError,
            };

            Err(NetworkError::Fatal(Failure::coded(kind, error.code as i32)))
        }
        other => {
            logging::warn!(ch.log, "unexpected relay message"; "msg_type" => other);
            Err(NetworkError::fatal(ErrorKind::Protocol))
        }
    }
}

/// WELC carries the server long-term key. Answer with HELO: a fresh short-term key and
/// a box of zeroes proving we hold its secret half.
fn on_welcome(ch: &mut Channel, payload: &[u8]) -> NetworkResult<()> {
    if payload.len() < packet::KEY_SIZE {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    ch.server_key.copy_from_slice(&payload[..packet::KEY_SIZE]);

    let (temp_public, temp_secret) = crypto::keypair();
    ch.temp_public = temp_public;
    ch.temp_secret = temp_secret;

    logging::debug!(ch.log, "welcome received, sending hello");

    let tail = ch.next_nonce();
    let nonce = packet::short_term_nonce(packet::NONCE_CLIENT_HELLO, tail);
    let boxed = packet::seal(
        &[0u8; packet::HELLO_PLAIN_SIZE],
        &nonce,
        &ch.server_key,
        &ch.temp_secret,
    )?;

    let mut hello = Vec::with_capacity(packet::KEY_SIZE + packet::NONCE_TAIL_SIZE + boxed.len());
    hello.extend_from_slice(&ch.temp_public);

    let mut tail_bytes = [0u8; packet::NONCE_TAIL_SIZE];
    BigEndian::write_u64(&mut tail_bytes, tail);
    hello.extend_from_slice(&tail_bytes);
    hello.extend_from_slice(&boxed);

    ch.enqueue_frame(packet::frame(Command::Helo, &hello));
    ch.phase = Phase::Cookie;

    Ok(())
}

/// COOK delivers the server short-term key and the cookie under the long-term keys.
/// Precompute the session key and vouch for our identity.
fn on_cookie(ch: &mut Channel, payload: &[u8]) -> NetworkResult<()> {
    if payload.len() < packet::LONG_NONCE_TAIL_SIZE + packet::COOKIE_BOX_SIZE {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    let mut tail = [0u8; packet::LONG_NONCE_TAIL_SIZE];
    tail.copy_from_slice(&payload[..packet::LONG_NONCE_TAIL_SIZE]);

    let nonce = packet::long_term_nonce(packet::NONCE_COOKIE, &tail);
    let boxed = &payload[packet::LONG_NONCE_TAIL_SIZE..packet::LONG_NONCE_TAIL_SIZE + packet::COOKIE_BOX_SIZE];

    let plain = packet::open(boxed, &nonce, &ch.server_key, &ch.temp_secret)?;

    let mut server_temp = [0u8; packet::KEY_SIZE];
    server_temp.copy_from_slice(&plain[..packet::KEY_SIZE]);
    ch.cookie.copy_from_slice(&plain[packet::KEY_SIZE..]);

    if !crypto::beforenm(&mut ch.session_key, &server_temp, &ch.temp_secret) {
        return Err(NetworkError::fatal(ErrorKind::CryptoCore));
    }

    logging::debug!(ch.log, "cookie received, vouching");

    send_vouch(ch)?;
    ch.phase = Phase::Ready;

    Ok(())
}

/// VOCH echoes the cookie and carries, inside the session box, the client long-term key
/// and an inner box binding the short-term key to it. Grid connections append the
/// certificate record.
fn send_vouch(ch: &mut Channel) -> NetworkResult<()> {
    let mut halves = [0u8; packet::LONG_NONCE_TAIL_SIZE];
    crypto::random_bytes(&mut halves);

    let vouch_nonce = packet::long_term_nonce(packet::NONCE_VOUCH, &halves);

    let mut inner_plain = [0u8; packet::VOUCH_PLAIN_SIZE];
    inner_plain[..packet::KEY_SIZE].copy_from_slice(&ch.temp_public);

    let inner = packet::seal(&inner_plain, &vouch_nonce, &ch.server_key, &ch.keys.secret)?;

    let mut outer_plain = Vec::with_capacity(
        packet::KEY_SIZE + packet::LONG_NONCE_TAIL_SIZE + inner.len() + packet::CERTIFICATE_RECORD_SIZE,
    );
    outer_plain.extend_from_slice(&*ch.keys.public);
    outer_plain.extend_from_slice(&halves);
    outer_plain.extend_from_slice(&inner);

    if ch.mode == Mode::Grid {
        packet::write_certificate_record(&mut outer_plain);
    }

    let tail = ch.next_nonce();
    let outer_nonce = packet::short_term_nonce(packet::NONCE_CLIENT_INITIATE, tail);
    let outer = packet::seal_session(&outer_plain, &outer_nonce, &ch.session_key)?;

    let mut vouch = Vec::with_capacity(packet::COOKIE_SIZE + packet::NONCE_TAIL_SIZE + outer.len());
    vouch.extend_from_slice(&ch.cookie);

    let mut tail_bytes = [0u8; packet::NONCE_TAIL_SIZE];
    BigEndian::write_u64(&mut tail_bytes, tail);
    vouch.extend_from_slice(&tail_bytes);
    vouch.extend_from_slice(&outer);

    ch.enqueue_frame(packet::frame(Command::Voch, &vouch));

    Ok(())
}

/// REDY completes the handshake. Peer tunnels are established on the spot; grid
/// connections still negotiate the protocol version inside MESG.
fn on_ready(ch: &mut Channel, payload: &[u8]) -> NetworkResult<()> {
    let (tail, boxed) = packet::split_boxed_tail(payload)?;
    let nonce = packet::short_term_nonce(packet::NONCE_SERVER_READY, tail);
    let plain = packet::open_session(boxed, &nonce, &ch.session_key)?;

    match ch.mode {
        Mode::Peer => {
            logging::debug!(ch.log, "tunnel ready");

            ch.phase = Phase::Data;
            ch.set_status(Status::Connected);
        }
        _ => {
            // The body carries grid bookkeeping we have no use for.
            logging::debug!(ch.log, "server ready, negotiating version"; "body_len" => plain.len());

            let envelope = proto::envelope(proto::MSG_PROTOCOL_VERSION, &ProtocolVersion::current());
            ch.send_mesg(&envelope)?;
            ch.phase = Phase::Version;
        }
    }

    Ok(())
}

/// The grid answers the version handshake with its own `ProtocolVersion`; anything but
/// an exact match is fatal.
fn on_version(ch: &mut Channel, payload: &[u8]) -> NetworkResult<()> {
    let plain = open_server_mesg(ch, payload)?;
    let (msg_type, body) = proto::open_envelope(&plain)?;

    if msg_type != proto::MSG_PROTOCOL_VERSION {
        logging::warn!(ch.log, "expected version message"; "msg_type" => msg_type);
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    let version: ProtocolVersion = proto::decode(body)?;
    let expected = ProtocolVersion::current();

    if version.magic != expected.magic || version.major != expected.major || version.minor != expected.minor {
        logging::warn!(ch.log, "protocol version mismatch";
                       "magic" => version.magic,
                       "major" => version.major,
                       "minor" => version.minor);
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    logging::debug!(ch.log, "protocol negotiated"; "major" => version.major, "minor" => version.minor);

    ch.phase = Phase::Data;
    ch.set_status(Status::Connected);

    Ok(())
}

/// Established-state MESG traffic. Peer tunnels hand the raw payload up; grid
/// connections dispatch control messages and ignore types they do not know.
fn on_message(ch: &mut Channel, payload: &[u8]) -> NetworkResult<()> {
    let plain = open_server_mesg(ch, payload)?;

    match ch.mode {
        Mode::Peer => {
            ch.deliver(&plain);
            Ok(())
        }
        _ => {
            let (msg_type, body) = proto::open_envelope(&plain)?;

            match msg_type {
                proto::MSG_PEER_REPLY => {
                    let reply: PeerReply = proto::decode(body)?;
                    ch.dispatch_peer_reply(reply);
                }
                other => {
                    logging::debug!(ch.log, "ignoring unknown message"; "msg_type" => other);
                }
            }

            Ok(())
        }
    }
}

fn open_server_mesg(ch: &mut Channel, payload: &[u8]) -> NetworkResult<Vec<u8>> {
    let (tail, boxed) = packet::split_boxed_tail(payload)?;
    let nonce = packet::short_term_nonce(packet::NONCE_SERVER_MESSAGE, tail);

    packet::open_session(boxed, &nonce, &ch.session_key)
}
