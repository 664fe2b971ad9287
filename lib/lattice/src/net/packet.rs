//! Wire framing and the encrypted payload layouts of the handshake protocol.
//!
//! Every packet on an established transport is `length (u16 BE, excluding itself) |
//! magic (u16 BE) | command tag (4 bytes) | payload`. The unencrypted forwarding
//! exchange on a fresh peer tunnel uses bare `length | data` frames instead; the two are
//! told apart by connection state, never by sniffing.

use crate::net::support::{ErrorKind, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use helix::crypto;

/// Leading frame length field, not part of the declared size.
pub const LEN_PREFIX: usize = 2;
/// Magic plus command tag, covered by the declared size.
pub const HEADER_SIZE: usize = 6;

pub const PACKET_MAGIC: u16 = 0xf09d;

pub const KEY_SIZE: usize = crypto::PUBLIC_KEY_SIZE;
pub const COOKIE_SIZE: usize = 96;

/// HELO carries a box of 64 zero bytes proving possession of the short-term key.
pub const HELLO_PLAIN_SIZE: usize = 64;
pub const HELLO_BOX_SIZE: usize = HELLO_PLAIN_SIZE + crypto::MAC_SIZE;
/// COOK carries the server short-term key and the cookie under the long-term keys.
pub const COOKIE_BOX_SIZE: usize = KEY_SIZE + COOKIE_SIZE + crypto::MAC_SIZE;
/// The vouch box wraps the client short-term key, zero padded to 64 bytes.
pub const VOUCH_PLAIN_SIZE: usize = 64;
pub const VOUCH_BOX_SIZE: usize = VOUCH_PLAIN_SIZE + crypto::MAC_SIZE;

pub const NONCE_TAIL_SIZE: usize = 8;
pub const LONG_NONCE_TAIL_SIZE: usize = 16;

pub const NONCE_CLIENT_HELLO: &[u8; 16] = b"CurveCP-client-H";
pub const NONCE_CLIENT_INITIATE: &[u8; 16] = b"CurveCP-client-I";
pub const NONCE_CLIENT_MESSAGE: &[u8; 16] = b"CurveCP-client-M";
pub const NONCE_SERVER_MESSAGE: &[u8; 16] = b"CurveCP-server-M";
pub const NONCE_SERVER_READY: &[u8; 16] = b"CurveCP-server-R";
pub const NONCE_COOKIE: &[u8; 8] = b"CurveCPK";
pub const NONCE_VOUCH: &[u8; 8] = b"CurveCPV";

/// Grid connections append this key-value record to the vouch payload.
pub const CERTIFICATE_PREFIX: &[u8; 11] = b"certificate";
pub const CERTIFICATE_VALUE_SIZE: usize = 32;
pub const CERTIFICATE_RECORD_SIZE: usize = 2 + CERTIFICATE_PREFIX.len() + CERTIFICATE_VALUE_SIZE;

/// Command tags of the framed handshake packets.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Tell,
    Welc,
    Helo,
    Cook,
    Voch,
    Redy,
    Mesg,
}

impl Command {
    #[inline]
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            Command::Tell => b"TELL",
            Command::Welc => b"WELC",
            Command::Helo => b"HELO",
            Command::Cook => b"COOK",
            Command::Voch => b"VOCH",
            Command::Redy => b"REDY",
            Command::Mesg => b"MESG",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Command> {
        match tag {
            b"TELL" => Some(Command::Tell),
            b"WELC" => Some(Command::Welc),
            b"HELO" => Some(Command::Helo),
            b"COOK" => Some(Command::Cook),
            b"VOCH" => Some(Command::Voch),
            b"REDY" => Some(Command::Redy),
            b"MESG" => Some(Command::Mesg),
            _ => None,
        }
    }
}

/// Parsed view of a framed packet, past the length prefix.
#[derive(Debug)]
pub struct Packet<'a> {
    pub command: Command,
    pub payload: &'a [u8],
}

/// Frame a command packet for the wire.
pub fn frame(command: Command, payload: &[u8]) -> Vec<u8> {
    let size = HEADER_SIZE + payload.len();
    let mut out = Vec::with_capacity(LEN_PREFIX + size);

    out.write_u16::<BigEndian>(size as u16).expect("Error writing frame size");
    out.write_u16::<BigEndian>(PACKET_MAGIC).expect("Error writing frame magic");
    out.extend_from_slice(command.tag());
    out.extend_from_slice(payload);

    out
}

/// Parse a length-stripped frame into its command and payload.
pub fn parse(packet: &[u8]) -> NetworkResult<Packet> {
    if packet.len() < HEADER_SIZE {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    if BigEndian::read_u16(&packet[..2]) != PACKET_MAGIC {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    let command = Command::from_tag(&packet[2..6]).ok_or_else(|| NetworkError::fatal(ErrorKind::Protocol))?;

    Ok(Packet {
        command,
        payload: &packet[HEADER_SIZE..],
    })
}

/// Short-term nonce: 16-byte direction/type prefix followed by the big-endian counter.
#[inline]
pub fn short_term_nonce(prefix: &[u8; 16], counter: u64) -> [u8; crypto::NONCE_SIZE] {
    let mut nonce = [0u8; crypto::NONCE_SIZE];

    nonce[..16].copy_from_slice(prefix);
    BigEndian::write_u64(&mut nonce[16..], counter);

    nonce
}

/// Long-term nonce: 8-byte prefix followed by 16 explicit bytes (random for the vouch,
/// echoed from the server for the cookie).
#[inline]
pub fn long_term_nonce(prefix: &[u8; 8], tail: &[u8; 16]) -> [u8; crypto::NONCE_SIZE] {
    let mut nonce = [0u8; crypto::NONCE_SIZE];

    nonce[..8].copy_from_slice(prefix);
    nonce[8..].copy_from_slice(tail);

    nonce
}

/// Seals a plaintext under the long-term key pair, returning the wire form of the box
/// (MAC followed by the encrypted data).
pub fn seal(
    plain: &[u8],
    nonce: &[u8; crypto::NONCE_SIZE],
    public: &[u8; KEY_SIZE],
    secret: &[u8; KEY_SIZE],
) -> NetworkResult<Vec<u8>> {
    let (mut padded, mut cipher) = padded_buffers(plain);

    if !crypto::seal(&mut cipher, &padded, nonce, public, secret) {
        return Err(NetworkError::fatal(ErrorKind::Encryption));
    }

    crypto::memzero(&mut padded);
    Ok(strip_box_pad(cipher))
}

/// Opens a wire-form box under the long-term key pair.
pub fn open(
    boxed: &[u8],
    nonce: &[u8; crypto::NONCE_SIZE],
    public: &[u8; KEY_SIZE],
    secret: &[u8; KEY_SIZE],
) -> NetworkResult<Vec<u8>> {
    let (cipher, mut plain) = padded_cipher(boxed)?;

    if !crypto::open(&mut plain, &cipher, nonce, public, secret) {
        return Err(NetworkError::fatal(ErrorKind::Decryption));
    }

    Ok(strip_plain_pad(plain))
}

/// Seals a plaintext with the precomputed session key.
pub fn seal_session(
    plain: &[u8],
    nonce: &[u8; crypto::NONCE_SIZE],
    session: &[u8; crypto::SESSION_KEY_SIZE],
) -> NetworkResult<Vec<u8>> {
    let (mut padded, mut cipher) = padded_buffers(plain);

    if !crypto::seal_afternm(&mut cipher, &padded, nonce, session) {
        return Err(NetworkError::fatal(ErrorKind::Encryption));
    }

    crypto::memzero(&mut padded);
    Ok(strip_box_pad(cipher))
}

/// Opens a wire-form box with the precomputed session key.
pub fn open_session(
    boxed: &[u8],
    nonce: &[u8; crypto::NONCE_SIZE],
    session: &[u8; crypto::SESSION_KEY_SIZE],
) -> NetworkResult<Vec<u8>> {
    let (cipher, mut plain) = padded_cipher(boxed)?;

    if !crypto::open_afternm(&mut plain, &cipher, nonce, session) {
        return Err(NetworkError::fatal(ErrorKind::Decryption));
    }

    Ok(strip_plain_pad(plain))
}

/// Splits a MESG-like payload into the nonce counter tail and the box.
pub fn split_boxed_tail(payload: &[u8]) -> NetworkResult<(u64, &[u8])> {
    if payload.len() < NONCE_TAIL_SIZE + crypto::MAC_SIZE {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    Ok((
        BigEndian::read_u64(&payload[..NONCE_TAIL_SIZE]),
        &payload[NONCE_TAIL_SIZE..],
    ))
}

/// Rebuilds the zero-padded NaCl buffer pair around a plaintext.
#[inline]
fn padded_buffers(plain: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut padded = vec![0u8; crypto::PLAIN_PAD + plain.len()];
    padded[crypto::PLAIN_PAD..].copy_from_slice(plain);

    let cipher = vec![0u8; padded.len()];

    (padded, cipher)
}

/// Rebuilds the zero-padded NaCl buffer pair around a wire-form box.
#[inline]
fn padded_cipher(boxed: &[u8]) -> NetworkResult<(Vec<u8>, Vec<u8>)> {
    if boxed.len() < crypto::MAC_SIZE {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    let mut cipher = vec![0u8; crypto::BOX_PAD + boxed.len()];
    cipher[crypto::BOX_PAD..].copy_from_slice(boxed);

    let plain = vec![0u8; cipher.len()];

    Ok((cipher, plain))
}

#[inline]
fn strip_box_pad(mut cipher: Vec<u8>) -> Vec<u8> {
    cipher.drain(..crypto::BOX_PAD);
    cipher
}

#[inline]
fn strip_plain_pad(mut plain: Vec<u8>) -> Vec<u8> {
    plain.drain(..crypto::PLAIN_PAD);
    plain
}

/// Appends the certificate key-value record carried in grid-mode vouch payloads.
pub fn write_certificate_record(out: &mut Vec<u8>) {
    out.push(CERTIFICATE_PREFIX.len() as u8);
    out.extend_from_slice(CERTIFICATE_PREFIX);
    out.push(CERTIFICATE_VALUE_SIZE as u8);
    out.extend_from_slice(&[0u8; CERTIFICATE_VALUE_SIZE]);
}
