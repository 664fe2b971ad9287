//! Scripted server side of the handshake for tests, built straight on the crypto
//! primitives. Works on length-stripped frames; socket-level tests add the length
//! prefix themselves.

use crate::net::packet::{self, Command};
use byteorder::{BigEndian, ByteOrder};
use helix::crypto;
use helix::keys::{KeyPair, SecretKey};

pub const CLIENT_SECRET: [u8; 32] = [0x01; 32];
pub const SERVER_SECRET: [u8; 32] = [0x02; 32];
pub const SERVER_TEMP_SECRET: [u8; 32] = [0x03; 32];
pub const COOKIE: [u8; 96] = [0x04; 96];
pub const COOKIE_TAIL: [u8; 16] = [0x07; 16];
pub const TUNNEL_ID: [u8; 32] = [0xaa; 32];

pub fn client_keys() -> KeyPair {
    KeyPair::from_secret(SecretKey::new(CLIENT_SECRET))
}

pub fn client_long_public() -> [u8; 32] {
    crypto::scalarmult_base(&CLIENT_SECRET)
}

/// Frames a packet and strips the length prefix, matching what the reader hands to the
/// engine.
pub fn stripped(command: Command, payload: &[u8]) -> Vec<u8> {
    packet::frame(command, payload)[packet::LEN_PREFIX..].to_vec()
}

pub fn tail_bytes(tail: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; 8];
    BigEndian::write_u64(&mut bytes, tail);
    bytes
}

pub struct Server {
    pub public: [u8; 32],
    pub secret: [u8; 32],
    pub temp_public: [u8; 32],
    pub temp_secret: [u8; 32],
    pub session: [u8; 32],
    pub nonce: u64,
    pub client_temp: [u8; 32],
}

impl Server {
    pub fn new() -> Server {
        Server {
            public: crypto::scalarmult_base(&SERVER_SECRET),
            secret: SERVER_SECRET,
            temp_public: crypto::scalarmult_base(&SERVER_TEMP_SECRET),
            temp_secret: SERVER_TEMP_SECRET,
            session: [0u8; 32],
            nonce: 0,
            client_temp: [0u8; 32],
        }
    }

    pub fn next_nonce(&mut self) -> u64 {
        self.nonce += 1;
        self.nonce
    }

    pub fn welc(&self) -> Vec<u8> {
        stripped(Command::Welc, &self.public)
    }

    /// Validates the HELO packet and captures the client short-term key.
    pub fn absorb_hello(&mut self, frame: &[u8], expected_tail: u64) {
        let packet = packet::parse(frame).unwrap();
        assert_eq!(packet.command, Command::Helo);

        self.client_temp.copy_from_slice(&packet.payload[..32]);

        let tail = BigEndian::read_u64(&packet.payload[32..40]);
        assert_eq!(tail, expected_tail);

        let boxed = &packet.payload[40..];
        assert_eq!(boxed.len(), packet::HELLO_BOX_SIZE);

        let nonce = packet::short_term_nonce(packet::NONCE_CLIENT_HELLO, tail);
        let plain = packet::open(boxed, &nonce, &self.client_temp, &self.secret).unwrap();
        assert_eq!(plain, vec![0u8; packet::HELLO_PLAIN_SIZE]);

        crypto::beforenm(&mut self.session, &self.client_temp, &self.temp_secret);
    }

    pub fn cook(&self) -> Vec<u8> {
        let mut plain = Vec::with_capacity(32 + 96);
        plain.extend_from_slice(&self.temp_public);
        plain.extend_from_slice(&COOKIE);

        let nonce = packet::long_term_nonce(packet::NONCE_COOKIE, &COOKIE_TAIL);
        let boxed = packet::seal(&plain, &nonce, &self.client_temp, &self.secret).unwrap();

        let mut payload = Vec::with_capacity(16 + boxed.len());
        payload.extend_from_slice(&COOKIE_TAIL);
        payload.extend_from_slice(&boxed);

        stripped(Command::Cook, &payload)
    }

    /// Validates the VOCH packet: cookie echo, outer box, inner identity box and (for
    /// grid connections) the certificate record.
    pub fn absorb_vouch(&mut self, frame: &[u8], expected_tail: u64, client_long: &[u8; 32], certificate: bool) {
        let packet = packet::parse(frame).unwrap();
        assert_eq!(packet.command, Command::Voch);

        assert_eq!(&packet.payload[..96], &COOKIE[..]);

        let tail = BigEndian::read_u64(&packet.payload[96..104]);
        assert_eq!(tail, expected_tail);

        let nonce = packet::short_term_nonce(packet::NONCE_CLIENT_INITIATE, tail);
        let outer = packet::open_session(&packet.payload[104..], &nonce, &self.session).unwrap();

        let expected_len = match certificate {
            true => 128 + packet::CERTIFICATE_RECORD_SIZE,
            false => 128,
        };
        assert_eq!(outer.len(), expected_len);

        assert_eq!(&outer[..32], &client_long[..]);

        let mut halves = [0u8; 16];
        halves.copy_from_slice(&outer[32..48]);

        let inner_nonce = packet::long_term_nonce(packet::NONCE_VOUCH, &halves);
        let inner = packet::open(&outer[48..128], &inner_nonce, client_long, &self.secret).unwrap();

        assert_eq!(&inner[..32], &self.client_temp[..]);
        assert_eq!(&inner[32..], &[0u8; 32][..]);

        if certificate {
            let record = &outer[128..];
            assert_eq!(record[0] as usize, packet::CERTIFICATE_PREFIX.len());
            assert_eq!(&record[1..12], &packet::CERTIFICATE_PREFIX[..]);
            assert_eq!(record[12] as usize, packet::CERTIFICATE_VALUE_SIZE);
            assert_eq!(&record[13..], &[0u8; 32][..]);
        }
    }

    pub fn redy(&mut self) -> Vec<u8> {
        let tail = self.next_nonce();
        let nonce = packet::short_term_nonce(packet::NONCE_SERVER_READY, tail);
        let boxed = packet::seal_session(b"ready", &nonce, &self.session).unwrap();

        let mut payload = tail_bytes(tail);
        payload.extend_from_slice(&boxed);

        stripped(Command::Redy, &payload)
    }

    pub fn mesg(&mut self, plain: &[u8]) -> Vec<u8> {
        let tail = self.next_nonce();
        let nonce = packet::short_term_nonce(packet::NONCE_SERVER_MESSAGE, tail);
        let boxed = packet::seal_session(plain, &nonce, &self.session).unwrap();

        let mut payload = tail_bytes(tail);
        payload.extend_from_slice(&boxed);

        stripped(Command::Mesg, &payload)
    }

    pub fn open_client_mesg(&self, frame: &[u8], expected_tail: u64) -> Vec<u8> {
        let packet = packet::parse(frame).unwrap();
        assert_eq!(packet.command, Command::Mesg);

        let (tail, boxed) = packet::split_boxed_tail(packet.payload).unwrap();
        assert_eq!(tail, expected_tail);

        let nonce = packet::short_term_nonce(packet::NONCE_CLIENT_MESSAGE, tail);
        packet::open_session(boxed, &nonce, &self.session).unwrap()
    }
}
