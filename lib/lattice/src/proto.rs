//! Control-protocol messages exchanged with the grid. Encrypted MESG packets carry an
//! envelope of `size (u16 BE) | message type (u8) | protobuf body`; the unencrypted
//! forwarding exchange on peer tunnels uses the same envelope shape directly on the wire.

use crate::net::support::{ErrorKind, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use prost::Message;

pub const MSG_PROTOCOL_VERSION: u8 = 0x01;
pub const MSG_CALL_REMOTE: u8 = 0x02;
pub const MSG_PEER_REPLY: u8 = 0x03;
pub const MSG_FORWARD_HOLD: u8 = 0x0f;
pub const MSG_FORWARD_REMOTE: u8 = 0x10;
pub const MSG_FORWARD_REPLY: u8 = 0x11;
pub const MSG_FORWARD_ERROR: u8 = 0x12;

pub const PROTO_MAGIC: u32 = 0xf09d;
pub const PROTO_MAJOR: u32 = 1;
pub const PROTO_MINOR: u32 = 0;

/// Static signature the forwarding server presents before the tunnel switches over to the
/// cryptographic handshake.
pub const FORWARD_SIGNATURE: &[u8] = b"MDG-SIG-PLACEHOLDER";

pub const FORWARD_SERVER_ERROR: u32 = 1;
pub const FORWARD_PEER_TIMEOUT: u32 = 2;

/// Version negotiation message, sent by both sides right after the grid handshake.
#[derive(Clone, PartialEq, Message)]
pub struct ProtocolVersion {
    #[prost(uint32, tag = "1")]
    pub magic: u32,
    #[prost(uint32, tag = "2")]
    pub major: u32,
    #[prost(uint32, tag = "3")]
    pub minor: u32,
}

impl ProtocolVersion {
    /// The version this library speaks.
    #[inline]
    pub fn current() -> ProtocolVersion {
        ProtocolVersion {
            magic: PROTO_MAGIC,
            major: PROTO_MAJOR,
            minor: PROTO_MINOR,
        }
    }
}

/// Request to open a forwarded tunnel towards a remote device.
#[derive(Clone, PartialEq, Message)]
pub struct CallRemote {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub peer_id: String,
}

/// Grid answer to a `CallRemote`, dispatched to the requesting peer slot by id.
#[derive(Clone, PartialEq, Message)]
pub struct PeerReply {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub result: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub tunnel_id: Vec<u8>,
    #[prost(string, tag = "4")]
    pub host: String,
    #[prost(uint32, tag = "5")]
    pub port: u32,
}

/// First message on a forwarded tunnel, presenting the tunnel id to the relay.
#[derive(Clone, PartialEq, Message)]
pub struct ForwardRemote {
    #[prost(bytes = "vec", tag = "1")]
    pub tunnel_id: Vec<u8>,
}

/// Relay acknowledgement carrying the static signature.
#[derive(Clone, PartialEq, Message)]
pub struct ForwardReply {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
}

/// Relay failure notice.
#[derive(Clone, PartialEq, Message)]
pub struct ForwardError {
    #[prost(uint32, tag = "1")]
    pub code: u32,
}

/// Serializes a message into the control envelope. The leading size covers the type byte
/// and the protobuf body.
pub fn envelope<M: Message>(msg_type: u8, message: &M) -> Vec<u8> {
    let body = message.encode_to_vec();
    let mut out = Vec::with_capacity(3 + body.len());

    out.write_u16::<BigEndian>((1 + body.len()) as u16)
        .expect("Error writing envelope size");
    out.push(msg_type);
    out.extend_from_slice(&body);

    out
}

/// Splits a control envelope into the message type and the protobuf body.
pub fn open_envelope(data: &[u8]) -> NetworkResult<(u8, &[u8])> {
    if data.len() < 3 {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    let size = BigEndian::read_u16(&data[..2]) as usize;

    if size == 0 || 2 + size > data.len() {
        return Err(NetworkError::fatal(ErrorKind::Protocol));
    }

    Ok((data[2], &data[3..2 + size]))
}

/// Decodes a protobuf body, folding malformed input into a protocol error.
#[inline]
pub fn decode<M: Message + Default>(body: &[u8]) -> NetworkResult<M> {
    M::decode(body).map_err(|_| NetworkError::fatal(ErrorKind::Protocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let version = ProtocolVersion::current();
        let wire = envelope(MSG_PROTOCOL_VERSION, &version);

        let (msg_type, body) = open_envelope(&wire).unwrap();
        assert_eq!(msg_type, MSG_PROTOCOL_VERSION);

        let decoded: ProtocolVersion = decode(body).unwrap();
        assert_eq!(decoded, version);
    }

    #[test]
    fn test_envelope_size_covers_type_and_body() {
        let wire = envelope(MSG_FORWARD_HOLD, &ForwardError { code: 0 });

        assert_eq!(wire[0], 0);
        assert_eq!(wire[1] as usize, wire.len() - 2);
    }

    #[test]
    fn test_open_envelope_rejects_truncation() {
        let mut wire = envelope(
            MSG_PEER_REPLY,
            &PeerReply {
                id: 7,
                result: 0,
                tunnel_id: vec![0xaa; 16],
                host: "relay.example".into(),
                port: 443,
            },
        );

        wire.truncate(wire.len() - 1);

        assert_eq!(
            open_envelope(&wire).unwrap_err(),
            NetworkError::fatal(ErrorKind::Protocol)
        );
    }

    #[test]
    fn test_peer_reply_roundtrip() {
        let reply = PeerReply {
            id: 42,
            result: 0,
            tunnel_id: vec![0xaa; 32],
            host: "relay-03.grid.example".into(),
            port: 443,
        };

        let decoded: PeerReply = decode(&reply.encode_to_vec()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // Field 1 with wire type 7 does not exist in protobuf.
        let result: NetworkResult<ForwardReply> = decode(&[0x0f, 0x01]);
        assert!(result.is_err());
    }
}
