//! Peer-to-peer packet taxonomy and its wire encoding.
//!
//! A packet is carried inside a length-prefixed frame (framing is the
//! transport layer's business). The payload is a 1-byte packet type tag
//! followed by two CBOR items: the header, then the body for packet types
//! that have one. Bodyless types (`SessionAck`, `Ping`, `GetOrders`,
//! `GetNodes`) encode nothing after the header.

use std::fmt;
use std::io;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::address::NodeAddress;
use crate::node_state::NodeState;
use crate::pubkey::PubKey;

/// Wire-level packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Hello = 1,
    SessionAck = 2,
    Ping = 3,
    Pong = 4,
    Disconnecting = 5,
    Order = 6,
    OrderInvalidation = 7,
    GetOrders = 8,
    Orders = 9,
    GetNodes = 10,
    Nodes = 11,
    NodeStateUpdate = 12,
    SanitySwapInit = 13,
    SwapRequest = 14,
    SwapAccepted = 15,
    SwapFailed = 16,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Hello,
            2 => Self::SessionAck,
            3 => Self::Ping,
            4 => Self::Pong,
            5 => Self::Disconnecting,
            6 => Self::Order,
            7 => Self::OrderInvalidation,
            8 => Self::GetOrders,
            9 => Self::Orders,
            10 => Self::GetNodes,
            11 => Self::Nodes,
            12 => Self::NodeStateUpdate,
            13 => Self::SanitySwapInit,
            14 => Self::SwapRequest,
            15 => Self::SwapAccepted,
            16 => Self::SwapFailed,
            _ => return None,
        })
    }
}

/// Reason codes sent in a `Disconnecting` packet immediately before the
/// socket closes. Wire-stable; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectionReason {
    Shutdown = 1,
    IncompatibleProtocolVersion = 2,
    MalformedVersion = 3,
    Banned = 4,
    AlreadyConnected = 5,
    ConnectedToSelf = 6,
    NotAcceptingConnections = 7,
    ResponseStalling = 8,
    WireProtocolErr = 9,
}

impl DisconnectionReason {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Shutdown,
            2 => Self::IncompatibleProtocolVersion,
            3 => Self::MalformedVersion,
            4 => Self::Banned,
            5 => Self::AlreadyConnected,
            6 => Self::ConnectedToSelf,
            7 => Self::NotAcceptingConnections,
            8 => Self::ResponseStalling,
            9 => Self::WireProtocolErr,
            _ => return None,
        })
    }
}

impl fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutting down"),
            Self::IncompatibleProtocolVersion => write!(f, "incompatible protocol version"),
            Self::MalformedVersion => write!(f, "malformed version"),
            Self::Banned => write!(f, "banned"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::ConnectedToSelf => write!(f, "connected to self"),
            Self::NotAcceptingConnections => write!(f, "not accepting connections"),
            Self::ResponseStalling => write!(f, "response stalling"),
            Self::WireProtocolErr => write!(f, "wire protocol error"),
        }
    }
}

impl Serialize for DisconnectionReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for DisconnectionReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_u8(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown disconnection reason {code}")))
    }
}

/// Every packet carries a fresh id; responses echo the request's id in
/// `req_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub id: Uuid,
    pub req_id: Option<Uuid>,
}

impl PacketHeader {
    pub fn request() -> Self {
        Self {
            id: Uuid::new_v4(),
            req_id: None,
        }
    }

    pub fn response_to(req_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            req_id: Some(req_id),
        }
    }
}

/// The session handshake payload. The only packet whose layout must be
/// bit-exact across implementations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Sender's semver release, e.g. `"1.2.0"`.
    pub version: String,
    pub pub_key: PubKey,
    /// Fresh 32-byte session nonce.
    #[serde(with = "serde_bytes_vec")]
    pub nonce: Vec<u8>,
    /// Signature by `pub_key` over the nonce.
    #[serde(with = "serde_bytes_vec")]
    pub signature: Vec<u8>,
    pub node_state: NodeState,
}

/// An order advertised to the network. Opaque to the pool apart from the
/// pair it trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub pair_id: String,
    pub price: f64,
    pub quantity: u64,
    pub is_buy: bool,
}

/// A portion of an order being invalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPortion {
    pub id: Uuid,
    pub pair_id: String,
    pub quantity: u64,
}

/// One gossiped node: identity plus the addresses it listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub pub_key: PubKey,
    pub addresses: Vec<NodeAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitySwapInit {
    pub currency: String,
    pub r_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub proposed_quantity: u64,
    pub pair_id: String,
    pub order_id: Uuid,
    pub r_hash: String,
    pub taker_cltv_delta: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapAccepted {
    pub r_hash: String,
    pub quantity: u64,
    pub maker_cltv_delta: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapFailed {
    pub r_hash: String,
    pub failure_reason: u32,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disconnecting {
    pub reason: DisconnectionReason,
    pub payload: Option<String>,
}

/// Packet bodies, one variant per wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Hello(Hello),
    SessionAck,
    Ping,
    Pong,
    Disconnecting(Disconnecting),
    Order(Order),
    OrderInvalidation(OrderPortion),
    GetOrders,
    Orders(Vec<Order>),
    GetNodes,
    Nodes(Vec<NodeEntry>),
    NodeStateUpdate(NodeState),
    SanitySwapInit(SanitySwapInit),
    SwapRequest(SwapRequest),
    SwapAccepted(SwapAccepted),
    SwapFailed(SwapFailed),
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Hello(_) => PacketType::Hello,
            Self::SessionAck => PacketType::SessionAck,
            Self::Ping => PacketType::Ping,
            Self::Pong => PacketType::Pong,
            Self::Disconnecting(_) => PacketType::Disconnecting,
            Self::Order(_) => PacketType::Order,
            Self::OrderInvalidation(_) => PacketType::OrderInvalidation,
            Self::GetOrders => PacketType::GetOrders,
            Self::Orders(_) => PacketType::Orders,
            Self::GetNodes => PacketType::GetNodes,
            Self::Nodes(_) => PacketType::Nodes,
            Self::NodeStateUpdate(_) => PacketType::NodeStateUpdate,
            Self::SanitySwapInit(_) => PacketType::SanitySwapInit,
            Self::SwapRequest(_) => PacketType::SwapRequest,
            Self::SwapAccepted(_) => PacketType::SwapAccepted,
            Self::SwapFailed(_) => PacketType::SwapFailed,
        }
    }
}

/// A framed unit of peer traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(body: PacketBody) -> Self {
        Self {
            header: PacketHeader::request(),
            body,
        }
    }

    pub fn response(body: PacketBody, req_id: Uuid) -> Self {
        Self {
            header: PacketHeader::response_to(req_id),
            body,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    /// Encode the packet payload (type tag, header, body). The transport
    /// adds the length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        fn put<T: Serialize>(value: &T, buf: &mut Vec<u8>) {
            ciborium::ser::into_writer(value, buf).expect("in-memory writers don't error");
        }

        let mut buf = vec![self.packet_type() as u8];
        put(&self.header, &mut buf);

        match &self.body {
            PacketBody::Hello(b) => put(b, &mut buf),
            PacketBody::Disconnecting(b) => put(b, &mut buf),
            PacketBody::Order(b) => put(b, &mut buf),
            PacketBody::OrderInvalidation(b) => put(b, &mut buf),
            PacketBody::Orders(b) => put(b, &mut buf),
            PacketBody::Nodes(b) => put(b, &mut buf),
            PacketBody::NodeStateUpdate(b) => put(b, &mut buf),
            PacketBody::SanitySwapInit(b) => put(b, &mut buf),
            PacketBody::SwapRequest(b) => put(b, &mut buf),
            PacketBody::SwapAccepted(b) => put(b, &mut buf),
            PacketBody::SwapFailed(b) => put(b, &mut buf),
            PacketBody::SessionAck
            | PacketBody::Ping
            | PacketBody::Pong
            | PacketBody::GetOrders
            | PacketBody::GetNodes => {}
        }
        buf
    }

    /// Decode a packet payload produced by [`Packet::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, rest) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let ty = PacketType::from_u8(tag).ok_or(DecodeError::UnknownType(tag))?;

        let mut reader = rest;
        let header: PacketHeader = read(&mut reader)?;

        let body = match ty {
            PacketType::Hello => PacketBody::Hello(read(&mut reader)?),
            PacketType::SessionAck => PacketBody::SessionAck,
            PacketType::Ping => PacketBody::Ping,
            PacketType::Pong => PacketBody::Pong,
            PacketType::Disconnecting => PacketBody::Disconnecting(read(&mut reader)?),
            PacketType::Order => PacketBody::Order(read(&mut reader)?),
            PacketType::OrderInvalidation => PacketBody::OrderInvalidation(read(&mut reader)?),
            PacketType::GetOrders => PacketBody::GetOrders,
            PacketType::Orders => PacketBody::Orders(read(&mut reader)?),
            PacketType::GetNodes => PacketBody::GetNodes,
            PacketType::Nodes => PacketBody::Nodes(read(&mut reader)?),
            PacketType::NodeStateUpdate => PacketBody::NodeStateUpdate(read(&mut reader)?),
            PacketType::SanitySwapInit => PacketBody::SanitySwapInit(read(&mut reader)?),
            PacketType::SwapRequest => PacketBody::SwapRequest(read(&mut reader)?),
            PacketType::SwapAccepted => PacketBody::SwapAccepted(read(&mut reader)?),
            PacketType::SwapFailed => PacketBody::SwapFailed(read(&mut reader)?),
        };

        Ok(Packet { header, body })
    }
}

fn read<T: serde::de::DeserializeOwned>(reader: &mut &[u8]) -> Result<T, DecodeError> {
    ciborium::de::from_reader(reader).map_err(|e| DecodeError::Cbor(e.to_string()))
}

/// An error decoding a packet payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty packet payload")]
    Empty,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("malformed packet: {0}")]
    Cbor(String),
}

impl From<DecodeError> for io::Error {
    fn from(err: DecodeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Byte-string (rather than integer-sequence) serde for `Vec<u8>` fields.
mod serde_bytes_vec {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut bytes = Vec::new();
            while let Some(b) = seq.next_element::<u8>()? {
                bytes.push(b);
            }
            Ok(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_bytes(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    fn round_trip(packet: &Packet) {
        let bytes = packet.to_bytes();
        let decoded = Packet::from_bytes(&bytes).unwrap();

        assert_eq!(&decoded, packet);
    }

    fn sample_state() -> NodeState {
        NodeState {
            addresses: vec!["192.0.2.7:9735".parse().unwrap()],
            pairs: vec!["LTC/BTC".into()],
            ..NodeState::default()
        }
    }

    #[test]
    fn reference_vectors_round_trip() {
        let pk = PubKey::new([0xaa; 33]);
        let bodies = vec![
            PacketBody::Hello(Hello {
                version: "1.2.0".into(),
                pub_key: pk,
                nonce: vec![7; 32],
                signature: vec![9; 64],
                node_state: sample_state(),
            }),
            PacketBody::SessionAck,
            PacketBody::Ping,
            PacketBody::Pong,
            PacketBody::Disconnecting(Disconnecting {
                reason: DisconnectionReason::Shutdown,
                payload: Some("goodbye".into()),
            }),
            PacketBody::Order(Order {
                id: Uuid::new_v4(),
                pair_id: "LTC/BTC".into(),
                price: 0.0123,
                quantity: 50_000,
                is_buy: true,
            }),
            PacketBody::OrderInvalidation(OrderPortion {
                id: Uuid::new_v4(),
                pair_id: "LTC/BTC".into(),
                quantity: 10_000,
            }),
            PacketBody::GetOrders,
            PacketBody::Orders(vec![]),
            PacketBody::GetNodes,
            PacketBody::Nodes(vec![NodeEntry {
                pub_key: pk,
                addresses: vec!["192.0.2.7:9735".parse().unwrap()],
            }]),
            PacketBody::NodeStateUpdate(sample_state()),
            PacketBody::SanitySwapInit(SanitySwapInit {
                currency: "BTC".into(),
                r_hash: "ff".repeat(32),
            }),
            PacketBody::SwapRequest(SwapRequest {
                proposed_quantity: 1000,
                pair_id: "LTC/BTC".into(),
                order_id: Uuid::new_v4(),
                r_hash: "ab".repeat(32),
                taker_cltv_delta: 144,
            }),
            PacketBody::SwapAccepted(SwapAccepted {
                r_hash: "ab".repeat(32),
                quantity: 1000,
                maker_cltv_delta: 576,
            }),
            PacketBody::SwapFailed(SwapFailed {
                r_hash: "ab".repeat(32),
                failure_reason: 3,
                error_message: Some("no route".into()),
            }),
        ];

        for body in bodies {
            round_trip(&Packet::new(body));
        }
    }

    #[test]
    fn responses_carry_req_id() {
        let req = Packet::new(PacketBody::Ping);
        let resp = Packet::response(PacketBody::Pong, req.header.id);

        assert_eq!(resp.header.req_id, Some(req.header.id));
        round_trip(&resp);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = Packet::new(PacketBody::Ping).to_bytes();
        bytes[0] = 0xfe;

        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(DecodeError::UnknownType(0xfe))
        ));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let bytes = Packet::new(PacketBody::Nodes(vec![NodeEntry {
            pub_key: PubKey::new([1; 33]),
            addresses: vec![],
        }]))
        .to_bytes();

        assert!(Packet::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn disconnection_reason_codes_are_stable() {
        let codes = [
            (DisconnectionReason::Shutdown, 1),
            (DisconnectionReason::IncompatibleProtocolVersion, 2),
            (DisconnectionReason::MalformedVersion, 3),
            (DisconnectionReason::Banned, 4),
            (DisconnectionReason::AlreadyConnected, 5),
            (DisconnectionReason::ConnectedToSelf, 6),
            (DisconnectionReason::NotAcceptingConnections, 7),
            (DisconnectionReason::ResponseStalling, 8),
            (DisconnectionReason::WireProtocolErr, 9),
        ];
        for (reason, code) in codes {
            assert_eq!(reason as u8, code);
            assert_eq!(DisconnectionReason::from_u8(code), Some(reason));
        }
        assert_eq!(DisconnectionReason::from_u8(0), None);
        assert_eq!(DisconnectionReason::from_u8(10), None);
    }

    #[derive(Debug, Clone)]
    struct SmallBody(PacketBody);

    impl Arbitrary for SmallBody {
        fn arbitrary(g: &mut Gen) -> Self {
            let body = match u8::arbitrary(g) % 6 {
                0 => PacketBody::Ping,
                1 => PacketBody::Pong,
                2 => PacketBody::Order(Order {
                    id: Uuid::from_u128(u128::arbitrary(g)),
                    pair_id: String::arbitrary(g),
                    price: 0.5,
                    quantity: u64::arbitrary(g),
                    is_buy: bool::arbitrary(g),
                }),
                3 => PacketBody::OrderInvalidation(OrderPortion {
                    id: Uuid::from_u128(u128::arbitrary(g)),
                    pair_id: String::arbitrary(g),
                    quantity: u64::arbitrary(g),
                }),
                4 => PacketBody::Disconnecting(Disconnecting {
                    reason: DisconnectionReason::from_u8(u8::arbitrary(g) % 9 + 1)
                        .expect("codes 1..=9 are valid"),
                    payload: Option::arbitrary(g),
                }),
                _ => PacketBody::Nodes(vec![NodeEntry {
                    pub_key: PubKey::new([u8::arbitrary(g); 33]),
                    addresses: vec![NodeAddress::new("10.0.0.1", u16::arbitrary(g))],
                }]),
            };
            SmallBody(body)
        }
    }

    quickcheck::quickcheck! {
        fn arbitrary_packets_round_trip(body: SmallBody) -> bool {
            let packet = Packet {
                header: PacketHeader::request(),
                body: body.0,
            };
            Packet::from_bytes(&packet.to_bytes()).ok() == Some(packet)
        }
    }
}
