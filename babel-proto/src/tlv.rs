//! Typed TLV values (RFC 8966, section 4.6).
//!
//! Sub-TLVs are attached as optional fields on their parent variant. The
//! fields of an [`Update`] that are not carried in the TLV itself (router-id,
//! next hop) are resolved from the parser state during decoding.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use ipnetwork::IpNetwork;

use crate::types::{Metric, RouterId, SequenceNumber};
use crate::tlv_type;

/// Hello flag: the Hello is unicast and its seqno belongs to the
/// per-neighbour unicast stream.
pub const FLAG_HELLO_UNICAST: u16 = 0x8000;

/// Update flag: the advertised prefix becomes the new default prefix for its
/// address encoding.
pub const FLAG_UPDATE_PREFIX: u8 = 0x80;
/// Update flag: the low 8 octets of the advertised prefix become the new
/// current router-id.
pub const FLAG_UPDATE_ROUTER_ID: u8 = 0x40;

/// A Babel TLV, the unit of meaning inside a packet body.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Pad1,
    PadN { n: u8 },
    AcknowledgmentRequest(AcknowledgmentRequest),
    Acknowledgment(Acknowledgment),
    Hello(Hello),
    Ihu(Ihu),
    RouterId(RouterIdTlv),
    NextHop(NextHop),
    Update(Update),
    RouteRequest(RouteRequest),
    SeqnoRequest(SeqnoRequest),
    /// RFC 8967 MAC, carried opaquely and never validated.
    Mac(Bytes),
}

impl Value {
    pub fn tlv_type(&self) -> u8 {
        match self {
            Value::Pad1 => tlv_type::PAD1,
            Value::PadN { .. } => tlv_type::PADN,
            Value::AcknowledgmentRequest(_) => tlv_type::ACKNOWLEDGMENT_REQUEST,
            Value::Acknowledgment(_) => tlv_type::ACKNOWLEDGMENT,
            Value::Hello(_) => tlv_type::HELLO,
            Value::Ihu(_) => tlv_type::IHU,
            Value::RouterId(_) => tlv_type::ROUTER_ID,
            Value::NextHop(_) => tlv_type::NEXT_HOP,
            Value::Update(_) => tlv_type::UPDATE,
            Value::RouteRequest(_) => tlv_type::ROUTE_REQUEST,
            Value::SeqnoRequest(_) => tlv_type::SEQNO_REQUEST,
            Value::Mac(_) => tlv_type::MAC,
        }
    }
}

/// RFC 8966, section 4.6.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknowledgmentRequest {
    /// Echoed verbatim in the matching Acknowledgment.
    pub opaque: u16,
    /// Deadline before which the receiver must acknowledge. Must not be zero.
    pub interval: Duration,
}

/// RFC 8966, section 4.6.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    pub opaque: u16,
}

/// RFC 8966, section 4.6.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub flags: u16,
    /// Unicast or multicast Hello seqno depending on [`FLAG_HELLO_UNICAST`].
    pub seqno: SequenceNumber,
    /// Upper bound until the next scheduled Hello with the same flag;
    /// zero for unscheduled Hellos.
    pub interval: Duration,
    /// Transmit timestamp (draft-ietf-babel-rtt-extension).
    pub timestamp: Option<HelloTimestamp>,
}

impl Hello {
    pub fn is_unicast(&self) -> bool {
        self.flags & FLAG_HELLO_UNICAST != 0
    }
}

/// Timestamp sub-TLV on a Hello: transmit time in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloTimestamp {
    pub transmit: u32,
}

/// RFC 8966, section 4.6.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ihu {
    /// The cost the sender computed for receiving from the addressed
    /// neighbour; infinity means unreachable.
    pub rx_cost: Metric,
    /// Upper bound until the next IHU. Must not be zero.
    pub interval: Duration,
    /// The destination neighbour. Compression is not allowed.
    pub address: IpAddr,
    /// Timestamp sub-TLV (draft-ietf-babel-rtt-extension).
    pub timestamp: Option<IhuTimestamp>,
}

/// Timestamp sub-TLV on an IHU: echoed origin and local receive time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IhuTimestamp {
    pub origin: u32,
    pub receive: u32,
}

/// RFC 8966, section 4.6.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterIdTlv {
    /// Router-id for subsequent Updates. Must be valid on the wire.
    pub router_id: RouterId,
}

/// RFC 8966, section 4.6.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    /// Next-hop address for subsequent Updates of the matching family.
    pub next_hop: IpAddr,
}

/// RFC 8966, section 4.6.9.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Update {
    pub flags: u8,
    /// Upper bound until the next update for this prefix.
    pub interval: Duration,
    /// The originator's sequence number.
    pub seqno: SequenceNumber,
    /// The sender's metric; infinity retracts the prefix.
    pub metric: Metric,
    /// The advertised prefix.
    pub prefix: IpNetwork,
    /// Resolved from the current parser state, not encoded in this TLV.
    pub router_id: RouterId,
    /// Resolved from the current parser state, not encoded in this TLV.
    /// Unspecified when no Next Hop TLV preceded; the packet source address
    /// applies then.
    pub next_hop: IpAddr,
    /// RFC 9079 Source Prefix sub-TLV, passed through.
    pub source_prefix: Option<IpNetwork>,
}

/// RFC 8966, section 4.6.10.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteRequest {
    /// The requested prefix; `::/0` as wildcard requests a full dump.
    pub prefix: IpNetwork,
    pub source_prefix: Option<IpNetwork>,
}

impl RouteRequest {
    pub fn is_wildcard(&self) -> bool {
        self.prefix.ip().is_unspecified() && self.prefix.prefix() == 0
    }
}

/// RFC 8966, section 4.6.11.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeqnoRequest {
    /// The sequence number being requested.
    pub seqno: SequenceNumber,
    /// Remaining forwards plus one. Must not be zero.
    pub hop_count: u8,
    /// The router-id being requested. Must be valid on the wire.
    pub router_id: RouterId,
    pub prefix: IpNetwork,
    pub source_prefix: Option<IpNetwork>,
}
