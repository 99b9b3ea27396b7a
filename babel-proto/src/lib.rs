//! Wire protocol encoding and decoding for Babel (RFC 8966, section 4).
//!
//! The central type is [`Parser`], which keeps the per-packet state required
//! to compress prefixes and resolve router-ids and next hops across
//! consecutive Update TLVs. TLVs are modelled as the [`Value`] sum type with
//! sub-TLVs attached as optional fields on their parent variant.

use std::net::Ipv6Addr;

mod error;
mod order;
mod parser;
mod tlv;
mod types;

pub use error::Error;
pub use order::compression_order;
pub use parser::Parser;
pub use tlv::{
    Acknowledgment, AcknowledgmentRequest, Hello, HelloTimestamp, Ihu, IhuTimestamp, NextHop,
    RouteRequest, RouterIdTlv, SeqnoRequest, Update, Value, FLAG_HELLO_UNICAST, FLAG_UPDATE_PREFIX,
    FLAG_UPDATE_ROUTER_ID,
};
pub use types::{
    address_encoding, address_family, centisecs_to_duration, duration_to_centisecs, metric_add,
    seqno_abs_distance, seqno_distance, seqno_less, AddressEncoding, AddressFamily, Metric,
    RouterId, SequenceNumber, INFINITY,
};

/// First octet of every Babel packet.
pub const MAGIC: u8 = 42;
/// Protocol version implemented by this crate.
pub const VERSION: u8 = 2;
/// Packet header length in octets: magic, version, body length.
pub const HEADER_LEN: usize = 4;
/// TLV header length in octets: type, length. Pad1 is the sole exception.
pub const VALUE_HEADER_LEN: usize = 2;

/// The IANA-assigned Babel UDP port.
pub const PORT: u16 = 6697;
/// The IANA-assigned IPv6 multicast group for Babel (`ff02::1:6`).
pub const MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x1, 0x6);

/// Babel TLV types (IANA "Babel TLV Types" registry).
pub mod tlv_type {
    pub const PAD1: u8 = 0;
    pub const PADN: u8 = 1;
    pub const ACKNOWLEDGMENT_REQUEST: u8 = 2;
    pub const ACKNOWLEDGMENT: u8 = 3;
    pub const HELLO: u8 = 4;
    pub const IHU: u8 = 5;
    pub const ROUTER_ID: u8 = 6;
    pub const NEXT_HOP: u8 = 7;
    pub const UPDATE: u8 = 8;
    pub const ROUTE_REQUEST: u8 = 9;
    pub const SEQNO_REQUEST: u8 = 10;
    /// RFC 8967. Parsed pass-through, never validated.
    pub const MAC: u8 = 16;
}

/// Babel sub-TLV types (IANA "Babel Sub-TLV Types" registry).
pub mod sub_tlv_type {
    pub const PAD1: u8 = 0;
    pub const PADN: u8 = 1;
    /// draft-ietf-babel-rtt-extension.
    pub const TIMESTAMP: u8 = 3;
    /// RFC 9079. The high bit makes it mandatory.
    pub const SOURCE_PREFIX: u8 = 128;
}

/// Whether a sub-TLV type is mandatory: unknown mandatory sub-TLVs cause the
/// entire parent TLV to be discarded.
pub fn is_mandatory(sub_type: u8) -> bool {
    sub_type & 0x80 != 0
}

/// Whether a TLV type may appear in the packet trailer.
pub fn is_trailer_type(typ: u8) -> bool {
    matches!(typ, tlv_type::PAD1 | tlv_type::PADN | tlv_type::MAC)
}

/// A decoded Babel packet: the body TLVs followed by the trailer TLVs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub body: Vec<Value>,
    pub trailer: Vec<Value>,
}

/// Cheap pre-parse check used by the ingress filter: anything that does not
/// start with the Babel magic octet is silently ignored.
pub fn is_babel_packet(buf: &[u8]) -> bool {
    buf.first() == Some(&MAGIC)
}
