//! Core scalar types shared by the codec and the speaker: router-ids,
//! circular sequence numbers, metrics and centisecond intervals
//! (RFC 8966, section 4.1).

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::Error;

/// A 16-bit route metric. `0xFFFF` ([`INFINITY`]) denotes an unreachable
/// route (a retraction) and is absorbing under addition.
pub type Metric = u16;

/// The metric of an unreachable route.
pub const INFINITY: Metric = 0xffff;

/// A 16-bit sequence number compared in circular order.
pub type SequenceNumber = u16;

/// Adds two metrics, saturating below infinity. Infinity is absorbing.
pub fn metric_add(a: Metric, b: Metric) -> Metric {
    if a == INFINITY || b == INFINITY {
        INFINITY
    } else {
        (u32::from(a) + u32::from(b)).min(u32::from(INFINITY) - 1) as Metric
    }
}

/// Signed circular distance from `a` to `b` (RFC 8966, section 3.2.1).
///
/// Sequence numbers exactly `1 << 15` apart are incomparable; the distance
/// for such pairs is `i16::MIN`.
pub fn seqno_distance(a: SequenceNumber, b: SequenceNumber) -> i16 {
    b.wrapping_sub(a) as i16
}

/// Absolute circular distance between two sequence numbers.
pub fn seqno_abs_distance(a: SequenceNumber, b: SequenceNumber) -> u16 {
    seqno_distance(a, b).unsigned_abs()
}

/// Circular "less than": true iff `a` is strictly older than `b`.
pub fn seqno_less(a: SequenceNumber, b: SequenceNumber) -> bool {
    seqno_distance(a, b) > 0
}

/// An opaque 8-octet router identifier (RFC 8966, section 4.1.3).
///
/// The distinguished values of all zeroes and all ones are invalid and never
/// appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RouterId(pub [u8; 8]);

impl RouterId {
    pub const UNSPECIFIED: RouterId = RouterId([0; 8]);
    pub const ALL_ONES: RouterId = RouterId([0xff; 8]);

    /// Whether this router-id may legally appear on the wire.
    pub fn is_valid(&self) -> bool {
        *self != Self::UNSPECIFIED && *self != Self::ALL_ONES
    }

    /// Generates a random, valid router-id.
    pub fn random() -> RouterId {
        loop {
            let rid = RouterId(rand::random());
            if rid.is_valid() {
                return rid;
            }
        }
    }

    /// Derives a router-id from an interface address as suggested by
    /// RFC 8966, section 3: the low 8 octets of an IPv6 address, or an IPv4
    /// address in the low 4 octets.
    pub fn from_address(addr: IpAddr) -> RouterId {
        let mut rid = [0u8; 8];
        match addr {
            IpAddr::V4(a) => rid[4..].copy_from_slice(&a.octets()),
            IpAddr::V6(a) => rid.copy_from_slice(&a.octets()[8..]),
        }
        RouterId(rid)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// On-wire address encodings (IANA "Babel Address Encodings" registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressEncoding {
    /// Zero octets.
    Wildcard = 0,
    /// Up to 4 octets, compression allowed.
    Ipv4 = 1,
    /// Up to 16 octets, compression allowed.
    Ipv6 = 2,
    /// Exactly 8 octets, `fe80::/64` implied, no compression.
    Ipv6LinkLocal = 3,
    /// RFC 9229: an IPv4 prefix reachable over an IPv6 next hop.
    Ipv4InIpv6 = 4,
}

impl AddressEncoding {
    pub fn from_wire(ae: u8) -> Result<AddressEncoding, Error> {
        match ae {
            0 => Ok(AddressEncoding::Wildcard),
            1 => Ok(AddressEncoding::Ipv4),
            2 => Ok(AddressEncoding::Ipv6),
            3 => Ok(AddressEncoding::Ipv6LinkLocal),
            4 => Ok(AddressEncoding::Ipv4InIpv6),
            _ => Err(Error::InvalidAddress),
        }
    }
}

/// The address family derived from an address encoding, used to key the
/// next-hop parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Selects the address encoding for an address.
pub fn address_encoding(addr: IpAddr) -> AddressEncoding {
    match addr {
        _ if addr.is_unspecified() => AddressEncoding::Wildcard,
        IpAddr::V4(_) => AddressEncoding::Ipv4,
        IpAddr::V6(a) if (a.segments()[0] & 0xffc0) == 0xfe80 => AddressEncoding::Ipv6LinkLocal,
        IpAddr::V6(_) => AddressEncoding::Ipv6,
    }
}

/// The address family an encoding selects in the next-hop state map.
/// RFC 9229 v4-via-v6 routes resolve their next hop in the IPv6 family.
pub fn address_family(ae: AddressEncoding) -> Option<AddressFamily> {
    match ae {
        AddressEncoding::Wildcard => None,
        AddressEncoding::Ipv4 => Some(AddressFamily::Ipv4),
        AddressEncoding::Ipv6
        | AddressEncoding::Ipv6LinkLocal
        | AddressEncoding::Ipv4InIpv6 => Some(AddressFamily::Ipv6),
    }
}

/// Decodes a 16-bit centisecond count into a duration
/// (RFC 8966, section 4.1.2).
pub fn centisecs_to_duration(cs: u16) -> Duration {
    Duration::from_millis(u64::from(cs) * 10)
}

/// Encodes a duration as centiseconds, saturating at the field limit.
pub fn duration_to_centisecs(d: Duration) -> u16 {
    (d.as_millis() / 10).min(u128::from(u16::MAX)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_distance_cases() {
        for (a, b, d) in [
            (0x0001u16, 0x0001u16, 0i16),
            (0x0001, 0x0002, 1),
            (0xffff, 0x0000, 1),
            (0x8000, 0x8001, 1),
            (0x0000, 0x7fff, 32767),
            (0xfffe, 0x0000, 2),
        ] {
            assert_eq!(seqno_distance(a, b), d, "distance({a:#x}, {b:#x})");
            assert_eq!(seqno_distance(b, a), -d, "distance({b:#x}, {a:#x})");
        }
        assert_eq!(seqno_distance(0x0000, 0x8000), i16::MIN);
        assert_eq!(seqno_abs_distance(0x0000, 0x8000), 32768);
    }

    #[test]
    fn seqno_less_cases() {
        assert!(seqno_less(0xffff, 0x0000));
        assert!(seqno_less(0x0001, 0x0002));
        assert!(seqno_less(0x0000, 0x7fff));
        assert!(!seqno_less(0x0001, 0x0001));
        assert!(!seqno_less(0x0002, 0x0001));
        assert!(!seqno_less(0x0000, 0xffff));
        assert!(!seqno_less(0x0000, 0x8001));
    }

    // Sequence numbers half a period apart compare as neither older nor
    // newer.
    #[test]
    fn seqno_half_period_incomparable() {
        for (a, b) in [(0x0000u16, 0x8000u16), (0x0100, 0x8100), (0x0000, 0x0000)] {
            assert!(!seqno_less(a, b));
            assert!(!seqno_less(b, a));
        }
    }

    #[test]
    fn metric_addition_saturates() {
        assert_eq!(metric_add(1, 2), 3);
        assert_eq!(metric_add(0xfffe, 5), 0xfffe);
        assert_eq!(metric_add(INFINITY, 0), INFINITY);
        assert_eq!(metric_add(96, INFINITY), INFINITY);
    }

    #[test]
    fn router_id_from_ipv4() {
        let rid = RouterId::from_address("10.168.44.55".parse().unwrap());
        assert_eq!(rid.0, [0x00, 0x00, 0x00, 0x00, 0x0a, 0xa8, 0x2c, 0x37]);
    }

    #[test]
    fn router_id_from_ipv6() {
        let rid = RouterId::from_address("fe80::210:5aff:feaa:20a2".parse().unwrap());
        assert_eq!(rid.0, [0x02, 0x10, 0x5a, 0xff, 0xfe, 0xaa, 0x20, 0xa2]);
    }

    #[test]
    fn router_id_validity() {
        assert!(!RouterId::UNSPECIFIED.is_valid());
        assert!(!RouterId::ALL_ONES.is_valid());
        assert!(RouterId::random().is_valid());
    }

    #[test]
    fn interval_round_trip() {
        let d = Duration::from_secs(12);
        assert_eq!(duration_to_centisecs(d), 1200);
        assert_eq!(centisecs_to_duration(1200), d);
        assert_eq!(duration_to_centisecs(Duration::from_secs(3600)), u16::MAX);
    }

    #[test]
    fn address_encodings() {
        let ll: IpAddr = "fe80::1".parse().unwrap();
        let v4: IpAddr = "1.2.3.4".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let unspec: IpAddr = "::".parse().unwrap();
        assert_eq!(address_encoding(ll), AddressEncoding::Ipv6LinkLocal);
        assert_eq!(address_encoding(v4), AddressEncoding::Ipv4);
        assert_eq!(address_encoding(v6), AddressEncoding::Ipv6);
        assert_eq!(address_encoding(unspec), AddressEncoding::Wildcard);
    }
}
