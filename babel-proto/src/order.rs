//! Ordering of Update TLVs for encoding.
//!
//! Sorting updates so that adjacent ones share the longest possible prefix
//! with the previous default prefix minimises the total encoded size
//! (RFC 8966, section 4.6.9). Updates are grouped by router-id first so a
//! single Router-Id TLV can precede each group.

use std::cmp::Ordering;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::tlv::Update;
use crate::types::RouterId;

/// The encoder-side sort order for a batch of updates.
pub fn compression_order(a: &Update, b: &Update) -> Ordering {
    a.router_id
        .cmp(&b.router_id)
        .then_with(|| is_v4_mapped(&a.prefix).cmp(&is_v4_mapped(&b.prefix)))
        // Host routes whose interface-id equals the router-id come first:
        // they can be encoded with the router-id flag.
        .then_with(|| {
            derives_router_id(a.prefix, a.router_id)
                .cmp(&derives_router_id(b.prefix, b.router_id))
                .reverse()
        })
        // Longer prefixes first.
        .then_with(|| a.prefix.prefix().cmp(&b.prefix.prefix()).reverse())
        .then_with(|| cmp_addr(a.prefix.ip(), b.prefix.ip()))
        // Updates with a source prefix first.
        .then_with(|| a.source_prefix.is_some().cmp(&b.source_prefix.is_some()).reverse())
        .then_with(|| match (a.source_prefix, b.source_prefix) {
            (Some(x), Some(y)) => x
                .prefix()
                .cmp(&y.prefix())
                .reverse()
                .then_with(|| cmp_addr(x.ip(), y.ip())),
            _ => Ordering::Equal,
        })
}

fn is_v4_mapped(p: &IpNetwork) -> bool {
    match p {
        IpNetwork::V4(_) => true,
        IpNetwork::V6(p) => p.prefix() >= 96 && p.ip().to_ipv4_mapped().is_some(),
    }
}

fn derives_router_id(p: IpNetwork, rid: RouterId) -> bool {
    match p {
        IpNetwork::V6(p) if p.prefix() == 128 => p.ip().octets()[8..] == rid.0,
        _ => false,
    }
}

fn cmp_addr(a: IpAddr, b: IpAddr) -> Ordering {
    // IPv6 before IPv4, then bytewise.
    match (a, b) {
        (IpAddr::V6(x), IpAddr::V6(y)) => x.octets().cmp(&y.octets()),
        (IpAddr::V4(x), IpAddr::V4(y)) => x.octets().cmp(&y.octets()),
        (IpAddr::V6(_), IpAddr::V4(_)) => Ordering::Less,
        (IpAddr::V4(_), IpAddr::V6(_)) => Ordering::Greater,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv6Addr};
    use std::time::Duration;

    use super::*;

    fn update(rid: RouterId, prefix: &str, source_prefix: Option<&str>) -> Update {
        Update {
            flags: 0,
            interval: Duration::from_secs(16),
            seqno: 0,
            metric: 0,
            prefix: prefix.parse().unwrap(),
            router_id: rid,
            next_hop: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            source_prefix: source_prefix.map(|s| s.parse().unwrap()),
        }
    }

    fn rid(n: u64) -> RouterId {
        RouterId(n.to_be_bytes())
    }

    #[track_caller]
    fn assert_ordered(a: &Update, b: &Update) {
        assert_eq!(compression_order(a, b), Ordering::Less);
        assert_eq!(compression_order(b, a), Ordering::Greater);
    }

    #[test]
    fn equal_updates_are_equal() {
        let u = update(rid(1), "2001:db8::/32", None);
        assert_eq!(compression_order(&u, &u), Ordering::Equal);
    }

    #[test]
    fn router_id_dominates() {
        assert_ordered(
            &update(rid(1), "2001:db8::/32", None),
            &update(rid(2), "1::/64", None),
        );
    }

    #[test]
    fn v6_before_v4_mapped() {
        assert_ordered(
            &update(rid(1), "2001:db8::/32", None),
            &update(rid(1), "::ffff:1.0.0.1/128", None),
        );
    }

    #[test]
    fn router_id_derived_host_route_first() {
        let r = rid(0x1234_5678_90ab_cdef);
        assert_ordered(
            &update(r, "fe80::1234:5678:90ab:cdef/128", None),
            &update(r, "fe80::1/128", None),
        );
    }

    #[test]
    fn longer_prefixes_first() {
        assert_ordered(
            &update(rid(1), "fe80::1/128", None),
            &update(rid(1), "fe80::1/127", None),
        );
    }

    #[test]
    fn prefix_address_breaks_ties() {
        assert_ordered(
            &update(rid(1), "fe80::1/128", None),
            &update(rid(1), "fe80::2/128", None),
        );
    }

    #[test]
    fn source_prefix_ordering() {
        assert_ordered(
            &update(rid(1), "2001:db8::/64", Some("2001:db8:1::/48")),
            &update(rid(1), "2001:db8::/64", None),
        );
        assert_ordered(
            &update(rid(1), "2001:db8::/64", Some("2001:db8:1::/48")),
            &update(rid(1), "2001:db8::/64", Some("2001:db8:1::/47")),
        );
    }

    #[test]
    fn sorting_groups_by_router_id() {
        let mut us = vec![
            update(rid(2), "2001:db8:2::/48", None),
            update(rid(1), "2001:db8:1::/48", None),
            update(rid(2), "2001:db8:1::/48", None),
            update(rid(1), "2001:db8:1:1::/64", None),
        ];
        us.sort_by(compression_order);
        let rids: Vec<_> = us.iter().map(|u| u.router_id).collect();
        assert_eq!(rids, vec![rid(1), rid(1), rid(2), rid(2)]);
        // Within a router-id group, longer prefixes come first.
        assert_eq!(us[0].prefix.prefix(), 64);
    }
}
