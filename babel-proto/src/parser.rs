//! Stateful packet parser and encoder (RFC 8966, sections 4.2-4.6).
//!
//! A [`Parser`] carries the state that consecutive Update TLVs share: the
//! current default prefix per address encoding, the current next hop per
//! address family and the current router-id. The state is reset at the start
//! of every packet body, and deliberately not between body and trailer.
//!
//! On the encoding side the same state drives prefix compression: the
//! `omitted` octet count of an Update is computed against the current
//! default prefix, and [`Parser::value_length`] returns exactly the number
//! of octets a subsequent [`Parser::append_value`] would write, so a send
//! queue can pack TLVs against an MTU without rollback.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use ipnetwork::IpNetwork;

use crate::tlv::*;
use crate::types::*;
use crate::{
    is_mandatory, is_trailer_type, sub_tlv_type, tlv_type, Error, Packet, HEADER_LEN, MAGIC,
    VALUE_HEADER_LEN, VERSION,
};

const AE_COUNT: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct Parser {
    /// Current default prefix, keyed by address encoding.
    default_prefix: [Option<IpAddr>; AE_COUNT],
    /// Current next hop, keyed by address family.
    next_hop: [Option<IpAddr>; 2],
    /// Current router-id for subsequent Updates.
    router_id: RouterId,
}

fn af_index(af: AddressFamily) -> usize {
    match af {
        AddressFamily::Ipv4 => 0,
        AddressFamily::Ipv6 => 1,
    }
}

// Cursor helpers. bytes::Buf panics on underflow, so bounds are checked here
// and mapped onto Error::TooShort.

fn take_u8(b: &mut &[u8]) -> Result<u8, Error> {
    let (&v, rest) = b.split_first().ok_or(Error::TooShort)?;
    *b = rest;
    Ok(v)
}

fn take_u16(b: &mut &[u8]) -> Result<u16, Error> {
    let s = take_slice(b, 2)?;
    Ok(u16::from_be_bytes([s[0], s[1]]))
}

fn take_u32(b: &mut &[u8]) -> Result<u32, Error> {
    let s = take_slice(b, 4)?;
    Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn take_slice<'a>(b: &mut &'a [u8], n: usize) -> Result<&'a [u8], Error> {
    if b.len() < n {
        return Err(Error::TooShort);
    }
    let (head, rest) = b.split_at(n);
    *b = rest;
    Ok(head)
}

/// Splits the next TLV off the front of `b`, honouring the Pad1 exception.
fn split_value<'a>(b: &mut &'a [u8]) -> Result<(u8, &'a [u8]), Error> {
    let typ = take_u8(b)?;
    if typ == tlv_type::PAD1 {
        return Ok((typ, &[]));
    }
    let len = take_u8(b)? as usize;
    let payload = take_slice(b, len)?;
    Ok((typ, payload))
}

/// Appends a TLV header, runs `f` to write the payload, then patches the
/// length octet.
fn with_length_octet(
    buf: &mut BytesMut,
    typ: u8,
    f: impl FnOnce(&mut BytesMut) -> Result<(), Error>,
) -> Result<(), Error> {
    buf.put_u8(typ);
    let len_at = buf.len();
    buf.put_u8(0);
    f(buf)?;
    let len = buf.len() - len_at - 1;
    debug_assert!(len <= u8::MAX as usize);
    buf[len_at] = len as u8;
    Ok(())
}

fn put_interval(buf: &mut BytesMut, d: std::time::Duration) {
    buf.put_u16(duration_to_centisecs(d));
}

fn take_interval(b: &mut &[u8]) -> Result<std::time::Duration, Error> {
    Ok(centisecs_to_duration(take_u16(b)?))
}

fn take_router_id(b: &mut &[u8]) -> Result<RouterId, Error> {
    let s = take_slice(b, 8)?;
    let mut rid = [0u8; 8];
    rid.copy_from_slice(s);
    let rid = RouterId(rid);
    if !rid.is_valid() {
        return Err(Error::InvalidRouterId);
    }
    Ok(rid)
}

fn addr_octets(addr: IpAddr) -> ([u8; 16], usize) {
    match addr {
        IpAddr::V4(a) => {
            let mut o = [0u8; 16];
            o[..4].copy_from_slice(&a.octets());
            (o, 4)
        }
        IpAddr::V6(a) => (a.octets(), 16),
    }
}

/// The number of octets a full (uncompressed) address occupies on the wire.
fn address_length(addr: IpAddr) -> usize {
    match address_encoding(addr) {
        AddressEncoding::Wildcard => 0,
        AddressEncoding::Ipv4 | AddressEncoding::Ipv4InIpv6 => 4,
        AddressEncoding::Ipv6 => 16,
        AddressEncoding::Ipv6LinkLocal => 8,
    }
}

fn plen_octets(plen: u8) -> usize {
    (usize::from(plen) + 7) / 8
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the parser state. Called implicitly at the start of every
    /// packet body.
    pub fn reset(&mut self) {
        self.default_prefix = Default::default();
        self.next_hop = Default::default();
        self.router_id = RouterId::UNSPECIFIED;
    }

    // Decoding

    /// Decodes a whole packet.
    ///
    /// Unknown body TLV types are skipped; a TLV carrying an unknown
    /// mandatory sub-TLV is dropped while the rest of the packet is still
    /// parsed. Any other error aborts the packet.
    pub fn packet(&mut self, buf: &[u8]) -> Result<Packet, Error> {
        let mut b = buf;

        if take_u8(&mut b)? != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = take_u8(&mut b)?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let body_len = take_u16(&mut b)? as usize;
        if b.len() < body_len {
            return Err(Error::TooShort);
        }
        let (body, trailer) = b.split_at(body_len);

        self.reset();

        let mut pkt = Packet::default();

        let mut body = body;
        while !body.is_empty() {
            let (typ, payload) = split_value(&mut body)?;
            match self.value_payload(typ, payload) {
                Ok(v) => pkt.body.push(v),
                Err(Error::UnsupportedValue(_)) | Err(Error::UnsupportedMandatory(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut trailer = trailer;
        while !trailer.is_empty() {
            let (typ, payload) = split_value(&mut trailer)?;
            if !is_trailer_type(typ) {
                return Err(Error::InvalidValueForTrailer(typ));
            }
            pkt.trailer.push(self.value_payload(typ, payload)?);
        }

        Ok(pkt)
    }

    fn value_payload(&mut self, typ: u8, payload: &[u8]) -> Result<Value, Error> {
        let mut b = payload;
        let v = match typ {
            tlv_type::PAD1 => Value::Pad1,
            tlv_type::PADN => {
                let n = b.len().min(u8::MAX as usize) as u8;
                b = &[];
                Value::PadN { n }
            }
            tlv_type::ACKNOWLEDGMENT_REQUEST => {
                take_u16(&mut b)?; // reserved
                let opaque = take_u16(&mut b)?;
                let interval = take_interval(&mut b)?;
                Value::AcknowledgmentRequest(AcknowledgmentRequest { opaque, interval })
            }
            tlv_type::ACKNOWLEDGMENT => {
                let opaque = take_u16(&mut b)?;
                Value::Acknowledgment(Acknowledgment { opaque })
            }
            tlv_type::HELLO => Value::Hello(self.hello(&mut b)?),
            tlv_type::IHU => Value::Ihu(self.ihu(&mut b)?),
            tlv_type::ROUTER_ID => {
                take_u16(&mut b)?; // reserved
                let router_id = take_router_id(&mut b)?;
                self.router_id = router_id;
                Value::RouterId(RouterIdTlv { router_id })
            }
            tlv_type::NEXT_HOP => {
                let ae = AddressEncoding::from_wire(take_u8(&mut b)?)?;
                take_u8(&mut b)?; // reserved
                let next_hop = self.address(&mut b, ae, 0, None)?;
                if let Some(af) = address_family(ae) {
                    self.next_hop[af_index(af)] = Some(next_hop);
                }
                Value::NextHop(NextHop { next_hop })
            }
            tlv_type::UPDATE => Value::Update(self.update(&mut b)?),
            tlv_type::ROUTE_REQUEST => Value::RouteRequest(self.route_request(&mut b)?),
            tlv_type::SEQNO_REQUEST => Value::SeqnoRequest(self.seqno_request(&mut b)?),
            tlv_type::MAC => {
                let mac = Bytes::copy_from_slice(b);
                b = &[];
                Value::Mac(mac)
            }
            other => return Err(Error::UnsupportedValue(other)),
        };

        if !b.is_empty() {
            return Err(Error::TooLong);
        }
        Ok(v)
    }

    fn hello(&mut self, b: &mut &[u8]) -> Result<Hello, Error> {
        let flags = take_u16(b)?;
        let seqno = take_u16(b)?;
        let interval = take_interval(b)?;

        let mut timestamp = None;
        sub_values(b, |typ, payload| match typ {
            sub_tlv_type::TIMESTAMP => {
                let transmit = take_u32(payload)?;
                timestamp = Some(HelloTimestamp { transmit });
                Ok(true)
            }
            _ => Ok(false),
        })?;

        Ok(Hello { flags, seqno, interval, timestamp })
    }

    fn ihu(&mut self, b: &mut &[u8]) -> Result<Ihu, Error> {
        let ae = AddressEncoding::from_wire(take_u8(b)?)?;
        take_u8(b)?; // reserved
        let rx_cost = take_u16(b)?;
        let interval = take_interval(b)?;
        let address = self.address(b, ae, 0, None)?;

        let mut timestamp = None;
        sub_values(b, |typ, payload| match typ {
            sub_tlv_type::TIMESTAMP => {
                let origin = take_u32(payload)?;
                let receive = take_u32(payload)?;
                timestamp = Some(IhuTimestamp { origin, receive });
                Ok(true)
            }
            _ => Ok(false),
        })?;

        Ok(Ihu { rx_cost, interval, address, timestamp })
    }

    fn update(&mut self, b: &mut &[u8]) -> Result<Update, Error> {
        let ae = AddressEncoding::from_wire(take_u8(b)?)?;
        let flags = take_u8(b)?;
        let plen = take_u8(b)?;
        let omitted = take_u8(b)?;
        let interval = take_interval(b)?;
        let seqno = take_u16(b)?;
        let metric = take_u16(b)?;
        let prefix = self.prefix(b, ae, plen, omitted)?;

        let mut source_prefix = None;
        sub_values(b, |typ, payload| match typ {
            sub_tlv_type::SOURCE_PREFIX => {
                source_prefix = Some(self.source_prefix(payload, ae)?);
                Ok(true)
            }
            _ => Ok(false),
        })?;

        // State updates happen only once the TLV parsed cleanly, and the
        // prefix above was decoded against the previous default prefix.
        if flags & FLAG_UPDATE_ROUTER_ID != 0 {
            self.router_id = RouterId::from_address(prefix.ip());
        }
        if flags & FLAG_UPDATE_PREFIX != 0 {
            self.default_prefix[ae as usize] = Some(prefix.ip());
        }

        let next_hop = address_family(ae)
            .and_then(|af| self.next_hop[af_index(af)])
            .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));

        Ok(Update {
            flags,
            interval,
            seqno,
            metric,
            prefix,
            router_id: self.router_id,
            next_hop,
            source_prefix,
        })
    }

    fn route_request(&mut self, b: &mut &[u8]) -> Result<RouteRequest, Error> {
        let ae = AddressEncoding::from_wire(take_u8(b)?)?;
        let plen = take_u8(b)?;
        let prefix = self.prefix(b, ae, plen, 0)?;

        let mut source_prefix = None;
        sub_values(b, |typ, payload| match typ {
            sub_tlv_type::SOURCE_PREFIX => {
                source_prefix = Some(self.source_prefix(payload, ae)?);
                Ok(true)
            }
            _ => Ok(false),
        })?;

        Ok(RouteRequest { prefix, source_prefix })
    }

    fn seqno_request(&mut self, b: &mut &[u8]) -> Result<SeqnoRequest, Error> {
        let ae = AddressEncoding::from_wire(take_u8(b)?)?;
        let plen = take_u8(b)?;
        let seqno = take_u16(b)?;
        let hop_count = take_u8(b)?;
        take_u8(b)?; // reserved
        let router_id = take_router_id(b)?;
        let prefix = self.prefix(b, ae, plen, 0)?;

        let mut source_prefix = None;
        sub_values(b, |typ, payload| match typ {
            sub_tlv_type::SOURCE_PREFIX => {
                source_prefix = Some(self.source_prefix(payload, ae)?);
                Ok(true)
            }
            _ => Ok(false),
        })?;

        Ok(SeqnoRequest { seqno, hop_count, router_id, prefix, source_prefix })
    }

    fn source_prefix(&self, b: &mut &[u8], ae: AddressEncoding) -> Result<IpNetwork, Error> {
        let plen = take_u8(b)?;
        self.prefix(b, ae, plen, 0)
    }

    fn prefix(
        &self,
        b: &mut &[u8],
        ae: AddressEncoding,
        plen: u8,
        omitted: u8,
    ) -> Result<IpNetwork, Error> {
        let addr = self.address(b, ae, omitted, Some(plen))?;
        IpNetwork::new(addr, plen).map_err(|_| Error::InvalidAddress)
    }

    /// Decodes an address. `plen` is `None` for full addresses (IHU, Next
    /// Hop) and `Some` when decoding a prefix of that length.
    fn address(
        &self,
        b: &mut &[u8],
        ae: AddressEncoding,
        omitted: u8,
        plen: Option<u8>,
    ) -> Result<IpAddr, Error> {
        match ae {
            AddressEncoding::Wildcard => Ok(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),

            AddressEncoding::Ipv4 | AddressEncoding::Ipv4InIpv6 | AddressEncoding::Ipv6 => {
                let alen: usize = if ae == AddressEncoding::Ipv6 { 16 } else { 4 };
                let rplen = usize::from(plen.unwrap_or(alen as u8 * 8));
                if rplen > alen * 8 {
                    return Err(Error::InvalidAddress);
                }

                let omitted = usize::from(omitted);
                let pbytes = (rplen + 7) / 8;
                if omitted > pbytes {
                    return Err(Error::InvalidAddress);
                }
                let wire = take_slice(b, pbytes - omitted)?;

                let mut abuf = [0u8; 16];
                if omitted > 0 {
                    let dp = self.default_prefix[ae as usize]
                        .ok_or(Error::MissingDefaultPrefix)?;
                    let (dp_octets, dp_len) = addr_octets(dp);
                    if dp_len < omitted {
                        return Err(Error::InvalidAddress);
                    }
                    abuf[..omitted].copy_from_slice(&dp_octets[..omitted]);
                }
                abuf[omitted..pbytes].copy_from_slice(wire);

                // Bits beyond plen in the last octet are cleared.
                if rplen % 8 != 0 {
                    abuf[rplen / 8] &= 0xffu8 << (8 - rplen % 8);
                }

                if alen == 4 {
                    Ok(IpAddr::V4(Ipv4Addr::new(abuf[0], abuf[1], abuf[2], abuf[3])))
                } else {
                    let mut o = [0u8; 16];
                    o.copy_from_slice(&abuf);
                    Ok(IpAddr::V6(Ipv6Addr::from(o)))
                }
            }

            AddressEncoding::Ipv6LinkLocal => {
                let wire = take_slice(b, 8)?;
                let mut o = [0u8; 16];
                o[0] = 0xfe;
                o[1] = 0x80;
                o[8..].copy_from_slice(wire);
                Ok(IpAddr::V6(Ipv6Addr::from(o)))
            }
        }
    }

    // Encoding

    /// Returns the total number of octets [`Parser::append_value`] would
    /// write for `v` under the current encoder state.
    pub fn value_length(&self, v: &Value) -> usize {
        let sub_prefix_len = |p: &Option<IpNetwork>| {
            p.map(|p| VALUE_HEADER_LEN + 1 + plen_octets(p.prefix()))
                .unwrap_or(0)
        };

        match v {
            Value::Pad1 => 1,
            Value::PadN { n } => VALUE_HEADER_LEN + usize::from(*n),
            Value::AcknowledgmentRequest(_) => VALUE_HEADER_LEN + 6,
            Value::Acknowledgment(_) => VALUE_HEADER_LEN + 2,
            Value::Hello(h) => {
                VALUE_HEADER_LEN
                    + 6
                    + h.timestamp.map(|_| VALUE_HEADER_LEN + 4).unwrap_or(0)
            }
            Value::Ihu(i) => {
                VALUE_HEADER_LEN
                    + 6
                    + address_length(i.address)
                    + i.timestamp.map(|_| VALUE_HEADER_LEN + 8).unwrap_or(0)
            }
            Value::RouterId(_) => VALUE_HEADER_LEN + 10,
            Value::NextHop(n) => VALUE_HEADER_LEN + 2 + address_length(n.next_hop),
            Value::Update(u) => {
                let (_, start, end) = self.update_prefix_octets(u);
                VALUE_HEADER_LEN + 10 + (end - start) + sub_prefix_len(&u.source_prefix)
            }
            Value::RouteRequest(r) => {
                let (_, _, start, end) = prefix_wire_octets(r.prefix, 0);
                VALUE_HEADER_LEN + 2 + (end - start) + sub_prefix_len(&r.source_prefix)
            }
            Value::SeqnoRequest(s) => {
                let (_, _, start, end) = prefix_wire_octets(s.prefix, 0);
                VALUE_HEADER_LEN + 14 + (end - start) + sub_prefix_len(&s.source_prefix)
            }
            Value::Mac(m) => VALUE_HEADER_LEN + m.len(),
        }
    }

    /// Appends `v` to `buf` and advances the encoder state.
    pub fn append_value(&mut self, buf: &mut BytesMut, v: &Value) -> Result<(), Error> {
        match v {
            Value::Pad1 => {
                buf.put_u8(tlv_type::PAD1);
                Ok(())
            }
            Value::PadN { n } => with_length_octet(buf, tlv_type::PADN, |buf| {
                buf.put_bytes(0, usize::from(*n));
                Ok(())
            }),
            Value::AcknowledgmentRequest(a) => {
                with_length_octet(buf, tlv_type::ACKNOWLEDGMENT_REQUEST, |buf| {
                    buf.put_u16(0); // reserved
                    buf.put_u16(a.opaque);
                    put_interval(buf, a.interval);
                    Ok(())
                })
            }
            Value::Acknowledgment(a) => with_length_octet(buf, tlv_type::ACKNOWLEDGMENT, |buf| {
                buf.put_u16(a.opaque);
                Ok(())
            }),
            Value::Hello(h) => with_length_octet(buf, tlv_type::HELLO, |buf| {
                buf.put_u16(h.flags);
                buf.put_u16(h.seqno);
                put_interval(buf, h.interval);
                if let Some(ts) = h.timestamp {
                    with_length_octet(buf, sub_tlv_type::TIMESTAMP, |buf| {
                        buf.put_u32(ts.transmit);
                        Ok(())
                    })?;
                }
                Ok(())
            }),
            Value::Ihu(i) => with_length_octet(buf, tlv_type::IHU, |buf| {
                let ae = address_encoding(i.address);
                buf.put_u8(ae as u8);
                buf.put_u8(0); // reserved
                buf.put_u16(i.rx_cost);
                put_interval(buf, i.interval);
                put_address(buf, i.address);
                if let Some(ts) = i.timestamp {
                    with_length_octet(buf, sub_tlv_type::TIMESTAMP, |buf| {
                        buf.put_u32(ts.origin);
                        buf.put_u32(ts.receive);
                        Ok(())
                    })?;
                }
                Ok(())
            }),
            Value::RouterId(r) => {
                if !r.router_id.is_valid() {
                    return Err(Error::InvalidRouterId);
                }
                with_length_octet(buf, tlv_type::ROUTER_ID, |buf| {
                    buf.put_u16(0); // reserved
                    buf.put_slice(r.router_id.as_bytes());
                    Ok(())
                })?;
                self.router_id = r.router_id;
                Ok(())
            }
            Value::NextHop(n) => {
                let ae = address_encoding(n.next_hop);
                with_length_octet(buf, tlv_type::NEXT_HOP, |buf| {
                    buf.put_u8(ae as u8);
                    buf.put_u8(0); // reserved
                    put_address(buf, n.next_hop);
                    Ok(())
                })?;
                if let Some(af) = address_family(ae) {
                    self.next_hop[af_index(af)] = Some(n.next_hop);
                }
                Ok(())
            }
            Value::Update(u) => {
                let (ae, start, end) = self.update_prefix_octets(u);
                let (octets, _) = addr_octets(u.prefix.ip());
                let omitted = if ae == AddressEncoding::Ipv6LinkLocal {
                    0
                } else {
                    start
                };
                with_length_octet(buf, tlv_type::UPDATE, |buf| {
                    buf.put_u8(ae as u8);
                    buf.put_u8(u.flags);
                    buf.put_u8(u.prefix.prefix());
                    buf.put_u8(omitted as u8);
                    put_interval(buf, u.interval);
                    buf.put_u16(u.seqno);
                    buf.put_u16(u.metric);
                    buf.put_slice(&octets[start..end]);
                    if let Some(sp) = u.source_prefix {
                        put_source_prefix(buf, sp)?;
                    }
                    Ok(())
                })?;
                if u.flags & FLAG_UPDATE_ROUTER_ID != 0 {
                    self.router_id = RouterId::from_address(u.prefix.ip());
                }
                if u.flags & FLAG_UPDATE_PREFIX != 0 {
                    self.default_prefix[ae as usize] = Some(u.prefix.ip());
                }
                Ok(())
            }
            Value::RouteRequest(r) => with_length_octet(buf, tlv_type::ROUTE_REQUEST, |buf| {
                let (ae, octets, start, end) = prefix_wire_octets(r.prefix, 0);
                buf.put_u8(ae as u8);
                buf.put_u8(r.prefix.prefix());
                buf.put_slice(&octets[start..end]);
                if let Some(sp) = r.source_prefix {
                    put_source_prefix(buf, sp)?;
                }
                Ok(())
            }),
            Value::SeqnoRequest(s) => {
                if !s.router_id.is_valid() {
                    return Err(Error::InvalidRouterId);
                }
                with_length_octet(buf, tlv_type::SEQNO_REQUEST, |buf| {
                    let (ae, octets, start, end) = prefix_wire_octets(s.prefix, 0);
                    buf.put_u8(ae as u8);
                    buf.put_u8(s.prefix.prefix());
                    buf.put_u16(s.seqno);
                    buf.put_u8(s.hop_count);
                    buf.put_u8(0); // reserved
                    buf.put_slice(s.router_id.as_bytes());
                    buf.put_slice(&octets[start..end]);
                    if let Some(sp) = s.source_prefix {
                        put_source_prefix(buf, sp)?;
                    }
                    Ok(())
                })
            }
            Value::Mac(m) => with_length_octet(buf, tlv_type::MAC, |buf| {
                buf.put_slice(m);
                Ok(())
            }),
        }
    }

    /// Wire octet range of an Update's prefix under the current compression
    /// state: the address encoding and the `start..end` range of the address
    /// octets actually written, where `start` equals the omitted count.
    fn update_prefix_octets(&self, u: &Update) -> (AddressEncoding, usize, usize) {
        let ae = address_encoding(u.prefix.ip());
        match ae {
            AddressEncoding::Wildcard => (ae, 0, 0),
            AddressEncoding::Ipv6LinkLocal => (ae, 8, 16),
            _ => {
                let pbytes = plen_octets(u.prefix.prefix());
                let omitted = match self.default_prefix[ae as usize] {
                    Some(dp) => shared_octets(u.prefix.ip(), dp).min(pbytes),
                    None => 0,
                };
                (ae, omitted, pbytes)
            }
        }
    }

    /// Advances the encoder state as `append_value` would, without writing.
    /// Used to pre-compute whole-packet lengths.
    fn advance_encode_state(&mut self, v: &Value) {
        match v {
            Value::RouterId(r) => self.router_id = r.router_id,
            Value::NextHop(n) => {
                if let Some(af) = address_family(address_encoding(n.next_hop)) {
                    self.next_hop[af_index(af)] = Some(n.next_hop);
                }
            }
            Value::Update(u) => {
                if u.flags & FLAG_UPDATE_ROUTER_ID != 0 {
                    self.router_id = RouterId::from_address(u.prefix.ip());
                }
                if u.flags & FLAG_UPDATE_PREFIX != 0 {
                    let ae = address_encoding(u.prefix.ip());
                    self.default_prefix[ae as usize] = Some(u.prefix.ip());
                }
            }
            _ => {}
        }
    }

    /// Total encoded length of a packet, header included.
    pub fn packet_length(&self, pkt: &Packet) -> usize {
        let mut sim = Parser::new();
        let mut len = HEADER_LEN;
        for v in pkt.body.iter().chain(pkt.trailer.iter()) {
            len += sim.value_length(v);
            sim.advance_encode_state(v);
        }
        len
    }

    /// Starts a new packet: resets the encoder state and writes the header
    /// with a body-length placeholder.
    pub fn begin_packet(&mut self, buf: &mut BytesMut) {
        self.reset();
        buf.put_u8(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u16(0); // placeholder: body length
    }

    /// Patches the body length into the header written by
    /// [`Parser::begin_packet`]. Must be called before any trailer values
    /// are appended.
    pub fn finish_packet(&self, buf: &mut BytesMut) {
        let body_len = (buf.len() - HEADER_LEN) as u16;
        buf[2..4].copy_from_slice(&body_len.to_be_bytes());
    }

    /// Encodes a whole packet.
    pub fn append_packet(&mut self, buf: &mut BytesMut, pkt: &Packet) -> Result<(), Error> {
        self.begin_packet(buf);
        for v in &pkt.body {
            self.append_value(buf, v)?;
        }
        self.finish_packet(buf);
        for v in &pkt.trailer {
            self.append_value(buf, v)?;
        }
        Ok(())
    }
}

/// Runs `f` over each sub-TLV in `b`. `f` returns whether it recognised the
/// type; unknown mandatory sub-TLVs fail the parent, other unknown sub-TLVs
/// are skipped silently.
fn sub_values(
    b: &mut &[u8],
    mut f: impl FnMut(u8, &mut &[u8]) -> Result<bool, Error>,
) -> Result<(), Error> {
    while !b.is_empty() {
        let typ = take_u8(b)?;
        if typ == sub_tlv_type::PAD1 {
            continue;
        }
        let len = take_u8(b)? as usize;
        let mut payload = take_slice(b, len)?;
        if typ == sub_tlv_type::PADN {
            continue;
        }
        if f(typ, &mut payload)? {
            if !payload.is_empty() {
                return Err(Error::TooLong);
            }
        } else if is_mandatory(typ) {
            return Err(Error::UnsupportedMandatory(typ));
        }
    }
    Ok(())
}

fn put_address(buf: &mut BytesMut, addr: IpAddr) {
    let (octets, _) = addr_octets(addr);
    match address_encoding(addr) {
        AddressEncoding::Wildcard => {}
        AddressEncoding::Ipv4 | AddressEncoding::Ipv4InIpv6 => buf.put_slice(&octets[..4]),
        AddressEncoding::Ipv6 => buf.put_slice(&octets),
        AddressEncoding::Ipv6LinkLocal => buf.put_slice(&octets[8..16]),
    }
}

/// Uncompressed wire octets of a prefix: the encoding plus the octet range
/// of the address buffer to write.
fn prefix_wire_octets(prefix: IpNetwork, omitted: usize) -> (AddressEncoding, [u8; 16], usize, usize) {
    let (octets, _) = addr_octets(prefix.ip());
    let ae = address_encoding(prefix.ip());
    match ae {
        AddressEncoding::Wildcard => (ae, octets, 0, 0),
        AddressEncoding::Ipv6LinkLocal => (ae, octets, 8, 16),
        _ => (ae, octets, omitted, plen_octets(prefix.prefix())),
    }
}

// The source prefix reuses the parent TLV's address encoding, so the bytes
// written are always the leading plen octets of the address.
fn put_source_prefix(buf: &mut BytesMut, prefix: IpNetwork) -> Result<(), Error> {
    with_length_octet(buf, sub_tlv_type::SOURCE_PREFIX, |buf| {
        buf.put_u8(prefix.prefix());
        let (octets, _) = addr_octets(prefix.ip());
        buf.put_slice(&octets[..plen_octets(prefix.prefix())]);
        Ok(())
    })
}

/// The number of leading whole octets two addresses of the same family
/// share.
fn shared_octets(a: IpAddr, b: IpAddr) -> usize {
    let (ao, alen) = addr_octets(a);
    let (bo, blen) = addr_octets(b);
    if alen != blen {
        return 0;
    }
    ao[..alen]
        .iter()
        .zip(bo[..blen].iter())
        .take_while(|(x, y)| x == y)
        .count()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn rid(n: u64) -> RouterId {
        RouterId(n.to_be_bytes())
    }

    fn unspec() -> IpAddr {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }

    fn round_trip(v: Value) {
        let mut enc = Parser::new();
        let mut buf = BytesMut::new();
        enc.append_packet(&mut buf, &Packet { body: vec![v.clone()], trailer: vec![] })
            .unwrap();

        let expected_len = Parser::new().value_length(&v);
        assert_eq!(buf.len() - HEADER_LEN, expected_len, "value_length of {v:?}");

        let mut dec = Parser::new();
        let pkt = dec.packet(&buf).unwrap();
        assert_eq!(pkt.body, vec![v]);
        assert!(pkt.trailer.is_empty());
    }

    #[test]
    fn round_trip_padding() {
        round_trip(Value::Pad1);
        round_trip(Value::PadN { n: 111 });
    }

    #[test]
    fn round_trip_acknowledgments() {
        round_trip(Value::AcknowledgmentRequest(AcknowledgmentRequest {
            opaque: 0x1234,
            interval: Duration::from_secs(4),
        }));
        round_trip(Value::Acknowledgment(Acknowledgment { opaque: 0x1234 }));
    }

    #[test]
    fn round_trip_hello() {
        round_trip(Value::Hello(Hello {
            flags: FLAG_HELLO_UNICAST,
            seqno: 1233,
            interval: Duration::from_secs(33),
            timestamp: None,
        }));
        round_trip(Value::Hello(Hello {
            flags: 0,
            seqno: 42,
            interval: Duration::from_secs(4),
            timestamp: Some(HelloTimestamp { transmit: 532_235 }),
        }));
    }

    #[test]
    fn round_trip_ihu() {
        round_trip(Value::Ihu(Ihu {
            rx_cost: 0xabcd,
            interval: Duration::from_secs(2),
            address: "1.2.3.4".parse().unwrap(),
            timestamp: None,
        }));
        round_trip(Value::Ihu(Ihu {
            rx_cost: 96,
            interval: Duration::from_secs(12),
            address: "fe80::1234:5678:90ab:cdef".parse().unwrap(),
            timestamp: Some(IhuTimestamp { origin: 42_394_723, receive: 23_283_423 }),
        }));
    }

    #[test]
    fn round_trip_router_id_and_next_hop() {
        round_trip(Value::RouterId(RouterIdTlv { router_id: rid(0xabab_cdcd) }));
        round_trip(Value::NextHop(NextHop { next_hop: "fe80::1".parse().unwrap() }));
        round_trip(Value::NextHop(NextHop { next_hop: "1.2.3.4".parse().unwrap() }));
    }

    #[test]
    fn round_trip_update() {
        round_trip(Value::Update(Update {
            flags: 0,
            interval: Duration::from_secs(16),
            seqno: 1233,
            metric: 100,
            prefix: net("192.168.0.0/16"),
            router_id: RouterId::UNSPECIFIED,
            next_hop: unspec(),
            source_prefix: None,
        }));
        round_trip(Value::Update(Update {
            flags: 0,
            interval: Duration::from_secs(16),
            seqno: 7,
            metric: 0,
            prefix: net("2001:db8:1234::/48"),
            router_id: RouterId::UNSPECIFIED,
            next_hop: unspec(),
            source_prefix: Some(net("2001:db8::/32")),
        }));
    }

    #[test]
    fn round_trip_requests() {
        round_trip(Value::RouteRequest(RouteRequest {
            prefix: net("192.168.0.0/16"),
            source_prefix: None,
        }));
        round_trip(Value::RouteRequest(RouteRequest {
            prefix: net("2001:db8::/32"),
            source_prefix: Some(net("2001:db8:99::/48")),
        }));
        round_trip(Value::SeqnoRequest(SeqnoRequest {
            seqno: 1233,
            hop_count: 99,
            router_id: rid(0xabab_cdcd),
            prefix: net("192.168.0.0/16"),
            source_prefix: None,
        }));
    }

    #[test]
    fn update_resolves_router_id_and_next_hop_from_state() {
        let update = Update {
            flags: 0,
            interval: Duration::from_secs(16),
            seqno: 1,
            metric: 10,
            prefix: net("2001:db8::/32"),
            router_id: rid(0x1122),
            next_hop: "fe80::42".parse().unwrap(),
            source_prefix: None,
        };

        let mut enc = Parser::new();
        let mut buf = BytesMut::new();
        enc.append_packet(
            &mut buf,
            &Packet {
                body: vec![
                    Value::RouterId(RouterIdTlv { router_id: rid(0x1122) }),
                    Value::NextHop(NextHop { next_hop: "fe80::42".parse().unwrap() }),
                    Value::Update(update),
                ],
                trailer: vec![],
            },
        )
        .unwrap();

        let pkt = Parser::new().packet(&buf).unwrap();
        let Value::Update(u) = &pkt.body[2] else {
            panic!("expected update, got {:?}", pkt.body[2]);
        };
        assert_eq!(u.router_id, rid(0x1122));
        assert_eq!(u.next_hop, "fe80::42".parse::<IpAddr>().unwrap());
    }

    // Three updates in one packet where only the first carries the PREFIX
    // flag: the second and third compress against the first one's prefix.
    #[test]
    fn default_prefix_persists_across_updates() {
        let mk = |flags, prefix: &str| {
            Value::Update(Update {
                flags,
                interval: Duration::from_secs(16),
                seqno: 1,
                metric: 10,
                prefix: net(prefix),
                router_id: rid(0x7777),
                next_hop: unspec(),
                source_prefix: None,
            })
        };

        let mut enc = Parser::new();
        let mut buf = BytesMut::new();
        enc.append_packet(
            &mut buf,
            &Packet {
                body: vec![
                    Value::RouterId(RouterIdTlv { router_id: rid(0x7777) }),
                    mk(FLAG_UPDATE_PREFIX, "2001:db8:aaaa:1::/64"),
                    mk(0, "2001:db8:aaaa:2::/64"),
                    mk(0, "2001:db8:aaaa:3::/64"),
                ],
                trailer: vec![],
            },
        )
        .unwrap();

        let pkt = Parser::new().packet(&buf).unwrap();
        let prefixes: Vec<_> = pkt
            .body
            .iter()
            .filter_map(|v| match v {
                Value::Update(u) => Some(u.prefix),
                _ => None,
            })
            .collect();
        assert_eq!(
            prefixes,
            vec![
                net("2001:db8:aaaa:1::/64"),
                net("2001:db8:aaaa:2::/64"),
                net("2001:db8:aaaa:3::/64"),
            ]
        );
    }

    // The second update shares 7 leading octets with the first; only the
    // remainder goes on the wire.
    #[test]
    fn updates_compress_against_default_prefix() {
        let u1 = Value::Update(Update {
            flags: FLAG_UPDATE_PREFIX,
            interval: Duration::from_secs(16),
            seqno: 1,
            metric: 10,
            prefix: net("2001:db8:aaaa:1::/64"),
            router_id: RouterId::UNSPECIFIED,
            next_hop: unspec(),
            source_prefix: None,
        });
        let u2 = Value::Update(Update {
            flags: 0,
            interval: Duration::from_secs(16),
            seqno: 1,
            metric: 20,
            prefix: net("2001:db8:aaaa:2::/64"),
            router_id: RouterId::UNSPECIFIED,
            next_hop: unspec(),
            source_prefix: None,
        });

        let mut enc = Parser::new();
        let full = enc.value_length(&u1);
        let mut buf = BytesMut::new();
        enc.begin_packet(&mut buf);
        enc.append_value(&mut buf, &u1).unwrap();

        // 2001:0db8:aaaa:0001 vs 2001:0db8:aaaa:0002 share 7 octets.
        let compressed = enc.value_length(&u2);
        assert_eq!(full, VALUE_HEADER_LEN + 10 + 8);
        assert_eq!(compressed, VALUE_HEADER_LEN + 10 + 1);

        let before = buf.len();
        enc.append_value(&mut buf, &u2).unwrap();
        assert_eq!(buf.len() - before, compressed);
        enc.finish_packet(&mut buf);

        let pkt = Parser::new().packet(&buf).unwrap();
        let Value::Update(u) = &pkt.body[1] else {
            panic!("expected update");
        };
        assert_eq!(u.prefix, net("2001:db8:aaaa:2::/64"));
    }

    #[test]
    fn nonzero_omitted_without_default_prefix_fails() {
        // Hand-crafted update: AE 2, plen 64, omitted 7, one address octet.
        let mut buf = BytesMut::new();
        buf.put_slice(&[MAGIC, VERSION, 0, 13]);
        buf.put_slice(&[tlv_type::UPDATE, 11, 2, 0, 64, 7]);
        buf.put_u16(1600); // interval
        buf.put_u16(1); // seqno
        buf.put_u16(10); // metric
        buf.put_u8(0x02); // the single remaining prefix octet

        assert_eq!(
            Parser::new().packet(&buf).unwrap_err(),
            Error::MissingDefaultPrefix
        );
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        assert_eq!(
            Parser::new().packet(&[7, VERSION, 0, 0]).unwrap_err(),
            Error::InvalidMagic
        );
        assert_eq!(
            Parser::new().packet(&[MAGIC, 3, 0, 0]).unwrap_err(),
            Error::UnsupportedVersion(3)
        );
        assert_eq!(Parser::new().packet(&[MAGIC, VERSION, 0]).unwrap_err(), Error::TooShort);
        assert_eq!(
            Parser::new().packet(&[MAGIC, VERSION, 0, 4, 0]).unwrap_err(),
            Error::TooShort
        );
    }

    #[test]
    fn rejects_invalid_router_id() {
        let mut buf = BytesMut::new();
        let mut body = BytesMut::new();
        body.put_slice(&[tlv_type::ROUTER_ID, 10, 0, 0]);
        body.put_slice(&[0; 8]);
        buf.put_slice(&[MAGIC, VERSION]);
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);

        assert_eq!(Parser::new().packet(&buf).unwrap_err(), Error::InvalidRouterId);
    }

    #[test]
    fn excess_payload_is_too_long() {
        // An Acknowledgment with a 3-octet payload.
        let buf = [MAGIC, VERSION, 0, 5, tlv_type::ACKNOWLEDGMENT, 3, 0x12, 0x34, 0x00];
        assert_eq!(Parser::new().packet(&buf).unwrap_err(), Error::TooLong);
    }

    #[test]
    fn unknown_body_tlv_is_skipped() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[MAGIC, VERSION, 0, 9]);
        buf.put_slice(&[200, 3, 1, 2, 3]); // unknown type 200
        buf.put_slice(&[tlv_type::ACKNOWLEDGMENT, 2, 0x12, 0x34]);

        let pkt = Parser::new().packet(&buf).unwrap();
        assert_eq!(pkt.body, vec![Value::Acknowledgment(Acknowledgment { opaque: 0x1234 })]);
    }

    #[test]
    fn unknown_sub_tlv_is_skipped() {
        // Hello with an unknown, non-mandatory sub-TLV (type 9).
        let mut buf = BytesMut::new();
        buf.put_slice(&[MAGIC, VERSION, 0, 12]);
        buf.put_slice(&[tlv_type::HELLO, 10]);
        buf.put_u16(0); // flags
        buf.put_u16(77); // seqno
        buf.put_u16(400); // interval
        buf.put_slice(&[9, 2, 0xaa, 0xbb]);

        let pkt = Parser::new().packet(&buf).unwrap();
        assert_eq!(
            pkt.body,
            vec![Value::Hello(Hello {
                flags: 0,
                seqno: 77,
                interval: Duration::from_secs(4),
                timestamp: None,
            })]
        );
    }

    // A mandatory unknown sub-TLV discards the enclosing TLV; the rest of
    // the packet survives.
    #[test]
    fn mandatory_sub_tlv_drops_parent_only() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[MAGIC, VERSION, 0, 16]);
        buf.put_slice(&[tlv_type::HELLO, 10]);
        buf.put_u16(0);
        buf.put_u16(77);
        buf.put_u16(400);
        buf.put_slice(&[0x90, 2, 0xaa, 0xbb]); // unknown mandatory sub-TLV
        buf.put_slice(&[tlv_type::ACKNOWLEDGMENT, 2, 0x12, 0x34]);

        let pkt = Parser::new().packet(&buf).unwrap();
        assert_eq!(pkt.body, vec![Value::Acknowledgment(Acknowledgment { opaque: 0x1234 })]);
    }

    #[test]
    fn trailer_accepts_only_trailer_types() {
        // Body: empty. Trailer: a MAC TLV.
        let mut buf = BytesMut::new();
        buf.put_slice(&[MAGIC, VERSION, 0, 0]);
        buf.put_slice(&[tlv_type::MAC, 4, 1, 2, 3, 4]);

        let pkt = Parser::new().packet(&buf).unwrap();
        assert!(pkt.body.is_empty());
        assert_eq!(pkt.trailer, vec![Value::Mac(Bytes::from_static(&[1, 2, 3, 4]))]);

        // An Acknowledgment in the trailer is rejected.
        let mut buf = BytesMut::new();
        buf.put_slice(&[MAGIC, VERSION, 0, 0]);
        buf.put_slice(&[tlv_type::ACKNOWLEDGMENT, 2, 0x12, 0x34]);
        assert_eq!(
            Parser::new().packet(&buf).unwrap_err(),
            Error::InvalidValueForTrailer(tlv_type::ACKNOWLEDGMENT)
        );
    }

    #[test]
    fn prefix_low_bits_are_cleared() {
        // plen 15 with a second octet carrying bits beyond the prefix.
        let mut buf = BytesMut::new();
        buf.put_slice(&[MAGIC, VERSION, 0, 14]);
        buf.put_slice(&[tlv_type::UPDATE, 12, 1, 0, 15, 0]);
        buf.put_u16(1600);
        buf.put_u16(1);
        buf.put_u16(10);
        buf.put_slice(&[192, 0xff]);

        let pkt = Parser::new().packet(&buf).unwrap();
        let Value::Update(u) = &pkt.body[0] else { panic!("expected update") };
        assert_eq!(u.prefix, net("192.254.0.0/15"));
    }

    #[test]
    fn packet_length_matches_encoding() {
        let pkt = Packet {
            body: vec![
                Value::RouterId(RouterIdTlv { router_id: rid(42) }),
                Value::Update(Update {
                    flags: FLAG_UPDATE_PREFIX,
                    interval: Duration::from_secs(16),
                    seqno: 9,
                    metric: 77,
                    prefix: net("2001:db8:aaaa:1::/64"),
                    router_id: rid(42),
                    next_hop: unspec(),
                    source_prefix: None,
                }),
                Value::Update(Update {
                    flags: 0,
                    interval: Duration::from_secs(16),
                    seqno: 9,
                    metric: 78,
                    prefix: net("2001:db8:aaaa:2::/64"),
                    router_id: rid(42),
                    next_hop: unspec(),
                    source_prefix: None,
                }),
            ],
            trailer: vec![Value::PadN { n: 3 }],
        };

        let mut enc = Parser::new();
        let mut buf = BytesMut::new();
        enc.append_packet(&mut buf, &pkt).unwrap();
        assert_eq!(buf.len(), Parser::new().packet_length(&pkt));
    }
}
