use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;
use ipnet::IpNet;

use crate::afi::{Afi, AfiSafi, Safi};
use crate::aspath::AsPath;
use crate::error::{update_error, CorruptMessage};
use crate::nlri::{decode_ipv4_prefixes, decode_ipv6_prefixes, encode_ip_prefix};
use crate::update::SessionConfig;
use crate::wire::{read_bytes, read_u16, read_u8};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrFlags: u8 {
        const OPTIONAL = 0x80;
        const TRANSITIVE = 0x40;
        const PARTIAL = 0x20;
        const EXTENDED = 0x10;
    }
}

/// Attribute type codes, in the canonical (ascending) order attributes are
/// hashed, compared, and put on the wire in.
pub mod attr_type {
    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
    pub const MED: u8 = 4;
    pub const LOCAL_PREF: u8 = 5;
    pub const ATOMIC_AGGREGATE: u8 = 6;
    pub const AGGREGATOR: u8 = 7;
    pub const COMMUNITIES: u8 = 8;
    pub const ORIGINATOR_ID: u8 = 9;
    pub const CLUSTER_LIST: u8 = 10;
    pub const MP_REACH_NLRI: u8 = 14;
    pub const MP_UNREACH_NLRI: u8 = 15;
    pub const AS4_PATH: u8 = 17;
    pub const AS4_AGGREGATOR: u8 = 18;
}

/// The OPTIONAL/TRANSITIVE profile each recognized type must carry; the
/// PARTIAL and EXTENDED bits are excluded from the comparison.
fn required_flags(typ: u8) -> Option<AttrFlags> {
    use attr_type::*;
    match typ {
        ORIGIN | AS_PATH | NEXT_HOP | LOCAL_PREF | ATOMIC_AGGREGATE => Some(AttrFlags::TRANSITIVE),
        AGGREGATOR | COMMUNITIES | AS4_PATH | AS4_AGGREGATOR => {
            Some(AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE)
        }
        MED | ORIGINATOR_ID | CLUSTER_LIST | MP_REACH_NLRI | MP_UNREACH_NLRI => {
            Some(AttrFlags::OPTIONAL)
        }
        _ => None,
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Origin {
    #[default]
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Aggregator {
    pub asn: u32,
    pub addr: Ipv4Addr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Communities(pub Vec<u32>);

impl Communities {
    pub const NO_EXPORT: u32 = 0xffff_ff01;
    pub const NO_ADVERTISE: u32 = 0xffff_ff02;

    pub fn contains(&self, value: u32) -> bool {
        self.0.contains(&value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ClusterList(pub Vec<Ipv4Addr>);

/// MP_REACH_NLRI (RFC 4760): reachable prefixes for a non-IPv4-unicast
/// family, carrying their own next hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MpReachNlri {
    pub afi_safi: AfiSafi,
    pub next_hop: IpAddr,
    /// Second IPv6 next hop, present when the peer shares a link.
    pub link_local: Option<Ipv6Addr>,
    pub nlri: Vec<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MpUnreachNlri {
    pub afi_safi: AfiSafi,
    pub withdrawn: Vec<IpNet>,
}

/// An optional transitive attribute this implementation doesn't interpret,
/// carried through with the PARTIAL bit set (RFC 4271 §5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownAttr {
    pub typ: u8,
    pub data: Vec<u8>,
}

/// Every path attribute of one route, one field per recognized type.
///
/// Field order is canonical (type-code) order; `encode` walks the fields
/// top to bottom, so equal attribute bundles are always wire-equal too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PathAttributes {
    pub origin: Option<Origin>,
    pub as_path: Option<AsPath>,
    pub next_hop: Option<Ipv4Addr>,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<Aggregator>,
    pub communities: Option<Communities>,
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Option<ClusterList>,
    pub mp_reach: Option<MpReachNlri>,
    pub mp_unreach: Option<MpUnreachNlri>,
    /// Uninterpreted optional transitive attributes, kept sorted by type.
    pub unknown: Vec<UnknownAttr>,
}

fn attr_len_error(tlv: &[u8]) -> CorruptMessage {
    CorruptMessage::update(update_error::ATTRIBUTE_LENGTH_ERROR, tlv.to_vec())
}

fn exact_len(body: &[u8], want: usize, tlv: &[u8]) -> Result<(), CorruptMessage> {
    if body.len() != want {
        return Err(attr_len_error(tlv));
    }
    Ok(())
}

fn be32_at(body: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]])
}

impl PathAttributes {
    /// Parses the complete path-attribute block of an UPDATE. Flag-bit
    /// profiles, lengths, duplicates, and per-type semantics are all
    /// verified here; what the caller still owes is the
    /// mandatory-presence check, which depends on whether NLRI follows.
    pub fn decode(mut input: &[u8], cfg: &SessionConfig) -> Result<Self, CorruptMessage> {
        let mut attrs = PathAttributes::default();
        let mut seen = [false; 256];
        let mut as4_path: Option<AsPath> = None;
        let mut as4_aggregator: Option<Aggregator> = None;

        while !input.is_empty() {
            let tlv_start = input;
            let (rest, flag_bits) = read_u8(input, CorruptMessage::truncated)?;
            let flags = AttrFlags::from_bits_retain(flag_bits);
            let (rest, typ) = read_u8(rest, CorruptMessage::truncated)?;
            let (rest, len) = if flags.contains(AttrFlags::EXTENDED) {
                let (r, l) = read_u16(rest, CorruptMessage::truncated)?;
                (r, usize::from(l))
            } else {
                let (r, l) = read_u8(rest, CorruptMessage::truncated)?;
                (r, usize::from(l))
            };
            if len > rest.len() {
                return Err(attr_len_error(tlv_start));
            }
            let (rest, body) = read_bytes(rest, len, CorruptMessage::truncated)?;
            let tlv = &tlv_start[..tlv_start.len() - rest.len()];
            input = rest;

            if let Some(required) = required_flags(typ) {
                let relevant = flags & (AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE);
                if relevant != required {
                    return Err(CorruptMessage::update(
                        update_error::ATTRIBUTE_FLAGS_ERROR,
                        tlv.to_vec(),
                    ));
                }
            } else if !flags.contains(AttrFlags::OPTIONAL) {
                return Err(CorruptMessage::update(
                    update_error::UNRECOGNIZED_WELL_KNOWN_ATTRIBUTE,
                    tlv.to_vec(),
                ));
            } else if flags.contains(AttrFlags::TRANSITIVE) {
                attrs.unknown.push(UnknownAttr { typ, data: body.to_vec() });
                continue;
            } else {
                // Unrecognized optional non-transitive: quietly ignored.
                continue;
            }

            if seen[usize::from(typ)] {
                return Err(CorruptMessage::update(
                    update_error::MALFORMED_ATTRIBUTE_LIST,
                    Vec::new(),
                ));
            }
            seen[usize::from(typ)] = true;

            use attr_type::*;
            match typ {
                ORIGIN => {
                    exact_len(body, 1, tlv)?;
                    attrs.origin = Some(match body[0] {
                        0 => Origin::Igp,
                        1 => Origin::Egp,
                        2 => Origin::Incomplete,
                        _ => {
                            return Err(CorruptMessage::update(
                                update_error::INVALID_ORIGIN_ATTRIBUTE,
                                tlv.to_vec(),
                            ));
                        }
                    });
                }
                AS_PATH => {
                    attrs.as_path = Some(AsPath::decode(body, cfg.four_octet_as)?);
                }
                NEXT_HOP => {
                    exact_len(body, 4, tlv)?;
                    let addr = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                    validate_next_hop(addr, cfg, tlv)?;
                    attrs.next_hop = Some(addr);
                }
                MED => {
                    exact_len(body, 4, tlv)?;
                    attrs.med = Some(be32_at(body, 0));
                }
                LOCAL_PREF => {
                    exact_len(body, 4, tlv)?;
                    attrs.local_pref = Some(be32_at(body, 0));
                }
                ATOMIC_AGGREGATE => {
                    exact_len(body, 0, tlv)?;
                    attrs.atomic_aggregate = true;
                }
                AGGREGATOR => {
                    let asn_width = if cfg.four_octet_as { 4 } else { 2 };
                    exact_len(body, asn_width + 4, tlv)?;
                    let asn = if cfg.four_octet_as {
                        be32_at(body, 0)
                    } else {
                        u32::from(u16::from_be_bytes([body[0], body[1]]))
                    };
                    let a = &body[asn_width..];
                    attrs.aggregator =
                        Some(Aggregator { asn, addr: Ipv4Addr::new(a[0], a[1], a[2], a[3]) });
                }
                COMMUNITIES => {
                    if body.len() % 4 != 0 {
                        return Err(attr_len_error(tlv));
                    }
                    let values = body.chunks_exact(4).map(|c| be32_at(c, 0)).collect();
                    attrs.communities = Some(Communities(values));
                }
                ORIGINATOR_ID => {
                    exact_len(body, 4, tlv)?;
                    attrs.originator_id = Some(Ipv4Addr::new(body[0], body[1], body[2], body[3]));
                }
                CLUSTER_LIST => {
                    if body.len() % 4 != 0 {
                        return Err(attr_len_error(tlv));
                    }
                    let ids = body
                        .chunks_exact(4)
                        .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                        .collect();
                    attrs.cluster_list = Some(ClusterList(ids));
                }
                MP_REACH_NLRI => {
                    attrs.mp_reach = Some(decode_mp_reach(body, tlv)?);
                }
                MP_UNREACH_NLRI => {
                    attrs.mp_unreach = Some(decode_mp_unreach(body, tlv)?);
                }
                AS4_PATH => {
                    // Meaningless on a session that already speaks 4-octet
                    // ASNs; RFC 6793 says discard it there.
                    if !cfg.four_octet_as {
                        as4_path = Some(AsPath::decode(body, true)?);
                    }
                }
                AS4_AGGREGATOR => {
                    exact_len(body, 8, tlv)?;
                    if !cfg.four_octet_as {
                        as4_aggregator = Some(Aggregator {
                            asn: be32_at(body, 0),
                            addr: Ipv4Addr::new(body[4], body[5], body[6], body[7]),
                        });
                    }
                }
                _ => unreachable!("typ was matched by required_flags"),
            }
        }

        if let Some(shadow) = as4_path {
            if let Some(path) = attrs.as_path.take() {
                attrs.as_path = Some(path.reconcile_with(shadow));
            }
        }
        if let Some(agg) = as4_aggregator {
            attrs.aggregator = Some(agg);
        }
        attrs.unknown.sort_by_key(|u| u.typ);
        Ok(attrs)
    }

    /// The well-known-mandatory presence rules that apply once an UPDATE
    /// announces something. `require_next_hop` is false for MP-only
    /// updates, whose next hop travels inside MP_REACH_NLRI instead.
    pub fn check_mandatory_for(
        &self,
        cfg: &SessionConfig,
        require_next_hop: bool,
    ) -> Result<(), CorruptMessage> {
        let missing = |typ: u8| {
            CorruptMessage::update(update_error::MISSING_WELL_KNOWN_ATTRIBUTE, vec![typ])
        };
        if self.origin.is_none() {
            return Err(missing(attr_type::ORIGIN));
        }
        if self.as_path.is_none() {
            return Err(missing(attr_type::AS_PATH));
        }
        if require_next_hop && self.next_hop.is_none() {
            return Err(missing(attr_type::NEXT_HOP));
        }
        if cfg.ibgp && self.local_pref.is_none() {
            return Err(missing(attr_type::LOCAL_PREF));
        }
        Ok(())
    }

    /// Encodes in canonical order. On a 2-octet session a path carrying
    /// wide ASNs additionally grows its AS4_PATH/AS4_AGGREGATOR shadows.
    pub fn encode(&self, cfg: &SessionConfig, out: &mut Vec<u8>) {
        use attr_type::*;
        if let Some(origin) = self.origin {
            emit(out, AttrFlags::TRANSITIVE, ORIGIN, &[origin as u8]);
        }
        if let Some(path) = &self.as_path {
            let mut body = Vec::new();
            path.encode(cfg.four_octet_as, &mut body);
            emit(out, AttrFlags::TRANSITIVE, AS_PATH, &body);
        }
        if let Some(nh) = self.next_hop {
            emit(out, AttrFlags::TRANSITIVE, NEXT_HOP, &nh.octets());
        }
        if let Some(med) = self.med {
            emit(out, AttrFlags::OPTIONAL, MED, &med.to_be_bytes());
        }
        if let Some(lp) = self.local_pref {
            emit(out, AttrFlags::TRANSITIVE, LOCAL_PREF, &lp.to_be_bytes());
        }
        if self.atomic_aggregate {
            emit(out, AttrFlags::TRANSITIVE, ATOMIC_AGGREGATE, &[]);
        }
        if let Some(agg) = &self.aggregator {
            let mut body = Vec::new();
            if cfg.four_octet_as {
                body.extend_from_slice(&agg.asn.to_be_bytes());
            } else {
                let narrow =
                    if agg.asn > u32::from(u16::MAX) { crate::aspath::AS_TRANS } else { agg.asn };
                body.extend_from_slice(&(narrow as u16).to_be_bytes());
            }
            body.extend_from_slice(&agg.addr.octets());
            emit(out, AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE, AGGREGATOR, &body);
        }
        if let Some(communities) = &self.communities {
            let mut body = Vec::new();
            for value in &communities.0 {
                body.extend_from_slice(&value.to_be_bytes());
            }
            emit(out, AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE, COMMUNITIES, &body);
        }
        if let Some(id) = self.originator_id {
            emit(out, AttrFlags::OPTIONAL, ORIGINATOR_ID, &id.octets());
        }
        if let Some(list) = &self.cluster_list {
            let mut body = Vec::new();
            for id in &list.0 {
                body.extend_from_slice(&id.octets());
            }
            emit(out, AttrFlags::OPTIONAL, CLUSTER_LIST, &body);
        }
        if let Some(reach) = &self.mp_reach {
            let mut body = Vec::new();
            encode_mp_reach(reach, &mut body);
            emit(out, AttrFlags::OPTIONAL, MP_REACH_NLRI, &body);
        }
        if let Some(unreach) = &self.mp_unreach {
            let mut body = Vec::new();
            encode_mp_unreach(unreach, &mut body);
            emit(out, AttrFlags::OPTIONAL, MP_UNREACH_NLRI, &body);
        }
        if !cfg.four_octet_as {
            if let Some(path) = &self.as_path {
                if path.has_wide_asn() {
                    let mut body = Vec::new();
                    path.encode(true, &mut body);
                    emit(out, AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE, AS4_PATH, &body);
                }
            }
            if let Some(agg) = &self.aggregator {
                if agg.asn > u32::from(u16::MAX) {
                    let mut body = agg.asn.to_be_bytes().to_vec();
                    body.extend_from_slice(&agg.addr.octets());
                    emit(out, AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE, AS4_AGGREGATOR, &body);
                }
            }
        }
        for u in &self.unknown {
            emit(out, AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE | AttrFlags::PARTIAL, u.typ, &u.data);
        }
    }

    pub fn encoded_len(&self, cfg: &SessionConfig) -> usize {
        let mut out = Vec::new();
        self.encode(cfg, &mut out);
        out.len()
    }
}

fn emit(out: &mut Vec<u8>, flags: AttrFlags, typ: u8, body: &[u8]) {
    let mut flags = flags;
    if body.len() > usize::from(u8::MAX) {
        flags |= AttrFlags::EXTENDED;
    }
    out.push(flags.bits());
    out.push(typ);
    if flags.contains(AttrFlags::EXTENDED) {
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    } else {
        out.push(body.len() as u8);
    }
    out.extend_from_slice(body);
}

fn validate_next_hop(addr: Ipv4Addr, cfg: &SessionConfig, tlv: &[u8]) -> Result<(), CorruptMessage> {
    let bad = addr.is_multicast()
        || addr.is_broadcast()
        || (addr.is_unspecified() && !cfg.ibgp);
    if bad {
        return Err(CorruptMessage::update(
            update_error::INVALID_NEXT_HOP_ATTRIBUTE,
            tlv.to_vec(),
        ));
    }
    Ok(())
}

fn mp_afi_safi(body: &[u8], tlv: &[u8]) -> Result<AfiSafi, CorruptMessage> {
    let bad = || CorruptMessage::update(update_error::OPTIONAL_ATTRIBUTE_ERROR, tlv.to_vec());
    let afi = Afi::try_from(u16::from_be_bytes([body[0], body[1]])).map_err(|_| bad())?;
    let safi = Safi::try_from(body[2]).map_err(|_| bad())?;
    Ok(AfiSafi::new(afi, safi))
}

fn decode_mp_reach(body: &[u8], tlv: &[u8]) -> Result<MpReachNlri, CorruptMessage> {
    if body.len() < 5 {
        return Err(attr_len_error(tlv));
    }
    let afi_safi = mp_afi_safi(body, tlv)?;
    let nh_len = usize::from(body[3]);
    let after_nh = 4 + nh_len;
    if body.len() < after_nh + 1 {
        return Err(attr_len_error(tlv));
    }
    let nh = &body[4..after_nh];
    let (next_hop, link_local): (IpAddr, Option<Ipv6Addr>) = match (afi_safi.afi, nh_len) {
        (Afi::Ip, 4) => {
            (IpAddr::V4(Ipv4Addr::new(nh[0], nh[1], nh[2], nh[3])), None)
        }
        (Afi::Ip6, 16) => (IpAddr::V6(ipv6_from(nh)), None),
        (Afi::Ip6, 32) => (IpAddr::V6(ipv6_from(&nh[..16])), Some(ipv6_from(&nh[16..]))),
        _ => return Err(attr_len_error(tlv)),
    };
    // One reserved octet sits between next hop and NLRI.
    let nlri_bytes = &body[after_nh + 1..];
    let nlri = match afi_safi.afi {
        Afi::Ip => decode_ipv4_prefixes(nlri_bytes)?.into_iter().map(IpNet::V4).collect(),
        Afi::Ip6 => decode_ipv6_prefixes(nlri_bytes)?.into_iter().map(IpNet::V6).collect(),
    };
    Ok(MpReachNlri { afi_safi, next_hop, link_local, nlri })
}

fn ipv6_from(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    Ipv6Addr::from(octets)
}

fn encode_mp_reach(reach: &MpReachNlri, out: &mut Vec<u8>) {
    out.extend_from_slice(&u16::from(reach.afi_safi.afi).to_be_bytes());
    out.push(reach.afi_safi.safi.into());
    match (reach.next_hop, reach.link_local) {
        (IpAddr::V4(v4), _) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        (IpAddr::V6(v6), None) => {
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
        (IpAddr::V6(v6), Some(ll)) => {
            out.push(32);
            out.extend_from_slice(&v6.octets());
            out.extend_from_slice(&ll.octets());
        }
    }
    out.push(0);
    for net in &reach.nlri {
        encode_ip_prefix(net, out);
    }
}

fn decode_mp_unreach(body: &[u8], tlv: &[u8]) -> Result<MpUnreachNlri, CorruptMessage> {
    if body.len() < 3 {
        return Err(attr_len_error(tlv));
    }
    let afi_safi = mp_afi_safi(body, tlv)?;
    let withdrawn = match afi_safi.afi {
        Afi::Ip => decode_ipv4_prefixes(&body[3..])?.into_iter().map(IpNet::V4).collect(),
        Afi::Ip6 => decode_ipv6_prefixes(&body[3..])?.into_iter().map(IpNet::V6).collect(),
    };
    Ok(MpUnreachNlri { afi_safi, withdrawn })
}

fn encode_mp_unreach(unreach: &MpUnreachNlri, out: &mut Vec<u8>) {
    out.extend_from_slice(&u16::from(unreach.afi_safi.afi).to_be_bytes());
    out.push(unreach.afi_safi.safi.into());
    for net in &unreach.withdrawn {
        encode_ip_prefix(net, out);
    }
}
