//! NLRI prefix encoding: one length octet followed by the minimum number of
//! address octets that covers the prefix length (RFC 4271 §4.3).

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{update_error, CorruptMessage};
use crate::wire::{read_bytes, read_u8, WResult};

pub(crate) fn prefix_octets(plen: u8) -> usize {
    usize::from(plen.div_ceil(8))
}

fn invalid_network() -> CorruptMessage {
    CorruptMessage::update(update_error::INVALID_NETWORK_FIELD, Vec::new())
}

pub(crate) fn decode_ipv4_prefix(input: &[u8]) -> WResult<'_, Ipv4Net> {
    let (input, plen) = read_u8(input, invalid_network)?;
    if plen > 32 {
        return Err(invalid_network());
    }
    let (input, body) = read_bytes(input, prefix_octets(plen), invalid_network)?;
    let mut octets = [0u8; 4];
    octets[..body.len()].copy_from_slice(body);
    let net = Ipv4Net::new(Ipv4Addr::from(octets), plen).map_err(|_| invalid_network())?;
    // Host bits set past the prefix length make the field ambiguous.
    if net.addr() != net.network() {
        return Err(invalid_network());
    }
    Ok((input, net))
}

pub(crate) fn decode_ipv6_prefix(input: &[u8]) -> WResult<'_, Ipv6Net> {
    let (input, plen) = read_u8(input, invalid_network)?;
    if plen > 128 {
        return Err(invalid_network());
    }
    let (input, body) = read_bytes(input, prefix_octets(plen), invalid_network)?;
    let mut octets = [0u8; 16];
    octets[..body.len()].copy_from_slice(body);
    let net = Ipv6Net::new(Ipv6Addr::from(octets), plen).map_err(|_| invalid_network())?;
    if net.addr() != net.network() {
        return Err(invalid_network());
    }
    Ok((input, net))
}

/// Every prefix in `input`, which must be consumed exactly.
pub(crate) fn decode_ipv4_prefixes(mut input: &[u8]) -> Result<Vec<Ipv4Net>, CorruptMessage> {
    let mut nets = Vec::new();
    while !input.is_empty() {
        let (rest, net) = decode_ipv4_prefix(input)?;
        nets.push(net);
        input = rest;
    }
    Ok(nets)
}

pub(crate) fn decode_ipv6_prefixes(mut input: &[u8]) -> Result<Vec<Ipv6Net>, CorruptMessage> {
    let mut nets = Vec::new();
    while !input.is_empty() {
        let (rest, net) = decode_ipv6_prefix(input)?;
        nets.push(net);
        input = rest;
    }
    Ok(nets)
}

pub(crate) fn encoded_ipv4_prefix_len(net: &Ipv4Net) -> usize {
    1 + prefix_octets(net.prefix_len())
}

pub(crate) fn encode_ipv4_prefix(net: &Ipv4Net, out: &mut Vec<u8>) {
    out.push(net.prefix_len());
    let octets = net.network().octets();
    out.extend_from_slice(&octets[..prefix_octets(net.prefix_len())]);
}

pub(crate) fn encode_ipv6_prefix(net: &Ipv6Net, out: &mut Vec<u8>) {
    out.push(net.prefix_len());
    let octets = net.network().octets();
    out.extend_from_slice(&octets[..prefix_octets(net.prefix_len())]);
}

pub(crate) fn encode_ip_prefix(net: &IpNet, out: &mut Vec<u8>) {
    match net {
        IpNet::V4(v4) => encode_ipv4_prefix(v4, out),
        IpNet::V6(v6) => encode_ipv6_prefix(v6, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_prefix_round_trips_at_every_octet_boundary() {
        for s in ["0.0.0.0/0", "10.0.0.0/8", "10.10.0.0/12", "10.10.10.0/24", "10.10.10.1/32"] {
            let net: Ipv4Net = s.parse().unwrap();
            let mut wire = Vec::new();
            encode_ipv4_prefix(&net, &mut wire);
            let (rest, back) = decode_ipv4_prefix(&wire).unwrap();
            assert!(rest.is_empty());
            assert_eq!(back, net);
        }
    }

    #[test]
    fn overlong_prefix_length_is_invalid_network_field() {
        let err = decode_ipv4_prefix(&[33, 10, 0, 0, 0]).unwrap_err();
        assert_eq!(err.subcode, update_error::INVALID_NETWORK_FIELD);
    }

    #[test]
    fn host_bits_past_the_prefix_length_are_rejected() {
        // plen 4 with octet 0x0a sets bit 5; /4 only covers the top nibble.
        let err = decode_ipv4_prefix(&[4, 0x0a]).unwrap_err();
        assert_eq!(err.subcode, update_error::INVALID_NETWORK_FIELD);
    }

    #[test]
    fn back_to_back_prefixes_parse_to_the_end() {
        let nets = decode_ipv4_prefixes(&[8, 10, 24, 10, 0, 1]).unwrap();
        assert_eq!(nets, vec!["10.0.0.0/8".parse().unwrap(), "10.0.1.0/24".parse().unwrap()]);
    }

    #[test]
    fn v6_prefix_round_trips() {
        let net: Ipv6Net = "2001:db8::/32".parse().unwrap();
        let mut wire = Vec::new();
        encode_ipv6_prefix(&net, &mut wire);
        let (rest, back) = decode_ipv6_prefix(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(back, net);
    }
}
