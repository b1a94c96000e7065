use std::net::Ipv4Addr;

use bytes::BytesMut;

use crate::afi::{Afi, AfiSafi, Safi};
use crate::aspath::AS_TRANS;
use crate::error::{open_error, CorruptMessage};
use crate::header::{Header, MessageType, HEADER_LEN};
use crate::wire::{read_bytes, read_u16, read_u32, read_u8};

pub const BGP_VERSION: u8 = 4;

mod cap_code {
    pub const MULTI_PROTOCOL: u8 = 1;
    pub const ROUTE_REFRESH: u8 = 2;
    pub const GRACEFUL_RESTART: u8 = 64;
    pub const FOUR_OCTET_AS: u8 = 65;
}

/// One capability advertised in an OPEN's optional parameters (RFC 5492).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    MultiProtocol(AfiSafi),
    RouteRefresh,
    GracefulRestart {
        restarting: bool,
        restart_time: u16,
        /// Families whose forwarding state was preserved across restart.
        preserved: Vec<(AfiSafi, bool)>,
    },
    FourOctetAs(u32),
    /// Advertised by the peer, not understood here; never an error.
    Unknown { code: u8, data: Vec<u8> },
}

impl Capability {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Capability::MultiProtocol(fam) => {
                out.push(cap_code::MULTI_PROTOCOL);
                out.push(4);
                out.extend_from_slice(&u16::from(fam.afi).to_be_bytes());
                out.push(0);
                out.push(fam.safi.into());
            }
            Capability::RouteRefresh => {
                out.push(cap_code::ROUTE_REFRESH);
                out.push(0);
            }
            Capability::GracefulRestart { restarting, restart_time, preserved } => {
                out.push(cap_code::GRACEFUL_RESTART);
                out.push(2 + 4 * preserved.len() as u8);
                let flags = if *restarting { 0x8000 } else { 0 };
                out.extend_from_slice(&(flags | (restart_time & 0x0fff)).to_be_bytes());
                for (fam, kept) in preserved {
                    out.extend_from_slice(&u16::from(fam.afi).to_be_bytes());
                    out.push(fam.safi.into());
                    out.push(if *kept { 0x80 } else { 0 });
                }
            }
            Capability::FourOctetAs(asn) => {
                out.push(cap_code::FOUR_OCTET_AS);
                out.push(4);
                out.extend_from_slice(&asn.to_be_bytes());
            }
            Capability::Unknown { code, data } => {
                out.push(*code);
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
        }
    }

    fn decode(code: u8, body: &[u8]) -> Result<Capability, CorruptMessage> {
        let bad = || CorruptMessage::open(open_error::UNSUPPORTED_OPTIONAL_PARAMETER, Vec::new());
        Ok(match code {
            cap_code::MULTI_PROTOCOL => {
                if body.len() != 4 {
                    return Err(bad());
                }
                let afi = Afi::try_from(u16::from_be_bytes([body[0], body[1]])).map_err(|_| bad())?;
                let safi = Safi::try_from(body[3]).map_err(|_| bad())?;
                Capability::MultiProtocol(AfiSafi::new(afi, safi))
            }
            cap_code::ROUTE_REFRESH => Capability::RouteRefresh,
            cap_code::GRACEFUL_RESTART => {
                if body.len() < 2 || (body.len() - 2) % 4 != 0 {
                    return Err(bad());
                }
                let word = u16::from_be_bytes([body[0], body[1]]);
                let mut preserved = Vec::new();
                for chunk in body[2..].chunks_exact(4) {
                    let afi = Afi::try_from(u16::from_be_bytes([chunk[0], chunk[1]]));
                    let safi = Safi::try_from(chunk[2]);
                    if let (Ok(afi), Ok(safi)) = (afi, safi) {
                        preserved.push((AfiSafi::new(afi, safi), chunk[3] & 0x80 != 0));
                    }
                }
                Capability::GracefulRestart {
                    restarting: word & 0x8000 != 0,
                    restart_time: word & 0x0fff,
                    preserved,
                }
            }
            cap_code::FOUR_OCTET_AS => {
                if body.len() != 4 {
                    return Err(bad());
                }
                Capability::FourOctetAs(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
            }
            _ => Capability::Unknown { code, data: body.to_vec() },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPacket {
    pub version: u8,
    /// 2-octet AS field; AS_TRANS when the true ASN needs four octets.
    pub asn: u16,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
    pub caps: Vec<Capability>,
}

impl OpenPacket {
    pub fn new(local_as: u32, hold_time: u16, router_id: Ipv4Addr, caps: Vec<Capability>) -> Self {
        let asn = u16::try_from(local_as).unwrap_or(AS_TRANS as u16);
        Self { version: BGP_VERSION, asn, hold_time, router_id, caps }
    }

    /// The peer's true ASN: the four-octet capability value when present,
    /// the 2-octet header field otherwise.
    pub fn negotiated_as(&self) -> u32 {
        self.four_octet_as().unwrap_or(u32::from(self.asn))
    }

    pub fn four_octet_as(&self) -> Option<u32> {
        self.caps.iter().find_map(|c| match c {
            Capability::FourOctetAs(asn) => Some(*asn),
            _ => None,
        })
    }

    pub fn supports_route_refresh(&self) -> bool {
        self.caps.iter().any(|c| matches!(c, Capability::RouteRefresh))
    }

    pub fn multiprotocol(&self) -> impl Iterator<Item = AfiSafi> + '_ {
        self.caps.iter().filter_map(|c| match c {
            Capability::MultiProtocol(fam) => Some(*fam),
            _ => None,
        })
    }

    pub fn decode_body(input: &[u8]) -> Result<Self, CorruptMessage> {
        let (input, version) = read_u8(input, CorruptMessage::truncated)?;
        if version != BGP_VERSION {
            // Echo the highest version we do support, per RFC 4271 §6.2.
            return Err(CorruptMessage::open(
                open_error::UNSUPPORTED_VERSION_NUMBER,
                vec![0, BGP_VERSION],
            ));
        }
        let (input, asn) = read_u16(input, CorruptMessage::truncated)?;
        let (input, hold_time) = read_u16(input, CorruptMessage::truncated)?;
        if hold_time == 1 || hold_time == 2 {
            return Err(CorruptMessage::open(open_error::UNACCEPTABLE_HOLD_TIME, Vec::new()));
        }
        let (input, id) = read_u32(input, CorruptMessage::truncated)?;
        let router_id = Ipv4Addr::from(id);
        if router_id.is_unspecified() {
            return Err(CorruptMessage::open(open_error::BAD_BGP_IDENTIFIER, Vec::new()));
        }

        let (input, opt_len) = read_u8(input, CorruptMessage::truncated)?;
        let (_, mut params) = read_bytes(input, usize::from(opt_len), CorruptMessage::truncated)?;
        let mut caps = Vec::new();
        while !params.is_empty() {
            let (rest, param_type) = read_u8(params, CorruptMessage::truncated)?;
            let (rest, param_len) = read_u8(rest, CorruptMessage::truncated)?;
            let (rest, body) = read_bytes(rest, usize::from(param_len), CorruptMessage::truncated)?;
            params = rest;
            // Capabilities (type 2) are the only optional parameter left in
            // modern BGP; authentication (type 1) is long deprecated.
            if param_type != 2 {
                return Err(CorruptMessage::open(
                    open_error::UNSUPPORTED_OPTIONAL_PARAMETER,
                    vec![param_type],
                ));
            }
            let mut inner = body;
            while !inner.is_empty() {
                let (rest, code) = read_u8(inner, CorruptMessage::truncated)?;
                let (rest, len) = read_u8(rest, CorruptMessage::truncated)?;
                let (rest, cap_body) = read_bytes(rest, usize::from(len), CorruptMessage::truncated)?;
                inner = rest;
                caps.push(Capability::decode(code, cap_body)?);
            }
        }
        Ok(Self { version, asn, hold_time, router_id, caps })
    }

    pub fn encode(&self) -> BytesMut {
        let mut caps = Vec::new();
        for cap in &self.caps {
            cap.encode(&mut caps);
        }
        let mut params = Vec::new();
        if !caps.is_empty() {
            params.push(2u8);
            params.push(caps.len() as u8);
            params.extend_from_slice(&caps);
        }

        let body_len = 10 + params.len();
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body_len);
        Header::new(MessageType::Open, (HEADER_LEN + body_len) as u16).encode_into(&mut frame);
        frame.extend_from_slice(&[self.version]);
        frame.extend_from_slice(&self.asn.to_be_bytes());
        frame.extend_from_slice(&self.hold_time.to_be_bytes());
        frame.extend_from_slice(&self.router_id.octets());
        frame.extend_from_slice(&[params.len() as u8]);
        frame.extend_from_slice(&params);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    fn sample() -> OpenPacket {
        OpenPacket::new(
            4_200_000_000,
            90,
            Ipv4Addr::new(1, 1, 1, 1),
            vec![
                Capability::MultiProtocol(AfiSafi::IPV4_UNICAST),
                Capability::RouteRefresh,
                Capability::GracefulRestart {
                    restarting: false,
                    restart_time: 120,
                    preserved: vec![(AfiSafi::IPV4_UNICAST, true)],
                },
                Capability::FourOctetAs(4_200_000_000),
            ],
        )
    }

    #[test]
    fn open_with_every_capability_round_trips() {
        let open = sample();
        let frame = open.encode();
        let (body, header) = Header::decode(&frame).unwrap();
        assert_eq!(header.length as usize, frame.len());
        let back = OpenPacket::decode_body(body).unwrap();
        assert_eq!(back, open);
        assert_eq!(back.negotiated_as(), 4_200_000_000);
        assert_eq!(back.asn, AS_TRANS as u16);
        assert!(back.supports_route_refresh());
    }

    #[test]
    fn version_five_is_rejected_with_supported_version_echoed() {
        let mut frame = sample().encode();
        frame[HEADER_LEN] = 5;
        let (body, _) = Header::decode(&frame).unwrap();
        let err = OpenPacket::decode_body(body).unwrap_err();
        assert_eq!(err.subcode, open_error::UNSUPPORTED_VERSION_NUMBER);
        assert_eq!(err.data, vec![0, 4]);
    }

    #[test]
    fn zero_router_id_is_a_bad_identifier() {
        let mut open = sample();
        open.router_id = Ipv4Addr::UNSPECIFIED;
        let frame = open.encode();
        let (body, _) = Header::decode(&frame).unwrap();
        let err = OpenPacket::decode_body(body).unwrap_err();
        assert_eq!(err.subcode, open_error::BAD_BGP_IDENTIFIER);
    }

    #[test]
    fn hold_time_below_three_is_unacceptable() {
        let mut open = sample();
        open.hold_time = 2;
        let frame = open.encode();
        let (body, _) = Header::decode(&frame).unwrap();
        let err = OpenPacket::decode_body(body).unwrap_err();
        assert_eq!(err.subcode, open_error::UNACCEPTABLE_HOLD_TIME);
    }

    #[test]
    fn unknown_capability_is_carried_not_rejected() {
        let mut open = sample();
        open.caps = vec![Capability::Unknown { code: 73, data: vec![1, 2] }];
        let frame = open.encode();
        let (body, _) = Header::decode(&frame).unwrap();
        let back = OpenPacket::decode_body(body).unwrap();
        assert_eq!(back.caps, open.caps);
    }
}
