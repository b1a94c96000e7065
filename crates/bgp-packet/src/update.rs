use bytes::BytesMut;
use fixedbuf::WireBuf;
use ipnet::Ipv4Net;
use itertools::Itertools;

use crate::attrs::PathAttributes;
use crate::error::{update_error, CorruptMessage};
use crate::header::{Header, MessageType, HEADER_LEN, MAX_MESSAGE_LEN};
use crate::nlri::{decode_ipv4_prefix, decode_ipv4_prefixes, encode_ipv4_prefix, encoded_ipv4_prefix_len};
use crate::wire::{read_bytes, read_u16};

/// Per-session facts the codec needs: negotiated capabilities and the
/// relationship that decides which attributes are mandatory.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub four_octet_as: bool,
    pub ibgp: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { four_octet_as: true, ibgp: false }
    }
}

/// One UPDATE message: withdrawals, a path-attribute bundle, and the
/// IPv4-unicast prefixes the bundle announces. Other families ride inside
/// the MP_REACH/MP_UNREACH attributes of the same bundle.
#[derive(Debug, Clone, Default)]
pub struct UpdatePacket {
    pub withdrawn: Vec<Ipv4Net>,
    pub attrs: PathAttributes,
    pub nlri: Vec<Ipv4Net>,
}

/// Equality is semantic, not wire-positional: prefix lists compare as
/// multisets and the attribute bundle is already canonical by construction.
impl PartialEq for UpdatePacket {
    fn eq(&self, other: &Self) -> bool {
        fn sorted(nets: &[Ipv4Net]) -> Vec<Ipv4Net> {
            nets.iter().copied().sorted().collect()
        }
        sorted(&self.withdrawn) == sorted(&other.withdrawn)
            && sorted(&self.nlri) == sorted(&other.nlri)
            && self.attrs == other.attrs
    }
}

impl Eq for UpdatePacket {}

impl UpdatePacket {
    /// Parses the body of an UPDATE (everything after the 19-byte header,
    /// which [`crate::message::BgpMessage::decode`] has already verified).
    pub fn decode_body(input: &[u8], cfg: &SessionConfig) -> Result<Self, CorruptMessage> {
        let malformed = || CorruptMessage::update(update_error::MALFORMED_ATTRIBUTE_LIST, Vec::new());

        let (input, withdrawn_len) = read_u16(input, malformed)?;
        if usize::from(withdrawn_len) + 2 > input.len() {
            return Err(malformed());
        }
        let (input, withdrawn_bytes) = read_bytes(input, usize::from(withdrawn_len), malformed)?;
        let withdrawn = decode_ipv4_prefixes(withdrawn_bytes)?;

        let (input, attrs_len) = read_u16(input, malformed)?;
        if usize::from(attrs_len) > input.len() {
            return Err(malformed());
        }
        let (input, attr_bytes) = read_bytes(input, usize::from(attrs_len), malformed)?;
        let attrs = PathAttributes::decode(attr_bytes, cfg)?;

        // Whatever remains is NLRI.
        let mut nlri = Vec::new();
        let mut rest = input;
        while !rest.is_empty() {
            let (r, net) = decode_ipv4_prefix(rest)?;
            nlri.push(net);
            rest = r;
        }

        if !nlri.is_empty() || attrs.mp_reach.is_some() {
            attrs.check_mandatory_for(cfg, !nlri.is_empty())?;
        }
        Ok(Self { withdrawn, attrs, nlri })
    }

    /// Encodes the complete frame, header included. Fails only when the
    /// message cannot fit in 4096 bytes; callers avoid that by checking
    /// [`UpdatePacket::big_enough`] while batching.
    pub fn encode(&self, cfg: &SessionConfig) -> Result<BytesMut, CorruptMessage> {
        let overflow = |_| CorruptMessage::update(update_error::MALFORMED_ATTRIBUTE_LIST, Vec::new());

        let mut body = WireBuf::new(MAX_MESSAGE_LEN - HEADER_LEN);
        let mut withdrawn_bytes = Vec::new();
        for net in &self.withdrawn {
            encode_ipv4_prefix(net, &mut withdrawn_bytes);
        }
        body.put_u16(withdrawn_bytes.len() as u16).map_err(overflow)?;
        body.put_slice(&withdrawn_bytes).map_err(overflow)?;

        let mut attr_bytes = Vec::new();
        if !self.nlri.is_empty() || !self.withdrawn.is_empty() || self.attrs != PathAttributes::default() {
            self.attrs.encode(cfg, &mut attr_bytes);
        }
        body.put_u16(attr_bytes.len() as u16).map_err(overflow)?;
        body.put_slice(&attr_bytes).map_err(overflow)?;

        for net in &self.nlri {
            let mut one = Vec::new();
            encode_ipv4_prefix(net, &mut one);
            body.put_slice(&one).map_err(overflow)?;
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        Header::new(MessageType::Update, (HEADER_LEN + body.len()) as u16).encode_into(&mut frame);
        frame.extend_from_slice(body.as_slice());
        Ok(frame)
    }

    pub fn encoded_len(&self, cfg: &SessionConfig) -> usize {
        let withdrawn: usize = self.withdrawn.iter().map(encoded_ipv4_prefix_len).sum();
        let nlri: usize = self.nlri.iter().map(encoded_ipv4_prefix_len).sum();
        let attrs = if self.nlri.is_empty() && self.withdrawn.is_empty() && self.attrs == PathAttributes::default() {
            0
        } else {
            self.attrs.encoded_len(cfg)
        };
        HEADER_LEN + 2 + withdrawn + 2 + attrs + nlri
    }

    /// True once the message is too close to the 4096-byte frame limit to
    /// safely take another prefix; the caller then sends this batch and
    /// starts a fresh one.
    pub fn big_enough(&self, cfg: &SessionConfig) -> bool {
        // A full-length IPv4 prefix costs 5 octets.
        self.encoded_len(cfg) + 5 > MAX_MESSAGE_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aspath::AsPath;
    use crate::attrs::Origin;
    use std::net::Ipv4Addr;

    fn cfg() -> SessionConfig {
        SessionConfig::default()
    }

    fn announce(nets: &[&str]) -> UpdatePacket {
        UpdatePacket {
            withdrawn: Vec::new(),
            attrs: PathAttributes {
                origin: Some(Origin::Igp),
                as_path: Some(AsPath::from_sequence(vec![65001])),
                next_hop: Some(Ipv4Addr::new(20, 20, 20, 1)),
                ..Default::default()
            },
            nlri: nets.iter().map(|s| s.parse().unwrap()).collect(),
        }
    }

    fn decode_frame(frame: &[u8], cfg: &SessionConfig) -> UpdatePacket {
        let (body, header) = Header::decode(frame).unwrap();
        assert_eq!(header.typ, MessageType::Update);
        UpdatePacket::decode_body(body, cfg).unwrap()
    }

    #[test]
    fn announce_round_trips() {
        let update = announce(&["10.10.10.0/24"]);
        let frame = update.encode(&cfg()).unwrap();
        assert_eq!(frame.len(), update.encoded_len(&cfg()));
        assert_eq!(decode_frame(&frame, &cfg()), update);
    }

    #[test]
    fn withdraw_only_round_trips() {
        let update = UpdatePacket {
            withdrawn: vec!["10.10.10.0/24".parse().unwrap()],
            ..Default::default()
        };
        let frame = update.encode(&cfg()).unwrap();
        assert_eq!(decode_frame(&frame, &cfg()), update);
    }

    #[test]
    fn equality_ignores_prefix_order() {
        let a = announce(&["10.0.0.0/24", "10.0.1.0/24"]);
        let b = announce(&["10.0.1.0/24", "10.0.0.0/24"]);
        assert_eq!(a, b);
    }

    #[test]
    fn nlri_without_mandatory_attributes_is_rejected() {
        let update = UpdatePacket {
            nlri: vec!["10.0.0.0/24".parse().unwrap()],
            ..Default::default()
        };
        let frame = update.encode(&cfg()).unwrap();
        let (body, _) = Header::decode(&frame).unwrap();
        let err = UpdatePacket::decode_body(body, &cfg()).unwrap_err();
        assert_eq!(err.subcode, update_error::MISSING_WELL_KNOWN_ATTRIBUTE);
    }

    #[test]
    fn withdrawn_length_overrunning_the_body_is_malformed() {
        // withdrawn_len claims 200 bytes but only a handful follow.
        let mut body = 200u16.to_be_bytes().to_vec();
        body.extend_from_slice(&[24, 10, 0, 0]);
        let err = UpdatePacket::decode_body(&body, &cfg()).unwrap_err();
        assert_eq!(err.subcode, update_error::MALFORMED_ATTRIBUTE_LIST);
    }

    #[test]
    fn big_enough_trips_before_the_frame_limit() {
        let mut update = announce(&[]);
        let mut third = 0u8;
        let mut fourth = 0u8;
        while !update.big_enough(&cfg()) {
            update.nlri.push(
                Ipv4Net::new(Ipv4Addr::new(10, 0, third, fourth), 32).unwrap(),
            );
            (third, fourth) = if fourth == 255 { (third + 1, 0) } else { (third, fourth + 1) };
        }
        assert!(update.encoded_len(&cfg()) <= MAX_MESSAGE_LEN);
        assert!(update.encode(&cfg()).is_ok());
        assert!(update.encoded_len(&cfg()) + 5 > MAX_MESSAGE_LEN);
    }
}
