use bytes::BytesMut;

use crate::afi::{Afi, AfiSafi, Safi};
use crate::error::{CorruptMessage, NotifyCode};
use crate::header::{Header, MessageType, HEADER_LEN};
use crate::wire::{read_u16, read_u8};

/// ROUTE-REFRESH (RFC 2918): asks the peer to resend one family's routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRefreshPacket {
    pub afi_safi: AfiSafi,
}

impl RouteRefreshPacket {
    pub fn new(afi_safi: AfiSafi) -> Self {
        Self { afi_safi }
    }

    pub fn decode_body(input: &[u8]) -> Result<Self, CorruptMessage> {
        let bad = || CorruptMessage::new(NotifyCode::RouteRefreshError, 1, Vec::new());
        let (input, afi) = read_u16(input, bad)?;
        let (input, _reserved) = read_u8(input, bad)?;
        let (_, safi) = read_u8(input, bad)?;
        let afi = Afi::try_from(afi).map_err(|_| bad())?;
        let safi = Safi::try_from(safi).map_err(|_| bad())?;
        Ok(Self { afi_safi: AfiSafi::new(afi, safi) })
    }

    pub fn encode(&self) -> BytesMut {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + 4);
        Header::new(MessageType::RouteRefresh, (HEADER_LEN + 4) as u16).encode_into(&mut frame);
        frame.extend_from_slice(&u16::from(self.afi_safi.afi).to_be_bytes());
        frame.extend_from_slice(&[0, self.afi_safi.safi.into()]);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    #[test]
    fn refresh_round_trips() {
        let packet = RouteRefreshPacket::new(AfiSafi::IPV6_UNICAST);
        let frame = packet.encode();
        let (body, header) = Header::decode(&frame).unwrap();
        assert_eq!(header.typ, MessageType::RouteRefresh);
        assert_eq!(RouteRefreshPacket::decode_body(body).unwrap(), packet);
    }
}
