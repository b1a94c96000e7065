use bytes::BytesMut;

use crate::error::{header_error, CorruptMessage};
use crate::header::{Header, MessageType, HEADER_LEN};
use crate::notification::NotificationPacket;
use crate::open::OpenPacket;
use crate::refresh::RouteRefreshPacket;
use crate::update::{SessionConfig, UpdatePacket};

/// Any BGP message, as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgpMessage {
    Open(Box<OpenPacket>),
    Update(Box<UpdatePacket>),
    Notification(NotificationPacket),
    Keepalive,
    RouteRefresh(RouteRefreshPacket),
}

impl BgpMessage {
    /// Decodes exactly one frame. `frame` must be the complete message, as
    /// delimited by [`Header::peek_length`]; a declared length disagreeing
    /// with what arrived is a header error, not a truncation.
    pub fn decode(frame: &[u8], cfg: &SessionConfig) -> Result<BgpMessage, CorruptMessage> {
        let (body, header) = Header::decode(frame)?;
        if header.length as usize != frame.len() {
            return Err(CorruptMessage::header(
                header_error::BAD_MESSAGE_LENGTH,
                header.length.to_be_bytes().to_vec(),
            ));
        }
        let bad_length = || {
            CorruptMessage::header(
                header_error::BAD_MESSAGE_LENGTH,
                header.length.to_be_bytes().to_vec(),
            )
        };
        match header.typ {
            MessageType::Open => {
                if frame.len() < HEADER_LEN + 10 {
                    return Err(bad_length());
                }
                Ok(BgpMessage::Open(Box::new(OpenPacket::decode_body(body)?)))
            }
            MessageType::Update => {
                if frame.len() < HEADER_LEN + 4 {
                    return Err(bad_length());
                }
                Ok(BgpMessage::Update(Box::new(UpdatePacket::decode_body(body, cfg)?)))
            }
            MessageType::Notification => {
                if frame.len() < HEADER_LEN + 2 {
                    return Err(bad_length());
                }
                Ok(BgpMessage::Notification(NotificationPacket::decode_body(body)?))
            }
            MessageType::Keepalive => {
                if frame.len() != HEADER_LEN {
                    return Err(bad_length());
                }
                Ok(BgpMessage::Keepalive)
            }
            MessageType::RouteRefresh => {
                if frame.len() != HEADER_LEN + 4 {
                    return Err(bad_length());
                }
                Ok(BgpMessage::RouteRefresh(RouteRefreshPacket::decode_body(body)?))
            }
        }
    }
}

/// The 19-byte KEEPALIVE frame.
pub fn encode_keepalive() -> BytesMut {
    let mut frame = BytesMut::with_capacity(HEADER_LEN);
    Header::new(MessageType::Keepalive, HEADER_LEN as u16).encode_into(&mut frame);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MARKER;

    #[test]
    fn keepalive_frame_decodes_to_keepalive() {
        let frame = encode_keepalive();
        let msg = BgpMessage::decode(&frame, &SessionConfig::default()).unwrap();
        assert_eq!(msg, BgpMessage::Keepalive);
    }

    #[test]
    fn keepalive_with_a_body_is_a_length_error() {
        let mut frame = MARKER.to_vec();
        frame.extend_from_slice(&20u16.to_be_bytes());
        frame.push(4);
        frame.push(0);
        let err = BgpMessage::decode(&frame, &SessionConfig::default()).unwrap_err();
        assert_eq!(err.subcode, header_error::BAD_MESSAGE_LENGTH);
    }

    #[test]
    fn declared_length_disagreeing_with_the_frame_is_rejected() {
        let mut frame = encode_keepalive().to_vec();
        frame.push(0);
        let err = BgpMessage::decode(&frame, &SessionConfig::default()).unwrap_err();
        assert_eq!(err.subcode, header_error::BAD_MESSAGE_LENGTH);
    }
}
