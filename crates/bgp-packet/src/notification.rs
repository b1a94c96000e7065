use bytes::BytesMut;

use crate::error::{CorruptMessage, NotifyCode};
use crate::header::{Header, MessageType, HEADER_LEN};
use crate::wire::read_u8;

/// NOTIFICATION: the last message of a session, naming why it died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPacket {
    pub code: NotifyCode,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationPacket {
    pub fn new(code: NotifyCode, subcode: u8, data: Vec<u8>) -> Self {
        Self { code, subcode, data }
    }

    pub fn decode_body(input: &[u8]) -> Result<Self, CorruptMessage> {
        let (input, code) = read_u8(input, CorruptMessage::truncated)?;
        let (input, subcode) = read_u8(input, CorruptMessage::truncated)?;
        Ok(Self { code: NotifyCode::from(code), subcode, data: input.to_vec() })
    }

    pub fn encode(&self) -> BytesMut {
        let body_len = 2 + self.data.len();
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body_len);
        Header::new(MessageType::Notification, (HEADER_LEN + body_len) as u16)
            .encode_into(&mut frame);
        frame.extend_from_slice(&[self.code.into(), self.subcode]);
        frame.extend_from_slice(&self.data);
        frame
    }
}

/// A decode failure converts directly into the NOTIFICATION that reports it.
impl From<CorruptMessage> for NotificationPacket {
    fn from(err: CorruptMessage) -> Self {
        Self::new(err.code, err.subcode, err.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::update_error;
    use crate::header::Header;

    #[test]
    fn notification_round_trips_with_data() {
        let packet = NotificationPacket::new(
            NotifyCode::UpdateMsgError,
            update_error::MISSING_WELL_KNOWN_ATTRIBUTE,
            vec![1],
        );
        let frame = packet.encode();
        let (body, header) = Header::decode(&frame).unwrap();
        assert_eq!(header.typ, MessageType::Notification);
        assert_eq!(NotificationPacket::decode_body(body).unwrap(), packet);
    }

    #[test]
    fn corrupt_message_becomes_the_matching_notification() {
        let err = CorruptMessage::update(update_error::MALFORMED_AS_PATH, vec![0xaa]);
        let packet = NotificationPacket::from(err);
        assert_eq!(packet.code, NotifyCode::UpdateMsgError);
        assert_eq!(packet.subcode, update_error::MALFORMED_AS_PATH);
        assert_eq!(packet.data, vec![0xaa]);
    }
}
