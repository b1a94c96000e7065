use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{header_error, CorruptMessage};
use crate::wire::{read_bytes, read_u16, read_u8, WResult};

/// Fixed 19-byte message header: 16-byte marker, 2-byte length, 1-byte type.
pub const HEADER_LEN: usize = 19;

/// No BGP message, header included, may exceed this (RFC 4271 §4.1).
pub const MAX_MESSAGE_LEN: usize = 4096;

/// With no authentication in the marker (RFC 4271), all bits are ones.
pub const MARKER: [u8; 16] = [0xff; 16];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u16,
    pub typ: MessageType,
}

impl Header {
    pub fn new(typ: MessageType, length: u16) -> Self {
        Self { length, typ }
    }

    /// The declared frame length, once enough bytes are buffered to read
    /// it; zero until then. Lets a stream reader decide whether a whole
    /// frame has arrived without attempting a parse.
    pub fn peek_length(input: &[u8]) -> usize {
        match input.get(16..18) {
            Some(len) => u16::from_be_bytes([len[0], len[1]]) as usize,
            None => 0,
        }
    }

    /// Validates marker, length bounds, and message type, in that order,
    /// since each later field is only meaningful if the earlier ones hold.
    pub fn decode(input: &[u8]) -> WResult<'_, Header> {
        let (input, marker) = read_bytes(input, 16, CorruptMessage::truncated)?;
        if marker != MARKER {
            return Err(CorruptMessage::header(
                header_error::CONNECTION_NOT_SYNCHRONIZED,
                Vec::new(),
            ));
        }
        let (input, length) = read_u16(input, CorruptMessage::truncated)?;
        if (length as usize) < HEADER_LEN || (length as usize) > MAX_MESSAGE_LEN {
            return Err(CorruptMessage::header(
                header_error::BAD_MESSAGE_LENGTH,
                length.to_be_bytes().to_vec(),
            ));
        }
        let (input, typ) = read_u8(input, CorruptMessage::truncated)?;
        let typ = MessageType::try_from(typ)
            .map_err(|_| CorruptMessage::header(header_error::BAD_MESSAGE_TYPE, vec![typ]))?;
        Ok((input, Header { length, typ }))
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&MARKER);
        buf.put_u16(self.length);
        buf.put_u8(self.typ.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(length: u16, typ: u8) -> Vec<u8> {
        let mut v = MARKER.to_vec();
        v.extend_from_slice(&length.to_be_bytes());
        v.push(typ);
        v
    }

    #[test]
    fn keepalive_header_round_trips() {
        let mut buf = BytesMut::new();
        Header::new(MessageType::Keepalive, HEADER_LEN as u16).encode_into(&mut buf);
        let (rest, header) = Header::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(header.typ, MessageType::Keepalive);
        assert_eq!(header.length as usize, HEADER_LEN);
    }

    #[test]
    fn broken_marker_is_connection_not_synchronized() {
        let mut bytes = frame(19, 4);
        bytes[0] = 0;
        let err = Header::decode(&bytes).unwrap_err();
        assert_eq!(err.code, crate::error::NotifyCode::MsgHeaderError);
        assert_eq!(err.subcode, header_error::CONNECTION_NOT_SYNCHRONIZED);
    }

    #[test]
    fn length_past_4096_is_rejected_with_the_length_echoed() {
        let bytes = frame(4097, 2);
        let err = Header::decode(&bytes).unwrap_err();
        assert_eq!(err.subcode, header_error::BAD_MESSAGE_LENGTH);
        assert_eq!(err.data, 4097u16.to_be_bytes().to_vec());
    }

    #[test]
    fn max_length_frame_header_is_accepted() {
        let bytes = frame(4096, 2);
        assert!(Header::decode(&bytes).is_ok());
    }

    #[test]
    fn unknown_type_is_bad_message_type() {
        let bytes = frame(19, 9);
        let err = Header::decode(&bytes).unwrap_err();
        assert_eq!(err.subcode, header_error::BAD_MESSAGE_TYPE);
        assert_eq!(err.data, vec![9]);
    }
}
