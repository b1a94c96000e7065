use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

/// Top-level error code carried in a NOTIFICATION message (RFC 4271 §4.5).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
pub enum NotifyCode {
    MsgHeaderError = 1,
    OpenMsgError = 2,
    UpdateMsgError = 3,
    HoldTimerExpired = 4,
    FsmError = 5,
    Cease = 6,
    RouteRefreshError = 7,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Message-header error subcodes.
pub mod header_error {
    pub const CONNECTION_NOT_SYNCHRONIZED: u8 = 1;
    pub const BAD_MESSAGE_LENGTH: u8 = 2;
    pub const BAD_MESSAGE_TYPE: u8 = 3;
}

/// OPEN message error subcodes.
pub mod open_error {
    pub const UNSUPPORTED_VERSION_NUMBER: u8 = 1;
    pub const BAD_PEER_AS: u8 = 2;
    pub const BAD_BGP_IDENTIFIER: u8 = 3;
    pub const UNSUPPORTED_OPTIONAL_PARAMETER: u8 = 4;
    pub const UNACCEPTABLE_HOLD_TIME: u8 = 6;
}

/// UPDATE message error subcodes.
pub mod update_error {
    pub const MALFORMED_ATTRIBUTE_LIST: u8 = 1;
    pub const UNRECOGNIZED_WELL_KNOWN_ATTRIBUTE: u8 = 2;
    pub const MISSING_WELL_KNOWN_ATTRIBUTE: u8 = 3;
    pub const ATTRIBUTE_FLAGS_ERROR: u8 = 4;
    pub const ATTRIBUTE_LENGTH_ERROR: u8 = 5;
    pub const INVALID_ORIGIN_ATTRIBUTE: u8 = 6;
    pub const INVALID_NEXT_HOP_ATTRIBUTE: u8 = 8;
    pub const OPTIONAL_ATTRIBUTE_ERROR: u8 = 9;
    pub const INVALID_NETWORK_FIELD: u8 = 10;
    pub const MALFORMED_AS_PATH: u8 = 11;
}

/// Cease subcodes (RFC 4486) actually emitted by this implementation.
pub mod cease {
    pub const CONNECTION_COLLISION_RESOLUTION: u8 = 7;
}

/// A wire or semantic defect found while decoding a BGP message.
///
/// Carries the exact code/subcode the session FSM must put into the
/// outgoing NOTIFICATION, plus the offending bytes to echo back per
/// RFC 4271 §6. Encoders reuse it for the one failure they can hit,
/// overrunning the 4096-byte frame limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("corrupt BGP message: code {code:?} subcode {subcode} ({} data bytes)", data.len())]
pub struct CorruptMessage {
    pub code: NotifyCode,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl CorruptMessage {
    pub fn new(code: NotifyCode, subcode: u8, data: Vec<u8>) -> Self {
        Self { code, subcode, data }
    }

    pub fn header(subcode: u8, data: Vec<u8>) -> Self {
        Self::new(NotifyCode::MsgHeaderError, subcode, data)
    }

    pub fn open(subcode: u8, data: Vec<u8>) -> Self {
        Self::new(NotifyCode::OpenMsgError, subcode, data)
    }

    pub fn update(subcode: u8, data: Vec<u8>) -> Self {
        Self::new(NotifyCode::UpdateMsgError, subcode, data)
    }

    /// Truncated input is always a length problem on the enclosing frame.
    pub fn truncated() -> Self {
        Self::header(header_error::BAD_MESSAGE_LENGTH, Vec::new())
    }
}

