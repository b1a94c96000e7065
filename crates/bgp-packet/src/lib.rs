//! BGP-4 wire codec.
//!
//! Framing (19-byte header, 4096-byte frame limit), the five message types
//! (OPEN, UPDATE, NOTIFICATION, KEEPALIVE, ROUTE-REFRESH), the path
//! attributes of an UPDATE with per-type flag and length validation, and
//! the capabilities this workspace negotiates (multiprotocol, four-octet
//! AS, route refresh, graceful restart). Every decode failure carries the
//! exact NOTIFICATION code/subcode the session layer must send back.

pub mod afi;
pub mod aspath;
pub mod attrs;
pub mod error;
pub mod header;
pub mod message;
pub mod notification;
pub mod open;
pub mod refresh;
pub mod update;

mod nlri;
mod wire;

pub use afi::{Afi, AfiSafi, Safi};
pub use aspath::{AsPath, AsSegment, SegmentKind, AS_TRANS};
pub use attrs::{
    attr_type, Aggregator, AttrFlags, ClusterList, Communities, MpReachNlri, MpUnreachNlri,
    Origin, PathAttributes, UnknownAttr,
};
pub use error::{cease, header_error, open_error, update_error, CorruptMessage, NotifyCode};
pub use header::{Header, MessageType, HEADER_LEN, MARKER, MAX_MESSAGE_LEN};
pub use message::{encode_keepalive, BgpMessage};
pub use notification::NotificationPacket;
pub use open::{Capability, OpenPacket, BGP_VERSION};
pub use refresh::RouteRefreshPacket;
pub use update::{SessionConfig, UpdatePacket};
