use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, IntoPrimitive, TryFromPrimitive)]
pub enum Afi {
    Ip = 1,
    Ip6 = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, IntoPrimitive, TryFromPrimitive)]
pub enum Safi {
    Unicast = 1,
    Multicast = 2,
}

/// The (AFI, SAFI) pairs this codec speaks: IPv4/IPv6, unicast/multicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AfiSafi {
    pub afi: Afi,
    pub safi: Safi,
}

impl AfiSafi {
    pub const IPV4_UNICAST: AfiSafi = AfiSafi { afi: Afi::Ip, safi: Safi::Unicast };
    pub const IPV6_UNICAST: AfiSafi = AfiSafi { afi: Afi::Ip6, safi: Safi::Unicast };

    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }
}
