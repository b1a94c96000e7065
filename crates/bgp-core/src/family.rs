use std::net::IpAddr;

use bgp_packet::{AfiSafi, PathAttributes, UpdatePacket};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use ptree::Prefix;

/// Ties a pipeline prefix type to the places its routes live inside an
/// UPDATE: top-level NLRI/withdrawn fields for IPv4 unicast, the MP_REACH/
/// MP_UNREACH attributes for everything else. One `Instance` is
/// monomorphized per family, and this trait is the only point where the
/// wire's view of a family and the pipeline's meet.
pub trait RoutedPrefix: Prefix {
    const AFI_SAFI: AfiSafi;

    /// Prefixes this UPDATE announces for this family.
    fn announced(update: &UpdatePacket) -> Vec<Self>;

    /// Prefixes this UPDATE withdraws for this family.
    fn withdrawn(update: &UpdatePacket) -> Vec<Self>;

    /// The next hop governing this family's announcements.
    fn next_hop(attrs: &PathAttributes) -> Option<IpAddr>;

    /// Packs announced prefixes back into an (empty-attrs) UPDATE skeleton;
    /// the caller fills in the attribute bundle.
    fn pack(announced: Vec<Self>, withdrawn: Vec<Self>, attrs: PathAttributes) -> UpdatePacket;
}

impl RoutedPrefix for Ipv4Net {
    const AFI_SAFI: AfiSafi = AfiSafi::IPV4_UNICAST;

    fn announced(update: &UpdatePacket) -> Vec<Self> {
        let mut nets = update.nlri.clone();
        if let Some(reach) = &update.attrs.mp_reach {
            if reach.afi_safi == Self::AFI_SAFI {
                nets.extend(reach.nlri.iter().filter_map(|n| match n {
                    IpNet::V4(v4) => Some(*v4),
                    IpNet::V6(_) => None,
                }));
            }
        }
        nets
    }

    fn withdrawn(update: &UpdatePacket) -> Vec<Self> {
        let mut nets = update.withdrawn.clone();
        if let Some(unreach) = &update.attrs.mp_unreach {
            if unreach.afi_safi == Self::AFI_SAFI {
                nets.extend(unreach.withdrawn.iter().filter_map(|n| match n {
                    IpNet::V4(v4) => Some(*v4),
                    IpNet::V6(_) => None,
                }));
            }
        }
        nets
    }

    fn next_hop(attrs: &PathAttributes) -> Option<IpAddr> {
        attrs
            .next_hop
            .map(IpAddr::V4)
            .or_else(|| attrs.mp_reach.as_ref().map(|reach| reach.next_hop))
    }

    fn pack(announced: Vec<Self>, withdrawn: Vec<Self>, attrs: PathAttributes) -> UpdatePacket {
        UpdatePacket { withdrawn, attrs, nlri: announced }
    }
}

impl RoutedPrefix for Ipv6Net {
    const AFI_SAFI: AfiSafi = AfiSafi::IPV6_UNICAST;

    fn announced(update: &UpdatePacket) -> Vec<Self> {
        update
            .attrs
            .mp_reach
            .iter()
            .filter(|reach| reach.afi_safi == Self::AFI_SAFI)
            .flat_map(|reach| {
                reach.nlri.iter().filter_map(|n| match n {
                    IpNet::V6(v6) => Some(*v6),
                    IpNet::V4(_) => None,
                })
            })
            .collect()
    }

    fn withdrawn(update: &UpdatePacket) -> Vec<Self> {
        update
            .attrs
            .mp_unreach
            .iter()
            .filter(|unreach| unreach.afi_safi == Self::AFI_SAFI)
            .flat_map(|unreach| {
                unreach.withdrawn.iter().filter_map(|n| match n {
                    IpNet::V6(v6) => Some(*v6),
                    IpNet::V4(_) => None,
                })
            })
            .collect()
    }

    fn next_hop(attrs: &PathAttributes) -> Option<IpAddr> {
        attrs.mp_reach.as_ref().map(|reach| reach.next_hop)
    }

    fn pack(announced: Vec<Self>, withdrawn: Vec<Self>, mut attrs: PathAttributes) -> UpdatePacket {
        use bgp_packet::{MpReachNlri, MpUnreachNlri};
        if !announced.is_empty() {
            let next_hop = attrs
                .mp_reach
                .as_ref()
                .map(|r| r.next_hop)
                .unwrap_or(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED));
            attrs.mp_reach = Some(MpReachNlri {
                afi_safi: Self::AFI_SAFI,
                next_hop,
                link_local: None,
                nlri: announced.into_iter().map(IpNet::V6).collect(),
            });
        }
        // A v6 speaker never uses the v4-only top-level NEXT_HOP.
        attrs.next_hop = None;
        if !withdrawn.is_empty() {
            attrs.mp_unreach = Some(MpUnreachNlri {
                afi_safi: Self::AFI_SAFI,
                withdrawn: withdrawn.into_iter().map(IpNet::V6).collect(),
            });
        }
        UpdatePacket { withdrawn: Vec::new(), attrs, nlri: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_packet::{AsPath, MpReachNlri, Origin};

    #[test]
    fn v4_reads_top_level_nlri() {
        let update = UpdatePacket {
            withdrawn: vec!["10.1.0.0/16".parse().unwrap()],
            nlri: vec!["10.0.0.0/24".parse().unwrap()],
            ..Default::default()
        };
        assert_eq!(Ipv4Net::announced(&update), vec!["10.0.0.0/24".parse::<Ipv4Net>().unwrap()]);
        assert_eq!(Ipv4Net::withdrawn(&update), vec!["10.1.0.0/16".parse::<Ipv4Net>().unwrap()]);
        assert!(Ipv6Net::announced(&update).is_empty());
    }

    #[test]
    fn v6_reads_mp_reach() {
        let update = UpdatePacket {
            attrs: bgp_packet::PathAttributes {
                origin: Some(Origin::Igp),
                as_path: Some(AsPath::from_sequence(vec![65001])),
                mp_reach: Some(MpReachNlri {
                    afi_safi: AfiSafi::IPV6_UNICAST,
                    next_hop: "2001:db8::1".parse().unwrap(),
                    link_local: None,
                    nlri: vec!["2001:db8:1::/48".parse().unwrap()],
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            Ipv6Net::announced(&update),
            vec!["2001:db8:1::/48".parse::<Ipv6Net>().unwrap()]
        );
        assert_eq!(Ipv6Net::next_hop(&update.attrs), Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn v6_pack_round_trips_through_announced() {
        let nets = vec!["2001:db8:1::/48".parse::<Ipv6Net>().unwrap()];
        let update = Ipv6Net::pack(nets.clone(), Vec::new(), Default::default());
        assert_eq!(Ipv6Net::announced(&update), nets);
    }
}
