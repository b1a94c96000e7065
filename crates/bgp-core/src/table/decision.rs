use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use ptree::Prefix;

use crate::attr::PathAttributeList;
use crate::message::{AddRouteStatus, Genid, InternalMessage, UniqueId};
use crate::route::SubnetRoute;
use crate::table::{OutputState, RouteTable};

/// Per-prefix candidate set Decision fans in from every upstream RibIn. Each
/// candidate keeps the genid it arrived with so a winner change downstream
/// carries the originating peering's genid rather than a placeholder,
/// letting a `DeletionTable` spliced in further down tell a stale withdraw
/// apart from a fresh one.
struct Candidates<P: Prefix> {
    by_peer: HashMap<UniqueId, (Rc<SubnetRoute<P>>, Genid)>,
    winner: Option<UniqueId>,
}

impl<P: Prefix> Default for Candidates<P> {
    fn default() -> Self {
        Self { by_peer: HashMap::new(), winner: None }
    }
}

/// Fan-in table: selects at most one winner per prefix across every
/// upstream peering using the standard BGP-4 tie-break, and emits
/// add/replace/delete downstream with exactly one `is_winner` route per
/// prefix — the universal invariant the whole pipeline exists to uphold.
pub struct DecisionTable<P: Prefix> {
    candidates: HashMap<P, Candidates<P>>,
    /// Per-peer IGP metric to its BGP nexthop, used by tie-break step 6.
    /// Populated externally as the RIB reports IGP reachability changes.
    igp_metric: HashMap<UniqueId, u32>,
    peer_is_ebgp: HashMap<UniqueId, bool>,
    peer_neighbor_as: HashMap<UniqueId, u32>,
    peer_address: HashMap<UniqueId, std::net::IpAddr>,
    downstream: Option<Rc<RefCell<dyn RouteTable<P>>>>,
}

impl<P: Prefix + std::hash::Hash + Eq + Clone> DecisionTable<P> {
    pub fn new() -> Self {
        Self {
            candidates: HashMap::new(),
            igp_metric: HashMap::new(),
            peer_is_ebgp: HashMap::new(),
            peer_neighbor_as: HashMap::new(),
            peer_address: HashMap::new(),
            downstream: None,
        }
    }

    pub fn set_downstream(&mut self, downstream: Rc<RefCell<dyn RouteTable<P>>>) {
        self.downstream = Some(downstream);
    }

    pub fn register_peer(&mut self, peer: UniqueId, is_ebgp: bool, neighbor_as: u32, addr: std::net::IpAddr) {
        self.peer_is_ebgp.insert(peer, is_ebgp);
        self.peer_neighbor_as.insert(peer, neighbor_as);
        self.peer_address.insert(peer, addr);
    }

    pub fn set_igp_metric(&mut self, peer: UniqueId, metric: u32) {
        self.igp_metric.insert(peer, metric);
    }

    /// The standard BGP-4 best-path tie-break, in order: LOCAL_PREF,
    /// AS_PATH length, ORIGIN, MED (same neighbor AS only), EBGP over IBGP,
    /// IGP metric to the nexthop, router-id/cluster-list length, peer
    /// address. Returns `Less` when `a` should be preferred over `b`.
    fn compare(&self, a_peer: UniqueId, a: &PathAttributeList, b_peer: UniqueId, b: &PathAttributeList) -> Ordering {
        let a = a.inner();
        let b = b.inner();

        let a_lp = a.local_pref.unwrap_or(100);
        let b_lp = b.local_pref.unwrap_or(100);
        if a_lp != b_lp {
            return b_lp.cmp(&a_lp);
        }

        let a_len = a.as_path.as_ref().map(|p| p.length()).unwrap_or(0);
        let b_len = b.as_path.as_ref().map(|p| p.length()).unwrap_or(0);
        if a_len != b_len {
            return a_len.cmp(&b_len);
        }

        if a.origin != b.origin {
            return a.origin.cmp(&b.origin);
        }

        let same_neighbor =
            self.peer_neighbor_as.get(&a_peer).is_some() && self.peer_neighbor_as.get(&a_peer) == self.peer_neighbor_as.get(&b_peer);
        if same_neighbor {
            let a_med = a.med.unwrap_or(0);
            let b_med = b.med.unwrap_or(0);
            if a_med != b_med {
                return a_med.cmp(&b_med);
            }
        }

        let a_ebgp = self.peer_is_ebgp.get(&a_peer).copied().unwrap_or(false);
        let b_ebgp = self.peer_is_ebgp.get(&b_peer).copied().unwrap_or(false);
        if a_ebgp != b_ebgp {
            return if a_ebgp { Ordering::Less } else { Ordering::Greater };
        }

        let a_igp = self.igp_metric.get(&a_peer).copied().unwrap_or(u32::MAX);
        let b_igp = self.igp_metric.get(&b_peer).copied().unwrap_or(u32::MAX);
        if a_igp != b_igp {
            return a_igp.cmp(&b_igp);
        }

        let a_orig = a.originator_id.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        let b_orig = b.originator_id.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        if a_orig != b_orig {
            return a_orig.cmp(&b_orig);
        }
        let a_cluster = a.cluster_list.as_ref().map(|c| c.0.len()).unwrap_or(0);
        let b_cluster = b.cluster_list.as_ref().map(|c| c.0.len()).unwrap_or(0);
        if a_cluster != b_cluster {
            return a_cluster.cmp(&b_cluster);
        }

        let a_addr = self.peer_address.get(&a_peer);
        let b_addr = self.peer_address.get(&b_peer);
        a_addr.cmp(&b_addr)
    }

    fn pick_winner(&self, candidates: &Candidates<P>) -> Option<UniqueId> {
        candidates
            .by_peer
            .iter()
            .min_by(|(pa, (ra, _)), (pb, (rb, _))| self.compare(**pa, &ra.attributes, **pb, &rb.attributes))
            .map(|(peer, _)| *peer)
    }

    fn resolve(&mut self, net: &P) -> Option<AddRouteStatus> {
        let previous_winner = self.candidates.get(net)?.winner;
        let new_winner = self.pick_winner(self.candidates.get(net)?);

        if new_winner == previous_winner {
            return None;
        }

        let candidates = self.candidates.get_mut(net)?;

        if let Some(prev) = previous_winner {
            if let Some((route, _)) = candidates.by_peer.get(&prev) {
                route.set_is_winner(false);
            }
        }
        candidates.winner = new_winner;
        if let Some(new_peer) = new_winner {
            let (route, _) = candidates.by_peer.get(&new_peer).unwrap();
            route.set_is_winner(true);
        }

        let Some(downstream) = self.downstream.as_ref() else { return Some(AddRouteStatus::Unused) };
        let status = match (previous_winner, new_winner) {
            (None, Some(new_peer)) => {
                let (route, genid) = candidates.by_peer.get(&new_peer).unwrap().clone();
                let msg = Rc::new(InternalMessage::new(route, new_peer, genid));
                downstream.borrow_mut().add_route(msg)
            }
            (Some(_), None) => {
                // previous winner's route already removed from by_peer by caller
                AddRouteStatus::Unused
            }
            (Some(old_peer), Some(new_peer)) => {
                let old = candidates.by_peer.get(&old_peer).cloned();
                let (new_route, new_genid) = candidates.by_peer.get(&new_peer).unwrap().clone();
                if let Some((old_route, old_genid)) = old {
                    let old_msg = Rc::new(InternalMessage::new(old_route, old_peer, old_genid));
                    let new_msg = Rc::new(InternalMessage::new(new_route, new_peer, new_genid));
                    downstream.borrow_mut().replace_route(old_msg, new_msg)
                } else {
                    let new_msg = Rc::new(InternalMessage::new(new_route, new_peer, new_genid));
                    downstream.borrow_mut().add_route(new_msg)
                }
            }
            (None, None) => AddRouteStatus::Unused,
        };
        Some(status)
    }
}

impl<P: Prefix + std::hash::Hash + Eq + Clone> Default for DecisionTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Prefix + std::hash::Hash + Eq + Clone> RouteTable<P> for DecisionTable<P> {
    fn add_route(&mut self, msg: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let net = msg.route().net.clone();
        let entry = self.candidates.entry(net.clone()).or_default();
        entry.by_peer.insert(msg.origin_peer(), (msg.route().clone(), msg.genid()));
        self.resolve(&net).unwrap_or(AddRouteStatus::Unused)
    }

    fn replace_route(&mut self, old: Rc<InternalMessage<P>>, new: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let net = new.route().net.clone();
        let entry = self.candidates.entry(net.clone()).or_default();
        entry.by_peer.insert(new.origin_peer(), (new.route().clone(), new.genid()));
        let _ = old;
        self.resolve(&net).unwrap_or(AddRouteStatus::Unused)
    }

    fn delete_route(&mut self, msg: Rc<InternalMessage<P>>) {
        let net = msg.route().net.clone();
        let was_winner = {
            let Some(entry) = self.candidates.get_mut(&net) else { return };
            let was_winner = entry.winner == Some(msg.origin_peer());
            entry.by_peer.remove(&msg.origin_peer());
            if was_winner {
                entry.winner = None;
            }
            was_winner
        };

        if was_winner {
            if let Some(downstream) = self.downstream.as_ref() {
                downstream.borrow_mut().delete_route(msg);
            }
        }
        if let Some(new_winner) = self.resolve(&net) {
            let _ = new_winner;
        }
        if self.candidates.get(&net).map(|c| c.by_peer.is_empty()).unwrap_or(false) {
            self.candidates.remove(&net);
        }
    }

    fn route_dump(&mut self, msg: Rc<InternalMessage<P>>, dump_peer: UniqueId) -> AddRouteStatus {
        match self.downstream.as_ref() {
            Some(d) => d.borrow_mut().route_dump(msg, dump_peer),
            None => AddRouteStatus::Unused,
        }
    }

    fn push(&mut self, origin_peer: UniqueId) {
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().push(origin_peer);
        }
    }

    fn output_state(&self) -> OutputState {
        self.downstream.as_ref().map(|d| d.borrow().output_state()).unwrap_or(OutputState::Idle)
    }

    fn peering_went_down(&mut self, peer: UniqueId, genid: Genid) {
        let nets: Vec<P> = self.candidates.iter().filter(|(_, c)| c.by_peer.contains_key(&peer)).map(|(net, _)| net.clone()).collect();
        for net in nets {
            if let Some((route, _)) = self.candidates.get(&net).and_then(|c| c.by_peer.get(&peer)).cloned() {
                let msg = Rc::new(InternalMessage::new(route, peer, genid));
                msg.set_from_previous_peering();
                self.delete_route(msg);
            }
        }
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().peering_went_down(peer, genid);
        }
    }

    fn peering_down_complete(&mut self, peer: UniqueId, genid: Genid) {
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().peering_down_complete(peer, genid);
        }
    }

    fn peering_came_up(&mut self, peer: UniqueId, genid: Genid) {
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().peering_came_up(peer, genid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyTags;
    use bgp_packet::PathAttributes;
    use ipnet::Ipv4Net;
    use std::net::{IpAddr, Ipv4Addr};

    fn attrs_with_local_pref(lp: u32) -> Rc<PathAttributeList> {
        Rc::new(PathAttributeList(PathAttributes { local_pref: Some(lp), ..Default::default() }))
    }

    #[test]
    fn higher_local_pref_wins() {
        let mut decision = DecisionTable::<Ipv4Net>::new();
        decision.register_peer(2, true, 65002, IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)));
        decision.register_peer(3, true, 65003, IpAddr::V4(Ipv4Addr::new(3, 3, 3, 3)));
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();

        let low = SubnetRoute::new(net, attrs_with_local_pref(50), 2, PolicyTags::default());
        let high = SubnetRoute::new(net, attrs_with_local_pref(200), 3, PolicyTags::default());

        decision.add_route(Rc::new(InternalMessage::new(low, 2, 1)));
        decision.add_route(Rc::new(InternalMessage::new(high.clone(), 3, 1)));

        assert!(high.is_winner());
        assert_eq!(decision.candidates.get(&net).unwrap().winner, Some(3));
    }

    #[test]
    fn exactly_one_winner_per_prefix() {
        let mut decision = DecisionTable::<Ipv4Net>::new();
        decision.register_peer(2, true, 65002, IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)));
        decision.register_peer(3, true, 65003, IpAddr::V4(Ipv4Addr::new(3, 3, 3, 3)));
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let a = SubnetRoute::new(net, attrs_with_local_pref(100), 2, PolicyTags::default());
        let b = SubnetRoute::new(net, attrs_with_local_pref(100), 3, PolicyTags::default());
        decision.add_route(Rc::new(InternalMessage::new(a.clone(), 2, 1)));
        decision.add_route(Rc::new(InternalMessage::new(b.clone(), 3, 1)));
        assert_eq!(a.is_winner() as u8 + b.is_winner() as u8, 1);
    }
}
