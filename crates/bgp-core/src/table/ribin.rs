use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use std::net::IpAddr;

use ptree::Prefix;
use tracing::warn;

use crate::attr::{AttributeManager, FastPathAttributeList};
use crate::family::RoutedPrefix;
use crate::message::{next_genid, AddRouteStatus, Genid, InternalMessage, UniqueId, GENID_UNKNOWN};
use crate::policy::PolicyTags;
use crate::route::{ChainedSubnetRoute, SubnetRoute};
use crate::table::{OutputState, RouteTable};
use crate::trie::BgpTrie;

/// Per-peer entry point to the pipeline. Owns the `BgpTrie` that stores this
/// peering's routes and is the sole originator of `genid`s: one is assigned
/// each time the peering comes up, and every downstream table uses it to
/// tell a stale delete (still draining via a `DeletionTable`) apart from a
/// fresh add belonging to the peering that replaced it.
pub struct RibInTable<P: Prefix> {
    origin_peer: UniqueId,
    genid: Genid,
    trie: RefCell<BgpTrie<P>>,
    downstream: Option<Rc<RefCell<dyn RouteTable<P>>>>,
    /// Nexthops queued by `igp_nexthop_changed` while a previous push is
    /// still draining; popped one at a time so only one re-emission sweep
    /// runs at once.
    nexthop_queue: VecDeque<IpAddr>,
}

impl<P: RoutedPrefix + Clone + std::fmt::Debug> RibInTable<P> {
    pub fn new(origin_peer: UniqueId) -> Self {
        Self {
            origin_peer,
            genid: GENID_UNKNOWN,
            trie: RefCell::new(BgpTrie::new()),
            downstream: None,
            nexthop_queue: VecDeque::new(),
        }
    }

    pub fn set_downstream(&mut self, downstream: Rc<RefCell<dyn RouteTable<P>>>) {
        self.downstream = Some(downstream);
    }

    /// Current downstream link, read when a `DeletionTable` splices itself
    /// in directly after this table.
    pub fn downstream(&self) -> Option<Rc<RefCell<dyn RouteTable<P>>>> {
        self.downstream.clone()
    }

    pub fn genid(&self) -> Genid {
        self.genid
    }

    /// Canonicalizes `fpa_list`, registers it with the attribute manager,
    /// builds a `SubnetRoute`, and inserts it into the owned trie. If the
    /// prefix was already present the old route is erased first and a
    /// `replace_route` is issued downstream instead of an `add_route`.
    pub fn add_route(
        &mut self,
        net: P,
        fpa_list: FastPathAttributeList,
        policy_tags: PolicyTags,
        attr_mgr: &mut AttributeManager,
    ) -> AddRouteStatus {
        let canonical = fpa_list.canonicalize();
        let attrs = attr_mgr.register(canonical);
        let new_route = SubnetRoute::new(net.clone(), attrs, self.origin_peer, policy_tags);

        let old_route = self.trie.borrow_mut().erase(&net);
        // Erase before deregistering the old attribute handle: the new
        // route may share the same interned list, and deregistering first
        // would risk freeing storage the new route is about to reference
        // (see DESIGN.md's resolution of the erase/deregister ordering).
        self.trie.borrow_mut().insert(net.clone(), new_route.clone()).expect("erased above");

        let Some(downstream) = self.downstream.as_ref() else { return AddRouteStatus::Unused };
        let new_msg = Rc::new(InternalMessage::new(new_route.clone(), self.origin_peer, self.genid));
        let status = if let Some(old_route) = old_route {
            let old_msg = Rc::new(InternalMessage::new(old_route, self.origin_peer, self.genid));
            downstream.borrow_mut().replace_route(old_msg, new_msg)
        } else {
            downstream.borrow_mut().add_route(new_msg)
        };

        match status {
            AddRouteStatus::Used => {
                new_route.flags.in_use.set(true);
                new_route.flags.filtered.set(false);
            }
            AddRouteStatus::Unused => {
                new_route.flags.in_use.set(false);
                new_route.flags.filtered.set(false);
            }
            AddRouteStatus::Filtered => {
                new_route.flags.in_use.set(false);
                new_route.flags.filtered.set(true);
            }
            AddRouteStatus::Failure => {}
        }
        status
    }

    /// Missing routes are common after background deletion drains ahead of
    /// a duplicate withdraw, so a missing prefix is tolerated, logged, and
    /// otherwise ignored rather than treated as an error.
    pub fn delete_route(&mut self, net: &P) {
        let Some(old_route) = self.trie.borrow_mut().erase(net) else {
            warn!(?net, "delete_route for a prefix not present in RibIn");
            return;
        };
        if let Some(downstream) = self.downstream.as_ref() {
            let msg = Rc::new(InternalMessage::new(old_route, self.origin_peer, self.genid));
            downstream.borrow_mut().delete_route(msg);
        }
    }

    pub fn push(&mut self) {
        if let Some(downstream) = self.downstream.as_ref() {
            downstream.borrow_mut().push(self.origin_peer);
        }
    }

    pub fn lookup_route(&self, net: &P) -> Option<(Rc<SubnetRoute<P>>, Genid)> {
        self.trie.borrow().lookup_node(net).cloned().map(|r| (r, self.genid))
    }

    pub fn route_used(&self, route: &Rc<SubnetRoute<P>>, in_use: bool) {
        route.flags.in_use.set(in_use);
    }

    /// Detaches the trie (replacing it with a fresh, empty one so the RibIn
    /// can accept a new session immediately) and returns the detached trie
    /// for the caller to wrap in a `DeletionTable` spliced in right after
    /// this table.
    pub fn ribin_peering_went_down(&mut self) -> (BgpTrie<P>, Genid) {
        let detached = self.trie.replace(BgpTrie::new());
        let genid = self.genid;
        if let Some(downstream) = self.downstream.as_ref() {
            downstream.borrow_mut().peering_went_down(self.origin_peer, genid);
        }
        (detached, genid)
    }

    pub fn ribin_peering_came_up(&mut self) {
        self.genid = next_genid(self.genid);
        if let Some(downstream) = self.downstream.as_ref() {
            downstream.borrow_mut().peering_came_up(self.origin_peer, self.genid);
        }
    }

    /// Queues a nexthop whose IGP path changed. Queued rather than swept
    /// immediately so only one re-emission sweep is ever in flight; the
    /// owning event loop drains the queue one nexthop per round via
    /// `process_next_queued_nexthop`.
    pub fn igp_nexthop_changed(&mut self, bgp_nexthop: IpAddr) {
        self.nexthop_queue.push_back(bgp_nexthop);
    }

    /// Drains one queued nexthop change: the pathmap yields each distinct
    /// attribute list once, so chains not carrying the nexthop are skipped
    /// in one comparison, and an affected chain's members are walked
    /// without touching the trie index. Each affected route is re-emitted
    /// downstream as a paired delete then add, letting Decision re-select
    /// with the new IGP metric in effect.
    pub fn process_next_queued_nexthop(&mut self) -> bool {
        let Some(nexthop) = self.nexthop_queue.pop_front() else { return false };
        let affected: Vec<Rc<SubnetRoute<P>>> = {
            let trie = self.trie.borrow();
            let mut routes = Vec::new();
            for head in trie.pathmap_iter() {
                if P::next_hop(head.attributes.inner()) != Some(nexthop) {
                    continue;
                }
                let mut cur = head.clone();
                loop {
                    routes.push(cur.clone());
                    match cur.chain_next() {
                        Some(next) if !Rc::ptr_eq(&next, head) => cur = next,
                        _ => break,
                    }
                }
            }
            routes
        };
        for route in affected {
            if let Some(downstream) = self.downstream.as_ref() {
                let del = Rc::new(InternalMessage::new(route.clone(), self.origin_peer, self.genid));
                downstream.borrow_mut().delete_route(del);
                let add = Rc::new(InternalMessage::new(route, self.origin_peer, self.genid));
                downstream.borrow_mut().add_route(add);
            }
        }
        self.push();
        true
    }

    pub fn has_queued_nexthops(&self) -> bool {
        !self.nexthop_queue.is_empty()
    }

    /// Advances a dump one stored route past `last` in iteration order,
    /// emitting it via `route_dump` when it is a current winner. Returns
    /// the route's prefix as the new checkpoint, or `None` when the trie
    /// is exhausted.
    pub fn dump_route_after(&mut self, last: Option<&P>, dump_peer: UniqueId) -> Option<P> {
        let next = {
            let trie = self.trie.borrow();
            trie.next_after(last).map(|(net, route)| (net.clone(), route.clone()))
        };
        let (net, route) = next?;
        if route.is_winner() {
            if let Some(downstream) = self.downstream.as_ref() {
                let msg = Rc::new(InternalMessage::new(route.clone(), self.origin_peer, self.genid));
                let status = downstream.borrow_mut().route_dump(msg, dump_peer);
                if status == AddRouteStatus::Filtered {
                    route.flags.filtered.set(true);
                }
            }
        }
        Some(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::Ipv4Net;

    #[derive(Default)]
    struct Sink {
        added: Vec<Ipv4Net>,
        deleted: Vec<Ipv4Net>,
    }

    impl RouteTable<Ipv4Net> for Sink {
        fn add_route(&mut self, msg: Rc<InternalMessage<Ipv4Net>>) -> AddRouteStatus {
            self.added.push(msg.route().net);
            AddRouteStatus::Used
        }
        fn replace_route(&mut self, old: Rc<InternalMessage<Ipv4Net>>, new: Rc<InternalMessage<Ipv4Net>>) -> AddRouteStatus {
            self.deleted.push(old.route().net);
            self.added.push(new.route().net);
            AddRouteStatus::Used
        }
        fn delete_route(&mut self, msg: Rc<InternalMessage<Ipv4Net>>) {
            self.deleted.push(msg.route().net);
        }
        fn route_dump(&mut self, msg: Rc<InternalMessage<Ipv4Net>>, _dump_peer: UniqueId) -> AddRouteStatus {
            self.added.push(msg.route().net);
            AddRouteStatus::Used
        }
        fn push(&mut self, _origin_peer: UniqueId) {}
        fn output_state(&self) -> OutputState {
            OutputState::Idle
        }
    }

    #[test]
    fn add_then_delete_leaves_trie_unchanged() {
        let mut ribin = RibInTable::<Ipv4Net>::new(2);
        let sink = Rc::new(RefCell::new(Sink::default()));
        ribin.set_downstream(sink.clone());
        let mut mgr = AttributeManager::new();
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();

        ribin.add_route(net, FastPathAttributeList::default(), PolicyTags::default(), &mut mgr);
        assert_eq!(ribin.trie.borrow().len(), 1);
        ribin.delete_route(&net);
        assert_eq!(ribin.trie.borrow().len(), 0);
        assert_eq!(sink.borrow().added, vec![net]);
        assert_eq!(sink.borrow().deleted, vec![net]);
    }

    #[test]
    fn peering_up_bumps_genid_past_zero() {
        let mut ribin = RibInTable::<Ipv4Net>::new(2);
        assert_eq!(ribin.genid(), GENID_UNKNOWN);
        ribin.ribin_peering_came_up();
        assert_ne!(ribin.genid(), GENID_UNKNOWN);
    }

    #[test]
    fn peering_down_detaches_to_an_empty_trie() {
        let mut ribin = RibInTable::<Ipv4Net>::new(2);
        let mut mgr = AttributeManager::new();
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        ribin.add_route(net, FastPathAttributeList::default(), PolicyTags::default(), &mut mgr);
        let (detached, _genid) = ribin.ribin_peering_went_down();
        assert_eq!(detached.len(), 1);
        assert_eq!(ribin.trie.borrow().len(), 0);
    }
}
