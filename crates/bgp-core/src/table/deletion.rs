use std::cell::RefCell;
use std::rc::Rc;

use ptree::Prefix;

use crate::crashdump::CrashDumper;
use crate::message::{AddRouteStatus, Genid, InternalMessage, UniqueId};
use crate::route::ChainedSubnetRoute;
use crate::table::{OutputState, RouteTable};
use crate::trie::BgpTrie;

/// Result of one `step()` of the background deletion sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionProgress {
    /// At least one chain was erased; more may remain.
    Continuing,
    /// The held trie is empty; the caller should splice this table back out
    /// of the pipeline (`peering_down_complete` has already been sent).
    Finished,
}

/// Temporary table spliced in directly after a `RibInTable` when its peering
/// goes down. It holds that RibIn's entire route trie and deletes it
/// route-by-route as a series of discrete steps driven by the event loop,
/// so one peering flap never blocks the rest of the pipeline for the
/// duration of a full table walk. A route the RibIn accepts again before the
/// sweep finishes is served out of the held trie by erasing it here and
/// forwarding a `replace_route` instead of an `add_route`, keeping
/// downstream tables internally consistent.
pub struct DeletionTable<P: Prefix> {
    peer: UniqueId,
    genid: Genid,
    route_table: BgpTrie<P>,
    downstream: Option<Rc<RefCell<dyn RouteTable<P>>>>,
    deleted: usize,
    chains: usize,
}

impl<P: Prefix + Clone> DeletionTable<P> {
    pub fn new(peer: UniqueId, genid: Genid, route_table: BgpTrie<P>) -> Self {
        Self { peer, genid, route_table, downstream: None, deleted: 0, chains: 0 }
    }

    pub fn set_downstream(&mut self, downstream: Rc<RefCell<dyn RouteTable<P>>>) {
        self.downstream = Some(downstream);
    }

    /// Current downstream link, read when this table is unspliced so its
    /// upstream can be repointed past it.
    pub fn downstream(&self) -> Option<Rc<RefCell<dyn RouteTable<P>>>> {
        self.downstream.clone()
    }

    pub fn genid(&self) -> Genid {
        self.genid
    }

    pub fn remaining(&self) -> usize {
        self.route_table.len()
    }

    /// Must be called once, after plumbing, before the first `step()`.
    /// Flushes anything this peer had queued in downstream `RibOutTable`s so
    /// a stale batch from before the peering dropped can't outlive it.
    pub fn initiate_background_deletion(&mut self) {
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().push(self.peer);
        }
    }

    /// Erases one pathmap chain (every route sharing one interned attribute
    /// list) and forwards a `delete_route` for each member, then closes the
    /// batch with a `push`. Returns `Finished` once the held trie is empty,
    /// having already sent `peering_down_complete`.
    pub fn step(&mut self) -> DeletionProgress {
        let Some(head) = self.route_table.pathmap_iter().next().cloned() else {
            if let Some(d) = self.downstream.as_ref() {
                d.borrow_mut().peering_down_complete(self.peer, self.genid);
            }
            return DeletionProgress::Finished;
        };

        let mut nets = vec![head.net.clone()];
        let mut cur = head.clone();
        loop {
            match cur.chain_next() {
                Some(next) if !Rc::ptr_eq(&next, &head) => {
                    nets.push(next.net.clone());
                    cur = next;
                }
                _ => break,
            }
        }

        for net in nets {
            if let Some(route) = self.route_table.erase(&net) {
                let msg = Rc::new(InternalMessage::new(route, self.peer, self.genid));
                msg.set_from_previous_peering();
                if let Some(d) = self.downstream.as_ref() {
                    d.borrow_mut().delete_route(msg);
                }
                self.deleted += 1;
            }
        }
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().push(self.peer);
        }
        self.chains += 1;

        if self.route_table.is_empty() {
            if let Some(d) = self.downstream.as_ref() {
                d.borrow_mut().peering_down_complete(self.peer, self.genid);
            }
            DeletionProgress::Finished
        } else {
            DeletionProgress::Continuing
        }
    }
}

impl<P: Prefix + Clone> RouteTable<P> for DeletionTable<P> {
    fn add_route(&mut self, msg: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let Some(downstream) = self.downstream.as_ref() else { return AddRouteStatus::Unused };
        let net = msg.route().net.clone();
        match self.route_table.erase(&net) {
            None => downstream.borrow_mut().add_route(msg),
            Some(existing) => {
                let old_msg = Rc::new(InternalMessage::new(existing, self.peer, self.genid));
                old_msg.set_from_previous_peering();
                downstream.borrow_mut().replace_route(old_msg, msg)
            }
        }
    }

    fn replace_route(&mut self, old: Rc<InternalMessage<P>>, new: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let Some(downstream) = self.downstream.as_ref() else { return AddRouteStatus::Unused };
        debug_assert!(self.route_table.lookup_node(&old.route().net).is_none());
        downstream.borrow_mut().replace_route(old, new)
    }

    fn delete_route(&mut self, msg: Rc<InternalMessage<P>>) {
        debug_assert!(self.route_table.lookup_node(&msg.route().net).is_none());
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().delete_route(msg);
        }
    }

    fn route_dump(&mut self, msg: Rc<InternalMessage<P>>, dump_peer: UniqueId) -> AddRouteStatus {
        debug_assert!(self.route_table.lookup_node(&msg.route().net).is_none());
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

    /// The original aborts here: flow control never reaches a table that is
    /// only ever draining, never accepting new traffic from upstream.
    fn output_state(&self) -> OutputState {
        unreachable!("DeletionTable never originates flow-controlled output");
    }

    fn get_next_message(&mut self, _next: &P) {
        unreachable!("DeletionTable never originates flow-controlled output");
    }

    fn lookup_route(&self, net: &P) -> Option<(Rc<crate::route::SubnetRoute<P>>, Genid)> {
        self.route_table.lookup_node(net).map(|r| (r.clone(), self.genid))
    }

    fn peering_went_down(&mut self, peer: UniqueId, genid: Genid) {
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

impl<P: Prefix> CrashDumper for DeletionTable<P> {
    fn dump_state(&self) -> String {
        format!(
            "DeletionTable peer={} genid={} remaining={} deleted={} chains={}",
            self.peer,
            self.genid,
            self.route_table.len(),
            self.deleted,
            self.chains
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::PathAttributeList;
    use crate::policy::PolicyTags;
    use crate::route::SubnetRoute;
    use ipnet::Ipv4Net;

    #[derive(Default)]
    struct Sink {
        deletes: usize,
        pushes: usize,
        down_complete: usize,
    }
    impl RouteTable<Ipv4Net> for Sink {
        fn add_route(&mut self, _msg: Rc<InternalMessage<Ipv4Net>>) -> AddRouteStatus {
            AddRouteStatus::Used
        }
        fn replace_route(&mut self, _old: Rc<InternalMessage<Ipv4Net>>, _new: Rc<InternalMessage<Ipv4Net>>) -> AddRouteStatus {
            AddRouteStatus::Used
        }
        fn delete_route(&mut self, _msg: Rc<InternalMessage<Ipv4Net>>) {
            self.deletes += 1;
        }
        fn route_dump(&mut self, _msg: Rc<InternalMessage<Ipv4Net>>, _dump_peer: UniqueId) -> AddRouteStatus {
            AddRouteStatus::Used
        }
        fn push(&mut self, _origin_peer: UniqueId) {
            self.pushes += 1;
        }
        fn peering_down_complete(&mut self, _peer: UniqueId, _genid: Genid) {
            self.down_complete += 1;
        }
    }

    fn held_trie_sharing_attrs(nets: &[&str]) -> BgpTrie<Ipv4Net> {
        let mut trie = BgpTrie::new();
        let attrs = Rc::new(PathAttributeList::default());
        for s in nets {
            let net: Ipv4Net = s.parse().unwrap();
            let route = SubnetRoute::new(net, attrs.clone(), 2, PolicyTags::default());
            trie.insert(net, route).unwrap();
        }
        trie
    }

    fn held_trie(nets: &[&str]) -> BgpTrie<Ipv4Net> {
        let mut trie = BgpTrie::new();
        for s in nets {
            let net: Ipv4Net = s.parse().unwrap();
            let route = SubnetRoute::new(net, Rc::new(PathAttributeList::default()), 2, PolicyTags::default());
            trie.insert(net, route).unwrap();
        }
        trie
    }

    #[test]
    fn step_drains_one_chain_at_a_time_then_finishes() {
        let trie = held_trie_sharing_attrs(&["10.0.0.0/24", "10.0.1.0/24"]);
        let mut table = DeletionTable::new(2, 7, trie);
        let sink = Rc::new(RefCell::new(Sink::default()));
        table.set_downstream(sink.clone());
        table.initiate_background_deletion();
        assert_eq!(sink.borrow().pushes, 1);

        let progress = table.step();
        assert_eq!(progress, DeletionProgress::Finished);
        assert_eq!(sink.borrow().deletes, 2);
        assert_eq!(sink.borrow().down_complete, 1);
        assert_eq!(table.remaining(), 0);
    }

    #[test]
    fn add_route_for_held_net_becomes_replace() {
        let trie = held_trie(&["10.0.0.0/24"]);
        let mut table = DeletionTable::new(2, 7, trie);
        let sink = Rc::new(RefCell::new(Sink::default()));
        table.set_downstream(sink.clone());

        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let new_route = SubnetRoute::new(net, Rc::new(PathAttributeList::default()), 2, PolicyTags::default());
        let msg = Rc::new(InternalMessage::new(new_route, 2, 8));
        table.add_route(msg);
        assert_eq!(table.remaining(), 0);
    }

    #[test]
    #[should_panic]
    fn output_state_is_unreachable() {
        let table = DeletionTable::<Ipv4Net>::new(2, 7, BgpTrie::new());
        let _ = table.output_state();
    }
}
