use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ptree::Prefix;

use crate::dump::{DumpIterator, RouteChangeOp};
use crate::message::{AddRouteStatus, Genid, InternalMessage, UniqueId};
use crate::table::{OutputState, RouteTable};

/// Fan-out table: duplicates every event arriving from Decision to every
/// registered downstream peer's RibOut subtree. Each subtree handles its
/// own back-pressure independently, so one slow peer never blocks delivery
/// to the others.
///
/// While a freshly-plumbed peer is still catching up via a `DumpIterator`,
/// its registered iterator arbitrates every live event: a change the dump
/// will replay anyway is suppressed here, one the dump has already passed
/// is forwarded, so the peer sees each route exactly once.
pub struct FanoutTable<P: Prefix> {
    subtrees: HashMap<UniqueId, Rc<RefCell<dyn RouteTable<P>>>>,
    dumps: HashMap<UniqueId, Rc<RefCell<DumpIterator<P>>>>,
}

impl<P: Prefix + Ord> FanoutTable<P> {
    pub fn new() -> Self {
        Self { subtrees: HashMap::new(), dumps: HashMap::new() }
    }

    pub fn add_peer(&mut self, peer: UniqueId, subtree: Rc<RefCell<dyn RouteTable<P>>>) {
        self.subtrees.insert(peer, subtree);
    }

    pub fn remove_peer(&mut self, peer: UniqueId) {
        self.subtrees.remove(&peer);
        self.dumps.remove(&peer);
    }

    /// Registers `iter` as the arbiter for live events toward `peer` until
    /// `end_dump`.
    pub fn begin_dump(&mut self, peer: UniqueId, iter: Rc<RefCell<DumpIterator<P>>>) {
        self.dumps.insert(peer, iter);
    }

    pub fn end_dump(&mut self, peer: UniqueId) {
        self.dumps.remove(&peer);
    }

    pub fn dumping(&self, peer: UniqueId) -> bool {
        self.dumps.contains_key(&peer)
    }

    fn wants(&self, to_peer: UniqueId, msg: &InternalMessage<P>, op: RouteChangeOp) -> bool {
        match self.dumps.get(&to_peer) {
            Some(iter) => iter.borrow().route_change_is_valid(
                msg.origin_peer(),
                &msg.route().net,
                msg.genid(),
                op,
            ),
            None => true,
        }
    }
}

impl<P: Prefix + Ord> Default for FanoutTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Prefix + Ord> RouteTable<P> for FanoutTable<P> {
    fn add_route(&mut self, msg: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let mut overall = AddRouteStatus::Unused;
        for (peer, subtree) in self.subtrees.iter() {
            if *peer == msg.origin_peer() || !self.wants(*peer, &msg, RouteChangeOp::Add) {
                continue;
            }
            let status = subtree.borrow_mut().add_route(msg.clone());
            if status == AddRouteStatus::Used {
                overall = AddRouteStatus::Used;
            }
        }
        overall
    }

    fn replace_route(&mut self, old: Rc<InternalMessage<P>>, new: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let mut overall = AddRouteStatus::Unused;
        for (peer, subtree) in self.subtrees.iter() {
            if *peer == new.origin_peer() || !self.wants(*peer, &new, RouteChangeOp::Add) {
                continue;
            }
            let status = subtree.borrow_mut().replace_route(old.clone(), new.clone());
            if status == AddRouteStatus::Used {
                overall = AddRouteStatus::Used;
            }
        }
        overall
    }

    fn delete_route(&mut self, msg: Rc<InternalMessage<P>>) {
        for (peer, subtree) in self.subtrees.iter() {
            if *peer == msg.origin_peer() || !self.wants(*peer, &msg, RouteChangeOp::Delete) {
                continue;
            }
            subtree.borrow_mut().delete_route(msg.clone());
        }
    }

    fn route_dump(&mut self, msg: Rc<InternalMessage<P>>, dump_peer: UniqueId) -> AddRouteStatus {
        match self.subtrees.get(&dump_peer) {
            Some(subtree) => subtree.borrow_mut().route_dump(msg, dump_peer),
            None => AddRouteStatus::Unused,
        }
    }

    fn push(&mut self, origin_peer: UniqueId) {
        for (peer, subtree) in self.subtrees.iter() {
            if *peer == origin_peer {
                continue;
            }
            subtree.borrow_mut().push(origin_peer);
        }
    }

    fn output_state(&self) -> OutputState {
        if self.subtrees.values().any(|s| s.borrow().output_state() == OutputState::Busy) {
            OutputState::Busy
        } else {
            OutputState::Idle
        }
    }

    fn peering_went_down(&mut self, peer: UniqueId, genid: Genid) {
        for iter in self.dumps.values() {
            iter.borrow_mut().peering_went_down(peer);
        }
        for subtree in self.subtrees.values() {
            subtree.borrow_mut().peering_went_down(peer, genid);
        }
    }

    fn peering_down_complete(&mut self, peer: UniqueId, genid: Genid) {
        for iter in self.dumps.values() {
            iter.borrow_mut().peering_down_complete(peer, genid);
        }
        for subtree in self.subtrees.values() {
            subtree.borrow_mut().peering_down_complete(peer, genid);
        }
    }

    fn peering_came_up(&mut self, peer: UniqueId, genid: Genid) {
        for iter in self.dumps.values() {
            iter.borrow_mut().peering_came_up(peer, genid);
        }
        for subtree in self.subtrees.values() {
            subtree.borrow_mut().peering_came_up(peer, genid);
        }
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
        adds: Vec<Ipv4Net>,
        deletes: Vec<Ipv4Net>,
    }
    impl RouteTable<Ipv4Net> for Sink {
        fn add_route(&mut self, msg: Rc<InternalMessage<Ipv4Net>>) -> AddRouteStatus {
            self.adds.push(msg.route().net);
            AddRouteStatus::Used
        }
        fn replace_route(&mut self, _old: Rc<InternalMessage<Ipv4Net>>, new: Rc<InternalMessage<Ipv4Net>>) -> AddRouteStatus {
            self.adds.push(new.route().net);
            AddRouteStatus::Used
        }
        fn delete_route(&mut self, msg: Rc<InternalMessage<Ipv4Net>>) {
            self.deletes.push(msg.route().net);
        }
        fn route_dump(&mut self, msg: Rc<InternalMessage<Ipv4Net>>, _dump_peer: UniqueId) -> AddRouteStatus {
            self.adds.push(msg.route().net);
            AddRouteStatus::Used
        }
        fn push(&mut self, _origin_peer: UniqueId) {}
    }

    fn msg(net: &str, origin: UniqueId, genid: Genid) -> Rc<InternalMessage<Ipv4Net>> {
        let net: Ipv4Net = net.parse().unwrap();
        let route = SubnetRoute::new(net, Rc::new(PathAttributeList::default()), origin, PolicyTags::default());
        Rc::new(InternalMessage::new(route, origin, genid))
    }

    #[test]
    fn events_skip_their_originating_peer() {
        let mut fanout = FanoutTable::<Ipv4Net>::new();
        let a = Rc::new(RefCell::new(Sink::default()));
        let b = Rc::new(RefCell::new(Sink::default()));
        fanout.add_peer(2, a.clone());
        fanout.add_peer(3, b.clone());
        fanout.add_route(msg("10.0.0.0/24", 2, 1));
        assert!(a.borrow().adds.is_empty());
        assert_eq!(b.borrow().adds.len(), 1);
    }

    #[test]
    fn live_events_toward_a_dumping_peer_are_arbitrated() {
        let mut fanout = FanoutTable::<Ipv4Net>::new();
        let c = Rc::new(RefCell::new(Sink::default()));
        fanout.add_peer(4, c.clone());
        // Peer 2 is still entirely to-dump: live adds must be suppressed.
        let iter = Rc::new(RefCell::new(DumpIterator::new(vec![(2, 1)])));
        fanout.begin_dump(4, iter.clone());
        fanout.add_route(msg("10.0.0.0/24", 2, 1));
        assert!(c.borrow().adds.is_empty());

        // Once the dump has passed 10.0.0.0/24, the same event goes through.
        iter.borrow_mut().note_dumped("10.0.0.0/24".parse().unwrap());
        fanout.add_route(msg("10.0.0.0/24", 2, 1));
        assert_eq!(c.borrow().adds.len(), 1);

        fanout.end_dump(4);
        fanout.add_route(msg("10.9.0.0/24", 2, 1));
        assert_eq!(c.borrow().adds.len(), 2);
    }
}
