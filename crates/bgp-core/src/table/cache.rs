use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ptree::Prefix;

use crate::message::{AddRouteStatus, Genid, InternalMessage, UniqueId};
use crate::route::SubnetRoute;
use crate::table::{OutputState, RouteTable};

/// Caches routes mutated by an upstream `FilterTable` so a later delete can
/// refer to the exact same object the add handed downstream, rather than
/// re-deriving it (which would fail once the filter's input has already
/// moved on). On `replace_route`, the old cached entry is erased and the new
/// one cached in its place.
pub struct CacheTable<P: Prefix> {
    cached: HashMap<P, Rc<SubnetRoute<P>>>,
    downstream: Option<Rc<RefCell<dyn RouteTable<P>>>>,
}

impl<P: Prefix + std::hash::Hash + Eq + Clone> CacheTable<P> {
    pub fn new() -> Self {
        Self { cached: HashMap::new(), downstream: None }
    }

    pub fn set_downstream(&mut self, downstream: Rc<RefCell<dyn RouteTable<P>>>) {
        self.downstream = Some(downstream);
    }
}

impl<P: Prefix + std::hash::Hash + Eq + Clone> Default for CacheTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Prefix + std::hash::Hash + Eq + Clone> RouteTable<P> for CacheTable<P> {
    fn add_route(&mut self, msg: Rc<InternalMessage<P>>) -> AddRouteStatus {
        if msg.changed() {
            self.cached.insert(msg.route().net.clone(), msg.route().clone());
            msg.clear_changed();
        }
        match self.downstream.as_ref() {
            Some(d) => d.borrow_mut().add_route(msg),
            None => AddRouteStatus::Unused,
        }
    }

    fn replace_route(&mut self, old: Rc<InternalMessage<P>>, new: Rc<InternalMessage<P>>) -> AddRouteStatus {
        self.cached.remove(&old.route().net);
        if new.changed() {
            self.cached.insert(new.route().net.clone(), new.route().clone());
            new.clear_changed();
        }
        match self.downstream.as_ref() {
            Some(d) => d.borrow_mut().replace_route(old, new),
            None => AddRouteStatus::Unused,
        }
    }

    fn delete_route(&mut self, msg: Rc<InternalMessage<P>>) {
        self.cached.remove(&msg.route().net);
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().delete_route(msg);
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
    use crate::attr::PathAttributeList;
    use crate::policy::PolicyTags;
    use ipnet::Ipv4Net;

    #[derive(Default)]
    struct Counter {
        adds: usize,
    }
    impl RouteTable<Ipv4Net> for Counter {
        fn add_route(&mut self, _msg: Rc<InternalMessage<Ipv4Net>>) -> AddRouteStatus {
            self.adds += 1;
            AddRouteStatus::Used
        }
        fn replace_route(&mut self, _old: Rc<InternalMessage<Ipv4Net>>, _new: Rc<InternalMessage<Ipv4Net>>) -> AddRouteStatus {
            AddRouteStatus::Used
        }
        fn delete_route(&mut self, _msg: Rc<InternalMessage<Ipv4Net>>) {}
        fn route_dump(&mut self, _msg: Rc<InternalMessage<Ipv4Net>>, _dump_peer: UniqueId) -> AddRouteStatus {
            AddRouteStatus::Used
        }
        fn push(&mut self, _origin_peer: UniqueId) {}
    }

    #[test]
    fn changed_route_is_cached_and_flag_cleared() {
        let mut cache = CacheTable::<Ipv4Net>::new();
        let counter = Rc::new(RefCell::new(Counter::default()));
        cache.set_downstream(counter.clone());
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let route = SubnetRoute::new(net, Rc::new(PathAttributeList::default()), 2, PolicyTags::default());
        let msg = Rc::new(InternalMessage::new(route, 2, 1));
        msg.set_changed(true);
        cache.add_route(msg.clone());
        assert!(!msg.changed());
        assert_eq!(cache.cached.len(), 1);
        assert_eq!(counter.borrow().adds, 1);
    }
}
