use std::cell::RefCell;
use std::rc::Rc;

use ptree::Prefix;

use crate::attr::{AttributeManager, FastPathAttributeList};
use crate::message::{AddRouteStatus, Genid, InternalMessage, UniqueId};
use crate::policy::{FilterId, FilterResult, PolicyFilter};
use crate::route::SubnetRoute;
use crate::table::{OutputState, RouteTable};

/// Applies one direction's policy to every route flowing through it:
/// rewrites attributes (AS_PATH prepend, LOCAL_PREF, nexthop-self, MED),
/// drops filtered routes, or defers to the policy engine via
/// `PolicyFilter::filter_and_store`.
pub struct FilterTable<P: Prefix, F> {
    filter_id: FilterId,
    filter: F,
    attr_mgr: Rc<RefCell<AttributeManager>>,
    downstream: Option<Rc<RefCell<dyn RouteTable<P>>>>,
}

impl<P: Prefix + Clone, F: PolicyFilter<P>> FilterTable<P, F> {
    pub fn new(filter_id: FilterId, filter: F, attr_mgr: Rc<RefCell<AttributeManager>>) -> Self {
        Self { filter_id, filter, attr_mgr, downstream: None }
    }

    pub fn set_downstream(&mut self, downstream: Rc<RefCell<dyn RouteTable<P>>>) {
        self.downstream = Some(downstream);
    }

    fn apply(&self, net: &P, route: &Rc<SubnetRoute<P>>) -> Option<Rc<SubnetRoute<P>>> {
        let cached_version = route.policy_filters.get(self.filter_id);
        let current_version = self.filter.version(self.filter_id);
        let fpa = FastPathAttributeList::new(route.attributes.inner().clone());
        let (result, version) = self.filter.filter(self.filter_id, net, fpa, cached_version.min(current_version));
        route.policy_filters.set(self.filter_id, version);
        match result {
            FilterResult::Accept(fpa, _) => {
                let canonical = fpa.canonicalize();
                let interned = self.attr_mgr.borrow_mut().register(canonical);
                if Rc::ptr_eq(&interned, &route.attributes) {
                    Some(route.clone())
                } else {
                    Some(SubnetRoute::new(net.clone(), interned, route.origin_peer, route.policy_tags.clone()))
                }
            }
            FilterResult::Reject => None,
            FilterResult::Deferred => None,
        }
    }
}

impl<P: Prefix + Clone, F: PolicyFilter<P>> RouteTable<P> for FilterTable<P, F> {
    fn add_route(&mut self, msg: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let Some(downstream) = self.downstream.as_ref() else { return AddRouteStatus::Unused };
        match self.apply(&msg.route().net, msg.route()) {
            Some(route) if Rc::ptr_eq(&route, msg.route()) => downstream.borrow_mut().add_route(msg),
            Some(route) => {
                let new_msg = Rc::new(InternalMessage::new(route, msg.origin_peer(), msg.genid()));
                new_msg.set_changed(true);
                downstream.borrow_mut().add_route(new_msg)
            }
            None => AddRouteStatus::Filtered,
        }
    }

    fn replace_route(&mut self, old: Rc<InternalMessage<P>>, new: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let Some(downstream) = self.downstream.as_ref() else { return AddRouteStatus::Unused };
        match self.apply(&new.route().net, new.route()) {
            Some(route) => {
                let filtered_new = if Rc::ptr_eq(&route, new.route()) {
                    new
                } else {
                    let m = Rc::new(InternalMessage::new(route, new.origin_peer(), new.genid()));
                    m.set_changed(true);
                    m
                };
                downstream.borrow_mut().replace_route(old, filtered_new)
            }
            None => {
                downstream.borrow_mut().delete_route(old);
                AddRouteStatus::Filtered
            }
        }
    }

    fn delete_route(&mut self, msg: Rc<InternalMessage<P>>) {
        if let Some(d) = self.downstream.as_ref() {
            d.borrow_mut().delete_route(msg);
        }
    }

    fn route_dump(&mut self, msg: Rc<InternalMessage<P>>, dump_peer: UniqueId) -> AddRouteStatus {
        let Some(downstream) = self.downstream.as_ref() else { return AddRouteStatus::Unused };
        match self.apply(&msg.route().net, msg.route()) {
            Some(route) => {
                let m = if Rc::ptr_eq(&route, msg.route()) { msg } else { Rc::new(InternalMessage::new(route, msg.origin_peer(), msg.genid())) };
                downstream.borrow_mut().route_dump(m, dump_peer)
            }
            None => AddRouteStatus::Filtered,
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
