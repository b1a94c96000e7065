use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::net::IpAddr;

use ptree::Prefix;
use tracing::{info, warn};

use crate::attr::{AttributeManager, FastPathAttributeList};
use crate::family::RoutedPrefix;
use crate::message::{UniqueId, UNIQUE_ID_RIB_IPC};
use crate::policy::PolicyTags;
use crate::table::{RibInTable, RouteTable};

/// Where a redistributed route came from, echoed back so BGP can tag its
/// own re-origination distinctly from a route it learned from the RIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOrigin {
    Static,
    Connected,
    Ospf,
    Isis,
    Rip,
    Kernel,
}

/// One registered redistribution stream: `unicast`/`multicast` select which
/// SAFI the stream covers, `prefix_filter` narrows it to a subtree, `cookie`
/// is opaque and echoed back on every subsequent call so BGP can tell two
/// concurrently-active streams for the same protocol apart.
#[derive(Debug, Clone)]
pub struct RedistRequest<P: Prefix> {
    pub protocol: String,
    pub unicast: bool,
    pub multicast: bool,
    pub prefix_filter: Option<P>,
    pub cookie: String,
}

/// Consumed from the RIB: registers interest in a protocol's routes, then
/// receives an initial dump followed by live add/delete notifications.
/// `UNIQUE_ID_RIB_IPC` (see `message::UNIQUE_ID_RIB_IPC`) is this stream's
/// fixed Decision fan-in identity — the RIB looks like just another peer to
/// the route-table pipeline, with no FSM of its own.
pub trait RedistributionSink<P: Prefix> {
    fn redist_enable(&mut self, request: RedistRequest<P>);

    fn starting_route_dump(&mut self, cookie: &str);

    fn add_route(
        &mut self,
        prefix: P,
        nexthop: IpAddr,
        ifname: &str,
        vifname: &str,
        metric: u32,
        admin_distance: u8,
        cookie: &str,
        origin: ProtocolOrigin,
    );

    fn delete_route(&mut self, prefix: P, cookie: &str);

    fn finishing_route_dump(&mut self, cookie: &str);
}

/// Birth/death tracking for the RIB and FEA components BGP depends on,
/// with no RPC transport behind it. The glue layer refuses to install
/// routes until both report alive, so a speaker that boots before its
/// companion daemons never pushes routes into a void.
pub trait ComponentWatcher {
    fn rib_is_alive(&self) -> bool;
    fn fea_is_alive(&self) -> bool;

    fn ready(&self) -> bool {
        self.rib_is_alive() && self.fea_is_alive()
    }
}

/// The simplest possible `ComponentWatcher`: both components are assumed
/// alive once constructed. Suitable for a single-process deployment with no
/// separate RIB/FEA daemons to wait on.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl ComponentWatcher for AlwaysReady {
    fn rib_is_alive(&self) -> bool {
        true
    }

    fn fea_is_alive(&self) -> bool {
        true
    }
}

/// The concrete redistribution consumer: routes the RIB redistributes to
/// BGP enter the pipeline here, through a `RibInTable` that answers to the
/// reserved `UNIQUE_ID_RIB_IPC` fan-in identity. To every table downstream
/// the RIB is just another peer, except that its "peering" is the RIB
/// daemon's own liveness as reported by the `ComponentWatcher`.
pub struct RibRedistribution<P: RoutedPrefix> {
    rib_in: RibInTable<P>,
    attr_mgr: Rc<RefCell<AttributeManager>>,
    watcher: Box<dyn ComponentWatcher>,
    streams: HashMap<String, RedistRequest<P>>,
}

impl<P: RoutedPrefix + Clone + std::fmt::Debug> RibRedistribution<P> {
    pub fn new(attr_mgr: Rc<RefCell<AttributeManager>>, watcher: Box<dyn ComponentWatcher>) -> Self {
        Self { rib_in: RibInTable::new(UNIQUE_ID_RIB_IPC), attr_mgr, watcher, streams: HashMap::new() }
    }

    pub const IDENT: UniqueId = UNIQUE_ID_RIB_IPC;

    pub fn rib_in(&mut self) -> &mut RibInTable<P> {
        &mut self.rib_in
    }

    /// Plumb into the shared pipeline and mark the pseudo-peering up, so
    /// its genid is live before the first redistributed route arrives.
    pub fn plumb(&mut self, downstream: Rc<RefCell<dyn RouteTable<P>>>) {
        self.rib_in.set_downstream(downstream);
        self.rib_in.ribin_peering_came_up();
    }

    fn stream_wants(&self, cookie: &str, prefix: &P) -> bool {
        match self.streams.get(cookie) {
            Some(request) => request.prefix_filter.as_ref().map(|f| f.covers(prefix)).unwrap_or(true),
            // An unknown cookie is a stream we never enabled; tolerated
            // with a warning like any other redistribution mismatch.
            None => false,
        }
    }
}

impl<P: RoutedPrefix + Clone + std::fmt::Debug> RedistributionSink<P> for RibRedistribution<P> {
    fn redist_enable(&mut self, request: RedistRequest<P>) {
        info!(protocol = %request.protocol, cookie = %request.cookie, "redistribution enabled");
        self.streams.insert(request.cookie.clone(), request);
    }

    fn starting_route_dump(&mut self, cookie: &str) {
        info!(cookie, "redistribution dump starting");
    }

    fn add_route(
        &mut self,
        prefix: P,
        nexthop: IpAddr,
        _ifname: &str,
        _vifname: &str,
        metric: u32,
        _admin_distance: u8,
        cookie: &str,
        origin: ProtocolOrigin,
    ) {
        if !self.watcher.ready() {
            warn!(?prefix, "redistributed route dropped, RIB/FEA not both alive yet");
            return;
        }
        if !self.stream_wants(cookie, &prefix) {
            warn!(?prefix, cookie, "redistributed route outside any enabled stream");
            return;
        }
        let mut attrs = bgp_packet::PathAttributes {
            origin: Some(bgp_packet::Origin::Incomplete),
            as_path: Some(bgp_packet::AsPath::default()),
            med: Some(metric),
            ..Default::default()
        };
        if let IpAddr::V4(v4) = nexthop {
            attrs.next_hop = Some(v4);
        }
        let _ = origin;
        self.rib_in.add_route(
            prefix,
            FastPathAttributeList::new(attrs),
            PolicyTags::default(),
            &mut self.attr_mgr.borrow_mut(),
        );
    }

    fn delete_route(&mut self, prefix: P, cookie: &str) {
        if !self.stream_wants(cookie, &prefix) {
            warn!(?prefix, cookie, "redistributed delete outside any enabled stream");
            return;
        }
        self.rib_in.delete_route(&prefix);
    }

    fn finishing_route_dump(&mut self, cookie: &str) {
        info!(cookie, "redistribution dump finished");
        self.rib_in.push();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_ready_reports_ready() {
        assert!(AlwaysReady.ready());
    }

    #[derive(Default)]
    struct HalfUp {
        rib: bool,
    }
    impl ComponentWatcher for HalfUp {
        fn rib_is_alive(&self) -> bool {
            self.rib
        }
        fn fea_is_alive(&self) -> bool {
            false
        }
    }

    #[test]
    fn not_ready_until_both_components_report_alive() {
        let watcher = HalfUp { rib: true };
        assert!(!watcher.ready());
    }
}
