use std::collections::VecDeque;
use std::rc::Rc;

use ptree::Prefix;

use crate::message::{AddRouteStatus, Genid, InternalMessage, UniqueId};
use crate::route::SubnetRoute;
use crate::table::{OutputState, RouteTable};

/// Per-peer output stage: the final table before the wire. Queues pending
/// announcements (with the route, since encoding needs its attribute list)
/// and withdrawals per prefix, and reports itself busy once the queue
/// passes `high_watermark` so upstream tables stop emitting until room
/// opens up again — the only back-pressure point in the pipeline; every
/// other table runs its traversal to completion synchronously.
pub struct RibOutTable<P: Prefix> {
    peer: UniqueId,
    pending_adds: VecDeque<(P, Rc<SubnetRoute<P>>)>,
    pending_deletes: VecDeque<P>,
    high_watermark: usize,
    min_adv_interval: std::time::Duration,
    last_sent: Option<std::time::Instant>,
}

impl<P: Prefix + PartialEq> RibOutTable<P> {
    pub fn new(peer: UniqueId, min_adv_interval: std::time::Duration) -> Self {
        Self {
            peer,
            pending_adds: VecDeque::new(),
            pending_deletes: VecDeque::new(),
            high_watermark: 4096,
            min_adv_interval,
            last_sent: None,
        }
    }

    pub fn peer(&self) -> UniqueId {
        self.peer
    }

    pub fn queue_depth(&self) -> usize {
        self.pending_adds.len() + self.pending_deletes.len()
    }

    /// True when MRAI has not yet elapsed since the last batch was sent to
    /// this peer; `flush` callers honor this by leaving work queued.
    pub fn throttled(&self, now: std::time::Instant) -> bool {
        self.last_sent.map(|t| now.duration_since(t) < self.min_adv_interval).unwrap_or(false)
    }

    /// Drains everything queued into encode-ready batches: announcements
    /// with the routes whose attribute lists the encoder needs, and bare
    /// withdrawn prefixes. Empty when MRAI is still running.
    pub fn drain(&mut self, now: std::time::Instant) -> (Vec<(P, Rc<SubnetRoute<P>>)>, Vec<P>) {
        if self.throttled(now) || self.queue_depth() == 0 {
            return (Vec::new(), Vec::new());
        }
        self.last_sent = Some(now);
        (self.pending_adds.drain(..).collect(), self.pending_deletes.drain(..).collect())
    }
}

impl<P: Prefix + Clone + PartialEq> RouteTable<P> for RibOutTable<P> {
    fn add_route(&mut self, msg: Rc<InternalMessage<P>>) -> AddRouteStatus {
        let net = msg.route().net.clone();
        // A queued withdraw for the same prefix is superseded, not sent.
        self.pending_deletes.retain(|n| *n != net);
        self.pending_adds.retain(|(n, _)| *n != net);
        self.pending_adds.push_back((net, msg.route().clone()));
        AddRouteStatus::Used
    }

    fn replace_route(
        &mut self,
        _old: Rc<InternalMessage<P>>,
        new: Rc<InternalMessage<P>>,
    ) -> AddRouteStatus {
        self.add_route(new)
    }

    fn delete_route(&mut self, msg: Rc<InternalMessage<P>>) {
        let net = msg.route().net.clone();
        let had_queued_add = self.pending_adds.iter().any(|(n, _)| *n == net);
        self.pending_adds.retain(|(n, _)| *n != net);
        // An announcement the peer never saw needs no withdraw.
        if !had_queued_add {
            self.pending_deletes.push_back(net);
        }
    }

    fn route_dump(&mut self, msg: Rc<InternalMessage<P>>, dump_peer: UniqueId) -> AddRouteStatus {
        if dump_peer != self.peer {
            return AddRouteStatus::Unused;
        }
        self.add_route(msg)
    }

    fn push(&mut self, _origin_peer: UniqueId) {
        // Encoding happens at the owning instance's flush, which drains
        // this queue on its own tick; a push only marks batch boundaries.
    }

    fn output_state(&self) -> OutputState {
        if self.queue_depth() >= self.high_watermark {
            OutputState::Busy
        } else {
            OutputState::Idle
        }
    }

    fn get_next_message(&mut self, _next: &P) {
        // Resuming is driven by the caller re-reading from upstream via
        // `lookup_route`; this table has nothing more to do than accept
        // new messages again, which it already does once queue_depth drops.
    }

    fn peering_went_down(&mut self, _peer: UniqueId, _genid: Genid) {}
    fn peering_down_complete(&mut self, _peer: UniqueId, _genid: Genid) {}
    fn peering_came_up(&mut self, _peer: UniqueId, _genid: Genid) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::PathAttributeList;
    use crate::policy::PolicyTags;
    use crate::route::SubnetRoute;
    use ipnet::Ipv4Net;
    use std::time::Duration;

    fn route(net: Ipv4Net) -> Rc<SubnetRoute<Ipv4Net>> {
        SubnetRoute::new(net, Rc::new(PathAttributeList::default()), 2, PolicyTags::default())
    }

    #[test]
    fn queues_until_drained() {
        let mut ribout = RibOutTable::<Ipv4Net>::new(3, Duration::from_secs(0));
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        ribout.add_route(Rc::new(InternalMessage::new(route(net), 2, 1)));
        assert_eq!(ribout.queue_depth(), 1);
        let (adds, _) = ribout.drain(std::time::Instant::now());
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].0, net);
        assert_eq!(ribout.queue_depth(), 0);
    }

    #[test]
    fn delete_cancels_an_unsent_announcement() {
        let mut ribout = RibOutTable::<Ipv4Net>::new(3, Duration::from_secs(0));
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let r = route(net);
        ribout.add_route(Rc::new(InternalMessage::new(r.clone(), 2, 1)));
        ribout.delete_route(Rc::new(InternalMessage::new(r, 2, 1)));
        let (adds, deletes) = ribout.drain(std::time::Instant::now());
        assert!(adds.is_empty());
        assert!(deletes.is_empty());
    }

    #[test]
    fn mrai_throttles_the_second_drain() {
        let mut ribout = RibOutTable::<Ipv4Net>::new(3, Duration::from_secs(30));
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        ribout.add_route(Rc::new(InternalMessage::new(route(net), 2, 1)));
        let now = std::time::Instant::now();
        let (adds, _) = ribout.drain(now);
        assert_eq!(adds.len(), 1);
        let net2: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        ribout.add_route(Rc::new(InternalMessage::new(route(net2), 2, 1)));
        let (adds, _) = ribout.drain(now + Duration::from_secs(1));
        assert!(adds.is_empty());
        assert_eq!(ribout.queue_depth(), 1);
    }

    #[test]
    fn reports_busy_past_high_watermark_without_losing_messages() {
        let mut ribout = RibOutTable::<Ipv4Net>::new(3, Duration::from_secs(0));
        ribout.high_watermark = 1;
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        ribout.add_route(Rc::new(InternalMessage::new(route(net), 2, 1)));
        assert_eq!(ribout.output_state(), OutputState::Busy);
        let net2: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        let status = ribout.add_route(Rc::new(InternalMessage::new(route(net2), 2, 1)));
        assert_eq!(status, AddRouteStatus::Used);
        assert_eq!(ribout.queue_depth(), 2);
    }
}
