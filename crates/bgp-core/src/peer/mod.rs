pub mod auth;
pub mod collision;
pub mod fsm;
pub mod session;
pub mod timer;

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bgp_packet::{NotifyCode, SessionConfig, UpdatePacket};

use crate::attr::{AttributeManager, FastPathAttributeList};
use crate::config::PeerConfig;
use crate::family::RoutedPrefix;
use crate::message::UniqueId;
use crate::policy::PolicyTags;
use crate::table::RibInTable;

use fsm::{validate_open, DampingState, Event, State};
use session::{SessionCaps, SessionWriter, SharedSessionConfig};
use timer::{NegotiatedParams, PeerTimers, TimerEvent};

#[derive(Debug, Default, Clone, Copy)]
pub struct PeerCounters {
    pub open_sent: u64,
    pub open_rcvd: u64,
    pub update_sent: u64,
    pub update_rcvd: u64,
    pub notification_sent: u64,
    pub notification_rcvd: u64,
    pub keepalive_sent: u64,
    pub keepalive_rcvd: u64,
    pub refresh_rcvd: u64,
}

/// Adapts one configured peering to the route-table stack: the FSM and
/// session live here, and `rib_in` is this peering's sole entry point into
/// the pipeline (plumbed once at construction, never swapped — what gets
/// spliced in and out on a peering flap is the `DeletionTable` downstream of
/// it, not this table itself).
pub struct PeerHandler<P: RoutedPrefix> {
    peername: IpAddr,
    local_as: u32,
    peer_as: u32,
    router_id: Ipv4Addr,
    config: PeerConfig,
    state: State,
    damping: DampingState,
    negotiated: NegotiatedParams,
    timers: PeerTimers,
    writer: Option<SessionWriter>,
    caps: SessionCaps,
    /// Parse settings the reader task shares; narrowed at OPEN time.
    session_config: SharedSessionConfig,
    /// Router ID the peer put in its OPEN, for collision resolution.
    remote_router_id: Option<Ipv4Addr>,
    peering_is_up: bool,
    stats: PeerCounters,
    attr_mgr: Rc<RefCell<AttributeManager>>,
    rib_in: RibInTable<P>,
    /// A downstream table reported `AddRouteStatus::Failure`: a broken
    /// pipeline invariant the owning instance must treat as fatal.
    pipeline_failed: bool,
}

impl<P: RoutedPrefix + Clone + std::fmt::Debug> PeerHandler<P> {
    pub fn new(
        ident: UniqueId,
        peername: IpAddr,
        local_as: u32,
        peer_as: u32,
        router_id: Ipv4Addr,
        config: PeerConfig,
        attr_mgr: Rc<RefCell<AttributeManager>>,
    ) -> Self {
        let ibgp = local_as == peer_as;
        let caps = SessionCaps { families: vec![P::AFI_SAFI], ..Default::default() };
        let session_config =
            Arc::new(Mutex::new(SessionConfig { four_octet_as: true, ibgp }));
        Self {
            peername,
            local_as,
            peer_as,
            router_id,
            config,
            state: State::Idle,
            damping: DampingState::default(),
            negotiated: NegotiatedParams::default(),
            timers: PeerTimers::default(),
            writer: None,
            caps,
            session_config,
            remote_router_id: None,
            peering_is_up: false,
            stats: PeerCounters::default(),
            attr_mgr,
            rib_in: RibInTable::new(ident),
            pipeline_failed: false,
        }
    }

    pub fn take_pipeline_failure(&mut self) -> bool {
        std::mem::take(&mut self.pipeline_failed)
    }

    pub fn peername(&self) -> IpAddr {
        self.peername
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peering_is_up(&self) -> bool {
        self.peering_is_up
    }

    pub fn stats(&self) -> PeerCounters {
        self.stats
    }

    pub fn rib_in(&mut self) -> &mut RibInTable<P> {
        &mut self.rib_in
    }

    pub fn is_passive(&self) -> bool {
        self.config.passive
    }

    pub fn auth_config(&self) -> &crate::config::AuthConfig {
        &self.config.auth
    }

    pub fn remote_router_id(&self) -> Option<Ipv4Addr> {
        self.remote_router_id
    }

    pub fn session_config(&self) -> SharedSessionConfig {
        self.session_config.clone()
    }

    pub fn wire_config(&self) -> SessionConfig {
        self.session_config.lock().expect("session config lock").clone()
    }

    /// Kicks a configured peer at startup: active peers begin connecting,
    /// passive ones arm their way into `Active` and wait for the remote
    /// side to dial in.
    pub fn start(&mut self, ident: UniqueId, tx: mpsc::Sender<TimerEvent>) {
        if self.is_passive() {
            timer::update_timers(ident, tx, &self.config.timer, None, true, &mut self.state, &mut self.timers);
            info!(peer = %self.peername, "passive peer waiting for an inbound connection");
        } else {
            self.handle_event(ident, tx, Event::Start);
        }
    }

    /// Drives one FSM transition, applying side effects (send OPEN/
    /// KEEPALIVE/NOTIFICATION, arm/disarm timers, note a restart for
    /// damping) according to the edge that was actually taken rather than
    /// just the destination state, matching the split between computing
    /// the next state and acting on the transition.
    pub fn handle_event(&mut self, ident: UniqueId, tx: mpsc::Sender<TimerEvent>, event: Event) {
        let prev = self.state;
        let event = match self.apply_pre_transition_effects(ident, &tx, event) {
            Some(event) => event,
            // The pre-phase consumed the event (e.g. a rejected OPEN that
            // already sent its NOTIFICATION); drop straight to Idle.
            None => {
                self.state = State::Idle;
                if prev != self.state {
                    self.note_transition(ident, tx, prev);
                }
                return;
            }
        };
        let next = fsm::next_state(prev, &event);
        self.state = next;

        if prev != next {
            self.note_transition(ident, tx, prev);
        }
    }

    fn note_transition(&mut self, ident: UniqueId, tx: mpsc::Sender<TimerEvent>, prev: State) {
        let next = self.state;
        if prev.is_established() && !next.is_established() {
            self.peering_is_up = false;
            let was_flap = self.damping.note_restart(
                std::time::Instant::now(),
                self.config.damping.window,
                self.config.damping.threshold,
            );
            if was_flap {
                warn!(peer = %self.peername, "peer oscillation threshold crossed, extending idle-hold");
            }
        }
        if !prev.is_established() && next.is_established() {
            self.peering_is_up = true;
            self.damping.reset();
            self.rib_in.ribin_peering_came_up();
        }
        info!(peer = %self.peername, from = prev.to_str(), to = next.to_str(), "fsm transition");
        let damping_hold = self
            .damping
            .damped(self.config.damping.threshold)
            .then(|| self.config.damping.idle_holdtime.as_secs());
        timer::update_timers(ident, tx, &self.config.timer, damping_hold, self.is_passive(), &mut self.state, &mut self.timers);
    }

    pub fn take_writer(&mut self) -> Option<SessionWriter> {
        self.writer.take()
    }

    /// Side effects that depend on the event itself. Returns the event to
    /// feed the transition table, or `None` when this phase already
    /// resolved the session's fate.
    fn apply_pre_transition_effects(
        &mut self,
        ident: UniqueId,
        tx: &mpsc::Sender<TimerEvent>,
        event: Event,
    ) -> Option<Event> {
        match event {
            Event::BgpOpen(open) => {
                self.stats.open_rcvd += 1;
                if let Err(reason) = validate_open(self.peer_as, &open) {
                    warn!(peer = %self.peername, ?reason, "rejecting OPEN");
                    self.send_notification(NotifyCode::OpenMsgError, reason.subcode(), Vec::new());
                    return None;
                }
                self.negotiated = timer::negotiate_and_arm(
                    ident,
                    tx.clone(),
                    &self.config.timer,
                    &mut self.timers,
                    open.hold_time,
                );
                self.remote_router_id = Some(open.router_id);
                let four_octet = open.four_octet_as().is_some() && self.caps.four_octet_asn;
                self.session_config.lock().expect("session config lock").four_octet_as = four_octet;
                // OPEN is acknowledged with an immediate KEEPALIVE.
                self.send_keepalive();
                Some(Event::BgpOpen(open))
            }
            Event::KeepaliveTimerExpires => {
                self.send_keepalive();
                Some(Event::KeepaliveTimerExpires)
            }
            Event::HoldTimerExpires => {
                self.send_notification(NotifyCode::HoldTimerExpired, 0, Vec::new());
                Some(Event::HoldTimerExpires)
            }
            Event::UpdateMsg(update) => {
                self.stats.update_rcvd += 1;
                timer::refresh_hold_timer(&self.timers);
                if self.state.is_established() {
                    self.apply_update(&update);
                } else {
                    debug!(peer = %self.peername, "UPDATE outside Established, ignored");
                }
                Some(Event::UpdateMsg(update))
            }
            Event::KeepAliveMsg => {
                self.stats.keepalive_rcvd += 1;
                timer::refresh_hold_timer(&self.timers);
                Some(Event::KeepAliveMsg)
            }
            Event::RouteRefreshMsg(refresh) => {
                self.stats.refresh_rcvd += 1;
                timer::refresh_hold_timer(&self.timers);
                Some(Event::RouteRefreshMsg(refresh))
            }
            Event::NotifMsg { code, sub_code } => {
                self.stats.notification_rcvd += 1;
                info!(peer = %self.peername, code, sub_code, "received NOTIFICATION");
                Some(Event::NotifMsg { code, sub_code })
            }
            Event::CorruptFrame(err) => {
                warn!(peer = %self.peername, %err, "corrupt frame, dropping session");
                self.send_notification(err.code, err.subcode, err.data.clone());
                Some(Event::CorruptFrame(err))
            }
            other => Some(other),
        }
    }

    /// Converts one received UPDATE into per-prefix calls on the RibIn.
    /// Withdrawals always apply; announcements run the two silent filters
    /// that keep bad routes out without killing the session (own AS in the
    /// path, own address as next hop), then flow downstream as a batch
    /// closed by a push.
    fn apply_update(&mut self, update: &UpdatePacket) {
        for net in P::withdrawn(update) {
            self.rib_in.delete_route(&net);
        }

        let announced = P::announced(update);
        if !announced.is_empty() {
            let looped = update
                .attrs
                .as_path
                .as_ref()
                .is_some_and(|path| path.contains(self.local_as));
            let own_next_hop = P::next_hop(&update.attrs)
                .is_some_and(|nh| nh == IpAddr::V4(self.router_id));
            if looped || own_next_hop {
                debug!(peer = %self.peername, looped, own_next_hop, "announcement silently filtered");
            } else {
                // The stored bundle must not drag the packet's prefix lists
                // along: two UPDATEs carrying the same attributes would
                // otherwise never intern to the same list.
                let mut attrs = update.attrs.clone();
                if let Some(reach) = attrs.mp_reach.as_mut() {
                    reach.nlri.clear();
                }
                attrs.mp_unreach = None;
                let mut attr_mgr = self.attr_mgr.borrow_mut();
                for net in announced {
                    let status = self.rib_in.add_route(
                        net,
                        FastPathAttributeList::new(attrs.clone()),
                        PolicyTags::default(),
                        &mut attr_mgr,
                    );
                    if status == crate::message::AddRouteStatus::Failure {
                        self.pipeline_failed = true;
                    }
                }
            }
        }
        self.rib_in.push();
    }

    pub fn send_open(&mut self) {
        if let Some(writer) = self.writer.as_ref() {
            writer.send_open(self.local_as, self.router_id, self.config.timer.hold_time() as u16, &self.caps);
            self.stats.open_sent += 1;
        }
    }

    pub fn send_keepalive(&mut self) {
        if let Some(writer) = self.writer.as_ref() {
            writer.send_keepalive();
            self.stats.keepalive_sent += 1;
        }
    }

    pub fn send_notification(&mut self, code: NotifyCode, subcode: u8, data: Vec<u8>) {
        if let Some(writer) = self.writer.as_ref() {
            writer.send_notification(code, subcode, data);
            self.stats.notification_sent += 1;
        }
    }

    pub fn send_update_frame(&mut self, frame: bytes::BytesMut) {
        if let Some(writer) = self.writer.as_ref() {
            writer.send_frame(frame);
            self.stats.update_sent += 1;
        }
    }

    pub fn has_session(&self) -> bool {
        self.writer.is_some()
    }

    pub fn attach_writer(&mut self, writer: SessionWriter) {
        self.writer = Some(writer);
    }

    pub fn detach_writer(&mut self) {
        self.writer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use bgp_packet::OpenPacket;
    use ipnet::Ipv4Net;

    fn handler() -> PeerHandler<Ipv4Net> {
        let addr: IpAddr = "2.2.2.2".parse().unwrap();
        let config = PeerConfig {
            peer_addr: addr,
            peer_as: 65002,
            passive: false,
            timer: Default::default(),
            auth: Default::default(),
            damping: Default::default(),
        };
        PeerHandler::new(
            2,
            addr,
            65001,
            65002,
            "1.1.1.1".parse().unwrap(),
            config,
            Rc::new(RefCell::new(AttributeManager::new())),
        )
    }

    fn open_from(asn: u32) -> Event {
        Event::BgpOpen(Box::new(OpenPacket::new(
            asn,
            90,
            "2.2.2.2".parse().unwrap(),
            vec![bgp_packet::Capability::FourOctetAs(asn)],
        )))
    }

    #[tokio::test]
    async fn start_event_moves_out_of_idle() {
        let mut h = handler();
        let (tx, _rx) = mpsc::channel(8);
        h.handle_event(2, tx, Event::Start);
        assert_eq!(h.state(), State::Connect);
    }

    #[tokio::test]
    async fn establishing_bumps_peering_up_and_genid() {
        let mut h = handler();
        let (tx, _rx) = mpsc::channel(8);
        h.handle_event(2, tx.clone(), Event::Start);
        h.handle_event(2, tx.clone(), Event::TcpConnectionConfirmed);
        h.handle_event(2, tx.clone(), open_from(65002));
        h.handle_event(2, tx, Event::KeepAliveMsg);
        assert!(h.state().is_established());
        assert!(h.peering_is_up());
        assert_eq!(h.remote_router_id(), Some("2.2.2.2".parse().unwrap()));
    }

    #[tokio::test]
    async fn open_with_wrong_as_drops_to_idle() {
        let mut h = handler();
        let (tx, _rx) = mpsc::channel(8);
        h.handle_event(2, tx.clone(), Event::Start);
        h.handle_event(2, tx.clone(), Event::TcpConnectionConfirmed);
        h.handle_event(2, tx, open_from(65099));
        assert_eq!(h.state(), State::Idle);
    }

    #[tokio::test]
    async fn update_feeds_the_rib_in() {
        let mut h = handler();
        let (tx, _rx) = mpsc::channel(8);
        h.handle_event(2, tx.clone(), Event::Start);
        h.handle_event(2, tx.clone(), Event::TcpConnectionConfirmed);
        h.handle_event(2, tx.clone(), open_from(65002));
        h.handle_event(2, tx.clone(), Event::KeepAliveMsg);

        let update = UpdatePacket {
            nlri: vec!["10.10.10.0/24".parse().unwrap()],
            attrs: bgp_packet::PathAttributes {
                origin: Some(bgp_packet::Origin::Igp),
                as_path: Some(bgp_packet::AsPath::from_sequence(vec![65002])),
                next_hop: Some("20.20.20.1".parse().unwrap()),
                ..Default::default()
            },
            ..Default::default()
        };
        h.handle_event(2, tx, Event::UpdateMsg(Box::new(update)));
        let net: Ipv4Net = "10.10.10.0/24".parse().unwrap();
        assert!(h.rib_in.lookup_route(&net).is_some());
    }

    #[tokio::test]
    async fn own_as_in_path_is_silently_filtered() {
        let mut h = handler();
        let (tx, _rx) = mpsc::channel(8);
        h.handle_event(2, tx.clone(), Event::Start);
        h.handle_event(2, tx.clone(), Event::TcpConnectionConfirmed);
        h.handle_event(2, tx.clone(), open_from(65002));
        h.handle_event(2, tx.clone(), Event::KeepAliveMsg);

        let update = UpdatePacket {
            nlri: vec!["10.10.10.0/24".parse().unwrap()],
            attrs: bgp_packet::PathAttributes {
                origin: Some(bgp_packet::Origin::Igp),
                as_path: Some(bgp_packet::AsPath::from_sequence(vec![65002, 65001])),
                next_hop: Some("20.20.20.1".parse().unwrap()),
                ..Default::default()
            },
            ..Default::default()
        };
        h.handle_event(2, tx, Event::UpdateMsg(Box::new(update)));
        assert!(h.state().is_established());
        let net: Ipv4Net = "10.10.10.0/24".parse().unwrap();
        assert!(h.rib_in.lookup_route(&net).is_none());
    }
}
