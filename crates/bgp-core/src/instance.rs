use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use bgp_packet::{PathAttributes, SessionConfig, HEADER_LEN, MAX_MESSAGE_LEN};

use crate::attr::{AttributeManager, PathAttributeList};
use crate::config::SpeakerConfig;
use crate::crashdump::{CrashDumpManager, CrashDumper};
use crate::dump::DumpIterator;
use crate::family::RoutedPrefix;
use crate::message::{UniqueId, UNIQUE_ID_FIRST_PEER};
use crate::peer::collision::{self, AcceptOpen, Resolution};
use crate::peer::fsm::{Event, State};
use crate::peer::session::{self, ConnectResult, SessionEvent, SessionWriter};
use crate::peer::timer::TimerEvent;
use crate::peer::PeerHandler;
use crate::policy::{FilterId, PassthroughFilter, StandardExportFilter};
use crate::redistribution::{AlwaysReady, RibRedistribution};
use crate::table::{
    CacheTable, DecisionTable, DeletionTable, FanoutTable, FilterTable, RibOutTable, RouteTable,
};
use crate::task::Task;

const BGP_PORT: u16 = 179;

/// Routes dumped toward a catching-up peer per scheduling round, per dump.
const DUMP_BATCH: usize = 64;

/// Binds an IPv6-only listener so the IPv4 and IPv6 listeners never race
/// over the same socket, instead of relying on the platform default for
/// `IPV6_V6ONLY`.
fn bind_ipv6_listener() -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = format!("[::]:{BGP_PORT}").parse().unwrap();
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    let std_listener: std::net::TcpListener = socket.into();
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// Everything one configured peering needs wired into the shared pipeline:
/// its own `RibIn` (owned by `PeerHandler`), a per-peer import `FilterTable`
/// feeding the shared `CacheTable`, and a per-peer export `FilterTable`
/// feeding its own `RibOutTable`, registered as a `FanoutTable` subtree.
struct PeerSlot<P: RoutedPrefix> {
    handler: PeerHandler<P>,
    filter_in: Rc<RefCell<FilterTable<P, PassthroughFilter>>>,
    rib_out: Rc<RefCell<RibOutTable<P>>>,
    addr: IpAddr,
    /// Live socket-read task; dropping it tears the read loop down.
    reader: Option<Task<()>>,
    /// In-flight outbound connect attempt.
    connector: Option<Task<()>>,
    /// Bounded OPEN read on a colliding second connection.
    accept_probe: Option<Task<()>>,
    /// Write task of a `Stopped` session, held until its queued final
    /// NOTIFICATION has reached the wire.
    flushing: Option<Task<()>>,
}

/// A `DeletionTable` still draining a torn-down peering's trie, kept alive
/// until `step()` reports `Finished` so slow downstream consumers still see
/// every withdraw. The table registers itself with the crash-dump manager
/// for as long as it lives. `as_route_table` is the same table behind its
/// pipeline face, the identity used to splice it back out.
struct DrainingPeer<P: RoutedPrefix> {
    peer: UniqueId,
    table: Rc<RefCell<DeletionTable<P>>>,
    as_route_table: Rc<RefCell<dyn RouteTable<P>>>,
    _dump_handle: Rc<dyn CrashDumper>,
}

struct DrainDumper<P: RoutedPrefix>(Rc<RefCell<DeletionTable<P>>>);

impl<P: RoutedPrefix + Clone> CrashDumper for DrainDumper<P> {
    fn dump_state(&self) -> String {
        self.0.borrow().dump_state()
    }
}

pub enum Message {
    Accept(TcpStream, SocketAddr),
}

/// Owns one address family's worth of the BGP speaker: every configured
/// peering, the shared Cache/Decision/Fanout pipeline stage those peerings
/// fan into and out of, and the event loop that drives FSM transitions,
/// timers, socket plumbing, background deletion sweeps, catch-up dumps,
/// and RibOut flushes.
pub struct Instance<P: RoutedPrefix + Clone + std::fmt::Debug + std::hash::Hash + Eq + Ord + 'static> {
    asn: u32,
    router_id: Ipv4Addr,
    peers: HashMap<UniqueId, PeerSlot<P>>,
    addr_index: HashMap<IpAddr, UniqueId>,
    next_id: UniqueId,
    attr_mgr: Rc<RefCell<AttributeManager>>,
    crash_dumps: Rc<CrashDumpManager>,
    cache: Rc<RefCell<CacheTable<P>>>,
    decision: Rc<RefCell<DecisionTable<P>>>,
    fanout: Rc<RefCell<FanoutTable<P>>>,
    redist: RibRedistribution<P>,
    draining: Vec<DrainingPeer<P>>,
    active_dumps: HashMap<UniqueId, Rc<RefCell<DumpIterator<P>>>>,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    timer_tx: mpsc::Sender<TimerEvent>,
    timer_rx: mpsc::Receiver<TimerEvent>,
    peer_tx: mpsc::Sender<SessionEvent>,
    peer_rx: mpsc::Receiver<SessionEvent>,
    conn_tx: mpsc::Sender<ConnectResult>,
    conn_rx: mpsc::Receiver<ConnectResult>,
    accept_open_tx: mpsc::Sender<AcceptOpen>,
    accept_open_rx: mpsc::Receiver<AcceptOpen>,
    listen_task: Option<Task<()>>,
    listen_task6: Option<Task<()>>,
}

impl<P: RoutedPrefix + Clone + std::fmt::Debug + std::hash::Hash + Eq + Ord + 'static> Instance<P> {
    pub fn new(config: &SpeakerConfig) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let (timer_tx, timer_rx) = mpsc::channel(1024);
        let (peer_tx, peer_rx) = mpsc::channel(8192);
        let (conn_tx, conn_rx) = mpsc::channel(64);
        let (accept_open_tx, accept_open_rx) = mpsc::channel(64);

        let attr_mgr = Rc::new(RefCell::new(AttributeManager::new()));
        let cache = Rc::new(RefCell::new(CacheTable::new()));
        let decision = Rc::new(RefCell::new(DecisionTable::new()));
        let fanout = Rc::new(RefCell::new(FanoutTable::new()));
        decision.borrow_mut().set_downstream(fanout.clone());

        let mut redist = RibRedistribution::new(attr_mgr.clone(), Box::new(AlwaysReady));
        let redist_filter = Rc::new(RefCell::new(FilterTable::new(
            FilterId::Import,
            PassthroughFilter,
            attr_mgr.clone(),
        )));
        redist_filter.borrow_mut().set_downstream(cache.clone());
        redist.plumb(redist_filter);
        decision.borrow_mut().register_peer(
            RibRedistribution::<P>::IDENT,
            false,
            config.asn,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        );

        let mut instance = Self {
            asn: config.asn,
            router_id: config.router_id,
            peers: HashMap::new(),
            addr_index: HashMap::new(),
            next_id: UNIQUE_ID_FIRST_PEER,
            attr_mgr,
            crash_dumps: CrashDumpManager::new(),
            cache,
            decision,
            fanout,
            redist,
            draining: Vec::new(),
            active_dumps: HashMap::new(),
            tx,
            rx,
            timer_tx,
            timer_rx,
            peer_tx,
            peer_rx,
            conn_tx,
            conn_rx,
            accept_open_tx,
            accept_open_rx,
            listen_task: None,
            listen_task6: None,
        };
        for peer_config in &config.peers {
            instance.add_peer(peer_config.clone());
        }
        instance
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    pub fn redistribution(&mut self) -> &mut RibRedistribution<P> {
        &mut self.redist
    }

    fn allocate_id(&mut self) -> UniqueId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Plumbs a newly configured peer into the shared pipeline: a fresh
    /// `RibInTable` feeding a dedicated import `FilterTable` into the shared
    /// cache, and a dedicated export `FilterTable` feeding a fresh
    /// `RibOutTable` registered with the fanout. The peer's FSM starts
    /// `Idle`; nothing flows until it reaches `Established`.
    pub fn add_peer(&mut self, peer_config: crate::config::PeerConfig) -> UniqueId {
        let id = self.allocate_id();
        let addr = peer_config.peer_addr;
        let peer_as = peer_config.peer_as;
        let is_ebgp = peer_as != self.asn;

        let rib_out = Rc::new(RefCell::new(RibOutTable::<P>::new(
            id,
            Duration::from_secs(peer_config.timer.min_adv_interval()),
        )));
        let filter_out = Rc::new(RefCell::new(FilterTable::new(
            FilterId::Export,
            StandardExportFilter { local_as: self.asn, ebgp: is_ebgp, self_address: self.router_id },
            self.attr_mgr.clone(),
        )));
        filter_out.borrow_mut().set_downstream(rib_out.clone());
        self.fanout.borrow_mut().add_peer(id, filter_out);

        let filter_in = Rc::new(RefCell::new(FilterTable::new(
            FilterId::Import,
            PassthroughFilter,
            self.attr_mgr.clone(),
        )));
        filter_in.borrow_mut().set_downstream(self.cache.clone());

        self.decision.borrow_mut().register_peer(id, is_ebgp, peer_as, addr);

        let mut handler = PeerHandler::new(
            id,
            addr,
            self.asn,
            peer_as,
            self.router_id,
            peer_config,
            self.attr_mgr.clone(),
        );
        handler.rib_in().set_downstream(filter_in.clone());

        self.peers.insert(
            id,
            PeerSlot {
                handler,
                filter_in,
                rib_out,
                addr,
                reader: None,
                connector: None,
                accept_probe: None,
                flushing: None,
            },
        );
        self.addr_index.insert(addr, id);
        id
    }

    /// Detaches a peering's trie into a `DeletionTable` spliced where the
    /// `RibInTable` used to feed in, and begins draining it. The peer's slot
    /// stays in `peers` (its FSM keeps running and may come back up) —
    /// only the route state moves to the draining list.
    pub fn peering_went_down(&mut self, peer: UniqueId) {
        let Some(slot) = self.peers.get_mut(&peer) else { return };
        let (trie, genid) = slot.handler.rib_in().ribin_peering_went_down();
        info!(peer, genid, routes = trie.len(), "peering down, draining in background");
        let mut table = DeletionTable::new(peer, genid, trie);
        // Splice directly after the RibIn: the table inherits whatever the
        // RibIn fed before (the import filter, or an older DeletionTable
        // from a faster flap), and the RibIn now feeds through it so a
        // prefix re-learned mid-drain becomes a replace, not a bare add.
        let inherited = slot.handler.rib_in().downstream().unwrap_or_else(|| slot.filter_in.clone());
        table.set_downstream(inherited);
        table.initiate_background_deletion();
        let table = Rc::new(RefCell::new(table));
        let as_route_table: Rc<RefCell<dyn RouteTable<P>>> = table.clone();
        slot.handler.rib_in().set_downstream(as_route_table.clone());
        let dump_handle: Rc<dyn CrashDumper> = Rc::new(DrainDumper(table.clone()));
        self.crash_dumps.register(&dump_handle);
        self.draining.push(DrainingPeer { peer, table, as_route_table, _dump_handle: dump_handle });
    }

    /// Drives every in-flight `DeletionTable` by one chain; called on a
    /// fixed tick from `event_loop` rather than spawned as a task, since a
    /// background sweep closes over `Rc<RefCell<dyn RouteTable<P>>>` and so
    /// cannot cross a `tokio::spawn`'s `Send` boundary. A table that
    /// finishes is unspliced: whatever fed it (the RibIn or an even older
    /// DeletionTable) is repointed past it.
    fn step_deletions(&mut self) {
        let mut finished = Vec::new();
        for d in &self.draining {
            let progress = d.table.borrow_mut().step();
            if progress == crate::table::deletion::DeletionProgress::Finished {
                finished.push((d.peer, d.as_route_table.clone(), d.table.borrow().downstream()));
            }
        }
        for (peer, dead, inherited) in finished {
            let Some(inherited) = inherited else { continue };
            if let Some(slot) = self.peers.get_mut(&peer) {
                let points_at_dead = slot
                    .handler
                    .rib_in()
                    .downstream()
                    .is_some_and(|d| Rc::ptr_eq(&d, &dead));
                if points_at_dead {
                    slot.handler.rib_in().set_downstream(inherited.clone());
                }
            }
            for other in &self.draining {
                if other.peer != peer || Rc::ptr_eq(&other.as_route_table, &dead) {
                    continue;
                }
                let repoint = other
                    .table
                    .borrow()
                    .downstream()
                    .is_some_and(|d| Rc::ptr_eq(&d, &dead));
                if repoint {
                    other.table.borrow_mut().set_downstream(inherited.clone());
                }
            }
            self.draining.retain(|d| !Rc::ptr_eq(&d.as_route_table, &dead));
        }
    }

    /// Drains at most one queued IGP-nexthop change per RibIn per round, so
    /// a burst of RIB notifications never starves socket handling.
    fn step_nexthop_pushes(&mut self) {
        for slot in self.peers.values_mut() {
            slot.handler.rib_in().process_next_queued_nexthop();
        }
        self.redist.rib_in().process_next_queued_nexthop();
    }

    /// The RIB reports that the IGP path toward `nexthop` changed: every
    /// RibIn queues a sweep re-emitting the routes that resolve via it.
    pub fn igp_nexthop_changed(&mut self, nexthop: IpAddr) {
        for slot in self.peers.values_mut() {
            slot.handler.rib_in().igp_nexthop_changed(nexthop);
        }
        self.redist.rib_in().igp_nexthop_changed(nexthop);
    }

    /// New IGP distance to `peer`'s BGP nexthop, for Decision tie-break 6.
    pub fn set_igp_metric(&mut self, peer: UniqueId, metric: u32) {
        self.decision.borrow_mut().set_igp_metric(peer, metric);
    }

    /// Walks `Stopped` peers whose final NOTIFICATION has reached the wire
    /// and completes their transition to Idle.
    fn step_stopped_sessions(&mut self) {
        let drained: Vec<UniqueId> = self
            .peers
            .iter()
            .filter(|(_, s)| {
                s.handler.state() == State::Stopped
                    && s.flushing.as_ref().map(Task::is_finished).unwrap_or(true)
            })
            .map(|(id, _)| *id)
            .collect();
        for peer in drained {
            self.dispatch_peer_event(peer, Event::SendQueueDrained);
        }
    }

    fn peer_id_for_addr(&self, addr: IpAddr) -> Option<UniqueId> {
        self.addr_index.get(&addr).copied()
    }

    fn start_peers(&mut self) {
        let ids: Vec<UniqueId> = self.peers.keys().copied().collect();
        for id in ids {
            let timer_tx = self.timer_tx.clone();
            if let Some(slot) = self.peers.get_mut(&id) {
                slot.handler.start(id, timer_tx);
            }
            self.after_state_change(id, false);
        }
    }

    fn dispatch_peer_event(&mut self, peer: UniqueId, event: Event) {
        let timer_tx = self.timer_tx.clone();
        let (was_established, pipeline_failed) = {
            let Some(slot) = self.peers.get_mut(&peer) else { return };
            let was = slot.handler.state().is_established();
            slot.handler.handle_event(peer, timer_tx, event);
            (was, slot.handler.take_pipeline_failure())
        };
        if pipeline_failed {
            // Downstream tables would diverge from upstream truth if the
            // pipeline kept running past a broken invariant.
            let dump = self.write_crash_dump();
            error!(peer, ?dump, "route-table pipeline invariant violated, exiting");
            std::process::exit(1);
        }
        self.after_state_change(peer, was_established);
    }

    /// Side effects of whatever state the FSM landed in: sockets to open or
    /// drop, pipelines to drain, dumps to start or cancel.
    fn after_state_change(&mut self, peer: UniqueId, was_established: bool) {
        let (state, has_session) = {
            let Some(slot) = self.peers.get(&peer) else { return };
            (slot.handler.state(), slot.handler.has_session())
        };

        if was_established && !state.is_established() {
            if let Some(slot) = self.peers.get_mut(&peer) {
                slot.reader = None;
                slot.accept_probe = None;
                slot.handler.detach_writer();
            }
            self.fanout.borrow_mut().end_dump(peer);
            self.active_dumps.remove(&peer);
            self.peering_went_down(peer);
            return;
        }

        if !was_established && state.is_established() {
            self.begin_dump_for(peer);
        }

        if state == State::Connect && !has_session {
            let needs_connect = self.peers.get(&peer).is_some_and(|s| s.connector.is_none());
            if needs_connect {
                let addr = self.peers.get(&peer).map(|s| s.addr).expect("slot just read");
                let task = session::spawn_connect(peer, SocketAddr::new(addr, BGP_PORT), self.conn_tx.clone());
                if let Some(slot) = self.peers.get_mut(&peer) {
                    slot.connector = Some(task);
                }
            }
        }

        if state == State::Stopped {
            if let Some(slot) = self.peers.get_mut(&peer) {
                // The writer winds down gracefully so the queued final
                // NOTIFICATION still reaches the wire; the background tick
                // notices the finished flush and feeds `SendQueueDrained`
                // to complete the trip to Idle.
                slot.reader = None;
                slot.connector = None;
                slot.accept_probe = None;
                if let Some(writer) = slot.handler.take_writer() {
                    slot.flushing = Some(writer.into_flush_task());
                }
            }
        }

        if state == State::Idle {
            if let Some(slot) = self.peers.get_mut(&peer) {
                slot.reader = None;
                slot.connector = None;
                slot.accept_probe = None;
                slot.flushing = None;
                slot.handler.detach_writer();
            }
        }
    }

    /// Adopts a connected socket (either direction) as the peer's session:
    /// writer and reader attach, the FSM learns the transport is up, and
    /// our OPEN goes out.
    fn attach_session(&mut self, peer: UniqueId, stream: TcpStream) {
        let Some(slot) = self.peers.get_mut(&peer) else { return };
        let remote = stream.peer_addr().unwrap_or(SocketAddr::new(slot.addr, BGP_PORT));
        let now = chrono::Utc::now().timestamp();
        if let Err(err) =
            crate::peer::auth::apply_active_key(&stream, remote, slot.handler.auth_config(), now)
        {
            error!(peer, %err, "failed to install TCP MD5 key, continuing unsigned");
        }
        let (read_half, write_half) = stream.into_split();
        slot.handler.attach_writer(SessionWriter::spawn(write_half));
        slot.reader = Some(session::spawn_reader(
            peer,
            self.peer_tx.clone(),
            read_half,
            slot.handler.session_config(),
        ));
        self.dispatch_peer_event(peer, Event::TcpConnectionConfirmed);
        if let Some(slot) = self.peers.get_mut(&peer) {
            slot.handler.send_open();
        }
    }

    /// An incoming connection: the main session when none exists yet, a
    /// collision probe when one does.
    fn handle_accept(&mut self, stream: TcpStream, sockaddr: SocketAddr) {
        let addr = sockaddr.ip();
        let Some(peer) = self.peer_id_for_addr(addr) else {
            debug!(%addr, "connection from unconfigured address dropped");
            return;
        };
        let (state, has_session) = {
            let slot = self.peers.get(&peer).expect("indexed peer exists");
            (slot.handler.state(), slot.handler.has_session())
        };
        if !has_session && matches!(state, State::Idle | State::Connect | State::Active) {
            self.attach_session(peer, stream);
            return;
        }
        // Simultaneous open: hold the socket, read its OPEN without
        // advancing any FSM, resolve when it arrives.
        info!(peer, %addr, "simultaneous connection, holding for collision resolution");
        let probe = collision::spawn_open_reader(peer, stream, self.accept_open_tx.clone());
        if let Some(slot) = self.peers.get_mut(&peer) {
            slot.accept_probe = Some(probe);
        }
    }

    fn handle_connected(&mut self, result: ConnectResult) {
        let peer = result.peer;
        let has_session = {
            let Some(slot) = self.peers.get_mut(&peer) else { return };
            slot.connector = None;
            slot.handler.has_session()
        };
        match result.stream {
            Ok(stream) if !has_session => self.attach_session(peer, stream),
            Ok(_) => {
                // An accepted connection won the race; this one just closes.
                debug!(peer, "outbound connect finished after a session was already up");
            }
            Err(_) => self.dispatch_peer_event(peer, Event::TcpConnectionFails),
        }
    }

    /// RFC 4271 §6.8 resolution, once the held connection's OPEN is in
    /// hand: the side with the higher router ID keeps the connection it
    /// initiated. An established session is never preempted.
    fn handle_accept_open(&mut self, accepted: AcceptOpen) {
        let peer = accepted.peer;
        let Some(slot) = self.peers.get_mut(&peer) else {
            tokio::spawn(collision::reject_with_cease(accepted.stream));
            return;
        };
        slot.accept_probe = None;
        let established = slot.handler.state().is_established();
        let resolution = collision::resolve(self.router_id, accepted.open.router_id);
        if established || resolution == Resolution::ExistingWins {
            info!(peer, "collision resolved for the existing connection, ceasing the other");
            tokio::spawn(collision::reject_with_cease(accepted.stream));
            return;
        }
        info!(peer, "collision resolved for the accepted connection, swapping sockets");
        slot.reader = None;
        slot.handler.detach_writer();
        let (read_half, write_half) = accepted.stream.into_split();
        slot.handler.attach_writer(SessionWriter::spawn(write_half));
        slot.reader = Some(session::spawn_reader(
            peer,
            self.peer_tx.clone(),
            read_half,
            slot.handler.session_config(),
        ));
        slot.handler.send_open();
        // The OPEN observed on the surviving socket now drives the FSM.
        self.dispatch_peer_event(peer, Event::BgpOpen(accepted.open));
    }

    /// Freezes the upstream peer list and begins replaying the current
    /// route set toward a freshly-established peer, while the fanout
    /// arbitrates concurrent live changes against the dump's progress.
    fn begin_dump_for(&mut self, peer: UniqueId) {
        let mut upstreams: Vec<(UniqueId, crate::message::Genid)> =
            vec![(RibRedistribution::<P>::IDENT, self.redist.rib_in().genid())];
        for (id, slot) in self.peers.iter_mut() {
            if *id != peer && slot.handler.peering_is_up() {
                upstreams.push((*id, slot.handler.rib_in().genid()));
            }
        }
        info!(peer, upstreams = upstreams.len(), "starting catch-up dump");
        let iter = Rc::new(RefCell::new(DumpIterator::new(upstreams)));
        self.fanout.borrow_mut().begin_dump(peer, iter.clone());
        self.active_dumps.insert(peer, iter);
    }

    /// Advances every active catch-up dump by up to `DUMP_BATCH` routes,
    /// then retires the ones that have replayed everything and are no
    /// longer waiting on a background deletion to finish.
    fn step_dumps(&mut self) {
        let dumps: Vec<(UniqueId, Rc<RefCell<DumpIterator<P>>>)> =
            self.active_dumps.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (dump_peer, iter) in dumps {
            for _ in 0..DUMP_BATCH {
                let Some(upstream) = iter.borrow().current_peer() else { break };
                let last = iter.borrow().last_dumped().cloned();
                let progressed = if upstream == RibRedistribution::<P>::IDENT {
                    self.redist.rib_in().dump_route_after(last.as_ref(), dump_peer)
                } else {
                    match self.peers.get_mut(&upstream) {
                        Some(slot) => slot.handler.rib_in().dump_route_after(last.as_ref(), dump_peer),
                        None => None,
                    }
                };
                match progressed {
                    Some(net) => iter.borrow_mut().note_dumped(net),
                    None => iter.borrow_mut().advance_peer(),
                }
            }
            let done = {
                let it = iter.borrow();
                it.is_finished() && !it.waiting_for_deletion_completion()
            };
            if done {
                info!(peer = dump_peer, "catch-up dump complete");
                self.fanout.borrow_mut().end_dump(dump_peer);
                self.active_dumps.remove(&dump_peer);
            }
        }
    }

    /// Drains every established peer's RibOut into UPDATE frames: withdraws
    /// first, then announcements grouped by shared attribute list, each
    /// group split into frames that stay under the 4096-byte limit.
    fn flush_ribouts(&mut self) {
        let now = Instant::now();
        let ids: Vec<UniqueId> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(slot) = self.peers.get_mut(&id) else { continue };
            if !slot.handler.peering_is_up() || !slot.handler.has_session() {
                continue;
            }
            let (adds, deletes) = slot.rib_out.borrow_mut().drain(now);
            if adds.is_empty() && deletes.is_empty() {
                continue;
            }
            let cfg = slot.handler.wire_config();
            for frame in build_update_frames::<P>(&cfg, adds, deletes) {
                slot.handler.send_update_frame(frame);
            }
        }
    }

    pub async fn listen(&mut self) -> anyhow::Result<()> {
        let tx = self.tx.clone();
        let mut any_bound = false;

        if let Ok(listener) = TcpListener::bind(("0.0.0.0", BGP_PORT)).await {
            any_bound = true;
            let tx = tx.clone();
            self.listen_task = Some(Task::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((socket, sockaddr)) => {
                            if tx.send(Message::Accept(socket, sockaddr)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                    }
                }
            }));
        }

        if let Ok(listener) = bind_ipv6_listener() {
            any_bound = true;
            self.listen_task6 = Some(Task::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((socket, sockaddr)) => {
                            if tx.send(Message::Accept(socket, sockaddr)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                    }
                }
            }));
        }

        if !any_bound {
            anyhow::bail!("failed to bind BGP listener on either address family");
        }
        Ok(())
    }

    pub fn crash_dump(&self) -> String {
        self.crash_dumps.crash_dump()
    }

    /// Writes the collected crash dump under the user's temp directory and
    /// returns the path, the last thing done before a fatal exit.
    pub fn write_crash_dump(&self) -> std::io::Result<std::path::PathBuf> {
        let path = std::env::temp_dir().join(format!("bgpd-crash-{}.txt", std::process::id()));
        std::fs::write(&path, self.crash_dump())?;
        Ok(path)
    }

    pub async fn event_loop(&mut self) {
        if let Err(err) = self.listen().await {
            error!(%err, "BGP listener failed to bind");
        }
        self.start_peers();
        let mut background_tick = tokio::time::interval(Duration::from_millis(100));
        let mut flush_tick = tokio::time::interval(Duration::from_millis(200));
        let mut dump_tick = tokio::time::interval(Duration::from_millis(50));
        let mut gc_tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                Some(msg) = self.rx.recv() => {
                    match msg {
                        Message::Accept(socket, sockaddr) => self.handle_accept(socket, sockaddr),
                    }
                }
                Some(SessionEvent { peer, event }) = self.peer_rx.recv() => {
                    self.dispatch_peer_event(peer, event);
                }
                Some(TimerEvent { peer, event }) = self.timer_rx.recv() => {
                    self.dispatch_peer_event(peer, event);
                }
                Some(result) = self.conn_rx.recv() => {
                    self.handle_connected(result);
                }
                Some(accepted) = self.accept_open_rx.recv() => {
                    self.handle_accept_open(accepted);
                }
                _ = background_tick.tick() => {
                    self.step_deletions();
                    self.step_nexthop_pushes();
                    self.step_stopped_sessions();
                }
                _ = dump_tick.tick() => {
                    self.step_dumps();
                }
                _ = flush_tick.tick() => {
                    self.flush_ribouts();
                }
                _ = gc_tick.tick() => {
                    self.attr_mgr.borrow_mut().gc();
                }
            }
        }
    }
}

/// Encodes one flush's worth of work into wire frames: withdraws first,
/// then each shared-attribute group of announcements, all chunked so no
/// frame can cross the 4096-byte limit.
fn build_update_frames<P: RoutedPrefix + Clone>(
    cfg: &SessionConfig,
    adds: Vec<(P, Rc<crate::route::SubnetRoute<P>>)>,
    deletes: Vec<P>,
) -> Vec<BytesMut> {
    let mut frames = Vec::new();

    for chunk in chunk_prefixes(&deletes, prefix_budget(0)) {
        let update = P::pack(Vec::new(), chunk, PathAttributes::default());
        match update.encode(cfg) {
            Ok(frame) => frames.push(frame),
            Err(err) => error!(%err, "withdraw batch failed to encode"),
        }
    }

    // Group announcements by interned attribute-list identity so each
    // distinct bundle is encoded once per frame.
    let mut groups: Vec<(Rc<PathAttributeList>, Vec<P>)> = Vec::new();
    for (net, route) in adds {
        match groups.iter_mut().find(|(attrs, _)| Rc::ptr_eq(attrs, &route.attributes)) {
            Some((_, nets)) => nets.push(net),
            None => groups.push((route.attributes.clone(), vec![net])),
        }
    }
    for (attrs, nets) in groups {
        let attr_len = attrs.inner().encoded_len(cfg);
        for chunk in chunk_prefixes(&nets, prefix_budget(attr_len)) {
            let update = P::pack(chunk, Vec::new(), attrs.inner().clone());
            match update.encode(cfg) {
                Ok(frame) => frames.push(frame),
                Err(err) => error!(%err, "announcement batch failed to encode"),
            }
        }
    }
    frames
}

/// Room left for prefix bytes in a frame whose attributes take `attr_len`:
/// header, the two length fields, and slack for the MP attribute envelope
/// a non-IPv4 family wraps its prefixes in.
fn prefix_budget(attr_len: usize) -> usize {
    MAX_MESSAGE_LEN - HEADER_LEN - 4 - attr_len - 64
}

fn chunk_prefixes<P: RoutedPrefix + Clone>(nets: &[P], budget: usize) -> Vec<Vec<P>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0usize;
    for net in nets {
        let size = 1 + (usize::from(net.prefix_len()) + 7) / 8;
        if used + size > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += size;
        current.push(net.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_packet::{AsPath, BgpMessage, Origin};
    use ipnet::Ipv4Net;

    fn config() -> SpeakerConfig {
        SpeakerConfig { asn: 65001, router_id: "1.1.1.1".parse().unwrap(), peers: Vec::new() }
    }

    fn peer_config(addr: &str, peer_as: u32) -> crate::config::PeerConfig {
        crate::config::PeerConfig {
            peer_addr: addr.parse().unwrap(),
            peer_as,
            passive: false,
            timer: Default::default(),
            auth: Default::default(),
            damping: Default::default(),
        }
    }

    #[tokio::test]
    async fn add_peer_registers_in_decision_and_fanout() {
        let cfg = config();
        let mut instance = Instance::<Ipv4Net>::new(&cfg);
        let id = instance.add_peer(peer_config("2.2.2.2", 65002));
        assert!(instance.peers.contains_key(&id));
        assert_eq!(instance.peer_id_for_addr("2.2.2.2".parse().unwrap()), Some(id));
    }

    #[tokio::test]
    async fn redistributed_route_reaches_decision() {
        use crate::redistribution::{RedistRequest, RedistributionSink};
        let cfg = config();
        let mut instance = Instance::<Ipv4Net>::new(&cfg);
        let net: Ipv4Net = "172.16.0.0/16".parse().unwrap();
        instance.redistribution().redist_enable(RedistRequest {
            protocol: "static".into(),
            unicast: true,
            multicast: false,
            prefix_filter: None,
            cookie: "s0".into(),
        });
        instance.redistribution().starting_route_dump("s0");
        instance.redistribution().add_route(
            net,
            "192.168.0.1".parse().unwrap(),
            "eth0",
            "eth0",
            10,
            1,
            "s0",
            crate::redistribution::ProtocolOrigin::Static,
        );
        instance.redistribution().finishing_route_dump("s0");
        assert!(instance.redist.rib_in().lookup_route(&net).is_some());
    }

    #[test]
    fn frames_chunk_under_the_wire_limit() {
        let attrs = Rc::new(PathAttributeList(PathAttributes {
            origin: Some(Origin::Igp),
            as_path: Some(AsPath::from_sequence(vec![65001])),
            next_hop: Some("1.1.1.1".parse().unwrap()),
            ..Default::default()
        }));
        let mut adds = Vec::new();
        for i in 0..2000u32 {
            let net = Ipv4Net::new(std::net::Ipv4Addr::from(0x0a00_0000 + (i << 8)), 24).unwrap();
            let route = crate::route::SubnetRoute::new(
                net,
                attrs.clone(),
                UNIQUE_ID_FIRST_PEER,
                crate::policy::PolicyTags::default(),
            );
            adds.push((net, route));
        }
        let cfg = SessionConfig::default();
        let frames = build_update_frames::<Ipv4Net>(&cfg, adds, vec!["10.99.0.0/16".parse().unwrap()]);
        assert!(frames.len() > 2);
        let mut total = 0;
        for frame in &frames {
            assert!(frame.len() <= MAX_MESSAGE_LEN);
            let BgpMessage::Update(update) = BgpMessage::decode(frame, &cfg).unwrap() else {
                panic!("expected UPDATE");
            };
            total += update.nlri.len() + update.withdrawn.len();
        }
        assert_eq!(total, 2001);
    }
}
