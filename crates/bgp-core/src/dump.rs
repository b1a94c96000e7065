use std::collections::{HashMap, HashSet};

use crate::message::{Genid, UniqueId};

/// Status of one upstream peer within a single `DumpIterator`'s replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDumpState {
    StillToDump,
    CurrentlyDumping,
    DownDuringDump,
    DownBeforeDump,
    CompletelyDumped,
    NewPeer,
    FirstSeenDuringDump,
}

/// What to do with a prefix when deciding whether it belongs to the dump,
/// used by `route_change_is_valid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeOp {
    Add,
    Delete,
}

struct PeerRecord<P> {
    status: PeerDumpState,
    genid: Genid,
    last_net_before_down: Option<P>,
}

/// Created per newly-plumbed downstream peer. Replays every currently
/// chosen route from every upstream peer without ever emitting a route that
/// has since been withdrawn, and without omitting one a concurrent event
/// would otherwise leave unreported.
///
/// `P` is the prefix type; the iterator only needs an `Ord` comparison
/// matching the trie's iteration order to decide "already past this point"
/// (§4.7 step 4 depends on that ordering being exactly the trie's).
pub struct DumpIterator<P> {
    peers: Vec<UniqueId>,
    records: HashMap<UniqueId, PeerRecord<P>>,
    current: usize,
    last_dumped_net: Option<P>,
    deleting_genids: HashSet<(UniqueId, Genid)>,
}

impl<P: Ord + Clone> DumpIterator<P> {
    /// Freezes the ordered list of upstream peers at creation time.
    pub fn new(peers: Vec<(UniqueId, Genid)>) -> Self {
        let mut records = HashMap::new();
        let order = peers.iter().map(|(id, _)| *id).collect();
        for (id, genid) in peers {
            records.insert(id, PeerRecord { status: PeerDumpState::StillToDump, genid, last_net_before_down: None });
        }
        let mut iter = Self { peers: order, records, current: 0, last_dumped_net: None, deleting_genids: HashSet::new() };
        iter.enter_current();
        iter
    }

    fn enter_current(&mut self) {
        if let Some(id) = self.peers.get(self.current) {
            if let Some(rec) = self.records.get_mut(id) {
                if rec.status == PeerDumpState::StillToDump {
                    rec.status = PeerDumpState::CurrentlyDumping;
                }
            }
        }
    }

    pub fn current_peer(&self) -> Option<UniqueId> {
        self.peers.get(self.current).copied()
    }

    /// The checkpoint a resumed dump continues from.
    pub fn last_dumped(&self) -> Option<&P> {
        self.last_dumped_net.as_ref()
    }

    /// The genid recorded for the peer presently being dumped, or `None`
    /// once the dump has moved past the last upstream peer.
    pub fn current_genid(&self) -> Option<Genid> {
        let peer = self.current_peer()?;
        self.records.get(&peer).map(|r| r.genid)
    }

    /// Records the last prefix successfully emitted for the peer presently
    /// being dumped, then advances past it on the next `advance_peer` call.
    pub fn note_dumped(&mut self, net: P) {
        self.last_dumped_net = Some(net);
    }

    /// The current peer's trie is exhausted; move to the next one.
    pub fn advance_peer(&mut self) {
        if let Some(id) = self.peers.get(self.current) {
            if let Some(rec) = self.records.get_mut(id) {
                if rec.status == PeerDumpState::CurrentlyDumping {
                    rec.status = PeerDumpState::CompletelyDumped;
                }
            }
        }
        self.current += 1;
        self.last_dumped_net = None;
        self.enter_current();
    }

    pub fn is_finished(&self) -> bool {
        self.current >= self.peers.len()
    }

    pub fn peering_went_down(&mut self, peer: UniqueId) {
        let Some(rec) = self.records.get_mut(&peer) else { return };
        match rec.status {
            PeerDumpState::CurrentlyDumping => {
                rec.status = PeerDumpState::DownDuringDump;
                rec.last_net_before_down = self.last_dumped_net.clone();
                self.deleting_genids.insert((peer, rec.genid));
                self.advance_peer();
            }
            PeerDumpState::StillToDump => {
                rec.status = PeerDumpState::DownBeforeDump;
            }
            _ => {}
        }
    }

    pub fn peering_came_up(&mut self, peer: UniqueId, genid: Genid) {
        match self.records.get_mut(&peer) {
            None => {
                self.records.insert(peer, PeerRecord { status: PeerDumpState::NewPeer, genid, last_net_before_down: None });
            }
            Some(rec) if rec.status == PeerDumpState::FirstSeenDuringDump => {
                rec.status = PeerDumpState::NewPeer;
                rec.genid = genid;
            }
            Some(_) => {}
        }
    }

    pub fn peering_down_complete(&mut self, peer: UniqueId, genid: Genid) {
        self.deleting_genids.remove(&(peer, genid));
    }

    /// Decides whether a live route change for `peer`/`net`/`genid` should
    /// be forwarded to the peer this iterator is dumping to, per the table
    /// in §4.7.
    pub fn route_change_is_valid(&self, peer: UniqueId, net: &P, genid: Genid, op: RouteChangeOp) -> bool {
        let Some(rec) = self.records.get(&peer) else {
            // Unknown upstream. A genuinely new peering announces itself
            // via peering_came_up before any route flows, so a bare delete
            // from a peer first seen mid-dump can only be background
            // deletion residue from before this dump began.
            return op == RouteChangeOp::Add;
        };
        if genid < rec.genid {
            return false;
        }
        match rec.status {
            PeerDumpState::StillToDump => false,
            PeerDumpState::CurrentlyDumping => match &self.last_dumped_net {
                Some(last) if peer == self.current_peer().unwrap_or(peer) => net <= last,
                _ => false,
            },
            PeerDumpState::DownDuringDump => match &rec.last_net_before_down {
                Some(last) => net <= last,
                None => false,
            },
            PeerDumpState::DownBeforeDump => false,
            PeerDumpState::CompletelyDumped | PeerDumpState::NewPeer => true,
            PeerDumpState::FirstSeenDuringDump => false,
        }
    }

    /// True while the newly-plumbed RibOut must still wait before declaring
    /// itself caught up: either a DeletionTable is still draining a peering
    /// this dump observed, or some upstream peer hasn't finished its replay.
    pub fn waiting_for_deletion_completion(&self) -> bool {
        if !self.deleting_genids.is_empty() {
            return true;
        }
        self.records.values().any(|r| matches!(r.status, PeerDumpState::StillToDump | PeerDumpState::CurrentlyDumping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn still_to_dump_never_forwards_live() {
        let iter = DumpIterator::<u32>::new(vec![(2, 1), (3, 1)]);
        assert!(!iter.route_change_is_valid(3, &10, 1, RouteChangeOp::Add));
    }

    #[test]
    fn currently_dumping_forwards_only_past_the_last_dumped_net() {
        let mut iter = DumpIterator::<u32>::new(vec![(2, 1)]);
        iter.note_dumped(5);
        assert!(iter.route_change_is_valid(2, &3, 1, RouteChangeOp::Add));
        assert!(!iter.route_change_is_valid(2, &7, 1, RouteChangeOp::Add));
    }

    #[test]
    fn completely_dumped_always_forwards() {
        let mut iter = DumpIterator::<u32>::new(vec![(2, 1)]);
        iter.advance_peer();
        assert!(iter.route_change_is_valid(2, &100, 1, RouteChangeOp::Add));
    }

    #[test]
    fn obsolete_genid_never_forwards() {
        let iter = DumpIterator::<u32>::new(vec![(2, 5)]);
        assert!(!iter.route_change_is_valid(2, &1, 3, RouteChangeOp::Add));
    }

    #[test]
    fn deletes_from_a_peer_first_seen_mid_dump_are_residue() {
        let iter = DumpIterator::<u32>::new(vec![(2, 1)]);
        assert!(!iter.route_change_is_valid(9, &1, 1, RouteChangeOp::Delete));
        assert!(iter.route_change_is_valid(9, &1, 1, RouteChangeOp::Add));
    }

    #[test]
    fn finishes_only_after_every_peer_is_out_of_flight() {
        let mut iter = DumpIterator::<u32>::new(vec![(2, 1)]);
        assert!(iter.waiting_for_deletion_completion());
        iter.advance_peer();
        assert!(!iter.waiting_for_deletion_completion());
    }
}
