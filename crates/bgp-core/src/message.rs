use std::cell::Cell;
use std::rc::Rc;

use crate::route::SubnetRoute;

/// Generation ID of a RibIn peering instance. Bumped on every
/// `peering_came_up`, skipping zero so `GENID_UNKNOWN` stays unambiguous.
pub type Genid = u32;

pub const GENID_UNKNOWN: Genid = 0;

/// Bumps `genid`, skipping zero on wrap.
///
/// `genid` only needs to disambiguate the live peering from whatever a
/// lingering `DeletionTable` is still draining, so aliasing after a full
/// `u32` wrap is accepted rather than guarded against (see DESIGN.md).
pub fn next_genid(current: Genid) -> Genid {
    let next = current.wrapping_add(1);
    if next == GENID_UNKNOWN { 1 } else { next }
}

/// Unique, process-lifetime identifier for a peer's position in the
/// pipeline: allocated sequentially, with low values reserved for internal
/// handlers (the RIB-IPC route source and the route-aggregation handler)
/// that also need a stable Decision fan-in key.
pub type UniqueId = u32;

pub const UNIQUE_ID_RIB_IPC: UniqueId = 0;
pub const UNIQUE_ID_AGGREGATION: UniqueId = 1;
pub const UNIQUE_ID_FIRST_PEER: UniqueId = 2;

/// The unit of propagation through the route-table stack.
///
/// `changed` and `push` are interior-mutable on purpose: a table downstream
/// of the one that produced a message may need to mark it as already cached
/// (`changed`) or force it to be treated as the close of a batch (`push`)
/// without taking ownership away from the producer, mirroring the original
/// `mutable` fields on a `const`-passed reference.
#[derive(Clone)]
pub struct InternalMessage<A> {
    route: Rc<SubnetRoute<A>>,
    origin_peer: UniqueId,
    genid: Genid,
    changed: Cell<bool>,
    push: Cell<bool>,
    from_previous_peering: Cell<bool>,
}

impl<A> InternalMessage<A> {
    pub fn new(route: Rc<SubnetRoute<A>>, origin_peer: UniqueId, genid: Genid) -> Self {
        Self {
            route,
            origin_peer,
            genid,
            changed: Cell::new(false),
            push: Cell::new(false),
            from_previous_peering: Cell::new(false),
        }
    }

    pub fn route(&self) -> &Rc<SubnetRoute<A>> {
        &self.route
    }

    pub fn origin_peer(&self) -> UniqueId {
        self.origin_peer
    }

    pub fn genid(&self) -> Genid {
        self.genid
    }

    pub fn changed(&self) -> bool {
        self.changed.get()
    }

    pub fn set_changed(&self, changed: bool) {
        self.changed.set(changed);
    }

    pub fn clear_changed(&self) {
        self.changed.set(false);
    }

    pub fn push(&self) -> bool {
        self.push.get()
    }

    pub fn set_push(&self, push: bool) {
        self.push.set(push);
    }

    /// Overrides `push` from a table downstream of the one that actually
    /// closed the batch (DecisionTable uses this to merge several upstream
    /// pushes into one).
    pub fn force_clear_push(&self) {
        self.push.set(false);
    }

    pub fn from_previous_peering(&self) -> bool {
        self.from_previous_peering.get()
    }

    pub fn set_from_previous_peering(&self) {
        self.from_previous_peering.set(true);
    }
}

/// Status returned by a downstream table's `add_route`/`replace_route`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRouteStatus {
    /// New winner, or otherwise reached output.
    Used,
    /// Stored but lost Decision.
    Unused,
    /// Rejected by policy.
    Filtered,
    /// Invariant violation; propagated upstream and logged.
    Failure,
}
