use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::attr::PathAttributeList;
use crate::message::UniqueId;
use crate::policy::{FilterId, PolicyTags};

/// One of the three cached policy-filter pointers on a route, indexed by
/// `FilterId`. Cleared (set to `None`) whenever `PolicyFilter::reset` bumps
/// the filter's version, per §9's "cache policy filter pointer on both
/// routes" note (see DESIGN.md for the ordering this implies).
#[derive(Clone, Default)]
pub struct PolicyFilterPointers {
    slots: [Cell<u64>; 3],
}

impl PolicyFilterPointers {
    pub fn get(&self, id: FilterId) -> u64 {
        self.slots[id as usize].get()
    }

    pub fn set(&self, id: FilterId, version: u64) {
        self.slots[id as usize].set(version);
    }
}

/// Per-route flags. None of these carry routing semantics visible to other
/// peers, so they may be mutated in place even after the route has been
/// published downstream (see the immutability invariant on `SubnetRoute`).
#[derive(Default)]
pub struct RouteFlags {
    pub is_winner: Cell<bool>,
    pub in_use: Cell<bool>,
    pub filtered: Cell<bool>,
    pub nexthop_resolved: Cell<bool>,
    pub from_previous_peering: Cell<bool>,
}

/// An immutable route record, generic over address family `A`.
///
/// Everything but the flags and cached filter pointers is fixed at
/// construction; a changed route is a new `SubnetRoute`, never a mutation of
/// an existing one, so that every `Rc<SubnetRoute<A>>` handed downstream
/// keeps describing what it described when it was handed out.
pub struct SubnetRoute<A> {
    pub net: A,
    pub attributes: Rc<PathAttributeList>,
    pub original_route: Option<Weak<SubnetRoute<A>>>,
    pub igp_metric: Cell<u32>,
    pub policy_tags: PolicyTags,
    pub policy_filters: PolicyFilterPointers,
    pub flags: RouteFlags,
    pub origin_peer: UniqueId,
    chain: ChainLink<A>,
}

/// Intrusive doubly-linked ring of all current routes sharing the same
/// interned attribute list, used by `BgpTrie`'s pathmap to propagate a
/// nexthop change across every route affected without re-hashing the trie.
struct ChainLink<A> {
    next: Cell<Option<Weak<SubnetRoute<A>>>>,
    prev: Cell<Option<Weak<SubnetRoute<A>>>>,
}

impl<A> Default for ChainLink<A> {
    fn default() -> Self {
        Self { next: Cell::new(None), prev: Cell::new(None) }
    }
}

impl<A> SubnetRoute<A> {
    pub fn new(
        net: A,
        attributes: Rc<PathAttributeList>,
        origin_peer: UniqueId,
        policy_tags: PolicyTags,
    ) -> Rc<Self> {
        Rc::new(Self {
            net,
            attributes,
            original_route: None,
            igp_metric: Cell::new(0),
            policy_tags,
            policy_filters: PolicyFilterPointers::default(),
            flags: RouteFlags::default(),
            origin_peer,
            chain: ChainLink::default(),
        })
    }

    pub fn is_winner(&self) -> bool {
        self.flags.is_winner.get()
    }

    pub fn set_is_winner(&self, winner: bool) {
        self.flags.is_winner.set(winner);
    }
}

/// `ChainedSubnetRoute` is a trait over `SubnetRoute` exposing the ring
/// operations used by the pathmap. A chain of length 1 self-references; an
/// erase detaches the member and relinks its neighbours; the last reference
/// dropping frees the storage (`Rc` refcounting does this for free).
pub trait ChainedSubnetRoute<A> {
    fn chain_init_self(self: &Rc<Self>);
    fn chain_insert_after(self: &Rc<Self>, new: &Rc<SubnetRoute<A>>);
    fn chain_detach(self: &Rc<Self>);
    fn chain_next(&self) -> Option<Rc<SubnetRoute<A>>>;
}

impl<A> ChainedSubnetRoute<A> for SubnetRoute<A> {
    fn chain_init_self(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.chain.next.set(Some(weak.clone()));
        self.chain.prev.set(Some(weak));
    }

    fn chain_insert_after(self: &Rc<Self>, new: &Rc<SubnetRoute<A>>) {
        let old_next = self.chain.next.replace(Some(Rc::downgrade(new)));
        new.chain.prev.set(Some(Rc::downgrade(self)));
        new.chain.next.set(old_next.clone());
        if let Some(old_next) = old_next.and_then(|w| w.upgrade()) {
            old_next.chain.prev.set(Some(Rc::downgrade(new)));
        }
    }

    fn chain_detach(self: &Rc<Self>) {
        let prev = self.chain.prev.take().and_then(|w| w.upgrade());
        let next = self.chain.next.take().and_then(|w| w.upgrade());
        if let (Some(prev), Some(next)) = (&prev, &next) {
            prev.chain.next.set(Some(Rc::downgrade(next)));
            next.chain.prev.set(Some(Rc::downgrade(prev)));
        }
    }

    fn chain_next(&self) -> Option<Rc<SubnetRoute<A>>> {
        self.chain.next.take().inspect(|w| self.chain.next.set(Some(w.clone()))).and_then(|w| w.upgrade())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::PathAttributeList;
    use ipnet::Ipv4Net;

    #[test]
    fn new_route_has_no_flags_set() {
        let attrs = Rc::new(PathAttributeList::default());
        let route = SubnetRoute::<Ipv4Net>::new(
            "10.0.0.0/24".parse().unwrap(),
            attrs,
            2,
            PolicyTags::default(),
        );
        assert!(!route.is_winner());
        assert!(!route.flags.in_use.get());
    }

    #[test]
    fn chain_of_one_self_references() {
        let attrs = Rc::new(PathAttributeList::default());
        let route = SubnetRoute::<Ipv4Net>::new("10.0.0.0/24".parse().unwrap(), attrs, 2, PolicyTags::default());
        route.chain_init_self();
        let next = route.chain_next().unwrap();
        assert!(Rc::ptr_eq(&route, &next));
    }
}
