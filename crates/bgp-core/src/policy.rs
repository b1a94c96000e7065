use std::rc::Rc;

use crate::attr::FastPathAttributeList;

/// Tags a route carries for policy match/set clauses. Opaque to the core:
/// the policy engine is an external collaborator reached only through
/// `PolicyFilter`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTags(pub Vec<u32>);

/// Identifies which of the three filter slots a `SubnetRoute` caches a
/// pointer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FilterId {
    Import = 0,
    SourceMatch = 1,
    Export = 2,
}

/// Outcome of running a route through a `PolicyFilter`.
pub enum FilterResult<A> {
    /// Route passes, possibly with attributes rewritten.
    Accept(FastPathAttributeList, std::marker::PhantomData<A>),
    /// Route is dropped.
    Reject,
    /// Decision deferred; the filter has queued the route for asynchronous
    /// evaluation and will deliver the result itself via `filter_and_store`.
    Deferred,
}

/// The interface the core consumes from the policy engine, kept to exactly
/// the calls `FilterTable` needs (configure/reset/apply); everything else
/// about policy evaluation lives outside the core.
pub trait PolicyFilter<A> {
    fn configure(&mut self, filter_id: FilterId, conf: &str);

    /// Invalidates every route's cached pointer for this filter by bumping
    /// its version; a route whose cached pointer no longer matches the
    /// current version must be re-evaluated from scratch rather than reuse
    /// the stale decision.
    fn reset(&mut self, filter_id: FilterId);

    fn version(&self, filter_id: FilterId) -> u64;

    /// Applies the filter to a route's attributes. `cached_version` is the
    /// version recorded on the route the last time this filter ran for it;
    /// when it matches `version()` the implementation may skip
    /// re-evaluation and return the cached verdict immediately.
    fn filter(
        &self,
        filter_id: FilterId,
        net: &A,
        attrs: FastPathAttributeList,
        cached_version: u64,
    ) -> (FilterResult<A>, u64);

    /// Deferred variant: the filter stores the route and will call back
    /// into the owning `FilterTable` once a verdict is ready, rather than
    /// blocking the single-threaded event loop.
    fn filter_and_store(&mut self, filter_id: FilterId, net: &A, attrs: Rc<FastPathAttributeList>);
}

/// Accepts every route unchanged. No policy engine is wired into this core
/// (that evaluation lives outside it entirely), so the import `FilterTable`
/// slot uses this until a real one is plugged in.
#[derive(Debug, Default)]
pub struct PassthroughFilter;

/// The attribute rewrites BGP itself mandates on export, independent of any
/// configured policy: prepend the local AS and substitute our own next hop
/// toward an external peer, strip LOCAL_PREF there, and default it toward
/// an internal one (RFC 4271 §5.1).
#[derive(Debug)]
pub struct StandardExportFilter {
    pub local_as: u32,
    pub ebgp: bool,
    pub self_address: std::net::Ipv4Addr,
}

impl<A> PolicyFilter<A> for StandardExportFilter {
    fn configure(&mut self, _filter_id: FilterId, _conf: &str) {}

    fn reset(&mut self, _filter_id: FilterId) {}

    fn version(&self, _filter_id: FilterId) -> u64 {
        0
    }

    fn filter(
        &self,
        _filter_id: FilterId,
        _net: &A,
        mut attrs: FastPathAttributeList,
        _cached_version: u64,
    ) -> (FilterResult<A>, u64) {
        if self.ebgp {
            attrs.0.as_path.get_or_insert_with(Default::default).prepend(self.local_as);
            if attrs.0.next_hop.is_some() {
                attrs.0.next_hop = Some(self.self_address);
            }
            attrs.0.local_pref = None;
        } else {
            attrs.0.local_pref.get_or_insert(100);
        }
        (FilterResult::Accept(attrs, std::marker::PhantomData), 0)
    }

    fn filter_and_store(&mut self, _filter_id: FilterId, _net: &A, _attrs: Rc<FastPathAttributeList>) {}
}

impl<A> PolicyFilter<A> for PassthroughFilter {
    fn configure(&mut self, _filter_id: FilterId, _conf: &str) {}

    fn reset(&mut self, _filter_id: FilterId) {}

    fn version(&self, _filter_id: FilterId) -> u64 {
        0
    }

    fn filter(&self, _filter_id: FilterId, _net: &A, attrs: FastPathAttributeList, cached_version: u64) -> (FilterResult<A>, u64) {
        let _ = cached_version;
        (FilterResult::Accept(attrs, std::marker::PhantomData), 0)
    }

    fn filter_and_store(&mut self, _filter_id: FilterId, _net: &A, _attrs: Rc<FastPathAttributeList>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::Ipv4Net;

    #[test]
    fn passthrough_always_accepts() {
        let filter = PassthroughFilter;
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let (result, version) = filter.filter(FilterId::Import, &net, FastPathAttributeList::default(), 0);
        assert!(matches!(result, FilterResult::Accept(_, _)));
        assert_eq!(version, 0);
    }

    #[test]
    fn ebgp_export_prepends_and_rewrites_next_hop() {
        let filter = StandardExportFilter {
            local_as: 65001,
            ebgp: true,
            self_address: "1.1.1.1".parse().unwrap(),
        };
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let attrs = FastPathAttributeList::new(bgp_packet::PathAttributes {
            as_path: Some(bgp_packet::AsPath::from_sequence(vec![65002])),
            next_hop: Some("20.20.20.1".parse().unwrap()),
            local_pref: Some(200),
            ..Default::default()
        });
        let (result, _) = PolicyFilter::<Ipv4Net>::filter(&filter, FilterId::Export, &net, attrs, 0);
        let FilterResult::Accept(out, _) = result else { panic!("expected accept") };
        assert_eq!(out.0.as_path.unwrap().first_as(), Some(65001));
        assert_eq!(out.0.next_hop, Some("1.1.1.1".parse().unwrap()));
        assert_eq!(out.0.local_pref, None);
    }

    #[test]
    fn ibgp_export_defaults_local_pref() {
        let filter = StandardExportFilter {
            local_as: 65001,
            ebgp: false,
            self_address: "1.1.1.1".parse().unwrap(),
        };
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let (result, _) =
            PolicyFilter::<Ipv4Net>::filter(&filter, FilterId::Export, &net, FastPathAttributeList::default(), 0);
        let FilterResult::Accept(out, _) = result else { panic!("expected accept") };
        assert_eq!(out.0.local_pref, Some(100));
    }
}
