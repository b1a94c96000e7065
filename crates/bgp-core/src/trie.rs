use std::collections::BTreeMap;
use std::rc::Rc;

use ptree::{Prefix, PrefixTree};

use crate::attr::PathAttributeList;
use crate::route::{ChainedSubnetRoute, SubnetRoute};

/// Two indices over the same set of routes, generic over the prefix type
/// `P` (an `Ipv4Net`/`Ipv6Net`-shaped `ptree::Prefix`).
///
/// - `trie`: longest-prefix-match over `P`, built on `ptree::PrefixTree`.
/// - `pathmap`: an ordered map from canonical attribute-list identity to the
///   head of the chain of routes sharing it, used to walk every route
///   affected by a nexthop change in O(chains sharing that nexthop) instead
///   of a full trie scan.
pub struct BgpTrie<P: Prefix> {
    trie: PrefixTree<P, Rc<SubnetRoute<P>>>,
    pathmap: BTreeMap<PathmapKey, Rc<SubnetRoute<P>>>,
}

/// Pathmap is keyed by the attribute list's interned identity (its `Rc`
/// pointer) rather than its contents: two distinct interned lists are
/// always distinct chains even if they happened to compare equal before
/// interning collapsed them, which cannot happen once the attribute
/// manager is the sole source of `Rc<PathAttributeList>` handles.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
struct PathmapKey(usize);

fn pathmap_key(attrs: &Rc<PathAttributeList>) -> PathmapKey {
    PathmapKey(Rc::as_ptr(attrs) as usize)
}

impl<P: Prefix + Clone> BgpTrie<P> {
    pub fn new() -> Self {
        Self { trie: PrefixTree::new(), pathmap: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    /// Inserts into both indices. Fails if `net` is already present; the
    /// caller must `erase` first, matching the contract that a `SubnetRoute`
    /// is immutable once published — replacing means erase-then-insert, not
    /// mutate-in-place.
    pub fn insert(&mut self, net: P, route: Rc<SubnetRoute<P>>) -> Result<(), crate::error::CoreError> {
        if self.trie.get(&net).is_some() {
            return Err(crate::error::CoreError::DuplicateInsert);
        }
        let key = pathmap_key(&route.attributes);
        route.chain_init_self();
        if let Some(head) = self.pathmap.get(&key) {
            head.chain_insert_after(&route);
        } else {
            self.pathmap.insert(key, route.clone());
        }
        self.trie.insert(net, route);
        Ok(())
    }

    /// Removes from both indices, relinking the pathmap chain (or dropping
    /// the chain's pathmap entry entirely when the erased route was its only
    /// member).
    pub fn erase(&mut self, net: &P) -> Option<Rc<SubnetRoute<P>>> {
        let route = self.trie.remove(net)?;
        let key = pathmap_key(&route.attributes);
        let next = route.chain_next();
        route.chain_detach();
        match next {
            Some(next) if !Rc::ptr_eq(&next, &route) => {
                self.pathmap.insert(key, next);
            }
            _ => {
                self.pathmap.remove(&key);
            }
        }
        Some(route)
    }

    /// Exact match.
    pub fn lookup_node(&self, net: &P) -> Option<&Rc<SubnetRoute<P>>> {
        self.trie.get(net)
    }

    /// Longest-prefix match for a host address expressed as the
    /// most-specific prefix of the family (`/32` for IPv4, `/128` for
    /// IPv6). `ascend` yields the value-bearing prefixes covering `addr`
    /// most specific first, so the first item is the match.
    pub fn find(&self, addr: &P) -> Option<&Rc<SubnetRoute<P>>> {
        self.trie.ascend(addr).map(|(_, v)| v).next()
    }

    /// First chain whose canonical attribute list's interned identity is
    /// `>= pa_list`, resuming a paused nexthop-change sweep from a known
    /// position.
    pub fn pathmap_lower_bound(
        &self,
        pa_list: &Rc<PathAttributeList>,
    ) -> impl Iterator<Item = &Rc<SubnetRoute<P>>> {
        let key = pathmap_key(pa_list);
        self.pathmap.range(key..).map(|(_, v)| v)
    }

    pub fn pathmap_iter(&self) -> impl Iterator<Item = &Rc<SubnetRoute<P>>> {
        self.pathmap.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&P, &Rc<SubnetRoute<P>>)> {
        self.trie.iter()
    }

    /// The next stored route strictly after `last` in iteration order (the
    /// first route when `last` is `None`); how a paused dump resumes
    /// without keeping a borrow alive across the pause.
    pub fn next_after(&self, last: Option<&P>) -> Option<(&P, &Rc<SubnetRoute<P>>)> {
        self.trie.next_after(last)
    }
}

impl<P: Prefix + Clone> Default for BgpTrie<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UNIQUE_ID_FIRST_PEER;
    use crate::policy::PolicyTags;
    use ipnet::Ipv4Net;

    fn route(net: Ipv4Net) -> Rc<SubnetRoute<Ipv4Net>> {
        SubnetRoute::new(net, Rc::new(PathAttributeList::default()), UNIQUE_ID_FIRST_PEER, PolicyTags::default())
    }

    #[test]
    fn insert_then_erase_round_trips() {
        let mut trie = BgpTrie::new();
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        trie.insert(net, route(net)).unwrap();
        assert_eq!(trie.len(), 1);
        assert!(trie.erase(&net).is_some());
        assert_eq!(trie.len(), 0);
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut trie = BgpTrie::new();
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        trie.insert(net, route(net)).unwrap();
        assert!(trie.insert(net, route(net)).is_err());
    }

    #[test]
    fn find_is_longest_prefix_match() {
        let mut trie = BgpTrie::new();
        let wide: Ipv4Net = "10.0.0.0/8".parse().unwrap();
        let narrow: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        trie.insert(wide, route(wide)).unwrap();
        trie.insert(narrow, route(narrow)).unwrap();
        let addr: Ipv4Net = "10.1.2.3/32".parse().unwrap();
        let found = trie.find(&addr).unwrap();
        assert_eq!(found.net, narrow);
    }

    #[test]
    fn chain_sharing_attrs_groups_in_pathmap() {
        let mut trie = BgpTrie::new();
        let attrs = Rc::new(PathAttributeList::default());
        let a: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let b: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        let ra = SubnetRoute::new(a, attrs.clone(), UNIQUE_ID_FIRST_PEER, PolicyTags::default());
        let rb = SubnetRoute::new(b, attrs.clone(), UNIQUE_ID_FIRST_PEER, PolicyTags::default());
        trie.insert(a, ra).unwrap();
        trie.insert(b, rb).unwrap();
        assert_eq!(trie.pathmap_iter().count(), 1);
    }
}
