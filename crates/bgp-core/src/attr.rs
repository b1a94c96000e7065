use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bgp_packet::PathAttributes;

/// The canonical, immutable, interned form of a bundle of path attributes.
///
/// `bgp_packet::PathAttributes` already declares its fields in canonical
/// (type-code) order and encodes them by walking the fields top to bottom,
/// so it already constitutes the canonical form; this type exists to give
/// that form a distinct identity from the mutable working copy used during
/// parsing and filtering.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PathAttributeList(pub PathAttributes);

impl PathAttributeList {
    pub fn inner(&self) -> &PathAttributes {
        &self.0
    }
}

/// The mutable working copy used while parsing an UPDATE or while a
/// `FilterTable` rewrites attributes (AS_PATH prepend, LOCAL_PREF,
/// nexthop-self, MED rewrite). `canonicalize()` freezes it into a
/// `PathAttributeList` ready for interning.
#[derive(Clone, Debug, Default)]
pub struct FastPathAttributeList(pub PathAttributes);

impl FastPathAttributeList {
    pub fn new(attrs: PathAttributes) -> Self {
        Self(attrs)
    }

    /// `PathAttributes`' field order already is the canonical,
    /// type-code-sorted order, so canonicalization is a type-level
    /// operation: freeze the working copy, don't reorder it.
    pub fn canonicalize(self) -> PathAttributeList {
        PathAttributeList(self.0)
    }
}

/// Process-wide interner for `PathAttributeList`s: equal attribute bundles
/// share one `Rc<PathAttributeList>`, refcounted by that `Rc` itself. This
/// is what makes propagating a nexthop change across every route that
/// shares it cheap, and is the reason `SubnetRoute::attributes` is always an
/// `Rc` obtained from `register`.
///
/// Modeled as a lifecycle-scoped service: one instance is created when the
/// speaker starts and owned by it for the process lifetime, never a global
/// static, so tests can run many independent instances in parallel.
pub struct AttributeManager {
    store: HashMap<PathAttributeList, Weak<PathAttributeList>>,
}

impl AttributeManager {
    pub fn new() -> Self {
        Self { store: HashMap::new() }
    }

    /// Returns a canonical handle equal to any previously-registered equal
    /// list, bumping its refcount (the `Rc` clone), or interns the new one.
    pub fn register(&mut self, list: PathAttributeList) -> Rc<PathAttributeList> {
        if let Some(existing) = self.store.get(&list).and_then(Weak::upgrade) {
            return existing;
        }
        let rc = Rc::new(list.clone());
        self.store.insert(list, Rc::downgrade(&rc));
        rc
    }

    /// Sweeps entries whose last strong reference has already been dropped.
    /// Call periodically; an interned list with refcount zero becomes
    /// eligible for this the moment the last `Rc` is dropped, so this never
    /// needs to run synchronously inside `deregister`.
    pub fn gc(&mut self) {
        self.store.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn refcnt(&self, list: &PathAttributeList) -> usize {
        self.store.get(list).map(|w| w.strong_count()).unwrap_or(0)
    }

    pub fn refcnt_all(&self) -> usize {
        self.store.values().map(Weak::strong_count).sum()
    }
}

impl Default for AttributeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_lists_share_storage() {
        let mut mgr = AttributeManager::new();
        let a = mgr.register(PathAttributeList::default());
        let b = mgr.register(PathAttributeList::default());
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(mgr.refcnt(&PathAttributeList::default()), 2);
    }

    #[test]
    fn gc_drops_unreferenced_entries() {
        let mut mgr = AttributeManager::new();
        {
            let _a = mgr.register(PathAttributeList::default());
        }
        assert_eq!(mgr.len(), 1);
        mgr.gc();
        assert_eq!(mgr.len(), 0);
    }
}
