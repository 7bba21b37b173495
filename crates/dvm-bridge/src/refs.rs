//! Local/global/weak reference tables
//!
//! Handles are identity-stable: an object's handle is its id, so every
//! vending path for one object produces the same value and `IsSameObject`
//! degenerates to identity of the resolved objects. The tables only
//! decide *lifetime*: a handle resolves while at least one table still
//! holds its object.
//!
//! There is no collector. Weak entries are ordinary tagged entries that
//! stay valid until explicitly deleted, and local entries live until
//! `DeleteLocalRef` — the documented single-threaded simplification of
//! frame scoping.

use rustc_hash::FxHashMap;

use dvm_sdk::DvmObject;

/// Guest-visible reference kinds (`jobjectRefType` encoding)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Handle unknown to every table
    Invalid = 0,
    /// Local reference
    Local = 1,
    /// Global reference
    Global = 2,
    /// Weak global reference
    WeakGlobal = 3,
}

struct GlobalEntry {
    object: DvmObject,
    weak: bool,
}

/// The per-process reference tables
#[derive(Default)]
pub struct RefSpace {
    locals: FxHashMap<u64, DvmObject>,
    globals: FxHashMap<u64, GlobalEntry>,
}

impl RefSpace {
    /// Empty tables
    pub fn new() -> Self {
        RefSpace::default()
    }

    /// Vend a local reference; returns the object's stable handle
    pub fn add_local(&mut self, object: &DvmObject) -> u64 {
        let handle = object.id();
        self.locals.entry(handle).or_insert_with(|| object.clone());
        handle
    }

    /// Vend a global (or weak global) reference
    pub fn add_global(&mut self, object: &DvmObject, weak: bool) -> u64 {
        let handle = object.id();
        self.globals.insert(
            handle,
            GlobalEntry {
                object: object.clone(),
                weak,
            },
        );
        handle
    }

    /// Resolve a handle through every table; `0` and unknown handles
    /// yield `None`
    pub fn resolve(&self, handle: u64) -> Option<DvmObject> {
        if handle == 0 {
            return None;
        }
        self.locals
            .get(&handle)
            .cloned()
            .or_else(|| self.globals.get(&handle).map(|e| e.object.clone()))
    }

    /// Delete a local entry. Unknown handles are a no-op. Returns the
    /// object if this was its last table entry (going-away hook).
    pub fn delete_local(&mut self, handle: u64) -> Option<DvmObject> {
        let object = self.locals.remove(&handle)?;
        if self.globals.contains_key(&handle) {
            None
        } else {
            Some(object)
        }
    }

    /// Delete a strong global entry. Weak entries are left alone (the
    /// guest must use the weak-deleting entry point). Unknown handles are
    /// a no-op. Returns the object if this was its last table entry.
    pub fn delete_global(&mut self, handle: u64) -> Option<DvmObject> {
        match self.globals.get(&handle) {
            Some(entry) if !entry.weak => {}
            _ => return None,
        }
        let entry = self.globals.remove(&handle)?;
        if self.locals.contains_key(&handle) {
            None
        } else {
            Some(entry.object)
        }
    }

    /// Delete a weak global entry; strong and unknown handles are a no-op
    pub fn delete_weak_global(&mut self, handle: u64) -> Option<DvmObject> {
        match self.globals.get(&handle) {
            Some(entry) if entry.weak => {}
            _ => return None,
        }
        let entry = self.globals.remove(&handle)?;
        if self.locals.contains_key(&handle) {
            None
        } else {
            Some(entry.object)
        }
    }

    /// Classify a handle. Global tables win over local, matching the
    /// reference ABI's precedence.
    pub fn ref_kind(&self, handle: u64) -> RefKind {
        if handle == 0 {
            return RefKind::Invalid;
        }
        if let Some(entry) = self.globals.get(&handle) {
            return if entry.weak {
                RefKind::WeakGlobal
            } else {
                RefKind::Global
            };
        }
        if self.locals.contains_key(&handle) {
            return RefKind::Local;
        }
        RefKind::Invalid
    }

    /// Identity comparison across any two handles.
    ///
    /// Both null is "same"; two dead handles fall back to raw equality
    /// (the guest is comparing stale values, and the real ABI would
    /// compare the raw words too); live-vs-dead is never the same object.
    pub fn is_same(&self, h1: u64, h2: u64) -> bool {
        match (self.resolve(h1), self.resolve(h2)) {
            (Some(a), Some(b)) => a.is_same(&b),
            (None, None) => h1 == h2,
            _ => false,
        }
    }

    /// Number of live local entries
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Number of live global entries (strong and weak)
    pub fn global_count(&self) -> usize {
        self.globals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvm_sdk::{signature_hash, DvmClass};

    fn object() -> DvmObject {
        let class = DvmClass::new(
            signature_hash("java/lang/Object"),
            "java/lang/Object",
            None,
            Vec::new(),
        );
        DvmObject::instance(class)
    }

    #[test]
    fn test_handle_is_stable_across_vends() {
        let mut refs = RefSpace::new();
        let obj = object();
        let h1 = refs.add_local(&obj);
        let h2 = refs.add_local(&obj);
        let h3 = refs.add_global(&obj, false);
        assert_eq!(h1, h2);
        assert_eq!(h1, h3);
        assert!(refs.resolve(h1).unwrap().is_same(&obj));
    }

    #[test]
    fn test_is_same_across_tables() {
        let mut refs = RefSpace::new();
        let a = object();
        let b = object();
        let ha = refs.add_local(&a);
        let hag = refs.add_global(&a, false);
        let hb = refs.add_local(&b);
        assert!(refs.is_same(ha, hag));
        assert!(!refs.is_same(ha, hb));
        assert!(refs.is_same(0, 0));
        assert!(!refs.is_same(ha, 0));
    }

    #[test]
    fn test_delete_global_invalidates() {
        let mut refs = RefSpace::new();
        let obj = object();
        let h = refs.add_global(&obj, false);
        assert_eq!(refs.ref_kind(h), RefKind::Global);
        let released = refs.delete_global(h);
        assert!(released.unwrap().is_same(&obj));
        assert_eq!(refs.ref_kind(h), RefKind::Invalid);
        // Double delete and unknown handles never fault.
        assert!(refs.delete_global(h).is_none());
        assert!(refs.delete_global(0xdead).is_none());
    }

    #[test]
    fn test_release_only_on_last_entry() {
        let mut refs = RefSpace::new();
        let obj = object();
        let h = refs.add_local(&obj);
        refs.add_global(&obj, false);
        assert!(refs.delete_global(h).is_none());
        assert!(refs.delete_local(h).unwrap().is_same(&obj));
    }

    #[test]
    fn test_weak_entries_are_tagged_not_collected() {
        let mut refs = RefSpace::new();
        let obj = object();
        let h = refs.add_global(&obj, true);
        assert_eq!(refs.ref_kind(h), RefKind::WeakGlobal);
        assert!(refs.resolve(h).is_some());
        // The strong-deleting entry must not touch a weak entry.
        assert!(refs.delete_global(h).is_none());
        assert_eq!(refs.ref_kind(h), RefKind::WeakGlobal);
        assert!(refs.delete_weak_global(h).is_some());
        assert_eq!(refs.ref_kind(h), RefKind::Invalid);
    }

    #[test]
    fn test_global_kind_wins_over_local() {
        let mut refs = RefSpace::new();
        let obj = object();
        let h = refs.add_local(&obj);
        assert_eq!(refs.ref_kind(h), RefKind::Local);
        refs.add_global(&obj, false);
        assert_eq!(refs.ref_kind(h), RefKind::Global);
    }
}
