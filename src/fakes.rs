//! in-memory development shims
//!
//! substitutes for the xattr layer and the collection bookkeeping on file
//! systems that lack user xattrs. nothing here is durable and nothing here
//! participates in journal replay.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{CollectionId, ObjectId};

type AttrMap = BTreeMap<String, Vec<u8>>;

/// in-memory stand-in for object and collection xattrs
#[derive(Default)]
pub struct FakeAttrs {
    objects: Mutex<HashMap<(CollectionId, ObjectId), AttrMap>>,
    collections: Mutex<HashMap<CollectionId, AttrMap>>,
}

impl FakeAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setattr(&self, cid: CollectionId, oid: &ObjectId, name: &str, value: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .entry((cid, oid.clone()))
            .or_default()
            .insert(name.to_string(), value.to_vec());
    }

    pub fn getattr(&self, cid: CollectionId, oid: &ObjectId, name: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(cid, oid.clone()))
            .and_then(|attrs| attrs.get(name).cloned())
            .ok_or_else(|| Error::NoAttr {
                path: format!("{cid}/{oid}").into(),
                name: name.to_string(),
            })
    }

    pub fn getattrs(&self, cid: CollectionId, oid: &ObjectId) -> AttrMap {
        self.objects
            .lock()
            .unwrap()
            .get(&(cid, oid.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn rmattr(&self, cid: CollectionId, oid: &ObjectId, name: &str) {
        if let Some(attrs) = self.objects.lock().unwrap().get_mut(&(cid, oid.clone())) {
            attrs.remove(name);
        }
    }

    pub fn rmattrs(&self, cid: CollectionId, oid: &ObjectId) {
        self.objects.lock().unwrap().remove(&(cid, oid.clone()));
    }

    pub fn collection_setattr(&self, cid: CollectionId, name: &str, value: &[u8]) {
        self.collections
            .lock()
            .unwrap()
            .entry(cid)
            .or_default()
            .insert(name.to_string(), value.to_vec());
    }

    pub fn collection_getattr(&self, cid: CollectionId, name: &str) -> Result<Vec<u8>> {
        self.collections
            .lock()
            .unwrap()
            .get(&cid)
            .and_then(|attrs| attrs.get(name).cloned())
            .ok_or_else(|| Error::NoAttr {
                path: cid.to_string().into(),
                name: name.to_string(),
            })
    }

    pub fn collection_getattrs(&self, cid: CollectionId) -> AttrMap {
        self.collections
            .lock()
            .unwrap()
            .get(&cid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn collection_rmattr(&self, cid: CollectionId, name: &str) {
        if let Some(attrs) = self.collections.lock().unwrap().get_mut(&cid) {
            attrs.remove(name);
        }
    }
}

/// in-memory stand-in for collection directories
#[derive(Default)]
pub struct FakeCollections {
    colls: Mutex<HashMap<CollectionId, BTreeSet<ObjectId>>>,
}

impl FakeCollections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, cid: CollectionId) {
        self.colls.lock().unwrap().entry(cid).or_default();
    }

    pub fn destroy(&self, cid: CollectionId) {
        self.colls.lock().unwrap().remove(&cid);
    }

    pub fn exists(&self, cid: CollectionId) -> bool {
        self.colls.lock().unwrap().contains_key(&cid)
    }

    pub fn is_empty(&self, cid: CollectionId) -> bool {
        self.colls
            .lock()
            .unwrap()
            .get(&cid)
            .map(|s| s.is_empty())
            .unwrap_or(true)
    }

    pub fn list(&self) -> Vec<CollectionId> {
        let mut out: Vec<_> = self.colls.lock().unwrap().keys().copied().collect();
        out.sort();
        out
    }

    pub fn list_objects(&self, cid: CollectionId) -> Vec<ObjectId> {
        self.colls
            .lock()
            .unwrap()
            .get(&cid)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add(&self, cid: CollectionId, oid: &ObjectId) {
        self.colls
            .lock()
            .unwrap()
            .entry(cid)
            .or_default()
            .insert(oid.clone());
    }

    pub fn remove(&self, cid: CollectionId, oid: &ObjectId) {
        if let Some(set) = self.colls.lock().unwrap().get_mut(&cid) {
            set.remove(oid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_attrs() {
        let attrs = FakeAttrs::new();
        let cid = CollectionId(1);
        let oid = ObjectId::head("o");

        attrs.setattr(cid, &oid, "k", b"v");
        assert_eq!(attrs.getattr(cid, &oid, "k").unwrap(), b"v");

        attrs.rmattr(cid, &oid, "k");
        assert!(attrs.getattr(cid, &oid, "k").is_err());

        attrs.setattr(cid, &oid, "a", b"1");
        attrs.setattr(cid, &oid, "b", b"2");
        assert_eq!(attrs.getattrs(cid, &oid).len(), 2);
        attrs.rmattrs(cid, &oid);
        assert!(attrs.getattrs(cid, &oid).is_empty());
    }

    #[test]
    fn test_fake_collections() {
        let colls = FakeCollections::new();
        let cid = CollectionId(1);
        let oid = ObjectId::head("o");

        assert!(!colls.exists(cid));
        colls.create(cid);
        assert!(colls.exists(cid));
        assert!(colls.is_empty(cid));

        colls.add(cid, &oid);
        assert!(!colls.is_empty(cid));
        assert_eq!(colls.list_objects(cid), vec![oid.clone()]);

        colls.remove(cid, &oid);
        assert!(colls.is_empty(cid));

        colls.destroy(cid);
        assert!(!colls.exists(cid));
    }
}
