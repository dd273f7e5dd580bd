//! transaction record
//!
//! a [`Transaction`] is an ordered batch of mutations built by the caller
//! and consumed once by the apply engine. ops carry their payloads inline
//! so the whole record can be serialized for the journal.

use serde::{Deserialize, Serialize};

use crate::types::{CollectionId, ObjectId};

/// a single mutation inside a transaction
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Op {
    Touch {
        cid: CollectionId,
        oid: ObjectId,
    },
    Write {
        cid: CollectionId,
        oid: ObjectId,
        offset: u64,
        len: u64,
        data: Vec<u8>,
    },
    Zero {
        cid: CollectionId,
        oid: ObjectId,
        offset: u64,
        len: u64,
    },
    /// advisory cache hint; no persistent effect
    TrimCache {
        cid: CollectionId,
        oid: ObjectId,
        offset: u64,
        len: u64,
    },
    Truncate {
        cid: CollectionId,
        oid: ObjectId,
        size: u64,
    },
    Remove {
        cid: CollectionId,
        oid: ObjectId,
    },
    SetAttr {
        cid: CollectionId,
        oid: ObjectId,
        name: String,
        value: Vec<u8>,
    },
    SetAttrs {
        cid: CollectionId,
        oid: ObjectId,
        attrs: Vec<(String, Vec<u8>)>,
    },
    RmAttr {
        cid: CollectionId,
        oid: ObjectId,
        name: String,
    },
    RmAttrs {
        cid: CollectionId,
        oid: ObjectId,
    },
    Clone {
        cid: CollectionId,
        src: ObjectId,
        dst: ObjectId,
    },
    CloneRange {
        cid: CollectionId,
        src: ObjectId,
        dst: ObjectId,
        offset: u64,
        len: u64,
    },
    MkColl {
        cid: CollectionId,
    },
    RmColl {
        cid: CollectionId,
    },
    /// hard-link an object already in `ocid` into `cid`
    CollAdd {
        cid: CollectionId,
        ocid: CollectionId,
        oid: ObjectId,
    },
    CollRemove {
        cid: CollectionId,
        oid: ObjectId,
    },
    CollSetAttr {
        cid: CollectionId,
        name: String,
        value: Vec<u8>,
    },
    CollRmAttr {
        cid: CollectionId,
        name: String,
    },
    StartSync,
}

impl Op {
    /// payload bytes this op carries into the store
    fn num_bytes(&self) -> u64 {
        match self {
            Op::Write { data, .. } => data.len() as u64,
            Op::Zero { len, .. } => *len,
            Op::SetAttr { value, .. } | Op::CollSetAttr { value, .. } => value.len() as u64,
            Op::SetAttrs { attrs, .. } => attrs.iter().map(|(_, v)| v.len() as u64).sum(),
            _ => 0,
        }
    }
}

/// an ordered batch of mutations, applied atomically with respect to
/// crashes and acknowledged at two durability points
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Transaction {
    ops: Vec<Op>,
    bytes: u64,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Op) {
        self.bytes += op.num_bytes();
        self.ops.push(op);
    }

    /// ops in insertion order
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn num_ops(&self) -> u64 {
        self.ops.len() as u64
    }

    pub fn num_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    // builder methods, one per op

    pub fn touch(&mut self, cid: CollectionId, oid: ObjectId) {
        self.push(Op::Touch { cid, oid });
    }

    pub fn write(&mut self, cid: CollectionId, oid: ObjectId, offset: u64, data: Vec<u8>) {
        let len = data.len() as u64;
        self.push(Op::Write {
            cid,
            oid,
            offset,
            len,
            data,
        });
    }

    pub fn zero(&mut self, cid: CollectionId, oid: ObjectId, offset: u64, len: u64) {
        self.push(Op::Zero {
            cid,
            oid,
            offset,
            len,
        });
    }

    pub fn trim_cache(&mut self, cid: CollectionId, oid: ObjectId, offset: u64, len: u64) {
        self.push(Op::TrimCache {
            cid,
            oid,
            offset,
            len,
        });
    }

    pub fn truncate(&mut self, cid: CollectionId, oid: ObjectId, size: u64) {
        self.push(Op::Truncate { cid, oid, size });
    }

    pub fn remove(&mut self, cid: CollectionId, oid: ObjectId) {
        self.push(Op::Remove { cid, oid });
    }

    pub fn setattr(&mut self, cid: CollectionId, oid: ObjectId, name: &str, value: Vec<u8>) {
        self.push(Op::SetAttr {
            cid,
            oid,
            name: name.to_string(),
            value,
        });
    }

    pub fn setattrs(&mut self, cid: CollectionId, oid: ObjectId, attrs: Vec<(String, Vec<u8>)>) {
        self.push(Op::SetAttrs { cid, oid, attrs });
    }

    pub fn rmattr(&mut self, cid: CollectionId, oid: ObjectId, name: &str) {
        self.push(Op::RmAttr {
            cid,
            oid,
            name: name.to_string(),
        });
    }

    pub fn rmattrs(&mut self, cid: CollectionId, oid: ObjectId) {
        self.push(Op::RmAttrs { cid, oid });
    }

    pub fn clone_object(&mut self, cid: CollectionId, src: ObjectId, dst: ObjectId) {
        self.push(Op::Clone { cid, src, dst });
    }

    pub fn clone_range(
        &mut self,
        cid: CollectionId,
        src: ObjectId,
        dst: ObjectId,
        offset: u64,
        len: u64,
    ) {
        self.push(Op::CloneRange {
            cid,
            src,
            dst,
            offset,
            len,
        });
    }

    pub fn create_collection(&mut self, cid: CollectionId) {
        self.push(Op::MkColl { cid });
    }

    pub fn remove_collection(&mut self, cid: CollectionId) {
        self.push(Op::RmColl { cid });
    }

    pub fn collection_add(&mut self, cid: CollectionId, ocid: CollectionId, oid: ObjectId) {
        self.push(Op::CollAdd { cid, ocid, oid });
    }

    pub fn collection_remove(&mut self, cid: CollectionId, oid: ObjectId) {
        self.push(Op::CollRemove { cid, oid });
    }

    pub fn collection_setattr(&mut self, cid: CollectionId, name: &str, value: Vec<u8>) {
        self.push(Op::CollSetAttr {
            cid,
            name: name.to_string(),
            value,
        });
    }

    pub fn collection_rmattr(&mut self, cid: CollectionId, name: &str) {
        self.push(Op::CollRmAttr {
            cid,
            name: name.to_string(),
        });
    }

    pub fn start_sync(&mut self) {
        self.push(Op::StartSync);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapId;

    #[test]
    fn test_counters() {
        let cid = CollectionId(1);
        let mut t = Transaction::new();
        assert!(t.is_empty());

        t.touch(cid, ObjectId::head("a"));
        t.write(cid, ObjectId::head("a"), 0, b"hello".to_vec());
        t.zero(cid, ObjectId::head("a"), 100, 50);
        t.setattr(cid, ObjectId::head("a"), "k", b"vv".to_vec());

        assert_eq!(t.num_ops(), 4);
        assert_eq!(t.num_bytes(), 5 + 50 + 2);
    }

    #[test]
    fn test_iteration_order() {
        let cid = CollectionId(1);
        let mut t = Transaction::new();
        t.create_collection(cid);
        t.touch(cid, ObjectId::head("a"));
        t.remove(cid, ObjectId::head("a"));

        let ops = t.ops();
        assert!(matches!(ops[0], Op::MkColl { .. }));
        assert!(matches!(ops[1], Op::Touch { .. }));
        assert!(matches!(ops[2], Op::Remove { .. }));
    }

    #[test]
    fn test_cbor_roundtrip() {
        let cid = CollectionId(0xab);
        let mut t = Transaction::new();
        t.write(cid, ObjectId::new("x", SnapId(3)), 8, vec![1, 2, 3]);
        t.collection_setattr(cid, "k", b"v".to_vec());

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&t, &mut buf).unwrap();
        let back: Transaction = ciborium::de::from_reader(buf.as_slice()).unwrap();

        assert_eq!(back.num_ops(), 2);
        assert_eq!(back.num_bytes(), t.num_bytes());
        match &back.ops()[0] {
            Op::Write {
                offset, len, data, ..
            } => {
                assert_eq!(*offset, 8);
                assert_eq!(*len, 3);
                assert_eq!(data, &vec![1, 2, 3]);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }
}
