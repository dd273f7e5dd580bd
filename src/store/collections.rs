//! collection operations
//!
//! a collection is one directory under the basedir; its objects are the
//! regular files inside. adding an object to another collection hard-links
//! the same inode, so a PG's snapshot set can share storage with its head.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, MetadataExt};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::libc;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::paths;
use crate::types::{CollectionId, ObjectId, SnapId};
use crate::xattrs;

use super::{FileStat, Store};

/// opaque directory cursor for [`Store::collection_list_partial`]
///
/// zero on the way in starts from the top; zero on the way out means the
/// listing is exhausted.
pub type ListHandle = u64;

impl Store {
    pub(crate) fn coll_path(&self, cid: CollectionId) -> PathBuf {
        paths::coll_dir(&self.inner.basedir, cid)
    }

    // ---- reads ----

    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            return Ok(fakes.list());
        }
        let basedir = &self.inner.basedir;
        let mut out = Vec::new();
        for entry in std::fs::read_dir(basedir).with_path(basedir)? {
            let entry = entry.with_path(basedir)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(cid) = paths::parse_coll_name(name) {
                    out.push(cid);
                }
            }
        }
        Ok(out)
    }

    pub fn collection_exists(&self, cid: CollectionId) -> bool {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            return fakes.exists(cid);
        }
        self.coll_path(cid).is_dir()
    }

    pub fn collection_stat(&self, cid: CollectionId) -> Result<FileStat> {
        let path = self.coll_path(cid);
        let meta = std::fs::metadata(&path).with_path(&path)?;
        Ok(FileStat {
            size: meta.len(),
            ino: meta.ino(),
            nlink: meta.nlink(),
        })
    }

    pub fn collection_empty(&self, cid: CollectionId) -> Result<bool> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            return Ok(fakes.is_empty(cid));
        }
        let path = self.coll_path(cid);
        for entry in std::fs::read_dir(&path).with_path(&path)? {
            let entry = entry.with_path(&path)?;
            let name = entry.file_name();
            let bytes = name.as_bytes();
            if bytes.starts_with(b".") {
                continue;
            }
            if paths::parse_object_name(bytes).is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// objects of a collection, sorted by inode number
    ///
    /// inode order keeps a reader that opens the results in sequence from
    /// seeking all over the disk.
    pub fn collection_list(&self, cid: CollectionId) -> Result<Vec<ObjectId>> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            return Ok(fakes.list_objects(cid));
        }
        let path = self.coll_path(cid);
        let mut inolist: Vec<(u64, ObjectId)> = Vec::new();
        for entry in std::fs::read_dir(&path).with_path(&path)? {
            let entry = entry.with_path(&path)?;
            let name = entry.file_name();
            let bytes = name.as_bytes();
            if bytes.starts_with(b".") {
                continue;
            }
            if let Some(oid) = paths::parse_object_name(bytes) {
                inolist.push((entry.ino(), oid));
            }
        }
        inolist.sort();
        debug!(coll = %cid, objects = inolist.len(), "collection_list");
        Ok(inolist.into_iter().map(|(_, oid)| oid).collect())
    }

    /// stream one page of objects with `snap >= seq`, directory order
    ///
    /// `handle` carries the directory cursor between pages; pass 0 to start
    /// and stop when it comes back 0.
    pub fn collection_list_partial(
        &self,
        cid: CollectionId,
        seq: SnapId,
        max_count: usize,
        handle: &mut ListHandle,
    ) -> Result<Vec<ObjectId>> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            *handle = 0;
            return Ok(fakes.list_objects(cid));
        }
        let path = self.coll_path(cid);
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Io {
            path: path.clone(),
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;

        let dir = unsafe { libc::opendir(c_path.as_ptr()) };
        if dir.is_null() {
            return Err(Error::Io {
                path,
                source: std::io::Error::last_os_error(),
            });
        }

        if *handle != 0 {
            unsafe { libc::seekdir(dir, *handle as libc::c_long) };
            *handle = 0;
        }

        let mut out = Vec::new();
        let mut end = false;
        while out.len() < max_count {
            Errno::clear();
            let de = unsafe { libc::readdir(dir) };
            if de.is_null() {
                if Errno::last_raw() != 0 {
                    let err = std::io::Error::last_os_error();
                    unsafe { libc::closedir(dir) };
                    return Err(Error::Io { path, source: err });
                }
                end = true;
                break;
            }
            let name = unsafe { CStr::from_ptr((*de).d_name.as_ptr()) };
            let bytes = name.to_bytes();
            if bytes.starts_with(b".") {
                continue;
            }
            if let Some(oid) = paths::parse_object_name(bytes) {
                if oid.snap >= seq {
                    out.push(oid);
                }
            }
        }

        if !end {
            *handle = unsafe { libc::telldir(dir) } as ListHandle;
        }
        unsafe { libc::closedir(dir) };
        debug!(coll = %cid, page = out.len(), more = !end, "collection_list_partial");
        Ok(out)
    }

    pub fn collection_getattr(&self, cid: CollectionId, name: &str) -> Result<Vec<u8>> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            return fakes.collection_getattr(cid, name);
        }
        xattrs::get(&self.coll_path(cid), name)
    }

    pub fn collection_getattrs(&self, cid: CollectionId) -> Result<BTreeMap<String, Vec<u8>>> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            return Ok(fakes.collection_getattrs(cid));
        }
        xattrs::get_all(&self.coll_path(cid), false)
    }

    // ---- mutations (apply engine only) ----

    pub(crate) fn create_collection(&self, cid: CollectionId) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            fakes.create(cid);
            return Ok(());
        }
        let path = self.coll_path(cid);
        debug!(path = %path.display(), "create_collection");
        std::fs::DirBuilder::new()
            .mode(0o755)
            .create(&path)
            .with_path(&path)
    }

    pub(crate) fn destroy_collection(&self, cid: CollectionId) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            fakes.destroy(cid);
            return Ok(());
        }
        let path = self.coll_path(cid);
        debug!(path = %path.display(), "destroy_collection");
        std::fs::remove_dir(&path).with_path(&path)
    }

    /// hard-link an object already present in `ocid` into `cid`
    pub(crate) fn collection_add(
        &self,
        cid: CollectionId,
        ocid: CollectionId,
        oid: &ObjectId,
    ) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            fakes.add(cid, oid);
            return Ok(());
        }
        let existing = self.object_file(ocid, oid);
        let link = self.object_file(cid, oid);
        debug!(from = %existing.display(), to = %link.display(), "collection_add");
        std::fs::hard_link(&existing, &link).with_path(&link)
    }

    pub(crate) fn collection_remove(&self, cid: CollectionId, oid: &ObjectId) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_collections {
            fakes.remove(cid, oid);
            return Ok(());
        }
        let path = self.object_file(cid, oid);
        debug!(path = %path.display(), "collection_remove");
        std::fs::remove_file(&path).with_path(&path)
    }

    pub(crate) fn collection_setattr(
        &self,
        cid: CollectionId,
        name: &str,
        value: &[u8],
    ) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            fakes.collection_setattr(cid, name, value);
            return Ok(());
        }
        xattrs::set(&self.coll_path(cid), name, value)
    }

    pub(crate) fn collection_rmattr(&self, cid: CollectionId, name: &str) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            fakes.collection_rmattr(cid, name);
            return Ok(());
        }
        xattrs::remove(&self.coll_path(cid), name)
    }
}
