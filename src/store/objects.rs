//! low-level object operations
//!
//! each op computes the object's path under the basedir and performs the
//! corresponding filesystem call. mutations are `pub(crate)`: they are only
//! reachable through the apply engine; reads are public.

use std::cmp;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::btrfs;
use crate::error::{IoResultExt, Result};
use crate::paths;
use crate::types::{CollectionId, ObjectId};
use crate::xattrs;

use super::{FileStat, Store};

/// buffered fallback copy chunk
const CLONE_CHUNK: usize = 128 * 1024;

impl Store {
    pub(crate) fn object_file(&self, cid: CollectionId, oid: &ObjectId) -> PathBuf {
        paths::object_path(&self.inner.basedir, cid, oid)
    }

    // ---- reads ----

    pub fn exists(&self, cid: CollectionId, oid: &ObjectId) -> bool {
        self.stat(cid, oid).is_ok()
    }

    pub fn stat(&self, cid: CollectionId, oid: &ObjectId) -> Result<FileStat> {
        let path = self.object_file(cid, oid);
        let meta = std::fs::metadata(&path).with_path(&path)?;
        Ok(FileStat {
            size: meta.len(),
            ino: meta.ino(),
            nlink: meta.nlink(),
        })
    }

    /// read `len` bytes at `offset`; `len == 0` means through end of file
    pub fn read(&self, cid: CollectionId, oid: &ObjectId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let path = self.object_file(cid, oid);
        let file = File::open(&path).with_path(&path)?;
        let len = if len == 0 {
            file.metadata()
                .with_path(&path)?
                .len()
                .saturating_sub(offset)
        } else {
            len
        };

        let mut buf = vec![0u8; len as usize];
        let mut got = 0;
        while got < buf.len() {
            let n = file
                .read_at(&mut buf[got..], offset + got as u64)
                .with_path(&path)?;
            if n == 0 {
                break;
            }
            got += n;
        }
        buf.truncate(got);
        debug!(path = %path.display(), offset, len, got, "read");
        Ok(buf)
    }

    pub fn getattr(&self, cid: CollectionId, oid: &ObjectId, name: &str) -> Result<Vec<u8>> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            return fakes.getattr(cid, oid, name);
        }
        xattrs::get(&self.object_file(cid, oid), name)
    }

    /// all attributes of an object; `user_only` restricts to the
    /// `_`-prefixed names, exposed without the underscore
    pub fn getattrs(
        &self,
        cid: CollectionId,
        oid: &ObjectId,
        user_only: bool,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            return Ok(fakes.getattrs(cid, oid));
        }
        xattrs::get_all(&self.object_file(cid, oid), user_only)
    }

    // ---- mutations (apply engine only) ----

    pub(crate) fn touch(&self, cid: CollectionId, oid: &ObjectId) -> Result<()> {
        let path = self.object_file(cid, oid);
        debug!(path = %path.display(), "touch");
        OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&path)
            .with_path(&path)?;
        Ok(())
    }

    pub(crate) fn write(
        &self,
        cid: CollectionId,
        oid: &ObjectId,
        offset: u64,
        data: &[u8],
    ) -> Result<u64> {
        let path = self.object_file(cid, oid);
        debug!(path = %path.display(), offset, len = data.len(), "write");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&path)
            .with_path(&path)?;
        let actual = file.seek(SeekFrom::Start(offset)).with_path(&path)?;
        assert_eq!(actual, offset, "seek landed at {actual}, wanted {offset}");
        file.write_all(data).with_path(&path)?;
        Ok(data.len() as u64)
    }

    pub(crate) fn zero(
        &self,
        cid: CollectionId,
        oid: &ObjectId,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        // write actual zeros so all three backends produce identical files
        let zeros = vec![0u8; len as usize];
        self.write(cid, oid, offset, &zeros).map(drop)
    }

    pub(crate) fn truncate(&self, cid: CollectionId, oid: &ObjectId, size: u64) -> Result<()> {
        let path = self.object_file(cid, oid);
        debug!(path = %path.display(), size, "truncate");
        let file = OpenOptions::new().write(true).open(&path).with_path(&path)?;
        file.set_len(size).with_path(&path)
    }

    pub(crate) fn remove(&self, cid: CollectionId, oid: &ObjectId) -> Result<()> {
        let path = self.object_file(cid, oid);
        debug!(path = %path.display(), "remove");
        std::fs::remove_file(&path).with_path(&path)
    }

    pub(crate) fn clone_object(
        &self,
        cid: CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
    ) -> Result<()> {
        let src_path = self.object_file(cid, src);
        let dst_path = self.object_file(cid, dst);
        debug!(src = %src_path.display(), dst = %dst_path.display(), "clone");

        let src_file = File::open(&src_path).with_path(&src_path)?;
        let dst_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&dst_path)
            .with_path(&dst_path)?;

        if self.inner.caps.btrfs.load(Ordering::SeqCst) {
            match btrfs::clone(dst_file.as_raw_fd(), src_file.as_raw_fd()) {
                Ok(()) => return Ok(()),
                Err(source) => {
                    warn!(error = %source, "whole-file clone ioctl failed, copying instead")
                }
            }
        }
        let size = src_file.metadata().with_path(&src_path)?.len();
        self.do_clone_range(&src_file, &dst_file, 0, size, &dst_path)
    }

    pub(crate) fn clone_range(
        &self,
        cid: CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        let src_path = self.object_file(cid, src);
        let dst_path = self.object_file(cid, dst);
        debug!(
            src = %src_path.display(),
            dst = %dst_path.display(),
            offset,
            len,
            "clone_range"
        );

        let src_file = File::open(&src_path).with_path(&src_path)?;
        let dst_file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&dst_path)
            .with_path(&dst_path)?;
        self.do_clone_range(&src_file, &dst_file, offset, len, &dst_path)
    }

    /// range copy: the kernel range-clone when the mount probe found it,
    /// a buffered copy otherwise
    fn do_clone_range(
        &self,
        from: &File,
        to: &File,
        offset: u64,
        len: u64,
        dst_path: &std::path::Path,
    ) -> Result<()> {
        if self.inner.caps.clone_range.load(Ordering::SeqCst) {
            match btrfs::clone_range(to.as_raw_fd(), from.as_raw_fd(), offset, len) {
                Ok(()) => return Ok(()),
                // the ioctl wants block-aligned ranges; unaligned ones fall
                // through to the copy loop
                Err(source) => debug!(error = %source, "range clone ioctl refused, copying"),
            }
        }

        let mut buf = vec![0u8; CLONE_CHUNK];
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let want = cmp::min(end - pos, buf.len() as u64) as usize;
            let n = from.read_at(&mut buf[..want], pos).with_path(dst_path)?;
            if n == 0 {
                // source ran out before the requested range did
                break;
            }
            to.write_all_at(&buf[..n], pos).with_path(dst_path)?;
            pos += n as u64;
        }
        Ok(())
    }

    pub(crate) fn setattr(
        &self,
        cid: CollectionId,
        oid: &ObjectId,
        name: &str,
        value: &[u8],
    ) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            fakes.setattr(cid, oid, name, value);
            return Ok(());
        }
        xattrs::set(&self.object_file(cid, oid), name, value)
    }

    pub(crate) fn setattrs(
        &self,
        cid: CollectionId,
        oid: &ObjectId,
        attrs: &[(String, Vec<u8>)],
    ) -> Result<()> {
        for (name, value) in attrs {
            self.setattr(cid, oid, name, value)?;
        }
        Ok(())
    }

    pub(crate) fn rmattr(&self, cid: CollectionId, oid: &ObjectId, name: &str) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            fakes.rmattr(cid, oid, name);
            return Ok(());
        }
        xattrs::remove(&self.object_file(cid, oid), name)
    }

    pub(crate) fn rmattrs(&self, cid: CollectionId, oid: &ObjectId) -> Result<()> {
        #[cfg(feature = "fakes")]
        if let Some(fakes) = &self.inner.fake_attrs {
            fakes.rmattrs(cid, oid);
            return Ok(());
        }
        xattrs::remove_all(&self.object_file(cid, oid))
    }
}
