//! transaction apply engine
//!
//! a batch enters here, gets applied through whichever backend the mount
//! probe latched, is handed to the journal, and finally bumps the persisted
//! commit sequence. three backends:
//!
//! - **usertrans**: the whole batch is marshaled into one op vector and
//!   applied atomically by a single kernel ioctl
//! - **bracket**: ordinary syscalls between TRANS_START and TRANS_END
//!   ioctls, with SIGINT/SIGTERM deferred for the window
//! - **posix**: ordinary syscalls; crash atomicity comes from journal
//!   replay alone

use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use nix::libc;
use tracing::{debug, warn};

use crate::btrfs::{
    self, UsertransArgs, UsertransOp, UT_FLAG_FD_ARG0, UT_FLAG_FD_ARG1, UT_FLAG_FD_SAVE,
    UT_OP_CLONERANGE, UT_OP_CLOSE, UT_OP_LINK, UT_OP_MKDIR, UT_OP_OPEN, UT_OP_PWRITE,
    UT_OP_REMOVEXATTR, UT_OP_RMDIR, UT_OP_SETXATTR, UT_OP_TRUNCATE, UT_OP_UNLINK,
};
use crate::error::{Error, Result};
use crate::journal::Callback;
use crate::signals;
use crate::txn::{Op, Transaction};
use crate::xattrs;

use super::Store;

/// an open bracket window: basedir fd with a kernel transaction started on
/// it, plus the breadcrumb left for crash diagnostics
struct BracketGuard {
    dir: File,
    breadcrumb: PathBuf,
}

/// string and buffer arena for a usertrans call; every address handed to
/// the kernel points in here or into the batch itself and stays valid until
/// the ioctl returns
#[derive(Default)]
struct UtArena {
    strings: Vec<CString>,
    buffers: Vec<Vec<u8>>,
}

impl UtArena {
    fn path(&mut self, path: PathBuf) -> Result<u64> {
        let cs = CString::new(path.clone().into_os_string().into_vec()).map_err(|_| Error::Io {
            path,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;
        self.strings.push(cs);
        Ok(self.strings.last().unwrap().as_ptr() as u64)
    }

    fn attr_name(&mut self, name: &str) -> u64 {
        let cs = CString::new(format!("{}{}", xattrs::ATTR_PREFIX, name))
            .expect("attr names have no interior NUL");
        self.strings.push(cs);
        self.strings.last().unwrap().as_ptr() as u64
    }

    fn zeros(&mut self, len: u64) -> u64 {
        self.buffers.push(vec![0u8; len as usize]);
        self.buffers.last().unwrap().as_ptr() as u64
    }
}

fn ut_op(op: u32, flags: u32, fd_num: u32, args: [u64; 5]) -> UsertransOp {
    UsertransOp {
        op,
        flags,
        fd_num,
        args,
    }
}

fn ut_close(slot: u32) -> UsertransOp {
    ut_op(UT_OP_CLOSE, UT_FLAG_FD_ARG0, 0, [slot as u64, 0, 0, 0, 0])
}

impl Store {
    /// apply a single transaction with no completion callbacks
    pub fn apply_transaction(&self, t: Transaction) -> Result<()> {
        self.apply_transactions(vec![t], None, None)
    }

    /// apply a batch atomically with respect to crashes
    ///
    /// `on_journal` fires once the batch is durable in the journal and
    /// `on_disk` once a filesystem commit covers it; both are dropped
    /// without firing if the apply fails.
    pub fn apply_transactions(
        &self,
        batch: Vec<Transaction>,
        on_journal: Option<Callback>,
        on_disk: Option<Callback>,
    ) -> Result<()> {
        self.op_start();

        let bytes: u64 = batch.iter().map(Transaction::num_bytes).sum();
        let ops: u64 = batch.iter().map(Transaction::num_ops).sum();

        let applied = if self.inner.caps.usertrans.load(Ordering::SeqCst) {
            self.do_usertrans(&batch)
        } else {
            match self.transaction_start(bytes, ops) {
                Err(e) => {
                    self.op_finish();
                    return Err(e);
                }
                Ok(bracket) => {
                    let mut first_err = None;
                    for t in &batch {
                        if let Err(e) = self.apply_one(t) {
                            first_err.get_or_insert(e);
                        }
                    }
                    self.transaction_finish(bracket);
                    match first_err {
                        None => Ok(()),
                        Some(e) => Err(e),
                    }
                }
            }
        };

        let result = match applied {
            Ok(()) => {
                let seq = self.inner.op_seq.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(seq, ops, bytes, "applied batch");
                self.journal_transactions(seq, &batch, on_journal, on_disk);
                self.write_op_seq(seq);
                Ok(())
            }
            // callbacks are dropped without notification
            Err(e) => Err(e),
        };

        self.op_finish();
        result
    }

    /// run one transaction's ops in program order; the first failure stops
    /// this transaction (later transactions of the batch still run)
    pub(crate) fn apply_one(&self, t: &Transaction) -> Result<()> {
        for op in t.ops() {
            let r = match op {
                Op::Touch { cid, oid } => self.touch(*cid, oid),
                Op::Write {
                    cid,
                    oid,
                    offset,
                    data,
                    ..
                } => self.write(*cid, oid, *offset, data).map(drop),
                Op::Zero {
                    cid,
                    oid,
                    offset,
                    len,
                } => self.zero(*cid, oid, *offset, *len),
                // advisory; nothing persistent at this layer
                Op::TrimCache { .. } => Ok(()),
                Op::Truncate { cid, oid, size } => self.truncate(*cid, oid, *size),
                Op::Remove { cid, oid } => self.remove(*cid, oid),
                Op::SetAttr {
                    cid,
                    oid,
                    name,
                    value,
                } => self.setattr(*cid, oid, name, value),
                Op::SetAttrs { cid, oid, attrs } => self.setattrs(*cid, oid, attrs),
                Op::RmAttr { cid, oid, name } => self.rmattr(*cid, oid, name),
                Op::RmAttrs { cid, oid } => self.rmattrs(*cid, oid),
                Op::Clone { cid, src, dst } => self.clone_object(*cid, src, dst),
                Op::CloneRange {
                    cid,
                    src,
                    dst,
                    offset,
                    len,
                } => self.clone_range(*cid, src, dst, *offset, *len),
                Op::MkColl { cid } => self.create_collection(*cid),
                Op::RmColl { cid } => self.destroy_collection(*cid),
                Op::CollAdd { cid, ocid, oid } => self.collection_add(*cid, *ocid, oid),
                Op::CollRemove { cid, oid } => self.collection_remove(*cid, oid),
                Op::CollSetAttr { cid, name, value } => {
                    self.collection_setattr(*cid, name, value)
                }
                Op::CollRmAttr { cid, name } => self.collection_rmattr(*cid, name),
                Op::StartSync => {
                    self.start_sync();
                    Ok(())
                }
            };
            if let Err(e) = r {
                warn!(error = %e, "op failed, abandoning rest of transaction");
                return Err(e);
            }
        }
        Ok(())
    }

    fn journal_transactions(
        &self,
        seq: u64,
        batch: &[Transaction],
        on_journal: Option<Callback>,
        on_disk: Option<Callback>,
    ) {
        let mut journal = self.inner.journal.lock().unwrap();
        match journal.as_mut() {
            Some(j) => {
                if let Err(e) = j.submit(seq, batch, on_journal, on_disk) {
                    warn!(seq, error = %e, "journal submit failed");
                }
            }
            None => {
                drop(journal);
                // applied is the earliest durability point we have
                if let Some(cb) = on_journal {
                    cb();
                }
                if let Some(cb) = on_disk {
                    self.inner.disk_waiters.lock().unwrap().push((seq, cb));
                }
            }
        }
    }

    // ---- bracket backend ----

    fn transaction_start(&self, bytes: u64, ops: u64) -> Result<Option<BracketGuard>> {
        let caps = &self.inner.caps;
        if !caps.btrfs.load(Ordering::SeqCst)
            || !caps.trans_start_end.load(Ordering::SeqCst)
            || !self.inner.config.btrfs_trans
        {
            return Ok(None);
        }

        let dir = File::open(&self.inner.basedir).map_err(|source| Error::Io {
            path: self.inner.basedir.clone(),
            source,
        })?;
        if let Err(source) = btrfs::trans_start(dir.as_raw_fd()) {
            return Err(Error::Sys {
                op: "trans_start",
                source,
            });
        }
        debug!(fd = dir.as_raw_fd(), bytes, ops, "transaction start");

        // no fatal signal may land inside the bracket window
        signals::enter();

        let breadcrumb = self
            .inner
            .basedir
            .join(format!("trans.{}", dir.as_raw_fd()));
        let _ = File::create(&breadcrumb);

        Ok(Some(BracketGuard { dir, breadcrumb }))
    }

    fn transaction_finish(&self, guard: Option<BracketGuard>) {
        let Some(guard) = guard else { return };
        let _ = std::fs::remove_file(&guard.breadcrumb);
        debug!(fd = guard.dir.as_raw_fd(), "transaction finish");
        let _ = btrfs::trans_end(guard.dir.as_raw_fd());
        drop(guard.dir);
        signals::leave();
    }

    // ---- usertrans backend ----

    /// marshal the whole batch into one op vector and apply it with a
    /// single ioctl; the kernel applies it all-or-nothing
    fn do_usertrans(&self, batch: &[Transaction]) -> Result<()> {
        let mut arena = UtArena::default();
        let mut ops: Vec<UsertransOp> = Vec::new();
        let mut start_sync = false;
        let mut data_bytes = 0u64;

        for t in batch {
            for op in t.ops() {
                match op {
                    Op::Touch { cid, oid } => {
                        let fname = arena.path(self.object_file(*cid, oid))?;
                        ops.push(ut_op(
                            UT_OP_OPEN,
                            UT_FLAG_FD_SAVE,
                            0,
                            [
                                fname,
                                (libc::O_WRONLY | libc::O_CREAT) as u64,
                                0o644,
                                0,
                                0,
                            ],
                        ));
                        ops.push(ut_close(0));
                    }

                    Op::Write {
                        cid,
                        oid,
                        offset,
                        data,
                        ..
                    } => {
                        let fname = arena.path(self.object_file(*cid, oid))?;
                        ut_write(&mut ops, fname, *offset, data.as_ptr() as u64, data.len());
                    }

                    Op::Zero {
                        cid,
                        oid,
                        offset,
                        len,
                    } => {
                        // write actual zeros, matching the posix backend
                        let fname = arena.path(self.object_file(*cid, oid))?;
                        let buf = arena.zeros(*len);
                        ut_write(&mut ops, fname, *offset, buf, *len as usize);
                    }

                    Op::TrimCache { .. } => {}

                    Op::Truncate { cid, oid, size } => {
                        let fname = arena.path(self.object_file(*cid, oid))?;
                        ops.push(ut_op(UT_OP_TRUNCATE, 0, 0, [fname, *size, 0, 0, 0]));
                    }

                    Op::Remove { cid, oid } | Op::CollRemove { cid, oid } => {
                        let fname = arena.path(self.object_file(*cid, oid))?;
                        ops.push(ut_op(UT_OP_UNLINK, 0, 0, [fname, 0, 0, 0, 0]));
                    }

                    Op::SetAttr {
                        cid,
                        oid,
                        name,
                        value,
                    } => {
                        let fname = arena.path(self.object_file(*cid, oid))?;
                        let aname = arena.attr_name(name);
                        ops.push(ut_op(
                            UT_OP_SETXATTR,
                            0,
                            0,
                            [fname, aname, value.as_ptr() as u64, value.len() as u64, 0],
                        ));
                    }

                    Op::SetAttrs { cid, oid, attrs } => {
                        let fname = arena.path(self.object_file(*cid, oid))?;
                        for (name, value) in attrs {
                            let aname = arena.attr_name(name);
                            ops.push(ut_op(
                                UT_OP_SETXATTR,
                                0,
                                0,
                                [fname, aname, value.as_ptr() as u64, value.len() as u64, 0],
                            ));
                        }
                    }

                    Op::RmAttr { cid, oid, name } => {
                        let fname = arena.path(self.object_file(*cid, oid))?;
                        let aname = arena.attr_name(name);
                        ops.push(ut_op(UT_OP_REMOVEXATTR, 0, 0, [fname, aname, 0, 0, 0]));
                    }

                    Op::RmAttrs { cid, oid } => {
                        // names are read at marshal time; the removal is
                        // what the kernel applies transactionally
                        let path = self.object_file(*cid, oid);
                        let fname = arena.path(path.clone())?;
                        for name in xattrs::list(&path)? {
                            let aname = arena.attr_name(&name);
                            ops.push(ut_op(UT_OP_REMOVEXATTR, 0, 0, [fname, aname, 0, 0, 0]));
                        }
                    }

                    Op::Clone { cid, src, dst } => {
                        let src_name = arena.path(self.object_file(*cid, src))?;
                        let dst_name = arena.path(self.object_file(*cid, dst))?;
                        ut_clone(&mut ops, src_name, dst_name, true, 0, 0);
                    }

                    Op::CloneRange {
                        cid,
                        src,
                        dst,
                        offset,
                        len,
                    } => {
                        let src_name = arena.path(self.object_file(*cid, src))?;
                        let dst_name = arena.path(self.object_file(*cid, dst))?;
                        ut_clone(&mut ops, src_name, dst_name, false, *offset, *len);
                    }

                    Op::MkColl { cid } => {
                        let dname = arena.path(self.coll_path(*cid))?;
                        ops.push(ut_op(UT_OP_MKDIR, 0, 0, [dname, 0o755, 0, 0, 0]));
                    }

                    Op::RmColl { cid } => {
                        let dname = arena.path(self.coll_path(*cid))?;
                        ops.push(ut_op(UT_OP_RMDIR, 0, 0, [dname, 0, 0, 0, 0]));
                    }

                    Op::CollAdd { cid, ocid, oid } => {
                        let existing = arena.path(self.object_file(*ocid, oid))?;
                        let link = arena.path(self.object_file(*cid, oid))?;
                        ops.push(ut_op(UT_OP_LINK, 0, 0, [existing, link, 0, 0, 0]));
                    }

                    Op::CollSetAttr { cid, name, value } => {
                        let dname = arena.path(self.coll_path(*cid))?;
                        let aname = arena.attr_name(name);
                        ops.push(ut_op(
                            UT_OP_SETXATTR,
                            0,
                            0,
                            [dname, aname, value.as_ptr() as u64, value.len() as u64, 0],
                        ));
                    }

                    Op::CollRmAttr { cid, name } => {
                        let dname = arena.path(self.coll_path(*cid))?;
                        let aname = arena.attr_name(name);
                        ops.push(ut_op(UT_OP_REMOVEXATTR, 0, 0, [dname, aname, 0, 0, 0]));
                    }

                    Op::StartSync => start_sync = true,
                }
            }
            data_bytes += t.num_bytes();
        }

        let mut args = UsertransArgs {
            num_ops: ops.len() as u64,
            num_fds: 2,
            metadata_ops: ops.len() as u64,
            data_bytes,
            ops_ptr: ops.as_ptr() as u64,
            flags: 0,
            ops_completed: 0,
        };

        debug!(ops = ops.len(), data_bytes, "usertrans ioctl");
        let r = unsafe { btrfs::usertrans(self.inner.op_file.as_raw_fd(), &mut args) };
        match r {
            Ok(()) => {
                assert_eq!(
                    args.ops_completed as usize,
                    ops.len(),
                    "kernel reported partial usertrans completion"
                );
                if start_sync {
                    self.start_sync();
                }
                Ok(())
            }
            Err(source) => Err(Error::Sys {
                op: "usertrans",
                source,
            }),
        }
    }
}

/// OPEN / PWRITE / CLOSE triplet through fd slot 0
fn ut_write(ops: &mut Vec<UsertransOp>, fname: u64, offset: u64, buf: u64, len: usize) {
    ops.push(ut_op(
        UT_OP_OPEN,
        UT_FLAG_FD_SAVE,
        0,
        [
            fname,
            (libc::O_WRONLY | libc::O_CREAT) as u64,
            0o644,
            0,
            0,
        ],
    ));
    ops.push(ut_op(
        UT_OP_PWRITE,
        UT_FLAG_FD_ARG0,
        0,
        [0, buf, len as u64, offset, 0],
    ));
    ops.push(ut_close(0));
}

/// open src into slot 0, dst into slot 1, clone a range (0,0 for the whole
/// file), close both
fn ut_clone(
    ops: &mut Vec<UsertransOp>,
    src_name: u64,
    dst_name: u64,
    truncate_dst: bool,
    offset: u64,
    len: u64,
) {
    let mut dst_flags = libc::O_WRONLY | libc::O_CREAT;
    if truncate_dst {
        dst_flags |= libc::O_TRUNC;
    }
    ops.push(ut_op(
        UT_OP_OPEN,
        UT_FLAG_FD_SAVE,
        0,
        [src_name, libc::O_RDONLY as u64, 0, 0, 0],
    ));
    ops.push(ut_op(
        UT_OP_OPEN,
        UT_FLAG_FD_SAVE,
        1,
        [dst_name, dst_flags as u64, 0o644, 0, 0],
    ));
    ops.push(ut_op(
        UT_OP_CLONERANGE,
        UT_FLAG_FD_ARG0 | UT_FLAG_FD_ARG1,
        0,
        [0, 1, offset, len, 0],
    ));
    ops.push(ut_close(0));
    ops.push(ut_close(1));
}
