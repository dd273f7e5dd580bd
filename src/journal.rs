//! write-ahead journal
//!
//! the store only depends on the narrow [`Journal`] interface: submit a
//! serialized batch, get told when it is durable in the journal and when a
//! later filesystem commit has made it durable on disk, and replay
//! committed-but-unapplied batches at mount. [`FileJournal`] is the
//! file-backed implementation paired with the store by default.
//!
//! on-disk format: a 16-byte header `{magic, version, fsid}` followed by
//! records `{seq u64-le, len u32-le, crc32c u32-le, cbor(Vec<Transaction>)}`.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use nix::libc;
use tracing::{debug, info, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::txn::Transaction;

/// durability notification, fired exactly once or dropped
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

const JOURNAL_MAGIC: u32 = 0x4f4c_4953;
const JOURNAL_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const RECORD_HEADER_LEN: usize = 16;

/// the narrow interface the store consumes
pub trait Journal: Send {
    /// format a blank journal
    fn create(&mut self) -> Result<()>;
    /// open an existing journal and validate its header
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    /// begin accepting new entries
    fn start(&mut self);
    /// stop accepting new entries
    fn stop(&mut self);
    /// committed batches with sequence > `from_seq`, in order
    fn replay(&mut self, from_seq: u64) -> Result<Vec<(u64, Vec<Transaction>)>>;
    /// queue a batch for durable write; `on_journal` fires once the entry is
    /// durable in the journal, `on_disk` once a filesystem commit covers it
    fn submit(
        &mut self,
        seq: u64,
        batch: &[Transaction],
        on_journal: Option<Callback>,
        on_disk: Option<Callback>,
    ) -> Result<()>;
    /// true if there is anything to commit; latches a snapshot of what the
    /// next commit will cover
    fn commit_start(&mut self) -> bool;
    /// the filesystem commit is underway; new entries may land past the
    /// snapshot point
    fn commit_started(&mut self);
    /// the filesystem commit through `fs_seq` completed; entries at or below
    /// it may be discarded and their on-disk waiters notified
    fn commit_finish(&mut self, fs_seq: u64);
}

struct PendingEntry {
    seq: u64,
    on_disk: Option<Callback>,
}

/// file-backed journal
pub struct FileJournal {
    path: PathBuf,
    fsid: u64,
    direct_io: bool,
    file: Option<File>,
    accepting: bool,
    /// submitted entries not yet covered by a filesystem commit
    pending: VecDeque<PendingEntry>,
    last_submitted: u64,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>, fsid: u64, direct_io: bool) -> Self {
        Self {
            path: path.into(),
            fsid,
            direct_io,
            file: None,
            accepting: false,
            pending: VecDeque::new(),
            last_submitted: 0,
        }
    }

    fn open_file(&self, truncate: bool) -> Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        if truncate {
            opts.truncate(true);
        }
        if self.direct_io {
            // make each append durable as it lands instead of fsync-per-submit
            opts.custom_flags(libc::O_DSYNC);
        }
        opts.open(&self.path).with_path(&self.path)
    }

    fn file(&mut self) -> &mut File {
        self.file.as_mut().expect("journal not open")
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        header.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        header.extend_from_slice(&self.fsid.to_le_bytes());
        let path = self.path.clone();
        let file = self.file();
        file.seek(SeekFrom::Start(0)).with_path(&path)?;
        file.write_all(&header).with_path(&path)?;
        file.sync_data().with_path(&path)?;
        Ok(())
    }

    fn check_header(&mut self) -> Result<()> {
        let path = self.path.clone();
        let file = self.file();
        file.seek(SeekFrom::Start(0)).with_path(&path)?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|_| Error::CorruptJournal("header too short".into()))?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let fsid = u64::from_le_bytes(header[8..16].try_into().unwrap());
        if magic != JOURNAL_MAGIC {
            return Err(Error::CorruptJournal(format!("bad magic {magic:#x}")));
        }
        if version != JOURNAL_VERSION {
            return Err(Error::CorruptJournal(format!("unknown version {version}")));
        }
        if fsid != self.fsid {
            return Err(Error::CorruptJournal(format!(
                "journal fsid {fsid:#x} does not match store fsid {:#x}",
                self.fsid
            )));
        }
        Ok(())
    }

    /// scan records from the header on; a torn final record is truncated
    /// away, anything decodable is returned
    fn scan(&mut self) -> Result<Vec<(u64, Vec<Transaction>)>> {
        let path = self.path.clone();
        let end = self
            .file()
            .metadata()
            .with_path(&path)?
            .len();
        let mut pos = HEADER_LEN;
        let mut entries = Vec::new();

        while pos < end {
            if end - pos < RECORD_HEADER_LEN as u64 {
                break;
            }
            self.file().seek(SeekFrom::Start(pos)).with_path(&path)?;
            let mut rh = [0u8; RECORD_HEADER_LEN];
            self.file().read_exact(&mut rh).with_path(&path)?;
            let seq = u64::from_le_bytes(rh[0..8].try_into().unwrap());
            let len = u32::from_le_bytes(rh[8..12].try_into().unwrap()) as u64;
            let crc = u32::from_le_bytes(rh[12..16].try_into().unwrap());

            if end - pos - (RECORD_HEADER_LEN as u64) < len {
                break;
            }
            let mut payload = vec![0u8; len as usize];
            self.file().read_exact(&mut payload).with_path(&path)?;
            if crc32c::crc32c(&payload) != crc {
                break;
            }
            let batch: Vec<Transaction> = match ciborium::de::from_reader(payload.as_slice()) {
                Ok(b) => b,
                Err(_) => break,
            };
            entries.push((seq, batch));
            pos += RECORD_HEADER_LEN as u64 + len;
        }

        if pos < end {
            warn!(
                journal = %self.path.display(),
                at = pos,
                "torn tail record, truncating"
            );
            self.file().set_len(pos).with_path(&path)?;
        }
        self.file().seek(SeekFrom::End(0)).with_path(&path)?;
        self.last_submitted = entries.last().map(|(s, _)| *s).unwrap_or(0);
        Ok(entries)
    }
}

impl Journal for FileJournal {
    fn create(&mut self) -> Result<()> {
        info!(journal = %self.path.display(), "creating journal");
        self.file = Some(self.open_file(true)?);
        self.write_header()?;
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        debug!(journal = %self.path.display(), "opening journal");
        self.file = Some(self.open_file(false)?);
        let len = self.file().metadata().with_path(&self.path)?.len();
        if len == 0 {
            // never formatted; treat as blank
            self.write_header()?;
            return Ok(());
        }
        self.check_header()?;
        // appends go to the end; replay() repositions after its scan
        let path = self.path.clone();
        self.file().seek(SeekFrom::End(0)).with_path(&path)?;
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
        self.accepting = false;
    }

    fn start(&mut self) {
        self.accepting = true;
    }

    fn stop(&mut self) {
        self.accepting = false;
    }

    fn replay(&mut self, from_seq: u64) -> Result<Vec<(u64, Vec<Transaction>)>> {
        let entries = self.scan()?;
        let total = entries.len();
        let newer: Vec<_> = entries.into_iter().filter(|(s, _)| *s > from_seq).collect();
        info!(
            journal = %self.path.display(),
            total,
            replaying = newer.len(),
            from_seq,
            "journal replay"
        );
        Ok(newer)
    }

    fn submit(
        &mut self,
        seq: u64,
        batch: &[Transaction],
        on_journal: Option<Callback>,
        on_disk: Option<Callback>,
    ) -> Result<()> {
        if !self.accepting {
            return Err(Error::Sys {
                op: "journal submit",
                source: nix::errno::Errno::ESHUTDOWN,
            });
        }

        let mut payload = Vec::new();
        ciborium::ser::into_writer(&batch, &mut payload)
            .expect("transaction batch must encode");
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.extend_from_slice(&seq.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        record.extend_from_slice(&payload);

        let path = self.path.clone();
        self.file().write_all(&record).with_path(&path)?;
        if !self.direct_io {
            self.file().sync_data().with_path(&path)?;
        }
        debug!(seq, bytes = record.len(), "journaled batch");

        // the entry is durable in the journal
        if let Some(cb) = on_journal {
            cb();
        }
        self.pending.push_back(PendingEntry { seq, on_disk });
        self.last_submitted = seq;
        Ok(())
    }

    fn commit_start(&mut self) -> bool {
        !self.pending.is_empty()
    }

    fn commit_started(&mut self) {
        // appends keep landing past the snapshot point; nothing to release
        // for a synchronous file journal
    }

    fn commit_finish(&mut self, fs_seq: u64) {
        while let Some(front) = self.pending.front() {
            if front.seq > fs_seq {
                break;
            }
            let entry = self.pending.pop_front().unwrap();
            if let Some(cb) = entry.on_disk {
                cb();
            }
        }
        if self.pending.is_empty() && self.last_submitted <= fs_seq {
            // everything in the file is durable on disk; reclaim it
            if let Some(file) = self.file.as_mut() {
                if file.set_len(HEADER_LEN).is_ok() {
                    let _ = file.seek(SeekFrom::End(0));
                    debug!(thru = fs_seq, "journal trimmed");
                }
            }
        }
    }
}
