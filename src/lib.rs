//! silo - transactional local object store
//!
//! the store that backs one node of a distributed object storage system:
//! objects (blobs with a snapshot id and named attributes) live as plain
//! files inside collection directories, and every mutation goes through an
//! atomically-applied, journaled transaction batch.
//!
//! # Core concepts
//!
//! - **Collection**: a flat namespace of objects; one directory
//! - **Object**: a file named `<escaped-name>_<snaptag>` in that directory
//! - **Transaction**: an ordered op batch, applied all-or-nothing with
//!   respect to crashes and acknowledged at two durability points
//!   (journaled, on-disk)
//! - **Journal**: external write-ahead log replayed at mount
//!
//! # Apply backends
//!
//! the mount probe picks the strongest backend the kernel offers: a
//! user-transaction ioctl that applies a whole op vector atomically, a
//! transaction-bracket ioctl pair around ordinary syscalls, or plain POSIX
//! with crash atomicity provided by journal replay.
//!
//! # Example usage
//!
//! ```no_run
//! use silo::{CollectionId, Config, ObjectId, Store, Transaction};
//!
//! let config = Config::new("/var/lib/silo/0");
//! Store::mkfs(&config).unwrap();
//! let store = Store::mount(config).unwrap();
//!
//! let cid = CollectionId(0xab);
//! let mut t = Transaction::new();
//! t.create_collection(cid);
//! t.touch(cid, ObjectId::head("greeting"));
//! t.write(cid, ObjectId::head("greeting"), 0, b"hello".to_vec());
//! store.apply_transaction(t).unwrap();
//!
//! assert_eq!(store.read(cid, &ObjectId::head("greeting"), 0, 5).unwrap(), b"hello");
//! store.umount().unwrap();
//! ```

mod btrfs;
mod config;
mod error;
mod store;
mod types;
mod xattrs;

#[cfg(feature = "fakes")]
mod fakes;

pub mod journal;
pub mod paths;
pub mod signals;
pub mod txn;

pub use config::Config;
pub use error::{Error, IoResultExt, Result};
pub use journal::{Callback, FileJournal, Journal};
pub use store::{Capabilities, FileStat, FsStats, ListHandle, Store};
pub use txn::{Op, Transaction};
pub use types::{CollectionId, ObjectId, SnapId};
