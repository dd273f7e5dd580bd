//! naming and path codec
//!
//! a collection is a directory named by the collection id's printed form; an
//! object inside it is a file named `<escaped-name>_<snaptag>`. the escaping
//! keeps arbitrary byte-string object names inside a single path component
//! and keeps a leading dot reserved for directory metadata:
//!
//! - `\` becomes `\\`
//! - a leading `.` becomes `\.`
//! - `/` becomes `\s`
//!
//! parsing splits on the last `_`; the codec is its own inverse on
//! everything it emits.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use crate::types::{CollectionId, ObjectId, SnapId};

/// directory holding a collection
pub fn coll_dir(basedir: &Path, cid: CollectionId) -> PathBuf {
    basedir.join(cid.to_string())
}

/// full path of an object's file inside its collection
pub fn object_path(basedir: &Path, cid: CollectionId, oid: &ObjectId) -> PathBuf {
    coll_dir(basedir, cid).join(object_file_name(oid))
}

/// file name for an object: escaped name, `_`, snaptag
pub fn object_file_name(oid: &ObjectId) -> OsString {
    let mut out = escape_name(&oid.name);
    out.push(b'_');
    out.extend_from_slice(oid.snap.to_string().as_bytes());
    OsString::from_vec(out)
}

/// parse a collection directory name back to its id
pub fn parse_coll_name(name: &str) -> Option<CollectionId> {
    CollectionId::parse(name)
}

/// parse an object file name back to its id
///
/// returns None for anything the encoder would not emit: no `_` separator,
/// a dangling or unknown escape, or a snaptag that is neither `head`,
/// `snapdir`, nor plain hex.
pub fn parse_object_name(name: &[u8]) -> Option<ObjectId> {
    let bar = name.iter().rposition(|&b| b == b'_')?;
    let oname = unescape_name(&name[..bar])?;
    let snap = parse_snaptag(&name[bar + 1..])?;
    Some(ObjectId::new(oname, snap))
}

fn parse_snaptag(tag: &[u8]) -> Option<SnapId> {
    match tag {
        b"head" => Some(SnapId::NOSNAP),
        b"snapdir" => Some(SnapId::SNAPDIR),
        _ => {
            let s = std::str::from_utf8(tag).ok()?;
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            u64::from_str_radix(s, 16).ok().map(SnapId)
        }
    }
}

fn escape_name(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for (i, &b) in name.iter().enumerate() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'.' if i == 0 => out.extend_from_slice(b"\\."),
            b'/' => out.extend_from_slice(b"\\s"),
            _ => out.push(b),
        }
    }
    out
}

fn unescape_name(escaped: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut it = escaped.iter();
    while let Some(&b) = it.next() {
        if b == b'\\' {
            match it.next() {
                Some(b'\\') => out.push(b'\\'),
                Some(b'.') => out.push(b'.'),
                Some(b's') => out.push(b'/'),
                _ => return None,
            }
        } else {
            out.push(b);
        }
    }
    Some(out)
}
