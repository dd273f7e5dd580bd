//! xattr adapter
//!
//! every attribute this store owns lives in the `user.ceph.` namespace;
//! other xattrs on the same inode are invisible through this layer. the
//! `xattr` crate handles the platform argument differences and the
//! ERANGE/size-probe loop internally.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// namespace prefix for every attribute the store owns
pub const ATTR_PREFIX: &str = "user.ceph.";

fn prefixed(name: &str) -> String {
    format!("{ATTR_PREFIX}{name}")
}

fn xattr_err(path: &Path, message: impl Into<String>) -> Error {
    Error::Xattr {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// read one attribute
pub fn get(path: &Path, name: &str) -> Result<Vec<u8>> {
    match xattr::get(path, prefixed(name)) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(Error::NoAttr {
            path: path.to_path_buf(),
            name: name.to_string(),
        }),
        Err(e) => Err(xattr_err(path, format!("failed to get '{name}': {e}"))),
    }
}

/// write one attribute
pub fn set(path: &Path, name: &str, value: &[u8]) -> Result<()> {
    xattr::set(path, prefixed(name), value)
        .map_err(|e| xattr_err(path, format!("failed to set '{name}': {e}")))
}

/// remove one attribute
pub fn remove(path: &Path, name: &str) -> Result<()> {
    xattr::remove(path, prefixed(name))
        .map_err(|e| xattr_err(path, format!("failed to remove '{name}': {e}")))
}

/// list the store-owned attribute names on an inode, prefix stripped
pub fn list(path: &Path) -> Result<Vec<String>> {
    let names = xattr::list(path).map_err(|e| xattr_err(path, format!("failed to list: {e}")))?;
    Ok(names
        .filter_map(|n| {
            let n = n.to_string_lossy().into_owned();
            n.strip_prefix(ATTR_PREFIX).map(str::to_string)
        })
        .filter(|n| !n.is_empty())
        .collect())
}

/// read every store-owned attribute on an inode
///
/// with `user_only`, only attributes stored under a `_`-prefixed name are
/// returned, exposed without the underscore; other names are internal.
pub fn get_all(path: &Path, user_only: bool) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    for name in list(path)? {
        let exposed = if user_only {
            match name.strip_prefix('_') {
                Some(rest) if !rest.is_empty() => rest.to_string(),
                _ => continue,
            }
        } else {
            name.clone()
        };
        out.insert(exposed, get(path, &name)?);
    }
    Ok(out)
}

/// remove every store-owned attribute on an inode
pub fn remove_all(path: &Path) -> Result<()> {
    for name in list(path)? {
        remove(path, &name)?;
    }
    Ok(())
}

/// round-trip a sentinel value to check the file system actually stores
/// user xattrs; some need a mount option for that
pub fn probe(path: &Path) -> bool {
    let token: u64 = rand::random();
    let sentinel = token.to_le_bytes();
    if xattr::set(path, "user.test", &sentinel).is_err() {
        return false;
    }
    let ok = matches!(xattr::get(path, "user.test"), Ok(Some(v)) if v == sentinel);
    let _ = xattr::remove(path, "user.test");
    ok
}
