use std::path::PathBuf;

use nix::libc;

/// error type for silo operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store basedir not found at {0}")]
    NoStore(PathBuf),

    #[error("store at {0} is locked by another process")]
    Busy(PathBuf),

    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("attribute '{name}' not found on {path}")]
    NoAttr { path: PathBuf, name: String },

    #[error("xattrs are not usable on {0}, mount the file system with user_xattr")]
    XattrsUnusable(PathBuf),

    #[error("xattr error on {path}: {message}")]
    Xattr { path: PathBuf, message: String },

    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    #[error("short write to {path}: wrote {wrote} of {expected} bytes")]
    ShortWrite {
        path: PathBuf,
        wrote: u64,
        expected: u64,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// negated-errno view of this error, for callers that speak errno
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoStore(_) | Error::NotFound(_) => -libc::ENOENT,
            Error::Busy(_) => -libc::EBUSY,
            Error::NoAttr { .. } => -libc::ENODATA,
            Error::XattrsUnusable(_) => -libc::EIO,
            Error::Xattr { .. } => -libc::EIO,
            Error::CorruptJournal(_) => -libc::EINVAL,
            Error::ShortWrite { .. } => -libc::EIO,
            Error::Io { source, .. } => -source.raw_os_error().unwrap_or(libc::EIO),
            Error::Sys { source, .. } => -(*source as i32),
            Error::Config(_) | Error::ConfigSerialize(_) => -libc::EINVAL,
        }
    }

    /// true if this is a missing-path error
    pub fn is_not_found(&self) -> bool {
        self.errno() == -libc::ENOENT
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| {
            let path = path.into();
            if source.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path)
            } else {
                Error::Io { path, source }
            }
        })
    }
}
