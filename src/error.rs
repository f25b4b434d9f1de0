//! Discriminable outcomes for every watch and multiplexer operation.
//!
//! Nothing in this crate treats any of these as fatal. Each variant is handed
//! back to the caller, who decides whether to retry, log, or give up.
use std::{io, os::fd::RawFd, path::PathBuf};

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("path {path} does not exist")]
    PathNotFound { path: PathBuf },

    #[error("path {path} is not being watched")]
    UnknownPath { path: PathBuf },

    #[error("cannot watch {path}: limit of {limit} watches reached")]
    WatchLimitExceeded { path: PathBuf, limit: usize },

    #[error("{backend} backend unavailable: {source}")]
    BackendUnavailable {
        backend: &'static str,
        #[source]
        source: Errno,
    },

    #[error("watch service has been closed")]
    ClosedService,

    #[error("wait interrupted by a signal")]
    Interrupted,

    #[error("fd {fd} is already registered")]
    AlreadyRegistered { fd: RawFd },

    #[error("fd {fd} is not registered")]
    NotRegistered { fd: RawFd },

    #[error(transparent)]
    Sys(#[from] Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The path a per-path failure refers to, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::PathNotFound { path }
            | Self::UnknownPath { path }
            | Self::WatchLimitExceeded { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Map a failed `stat`/`open` of a watched path onto the taxonomy.
    pub(crate) fn from_path_errno(path: &std::path::Path, errno: Errno) -> Self {
        match errno {
            Errno::ENOENT | Errno::ENOTDIR => Self::PathNotFound {
                path: path.to_path_buf(),
            },
            other => Self::Sys(other),
        }
    }

    pub(crate) fn from_path_io(path: &std::path::Path, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => Self::from_path_errno(path, Errno::from_raw(raw)),
            None => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_errno_maps_to_path_not_found() {
        let err = Error::from_path_errno(std::path::Path::new("/nope"), Errno::ENOENT);
        assert!(matches!(err, Error::PathNotFound { .. }));
        assert_eq!(err.path(), Some(&PathBuf::from("/nope")));
    }

    #[test]
    fn other_errno_stays_generic() {
        let err = Error::from_path_errno(std::path::Path::new("/nope"), Errno::EACCES);
        assert!(matches!(err, Error::Sys(Errno::EACCES)));
        assert!(err.path().is_none());
    }

    #[test]
    fn io_not_found_maps_through_errno() {
        let io_err = io::Error::from_raw_os_error(Errno::ENOENT as i32);
        let err = Error::from_path_io(std::path::Path::new("/nope"), io_err);
        assert!(matches!(err, Error::PathNotFound { .. }));
    }
}
