//! Abstraction over the OS mechanisms able to tell us a file changed.
//!
//! Native mechanisms deliver change records asynchronously through a
//! descriptor, while the polling fallback samples metadata whenever it is
//! asked to scan. Both are driven through the same restricted contract so the
//! watch service never has to know which one it got:
//!
//! 1) A path that is missing at registration time may be kept as *pending*.
//!    Pending paths hold no OS resource and are rechecked on every `scan`
//!    and every `drain`.
//! 2) A watched file that is deleted or renamed away is reported once and
//!    then falls back to pending, so a replacement written by an atomic
//!    rename is picked up again.
//! 3) `drain` never blocks. Whatever it hands back is gone from the backend.
use std::{
    collections::{hash_set, HashMap, HashSet},
    fs::Metadata,
    os::{fd::BorrowedFd, unix::fs::MetadataExt},
    path::{Path, PathBuf},
    time::Instant,
};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Inotify,
    Kqueue,
    Polling,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Inotify => "inotify",
            Self::Kqueue => "kqueue",
            Self::Polling => "polling",
        }
    }

    pub fn is_native(&self) -> bool {
        !matches!(self, Self::Polling)
    }

    /// Whether every active watch costs one open descriptor.
    pub fn holds_fd_per_path(&self) -> bool {
        !matches!(self, Self::Inotify)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The parts of a file's metadata that tell us it changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    dev: u64,
    ino: u64,
    mtime: (i64, i64),
    size: u64,
}

impl Snapshot {
    /// True when both snapshots describe the same inode.
    pub fn same_file(&self, other: &Snapshot) -> bool {
        self.dev == other.dev && self.ino == other.ino
    }
}

impl From<&Metadata> for Snapshot {
    fn from(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            size: meta.size(),
        }
    }
}

#[derive(Debug)]
pub struct WatchedPath<T> {
    pub path: PathBuf,
    /// Backend resource for this path. `None` while the path is pending.
    pub token: Option<T>,
    pub snapshot: Option<Snapshot>,
    pub registered: Instant,
}

impl<T> WatchedPath<T> {
    pub fn active(path: &Path, token: T, snapshot: Option<Snapshot>) -> Self {
        Self {
            path: path.to_path_buf(),
            token: Some(token),
            snapshot,
            registered: Instant::now(),
        }
    }

    pub fn pending(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            token: None,
            snapshot: None,
            registered: Instant::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.token.is_none()
    }

    /// Drop the backend resource and go back to waiting for the path.
    pub fn demote(&mut self) -> Option<T> {
        self.snapshot = None;
        self.token.take()
    }
}

/// The path table every backend keeps.
#[derive(Debug)]
pub struct Watches<T> {
    entries: HashMap<PathBuf, WatchedPath<T>>,
}

impl<T> Default for Watches<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> Watches<T> {
    pub fn get(&self, path: &Path) -> Option<&WatchedPath<T>> {
        self.entries.get(path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut WatchedPath<T>> {
        self.entries.get_mut(path)
    }

    pub fn insert(&mut self, watch: WatchedPath<T>) {
        self.entries.insert(watch.path.clone(), watch);
    }

    pub fn remove(&mut self, path: &Path) -> Option<WatchedPath<T>> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.entries.get(path).is_some_and(WatchedPath::is_pending)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn active(&self) -> usize {
        self.entries.values().filter(|w| !w.is_pending()).count()
    }

    pub fn pending_paths(&self) -> Vec<PathBuf> {
        self.entries
            .values()
            .filter(|w| w.is_pending())
            .map(|w| w.path.clone())
            .collect()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut WatchedPath<T>> {
        self.entries.values_mut()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Active,
    Pending,
}

/// Paths that changed since the previous drain. Single use.
#[derive(Debug)]
pub struct Drain(hash_set::IntoIter<PathBuf>);

impl Drain {
    pub fn take(changed: &mut HashSet<PathBuf>) -> Self {
        Self(std::mem::take(changed).into_iter())
    }
}

impl Iterator for Drain {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        self.0.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

pub trait AsBackend {
    fn mode(&self) -> Mode;

    fn add(&mut self, path: &Path, missing_ok: bool) -> Result<Registration>;

    fn remove(&mut self, path: &Path) -> Result<()>;

    fn scan(&mut self) -> Result<()>;

    fn drain(&mut self) -> Result<Drain>;

    fn descriptor(&self) -> Option<BorrowedFd<'_>>;

    fn contains(&self, path: &Path) -> bool;

    fn is_pending(&self, path: &Path) -> bool;

    fn len(&self) -> usize;

    /// Number of OS descriptors currently held, control descriptors included.
    fn resources(&self) -> usize;

    fn close(&mut self);
}
