use std::{
    collections::{HashMap, HashSet},
    fs,
    os::fd::{AsFd, BorrowedFd},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor},
};
use tracing::{trace, warn};

use super::{AsBackend, Drain, Mode, Registration, Snapshot, WatchedPath, Watches};
use crate::error::{Error, Result};

const MAX_USER_WATCHES: &str = "/proc/sys/fs/inotify/max_user_watches";

fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_MOVE_SELF
        | AddWatchFlags::IN_DELETE_SELF
}

// Events after which the watch no longer follows the path.
fn detaching() -> AddWatchFlags {
    AddWatchFlags::IN_MOVE_SELF | AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_IGNORED
}

fn kernel_ceiling() -> Option<usize> {
    fs::read_to_string(MAX_USER_WATCHES).ok()?.trim().parse().ok()
}

pub struct InotifyBackend {
    inotify: Option<Inotify>,
    watches: Watches<WatchDescriptor>,
    // Two paths naming the same inode share a watch descriptor.
    by_wd: HashMap<WatchDescriptor, HashSet<PathBuf>>,
    changed: HashSet<PathBuf>,
}

impl InotifyBackend {
    pub fn open() -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK).map_err(
            |source| Error::BackendUnavailable {
                backend: Mode::Inotify.name(),
                source,
            },
        )?;
        Ok(Self {
            inotify: Some(inotify),
            watches: Watches::default(),
            by_wd: HashMap::new(),
            changed: HashSet::new(),
        })
    }

    fn inotify(&self) -> Result<&Inotify> {
        self.inotify.as_ref().ok_or(Error::ClosedService)
    }

    fn attach(&mut self, path: &Path) -> std::result::Result<WatchDescriptor, Errno> {
        let wd = match &self.inotify {
            Some(inotify) => inotify.add_watch(path, watch_mask())?,
            None => return Err(Errno::EBADF),
        };
        self.by_wd.entry(wd).or_default().insert(path.to_path_buf());
        Ok(wd)
    }

    /// Forget `path` under `wd`, dropping the kernel watch once nobody else
    /// shares it.
    fn detach(&mut self, wd: WatchDescriptor, path: &Path) {
        let Some(paths) = self.by_wd.get_mut(&wd) else {
            return;
        };
        paths.remove(path);
        if paths.is_empty() {
            self.by_wd.remove(&wd);
            if let Some(inotify) = &self.inotify {
                // EINVAL: the kernel already dropped it
                match inotify.rm_watch(wd) {
                    Ok(()) | Err(Errno::EINVAL) => {}
                    Err(e) => warn!(path = %path.display(), "rm_watch failed: {e}"),
                }
            }
        }
    }

    fn handle_event(&mut self, event: InotifyEvent) {
        if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            warn!("inotify queue overflowed, reporting every watched path");
            for paths in self.by_wd.values() {
                self.changed.extend(paths.iter().cloned());
            }
            return;
        }
        let Some(paths) = self.by_wd.get(&event.wd).cloned() else {
            return;
        };
        if event.mask.intersects(detaching()) {
            for path in &paths {
                if let Some(watch) = self.watches.get_mut(path) {
                    watch.demote();
                }
                self.detach(event.wd, path);
            }
        }
        for path in paths {
            trace!(path = %path.display(), mask = ?event.mask, "change detected");
            self.changed.insert(path);
        }
    }

    fn read_events(&mut self) -> Result<()> {
        loop {
            let events = match self.inotify()?.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                self.handle_event(event);
            }
        }
    }

    /// An unlink of a file someone else still holds open, or of one of
    /// several hard links, only shows up as `IN_ATTRIB` on the old inode.
    /// Catch those by checking that every active path still names the inode
    /// its watch was taken on.
    fn recheck_active(&mut self) {
        let mut lost = Vec::new();
        for watch in self.watches.values_mut() {
            let Some(wd) = watch.token else {
                continue;
            };
            let current = fs::metadata(&watch.path).ok().map(|m| Snapshot::from(&m));
            let moved = match (watch.snapshot, current) {
                (Some(prev), Some(now)) => !prev.same_file(&now),
                (_, None) => true,
                (None, Some(_)) => false,
            };
            if moved {
                watch.demote();
                lost.push((wd, watch.path.clone()));
            }
        }
        for (wd, path) in lost {
            trace!(path = %path.display(), "watched inode no longer at path");
            self.detach(wd, &path);
            self.changed.insert(path);
        }
    }

    fn recheck_pending(&mut self) {
        for path in self.watches.pending_paths() {
            if let Ok(wd) = self.attach(&path) {
                trace!(path = %path.display(), "pending path appeared");
                let snapshot = fs::metadata(&path).ok().map(|m| Snapshot::from(&m));
                if let Some(watch) = self.watches.get_mut(&path) {
                    watch.token = Some(wd);
                    watch.snapshot = snapshot;
                }
                self.changed.insert(path);
            }
        }
    }
}

impl AsBackend for InotifyBackend {
    fn mode(&self) -> Mode {
        Mode::Inotify
    }

    fn add(&mut self, path: &Path, missing_ok: bool) -> Result<Registration> {
        match self.attach(path) {
            Ok(wd) => {
                let snapshot = fs::metadata(path).ok().map(|m| Snapshot::from(&m));
                self.watches.insert(WatchedPath::active(path, wd, snapshot));
                Ok(Registration::Active)
            }
            Err(Errno::ENOENT) if missing_ok => {
                self.watches.insert(WatchedPath::pending(path));
                Ok(Registration::Pending)
            }
            Err(Errno::ENOSPC) => Err(Error::WatchLimitExceeded {
                path: path.to_path_buf(),
                limit: kernel_ceiling().unwrap_or(self.watches.active()),
            }),
            Err(e) => Err(Error::from_path_errno(path, e)),
        }
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        let watch = self.watches.remove(path).ok_or_else(|| Error::UnknownPath {
            path: path.to_path_buf(),
        })?;
        if let Some(wd) = watch.token {
            self.detach(wd, path);
        }
        self.changed.remove(path);
        Ok(())
    }

    fn scan(&mut self) -> Result<()> {
        self.read_events()?;
        self.recheck_active();
        self.recheck_pending();
        Ok(())
    }

    fn drain(&mut self) -> Result<Drain> {
        self.scan()?;
        Ok(Drain::take(&mut self.changed))
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.inotify.as_ref().map(|inotify| inotify.as_fd())
    }

    fn contains(&self, path: &Path) -> bool {
        self.watches.contains(path)
    }

    fn is_pending(&self, path: &Path) -> bool {
        self.watches.is_pending(path)
    }

    fn len(&self) -> usize {
        self.watches.len()
    }

    fn resources(&self) -> usize {
        usize::from(self.inotify.is_some())
    }

    fn close(&mut self) {
        // closing the instance releases every kernel watch with it
        self.inotify = None;
        self.watches.clear();
        self.by_wd.clear();
        self.changed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "one").unwrap();

        let mut backend = InotifyBackend::open().unwrap();
        assert_eq!(backend.add(&path, false).unwrap(), Registration::Active);
        assert_eq!(backend.drain().unwrap().count(), 0);

        fs::write(&path, "two").unwrap();
        assert_eq!(backend.drain().unwrap().collect::<Vec<_>>(), vec![path]);
        assert_eq!(backend.drain().unwrap().count(), 0);
    }

    #[test]
    fn no_descriptor_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let mut backend = InotifyBackend::open().unwrap();
        backend.add(&a, false).unwrap();
        backend.add(&b, false).unwrap();
        assert_eq!(backend.resources(), 1);
        backend.remove(&b).unwrap();
        assert_eq!(backend.resources(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn deleted_file_goes_pending_and_comes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        fs::write(&path, "k").unwrap();

        let mut backend = InotifyBackend::open().unwrap();
        backend.add(&path, false).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(backend.drain().unwrap().any(|p| p == path));
        assert!(backend.is_pending(&path));

        fs::write(&path, "k2").unwrap();
        backend.scan().unwrap();
        assert!(!backend.is_pending(&path));
        assert!(backend.drain().unwrap().any(|p| p == path));
    }

    #[test]
    fn unlink_while_held_open_goes_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.conf");
        fs::write(&path, "old").unwrap();
        let _holder = fs::File::open(&path).unwrap();

        let mut backend = InotifyBackend::open().unwrap();
        backend.add(&path, false).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(backend.drain().unwrap().any(|p| p == path));
        assert!(backend.is_pending(&path));

        fs::write(&path, "new").unwrap();
        backend.scan().unwrap();
        assert!(backend.drain().unwrap().any(|p| p == path));
        assert!(!backend.is_pending(&path));

        fs::write(&path, "newer").unwrap();
        assert_eq!(backend.drain().unwrap().collect::<Vec<_>>(), vec![path]);
    }

    #[test]
    fn unlinking_one_link_keeps_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared");
        fs::write(&path, "s").unwrap();
        let alias = dir.path().join("linked");
        fs::hard_link(&path, &alias).unwrap();

        let mut backend = InotifyBackend::open().unwrap();
        backend.add(&path, false).unwrap();
        backend.add(&alias, false).unwrap();
        fs::remove_file(&path).unwrap();
        backend.drain().unwrap().for_each(drop);
        assert!(backend.is_pending(&path));
        assert!(!backend.is_pending(&alias));

        fs::write(&alias, "t").unwrap();
        assert_eq!(backend.drain().unwrap().collect::<Vec<_>>(), vec![alias]);
    }

    #[test]
    fn aliased_paths_share_a_watch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared");
        fs::write(&path, "s").unwrap();
        let alias = dir.path().join("linked");
        fs::hard_link(&path, &alias).unwrap();

        let mut backend = InotifyBackend::open().unwrap();
        backend.add(&path, false).unwrap();
        backend.add(&alias, false).unwrap();
        backend.remove(&path).unwrap();

        fs::write(&path, "t").unwrap();
        assert_eq!(backend.drain().unwrap().collect::<Vec<_>>(), vec![alias]);
    }
}
