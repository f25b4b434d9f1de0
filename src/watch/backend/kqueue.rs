use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    libc::timespec,
    sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue},
};
use tracing::trace;

use super::{AsBackend, Drain, Mode, Registration, WatchedPath, Watches};
use crate::error::{Error, Result};

const NO_TIME_WAIT: timespec = timespec {
    tv_sec: 0,
    tv_nsec: 0,
};

const EVENT_BATCH: usize = 16;

fn vnode_flags() -> FilterFlag {
    FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_EXTEND
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_RENAME
}

fn empty_event() -> KEvent {
    KEvent::new(
        0,
        EventFilter::EVFILT_VNODE,
        EventFlag::empty(),
        FilterFlag::empty(),
        0,
        0,
    )
}

/// kqueue watches vnodes through open descriptors, so unlike inotify every
/// active path costs one file handle.
pub struct KqueueBackend {
    kq: Option<Kqueue>,
    watches: Watches<File>,
    by_ident: HashMap<RawFd, PathBuf>,
    changed: HashSet<PathBuf>,
}

impl KqueueBackend {
    pub fn open() -> Result<Self> {
        let kq = Kqueue::new().map_err(|source| Error::BackendUnavailable {
            backend: Mode::Kqueue.name(),
            source,
        })?;
        Ok(Self {
            kq: Some(kq),
            watches: Watches::default(),
            by_ident: HashMap::new(),
            changed: HashSet::new(),
        })
    }

    fn attach(&mut self, path: &Path) -> io::Result<File> {
        let Some(kq) = &self.kq else {
            return Err(io::Error::from_raw_os_error(Errno::EBADF as i32));
        };
        let file = File::open(path)?;
        let ev = KEvent::new(
            file.as_raw_fd() as _,
            EventFilter::EVFILT_VNODE,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            vnode_flags(),
            0,
            0,
        );
        kq.kevent(&[ev], &mut [], Some(NO_TIME_WAIT))?;
        self.by_ident.insert(file.as_raw_fd(), path.to_path_buf());
        Ok(file)
    }

    // Closing the handle also removes its kevent.
    fn detach(&mut self, file: File) {
        self.by_ident.remove(&file.as_raw_fd());
    }

    fn read_events(&mut self) -> Result<()> {
        loop {
            let mut eventlist = [empty_event(); EVENT_BATCH];
            let n = match &self.kq {
                Some(kq) => match kq.kevent(&[], &mut eventlist, Some(NO_TIME_WAIT)) {
                    Ok(n) => n,
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                },
                None => return Err(Error::ClosedService),
            };
            for ev in &eventlist[..n] {
                let ident = ev.ident() as RawFd;
                let Some(path) = self.by_ident.get(&ident).cloned() else {
                    continue;
                };
                if ev
                    .fflags()
                    .intersects(FilterFlag::NOTE_DELETE | FilterFlag::NOTE_RENAME)
                {
                    if let Some(file) = self.watches.get_mut(&path).and_then(WatchedPath::demote) {
                        self.detach(file);
                    }
                }
                trace!(path = %path.display(), "change detected");
                self.changed.insert(path);
            }
            if n < EVENT_BATCH {
                return Ok(());
            }
        }
    }

    fn recheck_pending(&mut self) {
        for path in self.watches.pending_paths() {
            if let Ok(file) = self.attach(&path) {
                trace!(path = %path.display(), "pending path appeared");
                if let Some(watch) = self.watches.get_mut(&path) {
                    watch.token = Some(file);
                }
                self.changed.insert(path);
            }
        }
    }
}

impl AsBackend for KqueueBackend {
    fn mode(&self) -> Mode {
        Mode::Kqueue
    }

    fn add(&mut self, path: &Path, missing_ok: bool) -> Result<Registration> {
        match self.attach(path) {
            Ok(file) => {
                self.watches.insert(WatchedPath::active(path, file, None));
                Ok(Registration::Active)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && missing_ok => {
                self.watches.insert(WatchedPath::pending(path));
                Ok(Registration::Pending)
            }
            Err(e) => match e.raw_os_error().map(Errno::from_raw) {
                Some(Errno::EMFILE | Errno::ENFILE) => Err(Error::WatchLimitExceeded {
                    path: path.to_path_buf(),
                    limit: self.watches.active(),
                }),
                _ => Err(Error::from_path_io(path, e)),
            },
        }
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        let watch = self.watches.remove(path).ok_or_else(|| Error::UnknownPath {
            path: path.to_path_buf(),
        })?;
        if let Some(file) = watch.token {
            self.detach(file);
        }
        self.changed.remove(path);
        Ok(())
    }

    fn scan(&mut self) -> Result<()> {
        self.read_events()?;
        self.recheck_pending();
        Ok(())
    }

    fn drain(&mut self) -> Result<Drain> {
        self.scan()?;
        Ok(Drain::take(&mut self.changed))
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.kq.as_ref().map(|kq| kq.as_fd())
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
        usize::from(self.kq.is_some()) + self.watches.active()
    }

    fn close(&mut self) {
        self.watches.clear();
        self.by_ident.clear();
        self.changed.clear();
        self.kq = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "one").unwrap();

        let mut backend = KqueueBackend::open().unwrap();
        backend.add(&path, false).unwrap();
        assert_eq!(backend.resources(), 2);

        fs::write(&path, "two").unwrap();
        assert_eq!(backend.drain().unwrap().collect::<Vec<_>>(), vec![path]);
        assert_eq!(backend.drain().unwrap().count(), 0);
    }

    #[test]
    fn deleted_file_goes_pending_and_comes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        fs::write(&path, "k").unwrap();

        let mut backend = KqueueBackend::open().unwrap();
        backend.add(&path, false).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(backend.drain().unwrap().any(|p| p == path));
        assert!(backend.is_pending(&path));
        assert_eq!(backend.resources(), 1);

        fs::write(&path, "k2").unwrap();
        backend.scan().unwrap();
        assert!(!backend.is_pending(&path));
    }
}
