//! Metadata sampling, for when the kernel can't (or shouldn't) be trusted.
//!
//! Every active path keeps a read-only handle open. A scan compares what the
//! handle sees against what the path currently names, which catches in-place
//! writes as well as deletes and rename-replacements. Readiness is faked with
//! a self-pipe that `scan` pokes whenever it found something, so this backend
//! composes with the multiplexer like the native ones do.
use std::{
    collections::HashSet,
    fs::{self, File},
    io,
    os::fd::BorrowedFd,
    path::{Path, PathBuf},
};

use nix::errno::Errno;
use tracing::trace;

use super::{AsBackend, Drain, Mode, Registration, Snapshot, WatchedPath, Watches};
use crate::{
    error::{Error, Result},
    event::EventSource,
    utils::SelfPipe,
};

pub struct PollingBackend {
    watches: Watches<File>,
    changed: HashSet<PathBuf>,
    // `None` once closed
    wake: Option<SelfPipe>,
}

fn attach(path: &Path) -> io::Result<(File, Snapshot)> {
    let file = File::open(path)?;
    let snapshot = Snapshot::from(&file.metadata()?);
    Ok((file, snapshot))
}

/// What a single sample of an active path found.
enum Sample {
    Unchanged,
    Modified(Snapshot),
    Replaced,
    Gone,
}

fn sample(file: &File, path: &Path, prev: Option<Snapshot>) -> Sample {
    let Ok(named) = fs::metadata(path) else {
        return Sample::Gone;
    };
    let named = Snapshot::from(&named);
    let Some(prev) = prev else {
        return Sample::Modified(named);
    };
    if !prev.same_file(&named) {
        return Sample::Replaced;
    }
    let held = file.metadata().map(|m| Snapshot::from(&m)).unwrap_or(named);
    if held != prev {
        Sample::Modified(held)
    } else {
        Sample::Unchanged
    }
}

impl PollingBackend {
    pub fn open() -> Result<Self> {
        let wake = SelfPipe::new().map_err(|source| Error::BackendUnavailable {
            backend: Mode::Polling.name(),
            source,
        })?;
        Ok(Self {
            watches: Watches::default(),
            changed: HashSet::new(),
            wake: Some(wake),
        })
    }

    fn signal(&self) -> Result<()> {
        if let Some(wake) = &self.wake {
            wake.wake()?;
        }
        Ok(())
    }
}

impl AsBackend for PollingBackend {
    fn mode(&self) -> Mode {
        Mode::Polling
    }

    fn add(&mut self, path: &Path, missing_ok: bool) -> Result<Registration> {
        match attach(path) {
            Ok((file, snapshot)) => {
                self.watches
                    .insert(WatchedPath::active(path, file, Some(snapshot)));
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
        // dropping the entry closes its handle
        self.watches.remove(path).ok_or_else(|| Error::UnknownPath {
            path: path.to_path_buf(),
        })?;
        self.changed.remove(path);
        Ok(())
    }

    fn scan(&mut self) -> Result<()> {
        let before = self.changed.len();
        for watch in self.watches.values_mut() {
            let Some(file) = &watch.token else {
                if let Ok((file, snapshot)) = attach(&watch.path) {
                    trace!(path = %watch.path.display(), "pending path appeared");
                    watch.token = Some(file);
                    watch.snapshot = Some(snapshot);
                    self.changed.insert(watch.path.clone());
                }
                continue;
            };
            match sample(file, &watch.path, watch.snapshot) {
                Sample::Unchanged => continue,
                Sample::Modified(snapshot) => {
                    watch.snapshot = Some(snapshot);
                }
                Sample::Replaced => match attach(&watch.path) {
                    Ok((file, snapshot)) => {
                        watch.token = Some(file);
                        watch.snapshot = Some(snapshot);
                    }
                    Err(_) => {
                        watch.demote();
                    }
                },
                Sample::Gone => {
                    watch.demote();
                }
            }
            trace!(path = %watch.path.display(), "change detected");
            self.changed.insert(watch.path.clone());
        }
        if self.changed.len() > before {
            self.signal()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<Drain> {
        if let Some(wake) = &mut self.wake {
            wake.drain()?;
        }
        Ok(Drain::take(&mut self.changed))
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.wake.as_ref().map(SelfPipe::reader)
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
        let control = if self.wake.is_some() { 2 } else { 0 };
        control + self.watches.active()
    }

    fn close(&mut self) {
        self.watches.clear();
        self.changed.clear();
        self.wake = None;
    }
}
