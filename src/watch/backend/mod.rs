mod interface;
pub use interface::{AsBackend, Drain, Mode, Registration, Snapshot, WatchedPath, Watches};

mod polling;
pub use polling::PollingBackend;

#[cfg(target_os = "linux")]
mod inotify;

#[cfg(target_os = "linux")]
pub use inotify::InotifyBackend;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueueBackend;

use std::{os::fd::BorrowedFd, path::Path};

use crate::error::Result;

/// The backend a watch service runs on, picked once at construction.
pub enum Backend {
    #[cfg(target_os = "linux")]
    Inotify(InotifyBackend),
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(KqueueBackend),
    Polling(PollingBackend),
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            #[cfg(target_os = "linux")]
            Backend::Inotify($b) => $body,
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue($b) => $body,
            Backend::Polling($b) => $body,
        }
    };
}

impl Backend {
    /// The kernel notification facility of this platform.
    #[cfg(target_os = "linux")]
    pub fn native() -> Result<Self> {
        InotifyBackend::open().map(Self::Inotify)
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    pub fn native() -> Result<Self> {
        KqueueBackend::open().map(Self::Kqueue)
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    )))]
    pub fn native() -> Result<Self> {
        Err(crate::error::Error::BackendUnavailable {
            backend: "native",
            source: nix::errno::Errno::ENOSYS,
        })
    }

    pub fn polling() -> Result<Self> {
        PollingBackend::open().map(Self::Polling)
    }
}

impl AsBackend for Backend {
    fn mode(&self) -> Mode {
        dispatch!(self, b => b.mode())
    }

    fn add(&mut self, path: &Path, missing_ok: bool) -> Result<Registration> {
        dispatch!(self, b => b.add(path, missing_ok))
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        dispatch!(self, b => b.remove(path))
    }

    fn scan(&mut self) -> Result<()> {
        dispatch!(self, b => b.scan())
    }

    fn drain(&mut self) -> Result<Drain> {
        dispatch!(self, b => b.drain())
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        dispatch!(self, b => b.descriptor())
    }

    fn contains(&self, path: &Path) -> bool {
        dispatch!(self, b => b.contains(path))
    }

    fn is_pending(&self, path: &Path) -> bool {
        dispatch!(self, b => b.is_pending(path))
    }

    fn len(&self) -> usize {
        dispatch!(self, b => b.len())
    }

    fn resources(&self) -> usize {
        dispatch!(self, b => b.resources())
    }

    fn close(&mut self) {
        dispatch!(self, b => b.close())
    }
}
