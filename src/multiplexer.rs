//! One readiness wait over any number of event sources.
//!
//! The multiplexer is generic over its driver, which scopes the kernel
//! specific code behind [`AsDriver`] and keeps consumers from accidentally
//! depending on epoll or kqueue semantics. It only ever deals in descriptors:
//! what a ready descriptor means is up to whoever registered it.
use std::{
    collections::HashMap,
    os::fd::{AsRawFd, RawFd},
    time::{Duration, Instant},
};

use nix::errno::Errno;
use tracing::{trace, warn};

use crate::{
    driver::{AsDriver, Driver, Ready},
    error::{Error, Result},
    event::{EventSource, Interest},
};

/// What `unregister` found on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistration {
    Removed,
    /// The descriptor had been closed (or recycled) before it was
    /// unregistered. Bookkeeping is dropped all the same.
    Stale,
}

pub struct Multiplexer<D = Driver> {
    driver: D,
    sources: HashMap<RawFd, Interest>,
}

impl Multiplexer<Driver> {
    pub fn new() -> Result<Self> {
        Ok(Self::with_driver(Driver::new()?))
    }
}

impl<D> Multiplexer<D>
where
    D: AsDriver,
{
    pub fn with_driver(driver: D) -> Self {
        Self {
            driver,
            sources: HashMap::new(),
        }
    }

    /// Start watching `source`. The returned descriptor is the key to
    /// `unregister` with, which stays valid after the source has closed.
    ///
    /// A descriptor that closed without being unregistered may come back
    /// with the same number. The kernel has already forgotten the old one,
    /// so the new source replaces its stale bookkeeping.
    pub fn register<S>(&mut self, source: &S, interest: Interest) -> Result<RawFd>
    where
        S: EventSource + ?Sized,
    {
        let fd = source.descriptor().ok_or(Error::ClosedService)?;
        let raw = fd.as_raw_fd();
        match self.driver.add(fd, interest) {
            Ok(()) => {}
            Err(Errno::EEXIST) => return Err(Error::AlreadyRegistered { fd: raw }),
            Err(e) => return Err(e.into()),
        }
        if self.sources.insert(raw, interest).is_some() {
            warn!(fd = raw, "replaced the registration of a descriptor closed without unregistering");
        } else {
            trace!(fd = raw, ?interest, "source registered");
        }
        Ok(raw)
    }

    pub fn modify<S>(&mut self, source: &S, interest: Interest) -> Result<()>
    where
        S: EventSource + ?Sized,
    {
        let fd = source.descriptor().ok_or(Error::ClosedService)?;
        let raw = fd.as_raw_fd();
        let Some(prev) = self.sources.get_mut(&raw) else {
            return Err(Error::NotRegistered { fd: raw });
        };
        self.driver.modify(fd, *prev, interest)?;
        *prev = interest;
        Ok(())
    }

    /// Takes the raw descriptor, since the source may already be gone.
    pub fn unregister(&mut self, fd: RawFd) -> Result<Deregistration> {
        let prev = self
            .sources
            .remove(&fd)
            .ok_or(Error::NotRegistered { fd })?;
        match self.driver.delete(fd, prev) {
            Ok(()) => Ok(Deregistration::Removed),
            Err(Errno::EBADF | Errno::ENOENT) => {
                warn!(fd, "unregistered a source whose descriptor was already closed");
                Ok(Deregistration::Stale)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for readiness. `Some(Duration::ZERO)` only looks, `None` waits
    /// until something is ready. A signal cuts the wait short with
    /// [`Error::Interrupted`].
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Ready>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ready = Vec::new();
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.driver.wait(remaining, &mut ready) {
                Ok(()) => {}
                Err(Errno::EINTR) => return Err(Error::Interrupted),
                Err(e) => return Err(e.into()),
            }
            ready.retain(|r| self.sources.contains_key(&r.fd));
            if !ready.is_empty() {
                return Ok(ready);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(ready);
            }
        }
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.sources.get(&fd).copied()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.sources.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
