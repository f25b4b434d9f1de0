//! A backend-independent file watch that doubles as an event source.
//!
//! The service picks its backend once, at construction, in the order:
//! explicit override, native, polling. A native backend that can't be opened
//! is not an error unless the override insisted on it, the service just logs
//! the reason and polls instead.
//!
//! Changes are accumulated until [`WatchService::get`] hands them out, so a
//! caller can let the multiplexer wake it up, or call `scan()` on a timer,
//! and collect everything in one place.
use std::{
    collections::HashSet,
    mem,
    os::fd::BorrowedFd,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, info, warn};

use super::backend::{AsBackend, Backend, Mode, Registration};
use crate::{
    conf::{BackendChoice, WatchConfig},
    error::{Error, Result},
    event::EventSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Watching,
    /// Missing for now, picked up once it appears.
    Pending,
    AlreadyWatched,
}

/// Per-path results of one `add` call, in input order.
#[derive(Debug, Default)]
pub struct AddReport {
    pub results: Vec<(PathBuf, Result<AddOutcome>)>,
}

impl AddReport {
    pub fn is_ok(&self) -> bool {
        self.results.iter().all(|(_, res)| res.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &Error)> {
        self.results
            .iter()
            .filter_map(|(path, res)| res.as_ref().err().map(|e| (path.as_path(), e)))
    }

    /// Collapse into the first failure, if there was one.
    pub fn into_result(self) -> Result<()> {
        for (_, res) in self.results {
            res?;
        }
        Ok(())
    }
}

pub struct WatchService {
    backend: Backend,
    state: State,
    changed: HashSet<PathBuf>,
    limit: usize,
    timeout: Duration,
    missing: bool,
}

impl WatchService {
    pub fn new(config: &WatchConfig) -> Result<Self> {
        let mut service = Self {
            backend: select_backend(config.backend)?,
            state: State::Created,
            changed: HashSet::new(),
            limit: config.limit,
            timeout: config.timeout(),
            missing: config.missing,
        };
        let mode = service.backend.mode();
        info!(%mode, native = mode.is_native(), limit = service.limit, "watch service started");
        service.state = State::Active;
        Ok(service)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            State::Closed => Err(Error::ClosedService),
            _ => Ok(()),
        }
    }

    /// Watch every path in `paths`. Failures are reported per path and never
    /// undo the paths that went through.
    pub fn add<I, P>(&mut self, paths: I, missing: bool) -> Result<AddReport>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.ensure_open()?;
        let mut report = AddReport::default();
        for path in paths {
            let path = path.as_ref();
            let res = self.add_one(path, missing);
            if let Err(e) = &res {
                debug!(path = %path.display(), "add failed: {e}");
            }
            report.results.push((path.to_path_buf(), res));
        }
        Ok(report)
    }

    /// [`add`](Self::add) with the configured missing policy.
    pub fn add_default<I, P>(&mut self, paths: I) -> Result<AddReport>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.add(paths, self.missing)
    }

    fn add_one(&mut self, path: &Path, missing: bool) -> Result<AddOutcome> {
        if self.backend.contains(path) {
            return Ok(AddOutcome::AlreadyWatched);
        }
        if self.backend.len() >= self.limit {
            return Err(Error::WatchLimitExceeded {
                path: path.to_path_buf(),
                limit: self.limit,
            });
        }
        let outcome = match self.backend.add(path, missing)? {
            Registration::Active => AddOutcome::Watching,
            Registration::Pending => AddOutcome::Pending,
        };
        debug!(path = %path.display(), ?outcome, "watch added");
        Ok(outcome)
    }

    pub fn remove(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_open()?;
        let path = path.as_ref();
        self.backend.remove(path)?;
        self.changed.remove(path);
        debug!(path = %path.display(), "watch removed");
        Ok(())
    }

    /// Check every path right now, pending ones included.
    pub fn scan(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.backend.scan()
    }

    /// Everything that changed since the last call.
    pub fn get(&mut self) -> Result<HashSet<PathBuf>> {
        self.ensure_open()?;
        self.pull()?;
        Ok(mem::take(&mut self.changed))
    }

    fn pull(&mut self) -> Result<usize> {
        let before = self.changed.len();
        self.changed.extend(self.backend.drain()?);
        Ok(self.changed.len() - before)
    }

    pub fn get_mode(&self) -> Mode {
        self.backend.mode()
    }

    pub fn get_mode_name(mode: Mode) -> &'static str {
        mode.name()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.backend.contains(path.as_ref())
    }

    pub fn is_pending(&self, path: impl AsRef<Path>) -> bool {
        self.backend.is_pending(path.as_ref())
    }

    /// Descriptors held right now, control descriptors included.
    pub fn resources(&self) -> usize {
        self.backend.resources()
    }

    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.backend.close();
        self.changed.clear();
        self.state = State::Closed;
        debug!("watch service closed");
    }
}

fn select_backend(choice: BackendChoice) -> Result<Backend> {
    choose_backend(choice, Backend::native)
}

fn choose_backend<F>(choice: BackendChoice, native: F) -> Result<Backend>
where
    F: FnOnce() -> Result<Backend>,
{
    match choice {
        BackendChoice::Polling => Backend::polling(),
        BackendChoice::Native => native(),
        BackendChoice::Auto => match native() {
            Ok(backend) => Ok(backend),
            Err(e) => {
                warn!("native file watching unavailable, falling back to polling: {e}");
                Backend::polling()
            }
        },
    }
}

impl EventSource for WatchService {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        match self.state {
            State::Closed => None,
            _ => self.backend.descriptor(),
        }
    }

    fn drain(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.pull()
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn polling(limit: usize) -> WatchService {
        let config = WatchConfig::default()
            .with_backend(BackendChoice::Polling)
            .with_limit(limit);
        WatchService::new(&config).unwrap()
    }

    #[test]
    fn forced_polling_is_final() {
        let service = polling(3);
        assert_eq!(service.get_mode(), Mode::Polling);
        assert_eq!(WatchService::get_mode_name(service.get_mode()), "polling");
        assert_eq!(service.state(), State::Active);
    }

    #[test]
    fn partial_failure_keeps_successes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let missing = dir.path().join("missing");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let mut service = polling(2);
        let report = service.add([&a, &missing, &b, &a], false).unwrap();
        assert!(!report.is_ok());
        let outcomes: Vec<_> = report.results.iter().map(|(_, r)| r.as_ref().ok().copied()).collect();
        assert_eq!(
            outcomes,
            vec![
                Some(AddOutcome::Watching),
                None,
                Some(AddOutcome::Watching),
                Some(AddOutcome::AlreadyWatched),
            ]
        );
        assert_eq!(service.len(), 2);
        let failures: Vec<_> = report.failures().map(|(p, _)| p.to_path_buf()).collect();
        assert_eq!(failures, vec![missing]);
    }

    #[test]
    fn limit_beats_missing_ok() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, "a").unwrap();

        let mut service = polling(1);
        service.add([&a], false).unwrap().into_result().unwrap();
        let err = service
            .add([dir.path().join("later")], true)
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(matches!(err, Error::WatchLimitExceeded { limit: 1, .. }));
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn default_missing_policy_applies() {
        let dir = tempfile::tempdir().unwrap();
        let later = dir.path().join("later");
        let config = WatchConfig::default()
            .with_backend(BackendChoice::Polling)
            .with_missing(true);
        let mut service = WatchService::new(&config).unwrap();
        let report = service.add_default([&later]).unwrap();
        assert!(report.is_ok());
        assert!(service.is_pending(&later));
    }

    #[test]
    fn remove_unknown_path() {
        let mut service = polling(3);
        assert!(matches!(
            service.remove("/definitely/not/watched"),
            Err(Error::UnknownPath { .. })
        ));
    }

    #[test]
    fn closed_service_rejects_everything_but_close() {
        let mut service = polling(3);
        service.close();
        service.close();
        assert_eq!(service.state(), State::Closed);
        assert_eq!(service.resources(), 0);
        assert!(service.descriptor().is_none());
        assert!(matches!(service.get(), Err(Error::ClosedService)));
        assert!(matches!(service.scan(), Err(Error::ClosedService)));
        assert!(matches!(service.remove("/x"), Err(Error::ClosedService)));
        assert!(matches!(service.add(["/x"], true), Err(Error::ClosedService)));
        assert!(matches!(service.drain(), Err(Error::ClosedService)));
    }

    fn unavailable() -> Result<Backend> {
        Err(Error::BackendUnavailable {
            backend: "native",
            source: nix::errno::Errno::ENOSYS,
        })
    }

    #[test]
    fn auto_falls_back_to_polling() {
        let backend = choose_backend(BackendChoice::Auto, unavailable).unwrap();
        assert_eq!(backend.mode(), Mode::Polling);
    }

    #[test]
    fn insisting_on_native_surfaces_the_failure() {
        assert!(matches!(
            choose_backend(BackendChoice::Native, unavailable),
            Err(Error::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn forced_polling_never_tries_native() {
        let backend = choose_backend(BackendChoice::Polling, || -> Result<Backend> {
            panic!("native backend must not be opened")
        })
        .unwrap();
        assert_eq!(backend.mode(), Mode::Polling);
    }

    #[test]
    fn accessors_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, "a").unwrap();
        let mut service = polling(3);
        service.add([&a], false).unwrap();
        service.close();
        assert_eq!(service.get_mode(), Mode::Polling);
        assert_eq!(service.len(), 0);
        assert!(!service.contains(&a));
        assert!(!service.is_pending(&a));
        assert_eq!(service.resources(), 0);
    }

    #[test]
    fn get_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, "a").unwrap();
        let mut service = polling(3);
        service.add([&a], false).unwrap();

        fs::write(&a, "changed contents").unwrap();
        service.scan().unwrap();
        assert_eq!(service.get().unwrap(), HashSet::from([a]));
        assert!(service.get().unwrap().is_empty());
    }
}
