//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, Once},
};

use nix::fcntl::{fcntl, FcntlArg};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static SERIAL: Mutex<()> = Mutex::new(());
static LOGGING: Once = Once::new();

/// Descriptor counts are process-wide, so tests that compare them must not
/// overlap.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `TRIPWIRE_TEST_LOG=debug cargo test` for the service's own logging.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let filter = std::env::var("TRIPWIRE_TEST_LOG")
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Open descriptors among the first 1024.
pub fn open_fds() -> usize {
    (0..1024)
        .filter(|fd| fcntl(*fd, FcntlArg::F_GETFD).is_ok())
        .count()
}

/// A scratch directory holding `names`, each file containing its own path.
pub fn workdir(names: &[&str]) -> (TempDir, Vec<PathBuf>) {
    let dir = tempfile::tempdir().unwrap();
    let paths = names
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            fs::write(&path, format!("{}\n", path.display())).unwrap();
            path
        })
        .collect();
    (dir, paths)
}

pub fn touch(path: &Path) {
    let mut text = fs::read_to_string(path).unwrap_or_default();
    text.push_str("touched\n");
    fs::write(path, text).unwrap();
}
