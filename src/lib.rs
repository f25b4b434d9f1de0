//! File-change detection for a process supervisor, and the readiness
//! multiplexer it plugs into.
//!
//! A [`WatchService`] tracks an explicit set of paths through whichever
//! notification mechanism the platform offers (inotify, kqueue) or by
//! sampling metadata when it offers none. Either way it exposes one
//! descriptor, so it can be waited on by a [`Multiplexer`] right next to
//! sockets and signals.
pub mod conf;
pub mod driver;
pub mod error;
pub mod event;
pub mod multiplexer;
pub mod runner;
#[cfg(target_os = "linux")]
pub mod signal;
pub mod utils;
pub mod watch;

pub use conf::{BackendChoice, WatchConfig};
pub use error::{Error, Result};
pub use event::{EventSource, Interest};
pub use multiplexer::{Deregistration, Multiplexer};
pub use watch::{AddOutcome, AddReport, Mode, WatchService};
