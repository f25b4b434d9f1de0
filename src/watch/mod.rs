pub mod backend;
mod service;

pub use backend::Mode;
pub use service::{AddOutcome, AddReport, State, WatchService};
