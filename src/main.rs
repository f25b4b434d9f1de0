mod cli;
mod logging;

use std::error::Error;

use clap::Parser;
use tracing::{info, warn};
use tripwire::{
    conf::{BackendChoice, Config},
    runner, WatchService,
};

use crate::cli::Cli;

#[cfg(target_os = "linux")]
fn stop_source() -> tripwire::Result<tripwire::signal::SignalSource> {
    use nix::sys::signal::Signal;
    tripwire::signal::SignalSource::new(&[Signal::SIGINT, Signal::SIGTERM])
}

// Without signalfd nothing ever wakes this, and the default signal
// dispositions end the process.
#[cfg(not(target_os = "linux"))]
fn stop_source() -> tripwire::Result<tripwire::utils::SelfPipe> {
    Ok(tripwire::utils::SelfPipe::new()?)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    if cli.polling {
        config.watch.backend = BackendChoice::Polling;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    logging::init(&config.log_level);

    let mut service = WatchService::new(&config.watch)?;

    let report = service.add_default(config.paths.iter().chain(cli.paths.iter()))?;
    for (path, e) in report.failures() {
        // per-path errors already name the path
        match e.path() {
            Some(_) => warn!("not watching: {e}"),
            None => warn!(path = %path.display(), "not watching: {e}"),
        }
    }
    if service.is_empty() {
        warn!("nothing to watch");
        return Ok(());
    }

    let mut stop = stop_source()?;
    runner::run(&mut service, &mut stop, |path| {
        info!(path = %path.display(), "changed");
    })?;
    service.close();
    Ok(())
}
