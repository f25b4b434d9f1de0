//! The consumer loop: wait on the multiplexer, hand every changed path to a
//! callback, stop when the stop source fires.
use std::path::Path;

use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    event::{EventSource, Interest},
    multiplexer::Multiplexer,
    watch::WatchService,
};

/// Drive `service` until `stop` becomes readable.
///
/// The loop wakes up at least every `service.timeout()` to run a scan, which
/// is what keeps the polling backend and pending paths moving.
pub fn run<S, F>(service: &mut WatchService, stop: &mut S, mut on_change: F) -> Result<()>
where
    S: EventSource + ?Sized,
    F: FnMut(&Path),
{
    let mut mux = Multiplexer::new()?;
    mux.register(&*service, Interest::READABLE)?;
    let stop_fd = mux.register(&*stop, Interest::READABLE)?;

    loop {
        let ready = match mux.poll(Some(service.timeout())) {
            Ok(ready) => ready,
            Err(Error::Interrupted) => continue,
            Err(e) => return Err(e),
        };
        if ready.is_empty() {
            trace!("poll timeout, scanning");
            service.scan()?;
        }
        if ready.iter().any(|r| r.fd == stop_fd) {
            stop.drain()?;
            debug!("stop source fired");
            break;
        }
        for path in service.get()? {
            on_change(&path);
        }
    }

    for path in service.get()? {
        on_change(&path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conf::{BackendChoice, WatchConfig},
        utils::SelfPipe,
    };
    use std::{fs, io::Write, sync::mpsc, thread, time::Duration};

    #[test]
    fn reports_changes_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "a\n").unwrap();
        let config = WatchConfig::default()
            .with_backend(BackendChoice::Polling)
            .with_timeout(Duration::from_millis(50));
        let mut service = WatchService::new(&config).unwrap();
        service.add([&path], false).unwrap().into_result().unwrap();

        let mut stop = SelfPipe::new().unwrap();
        let stop_tx = stop.writer().try_clone_to_owned().unwrap();
        let (seen_tx, seen_rx) = mpsc::channel();
        let writer = {
            let path = path.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
                file.write_all(b"b\n").unwrap();
                let seen = seen_rx.recv_timeout(Duration::from_secs(5));
                nix::unistd::write(&stop_tx, b"x").unwrap();
                seen
            })
        };

        run(&mut service, &mut stop, |changed| {
            let _ = seen_tx.send(changed.to_path_buf());
        })
        .unwrap();
        assert_eq!(writer.join().unwrap().unwrap(), path);
        assert!(service.get().unwrap().is_empty());
    }
}
