//! Signals as just another event source.
//!
//! The signals are blocked for the calling thread, which makes the thread no
//! longer get interrupted by them. They are delivered through a signalfd
//! instead, so the consumer loop responds to them as a notification instead
//! of as a special case.
use std::os::fd::{AsFd, BorrowedFd};

use nix::sys::{
    signal::{SigSet, Signal},
    signalfd::{SfdFlags, SignalFd},
};
use tracing::debug;

use crate::{error::Result, event::EventSource};

pub struct SignalSource {
    signal_fd: SignalFd,
    received: Vec<Signal>,
}

impl SignalSource {
    pub fn new(signals: &[Signal]) -> Result<Self> {
        let mut mask = SigSet::empty();
        for signal in signals {
            mask.add(*signal);
        }
        mask.thread_block()?;
        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        Ok(Self {
            signal_fd,
            received: Vec::new(),
        })
    }

    /// Signals collected by `drain` so far, oldest first.
    pub fn take_received(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.received)
    }
}

impl EventSource for SignalSource {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.signal_fd.as_fd())
    }

    fn drain(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(siginfo) = self.signal_fd.read_signal()? {
            count += 1;
            match Signal::try_from(siginfo.ssi_signo as i32) {
                Ok(signal) => {
                    debug!(%signal, "signal received");
                    self.received.push(signal);
                }
                Err(e) => debug!(signo = siginfo.ssi_signo, "unknown signal: {e}"),
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::Interest, multiplexer::Multiplexer};
    use nix::sys::pthread::{pthread_kill, pthread_self};
    use std::time::Duration;

    #[test]
    fn blocked_signal_arrives_as_event() {
        let mut source = SignalSource::new(&[Signal::SIGUSR1]).unwrap();
        let mut mux = Multiplexer::new().unwrap();
        mux.register(&source, Interest::READABLE).unwrap();

        pthread_kill(pthread_self(), Signal::SIGUSR1).unwrap();
        let ready = mux.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(source.drain().unwrap(), 1);
        assert_eq!(source.take_received(), vec![Signal::SIGUSR1]);
    }
}
