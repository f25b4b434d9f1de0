//! The capability shared by everything a [`Multiplexer`] can wait on.
//!
//! An event source is anything that owns a descriptor the kernel can report
//! readiness for, plus a way to consume whatever made it ready. The watch
//! service, the signal source and any caller-owned socket wrapper all plug
//! into the same loop through this one trait. A source whose descriptor is
//! gone (a closed watch service, say) reports `None`.
//!
//! [`Multiplexer`]: crate::multiplexer::Multiplexer
use std::os::fd::BorrowedFd;

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// Readiness interest and readiness report.
    ///
    /// Only `READABLE` and `WRITABLE` are meaningful when registering,
    /// `HANGUP` and `ERROR` may show up in what `poll` hands back.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const HANGUP   = 0b0100;
        const ERROR    = 0b1000;
    }
}

impl Interest {
    pub fn is_readable(&self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }
}

pub trait EventSource {
    fn descriptor(&self) -> Option<BorrowedFd<'_>>;

    /// Consume pending readiness without blocking, returning how many
    /// events were taken off the descriptor.
    fn drain(&mut self) -> Result<usize>;
}
