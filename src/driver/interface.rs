//! Abstraction provided to use multiple kernel-backed readiness systems.
//!
//! Different operating environments provide different readiness
//! notification systems, each with their own semantics. This interface keeps
//! to the subset they share, so the multiplexer on top never learns which one
//! it is running on. The notable limitations are:
//!
//! 1) level-triggered only: a descriptor stays ready until its owner drains
//!    it, because kqueue filters and epoll interest lists only agree there.
//! 2) drivers keep no bookkeeping of their own. The caller hands back the
//!    previous interest on `modify`/`delete`, since kqueue needs it to know
//!    which filters to drop and epoll simply ignores it.
use std::{
    os::fd::{BorrowedFd, RawFd},
    time::Duration,
};

use crate::event::Interest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub fd: RawFd,
    pub interest: Interest,
}

pub trait AsDriver {
    /// Fails with `EEXIST` if the kernel still holds a live registration
    /// for `fd`.
    fn add(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> nix::Result<()>;

    fn modify(&mut self, fd: BorrowedFd<'_>, prev: Interest, next: Interest) -> nix::Result<()>;

    /// Drop `fd` from the kernel set. The descriptor may already be closed,
    /// in which case the kernel's `EBADF`/`ENOENT` is passed through.
    fn delete(&mut self, fd: RawFd, prev: Interest) -> nix::Result<()>;

    /// Wait at most `timeout` (forever on `None`) and append what is ready.
    /// A driver may return early with nothing.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> nix::Result<()>;
}
