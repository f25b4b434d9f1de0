use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::{
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use super::{AsDriver, Ready};
use crate::event::Interest;

const EVENT_BUFFER_LEN: usize = 32;

pub struct EpollDriver {
    event_buffer: [EpollEvent; EVENT_BUFFER_LEN],
    epoll: Epoll,
}

fn to_flags(interest: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.is_readable() {
        flags |= EpollFlags::EPOLLIN;
    }
    if interest.is_writable() {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

fn from_flags(flags: EpollFlags) -> Interest {
    let mut interest = Interest::empty();
    if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
        interest |= Interest::READABLE;
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        interest |= Interest::WRITABLE;
    }
    if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
        interest |= Interest::HANGUP;
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        interest |= Interest::ERROR;
    }
    interest
}

// epoll counts in milliseconds; round up so short waits don't spin, and cap
// so the multiplexer loops against its own deadline for long ones.
fn to_millis(t: Duration) -> u16 {
    t.as_nanos()
        .div_ceil(1_000_000)
        .min(u128::from(u16::MAX)) as u16
}

fn to_timeout(timeout: Option<Duration>) -> EpollTimeout {
    match timeout {
        None => EpollTimeout::NONE,
        Some(t) => EpollTimeout::from(to_millis(t)),
    }
}

impl EpollDriver {
    pub fn new() -> nix::Result<Self> {
        let event_buffer = [EpollEvent::empty(); EVENT_BUFFER_LEN];
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            event_buffer,
            epoll,
        })
    }
}

impl AsDriver for EpollDriver {
    fn add(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> nix::Result<()> {
        let event = EpollEvent::new(to_flags(interest), fd.as_raw_fd() as u64);
        self.epoll.add(fd, event)
    }

    fn modify(&mut self, fd: BorrowedFd<'_>, _prev: Interest, next: Interest) -> nix::Result<()> {
        let mut event = EpollEvent::new(to_flags(next), fd.as_raw_fd() as u64);
        self.epoll.modify(fd, &mut event)
    }

    fn delete(&mut self, fd: RawFd, _prev: Interest) -> nix::Result<()> {
        // SAFETY: the descriptor is only handed to epoll_ctl, which answers
        // EBADF itself if it has been closed behind our back.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(fd)
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> nix::Result<()> {
        let num_fds = self.epoll.wait(&mut self.event_buffer, to_timeout(timeout))?;
        ready.extend(self.event_buffer[..num_fds].iter().map(|event| Ready {
            fd: event.data() as RawFd,
            interest: from_flags(event.events()),
        }));
        Ok(())
    }
}
