use std::{
    collections::HashMap,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use nix::libc::timespec;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};

use super::{AsDriver, Ready};
use crate::event::Interest;

const NO_TIME_WAIT: timespec = timespec {
    tv_sec: 0,
    tv_nsec: 0,
};

const EVENT_BUFFER_LEN: usize = 32;

pub struct KqueueDriver {
    kq: Kqueue,
}

fn change(fd: RawFd, filter: EventFilter, flags: EventFlag) -> KEvent {
    KEvent::new(fd as _, filter, flags, FilterFlag::empty(), 0, 0)
}

fn filters(interest: Interest) -> impl Iterator<Item = EventFilter> {
    [
        (Interest::READABLE, EventFilter::EVFILT_READ),
        (Interest::WRITABLE, EventFilter::EVFILT_WRITE),
    ]
    .into_iter()
    .filter(move |(bit, _)| interest.contains(*bit))
    .map(|(_, filter)| filter)
}

fn to_timespec(timeout: Duration) -> timespec {
    timespec {
        tv_sec: timeout.as_secs() as _,
        tv_nsec: timeout.subsec_nanos() as _,
    }
}

impl KqueueDriver {
    pub fn new() -> nix::Result<Self> {
        Ok(Self { kq: Kqueue::new()? })
    }

    /// Whether any of `interest`'s filters is already attached to `fd`.
    /// `EV_ENABLE` only succeeds on an existing filter, and `EV_RECEIPT`
    /// returns a per-change status instead of pending events.
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    fn attached(&self, fd: RawFd, interest: Interest) -> nix::Result<bool> {
        let probes: Vec<KEvent> = filters(interest)
            .map(|filter| change(fd, filter, EventFlag::EV_ENABLE | EventFlag::EV_RECEIPT))
            .collect();
        if probes.is_empty() {
            return Ok(false);
        }
        let mut receipts = probes.clone();
        let n = self.kq.kevent(&probes, &mut receipts, Some(NO_TIME_WAIT))?;
        Ok(receipts[..n].iter().any(|receipt| receipt.data() == 0))
    }

    #[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
    fn attached(&self, _fd: RawFd, _interest: Interest) -> nix::Result<bool> {
        Ok(false)
    }

    fn apply(&self, changelist: &[KEvent]) -> nix::Result<()> {
        if changelist.is_empty() {
            return Ok(());
        }
        self.kq.kevent(changelist, &mut [], Some(NO_TIME_WAIT))?;
        Ok(())
    }
}

impl AsDriver for KqueueDriver {
    fn add(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> nix::Result<()> {
        let fd = fd.as_raw_fd();
        // kqueue drops a descriptor's filters on close, so anything still
        // attached belongs to a live registration.
        if self.attached(fd, interest)? {
            return Err(nix::errno::Errno::EEXIST);
        }
        let changelist: Vec<KEvent> = filters(interest)
            .map(|filter| change(fd, filter, EventFlag::EV_ADD))
            .collect();
        self.apply(&changelist)
    }

    fn modify(&mut self, fd: BorrowedFd<'_>, prev: Interest, next: Interest) -> nix::Result<()> {
        let fd = fd.as_raw_fd();
        let dropped = filters(prev.difference(next)).map(|f| change(fd, f, EventFlag::EV_DELETE));
        let added = filters(next.difference(prev)).map(|f| change(fd, f, EventFlag::EV_ADD));
        let changelist: Vec<KEvent> = dropped.chain(added).collect();
        self.apply(&changelist)
    }

    fn delete(&mut self, fd: RawFd, prev: Interest) -> nix::Result<()> {
        // kqueue forgets a descriptor's filters on close, so a closed fd
        // shows up as EBADF here just like it does for epoll.
        if prev.intersection(Interest::READABLE | Interest::WRITABLE).is_empty() {
            return nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).map(|_| ());
        }
        let changelist: Vec<KEvent> = filters(prev)
            .map(|filter| change(fd, filter, EventFlag::EV_DELETE))
            .collect();
        self.apply(&changelist)
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> nix::Result<()> {
        let mut eventlist =
            [change(0, EventFilter::EVFILT_READ, EventFlag::empty()); EVENT_BUFFER_LEN];
        let num_events = self
            .kq
            .kevent(&[], &mut eventlist, timeout.map(to_timespec))?;

        // One descriptor may come back once per filter, fold them together.
        let mut merged: HashMap<RawFd, Interest> = HashMap::new();
        let mut order = Vec::new();
        for ev in &eventlist[..num_events] {
            let fd = ev.ident() as RawFd;
            let mut interest = match ev.filter() {
                Ok(EventFilter::EVFILT_READ) => Interest::READABLE,
                Ok(EventFilter::EVFILT_WRITE) => Interest::WRITABLE,
                _ => Interest::empty(),
            };
            if ev.flags().contains(EventFlag::EV_EOF) {
                interest |= Interest::HANGUP;
            }
            if ev.flags().contains(EventFlag::EV_ERROR) {
                interest |= Interest::ERROR;
            }
            let slot = merged.entry(fd).or_insert_with(|| {
                order.push(fd);
                Interest::empty()
            });
            *slot |= interest;
        }
        ready.extend(order.into_iter().map(|fd| Ready {
            fd,
            interest: merged[&fd],
        }));
        Ok(())
    }
}
