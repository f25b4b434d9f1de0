use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    unistd::{pipe, read, write},
};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::{error::Result, event::EventSource};

pub fn set_fd_nonblocking(fd: RawFd) -> nix::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL)?;
    let prev_flags = OFlag::from_bits_truncate(bits);
    fcntl(fd, FcntlArg::F_SETFL(prev_flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

pub fn set_fd_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Read a non-blocking descriptor dry, returning the number of bytes taken.
pub fn drain_fd(fd: RawFd) -> nix::Result<usize> {
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        match read(fd, &mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(Errno::EAGAIN) => return Ok(total),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// A non-blocking, close-on-exec pipe used to make something readable from
/// the inside, e.g. a polling scan that found changes.
#[derive(Debug)]
pub struct SelfPipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl SelfPipe {
    pub fn new() -> nix::Result<Self> {
        let (rx, tx) = pipe()?;
        for fd in [rx.as_raw_fd(), tx.as_raw_fd()] {
            set_fd_nonblocking(fd)?;
            set_fd_cloexec(fd)?;
        }
        Ok(Self { rx, tx })
    }

    /// Make the read end readable. A full pipe already is, so `EAGAIN`
    /// counts as success.
    pub fn wake(&self) -> nix::Result<()> {
        match write(&self.tx, &[1u8]) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn reader(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }

    pub fn writer(&self) -> BorrowedFd<'_> {
        self.tx.as_fd()
    }
}

impl EventSource for SelfPipe {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.reader())
    }

    fn drain(&mut self) -> Result<usize> {
        Ok(drain_fd(self.rx.as_raw_fd())?)
    }
}
