use std::cell::Cell;

use bitflags::bitflags;
use nix::poll::PollFlags;

use crate::util::handler::Handler;

bitflags! {
    /// Readiness conditions of a file descriptor. `ERROR` and `HUP` are reported whenever the
    ///  fd has a non-empty interest set, whether requested or not.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FdEvents: u8 {
        const READ  = 0x01;
        const WRITE = 0x02;
        const ERROR = 0x04;
        const HUP   = 0x08;
    }
}

impl FdEvents {
    pub(crate) fn to_poll_flags(self) -> PollFlags {
        let mut result = PollFlags::empty();
        if self.contains(FdEvents::READ) {
            result |= PollFlags::POLLIN;
        }
        if self.contains(FdEvents::WRITE) {
            result |= PollFlags::POLLOUT;
        }
        result
    }

    pub(crate) fn from_poll_flags(flags: PollFlags) -> FdEvents {
        let mut result = FdEvents::empty();
        if flags.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
            result |= FdEvents::READ;
        }
        if flags.contains(PollFlags::POLLOUT) {
            result |= FdEvents::WRITE;
        }
        if flags.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            result |= FdEvents::ERROR;
        }
        if flags.contains(PollFlags::POLLHUP) {
            result |= FdEvents::HUP;
        }
        result
    }
}

pub(crate) struct FdWatch {
    pub(crate) interest: Cell<FdEvents>,
    pub(crate) handler: Handler<FdEvents>,
}
