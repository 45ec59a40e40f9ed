use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::reactor::{FdEvents, Reactor};

/// Delivers a set of Unix signals on the reactor thread.
///
/// The signals are blocked on the calling thread for the lifetime of the subscription and
///  drained through a signalfd. Dropping the subscription unblocks them again.
pub struct UnixSignal {
    reactor: Reactor,
    signals: SigSet,
    fd: RawFd,
    _signal_fd: Rc<SignalFd>,
}

impl UnixSignal {
    /// The handler receives the signal and the sending process where the kernel reports one.
    pub fn new(reactor: &Reactor, signals: SigSet, mut handler: impl FnMut(Signal, Option<Pid>) + 'static) -> anyhow::Result<UnixSignal> {
        signals.thread_block()?;

        let signal_fd = match SignalFd::with_flags(&signals, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
            Ok(fd) => Rc::new(fd),
            Err(e) => {
                let _ = signals.thread_unblock();
                return Err(e.into());
            }
        };
        let fd = signal_fd.as_raw_fd();

        let signal_fd_in_handler = signal_fd.clone();
        let registration = reactor.add_fd(fd, FdEvents::READ, move |_| {
            // one signal per readiness event; the fd stays readable while more are queued
            match signal_fd_in_handler.read_signal() {
                Ok(Some(info)) => {
                    let pid = match info.ssi_pid {
                        0 => None,
                        pid => Some(Pid::from_raw(pid as i32)),
                    };
                    match Signal::try_from(info.ssi_signo as i32) {
                        Ok(signal) => {
                            debug!("received signal {} from {:?}", signal, pid);
                            handler(signal, pid);
                        }
                        Err(_) => warn!("received unknown signal number {}", info.ssi_signo),
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("reading from signalfd failed: {}", e),
            }
        });
        if let Err(e) = registration {
            let _ = signals.thread_unblock();
            return Err(e);
        }

        Ok(UnixSignal {
            reactor: reactor.clone(),
            signals,
            fd,
            _signal_fd: signal_fd,
        })
    }
}

impl Drop for UnixSignal {
    fn drop(&mut self) {
        self.reactor.remove_fd(self.fd);
        if let Err(e) = self.signals.thread_unblock() {
            warn!("unblocking signals failed: {}", e);
        }
    }
}

impl Reactor {
    /// see [`UnixSignal::new`]
    pub fn signal_subscribe(&self, signals: SigSet, handler: impl FnMut(Signal, Option<Pid>) + 'static) -> anyhow::Result<UnixSignal> {
        UnixSignal::new(self, signals, handler)
    }

    /// Equivalent to dropping the subscription
    pub fn signal_unsubscribe(&self, subscription: UnixSignal) {
        drop(subscription);
    }
}
