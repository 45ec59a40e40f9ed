//! Single-threaded event loop: deferred jobs, timers, fd readiness and signals.
//!
//! Everything that happens in a pipeline is ultimately dispatched from [`Reactor::exec`]. One
//!  step of the loop dispatches a single event: a pending job if there is one, otherwise an
//!  expired timer, otherwise an fd event. Only when all three are exhausted does the loop
//!  block in `poll()`. This means the job queue is drained completely between any two timer
//!  or fd handlers.

pub mod fd;
pub mod pending;
pub mod signal;
pub mod timer;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Instant;

use anyhow::bail;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollTimeout};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

pub use fd::FdEvents;
pub use pending::{PendingGroup, PendingJob};
pub use signal::UnixSignal;
pub use timer::Timer;

use fd::FdWatch;
use timer::{TimerEntry, TimerKey};
use crate::util::handler::Handler;

enum Clock {
    Monotonic(Instant),
    /// Virtual milliseconds, advanced only when the loop would otherwise block
    Paused(Cell<u64>),
}

impl Clock {
    fn now(&self) -> u64 {
        match self {
            Clock::Monotonic(start) => start.elapsed().as_millis() as u64,
            Clock::Paused(now) => now.get(),
        }
    }
}

pub(crate) struct ReactorInner {
    clock: Clock,
    quit_code: Cell<Option<i32>>,
    pending: Rc<PendingGroup>,
    timer_seq: Cell<u64>,
    pub(crate) timers: RefCell<BTreeMap<TimerKey, Weak<TimerEntry>>>,
    expired: RefCell<VecDeque<(TimerKey, Weak<TimerEntry>)>>,
    fds: RefCell<FxHashMap<RawFd, Rc<FdWatch>>>,
    fd_events: RefCell<VecDeque<(RawFd, Weak<FdWatch>, FdEvents)>>,
}

/// Handle to the event loop. Cloning is cheap, and all clones refer to the same loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    pub fn new() -> Reactor {
        Reactor::with_clock(Clock::Monotonic(Instant::now()))
    }

    /// A reactor with a virtual clock: whenever the loop would block waiting for the next
    ///  timer, the clock jumps to that timer's deadline instead.
    pub fn new_paused() -> Reactor {
        Reactor::with_clock(Clock::Paused(Cell::new(0)))
    }

    fn with_clock(clock: Clock) -> Reactor {
        Reactor {
            inner: Rc::new(ReactorInner {
                clock,
                quit_code: Cell::new(None),
                pending: PendingGroup::new(),
                timer_seq: Cell::new(0),
                timers: Default::default(),
                expired: Default::default(),
                fds: Default::default(),
                fd_events: Default::default(),
            }),
        }
    }

    /// Milliseconds since the reactor was created
    pub fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    pub fn pending_group(&self) -> &Rc<PendingGroup> {
        &self.inner.pending
    }

    /// Runs the event loop until [`Reactor::quit`] is called, returning the code passed to it.
    pub fn exec(&self) -> i32 {
        debug!("entering event loop");
        loop {
            if let Some(code) = self.inner.quit_code.take() {
                debug!("leaving event loop with code {}", code);
                return code;
            }
            if self.dispatch_one() {
                continue;
            }
            self.wait();
        }
    }

    /// Makes [`Reactor::exec`] return `code` after the handler that is currently running returns.
    pub fn quit(&self, code: i32) {
        self.inner.quit_code.set(Some(code));
    }

    /// Runs the loop for `duration_ms` of reactor time. Returns the quit code if the loop was
    ///  quit explicitly before that.
    pub fn run_for(&self, duration_ms: u64) -> Option<i32> {
        let elapsed = Rc::new(Cell::new(false));
        let weak_inner = Rc::downgrade(&self.inner);
        let elapsed_in_timer = elapsed.clone();
        let timer = Timer::new(duration_ms, move || {
            elapsed_in_timer.set(true);
            if let Some(inner) = weak_inner.upgrade() {
                inner.quit_code.set(Some(0));
            }
        });
        self.reset_timer(&timer);

        let code = self.exec();
        if elapsed.get() {
            None
        }
        else {
            Some(code)
        }
    }

    /// Dispatches jobs and already expired timers until there is nothing left to do without
    ///  waiting. Neither blocks nor advances a paused clock.
    pub fn run_until_idle(&self) {
        loop {
            if self.dispatch_one() {
                continue;
            }
            if !self.collect_expired_timers() {
                return;
            }
        }
    }

    fn dispatch_one(&self) -> bool {
        self.inner.pending.execute_job()
            || self.dispatch_expired_timer()
            || self.dispatch_fd_event()
    }

    // ----- timers

    /// Arms (or re-arms) the timer to fire at `at_ms` reactor time
    pub fn set_timer(&self, timer: &Timer, at_ms: u64) {
        self.remove_timer(timer);

        let seq = self.inner.timer_seq.get();
        self.inner.timer_seq.set(seq + 1);

        let key = (at_ms, seq);
        timer.entry.key.set(Some(key));
        *timer.entry.reactor.borrow_mut() = Rc::downgrade(&self.inner);
        self.inner.timers.borrow_mut().insert(key, Rc::downgrade(&timer.entry));
    }

    pub fn set_timer_after(&self, timer: &Timer, delta_ms: u64) {
        self.set_timer(timer, self.now().saturating_add(delta_ms));
    }

    /// Arms the timer to fire after its configured interval
    pub fn reset_timer(&self, timer: &Timer) {
        self.set_timer_after(timer, timer.interval());
    }

    /// No-op if the timer is not running
    pub fn remove_timer(&self, timer: &Timer) {
        if let Some(key) = timer.entry.key.take() {
            self.inner.timers.borrow_mut().remove(&key);
        }
    }

    fn collect_expired_timers(&self) -> bool {
        let now = self.now();
        let mut timers = self.inner.timers.borrow_mut();
        let mut expired = self.inner.expired.borrow_mut();

        while let Some(entry) = timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let (key, timer) = entry.remove_entry();
            expired.push_back((key, timer));
        }
        !expired.is_empty()
    }

    fn dispatch_expired_timer(&self) -> bool {
        loop {
            let Some((key, timer)) = self.inner.expired.borrow_mut().pop_front() else {
                return false;
            };
            let Some(timer) = timer.upgrade() else {
                continue;
            };
            if timer.key.get() != Some(key) {
                // re-armed or removed after it expired
                continue;
            }

            timer.key.set(None);
            timer.handler.call(());
            return true;
        }
    }

    fn next_timer_deadline(&self) -> Option<u64> {
        self.inner.timers.borrow().first_key_value().map(|((deadline, _), _)| *deadline)
    }

    // ----- file descriptors

    /// Starts watching `fd`. The caller keeps ownership of the fd and must call
    ///  [`Reactor::remove_fd`] before closing it.
    pub fn add_fd(&self, fd: RawFd, interest: FdEvents, handler: impl FnMut(FdEvents) + 'static) -> anyhow::Result<()> {
        if fd < 0 {
            bail!("invalid file descriptor {}", fd);
        }

        let mut fds = self.inner.fds.borrow_mut();
        if fds.contains_key(&fd) {
            bail!("file descriptor {} is already registered", fd);
        }
        fds.insert(fd, Rc::new(FdWatch {
            interest: Cell::new(interest),
            handler: Handler::new(handler),
        }));
        trace!("watching fd {} for {:?}", fd, interest);
        Ok(())
    }

    pub fn update_fd(&self, fd: RawFd, interest: FdEvents) -> anyhow::Result<()> {
        match self.inner.fds.borrow().get(&fd) {
            Some(watch) => {
                watch.interest.set(interest);
                Ok(())
            }
            None => bail!("file descriptor {} is not registered", fd),
        }
    }

    /// Events for `fd` that were already collected but not yet dispatched are discarded.
    pub fn remove_fd(&self, fd: RawFd) {
        if self.inner.fds.borrow_mut().remove(&fd).is_some() {
            trace!("no longer watching fd {}", fd);
        }
    }

    fn dispatch_fd_event(&self) -> bool {
        loop {
            let Some((fd, watch, events)) = self.inner.fd_events.borrow_mut().pop_front() else {
                return false;
            };
            let Some(watch) = watch.upgrade() else {
                continue;
            };
            let is_current = self.inner.fds.borrow().get(&fd)
                .map(|current| Rc::ptr_eq(current, &watch))
                .unwrap_or(false);
            if !is_current {
                continue;
            }

            let events = events & (watch.interest.get() | FdEvents::ERROR | FdEvents::HUP);
            if events.is_empty() {
                continue;
            }

            watch.handler.call(events);
            return true;
        }
    }

    // ----- waiting

    fn wait(&self) {
        let deadline = self.next_timer_deadline();

        let watches: Vec<(RawFd, Rc<FdWatch>)> = self.inner.fds.borrow().iter()
            .filter(|(_, watch)| !watch.interest.get().is_empty())
            .map(|(fd, watch)| (*fd, watch.clone()))
            .collect();

        let timeout = match (&self.inner.clock, deadline) {
            (_, None) => PollTimeout::NONE,
            (Clock::Paused(now), Some(deadline)) => {
                if deadline > now.get() {
                    trace!("advancing paused clock from {} to {}", now.get(), deadline);
                    now.set(deadline);
                }
                PollTimeout::ZERO
            }
            (Clock::Monotonic(_), Some(deadline)) => {
                let millis = deadline.saturating_sub(self.now());
                PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
            }
        };

        if watches.is_empty() && timeout.is_none() {
            error!("event loop has nothing to wait for");
            panic!("event loop would block forever: no timers and no file descriptors");
        }

        if !watches.is_empty() || timeout != PollTimeout::ZERO {
            let mut poll_fds: Vec<PollFd> = watches.iter()
                // SAFETY: registered fds stay open until they are removed from the reactor
                .map(|(fd, watch)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, watch.interest.get().to_poll_flags()))
                .collect();

            match poll(&mut poll_fds, timeout) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    error!("poll failed: {}", e);
                    panic!("poll failed: {}", e);
                }
            }

            let mut fd_events = self.inner.fd_events.borrow_mut();
            for (poll_fd, (fd, watch)) in poll_fds.iter().zip(watches.iter()) {
                let events = FdEvents::from_poll_flags(poll_fd.revents().unwrap_or(nix::poll::PollFlags::empty()));
                if !events.is_empty() {
                    fd_events.push_back((*fd, Rc::downgrade(watch), events));
                }
            }
        }

        self.collect_expired_timers();
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Reactor::new()
    }
}
