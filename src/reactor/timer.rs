use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::reactor::ReactorInner;
use crate::util::handler::Handler;

/// Position of an armed timer in the reactor's timer index: deadline first, arm sequence as
///  tie-break.
pub(crate) type TimerKey = (u64, u64);

pub(crate) struct TimerEntry {
    pub(crate) interval: Cell<u64>,
    pub(crate) key: Cell<Option<TimerKey>>,
    pub(crate) reactor: RefCell<Weak<ReactorInner>>,
    pub(crate) handler: Handler<()>,
}

/// A one-shot timer. It is armed and disarmed through the [`Reactor`](crate::reactor::Reactor);
///  dropping it disarms it.
pub struct Timer {
    pub(crate) entry: Rc<TimerEntry>,
}

impl Timer {
    pub fn new(interval_ms: u64, mut handler: impl FnMut() + 'static) -> Timer {
        Timer {
            entry: Rc::new(TimerEntry {
                interval: Cell::new(interval_ms),
                key: Cell::new(None),
                reactor: RefCell::new(Weak::new()),
                handler: Handler::new(move |_| handler()),
            }),
        }
    }

    /// The interval used by [`Reactor::reset_timer`](crate::reactor::Reactor::reset_timer)
    pub fn interval(&self) -> u64 {
        self.entry.interval.get()
    }

    pub fn set_interval(&self, interval_ms: u64) {
        self.entry.interval.set(interval_ms);
    }

    /// A timer stays running until its handler is called, including the time between expiry
    ///  and dispatch.
    pub fn is_running(&self) -> bool {
        self.entry.key.get().is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.entry.key.get().map(|(deadline, _)| deadline)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(key) = self.entry.key.take() {
            if let Some(reactor) = self.entry.reactor.borrow().upgrade() {
                reactor.timers.borrow_mut().remove(&key);
            }
        }
    }
}
