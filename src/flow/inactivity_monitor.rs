use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::flow::interface::PacketPassInterface;
use crate::reactor::{Reactor, Timer};
use crate::util::handler::Handler;
use crate::util::with_upgraded;

/// Forwards packets from its PP input to a PP output and calls a handler whenever the output
///  was idle for a full interval.
///
/// The timer is stopped while a packet is in flight and restarted when the output completes
///  it. After the handler fires, the timer restarts, so an idle output produces one call per
///  interval.
pub struct PacketPassInactivityMonitor {
    inner: Rc<RefCell<MonitorInner>>,
    input: PacketPassInterface,
}

struct MonitorInner {
    reactor: Reactor,
    input: Option<PacketPassInterface>,
    output: PacketPassInterface,
    timer: Timer,
}

impl PacketPassInactivityMonitor {
    pub fn new(reactor: &Reactor, output: &PacketPassInterface, interval_ms: u64, mut handler: impl FnMut() + 'static) -> PacketPassInactivityMonitor {
        assert!(interval_ms > 0);

        let handler = Handler::new(move |_| handler());
        let inner = Rc::new_cyclic(|weak: &std::rc::Weak<RefCell<MonitorInner>>| {
            let weak = weak.clone();
            let timer = Timer::new(interval_ms, move || {
                trace!("inactivity monitor: interval elapsed");
                if with_upgraded(&weak, |this| this.reactor.reset_timer(&this.timer)).is_some() {
                    handler.call(());
                }
            });
            RefCell::new(MonitorInner {
                reactor: reactor.clone(),
                input: None,
                output: output.clone(),
                timer,
            })
        });

        let weak = Rc::downgrade(&inner);
        let input = PacketPassInterface::new(reactor, output.mtu(), move |packet| {
            with_upgraded(&weak, |this| {
                this.reactor.remove_timer(&this.timer);
                this.output.send(packet);
            });
        });
        if output.has_cancel() {
            let weak = Rc::downgrade(&inner);
            let output_cancel = output.clone();
            input.enable_cancel(move || {
                with_upgraded(&weak, |this| this.reactor.reset_timer(&this.timer));
                output_cancel.cancel()
            });
        }

        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move || {
            with_upgraded(&weak, |this| {
                this.reactor.reset_timer(&this.timer);
                if let Some(input) = &this.input {
                    input.done();
                }
            });
        });

        {
            let mut this = inner.borrow_mut();
            this.input = Some(input.clone());
            this.reactor.reset_timer(&this.timer);
        }
        PacketPassInactivityMonitor { inner, input }
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.input
    }

    /// Makes the handler fire as soon as possible, unless a packet is in flight
    pub fn force(&self) {
        let inner = self.inner.borrow();
        if inner.timer.is_running() {
            inner.reactor.set_timer_after(&inner.timer, 0);
        }
    }
}
