use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::flow::interface::PacketPassInterface;
use crate::reactor::Reactor;
use crate::util::with_upgraded;

/// Forwards packets from its PP input to a PP output, passing each packet through a hook
///  first. The hook may replace the packet, but not make it longer than the output MTU.
pub struct PacketPassNotifier {
    _inner: Rc<RefCell<NotifierInner>>,
    input: PacketPassInterface,
}

struct NotifierInner {
    input: Option<PacketPassInterface>,
    output: PacketPassInterface,
}

impl PacketPassNotifier {
    pub fn new(reactor: &Reactor, output: &PacketPassInterface, mut hook: impl FnMut(Bytes) -> Bytes + 'static) -> PacketPassNotifier {
        let inner = Rc::new(RefCell::new(NotifierInner {
            input: None,
            output: output.clone(),
        }));

        let weak = Rc::downgrade(&inner);
        let input = PacketPassInterface::new(reactor, output.mtu(), move |packet| {
            let packet = hook(packet);
            with_upgraded(&weak, |this| this.output.send(packet));
        });
        if output.has_cancel() {
            let output_cancel = output.clone();
            input.enable_cancel(move || output_cancel.cancel());
        }

        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move || {
            with_upgraded(&weak, |this| {
                if let Some(input) = &this.input {
                    input.done();
                }
            });
        });

        inner.borrow_mut().input = Some(input.clone());
        PacketPassNotifier { _inner: inner, input }
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.input
    }
}
