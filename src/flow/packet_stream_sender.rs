use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Buf, Bytes};

use crate::flow::interface::{PacketPassInterface, StreamPassInterface};
use crate::reactor::Reactor;
use crate::util::with_upgraded;

/// Writes each packet from its PP input to an SP output as consecutive bytes. The packet is
///  completed once the stream has consumed all of it.
pub struct PacketStreamSender {
    _inner: Rc<RefCell<PacketStreamSenderInner>>,
    input: PacketPassInterface,
}

struct PacketStreamSenderInner {
    input: Option<PacketPassInterface>,
    output: StreamPassInterface,
    remaining: Bytes,
}

impl PacketStreamSenderInner {
    fn send_remaining(&mut self) {
        if self.remaining.is_empty() {
            if let Some(input) = &self.input {
                input.done();
            }
        }
        else {
            self.output.send(self.remaining.clone());
        }
    }
}

impl PacketStreamSender {
    pub fn new(reactor: &Reactor, output: &StreamPassInterface, mtu: usize) -> PacketStreamSender {
        let inner = Rc::new(RefCell::new(PacketStreamSenderInner {
            input: None,
            output: output.clone(),
            remaining: Bytes::new(),
        }));

        let weak = Rc::downgrade(&inner);
        let input = PacketPassInterface::new(reactor, mtu, move |packet| {
            with_upgraded(&weak, |this| {
                this.remaining = packet;
                this.send_remaining();
            });
        });

        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move |consumed| {
            with_upgraded(&weak, |this| {
                this.remaining.advance(consumed);
                this.send_remaining();
            });
        });

        inner.borrow_mut().input = Some(input.clone());
        PacketStreamSender { _inner: inner, input }
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.input
    }
}
