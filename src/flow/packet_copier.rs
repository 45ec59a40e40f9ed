use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::flow::interface::{CancelOutcome, PacketPassInterface, PacketRecvInterface};
use crate::reactor::Reactor;
use crate::util::with_upgraded;

/// Splices a push pipeline into a pull pipeline: packets sent to the PP input are copied
///  into the buffers offered on the PR output.
pub struct PacketCopier {
    _inner: Rc<RefCell<PacketCopierInner>>,
    input: PacketPassInterface,
    output: PacketRecvInterface,
}

#[derive(Default)]
struct PacketCopierInner {
    input: Option<PacketPassInterface>,
    output: Option<PacketRecvInterface>,
    packet: Option<Bytes>,
    buffer: Option<BytesMut>,
}

impl PacketCopierInner {
    fn try_copy(&mut self) {
        if self.packet.is_none() || self.buffer.is_none() {
            return;
        }
        if let (Some(packet), Some(mut buf), Some(input), Some(output)) = (self.packet.take(), self.buffer.take(), &self.input, &self.output) {
            buf.extend_from_slice(&packet);
            output.done(buf);
            input.done();
        }
    }
}

impl PacketCopier {
    pub fn new(reactor: &Reactor, mtu: usize) -> PacketCopier {
        let inner = Rc::new(RefCell::new(PacketCopierInner::default()));

        let weak = Rc::downgrade(&inner);
        let input = PacketPassInterface::new(reactor, mtu, move |packet| {
            with_upgraded(&weak, |this| {
                this.packet = Some(packet);
                this.try_copy();
            });
        });
        let weak = Rc::downgrade(&inner);
        input.enable_cancel(move || {
            with_upgraded(&weak, |this| this.packet = None);
            CancelOutcome::Discarded
        });

        let weak = Rc::downgrade(&inner);
        let output = PacketRecvInterface::new(reactor, mtu, move |buf| {
            with_upgraded(&weak, |this| {
                this.buffer = Some(buf);
                this.try_copy();
            });
        });

        {
            let mut this = inner.borrow_mut();
            this.input = Some(input.clone());
            this.output = Some(output.clone());
        }
        PacketCopier { _inner: inner, input, output }
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.input
    }

    pub fn output(&self) -> &PacketRecvInterface {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{PacketCollector, PacketFeeder};

    #[test]
    fn test_copies_in_order() {
        let reactor = Reactor::new_paused();
        let copier = PacketCopier::new(&reactor, 8);
        let feeder = PacketFeeder::new(copier.input());
        let collector = PacketCollector::new(copier.output());

        feeder.push(b"x");
        feeder.push(b"");
        feeder.push(b"12345678");
        reactor.run_until_idle();

        assert_eq!(collector.packets(), vec![Bytes::from_static(b"x"), Bytes::new(), Bytes::from_static(b"12345678")]);
        assert_eq!(feeder.completed(), 3);
    }

    #[test]
    fn test_packet_waits_for_buffer() {
        let reactor = Reactor::new_paused();
        let copier = PacketCopier::new(&reactor, 8);
        let feeder = PacketFeeder::new(copier.input());

        feeder.push(b"x");
        reactor.run_until_idle();
        assert_eq!(feeder.completed(), 0);

        assert_eq!(copier.input().cancel(), CancelOutcome::Discarded);
        let collector = PacketCollector::new(copier.output());
        reactor.run_until_idle();
        assert!(collector.packets().is_empty());
    }
}
