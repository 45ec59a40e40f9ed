use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::flow::interface::PacketPassInterface;
use crate::util::with_upgraded;

/// A packet buffer that producers write into synchronously. Packets are sent to a PP output in
///  order; while the buffer is full, further packets are refused.
pub struct RouteBuffer {
    inner: Rc<RefCell<RouteBufferInner>>,
}

struct RouteBufferInner {
    output: PacketPassInterface,
    /// the front packet is at the output while `sending` is set
    packets: VecDeque<Bytes>,
    capacity: usize,
    sending: bool,
}

impl RouteBufferInner {
    fn try_send(&mut self) {
        if self.sending {
            return;
        }
        if let Some(packet) = self.packets.front() {
            self.sending = true;
            self.output.send(packet.clone());
        }
    }
}

impl RouteBuffer {
    pub fn new(output: &PacketPassInterface, num_packets: usize) -> RouteBuffer {
        assert!(num_packets > 0);

        let inner = Rc::new(RefCell::new(RouteBufferInner {
            output: output.clone(),
            packets: VecDeque::with_capacity(num_packets),
            capacity: num_packets,
            sending: false,
        }));

        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move || {
            with_upgraded(&weak, |this| {
                this.sending = false;
                this.packets.pop_front();
                this.try_send();
            });
        });

        RouteBuffer { inner }
    }

    pub fn mtu(&self) -> usize {
        self.inner.borrow().output.mtu()
    }

    /// Returns `false` if the buffer is full, dropping the packet.
    pub fn route(&self, packet: Bytes) -> bool {
        let mut inner = self.inner.borrow_mut();
        assert!(packet.len() <= inner.output.mtu());

        if inner.packets.len() >= inner.capacity {
            return false;
        }
        inner.packets.push_back(packet);
        inner.try_send();
        true
    }

    /// Packets in the buffer, including the one at the output
    pub fn len(&self) -> usize {
        self.inner.borrow().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
