use std::cell::RefCell;
use std::rc::Rc;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::flow::interface::{PacketPassInterface, PacketRecvInterface};
use crate::structure::chunk_buffer::ChunkBuffer;
use crate::util::with_upgraded;

/// Pulls packets from a PR input into a ring buffer and pushes them to a PP output.
///
/// A receive is only issued while the ring has room for a full input-MTU packet, so a slow
///  output throttles the input.
pub struct PacketBuffer {
    _inner: Rc<RefCell<PacketBufferInner>>,
}

struct PacketBufferInner {
    input: PacketRecvInterface,
    output: PacketPassInterface,
    buffer: ChunkBuffer,
    receiving: bool,
    sending: bool,
    spare: Option<BytesMut>,
}

impl PacketBuffer {
    pub fn new(input: &PacketRecvInterface, output: &PacketPassInterface, num_packets: usize) -> anyhow::Result<PacketBuffer> {
        if output.mtu() < input.mtu() {
            bail!("output MTU {} is smaller than input MTU {}", output.mtu(), input.mtu());
        }
        if num_packets == 0 {
            bail!("packet buffer needs room for at least one packet");
        }

        let inner = Rc::new(RefCell::new(PacketBufferInner {
            input: input.clone(),
            output: output.clone(),
            buffer: ChunkBuffer::new(input.mtu(), num_packets),
            receiving: false,
            sending: false,
            spare: None,
        }));

        let weak = Rc::downgrade(&inner);
        input.set_done_handler(move |packet| {
            with_upgraded(&weak, |this| this.on_input_done(packet));
        });
        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move || {
            with_upgraded(&weak, |this| this.on_output_done());
        });

        inner.borrow_mut().try_recv();
        Ok(PacketBuffer { _inner: inner })
    }
}

impl PacketBufferInner {
    fn try_recv(&mut self) {
        if self.receiving || !self.buffer.can_accept(self.input.mtu()) {
            return;
        }
        self.receiving = true;
        let buf = self.spare.take().unwrap_or_default();
        self.input.recv(buf);
    }

    fn try_send(&mut self) {
        if self.sending {
            return;
        }
        if let Some(packet) = self.buffer.front() {
            self.sending = true;
            self.output.send(Bytes::copy_from_slice(packet));
        }
    }

    fn on_input_done(&mut self, packet: BytesMut) {
        self.receiving = false;
        let accepted = self.buffer.push(&packet);
        debug_assert!(accepted, "receive was issued without room in the buffer");
        trace!("packet buffer: stored {} bytes, {} packets buffered", packet.len(), self.buffer.len());

        self.spare = Some(packet);
        self.try_send();
        self.try_recv();
    }

    fn on_output_done(&mut self) {
        self.sending = false;
        self.buffer.pop();
        self.try_send();
        self.try_recv();
    }
}


/// Forwards one packet at a time from a PR input to a PP output, reusing a single buffer.
pub struct SinglePacketBuffer {
    _inner: Rc<RefCell<SinglePacketBufferInner>>,
}

struct SinglePacketBufferInner {
    input: PacketRecvInterface,
    output: PacketPassInterface,
    in_flight: Option<Bytes>,
}

impl SinglePacketBuffer {
    pub fn new(input: &PacketRecvInterface, output: &PacketPassInterface) -> anyhow::Result<SinglePacketBuffer> {
        if output.mtu() < input.mtu() {
            bail!("output MTU {} is smaller than input MTU {}", output.mtu(), input.mtu());
        }

        let inner = Rc::new(RefCell::new(SinglePacketBufferInner {
            input: input.clone(),
            output: output.clone(),
            in_flight: None,
        }));

        let weak = Rc::downgrade(&inner);
        input.set_done_handler(move |packet: BytesMut| {
            with_upgraded(&weak, |this| {
                let packet = packet.freeze();
                this.in_flight = Some(packet.clone());
                this.output.send(packet);
            });
        });
        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move || {
            with_upgraded(&weak, |this| {
                let buf = this.in_flight.take()
                    .and_then(|packet| packet.try_into_mut().ok())
                    .unwrap_or_default();
                this.input.recv(buf);
            });
        });

        input.recv(BytesMut::with_capacity(input.mtu()));
        Ok(SinglePacketBuffer { _inner: inner })
    }
}
