use std::cell::RefCell;
use std::rc::Rc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::flow::interface::PacketRecvInterface;
use crate::protocol::dataproto::DataProtoHeader;
use crate::protocol::scproto::{SCID_KEEPALIVE, SC_HEADER_LEN};
use crate::reactor::Reactor;

/// PR provider answering every receive with the same packet
struct ConstantSource {
    _slot: Rc<RefCell<Option<PacketRecvInterface>>>,
    output: PacketRecvInterface,
}

impl ConstantSource {
    fn new(reactor: &Reactor, packet: Bytes) -> ConstantSource {
        let slot: Rc<RefCell<Option<PacketRecvInterface>>> = Default::default();
        let weak = Rc::downgrade(&slot);

        let output = PacketRecvInterface::new(reactor, packet.len(), move |mut buf: BytesMut| {
            buf.put_slice(&packet);
            if let Some(slot) = weak.upgrade() {
                if let Some(output) = slot.borrow().as_ref() {
                    output.done(buf);
                }
            }
        });
        *slot.borrow_mut() = Some(output.clone());

        ConstantSource { _slot: slot, output }
    }
}

/// Produces a control-protocol keepalive packet whenever its output is pulled
pub struct SCKeepaliveSource {
    source: ConstantSource,
}

impl SCKeepaliveSource {
    pub fn new(reactor: &Reactor) -> SCKeepaliveSource {
        let mut packet = BytesMut::with_capacity(SC_HEADER_LEN);
        packet.put_u8(SCID_KEEPALIVE);
        SCKeepaliveSource {
            source: ConstantSource::new(reactor, packet.freeze()),
        }
    }

    pub fn output(&self) -> &PacketRecvInterface {
        &self.source.output
    }
}

/// Produces a header-only DataProto frame whenever its output is pulled
pub struct DataProtoKeepaliveSource {
    source: ConstantSource,
}

impl DataProtoKeepaliveSource {
    pub fn new(reactor: &Reactor) -> DataProtoKeepaliveSource {
        let header = DataProtoHeader::keepalive();
        let mut packet = BytesMut::with_capacity(header.serialized_len());
        header.ser(&mut packet);
        DataProtoKeepaliveSource {
            source: ConstantSource::new(reactor, packet.freeze()),
        }
    }

    pub fn output(&self) -> &PacketRecvInterface {
        &self.source.output
    }
}
