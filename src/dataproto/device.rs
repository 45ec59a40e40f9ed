use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use tracing::trace;

use crate::flow::interface::PacketRecvInterface;
use crate::util::with_upgraded;

/// Pulls frames from a local device and hands each one to a routing handler, which typically
///  picks the [`DataProtoLocalSource`](crate::dataproto::local_source::DataProtoLocalSource)
///  to route it into. The next frame is requested as soon as the handler returns.
pub struct DataProtoDevice {
    inner: Rc<RefCell<DeviceInner>>,
}

struct DeviceInner {
    input: PacketRecvInterface,
}

impl DataProtoDevice {
    pub fn new(input: &PacketRecvInterface, mut handler: impl FnMut(&[u8]) + 'static) -> DataProtoDevice {
        let inner = Rc::new(RefCell::new(DeviceInner {
            input: input.clone(),
        }));

        let weak = Rc::downgrade(&inner);
        input.set_done_handler(move |frame: BytesMut| {
            trace!("dataproto device: frame of {} bytes", frame.len());
            handler(&frame);
            with_upgraded(&weak, |this| this.input.recv(frame));
        });

        input.recv(BytesMut::with_capacity(input.mtu()));
        DataProtoDevice { inner }
    }

    pub fn frame_mtu(&self) -> usize {
        self.inner.borrow().input.mtu()
    }
}
