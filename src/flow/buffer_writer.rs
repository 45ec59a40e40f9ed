use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use thiserror::Error;

use crate::flow::interface::PacketRecvInterface;
use crate::reactor::Reactor;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no output buffer available")]
pub struct NoSpace;

struct BufferWriterState {
    /// buffer offered by the downstream, waiting to be written
    offered: Option<BytesMut>,
    writing: bool,
}

/// Lets a local producer write packets directly into the buffers that a PR downstream offers.
///
/// The producer calls [`BufferWriter::try_start`], fills the returned buffer (up to the MTU)
///  and hands it back through [`BufferWriter::finish`]. Writing never blocks: if the
///  downstream has no receive outstanding, the producer gets [`NoSpace`] and decides for
///  itself whether to drop the packet.
pub struct BufferWriter {
    state: Rc<RefCell<BufferWriterState>>,
    output: PacketRecvInterface,
}

impl BufferWriter {
    pub fn new(reactor: &Reactor, mtu: usize) -> BufferWriter {
        let state = Rc::new(RefCell::new(BufferWriterState {
            offered: None,
            writing: false,
        }));

        let weak = Rc::downgrade(&state);
        let output = PacketRecvInterface::new(reactor, mtu, move |buf| {
            if let Some(state) = weak.upgrade() {
                let mut state = state.borrow_mut();
                debug_assert!(state.offered.is_none());
                state.offered = Some(buf);
            }
        });

        BufferWriter { state, output }
    }

    pub fn output(&self) -> &PacketRecvInterface {
        &self.output
    }

    pub fn mtu(&self) -> usize {
        self.output.mtu()
    }

    /// Takes the buffer the downstream offered. It is empty and has room for at least one MTU.
    pub fn try_start(&self) -> Result<BytesMut, NoSpace> {
        let mut state = self.state.borrow_mut();
        assert!(!state.writing, "try_start while a packet is being written");

        let buf = state.offered.take().ok_or(NoSpace)?;
        state.writing = true;
        Ok(buf)
    }

    pub fn finish(&self, packet: BytesMut) {
        {
            let mut state = self.state.borrow_mut();
            assert!(state.writing, "finish without try_start");
            state.writing = false;
        }
        self.output.done(packet);
    }
}
