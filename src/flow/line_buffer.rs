use std::cell::RefCell;
use std::rc::Rc;

use anyhow::bail;
use bytes::BytesMut;
use tracing::debug;

use crate::flow::error::{ErrorReporter, FlowError, ProtocolError};
use crate::flow::interface::{PacketPassInterface, StreamRecvInterface};
use crate::util::with_upgraded;

/// Splits a byte stream into lines and sends each line, including its delimiter, as one
///  packet.
///
/// A line that does not fit into `max_line` bytes is a protocol error: it is reported once,
///  and the buffer stops reading afterwards.
pub struct LineBuffer {
    _inner: Rc<RefCell<LineBufferInner>>,
}

struct LineBufferInner {
    input: StreamRecvInterface,
    output: PacketPassInterface,
    max_line: usize,
    delimiter: u8,
    buf: BytesMut,
    /// prefix of `buf` known not to contain the delimiter
    scanned: usize,
}

impl LineBufferInner {
    fn process(&mut self) -> Option<FlowError> {
        if let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == self.delimiter) {
            let line = self.buf.split_to(self.scanned + pos + 1);
            self.scanned = 0;
            self.output.send(line.freeze());
            return None;
        }
        self.scanned = self.buf.len();

        if self.buf.len() >= self.max_line {
            debug!("line exceeds {} bytes", self.max_line);
            return Some(ProtocolError::LineTooLong { max: self.max_line }.into());
        }

        let room = self.max_line - self.buf.len();
        self.input.recv(BytesMut::with_capacity(room), room);
        None
    }
}

impl LineBuffer {
    pub fn new(
        input: &StreamRecvInterface,
        output: &PacketPassInterface,
        max_line: usize,
        delimiter: u8,
        reporter: Rc<dyn ErrorReporter>,
    ) -> anyhow::Result<LineBuffer> {
        if max_line == 0 {
            bail!("maximum line length must be positive");
        }
        if output.mtu() < max_line {
            bail!("output MTU {} is smaller than the maximum line length {}", output.mtu(), max_line);
        }

        let inner = Rc::new(RefCell::new(LineBufferInner {
            input: input.clone(),
            output: output.clone(),
            max_line,
            delimiter,
            buf: BytesMut::with_capacity(max_line),
            scanned: 0,
        }));

        let weak = Rc::downgrade(&inner);
        let input_reporter = reporter.clone();
        input.set_done_handler(move |data: BytesMut| {
            let error = with_upgraded(&weak, |this| {
                this.buf.extend_from_slice(&data);
                this.process()
            });
            if let Some(error) = error.flatten() {
                input_reporter.report(error);
            }
        });

        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move || {
            if let Some(error) = with_upgraded(&weak, |this| this.process()).flatten() {
                reporter.report(error);
            }
        });

        // an empty buffer never fails
        let _ = inner.borrow_mut().process();
        Ok(LineBuffer { _inner: inner })
    }
}
