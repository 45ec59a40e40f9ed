//! PacketProto framing as flow operators: the encoder prefixes pulled packets with their
//!  length, the decoder cuts a byte stream back into packets. [`PacketProtoFlow`] and
//!  [`PacketProtoSender`] assemble the usual sending pipelines around the encoder.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::bail;
use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::flow::buffer_writer::BufferWriter;
use crate::flow::error::{ErrorReporter, FlowError, ProtocolError};
use crate::flow::interface::{PacketPassInterface, PacketRecvInterface, StreamPassInterface, StreamRecvInterface};
use crate::flow::packet_buffer::{PacketBuffer, SinglePacketBuffer};
use crate::flow::packet_copier::PacketCopier;
use crate::flow::packet_stream_sender::PacketStreamSender;
use crate::protocol::packetproto::PacketProtoHeader;
use crate::reactor::Reactor;
use crate::util::with_upgraded;

/// PR→PR: every packet pulled from the input is handed out with its PacketProto header. The
///  output MTU is the input MTU plus the header.
pub struct PacketProtoEncoder {
    _inner: Rc<RefCell<PacketProtoEncoderInner>>,
    output: PacketRecvInterface,
}

struct PacketProtoEncoderInner {
    input: PacketRecvInterface,
    output: Option<PacketRecvInterface>,
    /// header part of the buffer the output user offered, while the payload is being received
    header: Option<BytesMut>,
}

impl PacketProtoEncoder {
    pub fn new(reactor: &Reactor, input: &PacketRecvInterface) -> anyhow::Result<PacketProtoEncoder> {
        if input.mtu() > PacketProtoHeader::MAX_PAYLOAD {
            bail!("input MTU {} exceeds the PacketProto maximum of {}", input.mtu(), PacketProtoHeader::MAX_PAYLOAD);
        }

        let inner = Rc::new(RefCell::new(PacketProtoEncoderInner {
            input: input.clone(),
            output: None,
            header: None,
        }));

        let weak = Rc::downgrade(&inner);
        let output = PacketRecvInterface::new(reactor, PacketProtoHeader::encoded_len(input.mtu()), move |mut buf: BytesMut| {
            with_upgraded(&weak, |this| {
                buf.resize(PacketProtoHeader::SERIALIZED_LEN, 0);
                let payload = buf.split_off(PacketProtoHeader::SERIALIZED_LEN);
                this.header = Some(buf);
                this.input.recv(payload);
            });
        });

        let weak = Rc::downgrade(&inner);
        input.set_done_handler(move |payload: BytesMut| {
            with_upgraded(&weak, |this| {
                let Some(mut packet) = this.header.take() else {
                    return;
                };
                packet.clear();
                PacketProtoHeader::for_payload(payload.len()).ser(&mut packet);
                packet.unsplit(payload);
                if let Some(output) = &this.output {
                    output.done(packet);
                }
            });
        });

        inner.borrow_mut().output = Some(output.clone());
        Ok(PacketProtoEncoder { _inner: inner, output })
    }

    pub fn output(&self) -> &PacketRecvInterface {
        &self.output
    }
}


/// SR→PP: reads a PacketProto byte stream and sends each contained payload to the output.
///
/// A length above the output MTU is reported as [`ProtocolError::PacketTooLong`] as soon as
///  the header is read, and the decoder stops reading.
pub struct PacketProtoDecoder {
    _inner: Rc<RefCell<PacketProtoDecoderInner>>,
}

struct PacketProtoDecoderInner {
    input: StreamRecvInterface,
    output: PacketPassInterface,
    max_payload: usize,
    buf: BytesMut,
}

impl PacketProtoDecoderInner {
    fn process(&mut self) -> Option<FlowError> {
        if self.buf.len() >= PacketProtoHeader::SERIALIZED_LEN {
            let len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
            if len > self.max_payload {
                debug!("PacketProto length {} exceeds maximum {}", len, self.max_payload);
                return Some(ProtocolError::PacketTooLong { len, max: self.max_payload }.into());
            }

            if self.buf.len() >= PacketProtoHeader::encoded_len(len) {
                self.buf.advance(PacketProtoHeader::SERIALIZED_LEN);
                let payload = self.buf.split_to(len);
                trace!("decoded packet of {} bytes", len);
                self.output.send(payload.freeze());
                return None;
            }
        }

        let room = PacketProtoHeader::encoded_len(self.max_payload) - self.buf.len();
        self.input.recv(BytesMut::with_capacity(room), room);
        None
    }
}

impl PacketProtoDecoder {
    pub fn new(input: &StreamRecvInterface, output: &PacketPassInterface, reporter: Rc<dyn ErrorReporter>) -> PacketProtoDecoder {
        let max_payload = output.mtu().min(PacketProtoHeader::MAX_PAYLOAD);
        let inner = Rc::new(RefCell::new(PacketProtoDecoderInner {
            input: input.clone(),
            output: output.clone(),
            max_payload,
            buf: BytesMut::with_capacity(PacketProtoHeader::encoded_len(max_payload)),
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
        PacketProtoDecoder { _inner: inner }
    }
}


/// Gives local producers a write-in-place API whose packets are PacketProto-encoded and
///  buffered on their way to a PP output.
pub struct PacketProtoFlow {
    writer: BufferWriter,
    _encoder: PacketProtoEncoder,
    _buffer: PacketBuffer,
}

impl PacketProtoFlow {
    pub fn new(reactor: &Reactor, input_mtu: usize, num_packets: usize, output: &PacketPassInterface) -> anyhow::Result<PacketProtoFlow> {
        let writer = BufferWriter::new(reactor, input_mtu);
        let encoder = PacketProtoEncoder::new(reactor, writer.output())?;
        let buffer = PacketBuffer::new(encoder.output(), output, num_packets)?;

        Ok(PacketProtoFlow {
            writer,
            _encoder: encoder,
            _buffer: buffer,
        })
    }

    pub fn writer(&self) -> &BufferWriter {
        &self.writer
    }
}


/// Sends packets over a reliable byte stream: each packet pushed into the input is encoded
///  and written to the stream output.
pub struct PacketProtoSender {
    copier: PacketCopier,
    _encoder: PacketProtoEncoder,
    _buffer: SinglePacketBuffer,
    _stream_sender: PacketStreamSender,
}

impl PacketProtoSender {
    pub fn new(reactor: &Reactor, mtu: usize, output: &StreamPassInterface) -> anyhow::Result<PacketProtoSender> {
        let copier = PacketCopier::new(reactor, mtu);
        let encoder = PacketProtoEncoder::new(reactor, copier.output())?;
        let stream_sender = PacketStreamSender::new(reactor, output, PacketProtoHeader::encoded_len(mtu));
        let buffer = SinglePacketBuffer::new(encoder.output(), stream_sender.input())?;

        Ok(PacketProtoSender {
            copier,
            _encoder: encoder,
            _buffer: buffer,
            _stream_sender: stream_sender,
        })
    }

    pub fn input(&self) -> &PacketPassInterface {
        self.copier.input()
    }
}
