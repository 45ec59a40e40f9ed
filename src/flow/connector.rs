//! Connectors let one side of a pipeline be replaced at runtime.
//!
//! A connector exposes a fixed interface to the stable side of the pipeline and forwards to
//!  whatever is currently connected on the other side. While nothing is connected, an
//!  operation is parked and re-issued as soon as a peer is connected.
//!
//! Done notifications from a previously connected peer are recognized by a generation counter
//!  and ignored.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::flow::interface::{CancelOutcome, PacketPassInterface, PacketRecvInterface, StreamPassInterface, StreamRecvInterface};
use crate::reactor::Reactor;
use crate::util::with_upgraded;

/// Exposes a PP input and forwards packets to a PP output that can be connected and
///  disconnected.
pub struct PacketPassConnector {
    inner: Rc<RefCell<PassConnectorInner>>,
    input: PacketPassInterface,
}

struct PassConnectorInner {
    input: Option<PacketPassInterface>,
    output: Option<PacketPassInterface>,
    generation: u64,
    /// packet received from the input and not yet completed
    packet: Option<Bytes>,
    /// the packet was sent to the current output
    in_output: bool,
    /// the current output still owns a packet whose input operation was cancelled
    draining: bool,
}

impl PassConnectorInner {
    fn try_send(&mut self) {
        if self.in_output || self.draining {
            return;
        }
        if let (Some(output), Some(packet)) = (&self.output, &self.packet) {
            self.in_output = true;
            output.send(packet.clone());
        }
    }

    fn complete_input(&mut self) {
        self.packet = None;
        self.in_output = false;
        if let Some(input) = &self.input {
            input.done();
        }
    }

    fn on_output_done(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        if self.draining {
            self.draining = false;
            self.try_send();
            return;
        }
        self.complete_input();
    }

    /// Cancels the packet at the output if the output supports it. Without cancel support,
    ///  the output keeps (and eventually sends) the packet.
    fn withdraw_from_output(&mut self) -> CancelOutcome {
        self.in_output = false;
        match &self.output {
            Some(output) if output.has_cancel() => output.cancel(),
            _ => CancelOutcome::Delivered,
        }
    }

    fn on_input_cancel(&mut self) -> CancelOutcome {
        self.packet = None;
        if !self.in_output {
            return CancelOutcome::Discarded;
        }
        let has_cancel = self.output.as_ref().map(|o| o.has_cancel()).unwrap_or(false);
        let outcome = self.withdraw_from_output();
        if !has_cancel {
            self.draining = true;
        }
        outcome
    }
}

impl PacketPassConnector {
    pub fn new(reactor: &Reactor, mtu: usize) -> PacketPassConnector {
        let inner = Rc::new(RefCell::new(PassConnectorInner {
            input: None,
            output: None,
            generation: 0,
            packet: None,
            in_output: false,
            draining: false,
        }));

        let weak = Rc::downgrade(&inner);
        let input = PacketPassInterface::new(reactor, mtu, move |packet| {
            with_upgraded(&weak, |this| {
                this.packet = Some(packet);
                this.try_send();
            });
        });

        let weak = Rc::downgrade(&inner);
        input.enable_cancel(move || {
            with_upgraded(&weak, |this| this.on_input_cancel())
                .unwrap_or(CancelOutcome::Discarded)
        });

        inner.borrow_mut().input = Some(input.clone());
        PacketPassConnector { inner, input }
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.input
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().output.is_some()
    }

    pub fn connect_output(&self, output: &PacketPassInterface) -> anyhow::Result<()> {
        if output.mtu() < self.input.mtu() {
            bail!("output MTU {} is smaller than connector MTU {}", output.mtu(), self.input.mtu());
        }
        if output.is_busy() {
            bail!("output has an operation in flight");
        }

        let mut inner = self.inner.borrow_mut();
        assert!(inner.output.is_none(), "connector is already connected");

        inner.generation += 1;
        let generation = inner.generation;
        let weak = Rc::downgrade(&self.inner);
        output.set_done_handler(move || {
            with_upgraded(&weak, |this| this.on_output_done(generation));
        });

        inner.output = Some(output.clone());
        trace!("packet pass connector: connected");
        inner.try_send();
        Ok(())
    }

    /// If a packet is at the output, it is cancelled if the output supports it. Otherwise the
    ///  output drains it, and the input sees it completed.
    pub fn disconnect_output(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.output.is_none() {
            return;
        }

        if inner.in_output {
            match inner.withdraw_from_output() {
                CancelOutcome::Discarded => {}
                CancelOutcome::Delivered => inner.complete_input(),
            }
        }
        inner.generation += 1;
        inner.output = None;
        inner.draining = false;
        trace!("packet pass connector: disconnected");
    }
}


/// Exposes a PR output and forwards receives to a PR input that can be connected and
///  disconnected.
pub struct PacketRecvConnector {
    inner: Rc<RefCell<RecvConnectorInner>>,
    output: PacketRecvInterface,
}

struct RecvConnectorInner {
    input: Option<PacketRecvInterface>,
    output: Option<PacketRecvInterface>,
    generation: u64,
    /// buffer of the output's receive that is not yet passed to the input
    parked: Option<BytesMut>,
    in_input: bool,
}

impl RecvConnectorInner {
    fn try_recv(&mut self) {
        if let Some(input) = &self.input {
            if let Some(buf) = self.parked.take() {
                self.in_input = true;
                input.recv(buf);
            }
        }
    }
}

impl PacketRecvConnector {
    pub fn new(reactor: &Reactor, mtu: usize) -> PacketRecvConnector {
        let inner = Rc::new(RefCell::new(RecvConnectorInner {
            input: None,
            output: None,
            generation: 0,
            parked: None,
            in_input: false,
        }));

        let weak = Rc::downgrade(&inner);
        let output = PacketRecvInterface::new(reactor, mtu, move |buf| {
            with_upgraded(&weak, |this| {
                this.parked = Some(buf);
                this.try_recv();
            });
        });

        inner.borrow_mut().output = Some(output.clone());
        PacketRecvConnector { inner, output }
    }

    pub fn output(&self) -> &PacketRecvInterface {
        &self.output
    }

    pub fn connect_input(&self, input: &PacketRecvInterface) -> anyhow::Result<()> {
        if input.mtu() > self.output.mtu() {
            bail!("input MTU {} is larger than connector MTU {}", input.mtu(), self.output.mtu());
        }
        if input.is_busy() {
            bail!("input has an operation in flight");
        }

        let mut inner = self.inner.borrow_mut();
        assert!(inner.input.is_none(), "connector is already connected");

        inner.generation += 1;
        let generation = inner.generation;
        let weak = Rc::downgrade(&self.inner);
        input.set_done_handler(move |packet| {
            with_upgraded(&weak, |this| {
                if generation != this.generation {
                    return;
                }
                this.in_input = false;
                if let Some(output) = &this.output {
                    output.done(packet);
                }
            });
        });

        inner.input = Some(input.clone());
        inner.try_recv();
        Ok(())
    }

    /// A receive in flight at the input is abandoned, and re-issued with a fresh buffer after
    ///  the next connect.
    pub fn disconnect_input(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.input.take().is_none() {
            return;
        }
        inner.generation += 1;
        if inner.in_input {
            inner.in_input = false;
            inner.parked = Some(BytesMut::new());
        }
    }
}


/// Exposes an SP input and forwards data to an SP output that can be connected and
///  disconnected.
pub struct StreamPassConnector {
    inner: Rc<RefCell<StreamPassConnectorInner>>,
    input: StreamPassInterface,
}

struct StreamPassConnectorInner {
    input: Option<StreamPassInterface>,
    output: Option<StreamPassInterface>,
    generation: u64,
    data: Option<Bytes>,
    in_output: bool,
}

impl StreamPassConnectorInner {
    fn try_send(&mut self) {
        if self.in_output {
            return;
        }
        if let (Some(output), Some(data)) = (&self.output, &self.data) {
            self.in_output = true;
            output.send(data.clone());
        }
    }
}

impl StreamPassConnector {
    pub fn new(reactor: &Reactor) -> StreamPassConnector {
        let inner = Rc::new(RefCell::new(StreamPassConnectorInner {
            input: None,
            output: None,
            generation: 0,
            data: None,
            in_output: false,
        }));

        let weak = Rc::downgrade(&inner);
        let input = StreamPassInterface::new(reactor, move |data| {
            with_upgraded(&weak, |this| {
                this.data = Some(data);
                this.try_send();
            });
        });

        inner.borrow_mut().input = Some(input.clone());
        StreamPassConnector { inner, input }
    }

    pub fn input(&self) -> &StreamPassInterface {
        &self.input
    }

    pub fn connect_output(&self, output: &StreamPassInterface) -> anyhow::Result<()> {
        if output.is_busy() {
            bail!("output has an operation in flight");
        }

        let mut inner = self.inner.borrow_mut();
        assert!(inner.output.is_none(), "connector is already connected");

        inner.generation += 1;
        let generation = inner.generation;
        let weak = Rc::downgrade(&self.inner);
        output.set_done_handler(move |consumed| {
            with_upgraded(&weak, |this| {
                if generation != this.generation {
                    return;
                }
                this.in_output = false;
                this.data = None;
                if let Some(input) = &this.input {
                    input.done(consumed);
                }
            });
        });

        inner.output = Some(output.clone());
        inner.try_send();
        Ok(())
    }

    /// Data in flight at the output is offered again in full after the next connect.
    pub fn disconnect_output(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.output.take().is_none() {
            return;
        }
        inner.generation += 1;
        inner.in_output = false;
    }
}


/// Exposes an SR output and forwards receives to an SR input that can be connected and
///  disconnected.
pub struct StreamRecvConnector {
    inner: Rc<RefCell<StreamRecvConnectorInner>>,
    output: StreamRecvInterface,
}

struct StreamRecvConnectorInner {
    input: Option<StreamRecvInterface>,
    output: Option<StreamRecvInterface>,
    generation: u64,
    /// the output's buffer, kept here while the input fills a separate one
    request: Option<(BytesMut, usize)>,
    in_input: bool,
}

impl StreamRecvConnectorInner {
    fn try_recv(&mut self) {
        if self.in_input {
            return;
        }
        if let (Some(input), Some((_, max))) = (&self.input, &self.request) {
            self.in_input = true;
            input.recv(BytesMut::with_capacity(*max), *max);
        }
    }
}

impl StreamRecvConnector {
    pub fn new(reactor: &Reactor) -> StreamRecvConnector {
        let inner = Rc::new(RefCell::new(StreamRecvConnectorInner {
            input: None,
            output: None,
            generation: 0,
            request: None,
            in_input: false,
        }));

        let weak = Rc::downgrade(&inner);
        let output = StreamRecvInterface::new(reactor, move |buf, max| {
            with_upgraded(&weak, |this| {
                this.request = Some((buf, max));
                this.try_recv();
            });
        });

        inner.borrow_mut().output = Some(output.clone());
        StreamRecvConnector { inner, output }
    }

    pub fn output(&self) -> &StreamRecvInterface {
        &self.output
    }

    pub fn connect_input(&self, input: &StreamRecvInterface) -> anyhow::Result<()> {
        if input.is_busy() {
            bail!("input has an operation in flight");
        }

        let mut inner = self.inner.borrow_mut();
        assert!(inner.input.is_none(), "connector is already connected");

        inner.generation += 1;
        let generation = inner.generation;
        let weak = Rc::downgrade(&self.inner);
        input.set_done_handler(move |data: BytesMut| {
            with_upgraded(&weak, |this| {
                if generation != this.generation {
                    return;
                }
                this.in_input = false;
                if let (Some((mut buf, _)), Some(output)) = (this.request.take(), &this.output) {
                    buf.unsplit(data);
                    output.done(buf);
                }
            });
        });

        inner.input = Some(input.clone());
        inner.try_recv();
        Ok(())
    }

    pub fn disconnect_input(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.input.take().is_none() {
            return;
        }
        inner.generation += 1;
        inner.in_input = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::test_util::{ChunkedStreamSource, PacketCollector, PacketFeeder, RecordingSink, ScriptedSource, StreamCollector, StreamFeeder};

    #[test]
    fn test_pass_parks_until_connected() {
        let reactor = Reactor::new_paused();
        let connector = PacketPassConnector::new(&reactor, 10);
        let feeder = PacketFeeder::new(connector.input());
        let sink = RecordingSink::new(&reactor, 10);

        feeder.push(b"a");
        feeder.push(b"b");
        reactor.run_until_idle();
        assert_eq!(feeder.completed(), 0);

        connector.connect_output(sink.input()).unwrap();
        reactor.run_until_idle();
        assert_eq!(sink.packets(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(feeder.completed(), 2);
    }

    #[test]
    fn test_pass_rejects_small_mtu() {
        let reactor = Reactor::new_paused();
        let connector = PacketPassConnector::new(&reactor, 10);
        let sink = RecordingSink::new(&reactor, 9);
        assert!(connector.connect_output(sink.input()).is_err());
        assert!(!connector.is_connected());
    }

    #[rstest]
    #[case::cancel_supported(true)]
    #[case::draining(false)]
    fn test_pass_disconnect_while_busy(#[case] output_cancel: bool) {
        let reactor = Reactor::new_paused();
        let connector = PacketPassConnector::new(&reactor, 10);
        let feeder = PacketFeeder::new(connector.input());
        let first = if output_cancel { RecordingSink::with_cancel(&reactor, 10) } else { RecordingSink::new(&reactor, 10) };
        first.set_blocked(true);
        let second = RecordingSink::new(&reactor, 10);

        connector.connect_output(first.input()).unwrap();
        feeder.push(b"x");
        reactor.run_until_idle();
        assert!(first.is_holding());

        connector.disconnect_output();
        connector.connect_output(second.input()).unwrap();
        reactor.run_until_idle();

        if output_cancel {
            // the cancelled packet is re-sent to the new output
            assert!(!first.is_holding());
            assert_eq!(second.packets(), vec![Bytes::from_static(b"x")]);
        }
        else {
            // the old output drains it, and the input already saw it completed
            assert!(first.is_holding());
            assert!(second.packets().is_empty());
        }
        assert_eq!(feeder.completed(), 1);

        // a late done from the old output is ignored
        first.set_blocked(false);
        reactor.run_until_idle();
        assert_eq!(feeder.completed(), 1);
    }

    #[test]
    fn test_recv_reissues_after_reconnect() {
        let reactor = Reactor::new_paused();
        let connector = PacketRecvConnector::new(&reactor, 10);
        let collector = PacketCollector::new(connector.output());
        let first = ScriptedSource::new(&reactor, 10);
        let second = ScriptedSource::new(&reactor, 10);

        connector.connect_input(first.output()).unwrap();
        reactor.run_until_idle();
        assert!(first.has_request());

        connector.disconnect_input();
        connector.connect_input(second.output()).unwrap();
        second.push(b"second");
        reactor.run_until_idle();

        // the abandoned request at the first source completes into nothing
        first.push(b"lost");
        reactor.run_until_idle();
        assert_eq!(collector.packets(), vec![Bytes::from_static(b"second")]);
    }

    #[test]
    fn test_stream_pass_resends_whole_chunk() {
        let reactor = Reactor::new_paused();
        let connector = StreamPassConnector::new(&reactor);
        let feeder = StreamFeeder::new(connector.input());
        let collector = StreamCollector::new(&reactor, 3);

        feeder.push(b"hello world");
        reactor.run_until_idle();
        connector.connect_output(collector.input()).unwrap();
        reactor.run_until_idle();

        assert_eq!(collector.bytes(), b"hello world");
    }

    #[test]
    fn test_stream_recv_appends_to_output_buffer() {
        let reactor = Reactor::new_paused();
        let connector = StreamRecvConnector::new(&reactor);
        let source = ChunkedStreamSource::new(&reactor, 4);

        let received: Rc<RefCell<Option<BytesMut>>> = Default::default();
        let received2 = received.clone();
        connector.output().set_done_handler(move |buf| *received2.borrow_mut() = Some(buf));
        connector.output().recv(BytesMut::from(&b"ab"[..]), 10);

        connector.connect_input(source.output()).unwrap();
        source.push(b"cdefgh");
        reactor.run_until_idle();

        assert_eq!(&received.borrow().as_ref().unwrap()[..], b"abcdef");
    }
}
