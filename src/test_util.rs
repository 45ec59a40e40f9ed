//! Scriptable endpoints for driving pipelines in tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::{Buf, Bytes, BytesMut};

use crate::flow::interface::{CancelOutcome, PacketPassInterface, PacketRecvInterface, StreamPassInterface, StreamRecvInterface};
use crate::reactor::Reactor;
use crate::util::with_upgraded;

fn with<T>(weak: &Weak<RefCell<T>>, f: impl FnOnce(&mut T)) {
    with_upgraded(weak, f);
}


/// PP provider that records every packet it completes, with the reactor time of arrival.
pub struct RecordingSink {
    inner: Rc<RefCell<RecordingSinkState>>,
    input: PacketPassInterface,
}

struct RecordingSinkState {
    reactor: Reactor,
    input: Option<PacketPassInterface>,
    blocked: bool,
    held: Option<(u64, Bytes)>,
    packets: Vec<(u64, Bytes)>,
}

impl RecordingSinkState {
    fn on_send(&mut self, packet: Bytes) {
        let now = self.reactor.now();
        if self.blocked {
            self.held = Some((now, packet));
        }
        else {
            self.packets.push((now, packet));
            if let Some(input) = &self.input {
                input.done();
            }
        }
    }
}

impl RecordingSink {
    pub fn new(reactor: &Reactor, mtu: usize) -> RecordingSink {
        let inner = Rc::new(RefCell::new(RecordingSinkState {
            reactor: reactor.clone(),
            input: None,
            blocked: false,
            held: None,
            packets: Vec::new(),
        }));
        let weak = Rc::downgrade(&inner);
        let input = PacketPassInterface::new(reactor, mtu, move |packet| with(&weak, |s| s.on_send(packet)));
        inner.borrow_mut().input = Some(input.clone());
        RecordingSink { inner, input }
    }

    /// A sink whose input supports cancel; a cancelled packet is not recorded.
    pub fn with_cancel(reactor: &Reactor, mtu: usize) -> RecordingSink {
        let sink = RecordingSink::new(reactor, mtu);
        let weak = Rc::downgrade(&sink.inner);
        sink.input.enable_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().held = None;
            }
            CancelOutcome::Discarded
        });
        sink
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.input
    }

    /// While blocked, an arriving packet is held (and not completed) until unblocking.
    pub fn set_blocked(&self, blocked: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.blocked = blocked;
        if !blocked {
            if let Some(held) = inner.held.take() {
                inner.packets.push(held);
                self.input.done();
            }
        }
    }

    pub fn is_holding(&self) -> bool {
        self.inner.borrow().held.is_some()
    }

    pub fn packets(&self) -> Vec<Bytes> {
        self.inner.borrow().packets.iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn timed_packets(&self) -> Vec<(u64, Bytes)> {
        self.inner.borrow().packets.clone()
    }

    pub fn take_packets(&self) -> Vec<Bytes> {
        self.inner.borrow_mut().packets.drain(..).map(|(_, p)| p).collect()
    }
}


/// PR provider that serves queued packets, holding the request while the queue is empty.
pub struct ScriptedSource {
    inner: Rc<RefCell<ScriptedSourceState>>,
    output: PacketRecvInterface,
}

struct ScriptedSourceState {
    output: Option<PacketRecvInterface>,
    queue: VecDeque<Bytes>,
    request: Option<BytesMut>,
}

impl ScriptedSourceState {
    fn try_serve(&mut self) {
        if self.request.is_none() || self.queue.is_empty() {
            return;
        }
        if let (Some(mut buf), Some(packet), Some(output)) = (self.request.take(), self.queue.pop_front(), &self.output) {
            buf.extend_from_slice(&packet);
            output.done(buf);
        }
    }
}

impl ScriptedSource {
    pub fn new(reactor: &Reactor, mtu: usize) -> ScriptedSource {
        let inner = Rc::new(RefCell::new(ScriptedSourceState {
            output: None,
            queue: VecDeque::new(),
            request: None,
        }));
        let weak = Rc::downgrade(&inner);
        let output = PacketRecvInterface::new(reactor, mtu, move |buf| with(&weak, |s| {
            s.request = Some(buf);
            s.try_serve();
        }));
        inner.borrow_mut().output = Some(output.clone());
        ScriptedSource { inner, output }
    }

    pub fn output(&self) -> &PacketRecvInterface {
        &self.output
    }

    pub fn push(&self, packet: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.queue.push_back(Bytes::copy_from_slice(packet));
        inner.try_serve();
    }

    pub fn has_request(&self) -> bool {
        self.inner.borrow().request.is_some()
    }

    pub fn queued(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}


/// PP user that sends queued packets one after the other.
pub struct PacketFeeder {
    inner: Rc<RefCell<PacketFeederState>>,
}

struct PacketFeederState {
    output: PacketPassInterface,
    queue: VecDeque<Bytes>,
    completed: usize,
}

impl PacketFeederState {
    fn try_send(&mut self) {
        if !self.output.is_busy() {
            if let Some(packet) = self.queue.pop_front() {
                self.output.send(packet);
            }
        }
    }
}

impl PacketFeeder {
    pub fn new(output: &PacketPassInterface) -> PacketFeeder {
        let inner = Rc::new(RefCell::new(PacketFeederState {
            output: output.clone(),
            queue: VecDeque::new(),
            completed: 0,
        }));
        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move || with(&weak, |s| {
            s.completed += 1;
            s.try_send();
        }));
        PacketFeeder { inner }
    }

    pub fn push(&self, packet: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.queue.push_back(Bytes::copy_from_slice(packet));
        inner.try_send();
    }

    pub fn completed(&self) -> usize {
        self.inner.borrow().completed
    }

    pub fn queued(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}


/// PR user that keeps a receive outstanding and collects every packet.
pub struct PacketCollector {
    inner: Rc<RefCell<Vec<Bytes>>>,
}

impl PacketCollector {
    pub fn new(input: &PacketRecvInterface) -> PacketCollector {
        let inner = Rc::new(RefCell::new(Vec::new()));
        let weak = Rc::downgrade(&inner);
        let input2 = input.clone();
        input.set_done_handler(move |buf: BytesMut| {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().push(buf.freeze());
                input2.recv(BytesMut::new());
            }
        });
        input.recv(BytesMut::new());
        PacketCollector { inner }
    }

    pub fn packets(&self) -> Vec<Bytes> {
        self.inner.borrow().clone()
    }
}


/// SP provider that appends what it consumes to a byte log, at most `chunk` bytes per send.
pub struct StreamCollector {
    inner: Rc<RefCell<Vec<u8>>>,
    input: StreamPassInterface,
}

impl StreamCollector {
    pub fn new(reactor: &Reactor, chunk: usize) -> StreamCollector {
        let inner = Rc::new(RefCell::new(Vec::new()));
        let weak = Rc::downgrade(&inner);
        let this_input: Rc<RefCell<Option<StreamPassInterface>>> = Default::default();
        let this_input2 = this_input.clone();
        let input = StreamPassInterface::new(reactor, move |data: Bytes| {
            let n = data.len().min(chunk);
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().extend_from_slice(&data[..n]);
            }
            if let Some(input) = this_input2.borrow().as_ref() {
                input.done(n);
            }
        });
        *this_input.borrow_mut() = Some(input.clone());
        StreamCollector { inner, input }
    }

    pub fn input(&self) -> &StreamPassInterface {
        &self.input
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.inner.borrow().clone()
    }
}


/// SR provider that hands out queued bytes, at most `chunk` bytes per receive.
pub struct ChunkedStreamSource {
    inner: Rc<RefCell<ChunkedStreamSourceState>>,
    output: StreamRecvInterface,
}

struct ChunkedStreamSourceState {
    output: Option<StreamRecvInterface>,
    data: BytesMut,
    chunk: usize,
    request: Option<(BytesMut, usize)>,
}

impl ChunkedStreamSourceState {
    fn try_serve(&mut self) {
        if self.data.is_empty() {
            return;
        }
        if let (Some((mut buf, max)), Some(output)) = (self.request.take(), &self.output) {
            let n = self.data.len().min(max).min(self.chunk);
            buf.extend_from_slice(&self.data[..n]);
            self.data.advance(n);
            output.done(buf);
        }
    }
}

impl ChunkedStreamSource {
    pub fn new(reactor: &Reactor, chunk: usize) -> ChunkedStreamSource {
        let inner = Rc::new(RefCell::new(ChunkedStreamSourceState {
            output: None,
            data: BytesMut::new(),
            chunk,
            request: None,
        }));
        let weak = Rc::downgrade(&inner);
        let output = StreamRecvInterface::new(reactor, move |buf, max| with(&weak, |s| {
            s.request = Some((buf, max));
            s.try_serve();
        }));
        inner.borrow_mut().output = Some(output.clone());
        ChunkedStreamSource { inner, output }
    }

    pub fn output(&self) -> &StreamRecvInterface {
        &self.output
    }

    pub fn push(&self, data: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.data.extend_from_slice(data);
        inner.try_serve();
    }
}


/// SP user that writes queued bytes, re-sending the unconsumed remainder.
pub struct StreamFeeder {
    inner: Rc<RefCell<StreamFeederState>>,
}

struct StreamFeederState {
    output: StreamPassInterface,
    data: BytesMut,
    in_flight: usize,
}

impl StreamFeederState {
    fn try_send(&mut self) {
        if self.in_flight == 0 && !self.data.is_empty() {
            self.in_flight = self.data.len();
            self.output.send(Bytes::copy_from_slice(&self.data));
        }
    }
}

impl StreamFeeder {
    pub fn new(output: &StreamPassInterface) -> StreamFeeder {
        let inner = Rc::new(RefCell::new(StreamFeederState {
            output: output.clone(),
            data: BytesMut::new(),
            in_flight: 0,
        }));
        let weak = Rc::downgrade(&inner);
        output.set_done_handler(move |consumed| with(&weak, |s| {
            s.data.advance(consumed);
            s.in_flight = 0;
            s.try_send();
        }));
        StreamFeeder { inner }
    }

    pub fn push(&self, data: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.data.extend_from_slice(data);
        inner.try_send();
    }
}
