//! The four flow interfaces.
//!
//! Every interface connects exactly one provider (which registers its operation handler when
//!  creating the interface) with one user (which registers a done handler before issuing the
//!  first operation). Both the operation and its completion are delivered through deferred
//!  jobs, so neither side is ever called back from within its own call into the interface.
//!
//! An interface is in one of three states: idle, busy (an operation is in flight) or
//!  done-pending (the provider completed the operation, and the done job is scheduled).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};

use crate::reactor::{PendingJob, Reactor};
use crate::util::handler::Handler;

/// Result of cancelling an in-flight packet. In either case the interface is idle afterwards,
///  and no done notification is delivered for the cancelled packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The packet did not reach the provider's output
    Discarded,
    /// The packet was already passed on, or is going to be passed on without notification
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Busy,
    DonePending,
}

struct Channel<Op: 'static, Res: 'static> {
    kind: &'static str,
    state: Cell<State>,
    operation: RefCell<Option<Op>>,
    result: RefCell<Option<Res>>,
    provider: Handler<Op>,
    cancel: Handler<(), CancelOutcome>,
    user: Handler<Res>,
    job_operation: PendingJob,
    job_done: PendingJob,
}

impl<Op: 'static, Res: 'static> Channel<Op, Res> {
    fn new(reactor: &Reactor, kind: &'static str, provider: impl FnMut(Op) + 'static) -> Rc<Channel<Op, Res>> {
        Rc::new_cyclic(|weak: &Weak<Channel<Op, Res>>| {
            let weak_operation = weak.clone();
            let weak_done = weak.clone();

            Channel {
                kind,
                state: Cell::new(State::Idle),
                operation: RefCell::new(None),
                result: RefCell::new(None),
                provider: Handler::new(provider),
                cancel: Handler::empty(),
                user: Handler::empty(),
                job_operation: PendingJob::new(reactor, move || {
                    if let Some(channel) = weak_operation.upgrade() {
                        channel.deliver_operation();
                    }
                }),
                job_done: PendingJob::new(reactor, move || {
                    if let Some(channel) = weak_done.upgrade() {
                        channel.deliver_done();
                    }
                }),
            }
        })
    }

    fn request(&self, operation: Op) {
        assert_eq!(self.state.get(), State::Idle, "{}: operation issued while another one is in flight", self.kind);
        debug_assert!(self.user.is_set(), "{}: operation issued without a done handler", self.kind);

        self.state.set(State::Busy);
        *self.operation.borrow_mut() = Some(operation);
        self.job_operation.set();
    }

    fn deliver_operation(&self) {
        let operation = self.operation.borrow_mut().take();
        if let Some(operation) = operation {
            self.provider.call(operation);
        }
    }

    fn complete(&self, result: Res) {
        assert_eq!(self.state.get(), State::Busy, "{}: done without an operation in flight", self.kind);
        assert!(!self.job_operation.is_set(), "{}: done before the operation was delivered", self.kind);

        self.state.set(State::DonePending);
        *self.result.borrow_mut() = Some(result);
        self.job_done.set();
    }

    fn deliver_done(&self) {
        let result = self.result.borrow_mut().take();
        if let Some(result) = result {
            self.state.set(State::Idle);
            self.user.call(result);
        }
    }

    fn cancel(&self) -> CancelOutcome {
        match self.state.get() {
            State::Idle => panic!("{}: cancel without an operation in flight", self.kind),
            State::DonePending => {
                self.job_done.unset();
                self.result.borrow_mut().take();
                self.state.set(State::Idle);
                CancelOutcome::Delivered
            }
            State::Busy if self.job_operation.is_set() => {
                self.job_operation.unset();
                self.operation.borrow_mut().take();
                self.state.set(State::Idle);
                CancelOutcome::Discarded
            }
            State::Busy => {
                assert!(self.cancel.is_set(), "{}: provider does not support cancel", self.kind);
                let outcome = self.cancel.call(()).unwrap_or(CancelOutcome::Delivered);
                self.state.set(State::Idle);
                outcome
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.state.get() != State::Idle
    }
}


/// Packet-push: the user sends a packet, the provider signals when it is done with it.
#[derive(Clone)]
pub struct PacketPassInterface {
    mtu: usize,
    channel: Rc<Channel<Bytes, ()>>,
}

impl PacketPassInterface {
    pub fn new(reactor: &Reactor, mtu: usize, handler_send: impl FnMut(Bytes) + 'static) -> PacketPassInterface {
        PacketPassInterface {
            mtu,
            channel: Channel::new(reactor, "PacketPass", handler_send),
        }
    }

    /// Called by the provider during initialization if it supports cancelling an in-flight
    ///  packet.
    pub fn enable_cancel(&self, mut handler_cancel: impl FnMut() -> CancelOutcome + 'static) {
        self.channel.cancel.set(move |_| handler_cancel());
    }

    pub fn set_done_handler(&self, mut handler_done: impl FnMut() + 'static) {
        self.channel.user.set(move |_| handler_done());
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn has_cancel(&self) -> bool {
        self.channel.cancel.is_set()
    }

    pub fn is_busy(&self) -> bool {
        self.channel.is_busy()
    }

    pub fn send(&self, packet: Bytes) {
        assert!(packet.len() <= self.mtu, "packet of {} bytes exceeds MTU {}", packet.len(), self.mtu);
        self.channel.request(packet);
    }

    pub fn cancel(&self) -> CancelOutcome {
        self.channel.cancel()
    }

    /// Called by the provider when it no longer needs the packet
    pub fn done(&self) {
        self.channel.complete(());
    }
}


/// Packet-pull: the user offers a buffer, the provider fills it with one packet.
#[derive(Clone)]
pub struct PacketRecvInterface {
    mtu: usize,
    channel: Rc<Channel<BytesMut, BytesMut>>,
}

impl PacketRecvInterface {
    pub fn new(reactor: &Reactor, mtu: usize, handler_recv: impl FnMut(BytesMut) + 'static) -> PacketRecvInterface {
        PacketRecvInterface {
            mtu,
            channel: Channel::new(reactor, "PacketRecv", handler_recv),
        }
    }

    pub fn set_done_handler(&self, handler_done: impl FnMut(BytesMut) + 'static) {
        self.channel.user.set(handler_done);
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn is_busy(&self) -> bool {
        self.channel.is_busy()
    }

    /// The buffer is handed to the provider empty, with room for at least one MTU.
    pub fn recv(&self, mut buf: BytesMut) {
        buf.clear();
        buf.reserve(self.mtu);
        self.channel.request(buf);
    }

    pub fn done(&self, packet: BytesMut) {
        assert!(packet.len() <= self.mtu, "packet of {} bytes exceeds MTU {}", packet.len(), self.mtu);
        self.channel.complete(packet);
    }
}


/// Stream-push: the user offers bytes, the provider consumes a non-empty prefix of them.
#[derive(Clone)]
pub struct StreamPassInterface {
    offered: Rc<Cell<usize>>,
    channel: Rc<Channel<Bytes, usize>>,
}

impl StreamPassInterface {
    pub fn new(reactor: &Reactor, handler_send: impl FnMut(Bytes) + 'static) -> StreamPassInterface {
        StreamPassInterface {
            offered: Rc::new(Cell::new(0)),
            channel: Channel::new(reactor, "StreamPass", handler_send),
        }
    }

    pub fn set_done_handler(&self, handler_done: impl FnMut(usize) + 'static) {
        self.channel.user.set(handler_done);
    }

    pub fn is_busy(&self) -> bool {
        self.channel.is_busy()
    }

    pub fn send(&self, data: Bytes) {
        assert!(!data.is_empty(), "empty stream send");
        self.offered.set(data.len());
        self.channel.request(data);
    }

    pub fn done(&self, consumed: usize) {
        assert!(consumed > 0 && consumed <= self.offered.get(), "consumed {} of {} offered bytes", consumed, self.offered.get());
        self.channel.complete(consumed);
    }
}


/// Stream-pull: the user offers a buffer and a limit, the provider appends between one byte
///  and the limit.
#[derive(Clone)]
pub struct StreamRecvInterface {
    request: Rc<Cell<(usize, usize)>>,
    channel: Rc<Channel<(BytesMut, usize), BytesMut>>,
}

impl StreamRecvInterface {
    pub fn new(reactor: &Reactor, mut handler_recv: impl FnMut(BytesMut, usize) + 'static) -> StreamRecvInterface {
        StreamRecvInterface {
            request: Rc::new(Cell::new((0, 0))),
            channel: Channel::new(reactor, "StreamRecv", move |(buf, max)| handler_recv(buf, max)),
        }
    }

    pub fn set_done_handler(&self, handler_done: impl FnMut(BytesMut) + 'static) {
        self.channel.user.set(handler_done);
    }

    pub fn is_busy(&self) -> bool {
        self.channel.is_busy()
    }

    pub fn recv(&self, mut buf: BytesMut, max: usize) {
        assert!(max > 0, "empty stream receive");
        buf.reserve(max);
        self.request.set((buf.len(), max));
        self.channel.request((buf, max));
    }

    pub fn done(&self, buf: BytesMut) {
        let (initial_len, max) = self.request.get();
        let written = buf.len().saturating_sub(initial_len);
        assert!(written > 0 && written <= max, "received {} bytes for a request of {}", written, max);
        self.channel.complete(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn packet_pass_with_log(reactor: &Reactor, log: &Rc<RefCell<Vec<String>>>) -> PacketPassInterface {
        let log_send = log.clone();
        let iface = PacketPassInterface::new(reactor, 10, move |packet| {
            log_send.borrow_mut().push(format!("send {:?}", packet));
        });
        let log_done = log.clone();
        iface.set_done_handler(move || log_done.borrow_mut().push("done".to_string()));
        iface
    }

    #[test]
    fn test_send_and_done_are_deferred() {
        let reactor = Reactor::new_paused();
        let log = Rc::new(RefCell::new(Vec::new()));
        let iface = packet_pass_with_log(&reactor, &log);

        iface.send(Bytes::from_static(b"abc"));
        assert!(log.borrow().is_empty());
        assert!(iface.is_busy());

        reactor.run_until_idle();
        assert_eq!(*log.borrow(), vec!["send b\"abc\""]);

        iface.done();
        assert_eq!(log.borrow().len(), 1);
        assert!(iface.is_busy());

        reactor.run_until_idle();
        assert_eq!(log.borrow().last().unwrap(), "done");
        assert!(!iface.is_busy());
    }

    #[test]
    fn test_send_from_done_handler() {
        let reactor = Reactor::new_paused();
        let sent = Rc::new(RefCell::new(Vec::new()));
        let sent2 = sent.clone();
        let iface = PacketPassInterface::new(&reactor, 10, move |packet| sent2.borrow_mut().push(packet));

        let remaining = Rc::new(RefCell::new(vec![Bytes::from_static(b"c"), Bytes::from_static(b"b")]));
        let iface2 = iface.clone();
        let remaining2 = remaining.clone();
        iface.set_done_handler(move || {
            if let Some(next) = remaining2.borrow_mut().pop() {
                iface2.send(next);
            }
        });

        iface.send(Bytes::from_static(b"a"));
        for _ in 0..3 {
            reactor.run_until_idle();
            iface.done();
        }
        reactor.run_until_idle();

        assert_eq!(*sent.borrow(), vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert!(remaining.borrow().is_empty());
        assert!(!iface.is_busy());
    }

    #[test]
    fn test_recv_from_done_handler() {
        let reactor = Reactor::new_paused();
        let requests = Rc::new(Cell::new(0));
        let requests2 = requests.clone();
        let iface = PacketRecvInterface::new(&reactor, 10, move |_buf| requests2.set(requests2.get() + 1));

        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        let iface2 = iface.clone();
        iface.set_done_handler(move |packet: BytesMut| {
            received2.borrow_mut().push(packet.to_vec());
            iface2.recv(packet);
        });

        iface.recv(BytesMut::new());
        reactor.run_until_idle();
        iface.done(BytesMut::from(&b"x"[..]));
        reactor.run_until_idle();

        assert_eq!(*received.borrow(), vec![b"x".to_vec()]);
        assert_eq!(requests.get(), 2);
        assert!(iface.is_busy());
    }

    #[test]
    #[should_panic]
    fn test_second_send_while_busy_panics() {
        let reactor = Reactor::new_paused();
        let log = Rc::new(RefCell::new(Vec::new()));
        let iface = packet_pass_with_log(&reactor, &log);

        iface.send(Bytes::from_static(b"a"));
        iface.send(Bytes::from_static(b"b"));
    }

    #[test]
    #[should_panic]
    fn test_send_above_mtu_panics() {
        let reactor = Reactor::new_paused();
        let log = Rc::new(RefCell::new(Vec::new()));
        let iface = packet_pass_with_log(&reactor, &log);
        iface.send(Bytes::from_static(b"01234567890"));
    }

    #[test]
    fn test_cancel_before_delivery_discards() {
        let reactor = Reactor::new_paused();
        let log = Rc::new(RefCell::new(Vec::new()));
        let iface = packet_pass_with_log(&reactor, &log);

        iface.send(Bytes::from_static(b"a"));
        assert_eq!(iface.cancel(), CancelOutcome::Discarded);
        reactor.run_until_idle();

        assert!(log.borrow().is_empty());
        assert!(!iface.is_busy());
    }

    #[test]
    fn test_cancel_calls_provider() {
        let reactor = Reactor::new_paused();
        let log = Rc::new(RefCell::new(Vec::new()));
        let iface = packet_pass_with_log(&reactor, &log);
        let log_cancel = log.clone();
        iface.enable_cancel(move || {
            log_cancel.borrow_mut().push("cancel".to_string());
            CancelOutcome::Discarded
        });

        iface.send(Bytes::from_static(b"a"));
        reactor.run_until_idle();
        assert_eq!(iface.cancel(), CancelOutcome::Discarded);
        reactor.run_until_idle();

        assert_eq!(*log.borrow(), vec!["send b\"a\"", "cancel"]);
        assert!(!iface.is_busy());
    }

    #[test]
    fn test_cancel_after_done_suppresses_notification() {
        let reactor = Reactor::new_paused();
        let log = Rc::new(RefCell::new(Vec::new()));
        let iface = packet_pass_with_log(&reactor, &log);
        iface.enable_cancel(|| CancelOutcome::Discarded);

        iface.send(Bytes::from_static(b"a"));
        reactor.run_until_idle();
        iface.done();
        assert_eq!(iface.cancel(), CancelOutcome::Delivered);
        reactor.run_until_idle();

        assert_eq!(*log.borrow(), vec!["send b\"a\""]);
    }

    #[test]
    fn test_packet_recv() {
        let reactor = Reactor::new_paused();
        let provider: Rc<RefCell<Option<BytesMut>>> = Default::default();
        let received: Rc<RefCell<Vec<BytesMut>>> = Default::default();

        let provider2 = provider.clone();
        let iface = PacketRecvInterface::new(&reactor, 100, move |buf| {
            assert!(buf.is_empty());
            assert!(buf.capacity() >= 100);
            *provider2.borrow_mut() = Some(buf);
        });
        let received2 = received.clone();
        iface.set_done_handler(move |buf| received2.borrow_mut().push(buf));

        iface.recv(BytesMut::from(&b"garbage"[..]));
        reactor.run_until_idle();

        let mut buf = provider.borrow_mut().take().unwrap();
        buf.extend_from_slice(b"packet");
        iface.done(buf);
        reactor.run_until_idle();

        assert_eq!(received.borrow().len(), 1);
        assert_eq!(&received.borrow()[0][..], b"packet");
    }

    #[test]
    fn test_stream_pass_partial_consumption() {
        let reactor = Reactor::new_paused();
        let consumed: Rc<RefCell<Vec<usize>>> = Default::default();

        let iface = StreamPassInterface::new(&reactor, |_| {});
        let consumed2 = consumed.clone();
        iface.set_done_handler(move |n| consumed2.borrow_mut().push(n));

        iface.send(Bytes::from_static(b"hello"));
        reactor.run_until_idle();
        iface.done(2);
        reactor.run_until_idle();

        assert_eq!(*consumed.borrow(), vec![2]);
    }

    #[test]
    #[should_panic]
    fn test_stream_pass_overconsumption_panics() {
        let reactor = Reactor::new_paused();
        let iface = StreamPassInterface::new(&reactor, |_| {});
        iface.set_done_handler(|_| {});
        iface.send(Bytes::from_static(b"hi"));
        reactor.run_until_idle();
        iface.done(3);
    }

    #[test]
    fn test_stream_recv_appends() {
        let reactor = Reactor::new_paused();
        let pending: Rc<RefCell<Option<(BytesMut, usize)>>> = Default::default();
        let received: Rc<RefCell<Option<BytesMut>>> = Default::default();

        let pending2 = pending.clone();
        let iface = StreamRecvInterface::new(&reactor, move |buf, max| *pending2.borrow_mut() = Some((buf, max)));
        let received2 = received.clone();
        iface.set_done_handler(move |buf| *received2.borrow_mut() = Some(buf));

        iface.recv(BytesMut::from(&b"ab"[..]), 3);
        reactor.run_until_idle();

        let (mut buf, max) = pending.borrow_mut().take().unwrap();
        assert_eq!(max, 3);
        buf.extend_from_slice(b"cde");
        iface.done(buf);
        reactor.run_until_idle();

        assert_eq!(&received.borrow().as_ref().unwrap()[..], b"abcde");
    }
}
