use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;

use crate::flow::interface::PacketRecvInterface;
use crate::reactor::Reactor;
use crate::util::with_upgraded;

/// Holds receive requests from its PR output back until the owner releases them one at a time.
pub struct PacketRecvBlocker {
    inner: Rc<RefCell<PacketRecvBlockerInner>>,
    output: PacketRecvInterface,
}

struct PacketRecvBlockerInner {
    input: PacketRecvInterface,
    output: Option<PacketRecvInterface>,
    blocked: Option<BytesMut>,
    forwarding: bool,
}

impl PacketRecvBlocker {
    pub fn new(reactor: &Reactor, input: &PacketRecvInterface) -> PacketRecvBlocker {
        let inner = Rc::new(RefCell::new(PacketRecvBlockerInner {
            input: input.clone(),
            output: None,
            blocked: None,
            forwarding: false,
        }));

        let weak = Rc::downgrade(&inner);
        let output = PacketRecvInterface::new(reactor, input.mtu(), move |buf| {
            with_upgraded(&weak, |this| {
                debug_assert!(this.blocked.is_none() && !this.forwarding);
                this.blocked = Some(buf);
            });
        });

        let weak = Rc::downgrade(&inner);
        input.set_done_handler(move |packet| {
            with_upgraded(&weak, |this| {
                this.forwarding = false;
                if let Some(output) = &this.output {
                    output.done(packet);
                }
            });
        });

        inner.borrow_mut().output = Some(output.clone());
        PacketRecvBlocker { inner, output }
    }

    pub fn output(&self) -> &PacketRecvInterface {
        &self.output
    }

    /// Forwards the currently blocked request to the input. No-op if the output has no
    ///  request waiting, so a release is not remembered for a later request.
    pub fn release_one(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.forwarding {
            return;
        }
        if let Some(buf) = inner.blocked.take() {
            inner.forwarding = true;
            inner.input.recv(buf);
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.borrow().blocked.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{PacketCollector, ScriptedSource};
    use bytes::Bytes;

    #[test]
    fn test_releases_one_packet_at_a_time() {
        let reactor = Reactor::new_paused();
        let source = ScriptedSource::new(&reactor, 4);
        for p in [b"a", b"b", b"c"] {
            source.push(p);
        }
        let blocker = PacketRecvBlocker::new(&reactor, source.output());
        let collector = PacketCollector::new(blocker.output());

        reactor.run_until_idle();
        assert!(collector.packets().is_empty());
        assert!(blocker.is_blocking());

        blocker.release_one();
        blocker.release_one();
        reactor.run_until_idle();
        assert_eq!(collector.packets(), vec![Bytes::from_static(b"a")]);

        blocker.release_one();
        reactor.run_until_idle();
        assert_eq!(collector.packets(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(source.queued(), 1);
    }

    #[test]
    fn test_release_without_request_is_not_remembered() {
        let reactor = Reactor::new_paused();
        let source = ScriptedSource::new(&reactor, 4);
        source.push(b"a");
        let blocker = PacketRecvBlocker::new(&reactor, source.output());

        blocker.release_one();
        let collector = PacketCollector::new(blocker.output());
        reactor.run_until_idle();

        assert!(collector.packets().is_empty());
        assert_eq!(source.queued(), 1);
    }
}
