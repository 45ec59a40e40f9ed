use std::rc::Rc;

use crate::flow::inactivity_monitor::PacketPassInactivityMonitor;
use crate::flow::interface::{PacketPassInterface, PacketRecvInterface};
use crate::flow::packet_buffer::SinglePacketBuffer;
use crate::flow::queue::{PacketPassPriorityQueue, PacketPassPriorityQueueFlow};
use crate::flow::recv_blocker::PacketRecvBlocker;
use crate::reactor::Reactor;

const USER_PRIORITY: u32 = 0;
const KEEPALIVE_PRIORITY: u32 = 1;

/// Keeps a PP output from falling silent: whenever nothing was sent for `interval_ms`, one
///  packet is pulled from the keepalive input and sent. User packets take precedence over
///  keepalives.
///
/// ```text
///   input ──────────────────────────► user flow ──────┐
///                                                     ├─► priority queue ─► monitor ─► output
///   keepalive ─► blocker ─► buffer ─► keepalive flow ─┘
/// ```
pub struct KeepaliveIO {
    queue: PacketPassPriorityQueue,
    user_flow: PacketPassPriorityQueueFlow,
    _keepalive_flow: PacketPassPriorityQueueFlow,
    _keepalive_buffer: SinglePacketBuffer,
    blocker: Rc<PacketRecvBlocker>,
    _monitor: PacketPassInactivityMonitor,
}

impl KeepaliveIO {
    pub fn new(reactor: &Reactor, output: &PacketPassInterface, keepalive_input: &PacketRecvInterface, interval_ms: u64) -> anyhow::Result<KeepaliveIO> {
        let blocker = Rc::new(PacketRecvBlocker::new(reactor, keepalive_input));

        let blocker_for_monitor = blocker.clone();
        let monitor = PacketPassInactivityMonitor::new(reactor, output, interval_ms, move || blocker_for_monitor.release_one());

        let queue = PacketPassPriorityQueue::new(reactor, monitor.input());
        let user_flow = PacketPassPriorityQueueFlow::new(&queue, USER_PRIORITY);
        let keepalive_flow = PacketPassPriorityQueueFlow::new(&queue, KEEPALIVE_PRIORITY);
        let keepalive_buffer = SinglePacketBuffer::new(blocker.output(), keepalive_flow.input())?;

        Ok(KeepaliveIO {
            queue,
            user_flow,
            _keepalive_flow: keepalive_flow,
            _keepalive_buffer: keepalive_buffer,
            blocker,
            _monitor: monitor,
        })
    }

    pub fn input(&self) -> &PacketPassInterface {
        self.user_flow.input()
    }

    /// Queues a keepalive right away instead of waiting for the interval. It goes out behind
    ///  a packet that is already in flight. No-op if a keepalive is already queued.
    pub fn send_keepalive_now(&self) {
        self.blocker.release_one();
    }
}

impl Drop for KeepaliveIO {
    fn drop(&mut self) {
        self.queue.prepare_free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::flow::keepalive_source::SCKeepaliveSource;
    use crate::protocol::scproto::SCID_KEEPALIVE;
    use crate::test_util::{PacketFeeder, RecordingSink, ScriptedSource};

    #[test]
    fn test_keepalives_fill_silence() {
        let reactor = Reactor::new_paused();
        let sink = RecordingSink::new(&reactor, 10);
        let keepalives = SCKeepaliveSource::new(&reactor);
        let kio = KeepaliveIO::new(&reactor, sink.input(), keepalives.output(), 100).unwrap();
        let feeder = PacketFeeder::new(kio.input());

        reactor.run_for(350);
        feeder.push(b"user");
        reactor.run_for(150);

        let keepalive = Bytes::from_static(&[SCID_KEEPALIVE]);
        assert_eq!(sink.timed_packets(), vec![
            (100, keepalive.clone()),
            (200, keepalive.clone()),
            (300, keepalive.clone()),
            (350, Bytes::from_static(b"user")),
            (450, keepalive),
        ]);
    }

    #[test]
    fn test_steady_traffic_suppresses_keepalives() {
        let reactor = Reactor::new_paused();
        let sink = RecordingSink::new(&reactor, 10);
        let keepalives = SCKeepaliveSource::new(&reactor);
        let kio = KeepaliveIO::new(&reactor, sink.input(), keepalives.output(), 100).unwrap();
        let feeder = PacketFeeder::new(kio.input());

        for _ in 0..5 {
            reactor.run_for(60);
            feeder.push(b"user");
        }
        reactor.run_until_idle();

        assert!(sink.packets().iter().all(|p| &p[..] == b"user"));
        assert_eq!(sink.packets().len(), 5);
    }

    #[test]
    fn test_send_keepalive_now() {
        let reactor = Reactor::new_paused();
        let sink = RecordingSink::new(&reactor, 10);
        let keepalives = SCKeepaliveSource::new(&reactor);
        let kio = KeepaliveIO::new(&reactor, sink.input(), keepalives.output(), 100).unwrap();

        reactor.run_for(20);
        kio.send_keepalive_now();
        reactor.run_for(10);

        assert_eq!(sink.timed_packets().iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![20]);
    }

    #[test]
    fn test_send_keepalive_now_while_output_busy() {
        let reactor = Reactor::new_paused();
        let sink = RecordingSink::new(&reactor, 10);
        sink.set_blocked(true);
        let keepalives = SCKeepaliveSource::new(&reactor);
        let kio = KeepaliveIO::new(&reactor, sink.input(), keepalives.output(), 100).unwrap();
        let feeder = PacketFeeder::new(kio.input());

        reactor.run_for(20);
        feeder.push(b"user");
        reactor.run_until_idle();
        assert!(sink.is_holding());

        kio.send_keepalive_now();
        reactor.run_for(30);
        sink.set_blocked(false);
        reactor.run_for(10);

        assert_eq!(sink.timed_packets(), vec![
            (20, Bytes::from_static(b"user")),
            (50, Bytes::from_static(&[SCID_KEEPALIVE])),
        ]);
    }

    #[test]
    fn test_keepalive_larger_than_output() {
        let reactor = Reactor::new_paused();
        let sink = RecordingSink::new(&reactor, 4);
        let source = ScriptedSource::new(&reactor, 5);
        assert!(KeepaliveIO::new(&reactor, sink.input(), source.output(), 100).is_err());
    }
}
