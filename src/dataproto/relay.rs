//! Relaying frames between peers.
//!
//! Frames received from one peer and destined for another are injected into a relay flow
//!  for the (source, sink) pair. The flow is a [`DataProtoLocalSource`] attached to the
//!  sink's current [`DataProtoDest`], so relayed traffic shares that peer's fair queue with
//!  local traffic. A flow is created by the first frame for its pair and freed after it saw
//!  no frames for the inactivity time, or together with its source or sink.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::bail;
use tracing::{debug, warn};

use crate::dataproto::dest::{DataProtoDest, DestShared};
use crate::dataproto::local_source::DataProtoLocalSource;
use crate::protocol::scproto::PeerId;
use crate::reactor::{Reactor, Timer};
use crate::structure::avl::AvlTree;
use crate::util::with_upgraded;

type FlowKey = (PeerId, PeerId);

/// Owns the relay flows of a node. Cloning yields another handle to the same router.
#[derive(Clone)]
pub struct DPRelayRouter {
    inner: Rc<RefCell<RouterInner>>,
}

struct RouterInner {
    reactor: Reactor,
    frame_mtu: usize,
    /// sink ids of each source's flows
    sources: AvlTree<PeerId, Vec<PeerId>>,
    sinks: AvlTree<PeerId, SinkEntry>,
    flows: AvlTree<FlowKey, RelayFlow>,
}

struct SinkEntry {
    dest: Option<Weak<DestShared>>,
    /// source ids of the sink's flows
    sources: Vec<PeerId>,
}

struct RelayFlow {
    local: DataProtoLocalSource,
    inactivity_timer: Timer,
}

impl RouterInner {
    fn create_flow(&mut self, weak: Weak<RefCell<RouterInner>>, key: FlowKey, num_packets: usize) -> anyhow::Result<()> {
        let (source_id, sink_id) = key;

        let mut local = DataProtoLocalSource::new(&self.reactor, self.frame_mtu, source_id, sink_id, num_packets, None)?;
        let Some(sink) = self.sinks.get_mut(&sink_id) else {
            bail!("unknown relay sink {}", sink_id);
        };
        if let Some(dest) = sink.dest.as_ref().and_then(Weak::upgrade) {
            if let Err(e) = local.attach_shared(&dest) {
                warn!("relay flow {}->{}: cannot attach: {}", source_id, sink_id, e);
            }
        }
        sink.sources.push(source_id);

        if let Some(sinks) = self.sources.get_mut(&source_id) {
            sinks.push(sink_id);
        }

        let inactivity_timer = Timer::new(0, move || {
            debug!("relay flow {}->{}: inactive", source_id, sink_id);
            let flow = with_upgraded(&weak, |this| this.remove_flow(key)).flatten();
            drop(flow);
        });

        if self.flows.insert(key, RelayFlow { local, inactivity_timer }).is_err() {
            bail!("relay flow {}->{} exists", source_id, sink_id);
        }
        debug!("relay flow {}->{}: created", source_id, sink_id);
        Ok(())
    }

    /// The flow is handed back so that the caller can drop it without holding the router.
    fn remove_flow(&mut self, key: FlowKey) -> Option<RelayFlow> {
        let (source_id, sink_id) = key;
        let flow = self.flows.remove(&key)?;

        if let Some(sinks) = self.sources.get_mut(&source_id) {
            sinks.retain(|&id| id != sink_id);
        }
        if let Some(sink) = self.sinks.get_mut(&sink_id) {
            sink.sources.retain(|&id| id != source_id);
        }
        debug!("relay flow {}->{}: freed", source_id, sink_id);
        Some(flow)
    }
}

impl DPRelayRouter {
    /// `frame_mtu` is the largest payload that can be relayed.
    pub fn new(reactor: &Reactor, frame_mtu: usize) -> DPRelayRouter {
        DPRelayRouter {
            inner: Rc::new(RefCell::new(RouterInner {
                reactor: reactor.clone(),
                frame_mtu,
                sources: AvlTree::new(),
                sinks: AvlTree::new(),
                flows: AvlTree::new(),
            })),
        }
    }

    pub fn frame_mtu(&self) -> usize {
        self.inner.borrow().frame_mtu
    }

    /// Queues `data` on the flow from `source` to `sink`, creating the flow if necessary, and
    ///  restarts the flow's inactivity timer. `num_packets` is the buffer size of a newly
    ///  created flow. Returns `false` if the frame was dropped.
    pub fn submit_frame(&self, source: &DPRelaySource, sink: &DPRelaySink, data: &[u8], num_packets: usize, inactivity_ms: u64) -> bool {
        assert!(inactivity_ms > 0);
        let key = (source.source_id, sink.sink_id);

        let mut inner = self.inner.borrow_mut();
        assert!(data.len() <= inner.frame_mtu, "relayed frame of {} bytes exceeds MTU {}", data.len(), inner.frame_mtu);

        if !inner.flows.contains_key(&key) {
            if let Err(e) = inner.create_flow(Rc::downgrade(&self.inner), key, num_packets) {
                warn!("relay flow {}->{}: cannot create: {}", key.0, key.1, e);
                return false;
            }
        }

        let inner = &mut *inner;
        let Some(flow) = inner.flows.get_mut(&key) else {
            return false;
        };
        flow.inactivity_timer.set_interval(inactivity_ms);
        inner.reactor.reset_timer(&flow.inactivity_timer);
        flow.local.route(data)
    }

    pub fn flow_count(&self) -> usize {
        self.inner.borrow().flows.len()
    }

    pub fn has_flow(&self, source_id: PeerId, sink_id: PeerId) -> bool {
        self.inner.borrow().flows.contains_key(&(source_id, sink_id))
    }

    /// Frames buffered in the flow, if it exists
    pub fn flow_queued(&self, source_id: PeerId, sink_id: PeerId) -> Option<usize> {
        self.inner.borrow().flows.get(&(source_id, sink_id))
            .map(|flow| flow.local.queued())
    }
}


/// The relay identity of a peer that frames are received from
pub struct DPRelaySource {
    router: Weak<RefCell<RouterInner>>,
    source_id: PeerId,
}

impl DPRelaySource {
    pub fn new(router: &DPRelayRouter, source_id: PeerId) -> anyhow::Result<DPRelaySource> {
        if router.inner.borrow_mut().sources.insert(source_id, Vec::new()).is_err() {
            bail!("relay source {} exists", source_id);
        }
        Ok(DPRelaySource {
            router: Rc::downgrade(&router.inner),
            source_id,
        })
    }

    pub fn source_id(&self) -> PeerId {
        self.source_id
    }

    /// Calls [`DataProtoDest::prepare_free`] on the dest of every sink this source has a flow
    ///  to, so that the flows can be torn down without waiting for their packets.
    pub fn prepare_free_destinations(&self) {
        let dests: Vec<Rc<DestShared>> = with_upgraded(&self.router, |this| {
            let Some(sink_ids) = this.sources.get(&self.source_id) else {
                return Vec::new();
            };
            sink_ids.iter()
                .filter_map(|sink_id| this.sinks.get(sink_id))
                .filter_map(|sink| sink.dest.as_ref().and_then(Weak::upgrade))
                .collect()
        }).unwrap_or_default();

        for dest in dests {
            dest.prepare_free();
        }
    }
}

impl Drop for DPRelaySource {
    fn drop(&mut self) {
        let flows = with_upgraded(&self.router, |this| {
            let sink_ids = this.sources.remove(&self.source_id).unwrap_or_default();
            sink_ids.into_iter()
                .filter_map(|sink_id| this.remove_flow((self.source_id, sink_id)))
                .collect::<Vec<_>>()
        });
        drop(flows);
    }
}


/// The relay identity of a peer that frames are sent to
pub struct DPRelaySink {
    router: Weak<RefCell<RouterInner>>,
    sink_id: PeerId,
}

impl DPRelaySink {
    pub fn new(router: &DPRelayRouter, sink_id: PeerId) -> anyhow::Result<DPRelaySink> {
        let entry = SinkEntry {
            dest: None,
            sources: Vec::new(),
        };
        if router.inner.borrow_mut().sinks.insert(sink_id, entry).is_err() {
            bail!("relay sink {} exists", sink_id);
        }
        Ok(DPRelaySink {
            router: Rc::downgrade(&router.inner),
            sink_id,
        })
    }

    pub fn sink_id(&self) -> PeerId {
        self.sink_id
    }

    /// Attaches all flows into this sink to `dest`, as well as flows created later.
    pub fn attach(&self, dest: &DataProtoDest) {
        self.attach_shared(dest.shared());
    }

    pub(crate) fn attach_shared(&self, dest: &Rc<DestShared>) {
        with_upgraded(&self.router, |this| {
            let sink_id = self.sink_id;
            let Some(sink) = this.sinks.get_mut(&sink_id) else {
                return;
            };
            assert!(sink.dest.is_none(), "relay sink {} is already attached", sink_id);
            sink.dest = Some(Rc::downgrade(dest));

            for &source_id in &sink.sources {
                if let Some(flow) = this.flows.get_mut(&(source_id, sink_id)) {
                    if let Err(e) = flow.local.attach_shared(dest) {
                        warn!("relay flow {}->{}: cannot attach: {}", source_id, sink_id, e);
                    }
                }
            }
            debug!("relay sink {}: attached", sink_id);
        });
    }

    /// Detaches all flows into this sink. Their frames stay buffered until the sink is
    ///  attached again or the flows are freed.
    pub fn detach(&self) {
        with_upgraded(&self.router, |this| {
            let sink_id = self.sink_id;
            let Some(sink) = this.sinks.get_mut(&sink_id) else {
                return;
            };
            if sink.dest.take().is_none() {
                return;
            }

            for &source_id in &sink.sources {
                if let Some(flow) = this.flows.get_mut(&(source_id, sink_id)) {
                    flow.local.detach();
                }
            }
            debug!("relay sink {}: detached", sink_id);
        });
    }

    pub fn is_attached(&self) -> bool {
        with_upgraded(&self.router, |this| {
            this.sinks.get(&self.sink_id)
                .map(|sink| sink.dest.is_some())
                .unwrap_or(false)
        }).unwrap_or(false)
    }
}

impl Drop for DPRelaySink {
    fn drop(&mut self) {
        let flows = with_upgraded(&self.router, |this| {
            let source_ids = this.sinks.remove(&self.sink_id)
                .map(|sink| sink.sources)
                .unwrap_or_default();
            source_ids.into_iter()
                .filter_map(|source_id| this.remove_flow((source_id, self.sink_id)))
                .collect::<Vec<_>>()
        });
        drop(flows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;
    use crate::dataproto::config::DataProtoConfig;
    use crate::protocol::dataproto::{parse_frame, DataProtoHeader};
    use crate::test_util::RecordingSink;

    const MTU: usize = 1500;

    fn dest_with_sink(reactor: &Reactor) -> (DataProtoDest, RecordingSink) {
        let config = DataProtoConfig {
            keepalive_interval: Duration::from_secs(10),
            keepalive_tolerance: Duration::from_secs(20),
            ..DataProtoConfig::default_config()
        };
        let sink = RecordingSink::new(reactor, config.packet_mtu());
        let dest = DataProtoDest::new(reactor, &config, sink.input(), |_| {}).unwrap();
        (dest, sink)
    }

    fn data_frames(sink: &RecordingSink) -> Vec<(DataProtoHeader, Bytes)> {
        sink.packets().iter()
            .map(|frame| parse_frame(frame).unwrap())
            .filter(|(header, _)| !header.dest_ids.is_empty())
            .collect()
    }

    #[test]
    fn test_one_flow_per_pair() {
        let reactor = Reactor::new_paused();
        let router = DPRelayRouter::new(&reactor, MTU);
        let source = DPRelaySource::new(&router, 1).unwrap();
        let sink = DPRelaySink::new(&router, 2).unwrap();
        let (dest, output) = dest_with_sink(&reactor);
        sink.attach(&dest);

        assert!(router.submit_frame(&source, &sink, b"first", 4, 1000));
        assert!(router.submit_frame(&source, &sink, b"second", 4, 1000));
        assert_eq!(router.flow_count(), 1);

        reactor.run_until_idle();

        let frames = data_frames(&output);
        let payloads: Vec<&[u8]> = frames.iter().map(|(_, payload)| &payload[..]).collect();
        assert_eq!(payloads, vec![&b"first"[..], &b"second"[..]]);
        for (header, _) in &frames {
            assert_eq!(header.from_id, 1);
            assert_eq!(header.dest_ids, vec![2]);
        }
    }

    #[rstest]
    #[case::idle(200, None, 200)]
    #[case::refreshed(200, Some(150), 350)]
    fn test_flow_expires(#[case] inactivity_ms: u64, #[case] resubmit_at: Option<u64>, #[case] expected_expiry: u64) {
        let reactor = Reactor::new_paused();
        let router = DPRelayRouter::new(&reactor, MTU);
        let source = DPRelaySource::new(&router, 1).unwrap();
        let sink = DPRelaySink::new(&router, 2).unwrap();

        router.submit_frame(&source, &sink, b"x", 4, inactivity_ms);
        if let Some(at) = resubmit_at {
            reactor.run_for(at);
            router.submit_frame(&source, &sink, b"y", 4, inactivity_ms);
        }

        reactor.run_for(expected_expiry - 1 - reactor.now());
        assert!(router.has_flow(1, 2));
        reactor.run_for(1);
        assert!(!router.has_flow(1, 2));
    }

    #[test]
    fn test_frames_wait_for_attach() {
        let reactor = Reactor::new_paused();
        let router = DPRelayRouter::new(&reactor, MTU);
        let source = DPRelaySource::new(&router, 1).unwrap();
        let sink = DPRelaySink::new(&router, 2).unwrap();

        assert!(router.submit_frame(&source, &sink, b"a", 2, 1000));
        assert!(router.submit_frame(&source, &sink, b"b", 2, 1000));
        assert!(!router.submit_frame(&source, &sink, b"c", 2, 1000));
        reactor.run_until_idle();
        assert_eq!(router.flow_queued(1, 2), Some(2));

        let (dest, output) = dest_with_sink(&reactor);
        sink.attach(&dest);
        assert!(sink.is_attached());
        reactor.run_until_idle();

        let payloads: Vec<Bytes> = data_frames(&output).into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(router.flow_queued(1, 2), Some(0));
    }

    #[test]
    fn test_detach_keeps_flows() {
        let reactor = Reactor::new_paused();
        let router = DPRelayRouter::new(&reactor, MTU);
        let source = DPRelaySource::new(&router, 1).unwrap();
        let sink = DPRelaySink::new(&router, 2).unwrap();
        let (dest, output) = dest_with_sink(&reactor);
        sink.attach(&dest);

        router.submit_frame(&source, &sink, b"a", 4, 1000);
        reactor.run_until_idle();
        sink.detach();
        assert!(!sink.is_attached());

        router.submit_frame(&source, &sink, b"b", 4, 1000);
        reactor.run_until_idle();
        assert_eq!(data_frames(&output).len(), 1);
        assert!(router.has_flow(1, 2));

        sink.attach(&dest);
        reactor.run_until_idle();
        assert_eq!(data_frames(&output).len(), 2);
    }

    #[rstest]
    #[case::drop_source(true)]
    #[case::drop_sink(false)]
    fn test_dropping_endpoint_frees_flows(#[case] drop_source: bool) {
        let reactor = Reactor::new_paused();
        let router = DPRelayRouter::new(&reactor, MTU);
        let source_a = DPRelaySource::new(&router, 1).unwrap();
        let source_b = DPRelaySource::new(&router, 3).unwrap();
        let sink = DPRelaySink::new(&router, 2).unwrap();
        let other_sink = DPRelaySink::new(&router, 4).unwrap();

        router.submit_frame(&source_a, &sink, b"a", 4, 1000);
        router.submit_frame(&source_a, &other_sink, b"b", 4, 1000);
        router.submit_frame(&source_b, &sink, b"c", 4, 1000);
        assert_eq!(router.flow_count(), 3);

        if drop_source {
            drop(source_a);
            assert_eq!(router.flow_count(), 1);
            assert!(router.has_flow(3, 2));
        }
        else {
            drop(sink);
            assert_eq!(router.flow_count(), 1);
            assert!(router.has_flow(1, 4));
        }
    }

    #[test]
    fn test_prepare_free_destinations() {
        let reactor = Reactor::new_paused();
        let router = DPRelayRouter::new(&reactor, MTU);
        let source = DPRelaySource::new(&router, 1).unwrap();
        let sink = DPRelaySink::new(&router, 2).unwrap();
        let (dest, output) = dest_with_sink(&reactor);
        sink.attach(&dest);
        router.submit_frame(&source, &sink, b"a", 4, 1000);
        reactor.run_until_idle();

        source.prepare_free_destinations();
        router.submit_frame(&source, &sink, b"b", 4, 1000);
        reactor.run_until_idle();

        assert_eq!(data_frames(&output).len(), 1);
        assert_eq!(router.flow_queued(1, 2), Some(0));
    }

    #[test]
    fn test_duplicate_ids() {
        let reactor = Reactor::new_paused();
        let router = DPRelayRouter::new(&reactor, MTU);
        let _source = DPRelaySource::new(&router, 1).unwrap();
        let _sink = DPRelaySink::new(&router, 1).unwrap();

        assert!(DPRelaySource::new(&router, 1).is_err());
        assert!(DPRelaySink::new(&router, 1).is_err());
    }

    #[test]
    fn test_random_submits_keep_one_flow_per_pair() {
        const INACTIVITY: u64 = 50;
        let mut rng = StdRng::seed_from_u64(9);
        let reactor = Reactor::new_paused();
        let router = DPRelayRouter::new(&reactor, MTU);
        let sources: Vec<_> = (0..4).map(|id| DPRelaySource::new(&router, id).unwrap()).collect();
        let sinks: Vec<_> = (0..4).map(|id| DPRelaySink::new(&router, id).unwrap()).collect();

        let mut last_submit: BTreeMap<(PeerId, PeerId), u64> = BTreeMap::new();
        for _ in 0..500 {
            let source = &sources[rng.gen_range(0..sources.len())];
            let sink = &sinks[rng.gen_range(0..sinks.len())];
            router.submit_frame(source, sink, b"frame", 2, INACTIVITY);
            last_submit.insert((source.source_id(), sink.sink_id()), reactor.now());

            reactor.run_for(rng.gen_range(1..30));
            let now = reactor.now();
            last_submit.retain(|_, at| *at + INACTIVITY > now);

            assert_eq!(router.flow_count(), last_submit.len());
            for &(source_id, sink_id) in last_submit.keys() {
                assert!(router.has_flow(source_id, sink_id));
            }
        }
    }
}
