//! The receiving side of a node: frames arriving from peers are validated, delivered to the
//!  local device and/or relayed to other peers, and their flags are fed back into the sending
//!  peer's [`DataProtoDest`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::bail;
use bytes::Bytes;
use tracing::{info, trace, warn};

use crate::dataproto::config::DataProtoConfig;
use crate::dataproto::dest::{DataProtoDest, DestShared};
use crate::dataproto::relay::{DPRelayRouter, DPRelaySink, DPRelaySource};
use crate::flow::error::{ErrorReporter, FlowError, ProtocolError};
use crate::flow::interface::PacketPassInterface;
use crate::flow::queue::{PacketPassFairQueue, PacketPassFairQueueFlow};
use crate::protocol::dataproto::{parse_frame, DataProtoError, DataProtoFlags, DataProtoHeader};
use crate::protocol::scproto::PeerId;
use crate::reactor::Reactor;
use crate::structure::avl::AvlTree;
use crate::util::with_upgraded;

/// Shared state of all receivers of a node. Local deliveries from all peers are multiplexed
///  onto the local output through a fair queue.
pub struct DPReceiveDevice {
    inner: Rc<RefCell<ReceiveDeviceInner>>,
}

struct ReceiveDeviceInner {
    reactor: Reactor,
    peer_id: PeerId,
    frame_mtu: usize,
    relay_flow_buffer_size: usize,
    relay_flow_inactivity_ms: u64,
    router: DPRelayRouter,
    queue: PacketPassFairQueue,
    peers: AvlTree<PeerId, PeerEntry>,
}

struct PeerEntry {
    is_relay_client: bool,
    dest: Option<Weak<DestShared>>,
    relay_source: DPRelaySource,
    relay_sink: DPRelaySink,
}

impl DPReceiveDevice {
    pub fn new(reactor: &Reactor, config: &DataProtoConfig, local_output: &PacketPassInterface, relay_router: &DPRelayRouter) -> anyhow::Result<DPReceiveDevice> {
        config.validate()?;
        if local_output.mtu() < config.frame_mtu {
            bail!("local output MTU {} is below the frame MTU {}", local_output.mtu(), config.frame_mtu);
        }
        if relay_router.frame_mtu() < config.frame_mtu {
            bail!("relay router MTU {} is below the frame MTU {}", relay_router.frame_mtu(), config.frame_mtu);
        }

        Ok(DPReceiveDevice {
            inner: Rc::new(RefCell::new(ReceiveDeviceInner {
                reactor: reactor.clone(),
                peer_id: config.peer_id,
                frame_mtu: config.frame_mtu,
                relay_flow_buffer_size: config.relay_flow_buffer_size,
                relay_flow_inactivity_ms: config.relay_flow_inactivity_ms(),
                router: relay_router.clone(),
                queue: PacketPassFairQueue::new(reactor, local_output),
                peers: AvlTree::new(),
            })),
        })
    }

    pub fn peer_count(&self) -> usize {
        self.inner.borrow().peers.len()
    }
}

impl Drop for DPReceiveDevice {
    fn drop(&mut self) {
        self.inner.borrow().queue.prepare_free();
    }
}


/// A peer known to the receiving side. Dropping it frees its relay flows.
pub struct DPReceivePeer {
    device: Weak<RefCell<ReceiveDeviceInner>>,
    peer_id: PeerId,
}

impl DPReceivePeer {
    /// Frames from a peer are only relayed to other peers if it `is_relay_client`.
    pub fn new(device: &DPReceiveDevice, peer_id: PeerId, is_relay_client: bool) -> anyhow::Result<DPReceivePeer> {
        let mut inner = device.inner.borrow_mut();
        if peer_id == inner.peer_id {
            bail!("peer id {} is the local id", peer_id);
        }
        if inner.peers.contains_key(&peer_id) {
            bail!("peer {} exists", peer_id);
        }

        let entry = PeerEntry {
            is_relay_client,
            dest: None,
            relay_source: DPRelaySource::new(&inner.router, peer_id)?,
            relay_sink: DPRelaySink::new(&inner.router, peer_id)?,
        };
        if inner.peers.insert(peer_id, entry).is_err() {
            bail!("peer {} exists", peer_id);
        }

        Ok(DPReceivePeer {
            device: Rc::downgrade(&device.inner),
            peer_id,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// From now on, frames from this peer refresh `dest`, and relayed frames for this peer
    ///  are sent through it.
    pub fn attach_dest(&self, dest: &DataProtoDest) {
        with_upgraded(&self.device, |this| {
            let Some(entry) = this.peers.get_mut(&self.peer_id) else {
                return;
            };
            assert!(entry.dest.is_none(), "peer {} already has a dest", self.peer_id);
            entry.dest = Some(Rc::downgrade(dest.shared()));
            entry.relay_sink.attach(dest);
        });
    }

    pub fn detach_dest(&self) {
        with_upgraded(&self.device, |this| {
            if let Some(entry) = this.peers.get_mut(&self.peer_id) {
                entry.relay_sink.detach();
                entry.dest = None;
            }
        });
    }
}

impl Drop for DPReceivePeer {
    fn drop(&mut self) {
        let entry = with_upgraded(&self.device, |this| this.peers.remove(&self.peer_id));
        drop(entry);
    }
}


/// Accepts the frames received from one peer through a PP input.
pub struct DPReceiveReceiver {
    _inner: Rc<RefCell<ReceiverInner>>,
    input: PacketPassInterface,
}

struct ReceiverInner {
    device: Weak<RefCell<ReceiveDeviceInner>>,
    peer_id: PeerId,
    input: Option<PacketPassInterface>,
    local_flow: PacketPassFairQueueFlow,
}

impl ReceiverInner {
    fn complete_input(&self) {
        if let Some(input) = &self.input {
            input.done();
        }
    }

    fn on_frame(&self, frame: Bytes) -> Option<FlowError> {
        let Some(device) = self.device.upgrade() else {
            self.complete_input();
            return None;
        };
        let device = device.borrow();

        let accepted = parse_frame(&frame).and_then(|(header, payload)| {
            if payload.len() > device.frame_mtu {
                return Err(DataProtoError::FrameTooLarge { len: payload.len(), mtu: device.frame_mtu });
            }
            Ok((header, payload))
        });
        let (header, payload) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("peer {}: rejected frame: {}", self.peer_id, e);
                self.complete_input();
                return Some(FlowError::Protocol(ProtocolError::DataProto(e)));
            }
        };
        trace!("peer {}: frame with {} payload bytes for {:?}", self.peer_id, payload.len(), header.dest_ids);

        let Some(source) = device.peers.get(&self.peer_id) else {
            self.complete_input();
            return None;
        };

        let mut deliver_locally = false;
        for &dest_id in &header.dest_ids {
            if dest_id == device.peer_id {
                deliver_locally = true;
                continue;
            }
            if !source.is_relay_client {
                info!("peer {}: dropping frame: {}", self.peer_id, DataProtoError::RelayNotAllowed);
                continue;
            }
            match device.peers.get(&dest_id) {
                Some(sink) if sink.dest.is_some() => {
                    device.router.submit_frame(&source.relay_source, &sink.relay_sink, &payload, device.relay_flow_buffer_size, device.relay_flow_inactivity_ms);
                }
                _ => info!("peer {}: dropping frame: {}", self.peer_id, DataProtoError::UnknownDestination(dest_id)),
            }
        }

        if let Some(dest) = source.dest.as_ref().and_then(Weak::upgrade) {
            dest.received(header.flags.contains(DataProtoFlags::RECEIVING_KEEPALIVES));
        }

        if deliver_locally {
            self.local_flow.input().send(payload);
        }
        else {
            self.complete_input();
        }
        None
    }
}

impl DPReceiveReceiver {
    /// Runtime errors are rejected frames; the receiver stays usable after reporting them.
    pub fn new(peer: &DPReceivePeer, reporter: Rc<dyn ErrorReporter>) -> anyhow::Result<DPReceiveReceiver> {
        let Some(device) = peer.device.upgrade() else {
            bail!("receive device of peer {} is gone", peer.peer_id);
        };
        let (reactor, local_flow, packet_mtu) = {
            let device = device.borrow();
            let packet_mtu = device.frame_mtu + DataProtoHeader::MAX_OVERHEAD;
            (device.reactor.clone(), PacketPassFairQueueFlow::new(&device.queue), packet_mtu)
        };

        let inner = Rc::new(RefCell::new(ReceiverInner {
            device: peer.device.clone(),
            peer_id: peer.peer_id,
            input: None,
            local_flow,
        }));

        let weak = Rc::downgrade(&inner);
        let input = PacketPassInterface::new(&reactor, packet_mtu, move |frame| {
            if let Some(error) = with_upgraded(&weak, |this| this.on_frame(frame)).flatten() {
                reporter.report(error);
            }
        });

        let weak = Rc::downgrade(&inner);
        inner.borrow().local_flow.input().set_done_handler(move || {
            with_upgraded(&weak, |this| this.complete_input());
        });

        inner.borrow_mut().input = Some(input.clone());
        Ok(DPReceiveReceiver { _inner: inner, input })
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.input
    }
}
