use anyhow::bail;
use tracing::{debug, info};

use crate::dataproto::dest::{DataProtoDest, DestShared};
use crate::flow::connector::PacketPassConnector;
use crate::flow::inactivity_monitor::PacketPassInactivityMonitor;
use crate::flow::queue::PacketPassFairQueueFlow;
use crate::flow::route_buffer::RouteBuffer;
use crate::protocol::dataproto::{encode_frame, DataProtoFlags, DataProtoHeader};
use crate::protocol::scproto::PeerId;
use crate::reactor::Reactor;

/// Called when no frame left a local source for the configured interval
pub type InactivityHandler = Box<dyn FnMut()>;

/// One flow of frames from `source_id` to `dest_id`, fed synchronously through [`route`] and
///  sent through whichever [`DataProtoDest`] it is attached to.
///
/// ```text
///   route() ─► route buffer ─► (inactivity monitor) ─► connector ─► dest fair queue flow
/// ```
///
/// While detached, frames stay in the buffer.
///
/// [`route`]: DataProtoLocalSource::route
pub struct DataProtoLocalSource {
    source_id: PeerId,
    dest_id: PeerId,
    frame_mtu: usize,
    route_buffer: RouteBuffer,
    _monitor: Option<PacketPassInactivityMonitor>,
    connector: PacketPassConnector,
    flow: Option<PacketPassFairQueueFlow>,
}

impl DataProtoLocalSource {
    pub fn new(reactor: &Reactor, frame_mtu: usize, source_id: PeerId, dest_id: PeerId, num_packets: usize, inactivity: Option<(u64, InactivityHandler)>) -> anyhow::Result<DataProtoLocalSource> {
        if frame_mtu == 0 {
            bail!("frame MTU must be positive");
        }
        if num_packets == 0 {
            bail!("a local source needs room for at least one packet");
        }

        let packet_mtu = frame_mtu + DataProtoHeader::MAX_OVERHEAD;
        let connector = PacketPassConnector::new(reactor, packet_mtu);

        let (monitor, route_buffer) = match inactivity {
            Some((interval_ms, mut handler)) => {
                if interval_ms == 0 {
                    bail!("inactivity interval must be positive");
                }
                let monitor = PacketPassInactivityMonitor::new(reactor, connector.input(), interval_ms, move || handler());
                let route_buffer = RouteBuffer::new(monitor.input(), num_packets);
                (Some(monitor), route_buffer)
            }
            None => (None, RouteBuffer::new(connector.input(), num_packets)),
        };

        Ok(DataProtoLocalSource {
            source_id,
            dest_id,
            frame_mtu,
            route_buffer,
            _monitor: monitor,
            connector,
            flow: None,
        })
    }

    pub fn source_id(&self) -> PeerId {
        self.source_id
    }

    pub fn dest_id(&self) -> PeerId {
        self.dest_id
    }

    /// Frames waiting to be sent, including the one in flight
    pub fn queued(&self) -> usize {
        self.route_buffer.len()
    }

    pub fn is_attached(&self) -> bool {
        self.flow.is_some()
    }

    /// Wraps the payload in a DataProto header and queues it. Returns `false` if the buffer
    ///  is full, in which case the frame is dropped.
    pub fn route(&self, payload: &[u8]) -> bool {
        assert!(payload.len() <= self.frame_mtu);

        let header = DataProtoHeader::new(DataProtoFlags::empty(), self.source_id, vec![self.dest_id]);
        if !self.route_buffer.route(encode_frame(&header, payload)) {
            info!("buffer full: {}->{}", self.source_id, self.dest_id);
            return false;
        }
        true
    }

    pub fn attach(&mut self, dest: &DataProtoDest) -> anyhow::Result<()> {
        self.attach_shared(dest.shared())
    }

    pub(crate) fn attach_shared(&mut self, dest: &DestShared) -> anyhow::Result<()> {
        assert!(self.flow.is_none(), "local source is already attached");

        if dest.is_freeing() {
            bail!("destination is being freed");
        }
        if self.frame_mtu > dest.frame_mtu() {
            bail!("frame MTU {} exceeds the destination's frame MTU {}", self.frame_mtu, dest.frame_mtu());
        }

        let flow = PacketPassFairQueueFlow::new(dest.queue());
        self.connector.connect_output(flow.input())?;
        self.flow = Some(flow);
        debug!("local source {}->{}: attached", self.source_id, self.dest_id);
        Ok(())
    }

    /// A frame that the destination has not started sending is taken back and stays buffered.
    pub fn detach(&mut self) {
        let Some(flow) = self.flow.take() else {
            return;
        };
        self.connector.disconnect_output();
        drop(flow);
        debug!("local source {}->{}: detached", self.source_id, self.dest_id);
    }
}

impl Drop for DataProtoLocalSource {
    fn drop(&mut self) {
        self.detach();
    }
}
