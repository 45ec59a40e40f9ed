use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::dataproto::config::DataProtoConfig;
use crate::flow::interface::PacketPassInterface;
use crate::flow::keepalive_io::KeepaliveIO;
use crate::flow::keepalive_source::DataProtoKeepaliveSource;
use crate::flow::notifier::PacketPassNotifier;
use crate::flow::queue::PacketPassFairQueue;
use crate::protocol::dataproto::{set_frame_flags, DataProtoFlags, DataProtoHeader};
use crate::reactor::{PendingJob, Reactor, Timer};
use crate::util::with_upgraded;

/// Whether the peer receives what we send, as far as we can tell from its own frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestState {
    Down,
    Up,
}

impl From<bool> for DestState {
    fn from(up: bool) -> Self {
        if up { DestState::Up } else { DestState::Down }
    }
}

/// The sending side of the DataProto connection to one peer.
///
/// ```text
///   local sources ─► fair queue ─► keepalive IO ─► notifier (flags) ─► output
/// ```
///
/// Local sources and relay flows attach to the fair queue. Every frame leaving for the peer
///  gets its flags byte rewritten by the notifier: `RECEIVING_KEEPALIVES` is set iff a frame
///  from the peer arrived within the keepalive tolerance.
pub struct DataProtoDest {
    shared: Rc<DestShared>,
}

pub(crate) struct DestShared {
    frame_mtu: usize,
    freeing: Cell<bool>,
    queue: PacketPassFairQueue,
    kio: KeepaliveIO,
    state: Rc<RefCell<DestStateInner>>,
    keepalive_job: PendingJob,
    _keepalive_source: DataProtoKeepaliveSource,
    _notifier: PacketPassNotifier,
}

struct DestStateInner {
    reactor: Reactor,
    up: bool,
    up_report: bool,
    /// running while the peer is considered to be receiving
    receive_timer: Timer,
    up_job: PendingJob,
}

impl DestStateInner {
    fn refresh_up_job(&self) {
        if self.up != self.up_report {
            self.up_job.set();
        }
        else {
            self.up_job.unset();
        }
    }
}

impl DataProtoDest {
    /// `state_handler` is called from a deferred job whenever the state changes. The dest starts
    ///  out `Down` and sends a keepalive right away.
    pub fn new(reactor: &Reactor, config: &DataProtoConfig, output: &PacketPassInterface, mut state_handler: impl FnMut(DestState) + 'static) -> anyhow::Result<DataProtoDest> {
        config.validate()?;
        if output.mtu() < config.packet_mtu() {
            bail!("output MTU {} is below the DataProto packet MTU {}", output.mtu(), config.packet_mtu());
        }

        let state = Rc::new_cyclic(|weak: &Weak<RefCell<DestStateInner>>| {
            let weak_timer = weak.clone();
            let receive_timer = Timer::new(config.keepalive_tolerance_ms(), move || {
                with_upgraded(&weak_timer, |this| {
                    debug!("dataproto dest: peer silent for the keepalive tolerance");
                    this.up = false;
                    this.refresh_up_job();
                });
            });

            let weak_job = weak.clone();
            let up_job = PendingJob::new(reactor, move || {
                let report = with_upgraded(&weak_job, |this| {
                    if this.up == this.up_report {
                        return None;
                    }
                    this.up_report = this.up;
                    Some(DestState::from(this.up))
                }).flatten();

                if let Some(state) = report {
                    debug!("dataproto dest: {:?}", state);
                    state_handler(state);
                }
            });

            RefCell::new(DestStateInner {
                reactor: reactor.clone(),
                up: false,
                up_report: false,
                receive_timer,
                up_job,
            })
        });

        let weak_state = Rc::downgrade(&state);
        let notifier = PacketPassNotifier::new(reactor, output, move |frame: Bytes| {
            if frame.len() < DataProtoHeader::SERIALIZED_LEN {
                return frame;
            }
            let receiving = with_upgraded(&weak_state, |this| this.receive_timer.is_running())
                .unwrap_or(false);
            let flags = if receiving { DataProtoFlags::RECEIVING_KEEPALIVES } else { DataProtoFlags::empty() };

            let mut frame = BytesMut::from(&frame[..]);
            set_frame_flags(&mut frame, flags);
            frame.freeze()
        });

        let keepalive_source = DataProtoKeepaliveSource::new(reactor);
        let kio = KeepaliveIO::new(reactor, notifier.input(), keepalive_source.output(), config.keepalive_interval_ms())?;
        let queue = PacketPassFairQueue::new(reactor, kio.input());

        let shared = Rc::new_cyclic(|weak: &Weak<DestShared>| {
            let weak = weak.clone();
            let keepalive_job = PendingJob::new(reactor, move || {
                if let Some(shared) = weak.upgrade() {
                    if !shared.freeing.get() {
                        shared.kio.send_keepalive_now();
                    }
                }
            });
            DestShared {
                frame_mtu: config.frame_mtu,
                freeing: Cell::new(false),
                queue,
                kio,
                state,
                keepalive_job,
                _keepalive_source: keepalive_source,
                _notifier: notifier,
            }
        });
        // the keepalive blocker receives its first request from a job that is already queued
        shared.keepalive_job.set();

        Ok(DataProtoDest { shared })
    }

    /// To be called for every valid frame received from the peer, with the peer's
    ///  `RECEIVING_KEEPALIVES` flag.
    pub fn received(&self, peer_receiving: bool) {
        self.shared.received(peer_receiving);
    }

    /// Makes packets from attached flows complete without being sent, so that the flows can be
    ///  detached and freed in any order.
    pub fn prepare_free(&self) {
        self.shared.prepare_free();
    }

    pub fn state(&self) -> DestState {
        DestState::from(self.shared.state.borrow().up)
    }

    /// Whether outgoing frames currently carry `RECEIVING_KEEPALIVES`
    pub fn is_receiving(&self) -> bool {
        self.shared.state.borrow().receive_timer.is_running()
    }

    pub fn frame_mtu(&self) -> usize {
        self.shared.frame_mtu
    }

    pub(crate) fn shared(&self) -> &Rc<DestShared> {
        &self.shared
    }
}

impl Drop for DataProtoDest {
    fn drop(&mut self) {
        self.shared.prepare_free();
    }
}

impl DestShared {
    pub(crate) fn received(&self, peer_receiving: bool) {
        {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            state.reactor.reset_timer(&state.receive_timer);
            state.up = peer_receiving;
            state.refresh_up_job();
        }
        if !peer_receiving && !self.freeing.get() {
            self.kio.send_keepalive_now();
        }
    }

    pub(crate) fn prepare_free(&self) {
        self.freeing.set(true);
        self.keepalive_job.unset();
        self.queue.prepare_free();
    }

    pub(crate) fn frame_mtu(&self) -> usize {
        self.frame_mtu
    }

    pub(crate) fn is_freeing(&self) -> bool {
        self.freeing.get()
    }

    pub(crate) fn queue(&self) -> &PacketPassFairQueue {
        &self.queue
    }
}
