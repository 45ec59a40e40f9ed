//! Multiplexing many PP flows onto a single PP output.
//!
//! Each flow holds at most one packet (its input is a regular packet-push interface). The
//!  queue keeps the waiting packets in an index ordered by a scheduling key, and whenever
//!  the output becomes idle, it sends the packet with the smallest key:
//!
//! * The fair queue keys a packet by its start time on a virtual byte clock. A flow that
//!    keeps sending starts each packet where its previous one ended; a flow that was idle
//!    starts at the queue's current time. This gives every backlogged flow the same share of
//!    output bytes, regardless of packet sizes.
//! * The priority queue keys a packet by the flow's priority (lower is served first).
//!
//! Ties are broken by arrival order.
//!
//! NB: A flow learns that its packet was sent through a deferred done, and its next packet
//!  arrives through another deferred job. The queue therefore does not pick the next packet
//!  right away when the output completes, but waits for the flow it just served to either
//!  send again or go idle. Otherwise a backlogged flow would regularly miss its turn.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::flow::interface::{CancelOutcome, PacketPassInterface};
use crate::reactor::{PendingJob, Reactor};
use crate::util::with_upgraded;

type QueueKey = (u64, u64);
type FlowId = usize;

enum Discipline {
    Fair { clock: u64 },
    Priority,
}

/// The packet currently at the output
enum InOutput {
    Flow(FlowId),
    /// belongs to a flow that was freed or cancelled while the output could not cancel it
    Orphan,
}

struct QueueFlow {
    input: PacketPassInterface,
    priority: u64,
    /// end of the flow's last packet on the fair queue's byte clock, kept while the flow is
    ///  backlogged
    finish: Option<u64>,
    waiting: Option<(QueueKey, Bytes)>,
    suspended: bool,
}

struct QueueCore {
    reactor: Reactor,
    output: PacketPassInterface,
    discipline: Discipline,
    flows: FxHashMap<FlowId, QueueFlow>,
    index: BTreeMap<QueueKey, FlowId>,
    next_flow_id: FlowId,
    arrival_seq: u64,
    in_output: Option<InOutput>,
    /// flow whose packet was just completed, and which may be about to send again
    last_served: Option<FlowId>,
    job_schedule: PendingJob,
    freeing: bool,
}

impl QueueCore {
    fn new(reactor: &Reactor, output: &PacketPassInterface, discipline: Discipline) -> Rc<RefCell<QueueCore>> {
        let core = Rc::new_cyclic(|weak: &Weak<RefCell<QueueCore>>| {
            let weak = weak.clone();
            RefCell::new(QueueCore {
                reactor: reactor.clone(),
                output: output.clone(),
                discipline,
                flows: Default::default(),
                index: Default::default(),
                next_flow_id: 0,
                arrival_seq: 0,
                in_output: None,
                last_served: None,
                job_schedule: PendingJob::new(reactor, move || {
                    with_upgraded(&weak, |core| core.on_schedule());
                }),
                freeing: false,
            })
        });

        let weak = Rc::downgrade(&core);
        output.set_done_handler(move || {
            with_upgraded(&weak, |core| core.on_output_done());
        });
        core
    }

    fn add_flow(core: &Rc<RefCell<QueueCore>>, priority: u64) -> (FlowId, PacketPassInterface) {
        let mut this = core.borrow_mut();
        let id = this.next_flow_id;
        this.next_flow_id += 1;

        let weak = Rc::downgrade(core);
        let input = PacketPassInterface::new(&this.reactor, this.output.mtu(), move |packet| {
            with_upgraded(&weak, |core| core.on_flow_send(id, packet));
        });
        let weak = Rc::downgrade(core);
        input.enable_cancel(move || {
            with_upgraded(&weak, |core| core.cancel_flow(id))
                .unwrap_or(CancelOutcome::Discarded)
        });

        this.flows.insert(id, QueueFlow {
            input: input.clone(),
            priority,
            finish: None,
            waiting: None,
            suspended: false,
        });
        (id, input)
    }

    fn on_flow_send(&mut self, id: FlowId, packet: Bytes) {
        let Some(flow) = self.flows.get_mut(&id) else {
            return;
        };
        if self.freeing {
            flow.input.done();
            return;
        }

        let seq = self.arrival_seq;
        self.arrival_seq += 1;

        let key = match &self.discipline {
            Discipline::Fair { clock } => {
                let start = flow.finish.unwrap_or(*clock);
                flow.finish = Some(start + packet.len() as u64);
                (start, seq)
            }
            Discipline::Priority => (flow.priority, seq),
        };
        trace!("queue: flow {} enqueued {} bytes with key {:?}", id, packet.len(), key);

        flow.waiting = Some((key, packet));
        if !flow.suspended {
            self.index.insert(key, id);
        }
        if self.last_served == Some(id) {
            self.last_served = None;
        }
        self.try_send();
    }

    fn try_send(&mut self) {
        if self.in_output.is_some() || self.last_served.is_some() {
            return;
        }
        let Some((key, id)) = self.index.pop_first() else {
            return;
        };
        let Some((_, packet)) = self.flows.get_mut(&id).and_then(|flow| flow.waiting.take()) else {
            return;
        };

        if let Discipline::Fair { clock } = &mut self.discipline {
            *clock = key.0;
        }
        self.in_output = Some(InOutput::Flow(id));
        self.output.send(packet);
    }

    fn on_output_done(&mut self) {
        if let Some(InOutput::Flow(id)) = self.in_output.take() {
            if let Some(flow) = self.flows.get(&id) {
                flow.input.done();
                self.last_served = Some(id);
            }
        }
        self.job_schedule.set();
    }

    fn on_schedule(&mut self) {
        if let Some(id) = self.last_served {
            match self.flows.get_mut(&id) {
                Some(flow) if flow.input.is_busy() && flow.waiting.is_none() => {
                    // the flow's next packet is on its way
                    self.job_schedule.set();
                    return;
                }
                Some(flow) if flow.waiting.is_none() => {
                    flow.finish = None;
                }
                _ => {}
            }
            self.last_served = None;
        }
        self.try_send();
    }

    /// Takes the flow's packet back from wherever it is
    fn cancel_flow(&mut self, id: FlowId) -> CancelOutcome {
        let Some(flow) = self.flows.get_mut(&id) else {
            return CancelOutcome::Discarded;
        };

        if let Some((key, _)) = flow.waiting.take() {
            self.index.remove(&key);
            flow.finish = None;
            return CancelOutcome::Discarded;
        }

        if matches!(self.in_output, Some(InOutput::Flow(in_output)) if in_output == id) {
            if self.output.has_cancel() {
                let outcome = self.output.cancel();
                self.in_output = None;
                self.job_schedule.set();
                return outcome;
            }
            self.in_output = Some(InOutput::Orphan);
        }
        CancelOutcome::Delivered
    }

    fn remove_flow(&mut self, id: FlowId) {
        self.cancel_flow(id);
        self.flows.remove(&id);
        if self.last_served == Some(id) {
            self.last_served = None;
            self.job_schedule.set();
        }
    }

    fn set_suspended(&mut self, id: FlowId, suspended: bool) {
        let Some(flow) = self.flows.get_mut(&id) else {
            return;
        };
        if flow.suspended == suspended {
            return;
        }
        flow.suspended = suspended;

        if let Some((key, _)) = &flow.waiting {
            if suspended {
                self.index.remove(key);
            }
            else {
                self.index.insert(*key, id);
                self.try_send();
            }
        }
    }

    fn prepare_free(&mut self) {
        self.freeing = true;
        for flow in self.flows.values_mut() {
            if flow.waiting.take().is_some() {
                flow.input.done();
            }
        }
        self.index.clear();
        self.last_served = None;
    }

    fn is_flow_busy(&self, id: FlowId) -> bool {
        self.flows.get(&id)
            .map(|flow| flow.input.is_busy())
            .unwrap_or(false)
    }
}


/// Byte-fair multiplexer of PP flows onto one PP output
pub struct PacketPassFairQueue {
    core: Rc<RefCell<QueueCore>>,
}

impl PacketPassFairQueue {
    pub fn new(reactor: &Reactor, output: &PacketPassInterface) -> PacketPassFairQueue {
        PacketPassFairQueue {
            core: QueueCore::new(reactor, output, Discipline::Fair { clock: 0 }),
        }
    }

    pub fn mtu(&self) -> usize {
        self.core.borrow().output.mtu()
    }

    /// From now on, packets sent to any flow are completed without reaching the output, so
    ///  that flows can be freed in any order.
    pub fn prepare_free(&self) {
        self.core.borrow_mut().prepare_free();
    }
}

/// One input of a [`PacketPassFairQueue`]. Dropping it frees the flow, even while its packet
///  is in flight.
pub struct PacketPassFairQueueFlow {
    flow: QueueFlowHandle,
}

impl PacketPassFairQueueFlow {
    pub fn new(queue: &PacketPassFairQueue) -> PacketPassFairQueueFlow {
        PacketPassFairQueueFlow {
            flow: QueueFlowHandle::new(&queue.core, 0),
        }
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.flow.input
    }

    pub fn is_busy(&self) -> bool {
        self.flow.is_busy()
    }

    /// A suspended flow keeps its packet (and its place on the byte clock) but is not served.
    pub fn suspend(&self) {
        self.flow.set_suspended(true);
    }

    pub fn resume(&self) {
        self.flow.set_suspended(false);
    }
}


/// Strict-priority multiplexer of PP flows onto one PP output
pub struct PacketPassPriorityQueue {
    core: Rc<RefCell<QueueCore>>,
}

impl PacketPassPriorityQueue {
    pub fn new(reactor: &Reactor, output: &PacketPassInterface) -> PacketPassPriorityQueue {
        PacketPassPriorityQueue {
            core: QueueCore::new(reactor, output, Discipline::Priority),
        }
    }

    pub fn mtu(&self) -> usize {
        self.core.borrow().output.mtu()
    }

    pub fn prepare_free(&self) {
        self.core.borrow_mut().prepare_free();
    }
}

pub struct PacketPassPriorityQueueFlow {
    flow: QueueFlowHandle,
}

impl PacketPassPriorityQueueFlow {
    /// Lower numbers are served first
    pub fn new(queue: &PacketPassPriorityQueue, priority: u32) -> PacketPassPriorityQueueFlow {
        PacketPassPriorityQueueFlow {
            flow: QueueFlowHandle::new(&queue.core, priority.into()),
        }
    }

    pub fn input(&self) -> &PacketPassInterface {
        &self.flow.input
    }

    pub fn is_busy(&self) -> bool {
        self.flow.is_busy()
    }

    pub fn suspend(&self) {
        self.flow.set_suspended(true);
    }

    pub fn resume(&self) {
        self.flow.set_suspended(false);
    }
}


struct QueueFlowHandle {
    core: Weak<RefCell<QueueCore>>,
    id: FlowId,
    input: PacketPassInterface,
}

impl QueueFlowHandle {
    fn new(core: &Rc<RefCell<QueueCore>>, priority: u64) -> QueueFlowHandle {
        let (id, input) = QueueCore::add_flow(core, priority);
        QueueFlowHandle {
            core: Rc::downgrade(core),
            id,
            input,
        }
    }

    fn is_busy(&self) -> bool {
        with_upgraded(&self.core, |core| core.is_flow_busy(self.id))
            .unwrap_or(false)
    }

    fn set_suspended(&self, suspended: bool) {
        with_upgraded(&self.core, |core| core.set_suspended(self.id, suspended));
    }
}

impl Drop for QueueFlowHandle {
    fn drop(&mut self) {
        with_upgraded(&self.core, |core| core.remove_flow(self.id));
    }
}
