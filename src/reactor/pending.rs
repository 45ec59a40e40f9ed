use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::reactor::Reactor;
use crate::util::handler::Handler;

/// FIFO of deferred jobs.
///
/// Jobs are stored by weak reference together with the generation they were scheduled with.
///  Unsetting or re-setting a job bumps its generation, so stale queue entries are skipped
///  when they reach the front rather than being searched for.
#[derive(Default)]
pub struct PendingGroup {
    queue: RefCell<VecDeque<(u64, Weak<JobEntry>)>>,
}

impl PendingGroup {
    pub fn new() -> Rc<PendingGroup> {
        Rc::new(PendingGroup::default())
    }

    pub fn has_jobs(&self) -> bool {
        let mut queue = self.queue.borrow_mut();
        while let Some((generation, job)) = queue.front() {
            if let Some(job) = job.upgrade() {
                if job.is_scheduled_as(*generation) {
                    return true;
                }
            }
            queue.pop_front();
        }
        false
    }

    /// Runs the first pending job, returning `false` if there was none.
    pub fn execute_job(&self) -> bool {
        let Some(job) = self.pop_job() else {
            return false;
        };

        job.pending.set(false);
        job.handler.call(());
        true
    }

    fn pop_job(&self) -> Option<Rc<JobEntry>> {
        let mut queue = self.queue.borrow_mut();
        while let Some((generation, job)) = queue.pop_front() {
            if let Some(job) = job.upgrade() {
                if job.is_scheduled_as(generation) {
                    return Some(job);
                }
            }
        }
        None
    }

    fn push(&self, generation: u64, job: Weak<JobEntry>) {
        self.queue.borrow_mut().push_back((generation, job));
    }
}

struct JobEntry {
    group: Weak<PendingGroup>,
    pending: Cell<bool>,
    generation: Cell<u64>,
    handler: Handler<()>,
}

impl JobEntry {
    fn is_scheduled_as(&self, generation: u64) -> bool {
        self.pending.get() && self.generation.get() == generation
    }
}

/// A deferred job. Dropping it removes it from its group.
pub struct PendingJob {
    entry: Rc<JobEntry>,
}

impl PendingJob {
    pub fn new(reactor: &Reactor, handler: impl FnMut() + 'static) -> PendingJob {
        PendingJob::new_in(reactor.pending_group(), handler)
    }

    pub fn new_in(group: &Rc<PendingGroup>, mut handler: impl FnMut() + 'static) -> PendingJob {
        PendingJob {
            entry: Rc::new(JobEntry {
                group: Rc::downgrade(group),
                pending: Cell::new(false),
                generation: Cell::new(0),
                handler: Handler::new(move |_| handler()),
            }),
        }
    }

    /// (Re-)schedules the job at the end of the queue.
    pub fn set(&self) {
        let Some(group) = self.entry.group.upgrade() else {
            return;
        };

        let generation = self.entry.generation.get() + 1;
        self.entry.generation.set(generation);
        self.entry.pending.set(true);
        group.push(generation, Rc::downgrade(&self.entry));
    }

    /// No-op if the job is not pending.
    pub fn unset(&self) {
        if self.entry.pending.replace(false) {
            self.entry.generation.set(self.entry.generation.get() + 1);
        }
    }

    pub fn is_set(&self) -> bool {
        self.entry.pending.get()
    }
}
