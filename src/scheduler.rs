//! Procedure admission by lockable-object arbitration.
//!
//! The scheduler is the chief admission gate of the core: workers block in
//! [`next_procedure`](Scheduler::next_procedure) until a queued procedure's
//! lockable-object set is disjoint from every set currently held by a
//! running procedure. Procedures with a common lockable object therefore
//! execute serially across the whole pool, which is the serialisability
//! guarantee the rest of the core builds on.
//!
//! Admission order is FIFO with one exception: a high-priority procedure is
//! admitted ahead of older entries whenever its objects are free. A queued
//! `None` is the shutdown sentinel; it is always admissible, so shutdown
//! drains workers even while lock-blocked procedures remain queued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashSet;
use tokio::sync::Notify;

use crate::procedure::Procedure;

enum Entry {
    Procedure(Arc<Procedure>),
    Sentinel,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<Entry>,
    held: FxHashSet<String>,
}

impl SchedulerState {
    fn conflicts(&self, procedure: &Procedure) -> bool {
        procedure
            .lockable_objects()
            .iter()
            .any(|object| self.held.contains(object))
    }
}

/// Lock-set arbitrated FIFO of procedures awaiting a worker.
#[derive(Default)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    notify: Notify,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one procedure, or the shutdown sentinel (`None`).
    pub fn enqueue_procedure(&self, procedure: Option<Arc<Procedure>>) {
        {
            let mut state = self.lock();
            match procedure {
                Some(procedure) => {
                    tracing::debug!(procedure = %procedure.uuid(), "queueing procedure");
                    state.queue.push_back(Entry::Procedure(procedure));
                }
                None => {
                    tracing::debug!("queueing shutdown sentinel");
                    state.queue.push_back(Entry::Sentinel);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Queue a batch of procedures.
    pub fn enqueue_procedures(&self, procedures: Vec<Arc<Procedure>>) {
        if procedures.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            for procedure in procedures {
                tracing::debug!(procedure = %procedure.uuid(), "queueing procedure");
                state.queue.push_back(Entry::Procedure(procedure));
            }
        }
        self.notify.notify_waiters();
    }

    /// Block until a procedure is admissible given its lockable-object set,
    /// acquire its locks, and return it. `None` means shutdown.
    pub async fn next_procedure(&self) -> Option<Arc<Procedure>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wake-ups before inspecting the queue; an enqueue
            // or a lock release between the check and the await is not lost.
            notified.as_mut().enable();
            if let Some(admitted) = self.try_admit() {
                return admitted;
            }
            notified.await;
        }
    }

    /// Notify the scheduler that a procedure finished so its lockable
    /// objects are released. Tolerates `None` (a worker's first iteration
    /// has no previous procedure).
    pub fn done(&self, procedure: Option<&Procedure>) {
        let Some(procedure) = procedure else {
            return;
        };
        {
            let mut state = self.lock();
            for object in procedure.lockable_objects() {
                state.held.remove(object);
            }
        }
        tracing::debug!(procedure = %procedure.uuid(), "released lockable objects");
        self.notify.notify_waiters();
    }

    /// Entries still queued (procedures and sentinels).
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// One admission attempt. `Some(None)` = sentinel taken, `Some(Some(p))`
    /// = procedure admitted with its locks held, `None` = nothing admissible.
    fn try_admit(&self) -> Option<Option<Arc<Procedure>>> {
        let mut state = self.lock();

        let mut chosen = None;
        for (index, entry) in state.queue.iter().enumerate() {
            if let Entry::Procedure(procedure) = entry {
                if procedure.priority() && !state.conflicts(procedure) {
                    chosen = Some(index);
                    break;
                }
            }
        }
        if chosen.is_none() {
            for (index, entry) in state.queue.iter().enumerate() {
                let admissible = match entry {
                    Entry::Sentinel => true,
                    Entry::Procedure(procedure) => !state.conflicts(procedure),
                };
                if admissible {
                    chosen = Some(index);
                    break;
                }
            }
        }

        let index = chosen?;
        match state.queue.remove(index)? {
            Entry::Sentinel => Some(None),
            Entry::Procedure(procedure) => {
                for object in procedure.lockable_objects() {
                    state.held.insert(object.clone());
                }
                tracing::debug!(procedure = %procedure.uuid(), "admitted procedure");
                Some(Some(procedure))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
