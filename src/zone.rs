//! The per-thread work-queue model described in the design notes: "Async
//! control flow... Implement via explicit continuation records
//! `{target_zone, function, data_vio}` posted into per-thread work
//! queues; there are no stackful coroutines in the design. Callers never
//! block."
//!
//! [`ZoneExecutor`] is the in-process stand-in for that dispatch. Real
//! zone threads (one per hash/physical/logical shard, plus the journal
//! thread) are an external concern; this type exists so the core's own
//! tests can exercise cross-zone hand-offs deterministically without a
//! real thread pool.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::{HashZoneId, LogicalZoneId, PhysicalZoneId};

/// Identifies the thread-affine shard a continuation is posted to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ZoneId {
    Hash(HashZoneId),
    Physical(PhysicalZoneId),
    Logical(LogicalZoneId),
    Journal,
}

/// A unit of work queued for a single zone's thread. Boxed so that
/// unrelated collaborators can post heterogeneous continuations onto the
/// same queue.
pub type Continuation = Box<dyn FnOnce() + Send>;

/// A FIFO work queue per [`ZoneId`], drained round-robin by
/// [`ZoneExecutor::drain_all`]. Not a general-purpose scheduler: there is
/// no preemption and no priority, matching the "run-to-completion
/// callbacks on each thread" model in the spec's concurrency section.
#[derive(Default)]
pub struct ZoneExecutor {
    queues: Mutex<HashMap<ZoneId, VecDeque<Continuation>>>,
}

impl ZoneExecutor {
    pub fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()) }
    }

    /// Post a continuation to run later on `zone`'s thread. Never blocks
    /// and never runs the job inline.
    pub fn post(&self, zone: ZoneId, job: Continuation) {
        self.queues.lock().unwrap().entry(zone).or_default().push_back(job);
    }

    /// Run every job currently queued for `zone`, in FIFO order. Jobs
    /// that post further work (to this or another zone) are not run by
    /// this call; use [`Self::drain_all`] to reach quiescence.
    pub fn drain_zone(&self, zone: ZoneId) {
        loop {
            let job = {
                let mut queues = self.queues.lock().unwrap();
                queues.get_mut(&zone).and_then(VecDeque::pop_front)
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }

    /// Run every queued job, across every zone, until no zone has
    /// pending work. Intended for deterministic test setups; a live
    /// system would never call this since each zone thread drains only
    /// its own queue.
    pub fn drain_all(&self) {
        loop {
            let next = {
                let mut queues = self.queues.lock().unwrap();
                queues.values_mut().find_map(VecDeque::pop_front)
            };
            match next {
                Some(job) => job(),
                None => break,
            }
        }
    }

    /// True if no zone has queued work.
    pub fn is_idle(&self) -> bool {
        self.queues.lock().unwrap().values().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn posted_jobs_run_in_fifo_order_per_zone() {
        let executor = ZoneExecutor::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            executor.post(ZoneId::Hash(HashZoneId(0)), Box::new(move || {
                order.lock().unwrap().push(i);
            }));
        }
        executor.drain_zone(ZoneId::Hash(HashZoneId(0)));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(executor.is_idle());
    }

    #[test]
    fn drain_all_follows_chained_cross_zone_posts() {
        let executor = Arc::new(ZoneExecutor::new());
        let reached = Arc::new(AtomicUsize::new(0));

        let executor2 = executor.clone();
        let reached2 = reached.clone();
        executor.post(ZoneId::Physical(PhysicalZoneId(0)), Box::new(move || {
            reached2.fetch_add(1, Ordering::SeqCst);
            executor2.post(ZoneId::Hash(HashZoneId(0)), Box::new(move || {
                reached2.fetch_add(10, Ordering::SeqCst);
            }));
        }));

        executor.drain_all();
        assert_eq!(reached.load(Ordering::SeqCst), 11);
    }
}
