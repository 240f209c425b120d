//! One hash-zone shard: the map from content hash to [`HashLock`], and
//! every state transition that drives a lock from INITIALIZING through
//! to DESTROYING.
//!
//! All of a zone's locks are mutated only by calls made on this type,
//! which models "runs only on the hash zone's own thread" (spec's
//! concurrency section) - there is no internal locking here because
//! there is nothing to protect against: callers are expected to give
//! each `HashZone` to exactly one thread, the same discipline the
//! `ZoneExecutor` enforces for continuations.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::dedupe::collaborators::DedupeCollaborators;
use crate::dedupe::hash_lock::{HashLock, HashLockId, HashLockState};
use crate::dedupe::wait_queue::WaitQueue;
use crate::types::{ChunkName, DuplicateLocation, HashZoneId, MappingState};
use crate::vio::{DataVio, VioId, VioTable};

/// Per-zone dedupe outcome counters (spec §4.1's "Hash Zone" bookkeeping).
#[derive(Default, Clone, Copy, Debug)]
pub struct HashZoneCounters {
    pub valid_advice: u64,
    pub stale_advice: u64,
    pub collision: u64,
    pub data_match: u64,
}

pub struct HashZone {
    id: HashZoneId,
    locks: HashMap<HashLockId, HashLock>,
    by_chunk_name: HashMap<ChunkName, HashLockId>,
    next_id: u64,
    collaborators: Arc<dyn DedupeCollaborators>,
    counters: HashZoneCounters,
}

impl HashZone {
    pub fn new(id: HashZoneId, collaborators: Arc<dyn DedupeCollaborators>) -> Self {
        Self {
            id,
            locks: HashMap::new(),
            by_chunk_name: HashMap::new(),
            next_id: 0,
            collaborators,
            counters: HashZoneCounters::default(),
        }
    }

    pub fn id(&self) -> HashZoneId {
        self.id
    }

    pub fn counters(&self) -> HashZoneCounters {
        self.counters
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn new_lock_id(&mut self) -> HashLockId {
        let id = HashLockId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Bind `vio_id` to the lock for its chunk name, creating one if
    /// none is registered yet, then drive the lock's state machine.
    ///
    /// `is_collision` is supplied by the caller, which owns the actual
    /// data buffers this crate never sees: `true` means the candidate's
    /// content does not match the lock's existing members' content.
    /// Returns `false` when the write must bypass dedupe entirely
    /// (collision); in that case `vio.hash_lock` is left unset.
    pub fn acquire(&mut self, vios: &mut VioTable, vio_id: VioId, is_collision: bool) -> bool {
        let chunk_name = vios.get(vio_id).expect("unknown vio").chunk_name;
        let (lock_id, is_new) = match self.by_chunk_name.get(&chunk_name).copied() {
            Some(id) => (id, false),
            None => {
                let id = self.new_lock_id();
                self.locks.insert(id, HashLock::new(id, chunk_name));
                self.by_chunk_name.insert(chunk_name, id);
                (id, true)
            }
        };

        if !is_new {
            if is_collision {
                self.counters.collision += 1;
                return false;
            }
            self.counters.data_match += 1;
        }

        self.bind(vios, lock_id, vio_id);
        self.enter(vios, lock_id, vio_id);
        true
    }

    fn bind(&mut self, vios: &mut VioTable, lock_id: HashLockId, vio_id: VioId) {
        self.locks.get_mut(&lock_id).unwrap().members.insert(vio_id);
        if let Some(vio) = vios.get_mut(vio_id) {
            vio.hash_lock = Some(lock_id);
        }
    }

    fn enter(&mut self, vios: &mut VioTable, lock_id: HashLockId, vio_id: VioId) {
        let state = self.locks[&lock_id].state;
        match state {
            HashLockState::Initializing => self.start_querying(lock_id, vios, vio_id),
            HashLockState::Querying
            | HashLockState::Writing
            | HashLockState::Locking
            | HashLockState::Verifying
            | HashLockState::Unlocking
            | HashLockState::Updating => {
                self.locks.get_mut(&lock_id).unwrap().waiters.enqueue(vio_id);
            }
            HashLockState::Deduping => self.launch_dedupe(lock_id, vios, vio_id, false),
            HashLockState::Bypassing | HashLockState::Destroying => {
                warn!(
                    "data_vio joined hash lock {:?} already in {:?}; bypassing dedupe",
                    lock_id, state
                );
                if let Some(vio) = vios.get_mut(vio_id) {
                    vio.is_duplicate = false;
                }
                self.complete(vios, vio_id);
            }
        }
    }

    /// Drive the lock forward after a collaborator call started from
    /// `enter`/a prior `continue_hash_lock` has produced a result on
    /// `vio_id`. A no-op if `vio_id` holds no hash lock.
    pub fn continue_hash_lock(&mut self, vios: &mut VioTable, vio_id: VioId) {
        let lock_id = match vios.get(vio_id).and_then(|v| v.hash_lock) {
            Some(id) => id,
            None => return,
        };
        let state = self.locks[&lock_id].state;
        match state {
            HashLockState::Querying => self.finish_querying(lock_id, vios, vio_id),
            HashLockState::Locking => self.finish_locking(lock_id, vios, vio_id),
            HashLockState::Verifying => self.finish_verifying(lock_id, vios, vio_id),
            HashLockState::Writing => self.finish_writing(lock_id, vios, vio_id),
            HashLockState::Updating => self.finish_updating(lock_id, vios, vio_id),
            HashLockState::Unlocking => self.finish_unlocking(lock_id, vios, vio_id),
            HashLockState::Deduping => self.finish_deduping(lock_id, vios, vio_id),
            HashLockState::Initializing | HashLockState::Bypassing | HashLockState::Destroying => {
                warn!("continue_hash_lock called on bogus state {:?} for lock {:?}", state, lock_id);
                if let Some(vio) = vios.get_mut(vio_id) {
                    vio.fail(crate::error::VdoError::BogusState);
                }
                self.abort_hash_lock(lock_id, vios, vio_id);
            }
        }
    }

    /// Report that `vio_id`'s in-flight collaborator call failed;
    /// unconditionally moves the lock to BYPASSING.
    pub fn continue_hash_lock_on_error(&mut self, vios: &mut VioTable, vio_id: VioId) {
        let lock_id = match vios.get(vio_id).and_then(|v| v.hash_lock) {
            Some(id) => id,
            None => return,
        };
        self.abort_hash_lock(lock_id, vios, vio_id);
    }

    /// Tell the zone a data_vio's write (dedupe or plain) has fully
    /// completed, releasing its membership in whatever hash lock it
    /// still holds. Every data_vio that ever acquired a hash lock must
    /// eventually call this exactly once; a no-op if it holds none.
    pub fn complete(&mut self, vios: &mut VioTable, vio_id: VioId) {
        let lock_id = match vios.get(vio_id).and_then(|v| v.hash_lock) {
            Some(id) => id,
            None => return,
        };
        if let Some(vio) = vios.get_mut(vio_id) {
            vio.hash_lock = None;
        }
        let now_empty = {
            let lock = self.locks.get_mut(&lock_id).unwrap();
            lock.members.remove(&vio_id);
            lock.members.is_empty()
        };
        if now_empty {
            self.locks.get_mut(&lock_id).unwrap().state = HashLockState::Destroying;
            debug!("hash lock {:?} destroyed", lock_id);
            self.unregister(lock_id);
            self.locks.remove(&lock_id);
        }
    }

    fn unregister(&mut self, lock_id: HashLockId) {
        let (registered, chunk_name) = {
            let lock = self.locks.get(&lock_id).unwrap();
            (lock.registered, lock.chunk_name)
        };
        if !registered {
            return;
        }
        self.locks.get_mut(&lock_id).unwrap().registered = false;
        if self.by_chunk_name.get(&chunk_name) == Some(&lock_id) {
            self.by_chunk_name.remove(&chunk_name);
        }
    }

    fn abort_hash_lock(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId) {
        let state = self.locks[&lock_id].state;
        if state == HashLockState::Bypassing {
            self.complete(vios, vio_id);
            return;
        }
        let agent = self.locks[&lock_id].agent;
        if Some(vio_id) != agent {
            let ref_count = self.locks[&lock_id].reference_count();
            if agent.is_some() || ref_count > 1 {
                // Other data_vios still share this lock (necessarily DEDUPING);
                // just drop this one's membership and let it report its error.
                self.complete(vios, vio_id);
                return;
            }
            self.locks.get_mut(&lock_id).unwrap().agent = Some(vio_id);
        }
        self.start_bypassing(lock_id, vios, Some(vio_id));
    }

    fn start_bypassing(&mut self, lock_id: HashLockId, vios: &mut VioTable, agent: Option<VioId>) {
        {
            let lock = self.locks.get_mut(&lock_id).unwrap();
            lock.state = HashLockState::Bypassing;
            lock.update_advice = false;
        }
        self.unregister(lock_id);

        let released: Vec<VioId> = {
            let lock = self.locks.get_mut(&lock_id).unwrap();
            let mut v = Vec::new();
            lock.waiters.notify_all(|w| v.push(w));
            v
        };
        for w in released {
            if let Some(vio) = vios.get_mut(w) {
                vio.is_duplicate = false;
                self.collaborators.write_data_vio(vio);
            }
        }

        let duplicate_lock = self.locks.get_mut(&lock_id).unwrap().duplicate_lock.take();
        if let Some(dup_lock) = duplicate_lock {
            let agent = agent.expect("hash lock holding a duplicate PBN lock must have an agent");
            let duplicate = self.locks[&lock_id].duplicate;
            if let Some(vio) = vios.get_mut(agent) {
                vio.duplicate = duplicate;
            }
            self.collaborators.release_duplicate_pbn(&dup_lock);
            self.complete(vios, agent);
            return;
        }

        if let Some(agent) = agent {
            self.locks.get_mut(&lock_id).unwrap().agent = None;
            if let Some(vio) = vios.get_mut(agent) {
                vio.is_duplicate = false;
                self.collaborators.write_data_vio(vio);
            }
            // membership for `agent` is released later, whenever its plain
            // write completes and the caller calls `complete`.
        }
    }

    fn start_querying(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId) {
        {
            let lock = self.locks.get_mut(&lock_id).unwrap();
            lock.state = HashLockState::Querying;
            lock.agent = Some(vio_id);
        }
        debug!("hash lock {:?} querying for {:?}", lock_id, vio_id);
        let vio = vios.get_mut(vio_id).unwrap();
        self.collaborators.check_for_duplication(vio);
    }

    fn finish_querying(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId) {
        if vios.get(vio_id).unwrap().has_failed() {
            self.abort_hash_lock(lock_id, vios, vio_id);
            return;
        }
        let (is_duplicate, duplicate) = {
            let vio = vios.get(vio_id).unwrap();
            (vio.is_duplicate, vio.duplicate)
        };
        if is_duplicate {
            self.locks.get_mut(&lock_id).unwrap().duplicate = duplicate;
            self.start_locking(lock_id, vios, vio_id);
        } else {
            self.locks.get_mut(&lock_id).unwrap().update_advice = true;
            self.start_writing(lock_id, vios, vio_id);
        }
    }

    fn start_locking(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId) {
        self.locks.get_mut(&lock_id).unwrap().state = HashLockState::Locking;
        let candidate = self.locks[&lock_id]
            .duplicate
            .expect("must have a duplicate candidate before locking");
        let handle = {
            let vio = vios.get_mut(vio_id).unwrap();
            self.collaborators.lock_duplicate_pbn(vio, candidate)
        };
        self.locks.get_mut(&lock_id).unwrap().pending_pbn_lock = handle;
    }

    fn finish_locking(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId) {
        if vios.get(vio_id).unwrap().has_failed() {
            self.locks.get_mut(&lock_id).unwrap().pending_pbn_lock = None;
            self.abort_hash_lock(lock_id, vios, vio_id);
            return;
        }
        let is_duplicate = vios.get(vio_id).unwrap().is_duplicate;
        if !is_duplicate {
            self.locks.get_mut(&lock_id).unwrap().pending_pbn_lock = None;
            self.start_writing(lock_id, vios, vio_id);
            return;
        }

        let handle = self
            .locks
            .get_mut(&lock_id)
            .unwrap()
            .pending_pbn_lock
            .take()
            .expect("a verified duplicate must have acquired a pbn lock");
        self.locks.get_mut(&lock_id).unwrap().duplicate_lock = Some(handle);

        let verified = self.locks[&lock_id].verified;
        if !verified {
            self.start_verifying(lock_id, vios, vio_id);
            return;
        }

        let claimed = {
            let dup = self.locks[&lock_id].duplicate_lock.clone().unwrap();
            let mut guard = dup.lock().unwrap();
            guard.claim_increment()
        };
        if claimed {
            self.start_deduping(lock_id, vios, Some(vio_id), false);
        } else {
            let lock = self.locks.get_mut(&lock_id).unwrap();
            lock.verified = false;
            lock.update_advice = true;
            self.start_unlocking(lock_id, vios, vio_id);
        }
    }

    fn start_verifying(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId) {
        self.locks.get_mut(&lock_id).unwrap().state = HashLockState::Verifying;
        let candidate = self.locks[&lock_id].duplicate.unwrap();
        let vio = vios.get_mut(vio_id).unwrap();
        self.collaborators.verify_duplication(vio, candidate);
    }

    fn finish_verifying(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId) {
        if vios.get(vio_id).unwrap().has_failed() {
            self.abort_hash_lock(lock_id, vios, vio_id);
            return;
        }

        let mut verified = vios.get(vio_id).unwrap().is_duplicate;
        let already_counted = self.locks[&lock_id].verify_counted;
        if !already_counted {
            self.locks.get_mut(&lock_id).unwrap().verify_counted = true;
            if verified {
                self.counters.valid_advice += 1;
            } else {
                self.counters.stale_advice += 1;
            }
        }
        self.locks.get_mut(&lock_id).unwrap().verified = verified;

        if verified {
            let claimed = {
                let dup = self.locks[&lock_id].duplicate_lock.clone().unwrap();
                let mut guard = dup.lock().unwrap();
                guard.claim_increment()
            };
            if !claimed {
                if let Some(vio) = vios.get_mut(vio_id) {
                    vio.is_duplicate = false;
                }
                self.locks.get_mut(&lock_id).unwrap().verified = false;
                verified = false;
            }
        }

        if verified {
            self.start_deduping(lock_id, vios, Some(vio_id), false);
        } else {
            self.locks.get_mut(&lock_id).unwrap().update_advice = true;
            self.start_unlocking(lock_id, vios, vio_id);
        }
    }

    fn start_writing(&mut self, lock_id: HashLockId, vios: &mut VioTable, agent: VioId) {
        self.locks.get_mut(&lock_id).unwrap().state = HashLockState::Writing;

        let has_allocation = vios.get(agent).unwrap().has_allocation();
        let agent = if has_allocation {
            agent
        } else {
            match self.select_writing_agent(lock_id, vios, agent) {
                Some(new_agent) => new_agent,
                None => {
                    self.start_bypassing(lock_id, vios, Some(agent));
                    return;
                }
            }
        };
        self.locks.get_mut(&lock_id).unwrap().agent = Some(agent);

        let has_waiters = !self.locks[&lock_id].waiters.is_empty();
        let vio = vios.get_mut(agent).unwrap();
        if has_waiters {
            self.collaborators.cancel_compression(vio);
        }
        self.collaborators.write_data_vio(vio);
    }

    /// Scan the waiters FIFO for the first one already holding its own
    /// allocation (a data_vio with none cannot become the WRITING
    /// agent). Swaps it in for `current_agent`, which rejoins the
    /// waiters at the head - it arrived first, so it should be served
    /// next once this lock is free again.
    fn select_writing_agent(&mut self, lock_id: HashLockId, vios: &VioTable, current_agent: VioId) -> Option<VioId> {
        let lock = self.locks.get_mut(&lock_id).unwrap();
        let mut skipped = WaitQueue::new();
        let mut found = None;
        while let Some(w) = lock.waiters.dequeue() {
            if vios.get(w).map_or(false, DataVio::has_allocation) {
                found = Some(w);
                break;
            }
            skipped.enqueue(w);
        }
        match found {
            Some(new_agent) => {
                let mut rebuilt = WaitQueue::new();
                rebuilt.enqueue(current_agent);
                skipped.transfer_all_to(&mut rebuilt);
                lock.waiters.transfer_all_to(&mut rebuilt);
                lock.waiters = rebuilt;
                Some(new_agent)
            }
            None => {
                skipped.transfer_all_to(&mut lock.waiters);
                None
            }
        }
    }

    fn finish_writing(&mut self, lock_id: HashLockId, vios: &mut VioTable, agent: VioId) {
        if vios.get(agent).unwrap().has_failed() {
            self.abort_hash_lock(lock_id, vios, agent);
            return;
        }

        let (allocation, new_mapping, zone) = {
            let vio = vios.get(agent).unwrap();
            (vio.allocation, vio.new_mapping, vio.physical_zone)
        };
        {
            let lock = self.locks.get_mut(&lock_id).unwrap();
            let slot = match new_mapping {
                Some(MappingState::Compressed { slot }) => Some(slot),
                _ => None,
            };
            lock.duplicate = Some(DuplicateLocation {
                pbn: allocation.expect("a completed write must have allocated a block"),
                zone: zone.expect("a completed write must know its physical zone"),
                slot,
            });
            lock.verified = true;
            if matches!(new_mapping, Some(MappingState::Compressed { .. })) && lock.registered {
                lock.update_advice = true;
            }
        }

        let has_waiters = !self.locks[&lock_id].waiters.is_empty();
        if has_waiters {
            self.start_deduping(lock_id, vios, Some(agent), true);
            return;
        }

        let update_advice = self.locks[&lock_id].update_advice;
        let has_duplicate_lock = self.locks[&lock_id].duplicate_lock.is_some();
        if update_advice {
            self.start_updating(lock_id, vios, agent);
        } else if has_duplicate_lock {
            self.start_unlocking(lock_id, vios, agent);
        } else {
            self.start_bypassing(lock_id, vios, None);
            self.complete(vios, agent);
        }
    }

    fn start_updating(&mut self, lock_id: HashLockId, vios: &mut VioTable, agent: VioId) {
        debug_assert!(self.locks[&lock_id].verified, "new advice should have been verified");
        debug_assert!(self.locks[&lock_id].update_advice, "should only update advice if needed");
        self.locks.get_mut(&lock_id).unwrap().state = HashLockState::Updating;
        let vio = vios.get_mut(agent).unwrap();
        self.collaborators.update_dedupe_index(vio);
    }

    fn finish_updating(&mut self, lock_id: HashLockId, vios: &mut VioTable, agent: VioId) {
        if vios.get(agent).unwrap().has_failed() {
            self.abort_hash_lock(lock_id, vios, agent);
            return;
        }
        self.locks.get_mut(&lock_id).unwrap().update_advice = false;

        let has_waiters = !self.locks[&lock_id].waiters.is_empty();
        if has_waiters {
            self.start_deduping(lock_id, vios, Some(agent), true);
            return;
        }

        let has_duplicate_lock = self.locks[&lock_id].duplicate_lock.is_some();
        if has_duplicate_lock {
            self.start_unlocking(lock_id, vios, agent);
        } else {
            self.start_bypassing(lock_id, vios, None);
            self.complete(vios, agent);
        }
    }

    fn start_unlocking(&mut self, lock_id: HashLockId, _vios: &mut VioTable, _agent: VioId) {
        self.locks.get_mut(&lock_id).unwrap().state = HashLockState::Unlocking;
        let handle = self
            .locks
            .get_mut(&lock_id)
            .unwrap()
            .duplicate_lock
            .take()
            .expect("must have a duplicate lock to release");
        self.collaborators.release_duplicate_pbn(&handle);
    }

    fn finish_unlocking(&mut self, lock_id: HashLockId, vios: &mut VioTable, agent: VioId) {
        if vios.get(agent).unwrap().has_failed() {
            self.abort_hash_lock(lock_id, vios, agent);
            return;
        }

        let verified = self.locks[&lock_id].verified;
        if !verified {
            // The lock we released was on unverified advice; go write (or
            // compress) a block to dedupe against instead.
            self.start_writing(lock_id, vios, agent);
            return;
        }
        self.locks.get_mut(&lock_id).unwrap().verified = false;

        let has_waiters = !self.locks[&lock_id].waiters.is_empty();
        if has_waiters {
            // A new data_vio arrived while the agent was releasing the PBN
            // lock; it has to re-lock and re-verify the duplicate location.
            let new_agent = self.retire_lock_agent(lock_id, vios, agent);
            self.start_locking(lock_id, vios, new_agent);
            return;
        }

        self.complete(vios, agent);
    }

    fn retire_lock_agent(&mut self, lock_id: HashLockId, vios: &mut VioTable, old_agent: VioId) -> VioId {
        let new_agent = self
            .locks
            .get_mut(&lock_id)
            .unwrap()
            .waiters
            .dequeue()
            .expect("must have a waiter to retire the agent for");
        self.locks.get_mut(&lock_id).unwrap().agent = Some(new_agent);
        self.complete(vios, old_agent);
        new_agent
    }

    fn start_deduping(
        &mut self,
        lock_id: HashLockId,
        vios: &mut VioTable,
        agent: Option<VioId>,
        agent_is_done: bool,
    ) {
        self.locks.get_mut(&lock_id).unwrap().state = HashLockState::Deduping;

        let has_duplicate_lock = self.locks[&lock_id].duplicate_lock.is_some();
        if !has_duplicate_lock {
            let agent_id = agent.expect("self-dedupe transfer needs a finishing agent");
            debug_assert!(agent_is_done, "only a finishing agent can transfer its own allocation lock");
            let handle = {
                let vio = vios.get_mut(agent_id).unwrap();
                self.collaborators.transfer_allocation_lock(vio)
            };
            self.locks.get_mut(&lock_id).unwrap().duplicate_lock = Some(handle);
        }

        self.locks.get_mut(&lock_id).unwrap().agent = None;

        if !agent_is_done {
            let agent_id = agent.expect("a newly admitted agent must be named");
            self.launch_dedupe(lock_id, vios, agent_id, true);
        }

        loop {
            let next = self.locks.get_mut(&lock_id).unwrap().waiters.dequeue();
            match next {
                Some(waiter) => self.launch_dedupe(lock_id, vios, waiter, false),
                None => break,
            }
        }

        if agent_is_done {
            self.finish_deduping(lock_id, vios, agent.unwrap());
        }
    }

    fn launch_dedupe(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId, has_claim: bool) {
        if !has_claim {
            let claimed = {
                let dup = self.locks[&lock_id].duplicate_lock.clone().unwrap();
                let mut guard = dup.lock().unwrap();
                guard.claim_increment()
            };
            if !claimed {
                self.fork_hash_lock(lock_id, vios, vio_id);
                return;
            }
        }

        let duplicate = self.locks[&lock_id].duplicate;
        let dup_lock = self.locks[&lock_id].duplicate_lock.clone().unwrap();
        let vio = vios.get_mut(vio_id).unwrap();
        vio.duplicate = duplicate;
        self.collaborators.share_compressed_write_lock(vio, &dup_lock);
    }

    fn finish_deduping(&mut self, lock_id: HashLockId, vios: &mut VioTable, vio_id: VioId) {
        debug_assert!(self.locks[&lock_id].agent.is_none());
        debug_assert!(self.locks[&lock_id].waiters.is_empty());

        if self.locks[&lock_id].reference_count() > 1 {
            self.complete(vios, vio_id);
            return;
        }

        self.locks.get_mut(&lock_id).unwrap().agent = Some(vio_id);
        let update_advice = self.locks[&lock_id].update_advice;
        if update_advice {
            self.start_updating(lock_id, vios, vio_id);
        } else {
            self.start_unlocking(lock_id, vios, vio_id);
        }
    }

    /// Rollover: `vio_id` lost the race to claim the last increment on
    /// the current duplicate. Register a fresh lock in this lock's
    /// place, move every not-yet-dispatched waiter (plus `vio_id`
    /// itself) onto it, and send `vio_id` off to write a new location
    /// as the new lock's agent.
    fn fork_hash_lock(&mut self, old_lock_id: HashLockId, vios: &mut VioTable, triggering_vio: VioId) {
        let chunk_name = self.locks[&old_lock_id].chunk_name;
        let new_lock_id = self.new_lock_id();
        let mut new_lock = HashLock::new(new_lock_id, chunk_name);

        {
            let old_lock = self.locks.get_mut(&old_lock_id).unwrap();
            old_lock.registered = false;
            old_lock.update_advice = false;
        }
        self.by_chunk_name.insert(chunk_name, new_lock_id);

        let moved_waiters: Vec<VioId> = {
            let old_lock = self.locks.get_mut(&old_lock_id).unwrap();
            let mut v = Vec::new();
            old_lock.waiters.notify_all(|w| v.push(w));
            v
        };

        new_lock.update_advice = true;

        self.locks.get_mut(&old_lock_id).unwrap().members.remove(&triggering_vio);
        new_lock.members.insert(triggering_vio);
        if let Some(vio) = vios.get_mut(triggering_vio) {
            vio.hash_lock = Some(new_lock_id);
            vio.is_duplicate = false;
        }

        for w in moved_waiters {
            self.locks.get_mut(&old_lock_id).unwrap().members.remove(&w);
            new_lock.members.insert(w);
            if let Some(vio) = vios.get_mut(w) {
                vio.hash_lock = Some(new_lock_id);
            }
            new_lock.waiters.enqueue(w);
        }

        new_lock.agent = Some(triggering_vio);
        self.locks.insert(new_lock_id, new_lock);

        debug!("hash lock {:?} forked into {:?} on rollover", old_lock_id, new_lock_id);
        self.start_writing(new_lock_id, vios, triggering_vio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::pbn_lock::{PbnLock, PbnLockHandle};
    use crate::types::{ChunkName, PbnLockType, PhysicalZoneId};
    use std::sync::Mutex as StdMutex;

    fn chunk(byte: u8) -> ChunkName {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        ChunkName(bytes)
    }

    /// A fully scripted fake: every method's outcome for a given
    /// `VioId` is queued up front by the test, so tests can drive the
    /// exact scenarios spec'd out (fresh data, concurrent writers,
    /// valid/stale advice, rollover) without real index or slab state.
    #[derive(Default)]
    struct ScriptedCollaborators {
        advice: StdMutex<HashMap<VioId, Option<DuplicateLocation>>>,
        verify_result: StdMutex<HashMap<VioId, bool>>,
        lock_budget: StdMutex<HashMap<PhysicalBlockNumberKey, u32>>,
        write_result: StdMutex<HashMap<VioId, (u64, MappingState)>>,
        next_pbn: StdMutex<u64>,
    }

    type PhysicalBlockNumberKey = u64;

    impl ScriptedCollaborators {
        fn set_advice(&self, vio: VioId, location: Option<DuplicateLocation>) {
            self.advice.lock().unwrap().insert(vio, location);
        }

        fn set_verify(&self, vio: VioId, matches: bool) {
            self.verify_result.lock().unwrap().insert(vio, matches);
        }

        fn set_increment_budget(&self, pbn: u64, budget: u32) {
            self.lock_budget.lock().unwrap().insert(pbn, budget);
        }

        fn set_write_result(&self, vio: VioId, pbn: u64, mapping: MappingState) {
            self.write_result.lock().unwrap().insert(vio, (pbn, mapping));
        }
    }

    impl DedupeCollaborators for ScriptedCollaborators {
        fn check_for_duplication(&self, vio: &mut DataVio) {
            match self.advice.lock().unwrap().get(&vio.id).copied().flatten() {
                Some(location) => {
                    vio.is_duplicate = true;
                    vio.duplicate = Some(location);
                }
                None => vio.is_duplicate = false,
            }
        }

        fn lock_duplicate_pbn(&self, vio: &mut DataVio, candidate: DuplicateLocation) -> Option<PbnLockHandle> {
            let budget = self.lock_budget.lock().unwrap().get(&candidate.pbn).copied().unwrap_or(1);
            let handle = PbnLock::new_shared(candidate.pbn, candidate.zone, PbnLockType::Read);
            handle.lock().unwrap().set_increment_limit(budget);
            vio.is_duplicate = true;
            Some(handle)
        }

        fn verify_duplication(&self, vio: &mut DataVio, _candidate: DuplicateLocation) {
            vio.is_duplicate = self.verify_result.lock().unwrap().get(&vio.id).copied().unwrap_or(true);
        }

        fn write_data_vio(&self, vio: &mut DataVio) {
            let (pbn, mapping) = self.write_result.lock().unwrap().get(&vio.id).copied().unwrap_or_else(|| {
                let mut next = self.next_pbn.lock().unwrap();
                *next += 1;
                (*next, MappingState::Uncompressed)
            });
            vio.allocation = Some(pbn);
            vio.new_mapping = Some(mapping);
            vio.physical_zone = Some(PhysicalZoneId(0));
        }

        fn cancel_compression(&self, _vio: &mut DataVio) {}

        fn update_dedupe_index(&self, _vio: &mut DataVio) {}

        fn release_duplicate_pbn(&self, _lock: &PbnLockHandle) {}

        fn transfer_allocation_lock(&self, vio: &mut DataVio) -> PbnLockHandle {
            let pbn = vio.allocation.expect("self-dedupe transfer needs an allocation");
            let handle = PbnLock::new_shared(pbn, vio.physical_zone.unwrap(), PbnLockType::Read);
            handle.lock().unwrap().set_increment_limit(1);
            handle
        }

        fn share_compressed_write_lock(&self, vio: &mut DataVio, lock: &PbnLockHandle) {
            vio.duplicate = Some(DuplicateLocation {
                pbn: lock.lock().unwrap().pbn,
                zone: lock.lock().unwrap().owning_zone,
                slot: None,
            });
        }
    }

    fn new_vio(id: u64, chunk_name: ChunkName) -> DataVio {
        DataVio::new(VioId(id), chunk_name, HashZoneId(0), crate::types::LogicalZoneId(0))
    }

    #[test]
    fn fresh_data_with_no_advice_goes_through_query_write_and_update() {
        let collaborators = Arc::new(ScriptedCollaborators::default());
        let mut zone = HashZone::new(HashZoneId(0), collaborators.clone());
        let mut vios = VioTable::new();
        let name = chunk(1);
        vios.insert(new_vio(1, name));

        assert!(zone.acquire(&mut vios, VioId(1), false));
        // QUERYING -> no advice -> WRITING started synchronously inside enter().
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_querying -> start_writing (collaborator ran inline)
        assert_eq!(vios.get(VioId(1)).unwrap().allocation, Some(1));

        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_writing -> update_advice is set -> start_updating
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_updating -> no duplicate lock -> bypass + complete

        assert!(vios.get(VioId(1)).unwrap().hash_lock.is_none());
        assert_eq!(zone.lock_count(), 0);
    }

    #[test]
    fn two_concurrent_writes_of_new_data_collapse_onto_one_write() {
        let collaborators = Arc::new(ScriptedCollaborators::default());
        let mut zone = HashZone::new(HashZoneId(0), collaborators.clone());
        let mut vios = VioTable::new();
        let name = chunk(2);
        vios.insert(new_vio(1, name));
        vios.insert(new_vio(2, name));

        assert!(zone.acquire(&mut vios, VioId(1), false));
        assert_eq!(zone.lock_count(), 1);
        // vio 2 arrives while 1 is still QUERYING: it becomes a waiter, not a second query.
        assert!(zone.acquire(&mut vios, VioId(2), false));
        assert_eq!(zone.lock_count(), 1);

        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_querying: no advice -> start_writing
        assert!(vios.get(VioId(1)).unwrap().has_allocation());

        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_writing: waiters present -> DEDUPING, vio 2 launched
        assert_eq!(vios.get(VioId(2)).unwrap().duplicate.unwrap().pbn, vios.get(VioId(1)).unwrap().allocation.unwrap());

        // vio 2 is a member still (shares the duplicate); completing it leaves vio 1 as the sole member.
        zone.complete(&mut vios, VioId(2));
        assert!(vios.get(VioId(2)).unwrap().hash_lock.is_none());

        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_updating or finish_unlocking depending on advice state
        zone.continue_hash_lock(&mut vios, VioId(1));

        assert_eq!(zone.lock_count(), 0);
    }

    #[test]
    fn valid_advice_is_verified_and_deduped() {
        let collaborators = Arc::new(ScriptedCollaborators::default());
        collaborators.set_advice(VioId(1), Some(DuplicateLocation { pbn: 77, zone: PhysicalZoneId(0), slot: None }));
        collaborators.set_verify(VioId(1), true);
        collaborators.set_increment_budget(77, 5);

        let mut zone = HashZone::new(HashZoneId(0), collaborators.clone());
        let mut vios = VioTable::new();
        vios.insert(new_vio(1, chunk(3)));

        assert!(zone.acquire(&mut vios, VioId(1), false));
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_querying -> start_locking
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_locking -> not verified -> start_verifying
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_verifying -> verified, claimed -> start_deduping -> finish_deduping

        assert_eq!(zone.counters().valid_advice, 1);
        assert_eq!(vios.get(VioId(1)).unwrap().duplicate.unwrap().pbn, 77);

        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_unlocking: no update needed, complete
        assert_eq!(zone.lock_count(), 0);
    }

    #[test]
    fn stale_advice_falls_back_to_writing() {
        let collaborators = Arc::new(ScriptedCollaborators::default());
        collaborators.set_advice(VioId(1), Some(DuplicateLocation { pbn: 9, zone: PhysicalZoneId(0), slot: None }));
        collaborators.set_verify(VioId(1), false);

        let mut zone = HashZone::new(HashZoneId(0), collaborators.clone());
        let mut vios = VioTable::new();
        vios.insert(new_vio(1, chunk(4)));

        assert!(zone.acquire(&mut vios, VioId(1), false));
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_querying -> start_locking
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_locking -> start_verifying
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_verifying: stale -> update_advice, start_unlocking
        assert_eq!(zone.counters().stale_advice, 1);

        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_unlocking: not verified -> start_writing
        assert!(vios.get(VioId(1)).unwrap().has_allocation());

        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_writing -> start_updating (fresh write, no dup lock left)
        zone.continue_hash_lock(&mut vios, VioId(1)); // finish_updating -> bypass + complete
        assert_eq!(zone.lock_count(), 0);
    }

    #[test]
    fn rollover_forks_a_new_lock_when_the_increment_budget_is_exhausted() {
        let collaborators = Arc::new(ScriptedCollaborators::default());
        collaborators.set_advice(VioId(1), Some(DuplicateLocation { pbn: 55, zone: PhysicalZoneId(0), slot: None }));
        collaborators.set_verify(VioId(1), true);
        collaborators.set_increment_budget(55, 1); // only enough for the agent itself

        let mut zone = HashZone::new(HashZoneId(0), collaborators.clone());
        let mut vios = VioTable::new();
        vios.insert(new_vio(1, chunk(5)));
        vios.insert(new_vio(2, chunk(5)));

        assert!(zone.acquire(&mut vios, VioId(1), false));
        zone.continue_hash_lock(&mut vios, VioId(1)); // -> start_locking
        zone.continue_hash_lock(&mut vios, VioId(1)); // -> start_verifying (claims the sole increment for itself)

        // vio 2 joins while the lock is DEDUPING with the budget already exhausted.
        assert!(zone.acquire(&mut vios, VioId(2), false));

        // vio 2 could not claim an increment: it forks onto a brand new lock
        // and becomes that lock's WRITING agent instead of deduping.
        assert!(vios.get(VioId(2)).unwrap().has_allocation());
        assert!(!vios.get(VioId(2)).unwrap().is_duplicate);
    }

    #[test]
    fn hash_collision_bypasses_dedupe_without_binding() {
        let collaborators = Arc::new(ScriptedCollaborators::default());
        let mut zone = HashZone::new(HashZoneId(0), collaborators.clone());
        let mut vios = VioTable::new();
        let name = chunk(6);
        vios.insert(new_vio(1, name));
        vios.insert(new_vio(2, name));

        assert!(zone.acquire(&mut vios, VioId(1), false));
        assert!(!zone.acquire(&mut vios, VioId(2), true));
        assert!(vios.get(VioId(2)).unwrap().hash_lock.is_none());
        assert_eq!(zone.counters().collision, 1);
    }
}
