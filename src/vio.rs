//! `data_vio`: one in-flight logical-block write.
//!
//! The VIO write path itself - compression, packing, the physical write,
//! the block-map update - is an external collaborator (spec §1 scope).
//! This module defines the data the hash lock engine and recovery
//! journal observe and mutate on that object, plus [`VioId`], the stable
//! handle used everywhere else in this crate instead of a raw reference
//! (see the "Cyclic references" design note: a `data_vio` points at its
//! `hash_lock` and vice versa, so ownership is handle-based, not
//! reference-based).

use std::collections::HashMap;

use crate::error::VdoError;
use crate::types::{
    ChunkName, DuplicateLocation, HashZoneId, JournalOperation, JournalPoint, LogicalZoneId,
    MappingState, PhysicalBlockNumber, PhysicalZoneId, SequenceNumber,
};

/// Opaque handle to a [`DataVio`], stable for the VIO's lifetime.
/// Assigned by the caller (the VIO write path); this crate never
/// allocates one itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct VioId(pub u64);

/// One in-flight logical-block write.
#[derive(Clone, Debug)]
pub struct DataVio {
    pub id: VioId,

    /// Content hash of the data being written.
    pub chunk_name: ChunkName,

    /// The PBN this write already owns from allocation, if any. A
    /// data_vio with no allocation can only dedupe; it cannot become the
    /// WRITING agent (see "agent selection").
    pub allocation: Option<PhysicalBlockNumber>,

    /// Where the write ultimately landed: compressed slot or whole
    /// block. Populated once WRITING completes.
    pub new_mapping: Option<MappingState>,

    /// The index-returned or lock-verified dedupe target.
    pub duplicate: Option<DuplicateLocation>,

    /// True once a duplicate candidate has been accepted as the write's
    /// actual target (post-LOCKING tie-break, or post-VERIFYING).
    pub is_duplicate: bool,

    /// Back-pointer to the hash_lock this data_vio is bound to, if any.
    /// `None` means dedupe is disabled for this write (hash collision,
    /// or it was ejected from a lock by an error).
    pub hash_lock: Option<crate::dedupe::hash_lock::HashLockId>,

    pub hash_zone: HashZoneId,
    pub logical_zone: LogicalZoneId,
    pub physical_zone: Option<PhysicalZoneId>,

    /// The journal point this write was assigned on admission to the
    /// recovery journal; `None` until `add_entry` succeeds.
    pub journal_point: Option<JournalPoint>,

    /// Non-zero while this data_vio holds an uncommitted journal entry
    /// lock (spec §3: "recovery sequence number (0 if unlocked)").
    pub recovery_sequence_number: SequenceNumber,

    /// Set by `continue_on_error`-style cancellation; surfaces at the
    /// caller's registered callback per spec §7 propagation.
    pub result: Option<VdoError>,
}

impl DataVio {
    pub fn new(id: VioId, chunk_name: ChunkName, hash_zone: HashZoneId, logical_zone: LogicalZoneId) -> Self {
        Self {
            id,
            chunk_name,
            allocation: None,
            new_mapping: None,
            duplicate: None,
            is_duplicate: false,
            hash_lock: None,
            hash_zone,
            logical_zone,
            physical_zone: None,
            journal_point: None,
            recovery_sequence_number: 0,
            result: None,
        }
    }

    pub fn has_allocation(&self) -> bool {
        self.allocation.is_some()
    }

    pub fn fail(&mut self, error: VdoError) {
        self.result = Some(error);
    }

    pub fn has_failed(&self) -> bool {
        self.result.is_some()
    }
}

/// The journal entry a completed write (or overwrite) produces.
#[derive(Clone, Copy, Debug)]
pub struct JournalEntry {
    pub operation: JournalOperation,
    pub pbn: PhysicalBlockNumber,
    pub mapping: Option<MappingState>,
}

/// In-memory table of in-flight `data_vio`s, keyed by [`VioId`]. Owned by
/// the caller in production (the VIO write path); this crate's own tests
/// use it as the obvious fake.
#[derive(Default)]
pub struct VioTable {
    vios: HashMap<VioId, DataVio>,
}

impl VioTable {
    pub fn new() -> Self {
        Self { vios: HashMap::new() }
    }

    pub fn insert(&mut self, vio: DataVio) {
        self.vios.insert(vio.id, vio);
    }

    pub fn get(&self, id: VioId) -> Option<&DataVio> {
        self.vios.get(&id)
    }

    pub fn get_mut(&mut self, id: VioId) -> Option<&mut DataVio> {
        self.vios.get_mut(&id)
    }

    pub fn remove(&mut self, id: VioId) -> Option<DataVio> {
        self.vios.remove(&id)
    }
}
