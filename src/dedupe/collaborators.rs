//! The external operations a hash lock drives but does not implement:
//! index queries, PBN locking, verification reads, the write/compress
//! path, and index updates. Grounded on the split the teacher draws
//! between `ReadChunk` (the trait) and `LocalChunkReader` (the one
//! production impl) for its own external collaborator, a chunk store.
//!
//! Every method here is synchronous from this crate's point of view:
//! it mutates the `data_vio` (or hands back a handle) as if the
//! dispatched operation had already completed. The asynchronous,
//! cross-zone nature of the real operations is the caller's problem -
//! modeled here only by the hash lock's own `enter`/`continue_hash_lock`
//! split, which keeps "kick off" and "act on the result" as distinct
//! calls so concurrent waiters remain observable in tests.

use crate::dedupe::pbn_lock::PbnLockHandle;
use crate::types::DuplicateLocation;
use crate::vio::DataVio;

/// Collaborators the hash lock engine calls out to. A production
/// implementation wires these to the dedupe-index client, the slab
/// depot's PBN lock table, and the VIO write path; tests use an
/// in-memory fake (see `hash_lock::tests`).
pub trait DedupeCollaborators {
    /// Query the index for `vio.chunk_name`. On success, sets
    /// `vio.is_duplicate` and `vio.duplicate` if advice was found.
    fn check_for_duplication(&self, vio: &mut DataVio);

    /// Attempt to acquire (or join) a read lock on `candidate`'s PBN so
    /// the block cannot be freed out from under verification. Returns
    /// `None` if the location could no longer be locked (the candidate
    /// has since become unreferenced); sets `vio.is_duplicate = false`
    /// in that case.
    fn lock_duplicate_pbn(&self, vio: &mut DataVio, candidate: DuplicateLocation) -> Option<PbnLockHandle>;

    /// Read back `candidate` and compare it against `vio`'s data,
    /// setting `vio.is_duplicate` to the comparison result.
    fn verify_duplication(&self, vio: &mut DataVio, candidate: DuplicateLocation);

    /// Write (or attempt to compress) `vio`'s data to a fresh physical
    /// block. Sets `vio.allocation` and `vio.new_mapping` on success.
    fn write_data_vio(&self, vio: &mut DataVio);

    /// Cancel a compression attempt already in flight for `vio`
    /// because a new waiter arrived and the agent must now write
    /// uncompressed so other members have something durable to
    /// dedupe against.
    fn cancel_compression(&self, vio: &mut DataVio);

    /// Record `vio`'s duplicate location as the index advice for this
    /// chunk name.
    fn update_dedupe_index(&self, vio: &mut DataVio);

    /// Release a previously acquired duplicate PBN lock.
    fn release_duplicate_pbn(&self, lock: &PbnLockHandle);

    /// Downgrade `vio`'s own (just-written) allocation lock to a read
    /// lock and hand it back so the hash lock can reuse it as the
    /// duplicate lock for self-dedupe against data nobody else had
    /// indexed yet.
    fn transfer_allocation_lock(&self, vio: &mut DataVio) -> PbnLockHandle;

    /// Give `vio` a share of an already-downgraded PBN lock backing a
    /// compressed write, claiming one increment for it.
    fn share_compressed_write_lock(&self, vio: &mut DataVio, lock: &PbnLockHandle);
}
