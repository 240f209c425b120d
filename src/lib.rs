//! This crate implements the deduplication-and-journaling core of a
//! block-level deduplicating virtual storage target.
//!
//! Two tightly coupled subsystems make up the hard engineering:
//!
//! * The [`dedupe`] module implements the **Hash Lock Engine**: a
//!   per-content-hash state machine that coordinates concurrent writers of
//!   identical data so that they collapse onto a single index query and a
//!   single physical block reference.
//! * The [`journal`] module implements the **Recovery Journal**: an
//!   on-disk, crash-recoverable append-only log of reference-count deltas
//!   that serializes all block-map and slab-reference changes.
//!
//! Both subsystems are asynchronous and multi-threaded, but each shard
//! (hash zone, physical zone, journal) is single-threaded internally: all
//! mutation of a shard's state happens on that shard's own thread, and
//! cross-shard communication happens only through explicit zone
//! callbacks. See [`zone`] for the in-process stand-in used to model that
//! dispatch.
//!
//! The physical zones, slab depot, block map, VIO write path, packer, and
//! on-disk dedupe-index client are external collaborators. This crate
//! only specifies and consumes the interfaces it needs from them (see
//! [`vio`] and [`dedupe::pbn_lock`]).

pub mod error;
pub mod types;
pub mod vio;
pub mod zone;

pub mod dedupe;
pub mod journal;

pub use error::{VdoError, VdoResult};
