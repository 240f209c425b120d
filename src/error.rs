//! Error types shared by the hash lock engine and the recovery journal.
//!
//! Most fallible paths here are plumbing (encoding, collaborator errors)
//! and use `anyhow`. The handful of error kinds that callers actually
//! branch on - read-only mode, a rejected admin-state transition, the two
//! fatal journal conditions - get their own `thiserror` variants.

use anyhow::Error;
use thiserror::Error;

/// Errors the dedupe/journal core can report to its callers.
#[derive(Error, Debug)]
pub enum VdoError {
    /// The journal (or the whole VDO) has entered read-only mode; no
    /// further mutation is possible until a fresh rebuild/recovery.
    #[error("vdo is read-only")]
    ReadOnly,

    /// An operation was attempted while the admin state forbids it (e.g.
    /// `add_entry` while SUSPENDING or SAVING).
    #[error("invalid admin state for this operation")]
    AdminStateInvalid,

    /// A decrement could not be admitted because `available_space` was
    /// exhausted; this is always fatal and forces read-only.
    #[error("recovery journal is full")]
    JournalFull,

    /// The journal tail reached the maximum representable sequence
    /// number (2^48); this is always fatal and forces read-only.
    #[error("recovery journal sequence number overflow")]
    JournalOverflow,

    /// `enter`/`continue` was called against a state that does not
    /// support it; this indicates a caller bug, not a runtime fault.
    #[error("hash lock entered in an unsupported state")]
    BogusState,

    /// Everything else (encoding errors, collaborator failures, …).
    #[error("{0}")]
    Other(#[from] Error),
}

pub type VdoResult<T> = Result<T, VdoError>;
