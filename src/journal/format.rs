//! The persisted recovery-journal state: what gets written into the
//! super block on a clean save, and what gets compared against the
//! journal's own `recovery_count` on load to reject a stale replay.
//!
//! Layout (little-endian, 33 bytes total): a 4-byte magic, a 2-byte
//! major and 2-byte minor version, the three `u64` fields of version
//! 7.0's payload (`journal_start`, `logical_blocks_used`,
//! `block_map_data_blocks`), and a trailing recovery-count byte.

use anyhow::anyhow;

use crate::error::VdoResult;
use crate::types::SequenceNumber;

pub const RECOVERY_JOURNAL_MAGIC: [u8; 4] = *b"RJ7\0";
pub const FORMAT_MAJOR_VERSION: u16 = 7;
pub const FORMAT_MINOR_VERSION: u16 = 0;

const PAYLOAD_SIZE: usize = 8 * 3;
const HEADER_SIZE: usize = 4 + 2 + 2;
pub const ENCODED_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE + 1;

/// How aggressively the journal flushes committed blocks to disk.
/// `Sync` and `AsyncUnsafe` are treated identically by the reap logic
/// here (both flush before reaping); the distinction between them is
/// solely in whether the *caller's* write acknowledgement waits for
/// that flush, which is outside this crate's scope.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WritePolicy {
    Sync,
    Async,
    AsyncUnsafe,
}

/// The three fields of the version 7.0 on-disk recovery journal state.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RecoveryJournalState7_0 {
    pub journal_start: SequenceNumber,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
}

/// `RecoveryJournalState7_0` plus the recovery-count byte stamped
/// alongside it; together these are what gets written to and read
/// from the super block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EncodedRecoveryJournalState {
    pub state: RecoveryJournalState7_0,
    pub recovery_count: u8,
}

/// `recovery_count & 0xff`, computed once per journal open/recovery
/// and stamped into every block header as well as the super-block
/// state; a mismatch on load means this is a replay of a stale
/// snapshot and must be rejected.
pub fn compute_recovery_count_byte(recovery_count: u64) -> u8 {
    (recovery_count & 0xff) as u8
}

impl EncodedRecoveryJournalState {
    pub fn encode(&self) -> [u8; ENCODED_SIZE] {
        let mut buf = [0u8; ENCODED_SIZE];
        let mut offset = 0;

        buf[offset..offset + 4].copy_from_slice(&RECOVERY_JOURNAL_MAGIC);
        offset += 4;
        buf[offset..offset + 2].copy_from_slice(&FORMAT_MAJOR_VERSION.to_le_bytes());
        offset += 2;
        buf[offset..offset + 2].copy_from_slice(&FORMAT_MINOR_VERSION.to_le_bytes());
        offset += 2;
        buf[offset..offset + 8].copy_from_slice(&self.state.journal_start.to_le_bytes());
        offset += 8;
        buf[offset..offset + 8].copy_from_slice(&self.state.logical_blocks_used.to_le_bytes());
        offset += 8;
        buf[offset..offset + 8].copy_from_slice(&self.state.block_map_data_blocks.to_le_bytes());
        offset += 8;
        buf[offset] = self.recovery_count;

        buf
    }

    /// Decode a super-block payload, rejecting anything whose
    /// recovery-count byte does not match `expected_recovery_count`
    /// (a stale replay) or whose version this crate does not
    /// understand. Never panics on malformed input - always an
    /// `Err`.
    pub fn decode(bytes: &[u8], expected_recovery_count: u8) -> VdoResult<Self> {
        if bytes.len() != ENCODED_SIZE {
            return Err(anyhow!("recovery journal state is {} bytes, expected {}", bytes.len(), ENCODED_SIZE).into());
        }

        let magic = &bytes[0..4];
        if magic != RECOVERY_JOURNAL_MAGIC {
            return Err(anyhow!("bad recovery journal magic").into());
        }

        let major = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let minor = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
        if (major, minor) != (FORMAT_MAJOR_VERSION, FORMAT_MINOR_VERSION) {
            return Err(anyhow!("unsupported recovery journal version {}.{}", major, minor).into());
        }

        let journal_start = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let logical_blocks_used = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let block_map_data_blocks = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let recovery_count = bytes[32];

        if recovery_count != expected_recovery_count {
            return Err(anyhow!(
                "recovery journal recovery-count mismatch: on-disk {} != expected {} (stale replay)",
                recovery_count,
                expected_recovery_count
            )
            .into());
        }

        Ok(Self {
            state: RecoveryJournalState7_0 { journal_start, logical_blocks_used, block_map_data_blocks },
            recovery_count,
        })
    }
}

pub fn decode_write_policy(name: &str) -> VdoResult<WritePolicy> {
    match name {
        "sync" => Ok(WritePolicy::Sync),
        "async" => Ok(WritePolicy::Async),
        "async-unsafe" => Ok(WritePolicy::AsyncUnsafe),
        other => Err(anyhow!("unknown write policy {:?}", other).context("parsing write policy").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let state = EncodedRecoveryJournalState {
            state: RecoveryJournalState7_0 {
                journal_start: 42,
                logical_blocks_used: 1_000_000,
                block_map_data_blocks: 512,
            },
            recovery_count: 7,
        };
        let bytes = state.encode();
        let decoded = EncodedRecoveryJournalState::decode(&bytes, 7).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn rejects_recovery_count_mismatch() {
        let state = EncodedRecoveryJournalState {
            state: RecoveryJournalState7_0::default(),
            recovery_count: 3,
        };
        let bytes = state.encode();
        assert!(EncodedRecoveryJournalState::decode(&bytes, 9).is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(EncodedRecoveryJournalState::decode(&[0u8; 10], 0).is_err());
    }

    #[test]
    fn recovery_count_byte_wraps() {
        assert_eq!(compute_recovery_count_byte(256), 0);
        assert_eq!(compute_recovery_count_byte(257), 1);
    }
}
