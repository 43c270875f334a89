//! Fixed-width checkpoint encoding.
//!
//! A checkpoint is the global position of an event across every indexed chain.
//! It is rendered as a 75 character string of zero-padded base-10 fields so
//! that byte-wise comparison of two encoded checkpoints agrees with the
//! semantic ordering of the underlying fields. Encoded checkpoints are what
//! the store persists and what the cross-chain merger compares.

use serde::{Deserialize, Serialize};

/// Width of the block timestamp field in digits.
const TIMESTAMP_DIGITS: usize = 10;
/// Width of the chain id, block number, transaction index and event index
/// fields in digits.
const FIELD_DIGITS: usize = 16;

/// Largest value that fits in the timestamp field.
pub const MAX_TIMESTAMP: u64 = 9_999_999_999;
/// Largest value that fits in a 16 digit field.
pub const MAX_FIELD: u64 = 9_999_999_999_999_999;

/// Total encoded length: 10 + 16 + 16 + 16 + 1 + 16.
pub const CHECKPOINT_LENGTH: usize = 75;

/// Rank of a transaction event within its transaction.
pub const EVENT_TYPE_TRANSACTION: u8 = 2;
/// Rank of a log event within its transaction.
pub const EVENT_TYPE_LOG: u8 = 5;
/// Rank of a trace event within its transaction.
pub const EVENT_TYPE_TRACE: u8 = 7;
/// Rank of a block event. Blocks share the log rank but carry the maximum
/// transaction index so they sort after every transaction in the block.
pub const EVENT_TYPE_BLOCK: u8 = 5;

/// Decomposed checkpoint fields, ordered by significance.
///
/// The derived `Ord` compares fields in declaration order, which is exactly
/// the ordering the encoded form preserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_type: u8,
    pub event_index: u64,
}

/// Checkpoint with every field at zero. Sorts before any real event.
pub const ZERO_CHECKPOINT: Checkpoint = Checkpoint {
    block_timestamp: 0,
    chain_id: 0,
    block_number: 0,
    transaction_index: 0,
    event_type: 0,
    event_index: 0,
};

/// Checkpoint with every field at its maximum. Sorts after any real event.
pub const MAX_CHECKPOINT: Checkpoint = Checkpoint {
    block_timestamp: MAX_TIMESTAMP,
    chain_id: MAX_FIELD,
    block_number: MAX_FIELD,
    transaction_index: MAX_FIELD,
    event_type: 9,
    event_index: MAX_FIELD,
};

impl Checkpoint {
    /// Upper bound checkpoint for a block: every field below the block number
    /// is saturated, so it sorts after all events the block can contain.
    pub fn block_bound(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Self {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: MAX_FIELD,
            event_type: 9,
            event_index: MAX_FIELD,
        }
    }

    /// Encode into the fixed-width string form.
    ///
    /// Panics if any field exceeds its width. Overflow here means the caller
    /// constructed an impossible position, which is a programming error.
    pub fn encode(&self) -> String {
        assert!(
            self.block_timestamp <= MAX_TIMESTAMP
                && self.chain_id <= MAX_FIELD
                && self.block_number <= MAX_FIELD
                && self.transaction_index <= MAX_FIELD
                && self.event_type <= 9
                && self.event_index <= MAX_FIELD,
            "checkpoint field overflow: {:?}",
            self
        );
        format!(
            "{:0tw$}{:0fw$}{:0fw$}{:0fw$}{}{:0fw$}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_type,
            self.event_index,
            tw = TIMESTAMP_DIGITS,
            fw = FIELD_DIGITS,
        )
    }

    /// Decode an encoded checkpoint back into its fields.
    ///
    /// Panics on strings that are not a valid encoding; only this module's
    /// `encode` output should ever reach here.
    pub fn decode(encoded: &str) -> Self {
        assert_eq!(
            encoded.len(),
            CHECKPOINT_LENGTH,
            "checkpoint must be {} chars, got {}",
            CHECKPOINT_LENGTH,
            encoded.len()
        );
        let field = |range: std::ops::Range<usize>| -> u64 {
            encoded[range.clone()]
                .parse::<u64>()
                .unwrap_or_else(|_| panic!("non-numeric checkpoint field at {:?}", range))
        };
        Self {
            block_timestamp: field(0..10),
            chain_id: field(10..26),
            block_number: field(26..42),
            transaction_index: field(42..58),
            event_type: field(58..59) as u8,
            event_index: field(59..75),
        }
    }
}

/// Encoded form of [`ZERO_CHECKPOINT`].
pub fn zero_checkpoint() -> String {
    ZERO_CHECKPOINT.encode()
}

/// Encoded form of [`MAX_CHECKPOINT`].
pub fn max_checkpoint() -> String {
    MAX_CHECKPOINT.encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbitrary(rng: &mut fastrand::Rng) -> Checkpoint {
        Checkpoint {
            block_timestamp: rng.u64(0..=MAX_TIMESTAMP),
            chain_id: rng.u64(0..=MAX_FIELD),
            block_number: rng.u64(0..=MAX_FIELD),
            transaction_index: rng.u64(0..=MAX_FIELD),
            event_type: rng.u8(0..=9),
            event_index: rng.u64(0..=MAX_FIELD),
        }
    }

    #[test]
    fn encode_width_is_fixed() {
        assert_eq!(ZERO_CHECKPOINT.encode().len(), CHECKPOINT_LENGTH);
        assert_eq!(MAX_CHECKPOINT.encode().len(), CHECKPOINT_LENGTH);
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..200 {
            assert_eq!(arbitrary(&mut rng).encode().len(), CHECKPOINT_LENGTH);
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let mut rng = fastrand::Rng::with_seed(11);
        for _ in 0..500 {
            let cp = arbitrary(&mut rng);
            assert_eq!(Checkpoint::decode(&cp.encode()), cp);
        }
        assert_eq!(Checkpoint::decode(&zero_checkpoint()), ZERO_CHECKPOINT);
        assert_eq!(Checkpoint::decode(&max_checkpoint()), MAX_CHECKPOINT);
    }

    #[test]
    fn encoded_order_matches_field_order() {
        let mut rng = fastrand::Rng::with_seed(13);
        for _ in 0..500 {
            let a = arbitrary(&mut rng);
            let b = arbitrary(&mut rng);
            assert_eq!(a.encode().cmp(&b.encode()), a.cmp(&b));
        }
    }

    #[test]
    fn adjacent_fields_tiebreak_in_order() {
        let base = Checkpoint {
            block_timestamp: 5,
            chain_id: 5,
            block_number: 5,
            transaction_index: 5,
            event_type: 5,
            event_index: 5,
        };
        // Bumping a more significant field dominates any less significant one.
        let mut earlier_ts = base;
        earlier_ts.block_timestamp = 4;
        earlier_ts.event_index = MAX_FIELD;
        assert!(earlier_ts.encode() < base.encode());

        let mut later_chain = base;
        later_chain.chain_id = 6;
        later_chain.block_number = 0;
        assert!(later_chain.encode() > base.encode());
    }

    #[test]
    fn block_bound_sorts_after_block_contents() {
        let log = Checkpoint {
            block_timestamp: 100,
            chain_id: 1,
            block_number: 42,
            transaction_index: MAX_FIELD - 1,
            event_type: EVENT_TYPE_TRACE,
            event_index: MAX_FIELD,
        };
        let bound = Checkpoint::block_bound(100, 1, 42);
        assert!(bound.encode() > log.encode());
        let next_block = Checkpoint {
            block_timestamp: 100,
            chain_id: 1,
            block_number: 43,
            transaction_index: 0,
            event_type: EVENT_TYPE_TRANSACTION,
            event_index: 0,
        };
        assert!(bound.encode() < next_block.encode());
    }

    #[test]
    #[should_panic(expected = "checkpoint field overflow")]
    fn overflow_panics() {
        Checkpoint {
            block_timestamp: MAX_TIMESTAMP + 1,
            ..ZERO_CHECKPOINT
        }
        .encode();
    }
}
