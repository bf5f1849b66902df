use thiserror::Error;

use crate::DomainId;

/// Input-validation failures of the ephemeron operations.
///
/// Every variant is reported before any slot is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EphemeronError {
    /// The record belongs to another domain.
    #[error("{op}: record owned by {owner}, called from {caller}")]
    WrongDomain {
        op: &'static str,
        owner: DomainId,
        caller: DomainId,
    },

    /// Key index outside `[0, keys)`.
    #[error("{op}: index {index} out of bounds for {keys} keys")]
    IndexOutOfBounds {
        op: &'static str,
        index: i64,
        keys: usize,
    },

    /// Blit range leaves one of the records' key ranges.
    #[error("{op}: range {offset}..{offset}+{length} out of bounds for {keys} keys")]
    RangeOutOfBounds {
        op: &'static str,
        offset: i64,
        length: i64,
        keys: usize,
    },

    /// Key count negative or too large for one block.
    #[error("{op}: cannot create a record with {requested} keys (max {max})")]
    InvalidSize {
        op: &'static str,
        requested: i64,
        max: usize,
    },
}

impl EphemeronError {
    /// Index and range failures are the same condition to callers.
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(
            self,
            Self::IndexOutOfBounds { .. } | Self::RangeOutOfBounds { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EphemeronError>;
