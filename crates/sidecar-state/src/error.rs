//! Errors raised by state models and the registry.

/// Lifecycle and state-root invariant violations.
///
/// These abort processing of the current block; they are carried inside
/// `eyre::Report` and can be recovered with `downcast_ref`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// A model was asked to handle or commit a block it never set up.
    #[error("accumulator was not initialized for block {0}")]
    BlockNotInitialized(u64),
    /// `setup_state_for_block` was called twice without cleanup.
    #[error("accumulator already initialized for block {0}")]
    BlockAlreadyInitialized(u64),
    /// Two derived rows in one block share a slot id.
    #[error("duplicate slot {0}")]
    DuplicateSlot(String),
    /// Slots handed to the merkleizer were not strictly ascending.
    #[error("slots out of order: {current} follows {previous}")]
    SlotsOutOfOrder { previous: String, current: String },
    /// `end` is non-zero and smaller than `start`.
    #[error("invalid block range; end block {end} must be greater than or equal to start block {start}")]
    InvalidBlockRange { start: u64, end: u64 },
}

/// Whether `err` wraps the given [`StateError`] variant.
pub fn is_state_error(err: &eyre::Report, expected: &StateError) -> bool {
    err.downcast_ref::<StateError>() == Some(expected)
}
