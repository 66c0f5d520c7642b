//! Error taxonomy shared by the store and the client object manager

use crate::id::ObjectId;
use thiserror::Error;

/// Result alias for store and client operations.
pub type DsoResult<T> = Result<T, DsoError>;

/// Errors crossing the store / client object manager boundary.
///
/// `NotFound` and `Tombstoned` are terminal for that id; `Transport` is the
/// only failure that may be retried blindly. `StaleVersion` asks the caller
/// to refetch and rebuild its change, not to resend it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DsoError {
    /// Id unknown to the store
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// Delta older than the record it targets
    #[error("stale version for {id}: record is at {current}, delta based on {attempted}")]
    StaleVersion {
        /// Target object
        id: ObjectId,
        /// Version currently recorded
        current: u64,
        /// Version the delta was built against
        attempted: u64,
    },

    /// A fault-in named a class nobody registered
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// The id was collected by the distributed garbage collector
    #[error("object was garbage collected: {0}")]
    Tombstoned(ObjectId),

    /// The remote side could not be reached
    #[error("transport failure: {0}")]
    Transport(String),

    /// DNA that does not fit the target's state
    #[error("invalid DNA for {id}: {reason}")]
    InvalidDna {
        /// Target object
        id: ObjectId,
        /// What did not fit
        reason: String,
    },

    /// A collection pass was requested while another is running or GC is disabled
    #[error("garbage collector busy or disabled")]
    GcBusy,

    /// The component is shutting down
    #[error("shutting down")]
    Shutdown,
}

impl DsoError {
    /// Create an invalid-DNA error.
    pub fn invalid_dna(id: ObjectId, reason: impl Into<String>) -> Self {
        Self::InvalidDna {
            id,
            reason: reason.into(),
        }
    }

    /// Whether retrying (after refetching, for `StaleVersion`) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::StaleVersion { .. })
    }

    /// Whether the id involved is gone for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Tombstoned(_) | Self::ClassNotFound(_)
        )
    }
}
