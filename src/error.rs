use thiserror::Error;

/// Failure kinds a caller may want to tell apart. They travel inside
/// `anyhow::Error` and can be recovered with `downcast_ref::<Error>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("page {page} is corrupted: {reason}")]
    Corrupted { page: u32, reason: String },

    #[error("database is corrupted, both marker pages are broken")]
    BothMarkersCorrupted,

    #[error("write operation on a read-only transaction")]
    ReadOnlyTransaction,

    #[error("store is opened read-only")]
    ReadOnlyStore,

    #[error("another write transaction is already active")]
    WriteInProgress,

    #[error("key of {size} bytes exceeds the maximum of {max} bytes")]
    KeyTooLarge { size: usize, max: usize },

    #[error("empty keys are not allowed")]
    EmptyKey,

    #[error("store file is locked by another process")]
    Locked,

    #[error("integrity check failed: {0}")]
    Integrity(String),
}

impl Error {
    pub(crate) fn corrupted(page: u32, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            page,
            reason: reason.into(),
        }
    }
}
