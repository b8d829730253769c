use thiserror::Error;

/// Failures surfaced by the store and the tracker.
///
/// `Storage`, `WorkerGone` and `CorruptTimestamp` are durability-layer
/// failures: the operation aborted and no partial state is visible.
/// `NotFound` marks a referenced id that was required to exist.
/// `InvalidQuality` is a contract violation by the caller; it never touches
/// storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite failure")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    #[error("database worker is gone")]
    WorkerGone,

    #[error("persisted {field} value {value} is not a valid timestamp")]
    CorruptTimestamp { field: &'static str, value: i64 },

    #[error("no session with id {id}")]
    NotFound { id: i64 },

    #[error("quality {quality} is outside 0..=5")]
    InvalidQuality { quality: i32 },

    #[error("session {id} is still in progress and cannot be rated")]
    StillInProgress { id: i64 },
}

pub type Result<T> = std::result::Result<T, StoreError>;
