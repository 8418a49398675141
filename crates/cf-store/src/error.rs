use cf_core::QuantizedCoordinate;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Optimistic concurrency check failed: someone else wrote the row.
    #[error("field state of {entity_id} is at version {found}, expected {expected}")]
    Conflict {
        entity_id: Uuid,
        expected: u64,
        found: u64,
    },

    /// A snapshot save found a cell written since the snapshot's baseline.
    #[error("cell {coordinate} is at version {found}, expected {expected}")]
    CellConflict {
        coordinate: QuantizedCoordinate,
        expected: u64,
        found: u64,
    },
}

impl StoreError {
    /// Stale-write errors that reloading and retrying can resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::CellConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
