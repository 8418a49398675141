use thiserror::Error;
use uuid::Uuid;

use crate::coord::QuantizedCoordinate;
use crate::observe::{EntityPhase, PhaseEvent};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("coordinate out of range: [{v}, {a}, {e}]")]
    OutOfRangeCoordinate { v: i64, a: i64, e: i64 },

    #[error("energy not conserved: relative error {relative_error:.3e} after {halvings} dt halvings")]
    ConservationError { relative_error: f64, halvings: u32 },

    #[error("causality violation at {coord}: influence travelled {distance:?} cells, bound {bound:?}")]
    CausalityViolation {
        coord: QuantizedCoordinate,
        distance: [i32; 3],
        bound: [i32; 3],
    },

    #[error("concurrent evolution at {coord}: observed version {expected}, found {found}")]
    ConcurrentEvolutionConflict {
        coord: QuantizedCoordinate,
        expected: u64,
        found: u64,
    },

    #[error("remote compute failed after {attempts} attempts: {message}")]
    RemoteComputeFailure { attempts: u32, message: String },

    #[error("invalid transition: {event:?} while {phase:?}")]
    InvalidTransition { phase: EntityPhase, event: PhaseEvent },

    #[error("non-finite amplitude at {coord}")]
    NonFinite { coord: QuantizedCoordinate },

    #[error("unknown entity: {0}")]
    UnknownEntity(Uuid),
}

impl FieldError {
    pub fn out_of_range(v: i64, a: i64, e: i64) -> Self {
        Self::OutOfRangeCoordinate { v, a, e }
    }
}

pub type Result<T> = std::result::Result<T, FieldError>;
