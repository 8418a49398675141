//! Cognitive field simulation engine.
//!
//! Events are localized excitations of a complex field over a periodic
//! 256³ valence/arousal/epistemic grid. The field lives in a sparse octree
//! that only materializes excited cells, evolves under nearest-neighbour
//! coupling every tick and block-local frequency-domain mixing on a slower
//! cadence, and keeps total energy (amplitudes plus vacuum baselines)
//! conserved. Observation collapses an entity into a short-lived particle
//! and folds the measurement back when its window closes.
//!
//! Zero I/O: persistence, transport and scheduling live in the other crates.

pub mod config;
pub mod constants;
pub mod coord;
pub mod engine;
pub mod error;
pub mod excitation;
pub mod fft;
pub mod global;
pub mod guard;
pub mod index;
pub mod local;
pub mod metrics;
pub mod observe;
pub mod particle;
pub mod wire;

pub use config::EngineConfig;
pub use coord::{Axis, QuantizedCoordinate, Quantizer};
pub use engine::{
    CellSnapshot, EntitySnapshot, ExcitationEvent, FieldEngine, FieldSnapshot, FieldStats,
    Location, RebaseReport, SNAPSHOT_VERSION, SyncBaseline, TickReport, export_json, import_json,
};
pub use error::{FieldError, Result};
pub use excitation::FieldExcitation;
pub use global::{GlobalStepReport, step_global};
pub use guard::{CausalityGuard, ConservationMonitor, ConservationSample, NodeFailure};
pub use index::{Cell, NodeHandle, PruneReport, SpatialIndex};
pub use local::{LocalStepReport, step_local};
pub use metrics::{EngineKind, MetricsSummary, PerformanceMetrics};
pub use observe::{
    CollapsedParticle, EntityPhase, Fold, Measurement, ObservationController, ObservationKind,
    ObservationOutcome, ObservationRequest, ObservationTarget, PhaseEvent, PreparedObservation,
    transition,
};
pub use particle::{ParticleStepReport, step_particles};
pub use wire::{
    ComputeRequest, ComputeResponse, EntityState, EvolvedState, MeasurementResult, ObservationSpec,
};
