/// Lowest valid grid value on every axis.
pub const AXIS_MIN: i16 = -128;

/// Highest valid grid value on every axis.
pub const AXIS_MAX: i16 = 127;

/// Cells per axis. The grid is a torus: AXIS_MAX + 1 wraps to AXIS_MIN.
pub const AXIS_PERIOD: i32 = 256;

/// Octree depth from the root region (256³) down to unit cells.
pub const TREE_DEPTH: u32 = 8;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-12;

/// Stored energy below which a node counts as dark for causality checks.
pub const NEGLIGIBLE_ENERGY: f64 = 1e-18;

/// Default vacuum baseline carried by every materialized node.
pub const VACUUM_ENERGY: f64 = 1e-3;

/// Default per-axis coupling constant (1 / time).
pub const DEFAULT_COUPLING: f64 = 0.1;

/// Default per-axis propagation velocity (cells / time).
pub const DEFAULT_VELOCITY: f64 = 1.0;

/// Default local timestep.
pub const DEFAULT_DT: f64 = 0.1;

/// Relative drift in total energy logged as a conservation error.
pub const CONSERVATION_TOLERANCE: f64 = 1e-9;

/// Relative raw numerical error above which a step is rejected and retried at dt/2.
pub const CONSERVATION_CEILING: f64 = 1e-3;

/// Retries at halved dt before a step is abandoned.
pub const MAX_DT_HALVINGS: u32 = 6;

/// Stored energy below which a node is merged back into vacuum.
pub const PRUNE_THRESHOLD: f64 = 1e-6;

/// How long a collapsed entity stays a particle without further requests.
pub const OBSERVATION_WINDOW: f64 = 1.0;

/// Measurements retained per entity.
pub const MEASUREMENT_HISTORY_LEN: usize = 16;

/// Fraction of amplitude reset toward the measured eigenstate on return.
pub const FOLD_STRENGTH: f64 = 0.5;

/// Collapse probability reported for a vacuum measurement.
pub const VACUUM_COLLAPSE_PROBABILITY: f64 = 0.0;

/// Timing and conservation samples kept per engine.
pub const METRIC_WINDOW: usize = 256;

/// Cross-axis coupling generator (antisymmetric, valence/arousal/epistemic).
/// The global engine rotates axis amplitudes by exp(G · strength · dt).
pub const CROSS_AXIS_GENERATOR: [[f64; 3]; 3] = [
    [0.0, -0.6, 0.2],
    [0.6, 0.0, -0.4],
    [-0.2, 0.4, 0.0],
];
