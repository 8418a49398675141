//! Conservation and causality checks shared by both evolution regimes.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{error, warn};

use crate::config::EngineConfig;
use crate::constants::{AXIS_PERIOD, NEGLIGIBLE_ENERGY};
use crate::coord::QuantizedCoordinate;
use crate::error::FieldError;
use crate::index::SpatialIndex;

/// A node whose update was abandoned. The node keeps its prior state; every
/// other node in the pass still steps.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeFailure {
    pub coord: QuantizedCoordinate,
    pub error: FieldError,
}

/// One before/after comparison of total field energy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ConservationSample {
    pub before: f64,
    pub after: f64,
    pub relative_error: f64,
    /// Drift exceeded the tolerance and was logged.
    pub logged: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct ConservationMonitor {
    tolerance: f64,
    ceiling: f64,
}

impl ConservationMonitor {
    pub fn new(tolerance: f64, ceiling: f64) -> Self {
        Self { tolerance, ceiling }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.conservation_tolerance, config.conservation_ceiling)
    }

    pub fn relative_error(before: f64, after: f64) -> f64 {
        if before.abs() <= f64::MIN_POSITIVE {
            return (after - before).abs();
        }
        ((after - before) / before).abs()
    }

    /// Compare totals. Drift over tolerance is soft: logged, never fatal.
    pub fn measure(&self, stage: &str, before: f64, after: f64) -> ConservationSample {
        let relative_error = Self::relative_error(before, after);
        let logged = !relative_error.is_finite() || relative_error > self.tolerance;
        if logged {
            let err = FieldError::ConservationError {
                relative_error,
                halvings: 0,
            };
            warn!(stage, before, after, "{err}");
        }
        ConservationSample {
            before,
            after,
            relative_error,
            logged,
        }
    }

    /// Raw numerical error past this point rejects the step.
    pub fn rejects(&self, raw_relative_error: f64) -> bool {
        !raw_relative_error.is_finite() || raw_relative_error > self.ceiling
    }
}

/// Largest per-axis propagation velocity over evolving nodes.
pub fn max_velocity(index: &SpatialIndex) -> [f64; 3] {
    let mut vmax = [0.0f64; 3];
    for (_, cell) in index.iter() {
        if cell.is_frozen() {
            continue;
        }
        for (m, v) in vmax.iter_mut().zip(cell.excitation().velocity) {
            *m = m.max(v.abs());
        }
    }
    vmax
}

/// Per-axis causality bound for one step: `ceil(v_max · dt)`, at least one cell.
pub fn causal_reach(vmax: [f64; 3], dt: f64) -> [i32; 3] {
    vmax.map(|v| ((v * dt).ceil() as i32).max(1))
}

/// Records which cells carried energy before a step, then checks that every
/// cell that lit up during the step sits within reach of one of them.
///
/// Violations are reported, never corrected.
pub struct CausalityGuard {
    sources: Vec<QuantizedCoordinate>,
    lit: HashSet<QuantizedCoordinate>,
    reach: [i32; 3],
}

impl CausalityGuard {
    pub fn capture(index: &SpatialIndex, dt: f64) -> Self {
        let sources: Vec<QuantizedCoordinate> = index
            .iter()
            .filter(|(_, c)| !c.is_frozen() && c.excitation().stored_energy() > NEGLIGIBLE_ENERGY)
            .map(|(_, c)| c.coord())
            .collect();
        Self {
            lit: sources.iter().copied().collect(),
            sources,
            reach: causal_reach(max_velocity(index), dt),
        }
    }

    pub fn reach(&self) -> [i32; 3] {
        self.reach
    }

    pub fn check(&self, index: &SpatialIndex) -> Vec<FieldError> {
        let mut violations = Vec::new();
        for (_, cell) in index.iter() {
            let coord = cell.coord();
            if cell.is_frozen()
                || self.lit.contains(&coord)
                || cell.excitation().stored_energy() <= NEGLIGIBLE_ENERGY
            {
                continue;
            }
            let within = |d: &[i32; 3]| (0..3).all(|k| d[k] <= self.reach[k]);
            let nearest = self
                .sources
                .iter()
                .map(|s| coord.distances(*s))
                .min_by_key(|d| d.iter().copied().max().unwrap_or(0));
            match nearest {
                Some(d) if within(&d) => {}
                Some(d) => violations.push(self.violation(coord, d)),
                None => violations.push(self.violation(coord, [AXIS_PERIOD / 2; 3])),
            }
        }
        violations
    }

    fn violation(&self, coord: QuantizedCoordinate, distance: [i32; 3]) -> FieldError {
        let err = FieldError::CausalityViolation {
            coord,
            distance,
            bound: self.reach,
        };
        error!("{err}");
        err
    }
}
