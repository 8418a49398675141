//! Nearest-neighbour coupling.
//!
//! Each pass reads every evolving node and its materialized neighbours from
//! the index as it stood before the pass (a Jacobi update), so nodes are
//! independent and the pass runs in parallel. Writes happen afterwards, one
//! node at a time.
//!
//! Coupling update per node, with `κ̄` the mean of both endpoints' coupling
//! along the edge's axis:
//!
//! ```text
//! ψ' = (1 − ½dt²·Σκ̄²)·ψ − i·dt·Σκ̄·ψ_j
//! ```
//!
//! followed by a self-phase rotation proportional to the node's stored energy
//! and exponential decay. The only legitimate energy exchange is the
//! antisymmetric flux `2dt·Σκ̄·Im(ψ̄·ψ_j)`; whatever else the truncated update
//! gains or loses is banked into the node's vacuum baseline and reported as
//! the pass's raw numerical error.

use std::time::Instant;

use num_complex::Complex64;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::coord::QuantizedCoordinate;
use crate::error::{FieldError, Result};
use crate::excitation::FieldExcitation;
use crate::guard::{CausalityGuard, ConservationMonitor, ConservationSample, NodeFailure};
use crate::index::{NodeHandle, SpatialIndex};

#[derive(Clone, Debug)]
pub struct LocalStepReport {
    /// Requested timestep.
    pub dt: f64,
    /// Passes actually applied (`2^halvings` when a step had to be split).
    pub passes: u32,
    /// Deepest dt halving used.
    pub halvings: u32,
    pub nodes_stepped: usize,
    /// Largest raw relative numerical error over the applied passes.
    pub raw_error: f64,
    pub conservation: ConservationSample,
    pub failures: Vec<NodeFailure>,
    pub causality_violations: Vec<FieldError>,
    pub elapsed_us: f64,
}

struct NodeUpdate {
    handle: NodeHandle,
    coord: QuantizedCoordinate,
    next: Option<FieldExcitation>,
    residual: f64,
}

struct Pass {
    updates: Vec<NodeUpdate>,
    raw_error: f64,
}

#[derive(Default)]
struct Applied {
    passes: u32,
    halvings: u32,
    nodes_stepped: usize,
    raw_error: f64,
    failures: Vec<NodeFailure>,
    violations: Vec<FieldError>,
}

/// Advance every non-frozen node by `dt`.
///
/// If a pass's raw numerical error exceeds the conservation ceiling it is
/// discarded and replaced by two passes at `dt / 2`, recursively, up to
/// `max_dt_halvings`. Past that the whole step is rolled back and fails
/// with `ConservationError`.
pub fn step_local(
    index: &mut SpatialIndex,
    dt: f64,
    config: &EngineConfig,
) -> Result<LocalStepReport> {
    let start = Instant::now();
    let monitor = ConservationMonitor::from_config(config);
    let before = index.total_energy();
    let snapshot: Vec<(NodeHandle, FieldExcitation, u64)> = index
        .iter()
        .map(|(h, c)| (h, c.excitation().clone(), c.version()))
        .collect();

    let mut applied = Applied::default();
    if let Err(err) = step_halving(index, dt, config, &monitor, 0, &mut applied) {
        for (handle, excitation, version) in snapshot {
            index.reset(handle, excitation, version);
        }
        return Err(err);
    }

    let conservation = monitor.measure("local", before, index.total_energy());
    Ok(LocalStepReport {
        dt,
        passes: applied.passes,
        halvings: applied.halvings,
        nodes_stepped: applied.nodes_stepped,
        raw_error: applied.raw_error,
        conservation,
        failures: applied.failures,
        causality_violations: applied.violations,
        elapsed_us: start.elapsed().as_secs_f64() * 1e6,
    })
}

fn step_halving(
    index: &mut SpatialIndex,
    dt: f64,
    config: &EngineConfig,
    monitor: &ConservationMonitor,
    depth: u32,
    applied: &mut Applied,
) -> Result<()> {
    let pass = compute_pass(index, dt, config);
    if monitor.rejects(pass.raw_error) {
        if depth >= config.max_dt_halvings {
            return Err(FieldError::ConservationError {
                relative_error: pass.raw_error,
                halvings: depth,
            });
        }
        warn!(
            dt,
            raw_error = pass.raw_error,
            depth = depth + 1,
            "local step rejected, retrying at dt/2"
        );
        step_halving(index, dt / 2.0, config, monitor, depth + 1, applied)?;
        return step_halving(index, dt / 2.0, config, monitor, depth + 1, applied);
    }

    let guard = CausalityGuard::capture(index, dt);
    applied.raw_error = applied.raw_error.max(pass.raw_error);
    applied.halvings = applied.halvings.max(depth);
    applied.passes += 1;
    for update in pass.updates {
        match update.next {
            Some(next) => {
                if let Some(slot) = index.write(update.handle) {
                    *slot = next;
                    slot.vacuum_energy -= update.residual;
                }
                applied.nodes_stepped += 1;
            }
            None => applied.failures.push(NodeFailure {
                coord: update.coord,
                error: FieldError::NonFinite {
                    coord: update.coord,
                },
            }),
        }
    }
    applied.violations.extend(guard.check(index));
    debug!(dt, depth, "local pass applied");
    Ok(())
}

/// Compute every node's next state from the current index without writing.
fn compute_pass(index: &SpatialIndex, dt: f64, config: &EngineConfig) -> Pass {
    let targets: Vec<(NodeHandle, QuantizedCoordinate)> = index
        .iter()
        .filter(|(_, c)| !c.is_frozen())
        .map(|(h, c)| (h, c.coord()))
        .collect();

    let updates: Vec<NodeUpdate> = targets
        .par_iter()
        .map(|&(handle, coord)| step_node(index, handle, coord, dt, config))
        .collect();

    let total = index.total_energy().max(f64::MIN_POSITIVE);
    let raw: f64 = updates.iter().map(|u| u.residual.abs()).sum();
    let raw_error = if updates.iter().all(|u| u.residual.is_finite()) {
        raw / total
    } else {
        f64::INFINITY
    };
    Pass { updates, raw_error }
}

fn step_node(
    index: &SpatialIndex,
    handle: NodeHandle,
    coord: QuantizedCoordinate,
    dt: f64,
    config: &EngineConfig,
) -> NodeUpdate {
    let failed = NodeUpdate {
        handle,
        coord,
        next: None,
        residual: 0.0,
    };
    let Some(cell) = index.get(handle) else {
        return failed;
    };
    let psi = cell.excitation();

    let mut drive = [Complex64::new(0.0, 0.0); 3];
    let mut kappa_sq = 0.0;
    let mut flux = 0.0;
    for neighbor in index.neighbors(coord) {
        let Some(other) = index.get(neighbor) else {
            continue;
        };
        if other.is_frozen() {
            continue;
        }
        let Some(axis) = coord.distances(other.coord()).iter().position(|d| *d == 1) else {
            continue;
        };
        let kappa = 0.5 * (psi.coupling[axis] + other.excitation().coupling[axis]);
        kappa_sq += kappa * kappa;
        for m in 0..3 {
            let psi_j = other.excitation().amplitudes[m];
            drive[m] += psi_j * kappa;
            flux += 2.0 * dt * kappa * (psi.amplitudes[m].conj() * psi_j).im;
        }
    }

    let mut next = psi.clone();
    let keep = 1.0 - 0.5 * dt * dt * kappa_sq;
    let minus_i_dt = Complex64::new(0.0, -dt);
    for m in 0..3 {
        next.amplitudes[m] = psi.amplitudes[m] * keep + drive[m] * minus_i_dt;
    }
    let residual = next.stored_energy() - psi.stored_energy() - flux;

    next.rotate_phase(config.self_phase_gain * next.stored_energy() * dt);
    next.dissipate((-config.decay_rate * dt).exp());

    if !next.is_finite() || !residual.is_finite() {
        return failed;
    }
    NodeUpdate {
        handle,
        coord,
        next: Some(next),
        residual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at(v: i64, a: i64, e: i64) -> QuantizedCoordinate {
        QuantizedCoordinate::new(v, a, e).unwrap()
    }

    fn quiet() -> EngineConfig {
        EngineConfig {
            decay_rate: 0.0,
            self_phase_gain: 0.0,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_isolated_node_only_self_evolves() {
        let mut index = SpatialIndex::new();
        let h = index
            .materialize(at(0, 0, 0), &FieldExcitation::from_magnitude(1.0))
            .unwrap();
        let config = EngineConfig::default();
        let report = step_local(&mut index, 0.1, &config).unwrap();
        assert_eq!(report.nodes_stepped, 1);
        assert_eq!(report.raw_error, 0.0);

        let ex = index.get(h).unwrap().excitation();
        let expected = (-config.decay_rate * 0.1).exp().powi(2);
        assert_relative_eq!(ex.stored_energy(), expected, epsilon = 1e-12);
        assert_relative_eq!(ex.phase, config.self_phase_gain * 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_pair_exchanges_energy_and_conserves_total() {
        let mut index = SpatialIndex::new();
        let a = index
            .materialize(at(0, 0, 0), &FieldExcitation::from_magnitude(1.0))
            .unwrap();
        let b = index
            .materialize(at(1, 0, 0), &FieldExcitation::vacuum())
            .unwrap();
        let before = index.total_energy();
        let report = step_local(&mut index, 0.1, &quiet()).unwrap();

        let gained = index.get(b).unwrap().excitation().stored_energy();
        assert!(gained > 0.0);
        // |−i·dt·κ·ψ_j|² with |ψ_j| = 1
        assert_relative_eq!(gained, (0.1f64 * 0.1).powi(2), epsilon = 1e-9);
        assert!(index.get(a).unwrap().excitation().stored_energy() < 1.0);
        assert_relative_eq!(index.total_energy(), before, epsilon = 1e-12);
        assert!(!report.conservation.logged);
        assert!(report.causality_violations.is_empty());
    }

    #[test]
    fn test_frozen_nodes_are_skipped() {
        let mut index = SpatialIndex::new();
        let a = index
            .materialize(at(0, 0, 0), &FieldExcitation::from_magnitude(1.0))
            .unwrap();
        let b = index
            .materialize(at(0, 1, 0), &FieldExcitation::vacuum())
            .unwrap();
        index.set_frozen(a, true);
        let frozen_before = index.get(a).unwrap().excitation().clone();

        let report = step_local(&mut index, 0.1, &quiet()).unwrap();
        assert_eq!(report.nodes_stepped, 1);
        assert_eq!(index.get(a).unwrap().excitation(), &frozen_before);
        assert_eq!(index.get(b).unwrap().excitation().stored_energy(), 0.0);
    }

    #[test]
    fn test_large_dt_is_halved() {
        let mut index = SpatialIndex::new();
        let strong = FieldExcitation::from_magnitude(1.0).with_coupling([1.2; 3]);
        index.materialize(at(0, 0, 0), &strong).unwrap();
        index.materialize(at(0, 0, 1), &strong).unwrap();
        let before = index.total_energy();

        let report = step_local(&mut index, 0.5, &quiet()).unwrap();
        assert_eq!(report.halvings, 2);
        assert_eq!(report.passes, 1 << report.halvings);
        assert!(report.raw_error <= quiet().conservation_ceiling);
        assert_relative_eq!(index.total_energy(), before, epsilon = 1e-9);
    }

    #[test]
    fn test_exhausted_halvings_roll_back() {
        let mut index = SpatialIndex::new();
        let wild = FieldExcitation::from_magnitude(1.0).with_coupling([1e6; 3]);
        let h = index.materialize(at(0, 0, 0), &wild).unwrap();
        index.materialize(at(1, 0, 0), &wild).unwrap();
        let before = index.get(h).unwrap().excitation().clone();
        let config = EngineConfig {
            max_dt_halvings: 1,
            ..quiet()
        };

        let err = step_local(&mut index, 1.0, &config).unwrap_err();
        assert!(matches!(err, FieldError::ConservationError { halvings: 1, .. }));
        assert_eq!(index.get(h).unwrap().excitation(), &before);
    }
}
