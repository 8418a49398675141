//! Coherent evolution in the frequency domain.
//!
//! Active nodes are split into causal blocks: axis-aligned tiles of the torus
//! small enough that no two cells in a tile are further apart than the field
//! can propagate in `dt`. Within a block the active amplitudes, taken in
//! linear-index order, form one sequence per axis; each sequence is
//! zero-padded and transformed, the three spectra are mixed by the
//! cross-axis rotation and damped per frequency, then transformed back.
//! Cost per block is O(K log K) in its active count.
//!
//! The rotation is orthogonal, so only damping and the discarded padding
//! remove energy; the loss is banked evenly into the block's vacuum
//! baselines.

use std::collections::BTreeMap;
use std::time::Instant;

use num_complex::Complex64;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::constants::{AXIS_PERIOD, CROSS_AXIS_GENERATOR};
use crate::error::{FieldError, Result};
use crate::excitation::FieldExcitation;
use crate::fft::{bin_frequency, fft, ifft, padded_len};
use crate::guard::{
    CausalityGuard, ConservationMonitor, ConservationSample, NodeFailure, max_velocity,
};
use crate::index::{NodeHandle, SpatialIndex};

#[derive(Clone, Debug)]
pub struct GlobalStepReport {
    pub dt: f64,
    pub halvings: u32,
    pub active_regions: usize,
    pub blocks: usize,
    /// Block edge per axis, in cells.
    pub block_edge: [u32; 3],
    /// Energy moved from amplitudes into vacuum baselines.
    pub damped_energy: f64,
    pub conservation: ConservationSample,
    pub failures: Vec<NodeFailure>,
    pub causality_violations: Vec<FieldError>,
    pub elapsed_us: f64,
}

/// Largest power-of-two block edge `s` with `s - 1 ≤ floor(v·dt)`.
pub fn block_edge(velocity: f64, dt: f64) -> u32 {
    let reach = (velocity * dt).floor();
    if !reach.is_finite() || reach < 1.0 {
        return 1;
    }
    let limit = (reach as u64 + 1).min(AXIS_PERIOD as u64);
    1u32 << (63 - limit.leading_zeros())
}

/// `exp(A)` for `A = G · strength · dt`, by Rodrigues' formula.
pub fn cross_axis_rotation(strength: f64, dt: f64) -> [[f64; 3]; 3] {
    let g = CROSS_AXIS_GENERATOR;
    let scale = strength * dt;
    let mut a = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            a[i][j] = g[i][j] * scale;
        }
    }
    let theta = (a[0][1] * a[0][1] + a[0][2] * a[0][2] + a[1][2] * a[1][2]).sqrt();
    let mut u = [[0.0; 3]; 3];
    for (i, row) in u.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    if theta < 1e-15 {
        return u;
    }
    let s = theta.sin() / theta;
    let c = (1.0 - theta.cos()) / (theta * theta);
    for i in 0..3 {
        for j in 0..3 {
            let a2: f64 = (0..3).map(|k| a[i][k] * a[k][j]).sum();
            u[i][j] += s * a[i][j] + c * a2;
        }
    }
    u
}

struct Snapshot(Vec<(NodeHandle, FieldExcitation, u64)>);

impl Snapshot {
    fn take(index: &SpatialIndex) -> Self {
        Self(
            index
                .iter()
                .map(|(h, c)| (h, c.excitation().clone(), c.version()))
                .collect(),
        )
    }

    fn restore(self, index: &mut SpatialIndex) {
        for (handle, excitation, version) in self.0 {
            index.reset(handle, excitation, version);
        }
    }
}

/// Apply one global evolution step to every non-frozen node.
///
/// The banked update conserves energy by construction; if the measured drift
/// still crosses the ceiling the step is undone and retried at `dt / 2`.
pub fn step_global(
    index: &mut SpatialIndex,
    dt: f64,
    config: &EngineConfig,
) -> Result<GlobalStepReport> {
    let start = Instant::now();
    let monitor = ConservationMonitor::from_config(config);
    let before = index.total_energy();
    let snapshot = Snapshot::take(index);
    match step_halving(index, dt, config, &monitor, 0) {
        Ok(mut report) => {
            report.dt = dt;
            report.conservation = monitor.measure("global", before, index.total_energy());
            report.elapsed_us = start.elapsed().as_secs_f64() * 1e6;
            Ok(report)
        }
        Err(err) => {
            snapshot.restore(index);
            Err(err)
        }
    }
}

fn step_halving(
    index: &mut SpatialIndex,
    dt: f64,
    config: &EngineConfig,
    monitor: &ConservationMonitor,
    depth: u32,
) -> Result<GlobalStepReport> {
    let before = index.total_energy();
    let snapshot = Snapshot::take(index);
    let report = apply_blocks(index, dt, config);
    let drift = ConservationMonitor::relative_error(before, index.total_energy());
    if !monitor.rejects(drift) {
        return Ok(GlobalStepReport {
            halvings: depth,
            ..report
        });
    }

    snapshot.restore(index);
    if depth >= config.max_dt_halvings {
        return Err(FieldError::ConservationError {
            relative_error: drift,
            halvings: depth,
        });
    }
    warn!(dt, drift, depth = depth + 1, "global step rejected, retrying at dt/2");
    let first = step_halving(index, dt / 2.0, config, monitor, depth + 1)?;
    let second = step_halving(index, dt / 2.0, config, monitor, depth + 1)?;
    Ok(merge(first, second))
}

fn merge(mut a: GlobalStepReport, b: GlobalStepReport) -> GlobalStepReport {
    a.halvings = a.halvings.max(b.halvings);
    a.blocks += b.blocks;
    a.damped_energy += b.damped_energy;
    a.failures.extend(b.failures);
    a.causality_violations.extend(b.causality_violations);
    a
}

fn apply_blocks(index: &mut SpatialIndex, dt: f64, config: &EngineConfig) -> GlobalStepReport {
    let guard = CausalityGuard::capture(index, dt);
    let vmax = max_velocity(index);
    let edge = vmax.map(|v| block_edge(v, dt));

    let mut blocks: BTreeMap<[u32; 3], Vec<NodeHandle>> = BTreeMap::new();
    let mut active_regions = 0;
    for handle in index.sorted_handles() {
        let Some(cell) = index.get(handle) else {
            continue;
        };
        if cell.is_frozen() {
            continue;
        }
        let offsets = cell.coord().grid_offsets();
        let key = [
            offsets[0] / edge[0],
            offsets[1] / edge[1],
            offsets[2] / edge[2],
        ];
        blocks.entry(key).or_default().push(handle);
        active_regions += 1;
    }

    let rotation = cross_axis_rotation(config.cross_axis_strength, dt);
    let mut damped_energy = 0.0;
    let mut failures = Vec::new();
    for members in blocks.values() {
        damped_energy += evolve_block(index, members, &rotation, dt, config, &mut failures);
    }

    debug!(
        active_regions,
        blocks = blocks.len(),
        ?edge,
        damped_energy,
        "global pass applied"
    );
    GlobalStepReport {
        dt,
        halvings: 0,
        active_regions,
        blocks: blocks.len(),
        block_edge: edge,
        damped_energy,
        conservation: ConservationSample::default(),
        failures,
        causality_violations: guard.check(index),
        elapsed_us: 0.0,
    }
}

/// Evolve one block and return the energy banked into its vacuum.
fn evolve_block(
    index: &mut SpatialIndex,
    members: &[NodeHandle],
    rotation: &[[f64; 3]; 3],
    dt: f64,
    config: &EngineConfig,
    failures: &mut Vec<NodeFailure>,
) -> f64 {
    let k = members.len();
    let n = padded_len(k);
    let mut spectra = [
        vec![Complex64::new(0.0, 0.0); n],
        vec![Complex64::new(0.0, 0.0); n],
        vec![Complex64::new(0.0, 0.0); n],
    ];
    let mut before = 0.0;
    for (slot, handle) in members.iter().enumerate() {
        if let Some(cell) = index.get(*handle) {
            let ex = cell.excitation();
            before += ex.stored_energy();
            for axis in 0..3 {
                spectra[axis][slot] = ex.amplitudes[axis];
            }
        }
    }

    for spectrum in &mut spectra {
        fft(spectrum);
    }
    for bin in 0..n {
        let f = bin_frequency(bin, n);
        let damp = (-config.global_damping * f * f * dt).exp();
        let v = [spectra[0][bin], spectra[1][bin], spectra[2][bin]];
        for (i, row) in rotation.iter().enumerate() {
            spectra[i][bin] = (v[0] * row[0] + v[1] * row[1] + v[2] * row[2]) * damp;
        }
    }
    for spectrum in &mut spectra {
        ifft(spectrum);
    }

    let mut after = 0.0;
    for (slot, handle) in members.iter().enumerate() {
        let next = [spectra[0][slot], spectra[1][slot], spectra[2][slot]];
        let finite = next.iter().all(|z| z.re.is_finite() && z.im.is_finite());
        let Some(cell) = index.get(*handle) else {
            continue;
        };
        let coord = cell.coord();
        if !finite {
            after += cell.excitation().stored_energy();
            failures.push(NodeFailure {
                coord,
                error: FieldError::NonFinite { coord },
            });
            continue;
        }
        if let Some(ex) = index.write(*handle) {
            ex.amplitudes = next;
            after += ex.stored_energy();
        }
    }

    let lost = before - after;
    let share = lost / k as f64;
    for handle in members {
        if let Some(ex) = index.write(*handle) {
            ex.vacuum_energy += share;
        }
    }
    lost
}
