use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_COUPLING, DEFAULT_VELOCITY, VACUUM_ENERGY};

/// Localized excitation of the field at one cell.
///
/// Total energy is `Σ|amplitude|² + vacuum_energy`. Evolution never creates or
/// destroys energy: whatever leaves the amplitudes (decay, damping, numerical
/// residue) is banked into `vacuum_energy`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldExcitation {
    /// One complex amplitude per axis (valence, arousal, epistemic).
    pub amplitudes: [Complex64; 3],
    /// Global phase, advanced by the self-phase update. In `[0, 2π)`.
    pub phase: f64,
    /// Per-axis coupling constants (1 / time).
    pub coupling: [f64; 3],
    /// Per-axis propagation velocity (cells / time).
    pub velocity: [f64; 3],
    /// Energy baseline of the vacuum at this cell.
    pub vacuum_energy: f64,
}

impl Default for FieldExcitation {
    fn default() -> Self {
        Self::vacuum()
    }
}

impl FieldExcitation {
    /// Zero amplitudes on the default baseline.
    pub fn vacuum() -> Self {
        Self {
            amplitudes: [Complex64::new(0.0, 0.0); 3],
            phase: 0.0,
            coupling: [DEFAULT_COUPLING; 3],
            velocity: [DEFAULT_VELOCITY; 3],
            vacuum_energy: VACUUM_ENERGY,
        }
    }

    /// Excitation with |ψ| = `magnitude`, spread evenly across the three axes.
    pub fn from_magnitude(magnitude: f64) -> Self {
        let per_axis = magnitude / 3f64.sqrt();
        Self {
            amplitudes: [Complex64::new(per_axis, 0.0); 3],
            ..Self::vacuum()
        }
    }

    /// Excitation with explicit amplitudes on the default baseline.
    pub fn from_amplitudes(amplitudes: [Complex64; 3]) -> Self {
        Self {
            amplitudes,
            ..Self::vacuum()
        }
    }

    pub fn with_coupling(mut self, coupling: [f64; 3]) -> Self {
        self.coupling = coupling;
        self
    }

    pub fn with_velocity(mut self, velocity: [f64; 3]) -> Self {
        self.velocity = velocity;
        self
    }

    /// Energy held in the amplitudes (excludes the vacuum baseline).
    pub fn stored_energy(&self) -> f64 {
        self.amplitudes.iter().map(|z| z.norm_sqr()).sum()
    }

    /// Total energy: amplitudes plus vacuum baseline.
    pub fn energy(&self) -> f64 {
        self.stored_energy() + self.vacuum_energy
    }

    /// |ψ| across all three axes.
    pub fn magnitude(&self) -> f64 {
        self.stored_energy().sqrt()
    }

    /// Born weights per axis. All zero for a dark excitation.
    pub fn axis_probabilities(&self) -> [f64; 3] {
        let total = self.stored_energy();
        if total <= 0.0 {
            return [0.0; 3];
        }
        [
            self.amplitudes[0].norm_sqr() / total,
            self.amplitudes[1].norm_sqr() / total,
            self.amplitudes[2].norm_sqr() / total,
        ]
    }

    pub fn max_velocity(&self) -> f64 {
        self.velocity.iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    pub fn is_finite(&self) -> bool {
        self.amplitudes.iter().all(|z| z.re.is_finite() && z.im.is_finite())
            && self.phase.is_finite()
            && self.vacuum_energy.is_finite()
    }

    /// Superpose `delta` onto this excitation. Amplitudes add, the baseline keeps
    /// the larger value, coupling and velocity take the incoming values.
    pub fn absorb(&mut self, delta: &FieldExcitation) {
        for (z, d) in self.amplitudes.iter_mut().zip(delta.amplitudes.iter()) {
            *z += *d;
        }
        self.coupling = delta.coupling;
        self.velocity = delta.velocity;
        self.vacuum_energy = self.vacuum_energy.max(delta.vacuum_energy);
    }

    /// Rotate all amplitudes by `e^{-i·angle}` and advance the global phase.
    pub fn rotate_phase(&mut self, angle: f64) {
        let rot = Complex64::from_polar(1.0, -angle);
        for z in &mut self.amplitudes {
            *z *= rot;
        }
        self.phase = (self.phase + angle).rem_euclid(std::f64::consts::TAU);
    }

    /// Scale amplitudes by `factor` (≤ 1) and bank the lost energy in the vacuum.
    pub fn dissipate(&mut self, factor: f64) {
        let before = self.stored_energy();
        for z in &mut self.amplitudes {
            *z *= factor;
        }
        self.vacuum_energy += before - self.stored_energy();
    }

    /// Rescale amplitudes so stored energy equals `target`, leaving the
    /// vacuum untouched. A dark excitation stays dark.
    pub fn renormalize_to(&mut self, target: f64) {
        let current = self.stored_energy();
        if current <= 0.0 {
            return;
        }
        let scale = (target / current).sqrt();
        for z in &mut self.amplitudes {
            *z *= scale;
        }
    }
}
