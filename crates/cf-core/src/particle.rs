//! Pairwise interaction among collapsed particles.
//!
//! Only the (small) collapsed set is ever passed in, so the O(P²) force
//! sum is fine. Positions live in normalized units on the torus: each axis
//! spans `[-1, 1)` and displacements use the minimum image.

use serde::Serialize;

use crate::config::EngineConfig;
use crate::observe::CollapsedParticle;

const PERIOD: f64 = 2.0;

#[derive(Clone, Debug, Default, Serialize)]
pub struct ParticleStepReport {
    pub particles: usize,
    pub pairs: usize,
    /// Largest speed after the step, normalized units per time.
    pub max_speed: f64,
    pub elapsed_us: f64,
}

fn min_image(d: f64) -> f64 {
    d - PERIOD * (d / PERIOD).round()
}

fn wrap(x: f64) -> f64 {
    if (-1.0..1.0).contains(&x) {
        return x;
    }
    (x + 1.0).rem_euclid(PERIOD) - 1.0
}

/// Field gradient felt at `at` from every other particle: softened
/// inverse-square falloff weighted by mass. Points away from mass.
pub fn field_gradient(
    at: [f64; 3],
    skip: usize,
    positions: &[[f64; 3]],
    masses: &[f64],
    softening: f64,
) -> [f64; 3] {
    let mut gradient = [0.0; 3];
    for (j, (pos, mass)) in positions.iter().zip(masses).enumerate() {
        if j == skip {
            continue;
        }
        let d = [
            min_image(at[0] - pos[0]),
            min_image(at[1] - pos[1]),
            min_image(at[2] - pos[2]),
        ];
        let dist_sq = d[0] * d[0] + d[1] * d[1] + d[2] * d[2] + softening * softening;
        let inv = mass / (dist_sq * dist_sq.sqrt());
        for k in 0..3 {
            gradient[k] += d[k] * inv;
        }
    }
    gradient
}

/// Advance every particle by `dt`: accelerate down the gradient, then move
/// with the updated velocity (semi-implicit Euler).
pub fn step_particles(
    particles: &mut [&mut CollapsedParticle],
    dt: f64,
    config: &EngineConfig,
) -> ParticleStepReport {
    let n = particles.len();
    let positions: Vec<[f64; 3]> = particles.iter().map(|p| p.position).collect();
    let masses: Vec<f64> = particles.iter().map(|p| p.mass).collect();

    let mut max_speed: f64 = 0.0;
    for (i, particle) in particles.iter_mut().enumerate() {
        let g = field_gradient(positions[i], i, &positions, &masses, config.particle_softening);
        for k in 0..3 {
            particle.velocity[k] -= config.particle_coupling * g[k] * dt;
            particle.position[k] = wrap(particle.position[k] + particle.velocity[k] * dt);
        }
        let speed = particle.velocity.iter().map(|v| v * v).sum::<f64>().sqrt();
        max_speed = max_speed.max(speed);
    }

    ParticleStepReport {
        particles: n,
        pairs: n * n.saturating_sub(1) / 2,
        max_speed,
        elapsed_us: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{Axis, QuantizedCoordinate};
    use crate::observe::{
        Measurement, ObservationKind, ObservationRequest, ObservationTarget,
    };
    use approx::assert_relative_eq;

    fn particle(position: [f64; 3], mass: f64) -> CollapsedParticle {
        let coord = QuantizedCoordinate::ORIGIN;
        CollapsedParticle {
            coordinate: coord,
            request: ObservationRequest::new(
                ObservationTarget::Coordinate(coord),
                ObservationKind::Attention,
            ),
            measurement: Measurement {
                axis: Some(Axis::Valence),
                ..Measurement::vacuum(coord, ObservationKind::Attention, 0.0)
            },
            position,
            velocity: [0.0; 3],
            mass,
            deadline: 1.0,
        }
    }

    #[test]
    fn test_pair_attracts_symmetrically() {
        let mut a = particle([-0.1, 0.0, 0.0], 1.0);
        let mut b = particle([0.1, 0.0, 0.0], 1.0);
        let report = step_particles(&mut [&mut a, &mut b], 0.1, &EngineConfig::default());
        assert_eq!(report.pairs, 1);
        assert!(a.velocity[0] > 0.0);
        assert!(b.velocity[0] < 0.0);
        assert_relative_eq!(a.velocity[0], -b.velocity[0], epsilon = 1e-12);
        assert!(a.value() > -0.1, "working value follows the position");
    }

    #[test]
    fn test_attraction_across_boundary() {
        let mut a = particle([0.95, 0.0, 0.0], 1.0);
        let mut b = particle([-0.95, 0.0, 0.0], 1.0);
        step_particles(&mut [&mut a, &mut b], 0.1, &EngineConfig::default());
        // nearest image of b is at +1.05
        assert!(a.velocity[0] > 0.0);
        assert!(b.velocity[0] < 0.0);
    }

    #[test]
    fn test_lone_particle_is_inert() {
        let mut a = particle([0.3, 0.3, 0.3], 2.0);
        let report = step_particles(&mut [&mut a], 0.1, &EngineConfig::default());
        assert_eq!(report.pairs, 0);
        assert_eq!(a.position, [0.3, 0.3, 0.3]);
    }

    #[test]
    fn test_wrap_stays_in_range() {
        assert_relative_eq!(wrap(1.2), -0.8, epsilon = 1e-12);
        assert_relative_eq!(wrap(-1.2), 0.8, epsilon = 1e-12);
        assert_relative_eq!(min_image(1.9), -0.1, epsilon = 1e-12);
    }
}
