use serde::{Deserialize, Serialize};

use crate::constants::{
    CONSERVATION_CEILING, CONSERVATION_TOLERANCE, DEFAULT_COUPLING, DEFAULT_DT, DEFAULT_VELOCITY,
    FOLD_STRENGTH, MAX_DT_HALVINGS, MEASUREMENT_HISTORY_LEN, OBSERVATION_WINDOW, PRUNE_THRESHOLD,
    VACUUM_ENERGY,
};

/// Tunable physics and scheduling parameters.
///
/// Every field has a default, so a partial `[engine]` table in `cfield.toml`
/// only overrides what it names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local timestep used by `tick` when none is given.
    pub dt: f64,
    /// Coupling assigned to freshly excited nodes.
    pub default_coupling: [f64; 3],
    /// Propagation velocity assigned to freshly excited nodes.
    pub default_velocity: [f64; 3],
    /// Vacuum baseline assigned to freshly excited nodes.
    pub vacuum_energy: f64,
    /// Amplitude decay rate γ (1 / time). Decayed energy is banked into the vacuum.
    pub decay_rate: f64,
    /// Self-phase frequency per unit stored energy.
    pub self_phase_gain: f64,
    /// Frequency-domain damping rate for the global step.
    pub global_damping: f64,
    /// Angular rate of the cross-axis rotation applied by the global step.
    pub cross_axis_strength: f64,
    pub prune_threshold: f64,
    pub observation_window: f64,
    pub measurement_history_len: usize,
    pub fold_strength: f64,
    pub conservation_tolerance: f64,
    pub conservation_ceiling: f64,
    pub max_dt_halvings: u32,
    pub max_observe_retries: u32,
    /// Run the global step every N ticks. Zero disables it.
    pub global_every: u32,
    /// Prune every N ticks. Zero disables it.
    pub prune_every: u32,
    /// Softening length for particle forces, in normalized units.
    pub particle_softening: f64,
    /// Force scale for particle interaction.
    pub particle_coupling: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dt: DEFAULT_DT,
            default_coupling: [DEFAULT_COUPLING; 3],
            default_velocity: [DEFAULT_VELOCITY; 3],
            vacuum_energy: VACUUM_ENERGY,
            decay_rate: 0.01,
            self_phase_gain: 0.5,
            global_damping: 0.05,
            cross_axis_strength: 0.2,
            prune_threshold: PRUNE_THRESHOLD,
            observation_window: OBSERVATION_WINDOW,
            measurement_history_len: MEASUREMENT_HISTORY_LEN,
            fold_strength: FOLD_STRENGTH,
            conservation_tolerance: CONSERVATION_TOLERANCE,
            conservation_ceiling: CONSERVATION_CEILING,
            max_dt_halvings: MAX_DT_HALVINGS,
            max_observe_retries: 3,
            global_every: 10,
            prune_every: 50,
            particle_softening: 0.05,
            particle_coupling: 0.01,
        }
    }
}
