//! Wave/particle controller.
//!
//! Every observed node carries an explicit phase. Only a transition listed in
//! [`transition`] may move it; anything else is an `InvalidTransition`. While
//! an entity is `Collapsed` its node is frozen in the index, so the local and
//! global engines skip it, and a [`CollapsedParticle`] stands in for it.

use std::collections::{HashMap, VecDeque};

use num_complex::Complex64;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::constants::{NEGLIGIBLE_ENERGY, VACUUM_COLLAPSE_PROBABILITY};
use crate::coord::{Axis, QuantizedCoordinate};
use crate::error::{FieldError, Result};
use crate::excitation::FieldExcitation;
use crate::index::{NodeHandle, SpatialIndex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPhase {
    Wave,
    Collapsing,
    Collapsed,
    Returning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEvent {
    Observe,
    Measured,
    WindowElapsed,
    Folded,
}

/// The complete transition table.
pub fn transition(phase: EntityPhase, event: PhaseEvent) -> Result<EntityPhase> {
    use EntityPhase::*;
    use PhaseEvent::*;
    match (phase, event) {
        (Wave, Observe) => Ok(Collapsing),
        (Collapsing, Measured) => Ok(Collapsed),
        // a repeat request extends the window, no second collapse
        (Collapsed, Observe) => Ok(Collapsed),
        (Collapsed, WindowElapsed) => Ok(Returning),
        (Returning, Folded) => Ok(Wave),
        (phase, event) => Err(FieldError::InvalidTransition { phase, event }),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Similarity,
    Resonance,
    Attention,
    DirectAccess,
}

impl ObservationKind {
    /// Weak measurements fold back at half strength.
    pub fn fold_scale(self) -> f64 {
        match self {
            Self::Attention => 0.5,
            _ => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Similarity => "similarity",
            Self::Resonance => "resonance",
            Self::Attention => "attention",
            Self::DirectAccess => "direct_access",
        }
    }
}

impl std::str::FromStr for ObservationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "similarity" => Ok(Self::Similarity),
            "resonance" => Ok(Self::Resonance),
            "attention" => Ok(Self::Attention),
            "direct_access" | "direct" => Ok(Self::DirectAccess),
            other => Err(format!("unknown observation kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ObservationTarget {
    Entity(Uuid),
    Coordinate(QuantizedCoordinate),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationRequest {
    pub id: Uuid,
    pub target: ObservationTarget,
    pub kind: ObservationKind,
    /// Who asked. Free-form, carried through to the particle.
    #[serde(default)]
    pub context: Option<String>,
    /// Reference vector for similarity measurements.
    #[serde(default)]
    pub reference: Option<[f64; 3]>,
    /// Reference phase for resonance measurements.
    #[serde(default)]
    pub reference_phase: Option<f64>,
}

impl ObservationRequest {
    pub fn new(target: ObservationTarget, kind: ObservationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            kind,
            context: None,
            reference: None,
            reference_phase: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_reference(mut self, reference: [f64; 3]) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_reference_phase(mut self, phase: f64) -> Self {
        self.reference_phase = Some(phase);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub kind: ObservationKind,
    pub coordinate: QuantizedCoordinate,
    /// Measured eigen-axis. `None` for a vacuum measurement.
    pub axis: Option<Axis>,
    /// Position along the measured axis, in normalized units.
    pub value: f64,
    pub collapse_probability: f64,
    /// Normalized position of the outcome.
    pub position: [f64; 3],
    /// Engine time of the measurement.
    pub at: f64,
}

impl Measurement {
    /// The deterministic answer for a coordinate holding no excitation.
    pub fn vacuum(coordinate: QuantizedCoordinate, kind: ObservationKind, at: f64) -> Self {
        Self {
            kind,
            coordinate,
            axis: None,
            value: 0.0,
            collapse_probability: VACUUM_COLLAPSE_PROBABILITY,
            position: coordinate.to_normalized(),
            at,
        }
    }

    pub fn is_vacuum(&self) -> bool {
        self.axis.is_none()
    }
}

/// Apply the measurement operator for `request.kind` to an excitation.
pub fn measure(
    excitation: &FieldExcitation,
    coordinate: QuantizedCoordinate,
    request: &ObservationRequest,
    at: f64,
    rng: &mut impl Rng,
) -> Measurement {
    let p = excitation.axis_probabilities();
    if excitation.stored_energy() <= NEGLIGIBLE_ENERGY {
        return Measurement::vacuum(coordinate, request.kind, at);
    }
    let dominant = argmax(p);
    let (axis, collapse_probability) = match request.kind {
        ObservationKind::DirectAccess => {
            let draw: f64 = rng.random();
            let mut acc = 0.0;
            let mut chosen = dominant;
            for (i, w) in p.iter().enumerate() {
                acc += w;
                if draw < acc {
                    chosen = i;
                    break;
                }
            }
            (chosen, p[chosen])
        }
        ObservationKind::Similarity => {
            let r = request.reference.unwrap_or([1.0; 3]);
            let norm = r.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm <= f64::EPSILON {
                (dominant, 0.0)
            } else {
                let mags = p.map(f64::sqrt);
                let overlap: f64 = (0..3).map(|i| mags[i] * r[i].abs() / norm).sum();
                let weighted = [
                    mags[0] * r[0].abs(),
                    mags[1] * r[1].abs(),
                    mags[2] * r[2].abs(),
                ];
                (argmax(weighted), (overlap * overlap).min(1.0))
            }
        }
        ObservationKind::Resonance => {
            let reference = request.reference_phase.unwrap_or(0.0);
            let alignment = 0.5 * (1.0 + (excitation.phase - reference).cos());
            (dominant, alignment * p[dominant])
        }
        ObservationKind::Attention => (dominant, p[dominant]),
    };
    let position = coordinate.to_normalized();
    Measurement {
        kind: request.kind,
        coordinate,
        axis: Some(Axis::from_index(axis)),
        value: position[axis],
        collapse_probability,
        position,
        at,
    }
}

fn argmax(w: [f64; 3]) -> usize {
    let mut best = 0;
    for i in 1..3 {
        if w[i] > w[best] {
            best = i;
        }
    }
    best
}

/// Discrete stand-in for a collapsed entity. Lives only while its entity is
/// `Collapsed`; never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CollapsedParticle {
    pub coordinate: QuantizedCoordinate,
    pub request: ObservationRequest,
    pub measurement: Measurement,
    /// Normalized position, moved by the particle subsystem.
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    /// Stored energy at collapse.
    pub mass: f64,
    /// Engine time at which the entity returns to the wave regime.
    pub deadline: f64,
}

impl CollapsedParticle {
    /// Working measurement value: position along the measured axis.
    pub fn value(&self) -> f64 {
        match self.measurement.axis {
            Some(axis) => self.position[axis.index()],
            None => 0.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct EntityRecord {
    phase: Option<EntityPhase>,
    particle: Option<CollapsedParticle>,
    history: VecDeque<Measurement>,
}

impl EntityRecord {
    fn phase(&self) -> EntityPhase {
        self.phase.unwrap_or(EntityPhase::Wave)
    }

    fn advance(&mut self, event: PhaseEvent) -> Result<EntityPhase> {
        let next = transition(self.phase(), event)?;
        self.phase = Some(next);
        Ok(next)
    }
}

/// Result of reading a node ahead of a collapse.
#[derive(Clone, Debug)]
pub enum PreparedObservation {
    /// Nothing to collapse; the answer is final.
    Vacuum(Measurement),
    /// Already collapsed; committing extends the window.
    Extend {
        coordinate: QuantizedCoordinate,
    },
    Node {
        handle: NodeHandle,
        coordinate: QuantizedCoordinate,
        version: u64,
        measurement: Measurement,
        request: ObservationRequest,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObservationOutcome {
    pub measurement: Measurement,
    /// The request landed on an already-collapsed entity and extended it.
    pub extended: bool,
    pub deadline: Option<f64>,
    /// Prepare/commit attempts lost to concurrent evolution.
    pub retries: u32,
}

/// A measurement folded back into the wave regime.
#[derive(Clone, Debug, PartialEq)]
pub struct Fold {
    pub coordinate: QuantizedCoordinate,
    pub measurement: Measurement,
    pub energy_before: f64,
    pub energy_after: f64,
}

pub struct ObservationController {
    records: HashMap<QuantizedCoordinate, EntityRecord>,
    window: f64,
    history_len: usize,
    fold_strength: f64,
    max_retries: u32,
}

impl ObservationController {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            records: HashMap::new(),
            window: config.observation_window,
            history_len: config.measurement_history_len.max(1),
            fold_strength: config.fold_strength.clamp(0.0, 1.0),
            max_retries: config.max_observe_retries,
        }
    }

    pub fn phase(&self, coord: QuantizedCoordinate) -> EntityPhase {
        self.records
            .get(&coord)
            .map(EntityRecord::phase)
            .unwrap_or(EntityPhase::Wave)
    }

    pub fn history(&self, coord: QuantizedCoordinate) -> impl Iterator<Item = &Measurement> {
        self.records.get(&coord).into_iter().flat_map(|r| r.history.iter())
    }

    pub fn particle(&self, coord: QuantizedCoordinate) -> Option<&CollapsedParticle> {
        self.records.get(&coord)?.particle.as_ref()
    }

    pub fn particles(&self) -> impl Iterator<Item = &CollapsedParticle> {
        self.records.values().filter_map(|r| r.particle.as_ref())
    }

    /// Current particle set, for the interaction step.
    pub fn particles_mut(&mut self) -> Vec<&mut CollapsedParticle> {
        self.records
            .values_mut()
            .filter_map(|r| r.particle.as_mut())
            .collect()
    }

    pub fn collapsed_count(&self) -> usize {
        self.records.values().filter(|r| r.particle.is_some()).count()
    }

    /// Read the node and compute a provisional measurement. Nothing changes
    /// until [`commit`](Self::commit).
    pub fn prepare(
        &self,
        index: &SpatialIndex,
        coord: QuantizedCoordinate,
        request: &ObservationRequest,
        now: f64,
        rng: &mut impl Rng,
    ) -> PreparedObservation {
        if self.phase(coord) == EntityPhase::Collapsed {
            return PreparedObservation::Extend { coordinate: coord };
        }
        let Some(handle) = index.handle(coord) else {
            return PreparedObservation::Vacuum(Measurement::vacuum(coord, request.kind, now));
        };
        let Some(cell) = index.get(handle) else {
            return PreparedObservation::Vacuum(Measurement::vacuum(coord, request.kind, now));
        };
        let measurement = measure(cell.excitation(), coord, request, now, rng);
        if measurement.is_vacuum() {
            return PreparedObservation::Vacuum(measurement);
        }
        PreparedObservation::Node {
            handle,
            coordinate: coord,
            version: cell.version(),
            measurement,
            request: request.clone(),
        }
    }

    /// Collapse if the node is unchanged since `prepare`.
    pub fn commit(
        &mut self,
        index: &mut SpatialIndex,
        prepared: PreparedObservation,
        now: f64,
    ) -> Result<ObservationOutcome> {
        match prepared {
            PreparedObservation::Vacuum(measurement) => Ok(ObservationOutcome {
                measurement,
                extended: false,
                deadline: None,
                retries: 0,
            }),
            PreparedObservation::Extend { coordinate } => self.extend(coordinate, now),
            PreparedObservation::Node {
                handle,
                coordinate,
                version,
                measurement,
                request,
            } => {
                // an earlier commit collapsed the node after this was prepared
                if self.phase(coordinate) == EntityPhase::Collapsed {
                    return self.extend(coordinate, now);
                }
                let cell = index
                    .get(handle)
                    .ok_or(FieldError::ConcurrentEvolutionConflict {
                        coord: coordinate,
                        expected: version,
                        found: 0,
                    })?;
                if cell.version() != version {
                    return Err(FieldError::ConcurrentEvolutionConflict {
                        coord: coordinate,
                        expected: version,
                        found: cell.version(),
                    });
                }
                let mass = cell.excitation().stored_energy();

                let record = self.records.entry(coordinate).or_default();
                record.advance(PhaseEvent::Observe)?;
                record.advance(PhaseEvent::Measured)?;
                index.set_frozen(handle, true);

                let deadline = now + self.window;
                record.particle = Some(CollapsedParticle {
                    coordinate,
                    position: measurement.position,
                    velocity: [0.0; 3],
                    mass,
                    deadline,
                    measurement: measurement.clone(),
                    request,
                });
                debug!(%coordinate, kind = ?measurement.kind, deadline, "collapsed");
                Ok(ObservationOutcome {
                    measurement,
                    extended: false,
                    deadline: Some(deadline),
                    retries: 0,
                })
            }
        }
    }

    /// Prepare and commit, re-reading the node after each lost race.
    pub fn observe(
        &mut self,
        index: &mut SpatialIndex,
        coord: QuantizedCoordinate,
        request: &ObservationRequest,
        now: f64,
        rng: &mut impl Rng,
    ) -> Result<ObservationOutcome> {
        let mut attempt = 0;
        loop {
            let prepared = self.prepare(index, coord, request, now, rng);
            match self.commit(index, prepared, now) {
                Ok(mut outcome) => {
                    outcome.retries = attempt;
                    return Ok(outcome);
                }
                Err(FieldError::ConcurrentEvolutionConflict { .. }) if attempt < self.max_retries => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn extend(&mut self, coord: QuantizedCoordinate, now: f64) -> Result<ObservationOutcome> {
        let window = self.window;
        let record = self
            .records
            .get_mut(&coord)
            .ok_or(FieldError::InvalidTransition {
                phase: EntityPhase::Wave,
                event: PhaseEvent::WindowElapsed,
            })?;
        record.advance(PhaseEvent::Observe)?;
        let Some(particle) = record.particle.as_mut() else {
            return Err(FieldError::InvalidTransition {
                phase: EntityPhase::Collapsed,
                event: PhaseEvent::Observe,
            });
        };
        particle.deadline = particle.deadline.max(now + window);
        let mut measurement = particle.measurement.clone();
        measurement.value = particle.value();
        Ok(ObservationOutcome {
            measurement,
            extended: true,
            deadline: Some(particle.deadline),
            retries: 0,
        })
    }

    /// Fold every particle whose window has elapsed.
    pub fn expire(&mut self, index: &mut SpatialIndex, now: f64) -> Result<Vec<Fold>> {
        let due: Vec<QuantizedCoordinate> = self
            .records
            .iter()
            .filter(|(_, r)| r.particle.as_ref().is_some_and(|p| p.deadline <= now))
            .map(|(c, _)| *c)
            .collect();
        let mut folds = Vec::with_capacity(due.len());
        for coord in due {
            if let Some(fold) = self.release(index, coord)? {
                folds.push(fold);
            }
        }
        Ok(folds)
    }

    /// Return a collapsed entity to the wave regime now. Releasing anything
    /// not `Collapsed` is a no-op.
    pub fn release(
        &mut self,
        index: &mut SpatialIndex,
        coord: QuantizedCoordinate,
    ) -> Result<Option<Fold>> {
        let history_len = self.history_len;
        let fold_strength = self.fold_strength;
        let Some(record) = self.records.get_mut(&coord) else {
            return Ok(None);
        };
        if record.phase() != EntityPhase::Collapsed {
            return Ok(None);
        }
        record.advance(PhaseEvent::WindowElapsed)?;
        let Some(particle) = record.particle.take() else {
            return Ok(None);
        };

        let mut measurement = particle.measurement;
        measurement.value = match measurement.axis {
            Some(axis) => particle.position[axis.index()],
            None => 0.0,
        };
        measurement.position = particle.position;
        if record.history.len() == history_len {
            record.history.pop_front();
        }
        record.history.push_back(measurement.clone());

        let (energy_before, energy_after) = match index.handle(coord) {
            Some(handle) => {
                let strength = fold_strength * measurement.kind.fold_scale();
                let energies = match (index.write(handle), measurement.axis) {
                    (Some(ex), Some(axis)) => {
                        let before = ex.stored_energy();
                        fold_toward(ex, axis, strength);
                        (before, ex.stored_energy())
                    }
                    (Some(ex), None) => (ex.stored_energy(), ex.stored_energy()),
                    (None, _) => (0.0, 0.0),
                };
                index.set_frozen(handle, false);
                energies
            }
            None => (0.0, 0.0),
        };
        record.advance(PhaseEvent::Folded)?;
        debug!(%coord, energy_before, energy_after, "returned to wave");

        Ok(Some(Fold {
            coordinate: coord,
            measurement,
            energy_before,
            energy_after,
        }))
    }

    /// Forget controller state for coordinates no longer in the index.
    pub fn retain_materialized(&mut self, index: &SpatialIndex) {
        self.records
            .retain(|coord, r| r.particle.is_some() || index.contains(*coord));
    }
}

/// Partially reset amplitudes toward the eigenstate of `axis`, keeping
/// stored energy.
fn fold_toward(ex: &mut FieldExcitation, axis: Axis, strength: f64) {
    let energy = ex.stored_energy();
    if energy <= 0.0 {
        return;
    }
    let k = axis.index();
    let carrier = if ex.amplitudes[k].norm() > 0.0 {
        ex.amplitudes[k] / ex.amplitudes[k].norm()
    } else {
        Complex64::new(1.0, 0.0)
    };
    for (i, z) in ex.amplitudes.iter_mut().enumerate() {
        let eigen = if i == k {
            carrier * energy.sqrt()
        } else {
            Complex64::new(0.0, 0.0)
        };
        *z = *z * (1.0 - strength) + eigen * strength;
    }
    ex.renormalize_to(energy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn at(v: i64, a: i64, e: i64) -> QuantizedCoordinate {
        QuantizedCoordinate::new(v, a, e).unwrap()
    }

    fn request(coord: QuantizedCoordinate, kind: ObservationKind) -> ObservationRequest {
        ObservationRequest::new(ObservationTarget::Coordinate(coord), kind)
    }

    fn skewed() -> FieldExcitation {
        FieldExcitation::from_amplitudes([
            Complex64::new(0.2, 0.0),
            Complex64::new(0.9, 0.1),
            Complex64::new(0.3, -0.2),
        ])
    }

    #[test]
    fn test_transition_table() {
        use EntityPhase::*;
        use PhaseEvent::*;
        assert_eq!(transition(Wave, Observe).unwrap(), Collapsing);
        assert_eq!(transition(Collapsing, Measured).unwrap(), Collapsed);
        assert_eq!(transition(Collapsed, Observe).unwrap(), Collapsed);
        assert_eq!(transition(Collapsed, WindowElapsed).unwrap(), Returning);
        assert_eq!(transition(Returning, Folded).unwrap(), Wave);
        assert_eq!(
            transition(Wave, Folded).unwrap_err(),
            FieldError::InvalidTransition {
                phase: Wave,
                event: Folded
            }
        );
        assert!(transition(Returning, Observe).is_err());
        assert!(transition(Collapsing, WindowElapsed).is_err());
    }

    #[test]
    fn test_measurement_kinds_pick_expected_axis() {
        let ex = skewed();
        let c = at(4, -2, 9);
        let mut rng = rng();

        let attention = measure(&ex, c, &request(c, ObservationKind::Attention), 0.0, &mut rng);
        assert_eq!(attention.axis, Some(Axis::Arousal));
        assert_relative_eq!(
            attention.collapse_probability,
            ex.axis_probabilities()[1],
            epsilon = 1e-12
        );

        let sim = request(c, ObservationKind::Similarity).with_reference([0.0, 0.0, 1.0]);
        let m = measure(&ex, c, &sim, 0.0, &mut rng);
        assert_eq!(m.axis, Some(Axis::Epistemic));
        assert_relative_eq!(m.collapse_probability, ex.axis_probabilities()[2], epsilon = 1e-12);

        let res = request(c, ObservationKind::Resonance).with_reference_phase(std::f64::consts::PI);
        let m = measure(&ex, c, &res, 0.0, &mut rng);
        assert!(m.collapse_probability < 1e-12, "anti-phase resonance is dark");

        let direct = measure(&ex, c, &request(c, ObservationKind::DirectAccess), 0.0, &mut rng);
        let axis = direct.axis.unwrap();
        assert_relative_eq!(
            direct.collapse_probability,
            ex.axis_probabilities()[axis.index()],
            epsilon = 1e-12
        );
        assert_eq!(direct.value, c.to_normalized()[axis.index()]);
    }

    #[test]
    fn test_vacuum_observation_creates_nothing() {
        let mut index = SpatialIndex::new();
        let mut ctl = ObservationController::new(&EngineConfig::default());
        let c = at(50, 50, 50);
        let out = ctl
            .observe(&mut index, c, &request(c, ObservationKind::DirectAccess), 0.0, &mut rng())
            .unwrap();
        assert!(out.measurement.is_vacuum());
        assert_eq!(out.measurement.value, 0.0);
        assert_eq!(out.measurement.collapse_probability, VACUUM_COLLAPSE_PROBABILITY);
        assert_eq!(out.measurement.position, c.to_normalized());
        assert!(index.is_empty());
        assert_eq!(ctl.phase(c), EntityPhase::Wave);
        assert_eq!(ctl.collapsed_count(), 0);
    }

    #[test]
    fn test_collapse_freezes_and_extends() {
        let mut index = SpatialIndex::new();
        let c = at(0, 0, 0);
        let h = index.materialize(c, &skewed()).unwrap();
        let mut ctl = ObservationController::new(&EngineConfig::default());
        let req = request(c, ObservationKind::Attention);

        let first = ctl.observe(&mut index, c, &req, 0.0, &mut rng()).unwrap();
        assert_eq!(ctl.phase(c), EntityPhase::Collapsed);
        assert!(index.get(h).unwrap().is_frozen());
        assert_eq!(first.deadline, Some(1.0));

        let second = ctl.observe(&mut index, c, &req, 0.5, &mut rng()).unwrap();
        assert!(second.extended);
        assert_eq!(second.deadline, Some(1.5));
        assert_eq!(ctl.collapsed_count(), 1);

        assert!(ctl.expire(&mut index, 1.2).unwrap().is_empty());
        let folds = ctl.expire(&mut index, 1.5).unwrap();
        assert_eq!(folds.len(), 1);
        assert_eq!(ctl.phase(c), EntityPhase::Wave);
        assert!(!index.get(h).unwrap().is_frozen());
        assert_eq!(ctl.history(c).count(), 1);
    }

    #[test]
    fn test_fold_preserves_energy_and_release_is_idempotent() {
        let mut index = SpatialIndex::new();
        let c = at(1, 2, 3);
        let h = index.materialize(c, &skewed()).unwrap();
        let before = index.get(h).unwrap().excitation().stored_energy();
        let p_before = index.get(h).unwrap().excitation().axis_probabilities();
        let mut ctl = ObservationController::new(&EngineConfig::default());
        ctl.observe(&mut index, c, &request(c, ObservationKind::Attention), 0.0, &mut rng())
            .unwrap();

        let fold = ctl.release(&mut index, c).unwrap().unwrap();
        assert_relative_eq!(fold.energy_after, before, epsilon = 1e-12);
        let ex = index.get(h).unwrap().excitation();
        assert_relative_eq!(ex.stored_energy(), before, epsilon = 1e-12);
        assert!(ex.axis_probabilities()[1] > p_before[1]);

        let snapshot = ex.clone();
        assert!(ctl.release(&mut index, c).unwrap().is_none());
        assert_eq!(index.get(h).unwrap().excitation(), &snapshot);
        assert_eq!(ctl.history(c).count(), 1);
    }

    #[test]
    fn test_commit_detects_concurrent_write() {
        let mut index = SpatialIndex::new();
        let c = at(0, 0, 0);
        let h = index.materialize(c, &skewed()).unwrap();
        let mut ctl = ObservationController::new(&EngineConfig::default());
        let req = request(c, ObservationKind::DirectAccess);
        let mut rng = rng();

        let prepared = ctl.prepare(&index, c, &req, 0.0, &mut rng);
        index.write(h).unwrap().rotate_phase(0.1);
        let err = ctl.commit(&mut index, prepared, 0.0).unwrap_err();
        assert!(matches!(
            err,
            FieldError::ConcurrentEvolutionConflict { expected: 1, found: 2, .. }
        ));
        assert_eq!(ctl.phase(c), EntityPhase::Wave);
        assert!(!index.get(h).unwrap().is_frozen());

        let out = ctl.observe(&mut index, c, &req, 0.0, &mut rng).unwrap();
        assert_eq!(out.retries, 0);
        assert_eq!(ctl.phase(c), EntityPhase::Collapsed);
    }

    #[test]
    fn test_second_prepared_commit_extends_window() {
        let mut index = SpatialIndex::new();
        let c = at(4, 0, 0);
        let h = index.materialize(c, &skewed()).unwrap();
        let mut ctl = ObservationController::new(&EngineConfig::default());
        let req = request(c, ObservationKind::Attention);
        let mut rng = rng();

        let first = ctl.prepare(&index, c, &req, 0.0, &mut rng);
        let second = ctl.prepare(&index, c, &req, 0.0, &mut rng);
        let a = ctl.commit(&mut index, first, 0.0).unwrap();
        assert!(!a.extended);

        let b = ctl.commit(&mut index, second, 0.4).unwrap();
        assert!(b.extended);
        assert_eq!(b.deadline, Some(1.4));
        assert_eq!(ctl.phase(c), EntityPhase::Collapsed);
        assert_eq!(ctl.collapsed_count(), 1);
        assert!(index.get(h).unwrap().is_frozen());
    }

    #[test]
    fn test_history_is_bounded() {
        let config = EngineConfig {
            measurement_history_len: 2,
            ..EngineConfig::default()
        };
        let mut index = SpatialIndex::new();
        let c = at(0, 0, 0);
        index.materialize(c, &skewed()).unwrap();
        let mut ctl = ObservationController::new(&config);
        let mut rng = rng();
        for t in 0..5 {
            let now = t as f64 * 10.0;
            ctl.observe(&mut index, c, &request(c, ObservationKind::DirectAccess), now, &mut rng)
                .unwrap();
            ctl.expire(&mut index, now + 5.0).unwrap();
        }
        let history: Vec<f64> = ctl.history(c).map(|m| m.at).collect();
        assert_eq!(history, vec![30.0, 40.0]);
    }
}
