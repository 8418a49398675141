//! Engine facade.
//!
//! `FieldEngine` owns the one shared resource, the spatial index, and lends
//! it to the local and global engines, the observation controller and the
//! particle subsystem in turn. Nothing else holds a reference to a node
//! across calls; entities are resolved to coordinates on every request.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use num_complex::Complex64;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::coord::{QuantizedCoordinate, Quantizer};
use crate::error::{FieldError, Result};
use crate::excitation::FieldExcitation;
use crate::global::{GlobalStepReport, step_global};
use crate::guard::{ConservationMonitor, ConservationSample};
use crate::index::{PruneReport, SpatialIndex};
use crate::local::{LocalStepReport, step_local};
use crate::metrics::{EngineKind, MetricsSummary, PerformanceMetrics};
use crate::observe::{
    EntityPhase, Fold, ObservationController, ObservationOutcome, ObservationRequest,
    ObservationTarget, PreparedObservation,
};
use crate::particle::{ParticleStepReport, step_particles};
use crate::wire::{ComputeRequest, ComputeResponse, EntityState, EvolvedState, MeasurementResult};

/// Format version of [`FieldSnapshot`].
pub const SNAPSHOT_VERSION: u32 = 1;

/// Where an excitation lands.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// Raw grid integers; rejected if off the grid.
    Grid([i64; 3]),
    Coordinate(QuantizedCoordinate),
    /// Continuous measurement in normalized units, quantized.
    Continuous([f64; 3]),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExcitationEvent {
    pub entity_id: Option<Uuid>,
    pub location: Location,
    pub amplitudes: [Complex64; 3],
    pub coupling: Option<[f64; 3]>,
    pub velocity: Option<[f64; 3]>,
}

impl ExcitationEvent {
    /// Excitation of |ψ| = `magnitude`, spread evenly across the axes.
    pub fn new(location: Location, magnitude: f64) -> Self {
        Self {
            entity_id: None,
            location,
            amplitudes: FieldExcitation::from_magnitude(magnitude).amplitudes,
            coupling: None,
            velocity: None,
        }
    }

    pub fn with_entity(mut self, id: Uuid) -> Self {
        self.entity_id = Some(id);
        self
    }

    pub fn with_amplitudes(mut self, amplitudes: [Complex64; 3]) -> Self {
        self.amplitudes = amplitudes;
        self
    }

    pub fn with_coupling(mut self, coupling: [f64; 3]) -> Self {
        self.coupling = Some(coupling);
        self
    }

    pub fn with_velocity(mut self, velocity: [f64; 3]) -> Self {
        self.velocity = Some(velocity);
        self
    }
}

#[derive(Clone, Debug)]
pub struct TickReport {
    pub tick: u64,
    pub time: f64,
    pub local: LocalStepReport,
    pub global: Option<GlobalStepReport>,
    pub particles: ParticleStepReport,
    pub folds: Vec<Fold>,
    pub pruned: Option<PruneReport>,
    /// Whole local + global cycle, pruning excluded.
    pub cycle: ConservationSample,
}

#[derive(Clone, Debug, Serialize)]
pub struct FieldStats {
    pub time: f64,
    pub ticks: u64,
    pub nodes: usize,
    pub regions: usize,
    pub entities: usize,
    pub collapsed: usize,
    pub total_energy: f64,
    pub stored_energy: f64,
    pub vacuum_energy: f64,
    pub metrics: MetricsSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub coordinate: QuantizedCoordinate,
    pub excitation: FieldExcitation,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: Uuid,
    pub coordinate: QuantizedCoordinate,
}

/// Versions last read from or written to storage. A cell whose live
/// version differs from its entry here has been written since.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncBaseline {
    pub cells: HashMap<QuantizedCoordinate, u64>,
    pub entities: HashMap<Uuid, u64>,
}

/// Persistable engine state. Particles are ephemeral and not included:
/// a restored engine starts with every entity in the wave regime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub version: u32,
    pub time: f64,
    pub ticks: u64,
    pub cells: Vec<CellSnapshot>,
    pub entities: Vec<EntitySnapshot>,
    /// Storage versions this state was derived from. Empty for a snapshot
    /// that never came from a store, such as an imported file.
    #[serde(skip)]
    pub baseline: SyncBaseline,
}

/// Outcome of folding stored state into a live engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RebaseReport {
    /// Cells taken from storage that this engine had not written.
    pub adopted: usize,
    /// Cells written on both sides; the stored state was kept.
    pub dropped: Vec<QuantizedCoordinate>,
    /// Cells deleted in storage and untouched here.
    pub removed: usize,
}

/// Parse an exported snapshot.
pub fn import_json(json: &str) -> std::result::Result<FieldSnapshot, serde_json::Error> {
    serde_json::from_str(json)
}

/// Serialize a snapshot as pretty JSON.
pub fn export_json(snapshot: &FieldSnapshot) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string_pretty(snapshot)
}

pub struct FieldEngine {
    config: EngineConfig,
    index: SpatialIndex,
    controller: ObservationController,
    metrics: PerformanceMetrics,
    entities: HashMap<Uuid, QuantizedCoordinate>,
    quantizer: Quantizer,
    rng: SmallRng,
    baseline: SyncBaseline,
    time: f64,
    ticks: u64,
}

impl FieldEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_rng(config, SmallRng::from_os_rng())
    }

    /// Deterministic measurement draws.
    pub fn with_seed(config: EngineConfig, seed: u64) -> Self {
        Self::with_rng(config, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(config: EngineConfig, rng: SmallRng) -> Self {
        Self {
            controller: ObservationController::new(&config),
            config,
            index: SpatialIndex::new(),
            metrics: PerformanceMetrics::default(),
            entities: HashMap::new(),
            quantizer: Quantizer,
            rng,
            baseline: SyncBaseline::default(),
            time: 0.0,
            ticks: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn controller(&self) -> &ObservationController {
        &self.controller
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn total_energy(&self) -> f64 {
        self.index.total_energy()
    }

    pub fn excitation_at(&self, coord: QuantizedCoordinate) -> Option<&FieldExcitation> {
        self.index.get_at(coord).map(|c| c.excitation())
    }

    pub fn phase_of(&self, target: ObservationTarget) -> Result<EntityPhase> {
        Ok(self.controller.phase(self.resolve(target)?))
    }

    // --- entities ---

    pub fn register_entity(&mut self, id: Uuid, coord: QuantizedCoordinate) {
        self.entities.insert(id, coord);
    }

    pub fn entity_coordinate(&self, id: Uuid) -> Result<QuantizedCoordinate> {
        self.entities
            .get(&id)
            .copied()
            .ok_or(FieldError::UnknownEntity(id))
    }

    pub fn entity_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.entities.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn resolve(&self, target: ObservationTarget) -> Result<QuantizedCoordinate> {
        match target {
            ObservationTarget::Entity(id) => self.entity_coordinate(id),
            ObservationTarget::Coordinate(c) => Ok(c),
        }
    }

    pub fn locate(&self, location: Location) -> Result<QuantizedCoordinate> {
        match location {
            Location::Grid([v, a, e]) => QuantizedCoordinate::new(v, a, e),
            Location::Coordinate(c) => Ok(c),
            Location::Continuous(m) => self.quantizer.quantize(m),
        }
    }

    // --- events ---

    /// Quantize, materialize and superpose an excitation. Binds the entity,
    /// if any, to the resulting coordinate.
    pub fn excite(&mut self, event: ExcitationEvent) -> Result<QuantizedCoordinate> {
        let coord = self.locate(event.location)?;
        let delta = FieldExcitation {
            amplitudes: event.amplitudes,
            coupling: event.coupling.unwrap_or(self.config.default_coupling),
            velocity: event.velocity.unwrap_or(self.config.default_velocity),
            vacuum_energy: self.config.vacuum_energy,
            ..FieldExcitation::vacuum()
        };
        let fresh = !self.index.contains(coord);
        let handle = self.index.materialize(coord, &delta)?;
        if fresh && let Some(&synced) = self.baseline.cells.get(&coord) {
            // re-materialized after a prune: stay ahead of the stored row
            self.index.reset(handle, delta.clone(), synced + 1);
        }
        if let Some(id) = event.entity_id {
            self.entities.insert(id, coord);
        }
        debug!(%coord, energy = delta.stored_energy(), "excited");
        Ok(coord)
    }

    // --- evolution ---

    pub fn step_local(&mut self, dt: f64) -> Result<LocalStepReport> {
        let start = Instant::now();
        let report = step_local(&mut self.index, dt, &self.config)?;
        self.metrics.record_timing(EngineKind::Local, start.elapsed());
        self.metrics
            .record_conservation(report.conservation.relative_error, report.conservation.logged);
        self.metrics.record_node_failures(report.failures.len());
        self.metrics
            .record_causality_violations(report.causality_violations.len());
        Ok(report)
    }

    pub fn step_global(&mut self, dt: f64) -> Result<GlobalStepReport> {
        let start = Instant::now();
        let report = step_global(&mut self.index, dt, &self.config)?;
        self.metrics.record_timing(EngineKind::Global, start.elapsed());
        self.metrics
            .record_conservation(report.conservation.relative_error, report.conservation.logged);
        self.metrics.record_node_failures(report.failures.len());
        self.metrics
            .record_causality_violations(report.causality_violations.len());
        Ok(report)
    }

    /// Interact the currently collapsed particles. Wave-state entities have
    /// no particle and are never touched.
    pub fn step_particles(&mut self, dt: f64) -> ParticleStepReport {
        let start = Instant::now();
        let mut particles = self.controller.particles_mut();
        let mut report = step_particles(&mut particles, dt, &self.config);
        let elapsed = start.elapsed();
        report.elapsed_us = elapsed.as_secs_f64() * 1e6;
        self.metrics.record_timing(EngineKind::Particle, elapsed);
        report
    }

    /// Return decayed nodes to vacuum. Collapsed entities are never pruned.
    pub fn prune(&mut self) -> PruneReport {
        let report = self
            .index
            .prune_where(self.config.prune_threshold, |cell| cell.is_frozen());
        self.controller.retain_materialized(&self.index);
        if !report.removed.is_empty() {
            debug!(
                removed = report.removed.len(),
                merged = report.merged_regions,
                "pruned"
            );
        }
        report
    }

    /// Fold every particle whose window has elapsed at the current time.
    pub fn expire(&mut self) -> Result<Vec<Fold>> {
        self.controller.expire(&mut self.index, self.time)
    }

    /// One scheduler tick: step locally, advance the clock, move particles,
    /// return expired particles to the wave regime, then run the global
    /// step and pruning when their cadences come due. A failed local step
    /// leaves the clock where it was.
    pub fn tick(&mut self, dt: Option<f64>) -> Result<TickReport> {
        let dt = dt.unwrap_or(self.config.dt);
        let monitor = ConservationMonitor::from_config(&self.config);
        let before = self.total_energy();

        let local = self.step_local(dt)?;
        self.ticks += 1;
        self.time += dt;
        let particles = self.step_particles(dt);
        let folds = self.expire()?;

        let cadence = |every: u32, ticks: u64| every > 0 && ticks % every as u64 == 0;
        let global = if cadence(self.config.global_every, self.ticks) {
            Some(self.step_global(dt * self.config.global_every as f64)?)
        } else {
            None
        };
        let cycle = monitor.measure("cycle", before, self.total_energy());

        let pruned = if cadence(self.config.prune_every, self.ticks) {
            Some(self.prune())
        } else {
            None
        };

        Ok(TickReport {
            tick: self.ticks,
            time: self.time,
            local,
            global,
            particles,
            folds,
            pruned,
            cycle,
        })
    }

    // --- observation ---

    pub fn observe(&mut self, request: &ObservationRequest) -> Result<ObservationOutcome> {
        let start = Instant::now();
        let coord = self.resolve(request.target)?;
        let outcome =
            self.controller
                .observe(&mut self.index, coord, request, self.time, &mut self.rng)?;
        self.metrics.record_timing(EngineKind::Observation, start.elapsed());
        if outcome.retries > 0 {
            warn!(%coord, retries = outcome.retries, "observation retried after concurrent evolution");
        }
        Ok(outcome)
    }

    /// First half of an observation: read the node and its version.
    pub fn prepare_observation(&mut self, request: &ObservationRequest) -> Result<PreparedObservation> {
        let coord = self.resolve(request.target)?;
        Ok(self
            .controller
            .prepare(&self.index, coord, request, self.time, &mut self.rng))
    }

    /// Second half: collapse, unless the node evolved in between.
    pub fn commit_observation(&mut self, prepared: PreparedObservation) -> Result<ObservationOutcome> {
        self.controller.commit(&mut self.index, prepared, self.time)
    }

    /// Return a collapsed entity to the wave regime now. Idempotent.
    pub fn release(&mut self, target: ObservationTarget) -> Result<Option<Fold>> {
        let coord = self.resolve(target)?;
        self.controller.release(&mut self.index, coord)
    }

    // --- reporting & persistence ---

    pub fn stats(&self) -> FieldStats {
        let (stored, vacuum) = self.index.iter().fold((0.0, 0.0), |(s, v), (_, c)| {
            (s + c.excitation().stored_energy(), v + c.excitation().vacuum_energy)
        });
        FieldStats {
            time: self.time,
            ticks: self.ticks,
            nodes: self.index.len(),
            regions: self.index.region_count(),
            entities: self.entities.len(),
            collapsed: self.controller.collapsed_count(),
            total_energy: stored + vacuum,
            stored_energy: stored,
            vacuum_energy: vacuum,
            metrics: self.metrics.summary(),
        }
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        let cells = self
            .index
            .sorted_handles()
            .into_iter()
            .filter_map(|h| self.index.get(h))
            .map(|c| CellSnapshot {
                coordinate: c.coord(),
                excitation: c.excitation().clone(),
                version: c.version(),
            })
            .collect();
        let entities = self
            .entity_ids()
            .into_iter()
            .map(|id| EntitySnapshot {
                id,
                coordinate: self.entities[&id],
            })
            .collect();
        FieldSnapshot {
            version: SNAPSHOT_VERSION,
            time: self.time,
            ticks: self.ticks,
            cells,
            entities,
            baseline: self.baseline.clone(),
        }
    }

    /// Replace all state with `snapshot`. Particles are dropped.
    pub fn restore(&mut self, snapshot: FieldSnapshot) -> Result<()> {
        let mut index = SpatialIndex::new();
        for cell in snapshot.cells {
            index.restore(cell.coordinate, cell.excitation, cell.version)?;
        }
        self.index = index;
        self.controller = ObservationController::new(&self.config);
        self.entities = snapshot
            .entities
            .into_iter()
            .map(|e| (e.id, e.coordinate))
            .collect();
        self.baseline = snapshot.baseline;
        self.time = snapshot.time;
        self.ticks = snapshot.ticks;
        info!(nodes = self.index.len(), entities = self.entities.len(), "restored field");
        Ok(())
    }

    pub fn baseline(&self) -> &SyncBaseline {
        &self.baseline
    }

    /// Record that storage now holds the versions in `baseline`.
    pub fn mark_synced(&mut self, baseline: SyncBaseline) {
        self.baseline = baseline;
    }

    /// Fold freshly loaded `stored` state into the live engine after a save
    /// was refused. Cells and entities this engine has not touched since
    /// its last sync take the stored state. A cell written on both sides
    /// also takes the stored state: the concurrent writer is never
    /// overwritten, and the local write is reported as dropped. Cells
    /// written only here stay dirty for the next save. Particles, the
    /// clock and unsynced local cells are kept.
    pub fn rebase(&mut self, stored: FieldSnapshot) -> Result<RebaseReport> {
        let mut report = RebaseReport::default();
        let on_disk: HashSet<QuantizedCoordinate> =
            stored.cells.iter().map(|c| c.coordinate).collect();

        for cell in stored.cells {
            let coord = cell.coordinate;
            let synced = self.baseline.cells.get(&coord).copied();
            if synced == Some(cell.version) {
                continue;
            }
            match self.index.handle(coord) {
                Some(handle) => {
                    let local = self.index.get(handle).map(|c| c.version());
                    if local == synced {
                        report.adopted += 1;
                    } else {
                        report.dropped.push(coord);
                    }
                    self.index.reset(handle, cell.excitation, cell.version);
                }
                None => {
                    self.index.restore(coord, cell.excitation, cell.version)?;
                    report.adopted += 1;
                }
            }
            self.baseline.cells.insert(coord, cell.version);
        }

        let gone: Vec<QuantizedCoordinate> = self
            .baseline
            .cells
            .keys()
            .filter(|c| !on_disk.contains(c))
            .copied()
            .collect();
        for coord in gone {
            let synced = self.baseline.cells.remove(&coord);
            let untouched = self
                .index
                .get_at(coord)
                .is_some_and(|c| Some(c.version()) == synced && !c.is_frozen());
            if untouched && self.index.remove(coord).is_some() {
                report.removed += 1;
            }
        }
        self.controller.retain_materialized(&self.index);

        for entity in stored.entities {
            let disk = stored.baseline.entities.get(&entity.id).copied();
            if self.baseline.entities.get(&entity.id).copied() == disk {
                continue;
            }
            self.entities.insert(entity.id, entity.coordinate);
            if let Some(version) = disk {
                self.baseline.entities.insert(entity.id, version);
            }
        }

        if !report.dropped.is_empty() {
            warn!(
                dropped = report.dropped.len(),
                "local writes lost to a concurrent writer"
            );
        }
        debug!(adopted = report.adopted, removed = report.removed, "rebased on stored field");
        Ok(report)
    }

    // --- compute boundary ---

    pub fn entity_state(&self, id: Uuid) -> Result<EntityState> {
        let coord = self.entity_coordinate(id)?;
        let excitation = self.excitation_at(coord).cloned().unwrap_or_default();
        Ok(EntityState::new(id, coord, &excitation))
    }

    /// Build a batch for the given entities.
    pub fn compute_request(
        &self,
        ids: &[Uuid],
        observations: Vec<crate::wire::ObservationSpec>,
        dt: f64,
    ) -> Result<ComputeRequest> {
        let entities = ids
            .iter()
            .map(|id| self.entity_state(*id))
            .collect::<Result<Vec<_>>>()?;
        Ok(ComputeRequest {
            entities,
            observations,
            dt,
        })
    }

    /// Current cell version behind each entity, 0 for a dark cell. Taken
    /// alongside [`compute_request`](Self::compute_request) and handed back
    /// to [`apply_evolved`](Self::apply_evolved).
    pub fn batch_versions(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, u64>> {
        ids.iter()
            .map(|id| Ok((*id, self.cell_version(self.entity_coordinate(*id)?))))
            .collect()
    }

    fn cell_version(&self, coord: QuantizedCoordinate) -> u64 {
        self.index.get_at(coord).map(|c| c.version()).unwrap_or(0)
    }

    /// Write evolved amplitudes from a compute response back into the field.
    ///
    /// `versions` is what [`batch_versions`](Self::batch_versions) returned
    /// when the batch was built. Every entity is checked before anything is
    /// written: an unknown id, or a cell written since, rejects the whole
    /// response. Collapsed entities are skipped. Any energy difference
    /// between the old and new amplitudes is banked into the node's vacuum
    /// so the total is unchanged. Returns how many nodes were updated.
    pub fn apply_evolved(
        &mut self,
        response: &ComputeResponse,
        versions: &HashMap<Uuid, u64>,
    ) -> Result<usize> {
        let mut targets = Vec::with_capacity(response.entities.len());
        for state in &response.entities {
            let coord = self.entity_coordinate(state.entity_id)?;
            let expected = versions
                .get(&state.entity_id)
                .copied()
                .ok_or(FieldError::UnknownEntity(state.entity_id))?;
            let found = self.cell_version(coord);
            if found != expected {
                return Err(FieldError::ConcurrentEvolutionConflict {
                    coord,
                    expected,
                    found,
                });
            }
            targets.push((coord, state));
        }

        let mut applied = 0;
        for (coord, state) in targets {
            if !state.is_finite() {
                warn!(%coord, "ignoring non-finite evolved state");
                continue;
            }
            let Some(handle) = self.index.handle(coord) else {
                continue;
            };
            if self.index.get(handle).is_some_and(|c| c.is_frozen()) {
                continue;
            }
            if let Some(ex) = self.index.write(handle) {
                let before = ex.stored_energy();
                ex.amplitudes = state.amplitudes();
                ex.vacuum_energy += before - ex.stored_energy();
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Evaluate a batch in a scratch engine: evolve `dt`, then measure.
    pub fn evaluate(
        request: &ComputeRequest,
        config: &EngineConfig,
        rng: &mut impl Rng,
    ) -> Result<ComputeResponse> {
        let mut engine = Self::with_seed(config.clone(), rng.random());
        for state in &request.entities {
            let event = ExcitationEvent::new(Location::Coordinate(state.coordinate), 0.0)
                .with_entity(state.entity_id)
                .with_amplitudes(state.amplitudes());
            engine.excite(event)?;
        }
        if request.dt > 0.0 {
            engine.step_local(request.dt)?;
            if request.entities.len() > 1 {
                engine.step_global(request.dt)?;
            }
        }

        let entities = request
            .entities
            .iter()
            .map(|s| {
                let amplitudes = engine
                    .excitation_at(s.coordinate)
                    .map(|ex| ex.amplitudes)
                    .unwrap_or_default();
                EvolvedState::new(s.entity_id, &amplitudes)
            })
            .collect();

        let mut measurements = Vec::with_capacity(request.observations.len());
        for spec in &request.observations {
            let target = ObservationTarget::Entity(spec.entity_id);
            let outcome = engine.observe(&ObservationRequest::new(target, spec.kind))?;
            measurements.push(MeasurementResult {
                entity_id: spec.entity_id,
                value: outcome.measurement.value,
                collapse_probability: outcome.measurement.collapse_probability,
                collapsed_coordinate: outcome.measurement.coordinate,
            });
        }

        Ok(ComputeResponse {
            entities,
            measurements,
            degraded: false,
        })
    }
}
