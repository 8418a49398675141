use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cf_core::{
    ExcitationEvent, FieldError, Location, ObservationKind, ObservationRequest, ObservationSpec,
    ObservationTarget, QuantizedCoordinate,
};
use cf_router::{ComputeOp, HybridRouter, RouterError};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Field;

#[derive(Clone)]
pub struct FieldServer {
    state: Arc<Mutex<ServerState>>,
    router: Arc<HybridRouter>,
    cancel: CancellationToken,
    tool_router: ToolRouter<Self>,
}

struct ServerState {
    field: Field,
    /// Mutated since the last save.
    dirty: bool,
}

impl FieldServer {
    pub fn new(field: Field) -> anyhow::Result<Self> {
        let router = HybridRouter::new(field.config.router.clone(), field.config.engine.clone())
            .context("failed to build compute router")?;
        Ok(Self {
            state: Arc::new(Mutex::new(ServerState { field, dirty: false })),
            router: Arc::new(router),
            cancel: CancellationToken::new(),
            tool_router: Self::tool_router(),
        })
    }

    /// Stop the maintenance loop and any in-flight dispatch.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Tick the engine on the configured interval and persist every
    /// `persist_every` ticks. The task saves once more on shutdown.
    pub fn spawn_maintenance(&self) -> JoinHandle<anyhow::Result<()>> {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let (interval_ms, persist_every) = {
                let s = state.lock().await;
                (s.field.config.maintenance_interval_ms, s.field.config.persist_every)
            };

            if interval_ms > 0 {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut ticks: u64 = 0;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    let mut s = state.lock().await;
                    maintenance_tick(&mut s);
                    ticks += 1;
                    if persist_every > 0 && ticks % persist_every as u64 == 0 {
                        persist(&mut s);
                    }
                }
            } else {
                cancel.cancelled().await;
            }

            let mut s = state.lock().await;
            s.field.save()?;
            s.dirty = false;
            tracing::info!("field state persisted on shutdown");
            Ok(())
        })
    }
}

fn maintenance_tick(state: &mut ServerState) {
    match state.field.engine.tick(None) {
        Ok(report) => {
            state.dirty = true;
            if !report.folds.is_empty() || report.pruned.is_some() {
                tracing::debug!(
                    tick = report.tick,
                    folds = report.folds.len(),
                    pruned = report.pruned.as_ref().map_or(0, |p| p.removed.len()),
                    "maintenance tick"
                );
            }
        }
        Err(e) => tracing::warn!("maintenance tick failed: {e}"),
    }
}

fn persist(state: &mut ServerState) {
    if !state.dirty {
        return;
    }
    match state.field.save() {
        Ok(()) => state.dirty = false,
        Err(e) => tracing::error!("failed to persist field state: {e:#}"),
    }
}

fn field_error(e: FieldError) -> McpError {
    match e {
        FieldError::OutOfRangeCoordinate { .. }
        | FieldError::UnknownEntity(_)
        | FieldError::InvalidTransition { .. } => McpError::invalid_params(e.to_string(), None),
        _ => McpError::internal_error(e.to_string(), None),
    }
}

fn parse_entity(id: &str) -> Result<Uuid, McpError> {
    Uuid::parse_str(id)
        .map_err(|e| McpError::invalid_params(format!("invalid entity id '{id}': {e}"), None))
}

fn parse_kind(kind: Option<&str>) -> Result<ObservationKind, McpError> {
    kind.unwrap_or("direct_access")
        .parse()
        .map_err(|e: String| McpError::invalid_params(e, None))
}

fn json_result(value: &serde_json::Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(value).unwrap_or_default(),
    )])
}

// --- Tool parameter types ---

#[derive(Debug, Deserialize, JsonSchema)]
struct ExciteRequest {
    /// Valence cell, -128..=127
    v: i64,
    /// Arousal cell, -128..=127
    a: i64,
    /// Epistemic cell, -128..=127
    e: i64,
    /// Excitation magnitude |ψ| (default 1.0)
    magnitude: Option<f64>,
    /// Entity UUID to bind to the cell
    entity: Option<String>,
}

/// Either an entity or a grid cell.
#[derive(Debug, Deserialize, JsonSchema)]
struct TargetRequest {
    /// Entity UUID. Takes precedence over the cell.
    entity: Option<String>,
    v: Option<i64>,
    a: Option<i64>,
    e: Option<i64>,
}

impl TargetRequest {
    fn target(&self) -> Result<ObservationTarget, McpError> {
        if let Some(id) = &self.entity {
            return Ok(ObservationTarget::Entity(parse_entity(id)?));
        }
        match (self.v, self.a, self.e) {
            (Some(v), Some(a), Some(e)) => QuantizedCoordinate::new(v, a, e)
                .map(ObservationTarget::Coordinate)
                .map_err(field_error),
            _ => Err(McpError::invalid_params(
                "either entity or all of v, a, e is required",
                None,
            )),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ObserveRequest {
    #[serde(flatten)]
    target: TargetRequest,
    /// similarity, resonance, attention or direct_access (default)
    kind: Option<String>,
    /// Who is observing
    context: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct StepRequest {
    /// Number of ticks (default 1)
    ticks: Option<u32>,
    /// Timestep override
    dt: Option<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DispatchRequest {
    /// propagate, observe, entangle, collapse_superposition or global_evolution
    op: String,
    /// Entity UUIDs the operation acts on. global_evolution uses every entity.
    #[serde(default)]
    entities: Vec<String>,
    /// Observation kind for op=observe
    kind: Option<String>,
    /// Evolution timestep (default: engine dt)
    dt: Option<f64>,
}

#[tool_router]
impl FieldServer {
    #[tool(
        description = "Excite the field at a grid cell. Energy is superposed onto the cell (bound to the entity when one is given) and exchanged with excited neighbours on subsequent ticks."
    )]
    async fn field_excite(
        &self,
        Parameters(req): Parameters<ExciteRequest>,
    ) -> Result<CallToolResult, McpError> {
        let entity = req.entity.as_deref().map(parse_entity).transpose()?;
        let mut event = ExcitationEvent::new(
            Location::Grid([req.v, req.a, req.e]),
            req.magnitude.unwrap_or(1.0),
        );
        if let Some(id) = entity {
            event = event.with_entity(id);
        }

        let mut state = self.state.lock().await;
        let engine = &mut state.field.engine;
        let coord = engine.excite(event).map_err(field_error)?;
        let energy = engine.excitation_at(coord).map_or(0.0, |ex| ex.energy());
        let total = engine.total_energy();
        state.dirty = true;

        Ok(json_result(&serde_json::json!({
            "coordinate": coord,
            "entity": entity,
            "energy": energy,
            "total_energy": total,
        })))
    }

    #[tool(
        description = "Measure an entity or grid cell. The target collapses into a particle for the observation window, then folds back into the field. Observing an empty cell returns a vacuum measurement without creating anything."
    )]
    async fn field_observe(
        &self,
        Parameters(req): Parameters<ObserveRequest>,
    ) -> Result<CallToolResult, McpError> {
        let target = req.target.target()?;
        let kind = parse_kind(req.kind.as_deref())?;
        let mut request = ObservationRequest::new(target, kind);
        if let Some(context) = req.context {
            request = request.with_context(context);
        }

        let mut state = self.state.lock().await;
        let outcome = state.field.engine.observe(&request).map_err(field_error)?;
        if !outcome.measurement.is_vacuum() {
            state.dirty = true;
        }

        Ok(json_result(&serde_json::json!({
            "measurement": outcome.measurement,
            "vacuum": outcome.measurement.is_vacuum(),
            "extended": outcome.extended,
            "deadline": outcome.deadline,
            "retries": outcome.retries,
        })))
    }

    #[tool(
        description = "Return a collapsed entity or cell to the wave regime now instead of waiting for its window. Releasing something that is not collapsed is a no-op."
    )]
    async fn field_release(
        &self,
        Parameters(req): Parameters<TargetRequest>,
    ) -> Result<CallToolResult, McpError> {
        let target = req.target()?;
        let mut state = self.state.lock().await;
        let fold = state.field.engine.release(target).map_err(field_error)?;

        let result = match fold {
            Some(fold) => {
                state.dirty = true;
                serde_json::json!({
                    "released": true,
                    "coordinate": fold.coordinate,
                    "energy_before": fold.energy_before,
                    "energy_after": fold.energy_after,
                })
            }
            None => serde_json::json!({ "released": false }),
        };
        Ok(json_result(&result))
    }

    #[tool(
        description = "Advance the simulation by one or more ticks. Each tick runs the local step; the global step and pruning run on their configured cadences."
    )]
    async fn field_step(
        &self,
        Parameters(req): Parameters<StepRequest>,
    ) -> Result<CallToolResult, McpError> {
        let ticks = req.ticks.unwrap_or(1);
        let mut state = self.state.lock().await;
        let engine = &mut state.field.engine;

        let mut max_drift = 0.0_f64;
        let mut folds = 0;
        let mut global_steps = 0;
        let mut halvings = 0;
        for _ in 0..ticks {
            let report = engine.tick(req.dt).map_err(field_error)?;
            max_drift = max_drift.max(report.cycle.relative_error);
            folds += report.folds.len();
            global_steps += usize::from(report.global.is_some());
            halvings = halvings.max(report.local.halvings);
        }
        let result = serde_json::json!({
            "ticks": engine.ticks(),
            "time": engine.time(),
            "total_energy": engine.total_energy(),
            "max_drift": max_drift,
            "max_halvings": halvings,
            "global_steps": global_steps,
            "folds": folds,
        });
        state.dirty = true;
        Ok(json_result(&result))
    }

    #[tool(
        description = "Evaluate an operation through the hybrid router. Light work runs in-process; heavy work (entanglement, superposition collapse, large global evolution) goes to the remote compute service when one is configured and falls back to local on failure. Evolved amplitudes are written back unless the field ticked in the meantime."
    )]
    async fn field_dispatch(
        &self,
        Parameters(req): Parameters<DispatchRequest>,
    ) -> Result<CallToolResult, McpError> {
        let ids = req
            .entities
            .iter()
            .map(|id| parse_entity(id))
            .collect::<Result<Vec<_>, _>>()?;
        let single = || {
            ids.first().copied().ok_or_else(|| {
                McpError::invalid_params(format!("op '{}' needs an entity", req.op), None)
            })
        };

        let (op, request, versions) = {
            let state = self.state.lock().await;
            let engine = &state.field.engine;
            let op = match req.op.as_str() {
                "propagate" => ComputeOp::Propagate { entity: single()? },
                "observe" => ComputeOp::Observe {
                    entity: single()?,
                    kind: parse_kind(req.kind.as_deref())?,
                },
                "entangle" => ComputeOp::Entangle {
                    entities: ids.clone(),
                },
                "collapse_superposition" => ComputeOp::CollapseSuperposition {
                    entities: ids.clone(),
                },
                "global_evolution" => ComputeOp::GlobalEvolution {
                    active_regions: engine.index().len(),
                },
                other => {
                    return Err(McpError::invalid_params(
                        format!("unknown op '{other}'"),
                        None,
                    ));
                }
            };
            let batch = match &op {
                ComputeOp::GlobalEvolution { .. } => engine.entity_ids(),
                other => other.entities(),
            };
            let observations = match &op {
                ComputeOp::Observe { entity, kind } => vec![ObservationSpec {
                    entity_id: *entity,
                    kind: *kind,
                }],
                _ => Vec::new(),
            };
            let dt = req.dt.unwrap_or(engine.config().dt);
            let request = engine
                .compute_request(&batch, observations, dt)
                .map_err(field_error)?;
            let versions = engine.batch_versions(&batch).map_err(field_error)?;
            (op, request, versions)
        };

        let dispatch = self
            .router
            .dispatch(&op, &request, &self.cancel)
            .await
            .map_err(|e| match e {
                RouterError::Field(e) => field_error(e),
                e => McpError::internal_error(e.to_string(), None),
            })?;

        let mut state = self.state.lock().await;
        let (applied, stale) = match state
            .field
            .engine
            .apply_evolved(&dispatch.response, &versions)
        {
            Ok(n) => {
                state.dirty |= n > 0;
                (n, false)
            }
            Err(FieldError::ConcurrentEvolutionConflict { coord, .. }) => {
                tracing::debug!(op = %req.op, %coord, "cell written during dispatch, discarding result");
                (0, true)
            }
            Err(e) => return Err(field_error(e)),
        };

        Ok(json_result(&serde_json::json!({
            "class": dispatch.class.as_str(),
            "backend": dispatch.backend.as_str(),
            "degraded": dispatch.response.degraded,
            "elapsed_ms": dispatch.elapsed.as_secs_f64() * 1e3,
            "applied": applied,
            "stale": stale,
            "measurements": dispatch.response.measurements,
        })))
    }

    #[tool(
        description = "Field statistics: time, node and entity counts, energy split between amplitudes and vacuum, step timings, conservation drift and router latency."
    )]
    async fn field_stats(&self) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        let result = serde_json::json!({
            "field": state.field.engine.stats(),
            "router": self.router.stats(),
        });
        Ok(json_result(&result))
    }
}

#[tool_handler]
impl ServerHandler for FieldServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Cognitive field engine. Concepts live on a 256x256x256 valence/arousal/epistemic grid \
                 (cells -128..=127 per axis) as complex excitations that couple to excited neighbours \
                 and conserve energy.\n\n\
                 - field_excite adds energy at a cell, optionally bound to an entity UUID.\n\
                 - field_observe measures an entity or cell; it collapses into a particle for a short \
                   window and folds back automatically (or via field_release).\n\
                 - The field ticks in the background; field_step advances it explicitly.\n\
                 - field_dispatch evaluates multi-entity work through the local/remote router.\n\
                 - field_stats reports energy, timings and router health."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliConfig;
    use cf_core::{EngineConfig, FieldEngine};
    use cf_router::RouterConfig;
    use cf_store::Store;

    fn make_server() -> FieldServer {
        let config = CliConfig {
            engine: EngineConfig {
                observation_window: 100.0,
                ..EngineConfig::default()
            },
            maintenance_interval_ms: 10,
            persist_every: 1,
            ..CliConfig::default()
        };
        let field = Field {
            engine: FieldEngine::with_seed(config.engine.clone(), 11),
            store: Store::open_in_memory().unwrap(),
            config,
        };
        FieldServer::new(field).unwrap()
    }

    fn text_from_result(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn parse_result(result: &CallToolResult) -> serde_json::Value {
        let text = text_from_result(result);
        serde_json::from_str(&text).expect("handler should return valid JSON")
    }

    async fn excite(server: &FieldServer, v: i64, entity: Option<Uuid>) -> serde_json::Value {
        let result = server
            .field_excite(Parameters(ExciteRequest {
                v,
                a: 0,
                e: 0,
                magnitude: Some(1.0),
                entity: entity.map(|id| id.to_string()),
            }))
            .await
            .unwrap();
        parse_result(&result)
    }

    fn entity_target(id: Uuid) -> TargetRequest {
        TargetRequest {
            entity: Some(id.to_string()),
            v: None,
            a: None,
            e: None,
        }
    }

    #[tokio::test]
    async fn test_field_stats_empty() {
        let server = make_server();
        let json = parse_result(&server.field_stats().await.unwrap());

        assert_eq!(json["field"]["nodes"], 0);
        assert_eq!(json["field"]["entities"], 0);
        assert_eq!(json["field"]["total_energy"], 0.0);
        assert!(json["router"]["remote_endpoint"].is_null());
    }

    #[tokio::test]
    async fn test_field_excite() {
        let server = make_server();
        let id = Uuid::new_v4();
        let json = excite(&server, 3, Some(id)).await;

        assert_eq!(json["coordinate"], serde_json::json!([3, 0, 0]));
        assert_eq!(json["entity"], id.to_string());
        assert!(json["energy"].as_f64().unwrap() > 1.0);

        let stats = parse_result(&server.field_stats().await.unwrap());
        assert_eq!(stats["field"]["nodes"], 1);
        assert_eq!(stats["field"]["entities"], 1);
    }

    #[tokio::test]
    async fn test_field_excite_rejects_off_grid() {
        let server = make_server();
        let err = server
            .field_excite(Parameters(ExciteRequest {
                v: 300,
                a: 0,
                e: 0,
                magnitude: None,
                entity: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_observe_then_release() {
        let server = make_server();
        let id = Uuid::new_v4();
        excite(&server, 0, Some(id)).await;

        let observed = parse_result(
            &server
                .field_observe(Parameters(ObserveRequest {
                    target: entity_target(id),
                    kind: Some("resonance".into()),
                    context: Some("test".into()),
                }))
                .await
                .unwrap(),
        );
        assert_eq!(observed["vacuum"], false);
        assert_eq!(observed["extended"], false);
        assert_eq!(observed["measurement"]["kind"], "resonance");

        let stats = parse_result(&server.field_stats().await.unwrap());
        assert_eq!(stats["field"]["collapsed"], 1);

        let released = parse_result(
            &server
                .field_release(Parameters(entity_target(id)))
                .await
                .unwrap(),
        );
        assert_eq!(released["released"], true);
        let before = released["energy_before"].as_f64().unwrap();
        let after = released["energy_after"].as_f64().unwrap();
        assert!((before - after).abs() < 1e-9);

        let again = parse_result(
            &server
                .field_release(Parameters(entity_target(id)))
                .await
                .unwrap(),
        );
        assert_eq!(again["released"], false);
    }

    #[tokio::test]
    async fn test_observe_vacuum_cell() {
        let server = make_server();
        let json = parse_result(
            &server
                .field_observe(Parameters(ObserveRequest {
                    target: TargetRequest {
                        entity: None,
                        v: Some(-5),
                        a: Some(7),
                        e: Some(1),
                    },
                    kind: None,
                    context: None,
                }))
                .await
                .unwrap(),
        );
        assert_eq!(json["vacuum"], true);
        assert_eq!(json["measurement"]["collapse_probability"], 0.0);

        let stats = parse_result(&server.field_stats().await.unwrap());
        assert_eq!(stats["field"]["nodes"], 0);
    }

    #[tokio::test]
    async fn test_observe_needs_a_target() {
        let server = make_server();
        let err = server
            .field_observe(Parameters(ObserveRequest {
                target: TargetRequest {
                    entity: None,
                    v: Some(1),
                    a: None,
                    e: None,
                },
                kind: None,
                context: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_field_step_conserves_energy() {
        let server = make_server();
        excite(&server, 0, None).await;
        excite(&server, 1, None).await;
        let before = parse_result(&server.field_stats().await.unwrap())["field"]["total_energy"]
            .as_f64()
            .unwrap();

        let json = parse_result(
            &server
                .field_step(Parameters(StepRequest {
                    ticks: Some(12),
                    dt: None,
                }))
                .await
                .unwrap(),
        );
        assert_eq!(json["ticks"], 12);
        assert!(json["global_steps"].as_u64().unwrap() >= 1);
        let after = json["total_energy"].as_f64().unwrap();
        assert!(((after - before) / before).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_field_dispatch_runs_locally() {
        let server = make_server();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        excite(&server, 0, Some(a)).await;
        excite(&server, 2, Some(b)).await;

        let json = parse_result(
            &server
                .field_dispatch(Parameters(DispatchRequest {
                    op: "entangle".into(),
                    entities: vec![a.to_string(), b.to_string()],
                    kind: None,
                    dt: Some(0.1),
                }))
                .await
                .unwrap(),
        );
        assert_eq!(json["class"], "heavy");
        assert_eq!(json["backend"], "local");
        assert_eq!(json["degraded"], false);
        assert_eq!(json["applied"], 2);

        let stats = parse_result(&server.field_stats().await.unwrap());
        assert_eq!(stats["router"]["heavy"]["count"], 1);
    }

    #[tokio::test]
    async fn test_field_dispatch_observe_reports_measurement() {
        let server = make_server();
        let id = Uuid::new_v4();
        excite(&server, 4, Some(id)).await;

        let json = parse_result(
            &server
                .field_dispatch(Parameters(DispatchRequest {
                    op: "observe".into(),
                    entities: vec![id.to_string()],
                    kind: Some("similarity".into()),
                    dt: None,
                }))
                .await
                .unwrap(),
        );
        assert_eq!(json["class"], "light");
        assert_eq!(json["measurements"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_global_evolution_sized_by_materialized_cells() {
        let server = make_server();
        for i in 0..30 {
            excite(&server, i * 8 - 120, None).await;
        }
        let regions = server.state.lock().await.field.engine.index().region_count();
        assert!(regions > RouterConfig::default().heavy_global_threshold);

        let json = parse_result(
            &server
                .field_dispatch(Parameters(DispatchRequest {
                    op: "global_evolution".into(),
                    entities: Vec::new(),
                    kind: None,
                    dt: None,
                }))
                .await
                .unwrap(),
        );
        assert_eq!(json["class"], "light");
        assert_eq!(json["stale"], false);
    }

    #[tokio::test]
    async fn test_field_dispatch_rejects_bad_input() {
        let server = make_server();
        let unknown = server
            .field_dispatch(Parameters(DispatchRequest {
                op: "teleport".into(),
                entities: Vec::new(),
                kind: None,
                dt: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(unknown.code, ErrorCode::INVALID_PARAMS);

        let missing = server
            .field_dispatch(Parameters(DispatchRequest {
                op: "propagate".into(),
                entities: vec![Uuid::new_v4().to_string()],
                kind: None,
                dt: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(missing.code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_maintenance_ticks_and_persists() {
        let server = make_server();
        let id = Uuid::new_v4();
        excite(&server, 0, Some(id)).await;

        let task = server.spawn_maintenance();
        tokio::time::sleep(Duration::from_millis(80)).await;
        server.shutdown();
        task.await.unwrap().unwrap();

        let state = server.state.lock().await;
        assert!(state.field.engine.ticks() > 0);
        assert!(!state.dirty);
        let saved = state.field.store.load_snapshot().unwrap();
        assert_eq!(saved.ticks, state.field.engine.ticks());
        assert_eq!(saved.entities.len(), 1);
    }

    #[test]
    fn test_tool_registration() {
        let server = make_server();
        let info = server.get_info();

        assert!(info.instructions.is_some());
        assert!(info.capabilities.tools.is_some());
    }
}
