use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cf_core::{ComputeRequest, ComputeResponse, EngineConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendKind, ComputeBackend};
use crate::classify::{ComputeClass, ComputeOp, classify};
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::latency::LatencyTracker;
use crate::local::LocalBackend;
use crate::remote::RemoteBackend;

/// Outcome of one dispatched batch.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub class: ComputeClass,
    /// Backend that produced `response`.
    pub backend: BackendKind,
    pub response: ComputeResponse,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassLatency {
    pub count: u64,
    pub mean_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub remote_endpoint: Option<String>,
    pub remote_failures: u64,
    pub last_failure: Option<String>,
    pub light: ClassLatency,
    pub heavy: ClassLatency,
}

pub struct HybridRouter {
    config: RouterConfig,
    local: LocalBackend,
    remote: Option<RemoteBackend>,
    latency: LatencyTracker,
    remote_failures: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl HybridRouter {
    pub fn new(config: RouterConfig, engine_config: EngineConfig) -> Result<Self> {
        Self::with_local(config, LocalBackend::new(engine_config))
    }

    pub fn with_local(config: RouterConfig, local: LocalBackend) -> Result<Self> {
        let remote = config
            .endpoint
            .as_deref()
            .map(|endpoint| RemoteBackend::new(endpoint, config.timeout(), config.retry.clone()))
            .transpose()?;
        Ok(Self {
            config,
            local,
            remote,
            latency: LatencyTracker::default(),
            remote_failures: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn classify(&self, op: &ComputeOp) -> ComputeClass {
        classify(op, self.config.heavy_global_threshold)
    }

    /// Route `request` by the class of `op`. A failed remote batch is
    /// recomputed locally and marked degraded; cancellation is never
    /// retried or degraded.
    pub async fn dispatch(
        &self,
        op: &ComputeOp,
        request: &ComputeRequest,
        cancel: &CancellationToken,
    ) -> Result<Dispatch> {
        let class = self.classify(op);
        let start = Instant::now();

        let (backend, response) = match (class, &self.remote) {
            (ComputeClass::Heavy, Some(remote)) => match remote.compute(request, cancel).await {
                Ok(response) => (remote.kind(), response),
                Err(RouterError::Cancelled) => return Err(RouterError::Cancelled),
                Err(e) => {
                    self.record_failure(&e);
                    let mut response = self.local.compute(request, cancel).await?;
                    response.degraded = true;
                    (self.local.kind(), response)
                }
            },
            _ => (self.local.kind(), self.local.compute(request, cancel).await?),
        };

        let elapsed = start.elapsed();
        self.latency.record(class, elapsed);
        debug!(
            class = class.as_str(),
            backend = backend.as_str(),
            entities = request.entities.len(),
            degraded = response.degraded,
            elapsed_ms = elapsed.as_secs_f64() * 1e3,
            "dispatched"
        );
        Ok(Dispatch {
            class,
            backend,
            response,
            elapsed,
        })
    }

    fn record_failure(&self, error: &RouterError) {
        let total = self.remote_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(error = %error, total, "remote compute failed, falling back to local");
        if let Ok(mut last) = self.last_failure.lock() {
            *last = Some(error.to_string());
        }
    }

    pub fn remote_failures(&self) -> u64 {
        self.remote_failures.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn stats(&self) -> RouterStats {
        let class = |c| ClassLatency {
            count: self.latency.count(c),
            mean_ms: self.latency.mean(c).map(|d| d.as_secs_f64() * 1e3),
        };
        RouterStats {
            remote_endpoint: self.remote.as_ref().map(|r| r.endpoint().to_string()),
            remote_failures: self.remote_failures(),
            last_failure: self.last_failure.lock().ok().and_then(|l| l.clone()),
            light: class(ComputeClass::Light),
            heavy: class(ComputeClass::Heavy),
        }
    }
}
