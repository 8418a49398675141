use cf_core::{ComputeRequest, ComputeResponse, EngineConfig, FieldEngine};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendKind, ComputeBackend};
use crate::error::{Result, RouterError};

/// In-process evaluation on a scratch engine, off the async threads.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: EngineConfig,
    seed: Option<u64>,
}

impl LocalBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, seed: None }
    }

    /// Deterministic measurement draws, for tests and replays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl ComputeBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn compute(
        &self,
        request: &ComputeRequest,
        cancel: &CancellationToken,
    ) -> Result<ComputeResponse> {
        if cancel.is_cancelled() {
            return Err(RouterError::Cancelled);
        }
        let request = request.clone();
        let config = self.config.clone();
        let seed = self.seed;
        let task = tokio::task::spawn_blocking(move || {
            let mut rng = match seed {
                Some(seed) => SmallRng::seed_from_u64(seed),
                None => SmallRng::from_os_rng(),
            };
            FieldEngine::evaluate(&request, &config, &mut rng)
        });
        tokio::select! {
            _ = cancel.cancelled() => Err(RouterError::Cancelled),
            joined = task => Ok(joined??),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::{EntityState, FieldExcitation, ObservationKind, ObservationSpec, QuantizedCoordinate};
    use uuid::Uuid;

    fn request(n: i64) -> ComputeRequest {
        let entities = (0..n)
            .map(|i| {
                EntityState::new(
                    Uuid::new_v4(),
                    QuantizedCoordinate::new(i, 0, 0).unwrap(),
                    &FieldExcitation::from_magnitude(1.0),
                )
            })
            .collect::<Vec<_>>();
        let observations = vec![ObservationSpec {
            entity_id: entities[0].entity_id,
            kind: ObservationKind::Attention,
        }];
        ComputeRequest {
            entities,
            observations,
            dt: 0.1,
        }
    }

    #[tokio::test]
    async fn test_local_evaluates_batch() {
        let backend = LocalBackend::new(EngineConfig::default()).with_seed(1);
        let req = request(3);
        let resp = backend.compute(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(resp.entities.len(), 3);
        assert_eq!(resp.measurements.len(), 1);
        assert!(!resp.degraded);
        assert!(resp.entities.iter().all(|e| e.is_finite()));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backend = LocalBackend::new(EngineConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend.compute(&request(1), &cancel).await.unwrap_err();
        assert!(matches!(err, RouterError::Cancelled));
    }
}
