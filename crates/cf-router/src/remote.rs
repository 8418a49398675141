use std::collections::HashSet;
use std::time::Duration;

use cf_core::{ComputeRequest, ComputeResponse, FieldError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendKind, ComputeBackend};
use crate::error::{Result, RouterError};
use crate::retry::RetryConfig;

/// POSTs the batch as JSON to a compute service.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl RemoteBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, retry: RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
            retry,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn attempt(&self, request: &ComputeRequest) -> Result<ComputeResponse> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<ComputeResponse>().await?)
    }
}

impl ComputeBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn compute(
        &self,
        request: &ComputeRequest,
        cancel: &CancellationToken,
    ) -> Result<ComputeResponse> {
        let mut attempt = 0;
        loop {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RouterError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RouterError::Cancelled),
                res = tokio::time::timeout(self.timeout, self.attempt(request)) => {
                    res.unwrap_or(Err(RouterError::Timeout(self.timeout)))
                }
            };

            match outcome {
                Ok(response) => {
                    validate(request, &response, attempt + 1)?;
                    debug!(endpoint = %self.endpoint, attempts = attempt + 1, "remote compute ok");
                    return Ok(response);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    warn!(endpoint = %self.endpoint, attempt, error = %e, "remote compute attempt failed, retrying");
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(FieldError::RemoteComputeFailure {
                        attempts: attempt + 1,
                        message: e.to_string(),
                    }
                    .into());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Every requested entity must come back exactly once with finite
/// amplitudes, and nothing else may come back.
fn validate(request: &ComputeRequest, response: &ComputeResponse, attempts: u32) -> Result<()> {
    let fail = |message: String| -> RouterError {
        FieldError::RemoteComputeFailure { attempts, message }.into()
    };
    let requested: HashSet<_> = request.entities.iter().map(|e| e.entity_id).collect();
    let mut seen = HashSet::with_capacity(response.entities.len());
    for state in &response.entities {
        if !requested.contains(&state.entity_id) {
            return Err(fail(format!("unexpected entity {}", state.entity_id)));
        }
        if !state.is_finite() {
            return Err(fail(format!("non-finite amplitudes for {}", state.entity_id)));
        }
        if !seen.insert(state.entity_id) {
            return Err(fail(format!("duplicate entity {}", state.entity_id)));
        }
    }
    if let Some(missing) = request.entities.iter().find(|e| !seen.contains(&e.entity_id)) {
        return Err(fail(format!("missing entity {}", missing.entity_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::{EntityState, EvolvedState, FieldExcitation, QuantizedCoordinate};
    use uuid::Uuid;

    fn request() -> ComputeRequest {
        ComputeRequest {
            entities: vec![EntityState::new(
                Uuid::new_v4(),
                QuantizedCoordinate::ORIGIN,
                &FieldExcitation::from_magnitude(1.0),
            )],
            observations: Vec::new(),
            dt: 0.1,
        }
    }

    fn echo(req: &ComputeRequest) -> ComputeResponse {
        ComputeResponse {
            entities: req
                .entities
                .iter()
                .map(|e| EvolvedState::new(e.entity_id, &e.amplitudes()))
                .collect(),
            ..ComputeResponse::default()
        }
    }

    #[test]
    fn test_validate_accepts_echo() {
        let req = request();
        assert!(validate(&req, &echo(&req), 1).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_and_nan() {
        let req = request();
        assert!(validate(&req, &ComputeResponse::default(), 1).is_err());

        let mut bad = echo(&req);
        bad.entities[0].re[1] = f64::NAN;
        assert!(validate(&req, &bad, 1).is_err());

        let mut doubled = echo(&req);
        doubled.entities.push(doubled.entities[0].clone());
        assert!(validate(&req, &doubled, 1).is_err());
    }

    #[test]
    fn test_validate_rejects_unrequested_entity() {
        let req = request();
        let mut extra = echo(&req);
        extra.entities.push(EvolvedState::new(
            Uuid::new_v4(),
            &FieldExcitation::from_magnitude(1.0).amplitudes,
        ));
        let err = validate(&req, &extra, 1).unwrap_err();
        assert!(err.to_string().contains("unexpected entity"), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_exhausts_retries() {
        let retry = RetryConfig {
            max_retries: 1,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_factor: 1.0,
        };
        // port 9 (discard) on loopback: connection refused
        let backend =
            RemoteBackend::new("http://127.0.0.1:9/compute", Duration::from_millis(200), retry)
                .unwrap();
        let err = backend
            .compute(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                RouterError::Field(FieldError::RemoteComputeFailure { attempts: 2, .. })
            ),
            "{err}"
        );
    }
}
