use std::future::Future;

use cf_core::{ComputeRequest, ComputeResponse};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Remote,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        }
    }
}

/// Evaluates one batch: evolve by `request.dt`, then run the requested
/// observations. Implementations must stop promptly once `cancel` fires.
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn compute(
        &self,
        request: &ComputeRequest,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ComputeResponse>> + Send;
}
