//! Routes compute batches between the in-process engine and a remote
//! compute service.
//!
//! Light operations always run locally. Heavy ones go to the remote
//! service when one is configured; if it fails after retries the batch is
//! evaluated locally and the response is marked `degraded`.

pub mod backend;
pub mod classify;
pub mod config;
pub mod error;
pub mod latency;
pub mod local;
pub mod remote;
pub mod retry;
pub mod router;

pub use backend::{BackendKind, ComputeBackend};
pub use classify::{ComputeClass, ComputeOp, classify};
pub use config::RouterConfig;
pub use error::{Result, RouterError};
pub use latency::LatencyTracker;
pub use local::LocalBackend;
pub use remote::RemoteBackend;
pub use retry::RetryConfig;
pub use router::{Dispatch, HybridRouter, RouterStats};
