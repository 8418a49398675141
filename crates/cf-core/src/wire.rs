//! Batched request/response shapes for the compute-service boundary.
//!
//! This module is the single definition of these shapes; the store, the
//! router and the CLI all consume it. Serialized as JSON.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coord::QuantizedCoordinate;
use crate::excitation::FieldExcitation;
use crate::observe::ObservationKind;

/// One entity's coordinate and per-axis amplitudes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: Uuid,
    pub coordinate: QuantizedCoordinate,
    pub re: [f64; 3],
    pub im: [f64; 3],
}

impl EntityState {
    pub fn new(entity_id: Uuid, coordinate: QuantizedCoordinate, excitation: &FieldExcitation) -> Self {
        let (re, im) = split(&excitation.amplitudes);
        Self {
            entity_id,
            coordinate,
            re,
            im,
        }
    }

    pub fn amplitudes(&self) -> [Complex64; 3] {
        join(self.re, self.im)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationSpec {
    pub entity_id: Uuid,
    pub kind: ObservationKind,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub entities: Vec<EntityState>,
    #[serde(default)]
    pub observations: Vec<ObservationSpec>,
    pub dt: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvolvedState {
    pub entity_id: Uuid,
    pub re: [f64; 3],
    pub im: [f64; 3],
}

impl EvolvedState {
    pub fn new(entity_id: Uuid, amplitudes: &[Complex64; 3]) -> Self {
        let (re, im) = split(amplitudes);
        Self { entity_id, re, im }
    }

    pub fn amplitudes(&self) -> [Complex64; 3] {
        join(self.re, self.im)
    }

    pub fn is_finite(&self) -> bool {
        self.re.iter().chain(self.im.iter()).all(|x| x.is_finite())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub entity_id: Uuid,
    pub value: f64,
    pub collapse_probability: f64,
    pub collapsed_coordinate: QuantizedCoordinate,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeResponse {
    pub entities: Vec<EvolvedState>,
    #[serde(default)]
    pub measurements: Vec<MeasurementResult>,
    /// Produced by the local fallback after the remote path failed.
    #[serde(default)]
    pub degraded: bool,
}

fn split(amplitudes: &[Complex64; 3]) -> ([f64; 3], [f64; 3]) {
    (amplitudes.map(|z| z.re), amplitudes.map(|z| z.im))
}

fn join(re: [f64; 3], im: [f64; 3]) -> [Complex64; 3] {
    [
        Complex64::new(re[0], im[0]),
        Complex64::new(re[1], im[1]),
        Complex64::new(re[2], im[2]),
    ]
}
