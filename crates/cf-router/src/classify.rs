use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cf_core::ObservationKind;

/// An operation the caller wants evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum ComputeOp {
    /// Propagate one entity's excitation.
    Propagate { entity: Uuid },
    /// Measure one entity.
    Observe { entity: Uuid, kind: ObservationKind },
    /// Evolve several entities jointly.
    Entangle { entities: Vec<Uuid> },
    /// Collapse the full superposition of the given entities.
    CollapseSuperposition { entities: Vec<Uuid> },
    /// Global evolution over this many active regions.
    GlobalEvolution { active_regions: usize },
}

impl ComputeOp {
    /// Entities the batch has to carry.
    pub fn entities(&self) -> Vec<Uuid> {
        match self {
            ComputeOp::Propagate { entity } | ComputeOp::Observe { entity, .. } => vec![*entity],
            ComputeOp::Entangle { entities } | ComputeOp::CollapseSuperposition { entities } => {
                entities.clone()
            }
            ComputeOp::GlobalEvolution { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeClass {
    Light,
    Heavy,
}

impl ComputeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ComputeClass::Light => "light",
            ComputeClass::Heavy => "heavy",
        }
    }
}

/// Pure classification, first matching rule wins.
pub fn classify(op: &ComputeOp, heavy_global_threshold: usize) -> ComputeClass {
    match op {
        ComputeOp::Entangle { entities } if entities.len() >= 2 => ComputeClass::Heavy,
        ComputeOp::CollapseSuperposition { .. } => ComputeClass::Heavy,
        ComputeOp::GlobalEvolution { active_regions } if *active_regions > heavy_global_threshold => {
            ComputeClass::Heavy
        }
        _ => ComputeClass::Light,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entanglement_needs_two() {
        let one = ComputeOp::Entangle {
            entities: vec![Uuid::new_v4()],
        };
        let two = ComputeOp::Entangle {
            entities: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        assert_eq!(classify(&one, 64), ComputeClass::Light);
        assert_eq!(classify(&two, 64), ComputeClass::Heavy);
    }

    #[test]
    fn test_superposition_collapse_is_heavy() {
        let op = ComputeOp::CollapseSuperposition {
            entities: vec![Uuid::new_v4()],
        };
        assert_eq!(classify(&op, 64), ComputeClass::Heavy);
    }

    #[test]
    fn test_global_threshold_is_exclusive() {
        let at = |n| ComputeOp::GlobalEvolution { active_regions: n };
        assert_eq!(classify(&at(64), 64), ComputeClass::Light);
        assert_eq!(classify(&at(65), 64), ComputeClass::Heavy);
    }

    #[test]
    fn test_single_entity_work_is_light() {
        let id = Uuid::new_v4();
        assert_eq!(classify(&ComputeOp::Propagate { entity: id }, 0), ComputeClass::Light);
        let observe = ComputeOp::Observe {
            entity: id,
            kind: ObservationKind::DirectAccess,
        };
        assert_eq!(classify(&observe, 0), ComputeClass::Light);
    }

    #[test]
    fn test_op_json_shape() {
        let op: ComputeOp =
            serde_json::from_str(r#"{"op": "global_evolution", "active_regions": 3}"#).unwrap();
        assert_eq!(op, ComputeOp::GlobalEvolution { active_regions: 3 });
        assert!(op.entities().is_empty());
    }
}
