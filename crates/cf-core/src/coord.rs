//! Quantized coordinates on the periodic valence/arousal/epistemic grid.
//!
//! Every axis holds 256 cells in `[-128, 127]` and wraps at the boundary,
//! so the grid is a 3-torus with no edges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{AXIS_MAX, AXIS_MIN, AXIS_PERIOD};
use crate::error::{FieldError, Result};

/// One of the three semantic axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Valence,
    Arousal,
    Epistemic,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::Valence, Axis::Arousal, Axis::Epistemic];

    pub fn index(self) -> usize {
        match self {
            Self::Valence => 0,
            Self::Arousal => 1,
            Self::Epistemic => 2,
        }
    }

    pub fn from_index(i: usize) -> Self {
        match i % 3 {
            0 => Self::Valence,
            1 => Self::Arousal,
            _ => Self::Epistemic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valence => "valence",
            Self::Arousal => "arousal",
            Self::Epistemic => "epistemic",
        }
    }
}

/// A cell on the grid. Always in range: the only constructors validate or wrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "[i64; 3]", into = "[i64; 3]")]
pub struct QuantizedCoordinate {
    v: i16,
    a: i16,
    e: i16,
}

impl QuantizedCoordinate {
    pub const ORIGIN: Self = Self { v: 0, a: 0, e: 0 };

    /// Validate raw grid integers. Values outside `[-128, 127]` are rejected.
    pub fn new(v: i64, a: i64, e: i64) -> Result<Self> {
        let in_range = |x: i64| (AXIS_MIN as i64..=AXIS_MAX as i64).contains(&x);
        if in_range(v) && in_range(a) && in_range(e) {
            Ok(Self {
                v: v as i16,
                a: a as i16,
                e: e as i16,
            })
        } else {
            Err(FieldError::out_of_range(v, a, e))
        }
    }

    /// Wrap arbitrary integers onto the torus.
    pub fn wrapping(v: i64, a: i64, e: i64) -> Self {
        Self {
            v: wrap(v),
            a: wrap(a),
            e: wrap(e),
        }
    }

    pub fn v(&self) -> i16 {
        self.v
    }

    pub fn a(&self) -> i16 {
        self.a
    }

    pub fn e(&self) -> i16 {
        self.e
    }

    pub fn get(&self, axis: Axis) -> i16 {
        match axis {
            Axis::Valence => self.v,
            Axis::Arousal => self.a,
            Axis::Epistemic => self.e,
        }
    }

    pub fn to_array(self) -> [i16; 3] {
        [self.v, self.a, self.e]
    }

    /// Step `delta` cells along `axis`, wrapping at the boundary.
    pub fn offset(self, axis: Axis, delta: i64) -> Self {
        let mut out = self;
        match axis {
            Axis::Valence => out.v = wrap((self.v as i64).wrapping_add(delta)),
            Axis::Arousal => out.a = wrap((self.a as i64).wrapping_add(delta)),
            Axis::Epistemic => out.e = wrap((self.e as i64).wrapping_add(delta)),
        }
        out
    }

    /// The six face neighbours, ordered (-v, +v, -a, +a, -e, +e).
    pub fn face_neighbors(self) -> [Self; 6] {
        [
            self.offset(Axis::Valence, -1),
            self.offset(Axis::Valence, 1),
            self.offset(Axis::Arousal, -1),
            self.offset(Axis::Arousal, 1),
            self.offset(Axis::Epistemic, -1),
            self.offset(Axis::Epistemic, 1),
        ]
    }

    /// Minimum-image distance along one axis, in `[0, 128]`.
    pub fn axis_distance(self, other: Self, axis: Axis) -> i32 {
        let d = (self.get(axis) as i32 - other.get(axis) as i32).rem_euclid(AXIS_PERIOD);
        d.min(AXIS_PERIOD - d)
    }

    pub fn distances(self, other: Self) -> [i32; 3] {
        [
            self.axis_distance(other, Axis::Valence),
            self.axis_distance(other, Axis::Arousal),
            self.axis_distance(other, Axis::Epistemic),
        ]
    }

    pub fn chebyshev_distance(self, other: Self) -> i32 {
        self.distances(other).into_iter().max().unwrap_or(0)
    }

    /// Offset of each axis from AXIS_MIN, in `[0, 255]`.
    pub fn grid_offsets(self) -> [u32; 3] {
        [
            (self.v as i32 - AXIS_MIN as i32) as u32,
            (self.a as i32 - AXIS_MIN as i32) as u32,
            (self.e as i32 - AXIS_MIN as i32) as u32,
        ]
    }

    /// Row-major index over the whole grid. Stable ordering for transforms.
    pub fn linear_index(self) -> u32 {
        let [v, a, e] = self.grid_offsets();
        (v << 16) | (a << 8) | e
    }

    /// Cell centre in normalized units, `[-1, 1)` per axis.
    pub fn to_normalized(self) -> [f64; 3] {
        let half = AXIS_PERIOD as f64 / 2.0;
        [
            (self.v as f64 + 0.5) / half,
            (self.a as f64 + 0.5) / half,
            (self.e as f64 + 0.5) / half,
        ]
    }
}

impl fmt::Display for QuantizedCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.v, self.a, self.e)
    }
}

impl TryFrom<[i64; 3]> for QuantizedCoordinate {
    type Error = FieldError;

    fn try_from(raw: [i64; 3]) -> Result<Self> {
        Self::new(raw[0], raw[1], raw[2])
    }
}

impl From<QuantizedCoordinate> for [i64; 3] {
    fn from(c: QuantizedCoordinate) -> Self {
        [c.v as i64, c.a as i64, c.e as i64]
    }
}

// Wrapping i64 arithmetic is exact modulo 2^64, which the period divides.
fn wrap(x: i64) -> i16 {
    (x.wrapping_sub(AXIS_MIN as i64).rem_euclid(AXIS_PERIOD as i64) + AXIS_MIN as i64) as i16
}

/// Maps continuous semantic measurements onto the grid.
///
/// One normalized unit spans half the period, so `[-1, 1)` covers every cell
/// exactly once; values outside wrap around.
#[derive(Clone, Copy, Debug, Default)]
pub struct Quantizer;

impl Quantizer {
    pub fn quantize(&self, measurement: [f64; 3]) -> Result<QuantizedCoordinate> {
        if measurement.iter().any(|x| !x.is_finite()) {
            return Err(FieldError::out_of_range(i64::MAX, i64::MAX, i64::MAX));
        }
        let half = AXIS_PERIOD as f64 / 2.0;
        // reduce onto one period (2 normalized units) before leaving f64
        let cell = |x: f64| (x.rem_euclid(2.0) * half).floor() as i64;
        Ok(QuantizedCoordinate::wrapping(
            cell(measurement[0]),
            cell(measurement[1]),
            cell(measurement[2]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rejects_out_of_range() {
        assert!(QuantizedCoordinate::new(127, -128, 0).is_ok());
        assert!(matches!(
            QuantizedCoordinate::new(128, 0, 0),
            Err(FieldError::OutOfRangeCoordinate { v: 128, .. })
        ));
        assert!(QuantizedCoordinate::new(0, -129, 0).is_err());
    }

    #[test]
    fn test_offset_wraps() {
        let edge = QuantizedCoordinate::new(127, 0, -128).unwrap();
        let stepped = edge.offset(Axis::Valence, 1).offset(Axis::Epistemic, -1);
        assert_eq!(stepped, QuantizedCoordinate::new(-128, 0, 127).unwrap());
    }

    #[test]
    fn test_distance_is_minimum_image() {
        let a = QuantizedCoordinate::new(127, 0, 0).unwrap();
        let b = QuantizedCoordinate::new(-128, 0, 0).unwrap();
        assert_eq!(a.axis_distance(b, Axis::Valence), 1);
        assert_eq!(a.chebyshev_distance(b), 1);

        let far = QuantizedCoordinate::new(0, 128 - 1, 0).unwrap();
        let origin = QuantizedCoordinate::ORIGIN;
        assert_eq!(origin.axis_distance(far, Axis::Arousal), 127);
    }

    #[test]
    fn test_face_neighbors_distinct_and_adjacent() {
        let c = QuantizedCoordinate::new(-128, 127, 5).unwrap();
        let n = c.face_neighbors();
        for (i, x) in n.iter().enumerate() {
            assert_eq!(c.chebyshev_distance(*x), 1);
            for y in &n[i + 1..] {
                assert_ne!(x, y);
            }
        }
    }

    #[test]
    fn test_quantize_origin_and_wrap() {
        let q = Quantizer;
        assert_eq!(q.quantize([0.0, 0.0, 0.0]).unwrap(), QuantizedCoordinate::ORIGIN);
        assert_eq!(
            q.quantize([1.0, 0.0, 0.0]).unwrap(),
            q.quantize([-1.0, 0.0, 0.0]).unwrap()
        );
        assert!(q.quantize([f64::NAN, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_huge_inputs_wrap_instead_of_overflowing() {
        let q = Quantizer;
        assert!(q.quantize([1e300, -1e300, f64::MAX]).is_ok());
        assert_eq!(
            q.quantize([4.0 + 0.5, 0.0, 0.0]).unwrap(),
            q.quantize([0.5, 0.0, 0.0]).unwrap()
        );

        let c = QuantizedCoordinate::new(127, -128, 0).unwrap();
        let far = c.offset(Axis::Valence, i64::MAX).offset(Axis::Arousal, i64::MIN);
        assert_eq!(far.get(Axis::Valence), 126);
        assert_eq!(far.get(Axis::Arousal), -128);
        assert_eq!(
            QuantizedCoordinate::wrapping(i64::MAX, i64::MIN, -1),
            QuantizedCoordinate::new(-1, 0, -1).unwrap()
        );
    }

    #[test]
    fn test_serde_rejects_out_of_range() {
        let ok: QuantizedCoordinate = serde_json::from_str("[1, -2, 3]").unwrap();
        assert_eq!(ok, QuantizedCoordinate::new(1, -2, 3).unwrap());
        assert!(serde_json::from_str::<QuantizedCoordinate>("[300, 0, 0]").is_err());
    }

    proptest! {
        #[test]
        fn prop_normalized_roundtrip(v in -128i64..=127, a in -128i64..=127, e in -128i64..=127) {
            let c = QuantizedCoordinate::new(v, a, e).unwrap();
            prop_assert_eq!(Quantizer.quantize(c.to_normalized()).unwrap(), c);
        }

        #[test]
        fn prop_wrapping_always_in_range(v in any::<i32>(), a in any::<i32>(), e in any::<i32>()) {
            let c = QuantizedCoordinate::wrapping(v as i64, a as i64, e as i64);
            let raw: [i64; 3] = c.into();
            prop_assert!(QuantizedCoordinate::try_from(raw).is_ok());
        }

        #[test]
        fn prop_quantize_accepts_any_finite(
            m in prop::array::uniform3(any::<f64>().prop_filter("finite", |x| x.is_finite()))
        ) {
            let c = Quantizer.quantize(m).unwrap();
            let raw: [i64; 3] = c.into();
            prop_assert!(QuantizedCoordinate::try_from(raw).is_ok());
        }
    }
}
