// src/quantization/mod.rs
//! Quantization interval algebra.
//!
//! A FakeQuantize node simulates integer arithmetic in real numbers through a
//! [`QuantizationInterval`]. Decomposition turns that interval into integer
//! codes plus an affine correction:
//!
//! ```text
//! scale     = (high - low) / (levels - 1)
//! zeroPoint = codeLow - round(low / scale)
//! value     = (code - zeroPoint) * scale
//! ```
//!
//! `low` / `high` are the bounds the FakeQuantize emits. Every other rule in
//! the crate only moves, merges, or re-slices the `(scale, zeroPoint)` pair
//! produced here.
//!
//! Rounding is `f32::round` (half away from zero).

pub mod dequantization;
pub mod restrictions;

use crate::graph::Precision;

// ===========================================================================
// Interval
// ===========================================================================

/// `(levels, inputLow, inputHigh, outputLow, outputHigh)` of a FakeQuantize.
///
/// Each bound holds one value (per-tensor) or one value per channel of the
/// channel axis.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationInterval {
    pub levels: u32,
    pub input_low: Vec<f32>,
    pub input_high: Vec<f32>,
    pub output_low: Vec<f32>,
    pub output_high: Vec<f32>,
}

/// Bound `v` at `channel`, broadcasting a single value.
pub(crate) fn at(v: &[f32], channel: usize) -> f32 {
    if v.len() == 1 {
        v[0]
    } else {
        v[channel]
    }
}

impl QuantizationInterval {
    /// Per-tensor interval.
    pub fn new(levels: u32, input_low: f32, input_high: f32, output_low: f32, output_high: f32) -> Self {
        Self {
            levels,
            input_low: vec![input_low],
            input_high: vec![input_high],
            output_low: vec![output_low],
            output_high: vec![output_high],
        }
    }

    /// Interval whose input and output bounds coincide.
    pub fn symmetric_io(levels: u32, low: f32, high: f32) -> Self {
        Self::new(levels, low, high, low, high)
    }

    pub fn per_channel(
        levels: u32,
        input_low: Vec<f32>,
        input_high: Vec<f32>,
        output_low: Vec<f32>,
        output_high: Vec<f32>,
    ) -> Self {
        Self {
            levels,
            input_low,
            input_high,
            output_low,
            output_high,
        }
    }

    /// Length of the per-channel vectors, if any bound is a vector.
    pub fn channels(&self) -> Option<usize> {
        [&self.input_low, &self.input_high, &self.output_low, &self.output_high]
            .iter()
            .map(|v| v.len())
            .filter(|&n| n > 1)
            .max()
    }

    pub fn is_per_channel(&self) -> bool {
        self.channels().is_some()
    }

    /// Check the interval against the invariants decomposition relies on.
    ///
    /// `channel_extent` is the static extent of the channel axis of the data
    /// the interval applies to, when known.
    pub fn validate(&self, channel_extent: Option<usize>) -> Result<(), String> {
        if self.levels < 2 {
            return Err(format!("levels must be at least 2, got {}", self.levels));
        }
        let bounds = [
            ("inputLow", &self.input_low),
            ("inputHigh", &self.input_high),
            ("outputLow", &self.output_low),
            ("outputHigh", &self.output_high),
        ];
        let n = self.channels().unwrap_or(1);
        for (name, v) in bounds {
            if v.is_empty() {
                return Err(format!("{name} is empty"));
            }
            if v.len() != 1 && v.len() != n {
                return Err(format!("{name} has {} values, other bounds have {n}", v.len()));
            }
            if v.iter().any(|x| !x.is_finite()) {
                return Err(format!("{name} contains a non-finite value"));
            }
        }
        if let (Some(n), Some(extent)) = (self.channels(), channel_extent) {
            if n != extent {
                return Err(format!(
                    "per-channel vector length {n} does not match channel axis extent {extent}"
                ));
            }
        }
        for c in 0..n {
            let (il, ih) = (at(&self.input_low, c), at(&self.input_high, c));
            if ih <= il {
                return Err(format!("channel {c}: inputHigh {ih} must exceed inputLow {il}"));
            }
            let (ol, oh) = (at(&self.output_low, c), at(&self.output_high, c));
            if oh <= ol {
                return Err(format!(
                    "channel {c}: outputHigh {oh} must exceed outputLow {ol} (derived scale would not be positive)"
                ));
            }
        }
        Ok(())
    }

    /// Reference FakeQuantize semantics for one element of `channel`.
    pub fn fake_quantize(&self, x: f32, channel: usize) -> f32 {
        let (il, ih) = (at(&self.input_low, channel), at(&self.input_high, channel));
        let (ol, oh) = (at(&self.output_low, channel), at(&self.output_high, channel));
        if x <= il.min(ih) {
            ol
        } else if x > il.max(ih) {
            oh
        } else {
            let steps = (self.levels - 1) as f32;
            ((x - il) / (ih - il) * steps).round() / steps * (oh - ol) + ol
        }
    }
}

// ===========================================================================
// Integer code ranges
// ===========================================================================

/// Code range `[low, low + levels - 1]` a precision offers for `levels`
/// codes: unsigned types start at 0, signed types at `-(levels / 2)`.
pub fn code_range(precision: Precision, levels: u32) -> Option<(f32, f32)> {
    let (min, max) = precision.integer_range()?;
    if levels < 2 {
        return None;
    }
    let low = if precision.is_signed() {
        -((levels / 2) as f64)
    } else {
        0.0
    };
    let high = low + (levels - 1) as f64;
    if low < min || high > max {
        None
    } else {
        Some((low as f32, high as f32))
    }
}

/// Smallest storage width (8, 16, 32) able to hold `levels` codes.
pub fn required_bits(levels: u32) -> u32 {
    if levels <= 1 << 8 {
        8
    } else if levels <= 1 << 16 {
        16
    } else {
        32
    }
}

// ===========================================================================
// Decomposition
// ===========================================================================

/// Outcome of decomposing one FakeQuantize for a chosen precision.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationParams {
    pub precision: Precision,
    pub levels: u32,
    /// One entry per channel, or a single entry.
    pub scale: Vec<f32>,
    /// Value the Subtract removes; same length rules as `scale`.
    pub zero_point: Vec<f32>,
    /// Re-expressed FakeQuantize output bounds, in codes.
    pub output_low: Vec<f32>,
    pub output_high: Vec<f32>,
}

fn zero_point(code_low: f32, low: f32, scale: f32) -> f32 {
    // `+ 0.0` folds -0.0 into 0.0 so identity elision sees a plain zero
    code_low - (low / scale).round() + 0.0
}

/// Decompose `interval` into codes of `precision` plus `(scale, zeroPoint)`,
/// channel by channel.
pub fn decompose(interval: &QuantizationInterval, precision: Precision) -> Result<QuantizationParams, String> {
    let (code_low, code_high) = code_range(precision, interval.levels)
        .ok_or_else(|| format!("{precision} cannot hold {} levels", interval.levels))?;
    let n = interval.channels().unwrap_or(1);
    let steps = (interval.levels - 1) as f32;

    let mut scale = Vec::with_capacity(n);
    let mut zp = Vec::with_capacity(n);
    for c in 0..n {
        let (low, high) = (at(&interval.output_low, c), at(&interval.output_high, c));
        let s = (high - low) / steps;
        if !(s > 0.0) || !s.is_finite() {
            return Err(format!("channel {c}: derived scale {s} is not strictly positive"));
        }
        scale.push(s);
        zp.push(zero_point(code_low, low, s));
    }

    Ok(QuantizationParams {
        precision,
        levels: interval.levels,
        scale,
        zero_point: zp,
        output_low: vec![code_low],
        output_high: vec![code_high],
    })
}

/// One `(scale, zeroPoint)` pair shared by every FakeQuantize feeding a
/// per-tensor Concat.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedQuantization {
    pub precision: Precision,
    pub levels: u32,
    pub low: f32,
    pub high: f32,
    pub scale: f32,
    pub zero_point: f32,
    pub code_low: f32,
    pub code_high: f32,
}

/// Unify several intervals: `low = min(lows)`, `high = max(highs)`, then
/// derive the shared pair from the combined interval.
pub fn align<'a>(
    intervals: impl IntoIterator<Item = &'a QuantizationInterval>,
    precision: Precision,
) -> Result<SharedQuantization, String> {
    let mut levels = None;
    let mut low = f32::INFINITY;
    let mut high = f32::NEG_INFINITY;
    for interval in intervals {
        match levels {
            None => levels = Some(interval.levels),
            Some(l) if l != interval.levels => {
                return Err(format!("cannot align intervals with {l} and {} levels", interval.levels))
            }
            Some(_) => {}
        }
        low = interval.output_low.iter().copied().fold(low, f32::min);
        high = interval.output_high.iter().copied().fold(high, f32::max);
    }
    let levels = levels.ok_or_else(|| "no intervals to align".to_string())?;
    let (code_low, code_high) =
        code_range(precision, levels).ok_or_else(|| format!("{precision} cannot hold {levels} levels"))?;

    let scale = (high - low) / (levels - 1) as f32;
    if !(scale > 0.0) || !scale.is_finite() {
        return Err(format!("combined interval [{low}, {high}] gives non-positive scale {scale}"));
    }
    Ok(SharedQuantization {
        precision,
        levels,
        low,
        high,
        scale,
        zero_point: zero_point(code_low, low, scale),
        code_low,
        code_high,
    })
}

impl SharedQuantization {
    /// Re-express one branch's FakeQuantize output range against the shared
    /// pair: each bound becomes `round(bound / scale) + zeroPoint`, clamped to
    /// the code range.
    pub fn params_for(&self, interval: &QuantizationInterval) -> QuantizationParams {
        let to_code = |v: f32| ((v / self.scale).round() + self.zero_point).clamp(self.code_low, self.code_high) + 0.0;
        QuantizationParams {
            precision: self.precision,
            levels: self.levels,
            scale: vec![self.scale],
            zero_point: vec![self.zero_point],
            output_low: interval.output_low.iter().map(|&v| to_code(v)).collect(),
            output_high: interval.output_high.iter().map(|&v| to_code(v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_code_ranges() {
        assert_eq!(code_range(Precision::U8, 256), Some((0.0, 255.0)));
        assert_eq!(code_range(Precision::I8, 256), Some((-128.0, 127.0)));
        assert_eq!(code_range(Precision::I8, 255), Some((-127.0, 127.0)));
        assert_eq!(code_range(Precision::U8, 257), None);
        assert_eq!(code_range(Precision::F32, 256), None);
        assert_eq!(required_bits(256), 8);
        assert_eq!(required_bits(257), 16);
    }

    #[test]
    fn test_decompose_unsigned_without_zero_point() {
        let p = decompose(&QuantizationInterval::symmetric_io(256, 0.0, 2.55), Precision::U8).unwrap();
        assert!(close(p.scale[0], 0.01));
        assert_eq!(p.zero_point, vec![0.0]);
        assert_eq!((p.output_low[0], p.output_high[0]), (0.0, 255.0));
    }

    #[test]
    fn test_decompose_shifted_interval() {
        let p = decompose(&QuantizationInterval::symmetric_io(256, 1.275, 2.55), Precision::U8).unwrap();
        assert!(close(p.scale[0], 0.005));
        assert_eq!(p.zero_point, vec![-255.0]);
    }

    #[test]
    fn test_decompose_signed_symmetric_has_no_zero_point() {
        let p = decompose(&QuantizationInterval::symmetric_io(256, -1.28, 1.27), Precision::I8).unwrap();
        assert!(close(p.scale[0], 0.01));
        assert_eq!(p.zero_point, vec![0.0]);
        assert_eq!((p.output_low[0], p.output_high[0]), (-128.0, 127.0));
    }

    #[test]
    fn test_decompose_uses_output_bounds() {
        let interval = QuantizationInterval::new(256, 0.0, 1.0, 0.0, 25.5);
        let p = decompose(&interval, Precision::U8).unwrap();
        assert!(close(p.scale[0], 0.1));
    }

    #[test]
    fn test_decompose_per_channel() {
        let interval = QuantizationInterval::per_channel(
            256,
            vec![0.0],
            vec![2.55, 25.5],
            vec![0.0],
            vec![2.55, 25.5],
        );
        let p = decompose(&interval, Precision::U8).unwrap();
        assert_eq!(p.scale.len(), 2);
        assert!(close(p.scale[1], 0.1));
    }

    #[test]
    fn test_align_matches_reference_values() {
        let a = QuantizationInterval::symmetric_io(256, 0.0, 2.55);
        let b = QuantizationInterval::symmetric_io(256, -1.28, 1.27);
        let shared = align([&a, &b], Precision::U8).unwrap();
        assert!((shared.scale - 0.015).abs() < 1e-4);
        assert_eq!(shared.zero_point, 85.0);

        let pa = shared.params_for(&a);
        assert_eq!((pa.output_low[0], pa.output_high[0]), (85.0, 255.0));
        let pb = shared.params_for(&b);
        assert_eq!((pb.output_low[0], pb.output_high[0]), (0.0, 170.0));
    }

    #[test]
    fn test_align_rejects_mixed_levels() {
        let a = QuantizationInterval::symmetric_io(256, 0.0, 1.0);
        let b = QuantizationInterval::symmetric_io(16, 0.0, 1.0);
        assert!(align([&a, &b], Precision::U8).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_intervals() {
        assert!(QuantizationInterval::symmetric_io(1, 0.0, 1.0).validate(None).is_err());
        assert!(QuantizationInterval::symmetric_io(256, 1.0, 1.0).validate(None).is_err());
        assert!(QuantizationInterval::new(256, 0.0, 1.0, 1.0, 0.0).validate(None).is_err());

        let pc = QuantizationInterval::per_channel(256, vec![0.0; 3], vec![1.0; 3], vec![0.0], vec![1.0]);
        assert!(pc.validate(Some(3)).is_ok());
        let err = pc.validate(Some(4)).unwrap_err();
        assert!(err.contains("does not match"), "{err}");
    }

    #[test]
    fn test_fake_quantize_reference() {
        let interval = QuantizationInterval::symmetric_io(256, 0.0, 2.55);
        assert_eq!(interval.fake_quantize(-1.0, 0), 0.0);
        assert_eq!(interval.fake_quantize(9.0, 0), 2.55);
        assert!(close(interval.fake_quantize(1.004, 0), 1.0));
    }
}
