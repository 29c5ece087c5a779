//! Partial shapes, shape inference, and strided-slice bound resolution.

use std::fmt;
use std::str::FromStr;

use super::{Edge, Graph, Op, StridedSliceAttrs};
use crate::errors::{LptError, Result};

/// One dimension: a known extent or unknown until run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(usize),
    Dynamic,
}

impl Dim {
    pub fn get(self) -> Option<usize> {
        match self {
            Dim::Static(d) => Some(d),
            Dim::Dynamic => None,
        }
    }

    fn merge(self, other: Dim) -> Dim {
        match (self, other) {
            (Dim::Static(a), _) => Dim::Static(a),
            (Dim::Dynamic, b) => b,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(d) => write!(f, "{d}"),
            Dim::Dynamic => f.write_str("?"),
        }
    }
}

/// Rank is always known; individual extents may be dynamic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PartialShape(pub Vec<Dim>);

impl PartialShape {
    pub fn from_static(dims: &[usize]) -> Self {
        Self(dims.iter().map(|&d| Dim::Static(d)).collect())
    }

    /// Build from `Some(extent)` / `None` (dynamic) entries.
    pub fn from_dims(dims: &[Option<usize>]) -> Self {
        Self(dims.iter().map(|d| d.map_or(Dim::Dynamic, Dim::Static)).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dim(&self, axis: usize) -> Option<Dim> {
        self.0.get(axis).copied()
    }

    /// Static extent of `axis`, if both the axis exists and its extent is known.
    pub fn extent(&self, axis: usize) -> Option<usize> {
        self.dim(axis).and_then(Dim::get)
    }

    pub fn is_static(&self) -> bool {
        self.0.iter().all(|d| matches!(d, Dim::Static(_)))
    }

    pub fn to_static(&self) -> Option<Vec<usize>> {
        self.0.iter().map(|d| d.get()).collect()
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Parses `1,4,9,9` or `?,4,?,?`; brackets are optional.
impl FromStr for PartialShape {
    type Err = LptError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s.trim().trim_start_matches('[').trim_end_matches(']');
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        body.split(',')
            .map(|d| match d.trim() {
                "?" | "-1" => Ok(Dim::Dynamic),
                d => d
                    .parse::<usize>()
                    .map(Dim::Static)
                    .map_err(|_| LptError::invalid_graph(format!("bad dimension '{d}' in shape '{s}'"))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

// ===========================================================================
// Strided slice resolution
// ===========================================================================

/// Resolved selection along one axis: `start, start+step, ...` for `len`
/// elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSlice {
    pub start: i64,
    pub step: i64,
    pub len: usize,
}

impl AxisSlice {
    /// Resolve slice bounds against a known extent, with the usual
    /// negative-index and clamping rules.
    pub fn resolve(begin: i64, end: i64, stride: i64, begin_masked: bool, end_masked: bool, extent: usize) -> Option<Self> {
        if stride == 0 {
            return None;
        }
        let n = extent as i64;
        let norm = |v: i64| if v < 0 { v + n } else { v };
        let (start, stop) = if stride > 0 {
            let start = if begin_masked { 0 } else { norm(begin).clamp(0, n) };
            let stop = if end_masked { n } else { norm(end).clamp(0, n) };
            (start, stop)
        } else {
            let start = if begin_masked { n - 1 } else { norm(begin).clamp(-1, n - 1) };
            let stop = if end_masked { -1 } else { norm(end).clamp(-1, n - 1) };
            (start, stop)
        };
        let span = if stride > 0 { stop - start } else { start - stop };
        let step_abs = stride.abs();
        let len = if span <= 0 { 0 } else { ((span + step_abs - 1) / step_abs) as usize };
        Some(Self { start, step: stride, len })
    }

    pub fn indices(&self) -> Vec<usize> {
        (0..self.len as i64)
            .map(|i| (self.start + i * self.step) as usize)
            .collect()
    }

    pub fn is_identity_over(&self, extent: usize) -> bool {
        self.start == 0 && self.step == 1 && self.len == extent
    }
}

/// What a StridedSlice does to one axis, as far as is statically known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceBound {
    /// Whole axis kept, in order (masked bounds, unit stride).
    Full,
    /// Exact selection over a static extent.
    Known(AxisSlice),
    /// Bounds are not constant, or depend on a dynamic extent.
    Unknown,
}

/// Per-axis resolution of a StridedSlice node's bounds against `input_shape`.
///
/// Bounds come from inputs 1..=3 (begin, end, strides). Axes beyond the
/// length of `begin` are untouched.
pub fn resolve_slice(graph: &Graph, inputs: &[Edge], attrs: &StridedSliceAttrs, input_shape: &PartialShape) -> Vec<SliceBound> {
    let bound = |port: usize| -> Option<Vec<i64>> {
        let id = inputs.get(port)?.node;
        Some(graph.constant(id)?.as_i64()?.to_vec())
    };
    let (begin, end, strides) = match (bound(1), bound(2), bound(3)) {
        (Some(b), Some(e), Some(s)) => (b, e, s),
        _ => return vec![SliceBound::Unknown; input_shape.rank()],
    };

    (0..input_shape.rank())
        .map(|axis| {
            if axis >= begin.len() {
                return SliceBound::Full;
            }
            let b_mask = attrs.begin_mask.get(axis).copied().unwrap_or(false);
            let e_mask = attrs.end_mask.get(axis).copied().unwrap_or(false);
            let stride = strides.get(axis).copied().unwrap_or(1);
            let e = end.get(axis).copied().unwrap_or(0);
            match input_shape.extent(axis) {
                Some(extent) => AxisSlice::resolve(begin[axis], e, stride, b_mask, e_mask, extent)
                    .map_or(SliceBound::Unknown, SliceBound::Known),
                None if b_mask && e_mask && stride == 1 => SliceBound::Full,
                None => SliceBound::Unknown,
            }
        })
        .collect()
}

// ===========================================================================
// Shape inference
// ===========================================================================

fn input_shape(graph: &Graph, inputs: &[Edge], port: usize) -> Result<PartialShape> {
    let e = inputs
        .get(port)
        .ok_or_else(|| LptError::invalid_graph(format!("missing input {port}")))?;
    Ok(graph.try_node(e.node)?.shape.clone())
}

/// Numpy-style broadcast of two partial shapes.
pub fn broadcast(a: &PartialShape, b: &PartialShape) -> Result<PartialShape> {
    let rank = a.rank().max(b.rank());
    let pad = |s: &PartialShape, i: usize| -> Dim {
        let offset = rank - s.rank();
        if i < offset {
            Dim::Static(1)
        } else {
            s.0[i - offset]
        }
    };
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let (x, y) = (pad(a, i), pad(b, i));
        let d = match (x, y) {
            (Dim::Static(1), other) | (other, Dim::Static(1)) => other,
            (Dim::Static(p), Dim::Static(q)) if p == q => Dim::Static(p),
            (Dim::Static(p), Dim::Static(q)) => {
                return Err(LptError::invalid_graph(format!(
                    "cannot broadcast {a} with {b}: extent {p} vs {q} on axis {i}"
                )))
            }
            (Dim::Static(p), Dim::Dynamic) | (Dim::Dynamic, Dim::Static(p)) => Dim::Static(p),
            (Dim::Dynamic, Dim::Dynamic) => Dim::Dynamic,
        };
        out.push(d);
    }
    Ok(PartialShape(out))
}

fn window_out(d: Dim, kernel: usize, stride: usize, pad_begin: usize, pad_end: usize, dilation: usize) -> Result<Dim> {
    match d {
        Dim::Dynamic => Ok(Dim::Dynamic),
        Dim::Static(d) => {
            let effective = dilation * (kernel.max(1) - 1) + 1;
            let padded = d + pad_begin + pad_end;
            if padded < effective || stride == 0 {
                return Err(LptError::invalid_graph(format!(
                    "window of {effective} (stride {stride}) does not fit extent {padded}"
                )));
            }
            Ok(Dim::Static((padded - effective) / stride + 1))
        }
    }
}

/// Output shape of `op` applied to `inputs`.
pub fn infer(graph: &Graph, op: &Op, inputs: &[Edge]) -> Result<PartialShape> {
    match op {
        Op::Parameter | Op::Other(_) => Ok(PartialShape::default()),
        Op::Constant(t) => Ok(PartialShape::from_static(&t.shape)),
        Op::FakeQuantize(_) | Op::Convert { .. } | Op::Result => input_shape(graph, inputs, 0),
        Op::Subtract | Op::Multiply => broadcast(&input_shape(graph, inputs, 0)?, &input_shape(graph, inputs, 1)?),
        Op::Concat { axis } => {
            let shapes = (0..inputs.len())
                .map(|i| input_shape(graph, inputs, i))
                .collect::<Result<Vec<_>>>()?;
            let first = shapes
                .first()
                .ok_or_else(|| LptError::invalid_graph("Concat needs at least one input"))?;
            if *axis >= first.rank() {
                return Err(LptError::invalid_graph(format!(
                    "Concat axis {axis} out of range for rank {}",
                    first.rank()
                )));
            }
            let mut out = first.0.clone();
            out[*axis] = Dim::Static(0);
            for s in &shapes {
                if s.rank() != first.rank() {
                    return Err(LptError::invalid_graph(format!("Concat inputs {first} and {s} differ in rank")));
                }
                for (i, d) in s.0.iter().enumerate() {
                    if i == *axis {
                        out[i] = match (out[i], *d) {
                            (Dim::Static(a), Dim::Static(b)) => Dim::Static(a + b),
                            _ => Dim::Dynamic,
                        };
                    } else {
                        if let (Dim::Static(a), Dim::Static(b)) = (out[i], *d) {
                            if a != b {
                                return Err(LptError::invalid_graph(format!(
                                    "Concat inputs disagree on axis {i}: {a} vs {b}"
                                )));
                            }
                        }
                        out[i] = out[i].merge(*d);
                    }
                }
            }
            Ok(PartialShape(out))
        }
        Op::StridedSlice(attrs) => {
            let data = input_shape(graph, inputs, 0)?;
            let bounds = resolve_slice(graph, inputs, attrs, &data);
            let dims = data
                .0
                .iter()
                .zip(bounds)
                .map(|(d, b)| match b {
                    SliceBound::Full => *d,
                    SliceBound::Known(s) => Dim::Static(s.len),
                    SliceBound::Unknown => Dim::Dynamic,
                })
                .collect();
            Ok(PartialShape(dims))
        }
        Op::MaxPool(attrs) => {
            let data = input_shape(graph, inputs, 0)?;
            let spatial = attrs.kernel.len();
            if data.rank() != spatial + 2 {
                return Err(LptError::invalid_graph(format!(
                    "MaxPool with {spatial}-d kernel needs rank {} input, got {data}",
                    spatial + 2
                )));
            }
            let mut out = data.0[..2].to_vec();
            for i in 0..spatial {
                out.push(window_out(
                    data.0[i + 2],
                    attrs.kernel[i],
                    attrs.strides.get(i).copied().unwrap_or(1),
                    attrs.pads_begin.get(i).copied().unwrap_or(0),
                    attrs.pads_end.get(i).copied().unwrap_or(0),
                    1,
                )?);
            }
            Ok(PartialShape(out))
        }
        Op::Convolution(attrs) => {
            let data = input_shape(graph, inputs, 0)?;
            let weights = input_shape(graph, inputs, 1)?;
            if data.rank() != weights.rank() || data.rank() < 3 {
                return Err(LptError::invalid_graph(format!(
                    "Convolution data {data} and weights {weights} ranks are incompatible"
                )));
            }
            let mut out = vec![data.0[0], weights.0[0]];
            for i in 0..data.rank() - 2 {
                let kernel = weights.extent(i + 2).ok_or_else(|| {
                    LptError::invalid_graph("Convolution weights must have static spatial extents")
                })?;
                out.push(window_out(
                    data.0[i + 2],
                    kernel,
                    attrs.strides.get(i).copied().unwrap_or(1),
                    attrs.pads_begin.get(i).copied().unwrap_or(0),
                    attrs.pads_end.get(i).copied().unwrap_or(0),
                    attrs.dilations.get(i).copied().unwrap_or(1),
                )?);
            }
            Ok(PartialShape(out))
        }
    }
}
