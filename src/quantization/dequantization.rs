//! Dequantization algebra.
//!
//! A dequantization is the affine correction `(Convert, Subtract(zeroPoint),
//! Multiply(scale))` that follows integer data. This module holds:
//!
//!   1. **Values** ([`DequantValues`], [`DequantizationOperations`]): scalar
//!      or per-channel parameters with the merge / slice / compare operations
//!      the structural rules need
//!   2. **Graph matching** ([`FakeQuantizeDequantization`]): recognise an
//!      existing chain in a graph
//!   3. **Graph insertion** ([`insert_dequantization_after`]): attach a chain
//!      to a producer and move its consumers onto it

use std::fmt;

use crate::errors::{LptError, Result};
use crate::graph::{AxisSlice, Graph, NodeId, Op, Precision, Tensor, CHANNEL_AXIS};

use super::QuantizationParams;

fn nearly_equal(a: f32, b: f32) -> bool {
    a == b || (a - b).abs() <= 1e-6 * a.abs().max(b.abs())
}

// ===========================================================================
// Parameter values
// ===========================================================================

/// Scale or zero-point: one value, or one value per channel of axis 1.
#[derive(Debug, Clone, PartialEq)]
pub enum DequantValues {
    Scalar(f32),
    PerChannel(Vec<f32>),
}

impl DequantValues {
    /// Collapse single-element and uniform vectors to [`DequantValues::Scalar`].
    pub fn from_vec(values: Vec<f32>) -> Self {
        match values.first() {
            Some(&first) if values.iter().all(|&v| v == first) => DequantValues::Scalar(first),
            Some(_) => DequantValues::PerChannel(values),
            None => DequantValues::Scalar(0.0),
        }
    }

    /// Read a constant operand of a rank-`data_rank` Subtract / Multiply.
    ///
    /// Accepts a single element, or a tensor whose only non-unit dimension
    /// lines up with the channel axis after right-aligned broadcasting.
    pub fn from_tensor(tensor: &Tensor, data_rank: usize) -> Option<Self> {
        let values = tensor.to_f32_vec();
        if values.len() == 1 {
            return Some(DequantValues::Scalar(values[0]));
        }
        let rank = tensor.shape.len();
        if rank > data_rank || data_rank <= CHANNEL_AXIS {
            return None;
        }
        let channel_dim = (CHANNEL_AXIS + rank).checked_sub(data_rank)?;
        let only_channel = tensor
            .shape
            .iter()
            .enumerate()
            .all(|(i, &d)| d == 1 || i == channel_dim);
        if only_channel {
            Some(DequantValues::PerChannel(values))
        } else {
            None
        }
    }

    pub fn to_tensor(&self, data_rank: usize) -> Tensor {
        match self {
            DequantValues::Scalar(v) => Tensor::scalar(*v),
            DequantValues::PerChannel(v) => Tensor::channel_vector(v.clone(), data_rank),
        }
    }

    pub fn channels(&self) -> Option<usize> {
        match self {
            DequantValues::Scalar(_) => None,
            DequantValues::PerChannel(v) => Some(v.len()),
        }
    }

    pub fn get(&self, channel: usize) -> f32 {
        match self {
            DequantValues::Scalar(v) => *v,
            DequantValues::PerChannel(v) => v.get(channel).copied().unwrap_or(f32::NAN),
        }
    }

    pub fn values(&self) -> Vec<f32> {
        match self {
            DequantValues::Scalar(v) => vec![*v],
            DequantValues::PerChannel(v) => v.clone(),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            DequantValues::Scalar(v) => *v == 0.0,
            DequantValues::PerChannel(v) => v.iter().all(|&x| x == 0.0),
        }
    }

    pub fn all_positive(&self) -> bool {
        match self {
            DequantValues::Scalar(v) => *v > 0.0,
            DequantValues::PerChannel(v) => v.iter().all(|&x| x > 0.0),
        }
    }

    /// Expand to exactly `channels` entries.
    pub fn broadcast(&self, channels: usize) -> Vec<f32> {
        match self {
            DequantValues::Scalar(v) => vec![*v; channels],
            DequantValues::PerChannel(v) => v.clone(),
        }
    }

    /// Apply a channel-axis selection. Scalars are unaffected; a vector stays
    /// a vector matched to the selected channels even when its values agree.
    pub fn slice(&self, selection: &AxisSlice) -> Self {
        match self {
            DequantValues::Scalar(_) => self.clone(),
            DequantValues::PerChannel(v) => {
                DequantValues::PerChannel(selection.indices().into_iter().map(|i| v[i]).collect())
            }
        }
    }

    /// Concatenate branch values along the channel axis. Each part carries
    /// the branch's channel count; `None` is only acceptable when every part
    /// is the same scalar.
    pub fn concat(parts: &[(DequantValues, Option<usize>)]) -> Option<Self> {
        if let Some((DequantValues::Scalar(first), _)) = parts.first() {
            if parts
                .iter()
                .all(|(v, _)| matches!(v, DequantValues::Scalar(x) if x == first))
            {
                return Some(DequantValues::Scalar(*first));
            }
        }
        let mut merged = Vec::new();
        for (values, channels) in parts {
            let n = (*channels)?;
            if values.channels().is_some_and(|len| len != n) {
                return None;
            }
            merged.extend(values.broadcast(n));
        }
        Some(DequantValues::from_vec(merged))
    }

    pub fn approx_eq(&self, other: &DequantValues) -> bool {
        match (self, other) {
            (DequantValues::Scalar(a), DequantValues::Scalar(b)) => nearly_equal(*a, *b),
            (DequantValues::PerChannel(a), DequantValues::PerChannel(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| nearly_equal(*x, *y))
            }
            _ => false,
        }
    }
}

impl fmt::Display for DequantValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DequantValues::Scalar(v) => write!(f, "{v}"),
            DequantValues::PerChannel(v) => write!(f, "{v:?}"),
        }
    }
}

// ===========================================================================
// Operation triple
// ===========================================================================

/// The `(Convert, Subtract, Multiply)` triple, each part optional.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DequantizationOperations {
    pub convert: Option<Precision>,
    pub subtract: Option<DequantValues>,
    pub multiply: Option<DequantValues>,
}

impl DequantizationOperations {
    /// Normalising constructor: an all-zero subtract is dropped.
    pub fn new(convert: Option<Precision>, subtract: Option<DequantValues>, multiply: Option<DequantValues>) -> Self {
        Self {
            convert,
            subtract: subtract.filter(|z| !z.is_zero()),
            multiply,
        }
    }

    /// Dequantization that undoes a decomposition.
    pub fn from_params(params: &QuantizationParams, update_precisions: bool) -> Self {
        Self::new(
            update_precisions.then_some(Precision::F32),
            Some(DequantValues::from_vec(params.zero_point.clone())),
            Some(DequantValues::from_vec(params.scale.clone())),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.convert.is_none() && self.subtract.is_none() && self.multiply.is_none()
    }

    /// Length of the per-channel vectors, if any part is per-channel.
    pub fn channels(&self) -> Option<usize> {
        self.subtract
            .as_ref()
            .and_then(DequantValues::channels)
            .or_else(|| self.multiply.as_ref().and_then(DequantValues::channels))
    }

    pub fn is_per_channel(&self) -> bool {
        self.channels().is_some()
    }

    /// Scale applied to `channel`, `1.0` when there is no Multiply.
    pub fn scale(&self, channel: usize) -> f32 {
        self.multiply.as_ref().map_or(1.0, |m| m.get(channel))
    }

    /// Zero point removed from `channel`, `0.0` when there is no Subtract.
    pub fn zero_point(&self, channel: usize) -> f32 {
        self.subtract.as_ref().map_or(0.0, |s| s.get(channel))
    }

    /// `(code - zeroPoint) * scale` for one element.
    pub fn apply(&self, code: f32, channel: usize) -> f32 {
        (code - self.zero_point(channel)) * self.scale(channel)
    }

    pub fn scales_positive(&self) -> bool {
        self.multiply.as_ref().map_or(true, DequantValues::all_positive)
    }

    /// Re-select the channel axis after a StridedSlice.
    pub fn slice_channels(&self, selection: &AxisSlice) -> Self {
        Self::new(
            self.convert,
            self.subtract.as_ref().map(|s| s.slice(selection)),
            self.multiply.as_ref().map(|m| m.slice(selection)),
        )
    }

    /// Merge per-branch dequantizations into the one that follows a channel
    /// concat. Every branch must agree on the Convert. Branches without a
    /// Subtract contribute zeros and branches without a Multiply contribute
    /// ones.
    pub fn concat(branches: &[(DequantizationOperations, Option<usize>)]) -> Option<Self> {
        let convert = branches.first()?.0.convert;
        if branches.iter().any(|(b, _)| b.convert != convert) {
            return None;
        }
        let subtract = merge_values(branches, |b| b.subtract.as_ref(), 0.0)?;
        let multiply = merge_values(branches, |b| b.multiply.as_ref(), 1.0)?;
        Some(Self::new(convert, subtract, multiply))
    }

    pub fn approx_eq(&self, other: &DequantizationOperations) -> bool {
        let same = |a: &Option<DequantValues>, b: &Option<DequantValues>| match (a, b) {
            (None, None) => true,
            (Some(x), Some(y)) => x.approx_eq(y),
            _ => false,
        };
        self.convert == other.convert && same(&self.subtract, &other.subtract) && same(&self.multiply, &other.multiply)
    }

    /// Vector lengths must match the channel extent at the attachment point,
    /// and every scale must be strictly positive.
    pub fn validate(&self, channel_extent: Option<usize>) -> std::result::Result<(), String> {
        for (name, values) in [("zero point", &self.subtract), ("scale", &self.multiply)] {
            let Some(n) = values.as_ref().and_then(DequantValues::channels) else {
                continue;
            };
            match channel_extent {
                Some(extent) if extent != n => {
                    return Err(format!("{name} has {n} values but the channel axis has {extent}"))
                }
                _ => {}
            }
        }
        if !self.scales_positive() {
            return Err("scale must be strictly positive".to_string());
        }
        Ok(())
    }
}

/// `Some(None)` when no branch has the part, `None` when the parts cannot be
/// merged.
fn merge_values(
    branches: &[(DequantizationOperations, Option<usize>)],
    pick: impl Fn(&DequantizationOperations) -> Option<&DequantValues>,
    neutral: f32,
) -> Option<Option<DequantValues>> {
    if branches.iter().all(|(b, _)| pick(b).is_none()) {
        return Some(None);
    }
    let parts: Vec<(DequantValues, Option<usize>)> = branches
        .iter()
        .map(|(b, n)| (pick(b).cloned().unwrap_or(DequantValues::Scalar(neutral)), *n))
        .collect();
    DequantValues::concat(&parts).map(Some)
}

impl fmt::Display for DequantizationOperations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(p) = self.convert {
            parts.push(format!("convert={p}"));
        }
        if let Some(z) = &self.subtract {
            parts.push(format!("subtract={z}"));
        }
        if let Some(s) = &self.multiply {
            parts.push(format!("multiply={s}"));
        }
        if parts.is_empty() {
            f.write_str("identity")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

// ===========================================================================
// Matching chains in a graph
// ===========================================================================

/// Whether `id` produces integer codes: an integer-tagged tensor, a
/// decomposed FakeQuantize, or a structural operator over such data.
pub fn is_quantized_data(graph: &Graph, id: NodeId) -> bool {
    let Some(node) = graph.node(id) else {
        return false;
    };
    match &node.op {
        Op::FakeQuantize(attrs) => attrs.decomposed,
        Op::Constant(_) => false,
        Op::Concat { .. } => node.inputs().iter().all(|e| is_quantized_data(graph, e.node)),
        Op::StridedSlice(_) | Op::MaxPool(_) => {
            graph.input(id, 0).is_some_and(|data| is_quantized_data(graph, data))
        }
        _ => node.precision.is_integer(),
    }
}

/// An existing `Convert → Subtract → Multiply` chain (any part optional)
/// sitting on quantized data.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeQuantizeDequantization {
    /// Producer of the integer codes.
    pub data: NodeId,
    pub convert: Option<NodeId>,
    pub subtract: Option<NodeId>,
    pub multiply: Option<NodeId>,
    pub operations: DequantizationOperations,
}

impl FakeQuantizeDequantization {
    /// Match the chain ending at `node`. `None` when `node` is not the last
    /// operation of a dequantization over quantized data.
    pub fn read(graph: &Graph, node: NodeId) -> Option<Self> {
        let rank = graph.node(node)?.shape.rank();
        let mut current = node;
        let mut ops = DequantizationOperations::default();
        let (mut convert, mut subtract, mut multiply) = (None, None, None);

        if let Some((data, values)) = Self::affine_operand(graph, current, rank, |op| matches!(op, Op::Multiply)) {
            multiply = Some(current);
            ops.multiply = Some(values);
            current = data;
        }
        if let Some((data, values)) = Self::affine_operand(graph, current, rank, |op| matches!(op, Op::Subtract)) {
            subtract = Some(current);
            ops.subtract = Some(values);
            current = data;
        }
        if let Op::Convert { to } = graph.node(current)?.op {
            if to.is_real() {
                convert = Some(current);
                ops.convert = Some(to);
                current = graph.input(current, 0)?;
            }
        }

        if (convert, subtract, multiply) == (None, None, None) || !is_quantized_data(graph, current) {
            return None;
        }
        Some(Self {
            data: current,
            convert,
            subtract,
            multiply,
            operations: ops,
        })
    }

    fn affine_operand(
        graph: &Graph,
        id: NodeId,
        rank: usize,
        is_kind: fn(&Op) -> bool,
    ) -> Option<(NodeId, DequantValues)> {
        let node = graph.node(id)?;
        if !is_kind(&node.op) {
            return None;
        }
        let tensor = graph.constant(graph.input(id, 1)?)?;
        let values = DequantValues::from_tensor(tensor, rank)?;
        Some((graph.input(id, 0)?, values))
    }

    /// Last node of the chain, the one downstream consumers read.
    pub fn top(&self) -> NodeId {
        self.multiply.or(self.subtract).or(self.convert).unwrap_or(self.data)
    }

    /// Chain nodes from the data side up.
    pub fn nodes(&self) -> Vec<NodeId> {
        [self.convert, self.subtract, self.multiply].into_iter().flatten().collect()
    }
}

/// Attach `ops` after `producer` and move every existing consumer of
/// `producer` onto the end of the new chain. Returns the last node inserted,
/// or `producer` itself for an identity dequantization.
pub fn insert_dequantization_after(graph: &mut Graph, producer: NodeId, ops: &DequantizationOperations) -> Result<NodeId> {
    let consumers = graph.consumers(producer);
    let (base, shape) = {
        let node = graph.try_node(producer)?;
        (node.name.clone(), node.shape.clone())
    };
    ops.validate(shape.extent(CHANNEL_AXIS))
        .map_err(|reason| LptError::configuration(producer, reason))?;
    let rank = shape.rank();

    let mut last = producer;
    if let Some(to) = ops.convert {
        last = graph.add_node(format!("{base}/dequantization/convert"), Op::Convert { to }, &[last])?;
    }
    if let Some(zero_point) = &ops.subtract {
        let c = graph.add_node(
            format!("{base}/dequantization/zero_point"),
            Op::Constant(zero_point.to_tensor(rank)),
            &[],
        )?;
        last = graph.add_node(format!("{base}/dequantization/subtract"), Op::Subtract, &[last, c])?;
    }
    if let Some(scale) = &ops.multiply {
        let c = graph.add_node(
            format!("{base}/dequantization/scale"),
            Op::Constant(scale.to_tensor(rank)),
            &[],
        )?;
        last = graph.add_node(format!("{base}/dequantization/multiply"), Op::Multiply, &[last, c])?;
    }

    for c in consumers {
        graph.set_input(c.node, c.port, last)?;
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PartialShape;

    fn per_channel(v: &[f32]) -> DequantValues {
        DequantValues::PerChannel(v.to_vec())
    }

    #[test]
    fn test_uniform_vector_collapses() {
        assert_eq!(DequantValues::from_vec(vec![0.01; 4]), DequantValues::Scalar(0.01));
        assert_eq!(DequantValues::from_vec(vec![0.01, 0.1]), per_channel(&[0.01, 0.1]));
    }

    #[test]
    fn test_concat_broadcasts_each_branch() {
        let a = DequantizationOperations::new(None, None, Some(DequantValues::Scalar(0.01)));
        let b = DequantizationOperations::new(None, None, Some(DequantValues::Scalar(0.1)));
        let merged = DequantizationOperations::concat(&[(a, Some(2)), (b, Some(4))]).unwrap();
        assert_eq!(merged.multiply, Some(per_channel(&[0.01, 0.01, 0.1, 0.1, 0.1, 0.1])));
        assert_eq!(merged.subtract, None);
    }

    #[test]
    fn test_concat_fills_missing_zero_points() {
        let a = DequantizationOperations::new(None, None, Some(DequantValues::Scalar(0.01)));
        let b = DequantizationOperations::new(
            None,
            Some(DequantValues::Scalar(-255.0)),
            Some(DequantValues::Scalar(0.005)),
        );
        let merged = DequantizationOperations::concat(&[(a, Some(2)), (b, Some(2))]).unwrap();
        assert_eq!(merged.subtract, Some(per_channel(&[0.0, 0.0, -255.0, -255.0])));
        assert_eq!(merged.multiply, Some(per_channel(&[0.01, 0.01, 0.005, 0.005])));
    }

    #[test]
    fn test_concat_of_equal_scalars_needs_no_extent() {
        let a = DequantizationOperations::new(None, None, Some(DequantValues::Scalar(0.01)));
        let merged = DequantizationOperations::concat(&[(a.clone(), None), (a.clone(), None)]).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn test_concat_rejects_mixed_convert() {
        let a = DequantizationOperations::new(Some(Precision::F32), None, Some(DequantValues::Scalar(0.01)));
        let b = DequantizationOperations::new(None, None, Some(DequantValues::Scalar(0.01)));
        assert!(DequantizationOperations::concat(&[(a, Some(1)), (b, Some(1))]).is_none());
    }

    #[test]
    fn test_slice_selects_channels() {
        let ops = DequantizationOperations::new(
            None,
            None,
            Some(per_channel(&[0.01, 0.01, 0.1, 0.1, 0.1, 0.1])),
        );
        let sliced = ops.slice_channels(&AxisSlice::resolve(2, 6, 1, false, false, 6).unwrap());
        assert_eq!(sliced.multiply, Some(per_channel(&[0.1; 4])));
        assert_eq!(sliced.channels(), Some(4));

        let kept = ops.slice_channels(&AxisSlice::resolve(0, -2, 1, false, false, 6).unwrap());
        assert_eq!(kept.multiply, Some(per_channel(&[0.01, 0.01, 0.1, 0.1])));
    }

    #[test]
    fn test_validate_vector_length_and_scale() {
        let ops = DequantizationOperations::new(None, None, Some(per_channel(&[0.1, 0.2])));
        assert!(ops.validate(Some(2)).is_ok());
        assert!(ops.validate(Some(3)).is_err());
        assert!(ops.validate(None).is_ok());
        let negative = DequantizationOperations::new(None, None, Some(DequantValues::Scalar(-1.0)));
        assert!(negative.validate(None).is_err());
    }

    #[test]
    fn test_from_tensor_respects_channel_axis() {
        let t = Tensor::channel_vector(vec![1.0, 2.0], 4);
        assert_eq!(DequantValues::from_tensor(&t, 4), Some(per_channel(&[1.0, 2.0])));
        let spatial = Tensor::f32(vec![1, 1, 2, 1], vec![1.0, 2.0]).unwrap();
        assert_eq!(DequantValues::from_tensor(&spatial, 4), None);
        let short = Tensor::f32(vec![2, 1, 1], vec![1.0, 2.0]).unwrap();
        assert_eq!(DequantValues::from_tensor(&short, 4), Some(per_channel(&[1.0, 2.0])));
        let uniform = Tensor::channel_vector(vec![0.1; 4], 4);
        assert_eq!(DequantValues::from_tensor(&uniform, 4), Some(per_channel(&[0.1; 4])));
    }

    #[test]
    fn test_insert_and_read_back() {
        let mut g = Graph::new("dq");
        let p = g.add_parameter("q", Precision::U8, PartialShape::from_static(&[1, 2, 3, 3])).unwrap();
        let r = g.add_result(p).unwrap();
        let ops = DequantizationOperations::new(
            Some(Precision::F32),
            Some(DequantValues::Scalar(3.0)),
            Some(per_channel(&[0.5, 0.25])),
        );
        let top = insert_dequantization_after(&mut g, p, &ops).unwrap();
        assert_eq!(g.input(r, 0), Some(top));

        let read = FakeQuantizeDequantization::read(&g, top).unwrap();
        assert_eq!(read.data, p);
        assert_eq!(read.operations, ops);
        assert_eq!(read.nodes().len(), 3);
        assert!(g.validate_connectivity().valid);
    }

    #[test]
    fn test_read_rejects_real_data() {
        let mut g = Graph::new("dq");
        let p = g.add_parameter("x", Precision::F32, PartialShape::from_static(&[1, 2])).unwrap();
        let m = g.add_multiply(p, Tensor::scalar(2.0)).unwrap();
        assert!(FakeQuantizeDequantization::read(&g, m).is_none());
    }

    #[test]
    fn test_apply_matches_formula() {
        let ops = DequantizationOperations::new(None, Some(DequantValues::Scalar(85.0)), Some(DequantValues::Scalar(0.015)));
        assert!((ops.apply(255.0, 0) - 2.55).abs() < 1e-5);
        assert_eq!(ops.apply(85.0, 3), 0.0);
    }
}
