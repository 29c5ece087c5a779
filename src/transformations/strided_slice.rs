//! StridedSlice over a dequantization.
//!
//! The slice runs on the integer data; the dequantization follows it with its
//! channel vectors cut by the same selection the slice applies to axis 1.

use tracing::trace;

use super::network_helper::{dequantization_below, move_dequantization_after};
use super::TransformationContext;
use crate::errors::Result;
use crate::graph::shape::resolve_slice;
use crate::graph::{Graph, NodeId, Op, SliceBound, CHANNEL_AXIS};
use crate::quantization::dequantization::{DequantizationOperations, FakeQuantizeDequantization};

fn plan(graph: &Graph, id: NodeId) -> Option<(FakeQuantizeDequantization, DequantizationOperations)> {
    let node = graph.node(id)?;
    let Op::StridedSlice(attrs) = &node.op else {
        return None;
    };
    let dequantization = dequantization_below(graph, id, 0)?;
    let operations = &dequantization.operations;
    let Some(vector_len) = operations.channels() else {
        let unchanged = operations.clone();
        return Some((dequantization, unchanged));
    };

    let input_shape = &graph.node(graph.input(id, 0)?)?.shape;
    if input_shape.extent(CHANNEL_AXIS) != Some(vector_len) {
        trace!(node = id, vector_len, "channel vector does not match the sliced axis");
        return None;
    }
    let sliced = match resolve_slice(graph, node.inputs(), attrs, input_shape).get(CHANNEL_AXIS) {
        Some(SliceBound::Full) => operations.clone(),
        Some(SliceBound::Known(selection)) => operations.slice_channels(selection),
        _ => {
            trace!(node = id, "channel-axis bounds are not static");
            return None;
        }
    };
    Some((dequantization, sliced))
}

pub(crate) fn can_be_transformed(graph: &Graph, id: NodeId, _ctx: &TransformationContext) -> bool {
    plan(graph, id).is_some()
}

pub(crate) fn transform(graph: &mut Graph, id: NodeId, _ctx: &TransformationContext) -> Result<bool> {
    let Some((dequantization, operations)) = plan(graph, id) else {
        return Ok(false);
    };
    move_dequantization_after(graph, id, &dequantization, &operations)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{PartialShape, Precision, Tensor};
    use crate::quantization::dequantization::{insert_dequantization_after, DequantValues};

    fn sliced(shape: PartialShape, begin: Vec<i64>, end: Vec<i64>, masks: Vec<bool>) -> (Graph, NodeId, NodeId) {
        let mut g = Graph::new("ss");
        let q = g.add_parameter("q", Precision::U8, shape).unwrap();
        let ss = g
            .add_strided_slice(q, begin, end, vec![1, 1, 1, 1], masks.clone(), masks)
            .unwrap();
        let r = g.add_result(ss).unwrap();
        let ops = DequantizationOperations::new(
            Some(Precision::F32),
            None,
            Some(DequantValues::PerChannel(vec![0.01, 0.01, 0.1, 0.1, 0.1, 0.1])),
        );
        insert_dequantization_after(&mut g, q, &ops).unwrap();
        (g, ss, r)
    }

    #[test]
    fn test_channel_vector_is_sliced() {
        let (mut g, ss, r) = sliced(
            PartialShape::from_static(&[1, 6, 2, 2]),
            vec![0, 2, 0, 0],
            vec![0, 6, 0, 0],
            vec![true, false, true, true],
        );
        let (dq, ops) = plan(&g, ss).unwrap();
        assert_eq!(ops.multiply, Some(DequantValues::PerChannel(vec![0.1; 4])));

        move_dequantization_after(&mut g, ss, &dq, &ops).unwrap();
        let after = FakeQuantizeDequantization::read(&g, g.input(r, 0).unwrap()).unwrap();
        assert_eq!(after.data, ss);
        assert_eq!(g.try_node(ss).unwrap().precision, Precision::U8);
        assert_eq!(
            g.constant(g.input(after.multiply.unwrap(), 1).unwrap()),
            Some(&Tensor::channel_vector(vec![0.1; 4], 4))
        );
        assert!(g.validate_connectivity().valid);
    }

    #[test]
    fn test_dynamic_channel_bounds_block_per_channel() {
        let mut g = Graph::new("ss");
        let q = g.add_parameter("q", Precision::U8, PartialShape::from_dims(&[Some(1), None, Some(2)])).unwrap();
        let ss = g
            .add_strided_slice(q, vec![0, 0], vec![0, -1], vec![1, 1], vec![true, false], vec![true, false])
            .unwrap();
        g.add_result(ss).unwrap();
        let ops = DequantizationOperations::new(None, None, Some(DequantValues::PerChannel(vec![1.0, 2.0])));
        insert_dequantization_after(&mut g, q, &ops).unwrap();
        assert!(plan(&g, ss).is_none());
    }
}
