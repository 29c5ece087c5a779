//! MaxPool over a dequantization.
//!
//! `max(a·s + z, b·s + z) = max(a, b)·s + z` holds for `s > 0`, so the pool
//! can run on the integer data with the dequantization moved unchanged after
//! it. Negative or zero scales would flip or collapse the ordering.

use tracing::trace;

use super::network_helper::{dequantization_below, move_dequantization_after};
use super::TransformationContext;
use crate::errors::Result;
use crate::graph::{Graph, NodeId, Op};
use crate::quantization::dequantization::FakeQuantizeDequantization;

fn plan(graph: &Graph, id: NodeId) -> Option<FakeQuantizeDequantization> {
    if !matches!(graph.node(id)?.op, Op::MaxPool(_)) {
        return None;
    }
    let dequantization = dequantization_below(graph, id, 0)?;
    if !dequantization.operations.scales_positive() {
        trace!(node = id, "MaxPool needs strictly positive scales");
        return None;
    }
    Some(dequantization)
}

pub(crate) fn can_be_transformed(graph: &Graph, id: NodeId, _ctx: &TransformationContext) -> bool {
    plan(graph, id).is_some()
}

pub(crate) fn transform(graph: &mut Graph, id: NodeId, _ctx: &TransformationContext) -> Result<bool> {
    let Some(dequantization) = plan(graph, id) else {
        return Ok(false);
    };
    let operations = dequantization.operations.clone();
    move_dequantization_after(graph, id, &dequantization, &operations)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{PartialShape, PoolAttrs, Precision, Tensor};

    fn pool_over_scale(scale: f32) -> (Graph, NodeId) {
        let mut g = Graph::new("pool");
        let q = g.add_parameter("q", Precision::U8, PartialShape::from_static(&[1, 2, 4, 4])).unwrap();
        let c = g.add_convert(q, Precision::F32).unwrap();
        let m = g.add_multiply(c, Tensor::scalar(scale)).unwrap();
        let pool = g.add_max_pool(m, PoolAttrs::new(vec![2, 2], vec![1, 1])).unwrap();
        g.add_result(pool).unwrap();
        (g, pool)
    }

    #[test]
    fn test_positive_scale_moves() {
        let (mut g, pool) = pool_over_scale(0.5);
        let dq = plan(&g, pool).unwrap();
        let ops = dq.operations.clone();
        move_dequantization_after(&mut g, pool, &dq, &ops).unwrap();
        assert_eq!(g.try_node(pool).unwrap().precision, Precision::U8);
        assert_eq!(g.consumers(pool).len(), 1);
        // old Convert and Multiply (plus its constant) are gone, new ones added
        assert_eq!(g.len(), 6);
    }

    #[test]
    fn test_negative_scale_blocks() {
        let (g, pool) = pool_over_scale(-0.5);
        assert!(plan(&g, pool).is_none());
    }
}
