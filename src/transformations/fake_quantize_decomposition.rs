//! FakeQuantize → low-precision producer + dequantization.
//!
//! The FakeQuantize keeps its input bounds but now emits integer codes:
//! its output interval becomes the code range of the group precision (or the
//! re-expressed range of a per-tensor group), and `(Convert, Subtract,
//! Multiply)` is attached after it so consumers still see the same values.

use tracing::trace;

use super::TransformationContext;
use crate::errors::{LptError, Result};
use crate::graph::{Graph, NodeId, Op};
use crate::quantization::dequantization::{insert_dequantization_after, DequantizationOperations};
use crate::quantization::{decompose, QuantizationParams};

fn params(graph: &Graph, id: NodeId, ctx: &TransformationContext) -> Option<std::result::Result<QuantizationParams, String>> {
    let Op::FakeQuantize(attrs) = &graph.node(id)?.op else {
        return None;
    };
    if attrs.decomposed {
        return None;
    }
    let group = ctx.markup.group_of(id)?;
    let precision = group.precision?;
    if group.per_tensor {
        return group.shared.as_ref().map(|shared| Ok(shared.params_for(&attrs.interval)));
    }
    Some(decompose(&attrs.interval, precision))
}

pub(crate) fn can_be_transformed(graph: &Graph, id: NodeId, ctx: &TransformationContext) -> bool {
    let ready = params(graph, id, ctx).is_some();
    if !ready {
        trace!(node = id, "FakeQuantize has no usable group decision");
    }
    ready
}

pub(crate) fn transform(graph: &mut Graph, id: NodeId, ctx: &TransformationContext) -> Result<bool> {
    let Some(params) = params(graph, id, ctx) else {
        return Ok(false);
    };
    let params = params.map_err(|reason| LptError::configuration(id, reason))?;
    let update_precisions = ctx.params.update_precisions;

    let node = graph
        .node_mut(id)
        .ok_or_else(|| LptError::invalid_graph(format!("node {id} does not exist")))?;
    if let Op::FakeQuantize(attrs) = &mut node.op {
        attrs.interval.output_low = params.output_low.clone();
        attrs.interval.output_high = params.output_high.clone();
        attrs.decomposed = true;
    }
    if update_precisions {
        node.precision = params.precision;
    }

    let operations = DequantizationOperations::from_params(&params, update_precisions);
    insert_dequantization_after(graph, id, &operations)?;
    Ok(true)
}
