//! Concat over dequantized branches.
//!
//! The Concat is rewired onto the integer data of every branch and a single
//! dequantization is attached after it. Along the channel axis each branch
//! keeps its own parameters, merged into channel vectors; otherwise (and in
//! per-tensor groups) every branch must already carry the same parameters.

use tracing::trace;

use super::network_helper::{channel_extent, dequantization_below};
use super::TransformationContext;
use crate::errors::Result;
use crate::graph::{Graph, NodeId, Op, CHANNEL_AXIS};
use crate::quantization::dequantization::{
    insert_dequantization_after, DequantizationOperations, FakeQuantizeDequantization,
};

struct Plan {
    branches: Vec<FakeQuantizeDequantization>,
    merged: DequantizationOperations,
}

fn plan(graph: &Graph, id: NodeId, ctx: &TransformationContext) -> Option<Plan> {
    let node = graph.node(id)?;
    let Op::Concat { axis } = node.op else {
        return None;
    };
    let branches = (0..node.inputs().len())
        .map(|port| dequantization_below(graph, id, port))
        .collect::<Option<Vec<_>>>()?;
    let first = branches.first()?;

    let precision = graph.node(first.data)?.precision;
    if branches
        .iter()
        .any(|b| graph.node(b.data).map(|n| n.precision) != Some(precision))
    {
        trace!(node = id, "Concat branches differ in low precision");
        return None;
    }

    let merged = if ctx.markup.is_per_tensor(id) || axis != CHANNEL_AXIS {
        let reference = &first.operations;
        if !branches.iter().all(|b| b.operations.approx_eq(reference)) {
            trace!(node = id, axis, "Concat branches need identical dequantization");
            return None;
        }
        reference.clone()
    } else {
        let parts: Vec<_> = branches
            .iter()
            .map(|b| (b.operations.clone(), channel_extent(graph, b.data)))
            .collect();
        match DequantizationOperations::concat(&parts) {
            Some(merged) => merged,
            None => {
                trace!(node = id, "Concat branch dequantizations cannot be merged");
                return None;
            }
        }
    };
    Some(Plan { branches, merged })
}

pub(crate) fn can_be_transformed(graph: &Graph, id: NodeId, ctx: &TransformationContext) -> bool {
    plan(graph, id, ctx).is_some()
}

pub(crate) fn transform(graph: &mut Graph, id: NodeId, ctx: &TransformationContext) -> Result<bool> {
    let Some(Plan { branches, merged }) = plan(graph, id, ctx) else {
        return Ok(false);
    };
    for (port, branch) in branches.iter().enumerate() {
        graph.set_input(id, port, branch.data)?;
    }
    for branch in &branches {
        graph.prune(branch.top());
    }
    graph.refresh(id)?;
    insert_dequantization_after(graph, id, &merged)?;
    Ok(true)
}
