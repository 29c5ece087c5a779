//! Graph surgery shared by the structural rules.

use crate::errors::Result;
use crate::graph::{Graph, NodeId, CHANNEL_AXIS};
use crate::quantization::dequantization::{
    insert_dequantization_after, DequantizationOperations, FakeQuantizeDequantization,
};

/// Move a dequantization from input 0 of `node` to its output.
///
/// `node` is rewired to read the integer data directly, the old chain is
/// dropped if nothing else reads it, and `operations` is attached after
/// `node`. Returns the last node of the new chain.
pub(crate) fn move_dequantization_after(
    graph: &mut Graph,
    node: NodeId,
    dequantization: &FakeQuantizeDequantization,
    operations: &DequantizationOperations,
) -> Result<NodeId> {
    graph.set_input(node, 0, dequantization.data)?;
    graph.prune(dequantization.top());
    graph.refresh(node)?;
    insert_dequantization_after(graph, node, operations)
}

/// Static channel extent of `id`'s output.
pub(crate) fn channel_extent(graph: &Graph, id: NodeId) -> Option<usize> {
    graph.node(id)?.shape.extent(CHANNEL_AXIS)
}

/// The dequantization feeding input `port` of `node`, if there is one.
pub(crate) fn dequantization_below(graph: &Graph, node: NodeId, port: usize) -> Option<FakeQuantizeDequantization> {
    FakeQuantizeDequantization::read(graph, graph.input(node, port)?)
}
