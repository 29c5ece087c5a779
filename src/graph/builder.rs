//! Graph construction helpers and connectivity validation.
//!
//! Two responsibilities:
//!   1. **Construction**: one `add_*` helper per modelled operator, each
//!      running shape and precision inference
//!   2. **Connectivity validation**: walk the arena and verify every edge
//!      and every back-reference resolves

use std::collections::BTreeSet;

use super::{
    ConvolutionAttrs, FakeQuantizeAttrs, Graph, InputPort, NodeId, Op, PartialShape, PoolAttrs, Precision,
    StridedSliceAttrs, Tensor,
};
use crate::errors::Result;
use crate::quantization::QuantizationInterval;

// ===========================================================================
// Construction
// ===========================================================================

impl Graph {
    pub fn add_parameter(&mut self, name: &str, precision: Precision, shape: PartialShape) -> Result<NodeId> {
        self.add_node_with(name, Op::Parameter, &[], precision, shape)
    }

    pub fn add_constant(&mut self, tensor: Tensor) -> Result<NodeId> {
        self.add_node("", Op::Constant(tensor), &[])
    }

    pub fn add_fake_quantize(&mut self, input: NodeId, interval: QuantizationInterval) -> Result<NodeId> {
        let attrs = FakeQuantizeAttrs {
            interval,
            decomposed: false,
        };
        self.add_node("", Op::FakeQuantize(attrs), &[input])
    }

    pub fn add_concat(&mut self, inputs: &[NodeId], axis: usize) -> Result<NodeId> {
        self.add_node("", Op::Concat { axis }, inputs)
    }

    /// StridedSlice with constant begin / end / strides. Masks use the
    /// "true = ignore bound" convention.
    pub fn add_strided_slice(
        &mut self,
        input: NodeId,
        begin: Vec<i64>,
        end: Vec<i64>,
        strides: Vec<i64>,
        begin_mask: Vec<bool>,
        end_mask: Vec<bool>,
    ) -> Result<NodeId> {
        let b = self.add_constant(Tensor::i64_vector(begin))?;
        let e = self.add_constant(Tensor::i64_vector(end))?;
        let s = self.add_constant(Tensor::i64_vector(strides))?;
        let attrs = StridedSliceAttrs { begin_mask, end_mask };
        self.add_node("", Op::StridedSlice(attrs), &[input, b, e, s])
    }

    pub fn add_max_pool(&mut self, input: NodeId, attrs: PoolAttrs) -> Result<NodeId> {
        self.add_node("", Op::MaxPool(attrs), &[input])
    }

    pub fn add_convert(&mut self, input: NodeId, to: Precision) -> Result<NodeId> {
        self.add_node("", Op::Convert { to }, &[input])
    }

    pub fn add_subtract(&mut self, input: NodeId, operand: Tensor) -> Result<NodeId> {
        let c = self.add_constant(operand)?;
        self.add_node("", Op::Subtract, &[input, c])
    }

    pub fn add_multiply(&mut self, input: NodeId, operand: Tensor) -> Result<NodeId> {
        let c = self.add_constant(operand)?;
        self.add_node("", Op::Multiply, &[input, c])
    }

    pub fn add_convolution(&mut self, input: NodeId, weights: NodeId, attrs: ConvolutionAttrs) -> Result<NodeId> {
        self.add_node("", Op::Convolution(attrs), &[input, weights])
    }

    pub fn add_result(&mut self, input: NodeId) -> Result<NodeId> {
        self.add_node("", Op::Result, &[input])
    }
}

// ===========================================================================
// Connectivity validation
// ===========================================================================

/// Result of a graph-connectivity check.
#[derive(Debug)]
#[must_use]
pub struct ConnectivityReport {
    /// `true` if every edge and back-reference resolves.
    pub valid: bool,
    /// Human-readable description of every broken reference. Empty when valid.
    pub broken_refs: Vec<String>,
}

impl ConnectivityReport {
    /// Render the report as a printable string (used by the CLI).
    pub fn summary(&self) -> String {
        if self.valid {
            "  Graph connectivity: OK\n".to_string()
        } else {
            let mut s = format!(
                "  Graph connectivity: BROKEN ({} broken reference{})\n",
                self.broken_refs.len(),
                if self.broken_refs.len() == 1 { "" } else { "s" }
            );
            for (i, r) in self.broken_refs.iter().enumerate() {
                s.push_str(&format!("    {}. {}\n", i + 1, r));
            }
            s
        }
    }
}

impl Graph {
    /// Walk the arena and verify:
    ///   • every input edge points at a live node
    ///   • every input edge is mirrored in the producer's consumer set
    ///   • every consumer entry points back at a matching input edge
    ///   • the graph is acyclic
    pub fn validate_connectivity(&self) -> ConnectivityReport {
        let mut broken = Vec::new();

        for node in self.nodes() {
            for (port, e) in node.inputs().iter().enumerate() {
                match self.node(e.node) {
                    None => broken.push(format!(
                        "Node '{}' (op={}) → input {} reads missing node {}",
                        node.name,
                        node.op_type(),
                        port,
                        e.node
                    )),
                    Some(p) => {
                        let key = InputPort { node: node.id, port };
                        if !p.consumers().any(|c| c == key) {
                            broken.push(format!(
                                "Node '{}' → input {} not registered as consumer of '{}'",
                                node.name, port, p.name
                            ));
                        }
                    }
                }
            }
            let mut seen = BTreeSet::new();
            for c in node.consumers() {
                let points_back = self
                    .node(c.node)
                    .and_then(|n| n.inputs().get(c.port))
                    .is_some_and(|e| e.node == node.id);
                if !points_back || !seen.insert(c) {
                    broken.push(format!(
                        "Node '{}' lists stale consumer {}:{}",
                        node.name, c.node, c.port
                    ));
                }
            }
        }

        if self.topological_order().is_err() {
            broken.push("graph contains a cycle".to_string());
        }

        ConnectivityReport {
            valid: broken.is_empty(),
            broken_refs: broken,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Dim;

    /// input → FQ → StridedSlice → Result
    fn make_simple_graph() -> (Graph, NodeId) {
        let mut g = Graph::new("simple");
        let p = g
            .add_parameter("input", Precision::F32, PartialShape::from_static(&[1, 4, 9, 9]))
            .unwrap();
        let fq = g
            .add_fake_quantize(p, QuantizationInterval::new(256, 0.0, 2.55, 0.0, 2.55))
            .unwrap();
        let ss = g
            .add_strided_slice(
                fq,
                vec![0, 0, 0, 0],
                vec![0, 2, 0, 0],
                vec![1, 1, 1, 1],
                vec![true, false, true, true],
                vec![true, false, true, true],
            )
            .unwrap();
        g.add_result(ss).unwrap();
        (g, ss)
    }

    #[test]
    fn test_connectivity_passes_on_valid_graph() {
        let (graph, _) = make_simple_graph();
        let report = graph.validate_connectivity();
        assert!(report.valid, "broken: {:?}", report.broken_refs);
    }

    #[test]
    fn test_strided_slice_shape_inferred() {
        let (graph, ss) = make_simple_graph();
        assert_eq!(graph.try_node(ss).unwrap().shape, PartialShape::from_static(&[1, 2, 9, 9]));
    }

    #[test]
    fn test_strided_slice_keeps_masked_dynamic_axes() {
        let mut g = Graph::new("dynamic");
        let p = g
            .add_parameter("input", Precision::F32, PartialShape::from_dims(&[None, Some(4), None, None]))
            .unwrap();
        let ss = g
            .add_strided_slice(
                p,
                vec![0, 0, 0, 0],
                vec![0, -2, 0, 0],
                vec![1, 1, 1, 1],
                vec![true, false, true, true],
                vec![true, false, true, true],
            )
            .unwrap();
        let shape = &g.try_node(ss).unwrap().shape;
        assert_eq!(shape.dim(0), Some(Dim::Dynamic));
        assert_eq!(shape.extent(1), Some(2));
    }

    #[test]
    fn test_concat_sums_channel_axis() {
        let mut g = Graph::new("concat");
        let a = g.add_parameter("a", Precision::F32, PartialShape::from_static(&[1, 2, 3, 3])).unwrap();
        let b = g.add_parameter("b", Precision::F32, PartialShape::from_static(&[1, 4, 3, 3])).unwrap();
        let c = g.add_concat(&[a, b], 1).unwrap();
        assert_eq!(g.try_node(c).unwrap().shape.extent(1), Some(6));
        assert!(g.add_concat(&[a, b], 2).is_err());
    }

    #[test]
    fn test_wrong_arity_rejected() {
        let mut g = Graph::new("arity");
        let a = g.add_parameter("a", Precision::F32, PartialShape::from_static(&[1, 2])).unwrap();
        assert!(g.add_node("", Op::Multiply, &[a]).is_err());
    }

    #[test]
    fn test_connectivity_summary_formatting() {
        let valid = ConnectivityReport {
            valid: true,
            broken_refs: vec![],
        };
        assert!(valid.summary().contains("OK"));

        let broken = ConnectivityReport {
            valid: false,
            broken_refs: vec!["Node 'x' → input 0 reads missing node 9".to_string()],
        };
        let s = broken.summary();
        assert!(s.contains("BROKEN"));
        assert!(s.contains("1 broken reference"));
        assert!(s.contains("missing node 9"));
    }
}
