//! Canonical concat-with-strided-slice subgraphs.
//!
//! ```text
//! p1 → FQ1 → [StridedSlice 0:2] ─┐
//!                                Concat(axis 1) ─┬─ [StridedSlice 0:-2] → Result
//! p2 → FQ2 ──────────────────────┘               └─ MaxPool(2×2, stride 1) → Result
//! ```
//!
//! The bracketed slices are optional. The catalog covers identical and
//! different intervals, zero points, and a per-tensor (aligned) concat.

use rand::Rng;

use crate::config::LptConfig;
use crate::errors::Result;
use crate::graph::interpreter::Inputs;
use crate::graph::{Graph, NodeId, OpType, PartialShape, PoolAttrs, Precision};
use crate::quantization::QuantizationInterval;

/// One concat-with-strided-slice case.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatWithStridedSlice {
    pub name: &'static str,
    pub fq1: QuantizationInterval,
    pub fq2: QuantizationInterval,
    /// Slice the first branch to its first two channels before the concat.
    pub ss_before: bool,
    /// Drop the last two channels of the concat on the first output.
    pub ss_after: bool,
    /// Force per-tensor dequantization by restricting Concat granularity.
    pub per_tensor: bool,
}

/// A built scenario and the ids tests look at.
#[derive(Debug, Clone)]
pub struct ScenarioGraph {
    pub graph: Graph,
    pub fake_quantizes: [NodeId; 2],
    pub concat: NodeId,
    pub max_pool: NodeId,
    /// Result behind the optional slice after the concat.
    pub sliced_result: NodeId,
    /// Result behind the MaxPool.
    pub pooled_result: NodeId,
}

/// Input shapes every case runs on.
pub fn shapes() -> Vec<PartialShape> {
    vec![
        PartialShape::from_static(&[1, 4, 9, 9]),
        PartialShape::from_static(&[4, 4, 9, 9]),
        PartialShape::from_dims(&[None, Some(4), None, None]),
    ]
}

pub fn catalog() -> Vec<ConcatWithStridedSlice> {
    let u8_range = QuantizationInterval::symmetric_io(256, 0.0, 2.55);
    let wide = QuantizationInterval::symmetric_io(256, 0.0, 25.5);
    let case = |name, fq2: &QuantizationInterval, ss_before, ss_after, per_tensor| ConcatWithStridedSlice {
        name,
        fq1: u8_range.clone(),
        fq2: fq2.clone(),
        ss_before,
        ss_after,
        per_tensor,
    };
    vec![
        case("same_intervals", &u8_range, true, true, false),
        case("different_intervals", &wide, true, true, false),
        case("different_intervals_ss_after", &wide, false, true, false),
        case("different_intervals_ss_before", &wide, true, false, false),
        case(
            "zero_point",
            &QuantizationInterval::symmetric_io(256, 1.275, 2.55),
            true,
            true,
            false,
        ),
        case(
            "per_tensor",
            &QuantizationInterval::symmetric_io(256, -1.28, 1.27),
            true,
            true,
            true,
        ),
    ]
}

pub fn find(name: &str) -> Option<ConcatWithStridedSlice> {
    catalog().into_iter().find(|c| c.name == name)
}

impl ConcatWithStridedSlice {
    pub fn build(&self, shape: &PartialShape) -> Result<ScenarioGraph> {
        let mut g = Graph::new(self.name);
        let p1 = g.add_parameter("input1", Precision::F32, shape.clone())?;
        let p2 = g.add_parameter("input2", Precision::F32, shape.clone())?;
        let fq1 = g.add_fake_quantize(p1, self.fq1.clone())?;
        let fq2 = g.add_fake_quantize(p2, self.fq2.clone())?;

        let mut left = fq1;
        if self.ss_before {
            left = g.add_strided_slice(
                fq1,
                vec![0, 0, 0, 0],
                vec![0, 2, 0, 0],
                vec![1, 1, 1, 1],
                vec![true, false, true, true],
                vec![true, false, true, true],
            )?;
        }
        let concat = g.add_concat(&[left, fq2], 1)?;

        let mut first = concat;
        if self.ss_after {
            first = g.add_strided_slice(
                concat,
                vec![0, 0, 0, 0],
                vec![0, -2, 0, 0],
                vec![1, 1, 1, 1],
                vec![true, false, true, true],
                vec![true, false, true, true],
            )?;
        }
        let sliced_result = g.add_result(first)?;
        let max_pool = g.add_max_pool(concat, PoolAttrs::new(vec![2, 2], vec![1, 1]))?;
        let pooled_result = g.add_result(max_pool)?;

        Ok(ScenarioGraph {
            graph: g,
            fake_quantizes: [fq1, fq2],
            concat,
            max_pool,
            sliced_result,
            pooled_result,
        })
    }

    /// The U8/I8 catalog, plus a Concat granularity restriction for the
    /// per-tensor case.
    pub fn config(&self) -> LptConfig {
        let mut config = LptConfig::u8_i8();
        if self.per_tensor {
            config.granularity_restrictions.push(OpType::Concat);
        }
        config
    }
}

/// Random values for every Parameter, spread a little past `range` so the
/// clamping regions of FakeQuantize are exercised too. Dynamic dimensions
/// take `dynamic_extent`.
pub fn random_inputs(graph: &Graph, rng: &mut impl Rng, range: (f32, f32), dynamic_extent: usize) -> Inputs {
    let margin = (range.1 - range.0) * 0.1;
    graph
        .parameters()
        .into_iter()
        .filter_map(|id| graph.node(id))
        .map(|node| {
            let dims: Vec<usize> = node.shape.0.iter().map(|d| d.get().unwrap_or(dynamic_extent)).collect();
            let n: usize = dims.iter().product();
            let values: Vec<f32> = (0..n)
                .map(|_| rng.gen_range(range.0 - margin..range.1 + margin))
                .collect();
            let array = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&dims), values)
                .unwrap_or_else(|_| ndarray::ArrayD::zeros(ndarray::IxDyn(&dims)));
            (node.name.clone(), array)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_catalog_builds_on_every_shape() {
        for case in catalog() {
            for shape in shapes() {
                let s = case.build(&shape).unwrap();
                assert!(s.graph.validate_connectivity().valid, "{}", case.name);
                let channels = if case.ss_before { 6 } else { 8 };
                assert_eq!(s.graph.try_node(s.concat).unwrap().shape.extent(1), Some(channels));
            }
        }
    }

    #[test]
    fn test_find_and_config() {
        let case = find("per_tensor").unwrap();
        assert!(case.config().granularity_restrictions().requires_per_tensor(OpType::Concat));
        assert!(find("missing").is_none());
    }

    #[test]
    fn test_random_inputs_cover_dynamic_dims() {
        let s = find("zero_point").unwrap().build(&shapes()[2]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let inputs = random_inputs(&s.graph, &mut rng, (0.0, 2.55), 5);
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs["input1"].shape(), &[5, 4, 5, 5]);
    }
}
