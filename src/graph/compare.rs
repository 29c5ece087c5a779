//! Structural graph comparison.
//!
//! Walks two graphs backwards from their Result nodes in lockstep and
//! reports every difference in operator, attributes, precision, shape or
//! wiring. Node names and ids are ignored. Constants and FakeQuantize bounds
//! compare with a float tolerance.

use std::collections::HashMap;

use super::{Graph, NodeId, Op, Tensor};
use crate::quantization::QuantizationInterval;

const ABS_TOLERANCE: f32 = 1e-5;
const REL_TOLERANCE: f32 = 1e-4;

fn close(a: f32, b: f32) -> bool {
    a == b || (a - b).abs() <= ABS_TOLERANCE + REL_TOLERANCE * b.abs()
}

fn all_close(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| close(*x, *y))
}

/// Outcome of [`compare_graphs`].
#[derive(Debug)]
#[must_use]
pub struct ComparisonReport {
    pub equal: bool,
    pub mismatches: Vec<String>,
}

impl ComparisonReport {
    pub fn summary(&self) -> String {
        if self.equal {
            "  Graphs: equal\n".to_string()
        } else {
            let mut s = format!("  Graphs: DIFFERENT ({} mismatch(es))\n", self.mismatches.len());
            for (i, m) in self.mismatches.iter().enumerate() {
                s.push_str(&format!("    {}. {}\n", i + 1, m));
            }
            s
        }
    }
}

fn tensors_match(a: &Tensor, b: &Tensor) -> bool {
    if a.precision() != b.precision() {
        return false;
    }
    let same_shape = a.shape == b.shape || (a.numel() == 1 && b.numel() == 1);
    same_shape && all_close(&a.to_f32_vec(), &b.to_f32_vec())
}

fn intervals_match(a: &QuantizationInterval, b: &QuantizationInterval) -> bool {
    a.levels == b.levels
        && all_close(&a.input_low, &b.input_low)
        && all_close(&a.input_high, &b.input_high)
        && all_close(&a.output_low, &b.output_low)
        && all_close(&a.output_high, &b.output_high)
}

fn ops_match(a: &Op, b: &Op) -> bool {
    match (a, b) {
        (Op::Constant(x), Op::Constant(y)) => tensors_match(x, y),
        (Op::FakeQuantize(x), Op::FakeQuantize(y)) => {
            x.decomposed == y.decomposed && intervals_match(&x.interval, &y.interval)
        }
        _ => a == b,
    }
}

/// Compare `actual` against `reference`.
pub fn compare_graphs(actual: &Graph, reference: &Graph) -> ComparisonReport {
    let mut mismatches = Vec::new();
    let (ra, rb) = (actual.results(), reference.results());
    if ra.len() != rb.len() {
        mismatches.push(format!("{} results vs {} in reference", ra.len(), rb.len()));
    }

    let mut paired: HashMap<NodeId, NodeId> = HashMap::new();
    let mut stack: Vec<(NodeId, NodeId)> = ra.into_iter().zip(rb).collect();
    while let Some((ia, ib)) = stack.pop() {
        if let Some(&seen) = paired.get(&ia) {
            if seen != ib {
                mismatches.push(format!("node {ia} is reached from two different reference nodes"));
            }
            continue;
        }
        paired.insert(ia, ib);
        let (Some(a), Some(b)) = (actual.node(ia), reference.node(ib)) else {
            mismatches.push(format!("dangling edge while pairing {ia} with {ib}"));
            continue;
        };
        let at = format!("'{}' vs reference '{}'", a.name, b.name);
        if !ops_match(&a.op, &b.op) {
            mismatches.push(format!("{at}: operator {:?} differs from {:?}", a.op, b.op));
            continue;
        }
        if a.precision != b.precision {
            mismatches.push(format!("{at}: precision {} vs {}", a.precision, b.precision));
        }
        if a.shape != b.shape {
            mismatches.push(format!("{at}: shape {} vs {}", a.shape, b.shape));
        }
        if a.inputs().len() != b.inputs().len() {
            mismatches.push(format!("{at}: {} inputs vs {}", a.inputs().len(), b.inputs().len()));
            continue;
        }
        for (ea, eb) in a.inputs().iter().zip(b.inputs()).rev() {
            stack.push((ea.node, eb.node));
        }
    }

    ComparisonReport {
        equal: mismatches.is_empty(),
        mismatches,
    }
}
