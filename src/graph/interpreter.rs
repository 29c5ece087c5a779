//! Reference interpreter.
//!
//! Evaluates a graph on `ndarray` tensors in f32. A node tagged with an
//! integer precision rounds and saturates its output to that type's range,
//! so a decomposed graph computes exactly what integer kernels would.
//!
//! Used to check that a rewrite leaves results numerically unchanged.

use std::collections::HashMap;

use ndarray::{ArrayD, Axis, IxDyn};

use super::shape::{broadcast, resolve_slice};
use super::{ConvolutionAttrs, Graph, Node, NodeId, Op, PartialShape, PoolAttrs, Precision, SliceBound};
use crate::errors::{LptError, Result};
use crate::quantization::QuantizationInterval;

/// Graph inputs keyed by Parameter name.
pub type Inputs = HashMap<String, ArrayD<f32>>;

fn eval_err(node: NodeId, reason: impl Into<String>) -> LptError {
    LptError::Evaluation {
        node,
        reason: reason.into(),
    }
}

/// Run `graph` on `inputs` and return the value reaching each Result node,
/// in Result id order.
pub fn evaluate(graph: &Graph, inputs: &Inputs) -> Result<Vec<ArrayD<f32>>> {
    let mut values: HashMap<NodeId, ArrayD<f32>> = HashMap::new();
    for id in graph.topological_order()? {
        let node = graph.try_node(id)?;
        let args = node
            .inputs()
            .iter()
            .map(|e| {
                values
                    .get(&e.node)
                    .ok_or_else(|| eval_err(id, format!("input {} was not evaluated", e.node)))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut out = eval_node(graph, node, &args, inputs)?;
        if node.precision.is_integer() && !matches!(node.op, Op::Constant(_)) {
            saturate(&mut out, node.precision);
        }
        values.insert(id, out);
    }
    graph
        .results()
        .into_iter()
        .map(|r| values.remove(&r).ok_or_else(|| eval_err(r, "result was not evaluated")))
        .collect()
}

fn saturate(x: &mut ArrayD<f32>, precision: Precision) {
    if let Some((lo, hi)) = precision.integer_range() {
        let (lo, hi) = (lo as f32, hi as f32);
        x.mapv_inplace(|v| v.round().clamp(lo, hi));
    }
}

fn eval_node(graph: &Graph, node: &Node, args: &[&ArrayD<f32>], inputs: &Inputs) -> Result<ArrayD<f32>> {
    let id = node.id;
    match &node.op {
        Op::Parameter => {
            let x = inputs
                .get(&node.name)
                .ok_or_else(|| eval_err(id, format!("no input named '{}'", node.name)))?;
            check_shape(id, &node.shape, x)?;
            Ok(x.clone())
        }
        Op::Constant(t) => {
            ArrayD::from_shape_vec(IxDyn(&t.shape), t.to_f32_vec()).map_err(|e| eval_err(id, e.to_string()))
        }
        Op::FakeQuantize(attrs) => fake_quantize(id, &attrs.interval, args[0]),
        Op::Concat { axis } => {
            let views: Vec<_> = args.iter().map(|a| a.view()).collect();
            ndarray::concatenate(Axis(*axis), &views).map_err(|e| eval_err(id, e.to_string()))
        }
        Op::StridedSlice(attrs) => {
            let x = args[0];
            let bounds = resolve_slice(graph, node.inputs(), attrs, &PartialShape::from_static(x.shape()));
            let mut out = x.clone();
            for (axis, bound) in bounds.into_iter().enumerate() {
                match bound {
                    SliceBound::Full => {}
                    SliceBound::Known(s) => out = out.select(Axis(axis), &s.indices()),
                    SliceBound::Unknown => {
                        return Err(eval_err(id, format!("slice bounds on axis {axis} are not constant")))
                    }
                }
            }
            Ok(out)
        }
        Op::MaxPool(attrs) => max_pool(id, attrs, args[0]),
        Op::Convert { .. } | Op::Result => Ok(args[0].clone()),
        Op::Subtract => {
            check_broadcast(id, args[0], args[1])?;
            Ok(args[0] - args[1])
        }
        Op::Multiply => {
            check_broadcast(id, args[0], args[1])?;
            Ok(args[0] * args[1])
        }
        Op::Convolution(attrs) => convolution(id, attrs, args[0], args[1]),
        Op::Other(kind) => Err(eval_err(id, format!("no reference semantics for '{kind}'"))),
    }
}

fn check_shape(id: NodeId, expected: &PartialShape, x: &ArrayD<f32>) -> Result<()> {
    let fits = expected.rank() == x.ndim()
        && expected
            .0
            .iter()
            .zip(x.shape())
            .all(|(d, &n)| d.get().map_or(true, |e| e == n));
    if fits {
        Ok(())
    } else {
        Err(eval_err(id, format!("input shape {:?} does not fit {expected}", x.shape())))
    }
}

fn check_broadcast(id: NodeId, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<()> {
    broadcast(&PartialShape::from_static(a.shape()), &PartialShape::from_static(b.shape()))
        .map(|_| ())
        .map_err(|e| eval_err(id, e.to_string()))
}

fn fake_quantize(id: NodeId, interval: &QuantizationInterval, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let channels = if x.ndim() > 1 { Some(x.shape()[1]) } else { None };
    interval.validate(channels).map_err(|reason| eval_err(id, reason))?;
    let mut out = x.clone();
    for (idx, v) in out.indexed_iter_mut() {
        let channel = if channels.is_some() { idx[1] } else { 0 };
        *v = interval.fake_quantize(*v, channel);
    }
    Ok(out)
}

/// Every position of a window with the given kernel extents.
fn window_offsets(kernel: &[usize]) -> Vec<Vec<usize>> {
    let mut all = vec![Vec::new()];
    for &k in kernel {
        all = all
            .into_iter()
            .flat_map(|prefix: Vec<usize>| {
                (0..k).map(move |i| {
                    let mut p = prefix.clone();
                    p.push(i);
                    p
                })
            })
            .collect();
    }
    all
}

struct Window<'a> {
    strides: &'a [usize],
    pads_begin: &'a [usize],
    dilations: Option<&'a [usize]>,
}

impl Window<'_> {
    fn out_extent(&self, id: NodeId, axis: usize, extent: usize, kernel: usize, pad_end: usize) -> Result<usize> {
        let stride = self.strides.get(axis).copied().unwrap_or(1);
        let dilation = self.dilations.and_then(|d| d.get(axis).copied()).unwrap_or(1);
        let effective = dilation * (kernel.max(1) - 1) + 1;
        let padded = extent + self.pads_begin.get(axis).copied().unwrap_or(0) + pad_end;
        if padded < effective || stride == 0 {
            return Err(eval_err(id, format!("window {effective} does not fit extent {padded}")));
        }
        Ok((padded - effective) / stride + 1)
    }

    /// Input coordinate for output coordinate `o` and window offset `k`, or
    /// `None` inside the padding.
    fn source(&self, axis: usize, o: usize, k: usize, extent: usize) -> Option<usize> {
        let stride = self.strides.get(axis).copied().unwrap_or(1);
        let dilation = self.dilations.and_then(|d| d.get(axis).copied()).unwrap_or(1);
        let pad = self.pads_begin.get(axis).copied().unwrap_or(0);
        let pos = (o * stride + k * dilation).checked_sub(pad)?;
        (pos < extent).then_some(pos)
    }
}

fn max_pool(id: NodeId, attrs: &PoolAttrs, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let spatial = attrs.kernel.len();
    if x.ndim() != spatial + 2 {
        return Err(eval_err(id, format!("MaxPool needs rank {} input", spatial + 2)));
    }
    let window = Window {
        strides: &attrs.strides,
        pads_begin: &attrs.pads_begin,
        dilations: None,
    };
    let mut out_shape = x.shape()[..2].to_vec();
    for i in 0..spatial {
        let pad_end = attrs.pads_end.get(i).copied().unwrap_or(0);
        out_shape.push(window.out_extent(id, i, x.shape()[i + 2], attrs.kernel[i], pad_end)?);
    }

    let offsets = window_offsets(&attrs.kernel);
    let mut out = ArrayD::from_elem(IxDyn(&out_shape), f32::NEG_INFINITY);
    let mut src = vec![0usize; x.ndim()];
    for (idx, v) in out.indexed_iter_mut() {
        src[0] = idx[0];
        src[1] = idx[1];
        'window: for off in &offsets {
            for i in 0..spatial {
                match window.source(i, idx[i + 2], off[i], x.shape()[i + 2]) {
                    Some(pos) => src[i + 2] = pos,
                    None => continue 'window,
                }
            }
            *v = v.max(x[&src[..]]);
        }
    }
    Ok(out)
}

fn convolution(id: NodeId, attrs: &ConvolutionAttrs, x: &ArrayD<f32>, w: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if x.ndim() != w.ndim() || x.ndim() < 3 || x.shape()[1] != w.shape()[1] {
        return Err(eval_err(
            id,
            format!("Convolution data {:?} and weights {:?} do not match", x.shape(), w.shape()),
        ));
    }
    let spatial = x.ndim() - 2;
    let kernel = &w.shape()[2..];
    let window = Window {
        strides: &attrs.strides,
        pads_begin: &attrs.pads_begin,
        dilations: Some(&attrs.dilations),
    };
    let mut out_shape = vec![x.shape()[0], w.shape()[0]];
    for i in 0..spatial {
        let pad_end = attrs.pads_end.get(i).copied().unwrap_or(0);
        out_shape.push(window.out_extent(id, i, x.shape()[i + 2], kernel[i], pad_end)?);
    }

    let offsets = window_offsets(kernel);
    let in_channels = x.shape()[1];
    let mut out = ArrayD::zeros(IxDyn(&out_shape));
    let mut src = vec![0usize; x.ndim()];
    let mut wi = vec![0usize; w.ndim()];
    for (idx, v) in out.indexed_iter_mut() {
        src[0] = idx[0];
        wi[0] = idx[1];
        let mut acc = 0.0f32;
        for ic in 0..in_channels {
            src[1] = ic;
            wi[1] = ic;
            'window: for off in &offsets {
                for i in 0..spatial {
                    match window.source(i, idx[i + 2], off[i], x.shape()[i + 2]) {
                        Some(pos) => src[i + 2] = pos,
                        None => continue 'window,
                    }
                    wi[i + 2] = off[i];
                }
                acc += x[&src[..]] * w[&wi[..]];
            }
        }
        *v = acc;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Tensor;

    fn inputs(name: &str, x: ArrayD<f32>) -> Inputs {
        HashMap::from([(name.to_string(), x)])
    }

    #[test]
    fn test_fake_quantize_and_integer_saturation() {
        let mut g = Graph::new("fq");
        let p = g.add_parameter("x", Precision::F32, PartialShape::from_static(&[1, 1, 1, 3])).unwrap();
        let fq = g.add_fake_quantize(p, QuantizationInterval::symmetric_io(256, 0.0, 2.55)).unwrap();
        g.add_result(fq).unwrap();
        let c = g.add_convert(p, Precision::U8).unwrap();
        g.add_result(c).unwrap();

        let x = ArrayD::from_shape_vec(IxDyn(&[1, 1, 1, 3]), vec![-1.0, 1.004, 300.4]).unwrap();
        let out = evaluate(&g, &inputs("x", x)).unwrap();
        assert!((out[0][[0, 0, 0, 1]] - 1.0).abs() < 1e-5);
        assert_eq!(out[0][[0, 0, 0, 2]], 2.55);
        assert_eq!(out[1].iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 255.0]);
    }

    #[test]
    fn test_max_pool_and_slice() {
        let mut g = Graph::new("pool");
        let p = g.add_parameter("x", Precision::F32, PartialShape::from_static(&[1, 2, 3, 3])).unwrap();
        let pool = g.add_max_pool(p, PoolAttrs::new(vec![2, 2], vec![1, 1])).unwrap();
        let ss = g
            .add_strided_slice(pool, vec![0, 1], vec![0, 2], vec![1, 1], vec![true, false], vec![true, false])
            .unwrap();
        g.add_result(ss).unwrap();

        let x = ArrayD::from_shape_vec(IxDyn(&[1, 2, 3, 3]), (0..18).map(|v| v as f32).collect()).unwrap();
        let out = evaluate(&g, &inputs("x", x)).unwrap();
        assert_eq!(out[0].shape(), &[1, 1, 2, 2]);
        assert_eq!(out[0][[0, 0, 0, 0]], 13.0);
        assert_eq!(out[0][[0, 0, 1, 1]], 17.0);
    }

    #[test]
    fn test_convolution_with_channel_broadcast() {
        let mut g = Graph::new("conv");
        let p = g.add_parameter("x", Precision::F32, PartialShape::from_static(&[1, 2, 2, 2])).unwrap();
        let m = g.add_multiply(p, Tensor::channel_vector(vec![1.0, 2.0], 4)).unwrap();
        let w = g.add_constant(Tensor::f32(vec![1, 2, 1, 1], vec![1.0, 1.0]).unwrap()).unwrap();
        let conv = g.add_convolution(m, w, ConvolutionAttrs::unit(2)).unwrap();
        g.add_result(conv).unwrap();

        let x = ArrayD::from_elem(IxDyn(&[1, 2, 2, 2]), 1.0);
        let out = evaluate(&g, &inputs("x", x)).unwrap();
        assert_eq!(out[0].shape(), &[1, 1, 2, 2]);
        assert!(out[0].iter().all(|&v| v == 3.0));
    }

    #[test]
    fn test_missing_input_is_reported() {
        let mut g = Graph::new("missing");
        let p = g.add_parameter("x", Precision::F32, PartialShape::from_static(&[1])).unwrap();
        g.add_result(p).unwrap();
        let err = evaluate(&g, &Inputs::new()).unwrap_err();
        assert!(matches!(err, LptError::Evaluation { node: 0, .. }));
    }
}
