//! Computation graph model: an arena of typed nodes addressed by stable ids.
//!
//! Nodes are never moved once added. Removing a node leaves a tombstone so
//! every other id stays valid across rewrites. Edges are plain index pairs:
//! each node owns its ordered input list, and the graph keeps the matching
//! consumer set on the producer side so back-references are cheap to query.
//!
//! Every modelled operator produces exactly one output (slot 0); the slot is
//! still carried on [`Edge`] so the wiring reads the same as in multi-output
//! graph formats.

pub mod builder;
pub mod compare;
pub mod interpreter;
pub mod shape;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{LptError, Result};
use crate::quantization::QuantizationInterval;

pub use builder::ConnectivityReport;
pub use shape::{AxisSlice, Dim, PartialShape, SliceBound};

/// Stable index of a node inside its [`Graph`].
pub type NodeId = usize;

/// Axis that per-channel quantization parameters are aligned to (NCHW layout).
pub const CHANNEL_AXIS: usize = 1;

// ===========================================================================
// Element precision
// ===========================================================================

/// Element type tag carried by every node output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    I64,
}

impl Precision {
    pub fn is_real(self) -> bool {
        matches!(self, Precision::F32 | Precision::F16)
    }

    pub fn is_integer(self) -> bool {
        !self.is_real()
    }

    /// Signed integer precision.
    pub fn is_signed(self) -> bool {
        matches!(self, Precision::I8 | Precision::I16 | Precision::I32 | Precision::I64)
    }

    /// Storage width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Precision::U8 | Precision::I8 => 8,
            Precision::F16 | Precision::U16 | Precision::I16 => 16,
            Precision::F32 | Precision::U32 | Precision::I32 => 32,
            Precision::I64 => 64,
        }
    }

    /// Smallest and largest representable value for integer precisions.
    pub fn integer_range(self) -> Option<(f64, f64)> {
        match self {
            Precision::U8 => Some((0.0, u8::MAX as f64)),
            Precision::I8 => Some((i8::MIN as f64, i8::MAX as f64)),
            Precision::U16 => Some((0.0, u16::MAX as f64)),
            Precision::I16 => Some((i16::MIN as f64, i16::MAX as f64)),
            Precision::U32 => Some((0.0, u32::MAX as f64)),
            Precision::I32 => Some((i32::MIN as f64, i32::MAX as f64)),
            Precision::I64 => Some((i64::MIN as f64, i64::MAX as f64)),
            Precision::F32 | Precision::F16 => None,
        }
    }

    /// Unsigned integer precision of the given width.
    pub fn unsigned_of(bits: u32) -> Option<Precision> {
        match bits {
            8 => Some(Precision::U8),
            16 => Some(Precision::U16),
            32 => Some(Precision::U32),
            _ => None,
        }
    }

    /// Signed integer precision of the given width.
    pub fn signed_of(bits: u32) -> Option<Precision> {
        match bits {
            8 => Some(Precision::I8),
            16 => Some(Precision::I16),
            32 => Some(Precision::I32),
            64 => Some(Precision::I64),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Precision::F32 => "f32",
            Precision::F16 => "f16",
            Precision::U8 => "u8",
            Precision::I8 => "i8",
            Precision::U16 => "u16",
            Precision::I16 => "i16",
            Precision::U32 => "u32",
            Precision::I32 => "i32",
            Precision::I64 => "i64",
        };
        f.write_str(s)
    }
}

impl FromStr for Precision {
    type Err = LptError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "f32" => Ok(Precision::F32),
            "f16" => Ok(Precision::F16),
            "u8" => Ok(Precision::U8),
            "i8" => Ok(Precision::I8),
            "u16" => Ok(Precision::U16),
            "i16" => Ok(Precision::I16),
            "u32" => Ok(Precision::U32),
            "i32" => Ok(Precision::I32),
            "i64" => Ok(Precision::I64),
            _ => Err(LptError::Config {
                reason: format!("unknown precision '{s}'. Valid: f32, f16, u8, i8, u16, i16, u32, i32, i64"),
            }),
        }
    }
}

// ===========================================================================
// Constant payloads
// ===========================================================================

/// Raw storage of a constant tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

/// Dense constant tensor (row-major).
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl Tensor {
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: TensorData::F32(vec![value]),
        }
    }

    pub fn f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(LptError::invalid_graph(format!(
                "constant has {} values but shape {:?} expects {}",
                values.len(),
                shape,
                expected
            )));
        }
        Ok(Self {
            shape,
            data: TensorData::F32(values),
        })
    }

    /// Rank-1 i64 tensor, the form slice bounds are given in.
    pub fn i64_vector(values: Vec<i64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: TensorData::I64(values),
        }
    }

    /// Per-channel tensor broadcastable over a rank-`rank` activation:
    /// shape `[1, C, 1, ...]`.
    pub fn channel_vector(values: Vec<f32>, rank: usize) -> Self {
        let mut shape = vec![1; rank.max(CHANNEL_AXIS + 1)];
        shape[CHANNEL_AXIS] = values.len();
        Self {
            shape,
            data: TensorData::F32(values),
        }
    }

    pub fn precision(&self) -> Precision {
        match self.data {
            TensorData::F32(_) => Precision::F32,
            TensorData::I64(_) => Precision::I64,
        }
    }

    pub fn numel(&self) -> usize {
        match &self.data {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    /// Values widened to f32 regardless of storage.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::I64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }
}

// ===========================================================================
// Operators
// ===========================================================================

/// Operator kind without attributes; the key rules are registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpType {
    Parameter,
    Constant,
    FakeQuantize,
    Concat,
    StridedSlice,
    MaxPool,
    Convert,
    Subtract,
    Multiply,
    Convolution,
    Result,
    Other,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// FakeQuantize attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeQuantizeAttrs {
    pub interval: QuantizationInterval,
    /// Set once the node emits integer codes and a dequantization follows it.
    pub decomposed: bool,
}

/// StridedSlice masks. `true` means "ignore the bound, take the full extent".
/// Begin, end and strides are inputs 1..=3 of the node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StridedSliceAttrs {
    pub begin_mask: Vec<bool>,
    pub end_mask: Vec<bool>,
}

/// Spatial window shared by MaxPool and Convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolAttrs {
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
    pub pads_begin: Vec<usize>,
    pub pads_end: Vec<usize>,
}

impl PoolAttrs {
    /// Unpadded window with the given kernel and strides.
    pub fn new(kernel: Vec<usize>, strides: Vec<usize>) -> Self {
        let n = kernel.len();
        Self {
            kernel,
            strides,
            pads_begin: vec![0; n],
            pads_end: vec![0; n],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionAttrs {
    pub strides: Vec<usize>,
    pub pads_begin: Vec<usize>,
    pub pads_end: Vec<usize>,
    pub dilations: Vec<usize>,
}

impl ConvolutionAttrs {
    pub fn unit(spatial_rank: usize) -> Self {
        Self {
            strides: vec![1; spatial_rank],
            pads_begin: vec![0; spatial_rank],
            pads_end: vec![0; spatial_rank],
            dilations: vec![1; spatial_rank],
        }
    }
}

/// Operator with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Parameter,
    Constant(Tensor),
    FakeQuantize(FakeQuantizeAttrs),
    Concat { axis: usize },
    StridedSlice(StridedSliceAttrs),
    MaxPool(PoolAttrs),
    Convert { to: Precision },
    Subtract,
    Multiply,
    Convolution(ConvolutionAttrs),
    Result,
    Other(String),
}

impl Op {
    pub fn op_type(&self) -> OpType {
        match self {
            Op::Parameter => OpType::Parameter,
            Op::Constant(_) => OpType::Constant,
            Op::FakeQuantize(_) => OpType::FakeQuantize,
            Op::Concat { .. } => OpType::Concat,
            Op::StridedSlice(_) => OpType::StridedSlice,
            Op::MaxPool(_) => OpType::MaxPool,
            Op::Convert { .. } => OpType::Convert,
            Op::Subtract => OpType::Subtract,
            Op::Multiply => OpType::Multiply,
            Op::Convolution(_) => OpType::Convolution,
            Op::Result => OpType::Result,
            Op::Other(_) => OpType::Other,
        }
    }

    /// Operators whose output precision simply follows their data input.
    pub fn preserves_precision(&self) -> bool {
        matches!(
            self,
            Op::Concat { .. }
                | Op::StridedSlice(_)
                | Op::MaxPool(_)
                | Op::Subtract
                | Op::Multiply
                | Op::Result
        )
    }

    /// Structural operators that commute with a per-channel affine correction.
    pub fn is_quantization_transparent(&self) -> bool {
        matches!(self, Op::Concat { .. } | Op::StridedSlice(_) | Op::MaxPool(_))
    }

    fn input_arity(&self) -> Option<usize> {
        match self {
            Op::Parameter | Op::Constant(_) => Some(0),
            Op::FakeQuantize(_) | Op::MaxPool(_) | Op::Convert { .. } | Op::Result => Some(1),
            Op::Subtract | Op::Multiply | Op::Convolution(_) => Some(2),
            Op::StridedSlice(_) => Some(4),
            Op::Concat { .. } | Op::Other(_) => None,
        }
    }
}

// ===========================================================================
// Nodes and edges
// ===========================================================================

/// Reference to a producer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub node: NodeId,
    pub slot: usize,
}

impl Edge {
    pub fn of(node: NodeId) -> Self {
        Self { node, slot: 0 }
    }
}

/// Reference to a consumer input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputPort {
    pub node: NodeId,
    pub port: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: Op,
    pub precision: Precision,
    pub shape: PartialShape,
    inputs: Vec<Edge>,
    consumers: BTreeSet<InputPort>,
}

impl Node {
    pub fn op_type(&self) -> OpType {
        self.op.op_type()
    }

    pub fn inputs(&self) -> &[Edge] {
        &self.inputs
    }

    pub fn consumers(&self) -> impl Iterator<Item = InputPort> + '_ {
        self.consumers.iter().copied()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

// ===========================================================================
// Graph
// ===========================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    pub name: String,
    nodes: Vec<Option<Node>>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    /// Mutable access to a node's attributes, precision and shape.
    /// Wiring is only changed through [`Graph::set_input`] and friends.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id).and_then(|n| n.as_mut())
    }

    pub fn try_node(&self, id: NodeId) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| LptError::invalid_graph(format!("node {id} does not exist")))
    }

    fn try_node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.node_mut(id)
            .ok_or_else(|| LptError::invalid_graph(format!("node {id} does not exist")))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Live nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter_map(|n| n.as_ref())
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper bound (exclusive) of ids ever handed out.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Producer feeding `port` of `id`.
    pub fn input(&self, id: NodeId, port: usize) -> Option<NodeId> {
        self.node(id)?.inputs.get(port).map(|e| e.node)
    }

    pub fn op_type(&self, id: NodeId) -> Option<OpType> {
        self.node(id).map(|n| n.op_type())
    }

    pub fn constant(&self, id: NodeId) -> Option<&Tensor> {
        match &self.node(id)?.op {
            Op::Constant(t) => Some(t),
            _ => None,
        }
    }

    pub fn consumers(&self, id: NodeId) -> Vec<InputPort> {
        self.node(id)
            .map(|n| n.consumers().collect())
            .unwrap_or_default()
    }

    pub fn results(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| matches!(n.op, Op::Result))
            .map(|n| n.id)
            .collect()
    }

    pub fn parameters(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| matches!(n.op, Op::Parameter))
            .map(|n| n.id)
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn count_op(&self, op_type: OpType) -> usize {
        self.nodes().filter(|n| n.op_type() == op_type).count()
    }

    /// Add a node whose shape and precision are inferred from its inputs.
    pub fn add_node(&mut self, name: impl Into<String>, op: Op, inputs: &[NodeId]) -> Result<NodeId> {
        let edges: Vec<Edge> = inputs.iter().map(|&i| Edge::of(i)).collect();
        self.check_inputs(&op, &edges)?;
        let shape = shape::infer(self, &op, &edges)?;
        let precision = self.infer_precision(&op, &edges)?;
        Ok(self.push(name.into(), op, precision, shape, edges))
    }

    /// Add a node with an explicit shape and precision (sources and opaque ops).
    pub fn add_node_with(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: &[NodeId],
        precision: Precision,
        shape: PartialShape,
    ) -> Result<NodeId> {
        let edges: Vec<Edge> = inputs.iter().map(|&i| Edge::of(i)).collect();
        self.check_inputs(&op, &edges)?;
        Ok(self.push(name.into(), op, precision, shape, edges))
    }

    fn check_inputs(&self, op: &Op, edges: &[Edge]) -> Result<()> {
        if let Some(arity) = op.input_arity() {
            if edges.len() != arity {
                return Err(LptError::invalid_graph(format!(
                    "{} expects {} inputs, got {}",
                    op.op_type(),
                    arity,
                    edges.len()
                )));
            }
        }
        for e in edges {
            self.try_node(e.node)?;
        }
        Ok(())
    }

    fn push(&mut self, name: String, op: Op, precision: Precision, shape: PartialShape, inputs: Vec<Edge>) -> NodeId {
        let id = self.nodes.len();
        let name = if name.is_empty() {
            format!("{}_{}", op.op_type(), id)
        } else {
            name
        };
        for (port, e) in inputs.iter().enumerate() {
            if let Some(Some(producer)) = self.nodes.get_mut(e.node) {
                producer.consumers.insert(InputPort { node: id, port });
            }
        }
        self.nodes.push(Some(Node {
            id,
            name,
            op,
            precision,
            shape,
            inputs,
            consumers: BTreeSet::new(),
        }));
        id
    }

    fn infer_precision(&self, op: &Op, edges: &[Edge]) -> Result<Precision> {
        let first = || -> Result<Precision> {
            let e = edges
                .first()
                .ok_or_else(|| LptError::invalid_graph(format!("{} has no inputs", op.op_type())))?;
            Ok(self.try_node(e.node)?.precision)
        };
        match op {
            Op::Constant(t) => Ok(t.precision()),
            Op::Convert { to } => Ok(*to),
            Op::Parameter | Op::Other(_) => Ok(Precision::F32),
            Op::Convolution(_) => {
                let p = first()?;
                Ok(if p.is_real() { p } else { Precision::F32 })
            }
            _ => first(),
        }
    }

    /// Rewire `port` of `consumer` to read from `producer`.
    pub fn set_input(&mut self, consumer: NodeId, port: usize, producer: NodeId) -> Result<()> {
        self.try_node(producer)?;
        let old = {
            let node = self.try_node_mut(consumer)?;
            let slot = node.inputs.get_mut(port).ok_or_else(|| {
                LptError::invalid_graph(format!("node {consumer} has no input port {port}"))
            })?;
            std::mem::replace(slot, Edge::of(producer))
        };
        let key = InputPort { node: consumer, port };
        if let Some(p) = self.node_mut(old.node) {
            p.consumers.remove(&key);
        }
        self.try_node_mut(producer)?.consumers.insert(key);
        Ok(())
    }

    /// Remove a node that nothing consumes.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node> {
        let node = self.try_node(id)?;
        if node.consumer_count() > 0 {
            return Err(LptError::invalid_graph(format!(
                "cannot remove node {id} ('{}'): still has {} consumer(s)",
                node.name,
                node.consumer_count()
            )));
        }
        let node = self.nodes[id].take().ok_or_else(|| LptError::invalid_graph(format!("node {id} does not exist")))?;
        for (port, e) in node.inputs.iter().enumerate() {
            if let Some(p) = self.node_mut(e.node) {
                p.consumers.remove(&InputPort { node: id, port });
            }
        }
        Ok(node)
    }

    /// Remove `id` if nothing consumes it, then walk up its inputs doing the
    /// same. Parameters and Results are never removed. Returns the number of
    /// nodes removed.
    pub fn prune(&mut self, id: NodeId) -> usize {
        let mut removed = 0;
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let Some(node) = self.node(n) else { continue };
            if node.consumer_count() > 0 || matches!(node.op, Op::Parameter | Op::Result) {
                continue;
            }
            if let Ok(node) = self.remove_node(n) {
                removed += 1;
                stack.extend(node.inputs.iter().map(|e| e.node));
            }
        }
        removed
    }

    /// Recompute the shape of `id`, and its precision when the operator
    /// simply forwards its input precision.
    pub fn refresh(&mut self, id: NodeId) -> Result<()> {
        let node = self.try_node(id)?;
        let (op, inputs) = (node.op.clone(), node.inputs.clone());
        if matches!(op, Op::Parameter | Op::Other(_)) {
            return Ok(());
        }
        let shape = shape::infer(self, &op, &inputs)?;
        let precision = if op.preserves_precision() {
            Some(self.infer_precision(&op, &inputs)?)
        } else {
            None
        };
        let node = self.try_node_mut(id)?;
        node.shape = shape;
        if let Some(p) = precision {
            node.precision = p;
        }
        Ok(())
    }

    /// Producer-before-consumer order over live nodes. Among ready nodes the
    /// lowest id goes first, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        let mut ready = BTreeSet::new();
        for n in self.nodes() {
            let d = n.inputs.len();
            indegree.insert(n.id, d);
            if d == 0 {
                ready.insert(n.id);
            }
        }
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for c in self.consumers(id) {
                if let Some(d) = indegree.get_mut(&c.node) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(c.node);
                    }
                }
            }
        }
        if order.len() != indegree.len() {
            return Err(LptError::invalid_graph("graph contains a cycle"));
        }
        Ok(order)
    }
}
