//! Per-pass analysis shared by the rules.
//!
//! A *quantization group* is the connected set of FakeQuantize nodes,
//! structural operators (Concat, StridedSlice, MaxPool) and dequantization
//! chain nodes reachable from one another through data edges. Every
//! FakeQuantize in a group must land on the same precision, so the decision
//! is made here once per group from the restrictions of the ports where the
//! group's data leaves it.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::trace;

use super::Diagnostic;
use crate::graph::{Graph, InputPort, NodeId, Op, Precision};
use crate::quantization::dequantization::FakeQuantizeDequantization;
use crate::quantization::restrictions::{intersect, select_precision, GranularityRestrictions, PrecisionRestrictions};
use crate::quantization::{align, SharedQuantization};

#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationGroup {
    /// Every node in the group, in id order.
    pub members: BTreeSet<NodeId>,
    /// FakeQuantize members not yet decomposed.
    pub pending: Vec<NodeId>,
    /// Input ports outside the group that read group data.
    pub terminals: Vec<InputPort>,
    /// `None` when there is nothing to decompose or the consumers conflict.
    pub precision: Option<Precision>,
    pub per_tensor: bool,
    /// Aligned interval for per-tensor groups.
    pub shared: Option<SharedQuantization>,
}

#[derive(Debug, Clone, Default)]
pub struct Markup {
    groups: Vec<QuantizationGroup>,
    group_of: HashMap<NodeId, usize>,
    diagnostics: Vec<Diagnostic>,
}

/// Nodes that can join a group: structural operators, FakeQuantize, and the
/// pieces of a dequantization chain.
fn is_group_node(graph: &Graph, id: NodeId) -> bool {
    match graph.node(id).map(|n| &n.op) {
        Some(Op::FakeQuantize(_)) => true,
        Some(op) if op.is_quantization_transparent() => true,
        Some(Op::Convert { .. } | Op::Subtract | Op::Multiply) => FakeQuantizeDequantization::read(graph, id).is_some(),
        _ => false,
    }
}

/// Ports of `id` that carry data (as opposed to constant operands).
fn data_ports(graph: &Graph, id: NodeId) -> usize {
    match graph.node(id).map(|n| &n.op) {
        Some(Op::Concat { .. }) => graph.node(id).map_or(0, |n| n.inputs().len()),
        Some(_) => 1,
        None => 0,
    }
}

impl Markup {
    /// Group the graph and decide precision and granularity per group.
    pub fn analyze(
        graph: &Graph,
        precision_restrictions: &PrecisionRestrictions,
        granularity_restrictions: &GranularityRestrictions,
    ) -> Self {
        let mut markup = Markup::default();
        let seeds: Vec<NodeId> = graph
            .nodes()
            .filter(|n| matches!(n.op, Op::FakeQuantize(_)))
            .map(|n| n.id)
            .collect();

        for seed in seeds {
            if markup.group_of.contains_key(&seed) {
                continue;
            }
            let (members, terminals) = Self::collect(graph, seed);
            let group = Self::decide(graph, members, terminals, precision_restrictions, granularity_restrictions, &mut markup.diagnostics);
            let index = markup.groups.len();
            for &m in &group.members {
                markup.group_of.insert(m, index);
            }
            markup.groups.push(group);
        }
        markup
    }

    /// Breadth-first walk over data edges between group nodes.
    fn collect(graph: &Graph, seed: NodeId) -> (BTreeSet<NodeId>, Vec<InputPort>) {
        let mut members = BTreeSet::from([seed]);
        let mut terminals = BTreeSet::new();
        let mut queue = VecDeque::from([seed]);

        while let Some(id) = queue.pop_front() {
            let is_fq = matches!(graph.node(id).map(|n| &n.op), Some(Op::FakeQuantize(_)));
            if !is_fq {
                for port in 0..data_ports(graph, id) {
                    if let Some(producer) = graph.input(id, port) {
                        if is_group_node(graph, producer) && members.insert(producer) {
                            queue.push_back(producer);
                        }
                    }
                }
            }
            for c in graph.consumers(id) {
                let joins = c.port < data_ports(graph, c.node)
                    && !matches!(graph.node(c.node).map(|n| &n.op), Some(Op::FakeQuantize(_)))
                    && is_group_node(graph, c.node);
                if joins {
                    if members.insert(c.node) {
                        queue.push_back(c.node);
                    }
                } else {
                    terminals.insert(c);
                }
            }
        }
        (members, terminals.into_iter().collect())
    }

    fn decide(
        graph: &Graph,
        members: BTreeSet<NodeId>,
        terminals: Vec<InputPort>,
        precision_restrictions: &PrecisionRestrictions,
        granularity_restrictions: &GranularityRestrictions,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> QuantizationGroup {
        let pending: Vec<NodeId> = members
            .iter()
            .copied()
            .filter(|&id| matches!(graph.node(id).map(|n| &n.op), Some(Op::FakeQuantize(a)) if !a.decomposed))
            .collect();

        let per_tensor = members
            .iter()
            .chain(terminals.iter().map(|t| &t.node))
            .filter_map(|&id| graph.op_type(id))
            .any(|op| granularity_restrictions.requires_per_tensor(op));

        let mut group = QuantizationGroup {
            members,
            pending,
            terminals,
            precision: None,
            per_tensor,
            shared: None,
        };
        let intervals: Vec<_> = group
            .pending
            .iter()
            .filter_map(|&id| match graph.node(id).map(|n| &n.op) {
                Some(Op::FakeQuantize(a)) => Some(&a.interval),
                _ => None,
            })
            .collect();
        let Some(levels) = intervals.iter().map(|i| i.levels).max() else {
            return group;
        };

        let restricted: Vec<(InputPort, &[Precision])> = group
            .terminals
            .iter()
            .filter_map(|t| {
                let op = graph.op_type(t.node)?;
                precision_restrictions.allowed(op, t.port).map(|allowed| (*t, allowed))
            })
            .collect();
        let allowed = intersect(restricted.iter().map(|(_, a)| *a));

        match select_precision(allowed.as_deref(), levels) {
            Ok(precision) => group.precision = Some(precision),
            Err(reason) => {
                diagnostics.push(Diagnostic::PrecisionConflict {
                    fake_quantizes: group.pending.clone(),
                    ports: restricted.iter().map(|(t, _)| *t).collect(),
                    reason,
                });
                return group;
            }
        }

        if group.per_tensor {
            if let Some(precision) = group.precision {
                match align(intervals.iter().copied(), precision) {
                    Ok(shared) => group.shared = Some(shared),
                    Err(reason) => trace!(fake_quantizes = ?group.pending, %reason, "per-tensor alignment skipped"),
                }
            }
        }
        group
    }

    pub fn groups(&self) -> &[QuantizationGroup] {
        &self.groups
    }

    pub fn group_of(&self, id: NodeId) -> Option<&QuantizationGroup> {
        self.group_of.get(&id).map(|&i| &self.groups[i])
    }

    /// Whether `id` sits in a group forced to per-tensor dequantization.
    pub fn is_per_tensor(&self, id: NodeId) -> bool {
        self.group_of(id).is_some_and(|g| g.per_tensor)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}
