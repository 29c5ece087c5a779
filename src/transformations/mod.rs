//! Low-precision transformation engine.
//!
//! Each pass:
//!
//!   1. validates every pending FakeQuantize interval (fatal errors leave the
//!      graph untouched)
//!   2. runs [`Markup`] to decide precision and granularity per
//!      quantization group
//!   3. visits the nodes that existed at the start of the pass in
//!      producer-before-consumer order, and applies the rule registered for
//!      each node's operator kind when its precondition holds
//!
//! A single pass reaches the final graph for every supported pattern;
//! [`LowPrecisionTransformer::run_to_fixed_point`] repeats passes until one
//! rewrites nothing.

pub mod concat;
pub mod fake_quantize_decomposition;
pub mod markup;
pub mod max_pool;
pub mod network_helper;
pub mod strided_slice;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::LptConfig;
use crate::errors::{LptError, Result};
use crate::graph::{Graph, InputPort, NodeId, Op, OpType, CHANNEL_AXIS};
use crate::quantization::restrictions::{GranularityRestrictions, PrecisionRestrictions};

pub use markup::{Markup, QuantizationGroup};

// ===========================================================================
// Rule identity and registry
// ===========================================================================

/// The rules the engine knows, one per matched operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    FakeQuantize,
    Concat,
    StridedSlice,
    MaxPool,
}

impl RuleKind {
    pub const ALL: [RuleKind; 4] = [
        RuleKind::FakeQuantize,
        RuleKind::Concat,
        RuleKind::StridedSlice,
        RuleKind::MaxPool,
    ];

    /// Operator kind the rule matches.
    pub fn op_type(self) -> OpType {
        match self {
            RuleKind::FakeQuantize => OpType::FakeQuantize,
            RuleKind::Concat => OpType::Concat,
            RuleKind::StridedSlice => OpType::StridedSlice,
            RuleKind::MaxPool => OpType::MaxPool,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::FakeQuantize => "fake_quantize",
            RuleKind::Concat => "concat",
            RuleKind::StridedSlice => "strided_slice",
            RuleKind::MaxPool => "max_pool",
        };
        f.pad(s)
    }
}

impl FromStr for RuleKind {
    type Err = LptError;

    fn from_str(s: &str) -> Result<Self> {
        RuleKind::ALL
            .into_iter()
            .find(|k| k.to_string() == s.to_lowercase())
            .ok_or_else(|| LptError::Config {
                reason: format!("unknown rule '{s}'. Valid: fake_quantize, concat, strided_slice, max_pool"),
            })
    }
}

/// Enabled rules.
pub type RuleSet = BTreeSet<RuleKind>;

pub fn all_rules() -> RuleSet {
    RuleKind::ALL.into_iter().collect()
}

/// Engine-wide switches.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformationParams {
    /// Tag low-precision producers with their integer precision and insert
    /// a Convert back to f32 in every dequantization.
    pub update_precisions: bool,
}

impl Default for TransformationParams {
    fn default() -> Self {
        Self {
            update_precisions: true,
        }
    }
}

/// Read-only state a rule sees while it runs.
pub struct TransformationContext<'a> {
    pub params: &'a TransformationParams,
    pub precision_restrictions: &'a PrecisionRestrictions,
    pub granularity_restrictions: &'a GranularityRestrictions,
    pub markup: &'a Markup,
}

type Predicate = fn(&Graph, NodeId, &TransformationContext) -> bool;
type Rewrite = fn(&mut Graph, NodeId, &TransformationContext) -> Result<bool>;

/// A registered rule: matched kind, applicability check, rewrite.
#[derive(Clone, Copy)]
pub struct LayerTransformation {
    pub kind: RuleKind,
    pub op_type: OpType,
    pub can_be_transformed: Predicate,
    pub transform: Rewrite,
}

impl fmt::Debug for LayerTransformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerTransformation")
            .field("kind", &self.kind)
            .field("op_type", &self.op_type)
            .finish()
    }
}

impl LayerTransformation {
    pub fn of(kind: RuleKind) -> Self {
        let (can_be_transformed, transform): (Predicate, Rewrite) = match kind {
            RuleKind::FakeQuantize => (
                fake_quantize_decomposition::can_be_transformed,
                fake_quantize_decomposition::transform,
            ),
            RuleKind::Concat => (concat::can_be_transformed, concat::transform),
            RuleKind::StridedSlice => (strided_slice::can_be_transformed, strided_slice::transform),
            RuleKind::MaxPool => (max_pool::can_be_transformed, max_pool::transform),
        };
        Self {
            kind,
            op_type: kind.op_type(),
            can_be_transformed,
            transform,
        }
    }
}

// ===========================================================================
// Reporting
// ===========================================================================

/// Non-fatal finding collected during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The consumers of a quantization group allow no common precision; the
    /// group's FakeQuantize nodes stay in real precision.
    PrecisionConflict {
        fake_quantizes: Vec<NodeId>,
        ports: Vec<InputPort>,
        reason: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::PrecisionConflict {
                fake_quantizes,
                ports,
                reason,
            } => {
                let ports: Vec<String> = ports.iter().map(|p| format!("{}:{}", p.node, p.port)).collect();
                write!(
                    f,
                    "precision conflict for FakeQuantize {fake_quantizes:?}: {reason} (restricted ports [{}])",
                    ports.join(", ")
                )
            }
        }
    }
}

/// Outcome of one or more passes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformReport {
    pub passes: usize,
    pub rewrites: usize,
    pub rewrites_by_rule: BTreeMap<RuleKind, usize>,
    pub diagnostics: Vec<Diagnostic>,
    /// The last pass rewrote nothing.
    pub converged: bool,
}

impl TransformReport {
    fn absorb(&mut self, pass: TransformReport) {
        self.passes += pass.passes;
        self.rewrites += pass.rewrites;
        for (kind, n) in pass.rewrites_by_rule {
            *self.rewrites_by_rule.entry(kind).or_default() += n;
        }
        for d in pass.diagnostics {
            if !self.diagnostics.contains(&d) {
                self.diagnostics.push(d);
            }
        }
        self.converged = pass.converged;
    }

    pub fn summary(&self) -> String {
        let mut s = format!(
            "  Passes:    {}{}\n  Rewrites:  {}\n",
            self.passes,
            if self.converged { "" } else { " (not converged)" },
            self.rewrites
        );
        for (kind, n) in &self.rewrites_by_rule {
            s.push_str(&format!("    {kind:<14} {n}\n"));
        }
        for d in &self.diagnostics {
            s.push_str(&format!("  Warning:   {d}\n"));
        }
        s
    }
}

// ===========================================================================
// Engine
// ===========================================================================

#[derive(Debug, Clone)]
pub struct LowPrecisionTransformer {
    registry: BTreeMap<OpType, LayerTransformation>,
    params: TransformationParams,
    precision_restrictions: PrecisionRestrictions,
    granularity_restrictions: GranularityRestrictions,
}

impl LowPrecisionTransformer {
    pub fn new(
        precision_restrictions: PrecisionRestrictions,
        granularity_restrictions: GranularityRestrictions,
        rules: &RuleSet,
    ) -> Self {
        let registry = rules
            .iter()
            .map(|&kind| (kind.op_type(), LayerTransformation::of(kind)))
            .collect();
        Self {
            registry,
            params: TransformationParams::default(),
            precision_restrictions,
            granularity_restrictions,
        }
    }

    pub fn with_params(mut self, params: TransformationParams) -> Self {
        self.params = params;
        self
    }

    pub fn from_config(config: &LptConfig) -> Self {
        Self::new(
            config.precision_restrictions(),
            config.granularity_restrictions(),
            &config.rule_set(),
        )
        .with_params(config.transformation_params())
    }

    pub fn rules(&self) -> impl Iterator<Item = RuleKind> + '_ {
        self.registry.values().map(|t| t.kind)
    }

    /// Every interval a pass would decompose must be well formed.
    fn validate_intervals(graph: &Graph) -> Result<()> {
        for node in graph.nodes() {
            if let Op::FakeQuantize(attrs) = &node.op {
                if attrs.decomposed {
                    continue;
                }
                attrs
                    .interval
                    .validate(node.shape.extent(CHANNEL_AXIS))
                    .map_err(|reason| LptError::configuration(node.id, reason))?;
            }
        }
        Ok(())
    }

    /// One deterministic traversal.
    ///
    /// # Errors
    ///
    /// [`LptError::Configuration`] for malformed interval data (the graph is
    /// left unmodified), [`LptError::InvalidGraph`] for a cyclic graph.
    pub fn run_pass(&self, graph: &mut Graph) -> Result<TransformReport> {
        Self::validate_intervals(graph)?;
        let order = graph.topological_order()?;
        let markup = Markup::analyze(graph, &self.precision_restrictions, &self.granularity_restrictions);
        for d in markup.diagnostics() {
            warn!(%d, "quantization group left in real precision");
        }
        let ctx = TransformationContext {
            params: &self.params,
            precision_restrictions: &self.precision_restrictions,
            granularity_restrictions: &self.granularity_restrictions,
            markup: &markup,
        };

        let mut report = TransformReport {
            passes: 1,
            diagnostics: markup.diagnostics().to_vec(),
            ..TransformReport::default()
        };
        for id in order {
            let Some(op_type) = graph.op_type(id) else {
                continue;
            };
            let Some(rule) = self.registry.get(&op_type) else {
                continue;
            };
            if !(rule.can_be_transformed)(graph, id, &ctx) {
                trace!(node = id, rule = %rule.kind, "precondition not met");
                continue;
            }
            if (rule.transform)(graph, id, &ctx)? {
                debug!(node = id, rule = %rule.kind, "rewrote node");
                report.rewrites += 1;
                *report.rewrites_by_rule.entry(rule.kind).or_default() += 1;
            }
        }
        report.converged = report.rewrites == 0;
        info!(graph = %graph.name, rewrites = report.rewrites, "transformation pass finished");
        Ok(report)
    }

    /// A single pass, the normal entry point.
    pub fn transform(&self, graph: &mut Graph) -> Result<TransformReport> {
        self.run_pass(graph)
    }

    /// Repeat passes until one rewrites nothing, at most `max_passes` times.
    pub fn run_to_fixed_point(&self, graph: &mut Graph, max_passes: usize) -> Result<TransformReport> {
        let mut total = TransformReport::default();
        while total.passes < max_passes {
            let pass = self.run_pass(graph)?;
            let done = pass.converged;
            total.absorb(pass);
            if done {
                return Ok(total);
            }
        }
        warn!(graph = %graph.name, max_passes, "no fixed point within the pass limit");
        Ok(total)
    }
}

/// Run one pass over `graph` with the given catalogs and enabled rules.
pub fn transform(
    graph: &mut Graph,
    precision_restrictions: &PrecisionRestrictions,
    granularity_restrictions: &GranularityRestrictions,
    rules: &RuleSet,
) -> Result<TransformReport> {
    LowPrecisionTransformer::new(precision_restrictions.clone(), granularity_restrictions.clone(), rules)
        .run_pass(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{PartialShape, Precision};
    use crate::quantization::QuantizationInterval;

    fn single_fq(interval: QuantizationInterval) -> Graph {
        let mut g = Graph::new("single");
        let p = g.add_parameter("x", Precision::F32, PartialShape::from_static(&[1, 3, 2, 2])).unwrap();
        let fq = g.add_fake_quantize(p, interval).unwrap();
        g.add_result(fq).unwrap();
        g
    }

    #[test]
    fn test_rule_names_round_trip() {
        for kind in RuleKind::ALL {
            assert_eq!(kind.to_string().parse::<RuleKind>().unwrap(), kind);
        }
        assert!("fuse".parse::<RuleKind>().is_err());
    }

    #[test]
    fn test_disabled_rule_is_not_registered() {
        let rules: RuleSet = [RuleKind::Concat].into_iter().collect();
        let mut g = single_fq(QuantizationInterval::symmetric_io(256, 0.0, 2.55));
        let report = transform(&mut g, &PrecisionRestrictions::new(), &GranularityRestrictions::new(), &rules).unwrap();
        assert_eq!(report.rewrites, 0);
        assert!(report.converged);
    }

    #[test]
    fn test_bad_interval_is_fatal_and_leaves_graph() {
        let mut g = single_fq(QuantizationInterval::per_channel(
            256,
            vec![0.0; 2],
            vec![1.0; 2],
            vec![0.0; 2],
            vec![1.0; 2],
        ));
        let before = g.clone();
        let err = transform(&mut g, &PrecisionRestrictions::new(), &GranularityRestrictions::new(), &all_rules())
            .unwrap_err();
        assert!(matches!(err, LptError::Configuration { node: Some(1), .. }));
        assert_eq!(g, before);
    }

    #[test]
    fn test_fixed_point_stops_after_quiet_pass() {
        let mut g = single_fq(QuantizationInterval::symmetric_io(256, 0.0, 2.55));
        let engine = LowPrecisionTransformer::new(PrecisionRestrictions::new(), GranularityRestrictions::new(), &all_rules());
        let report = engine.run_to_fixed_point(&mut g, 4).unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.rewrites, 1);
        assert!(report.converged);
        assert!(report.summary().contains("fake_quantize"));
    }

    #[test]
    fn test_fixed_point_reports_exhausted_bound() {
        let mut g = single_fq(QuantizationInterval::symmetric_io(256, 0.0, 2.55));
        let engine = LowPrecisionTransformer::new(PrecisionRestrictions::new(), GranularityRestrictions::new(), &all_rules());
        let report = engine.run_to_fixed_point(&mut g, 1).unwrap();
        assert_eq!(report.passes, 1);
        assert!(!report.converged);
    }
}
