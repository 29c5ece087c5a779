pub mod config;
pub mod errors;
pub mod graph;
pub mod quantization;
pub mod scenarios;
pub mod transformations;

pub use config::LptConfig;
pub use errors::{LptError, Result};
pub use graph::compare::{compare_graphs, ComparisonReport};
pub use graph::interpreter::evaluate;
pub use graph::{Graph, NodeId, OpType, PartialShape, Precision};
pub use quantization::{QuantizationInterval, QuantizationParams};
pub use transformations::{transform, Diagnostic, LowPrecisionTransformer, RuleKind, TransformReport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
