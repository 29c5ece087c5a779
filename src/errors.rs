//! Typed error handling for the lpt-rs library.
//!
//! All public API functions return [`Result<T>`](type@Result), which uses
//! [`LptError`] as the error type. The CLI binary converts these into
//! `anyhow::Error` automatically via the blanket `From<E: std::error::Error>`
//! impl.
//!
//! A rule that does not apply is *not* an error: it leaves the node untouched
//! and the engine moves on. Precision conflicts are not errors either; they
//! are collected as [`Diagnostic`](crate::transformations::Diagnostic)s in the
//! transform report.

use std::fmt;
use std::path::PathBuf;

/// Result type alias used throughout the lpt-rs public API.
pub type Result<T> = std::result::Result<T, LptError>;

/// Errors produced by the lpt-rs library.
///
/// Each variant covers a distinct failure category. The `reason` field
/// carries a human-readable explanation suitable for display.
#[derive(Debug, Clone, PartialEq)]
pub enum LptError {
    /// Malformed quantization data: `levels < 2`, `high <= low`, or a
    /// per-channel vector whose length does not match the channel axis.
    /// Fatal to the transformation call that found it.
    Configuration {
        /// Node the bad data is attached to, when known.
        node: Option<usize>,
        /// What went wrong.
        reason: String,
    },

    /// Structural problem while building or rewriting a graph (dangling
    /// edge, wrong input arity, incompatible shapes).
    InvalidGraph {
        /// What went wrong.
        reason: String,
    },

    /// Failure inside the reference interpreter.
    Evaluation {
        /// Node being evaluated.
        node: usize,
        /// What went wrong.
        reason: String,
    },

    /// Restriction / engine configuration file parsing or validation error.
    Config {
        /// What went wrong.
        reason: String,
    },

    /// Failed to read a configuration file from disk.
    ConfigLoad {
        /// Path that was being loaded.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },
}

impl LptError {
    pub(crate) fn configuration(node: usize, reason: impl Into<String>) -> Self {
        LptError::Configuration {
            node: Some(node),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_graph(reason: impl Into<String>) -> Self {
        LptError::InvalidGraph {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for LptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LptError::Configuration { node: Some(node), reason } => {
                write!(f, "configuration error at node {node}: {reason}")
            }
            LptError::Configuration { node: None, reason } => {
                write!(f, "configuration error: {reason}")
            }
            LptError::InvalidGraph { reason } => {
                write!(f, "invalid graph: {reason}")
            }
            LptError::Evaluation { node, reason } => {
                write!(f, "evaluation failed at node {node}: {reason}")
            }
            LptError::Config { reason } => {
                write!(f, "config error: {reason}")
            }
            LptError::ConfigLoad { path, reason } => {
                write!(f, "failed to load config '{}': {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for LptError {}
