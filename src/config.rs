//! YAML and TOML configuration file support.
//!
//! A configuration file describes one transformation run: which rules are
//! enabled, whether low-precision producers get integer precision tags, how
//! many passes the fixed-point loop may take, and the two restriction
//! catalogs.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{LptError, Result};
use crate::graph::{OpType, Precision};
use crate::quantization::restrictions::{GranularityRestrictions, PrecisionRestrictions};
use crate::transformations::{RuleKind, RuleSet, TransformationParams};

/// Top-level transformation configuration.
///
/// Can be loaded from a YAML or TOML file with [`LptConfig::from_file`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LptConfig {
    /// Tag low-precision producers with the integer precision and insert a
    /// Convert back to f32. Defaults to `true`.
    #[serde(default = "default_update_precisions")]
    pub update_precisions: bool,

    /// Upper bound on passes for the fixed-point loop. Defaults to 4.
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,

    /// Enabled rules. Defaults to all of them.
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleKind>,

    /// Allowed low precisions per operator input port.
    #[serde(default)]
    pub precision_restrictions: Vec<PrecisionRestrictionConfig>,

    /// Operator kinds that force per-tensor dequantization.
    #[serde(default)]
    pub granularity_restrictions: Vec<OpType>,
}

/// Restrictions for one operator kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionRestrictionConfig {
    pub op: OpType,
    pub ports: Vec<PortRestrictionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRestrictionConfig {
    pub port: usize,
    pub precisions: Vec<Precision>,
}

fn default_update_precisions() -> bool {
    true
}

fn default_max_passes() -> usize {
    4
}

fn default_rules() -> Vec<RuleKind> {
    RuleKind::ALL.to_vec()
}

impl Default for LptConfig {
    fn default() -> Self {
        Self {
            update_precisions: default_update_precisions(),
            max_passes: default_max_passes(),
            rules: default_rules(),
            precision_restrictions: Vec::new(),
            granularity_restrictions: Vec::new(),
        }
    }
}

fn config_err(reason: impl Into<String>) -> LptError {
    LptError::Config { reason: reason.into() }
}

impl LptConfig {
    /// The common catalog: Convolution takes `u8` or `i8` activations and
    /// `i8` weights.
    pub fn u8_i8() -> Self {
        Self {
            precision_restrictions: vec![PrecisionRestrictionConfig {
                op: OpType::Convolution,
                ports: vec![
                    PortRestrictionConfig {
                        port: 0,
                        precisions: vec![Precision::U8, Precision::I8],
                    },
                    PortRestrictionConfig {
                        port: 1,
                        precisions: vec![Precision::I8],
                    },
                ],
            }],
            ..Self::default()
        }
    }

    /// Load a config from a YAML or TOML file (auto-detected by extension).
    ///
    /// # Errors
    ///
    /// Returns [`LptError::ConfigLoad`] when the file cannot be read and
    /// [`LptError::Config`] on parse, unsupported format or
    /// [`validate`](Self::validate) errors.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| config_err("Config file has no extension"))?;

        let content = std::fs::read_to_string(path).map_err(|e| LptError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config = match extension {
            "yaml" | "yml" => Self::from_yaml(&content)?,
            "toml" => Self::from_toml(&content)?,
            _ => return Err(config_err(format!("Unsupported config format: {extension}"))),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| config_err(format!("Failed to parse YAML config: {e}")))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| config_err(format!("Failed to parse TOML config: {e}")))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| config_err(format!("Failed to write YAML config: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LptError::Config`] if any field is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_passes == 0 {
            return Err(config_err("max_passes must be at least 1"));
        }
        if self.rules.is_empty() {
            return Err(config_err("no rules enabled"));
        }

        let mut seen = BTreeSet::new();
        for restriction in &self.precision_restrictions {
            for port in &restriction.ports {
                if !seen.insert((restriction.op, port.port)) {
                    return Err(config_err(format!(
                        "{} port {}: restricted more than once",
                        restriction.op, port.port
                    )));
                }
                if port.precisions.is_empty() {
                    return Err(config_err(format!(
                        "{} port {}: empty precision list",
                        restriction.op, port.port
                    )));
                }
                if let Some(p) = port.precisions.iter().find(|p| p.is_real()) {
                    return Err(config_err(format!(
                        "{} port {}: {p} is not a low precision",
                        restriction.op, port.port
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn precision_restrictions(&self) -> PrecisionRestrictions {
        let mut catalog = PrecisionRestrictions::new();
        for restriction in &self.precision_restrictions {
            for port in &restriction.ports {
                catalog.insert(restriction.op, port.port, port.precisions.clone());
            }
        }
        catalog
    }

    pub fn granularity_restrictions(&self) -> GranularityRestrictions {
        let mut catalog = GranularityRestrictions::new();
        for &op in &self.granularity_restrictions {
            catalog.insert(op);
        }
        catalog
    }

    pub fn rule_set(&self) -> RuleSet {
        self.rules.iter().copied().collect()
    }

    pub fn transformation_params(&self) -> TransformationParams {
        TransformationParams {
            update_precisions: self.update_precisions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
update_precisions: false
max_passes: 2
rules: [fake_quantize, concat]

precision_restrictions:
  - op: Convolution
    ports:
      - port: 0
        precisions: [u8, i8]
      - port: 1
        precisions: [i8]

granularity_restrictions: [Concat]
"#;

        let config = LptConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        assert!(!config.update_precisions);
        assert_eq!(config.rule_set().len(), 2);
        assert_eq!(
            config.precision_restrictions().allowed(OpType::Convolution, 1),
            Some(&[Precision::I8][..])
        );
        assert!(config.granularity_restrictions().requires_per_tensor(OpType::Concat));
    }

    #[test]
    fn test_toml_config() {
        let toml = r#"
max_passes = 3

[[precision_restrictions]]
op = "Convolution"

[[precision_restrictions.ports]]
port = 0
precisions = ["u8"]
"#;

        let config = LptConfig::from_toml(toml).unwrap();
        assert!(config.update_precisions);
        assert_eq!(config.max_passes, 3);
        assert_eq!(config.rules.len(), 4);
        assert_eq!(config.precision_restrictions().len(), 1);
    }

    #[test]
    fn test_defaults_and_preset() {
        assert_eq!(LptConfig::from_yaml("{}").unwrap(), LptConfig::default());
        let preset = LptConfig::u8_i8();
        preset.validate().unwrap();
        assert_eq!(preset.precision_restrictions().len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = LptConfig::u8_i8();
        config.precision_restrictions[0].ports[1].precisions = vec![Precision::F32];
        assert!(config.validate().is_err());

        let config = LptConfig {
            max_passes: 0,
            ..LptConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(LptConfig::from_yaml("rules: [fuse_everything]").is_err());
    }
}
