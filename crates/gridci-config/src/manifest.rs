//! Build manifest parsing.
//!
//! A `ci.kdl` manifest declares the test matrix and the script stages:
//!
//! ```kdl
//! matrix {
//!     runtime "1.85" "1.86"
//!     env "RELEASE=0" "RELEASE=1"
//! }
//!
//! install "cargo fetch"
//! script "cargo test --all"
//! ```
//!
//! Matrix keys must be one of the combinatoric keys; script stage nodes
//! take one or more command strings and may be repeated. Parsing fails
//! fast: an invalid manifest is rejected before any job is created.

use crate::matrix::{MatrixConfig, COMBINATORIC_KEYS};
use crate::{ConfigError, ConfigResult};
use gridci_core::ScriptConfig;
use kdl::{KdlDocument, KdlNode, KdlValue};

/// A parsed build manifest.
#[derive(Debug, Clone, Default)]
pub struct BuildManifest {
    pub matrix: MatrixConfig,
    pub scripts: ScriptConfig,
}

/// Parse a build manifest from KDL text.
pub fn parse_manifest(kdl: &str) -> ConfigResult<BuildManifest> {
    let doc: KdlDocument = kdl.parse()?;

    let mut manifest = BuildManifest::default();

    for node in doc.nodes() {
        match node.name().value() {
            "matrix" => parse_matrix(node, &mut manifest.matrix)?,
            "before_install" => stage_commands(node, &mut manifest.scripts.before_install),
            "install" => stage_commands(node, &mut manifest.scripts.install),
            "before_script" => stage_commands(node, &mut manifest.scripts.before_script),
            "script" => stage_commands(node, &mut manifest.scripts.script),
            "after_success" => stage_commands(node, &mut manifest.scripts.after_success),
            "after_failure" => stage_commands(node, &mut manifest.scripts.after_failure),
            "after_script" => stage_commands(node, &mut manifest.scripts.after_script),
            _ => {} // Ignore unknown nodes
        }
    }

    if manifest.scripts.script.is_empty() {
        return Err(ConfigError::MissingField("script".to_string()));
    }

    Ok(manifest)
}

fn parse_matrix(node: &KdlNode, matrix: &mut MatrixConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        let key = child.name().value();
        if !COMBINATORIC_KEYS.contains(&key) {
            return Err(ConfigError::InvalidValue {
                field: "matrix".to_string(),
                message: format!(
                    "unknown matrix key '{}', expected one of {:?}",
                    key, COMBINATORIC_KEYS
                ),
            });
        }
        let values = scalar_args(child);
        matrix
            .values
            .entry(key.to_string())
            .or_default()
            .extend(values);
    }
    Ok(())
}

fn stage_commands(node: &KdlNode, stage: &mut Vec<String>) {
    stage.extend(scalar_args(node));
}

/// All positional arguments of a node, with numbers coerced to strings so
/// `runtime 1.85` and `runtime "1.85"` mean the same thing.
fn scalar_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| value_to_string(e.value()))
        .collect()
}

fn value_to_string(value: &KdlValue) -> Option<String> {
    if let Some(s) = value.as_string() {
        Some(s.to_string())
    } else if let Some(i) = value.as_integer() {
        Some(i.to_string())
    } else if let Some(f) = value.as_float() {
        Some(f.to_string())
    } else {
        None
    }
}
