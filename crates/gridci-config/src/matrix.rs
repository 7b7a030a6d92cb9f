//! Build matrix expansion.
//!
//! The matrix declaration maps combinatoric keys to a scalar or a list of
//! scalars. Expansion walks the fixed key order, takes the cartesian
//! product over the keys that have values, and emits one environment map
//! per combination. A key that is absent or mapped to an empty list
//! simply contributes no dimension; it is not an error and does not
//! multiply the result by zero.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The keys that participate in the combinatorics, in traversal order.
pub const COMBINATORIC_KEYS: &[&str] = &["runtime", "toolchain", "env"];

/// The free-form key: a space-separated `KEY=VALUE ...` string that is
/// split into individual environment entries instead of becoming one
/// matrix dimension variable.
pub const ENV_KEY: &str = "env";

/// Prefix applied to matrix-dimension keys in the resulting environment,
/// so they can never collide with ad-hoc `env` variables.
pub const MATRIX_KEY_PREFIX: &str = "GRIDCI_";

/// Parsed matrix declaration: combinatoric key to value list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub values: HashMap<String, Vec<String>>,
}

impl MatrixConfig {
    /// Values for a key, with absent and empty both normalized to `None`.
    fn dimension(&self, key: &str) -> Option<&[String]> {
        self.values
            .get(key)
            .filter(|values| !values.is_empty())
            .map(|values| values.as_slice())
    }
}

/// Expand the matrix into an ordered list of environment maps.
///
/// The result is sorted by the canonical `key=value` serialization of
/// each environment, so expansion is deterministic and the ordering is
/// human-debuggable. Duplicate environments are preserved: a matrix that
/// declares the same combination twice gets two jobs.
pub fn expand(matrix: &MatrixConfig) -> Vec<BTreeMap<String, String>> {
    let mut environments = Vec::new();
    let mut bound = Vec::new();
    traverse(matrix, COMBINATORIC_KEYS, &mut bound, &mut environments);
    environments.sort_by(|a, b| canonical(a).cmp(&canonical(b)));
    environments
}

fn traverse(
    matrix: &MatrixConfig,
    remaining: &[&str],
    bound: &mut Vec<(String, String)>,
    out: &mut Vec<BTreeMap<String, String>>,
) {
    let Some((key, rest)) = remaining.split_first() else {
        out.push(materialize(bound));
        return;
    };
    match matrix.dimension(key) {
        None => traverse(matrix, rest, bound, out),
        Some(values) => {
            for value in values {
                bound.push((key.to_string(), value.clone()));
                traverse(matrix, rest, bound, out);
                bound.pop();
            }
        }
    }
}

fn materialize(bound: &[(String, String)]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for (key, value) in bound {
        if key == ENV_KEY {
            for word in value.split_whitespace() {
                let (k, v) = word.split_once('=').unwrap_or((word, ""));
                env.insert(k.to_string(), v.to_string());
            }
        } else {
            env.insert(
                format!("{}{}", MATRIX_KEY_PREFIX, key.to_uppercase()),
                value.clone(),
            );
        }
    }
    env
}

fn canonical(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(pairs: &[(&str, &[&str])]) -> MatrixConfig {
        MatrixConfig {
            values: pairs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
        }
    }

    #[test]
    fn two_runtimes_with_shared_env_vars() {
        let m = matrix(&[("runtime", &["1", "2"]), ("env", &["A=1 B=2"])]);
        let envs = expand(&m);

        assert_eq!(envs.len(), 2);
        for env in &envs {
            assert!(env.contains_key("GRIDCI_RUNTIME"));
            assert_eq!(env.get("A").map(String::as_str), Some("1"));
            assert_eq!(env.get("B").map(String::as_str), Some("2"));
        }
        let runtimes: Vec<_> = envs.iter().map(|e| e["GRIDCI_RUNTIME"].clone()).collect();
        assert_eq!(runtimes, vec!["1", "2"]);
    }

    #[test]
    fn expansion_is_deterministic() {
        let m = matrix(&[
            ("runtime", &["2", "1"]),
            ("toolchain", &["b", "a"]),
            ("env", &["X=1"]),
        ]);
        let first = expand(&m);
        let second = expand(&m);
        assert_eq!(first, second);
        // Sorted by canonical serialization, not declaration order.
        assert_eq!(first[0]["GRIDCI_RUNTIME"], "1");
        assert_eq!(first[0]["GRIDCI_TOOLCHAIN"], "a");
    }

    #[test]
    fn absent_key_contributes_no_dimension() {
        let m = matrix(&[("runtime", &["1", "2"])]);
        assert_eq!(expand(&m).len(), 2);
    }

    #[test]
    fn empty_list_is_not_an_empty_product() {
        let m = matrix(&[("runtime", &["1", "2"]), ("toolchain", &[])]);
        let envs = expand(&m);
        assert_eq!(envs.len(), 2);
        assert!(envs.iter().all(|e| !e.contains_key("GRIDCI_TOOLCHAIN")));
    }

    #[test]
    fn duplicate_combinations_are_preserved() {
        let m = matrix(&[("runtime", &["1", "1"])]);
        let envs = expand(&m);
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[0], envs[1]);
    }

    #[test]
    fn env_words_without_value_become_empty() {
        let m = matrix(&[("env", &["FLAG"])]);
        let envs = expand(&m);
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].get("FLAG").map(String::as_str), Some(""));
    }

    #[test]
    fn empty_matrix_yields_one_empty_environment() {
        let envs = expand(&MatrixConfig::default());
        assert_eq!(envs.len(), 1);
        assert!(envs[0].is_empty());
    }
}
