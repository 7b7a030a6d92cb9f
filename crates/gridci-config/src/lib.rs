//! Build manifest parsing and matrix expansion for GridCI.
//!
//! A repository declares its test matrix and script stages in a `ci.kdl`
//! manifest. This crate parses the manifest and expands the matrix into
//! the ordered list of job environments.

pub mod error;
pub mod manifest;
pub mod matrix;

pub use error::{ConfigError, ConfigResult};
pub use manifest::{parse_manifest, BuildManifest};
pub use matrix::{expand, MatrixConfig, COMBINATORIC_KEYS, ENV_KEY, MATRIX_KEY_PREFIX};
