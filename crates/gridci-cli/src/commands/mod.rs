//! CLI command implementations.

pub mod daemon;
pub mod finalize;
pub mod prepare;
pub mod run;
