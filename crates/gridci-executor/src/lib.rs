//! Sandbox executors for GridCI.
//!
//! Runs one job per isolated container, streams its log to the job's
//! artifact, and enforces the hard and idle time budgets.

pub mod docker;
pub mod lines;

pub use docker::{DockerSandbox, DEFAULT_IMAGE};
pub use lines::LineBuffer;
