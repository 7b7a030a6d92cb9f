//! Core domain types and traits for the GridCI engine.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Build (job-set) and job records with their state machines
//! - Project records
//! - The sandbox trait and its spec/outcome types

pub mod build;
pub mod error;
pub mod id;
pub mod job;
pub mod project;
pub mod sandbox;

pub use build::{Build, BuildState, ScriptConfig, FORMAT_VERSION};
pub use error::{Error, Result};
pub use id::ResourceId;
pub use job::{Job, JobState};
pub use project::Project;
pub use sandbox::{
    BindMount, Sandbox, SandboxOutcome, SandboxSpec, TimeoutKind, TIMEOUT_EXIT_CODE,
};
