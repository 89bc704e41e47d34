//! gradebox: sandboxed grading of untrusted byte-transform submissions
//!
//! A submission is a Python `transform(bytes) -> bytes`. It runs once per
//! request inside a throwaway sandbox against a fixed corpus, and its outputs
//! are compared byte for byte with the puzzle's oracle.
//!
//! # Architecture
//!
//! ## Data ([`corpus`], [`scoring`], [`outcome`])
//! - [`corpus`]: shared input buffers, oracle files, puzzle catalog
//! - [`scoring`]: exact-match scoring and leaderboard order
//! - [`outcome`]: `ExecutionResult` and the failure taxonomy
//!
//! ## Runner ([`runner`])
//! - [`runner::languages`]: harness rendering per language
//! - [`runner::protocol`]: framed result channel on fd 3
//!
//! ## Sandbox ([`kernel`], [`core`], [`exec`])
//! - [`kernel`]: namespaces, cgroup v2, mounts, credentials, signals
//! - [`core::supervisor`]: supervisor -> proxy -> payload lifecycle and watchdog
//! - [`exec::preexec`]: type-state ordered pre-exec chain
//! - [`exec::executor`]: per-run cgroup ownership
//!
//! ## Grading ([`controller`], [`verdict`])
//! - [`controller`]: provisioning, launch, classification, cleanup
//! - [`verdict`]: evidence-backed mapping from launch outcome to result
//!
//! ## Support
//! - [`config`]: `GradeConfig`, loading, validation
//! - [`observability`]: audit trail
//! - [`safety`]: run directories and symlink-safe removal
//! - [`utils`]: fd closure and environment hygiene

// Data
pub mod corpus;
pub mod outcome;
pub mod scoring;

// Runner
pub mod runner;

// Kernel Primitives
pub mod kernel;

// Sandbox core
pub mod core;

// Execution Control
pub mod exec;

// Evidence & Verdict
pub mod verdict;

// Grading
pub mod controller;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint for the gradebox binary
pub mod cli;

pub use config::types::{GradeConfig, GradeError, Result};
pub use controller::{Controller, GradeReport};
pub use outcome::{ExecutionResult, FailureKind, RunOutputs};
pub use scoring::ScoreRecord;
