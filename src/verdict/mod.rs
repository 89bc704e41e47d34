//! Evidence-backed verdict classification
//!
//! Derives verdicts as pure functions over finished launches.

pub mod classifier;

pub use classifier::{sanitize_detail, Verdict, VerdictClassifier};
