//! What a sandbox run hands back to the caller.

use crate::config::types::{GradeError, Result};
use crate::corpus::{Buffer, CORPUS_SIZE};
use serde::{Deserialize, Serialize};

/// Outcome of one submission run: outputs for both sets, or a classified failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success(RunOutputs),
    Failure(RunFailure),
}

impl ExecutionResult {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        ExecutionResult::Failure(RunFailure {
            kind,
            detail: detail.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn outputs(&self) -> Option<&RunOutputs> {
        match self {
            ExecutionResult::Success(outputs) => Some(outputs),
            ExecutionResult::Failure(_) => None,
        }
    }

    pub fn failure_kind(&self) -> Option<&FailureKind> {
        match self {
            ExecutionResult::Success(_) => None,
            ExecutionResult::Failure(failure) => Some(&failure.kind),
        }
    }
}

/// Transform outputs in corpus order, plus the sandbox-measured wall time in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunOutputs {
    pub visible: Vec<Buffer>,
    pub hidden: Vec<Buffer>,
    pub execution_time: f64,
}

impl RunOutputs {
    /// A success must carry exactly one output per corpus buffer.
    pub fn new(visible: Vec<Buffer>, hidden: Vec<Buffer>, execution_time: f64) -> Result<Self> {
        if visible.len() != CORPUS_SIZE || hidden.len() != CORPUS_SIZE {
            return Err(GradeError::Protocol(format!(
                "expected {} outputs per set, got {} visible and {} hidden",
                CORPUS_SIZE,
                visible.len(),
                hidden.len()
            )));
        }
        if !execution_time.is_finite() || execution_time < 0.0 {
            return Err(GradeError::Protocol(format!(
                "invalid execution_time {}",
                execution_time
            )));
        }
        Ok(Self {
            visible,
            hidden,
            execution_time,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    /// Short, sanitized description safe to show the submitter.
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Puzzle id does not resolve. Nothing was provisioned.
    NotFound,
    /// The runner rejected the submission: load failure, raise, wrong type or length.
    RunnerFailure {
        stage: Option<Stage>,
        /// 1-based position in the corpus set
        index: Option<usize>,
    },
    /// Wall deadline or CPU rlimit exhausted.
    Timeout,
    ResourceExceeded { resource: Resource },
    /// Nonzero exit or fatal signal without resource evidence.
    RuntimeFailure {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// Clean exit without a usable structured result.
    MalformedResult,
    /// The sandbox could not be provisioned, launched or torn down.
    InfrastructureFailure,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::RunnerFailure { .. } => "runner_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceExceeded { .. } => "resource_exceeded",
            FailureKind::RuntimeFailure { .. } => "runtime_failure",
            FailureKind::MalformedResult => "malformed_result",
            FailureKind::InfrastructureFailure => "infrastructure_failure",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Visible,
    Hidden,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Memory,
    Processes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_outputs_enforce_corpus_size() {
        let ok = RunOutputs::new(
            vec![Buffer::filled(1); CORPUS_SIZE],
            vec![Buffer::filled(2); CORPUS_SIZE],
            0.01,
        );
        assert!(ok.is_ok());

        let short = RunOutputs::new(
            vec![Buffer::filled(1); CORPUS_SIZE - 1],
            vec![Buffer::filled(2); CORPUS_SIZE],
            0.01,
        );
        assert!(short.is_err());

        let negative = RunOutputs::new(
            vec![Buffer::filled(1); CORPUS_SIZE],
            vec![Buffer::filled(2); CORPUS_SIZE],
            -1.0,
        );
        assert!(negative.is_err());
    }

    #[test]
    fn failure_serializes_with_tags() {
        let result = ExecutionResult::failure(
            FailureKind::RunnerFailure {
                stage: Some(Stage::Hidden),
                index: Some(4),
            },
            "transform returned 63 bytes",
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"]["kind"], "runner_failure");
        assert_eq!(json["kind"]["stage"], "hidden");
        assert_eq!(json["kind"]["index"], 4);

        let back: ExecutionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.failure_kind().map(|k| k.label()), Some("runner_failure"));
    }
}
