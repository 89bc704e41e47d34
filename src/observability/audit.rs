//! Audit trail for grading runs.
//!
//! Every run emits structured `AuditEvent`s: start, finish, limit hits,
//! cleanup problems and infrastructure faults. When an audit file is
//! configured they are appended to it as JSON lines; otherwise they go
//! through the `log` facade.
use crate::config::types::{GradeError, Result, VerdictProvenance};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SubmissionStarted,
    SubmissionFinished,
    DegradedLaunch,
    DeadlineKill,
    MemoryCeiling,
    ProcessCeiling,
    MalformedResult,
    SelfScoreMismatch,
    CleanupFailure,
    InfrastructureFault,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::SubmissionStarted | AuditEventType::SubmissionFinished => {
                AuditSeverity::Low
            }
            AuditEventType::MalformedResult | AuditEventType::SelfScoreMismatch => {
                AuditSeverity::Medium
            }
            AuditEventType::DegradedLaunch
            | AuditEventType::DeadlineKill
            | AuditEventType::MemoryCeiling
            | AuditEventType::ProcessCeiling => AuditSeverity::High,
            AuditEventType::CleanupFailure | AuditEventType::InfrastructureFault => {
                AuditSeverity::Critical
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub run_id: Option<String>,
    pub puzzle_id: Option<String>,
    /// sha256 of the submitted source
    pub source_digest: Option<String>,
    pub verdict_provenance: Option<VerdictProvenance>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            run_id: None,
            puzzle_id: None,
            source_digest: None,
            verdict_provenance: None,
        }
    }

    pub fn with_run(mut self, run_id: &str, puzzle_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self.puzzle_id = Some(puzzle_id.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_digest = Some(source_digest(source));
        self
    }

    pub fn with_verdict_provenance(mut self, provenance: VerdictProvenance) -> Self {
        self.verdict_provenance = Some(provenance);
        self
    }
}

/// Hex sha256 of a submission, so the trail identifies code without storing it.
pub fn source_digest(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Append-only JSON lines writer.
pub struct AuditLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_path: &Path) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GradeError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .map_err(|e| GradeError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path: audit_path.to_path_buf(),
        })
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }

    pub fn record(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    error!("Failed to write to audit log: {}", e);
                }
            }
            Err(_) => error!("Failed to acquire lock on audit file"),
        }
    }
}

fn log_event(event: &AuditEvent) {
    let run = event.run_id.as_deref().unwrap_or("-");
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => {
            error!("AUDIT {:?} [{}]: {}", event.event_type, run, event.details)
        }
        AuditSeverity::Medium => warn!("AUDIT {:?} [{}]: {}", event.event_type, run, event.details),
        AuditSeverity::Low => info!("AUDIT {:?} [{}]: {}", event.event_type, run, event.details),
    }
}

static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Install the process-wide audit file. `None` keeps events on the log facade.
pub fn init_audit_logger(audit_path: Option<PathBuf>) -> Result<()> {
    let Some(path) = audit_path else {
        return Ok(());
    };
    let logger = AuditLogger::new(&path)?;
    if AUDIT_LOGGER.set(logger).is_err() {
        warn!("Audit logger already initialized; keeping the first one");
    } else {
        info!("Audit log at {}", path.display());
    }
    Ok(())
}

pub fn log_audit_event(event: AuditEvent) {
    // Severe events also reach the operator log even when a file is configured.
    if event.severity != AuditSeverity::Low {
        log_event(&event);
    }
    match AUDIT_LOGGER.get() {
        Some(logger) => logger.record(&event),
        None if event.severity == AuditSeverity::Low => log_event(&event),
        None => {}
    }
}

/// Convenience constructors for the events a grading run emits.
pub mod events {
    use super::*;

    pub fn submission_started(run_id: &str, puzzle_id: &str, source: &str, isolation: &str) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::SubmissionStarted,
                format!("grading started ({isolation})"),
            )
            .with_run(run_id, puzzle_id)
            .with_source(source),
        );
    }

    pub fn submission_finished(
        run_id: &str,
        puzzle_id: &str,
        outcome_label: &str,
        provenance: Option<VerdictProvenance>,
    ) {
        let mut event = AuditEvent::new(
            AuditEventType::SubmissionFinished,
            format!("grading finished: {outcome_label}"),
        )
        .with_run(run_id, puzzle_id);
        if let Some(provenance) = provenance {
            event = event.with_verdict_provenance(provenance);
        }
        log_audit_event(event);
    }

    pub fn degraded_launch(run_id: &str, puzzle_id: &str) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::DegradedLaunch,
                "running without namespace isolation",
            )
            .with_run(run_id, puzzle_id),
        );
    }

    pub fn limit_hit(run_id: &str, puzzle_id: &str, event_type: AuditEventType, details: String) {
        log_audit_event(AuditEvent::new(event_type, details).with_run(run_id, puzzle_id));
    }

    pub fn self_score_mismatch(
        run_id: &str,
        puzzle_id: &str,
        reported: (usize, usize),
        computed: (usize, usize),
    ) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::SelfScoreMismatch,
                format!(
                    "runner claimed {}/{} correct, controller counted {}/{}",
                    reported.0, reported.1, computed.0, computed.1
                ),
            )
            .with_run(run_id, puzzle_id),
        );
    }

    pub fn cleanup_failure(run_id: &str, what: &str, err: &dyn std::fmt::Display) {
        let mut event =
            AuditEvent::new(AuditEventType::CleanupFailure, format!("{what} cleanup failed: {err}"));
        event.run_id = Some(run_id.to_string());
        log_audit_event(event);
    }

    pub fn infrastructure_fault(run_id: &str, puzzle_id: &str, err: &dyn std::fmt::Display) {
        log_audit_event(
            AuditEvent::new(AuditEventType::InfrastructureFault, err.to_string())
                .with_run(run_id, puzzle_id),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_sha256() {
        assert_eq!(
            source_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(source_digest("a"), source_digest("b"));
    }

    #[test]
    fn logger_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let logger = AuditLogger::new(&path).unwrap();
        assert_eq!(logger.audit_path(), path.as_path());

        logger.record(
            &AuditEvent::new(AuditEventType::SubmissionStarted, "start")
                .with_run("run-1", "examples_level_1_puzzle_1")
                .with_source("def transform(b): return b"),
        );
        logger.record(&AuditEvent::new(AuditEventType::DeadlineKill, "killed"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, AuditEventType::SubmissionStarted);
        assert_eq!(first.puzzle_id.as_deref(), Some("examples_level_1_puzzle_1"));
        assert_eq!(first.source_digest.unwrap().len(), 64);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event_type"], "deadline_kill");
        assert_eq!(second["severity"], "high");
    }

    #[test]
    fn severities_follow_event_type() {
        assert_eq!(
            AuditEvent::new(AuditEventType::CleanupFailure, "x").severity,
            AuditSeverity::Critical
        );
        assert_eq!(
            AuditEvent::new(AuditEventType::SubmissionFinished, "x").severity,
            AuditSeverity::Low
        );
    }

    #[test]
    fn uninitialized_logger_is_a_noop_for_none() {
        init_audit_logger(None).unwrap();
        log_audit_event(AuditEvent::new(AuditEventType::SubmissionStarted, "no file"));
    }
}
