//! Verdict classification and provenance.
//!
//! `classify` is a pure function over a finished launch: kernel and watchdog
//! evidence decide first, the payload's own exit status next, and the result
//! channel only once the payload exited cleanly.
use crate::config::types::*;
use crate::core::types::SandboxLaunchOutcome;
use crate::outcome::{ExecutionResult, FailureKind, Resource};
use crate::runner::protocol::{extract_report, interpret_report, Extraction};

/// Longest diagnostic excerpt handed back to the submitter.
const DETAIL_LIMIT: usize = 200;

/// Classified run: the caller-facing result plus who decided it and why.
#[derive(Clone, Debug)]
pub struct Verdict {
    pub result: ExecutionResult,
    pub provenance: VerdictProvenance,
    /// Runner-reported self-score, advisory only
    pub self_score: Option<(usize, usize)>,
}

pub struct VerdictClassifier;

impl VerdictClassifier {
    pub fn classify(
        outcome: &SandboxLaunchOutcome,
        limits: &LimitSnapshot,
        memory_marker: Option<&str>,
    ) -> Verdict {
        let status = &outcome.status;
        let evidence = &outcome.evidence;
        let cgroup = evidence.cgroup_evidence.as_ref();

        if let Some(sig) = evidence.interrupted_by {
            log::warn!("Run interrupted by host signal {}", sig);
            return Self::infrastructure(
                outcome,
                limits,
                VerdictCause::IeSupervisorFailure,
                "interrupted_by_signal",
            );
        }

        // Judge kills come first: a killed payload may also show OOM or signal noise.
        if Self::has_judge_kill(&evidence.judge_actions) && status.timed_out {
            return Self::verdict(
                ExecutionResult::failure(FailureKind::Timeout, "wall-clock deadline exceeded"),
                Self::provenance(
                    outcome,
                    limits,
                    VerdictActor::Judge,
                    VerdictCause::TleWallJudge,
                    &["judge_actions", "watchdog"],
                ),
            );
        }

        if cgroup.map(CgroupEvidence::memory_ceiling_hit).unwrap_or(false) {
            return Self::verdict(
                ExecutionResult::failure(
                    FailureKind::ResourceExceeded {
                        resource: Resource::Memory,
                    },
                    "memory limit exceeded",
                ),
                Self::provenance(
                    outcome,
                    limits,
                    VerdictActor::Kernel,
                    VerdictCause::MleKernelOom,
                    &["cgroup_evidence", "memory.events"],
                ),
            );
        }

        if cgroup.map(CgroupEvidence::process_ceiling_hit).unwrap_or(false) {
            return Self::verdict(
                ExecutionResult::failure(
                    FailureKind::ResourceExceeded {
                        resource: Resource::Processes,
                    },
                    "process limit exceeded",
                ),
                Self::provenance(
                    outcome,
                    limits,
                    VerdictActor::Kernel,
                    VerdictCause::PlePidsMax,
                    &["cgroup_evidence", "pids.events"],
                ),
            );
        }

        if let Some(err) = &status.setup_error {
            log::error!("Sandbox setup failed for pid {:?}: {}", status.payload_pid, err);
            return Self::infrastructure(outcome, limits, VerdictCause::IeSetupFailure, "setup_error");
        }
        if let Some(err) = &status.internal_error {
            log::error!("Sandbox supervisor failed: {}", err);
            return Self::infrastructure(
                outcome,
                limits,
                VerdictCause::IeSupervisorFailure,
                "internal_error",
            );
        }

        if status.term_signal == Some(libc::SIGXCPU) {
            return Self::verdict(
                ExecutionResult::failure(FailureKind::Timeout, "CPU time limit exceeded"),
                Self::provenance(
                    outcome,
                    limits,
                    VerdictActor::Kernel,
                    VerdictCause::TleCpuKernel,
                    &["wait_outcome", "signal"],
                ),
            );
        }

        let abnormal = status.term_signal.is_some() || status.exit_code != Some(0);
        if abnormal {
            return Self::classify_abnormal_exit(outcome, limits, memory_marker);
        }

        Self::classify_clean_exit(outcome, limits)
    }

    fn classify_abnormal_exit(
        outcome: &SandboxLaunchOutcome,
        limits: &LimitSnapshot,
        memory_marker: Option<&str>,
    ) -> Verdict {
        let status = &outcome.status;
        if let Some(marker) = memory_marker {
            if traceback_ends_with(&status.stderr, marker) {
                return Self::verdict(
                    ExecutionResult::failure(
                        FailureKind::ResourceExceeded {
                            resource: Resource::Memory,
                        },
                        "memory limit exceeded",
                    ),
                    Self::provenance(
                        outcome,
                        limits,
                        VerdictActor::Runtime,
                        VerdictCause::MleRunnerMemoryError,
                        &["wait_outcome", "stderr"],
                    ),
                );
            }
        }

        let cause = if status.term_signal.is_some() {
            VerdictCause::ReFatalSignal
        } else {
            VerdictCause::ReNonzeroExit
        };
        let detail = sanitize_detail(&status.stderr)
            .unwrap_or_else(|| "submission process exited abnormally".to_string());
        Self::verdict(
            ExecutionResult::failure(
                FailureKind::RuntimeFailure {
                    exit_code: status.exit_code,
                    signal: status.term_signal,
                },
                detail,
            ),
            Self::provenance(
                outcome,
                limits,
                VerdictActor::Runtime,
                cause,
                &["wait_outcome", "stderr"],
            ),
        )
    }

    fn classify_clean_exit(outcome: &SandboxLaunchOutcome, limits: &LimitSnapshot) -> Verdict {
        let status = &outcome.status;
        let provenance = |sources: &[&str]| {
            Self::provenance(
                outcome,
                limits,
                VerdictActor::Runtime,
                VerdictCause::NormalExit,
                sources,
            )
        };

        match extract_report(&status.result_bytes(), &status.stdout) {
            Extraction::Framed(report) => Verdict {
                result: with_measured_time(interpret_report(&report), status.wall_time_ms),
                provenance: provenance(&["wait_outcome", "result_channel"]),
                self_score: report.self_score(),
            },
            Extraction::Legacy(report) => {
                log::debug!("No result frame; recovered report from stdout");
                Verdict {
                    result: with_measured_time(interpret_report(&report), status.wall_time_ms),
                    provenance: provenance(&["wait_outcome", "stdout"]),
                    self_score: report.self_score(),
                }
            }
            Extraction::Truncated { trailing } => {
                log::warn!("Result channel ended {} bytes into a frame", trailing);
                Self::verdict(
                    ExecutionResult::failure(FailureKind::MalformedResult, "result truncated"),
                    provenance(&["wait_outcome", "result_channel"]),
                )
            }
            Extraction::Undecodable(err) => {
                log::warn!("Result frame did not decode: {}", err);
                Self::verdict(
                    ExecutionResult::failure(
                        FailureKind::MalformedResult,
                        "result could not be decoded",
                    ),
                    provenance(&["wait_outcome", "result_channel"]),
                )
            }
            Extraction::Missing => Self::verdict(
                ExecutionResult::failure(FailureKind::MalformedResult, "no result produced"),
                provenance(&["wait_outcome", "result_channel", "stdout"]),
            ),
        }
    }

    fn infrastructure(
        outcome: &SandboxLaunchOutcome,
        limits: &LimitSnapshot,
        cause: VerdictCause,
        source: &str,
    ) -> Verdict {
        Self::verdict(
            ExecutionResult::failure(
                FailureKind::InfrastructureFailure,
                "sandbox could not run the submission",
            ),
            Self::provenance(outcome, limits, VerdictActor::Infrastructure, cause, &[source]),
        )
    }

    fn verdict(result: ExecutionResult, provenance: VerdictProvenance) -> Verdict {
        Verdict {
            result,
            provenance,
            self_score: None,
        }
    }

    fn provenance(
        outcome: &SandboxLaunchOutcome,
        limits: &LimitSnapshot,
        actor: VerdictActor,
        cause: VerdictCause,
        sources: &[&str],
    ) -> VerdictProvenance {
        VerdictProvenance {
            verdict_actor: actor,
            verdict_cause: cause,
            verdict_evidence_sources: sources.iter().map(|s| s.to_string()).collect(),
            termination_signal: outcome.status.term_signal,
            wall_time_used: outcome.status.wall_time_ms as f64 / 1000.0,
            memory_peak: outcome
                .evidence
                .cgroup_evidence
                .as_ref()
                .and_then(|e| e.memory_peak)
                .unwrap_or(0),
            limit_snapshot: limits.clone(),
            evidence_collection_errors: outcome.evidence.evidence_collection_errors.clone(),
        }
    }

    fn has_judge_kill(actions: &[JudgeAction]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a.action_type, JudgeActionType::ForcedKill))
    }
}

/// True when stderr ends in a traceback whose final exception line is `marker`.
///
/// Mentions of the marker anywhere else (prints, messages, earlier frames)
/// do not count.
fn traceback_ends_with(stderr: &str, marker: &str) -> bool {
    let mut lines = stderr.lines().map(str::trim_end).filter(|l| !l.is_empty());
    let Some(last) = lines.next_back() else {
        return false;
    };
    let names_marker = last == marker
        || last
            .strip_prefix(marker)
            .is_some_and(|rest| rest.starts_with(':'));
    names_marker && lines.any(|l| l.starts_with("Traceback (most recent call last):"))
}

/// Replace the runner's timing with the sandbox's wall measurement.
///
/// The runner's figure is taken inside the submission's own interpreter, so
/// only the supervisor's clock feeds scoring and ranking.
fn with_measured_time(result: ExecutionResult, wall_time_ms: u64) -> ExecutionResult {
    match result {
        ExecutionResult::Success(mut outputs) => {
            let measured = wall_time_ms as f64 / 1000.0;
            if outputs.execution_time > measured {
                log::debug!(
                    "Runner reported {:.3}s, longer than the {:.3}s the sandbox ran",
                    outputs.execution_time,
                    measured
                );
            }
            outputs.execution_time = measured;
            ExecutionResult::Success(outputs)
        }
        failure => failure,
    }
}

/// Last meaningful stderr line, stripped of control characters and cut short.
///
/// Lines that mention host locations are skipped so paths never reach the submitter.
pub fn sanitize_detail(stderr: &str) -> Option<String> {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.contains("File \"/"))?;

    let mut cleaned: String = line
        .chars()
        .filter(|c| !c.is_control())
        .take(DETAIL_LIMIT)
        .collect();
    if line.chars().count() > DETAIL_LIMIT {
        cleaned.push_str("...");
    }
    Some(cleaned)
}
