//! Sandbox controller
//!
//! Resolves a puzzle, provisions a single-use run directory, launches the
//! runner through the sandbox and turns whatever happened into an
//! `ExecutionResult`. Nothing the submission does reaches the caller as an
//! error: every internal failure is mapped to a `FailureKind` here.

pub mod jail;

use crate::config::types::{
    GradeConfig, GradeError, Result, VerdictActor, VerdictCause, VerdictProvenance,
};
use crate::config::validator::validate_config;
use crate::core::types::{ExecutionProfile, IsolationMode};
use crate::corpus::{shared_corpus, CorpusSet, DataLayout, PuzzleId, PuzzleLocation, PuzzleOracle};
use crate::exec::executor::SandboxExecutor;
use crate::kernel::cgroup::backend::check_cgroup_base;
use crate::kernel::mount::jail_mount_points;
use crate::observability::audit::{events, AuditEventType};
use crate::outcome::{ExecutionResult, FailureKind};
use crate::runner::harness::HarnessLayout;
use crate::runner::languages::python::PythonAdapter;
use crate::runner::registry::adapter_for;
use crate::runner::LanguageAdapter;
use crate::safety::workspace::{Workspace, WorkspaceManager};
use crate::scoring::{self, ScoreRecord};
use crate::utils::env_hygiene::{EnvHygiene, EnvPolicy, PermissionPolicy};
use crate::verdict::{Verdict, VerdictClassifier};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How submissions are launched on this host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    Isolated,
    Degraded,
    /// No acceptable launch path; every run is an infrastructure failure.
    Unavailable(String),
}

impl LaunchMode {
    /// `isolation` is `Err(reason)` when this host cannot run isolated launches.
    pub fn decide(
        isolation: std::result::Result<(), String>,
        allow_degraded: bool,
        strict_mode: bool,
    ) -> Self {
        match isolation {
            Ok(()) => LaunchMode::Isolated,
            Err(_) if allow_degraded && !strict_mode => LaunchMode::Degraded,
            Err(reason) => {
                LaunchMode::Unavailable(format!("{}; degraded mode is disabled", reason))
            }
        }
    }

    /// Isolated launches need root and a writable cgroup v2 base.
    pub fn host_support(cgroup_base: &Path) -> std::result::Result<(), String> {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } != 0 {
            return Err("isolated grading requires root".to_string());
        }
        check_cgroup_base(cgroup_base).map_err(|e| e.to_string())
    }

    fn isolation(&self) -> Option<IsolationMode> {
        match self {
            LaunchMode::Isolated => Some(IsolationMode::Isolated),
            LaunchMode::Degraded => Some(IsolationMode::Degraded),
            LaunchMode::Unavailable(_) => None,
        }
    }
}

/// Result of `grade`: the run outcome and, on success, its score.
#[derive(Clone, Debug, Serialize)]
pub struct GradeReport {
    pub puzzle_id: String,
    pub result: ExecutionResult,
    pub score: Option<ScoreRecord>,
}

/// What one sandbox run needs beyond the engine configuration.
struct RunPlan<'a> {
    puzzle: &'a PuzzleLocation,
    adapter: &'a dyn LanguageAdapter,
    source: &'a str,
    expose_oracle: bool,
}

pub struct Controller {
    config: GradeConfig,
    layout: DataLayout,
    workspaces: WorkspaceManager,
    adapter: Box<dyn LanguageAdapter>,
    mode: LaunchMode,
}

impl Controller {
    /// Validate `config`, prepare the runtime root and pick the launch mode.
    pub fn new(config: GradeConfig) -> Result<Self> {
        validate_config(&config)?;

        let workspaces = WorkspaceManager::new(config.runtime_root.clone())?;
        match workspaces
            .cleanup_old_workspaces(Duration::from_secs(config.stale_run_max_age_secs))
        {
            Ok(0) => {}
            Ok(n) => log::info!("Removed {} stale run directories", n),
            Err(e) => log::warn!("Stale run sweep failed: {}", e),
        }

        let support = LaunchMode::host_support(&config.cgroup_base);
        if let Err(reason) = &support {
            log::warn!("Isolated launches unavailable: {}", reason);
        }
        let mode = LaunchMode::decide(support, config.allow_degraded, config.strict_mode);
        match &mode {
            LaunchMode::Isolated => log::debug!("Launch mode: isolated"),
            LaunchMode::Degraded => {
                log::warn!("Launch mode: degraded; submissions run without isolation")
            }
            LaunchMode::Unavailable(reason) => log::error!("No launch mode available: {}", reason),
        }

        Ok(Self {
            layout: DataLayout::new(config.data_root.clone()),
            config,
            workspaces,
            adapter: adapter_for("python")?,
            mode,
        })
    }

    pub fn config(&self) -> &GradeConfig {
        &self.config
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn launch_mode(&self) -> &LaunchMode {
        &self.mode
    }

    /// Run `source` against the corpus for `puzzle_id`.
    pub fn run_submission(&self, puzzle_id: &str, source: &str) -> ExecutionResult {
        match self.resolve(puzzle_id) {
            Ok(location) => self.run_verdict(&location, source).1.result,
            Err(failure) => failure,
        }
    }

    /// Run and score a submission. The runner's self-score, if any, is only compared.
    pub fn grade(&self, puzzle_id: &str, source: &str) -> GradeReport {
        let location = match self.resolve(puzzle_id) {
            Ok(location) => location,
            Err(result) => {
                return GradeReport {
                    puzzle_id: puzzle_id.to_string(),
                    result,
                    score: None,
                }
            }
        };

        let (run_id, verdict) = self.run_verdict(&location, source);
        let score = verdict.result.outputs().and_then(|outputs| {
            match PuzzleOracle::load(&location.dir, location.id.number) {
                Ok(oracle) => Some(scoring::score(outputs, &oracle)),
                Err(e) => {
                    log::error!("Oracle for {} unreadable after run: {}", location.id, e);
                    None
                }
            }
        });

        if let (Some(score), Some(claimed)) = (&score, verdict.self_score) {
            let computed = (score.visible_correct, score.hidden_correct);
            if claimed != computed {
                log::warn!(
                    "Self-score mismatch for {}: runner {:?}, controller {:?}",
                    location.id,
                    claimed,
                    computed
                );
                events::self_score_mismatch(
                    run_id.as_deref().unwrap_or("-"),
                    &location.id.to_string(),
                    claimed,
                    computed,
                );
            }
        }

        let result = match (&verdict.result, &score) {
            (ExecutionResult::Success(_), None) => ExecutionResult::failure(
                FailureKind::InfrastructureFailure,
                "puzzle oracle unavailable",
            ),
            _ => verdict.result,
        };

        GradeReport {
            puzzle_id: location.id.to_string(),
            result,
            score,
        }
    }

    /// Run the puzzle's trusted reference transform and write its oracle files.
    pub fn build_oracle(&self, puzzle_id: &str) -> Result<PuzzleOracle> {
        let id: PuzzleId = puzzle_id.parse()?;
        let location = self.layout.resolve_reference(&id)?;
        shared_corpus(&self.layout.corpus_dir())?;

        let source = std::fs::read_to_string(location.transform_path())?;
        let adapter = PythonAdapter::reference();
        let plan = RunPlan {
            puzzle: &location,
            adapter: &adapter,
            source: &source,
            expose_oracle: false,
        };

        match self.run_plan(&plan).1.result {
            ExecutionResult::Success(outputs) => {
                let oracle = PuzzleOracle::new(outputs.visible, outputs.hidden)?;
                oracle.write(&location.dir, id.number)?;
                log::info!("Wrote oracle for {} to {}", id, location.dir.display());
                Ok(oracle)
            }
            ExecutionResult::Failure(failure) => Err(GradeError::Oracle(format!(
                "reference transform for {} failed: {} ({})",
                id,
                failure.kind.label(),
                failure.detail
            ))),
        }
    }

    /// Preconditions checked before anything is provisioned.
    fn resolve(&self, puzzle_id: &str) -> std::result::Result<PuzzleLocation, ExecutionResult> {
        let not_found = |e: GradeError| {
            log::info!("Puzzle lookup failed for {:?}: {}", puzzle_id, e);
            ExecutionResult::failure(FailureKind::NotFound, "puzzle not found")
        };

        let id: PuzzleId = puzzle_id.parse().map_err(not_found)?;
        let location = self.layout.resolve(&id).map_err(not_found)?;
        shared_corpus(&self.layout.corpus_dir()).map_err(not_found)?;
        Ok(location)
    }

    fn run_verdict(&self, location: &PuzzleLocation, source: &str) -> (Option<String>, Verdict) {
        let plan = RunPlan {
            puzzle: location,
            adapter: self.adapter.as_ref(),
            source,
            expose_oracle: self.config.expose_oracle,
        };
        self.run_plan(&plan)
    }

    /// The verdict for one plan, with the run id when a run directory was created.
    fn run_plan(&self, plan: &RunPlan<'_>) -> (Option<String>, Verdict) {
        let Some(isolation) = self.mode.isolation() else {
            return (None, infrastructure_verdict(&self.config));
        };

        match self.run_once(plan, isolation) {
            Err(GradeError::Privilege(reason))
                if isolation == IsolationMode::Isolated
                    && self.config.allow_degraded
                    && !self.config.strict_mode =>
            {
                log::warn!("Isolated launch refused ({}); retrying degraded", reason);
                match self.run_once(plan, IsolationMode::Degraded) {
                    Ok((run_id, verdict)) => (Some(run_id), verdict),
                    Err(e) => (None, self.provisioning_failed(plan, e)),
                }
            }
            Ok((run_id, verdict)) => (Some(run_id), verdict),
            Err(e) => (None, self.provisioning_failed(plan, e)),
        }
    }

    fn provisioning_failed(&self, plan: &RunPlan<'_>, err: GradeError) -> Verdict {
        log::error!("Provisioning failed for {}: {}", plan.puzzle.id, err);
        events::infrastructure_fault("-", &plan.puzzle.id.to_string(), &err);
        infrastructure_verdict(&self.config)
    }

    /// One provisioned launch. `Err` means the sandbox never produced an outcome.
    fn run_once(&self, plan: &RunPlan<'_>, isolation: IsolationMode) -> Result<(String, Verdict)> {
        let puzzle_id = plan.puzzle.id.to_string();
        let mut workspace = self.workspaces.create_workspace()?;
        let run_id = workspace.run_id().to_string();

        events::submission_started(&run_id, &puzzle_id, plan.source, &isolation.to_string());
        if isolation == IsolationMode::Degraded {
            events::degraded_launch(&run_id, &puzzle_id);
        }

        let launched = self.provision_and_launch(plan, isolation, &mut workspace);

        if let Err(e) = workspace.cleanup() {
            log::warn!("Run directory cleanup failed for {}: {}", run_id, e);
            events::cleanup_failure(&run_id, "run directory", &e);
        }

        let verdict = launched?;
        audit_verdict(&run_id, &puzzle_id, &verdict);
        log::info!(
            "{} [{}] {}: {}",
            puzzle_id,
            isolation,
            run_id,
            verdict
                .result
                .failure_kind()
                .map(FailureKind::label)
                .unwrap_or("success")
        );
        Ok((run_id, verdict))
    }

    fn provision_and_launch(
        &self,
        plan: &RunPlan<'_>,
        isolation: IsolationMode,
        workspace: &mut Workspace,
    ) -> Result<Verdict> {
        let corpus_dir = self.layout.corpus_dir().canonicalize()?;
        let oracle_dir = if plan.expose_oracle {
            let files: Vec<PathBuf> = CorpusSet::ALL
                .iter()
                .map(|set| plan.puzzle.oracle_path(*set))
                .collect();
            Some(workspace.stage_files("oracle", &files)?)
        } else {
            None
        };

        let harness_layout = match isolation {
            IsolationMode::Isolated => HarnessLayout::isolated(oracle_dir.is_some()),
            IsolationMode::Degraded => {
                jail::host_layout(&corpus_dir, oracle_dir.as_deref(), workspace.workspace_dir())
            }
        };

        let files = plan.adapter.workspace_files(&harness_layout, plan.source)?;
        workspace.write_file(files.harness_name, files.harness.as_bytes())?;
        workspace.write_file(files.solution_name, files.solution.as_bytes())?;

        let mut profile = self.base_profile(plan, isolation, &harness_layout, files.harness_name)?;
        if isolation == IsolationMode::Isolated {
            let bindings = jail::grading_bindings(
                &self.config,
                &corpus_dir,
                oracle_dir.as_deref(),
                workspace.workspace_dir(),
            );
            profile.jail_root = Some(workspace.prepare_jail(&jail_mount_points(&bindings))?);
            profile.directory_bindings = bindings;
        }

        let mut executor = SandboxExecutor::new(
            workspace.run_id(),
            &self.config.cgroup_base,
            isolation,
            self.config.strict_mode,
        )?;
        let outcome = executor.execute(profile)?;
        for err in &outcome.evidence.evidence_collection_errors {
            if err.starts_with("executor_cleanup") {
                events::cleanup_failure(workspace.run_id(), "cgroup", err);
            }
        }

        Ok(VerdictClassifier::classify(
            &outcome,
            &self.config.limit_snapshot(),
            plan.adapter.memory_error_marker(),
        ))
    }

    fn base_profile(
        &self,
        plan: &RunPlan<'_>,
        isolation: IsolationMode,
        layout: &HarnessLayout,
        harness_name: &str,
    ) -> Result<ExecutionProfile> {
        let mut extra = plan.adapter.environment();
        extra.push(("PUZZLE_NUM".to_string(), plan.puzzle.id.number.to_string()));

        let hygiene = EnvHygiene::new(
            EnvPolicy {
                home: layout.workspace_dir.to_string_lossy().into_owned(),
                strict_mode: self.config.strict_mode,
                ..EnvPolicy::default()
            },
            PermissionPolicy::default(),
        );
        let environment = hygiene.build_environment(&extra)?.into_iter().collect();
        let isolated = isolation == IsolationMode::Isolated;

        Ok(ExecutionProfile {
            command: plan
                .adapter
                .run_command(&self.config.python_path, &layout.workspace_file(harness_name)),
            environment,
            workdir: layout.workspace_dir.clone(),
            isolation,
            jail_root: None,
            directory_bindings: Vec::new(),
            uid: isolated.then_some(self.config.sandbox_uid),
            gid: isolated.then_some(self.config.sandbox_gid),
            strict_mode: self.config.strict_mode,
            memory_limit: Some(self.config.memory_limit_bytes),
            process_limit: Some(self.config.process_limit),
            address_space_limit: self.config.address_space_limit_bytes,
            file_size_limit: Some(self.config.file_size_limit_bytes),
            stack_limit: Some(self.config.stack_limit_bytes),
            fd_limit: Some(self.config.fd_limit),
            cpu_time_limit_ms: self.config.cpu_time_limit_ms,
            wall_time_limit_ms: self.config.wall_time_limit_ms,
            output_limit: self.config.output_limit_bytes,
        })
    }
}

fn infrastructure_verdict(config: &GradeConfig) -> Verdict {
    Verdict {
        result: ExecutionResult::failure(
            FailureKind::InfrastructureFailure,
            "sandbox could not be provisioned",
        ),
        provenance: VerdictProvenance {
            verdict_actor: VerdictActor::Infrastructure,
            verdict_cause: VerdictCause::IeSetupFailure,
            verdict_evidence_sources: vec!["provisioning".to_string()],
            termination_signal: None,
            wall_time_used: 0.0,
            memory_peak: 0,
            limit_snapshot: config.limit_snapshot(),
            evidence_collection_errors: Vec::new(),
        },
        self_score: None,
    }
}

fn audit_verdict(run_id: &str, puzzle_id: &str, verdict: &Verdict) {
    let limit_event = match verdict.provenance.verdict_cause {
        VerdictCause::TleWallJudge | VerdictCause::TleCpuKernel => Some(AuditEventType::DeadlineKill),
        VerdictCause::MleKernelOom | VerdictCause::MleRunnerMemoryError => {
            Some(AuditEventType::MemoryCeiling)
        }
        VerdictCause::PlePidsMax => Some(AuditEventType::ProcessCeiling),
        VerdictCause::IeSetupFailure | VerdictCause::IeSupervisorFailure => {
            Some(AuditEventType::InfrastructureFault)
        }
        VerdictCause::ReNonzeroExit | VerdictCause::ReFatalSignal | VerdictCause::NormalExit => None,
    };
    if let Some(event_type) = limit_event {
        events::limit_hit(
            run_id,
            puzzle_id,
            event_type,
            format!("{:?}", verdict.provenance.verdict_cause),
        );
    }
    if verdict.result.failure_kind() == Some(&FailureKind::MalformedResult) {
        events::limit_hit(
            run_id,
            puzzle_id,
            AuditEventType::MalformedResult,
            "runner result unusable".to_string(),
        );
    }

    let label = verdict
        .result
        .failure_kind()
        .map(FailureKind::label)
        .unwrap_or("success");
    events::submission_finished(run_id, puzzle_id, label, Some(verdict.provenance.clone()));
}

/// Read a submission from a file, or from stdin when `path` is `-`.
pub fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut source = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut source)?;
        Ok(source)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::generate::write_corpus;
    use crate::kernel::cgroup::backend::cgroup_v2_available;

    fn config_in(root: &Path) -> GradeConfig {
        GradeConfig {
            data_root: root.join("data"),
            runtime_root: root.join("runs"),
            allow_degraded: false,
            ..GradeConfig::default()
        }
    }

    #[test]
    fn controller_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Controller>();
    }

    #[test]
    fn launch_mode_decision() {
        let no_root = || Err("isolated grading requires root".to_string());
        assert_eq!(LaunchMode::decide(Ok(()), false, true), LaunchMode::Isolated);
        assert_eq!(LaunchMode::decide(no_root(), true, false), LaunchMode::Degraded);
        assert!(matches!(
            LaunchMode::decide(no_root(), true, true),
            LaunchMode::Unavailable(_)
        ));
        assert!(matches!(
            LaunchMode::decide(no_root(), false, false),
            LaunchMode::Unavailable(_)
        ));
    }

    #[test]
    fn root_without_cgroups_is_not_isolated() {
        let reason = || Err("cgroup v2 hierarchy not mounted at /sys/fs/cgroup".to_string());
        assert_eq!(LaunchMode::decide(reason(), true, false), LaunchMode::Degraded);
        match LaunchMode::decide(reason(), false, true) {
            LaunchMode::Unavailable(why) => assert!(why.contains("cgroup v2")),
            other => panic!("expected unavailable, got {:?}", other),
        }
    }

    #[test]
    fn host_support_explains_missing_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("not-a-cgroup");
        match LaunchMode::host_support(&base) {
            Ok(()) => assert!(cgroup_v2_available()),
            Err(reason) => assert!(
                reason.contains("root") || reason.contains("cgroup") || reason.contains("writable"),
                "{}",
                reason
            ),
        }
    }

    #[test]
    fn unknown_puzzle_is_not_found_without_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        write_corpus(&config.corpus_dir(), false).unwrap();
        let controller = Controller::new(config).unwrap();

        for id in ["nonsense", "examples_level_1_puzzle_9", "../x_level_1_puzzle_1"] {
            let result = controller.run_submission(id, "def transform(b): return b");
            assert_eq!(result.failure_kind(), Some(&FailureKind::NotFound), "{id}");
        }
        let leftovers = std::fs::read_dir(dir.path().join("runs")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn missing_corpus_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let id = PuzzleId::new("examples", 1, 1).unwrap();
        let location = DataLayout::new(&config.data_root).locate(&id);
        std::fs::create_dir_all(&location.dir).unwrap();
        for set in CorpusSet::ALL {
            std::fs::write(location.oracle_path(set), [0u8; 64 * 24]).unwrap();
        }

        let controller = Controller::new(config).unwrap();
        let report = controller.grade("examples_level_1_puzzle_1", "");
        assert_eq!(report.result.failure_kind(), Some(&FailureKind::NotFound));
        assert!(report.score.is_none());
    }

    #[test]
    fn build_oracle_requires_reference_transform() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(config_in(dir.path())).unwrap();
        assert!(matches!(
            controller.build_oracle("examples_level_1_puzzle_2"),
            Err(GradeError::PuzzleNotFound(_))
        ));
    }

    #[test]
    fn read_source_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solution.py");
        std::fs::write(&path, "def transform(b):\n    return b\n").unwrap();
        assert!(read_source(&path).unwrap().contains("def transform"));
    }
}
