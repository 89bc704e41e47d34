use crate::config::types::{
    CgroupEvidence, GradeError, JudgeAction, JudgeActionType, OutputIntegrity, Result,
};
use crate::core::proxy::{
    cloexec_pipe, drain_deadline, merge_integrity, read_fd_async, read_proxy_status_from_fd,
    relocate_fd, run_proxy_main_from_fds, write_request_to_fd, CollectedStream, StreamCapture,
    DRAIN_GRACE,
};
use crate::core::types::{
    IsolationMode, KillReport, LaunchEvidence, ProxyStatus, SandboxLaunchOutcome,
    SandboxLaunchRequest,
};
use crate::exec::preexec::{apply_rlimits, rlimit_plan};
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::namespace::NamespaceIsolation;
use crate::kernel::signal;
use crate::runner::protocol::RESULT_FD;
use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, Pid};
use std::os::unix::io::IntoRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::time::{Duration, Instant, SystemTime};

const WATCHDOG_TICK: Duration = Duration::from_millis(10);
const TERM_GRACE: Duration = Duration::from_millis(200);

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> GradeError {
    GradeError::Process(format!("{prefix}: {err}"))
}

fn build_configured_controls(req: &SandboxLaunchRequest) -> Vec<String> {
    let mut controls: Vec<String> = NamespaceIsolation::for_grading()
        .enabled_namespaces()
        .into_iter()
        .map(|ns| format!("{ns}_namespace"))
        .collect();
    controls.push("chroot_jail".to_string());
    if req.profile.memory_limit.is_some() {
        controls.push("memory_limit".to_string());
    }
    if req.profile.process_limit.is_some() {
        controls.push("process_limit".to_string());
    }
    controls.push("credential_drop".to_string());
    controls.push("no_new_privileges".to_string());
    controls.push("rlimits".to_string());
    controls.push("wall_clock_watchdog".to_string());
    controls
}

#[allow(clippy::too_many_arguments)]
fn build_launch_evidence(
    req: &SandboxLaunchRequest,
    running_as_root: bool,
    cgroup_enforced: bool,
    kill_report: Option<&KillReport>,
    proxy_status: &ProxyStatus,
    cgroup_evidence: Option<CgroupEvidence>,
    evidence_collection_errors: Vec<String>,
    interrupted_by: Option<i32>,
) -> LaunchEvidence {
    let configured = build_configured_controls(req);
    let mut applied = Vec::new();
    let mut missing = Vec::new();
    let isolated = req.profile.isolation == IsolationMode::Isolated;
    // Permissive setup steps may log and continue, so only a strict chain
    // that reached exec proves they took effect.
    let setup_controls_applied = isolated
        && req.profile.strict_mode
        && proxy_status.setup_error.is_none()
        && proxy_status.internal_error.is_none();

    for control in &configured {
        let holds = match control.as_str() {
            "memory_limit" | "process_limit" => cgroup_enforced,
            "rlimits" | "wall_clock_watchdog" => true,
            _ => setup_controls_applied,
        };
        if holds {
            applied.push(control.clone());
        } else {
            missing.push(control.clone());
        }
    }

    let mut judge_actions = Vec::new();
    if let Some(report) = kill_report {
        if report.term_sent {
            judge_actions.push(JudgeAction {
                timestamp: SystemTime::now(),
                action_type: JudgeActionType::SignalSent,
                details: "SIGTERM sent to sandbox process group".to_string(),
            });
        }
        if report.kill_sent {
            judge_actions.push(JudgeAction {
                timestamp: SystemTime::now(),
                action_type: JudgeActionType::ForcedKill,
                details: "SIGKILL sent to sandbox process group".to_string(),
            });
        }
    }

    LaunchEvidence {
        isolation: req.profile.isolation,
        running_as_root,
        configured_controls: configured,
        applied_controls: applied,
        missing_controls: missing,
        judge_actions,
        cgroup_evidence,
        evidence_collection_errors,
        interrupted_by,
    }
}

/// SIGTERM the group, give it a moment, then SIGKILL.
pub fn terminate_proxy_group(proxy_pid: Pid) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    for (sig, grace) in [(libc::SIGTERM, Some(TERM_GRACE)), (libc::SIGKILL, None)] {
        // SAFETY: kill(2) with a negative pid targets the process group.
        let group_rc = unsafe { libc::kill(-proxy_pid.as_raw(), sig) };
        if group_rc != 0 {
            let _ = unsafe { libc::kill(proxy_pid.as_raw(), sig) };
            report.notes.push(format!(
                "group signal {} fell back to pid: {}",
                sig,
                std::io::Error::last_os_error()
            ));
        }
        if sig == libc::SIGTERM {
            report.term_sent = true;
        } else {
            report.kill_sent = true;
        }
        if let Some(grace) = grace {
            std::thread::sleep(grace);
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

fn interrupted() -> Option<i32> {
    if signal::shutdown_requested() {
        signal::received_signal()
    } else {
        None
    }
}

/// Launch a request through the process model its profile asks for.
///
/// Isolated launches clone a proxy into fresh namespaces; the proxy forks the
/// payload and reports a [`ProxyStatus`] back over a pipe. Degraded launches
/// spawn the payload directly on the host.
pub fn launch_with_supervisor(
    req: SandboxLaunchRequest,
    cgroup: Option<&dyn CgroupBackend>,
) -> Result<SandboxLaunchOutcome> {
    if req.profile.command.is_empty() {
        return Err(GradeError::Config("empty command".to_string()));
    }
    match req.profile.isolation {
        IsolationMode::Isolated => launch_isolated(req, cgroup),
        IsolationMode::Degraded => launch_degraded(req),
    }
}

fn launch_isolated(
    req: SandboxLaunchRequest,
    cgroup: Option<&dyn CgroupBackend>,
) -> Result<SandboxLaunchOutcome> {
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        return Err(GradeError::Privilege(
            "isolated launch requires root".to_string(),
        ));
    }

    let mut evidence_collection_errors = Vec::new();

    let (launch_read, launch_write) = cloexec_pipe("launch")?;
    let (status_read, status_write) = cloexec_pipe("status")?;

    let child_launch_write = launch_write;
    let child_status_read = status_read;
    let mut child_stack = vec![0u8; 2 * 1024 * 1024];
    let child_cb: Box<dyn FnMut() -> isize> = Box::new(move || {
        // Holding launch_write open here would keep the proxy's read from seeing EOF.
        let _ = close(child_launch_write);
        let _ = close(child_status_read);
        run_proxy_main_from_fds(launch_read, status_write)
    });

    let flags = NamespaceIsolation::for_grading().clone_flags();
    // SAFETY: the callback only touches fds it owns and never returns.
    let clone_result = unsafe { clone(child_cb, &mut child_stack, flags, Some(libc::SIGCHLD)) };

    let proxy_pid = match clone_result {
        Ok(pid) => pid,
        Err(err) => {
            for fd in [launch_read, launch_write, status_read, status_write] {
                let _ = close(fd);
            }
            return Err(match err {
                Errno::EPERM => GradeError::Privilege(
                    "clone() into namespaces was refused (EPERM)".to_string(),
                ),
                other => to_process_error("clone(proxy)", other),
            });
        }
    };

    let _ = close(launch_read);
    let _ = close(status_write);

    // The proxy may block writing a large status; drain it concurrently.
    let status_reader = std::thread::spawn(move || read_proxy_status_from_fd(status_read));

    if let Err(err) = write_request_to_fd(launch_write, &req) {
        let _ = terminate_proxy_group(proxy_pid);
        let _ = waitpid(proxy_pid, None);
        return Err(err);
    }

    let wall_limit = Duration::from_millis(req.profile.wall_time_limit_ms);
    let started = Instant::now();
    let mut timed_out = false;
    let mut interrupted_by = None;
    let mut kill_report: Option<KillReport> = None;
    let mut proxy_exit_code = None;
    let mut proxy_signal = None;

    loop {
        match waitpid(proxy_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if kill_report.is_none() {
                    if started.elapsed() > wall_limit {
                        timed_out = true;
                        log::info!(
                            "Wall limit of {}ms hit for {}, terminating",
                            req.profile.wall_time_limit_ms,
                            req.instance_id
                        );
                        kill_report = Some(terminate_proxy_group(proxy_pid));
                    } else if let Some(sig) = interrupted() {
                        interrupted_by = Some(sig);
                        log::warn!("Signal {} received, tearing down {}", sig, req.instance_id);
                        kill_report = Some(terminate_proxy_group(proxy_pid));
                    }
                }
                std::thread::sleep(WATCHDOG_TICK);
            }
            Ok(WaitStatus::Exited(_, code)) => {
                proxy_exit_code = Some(code);
                break;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                proxy_signal = Some(sig as i32);
                break;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(proxy)", e)),
        }
    }

    let fallback = |reason: String| ProxyStatus {
        exit_code: proxy_exit_code,
        term_signal: proxy_signal,
        wall_time_ms: started.elapsed().as_millis() as u64,
        output_integrity: OutputIntegrity::WriteError,
        internal_error: Some(reason),
        ..ProxyStatus::default()
    };
    let mut status = match status_reader.join() {
        Ok(Ok(status)) => status,
        // A killed proxy never writes its status; that is expected after a timeout.
        Ok(Err(err)) => fallback(format!("proxy status unavailable: {err}")),
        Err(_) => fallback("proxy status reader panicked".to_string()),
    };
    if timed_out {
        status.timed_out = true;
        status.wall_time_ms = started.elapsed().as_millis() as u64;
    }

    let cgroup_enforced =
        cgroup.is_some() && req.cgroup_attach_path.is_some() && status.setup_error.is_none();
    let mut cgroup_evidence = None;
    if let Some(controller) = cgroup {
        match controller.collect_evidence(&req.instance_id) {
            Ok(evidence) => cgroup_evidence = Some(evidence),
            Err(err) => evidence_collection_errors.push(format!("cgroup_evidence: {}", err)),
        }
    }

    let evidence = build_launch_evidence(
        &req,
        true,
        cgroup_enforced,
        kill_report.as_ref(),
        &status,
        cgroup_evidence,
        evidence_collection_errors,
        interrupted_by,
    );

    Ok(SandboxLaunchOutcome {
        proxy_host_pid: proxy_pid.as_raw(),
        payload_host_pid: status.payload_pid,
        evidence,
        kill_report,
        status,
    })
}

/// Spawn the payload directly on the host with rlimits and a wall-clock kill.
fn launch_degraded(req: SandboxLaunchRequest) -> Result<SandboxLaunchOutcome> {
    use std::process::{Command, Stdio};

    log::warn!(
        "Degraded launch for {}: no namespaces, jail, cgroup or credential drop",
        req.instance_id
    );

    let started = Instant::now();
    let wall_limit = Duration::from_millis(req.profile.wall_time_limit_ms);

    let (result_read, result_write) = cloexec_pipe("result")?;
    // Above the low slots so the dup2 onto RESULT_FD cannot clobber it.
    let result_write = relocate_fd(result_write, true)?;
    let plan = rlimit_plan(&req.profile);

    let mut cmd = Command::new(&req.profile.command[0]);
    cmd.args(&req.profile.command[1..])
        .env_clear()
        .envs(req.profile.environment.iter().map(|(k, v)| (k, v)))
        .current_dir(&req.profile.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    // SAFETY: the closure only calls dup2 and setrlimit, both async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(result_write, RESULT_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            apply_rlimits(&plan)
        });
    }

    let spawned = cmd.spawn();
    let _ = close(result_write);
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let _ = close(result_read);
            return Err(GradeError::Process(format!("spawn(degraded): {}", e)));
        }
    };
    let child_pid = child.id() as i32;

    let limit = req.profile.output_limit as usize;
    let stdout_handle = child
        .stdout
        .take()
        .map(|out| read_fd_async(out.into_raw_fd(), limit));
    let stderr_handle = child
        .stderr
        .take()
        .map(|err| read_fd_async(err.into_raw_fd(), limit));
    let result_handle = read_fd_async(result_read, limit);

    let mut timed_out = false;
    let mut interrupted_by = None;
    let mut kill_report = None;
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if kill_report.is_none() {
                    if started.elapsed() > wall_limit {
                        timed_out = true;
                        kill_report = Some(terminate_proxy_group(Pid::from_raw(child_pid)));
                    } else if let Some(sig) = interrupted() {
                        interrupted_by = Some(sig);
                        kill_report = Some(terminate_proxy_group(Pid::from_raw(child_pid)));
                    }
                }
                std::thread::sleep(WATCHDOG_TICK);
            }
            Err(e) => {
                log::error!("wait(degraded) failed for {}: {}", req.instance_id, e);
                let _ = terminate_proxy_group(Pid::from_raw(child_pid));
                let _ = child.wait();
                break None;
            }
        }
    };

    // Whatever the payload left behind in its group goes with it.
    // SAFETY: kill(2) with a negative pid targets the payload's process group.
    let _ = unsafe { libc::kill(-child_pid, libc::SIGKILL) };

    // Escapees from the group may still hold the pipes; stop listening at the deadline.
    let deadline = drain_deadline(started, wall_limit, DRAIN_GRACE);
    let collect = |capture: Option<StreamCapture>| match capture {
        Some(capture) => capture.collect(deadline),
        None => CollectedStream {
            bytes: Vec::new(),
            integrity: OutputIntegrity::WriteError,
            reached_eof: true,
        },
    };
    let stdout = collect(stdout_handle);
    let stderr = collect(stderr_handle);
    let result = collect(Some(result_handle));

    let mut evidence_notes = vec!["degraded_launch: no namespace isolation".to_string()];
    for (name, stream) in [("stdout", &stdout), ("stderr", &stderr), ("result", &result)] {
        if !stream.reached_eof {
            evidence_notes.push(format!("{name} still open after payload exit; drain abandoned"));
        }
    }

    let status = ProxyStatus {
        payload_pid: Some(child_pid),
        exit_code: exit_status.and_then(|s| s.code()),
        term_signal: exit_status.and_then(|s| s.signal()),
        timed_out,
        wall_time_ms: started.elapsed().as_millis() as u64,
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        output_integrity: merge_integrity(&stdout.integrity, &stderr.integrity),
        result_channel: hex::encode(&result.bytes),
        result_integrity: result.integrity,
        setup_error: None,
        internal_error: exit_status
            .is_none()
            .then(|| "degraded payload could not be waited on".to_string()),
        reaped_descendants: 0,
    };

    // SAFETY: geteuid has no preconditions.
    let running_as_root = unsafe { libc::geteuid() } == 0;
    let evidence = build_launch_evidence(
        &req,
        running_as_root,
        false,
        kill_report.as_ref(),
        &status,
        None,
        evidence_notes,
        interrupted_by,
    );

    Ok(SandboxLaunchOutcome {
        proxy_host_pid: child_pid,
        payload_host_pid: Some(child_pid),
        evidence,
        kill_report,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionProfile;
    use std::path::PathBuf;

    fn test_request(isolation: IsolationMode, strict_mode: bool) -> SandboxLaunchRequest {
        SandboxLaunchRequest {
            instance_id: "evidence-test".to_string(),
            profile: ExecutionProfile {
                command: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
                environment: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
                workdir: std::env::temp_dir(),
                isolation,
                jail_root: None,
                directory_bindings: Vec::new(),
                uid: Some(65534),
                gid: Some(65534),
                strict_mode,
                memory_limit: Some(128 * 1024 * 1024),
                process_limit: Some(4),
                address_space_limit: None,
                file_size_limit: Some(1024 * 1024),
                stack_limit: None,
                fd_limit: Some(64),
                cpu_time_limit_ms: Some(2000),
                wall_time_limit_ms: 2000,
                output_limit: 64 * 1024,
            },
            cgroup_attach_path: Some(PathBuf::from("/sys/fs/cgroup/gradebox/evidence-test")),
        }
    }

    fn proxy_status(setup_error: Option<&str>) -> ProxyStatus {
        ProxyStatus {
            payload_pid: Some(1234),
            exit_code: Some(0),
            setup_error: setup_error.map(str::to_string),
            ..ProxyStatus::default()
        }
    }

    const SETUP_CONTROLS: [&str; 7] = [
        "pid_namespace",
        "mount_namespace",
        "network_namespace",
        "ipc_namespace",
        "chroot_jail",
        "credential_drop",
        "no_new_privileges",
    ];

    #[test]
    fn strict_mode_does_not_claim_setup_controls_on_setup_failure() {
        let req = test_request(IsolationMode::Isolated, true);
        let status = proxy_status(Some("mount failed"));
        let evidence =
            build_launch_evidence(&req, true, false, None, &status, None, Vec::new(), None);

        for control in SETUP_CONTROLS {
            assert!(
                !evidence.applied_controls.iter().any(|c| c == control),
                "control should not be reported as applied on setup failure: {}",
                control
            );
            assert!(
                evidence.missing_controls.iter().any(|c| c == control),
                "control should be reported missing on setup failure: {}",
                control
            );
        }
    }

    #[test]
    fn strict_mode_claims_setup_controls_when_proxy_succeeds() {
        let req = test_request(IsolationMode::Isolated, true);
        let status = proxy_status(None);
        let evidence =
            build_launch_evidence(&req, true, true, None, &status, None, Vec::new(), None);

        for control in SETUP_CONTROLS {
            assert!(
                evidence.applied_controls.iter().any(|c| c == control),
                "control should be reported as applied on successful setup: {}",
                control
            );
        }
        assert!(evidence.missing_controls.is_empty());
    }

    #[test]
    fn degraded_evidence_lists_missing_isolation() {
        let req = test_request(IsolationMode::Degraded, false);
        let evidence = build_launch_evidence(
            &req,
            false,
            false,
            None,
            &proxy_status(None),
            None,
            Vec::new(),
            None,
        );
        assert_eq!(evidence.isolation, IsolationMode::Degraded);
        assert!(evidence.missing_controls.contains(&"memory_limit".to_string()));
        assert!(evidence.missing_controls.contains(&"chroot_jail".to_string()));
        assert!(evidence.applied_controls.contains(&"rlimits".to_string()));
    }

    #[test]
    fn kill_report_becomes_judge_actions() {
        let req = test_request(IsolationMode::Isolated, true);
        let report = KillReport {
            term_sent: true,
            kill_sent: true,
            waited_ms: 200,
            notes: Vec::new(),
        };
        let evidence = build_launch_evidence(
            &req,
            true,
            true,
            Some(&report),
            &proxy_status(None),
            None,
            Vec::new(),
            None,
        );
        let kinds: Vec<_> = evidence
            .judge_actions
            .iter()
            .map(|a| a.action_type.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![JudgeActionType::SignalSent, JudgeActionType::ForcedKill]
        );
    }

    #[test]
    fn degraded_launch_captures_streams_and_result_channel() {
        let mut req = test_request(IsolationMode::Degraded, false);
        req.profile.command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "printf out; printf err >&2; printf frame >&3; exit 4".to_string(),
        ];
        let outcome = launch_with_supervisor(req, None).unwrap();
        assert_eq!(outcome.status.exit_code, Some(4));
        assert_eq!(outcome.status.stdout, "out");
        assert_eq!(outcome.status.stderr, "err");
        assert_eq!(outcome.status.result_bytes(), b"frame".to_vec());
        assert!(!outcome.status.timed_out);
        assert!(outcome.kill_report.is_none());
    }

    #[test]
    fn degraded_launch_kills_on_wall_limit() {
        let mut req = test_request(IsolationMode::Degraded, false);
        req.profile.command = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        req.profile.wall_time_limit_ms = 100;
        let started = Instant::now();
        let outcome = launch_with_supervisor(req, None).unwrap();
        assert!(outcome.status.timed_out);
        assert!(outcome.kill_report.is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn degraded_launch_returns_while_an_escaped_descendant_holds_the_pipes() {
        if !std::path::Path::new("/usr/bin/setsid").exists() {
            eprintln!("setsid not available; skipping");
            return;
        }
        let mut req = test_request(IsolationMode::Degraded, false);
        req.profile.command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "/usr/bin/setsid sleep 8 & printf frame >&3; exit 0".to_string(),
        ];
        req.profile.wall_time_limit_ms = 300;
        let started = Instant::now();
        let outcome = launch_with_supervisor(req, None).unwrap();

        assert!(
            started.elapsed() < Duration::from_secs(2),
            "caller blocked for {:?}",
            started.elapsed()
        );
        assert!(!outcome.status.timed_out);
        assert_eq!(outcome.status.exit_code, Some(0));
        assert_eq!(outcome.status.result_bytes(), b"frame".to_vec());
        assert!(outcome
            .evidence
            .evidence_collection_errors
            .iter()
            .any(|note| note.contains("still open after payload exit")));
    }

    #[test]
    fn degraded_launch_kills_background_jobs_left_in_the_group() {
        let mut req = test_request(IsolationMode::Degraded, false);
        req.profile.command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 8 & printf done; exit 0".to_string(),
        ];
        let started = Instant::now();
        let outcome = launch_with_supervisor(req, None).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.status.stdout, "done");
        assert_eq!(outcome.evidence.evidence_collection_errors.len(), 1);
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut req = test_request(IsolationMode::Degraded, false);
        req.profile.command.clear();
        assert!(matches!(
            launch_with_supervisor(req, None),
            Err(GradeError::Config(_))
        ));
    }
}
