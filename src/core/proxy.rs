use crate::config::types::{GradeError, OutputIntegrity, Result};
use crate::core::types::{ProxyStatus, SandboxLaunchRequest};
use crate::exec::preexec::{FreshChild, Sandbox};
use crate::runner::protocol::RESULT_FD;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, fork, pipe2, setpgid, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Descriptors that must survive dup2 onto 0..=3 are moved at or above this.
pub const RELOCATION_FLOOR: RawFd = 10;

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> GradeError {
    GradeError::Process(format!("{prefix}: {err}"))
}

fn read_json_from_fd<T: DeserializeOwned>(fd: RawFd) -> Result<T> {
    // SAFETY: the caller hands over ownership of `fd`.
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    serde_json::from_slice(&data)
        .map_err(|e| GradeError::Process(format!("failed to decode json on fd {fd}: {e}")))
}

fn write_json_to_fd<T: Serialize>(fd: RawFd, value: &T) -> Result<()> {
    // SAFETY: the caller hands over ownership of `fd`.
    let mut file = unsafe { File::from_raw_fd(fd) };
    let payload = serde_json::to_vec(value)?;
    file.write_all(&payload)?;
    file.flush()?;
    Ok(())
}

pub fn write_request_to_fd(fd: RawFd, req: &SandboxLaunchRequest) -> Result<()> {
    write_json_to_fd(fd, req)
}

pub fn read_proxy_status_from_fd(fd: RawFd) -> Result<ProxyStatus> {
    read_json_from_fd(fd)
}

/// Pipe whose ends are close-on-exec.
pub fn cloexec_pipe(what: &str) -> Result<(RawFd, RawFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| to_process_error(&format!("pipe({what})"), e))
}

/// Duplicate `fd` to the lowest free descriptor >= RELOCATION_FLOOR and close the original.
pub fn relocate_fd(fd: RawFd, cloexec: bool) -> Result<RawFd> {
    let arg = if cloexec {
        FcntlArg::F_DUPFD_CLOEXEC(RELOCATION_FLOOR)
    } else {
        FcntlArg::F_DUPFD(RELOCATION_FLOOR)
    };
    let moved = fcntl(fd, arg).map_err(|e| to_process_error("fcntl(F_DUPFD)", e))?;
    let _ = close(fd);
    Ok(moved)
}

/// Bytes drained from one pipe by a background reader.
///
/// The reader keeps draining until EOF so writers never block on a full pipe,
/// but [`StreamCapture::collect`] stops waiting at a deadline. A descendant that
/// still holds the write end open cannot stall the caller.
pub struct StreamCapture {
    shared: Arc<Mutex<Captured>>,
    handle: thread::JoinHandle<()>,
}

struct Captured {
    bytes: Vec<u8>,
    integrity: OutputIntegrity,
    abandoned: bool,
}

/// What a capture held when it was collected.
pub struct CollectedStream {
    pub bytes: Vec<u8>,
    pub integrity: OutputIntegrity,
    /// False when the write end was still open at the deadline.
    pub reached_eof: bool,
}

fn lock(shared: &Mutex<Captured>) -> std::sync::MutexGuard<'_, Captured> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StreamCapture {
    /// Wait for EOF until `deadline`, then take whatever has been read.
    pub fn collect(self, deadline: Instant) -> CollectedStream {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(DRAIN_TICK);
        }
        let reached_eof = self.handle.is_finished();
        if reached_eof {
            let _ = self.handle.join();
        }
        let mut captured = lock(&self.shared);
        captured.abandoned = true;
        CollectedStream {
            bytes: std::mem::take(&mut captured.bytes),
            integrity: captured.integrity.clone(),
            reached_eof,
        }
    }
}

const DRAIN_TICK: Duration = Duration::from_millis(2);

/// How long captured streams may stay open once the payload is gone.
pub const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Drain `fd` on a thread, keeping at most `limit` bytes.
pub fn read_fd_async(fd: RawFd, limit: usize) -> StreamCapture {
    let shared = Arc::new(Mutex::new(Captured {
        bytes: Vec::new(),
        integrity: OutputIntegrity::Complete,
        abandoned: false,
    }));
    let sink = Arc::clone(&shared);
    let handle = thread::spawn(move || {
        // SAFETY: the reader thread owns `fd` from here on.
        let mut file = unsafe { File::from_raw_fd(fd) };
        let mut buf = [0u8; 4096];

        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let mut captured = lock(&sink);
                    if captured.abandoned
                        || captured.integrity == OutputIntegrity::TruncatedByJudgeLimit
                    {
                        // Keep draining so the writer never blocks on a full pipe.
                        continue;
                    }
                    if captured.bytes.len() + n > limit {
                        let remaining = limit.saturating_sub(captured.bytes.len());
                        captured.bytes.extend_from_slice(&buf[..remaining]);
                        captured.integrity = OutputIntegrity::TruncatedByJudgeLimit;
                    } else {
                        captured.bytes.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let mut captured = lock(&sink);
                    if captured.integrity == OutputIntegrity::Complete {
                        captured.integrity = if e.kind() == std::io::ErrorKind::BrokenPipe {
                            OutputIntegrity::TruncatedByProgramClose
                        } else {
                            OutputIntegrity::WriteError
                        };
                    }
                    break;
                }
            }
        }
    });

    StreamCapture { shared, handle }
}

/// Deadline for draining output once the payload has been reaped.
///
/// Bounded by `grace` and by whatever remains of the wall budget.
pub fn drain_deadline(started: Instant, wall_limit: Duration, grace: Duration) -> Instant {
    let remaining = wall_limit.saturating_sub(started.elapsed());
    Instant::now() + grace.min(remaining)
}

/// Worst integrity of the two captured streams.
pub fn merge_integrity(a: &OutputIntegrity, b: &OutputIntegrity) -> OutputIntegrity {
    let rank = |i: &OutputIntegrity| match i {
        OutputIntegrity::Complete => 0,
        OutputIntegrity::TruncatedByProgramClose => 1,
        OutputIntegrity::TruncatedByJudgeLimit => 2,
        OutputIntegrity::WriteError => 3,
    };
    if rank(a) >= rank(b) {
        a.clone()
    } else {
        b.clone()
    }
}

fn exec_payload_with_typestate(req: &SandboxLaunchRequest, error_fd: RawFd) -> Result<()> {
    let profile = &req.profile;
    let sandbox = Sandbox::<FreshChild>::new(req.instance_id.clone(), profile.strict_mode)
        .bind_lifecycle(true)?
        .harden_mount_propagation()?
        .attach_to_cgroup(req.cgroup_attach_path.as_deref())?
        .setup_mounts_and_root(profile)?
        .apply_runtime_hygiene(profile, &[RESULT_FD, error_fd])?
        .drop_credentials(profile.uid, profile.gid)?
        .lock_privileges()?
        .ready_for_exec();
    sandbox.exec_payload(&profile.command)?;
    Ok(())
}

/// Payload side of the fork: wire stdio and the result channel, then run the chain.
/// Setup failures are written to `error_fd`; a successful exec closes it.
fn payload_child(
    req: &SandboxLaunchRequest,
    stdio: [RawFd; 3],
    result_write: RawFd,
    error_write: RawFd,
) -> ! {
    let wire = || -> Result<()> {
        for (fd, target) in stdio.iter().zip([
            libc::STDIN_FILENO,
            libc::STDOUT_FILENO,
            libc::STDERR_FILENO,
        ]) {
            dup2(*fd, target).map_err(|e| to_process_error("dup2(stdio)", e))?;
            let _ = close(*fd);
        }
        dup2(result_write, RESULT_FD).map_err(|e| to_process_error("dup2(result)", e))?;
        let _ = close(result_write);
        Ok(())
    };

    let outcome = wire().and_then(|_| exec_payload_with_typestate(req, error_write));
    if let Err(err) = outcome {
        // SAFETY: the setup-error pipe belongs to this process.
        let mut pipe = unsafe { File::from_raw_fd(error_write) };
        let _ = pipe.write_all(err.to_string().as_bytes());
    }
    // SAFETY: _exit skips atexit handlers and stdio flushing inherited from the proxy.
    unsafe { libc::_exit(127) }
}

fn wait_for_payload_and_reap(payload_pid: Pid) -> Result<(Option<i32>, Option<i32>, u32)> {
    let mut payload_exit: Option<i32> = None;
    let mut payload_signal: Option<i32> = None;
    let mut reaped_descendants: u32 = 0;

    loop {
        match waitpid(payload_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                payload_exit = Some(code);
                break;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                payload_signal = Some(sig as i32);
                break;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(payload)", e)),
        }
    }

    // The sandbox ends with its payload. As pid 1 of the namespace the proxy
    // can take every remaining process down with it and inherits the orphans.
    // SAFETY: getpid has no preconditions.
    let namespace_init = unsafe { libc::getpid() } == 1;
    if namespace_init {
        // SAFETY: kill(-1) from a namespace init reaches only that namespace and spares the caller.
        let _ = unsafe { libc::kill(-1, libc::SIGKILL) };
    }
    let reap_flags = if namespace_init {
        None
    } else {
        Some(WaitPidFlag::WNOHANG)
    };
    loop {
        match waitpid(Pid::from_raw(-1), reap_flags) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => reaped_descendants += 1,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(reap)", e)),
        }
    }

    Ok((payload_exit, payload_signal, reaped_descendants))
}

fn run_proxy(req: SandboxLaunchRequest) -> Result<ProxyStatus> {
    let start = Instant::now();

    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    crate::exec::preexec::setup_parent_death_signal()?;

    let (stdin_read, stdin_write) = cloexec_pipe("stdin")?;
    let (stdout_read, stdout_write) = cloexec_pipe("stdout")?;
    let (stderr_read, stderr_write) = cloexec_pipe("stderr")?;
    let (result_read, result_write) = cloexec_pipe("result")?;
    let (error_read, error_write) = cloexec_pipe("setup-error")?;
    let result_write = relocate_fd(result_write, true)?;
    let error_write = relocate_fd(error_write, true)?;

    // SAFETY: the proxy is single-threaded at this point.
    let payload_pid = match unsafe { fork() }.map_err(|e| to_process_error("fork(payload)", e))? {
        ForkResult::Child => {
            for fd in [stdin_write, stdout_read, stderr_read, result_read, error_read] {
                let _ = close(fd);
            }
            payload_child(
                &req,
                [stdin_read, stdout_write, stderr_write],
                result_write,
                error_write,
            )
        }
        ForkResult::Parent { child } => child,
    };

    // Closing the write ends is what lets the readers see EOF.
    for fd in [stdin_read, stdin_write, stdout_write, stderr_write, result_write, error_write] {
        let _ = close(fd);
    }

    let limit = req.profile.output_limit as usize;
    let stdout_handle = read_fd_async(stdout_read, limit);
    let stderr_handle = read_fd_async(stderr_read, limit);
    let result_handle = read_fd_async(result_read, limit);
    let error_handle = read_fd_async(error_read, 4096);

    let (exit_code, term_signal, reaped_descendants) = wait_for_payload_and_reap(payload_pid)?;

    let deadline = drain_deadline(
        start,
        Duration::from_millis(req.profile.wall_time_limit_ms),
        DRAIN_GRACE,
    );
    let stdout = stdout_handle.collect(deadline);
    let stderr = stderr_handle.collect(deadline);
    let result = result_handle.collect(deadline);
    let error_bytes = error_handle.collect(deadline).bytes;

    let still_open = [("stdout", &stdout), ("stderr", &stderr), ("result", &result)]
        .iter()
        .filter(|(_, stream)| !stream.reached_eof)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
    if !still_open.is_empty() {
        log::warn!(
            "{}: {} still open after payload exit",
            req.instance_id,
            still_open.join(", ")
        );
    }

    let setup_error = if error_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&error_bytes).into_owned())
    };

    Ok(ProxyStatus {
        payload_pid: Some(payload_pid.as_raw()),
        exit_code,
        term_signal,
        timed_out: false,
        wall_time_ms: start.elapsed().as_millis() as u64,
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        output_integrity: merge_integrity(&stdout.integrity, &stderr.integrity),
        result_channel: hex::encode(&result.bytes),
        result_integrity: result.integrity,
        setup_error,
        internal_error: None,
        reaped_descendants,
    })
}

/// Child entrypoint executed by the clone()-created proxy process.
pub fn run_proxy_main_from_fds(launch_fd: RawFd, status_fd: RawFd) -> ! {
    let outcome = match read_json_from_fd::<SandboxLaunchRequest>(launch_fd).and_then(run_proxy) {
        Ok(status) => status,
        Err(err) => ProxyStatus {
            internal_error: Some(err.to_string()),
            ..ProxyStatus::default()
        },
    };

    let _ = write_json_to_fd(status_fd, &outcome);
    let code = if outcome.internal_error.is_some() { 126 } else { 0 };
    std::process::exit(code);
}
