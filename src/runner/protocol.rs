//! Result protocol between the in-sandbox runner and the controller.
//!
//! The runner writes one frame to the result descriptor: a 4-byte big-endian
//! length followed by that many bytes of JSON. It also prints the same JSON as
//! its last stdout line, which is what older controllers scanned for.
//!
//! Extraction rules:
//! - frames present and the stream ends on a frame boundary: the last frame wins;
//! - trailing bytes after the last complete frame: truncated, the runner died mid-write;
//! - no bytes at all on the channel: scan stdout backward for a result line.

use crate::config::types::{GradeError, Result};
use crate::corpus::Buffer;
use crate::outcome::{ExecutionResult, FailureKind, Resource, RunOutputs, Stage};
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

/// Descriptor number the result pipe is installed at inside the sandbox.
pub const RESULT_FD: RawFd = 3;

/// Frames larger than this are rejected without allocating.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const LENGTH_PREFIX: usize = 4;

/// Failure classes the runner reports for a rejected submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerFailureKind {
    LoadError,
    TransformError,
    WrongType,
    WrongLength,
    Memory,
    /// The runner could not read the mounted corpus
    CorpusError,
}

/// JSON document emitted by the runner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerReport {
    pub success: bool,
    #[serde(default)]
    pub visible_outputs: Vec<String>,
    #[serde(default)]
    pub hidden_outputs: Vec<String>,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub failure: Option<RunnerFailureKind>,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub error: Option<String>,
    /// Self-score, only present when the oracle was exposed to the runner
    #[serde(default)]
    pub visible_correct: Option<usize>,
    #[serde(default)]
    pub hidden_correct: Option<usize>,
}

impl RunnerReport {
    pub fn self_score(&self) -> Option<(usize, usize)> {
        self.visible_correct.zip(self.hidden_correct)
    }
}

/// Encode one frame. Used by tests and by in-process tooling.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(GradeError::Protocol(format!(
            "frame of {} bytes exceeds limit {}",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Complete frames found on the channel, and how many bytes trail them.
#[derive(Debug, Default, PartialEq)]
pub struct FrameScan<'a> {
    pub frames: Vec<&'a [u8]>,
    pub trailing: usize,
}

pub fn scan_frames(channel: &[u8]) -> FrameScan<'_> {
    let mut scan = FrameScan::default();
    let mut rest = channel;

    while rest.len() >= LENGTH_PREFIX {
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&rest[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_LEN || rest.len() - LENGTH_PREFIX < len {
            break;
        }
        scan.frames.push(&rest[LENGTH_PREFIX..LENGTH_PREFIX + len]);
        rest = &rest[LENGTH_PREFIX + len..];
    }

    scan.trailing = rest.len();
    scan
}

/// Where a report came from, or why none could be recovered.
#[derive(Debug, PartialEq)]
pub enum Extraction {
    Framed(RunnerReport),
    Legacy(RunnerReport),
    /// Channel ended inside a frame
    Truncated { trailing: usize },
    /// A complete frame that is not a runner report
    Undecodable(String),
    Missing,
}

pub fn extract_report(channel: &[u8], stdout: &str) -> Extraction {
    if channel.is_empty() {
        return match scan_stdout(stdout) {
            Some(report) => Extraction::Legacy(report),
            None => Extraction::Missing,
        };
    }

    let scan = scan_frames(channel);
    if scan.trailing > 0 {
        return Extraction::Truncated {
            trailing: scan.trailing,
        };
    }

    match scan.frames.last() {
        Some(frame) => match serde_json::from_slice::<RunnerReport>(frame) {
            Ok(report) => Extraction::Framed(report),
            Err(e) => Extraction::Undecodable(e.to_string()),
        },
        None => Extraction::Missing,
    }
}

/// Last stdout line that parses as a runner report.
pub fn scan_stdout(stdout: &str) -> Option<RunnerReport> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<RunnerReport>(line).ok())
}

fn decode_outputs(encoded: &[String], set: &str) -> Result<Vec<Buffer>> {
    encoded
        .iter()
        .enumerate()
        .map(|(i, text)| {
            Buffer::from_hex(text).map_err(|e| {
                GradeError::Protocol(format!("{} output {}: {}", set, i + 1, e))
            })
        })
        .collect()
}

/// Map a runner report onto the execution result it stands for.
pub fn interpret_report(report: &RunnerReport) -> ExecutionResult {
    if report.success {
        let outputs = decode_outputs(&report.visible_outputs, "visible").and_then(|visible| {
            let hidden = decode_outputs(&report.hidden_outputs, "hidden")?;
            RunOutputs::new(visible, hidden, report.execution_time.unwrap_or(0.0))
        });
        return match outputs {
            Ok(outputs) => ExecutionResult::Success(outputs),
            Err(e) => ExecutionResult::failure(FailureKind::MalformedResult, e.to_string()),
        };
    }

    let detail = report
        .error
        .clone()
        .unwrap_or_else(|| "submission rejected by runner".to_string());

    match report.failure {
        Some(RunnerFailureKind::Memory) => ExecutionResult::failure(
            FailureKind::ResourceExceeded {
                resource: Resource::Memory,
            },
            detail,
        ),
        Some(RunnerFailureKind::CorpusError) => {
            log::error!("runner could not read corpus: {}", detail);
            ExecutionResult::failure(
                FailureKind::InfrastructureFailure,
                "sandbox inputs unavailable",
            )
        }
        _ => ExecutionResult::failure(
            FailureKind::RunnerFailure {
                stage: report.stage,
                index: report.index,
            },
            detail,
        ),
    }
}
