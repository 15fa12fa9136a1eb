//! Archive pipeline: `tar` capture feeding a compression stage.
//!
//! The two stages run concurrently and are connected by the capture's stdout.
//! The downstream stage is either an external compressor process (gzip,
//! bzip2, xz) or an in-process writer task (plain tar, zstd). Success is
//! decided by [`settle`] once both stages have been joined.

pub mod stats;

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_compression::tokio::write::ZstdEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Tools;
pub use stats::ArchiveStats;

/// Signal number of SIGPIPE on Linux and the BSDs.
const SIGPIPE: i32 = 13;

/// Compression applied to the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    #[serde(rename = "tar", alias = "none")]
    Uncompressed,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    /// File name suffix appended after `.tar`
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Compression::Uncompressed => None,
            Compression::Gzip => Some("gz"),
            Compression::Bzip2 => Some("bz2"),
            Compression::Xz => Some("xz"),
            Compression::Zstd => Some("zst"),
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::Uncompressed)
    }

    /// External compressor binary, if this kind runs out of process
    fn program<'a>(&self, tools: &'a Tools) -> Option<&'a Path> {
        match self {
            Compression::Gzip => Some(&tools.gzip),
            Compression::Bzip2 => Some(&tools.bzip2),
            Compression::Xz => Some(&tools.xz),
            Compression::Uncompressed | Compression::Zstd => None,
        }
    }
}

/// What to capture and how
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    pub source: PathBuf,

    /// Passed verbatim as `--exclude=<pattern>`
    pub excludes: Vec<String>,

    /// GNU tar `--listed-incremental` file; `None` captures without snapshot state
    pub listed_incremental: Option<PathBuf>,
}

impl CaptureSpec {
    /// Argument list for the archiver, writing the archive to stdout
    pub fn tar_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-cf".into(), "-".into()];
        if let Some(snar) = &self.listed_incremental {
            args.push("-g".into());
            args.push(snar.clone().into());
        }
        for pattern in &self.excludes {
            args.push(format!("--exclude={}", pattern).into());
        }
        args.push(self.source.clone().into());
        args
    }
}

/// Normal result of a pipeline run
#[derive(Debug)]
pub enum PipelineOutcome {
    Success(ArchiveStats),
    /// The archive could not be produced; the output file must not be trusted
    Failed(String),
}

/// Unexpected pipeline errors; these abort the whole run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline cancelled")]
    Cancelled,

    #[error("pipeline stage did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("pipeline plumbing failed: {0}")]
    Plumbing(String),
}

/// Completion state of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
enum StageStatus {
    Clean,
    /// Finished but reported a non-fatal problem (tar exit 1: files changed while read)
    Warning(String),
    /// Killed by SIGPIPE because the reader went away
    BrokenPipe,
    Failed(String),
}

enum Downstream {
    Compressor(Child),
    Writer(JoinHandle<std::io::Result<u64>>),
}

/// Runs capture-then-compress pipelines
#[derive(Debug, Clone)]
pub struct ArchivePipeline {
    tools: Tools,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ArchivePipeline {
    pub fn new(tools: Tools) -> Self {
        Self {
            tools,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Kill both stages and report failure after `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Capture `spec.source` into `output`, compressing with `compression`.
    ///
    /// Creates or truncates `output`. Nothing is cleaned up on failure.
    pub async fn run(
        &self,
        spec: &CaptureSpec,
        compression: Compression,
        output: &Path,
    ) -> Result<PipelineOutcome, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let started = Instant::now();

        if let Err(e) = std::fs::symlink_metadata(&spec.source) {
            return Ok(PipelineOutcome::Failed(format!(
                "source {} is not accessible: {}",
                spec.source.display(),
                e
            )));
        }

        let file = match std::fs::File::create(output) {
            Ok(file) => file,
            Err(e) => {
                return Ok(PipelineOutcome::Failed(format!(
                    "cannot create archive {}: {}",
                    output.display(),
                    e
                )))
            }
        };

        let tar_args = spec.tar_args();
        debug!("Spawning {} {:?}", self.tools.tar.display(), tar_args);
        let mut capture = match Command::new(&self.tools.tar)
            .args(&tar_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return Ok(PipelineOutcome::Failed(format!(
                    "failed to spawn {}: {}",
                    self.tools.tar.display(),
                    e
                )))
            }
        };

        let stream = capture
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Plumbing("capture stdout was not piped".into()))?;

        let downstream = match compression.program(&self.tools) {
            Some(program) => {
                let stdin: Stdio = stream.try_into().map_err(|e: std::io::Error| {
                    PipelineError::Plumbing(format!("cannot hand capture stream to compressor: {}", e))
                })?;
                match Command::new(program)
                    .stdin(stdin)
                    .stdout(Stdio::from(file))
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                {
                    Ok(child) => Downstream::Compressor(child),
                    Err(e) => {
                        return Ok(PipelineOutcome::Failed(format!(
                            "failed to spawn {}: {}",
                            program.display(),
                            e
                        )))
                    }
                }
            }
            None => Downstream::Writer(tokio::spawn(write_stream(
                stream,
                tokio::fs::File::from_std(file),
                compression,
            ))),
        };

        let joined = join_stages(capture, downstream);
        let finished = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = bounded(self.timeout, joined) => result,
        };

        let (capture_status, downstream_status) = match finished {
            Some(result) => result?,
            None => {
                return Ok(PipelineOutcome::Failed(format!(
                    "pipeline timed out after {}",
                    stats::format_duration(self.timeout.map(|t| t.as_secs()).unwrap_or(0))
                )))
            }
        };

        match settle(capture_status, downstream_status, compression.is_compressed()) {
            Ok(warning) => {
                if let Some(warning) = warning {
                    warn!(
                        "Archiver reported a warning for {}: {}",
                        spec.source.display(),
                        warning
                    );
                }
                let bytes = tokio::fs::metadata(output)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                Ok(PipelineOutcome::Success(ArchiveStats {
                    bytes,
                    elapsed: started.elapsed(),
                }))
            }
            Err(reason) => Ok(PipelineOutcome::Failed(reason)),
        }
    }
}

async fn bounded<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Wait for both stages; a dropped future kills whatever is still running
async fn join_stages(
    capture: Child,
    downstream: Downstream,
) -> Result<(StageStatus, StageStatus), PipelineError> {
    match downstream {
        Downstream::Compressor(child) => {
            let (captured, compressed) =
                tokio::join!(capture.wait_with_output(), child.wait_with_output());
            Ok((capture_status(captured), compressor_status(compressed)))
        }
        Downstream::Writer(handle) => {
            let (captured, written) = tokio::join!(capture.wait_with_output(), handle);
            let written = written?;
            let status = match written {
                Ok(_) => StageStatus::Clean,
                Err(e) => StageStatus::Failed(format!("writing archive failed: {}", e)),
            };
            Ok((capture_status(captured), status))
        }
    }
}

/// Copy the capture stream into the archive file, zstd-encoding if asked
async fn write_stream(
    mut stream: ChildStdout,
    file: tokio::fs::File,
    compression: Compression,
) -> std::io::Result<u64> {
    match compression {
        Compression::Zstd => {
            let mut encoder = ZstdEncoder::new(file);
            let copied = tokio::io::copy(&mut stream, &mut encoder).await?;
            encoder.shutdown().await?;
            Ok(copied)
        }
        _ => {
            let mut file = file;
            let copied = tokio::io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
            Ok(copied)
        }
    }
}

fn capture_status(result: std::io::Result<Output>) -> StageStatus {
    let output = match result {
        Ok(output) => output,
        Err(e) => return StageStatus::Failed(format!("waiting for archiver failed: {}", e)),
    };
    let stderr = stderr_tail(&output.stderr);

    if output.status.success() {
        return StageStatus::Clean;
    }
    if output.status.code() == Some(1) {
        return StageStatus::Warning(stderr);
    }
    if killed_by(&output.status, SIGPIPE) {
        return StageStatus::BrokenPipe;
    }
    StageStatus::Failed(format!("archiver exited with {}: {}", output.status, stderr))
}

fn compressor_status(result: std::io::Result<Output>) -> StageStatus {
    match result {
        Ok(output) if output.status.success() => StageStatus::Clean,
        Ok(output) => StageStatus::Failed(format!(
            "compressor exited with {}: {}",
            output.status,
            stderr_tail(&output.stderr)
        )),
        Err(e) => StageStatus::Failed(format!("waiting for compressor failed: {}", e)),
    }
}

#[cfg(unix)]
fn killed_by(status: &std::process::ExitStatus, signal: i32) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(signal)
}

#[cfg(not(unix))]
fn killed_by(_status: &std::process::ExitStatus, _signal: i32) -> bool {
    false
}

/// Last non-empty stderr line
fn stderr_tail(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("no diagnostics")
        .to_string()
}

/// Decide the pipeline result from both stage statuses.
///
/// With a compressor the downstream status is authoritative: its failure
/// fails the pipeline, and a capture killed by a broken pipe is tolerated
/// once it finished cleanly. Without one the capture is authoritative and
/// the plain writer only has to have written everything.
fn settle(
    capture: StageStatus,
    downstream: StageStatus,
    compressed: bool,
) -> Result<Option<String>, String> {
    match downstream {
        StageStatus::Failed(reason) => return Err(reason),
        StageStatus::BrokenPipe => return Err("compression stage lost its input".into()),
        StageStatus::Clean | StageStatus::Warning(_) => {}
    }

    match capture {
        StageStatus::Clean => Ok(None),
        StageStatus::Warning(message) => Ok(Some(message)),
        StageStatus::BrokenPipe if compressed => Ok(Some("archiver hit a broken pipe".into())),
        StageStatus::BrokenPipe => Err("archiver hit a broken pipe".into()),
        StageStatus::Failed(reason) => Err(reason),
    }
}
