//! # External Process Runner
//!
//! Narrow synchronous interface used by every component that shells out to an
//! external engine (`piper`, `ffmpeg`). Keeping process spawning behind the
//! `ProcessRunner` trait lets the executors be tested without real binaries.
//!
//! ## Key Pieces:
//! - **Invocation**: program, arguments, stdin bytes and a hard timeout
//! - **ProcessOutput**: exit status plus captured stdout/stderr
//! - **SystemProcessRunner**: the real implementation on top of `std::process`
//! - **scratch_file**: per-request temporary paths that delete themselves on drop

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempPath;
use thiserror::Error;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors raised while running an external process.
///
/// A non-zero exit status is *not* an error at this level; callers inspect
/// `ProcessOutput::success` and decide how to report it.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' did not finish within {}s and was killed", .timeout.as_secs_f64())]
    TimedOut { program: String, timeout: Duration },

    #[error("i/o error while talking to '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A single external command to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Arguments as lossy strings, handy for logging and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub status_code: Option<i32>,
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Human-readable failure text: stderr first, then stdout, then `fallback`.
    pub fn diagnostic(&self, fallback: &str) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            return stderr.trim().to_string();
        }
        let stdout = String::from_utf8_lossy(&self.stdout);
        if !stdout.trim().is_empty() {
            return stdout.trim().to_string();
        }
        fallback.to_string()
    }
}

/// Synchronous process execution. Implementations block the calling thread.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands with `std::process::Command`, killing them on timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, ProcessError> {
        let program = invocation.program_name();
        let started = Instant::now();

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;

        // stdin/stdout/stderr are serviced on their own threads so a chatty
        // child can never deadlock against a full pipe.
        let stdin_writer = match (child.stdin.take(), invocation.stdin.clone()) {
            (Some(mut pipe), Some(bytes)) => Some(thread::spawn(move || {
                let result = pipe.write_all(&bytes);
                drop(pipe);
                result
            })),
            _ => None,
        };
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let status = wait_with_deadline(&mut child, invocation.timeout, &program)?;

        if let Some(writer) = stdin_writer {
            if let Ok(Err(e)) = writer.join() {
                // A child that exits without reading all of stdin closes the pipe early.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ProcessError::Io { program, source: e });
                }
            }
        }
        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        tracing::debug!(
            program = %program,
            status = ?status.code(),
            elapsed_ms = %started.elapsed().as_millis(),
            "External process finished"
        );

        Ok(ProcessOutput {
            status_code: status.code(),
            success: status.success(),
            stdout,
            stderr,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    program: &str,
) -> Result<std::process::ExitStatus, ProcessError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                tracing::warn!(program = %program, timeout_s = timeout.as_secs_f64(), "Killing external process after timeout");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::TimedOut {
                    program: program.to_string(),
                    timeout,
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                let _ = child.kill();
                return Err(ProcessError::Io {
                    program: program.to_string(),
                    source,
                });
            }
        }
    }
}

/// Resolve an executable name (or path) through `PATH`.
pub fn locate_binary(name: &str) -> Option<PathBuf> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    which::which(name).ok()
}

/// Reserve a unique scratch path in `dir` ending with `suffix`.
///
/// The file is created empty; the returned `TempPath` removes it when dropped,
/// whichever way the caller exits.
pub fn scratch_file(dir: &Path, suffix: &str) -> std::io::Result<TempPath> {
    std::fs::create_dir_all(dir)?;
    let file = tempfile::Builder::new()
        .prefix("speech-")
        .suffix(suffix)
        .tempfile_in(dir)?;
    Ok(file.into_temp_path())
}
