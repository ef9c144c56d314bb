use crate::factory::{PlatformBackend, PlatformHandle, PlatformMultiplexer};
use crate::lines::OutputLines;
use crate::running::{StdioMode, prepare_stdio};
use childproc_core::{
    ChildStdio, OutputBuffer, OutputMultiplexer, OwnedStdio, PosixSignal, ProcessBackend,
    ProcessError, ProcessExitStatus, ProcessHandle, ProcessStartOptions, Result, StreamChannel,
    StreamKind, TextEncoding, TimeoutBudget,
};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Decoded output of a finished process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub status: ProcessExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Interleaved stdout and stderr bytes of a finished process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedOutput {
    pub status: ProcessExitStatus,
    pub bytes: Vec<u8>,
}

impl CombinedOutput {
    pub fn text(&self, encoding: TextEncoding) -> Result<String> {
        encoding.decode(&self.bytes)
    }
}

/// Entry points for running a child process to completion
pub struct ChildProcess;

impl ChildProcess {
    /// Run with the caller's standard streams and wait for exit
    pub fn execute(options: &ProcessStartOptions, timeout: Option<Duration>) -> Result<ProcessExitStatus> {
        let stdio = prepare_stdio(StdioMode::Inherit)?;
        PlatformHandle::start(options, stdio.child)?.wait_for_exit(timeout)
    }

    pub async fn execute_async(
        options: &ProcessStartOptions,
        cancellation: CancellationToken,
    ) -> Result<ProcessExitStatus> {
        let stdio = prepare_stdio(StdioMode::Inherit)?;
        let mut handle = PlatformHandle::start(options, stdio.child)?;
        handle.wait_for_exit_async(cancellation).await
    }

    /// Run with every standard stream on the null device
    pub fn discard(options: &ProcessStartOptions, timeout: Option<Duration>) -> Result<ProcessExitStatus> {
        let stdio = prepare_stdio(StdioMode::Discard)?;
        PlatformHandle::start(options, stdio.child)?.wait_for_exit(timeout)
    }

    pub async fn discard_async(
        options: &ProcessStartOptions,
        cancellation: CancellationToken,
    ) -> Result<ProcessExitStatus> {
        let stdio = prepare_stdio(StdioMode::Discard)?;
        let mut handle = PlatformHandle::start(options, stdio.child)?;
        handle.wait_for_exit_async(cancellation).await
    }

    /// Run with standard streams connected to files.
    ///
    /// A missing `input` reads the null device and a missing `output` or
    /// `error` discards. Identical output and error paths share one handle.
    pub fn redirect_to_files(
        options: &ProcessStartOptions,
        input: Option<&Path>,
        output: Option<&Path>,
        error: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<ProcessExitStatus> {
        let stdin = match input {
            Some(path) => OwnedStdio::from(File::open(path)?),
            None => PlatformBackend::open_null_device()?,
        };
        let stdout = match output {
            Some(path) => Some(create_output_file(path)?),
            None => None,
        };
        let stderr = match (error, output, stdout.as_ref()) {
            (Some(error), Some(output), Some(shared)) if error == output => {
                debug!(path = %error.display(), "Sharing one file for stdout and stderr");
                shared.try_clone()?
            }
            (Some(error), _, _) => create_output_file(error)?,
            (None, _, _) => PlatformBackend::open_null_device()?,
        };
        let stdout = match stdout {
            Some(stdout) => stdout,
            None => PlatformBackend::open_null_device()?,
        };

        PlatformHandle::start(options, ChildStdio { stdin, stdout, stderr })?.wait_for_exit(timeout)
    }

    /// Run to completion capturing stdout and stderr separately
    pub fn capture_output(
        options: &ProcessStartOptions,
        encoding: TextEncoding,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput> {
        let mut stdio = prepare_stdio(StdioMode::Capture)?;
        let (Some(stdout), Some(stderr)) = (stdio.stdout.take(), stdio.stderr.take()) else {
            return Err(ProcessError::InvalidOperation("capture pipes were not created".to_string()));
        };
        let mut handle = PlatformHandle::start(options, stdio.child)?;

        let channels = vec![
            StreamChannel::new(StreamKind::Stdout, stdout),
            StreamChannel::new(StreamKind::Stderr, stderr),
        ];
        let (status, mut buffers) = collect(&mut handle, channels, timeout)?;
        let stderr = buffers.pop().unwrap_or_default();
        let stdout = buffers.pop().unwrap_or_default();

        Ok(ProcessOutput {
            status,
            stdout: stdout.decode(encoding)?,
            stderr: stderr.decode(encoding)?,
        })
    }

    /// Run to completion with stdout and stderr sharing one pipe
    pub fn capture_combined(
        options: &ProcessStartOptions,
        timeout: Option<Duration>,
    ) -> Result<CombinedOutput> {
        let mut stdio = prepare_stdio(StdioMode::Combined)?;
        let Some(read) = stdio.combined.take() else {
            return Err(ProcessError::InvalidOperation("combined pipe was not created".to_string()));
        };
        let mut handle = PlatformHandle::start(options, stdio.child)?;

        let channels = vec![StreamChannel::new(StreamKind::Combined, read)];
        let (status, buffers) = collect(&mut handle, channels, timeout)?;
        let bytes = buffers
            .into_iter()
            .next()
            .map(OutputBuffer::into_bytes)
            .unwrap_or_default();
        Ok(CombinedOutput { status, bytes })
    }

    /// Lazily start the process and yield its output line by line
    pub fn stream_output_lines(options: ProcessStartOptions, timeout: Option<Duration>) -> OutputLines {
        OutputLines::new(options, timeout)
    }

    pub fn send_signal(
        handle: &mut PlatformHandle,
        signal: PosixSignal,
        entire_process_group: bool,
    ) -> Result<()> {
        handle.send_signal(signal, entire_process_group)
    }
}

fn create_output_file(path: &Path) -> Result<OwnedStdio> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    Ok(OwnedStdio::from(file))
}

/// Drain `channels`, then wait for exit inside the same budget.
///
/// Running out of time kills the process and reports it cancelled.
fn collect(
    handle: &mut PlatformHandle,
    channels: Vec<StreamChannel>,
    timeout: Option<Duration>,
) -> Result<(ProcessExitStatus, Vec<OutputBuffer>)> {
    let budget = TimeoutBudget::new(timeout);
    let mut multiplexer = PlatformMultiplexer::new(channels)?;

    let status = match multiplexer.drain(handle, &budget) {
        Ok(_) => match handle.try_get_exit_status()? {
            Some(status) => status,
            // Every stream hit EOF but the process has not exited yet
            None => handle.wait_for_exit(budget.remaining_timeout())?,
        },
        Err(ProcessError::Timeout(_)) => {
            warn!(timeout = ?timeout, "Output capture timed out, killing process");
            handle.kill(false)?;
            handle.wait_for_exit(None)?.into_cancelled()
        }
        Err(e) => {
            handle.kill(false)?;
            return Err(e);
        }
    };

    let buffers = multiplexer
        .into_channels()
        .into_iter()
        .map(StreamChannel::into_buffer)
        .collect();
    Ok((status, buffers))
}
