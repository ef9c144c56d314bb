use crate::factory::{PlatformBackend, PlatformHandle, PlatformMultiplexer};
use childproc_core::{
    ChildStdio, OutputMultiplexer, OwnedStdio, PosixSignal, ProcessBackend, ProcessError,
    ProcessExitStatus, ProcessHandle, ProcessId, ProcessStartOptions, Result, StreamChannel,
    StreamKind, TimeoutBudget,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where a child's standard streams are connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// The caller's own standard streams
    #[default]
    Inherit,
    /// The null device for all three streams
    Discard,
    /// Separate stdout and stderr pipes; stdin reads the null device
    Capture,
    /// One pipe serving as both stdout and stderr; stdin reads the null device
    Combined,
}

/// Child stdio plus the parent's read ends
pub(crate) struct PreparedStdio {
    pub(crate) child: ChildStdio,
    pub(crate) stdout: Option<OwnedStdio>,
    pub(crate) stderr: Option<OwnedStdio>,
    pub(crate) combined: Option<OwnedStdio>,
}

pub(crate) fn prepare_stdio(mode: StdioMode) -> Result<PreparedStdio> {
    let prepared = match mode {
        StdioMode::Inherit => PreparedStdio {
            child: PlatformBackend::inherited_stdio()?,
            stdout: None,
            stderr: None,
            combined: None,
        },
        StdioMode::Discard => PreparedStdio {
            child: ChildStdio {
                stdin: PlatformBackend::open_null_device()?,
                stdout: PlatformBackend::open_null_device()?,
                stderr: PlatformBackend::open_null_device()?,
            },
            stdout: None,
            stderr: None,
            combined: None,
        },
        StdioMode::Capture => {
            let (stdout_read, stdout_write) = PlatformBackend::create_pipe(true)?;
            let (stderr_read, stderr_write) = PlatformBackend::create_pipe(true)?;
            PreparedStdio {
                child: ChildStdio {
                    stdin: PlatformBackend::open_null_device()?,
                    stdout: stdout_write,
                    stderr: stderr_write,
                },
                stdout: Some(stdout_read),
                stderr: Some(stderr_read),
                combined: None,
            }
        }
        StdioMode::Combined => {
            let (read, write) = PlatformBackend::create_pipe(true)?;
            PreparedStdio {
                child: ChildStdio {
                    stdin: PlatformBackend::open_null_device()?,
                    stdout: write.try_clone()?,
                    stderr: write,
                },
                stdout: None,
                stderr: None,
                combined: Some(read),
            }
        }
    };
    Ok(prepared)
}

/// A started child together with the read ends of any captured streams
#[derive(Debug)]
pub struct RunningProcess {
    handle: PlatformHandle,
    stdout: Option<OwnedStdio>,
    stderr: Option<OwnedStdio>,
    combined: Option<OwnedStdio>,
}

impl RunningProcess {
    pub fn start(options: &ProcessStartOptions, mode: StdioMode) -> Result<Self> {
        let stdio = prepare_stdio(mode)?;
        let handle = PlatformHandle::start(options, stdio.child)?;
        Ok(Self {
            handle,
            stdout: stdio.stdout,
            stderr: stdio.stderr,
            combined: stdio.combined,
        })
    }

    pub fn handle(&self) -> &PlatformHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut PlatformHandle {
        &mut self.handle
    }

    pub fn process_id(&self) -> Result<ProcessId> {
        self.handle.process_id()
    }

    /// Read end of the stdout pipe, for `StdioMode::Capture`
    pub fn take_stdout(&mut self) -> Option<OwnedStdio> {
        self.stdout.take()
    }

    /// Read end of the stderr pipe, for `StdioMode::Capture`
    pub fn take_stderr(&mut self) -> Option<OwnedStdio> {
        self.stderr.take()
    }

    /// Read the combined stream until EOF or until the process exits.
    ///
    /// Expiry of `timeout` surfaces as `Timeout`; the process keeps running
    /// and stopping it is up to the caller.
    pub fn read_combined(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let Some(read) = self.combined.take() else {
            return Err(ProcessError::InvalidOperation(
                "process was not started with a combined output stream".to_string(),
            ));
        };
        let mut multiplexer =
            PlatformMultiplexer::new(vec![StreamChannel::new(StreamKind::Combined, read)])?;
        multiplexer.drain(&mut self.handle, &TimeoutBudget::new(timeout))?;
        let channel = multiplexer.into_channels().into_iter().next();
        Ok(channel
            .map(|channel| channel.into_buffer().into_bytes())
            .unwrap_or_default())
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<ProcessExitStatus> {
        self.handle.wait_for_exit(timeout)
    }

    pub async fn wait_async(&mut self, cancellation: CancellationToken) -> Result<ProcessExitStatus> {
        self.handle.wait_for_exit_async(cancellation).await
    }

    pub fn send_signal(&mut self, signal: PosixSignal, entire_process_group: bool) -> Result<()> {
        self.handle.send_signal(signal, entire_process_group)
    }

    pub fn kill(&mut self) -> Result<()> {
        self.handle.kill(true)
    }

    pub fn resume(&mut self) -> Result<()> {
        self.handle.resume()
    }

    pub fn into_handle(self) -> PlatformHandle {
        self.handle
    }
}
