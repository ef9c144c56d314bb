use crate::buffer::StreamChannel;
use crate::config::ProcessStartOptions;
use crate::error::Result;
use crate::status::{PosixSignal, ProcessExitStatus};
use crate::timeout::TimeoutBudget;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Native descriptor type accepted in [`ProcessStartOptions::inherited_handles`]
#[cfg(unix)]
pub type RawNativeHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawNativeHandle = isize;

/// Owned native descriptor used for the child's standard streams
#[cfg(unix)]
pub type OwnedStdio = std::os::fd::OwnedFd;
#[cfg(windows)]
pub type OwnedStdio = std::os::windows::io::OwnedHandle;

/// The three descriptors a child receives as stdin, stdout and stderr.
///
/// Start consumes this value: the parent's copies are closed as soon as the
/// child has its own, so pipe readers observe EOF when the child exits.
#[derive(Debug)]
pub struct ChildStdio {
    pub stdin: OwnedStdio,
    pub stdout: OwnedStdio,
    pub stderr: OwnedStdio,
}

/// Handle to one child process and its native identity.
///
/// Every operation other than [`release`](ProcessHandle::release) fails with
/// `InvalidHandle` after the identity has been released. The exit status is
/// reaped in exactly one place inside the handle and cached from then on.
#[async_trait]
pub trait ProcessHandle: Send + Sync + Sized {
    /// Spawn the child described by `options` with the given stdio
    fn start(options: &ProcessStartOptions, stdio: ChildStdio) -> Result<Self>;

    fn process_id(&self) -> Result<ProcessId>;

    /// Non-blocking probe; `Ok(None)` while the process is still running
    fn try_get_exit_status(&mut self) -> Result<Option<ProcessExitStatus>>;

    /// Block until the process exits.
    ///
    /// When `timeout` elapses first the process is killed and the returned
    /// status has `cancelled` set.
    fn wait_for_exit(&mut self, timeout: Option<Duration>) -> Result<ProcessExitStatus>;

    /// Wait for exit without blocking the runtime thread.
    ///
    /// Cancelling the token kills the process; the returned status has
    /// `cancelled` set.
    async fn wait_for_exit_async(
        &mut self,
        cancellation: CancellationToken,
    ) -> Result<ProcessExitStatus>;

    /// Deliver `signal` to the process, or to its whole process group
    fn send_signal(&mut self, signal: PosixSignal, entire_process_group: bool) -> Result<()>;

    /// Deliver a signal given by its native number
    fn send_raw_signal(&mut self, raw_signal: i32, entire_process_group: bool) -> Result<()> {
        let signal = PosixSignal::from_raw(raw_signal)?;
        self.send_signal(signal, entire_process_group)
    }

    /// Force termination. Succeeds if the process already exited.
    ///
    /// With `throw_on_error == false` failures are logged and swallowed.
    fn kill(&mut self, throw_on_error: bool) -> Result<()>;

    /// Let a process started with `create_suspended` run
    fn resume(&mut self) -> Result<()>;

    /// Close the native identity; later calls are no-ops
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

/// Progress of one multiplexer round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Some channel is still open; call `pump` again
    Pending,
    /// Every channel reached EOF
    Completed,
    /// The process exited while a channel stayed open (an orphaned
    /// descendant holds the write end); captured bytes are final
    ProcessExited,
}

/// How [`OutputMultiplexer::drain`] finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed,
    ProcessExited,
}

/// Drains one or two child output channels without letting either block the other
pub trait OutputMultiplexer: Sized {
    type Handle: ProcessHandle;

    fn new(channels: Vec<StreamChannel>) -> Result<Self>;

    /// Wait for readiness once (bounded by `budget`) and read what is available.
    ///
    /// Fails with `Timeout` when the budget runs out; killing the process is
    /// left to the caller.
    fn pump(&mut self, handle: &mut Self::Handle, budget: &TimeoutBudget) -> Result<PumpState>;

    /// Pump until every channel is closed or the process is seen to exit
    fn drain(&mut self, handle: &mut Self::Handle, budget: &TimeoutBudget) -> Result<DrainOutcome> {
        loop {
            match self.pump(handle, budget)? {
                PumpState::Pending => continue,
                PumpState::Completed => return Ok(DrainOutcome::Completed),
                PumpState::ProcessExited => return Ok(DrainOutcome::ProcessExited),
            }
        }
    }

    fn channels(&self) -> &[StreamChannel];

    fn channels_mut(&mut self) -> &mut [StreamChannel];

    /// Stop reading and hand back the channels with their buffers
    fn into_channels(self) -> Vec<StreamChannel>;
}

/// One platform's process backend: its handle, multiplexer and stdio plumbing
pub trait ProcessBackend {
    type Handle: ProcessHandle;
    type Multiplexer: OutputMultiplexer<Handle = Self::Handle>;

    /// Platform name for logging and debugging
    fn platform_name() -> &'static str;

    /// Connected `(read, write)` pair; neither end is inheritable.
    ///
    /// `async_read` asks for a read end the multiplexer can drain; pass
    /// `false` for read ends handed to callers as plain files.
    fn create_pipe(async_read: bool) -> Result<(OwnedStdio, OwnedStdio)>;

    /// The platform null device, opened for reading and writing
    fn open_null_device() -> Result<OwnedStdio>;

    /// Copies of the caller's own standard streams, or the null device where
    /// the caller has none
    fn inherited_stdio() -> Result<ChildStdio>;
}
