use crate::exit_watch::{self, ExitWatch};
use crate::identity::ProcessIdentity;
use crate::spawn::{self, exec_failure, read_handshake};
use async_trait::async_trait;
use childproc_core::{
    ChildStdio, PosixSignal, ProcessError, ProcessExitStatus, ProcessHandle, ProcessId,
    ProcessStartOptions, Remaining, Result, TimeoutBudget,
};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the reap point is probed when the exit pipe cannot be trusted
const REAP_PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Unix-specific process handle implementation
#[derive(Debug)]
pub struct UnixProcessHandle {
    identity: Option<ProcessIdentity>,
    pid: Pid,
    file_name: String,
    status: Option<ProcessExitStatus>,
    /// Exec handshake of a child that is stopped before exec
    pending_exec: Option<OwnedFd>,
    exit_pipe_closed: bool,
}

impl UnixProcessHandle {
    pub(crate) fn identity(&self) -> Result<&ProcessIdentity> {
        self.identity.as_ref().ok_or(ProcessError::InvalidHandle)
    }

    fn process_error(&self, errno: Errno) -> ProcessError {
        match errno {
            Errno::ESRCH => ProcessError::NoSuchProcess(self.pid.as_raw() as u32),
            other => ProcessError::Io(std::io::Error::from(other)),
        }
    }

    /// The only place the child is waited for. Once observed, the status is
    /// cached and every later call returns it.
    pub(crate) fn reap(&mut self, block: bool) -> Result<Option<ProcessExitStatus>> {
        let pid = self.identity()?.pid();
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let flags = if block { None } else { Some(WaitPidFlag::WNOHANG) };
        loop {
            let status = match waitpid(pid, flags) {
                Ok(WaitStatus::Exited(_, code)) => ProcessExitStatus::exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => ProcessExitStatus::signaled(signal as i32),
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(_) if !block => return Ok(None),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!(pid = %pid, "Child was reaped outside of its handle");
                    return Err(self.process_error(Errno::ESRCH));
                }
                Err(e) => return Err(std::io::Error::from(e).into()),
            };
            info!(pid = %pid, status = %status, "Process exited");
            self.status = Some(status);
            return Ok(Some(status));
        }
    }

    /// Wait until the child exits or the budget runs out (`Ok(None)`)
    fn wait_until(&mut self, budget: &TimeoutBudget) -> Result<Option<ProcessExitStatus>> {
        loop {
            if let Some(status) = self.reap(false)? {
                return Ok(Some(status));
            }
            let remaining = match budget.remaining() {
                Remaining::Expired => return Ok(None),
                Remaining::Unbounded => None,
                Remaining::Left(left) => Some(left),
            };

            let identity = self.identity()?;
            if exit_watch::is_exact(identity) {
                if exit_watch::wait_blocking(identity, remaining)? {
                    return self.reap(true);
                }
            } else if self.exit_pipe_closed {
                std::thread::sleep(budget.remaining_capped(REAP_PROBE_INTERVAL));
            } else if exit_watch::wait_blocking(
                identity,
                Some(budget.remaining_capped(REAP_PROBE_INTERVAL)),
            )? {
                self.exit_pipe_closed = true;
            }
        }
    }

    /// Send SIGKILL after an abandoned wait; `true` when it was delivered
    fn kill_for_cancel(&mut self) -> bool {
        match self.kill_process() {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(pid = %self.pid, "Failed to kill process: {e}");
                false
            }
        }
    }

    /// Record the final status, flagged as cancelled only when our SIGKILL
    /// is what ended the process
    fn finish_cancelled(&mut self, status: ProcessExitStatus, delivered: bool) -> ProcessExitStatus {
        let status = if delivered && status.signal == Some(PosixSignal::SIGKILL) {
            status.into_cancelled()
        } else {
            status
        };
        self.status = Some(status);
        status
    }

    fn kill_cancelled(&mut self) -> Result<ProcessExitStatus> {
        let delivered = self.kill_for_cancel();
        let status = self.reap(true)?.ok_or(ProcessError::InvalidHandle)?;
        Ok(self.finish_cancelled(status, delivered))
    }

    /// `true` when SIGKILL was delivered to a live process
    fn kill_process(&mut self) -> Result<bool> {
        if self.reap(false)?.is_some() {
            debug!(pid = %self.pid, "Process already exited, nothing to kill");
            return Ok(false);
        }
        self.pending_exec = None;
        match self.identity()?.signal(PosixSignal::SIGKILL, false) {
            Ok(()) => {
                info!(pid = %self.pid, "Sent SIGKILL to process");
                Ok(true)
            }
            Err(Errno::ESRCH) => {
                debug!(pid = %self.pid, "Process not found (already terminated)");
                Ok(false)
            }
            Err(e) => Err(self.process_error(e)),
        }
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn start(options: &ProcessStartOptions, stdio: ChildStdio) -> Result<Self> {
        let spawned = spawn::spawn(options, stdio)?;
        Ok(Self {
            pid: spawned.identity.pid(),
            identity: Some(spawned.identity),
            file_name: options.file_name.clone(),
            status: None,
            pending_exec: spawned.pending_exec,
            exit_pipe_closed: false,
        })
    }

    fn process_id(&self) -> Result<ProcessId> {
        self.identity()?;
        Ok(self.pid.as_raw() as ProcessId)
    }

    fn try_get_exit_status(&mut self) -> Result<Option<ProcessExitStatus>> {
        self.reap(false)
    }

    fn wait_for_exit(&mut self, timeout: Option<Duration>) -> Result<ProcessExitStatus> {
        let budget = TimeoutBudget::new(timeout);
        match self.wait_until(&budget)? {
            Some(status) => Ok(status),
            None => {
                warn!(pid = %self.pid, timeout = ?timeout, "Timed out waiting for exit, killing process");
                self.kill_cancelled()
            }
        }
    }

    async fn wait_for_exit_async(
        &mut self,
        cancellation: CancellationToken,
    ) -> Result<ProcessExitStatus> {
        if let Some(status) = self.reap(false)? {
            return Ok(status);
        }

        let watch = ExitWatch::new(self.identity()?)?;
        let mut exit_hinted = false;
        loop {
            let cancelled = tokio::select! {
                biased;
                _ = cancellation.cancelled() => true,
                exited = watch.exited(), if !exit_hinted => {
                    exited?;
                    exit_hinted = true;
                    false
                }
                _ = tokio::time::sleep(REAP_PROBE_INTERVAL), if exit_hinted => false,
            };

            if cancelled {
                drop(watch);
                info!(pid = %self.pid, "Wait cancelled, killing process");
                let delivered = self.kill_for_cancel();
                loop {
                    if let Some(status) = self.reap(false)? {
                        return Ok(self.finish_cancelled(status, delivered));
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }

            if let Some(status) = self.reap(false)? {
                return Ok(status);
            }
        }
    }

    fn send_signal(&mut self, signal: PosixSignal, entire_process_group: bool) -> Result<()> {
        self.identity()?;
        // A process group can outlive its leader, so only single-process
        // delivery checks for an exited target.
        if !entire_process_group && self.reap(false)?.is_some() {
            return Err(self.process_error(Errno::ESRCH));
        }

        match self.identity()?.signal(signal, entire_process_group) {
            Ok(()) => {
                info!(
                    pid = %self.pid,
                    signal = %signal,
                    entire_process_group,
                    "Sent signal"
                );
                Ok(())
            }
            Err(e) => {
                warn!(pid = %self.pid, signal = %signal, "Failed to send signal: {e}");
                Err(self.process_error(e))
            }
        }
    }

    fn kill(&mut self, throw_on_error: bool) -> Result<()> {
        match self.kill_process() {
            Ok(_) => Ok(()),
            Err(e) if throw_on_error => Err(e),
            Err(e) => {
                warn!(pid = %self.pid, "Failed to kill process: {e}");
                Ok(())
            }
        }
    }

    fn resume(&mut self) -> Result<()> {
        self.identity()?;
        let Some(handshake) = self.pending_exec.take() else {
            return Err(ProcessError::InvalidOperation(
                "process was not started suspended".to_string(),
            ));
        };

        if let Err(e) = self.identity()?.signal(PosixSignal::SIGCONT, false) {
            return Err(self.process_error(e));
        }

        match read_handshake(handshake.as_fd())? {
            None => {
                info!(pid = %self.pid, "Resumed process");
                Ok(())
            }
            Some(errno) => {
                self.reap(true)?;
                Err(exec_failure(&self.file_name, errno))
            }
        }
    }

    fn release(&mut self) {
        if let Some(identity) = self.identity.take() {
            self.pending_exec = None;
            debug!(pid = %identity.pid(), "Released process identity");
        }
    }

    fn is_released(&self) -> bool {
        self.identity.is_none()
    }
}

impl Drop for UnixProcessHandle {
    fn drop(&mut self) {
        self.release();
    }
}
