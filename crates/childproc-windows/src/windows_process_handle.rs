use crate::spawn::{self, resume_thread};
use async_trait::async_trait;
use childproc_core::{
    ChildStdio, KILLED_EXIT_CODE, PosixSignal, ProcessError, ProcessExitStatus, ProcessHandle,
    ProcessId, ProcessStartOptions, Result, TimeoutBudget,
};
use std::ffi::c_void;
use std::os::windows::io::{AsHandle, AsRawHandle, BorrowedHandle, OwnedHandle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use windows::Win32::Foundation::{
    BOOLEAN, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, INFINITE, RegisterWaitForSingleObject, TerminateProcess,
    UnregisterWaitEx, WT_EXECUTEONLYONCE, WaitForSingleObject,
};

type ExitSignal = Mutex<Option<oneshot::Sender<()>>>;

/// Wait callback registered with the thread pool; fires once when the process exits
unsafe extern "system" fn on_process_exit(context: *mut c_void, _timed_out: BOOLEAN) {
    let slot = unsafe { &*(context as *const ExitSignal) };
    if let Some(sender) = slot.lock().ok().and_then(|mut slot| slot.take()) {
        let _ = sender.send(());
    }
}

/// A registered thread-pool wait, unregistered when dropped
struct ExitWait {
    wait: HANDLE,
    context: *const ExitSignal,
}

// SAFETY: the wait handle and the context pointer are only used to unregister
// the wait and to release the context, both of which are valid from any thread.
unsafe impl Send for ExitWait {}

impl ExitWait {
    fn register(process: BorrowedHandle<'_>) -> Result<(Self, oneshot::Receiver<()>)> {
        let (sender, receiver) = oneshot::channel();
        let context = Arc::into_raw(Arc::new(Mutex::new(Some(sender))));
        let mut wait = HANDLE::default();
        let registered = unsafe {
            RegisterWaitForSingleObject(
                &mut wait,
                HANDLE(process.as_raw_handle()),
                Some(on_process_exit),
                Some(context as *const c_void),
                INFINITE,
                WT_EXECUTEONLYONCE,
            )
        };
        if let Err(e) = registered {
            unsafe { drop(Arc::from_raw(context)) };
            return Err(std::io::Error::from(e).into());
        }
        Ok((Self { wait, context }, receiver))
    }
}

impl Drop for ExitWait {
    fn drop(&mut self) {
        unsafe {
            // Blocks until a running callback has returned
            if let Err(e) = UnregisterWaitEx(self.wait, Some(INVALID_HANDLE_VALUE)) {
                debug!("Failed to unregister exit wait: {e}");
            }
            drop(Arc::from_raw(self.context));
        }
    }
}

/// Windows-specific process handle implementation
#[derive(Debug)]
pub struct WindowsProcessHandle {
    process: Option<OwnedHandle>,
    /// Primary thread of a child started suspended
    thread: Option<OwnedHandle>,
    pid: u32,
    status: Option<ProcessExitStatus>,
}

impl WindowsProcessHandle {
    pub(crate) fn process(&self) -> Result<BorrowedHandle<'_>> {
        self.process
            .as_ref()
            .map(AsHandle::as_handle)
            .ok_or(ProcessError::InvalidHandle)
    }

    /// The only place the exit code is collected; cached once observed
    pub(crate) fn observe(&mut self, timeout_ms: u32) -> Result<Option<ProcessExitStatus>> {
        let process = HANDLE(self.process()?.as_raw_handle());
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let event = unsafe { WaitForSingleObject(process, timeout_ms) };
        if event == WAIT_TIMEOUT {
            return Ok(None);
        }
        if event != WAIT_OBJECT_0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut code = 0u32;
        unsafe { GetExitCodeProcess(process, &mut code) }.map_err(std::io::Error::from)?;
        let status = ProcessExitStatus::exited(code as i32);
        info!(pid = %self.pid, status = %status, "Process exited");
        self.status = Some(status);
        Ok(Some(status))
    }

    /// Kill after an abandoned wait. The status is reported as cancelled only
    /// when this kill is what ended the process.
    fn kill_cancelled(&mut self) -> Result<ProcessExitStatus> {
        let terminated = match self.terminate() {
            Ok(terminated) => terminated,
            Err(e) => {
                warn!(pid = %self.pid, "Failed to kill process: {e}");
                false
            }
        };
        let status = self.observe(INFINITE)?.ok_or(ProcessError::InvalidHandle)?;
        let status = if terminated && status.exit_code == KILLED_EXIT_CODE {
            status.into_cancelled()
        } else {
            status
        };
        self.status = Some(status);
        Ok(status)
    }

    /// `true` when `TerminateProcess` was delivered to a running process
    fn terminate(&mut self) -> Result<bool> {
        if self.observe(0)?.is_some() {
            debug!(pid = %self.pid, "Process already exited, nothing to kill");
            return Ok(false);
        }
        let process = HANDLE(self.process()?.as_raw_handle());
        match unsafe { TerminateProcess(process, KILLED_EXIT_CODE as u32) } {
            Ok(()) => {
                info!(pid = %self.pid, "Terminated process");
                Ok(true)
            }
            // Access is denied once the process is already terminating
            Err(e) => match self.observe(0)? {
                Some(_) => Ok(false),
                None => Err(std::io::Error::from(e).into()),
            },
        }
    }
}

fn millis(budget: &TimeoutBudget) -> u32 {
    match budget.remaining_millis() {
        None => INFINITE,
        Some(ms) => ms.min(u64::from(INFINITE - 1)) as u32,
    }
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
    fn start(options: &ProcessStartOptions, stdio: ChildStdio) -> Result<Self> {
        let spawned = spawn::spawn(options, stdio)?;
        Ok(Self {
            process: Some(spawned.process),
            thread: spawned.thread,
            pid: spawned.pid,
            status: None,
        })
    }

    fn process_id(&self) -> Result<ProcessId> {
        self.process()?;
        Ok(self.pid)
    }

    fn try_get_exit_status(&mut self) -> Result<Option<ProcessExitStatus>> {
        self.observe(0)
    }

    fn wait_for_exit(&mut self, timeout: Option<Duration>) -> Result<ProcessExitStatus> {
        let budget = TimeoutBudget::new(timeout);
        loop {
            if let Some(status) = self.observe(millis(&budget))? {
                return Ok(status);
            }
            if budget.is_expired() {
                warn!(pid = %self.pid, timeout = ?timeout, "Timed out waiting for exit, killing process");
                return self.kill_cancelled();
            }
        }
    }

    async fn wait_for_exit_async(
        &mut self,
        cancellation: CancellationToken,
    ) -> Result<ProcessExitStatus> {
        if let Some(status) = self.observe(0)? {
            return Ok(status);
        }

        let (registration, exited) = ExitWait::register(self.process()?)?;
        let cancelled = tokio::select! {
            biased;
            _ = cancellation.cancelled() => true,
            _ = exited => false,
        };
        drop(registration);

        if cancelled {
            info!(pid = %self.pid, "Wait cancelled, killing process");
            return self.kill_cancelled();
        }
        self.observe(INFINITE)?.ok_or(ProcessError::InvalidHandle)
    }

    fn send_signal(&mut self, signal: PosixSignal, _entire_process_group: bool) -> Result<()> {
        self.process()?;
        if signal != PosixSignal::SIGKILL {
            return Err(ProcessError::PlatformNotSupported(
                "only SIGKILL can be delivered on Windows",
            ));
        }
        if self.observe(0)?.is_some() {
            return Err(ProcessError::NoSuchProcess(self.pid));
        }
        self.kill(true)
    }

    fn kill(&mut self, throw_on_error: bool) -> Result<()> {
        match self.terminate() {
            Ok(_) => Ok(()),
            Err(e) if throw_on_error => Err(e),
            Err(e) => {
                warn!(pid = %self.pid, "Failed to kill process: {e}");
                Ok(())
            }
        }
    }

    fn resume(&mut self) -> Result<()> {
        self.process()?;
        let Some(thread) = self.thread.take() else {
            return Err(ProcessError::InvalidOperation(
                "process was not started suspended".to_string(),
            ));
        };
        resume_thread(thread.as_handle())?;
        info!(pid = %self.pid, "Resumed process");
        Ok(())
    }

    fn release(&mut self) {
        if self.process.take().is_some() {
            self.thread = None;
            debug!(pid = %self.pid, "Released process handle");
        }
    }

    fn is_released(&self) -> bool {
        self.process.is_none()
    }
}

impl Drop for WindowsProcessHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::open_null_device;

    fn null_stdio() -> ChildStdio {
        ChildStdio {
            stdin: open_null_device().unwrap(),
            stdout: open_null_device().unwrap(),
            stderr: open_null_device().unwrap(),
        }
    }

    fn cmd(script: &str) -> ProcessStartOptions {
        ProcessStartOptions::builder()
            .file_name("cmd.exe")
            .args(["/c", script])
            .build()
            .unwrap()
    }

    #[test]
    fn test_wait_for_exit_code() {
        let mut handle = WindowsProcessHandle::start(&cmd("exit 42"), null_stdio()).unwrap();
        assert!(handle.process_id().unwrap() > 0);
        assert_eq!(handle.wait_for_exit(None).unwrap().exit_code, 42);
    }

    #[test]
    fn test_timeout_kills_with_killed_exit_code() {
        let mut handle =
            WindowsProcessHandle::start(&cmd("ping -n 30 127.0.0.1"), null_stdio()).unwrap();
        let status = handle
            .wait_for_exit(Some(Duration::from_millis(100)))
            .unwrap();
        assert!(status.cancelled);
        assert_eq!(status.exit_code, KILLED_EXIT_CODE);
    }

    #[test]
    fn test_only_sigkill_is_supported() {
        let mut handle =
            WindowsProcessHandle::start(&cmd("ping -n 30 127.0.0.1"), null_stdio()).unwrap();
        assert!(matches!(
            handle.send_signal(PosixSignal::SIGTERM, false),
            Err(ProcessError::PlatformNotSupported(_))
        ));
        handle.send_signal(PosixSignal::SIGKILL, false).unwrap();
        assert_eq!(handle.wait_for_exit(None).unwrap().exit_code, KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_wait_async_cancelled() {
        let mut handle =
            WindowsProcessHandle::start(&cmd("ping -n 30 127.0.0.1"), null_stdio()).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let status = handle.wait_for_exit_async(token).await.unwrap();
        assert!(status.cancelled);
    }

    #[test]
    fn test_released_handle_is_invalid() {
        let mut handle = WindowsProcessHandle::start(&cmd("exit 0"), null_stdio()).unwrap();
        handle.wait_for_exit(None).unwrap();
        handle.release();

        assert!(matches!(handle.process_id(), Err(ProcessError::InvalidHandle)));
        assert!(matches!(handle.try_get_exit_status(), Err(ProcessError::InvalidHandle)));
        assert!(matches!(handle.kill(true), Err(ProcessError::InvalidHandle)));
    }

    #[tokio::test]
    async fn test_cancel_after_exit_is_not_cancelled() {
        let mut handle = WindowsProcessHandle::start(&cmd("exit 6"), null_stdio()).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        let token = CancellationToken::new();
        token.cancel();
        let status = handle.wait_for_exit_async(token).await.unwrap();
        assert_eq!(status.exit_code, 6);
        assert!(!status.cancelled);
    }
}
