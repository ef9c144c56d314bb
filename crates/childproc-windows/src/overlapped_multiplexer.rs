//! Completion-based output multiplexer.
//!
//! Each open channel has at most one overlapped `ReadFile` in flight, targeting
//! the spare region of its buffer. That region stays pinned until the read
//! completes or is cancelled, so the buffer is never grown or compacted under
//! the kernel.

use crate::windows_process_handle::WindowsProcessHandle;
use childproc_core::{
    OutputMultiplexer, ProcessError, PumpState, Result, StreamChannel, TimeoutBudget,
};
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use tracing::{debug, trace};
use windows::Win32::Foundation::{
    ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED, HANDLE,
    WAIT_EVENT, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT, WIN32_ERROR,
};
use windows::Win32::Storage::FileSystem::ReadFile;
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows::Win32::System::Pipes::PeekNamedPipe;
use windows::Win32::System::Threading::{CreateEventW, INFINITE, ResetEvent, WaitForMultipleObjects};

fn is_end_of_stream(error: &windows::core::Error) -> bool {
    let code = WIN32_ERROR::from_error(error);
    code == Some(ERROR_BROKEN_PIPE) || code == Some(ERROR_HANDLE_EOF)
}

/// Overlapped read state of one channel
struct ChannelRead {
    // Boxed so its address stays fixed while a read is in flight
    overlapped: Box<OVERLAPPED>,
    event: OwnedHandle,
    in_flight: bool,
}

impl ChannelRead {
    fn new() -> Result<Self> {
        let event = unsafe { CreateEventW(None, true, false, None) }.map_err(std::io::Error::from)?;
        let event = unsafe { OwnedHandle::from_raw_handle(event.0) };
        let mut overlapped = Box::new(OVERLAPPED::default());
        overlapped.hEvent = HANDLE(event.as_raw_handle());
        Ok(Self {
            overlapped,
            event,
            in_flight: false,
        })
    }

    fn event(&self) -> HANDLE {
        HANDLE(self.event.as_raw_handle())
    }
}

fn source(channel: &StreamChannel) -> Option<HANDLE> {
    channel.source().map(|handle| HANDLE(handle.as_raw_handle()))
}

/// Overlapped-I/O multiplexer over named-pipe read ends and the process handle
pub struct OverlappedMultiplexer {
    channels: Vec<StreamChannel>,
    reads: Vec<ChannelRead>,
}

impl OverlappedMultiplexer {
    fn all_closed(&self) -> bool {
        self.channels.iter().all(StreamChannel::is_closed)
    }

    /// Start a read on `index` unless one is already outstanding
    fn issue(&mut self, index: usize) -> Result<()> {
        let read = &mut self.reads[index];
        let channel = &mut self.channels[index];
        if read.in_flight {
            return Ok(());
        }
        let Some(pipe) = source(channel) else {
            return Ok(());
        };

        unsafe { ResetEvent(read.event()) }.map_err(std::io::Error::from)?;
        let (ptr, len) = channel.buffer_mut().begin_pinned_read();
        let target = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        let overlapped: *mut OVERLAPPED = &mut *read.overlapped;
        match unsafe { ReadFile(pipe, Some(target), None, Some(overlapped)) } {
            // Completion is still reported through the event
            Ok(()) => read.in_flight = true,
            Err(e) if WIN32_ERROR::from_error(&e) == Some(ERROR_IO_PENDING) => {
                read.in_flight = true
            }
            Err(e) if is_end_of_stream(&e) => {
                channel.buffer_mut().finish_pinned_read(0);
                channel.close();
            }
            Err(e) => {
                channel.buffer_mut().finish_pinned_read(0);
                return Err(std::io::Error::from(e).into());
            }
        }
        Ok(())
    }

    /// Collect the result of the outstanding read on `index`
    fn complete(&mut self, index: usize, wait: bool) -> Result<()> {
        let read = &mut self.reads[index];
        let channel = &mut self.channels[index];
        if !read.in_flight {
            return Ok(());
        }
        let Some(pipe) = source(channel) else {
            return Ok(());
        };

        let mut transferred = 0u32;
        let result =
            unsafe { GetOverlappedResult(pipe, &*read.overlapped, &mut transferred, wait) };
        read.in_flight = false;
        channel.buffer_mut().finish_pinned_read(transferred as usize);
        match result {
            Ok(()) if transferred > 0 => {
                trace!(stream = ?channel.kind(), bytes = transferred, "Read from output pipe");
                Ok(())
            }
            Ok(()) => {
                channel.close();
                Ok(())
            }
            Err(e) if is_end_of_stream(&e) => {
                channel.close();
                Ok(())
            }
            Err(e) if WIN32_ERROR::from_error(&e) == Some(ERROR_OPERATION_ABORTED) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    /// Cancel the outstanding read on `index` and keep whatever it had read
    fn cancel(&mut self, index: usize) -> Result<()> {
        if !self.reads[index].in_flight {
            return Ok(());
        }
        if let Some(pipe) = source(&self.channels[index]) {
            let overlapped: *const OVERLAPPED = &*self.reads[index].overlapped;
            // Fails harmlessly when the read completed in the meantime
            let _ = unsafe { CancelIoEx(pipe, Some(overlapped)) };
        }
        self.complete(index, true)
    }

    /// Bytes still queued in the pipe of `index`; `None` once the writer is gone
    fn queued(&self, index: usize) -> Option<u32> {
        let pipe = source(&self.channels[index])?;
        let mut available = 0u32;
        match unsafe { PeekNamedPipe(pipe, None, 0, None, Some(&mut available), None) } {
            Ok(()) => Some(available),
            Err(_) => None,
        }
    }

    /// The process exited: stop reading and take what is already in the pipes
    fn finish(&mut self) -> Result<PumpState> {
        for index in 0..self.channels.len() {
            self.cancel(index)?;
            loop {
                match self.queued(index) {
                    Some(0) => break,
                    Some(_) => {
                        self.issue(index)?;
                        self.complete(index, true)?;
                    }
                    None => {
                        if !self.channels[index].is_closed() {
                            self.issue(index)?;
                            self.complete(index, true)?;
                        }
                        break;
                    }
                }
                if self.channels[index].is_closed() {
                    break;
                }
            }
        }
        if self.all_closed() {
            Ok(PumpState::Completed)
        } else {
            debug!("Process exited while an output pipe is still held open");
            Ok(PumpState::ProcessExited)
        }
    }
}

impl OutputMultiplexer for OverlappedMultiplexer {
    type Handle = WindowsProcessHandle;

    fn new(channels: Vec<StreamChannel>) -> Result<Self> {
        let reads = channels
            .iter()
            .map(|_| ChannelRead::new())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { channels, reads })
    }

    fn pump(&mut self, handle: &mut WindowsProcessHandle, budget: &TimeoutBudget) -> Result<PumpState> {
        if self.all_closed() {
            return Ok(PumpState::Completed);
        }
        if budget.is_expired() {
            return Err(ProcessError::Timeout(budget.timeout().unwrap_or_default()));
        }

        for index in 0..self.channels.len() {
            self.issue(index)?;
        }
        if self.all_closed() {
            return Ok(PumpState::Completed);
        }

        // Read events come first so data wins over a simultaneous exit
        let pending: Vec<usize> = (0..self.reads.len())
            .filter(|&index| self.reads[index].in_flight)
            .collect();
        let mut waits: Vec<HANDLE> = pending.iter().map(|&index| self.reads[index].event()).collect();
        waits.push(HANDLE(handle.process()?.as_raw_handle()));

        let timeout = match budget.remaining_millis() {
            None => INFINITE,
            Some(ms) => ms.min(u64::from(INFINITE - 1)) as u32,
        };
        let event: WAIT_EVENT = unsafe { WaitForMultipleObjects(&waits, false, timeout) };
        if event == WAIT_TIMEOUT {
            return Ok(PumpState::Pending);
        }
        if event == WAIT_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        let signalled = event.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
        if let Some(&index) = pending.get(signalled) {
            self.complete(index, false)?;
            return Ok(if self.all_closed() {
                PumpState::Completed
            } else {
                PumpState::Pending
            });
        }
        if signalled == pending.len() {
            return self.finish();
        }
        Err(std::io::Error::last_os_error().into())
    }

    fn channels(&self) -> &[StreamChannel] {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut [StreamChannel] {
        &mut self.channels
    }

    fn into_channels(mut self) -> Vec<StreamChannel> {
        self.cancel_all();
        std::mem::take(&mut self.channels)
    }
}

impl OverlappedMultiplexer {
    fn cancel_all(&mut self) {
        for index in 0..self.channels.len() {
            if let Err(e) = self.cancel(index) {
                debug!("Failed to cancel outstanding read: {e}");
            }
        }
    }
}

impl Drop for OverlappedMultiplexer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::{create_pipe, open_null_device};
    use childproc_core::{ChildStdio, DrainOutcome, ProcessHandle, ProcessStartOptions, StreamKind};

    #[test]
    fn test_drains_both_streams() {
        let (stdout_read, stdout_write) = create_pipe(true).unwrap();
        let (stderr_read, stderr_write) = create_pipe(true).unwrap();
        let options = ProcessStartOptions::builder()
            .file_name("cmd.exe")
            .args(["/c", "echo out& echo err 1>&2"])
            .build()
            .unwrap();
        let mut handle = WindowsProcessHandle::start(
            &options,
            ChildStdio {
                stdin: open_null_device().unwrap(),
                stdout: stdout_write,
                stderr: stderr_write,
            },
        )
        .unwrap();

        let mut multiplexer = OverlappedMultiplexer::new(vec![
            StreamChannel::new(StreamKind::Stdout, stdout_read),
            StreamChannel::new(StreamKind::Stderr, stderr_read),
        ])
        .unwrap();
        let outcome = multiplexer
            .drain(&mut handle, &TimeoutBudget::unbounded())
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Completed);

        let channels = multiplexer.into_channels();
        assert_eq!(channels[0].buffer().as_slice(), b"out\r\n");
        assert_eq!(channels[1].buffer().as_slice(), b"err \r\n");
        assert!(handle.wait_for_exit(None).unwrap().success());
    }
}
