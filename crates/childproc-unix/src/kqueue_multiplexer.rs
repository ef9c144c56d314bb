use crate::kqueue::{empty_event, new_queue, register_exit, register_read, timespec};
use crate::stdio::{drain_channel, read_channel, set_nonblocking};
use crate::unix_process_handle::UnixProcessHandle;
use childproc_core::{
    OutputMultiplexer, ProcessError, ProcessHandle, PumpState, Remaining, Result, StreamChannel,
    TimeoutBudget,
};
use nix::errno::Errno;
use nix::sys::event::{EventFilter, Kqueue};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::{debug, trace};

/// How long output may trail the exit event and still be collected
const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(10);

/// kqueue based multiplexer: one read filter per channel plus `NOTE_EXIT`
#[derive(Debug)]
pub struct KqueueMultiplexer {
    channels: Vec<StreamChannel>,
    /// Registered lazily on the first pump
    queue: Option<Kqueue>,
    exited: bool,
}

impl KqueueMultiplexer {
    fn all_closed(&self) -> bool {
        self.channels.iter().all(StreamChannel::is_closed)
    }

    fn finish(&mut self) -> Result<PumpState> {
        for channel in &mut self.channels {
            drain_channel(channel)?;
        }
        if !self.exited {
            self.exited = true;
            if !self.all_closed() {
                self.drain_trailing()?;
            }
        }
        if self.all_closed() {
            Ok(PumpState::Completed)
        } else {
            debug!("Process exited while an output pipe is still held open");
            Ok(PumpState::ProcessExited)
        }
    }

    /// One bounded wait for pipe data that lands just after the exit event
    fn drain_trailing(&mut self) -> Result<()> {
        let Some(queue) = self.queue.as_ref() else {
            return Ok(());
        };
        let mut events = vec![empty_event(); self.channels.len()];
        let count = match queue.kevent(&[], &mut events, Some(timespec(EXIT_DRAIN_WINDOW))) {
            Ok(count) => count,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(std::io::Error::from(e).into()),
        };
        for event in &events[..count] {
            if !matches!(event.filter(), Ok(EventFilter::EVFILT_READ)) {
                continue;
            }
            if let Some(channel) = self.channels.get_mut(event.udata() as usize) {
                drain_channel(channel)?;
            }
        }
        Ok(())
    }

    /// Build the queue; `false` when the child is already gone
    fn register(&mut self, handle: &mut UnixProcessHandle) -> Result<bool> {
        if handle.try_get_exit_status()?.is_some() {
            return Ok(false);
        }
        let queue = new_queue()?;
        for (index, channel) in self.channels.iter().enumerate() {
            if let Some(fd) = channel.source() {
                register_read(&queue, fd.as_raw_fd(), index)?;
            }
        }
        let watching = register_exit(&queue, handle.identity()?.pid())?;
        self.queue = Some(queue);
        Ok(watching)
    }
}

impl OutputMultiplexer for KqueueMultiplexer {
    type Handle = UnixProcessHandle;

    fn new(channels: Vec<StreamChannel>) -> Result<Self> {
        for channel in &channels {
            if let Some(fd) = channel.source() {
                set_nonblocking(fd.as_raw_fd())?;
            }
        }
        Ok(Self {
            channels,
            queue: None,
            exited: false,
        })
    }

    fn pump(&mut self, handle: &mut UnixProcessHandle, budget: &TimeoutBudget) -> Result<PumpState> {
        if self.all_closed() {
            return Ok(PumpState::Completed);
        }
        if self.exited {
            return self.finish();
        }
        let remaining = match budget.remaining() {
            Remaining::Expired => {
                return Err(ProcessError::Timeout(budget.timeout().unwrap_or_default()));
            }
            Remaining::Unbounded => None,
            Remaining::Left(left) => Some(left),
        };
        if self.queue.is_none() && !self.register(handle)? {
            return self.finish();
        }
        let Some(queue) = self.queue.as_ref() else {
            return Err(ProcessError::InvalidHandle);
        };

        let mut events = vec![empty_event(); self.channels.len() + 1];
        let count = match queue.kevent(&[], &mut events, remaining.map(timespec)) {
            Ok(count) => count,
            Err(Errno::EINTR) => return Ok(PumpState::Pending),
            Err(e) => return Err(std::io::Error::from(e).into()),
        };

        let mut exited = false;
        for event in &events[..count] {
            match event.filter() {
                Ok(EventFilter::EVFILT_READ) => {
                    let Some(channel) = self.channels.get_mut(event.udata() as usize) else {
                        continue;
                    };
                    let step = read_channel(channel)?;
                    trace!(stream = ?channel.kind(), ?step, "Read from output pipe");
                }
                Ok(EventFilter::EVFILT_PROC) => exited = true,
                _ => {}
            }
        }

        if exited {
            return self.finish();
        }
        if self.all_closed() {
            return Ok(PumpState::Completed);
        }
        Ok(PumpState::Pending)
    }

    fn channels(&self) -> &[StreamChannel] {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut [StreamChannel] {
        &mut self.channels
    }

    fn into_channels(self) -> Vec<StreamChannel> {
        self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::{create_pipe, open_null_device};
    use childproc_core::{ChildStdio, DrainOutcome, ProcessStartOptions, StreamKind};

    fn start_piped(script: &str) -> (UnixProcessHandle, KqueueMultiplexer) {
        let (stdout_read, stdout_write) = create_pipe(true).unwrap();
        let (stderr_read, stderr_write) = create_pipe(true).unwrap();
        let options = ProcessStartOptions::builder()
            .file_name("sh")
            .args(["-c", script])
            .build()
            .unwrap();
        let stdio = ChildStdio {
            stdin: open_null_device().unwrap(),
            stdout: stdout_write,
            stderr: stderr_write,
        };
        let handle = UnixProcessHandle::start(&options, stdio).unwrap();
        let multiplexer = KqueueMultiplexer::new(vec![
            StreamChannel::new(StreamKind::Stdout, stdout_read),
            StreamChannel::new(StreamKind::Stderr, stderr_read),
        ])
        .unwrap();
        (handle, multiplexer)
    }

    #[test]
    fn test_drains_both_streams() {
        let (mut handle, mut multiplexer) = start_piped("echo out; echo err >&2");
        let outcome = multiplexer
            .drain(&mut handle, &TimeoutBudget::unbounded())
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Completed);
        assert_eq!(multiplexer.channels()[0].buffer().as_slice(), b"out\n");
        assert_eq!(multiplexer.channels()[1].buffer().as_slice(), b"err\n");
        assert!(handle.wait_for_exit(None).unwrap().success());
    }

    #[test]
    fn test_orphaned_writer_does_not_block_drain() {
        let (mut handle, mut multiplexer) = start_piped("sleep 3 & echo done");
        let outcome = multiplexer
            .drain(&mut handle, &TimeoutBudget::new(Some(Duration::from_secs(30))))
            .unwrap();
        assert_eq!(outcome, DrainOutcome::ProcessExited);
        assert_eq!(multiplexer.channels()[0].buffer().as_slice(), b"done\n");
        handle.wait_for_exit(None).unwrap();
    }

    #[test]
    fn test_trailing_output_after_exit_is_collected() {
        let (read, write) = create_pipe(true).unwrap();
        let mut multiplexer =
            KqueueMultiplexer::new(vec![StreamChannel::new(StreamKind::Stdout, read)]).unwrap();
        let queue = new_queue().unwrap();
        let fd = multiplexer.channels()[0].source().unwrap().as_raw_fd();
        register_read(&queue, fd, 0).unwrap();
        multiplexer.queue = Some(queue);

        let mut file = std::fs::File::from(write);
        std::io::Write::write_all(&mut file, b"late\n").unwrap();

        multiplexer.drain_trailing().unwrap();
        assert_eq!(multiplexer.channels()[0].buffer().as_slice(), b"late\n");
        assert!(!multiplexer.channels()[0].is_closed());

        drop(file);
        multiplexer.drain_trailing().unwrap();
        assert!(multiplexer.channels()[0].is_closed());
    }
}
