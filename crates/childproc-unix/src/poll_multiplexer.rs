use crate::exit_watch::poll_timeout;
use crate::stdio::{drain_channel, read_channel, set_nonblocking};
use crate::unix_process_handle::UnixProcessHandle;
use childproc_core::{
    OutputMultiplexer, ProcessError, ProcessHandle, PumpState, Remaining, Result, StreamChannel,
    TimeoutBudget,
};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;
use tracing::{debug, trace};

/// Upper bound for one poll when exit is only observable by probing
const EXIT_PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// `poll(2)` based multiplexer over the child's output pipes and its exit notifier
#[derive(Debug)]
pub struct PollMultiplexer {
    channels: Vec<StreamChannel>,
    /// The exit pipe hung up; it stays readable from now on
    exit_hinted: bool,
}

impl PollMultiplexer {
    fn all_closed(&self) -> bool {
        self.channels.iter().all(StreamChannel::is_closed)
    }

    fn finish(&mut self) -> Result<PumpState> {
        for channel in &mut self.channels {
            drain_channel(channel)?;
        }
        if self.all_closed() {
            Ok(PumpState::Completed)
        } else {
            debug!("Process exited while an output pipe is still held open");
            Ok(PumpState::ProcessExited)
        }
    }
}

impl OutputMultiplexer for PollMultiplexer {
    type Handle = UnixProcessHandle;

    fn new(channels: Vec<StreamChannel>) -> Result<Self> {
        for channel in &channels {
            if let Some(fd) = channel.source() {
                set_nonblocking(fd.as_raw_fd())?;
            }
        }
        Ok(Self {
            channels,
            exit_hinted: false,
        })
    }

    fn pump(&mut self, handle: &mut UnixProcessHandle, budget: &TimeoutBudget) -> Result<PumpState> {
        if self.all_closed() {
            return Ok(PumpState::Completed);
        }
        let remaining = match budget.remaining() {
            Remaining::Expired => {
                return Err(ProcessError::Timeout(budget.timeout().unwrap_or_default()));
            }
            Remaining::Unbounded => None,
            Remaining::Left(left) => Some(left),
        };

        let identity = handle.identity()?;
        let exact = identity.notifier_is_exact();
        let timeout = if exact {
            remaining
        } else {
            Some(budget.remaining_capped(EXIT_PROBE_INTERVAL))
        };

        let (ready, notifier_ready) = {
            let mut indices = Vec::with_capacity(self.channels.len());
            let mut fds = Vec::with_capacity(self.channels.len() + 1);
            for (index, channel) in self.channels.iter().enumerate() {
                if let Some(fd) = channel.source() {
                    indices.push(index);
                    fds.push(PollFd::new(fd.as_fd(), PollFlags::POLLIN));
                }
            }
            let watch_notifier = exact || !self.exit_hinted;
            if watch_notifier {
                fds.push(PollFd::new(identity.notifier_fd(), PollFlags::POLLIN));
            }

            match poll(&mut fds, poll_timeout(timeout)) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(PumpState::Pending),
                Err(e) => return Err(std::io::Error::from(e).into()),
            }

            let is_ready = |fd: &PollFd<'_>| {
                fd.revents()
                    .is_some_and(|revents| !revents.is_empty())
            };
            let ready: Vec<usize> = indices
                .iter()
                .zip(&fds)
                .filter(|(_, fd)| is_ready(fd))
                .map(|(&index, _)| index)
                .collect();
            let notifier_ready = watch_notifier && fds.last().is_some_and(is_ready);
            (ready, notifier_ready)
        };

        for index in ready {
            let step = read_channel(&mut self.channels[index])?;
            trace!(stream = ?self.channels[index].kind(), ?step, "Read from output pipe");
        }

        let exited = if exact {
            notifier_ready
        } else {
            self.exit_hinted |= notifier_ready;
            handle.try_get_exit_status()?.is_some()
        };

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
    use std::time::Instant;

    fn start_piped(script: &str) -> (UnixProcessHandle, PollMultiplexer) {
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
        let multiplexer = PollMultiplexer::new(vec![
            StreamChannel::new(StreamKind::Stdout, stdout_read),
            StreamChannel::new(StreamKind::Stderr, stderr_read),
        ])
        .unwrap();
        (handle, multiplexer)
    }

    #[test]
    fn test_drains_both_streams() {
        let (mut handle, mut multiplexer) = start_piped("echo out; echo err >&2; exit 4");
        let outcome = multiplexer
            .drain(&mut handle, &TimeoutBudget::unbounded())
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Completed);

        let channels = multiplexer.into_channels();
        assert_eq!(channels[0].buffer().as_slice(), b"out\n");
        assert_eq!(channels[1].buffer().as_slice(), b"err\n");
        assert_eq!(handle.wait_for_exit(None).unwrap().exit_code, 4);
    }

    #[test]
    fn test_large_output_on_both_streams_does_not_deadlock() {
        let (mut handle, mut multiplexer) = start_piped(
            "i=0; while [ $i -lt 2000 ]; do echo 0123456789012345678901234567890123456789; echo abcdefghijabcdefghijabcdefghij >&2; i=$((i+1)); done",
        );
        multiplexer
            .drain(&mut handle, &TimeoutBudget::new(Some(Duration::from_secs(30))))
            .unwrap();
        let channels = multiplexer.into_channels();
        assert_eq!(channels[0].bytes_read(), 2000 * 41);
        assert_eq!(channels[1].bytes_read(), 2000 * 31);
        assert!(handle.wait_for_exit(None).unwrap().success());
    }

    #[test]
    fn test_orphaned_writer_does_not_block_drain() {
        let (mut handle, mut multiplexer) = start_piped("sleep 3 & echo done");
        let started = Instant::now();
        let outcome = multiplexer
            .drain(&mut handle, &TimeoutBudget::new(Some(Duration::from_secs(30))))
            .unwrap();

        assert_eq!(outcome, DrainOutcome::ProcessExited);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(multiplexer.channels()[0].buffer().as_slice(), b"done\n");
        assert!(handle.wait_for_exit(None).unwrap().success());
    }

    #[test]
    fn test_budget_expiry_is_a_timeout() {
        let (mut handle, mut multiplexer) = start_piped("sleep 10");
        let result = multiplexer.drain(
            &mut handle,
            &TimeoutBudget::new(Some(Duration::from_millis(100))),
        );
        assert!(matches!(result, Err(ProcessError::Timeout(_))));

        handle.kill(true).unwrap();
        assert!(handle.wait_for_exit(None).unwrap().signal.is_some());
    }

    /// Draining with only the exit pipe to go by
    #[cfg(target_os = "linux")]
    mod exit_pipe {
        use super::*;
        use crate::spawn::force_exit_pipe;

        fn start(script: &str) -> (UnixProcessHandle, PollMultiplexer) {
            force_exit_pipe(true);
            let started = start_piped(script);
            force_exit_pipe(false);
            assert!(!started.0.identity().unwrap().notifier_is_exact());
            started
        }

        #[test]
        fn test_drains_both_streams() {
            let (mut handle, mut multiplexer) = start("echo out; echo err >&2; exit 4");
            let outcome = multiplexer
                .drain(&mut handle, &TimeoutBudget::new(Some(Duration::from_secs(30))))
                .unwrap();
            assert_eq!(outcome, DrainOutcome::Completed);
            assert_eq!(multiplexer.channels()[0].buffer().as_slice(), b"out\n");
            assert_eq!(multiplexer.channels()[1].buffer().as_slice(), b"err\n");
            assert_eq!(handle.wait_for_exit(None).unwrap().exit_code, 4);
        }

        #[test]
        fn test_orphaned_writer_does_not_block_drain() {
            let (mut handle, mut multiplexer) = start("sleep 3 & echo done");
            let started = Instant::now();
            let outcome = multiplexer
                .drain(&mut handle, &TimeoutBudget::new(Some(Duration::from_secs(30))))
                .unwrap();

            assert_eq!(outcome, DrainOutcome::ProcessExited);
            assert!(started.elapsed() < Duration::from_secs(3));
            assert_eq!(multiplexer.channels()[0].buffer().as_slice(), b"done\n");
            assert!(handle.wait_for_exit(None).unwrap().success());
        }

        #[test]
        fn test_budget_expiry_is_a_timeout() {
            let (mut handle, mut multiplexer) = start("sleep 10");
            let result = multiplexer.drain(
                &mut handle,
                &TimeoutBudget::new(Some(Duration::from_millis(100))),
            );
            assert!(matches!(result, Err(ProcessError::Timeout(_))));

            let status = handle.wait_for_exit(Some(Duration::ZERO)).unwrap();
            assert!(status.cancelled);
        }
    }
}
