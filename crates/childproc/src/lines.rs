use crate::factory::{PlatformHandle, PlatformMultiplexer};
use crate::running::{StdioMode, prepare_stdio};
use childproc_core::{
    OutputMultiplexer, ProcessError, ProcessExitStatus, ProcessHandle, ProcessStartOptions,
    PumpState, Result, StreamChannel, StreamKind, TimeoutBudget,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// One line of child output, without its terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub content: String,
    pub is_standard_error: bool,
}

/// A started process whose output is being split into lines
struct LineReader {
    handle: PlatformHandle,
    multiplexer: PlatformMultiplexer,
    budget: TimeoutBudget,
    pending: VecDeque<OutputLine>,
    streams_done: bool,
}

impl LineReader {
    fn start(options: &ProcessStartOptions, timeout: Option<Duration>) -> Result<Self> {
        let mut stdio = prepare_stdio(StdioMode::Capture)?;
        let (Some(stdout), Some(stderr)) = (stdio.stdout.take(), stdio.stderr.take()) else {
            return Err(ProcessError::InvalidOperation("capture pipes were not created".to_string()));
        };
        let handle = PlatformHandle::start(options, stdio.child)?;
        let multiplexer = PlatformMultiplexer::new(vec![
            StreamChannel::new(StreamKind::Stdout, stdout),
            StreamChannel::new(StreamKind::Stderr, stderr),
        ])?;
        Ok(Self {
            handle,
            multiplexer,
            budget: TimeoutBudget::new(timeout),
            pending: VecDeque::new(),
            streams_done: false,
        })
    }

    /// Move complete lines, or everything when `flush`, into `pending`
    fn split_lines(&mut self, flush: bool) {
        for channel in self.multiplexer.channels_mut() {
            let is_standard_error = channel.kind().is_standard_error();
            let buffer = channel.buffer_mut();
            while let Some(line) = buffer.take_line() {
                self.pending.push_back(OutputLine {
                    content: String::from_utf8_lossy(&line).into_owned(),
                    is_standard_error,
                });
            }
            if !flush {
                continue;
            }
            if let Some(rest) = buffer.take_remainder() {
                self.pending.push_back(OutputLine {
                    content: String::from_utf8_lossy(&rest).into_owned(),
                    is_standard_error,
                });
            }
        }
    }

    /// Pump once; returns the final status once the enumeration is over
    fn advance(&mut self) -> Result<Option<ProcessExitStatus>> {
        match self.multiplexer.pump(&mut self.handle, &self.budget) {
            Ok(PumpState::Pending) => {
                self.split_lines(false);
                Ok(None)
            }
            Ok(PumpState::Completed | PumpState::ProcessExited) => {
                self.streams_done = true;
                self.split_lines(true);
                let status = match self.handle.try_get_exit_status()? {
                    Some(status) => status,
                    None => self.handle.wait_for_exit(self.budget.remaining_timeout())?,
                };
                Ok(Some(status))
            }
            Err(ProcessError::Timeout(_)) => {
                warn!("Line stream timed out, killing process");
                self.streams_done = true;
                self.split_lines(true);
                self.handle.kill(false)?;
                Ok(Some(self.handle.wait_for_exit(None)?.into_cancelled()))
            }
            Err(e) => {
                self.handle.kill(false)?;
                Err(e)
            }
        }
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        if self.streams_done {
            return;
        }
        debug!("Line stream dropped early, killing process");
        if let Err(e) = self.handle.kill(false) {
            debug!("Failed to kill abandoned process: {e}");
        }
        if let Err(e) = self.handle.wait_for_exit(None) {
            debug!("Failed to reap abandoned process: {e}");
        }
    }
}

enum LinesState {
    NotStarted(ProcessStartOptions),
    Running(Box<LineReader>),
    /// Lines left after the process finished
    Draining(VecDeque<OutputLine>),
    Finished,
}

/// Lazy, single-pass stream of a process's output lines.
///
/// The process starts on the first call to `next`. Dropping the stream before
/// it is exhausted kills and reaps the process.
pub struct OutputLines {
    state: LinesState,
    timeout: Option<Duration>,
    status: Option<ProcessExitStatus>,
}

impl OutputLines {
    pub(crate) fn new(options: ProcessStartOptions, timeout: Option<Duration>) -> Self {
        Self {
            state: LinesState::NotStarted(options),
            timeout,
            status: None,
        }
    }

    /// Exit status, available once the stream has been exhausted
    pub fn exit_status(&self) -> Option<ProcessExitStatus> {
        self.status
    }
}

impl Iterator for OutputLines {
    type Item = Result<OutputLine>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                LinesState::NotStarted(options) => match LineReader::start(options, self.timeout) {
                    Ok(reader) => self.state = LinesState::Running(Box::new(reader)),
                    Err(e) => {
                        self.state = LinesState::Finished;
                        return Some(Err(e));
                    }
                },
                LinesState::Running(reader) => {
                    if let Some(line) = reader.pending.pop_front() {
                        return Some(Ok(line));
                    }
                    match reader.advance() {
                        Ok(None) => {}
                        Ok(Some(status)) => {
                            self.status = Some(status);
                            let rest = std::mem::take(&mut reader.pending);
                            self.state = LinesState::Draining(rest);
                        }
                        Err(e) => {
                            self.state = LinesState::Finished;
                            return Some(Err(e));
                        }
                    }
                }
                LinesState::Draining(rest) => match rest.pop_front() {
                    Some(line) => return Some(Ok(line)),
                    None => self.state = LinesState::Finished,
                },
                LinesState::Finished => return None,
            }
        }
    }
}
