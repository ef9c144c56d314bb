use crate::error::{ProcessError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// POSIX signals that can be delivered to, or observed from, a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PosixSignal {
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGKILL,
    SIGTERM,
    SIGCHLD,
    SIGCONT,
    SIGWINCH,
    SIGTTIN,
    SIGTTOU,
    SIGTSTP,
}

impl PosixSignal {
    pub const ALL: [PosixSignal; 11] = [
        PosixSignal::SIGHUP,
        PosixSignal::SIGINT,
        PosixSignal::SIGQUIT,
        PosixSignal::SIGKILL,
        PosixSignal::SIGTERM,
        PosixSignal::SIGCHLD,
        PosixSignal::SIGCONT,
        PosixSignal::SIGWINCH,
        PosixSignal::SIGTTIN,
        PosixSignal::SIGTTOU,
        PosixSignal::SIGTSTP,
    ];

    /// Native signal number on the current platform.
    ///
    /// Windows has no POSIX signals; the Linux numbering is used there so the
    /// values stay meaningful in logs and exit codes.
    pub fn as_raw(self) -> i32 {
        #[cfg(unix)]
        {
            match self {
                PosixSignal::SIGHUP => libc::SIGHUP,
                PosixSignal::SIGINT => libc::SIGINT,
                PosixSignal::SIGQUIT => libc::SIGQUIT,
                PosixSignal::SIGKILL => libc::SIGKILL,
                PosixSignal::SIGTERM => libc::SIGTERM,
                PosixSignal::SIGCHLD => libc::SIGCHLD,
                PosixSignal::SIGCONT => libc::SIGCONT,
                PosixSignal::SIGWINCH => libc::SIGWINCH,
                PosixSignal::SIGTTIN => libc::SIGTTIN,
                PosixSignal::SIGTTOU => libc::SIGTTOU,
                PosixSignal::SIGTSTP => libc::SIGTSTP,
            }
        }

        #[cfg(not(unix))]
        {
            match self {
                PosixSignal::SIGHUP => 1,
                PosixSignal::SIGINT => 2,
                PosixSignal::SIGQUIT => 3,
                PosixSignal::SIGKILL => 9,
                PosixSignal::SIGTERM => 15,
                PosixSignal::SIGCHLD => 17,
                PosixSignal::SIGCONT => 18,
                PosixSignal::SIGWINCH => 28,
                PosixSignal::SIGTTIN => 21,
                PosixSignal::SIGTTOU => 22,
                PosixSignal::SIGTSTP => 20,
            }
        }
    }

    /// Map a native signal number back to a supported signal
    pub fn from_raw(raw: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|signal| signal.as_raw() == raw)
            .ok_or_else(|| ProcessError::InvalidArgument(format!("unsupported signal value {raw}")))
    }

    pub fn name(self) -> &'static str {
        match self {
            PosixSignal::SIGHUP => "SIGHUP",
            PosixSignal::SIGINT => "SIGINT",
            PosixSignal::SIGQUIT => "SIGQUIT",
            PosixSignal::SIGKILL => "SIGKILL",
            PosixSignal::SIGTERM => "SIGTERM",
            PosixSignal::SIGCHLD => "SIGCHLD",
            PosixSignal::SIGCONT => "SIGCONT",
            PosixSignal::SIGWINCH => "SIGWINCH",
            PosixSignal::SIGTTIN => "SIGTTIN",
            PosixSignal::SIGTTOU => "SIGTTOU",
            PosixSignal::SIGTSTP => "SIGTSTP",
        }
    }
}

impl TryFrom<i32> for PosixSignal {
    type Error = ProcessError;

    fn try_from(raw: i32) -> Result<Self> {
        Self::from_raw(raw)
    }
}

impl fmt::Display for PosixSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Exit code reported for a process killed after a timeout or cancellation on Windows
pub const KILLED_EXIT_CODE: i32 = -1;

/// Final status of a child process
///
/// `signal` is only ever set on Unix, for processes terminated by a signal.
/// `cancelled` means the wait was abandoned (timeout or cancellation) and the
/// process was force-killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessExitStatus {
    pub exit_code: i32,
    pub signal: Option<PosixSignal>,
    pub cancelled: bool,
}

impl ProcessExitStatus {
    /// Normal termination with the program's own exit value
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal: None,
            cancelled: false,
        }
    }

    /// Termination by a signal; follows the shell convention of `128 + signo`
    pub fn signaled(raw_signal: i32) -> Self {
        Self {
            exit_code: 128 + raw_signal,
            signal: PosixSignal::from_raw(raw_signal).ok(),
            cancelled: false,
        }
    }

    /// Mark this status as the result of a timeout or cancellation kill
    pub fn into_cancelled(self) -> Self {
        Self {
            cancelled: true,
            ..self
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none() && !self.cancelled
    }
}

impl fmt::Display for ProcessExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(signal) => write!(f, "terminated by {signal} (exit code {})", self.exit_code)?,
            None => write!(f, "exit code {}", self.exit_code)?,
        }
        if self.cancelled {
            f.write_str(", cancelled")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_round_trip_through_native_numbers() {
        for signal in PosixSignal::ALL {
            assert_eq!(PosixSignal::from_raw(signal.as_raw()).unwrap(), signal);
        }
    }

    #[test]
    fn test_out_of_range_signal_is_rejected() {
        for raw in [0, -1, 1234, i32::MAX] {
            match PosixSignal::try_from(raw) {
                Err(ProcessError::InvalidArgument(message)) => {
                    assert!(message.contains(&raw.to_string()))
                }
                other => panic!("expected InvalidArgument for {raw}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_signaled_status_uses_shell_convention() {
        let status = ProcessExitStatus::signaled(PosixSignal::SIGTERM.as_raw());
        assert_eq!(status.signal, Some(PosixSignal::SIGTERM));
        assert_eq!(status.exit_code, 128 + PosixSignal::SIGTERM.as_raw());
        assert!(!status.success());
        assert!(!status.cancelled);
    }

    #[test]
    fn test_unknown_signal_keeps_exit_code() {
        // Real-time signals are not part of the supported set.
        let status = ProcessExitStatus::signaled(40);
        assert_eq!(status.exit_code, 168);
        assert_eq!(status.signal, None);
    }

    #[test]
    fn test_cancelled_status() {
        let status = ProcessExitStatus::exited(KILLED_EXIT_CODE).into_cancelled();
        assert!(status.cancelled);
        assert!(!status.success());
        assert_eq!(format!("{status}"), "exit code -1, cancelled");
    }

    #[test]
    fn test_serialization() {
        let status = ProcessExitStatus::signaled(PosixSignal::SIGKILL.as_raw()).into_cancelled();
        let json = serde_json::to_string(&status).unwrap();
        let deserialized: ProcessExitStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, deserialized);
    }
}
