//! Waiting for a child to exit, blocking or on the tokio reactor.
//!
//! A pidfd (Linux) or a kqueue `NOTE_EXIT` event (macOS/BSD) is exact: once it
//! fires the child can be reaped. An exit pipe is only a hint, so callers keep
//! probing the reap point after it fires.

use crate::identity::ProcessIdentity;
use childproc_core::Result;
use std::time::Duration;
use tokio::io::unix::AsyncFd;

#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::errno::Errno;
#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::os::fd::BorrowedFd;

/// Whether a positive answer from this module means the child is reapable
pub(crate) fn is_exact(identity: &ProcessIdentity) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        identity.notifier_is_exact()
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = identity;
        true
    }
}

/// Block for up to `timeout` (forever when `None`) until the child looks exited
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn wait_blocking(identity: &ProcessIdentity, timeout: Option<Duration>) -> Result<bool> {
    poll_readable(identity.notifier_fd(), timeout)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn wait_blocking(identity: &ProcessIdentity, timeout: Option<Duration>) -> Result<bool> {
    let queue = crate::kqueue::new_queue()?;
    if !crate::kqueue::register_exit(&queue, identity.pid())? {
        return Ok(true);
    }
    crate::kqueue::wait_exit(&queue, timeout)
}

/// Wait until `fd` is readable or hung up
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn poll_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, poll_timeout(timeout)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

/// Native poll timeout; partial milliseconds round up
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(timeout) => {
            let millis = timeout.as_micros().div_ceil(1000);
            let millis = i32::try_from(millis).unwrap_or(i32::MAX);
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::NONE)
        }
    }
}

/// Exit readiness registered with the tokio reactor
pub(crate) enum ExitWatch {
    #[cfg(target_os = "linux")]
    Pidfd(AsyncFd<std::os::fd::OwnedFd>),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    ExitPipe {
        pipe: AsyncFd<std::os::fd::OwnedFd>,
        pid: nix::unistd::Pid,
    },
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    Kqueue {
        // Declared first so it is deregistered before the queue closes
        readiness: Option<AsyncFd<std::os::fd::RawFd>>,
        queue: nix::sys::event::Kqueue,
    },
}

impl ExitWatch {
    pub(crate) fn new(identity: &ProcessIdentity) -> Result<Self> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use crate::identity::ExitNotifier;

            match identity.notifier() {
                #[cfg(target_os = "linux")]
                ExitNotifier::Pidfd(fd) => Ok(ExitWatch::Pidfd(AsyncFd::new(fd.try_clone()?)?)),
                ExitNotifier::ExitPipe(fd) => Ok(ExitWatch::ExitPipe {
                    pipe: AsyncFd::new(fd.try_clone()?)?,
                    pid: identity.pid(),
                }),
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            use std::os::fd::{AsFd, AsRawFd};

            let queue = crate::kqueue::new_queue()?;
            let readiness = if crate::kqueue::register_exit(&queue, identity.pid())? {
                Some(AsyncFd::new(queue.as_fd().as_raw_fd())?)
            } else {
                None
            };
            Ok(ExitWatch::Kqueue { readiness, queue })
        }
    }

    /// Resolves once the child has exited (exactly) or the exit pipe hung up
    pub(crate) async fn exited(&self) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            ExitWatch::Pidfd(fd) => {
                let _ready = fd.readable().await?;
                Ok(())
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            ExitWatch::ExitPipe { pipe, pid } => {
                let pid = *pid;
                // Nothing native reports exit here while a grandchild holds the
                // pipe, so a blocking thread peeks at the child without reaping.
                let peek = tokio::task::spawn_blocking(move || peek_exit(pid));
                tokio::select! {
                    ready = pipe.readable() => {
                        let _ready = ready?;
                    }
                    peeked = peek => {
                        peeked.map_err(std::io::Error::other)??;
                    }
                }
                Ok(())
            }
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            ExitWatch::Kqueue { readiness, queue } => {
                let _ = queue;
                if let Some(fd) = readiness {
                    let _ready = fd.readable().await?;
                }
                Ok(())
            }
        }
    }
}

/// Block until `pid` has exited, leaving it waitable
#[cfg(any(target_os = "linux", target_os = "android"))]
fn peek_exit(pid: nix::unistd::Pid) -> Result<()> {
    use nix::sys::wait::{Id, WaitPidFlag, waitid};

    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => continue,
            // Reaped elsewhere in the meantime
            Ok(_) | Err(Errno::ECHILD) => return Ok(()),
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
        assert_eq!(
            poll_timeout(Some(Duration::from_micros(1500))),
            PollTimeout::try_from(2i32).unwrap()
        );
        assert_eq!(poll_timeout(Some(Duration::ZERO)), PollTimeout::ZERO);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_poll_readable_sees_hang_up() {
        use std::os::fd::AsFd;

        let (read, write) = crate::stdio::cloexec_pipe().unwrap();
        assert!(!poll_readable(read.as_fd(), Some(Duration::from_millis(10))).unwrap());
        drop(write);
        assert!(poll_readable(read.as_fd(), None).unwrap());
    }
}
