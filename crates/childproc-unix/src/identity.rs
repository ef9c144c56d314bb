use childproc_core::PosixSignal;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// How the parent learns that a child has exited
#[derive(Debug)]
pub(crate) enum ExitNotifier {
    /// Process descriptor from `clone3`; readable once the child exits
    #[cfg(target_os = "linux")]
    Pidfd(OwnedFd),
    /// Read end of a pipe whose only write end lives in the child; it hangs
    /// up once the child and every descendant that inherited it are gone
    ExitPipe(OwnedFd),
}

/// Native identity of one spawned child, owned by exactly one handle
#[derive(Debug)]
pub(crate) struct ProcessIdentity {
    pid: Pid,
    notifier: ExitNotifier,
}

impl ProcessIdentity {
    pub(crate) fn new(pid: Pid, notifier: ExitNotifier) -> Self {
        Self { pid, notifier }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn notifier(&self) -> &ExitNotifier {
        &self.notifier
    }

    pub(crate) fn notifier_fd(&self) -> BorrowedFd<'_> {
        match &self.notifier {
            #[cfg(target_os = "linux")]
            ExitNotifier::Pidfd(fd) => fd.as_fd(),
            ExitNotifier::ExitPipe(fd) => fd.as_fd(),
        }
    }

    /// Whether readiness of the notifier guarantees the child can be reaped.
    ///
    /// An exit pipe may be held open by a grandchild, or closed early by a
    /// child that closes inherited descriptors, so it is only a hint.
    pub(crate) fn notifier_is_exact(&self) -> bool {
        match &self.notifier {
            #[cfg(target_os = "linux")]
            ExitNotifier::Pidfd(_) => true,
            ExitNotifier::ExitPipe(_) => false,
        }
    }

    /// Send `signal` to the child, or to the process group it leads
    pub(crate) fn signal(&self, signal: PosixSignal, entire_process_group: bool) -> nix::Result<()> {
        let native = Signal::try_from(signal.as_raw())?;
        if entire_process_group {
            return signal::kill(Pid::from_raw(-self.pid.as_raw()), native);
        }
        match &self.notifier {
            #[cfg(target_os = "linux")]
            ExitNotifier::Pidfd(fd) => pidfd_send_signal(fd.as_fd(), native),
            ExitNotifier::ExitPipe(_) => signal::kill(self.pid, native),
        }
    }
}

#[cfg(target_os = "linux")]
fn pidfd_send_signal(pidfd: BorrowedFd<'_>, signal: Signal) -> nix::Result<()> {
    use nix::errno::Errno;
    use std::os::fd::AsRawFd;

    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            signal as libc::c_int,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    Errno::result(ret).map(drop)
}
