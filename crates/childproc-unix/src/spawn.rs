//! Fork/exec with an exec-status handshake.
//!
//! The parent blocks every signal around the fork so the child cannot run a
//! parent handler before it resets them. A close-on-exec pipe carries the
//! child's `errno` back when anything between fork and exec fails; a zero-byte
//! read means exec succeeded. The child only calls async-signal-safe functions
//! and never allocates.

use crate::exec::ExecRequest;
use crate::identity::{ExitNotifier, ProcessIdentity};
use crate::stdio::{above_stdio, cloexec_pipe, read_fd};
use childproc_core::{
    ChildStdio, ProcessError, ProcessStartOptions, RawNativeHandle, Result, resolve_executable,
};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, pthread_sigmask};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpid};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::{debug, info};

/// A freshly spawned child
pub(crate) struct Spawned {
    pub identity: ProcessIdentity,
    /// Handshake read end of a child stopped before exec; reading it after
    /// `SIGCONT` reports whether exec succeeded
    pub pending_exec: Option<OwnedFd>,
}

/// Everything the child process does between fork and exec
struct ChildSetup<'a> {
    exec: &'a ExecRequest,
    stdio: [RawFd; 3],
    handshake: RawFd,
    inherited: &'a [RawNativeHandle],
    old_mask: SigSet,
    parent: Pid,
    /// Upper bound for the descriptor walk when `close_range` is unavailable
    max_fd: RawFd,
    new_process_group: bool,
    kill_on_parent_death: bool,
    suspended: bool,
}

pub(crate) fn spawn(options: &ProcessStartOptions, stdio: ChildStdio) -> Result<Spawned> {
    let program = resolve_executable(&options.file_name)?;
    let exec = ExecRequest::new(&program, options)?;

    let stdio = [
        above_stdio(stdio.stdin)?,
        above_stdio(stdio.stdout)?,
        above_stdio(stdio.stderr)?,
    ];
    let (handshake_read, handshake_write) = cloexec_pipe()?;
    let handshake_write = above_stdio(handshake_write)?;

    let mut old_mask = SigSet::empty();
    pthread_sigmask(
        SigmaskHow::SIG_SETMASK,
        Some(&SigSet::all()),
        Some(&mut old_mask),
    )
    .map_err(std::io::Error::from)?;

    let setup = ChildSetup {
        exec: &exec,
        stdio: [
            stdio[0].as_raw_fd(),
            stdio[1].as_raw_fd(),
            stdio[2].as_raw_fd(),
        ],
        handshake: handshake_write.as_raw_fd(),
        inherited: &options.inherited_handles,
        old_mask,
        parent: getpid(),
        max_fd: open_max(),
        new_process_group: options.create_new_process_group,
        kill_on_parent_death: options.kill_on_parent_death,
        suspended: options.create_suspended,
    };

    let forked = fork_child(&setup);
    let restored = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);

    // The child has its own copies now
    drop(handshake_write);
    drop(stdio);

    let (pid, notifier) = forked.map_err(|e| match e {
        ProcessError::Io(source) => ProcessError::spawn(&options.file_name, source),
        other => other,
    })?;
    restored.map_err(std::io::Error::from)?;

    if options.create_suspended {
        return wait_for_stop(options, pid, notifier, handshake_read);
    }

    match read_handshake(handshake_read.as_fd())? {
        None => {
            info!(pid = %pid, file_name = %options.file_name, "Spawned process");
            Ok(Spawned {
                identity: ProcessIdentity::new(pid, notifier),
                pending_exec: None,
            })
        }
        Some(errno) => {
            reap_failed_child(pid);
            Err(exec_failure(&options.file_name, errno))
        }
    }
}

/// Observe a suspended child stopping itself right before exec
fn wait_for_stop(
    options: &ProcessStartOptions,
    pid: Pid,
    notifier: ExitNotifier,
    handshake: OwnedFd,
) -> Result<Spawned> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Stopped(..)) => {
                info!(pid = %pid, file_name = %options.file_name, "Spawned suspended process");
                return Ok(Spawned {
                    identity: ProcessIdentity::new(pid, notifier),
                    pending_exec: Some(handshake),
                });
            }
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                // Setup failed before the stop; the child is already reaped
                let errno = read_handshake(handshake.as_fd())?.unwrap_or(libc::ECHILD);
                return Err(exec_failure(&options.file_name, errno));
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
    }
}

/// Read the child's exec status: `None` once exec succeeded, or its `errno`
pub(crate) fn read_handshake(fd: BorrowedFd<'_>) -> Result<Option<i32>> {
    let mut buf = [0u8; size_of::<i32>()];
    loop {
        match read_fd(fd, &mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) if n == buf.len() => return Ok(Some(i32::from_ne_bytes(buf))),
            Ok(n) => {
                return Err(ProcessError::InvalidData(format!(
                    "short exec handshake of {n} bytes"
                )));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
    }
}

pub(crate) fn exec_failure(file_name: &str, errno: i32) -> ProcessError {
    ProcessError::spawn(file_name, std::io::Error::from_raw_os_error(errno))
}

/// Collect a child that failed before or during exec so no zombie remains
pub(crate) fn reap_failed_child(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!(pid = %pid, "Failed to reap child after exec failure: {e}");
                return;
            }
            Ok(_) => return,
        }
    }
}

fn fork_child(setup: &ChildSetup<'_>) -> Result<(Pid, ExitNotifier)> {
    #[cfg(target_os = "linux")]
    if !exit_pipe_forced() {
        match clone3_with_pidfd(setup) {
            Ok(child) => return Ok(child),
            Err(Errno::ENOSYS | Errno::EPERM) => {
                debug!("clone3 unavailable, falling back to fork with an exit pipe");
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
    }

    fork_with_exit_pipe(setup)
}

#[cfg(all(target_os = "linux", test))]
thread_local! {
    static FORCE_EXIT_PIPE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make spawns on the calling thread take the fork and exit-pipe path
#[cfg(all(target_os = "linux", test))]
pub(crate) fn force_exit_pipe(enabled: bool) {
    FORCE_EXIT_PIPE.with(|forced| forced.set(enabled));
}

#[cfg(all(target_os = "linux", test))]
fn exit_pipe_forced() -> bool {
    FORCE_EXIT_PIPE.with(std::cell::Cell::get)
}

#[cfg(all(target_os = "linux", not(test)))]
fn exit_pipe_forced() -> bool {
    false
}

/// Highest descriptor number the process may hold, for the child-side walk
fn open_max() -> RawFd {
    match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => RawFd::try_from(n).unwrap_or(RawFd::MAX),
        _ => 1024,
    }
}

#[cfg(target_os = "linux")]
#[repr(C)]
#[derive(Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
}

/// Clone a child and obtain its pidfd in the same system call.
///
/// Without `CLONE_VM` the child runs on a copy of the parent's memory; with
/// `CLONE_VFORK` the parent resumes only once the child has exec'd or exited.
/// A suspended child stops before exec, so it is cloned without `CLONE_VFORK`.
#[cfg(target_os = "linux")]
fn clone3_with_pidfd(setup: &ChildSetup<'_>) -> nix::Result<(Pid, ExitNotifier)> {
    use std::os::fd::FromRawFd;

    let mut pidfd: libc::c_int = -1;
    let mut flags = libc::CLONE_PIDFD as u64;
    if !setup.suspended {
        flags |= libc::CLONE_VFORK as u64;
    }
    let args = CloneArgs {
        flags,
        pidfd: &mut pidfd as *mut libc::c_int as u64,
        exit_signal: libc::SIGCHLD as u64,
        ..Default::default()
    };

    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &args as *const CloneArgs,
            size_of::<CloneArgs>(),
        )
    };
    let ret = Errno::result(ret)?;
    if ret == 0 {
        unsafe { setup.run_child(None) }
    }

    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd) };
    Ok((Pid::from_raw(ret as libc::pid_t), ExitNotifier::Pidfd(pidfd)))
}

fn fork_with_exit_pipe(setup: &ChildSetup<'_>) -> Result<(Pid, ExitNotifier)> {
    use nix::unistd::{ForkResult, fork};

    let (exit_read, exit_write) = cloexec_pipe()?;
    let exit_write = above_stdio(exit_write)?;

    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Child => unsafe { setup.run_child(Some(exit_write.as_raw_fd())) },
        ForkResult::Parent { child } => {
            drop(exit_write);
            Ok((child, ExitNotifier::ExitPipe(exit_read)))
        }
    }
}

impl ChildSetup<'_> {
    /// Runs in the child between fork and exec. Never returns.
    unsafe fn run_child(&self, exit_pipe: Option<RawFd>) -> ! {
        unsafe {
            reset_signal_handlers();
            if libc::pthread_sigmask(libc::SIG_SETMASK, self.old_mask.as_ref(), std::ptr::null_mut())
                != 0
            {
                self.fail();
            }

            #[cfg(any(target_os = "linux", target_os = "android"))]
            if self.kill_on_parent_death {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) == -1 {
                    self.fail();
                }
                // The parent may have died before prctl took effect
                if libc::getppid() != self.parent.as_raw() {
                    libc::_exit(127);
                }
            }

            if self.new_process_group && libc::setpgid(0, 0) == -1 {
                self.fail();
            }

            for (target, &fd) in self.stdio.iter().enumerate() {
                if libc::dup2(fd, target as libc::c_int) == -1 {
                    self.fail();
                }
            }

            // Only stdio, the exit pipe and the requested handles survive exec
            cloexec_from(libc::STDERR_FILENO + 1, self.max_fd);

            if let Some(fd) = exit_pipe {
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    self.fail();
                }
            }
            for &fd in self.inherited {
                if fd > libc::STDERR_FILENO && libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    self.fail();
                }
            }

            if let Some(dir) = &self.exec.working_directory {
                if libc::chdir(dir.as_ptr()) == -1 {
                    self.fail();
                }
            }

            if self.suspended {
                libc::kill(libc::getpid(), libc::SIGSTOP);
            }

            match &self.exec.envp {
                Some(envp) => {
                    libc::execve(self.exec.program.as_ptr(), self.exec.argv.as_ptr(), envp.as_ptr())
                }
                None => libc::execv(self.exec.program.as_ptr(), self.exec.argv.as_ptr()),
            };
            self.fail()
        }
    }

    /// Report `errno` through the handshake pipe and exit
    unsafe fn fail(&self) -> ! {
        let errno = Errno::last_raw().to_ne_bytes();
        unsafe {
            libc::write(self.handshake, errno.as_ptr().cast(), errno.len());
            libc::_exit(127)
        }
    }
}

/// Mark every descriptor from `first` up close-on-exec
unsafe fn cloexec_from(first: RawFd, max_fd: RawFd) {
    unsafe {
        #[cfg(target_os = "linux")]
        {
            const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
            let ret = libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                libc::c_uint::MAX,
                CLOSE_RANGE_CLOEXEC,
            );
            if ret == 0 {
                return;
            }
        }

        for fd in first..max_fd {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags != -1 && flags & libc::FD_CLOEXEC == 0 {
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
    }
}

/// Put the default disposition back for every signal with a custom handler.
/// Ignored signals stay ignored across exec, as POSIX shells expect.
unsafe fn reset_signal_handlers() {
    unsafe {
        let mut default: libc::sigaction = std::mem::zeroed();
        default.sa_sigaction = libc::SIG_DFL;
        for sig in 1..128 {
            if sig == libc::SIGKILL || sig == libc::SIGSTOP {
                continue;
            }
            let mut current: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(sig, std::ptr::null(), &mut current) != 0 {
                continue;
            }
            if current.sa_sigaction != libc::SIG_DFL && current.sa_sigaction != libc::SIG_IGN {
                libc::sigaction(sig, &default, std::ptr::null_mut());
            }
        }
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

    fn sh(script: &str) -> ProcessStartOptions {
        ProcessStartOptions::builder()
            .file_name("sh")
            .args(["-c", script])
            .build()
            .unwrap()
    }

    #[test]
    fn test_spawn_and_reap() {
        let spawned = spawn(&sh("exit 7"), null_stdio()).unwrap();
        assert!(spawned.pending_exec.is_none());
        let pid = spawned.identity.pid();
        assert!(pid.as_raw() > 0);

        match waitpid(pid, None).unwrap() {
            WaitStatus::Exited(_, code) => assert_eq!(code, 7),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_missing_working_directory_is_reported_as_spawn_error() {
        let mut options = sh("exit 0");
        options.working_directory = Some("/definitely/not/here".into());

        match spawn(&options, null_stdio()) {
            Err(ProcessError::Spawn { source, .. }) => {
                assert_eq!(source.raw_os_error(), Some(libc::ENOENT))
            }
            other => panic!("expected a spawn error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_descriptors_above_stdio_are_not_inherited() {
        let null = std::fs::File::open("/dev/null").unwrap();
        // dup() leaves close-on-exec unset
        let stray = unsafe { libc::dup(null.as_raw_fd()) };
        assert!(stray > libc::STDERR_FILENO);

        let script = format!("test -e /dev/fd/{stray} && exit 1; exit 0");
        let spawned = spawn(&sh(&script), null_stdio()).unwrap();
        let status = waitpid(spawned.identity.pid(), None).unwrap();
        unsafe { libc::close(stray) };
        assert_eq!(status, WaitStatus::Exited(spawned.identity.pid(), 0));
    }

    #[test]
    fn test_requested_descriptor_is_inherited() {
        let (read, write) = cloexec_pipe().unwrap();
        let fd = write.as_raw_fd();
        let options = ProcessStartOptions::builder()
            .file_name("sh")
            .args(["-c", "echo inherited >&\"$1\"", "sh"])
            .arg(fd.to_string())
            .inherit_handle(fd)
            .build()
            .unwrap();

        let spawned = spawn(&options, null_stdio()).unwrap();
        drop(write);
        waitpid(spawned.identity.pid(), None).unwrap();

        let mut buf = [0u8; 64];
        let n = read_fd(read.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"inherited\n");
    }

    #[test]
    fn test_handshake_reports_errno() {
        let (read, write) = cloexec_pipe().unwrap();
        let errno = libc::EACCES.to_ne_bytes();
        unsafe { libc::write(write.as_raw_fd(), errno.as_ptr().cast(), errno.len()) };
        drop(write);
        assert_eq!(read_handshake(read.as_fd()).unwrap(), Some(libc::EACCES));

        let (read, write) = cloexec_pipe().unwrap();
        drop(write);
        assert_eq!(read_handshake(read.as_fd()).unwrap(), None);
    }
}
