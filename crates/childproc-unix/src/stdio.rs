//! Pipes, the null device and raw descriptor helpers.

use childproc_core::{ChildStdio, ProcessError, Result, StreamChannel};
use nix::errno::Errno;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;

const NULL_DEVICE: &str = "/dev/null";

/// Pipe with both ends close-on-exec
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    {
        Ok(nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(std::io::Error::from)?)
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        let (read, write) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        set_cloexec(read.as_raw_fd(), true)?;
        set_cloexec(write.as_raw_fd(), true)?;
        Ok((read, write))
    }
}

/// Pipe for child output; the read end is non-blocking when `async_read` is set
pub(crate) fn create_pipe(async_read: bool) -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = cloexec_pipe()?;
    if async_read {
        set_nonblocking(read.as_raw_fd())?;
    }
    Ok((read, write))
}

pub(crate) fn open_null_device() -> Result<OwnedFd> {
    let file = OpenOptions::new().read(true).write(true).open(NULL_DEVICE)?;
    Ok(OwnedFd::from(file))
}

/// Copies of the parent's fds 0, 1 and 2, or the null device for any that are closed
pub(crate) fn inherited_stdio() -> Result<ChildStdio> {
    Ok(ChildStdio {
        stdin: duplicate_or_null(libc::STDIN_FILENO)?,
        stdout: duplicate_or_null(libc::STDOUT_FILENO)?,
        stderr: duplicate_or_null(libc::STDERR_FILENO)?,
    })
}

fn duplicate_or_null(fd: RawFd) -> Result<OwnedFd> {
    match dup_cloexec(fd, 0) {
        Ok(duplicate) => Ok(duplicate),
        Err(Errno::EBADF) => {
            debug!(fd, "Standard descriptor is closed, using {NULL_DEVICE}");
            open_null_device()
        }
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

/// `F_DUPFD_CLOEXEC`: duplicate `fd` onto the lowest free number >= `min`
fn dup_cloexec(fd: RawFd, min: RawFd) -> nix::Result<OwnedFd> {
    let duplicate = Errno::result(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}

/// Move `fd` above the standard descriptor numbers.
///
/// The child `dup2`s its stdio onto 0, 1 and 2; any descriptor it still needs
/// afterwards must not live in that range or it would be overwritten.
pub(crate) fn above_stdio(fd: OwnedFd) -> Result<OwnedFd> {
    if fd.as_raw_fd() > libc::STDERR_FILENO {
        return Ok(fd);
    }
    Ok(dup_cloexec(fd.as_raw_fd(), libc::STDERR_FILENO + 1).map_err(std::io::Error::from)?)
}

pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> Result<()> {
    let flags = if on { libc::FD_CLOEXEC } else { 0 };
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags) })
        .map_err(std::io::Error::from)?;
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })
        .map_err(std::io::Error::from)?;
    if flags & libc::O_NONBLOCK == 0 {
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })
            .map_err(std::io::Error::from)?;
    }
    Ok(())
}

pub(crate) fn read_fd(fd: BorrowedFd<'_>, buf: &mut [u8]) -> nix::Result<usize> {
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    Errno::result(n).map(|n| n as usize)
}

/// Result of one read attempt on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStep {
    Data(usize),
    WouldBlock,
    Eof,
}

/// Read once from a non-blocking channel into its buffer's spare region
pub(crate) fn read_channel(channel: &mut StreamChannel) -> Result<ReadStep> {
    let Some(fd) = channel.source().map(|fd| fd.as_raw_fd()) else {
        return Ok(ReadStep::Eof);
    };
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    loop {
        match read_fd(fd, channel.buffer_mut().spare_mut()) {
            Ok(0) => {
                channel.close();
                return Ok(ReadStep::Eof);
            }
            Ok(n) => {
                channel.buffer_mut().commit(n);
                return Ok(ReadStep::Data(n));
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(ReadStep::WouldBlock),
            Err(e) => {
                return Err(ProcessError::Io(std::io::Error::from(e)));
            }
        }
    }
}

/// Read until the channel would block or reaches EOF
pub(crate) fn drain_channel(channel: &mut StreamChannel) -> Result<()> {
    while let ReadStep::Data(_) = read_channel(channel)? {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use childproc_core::StreamKind;
    use std::io::Write;
    use std::os::fd::AsFd;

    #[test]
    fn test_pipe_ends_are_close_on_exec() {
        let (read, write) = create_pipe(true).unwrap();
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
        let status = unsafe { libc::fcntl(read.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(status & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_above_stdio_keeps_high_descriptors() {
        let (read, _write) = cloexec_pipe().unwrap();
        let raw = read.as_raw_fd();
        assert!(raw > 2);
        assert_eq!(above_stdio(read).unwrap().as_raw_fd(), raw);
    }

    #[test]
    fn test_read_channel_until_eof() {
        let (read, write) = create_pipe(true).unwrap();
        let mut channel = StreamChannel::new(StreamKind::Stdout, read);

        assert_eq!(read_channel(&mut channel).unwrap(), ReadStep::WouldBlock);

        let mut writer = std::fs::File::from(write);
        writer.write_all(b"hello").unwrap();
        drop(writer);

        assert_eq!(read_channel(&mut channel).unwrap(), ReadStep::Data(5));
        assert_eq!(read_channel(&mut channel).unwrap(), ReadStep::Eof);
        assert!(channel.is_closed());
        assert_eq!(channel.buffer().as_slice(), b"hello");
    }

    #[test]
    fn test_null_device_reads_eof() {
        let null = open_null_device().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read_fd(null.as_fd(), &mut buf).unwrap(), 0);
    }
}
