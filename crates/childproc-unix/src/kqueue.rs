use crate::stdio::set_cloexec;
use childproc_core::Result;
use nix::errno::Errno;
use nix::sys::event::{EvFlags, EventFilter, FilterFlag, KEvent, Kqueue};
use nix::unistd::Pid;
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

/// A new kqueue that is not inherited by children
pub(crate) fn new_queue() -> Result<Kqueue> {
    let queue = Kqueue::new().map_err(std::io::Error::from)?;
    set_cloexec(queue.as_fd().as_raw_fd(), true)?;
    Ok(queue)
}

pub(crate) fn empty_event() -> KEvent {
    KEvent::new(
        0,
        EventFilter::EVFILT_READ,
        EvFlags::empty(),
        FilterFlag::empty(),
        0,
        0,
    )
}

/// Register `EVFILT_PROC`/`NOTE_EXIT` for `pid`.
///
/// Returns `false` when the process is already gone, in which case no exit
/// event will ever be delivered.
pub(crate) fn register_exit(queue: &Kqueue, pid: Pid) -> Result<bool> {
    let change = KEvent::new(
        pid.as_raw() as libc::uintptr_t,
        EventFilter::EVFILT_PROC,
        EvFlags::EV_ADD | EvFlags::EV_ONESHOT,
        FilterFlag::NOTE_EXIT,
        0,
        0,
    );
    match queue.kevent(&[change], &mut [], Some(timespec(Duration::ZERO))) {
        Ok(_) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

/// Register a level-triggered read filter for `fd`, tagged with `udata`
pub(crate) fn register_read(queue: &Kqueue, fd: libc::c_int, udata: usize) -> Result<()> {
    let change = KEvent::new(
        fd as libc::uintptr_t,
        EventFilter::EVFILT_READ,
        EvFlags::EV_ADD,
        FilterFlag::empty(),
        0,
        udata as libc::intptr_t,
    );
    queue
        .kevent(&[change], &mut [], Some(timespec(Duration::ZERO)))
        .map_err(std::io::Error::from)?;
    Ok(())
}

pub(crate) fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as _,
    }
}

/// Wait up to `timeout` (forever when `None`) for the exit event
pub(crate) fn wait_exit(queue: &Kqueue, timeout: Option<Duration>) -> Result<bool> {
    let mut events = [empty_event()];
    loop {
        match queue.kevent(&[], &mut events, timeout.map(timespec)) {
            Ok(n) => return Ok(n > 0),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
    }
}
