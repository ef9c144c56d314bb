//! Unix backend for childproc.
//!
//! Linux spawns through `clone3` and tracks children with a pidfd, falling
//! back to `fork` plus an exit pipe when `clone3` is unavailable. macOS and the
//! BSDs track children with an exit pipe and wait through kqueue.

#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))
))]
compile_error!("childproc-unix supports Linux, Android, macOS, iOS and the BSDs");

#[cfg(unix)]
mod exec;
#[cfg(unix)]
mod exit_watch;
#[cfg(unix)]
mod identity;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue_multiplexer;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod poll_multiplexer;
#[cfg(unix)]
mod spawn;
#[cfg(unix)]
mod stdio;
#[cfg(unix)]
mod unix_process_handle;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue_multiplexer::KqueueMultiplexer;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use poll_multiplexer::PollMultiplexer;
#[cfg(unix)]
pub use unix_process_handle::UnixProcessHandle;

#[cfg(unix)]
pub use backend::UnixBackend;

#[cfg(unix)]
mod backend {
    use crate::stdio;
    use childproc_core::{ChildStdio, OwnedStdio, ProcessBackend, Result};

    /// Unix process backend
    pub struct UnixBackend;

    impl ProcessBackend for UnixBackend {
        type Handle = crate::UnixProcessHandle;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        type Multiplexer = crate::PollMultiplexer;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        type Multiplexer = crate::KqueueMultiplexer;

        fn platform_name() -> &'static str {
            "Unix"
        }

        fn create_pipe(async_read: bool) -> Result<(OwnedStdio, OwnedStdio)> {
            stdio::create_pipe(async_read)
        }

        fn open_null_device() -> Result<OwnedStdio> {
            stdio::open_null_device()
        }

        fn inherited_stdio() -> Result<ChildStdio> {
            stdio::inherited_stdio()
        }
    }
}
