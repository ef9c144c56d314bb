//! Windows backend for childproc.
//!
//! Children are created with `CreateProcessW` and an explicit handle
//! allow-list, optionally placed in a kill-on-close job object, and their
//! output is read through overlapped named pipes.

#[cfg(windows)]
mod command_line;
#[cfg(windows)]
mod job;
#[cfg(windows)]
mod overlapped_multiplexer;
#[cfg(windows)]
mod spawn;
#[cfg(windows)]
mod stdio;
#[cfg(windows)]
mod windows_process_handle;

#[cfg(windows)]
pub use overlapped_multiplexer::OverlappedMultiplexer;
#[cfg(windows)]
pub use windows_process_handle::WindowsProcessHandle;

#[cfg(windows)]
pub use backend::WindowsBackend;

#[cfg(windows)]
mod backend {
    use crate::stdio;
    use childproc_core::{ChildStdio, OwnedStdio, ProcessBackend, Result};

    /// Windows process backend
    pub struct WindowsBackend;

    impl ProcessBackend for WindowsBackend {
        type Handle = crate::WindowsProcessHandle;
        type Multiplexer = crate::OverlappedMultiplexer;

        fn platform_name() -> &'static str {
            "Windows"
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
