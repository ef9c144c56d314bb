//! Cross-platform child process execution.
//!
//! [`ChildProcess`] covers the common cases: run a program with inherited,
//! discarded, redirected or captured standard streams, with an optional
//! timeout or cancellation token. [`RunningProcess`] exposes the underlying
//! handle for callers that need signals or a suspended start.
//!
//! ```no_run
//! use childproc::{ChildProcess, ProcessStartOptions, TextEncoding};
//! use std::time::Duration;
//!
//! # fn main() -> childproc::Result<()> {
//! let options = ProcessStartOptions::builder()
//!     .file_name("git")
//!     .args(["rev-parse", "HEAD"])
//!     .build()?;
//! let output = ChildProcess::capture_output(
//!     &options,
//!     TextEncoding::default(),
//!     Some(Duration::from_secs(10)),
//! )?;
//! println!("{}", output.stdout.trim());
//! # Ok(())
//! # }
//! ```

mod child_process;
mod factory;
mod lines;
mod running;

pub use child_process::{ChildProcess, CombinedOutput, ProcessOutput};
pub use factory::{PlatformBackend, PlatformHandle, PlatformMultiplexer, platform_name};
pub use lines::{OutputLine, OutputLines};
pub use running::{RunningProcess, StdioMode};

// Re-export core functionality
pub use childproc_core::*;
