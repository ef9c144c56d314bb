//! childproc core - Platform-independent process types and contracts
//!
//! This crate provides the error type, exit status model, start options,
//! output buffers and the traits implemented by the per-platform backends.

mod buffer;
mod config;
mod environment;
mod error;
mod process;
mod resolve;
mod status;
mod timeout;

pub use buffer::*;
pub use config::*;
pub use environment::*;
pub use error::*;
pub use process::*;
pub use resolve::*;
pub use status::*;
pub use timeout::*;
