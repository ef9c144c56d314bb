use childproc_core::ProcessBackend;

/// Backend selected for the current platform at compile time
#[cfg(unix)]
pub type PlatformBackend = childproc_unix::UnixBackend;

#[cfg(windows)]
pub type PlatformBackend = childproc_windows::WindowsBackend;

/// Process handle of the platform backend
pub type PlatformHandle = <PlatformBackend as ProcessBackend>::Handle;

/// Output multiplexer of the platform backend
pub type PlatformMultiplexer = <PlatformBackend as ProcessBackend>::Multiplexer;

pub fn platform_name() -> &'static str {
    PlatformBackend::platform_name()
}
