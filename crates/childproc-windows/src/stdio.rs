use childproc_core::{ChildStdio, Result};
use std::os::windows::io::{AsRawHandle, BorrowedHandle, FromRawHandle, OwnedHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use windows::Win32::Foundation::{
    DUPLICATE_SAME_ACCESS, DuplicateHandle, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED,
    FILE_SHARE_NONE, OPEN_EXISTING, PIPE_ACCESS_INBOUND,
};
use windows::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Pipes::{
    CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_WAIT,
};
use windows::Win32::System::Threading::GetCurrentProcess;
use windows::core::PCWSTR;

const PIPE_BUFFER_SIZE: u32 = 4096;

static PIPE_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Connected `(read, write)` pair; the read end is the server side of a
/// uniquely named pipe so it can be opened for overlapped reads
pub(crate) fn create_pipe(async_read: bool) -> Result<(OwnedHandle, OwnedHandle)> {
    let name = format!(
        r"\\.\pipe\childproc-{}-{}",
        std::process::id(),
        PIPE_SERIAL.fetch_add(1, Ordering::Relaxed)
    );
    let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();

    let mut open_mode = PIPE_ACCESS_INBOUND | FILE_FLAG_FIRST_PIPE_INSTANCE;
    if async_read {
        open_mode |= FILE_FLAG_OVERLAPPED;
    }

    unsafe {
        let server = CreateNamedPipeW(
            PCWSTR(wide.as_ptr()),
            open_mode,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
            1,
            PIPE_BUFFER_SIZE,
            PIPE_BUFFER_SIZE,
            0,
            None,
        );
        if server.is_invalid() {
            return Err(std::io::Error::last_os_error().into());
        }
        let read = OwnedHandle::from_raw_handle(server.0);

        let client = CreateFileW(
            PCWSTR(wide.as_ptr()),
            GENERIC_WRITE.0,
            FILE_SHARE_NONE,
            None,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            None,
        )
        .map_err(std::io::Error::from)?;
        let write = OwnedHandle::from_raw_handle(client.0);

        Ok((read, write))
    }
}

/// `NUL`, readable and writable
pub(crate) fn open_null_device() -> Result<OwnedHandle> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("NUL")?;
    Ok(OwnedHandle::from(file))
}

pub(crate) fn inherited_stdio() -> Result<ChildStdio> {
    Ok(ChildStdio {
        stdin: duplicate_or_null(STD_INPUT_HANDLE)?,
        stdout: duplicate_or_null(STD_OUTPUT_HANDLE)?,
        stderr: duplicate_or_null(STD_ERROR_HANDLE)?,
    })
}

/// The caller's own standard handle, or the null device when it has none
fn duplicate_or_null(which: STD_HANDLE) -> Result<OwnedHandle> {
    let handle = unsafe { GetStdHandle(which) };
    match handle {
        Ok(handle) if !handle.is_invalid() && !handle.0.is_null() => {
            let borrowed = unsafe { BorrowedHandle::borrow_raw(handle.0) };
            duplicate(borrowed, false)
        }
        _ => open_null_device(),
    }
}

/// Duplicate a handle within this process, optionally inheritable
pub(crate) fn duplicate(handle: BorrowedHandle<'_>, inheritable: bool) -> Result<OwnedHandle> {
    let mut target = INVALID_HANDLE_VALUE;
    unsafe {
        let process = GetCurrentProcess();
        DuplicateHandle(
            process,
            HANDLE(handle.as_raw_handle()),
            process,
            &mut target,
            0,
            inheritable,
            DUPLICATE_SAME_ACCESS,
        )
        .map_err(std::io::Error::from)?;
        Ok(OwnedHandle::from_raw_handle(target.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_blocking_pipe_round_trip() {
        let (read, write) = create_pipe(false).unwrap();
        let mut writer = std::fs::File::from(write);
        writer.write_all(b"ping").unwrap();
        drop(writer);

        let mut reader = std::fs::File::from(read);
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "ping");
    }

    #[test]
    fn test_null_device_reads_eof() {
        let mut null = std::fs::File::from(open_null_device().unwrap());
        let mut buf = [0u8; 4];
        assert_eq!(null.read(&mut buf).unwrap(), 0);
        null.write_all(b"discarded").unwrap();
    }
}
