use crate::command_line::{build_command_line, environment_block, wide_path};
use crate::job;
use crate::stdio::duplicate;
use childproc_core::{
    ChildStdio, KILLED_EXIT_CODE, ProcessError, ProcessStartOptions, Result, merged_environment,
    resolve_executable,
};
use std::ffi::c_void;
use std::os::windows::io::{AsHandle, AsRawHandle, BorrowedHandle, FromRawHandle, OwnedHandle};
use tracing::{debug, info};
use windows::Win32::Foundation::{HANDLE, HANDLE_FLAG_INHERIT, SetHandleInformation};
use windows::Win32::System::Threading::{
    CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW, CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT,
    CreateProcessW, DeleteProcThreadAttributeList, EXTENDED_STARTUPINFO_PRESENT,
    InitializeProcThreadAttributeList, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROC_THREAD_ATTRIBUTE_HANDLE_LIST, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, ResumeThread,
    STARTF_USESTDHANDLES, STARTUPINFOEXW, TerminateProcess, UpdateProcThreadAttribute,
};
use windows::core::{PCWSTR, PWSTR};

/// A freshly created child
pub(crate) struct Spawned {
    pub(crate) pid: u32,
    pub(crate) process: OwnedHandle,
    /// Primary thread, kept only while the child waits for an explicit resume
    pub(crate) thread: Option<OwnedHandle>,
}

/// `PROC_THREAD_ATTRIBUTE_LIST` carrying the handle allow-list.
///
/// `handles` must outlive the list; both live in this struct.
struct AttributeList {
    storage: Vec<u8>,
    handles: Vec<HANDLE>,
}

impl AttributeList {
    fn new(handles: Vec<HANDLE>) -> Result<Self> {
        let mut size = 0usize;
        unsafe {
            // Sizing call; fails with ERROR_INSUFFICIENT_BUFFER by contract
            let _ = InitializeProcThreadAttributeList(None, 1, None, &mut size);
        }
        let mut list = Self {
            storage: vec![0u8; size],
            handles,
        };
        unsafe {
            InitializeProcThreadAttributeList(Some(list.as_raw()), 1, None, &mut size)
                .map_err(std::io::Error::from)?;
            if let Err(e) = UpdateProcThreadAttribute(
                list.as_raw(),
                0,
                PROC_THREAD_ATTRIBUTE_HANDLE_LIST as usize,
                Some(list.handles.as_ptr().cast::<c_void>()),
                list.handles.len() * std::mem::size_of::<HANDLE>(),
                None,
                None,
            ) {
                DeleteProcThreadAttributeList(list.as_raw());
                list.storage.clear();
                return Err(std::io::Error::from(e).into());
            }
        }
        Ok(list)
    }

    fn as_raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.storage.as_mut_ptr().cast())
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        if !self.storage.is_empty() {
            unsafe { DeleteProcThreadAttributeList(self.as_raw()) };
        }
    }
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle())
}

/// Mark a caller-provided handle inheritable so it can join the allow-list
fn make_inheritable(handle: HANDLE) -> Result<()> {
    unsafe {
        SetHandleInformation(handle, HANDLE_FLAG_INHERIT.0, HANDLE_FLAG_INHERIT)
            .map_err(std::io::Error::from)?;
    }
    Ok(())
}

pub(crate) fn spawn(options: &ProcessStartOptions, stdio: ChildStdio) -> Result<Spawned> {
    let program = resolve_executable(&options.file_name)?;
    let spawn_error = |e: windows::core::Error| {
        ProcessError::spawn(options.file_name.as_str(), std::io::Error::from(e))
    };

    let application = wide_path(&program);
    let mut command_line = build_command_line(&program, &options.arguments);
    let environment = merged_environment(&options.environment).map(environment_block);
    let working_directory = options.working_directory.as_deref().map(wide_path);

    // Inheritable copies exist only for the duration of CreateProcessW
    let stdin = duplicate(stdio.stdin.as_handle(), true)?;
    let stdout = duplicate(stdio.stdout.as_handle(), true)?;
    let stderr = duplicate(stdio.stderr.as_handle(), true)?;

    let mut handles = vec![raw(&stdin), raw(&stdout), raw(&stderr)];
    for &extra in &options.inherited_handles {
        let extra = HANDLE(extra as *mut c_void);
        if !handles.contains(&extra) {
            make_inheritable(extra)?;
            handles.push(extra);
        }
    }
    let mut attributes = AttributeList::new(handles)?;

    let mut startup: STARTUPINFOEXW = unsafe { std::mem::zeroed() };
    startup.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
    startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
    startup.StartupInfo.hStdInput = raw(&stdin);
    startup.StartupInfo.hStdOutput = raw(&stdout);
    startup.StartupInfo.hStdError = raw(&stderr);
    startup.lpAttributeList = attributes.as_raw();

    // A child joining the job starts suspended so it cannot spawn anything
    // before it is a member.
    let start_suspended = options.create_suspended || options.kill_on_parent_death;
    let mut flags: PROCESS_CREATION_FLAGS = EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT;
    if start_suspended {
        flags |= CREATE_SUSPENDED;
    }
    if options.create_no_window {
        flags |= CREATE_NO_WINDOW;
    }
    if options.create_new_process_group {
        flags |= CREATE_NEW_PROCESS_GROUP;
    }

    let mut info = PROCESS_INFORMATION::default();
    unsafe {
        CreateProcessW(
            PCWSTR(application.as_ptr()),
            Some(PWSTR(command_line.as_mut_ptr())),
            None,
            None,
            true,
            flags,
            environment
                .as_ref()
                .map(|block| block.as_ptr().cast::<c_void>()),
            working_directory
                .as_ref()
                .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
            &startup.StartupInfo,
            &mut info,
        )
        .map_err(spawn_error)?;
    }
    drop(attributes);
    // The child has its own copies; closing ours lets pipe readers see EOF
    drop((stdin, stdout, stderr, stdio));

    let process = unsafe { OwnedHandle::from_raw_handle(info.hProcess.0) };
    let thread = unsafe { OwnedHandle::from_raw_handle(info.hThread.0) };
    let pid = info.dwProcessId;

    if options.kill_on_parent_death {
        if let Err(e) = job::assign(process.as_handle()) {
            terminate(process.as_handle());
            return Err(e);
        }
        debug!(pid = %pid, "Assigned process to kill-on-close job");
    }

    let thread = if options.create_suspended {
        Some(thread)
    } else {
        if start_suspended {
            resume_thread(thread.as_handle())?;
        }
        None
    };

    info!(
        pid = %pid,
        program = %program.display(),
        args = ?options.arguments,
        suspended = options.create_suspended,
        "Spawned process"
    );
    Ok(Spawned {
        pid,
        process,
        thread,
    })
}

pub(crate) fn resume_thread(thread: BorrowedHandle<'_>) -> Result<()> {
    let previous = unsafe { ResumeThread(HANDLE(thread.as_raw_handle())) };
    if previous == u32::MAX {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn terminate(process: BorrowedHandle<'_>) {
    unsafe {
        let _ = TerminateProcess(HANDLE(process.as_raw_handle()), KILLED_EXIT_CODE as u32);
    }
}
