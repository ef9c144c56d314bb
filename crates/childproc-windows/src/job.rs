use childproc_core::Result;
use std::os::windows::io::{AsRawHandle, BorrowedHandle, FromRawHandle, OwnedHandle};
use std::sync::Mutex;
use tracing::info;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
    SetInformationJobObject,
};

/// Process-wide kill-on-close job. Created once, never closed: the OS
/// terminates every member when this process exits.
static KILL_ON_CLOSE_JOB: Mutex<Option<OwnedHandle>> = Mutex::new(None);

fn create_job() -> Result<OwnedHandle> {
    unsafe {
        let job = CreateJobObjectW(None, None).map_err(std::io::Error::from)?;
        let job = OwnedHandle::from_raw_handle(job.0);

        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        SetInformationJobObject(
            HANDLE(job.as_raw_handle()),
            JobObjectExtendedLimitInformation,
            (&raw const info).cast(),
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
        .map_err(std::io::Error::from)?;

        info!("Created kill-on-close job object");
        Ok(job)
    }
}

/// Put `process` into the kill-on-close job, creating the job on first use
pub(crate) fn assign(process: BorrowedHandle<'_>) -> Result<()> {
    let mut job = KILL_ON_CLOSE_JOB
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if job.is_none() {
        *job = Some(create_job()?);
    }
    if let Some(job) = job.as_ref() {
        unsafe {
            AssignProcessToJobObject(HANDLE(job.as_raw_handle()), HANDLE(process.as_raw_handle()))
                .map_err(std::io::Error::from)?;
        }
    }
    Ok(())
}
