//! Native argument and environment vectors for `execve`.

use childproc_core::{ProcessError, ProcessStartOptions, Result, merged_environment};
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Owned, null-terminated array of C strings.
///
/// The pointer array refers into the owned strings, whose heap storage does
/// not move when this value moves. Everything is released on drop, on every
/// path out of the spawn; the child never frees its copy.
pub(crate) struct CStringArray {
    items: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CStringArray {
    pub(crate) fn new(items: Vec<CString>) -> Self {
        let mut ptrs: Vec<*const libc::c_char> = items.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Self { items, ptrs }
    }

    pub(crate) fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

/// Everything the child needs to call `execve`, prepared before forking so the
/// child does not allocate
pub(crate) struct ExecRequest {
    pub program: CString,
    pub argv: CStringArray,
    /// `None` inherits the parent's environment
    pub envp: Option<CStringArray>,
    pub working_directory: Option<CString>,
}

impl ExecRequest {
    pub(crate) fn new(program: &Path, options: &ProcessStartOptions) -> Result<Self> {
        let mut argv = Vec::with_capacity(options.arguments.len() + 1);
        argv.push(c_string(options.file_name.as_bytes(), "file_name")?);
        for argument in &options.arguments {
            argv.push(c_string(argument.as_bytes(), "argument")?);
        }

        let envp = match merged_environment(&options.environment) {
            Some(vars) => {
                let mut entries = Vec::with_capacity(vars.len());
                for (key, value) in vars {
                    entries.push(env_entry(&key, &value)?);
                }
                Some(CStringArray::new(entries))
            }
            None => None,
        };

        let working_directory = options
            .working_directory
            .as_deref()
            .map(|dir| c_string(dir.as_os_str().as_bytes(), "working_directory"))
            .transpose()?;

        Ok(Self {
            program: c_string(program.as_os_str().as_bytes(), "program path")?,
            argv: CStringArray::new(argv),
            envp,
            working_directory,
        })
    }
}

fn c_string(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| ProcessError::InvalidArgument(format!("{what} contains a NUL byte")))
}

fn env_entry(key: &OsStr, value: &OsStr) -> Result<CString> {
    if key.as_bytes().contains(&b'=') {
        return Err(ProcessError::InvalidArgument(format!(
            "environment variable name {key:?} contains '='"
        )));
    }
    let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
    entry.extend_from_slice(key.as_bytes());
    entry.push(b'=');
    entry.extend_from_slice(value.as_bytes());
    c_string(&entry, "environment entry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    fn collect(array: &CStringArray) -> Vec<String> {
        let mut out = Vec::new();
        let mut ptr = array.as_ptr();
        unsafe {
            while !(*ptr).is_null() {
                out.push(CStr::from_ptr(*ptr).to_string_lossy().into_owned());
                ptr = ptr.add(1);
            }
        }
        out
    }

    #[test]
    fn test_argv_starts_with_file_name() {
        let options = ProcessStartOptions::builder()
            .file_name("sh")
            .args(["-c", "exit 3"])
            .build()
            .unwrap();
        let request = ExecRequest::new(Path::new("/bin/sh"), &options).unwrap();

        assert_eq!(request.program.as_bytes(), b"/bin/sh");
        assert_eq!(request.argv.len(), 3);
        assert_eq!(collect(&request.argv), vec!["sh", "-c", "exit 3"]);
        assert!(request.envp.is_none());
        assert!(request.working_directory.is_none());
    }

    #[test]
    fn test_environment_overrides_build_envp() {
        let options = ProcessStartOptions::builder()
            .file_name("env")
            .env("CHILDPROC_EXEC_TEST", "1")
            .build()
            .unwrap();
        let request = ExecRequest::new(Path::new("/usr/bin/env"), &options).unwrap();

        let envp = collect(request.envp.as_ref().unwrap());
        assert!(envp.contains(&"CHILDPROC_EXEC_TEST=1".to_string()));
    }

    #[test]
    fn test_interior_nul_is_rejected() {
        let options = ProcessStartOptions::builder()
            .file_name("echo")
            .arg("a\0b")
            .build()
            .unwrap();
        assert!(matches!(
            ExecRequest::new(Path::new("/bin/echo"), &options),
            Err(ProcessError::InvalidArgument(_))
        ));
    }
}
