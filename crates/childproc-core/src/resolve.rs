//! Executable lookup.
//!
//! A name containing a path separator is taken as a path. Anything else is
//! searched for in the hosting executable's directory, the current working
//! directory, the Windows system directories and finally every `PATH` entry.

use crate::error::{ProcessError, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve `file_name` to an absolute path of an executable file
pub fn resolve_executable(file_name: &str) -> Result<PathBuf> {
    if file_name.is_empty() {
        return Err(ProcessError::InvalidArgument(
            "file_name must not be empty".to_string(),
        ));
    }

    let candidate = with_default_extension(file_name);

    if has_separator(file_name) {
        let path = absolutize(Path::new(&candidate));
        return if path.is_file() {
            Ok(path)
        } else {
            Err(ProcessError::FileNotFound(file_name.to_string()))
        };
    }

    for dir in search_directories() {
        let path = dir.join(&candidate);
        if is_executable(&path) {
            debug!(file_name = %file_name, path = %path.display(), "Resolved executable");
            return Ok(path);
        }
    }

    Err(ProcessError::FileNotFound(file_name.to_string()))
}

/// Directories searched for a bare program name, in lookup order
pub fn search_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(exe_dir) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir);
    }
    if let Ok(cwd) = env::current_dir() {
        dirs.push(cwd);
    }

    #[cfg(windows)]
    if let Some(system_root) = env::var_os("SystemRoot") {
        let root = PathBuf::from(system_root);
        dirs.push(root.join("System32"));
        dirs.push(root);
    }

    if let Some(path) = env::var_os("PATH") {
        dirs.extend(env::split_paths(&path).filter(|p| !p.as_os_str().is_empty()));
    }

    dirs
}

fn has_separator(name: &str) -> bool {
    name.contains('/') || (cfg!(windows) && name.contains('\\'))
}

fn with_default_extension(name: &str) -> String {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Regular file with at least one execute bit set
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
pub fn is_executable(path: &Path) -> bool {
    use std::ffi::OsStr;

    path.is_file()
        && path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(matches!(
            resolve_executable(""),
            Err(ProcessError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_missing_program_is_not_found() {
        let error = resolve_executable("definitely-not-a-real-program-3f9a").unwrap_err();
        assert!(error.is_not_found());
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let error = resolve_executable("./no/such/dir/tool").unwrap_err();
        assert!(matches!(error, ProcessError::FileNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolves_from_path() {
        let path = resolve_executable("sh").unwrap();
        assert!(path.is_absolute());
        assert!(is_executable(&path));
    }

    #[cfg(unix)]
    #[test]
    fn test_explicit_path_need_not_be_executable() {
        // Exec reports EACCES for these; resolution only checks existence.
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = resolve_executable(file.path().to_str().unwrap()).unwrap();
        assert_eq!(path, file.path());
        assert!(!is_executable(&path));
    }

    #[test]
    fn test_search_order_starts_with_exe_dir_and_cwd() {
        let dirs = search_directories();
        let cwd = env::current_dir().unwrap();
        let exe_dir = env::current_exe().unwrap().parent().unwrap().to_path_buf();
        assert_eq!(dirs[0], exe_dir);
        assert_eq!(dirs[1], cwd);
    }
}
