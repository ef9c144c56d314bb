use std::ffi::OsString;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

/// Append `arg` quoted so the MSVC runtime parses it back unchanged
pub(crate) fn append_quoted(command_line: &mut Vec<u16>, arg: &str) {
    let needs_quotes = arg.is_empty() || arg.chars().any(|c| matches!(c, ' ' | '\t' | '\n' | '\u{b}' | '"'));
    if !needs_quotes {
        command_line.extend(arg.encode_utf16());
        return;
    }

    command_line.push(u16::from(b'"'));
    let mut backslashes = 0usize;
    for unit in arg.encode_utf16() {
        if unit == u16::from(b'\\') {
            backslashes += 1;
            continue;
        }
        if unit == u16::from(b'"') {
            // Backslashes before a quote are doubled, plus one for the quote
            backslashes = backslashes * 2 + 1;
        }
        command_line.extend(std::iter::repeat_n(u16::from(b'\\'), backslashes));
        command_line.push(unit);
        backslashes = 0;
    }
    // Backslashes before the closing quote are doubled
    command_line.extend(std::iter::repeat_n(u16::from(b'\\'), backslashes * 2));
    command_line.push(u16::from(b'"'));
}

/// NUL-terminated, writable command line: the program path then each argument
pub(crate) fn build_command_line(program: &Path, arguments: &[String]) -> Vec<u16> {
    let mut command_line = Vec::new();
    append_quoted(&mut command_line, &program.to_string_lossy());
    for arg in arguments {
        command_line.push(u16::from(b' '));
        append_quoted(&mut command_line, arg);
    }
    command_line.push(0);
    command_line
}

/// Sorted `KEY=VALUE\0...\0\0` block for `CREATE_UNICODE_ENVIRONMENT`
pub(crate) fn environment_block(mut variables: Vec<(OsString, OsString)>) -> Vec<u16> {
    variables.sort_by_cached_key(|(key, _)| key.to_string_lossy().to_uppercase());

    let mut block = Vec::new();
    for (key, value) in &variables {
        block.extend(key.encode_wide());
        block.push(u16::from(b'='));
        block.extend(value.encode_wide());
        block.push(0);
    }
    if variables.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// NUL-terminated UTF-16 copy of a path
pub(crate) fn wide_path(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}
