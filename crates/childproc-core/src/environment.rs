use std::collections::HashMap;
use std::env;
use std::ffi::OsString;

/// The child's full environment, or `None` when it inherits the parent's as is.
///
/// Overrides set or remove single variables on top of the current process
/// environment. Windows compares variable names case-insensitively.
pub fn merged_environment(
    overrides: &HashMap<String, Option<String>>,
) -> Option<Vec<(OsString, OsString)>> {
    if overrides.is_empty() {
        return None;
    }
    Some(merge_into(env::vars_os().collect(), overrides))
}

fn merge_into(
    mut vars: Vec<(OsString, OsString)>,
    overrides: &HashMap<String, Option<String>>,
) -> Vec<(OsString, OsString)> {
    vars.retain(|(key, _)| !overrides.keys().any(|name| same_name(key, name)));

    let mut added: Vec<_> = overrides
        .iter()
        .filter_map(|(key, value)| {
            value
                .as_ref()
                .map(|value| (OsString::from(key), OsString::from(value)))
        })
        .collect();
    added.sort();
    vars.extend(added);
    vars
}

fn same_name(key: &OsString, name: &str) -> bool {
    if cfg!(windows) {
        key.to_str()
            .is_some_and(|key| key.eq_ignore_ascii_case(name))
    } else {
        key == name
    }
}
