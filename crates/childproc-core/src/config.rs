use crate::error::ProcessError;
use crate::process::RawNativeHandle;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything needed to start one child process
#[derive(Default, Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
#[serde(rename_all = "camelCase")]
pub struct ProcessStartOptions {
    /// Program name or path; resolved before spawning
    pub file_name: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Overrides applied to the inherited environment.
    /// `None` removes the variable; keys not present are inherited unchanged.
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub environment: HashMap<String, Option<String>>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[serde(default)]
    pub create_no_window: bool,
    #[builder(default)]
    #[serde(default)]
    pub create_new_process_group: bool,
    #[builder(default)]
    #[serde(default)]
    pub create_suspended: bool,
    #[builder(default)]
    #[serde(default)]
    pub kill_on_parent_death: bool,
    /// Extra native descriptors the child should see besides its stdio
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(skip)]
    pub inherited_handles: Vec<RawNativeHandle>,
}

impl ProcessStartOptions {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn builder() -> ProcessStartOptionsBuilder {
        ProcessStartOptionsBuilder::default()
    }

    /// Whether the child gets exactly the parent's environment
    pub fn inherits_environment(&self) -> bool {
        self.environment.is_empty()
    }
}

impl ProcessStartOptionsBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args = self.arguments.get_or_insert_with(Vec::new);
        args.extend(iter.into_iter().map(|s| s.to_string()));
        self
    }

    pub fn arg<S: ToString>(&mut self, arg: S) -> &mut Self {
        self.arguments
            .get_or_insert_with(Vec::new)
            .push(arg.to_string());
        self
    }

    pub fn env<K: ToString, V: ToString>(&mut self, key: K, value: V) -> &mut Self {
        let map = self.environment.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), Some(value.to_string()));
        self
    }

    pub fn env_remove<K: ToString>(&mut self, key: K) -> &mut Self {
        let map = self.environment.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), None);
        self
    }

    pub fn env_multi<K: ToString, V: ToString, I: IntoIterator<Item = (K, V)>>(
        &mut self,
        iter: I,
    ) -> &mut Self {
        let env = self.environment.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), Some(value.to_string()));
        }
        self
    }

    pub fn inherit_handle(&mut self, handle: RawNativeHandle) -> &mut Self {
        self.inherited_handles
            .get_or_insert_with(Vec::new)
            .push(handle);
        self
    }

    fn validate(&self) -> Result<(), String> {
        match &self.file_name {
            Some(name) if name.is_empty() => Err("file_name must not be empty".to_string()),
            Some(name) if name.contains('\0') => {
                Err("file_name must not contain NUL bytes".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl From<ProcessStartOptionsBuilderError> for ProcessError {
    fn from(error: ProcessStartOptionsBuilderError) -> Self {
        ProcessError::InvalidArgument(error.to_string())
    }
}
