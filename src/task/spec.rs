//! Task descriptors: the declarative record of a unit of work, its trigger,
//! its I/O topics, and its result paths.
//!
//! Descriptors are plain serde values and round-trip byte-for-byte, including
//! unresolved `{{placeholder}}` template strings. Substitution happens
//! upstream and is out of scope here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use crate::core::errors::{DroverError, Result};
use crate::store::validate_path;
use crate::watch::TriggerSpec;

/// Command to execute once the task's trigger has fired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSpec {
    /// Binary path or name resolved against PATH
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

/// Execution timestamps persisted at `<namespace>/info`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DateTime<Utc>>,
}

/// Declarative record of one unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    /// Base path in the coordination store owning this task's records
    pub namespace: String,
    pub success_path: String,
    pub error_path: String,
    /// Optional mirror of the recorded outcome value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    pub status_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecSpec>,
    #[serde(default)]
    pub stat: TaskStat,
}

impl TaskSpec {
    /// Parse a descriptor from a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<TaskSpec> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Load a descriptor from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<TaskSpec> {
        let file = File::open(path.as_ref())?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Serialize the descriptor to YAML
    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Structural validation: required fields present, store paths well
    /// formed. Exec resolution is checked separately at init time.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("id", &self.id),
            ("namespace", &self.namespace),
            ("success_path", &self.success_path),
            ("error_path", &self.error_path),
            ("status_topic", &self.status_topic),
        ] {
            if value.trim().is_empty() {
                return Err(DroverError::configuration_field(
                    format!("task field '{}' must not be empty", field),
                    field,
                ));
            }
        }
        validate_path(&self.namespace)?;
        validate_path(&self.success_path)?;
        validate_path(&self.error_path)?;
        if let Some(output_path) = &self.output_path {
            validate_path(output_path)?;
        }
        if let Some(exec) = &self.exec {
            if exec.path.trim().is_empty() {
                return Err(DroverError::configuration_field(
                    "exec path must not be empty",
                    "exec.path",
                ));
            }
        }
        if let Some(trigger) = &self.trigger {
            trigger.validate()?;
        }
        Ok(())
    }
}

/// Outcome value recorded at the success/error path.
///
/// The original system dispatched on the runtime type of the recorded value;
/// here that is an explicit tagged union: raw bytes pass through, text is
/// recorded as its UTF-8 bytes, structured values are JSON-encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskValue {
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
}

impl TaskValue {
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            TaskValue::Bytes(bytes) => Ok(bytes),
            TaskValue::Text(text) => Ok(text.into_bytes()),
            TaskValue::Json(value) => Ok(serde_json::to_vec(&value)?),
        }
    }
}

impl From<Vec<u8>> for TaskValue {
    fn from(bytes: Vec<u8>) -> Self {
        TaskValue::Bytes(bytes)
    }
}

impl From<&str> for TaskValue {
    fn from(text: &str) -> Self {
        TaskValue::Text(text.to_string())
    }
}

impl From<String> for TaskValue {
    fn from(text: String) -> Self {
        TaskValue::Text(text)
    }
}

impl From<Value> for TaskValue {
    fn from(value: Value) -> Self {
        TaskValue::Json(value)
    }
}
